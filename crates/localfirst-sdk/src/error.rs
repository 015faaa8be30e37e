use std::fmt;

/// 存储错误分类
///
/// QuotaExceeded / PermissionDenied 不可恢复，Unknown 可重试
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum StorageErrorKind {
    QuotaExceeded,
    PermissionDenied,
    Unknown,
}

impl fmt::Display for StorageErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageErrorKind::QuotaExceeded => write!(f, "quota-exceeded"),
            StorageErrorKind::PermissionDenied => write!(f, "permission-denied"),
            StorageErrorKind::Unknown => write!(f, "unknown"),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum LocalFirstError {
    #[error("Storage error [{kind}]: {message}")]
    Storage {
        kind: StorageErrorKind,
        message: String,
    },

    #[error("Validation error in model '{model}' at {path}: {message}")]
    Validation {
        model: String,
        path: String,
        message: String,
    },

    #[error("Compensation failed: {} of {completed_steps} completed steps could not be rolled back", failures.len())]
    CompensationFailed {
        failures: Vec<LocalFirstError>,
        completed_steps: usize,
    },

    #[error("Retry exhausted after {attempts} attempts: {}", last_error_message(errors))]
    RetryExhausted {
        attempts: u32,
        errors: Vec<LocalFirstError>,
    },

    #[error("Transaction {transaction_id} timed out after {timeout_ms}ms")]
    TransactionTimeout {
        transaction_id: String,
        timeout_ms: u64,
    },

    #[error("Transaction {transaction_id} aborted: {reason}")]
    TransactionAborted {
        transaction_id: String,
        reason: String,
    },

    #[error("Transaction {transaction_id} cannot {operation} while {status}")]
    TransactionState {
        transaction_id: String,
        status: String,
        operation: String,
    },

    #[error("Cannot patch - no data and no initial data (model '{model}')")]
    NoData { model: String },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Fetch error: {0}")]
    Fetch(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Other error: {0}")]
    Other(String),
}

fn last_error_message(errors: &[LocalFirstError]) -> String {
    errors
        .last()
        .map(|e| e.to_string())
        .unwrap_or_else(|| "no attempts recorded".to_string())
}

impl LocalFirstError {
    /// 构造存储错误
    pub fn storage(kind: StorageErrorKind, message: impl Into<String>) -> Self {
        LocalFirstError::Storage {
            kind,
            message: message.into(),
        }
    }

    /// 构造校验错误
    pub fn validation(
        model: impl Into<String>,
        path: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        LocalFirstError::Validation {
            model: model.into(),
            path: path.into(),
            message: message.into(),
        }
    }

    /// 判断错误是否可恢复
    ///
    /// UI 层据此决定展示"重试"还是"刷新页面"
    pub fn is_recoverable(&self) -> bool {
        match self {
            LocalFirstError::Storage { kind, .. } => matches!(kind, StorageErrorKind::Unknown),
            LocalFirstError::Validation { .. } => true,
            LocalFirstError::CompensationFailed { .. } => false,
            LocalFirstError::RetryExhausted { .. } => true,
            LocalFirstError::TransactionTimeout { .. } => true,
            LocalFirstError::TransactionAborted { .. } => true,
            LocalFirstError::TransactionState { .. } => false,
            LocalFirstError::NoData { .. } => false,
            LocalFirstError::Serialization(_) => false,
            LocalFirstError::Fetch(_) => true,
            LocalFirstError::Config(_) => false,
            LocalFirstError::Other(_) => true,
        }
    }

    /// 稳定的错误码（用于事件上报）
    pub fn code(&self) -> &'static str {
        match self {
            LocalFirstError::Storage { .. } => "storage_error",
            LocalFirstError::Validation { .. } => "validation_error",
            LocalFirstError::CompensationFailed { .. } => "compensation_failed",
            LocalFirstError::RetryExhausted { .. } => "retry_exhausted",
            LocalFirstError::TransactionTimeout { .. } => "transaction_timeout",
            LocalFirstError::TransactionAborted { .. } => "transaction_aborted",
            LocalFirstError::TransactionState { .. } => "transaction_state",
            LocalFirstError::NoData { .. } => "no_data",
            LocalFirstError::Serialization(_) => "serialization_error",
            LocalFirstError::Fetch(_) => "fetch_error",
            LocalFirstError::Config(_) => "config_error",
            LocalFirstError::Other(_) => "other",
        }
    }

    /// 存储错误的分类（非存储错误返回 None）
    pub fn storage_kind(&self) -> Option<StorageErrorKind> {
        match self {
            LocalFirstError::Storage { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    pub fn is_validation_error(&self) -> bool {
        matches!(self, LocalFirstError::Validation { .. })
    }
}

impl From<sled::Error> for LocalFirstError {
    fn from(error: sled::Error) -> Self {
        match error {
            sled::Error::Io(io) => io.into(),
            other => LocalFirstError::storage(StorageErrorKind::Unknown, other.to_string()),
        }
    }
}

impl From<std::io::Error> for LocalFirstError {
    fn from(error: std::io::Error) -> Self {
        // ENOSPC = 28
        let kind = if error.kind() == std::io::ErrorKind::PermissionDenied {
            StorageErrorKind::PermissionDenied
        } else if error.raw_os_error() == Some(28) {
            StorageErrorKind::QuotaExceeded
        } else {
            StorageErrorKind::Unknown
        };
        LocalFirstError::storage(kind, error.to_string())
    }
}

impl From<serde_json::Error> for LocalFirstError {
    fn from(error: serde_json::Error) -> Self {
        LocalFirstError::Serialization(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, LocalFirstError>;
