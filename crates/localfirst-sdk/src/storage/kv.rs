//! 持久化存储 - 基于 sled 的信封存储
//!
//! 本模块提供：
//! - 按模型名存放的信封（`models` Tree，JSON 编码）
//! - 打开数据库时的锁竞争重试（多实例/多进程切换时旧实例可能刚释放锁）
//! - 与浏览器 origin 作用域等价的目录隔离：一个目录即一个"源"

use async_trait::async_trait;
use sled::{Db, Tree};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{LocalFirstError, Result, StorageErrorKind};
use crate::storage::{store_names, DurableStore, StoredEnvelope};

/// sled 信封存储
#[derive(Debug, Clone)]
pub struct SledStore {
    path: PathBuf,
    db: Arc<Db>,
    models: Tree,
}

impl SledStore {
    /// 使用默认重试参数打开
    pub async fn open(base_path: &Path) -> Result<Self> {
        Self::open_with_retry(base_path, 8, 300).await
    }

    /// 打开（或创建）存储，锁竞争时指数退避重试
    pub async fn open_with_retry(base_path: &Path, max_retries: u32, retry_delay_ms: u64) -> Result<Self> {
        let path = base_path.join("localfirst");

        tokio::fs::create_dir_all(&path).await.map_err(|e| {
            let err: LocalFirstError = e.into();
            warn!("创建存储目录失败: {}", err);
            err
        })?;

        let attempts = max_retries.max(1);
        let mut last_err: Option<sled::Error> = None;
        let mut db_opt: Option<Db> = None;
        for attempt in 0..attempts {
            match sled::open(&path) {
                Ok(d) => {
                    db_opt = Some(d);
                    break;
                }
                Err(e) => {
                    let msg = e.to_string();
                    let is_lock = msg.contains("could not acquire lock")
                        || msg.contains("Resource temporarily unavailable")
                        || msg.contains("WouldBlock");
                    last_err = Some(e);
                    if is_lock && attempt + 1 < attempts {
                        let delay_ms = retry_delay_ms.saturating_mul(1 << attempt.min(16));
                        debug!("sled 数据库被占用，{}ms 后重试 ({}/{})", delay_ms, attempt + 1, attempts);
                        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    } else {
                        break;
                    }
                }
            }
        }

        let db = match db_opt {
            Some(db) => db,
            None => {
                return Err(last_err
                    .map(LocalFirstError::from)
                    .unwrap_or_else(|| LocalFirstError::storage(StorageErrorKind::Unknown, "打开 sled 数据库失败")))
            }
        };

        let models = db.open_tree(store_names::MODELS)?;
        info!("持久化存储已打开: {}", path.display());

        Ok(Self {
            path,
            db: Arc::new(db),
            models,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 刷盘
    pub async fn flush(&self) -> Result<()> {
        self.db.flush_async().await?;
        Ok(())
    }

    fn decode(key: &str, bytes: &[u8]) -> Result<StoredEnvelope<serde_json::Value>> {
        serde_json::from_slice(bytes).map_err(|e| {
            LocalFirstError::Serialization(format!("信封解析失败 ({}): {}", key, e))
        })
    }
}

#[async_trait]
impl DurableStore for SledStore {
    async fn get(&self, key: &str) -> Result<Option<StoredEnvelope<serde_json::Value>>> {
        match self.models.get(key)? {
            Some(bytes) => Ok(Some(Self::decode(key, &bytes)?)),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, envelope: &StoredEnvelope<serde_json::Value>) -> Result<()> {
        let bytes = serde_json::to_vec(envelope)?;
        self.models.insert(key, bytes)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.models.remove(key)?;
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        for item in self.models.iter().keys() {
            let key = item?;
            keys.push(String::from_utf8_lossy(&key).into_owned());
        }
        Ok(keys)
    }

    async fn clear(&self) -> Result<()> {
        self.models.clear()?;
        Ok(())
    }
}
