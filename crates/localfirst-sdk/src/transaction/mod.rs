//! 事务模块 - 带补偿、重试与整体超时的乐观更新事务

pub mod engine;
pub mod retry_policy;

pub use engine::{StepOptions, Transaction, TransactionOptions, TransactionStatus, DEFAULT_TRANSACTION_TIMEOUT_MS};
pub use retry_policy::{Backoff, RetryConfig};
