//! 存储模块 - 本地优先数据的持久化层
//!
//! 采用分层架构设计：
//! - DurableStore: 可替换的持久化键值存储（sled / 内存）
//! - WriteLane: 每个模型一条串行写入通道
//! - StorageManager: load / save / validate 编排，版本不匹配时重置
//! - Schema: 每个模型的数据校验

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub mod kv;
pub mod lane;
pub mod manager;
pub mod memory;
pub mod schema;

pub use kv::SledStore;
pub use lane::WriteLane;
pub use manager::{LoadedEntry, StorageManager};
pub use memory::MemoryStore;
pub use schema::{FnSchema, Schema, SerdeSchema, ValidationIssue};

/// 逻辑存储名称
pub mod store_names {
    /// 按模型名存放信封
    pub const MODELS: &str = "models";
    /// 事务日志（预留，当前事务引擎不读写）
    pub const TRANSACTIONS: &str = "transactions";
}

/// 持久化信封
///
/// 每个模型名对应一个信封，每次写入整体覆盖。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredEnvelope<T> {
    pub schema_version: u32,
    /// UTC 毫秒时间戳
    pub updated_at: i64,
    pub data: T,
}

impl<T> StoredEnvelope<T> {
    pub fn new(schema_version: u32, updated_at: i64, data: T) -> Self {
        Self {
            schema_version,
            updated_at,
            data,
        }
    }
}

/// 持久化键值存储
///
/// 以模型名为键，值为类型擦除后的信封。实现必须保证单次
/// get / set / delete 的原子性。
#[async_trait]
pub trait DurableStore: Send + Sync + 'static {
    /// 读取信封；信封本身结构损坏时返回 Ok(None) 之外的错误由实现决定
    async fn get(&self, key: &str) -> Result<Option<StoredEnvelope<serde_json::Value>>>;

    /// 写入（覆盖）信封
    async fn set(&self, key: &str, envelope: &StoredEnvelope<serde_json::Value>) -> Result<()>;

    /// 删除信封，不存在时也返回 Ok
    async fn delete(&self, key: &str) -> Result<()>;

    /// 列出所有模型名
    async fn keys(&self) -> Result<Vec<String>>;

    /// 清空所有信封
    async fn clear(&self) -> Result<()>;
}
