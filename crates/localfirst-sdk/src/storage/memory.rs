//! 内存信封存储
//!
//! 用于测试隔离与无持久化场景。支持故障注入（下一次写入失败）
//! 以及写入任意 JSON 以模拟损坏或外来数据。

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;

use crate::error::{LocalFirstError, Result, StorageErrorKind};
use crate::storage::{DurableStore, StoredEnvelope};

#[derive(Debug, Default)]
pub struct MemoryStore {
    records: RwLock<BTreeMap<String, serde_json::Value>>,
    fail_next_write: RwLock<Option<StorageErrorKind>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 让下一次 set / delete 以指定错误失败
    pub fn fail_next_write(&self, kind: StorageErrorKind) {
        *self.fail_next_write.write() = Some(kind);
    }

    /// 直接写入原始 JSON（不经过信封校验）
    pub fn put_raw(&self, key: &str, value: serde_json::Value) {
        self.records.write().insert(key.to_string(), value);
    }

    /// 读取原始 JSON
    pub fn get_raw(&self, key: &str) -> Option<serde_json::Value> {
        self.records.read().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    fn check_injected_failure(&self) -> Result<()> {
        if let Some(kind) = self.fail_next_write.write().take() {
            return Err(LocalFirstError::storage(kind, "injected write failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<StoredEnvelope<serde_json::Value>>> {
        let raw = self.records.read().get(key).cloned();
        match raw {
            Some(value) => {
                let envelope = serde_json::from_value(value).map_err(|e| {
                    LocalFirstError::Serialization(format!("信封解析失败 ({}): {}", key, e))
                })?;
                Ok(Some(envelope))
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, envelope: &StoredEnvelope<serde_json::Value>) -> Result<()> {
        self.check_injected_failure()?;
        let value = serde_json::to_value(envelope)?;
        self.records.write().insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check_injected_failure()?;
        self.records.write().remove(key);
        Ok(())
    }

    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self.records.read().keys().cloned().collect())
    }

    async fn clear(&self) -> Result<()> {
        self.records.write().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_memory_store_roundtrip_and_raw_layout() {
        let store = MemoryStore::new();
        store
            .set("cart", &StoredEnvelope::new(1, 10, json!({"items": []})))
            .await
            .unwrap();

        let raw = store.get_raw("cart").unwrap();
        assert_eq!(raw, json!({"schemaVersion": 1, "updatedAt": 10, "data": {"items": []}}));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_memory_store_fault_injection() {
        let store = MemoryStore::new();
        store.fail_next_write(StorageErrorKind::QuotaExceeded);

        let err = store
            .set("cart", &StoredEnvelope::new(1, 10, json!(null)))
            .await
            .unwrap_err();
        assert_eq!(err.storage_kind(), Some(StorageErrorKind::QuotaExceeded));
        assert!(store.is_empty());

        // 只影响一次写入
        store.set("cart", &StoredEnvelope::new(1, 10, json!(null))).await.unwrap();
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_memory_store_malformed_envelope() {
        let store = MemoryStore::new();
        store.put_raw("cart", json!({"whatever": true}));
        assert!(matches!(store.get("cart").await, Err(LocalFirstError::Serialization(_))));
    }
}
