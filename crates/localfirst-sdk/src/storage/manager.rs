//! 存储管理器 - 单个模型的 load / save / validate 编排
//!
//! 职责：
//! - 读取信封，版本不匹配时丢弃并（如有）写入初始数据
//! - 校验失败时删除损坏信封：开发环境报错，生产环境自愈返回 None
//! - 保存时总是重新打时间戳
//! - 通过 WriteLane 保证同一模型的写入严格串行

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::Environment;
use crate::error::{LocalFirstError, Result};
use crate::events::{emit_opt, EventCategory, EventManager, EventPriority};
use crate::storage::{DurableStore, Schema, StoredEnvelope, WriteLane};
use crate::utils::now_millis;

/// 从存储中读出的条目
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedEntry<T> {
    pub data: T,
    /// UTC 毫秒时间戳
    pub updated_at: i64,
}

pub struct StorageManager<T> {
    name: String,
    version: u32,
    store: Arc<dyn DurableStore>,
    schema: Arc<dyn Schema<T>>,
    initial_data: Option<T>,
    environment: Environment,
    lane: WriteLane,
    events: Option<Arc<EventManager>>,
}

impl<T> StorageManager<T>
where
    T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new(
        name: impl Into<String>,
        version: u32,
        store: Arc<dyn DurableStore>,
        schema: Arc<dyn Schema<T>>,
        initial_data: Option<T>,
        environment: Environment,
    ) -> Self {
        let name = name.into();
        Self {
            lane: WriteLane::new(name.clone()),
            name,
            version,
            store,
            schema,
            initial_data,
            environment,
            events: None,
        }
    }

    pub fn with_events(mut self, events: Arc<EventManager>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn initial_data(&self) -> Option<&T> {
        self.initial_data.as_ref()
    }

    /// 读取并校验模型数据
    ///
    /// - 不存在：Ok(None)
    /// - 版本不匹配：删除；有初始数据则写入并返回（age 为 0），否则 Ok(None)
    /// - 校验失败：删除；开发环境返回校验错误，生产环境 Ok(None)
    pub async fn load(&self) -> Result<Option<LoadedEntry<T>>> {
        let envelope = match self.store.get(&self.name).await {
            Ok(Some(envelope)) => envelope,
            Ok(None) => return Ok(None),
            Err(LocalFirstError::Serialization(message)) => {
                // 信封结构本身已损坏，按校验失败处理
                return self.discard_corrupted("$", &message).await;
            }
            Err(e) => return Err(e),
        };

        if envelope.schema_version != self.version {
            info!(
                "模型 {} 版本不匹配 (stored={}, expected={})，丢弃旧数据",
                self.name, envelope.schema_version, self.version
            );
            self.store.delete(&self.name).await?;
            emit_opt(
                &self.events,
                EventCategory::Model,
                "version-reset",
                EventPriority::High,
                serde_json::json!({
                    "key": self.name,
                    "storedVersion": envelope.schema_version,
                    "expectedVersion": self.version,
                }),
            );

            return match self.initial_data.clone() {
                Some(initial) => {
                    let updated_at = self.save(&initial).await?;
                    Ok(Some(LoadedEntry {
                        data: initial,
                        updated_at,
                    }))
                }
                None => Ok(None),
            };
        }

        match self.schema.parse(&envelope.data) {
            Ok(data) => {
                debug!("模型 {} 已从存储加载 (updated_at={})", self.name, envelope.updated_at);
                Ok(Some(LoadedEntry {
                    data,
                    updated_at: envelope.updated_at,
                }))
            }
            Err(issue) => self.discard_corrupted(&issue.path, &issue.message).await,
        }
    }

    async fn discard_corrupted(&self, path: &str, message: &str) -> Result<Option<LoadedEntry<T>>> {
        warn!("模型 {} 存储数据校验失败 ({}: {})，已删除", self.name, path, message);
        self.store.delete(&self.name).await?;
        emit_opt(
            &self.events,
            EventCategory::Model,
            "validation-failed",
            EventPriority::High,
            serde_json::json!({ "key": self.name, "path": path, "message": message }),
        );

        if self.environment.is_production() {
            Ok(None)
        } else {
            Err(LocalFirstError::validation(&self.name, path, message))
        }
    }

    /// 校验内存中的数据
    pub fn validate(&self, data: &T) -> Result<()> {
        let raw = serde_json::to_value(data)?;
        self.schema
            .parse(&raw)
            .map(|_| ())
            .map_err(|issue| LocalFirstError::validation(&self.name, issue.path, issue.message))
    }

    /// 无条件写入，返回新的 updated_at
    pub async fn save(&self, data: &T) -> Result<i64> {
        let updated_at = now_millis();
        let envelope = StoredEnvelope::new(self.version, updated_at, serde_json::to_value(data)?);
        self.store.set(&self.name, &envelope).await?;
        debug!("模型 {} 已写入 (updated_at={})", self.name, updated_at);
        Ok(updated_at)
    }

    /// 删除信封
    pub async fn delete(&self) -> Result<()> {
        self.store.delete(&self.name).await
    }

    /// 提交到串行写入通道
    pub fn enqueue<F, R>(&self, op: F) -> impl Future<Output = Result<R>> + Send + 'static
    where
        F: Future<Output = Result<R>> + Send + 'static,
        R: Send + 'static,
    {
        self.lane.enqueue(op)
    }
}
