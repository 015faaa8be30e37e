//! SDK 入口 - 组装存储、事件、广播，定义模型与启动事务
//!
//! 每个 `LocalFirstSdk` 实例相当于一个页面（标签页）：多个实例共享同一个
//! 持久化存储和同一条 `CrossTabBus` 时，彼此之间的写入会触发对方重新加载。

use std::sync::Arc;
use tracing::{info, warn};

use crate::broadcast::{CrossTabBus, ModelBroadcaster};
use crate::config::SdkConfig;
use crate::error::{LocalFirstError, Result};
use crate::events::{EventCategory, EventManager, EventPriority};
use crate::model::{Model, ModelContext, ModelData, ModelOptions};
use crate::storage::{DurableStore, MemoryStore, SledStore};
use crate::transaction::{Transaction, TransactionOptions};
use crate::version::SDK_VERSION;

pub struct LocalFirstSdk {
    config: SdkConfig,
    context: ModelContext,
    /// sled 后端，关闭时需要 flush
    sled: Option<Arc<SledStore>>,
    events: Arc<EventManager>,
}

impl std::fmt::Debug for LocalFirstSdk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalFirstSdk")
            .field("environment", &self.config.environment)
            .field("persistent", &self.sled.is_some())
            .field("broadcaster", &self.context.broadcaster)
            .finish()
    }
}

impl LocalFirstSdk {
    /// 初始化 SDK
    ///
    /// 配置了 `data_dir` 时打开 sled 存储，否则使用内存存储。
    /// `bus` 为 None 时跨页广播退化为空实现。
    pub async fn initialize(config: SdkConfig, bus: Option<CrossTabBus>) -> Result<Self> {
        info!("正在初始化 LocalFirstSdk v{}...", SDK_VERSION);
        Self::validate_config(&config)?;

        let (store, sled): (Arc<dyn DurableStore>, Option<Arc<SledStore>>) = match &config.data_dir {
            Some(dir) => {
                let sled = Arc::new(
                    SledStore::open_with_retry(
                        dir,
                        config.store_open_retries,
                        config.store_open_retry_delay_ms,
                    )
                    .await?,
                );
                (sled.clone() as Arc<dyn DurableStore>, Some(sled))
            }
            None => {
                info!("未配置数据目录，使用内存存储");
                (Arc::new(MemoryStore::new()) as Arc<dyn DurableStore>, None)
            }
        };

        let mut sdk = Self::build(config, store, bus)?;
        sdk.sled = sled;
        Ok(sdk)
    }

    /// 使用外部提供的存储（测试或多实例共享存储时使用）
    pub fn with_store(
        config: SdkConfig,
        store: Arc<dyn DurableStore>,
        bus: Option<CrossTabBus>,
    ) -> Result<Self> {
        Self::validate_config(&config)?;
        Self::build(config, store, bus)
    }

    fn build(config: SdkConfig, store: Arc<dyn DurableStore>, bus: Option<CrossTabBus>) -> Result<Self> {
        let events = Arc::new(EventManager::new(config.event_buffer_size));

        if let Some(bus) = &bus {
            if bus.name() != config.channel_name {
                warn!(
                    "广播总线名称 {} 与配置的频道名称 {} 不一致",
                    bus.name(),
                    config.channel_name
                );
            }
        }
        let broadcaster = Arc::new(ModelBroadcaster::new(bus, Some(events.clone())));

        let context = ModelContext::new(store)
            .with_broadcaster(broadcaster)
            .with_events(events.clone())
            .with_environment(config.environment)
            .with_default_ttl_ms(config.default_ttl_ms);

        events.emit_with(
            EventCategory::System,
            "initialized",
            EventPriority::Normal,
            serde_json::json!({
                "version": SDK_VERSION,
                "environment": config.environment,
                "broadcast": context.broadcaster.is_available(),
            }),
        );
        info!("LocalFirstSdk 初始化完成 (environment={:?})", config.environment);

        Ok(Self {
            config,
            context,
            sled: None,
            events,
        })
    }

    fn validate_config(config: &SdkConfig) -> Result<()> {
        if config.event_buffer_size == 0 {
            return Err(LocalFirstError::Config("event_buffer_size must be greater than 0".into()));
        }
        if config.broadcast_buffer_size == 0 {
            return Err(LocalFirstError::Config("broadcast_buffer_size must be greater than 0".into()));
        }
        if config.channel_name.trim().is_empty() {
            return Err(LocalFirstError::Config("channel_name must not be empty".into()));
        }
        Ok(())
    }

    /// 定义模型
    pub fn define_model<T: ModelData>(&self, name: impl Into<String>, options: ModelOptions<T>) -> Model<T> {
        Model::define(name, options, &self.context)
    }

    /// 启动事务，未指定超时时使用配置中的默认值
    pub fn start_transaction(&self, mut options: TransactionOptions) -> Transaction {
        if options.timeout_ms.is_none() {
            options.timeout_ms = Some(self.config.default_transaction_timeout_ms);
        }
        Transaction::start(options, Some(self.events.clone()))
    }

    pub fn config(&self) -> &SdkConfig {
        &self.config
    }

    pub fn context(&self) -> &ModelContext {
        &self.context
    }

    pub fn events(&self) -> &Arc<EventManager> {
        &self.events
    }

    pub fn store(&self) -> Arc<dyn DurableStore> {
        self.context.store.clone()
    }

    pub fn broadcaster(&self) -> &Arc<ModelBroadcaster> {
        &self.context.broadcaster
    }

    /// 关闭 SDK：持久化存储落盘
    pub async fn shutdown(&self) -> Result<()> {
        info!("正在关闭 LocalFirstSdk...");
        if let Some(sled) = &self.sled {
            sled.flush().await?;
        }
        self.events.emit_with(
            EventCategory::System,
            "shutdown",
            EventPriority::Normal,
            serde_json::json!({}),
        );
        info!("LocalFirstSdk 关闭完成");
        Ok(())
    }
}
