//! SDK 配置
//!
//! `SdkConfig` 控制持久化位置、运行环境（开发/生产）、事件缓冲区、
//! 跨标签页广播以及事务默认超时。推荐通过 [`SdkConfig::builder`] 构建。

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// 环境变量：运行环境
pub const ENV_VAR_ENVIRONMENT: &str = "LOCALFIRST_ENV";

/// 运行环境
///
/// 开发环境下校验失败会直接报错；生产环境下丢弃损坏数据并自愈。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Environment {
    #[default]
    Development,
    Production,
}

impl Environment {
    /// 从 `LOCALFIRST_ENV` 读取运行环境，未设置时为 Development
    pub fn from_env() -> Self {
        match std::env::var(ENV_VAR_ENVIRONMENT) {
            Ok(value) => Self::parse(&value),
            Err(_) => Environment::Development,
        }
    }

    fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "production" | "prod" => Environment::Production,
            _ => Environment::Development,
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Production)
    }
}

/// SDK 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SdkConfig {
    /// 数据存储目录，None 表示使用内存存储
    pub data_dir: Option<PathBuf>,
    /// 运行环境
    pub environment: Environment,
    /// 事件缓冲区大小
    pub event_buffer_size: usize,
    /// 跨标签页广播缓冲区大小
    pub broadcast_buffer_size: usize,
    /// 广播频道名称
    pub channel_name: String,
    /// 模型默认 TTL（毫秒），0 表示总是过期
    pub default_ttl_ms: u64,
    /// 事务默认超时（毫秒）
    pub default_transaction_timeout_ms: u64,
    /// 打开 sled 数据库的最大重试次数（锁竞争时）
    pub store_open_retries: u32,
    /// 打开 sled 数据库的基础退避（毫秒）
    pub store_open_retry_delay_ms: u64,
}

impl Default for SdkConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            environment: Environment::Development,
            event_buffer_size: 1000,
            broadcast_buffer_size: 256,
            channel_name: "localfirst-sdk".to_string(),
            default_ttl_ms: 0,
            default_transaction_timeout_ms: 30_000,
            store_open_retries: 8,
            store_open_retry_delay_ms: 300,
        }
    }
}

impl SdkConfig {
    pub fn builder() -> SdkConfigBuilder {
        SdkConfigBuilder::new()
    }
}

/// SDK 配置构建器
#[derive(Debug, Default)]
pub struct SdkConfigBuilder {
    config: SdkConfig,
}

impl SdkConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: SdkConfig::default(),
        }
    }

    pub fn data_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config.data_dir = Some(path.as_ref().to_path_buf());
        self
    }

    /// 使用内存存储（测试或无持久化场景）
    pub fn in_memory(mut self) -> Self {
        self.config.data_dir = None;
        self
    }

    pub fn environment(mut self, environment: Environment) -> Self {
        self.config.environment = environment;
        self
    }

    /// 从 `LOCALFIRST_ENV` 读取运行环境
    pub fn environment_from_env(self) -> Self {
        self.environment(Environment::from_env())
    }

    pub fn production(self) -> Self {
        self.environment(Environment::Production)
    }

    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.config.event_buffer_size = size;
        self
    }

    pub fn broadcast_buffer_size(mut self, size: usize) -> Self {
        self.config.broadcast_buffer_size = size;
        self
    }

    pub fn channel_name<S: Into<String>>(mut self, name: S) -> Self {
        self.config.channel_name = name.into();
        self
    }

    pub fn default_ttl_ms(mut self, ttl_ms: u64) -> Self {
        self.config.default_ttl_ms = ttl_ms;
        self
    }

    pub fn default_transaction_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.config.default_transaction_timeout_ms = timeout_ms;
        self
    }

    pub fn store_open_retries(mut self, retries: u32, delay_ms: u64) -> Self {
        self.config.store_open_retries = retries;
        self.config.store_open_retry_delay_ms = delay_ms;
        self
    }

    pub fn build(self) -> SdkConfig {
        self.config
    }
}
