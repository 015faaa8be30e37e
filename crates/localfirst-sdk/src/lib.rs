//! LocalFirst SDK - 本地优先的数据模型与补偿事务
//!
//! 本 SDK 提供两部分能力：
//! - 模型：持久化缓存、TTL 新鲜度、单飞同步、后台重新验证、跨标签页广播
//! - 事务：按步骤执行，支持重试退避、整体超时与逆序补偿回滚
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use localfirst_sdk::{LocalFirstError, LocalFirstSdk, ModelOptions, SdkConfig, SerdeSchema, StepOptions, SyncOptions, TransactionOptions};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
//! struct Cart {
//!     items: Vec<String>,
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SdkConfig::builder().data_dir("/path/to/data").build();
//!     let sdk = LocalFirstSdk::initialize(config, None).await?;
//!
//!     // 定义模型
//!     let cart = sdk.define_model("cart", ModelOptions::new(SerdeSchema::<Cart>::new()).ttl(5_000));
//!
//!     // 首次访问时拉取，之后直接读缓存
//!     let current = cart
//!         .get_sync_promise(
//!             |_current: Option<Cart>| async { Ok::<_, LocalFirstError>(Cart { items: vec![] }) },
//!             SyncOptions::new(),
//!         )
//!         .await?;
//!     println!("当前购物车: {:?}", current);
//!
//!     // 乐观更新，失败时自动回滚
//!     let tx = sdk.start_transaction(TransactionOptions::new());
//!     let model = cart.clone();
//!     let undo = cart.clone();
//!     tx.run(
//!         move |_signal| {
//!             let model = model.clone();
//!             async move { model.patch(|c| c.items.push("apple".into())).await }
//!         },
//!         StepOptions::new().compensate(move |_previous: Cart| async move {
//!             undo.patch(|c| {
//!                 c.items.pop();
//!             })
//!             .await
//!             .map(|_| ())
//!         }),
//!     )
//!     .await?;
//!     tx.commit()?;
//!
//!     sdk.shutdown().await?;
//!     Ok(())
//! }
//! ```

// 导出核心模块
pub mod broadcast;
pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod model;
pub mod sdk;
pub mod storage;
pub mod sync;
pub mod transaction;
pub mod utils;
pub mod version;

// 重新导出核心类型，方便使用
pub use broadcast::{BroadcastMessage, BroadcastMessageType, CrossTabBus, ModelBroadcaster};
pub use cache::{CacheState, CacheStatus, CombinedSnapshot, ModelHistory, Unsubscribe};
pub use config::{Environment, SdkConfig, SdkConfigBuilder};
pub use error::{LocalFirstError, Result, StorageErrorKind};
pub use events::{EventCategory, EventFilter, EventManager, EventPriority, SdkEvent};
pub use model::{MergeFn, Model, ModelContext, ModelData, ModelOptions};
pub use sdk::LocalFirstSdk;
pub use storage::{
    DurableStore, FnSchema, MemoryStore, Schema, SerdeSchema, SledStore, StoredEnvelope,
    ValidationIssue,
};
pub use sync::{Fetcher, RevalidatePolicy, SyncFuture, SyncOptions};
pub use transaction::{
    Backoff, RetryConfig, StepOptions, Transaction, TransactionOptions, TransactionStatus,
};
pub use version::SDK_VERSION;
