//! 同步模块 - 首次拉取、单飞合并与后台重新验证

pub mod sync_manager;

pub use sync_manager::{
    ErrorCallback, Fetcher, RevalidatePolicy, SyncBackend, SyncFuture, SyncManager, SyncOptions,
    WriteOutcome, WriteSource,
};
