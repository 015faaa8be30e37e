//! 同步管理器
//!
//! 职责：
//! - 单飞（single-flight）：空缓存时并发调用共享同一个 future，只调用一次 fetcher
//! - 已有缓存时直接返回已完成的 future，不再调用 fetcher
//! - 挂载时按策略（always / stale / never）触发后台重新验证
//! - 后台重新验证同一时刻最多一个；写回时带上开始时的 mutation_version，
//!   期间发生过本地写入则丢弃后台结果

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared, WeakShared};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::cache::ModelHistory;
use crate::error::{LocalFirstError, Result};
use crate::events::{emit_opt, EventCategory, EventManager, EventPriority};
use crate::storage::LoadedEntry;
use crate::utils::now_millis;

/// 所有调用方共享的同步 future
pub type SyncFuture<T> = Shared<BoxFuture<'static, Result<T>>>;

/// 后台错误回调
pub type ErrorCallback = Arc<dyn Fn(&LocalFirstError) + Send + Sync>;

/// 挂载时的重新验证策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RevalidatePolicy {
    Always,
    #[default]
    Stale,
    Never,
}

impl RevalidatePolicy {
    pub fn should_revalidate(&self, is_stale: bool) -> bool {
        match self {
            RevalidatePolicy::Always => true,
            RevalidatePolicy::Stale => is_stale,
            RevalidatePolicy::Never => false,
        }
    }
}

/// 同步选项
#[derive(Clone, Default)]
pub struct SyncOptions {
    pub revalidate_on_mount: RevalidatePolicy,
    /// 后台重新验证失败时的回调
    pub on_error: Option<ErrorCallback>,
}

impl SyncOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn revalidate_on_mount(mut self, policy: RevalidatePolicy) -> Self {
        self.revalidate_on_mount = policy;
        self
    }

    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&LocalFirstError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(callback));
        self
    }
}

impl std::fmt::Debug for SyncOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncOptions")
            .field("revalidate_on_mount", &self.revalidate_on_mount)
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// 数据拉取函数
///
/// `current` 为 None 表示首次访问（本地没有任何数据）。
pub trait Fetcher<T>: Send + Sync + 'static {
    fn fetch(&self, current: Option<T>) -> BoxFuture<'static, Result<T>>;
}

impl<T, F, Fut> Fetcher<T> for F
where
    F: Fn(Option<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    fn fetch(&self, current: Option<T>) -> BoxFuture<'static, Result<T>> {
        self(current).boxed()
    }
}

/// 写入来源
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteSource {
    /// 本地写入：总是生效，并递增 mutation_version
    Manual,
    /// 后台重新验证：mutation_version 已变化时丢弃
    Background { expected_mutation_version: u64 },
}

/// 写入结果
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome<T> {
    Applied(T),
    /// 后台写入被 mutation_version 拦截
    Dropped,
}

/// 同步管理器依赖的模型能力
#[async_trait]
pub trait SyncBackend<T>: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn has_cached_data(&self) -> bool;

    /// 从存储加载并填充缓存
    async fn load_entry(&self) -> Result<Option<LoadedEntry<T>>>;

    /// 经串行写入通道写入（合并、校验、持久化、广播）
    async fn write(&self, data: T, source: WriteSource) -> Result<WriteOutcome<T>>;
}

struct SyncSlots<T> {
    /// 已完成的 future（缓存命中时直接返回）
    resolved: Option<SyncFuture<T>>,
    /// 正在进行的首次同步；只保留弱引用，没有等待方时自动失效
    in_flight: Option<WeakShared<BoxFuture<'static, Result<T>>>>,
}

pub struct SyncManager<T> {
    name: String,
    ttl_ms: u64,
    slots: Mutex<SyncSlots<T>>,
    revalidating: AtomicBool,
    revalidation_done: Notify,
    mutation_version: AtomicU64,
    fetch_count: AtomicU64,
    events: Option<Arc<EventManager>>,
}

impl<T> SyncManager<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, ttl_ms: u64, events: Option<Arc<EventManager>>) -> Self {
        Self {
            name: name.into(),
            ttl_ms,
            slots: Mutex::new(SyncSlots {
                resolved: None,
                in_flight: None,
            }),
            revalidating: AtomicBool::new(false),
            revalidation_done: Notify::new(),
            mutation_version: AtomicU64::new(0),
            fetch_count: AtomicU64::new(0),
            events,
        }
    }

    pub fn mutation_version(&self) -> u64 {
        self.mutation_version.load(Ordering::SeqCst)
    }

    /// 本地写入成功后调用
    pub fn bump_mutation_version(&self) -> u64 {
        self.mutation_version.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// 后台写入是否仍然有效
    pub fn fence_allows(&self, source: WriteSource) -> bool {
        match source {
            WriteSource::Manual => true,
            WriteSource::Background {
                expected_mutation_version,
            } => self.mutation_version() == expected_mutation_version,
        }
    }

    /// 首次同步路径上 fetcher 被调用的次数
    pub fn fetch_count(&self) -> u64 {
        self.fetch_count.load(Ordering::SeqCst)
    }

    /// 写入成功后刷新已完成的 future
    pub fn set_resolved(&self, data: T) {
        let ready = futures::future::ready(Ok(data)).boxed().shared();
        self.slots.lock().resolved = Some(ready);
    }

    /// 数据被删除后清空
    pub fn reset(&self) {
        self.slots.lock().resolved = None;
    }

    /// 首次同步是否正在进行
    pub fn is_syncing(&self) -> bool {
        self.slots
            .lock()
            .in_flight
            .as_ref()
            .map(|weak| weak.upgrade().is_some())
            .unwrap_or(false)
    }

    pub fn is_revalidating(&self) -> bool {
        self.revalidating.load(Ordering::SeqCst)
    }

    /// 等待当前的后台重新验证结束
    pub async fn wait_for_revalidation(&self) {
        loop {
            // 先注册再检查，避免错过结束通知
            let done = self.revalidation_done.notified();
            if !self.is_revalidating() {
                return;
            }
            done.await;
        }
    }

    /// 获取同步 future
    ///
    /// - 有缓存且有已完成的 future：直接返回
    /// - 已有进行中的同步：返回同一个 future
    /// - 否则：先读存储；读到则按策略触发后台重新验证；读不到则调用
    ///   fetcher(None) 并以本地写入保存结果
    pub fn get_sync_promise(
        self: &Arc<Self>,
        backend: Arc<dyn SyncBackend<T>>,
        fetcher: Arc<dyn Fetcher<T>>,
        options: SyncOptions,
    ) -> SyncFuture<T> {
        let future = {
            let mut slots = self.slots.lock();

            if backend.has_cached_data() {
                if let Some(resolved) = &slots.resolved {
                    return resolved.clone();
                }
            }

            if let Some(in_flight) = slots.in_flight.as_ref().and_then(|weak| weak.upgrade()) {
                debug!("模型 {} 同步进行中，合并请求", self.name);
                return in_flight;
            }

            let manager = self.clone();
            let future = async move {
                let result = manager.run_initial_sync(backend, fetcher, options).await;
                manager.finish_initial_sync(&result);
                result
            }
            .boxed()
            .shared();

            slots.in_flight = future.downgrade();
            future
        };

        // 事件监听器可能回读模型状态，发出事件前必须释放锁
        info!("模型 {} 开始同步", self.name);
        emit_opt(
            &self.events,
            EventCategory::Model,
            "sync-start",
            EventPriority::Low,
            serde_json::json!({ "key": self.name }),
        );
        future
    }

    async fn run_initial_sync(
        self: &Arc<Self>,
        backend: Arc<dyn SyncBackend<T>>,
        fetcher: Arc<dyn Fetcher<T>>,
        options: SyncOptions,
    ) -> Result<T> {
        if let Some(entry) = backend.load_entry().await? {
            let history = ModelHistory::compute(entry.updated_at, self.ttl_ms, false, now_millis());
            if options.revalidate_on_mount.should_revalidate(history.is_stale) {
                self.start_revalidation(backend, fetcher, entry.data.clone(), options.on_error);
            }
            return Ok(entry.data);
        }

        // 首次访问：本地没有数据
        self.fetch_count.fetch_add(1, Ordering::SeqCst);
        let data = fetcher.fetch(None).await?;
        match backend.write(data, WriteSource::Manual).await? {
            WriteOutcome::Applied(data) => Ok(data),
            WriteOutcome::Dropped => Err(LocalFirstError::Other(format!(
                "模型 {} 的首次同步写入被丢弃",
                self.name
            ))),
        }
    }

    fn finish_initial_sync(&self, result: &Result<T>) {
        let mut slots = self.slots.lock();
        slots.in_flight = None;
        match result {
            Ok(data) => {
                slots.resolved = Some(futures::future::ready(Ok(data.clone())).boxed().shared());
            }
            Err(e) => {
                warn!("模型 {} 同步失败: {}", self.name, e);
            }
        }
    }

    /// 启动后台重新验证，已有进行中的验证时返回 false
    pub fn start_revalidation(
        self: &Arc<Self>,
        backend: Arc<dyn SyncBackend<T>>,
        fetcher: Arc<dyn Fetcher<T>>,
        current: T,
        on_error: Option<ErrorCallback>,
    ) -> bool {
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!("模型 {} 不在异步运行时中，无法启动后台重新验证", self.name);
                return false;
            }
        };

        if self.revalidating.swap(true, Ordering::SeqCst) {
            debug!("模型 {} 后台重新验证已在进行，忽略", self.name);
            return false;
        }

        let expected_mutation_version = self.mutation_version();
        let manager = self.clone();
        debug!(
            "模型 {} 开始后台重新验证 (mutation_version={})",
            self.name, expected_mutation_version
        );

        runtime.spawn(async move {
            let _guard = RevalidationGuard(manager.clone());
            let name = manager.name.clone();
            let work = async move {
                let data = fetcher.fetch(Some(current)).await?;
                backend
                    .write(
                        data,
                        WriteSource::Background {
                            expected_mutation_version,
                        },
                    )
                    .await
            };
            let outcome = match AssertUnwindSafe(work).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(_) => Err(LocalFirstError::Other(format!(
                    "模型 {} 的后台拉取函数 panic",
                    name
                ))),
            };

            match outcome {
                Ok(WriteOutcome::Applied(_)) => {
                    info!("模型 {} 后台重新验证完成", manager.name);
                }
                Ok(WriteOutcome::Dropped) => {
                    info!("模型 {} 后台重新验证结果已过期，丢弃", manager.name);
                }
                Err(e) => manager.report_background_error(&e, on_error.as_ref()),
            }
        });

        emit_opt(
            &self.events,
            EventCategory::Model,
            "revalidate-start",
            EventPriority::Low,
            serde_json::json!({ "key": self.name, "mutationVersion": expected_mutation_version }),
        );
        true
    }

    /// 后台错误只通知回调，绝不向外传播
    fn report_background_error(&self, error: &LocalFirstError, on_error: Option<&ErrorCallback>) {
        warn!("模型 {} 后台重新验证失败: {}", self.name, error);
        emit_opt(
            &self.events,
            EventCategory::Model,
            "revalidate-error",
            EventPriority::Normal,
            serde_json::json!({ "key": self.name, "code": error.code(), "message": error.to_string() }),
        );
        if let Some(callback) = on_error {
            if catch_unwind(AssertUnwindSafe(|| callback(error))).is_err() {
                error!("模型 {} 的 on_error 回调 panic", self.name);
            }
        }
    }
}

/// 后台任务结束（包括 panic 或被取消）时清除标记并唤醒等待方
struct RevalidationGuard<T>(Arc<SyncManager<T>>);

impl<T> Drop for RevalidationGuard<T> {
    fn drop(&mut self) {
        self.0.revalidating.store(false, Ordering::SeqCst);
        self.0.revalidation_done.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn fetcher_fn<F, Fut>(f: F) -> Arc<dyn Fetcher<u32>>
    where
        F: Fn(Option<u32>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<u32>> + Send + 'static,
    {
        Arc::new(f)
    }

    /// 只记录写入的假后端
    struct FakeBackend {
        sync: Arc<SyncManager<u32>>,
        stored: Mutex<Option<LoadedEntry<u32>>>,
        writes: Mutex<Vec<(u32, WriteSource)>>,
    }

    impl FakeBackend {
        fn new(sync: Arc<SyncManager<u32>>, stored: Option<LoadedEntry<u32>>) -> Arc<Self> {
            Arc::new(Self {
                sync,
                stored: Mutex::new(stored),
                writes: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl SyncBackend<u32> for FakeBackend {
        fn name(&self) -> &str {
            "fake"
        }

        fn has_cached_data(&self) -> bool {
            self.stored.lock().is_some()
        }

        async fn load_entry(&self) -> Result<Option<LoadedEntry<u32>>> {
            Ok(self.stored.lock().clone())
        }

        async fn write(&self, data: u32, source: WriteSource) -> Result<WriteOutcome<u32>> {
            if !self.sync.fence_allows(source) {
                return Ok(WriteOutcome::Dropped);
            }
            self.writes.lock().push((data, source));
            *self.stored.lock() = Some(LoadedEntry {
                data,
                updated_at: now_millis(),
            });
            if source == WriteSource::Manual {
                self.sync.bump_mutation_version();
            }
            self.sync.set_resolved(data);
            Ok(WriteOutcome::Applied(data))
        }
    }

    #[tokio::test]
    async fn test_single_flight_on_empty_cache() {
        let sync = Arc::new(SyncManager::<u32>::new("fake", 1_000, None));
        let backend = FakeBackend::new(sync.clone(), None);
        let calls = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Notify::new());

        let c = calls.clone();
        let g = gate.clone();
        let fetcher = fetcher_fn(move |current: Option<u32>| {
            assert!(current.is_none());
            c.fetch_add(1, Ordering::SeqCst);
            let g = g.clone();
            async move {
                g.notified().await;
                Ok(42)
            }
        });

        let futures: Vec<_> = (0..8)
            .map(|_| sync.get_sync_promise(backend.clone(), fetcher.clone(), SyncOptions::new()))
            .collect();

        let waiter = tokio::spawn(futures::future::join_all(futures));
        tokio::time::sleep(Duration::from_millis(20)).await;
        gate.notify_one();

        let results = waiter.await.unwrap();
        assert!(results.iter().all(|r| *r.as_ref().unwrap() == 42));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(backend.writes.lock().len(), 1);
        assert_eq!(sync.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_cached_promise_skips_fetcher() {
        let sync = Arc::new(SyncManager::<u32>::new("fake", 60_000, None));
        let backend = FakeBackend::new(
            sync.clone(),
            Some(LoadedEntry {
                data: 7,
                updated_at: now_millis(),
            }),
        );
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let fetcher = fetcher_fn(move |_current: Option<u32>| {
            c.fetch_add(1, Ordering::SeqCst);
            async { Ok(8) }
        });

        let first = sync
            .get_sync_promise(backend.clone(), fetcher.clone(), SyncOptions::new())
            .await
            .unwrap();
        assert_eq!(first, 7);

        let second = sync
            .get_sync_promise(backend.clone(), fetcher.clone(), SyncOptions::new())
            .await
            .unwrap();
        assert_eq!(second, 7);
        // 数据未过期，stale 策略不触发后台拉取
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stale_entry_triggers_background_revalidation() {
        let sync = Arc::new(SyncManager::<u32>::new("fake", 10, None));
        let backend = FakeBackend::new(
            sync.clone(),
            Some(LoadedEntry {
                data: 1,
                updated_at: now_millis() - 1_000,
            }),
        );
        let fetcher = fetcher_fn(|current: Option<u32>| async move {
            Ok(current.unwrap_or(0) + 100)
        });

        let value = sync
            .get_sync_promise(backend.clone(), fetcher, SyncOptions::new())
            .await
            .unwrap();
        // 先返回旧值
        assert_eq!(value, 1);

        sync.wait_for_revalidation().await;
        let writes = backend.writes.lock().clone();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].0, 101);
        assert!(matches!(writes[0].1, WriteSource::Background { expected_mutation_version: 0 }));
    }

    #[tokio::test]
    async fn test_never_policy_skips_revalidation() {
        let sync = Arc::new(SyncManager::<u32>::new("fake", 0, None));
        let backend = FakeBackend::new(
            sync.clone(),
            Some(LoadedEntry {
                data: 1,
                updated_at: now_millis() - 1_000,
            }),
        );
        let fetcher = fetcher_fn(|_current: Option<u32>| async { Ok(2) });

        let options = SyncOptions::new().revalidate_on_mount(RevalidatePolicy::Never);
        assert_eq!(sync.get_sync_promise(backend.clone(), fetcher, options).await.unwrap(), 1);
        assert!(!sync.is_revalidating());
        assert!(backend.writes.lock().is_empty());
    }

    #[tokio::test]
    async fn test_only_one_revalidation_in_flight() {
        let sync = Arc::new(SyncManager::<u32>::new("fake", 0, None));
        let backend = FakeBackend::new(sync.clone(), None);
        let gate = Arc::new(Notify::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let g = gate.clone();
        let c = calls.clone();
        let fetcher = fetcher_fn(move |_current: Option<u32>| {
            c.fetch_add(1, Ordering::SeqCst);
            let g = g.clone();
            async move {
                g.notified().await;
                Ok(5)
            }
        });

        assert!(sync.start_revalidation(backend.clone(), fetcher.clone(), 1, None));
        assert!(!sync.start_revalidation(backend.clone(), fetcher.clone(), 1, None));
        assert!(sync.is_revalidating());

        gate.notify_one();
        sync.wait_for_revalidation().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_background_write_dropped_after_local_mutation() {
        let sync = Arc::new(SyncManager::<u32>::new("fake", 0, None));
        let backend = FakeBackend::new(sync.clone(), None);
        let gate = Arc::new(Notify::new());

        let g = gate.clone();
        let fetcher = fetcher_fn(move |_current: Option<u32>| {
            let g = g.clone();
            async move {
                g.notified().await;
                Ok(999)
            }
        });

        sync.start_revalidation(backend.clone(), fetcher, 1, None);
        // 后台拉取进行中发生本地写入
        backend.write(10, WriteSource::Manual).await.unwrap();
        gate.notify_one();
        sync.wait_for_revalidation().await;

        assert_eq!(backend.stored.lock().as_ref().unwrap().data, 10);
        assert_eq!(backend.writes.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_background_error_goes_to_callback_only() {
        let sync = Arc::new(SyncManager::<u32>::new("fake", 0, None));
        let backend = FakeBackend::new(sync.clone(), None);
        let seen = Arc::new(Mutex::new(None::<String>));

        let fetcher = fetcher_fn(|_current: Option<u32>| async {
            Err::<u32, _>(LocalFirstError::Fetch("offline".into()))
        });

        let s = seen.clone();
        let on_error: ErrorCallback = Arc::new(move |e: &LocalFirstError| {
            *s.lock() = Some(e.code().to_string());
        });

        sync.start_revalidation(backend.clone(), fetcher, 1, Some(on_error));
        sync.wait_for_revalidation().await;

        assert_eq!(seen.lock().as_deref(), Some("fetch_error"));
        assert!(backend.writes.lock().is_empty());
    }

    #[tokio::test]
    async fn test_event_listener_can_read_sync_state() {
        let events = Arc::new(EventManager::new(16));
        let sync = Arc::new(SyncManager::<u32>::new("fake", 10, Some(events.clone())));
        let seen = Arc::new(AtomicUsize::new(0));

        let weak = Arc::downgrade(&sync);
        let s = seen.clone();
        events.add_listener("*", move |_| {
            if let Some(sync) = weak.upgrade() {
                sync.is_syncing();
                sync.is_revalidating();
            }
            s.fetch_add(1, Ordering::SeqCst);
        });

        let backend = FakeBackend::new(
            sync.clone(),
            Some(LoadedEntry {
                data: 1,
                updated_at: now_millis() - 1_000,
            }),
        );
        let fetcher = fetcher_fn(|_current: Option<u32>| async { Ok(2) });

        // 在阻塞线程上调用，死锁时由超时暴露而不是卡住测试
        let (sync2, backend2, fetcher2) = (sync.clone(), backend.clone(), fetcher.clone());
        let promise = tokio::time::timeout(
            Duration::from_secs(2),
            tokio::task::spawn_blocking(move || {
                sync2.get_sync_promise(backend2, fetcher2, SyncOptions::new())
            }),
        )
        .await
        .expect("get_sync_promise blocked on a listener")
        .unwrap();

        let value = tokio::time::timeout(Duration::from_secs(2), promise)
            .await
            .expect("initial sync blocked on a listener")
            .unwrap();
        assert_eq!(value, 1);

        sync.wait_for_revalidation().await;
        // sync-start 与 revalidate-start
        assert!(seen.load(Ordering::SeqCst) >= 2);
    }

    fn fetch_bug() -> Result<u32> {
        panic!("fetcher bug")
    }

    #[tokio::test]
    async fn test_panicking_fetcher_ends_revalidation() {
        let sync = Arc::new(SyncManager::<u32>::new("fake", 0, None));
        let backend = FakeBackend::new(sync.clone(), None);
        let seen = Arc::new(Mutex::new(None::<String>));

        let s = seen.clone();
        let on_error: ErrorCallback = Arc::new(move |e: &LocalFirstError| {
            *s.lock() = Some(e.code().to_string());
        });
        let fetcher = fetcher_fn(|_current: Option<u32>| async { fetch_bug() });

        assert!(sync.start_revalidation(backend.clone(), fetcher, 1, Some(on_error)));
        tokio::time::timeout(Duration::from_secs(1), sync.wait_for_revalidation())
            .await
            .expect("revalidation never finished");

        assert!(!sync.is_revalidating());
        assert_eq!(seen.lock().as_deref(), Some("other"));

        // 可以再次启动
        let fetcher = fetcher_fn(|_current: Option<u32>| async { Ok(3) });
        assert!(sync.start_revalidation(backend.clone(), fetcher, 1, None));
        sync.wait_for_revalidation().await;
        assert_eq!(backend.writes.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_wait_for_revalidation_returns_when_idle() {
        let sync = SyncManager::<u32>::new("fake", 0, None);
        tokio::time::timeout(Duration::from_millis(100), sync.wait_for_revalidation())
            .await
            .expect("idle wait should return immediately");
    }

    #[tokio::test]
    async fn test_fetch_failure_propagates_and_allows_retry() {
        let sync = Arc::new(SyncManager::<u32>::new("fake", 0, None));
        let backend = FakeBackend::new(sync.clone(), None);
        let attempts = Arc::new(AtomicUsize::new(0));

        let a = attempts.clone();
        let fetcher = fetcher_fn(move |_current: Option<u32>| {
            let n = a.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(LocalFirstError::Fetch("first visit failed".into()))
                } else {
                    Ok(3)
                }
            }
        });

        let err = sync
            .get_sync_promise(backend.clone(), fetcher.clone(), SyncOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, LocalFirstError::Fetch(_)));

        let ok = sync
            .get_sync_promise(backend.clone(), fetcher, SyncOptions::new())
            .await
            .unwrap();
        assert_eq!(ok, 3);
    }
}
