//! 模型 - 缓存、存储、同步与广播的组合根
//!
//! 一个模型名对应一个 `Model`，UI 层通过它读取快照、订阅变化、发起写入。
//! 所有写入（patch / replace / delete）都经过该模型的串行写入通道。

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use tracing::{debug, info, warn};

use crate::broadcast::{BroadcastMessage, BroadcastMessageType, ModelBroadcaster};
use crate::cache::{CacheManager, CacheState, CombinedSnapshot, ModelHistory, Unsubscribe};
use crate::config::Environment;
use crate::error::{LocalFirstError, Result};
use crate::events::{emit_opt, EventCategory, EventManager, EventPriority};
use crate::storage::{DurableStore, LoadedEntry, Schema, SerdeSchema, StorageManager};
use crate::sync::{
    ErrorCallback, Fetcher, SyncBackend, SyncFuture, SyncManager, SyncOptions, WriteOutcome,
    WriteSource,
};
use crate::version::DEFAULT_SCHEMA_VERSION;

/// 模型数据需要满足的约束
pub trait ModelData: Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> ModelData for T where T: Clone + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static {}

/// 合并函数：`(当前值, 新值) -> 最终写入值`
pub type MergeFn<T> = Arc<dyn Fn(&T, T) -> T + Send + Sync>;

/// 模型定义选项
pub struct ModelOptions<T> {
    schema: Arc<dyn Schema<T>>,
    ttl_ms: Option<u64>,
    version: u32,
    initial_data: Option<T>,
    merge: Option<MergeFn<T>>,
}

impl<T: ModelData> ModelOptions<T> {
    pub fn new<S: Schema<T>>(schema: S) -> Self {
        Self {
            schema: Arc::new(schema),
            ttl_ms: None,
            version: DEFAULT_SCHEMA_VERSION,
            initial_data: None,
            merge: None,
        }
    }

    /// 只做结构校验
    pub fn serde() -> Self {
        Self::new(SerdeSchema::<T>::new())
    }

    /// 数据保鲜时长（毫秒），未设置时使用 SDK 默认值
    pub fn ttl(mut self, ttl_ms: u64) -> Self {
        self.ttl_ms = Some(ttl_ms);
        self
    }

    /// 存储 schema 版本，与存储中的版本不一致时丢弃旧数据
    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn initial_data(mut self, data: T) -> Self {
        self.initial_data = Some(data);
        self
    }

    pub fn merge<F>(mut self, merge: F) -> Self
    where
        F: Fn(&T, T) -> T + Send + Sync + 'static,
    {
        self.merge = Some(Arc::new(merge));
        self
    }
}

/// 定义模型所需的共享依赖
#[derive(Clone)]
pub struct ModelContext {
    pub store: Arc<dyn DurableStore>,
    pub broadcaster: Arc<ModelBroadcaster>,
    pub events: Option<Arc<EventManager>>,
    pub environment: Environment,
    pub default_ttl_ms: u64,
}

impl ModelContext {
    /// 只有存储、没有跨页广播的上下文
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        Self {
            store,
            broadcaster: Arc::new(ModelBroadcaster::noop(None)),
            events: None,
            environment: Environment::default(),
            default_ttl_ms: 0,
        }
    }

    pub fn with_broadcaster(mut self, broadcaster: Arc<ModelBroadcaster>) -> Self {
        self.broadcaster = broadcaster;
        self
    }

    pub fn with_events(mut self, events: Arc<EventManager>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_environment(mut self, environment: Environment) -> Self {
        self.environment = environment;
        self
    }

    pub fn with_default_ttl_ms(mut self, ttl_ms: u64) -> Self {
        self.default_ttl_ms = ttl_ms;
        self
    }
}

struct ModelInner<T> {
    name: String,
    cache: CacheManager<T>,
    storage: StorageManager<T>,
    sync: Arc<SyncManager<T>>,
    merge: MergeFn<T>,
    broadcaster: Arc<ModelBroadcaster>,
    events: Option<Arc<EventManager>>,
    remote_subscription: Unsubscribe,
}

impl<T> Drop for ModelInner<T> {
    fn drop(&mut self) {
        self.remote_subscription.unsubscribe();
    }
}

/// 模型句柄，克隆开销很小，所有克隆共享同一份状态
pub struct Model<T> {
    inner: Arc<ModelInner<T>>,
}

impl<T> Clone for Model<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: ModelData> std::fmt::Debug for Model<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Model")
            .field("name", &self.inner.name)
            .field("version", &self.inner.storage.version())
            .field("status", &self.inner.cache.status())
            .finish()
    }
}

impl<T: ModelData> Model<T> {
    /// 定义模型
    ///
    /// 只注册依赖和跨页订阅，不读取存储；需要立即填充缓存时调用 [`Model::load`]。
    pub fn define(name: impl Into<String>, options: ModelOptions<T>, context: &ModelContext) -> Self {
        let name = name.into();
        let ttl_ms = options.ttl_ms.unwrap_or(context.default_ttl_ms);

        let mut storage = StorageManager::new(
            name.clone(),
            options.version,
            context.store.clone(),
            options.schema,
            options.initial_data,
            context.environment,
        );
        if let Some(events) = &context.events {
            storage = storage.with_events(events.clone());
        }

        let merge = options
            .merge
            .unwrap_or_else(|| Arc::new(|_current: &T, incoming: T| incoming));

        let inner = Arc::new_cyclic(|weak: &Weak<ModelInner<T>>| {
            let weak = weak.clone();
            let remote_subscription = context
                .broadcaster
                .subscribe(&name, move |message| on_remote_change(&weak, message));

            ModelInner {
                cache: CacheManager::new(ttl_ms),
                sync: Arc::new(SyncManager::new(name.clone(), ttl_ms, context.events.clone())),
                storage,
                merge,
                broadcaster: context.broadcaster.clone(),
                events: context.events.clone(),
                remote_subscription,
                name,
            }
        });

        debug!(
            "定义模型 {} (version={}, ttl={}ms)",
            inner.name,
            inner.storage.version(),
            ttl_ms
        );
        Self { inner }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn version(&self) -> u32 {
        self.inner.storage.version()
    }

    pub fn ttl_ms(&self) -> u64 {
        self.inner.cache.ttl_ms()
    }

    /// 是否配置了初始数据
    pub fn is_seeded(&self) -> bool {
        self.inner.storage.initial_data().is_some()
    }

    pub fn mutation_version(&self) -> u64 {
        self.inner.sync.mutation_version()
    }

    pub fn is_revalidating(&self) -> bool {
        self.inner.sync.is_revalidating()
    }

    /// 首次同步是否正在进行
    pub fn is_syncing(&self) -> bool {
        self.inner.sync.is_syncing()
    }

    /// 等待当前的后台重新验证结束
    pub async fn wait_for_revalidation(&self) {
        self.inner.sync.wait_for_revalidation().await
    }

    /// 当前数据（仅 success 状态有值）
    pub fn get_snapshot(&self) -> Option<T> {
        self.inner.cache.get_data()
    }

    pub fn get_state(&self) -> CacheState<T> {
        self.inner.cache.get_state()
    }

    pub fn get_history(&self) -> ModelHistory {
        self.inner.cache.get_history()
    }

    pub fn get_combined_snapshot(&self) -> Arc<CombinedSnapshot<T>> {
        self.inner.cache.get_combined_snapshot()
    }

    /// 订阅本模型的任何变化（同步回调）
    pub fn subscribe<F>(&self, callback: F) -> Unsubscribe
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.cache.subscribe(callback)
    }

    /// 获取同步 future，见 [`SyncManager::get_sync_promise`]
    pub fn get_sync_promise<F>(&self, fetcher: F, options: SyncOptions) -> SyncFuture<T>
    where
        F: Fetcher<T>,
    {
        self.inner.sync.get_sync_promise(
            Arc::new(self.clone()) as Arc<dyn SyncBackend<T>>,
            Arc::new(fetcher),
            options,
        )
    }

    /// 基于当前缓存直接触发一次后台重新验证
    ///
    /// 没有缓存数据或已有验证在进行时返回 false。
    pub fn revalidate<F>(&self, fetcher: F, on_error: Option<ErrorCallback>) -> bool
    where
        F: Fetcher<T>,
    {
        let Some(current) = self.inner.cache.get_data() else {
            debug!("模型 {} 没有缓存数据，跳过重新验证", self.inner.name);
            return false;
        };
        self.inner.sync.start_revalidation(
            Arc::new(self.clone()) as Arc<dyn SyncBackend<T>>,
            Arc::new(fetcher),
            current,
            on_error,
        )
    }

    /// 从存储加载到缓存，不调用 fetcher
    ///
    /// 与写入共用串行通道，排在之前提交的写入之后执行。
    pub async fn load(&self) -> Result<Option<T>> {
        Ok(self.enqueue_load().await?.map(|entry| entry.data))
    }

    fn enqueue_load(&self) -> impl std::future::Future<Output = Result<Option<LoadedEntry<T>>>> + Send + 'static {
        let this = self.clone();
        self.inner
            .storage
            .enqueue(async move { this.load_into_cache().await })
    }

    /// 用变更函数修改当前数据
    ///
    /// 没有数据时从初始数据开始；两者都没有时返回 [`LocalFirstError::NoData`]。
    /// 校验失败时不会写入任何内容。
    pub async fn patch<F>(&self, mutator: F) -> Result<T>
    where
        F: FnOnce(&mut T) + Send + 'static,
    {
        let this = self.clone();
        self.inner
            .storage
            .enqueue(async move { this.apply_patch(mutator).await })
            .await
    }

    /// 整体替换（与现有数据按合并函数合并）
    pub async fn replace(&self, data: T) -> Result<T> {
        match self.write(data, WriteSource::Manual).await? {
            WriteOutcome::Applied(data) => Ok(data),
            WriteOutcome::Dropped => Err(LocalFirstError::Other(format!(
                "模型 {} 的本地写入被丢弃",
                self.inner.name
            ))),
        }
    }

    /// 删除持久化数据，缓存回到 loading
    pub async fn delete(&self) -> Result<()> {
        let this = self.clone();
        self.inner
            .storage
            .enqueue(async move { this.apply_delete().await })
            .await
    }

    async fn load_into_cache(&self) -> Result<Option<LoadedEntry<T>>> {
        let inner = &self.inner;
        match inner.storage.load().await {
            Ok(Some(entry)) => {
                inner.cache.update_with_data(entry.data.clone(), entry.updated_at);
                inner.sync.set_resolved(entry.data.clone());
                Ok(Some(entry))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                inner.cache.update_with_error(e.clone());
                Err(e)
            }
        }
    }

    /// 写入路径上读取当前值；损坏的数据已被存储层删除，按不存在处理
    async fn current_value(&self) -> Result<Option<T>> {
        match self.inner.storage.load().await {
            Ok(entry) => Ok(entry.map(|entry| entry.data)),
            Err(e) if e.is_validation_error() => Ok(None),
            Err(e) => Err(self.storage_failed(e)),
        }
    }

    fn storage_failed(&self, error: LocalFirstError) -> LocalFirstError {
        if !error.is_validation_error() {
            self.inner.cache.update_with_error(error.clone());
        }
        error
    }

    async fn apply_patch<F>(&self, mutator: F) -> Result<T>
    where
        F: FnOnce(&mut T),
    {
        let inner = &self.inner;
        let mut draft = match self.current_value().await? {
            Some(current) => current,
            None => inner
                .storage
                .initial_data()
                .cloned()
                .ok_or_else(|| LocalFirstError::NoData {
                    model: inner.name.clone(),
                })?,
        };

        catch_unwind(AssertUnwindSafe(|| mutator(&mut draft))).map_err(|_| {
            LocalFirstError::Other(format!("模型 {} 的变更函数 panic", inner.name))
        })?;
        inner.storage.validate(&draft)?;

        self.commit_write(draft, BroadcastMessageType::ModelPatched, WriteSource::Manual)
            .await
    }

    async fn apply_replace(&self, data: T, source: WriteSource) -> Result<WriteOutcome<T>> {
        let inner = &self.inner;
        if !inner.sync.fence_allows(source) {
            info!(
                "模型 {} 在后台拉取期间有本地写入，丢弃后台结果 (mutation_version={})",
                inner.name,
                inner.sync.mutation_version()
            );
            inner.cache.mark_conflicted();
            emit_opt(
                &inner.events,
                EventCategory::Model,
                "background-dropped",
                EventPriority::Normal,
                serde_json::json!({
                    "key": inner.name,
                    "mutationVersion": inner.sync.mutation_version(),
                }),
            );
            return Ok(WriteOutcome::Dropped);
        }

        let merged = match self.current_value().await? {
            Some(current) => {
                let merge = inner.merge.clone();
                catch_unwind(AssertUnwindSafe(|| merge(&current, data))).map_err(|_| {
                    LocalFirstError::Other(format!("模型 {} 的合并函数 panic", inner.name))
                })?
            }
            None => data,
        };
        inner.storage.validate(&merged)?;

        self.commit_write(merged, BroadcastMessageType::ModelReplaced, source)
            .await
            .map(WriteOutcome::Applied)
    }

    async fn commit_write(
        &self,
        data: T,
        message_type: BroadcastMessageType,
        source: WriteSource,
    ) -> Result<T> {
        let inner = &self.inner;
        let updated_at = inner
            .storage
            .save(&data)
            .await
            .map_err(|e| self.storage_failed(e))?;

        inner.cache.update_with_data(data.clone(), updated_at);
        let mutation_version = match source {
            WriteSource::Manual => inner.sync.bump_mutation_version(),
            WriteSource::Background { .. } => inner.sync.mutation_version(),
        };
        inner.sync.set_resolved(data.clone());
        inner.broadcaster.broadcast(message_type, &inner.name);

        let event_type = match (message_type, source) {
            (BroadcastMessageType::ModelPatched, _) => "patch",
            (_, WriteSource::Background { .. }) => "revalidate-applied",
            _ => "replace",
        };
        debug!("模型 {} {} 完成 (updated_at={})", inner.name, event_type, updated_at);
        emit_opt(
            &inner.events,
            EventCategory::Model,
            event_type,
            EventPriority::Normal,
            serde_json::json!({
                "key": inner.name,
                "updatedAt": updated_at,
                "mutationVersion": mutation_version,
            }),
        );
        Ok(data)
    }

    async fn apply_delete(&self) -> Result<()> {
        let inner = &self.inner;
        inner
            .storage
            .delete()
            .await
            .map_err(|e| self.storage_failed(e))?;

        inner.cache.set_loading();
        inner.sync.reset();
        inner.sync.bump_mutation_version();
        inner
            .broadcaster
            .broadcast(BroadcastMessageType::ModelDeleted, &inner.name);
        info!("模型 {} 已删除", inner.name);
        emit_opt(
            &inner.events,
            EventCategory::Model,
            "delete",
            EventPriority::Normal,
            serde_json::json!({ "key": inner.name }),
        );
        Ok(())
    }

    /// 其他页面写入后重新加载；经写入通道执行，避免覆盖本页更新的写入
    fn reload_from_remote(&self) {
        let reload = self.enqueue_load();
        let name = self.inner.name.clone();
        tokio::spawn(async move {
            if let Err(e) = reload.await {
                warn!("模型 {} 跨页重新加载失败: {}", name, e);
            }
        });
    }
}

fn on_remote_change<T: ModelData>(weak: &Weak<ModelInner<T>>, message: &BroadcastMessage) {
    let Some(inner) = weak.upgrade() else { return };
    let model = Model { inner };
    debug!("模型 {} 收到其他页面的 {:?}", model.inner.name, message.message_type);

    emit_opt(
        &model.inner.events,
        EventCategory::Model,
        "remote-change",
        EventPriority::Low,
        serde_json::json!({
            "key": model.inner.name,
            "senderId": message.sender_id,
            "type": message.message_type,
        }),
    );

    match message.message_type {
        BroadcastMessageType::ModelDeleted => {
            model.inner.cache.set_loading();
            model.inner.sync.reset();
        }
        BroadcastMessageType::ModelPatched | BroadcastMessageType::ModelReplaced => {
            if tokio::runtime::Handle::try_current().is_ok() {
                model.reload_from_remote();
            } else {
                warn!("模型 {} 不在异步运行时中，跳过跨页重新加载", model.inner.name);
            }
        }
    }
}

#[async_trait]
impl<T: ModelData> SyncBackend<T> for Model<T> {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn has_cached_data(&self) -> bool {
        self.inner.cache.get_data().is_some()
    }

    async fn load_entry(&self) -> Result<Option<LoadedEntry<T>>> {
        self.enqueue_load().await
    }

    async fn write(&self, data: T, source: WriteSource) -> Result<WriteOutcome<T>> {
        let this = self.clone();
        self.inner
            .storage
            .enqueue(async move { this.apply_replace(data, source).await })
            .await
    }
}
