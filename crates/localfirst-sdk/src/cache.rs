//! 缓存管理 - 模型的内存状态机
//!
//! 功能包括：
//! - `loading | success | error` 三态
//! - 派生的新鲜度信息（ModelHistory）
//! - 引用稳定的组合快照：字段无变化时返回同一个 `Arc`
//! - 订阅者同步通知，单个订阅者 panic 不影响其他订阅者

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::error;

use crate::error::LocalFirstError;
use crate::utils::{age_millis, now_millis};

/// 缓存状态
#[derive(Debug, Clone)]
pub enum CacheState<T> {
    Loading,
    Success(T),
    Error(LocalFirstError),
}

/// 缓存状态标签
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheStatus {
    Loading,
    Success,
    Error,
}

impl<T> CacheState<T> {
    pub fn status(&self) -> CacheStatus {
        match self {
            CacheState::Loading => CacheStatus::Loading,
            CacheState::Success(_) => CacheStatus::Success,
            CacheState::Error(_) => CacheStatus::Error,
        }
    }
}

/// 新鲜度信息（派生，不持久化）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelHistory {
    /// 最后写入时间（UTC 毫秒），0 表示从未写入
    pub updated_at: i64,
    /// 距最后写入的毫秒数，从未写入时为无穷大
    pub age: f64,
    pub is_stale: bool,
    pub is_conflicted: bool,
}

impl ModelHistory {
    /// 根据写入时间与 TTL 计算
    pub fn compute(updated_at: i64, ttl_ms: u64, is_conflicted: bool, now: i64) -> Self {
        let age = age_millis(updated_at, now);
        Self {
            updated_at,
            age,
            is_stale: age >= ttl_ms as f64,
            is_conflicted,
        }
    }

    /// 从未写入过的状态
    pub fn empty() -> Self {
        Self {
            updated_at: 0,
            age: f64::INFINITY,
            is_stale: true,
            is_conflicted: false,
        }
    }
}

/// 组合快照
///
/// `history.age` 是快照生成时的值；实时新鲜度请用 `CacheManager::get_history`。
#[derive(Debug, Clone)]
pub struct CombinedSnapshot<T> {
    pub data: Option<T>,
    pub status: CacheStatus,
    pub error: Option<LocalFirstError>,
    pub history: ModelHistory,
}

impl<T: PartialEq> CombinedSnapshot<T> {
    fn same_as(&self, other: &CombinedSnapshot<T>) -> bool {
        self.data == other.data
            && self.status == other.status
            && self.error.as_ref().map(|e| e.to_string()) == other.error.as_ref().map(|e| e.to_string())
            && self.history.updated_at == other.history.updated_at
            && self.history.is_stale == other.history.is_stale
            && self.history.is_conflicted == other.history.is_conflicted
    }
}

type Subscriber = Arc<dyn Fn() + Send + Sync>;

struct CacheInner<T> {
    state: CacheState<T>,
    updated_at: i64,
    is_conflicted: bool,
    snapshot: Arc<CombinedSnapshot<T>>,
}

pub struct CacheManager<T> {
    ttl_ms: u64,
    inner: RwLock<CacheInner<T>>,
    subscribers: Arc<Mutex<Vec<(u64, Subscriber)>>>,
    next_subscriber_id: AtomicU64,
}

impl<T> CacheManager<T>
where
    T: Clone + PartialEq + Send + Sync + 'static,
{
    pub fn new(ttl_ms: u64) -> Self {
        Self {
            ttl_ms,
            inner: RwLock::new(CacheInner {
                state: CacheState::Loading,
                updated_at: 0,
                is_conflicted: false,
                snapshot: Arc::new(CombinedSnapshot {
                    data: None,
                    status: CacheStatus::Loading,
                    error: None,
                    history: ModelHistory::empty(),
                }),
            }),
            subscribers: Arc::new(Mutex::new(Vec::new())),
            next_subscriber_id: AtomicU64::new(1),
        }
    }

    pub fn ttl_ms(&self) -> u64 {
        self.ttl_ms
    }

    /// 写入成功的数据，状态转为 success
    pub fn update_with_data(&self, data: T, updated_at: i64) {
        {
            let mut inner = self.inner.write();
            inner.state = CacheState::Success(data);
            inner.updated_at = updated_at;
            inner.is_conflicted = false;
            Self::rebuild_snapshot(&mut inner, self.ttl_ms);
        }
        self.notify();
    }

    /// 状态转为 error，保留最后一次的 updated_at
    pub fn update_with_error(&self, error: LocalFirstError) {
        {
            let mut inner = self.inner.write();
            inner.state = CacheState::Error(error);
            Self::rebuild_snapshot(&mut inner, self.ttl_ms);
        }
        self.notify();
    }

    /// 状态转为 loading（仅在没有缓存或数据被删除时使用）
    pub fn set_loading(&self) {
        {
            let mut inner = self.inner.write();
            inner.state = CacheState::Loading;
            inner.updated_at = 0;
            inner.is_conflicted = false;
            Self::rebuild_snapshot(&mut inner, self.ttl_ms);
        }
        self.notify();
    }

    /// 标记本地数据与后台拉取结果存在冲突
    pub fn mark_conflicted(&self) {
        let changed = {
            let mut inner = self.inner.write();
            if inner.is_conflicted {
                false
            } else {
                inner.is_conflicted = true;
                Self::rebuild_snapshot(&mut inner, self.ttl_ms)
            }
        };
        if changed {
            self.notify();
        }
    }

    /// 只有字段确实变化时才替换快照，返回是否替换
    fn rebuild_snapshot(inner: &mut CacheInner<T>, ttl_ms: u64) -> bool {
        let (data, error) = match &inner.state {
            CacheState::Loading => (None, None),
            CacheState::Success(data) => (Some(data.clone()), None),
            CacheState::Error(error) => (None, Some(error.clone())),
        };
        let history = if inner.updated_at > 0 {
            ModelHistory::compute(inner.updated_at, ttl_ms, inner.is_conflicted, now_millis())
        } else {
            ModelHistory {
                is_conflicted: inner.is_conflicted,
                ..ModelHistory::empty()
            }
        };
        let next = CombinedSnapshot {
            data,
            status: inner.state.status(),
            error,
            history,
        };
        if next.same_as(&inner.snapshot) {
            return false;
        }
        inner.snapshot = Arc::new(next);
        true
    }

    pub fn get_state(&self) -> CacheState<T> {
        self.inner.read().state.clone()
    }

    pub fn status(&self) -> CacheStatus {
        self.inner.read().state.status()
    }

    /// 当前数据（仅 success 状态）
    pub fn get_data(&self) -> Option<T> {
        match &self.inner.read().state {
            CacheState::Success(data) => Some(data.clone()),
            _ => None,
        }
    }

    pub fn get_error(&self) -> Option<LocalFirstError> {
        match &self.inner.read().state {
            CacheState::Error(error) => Some(error.clone()),
            _ => None,
        }
    }

    /// 按当前时间实时计算新鲜度
    pub fn get_history(&self) -> ModelHistory {
        let inner = self.inner.read();
        if inner.updated_at == 0 {
            return ModelHistory {
                is_conflicted: inner.is_conflicted,
                ..ModelHistory::empty()
            };
        }
        ModelHistory::compute(inner.updated_at, self.ttl_ms, inner.is_conflicted, now_millis())
    }

    /// 组合快照：字段未变化时返回同一个 Arc
    pub fn get_combined_snapshot(&self) -> Arc<CombinedSnapshot<T>> {
        self.inner.read().snapshot.clone()
    }

    /// 订阅变化，返回取消订阅句柄
    pub fn subscribe<F>(&self, callback: F) -> Unsubscribe
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().push((id, Arc::new(callback)));

        let weak: Weak<Mutex<Vec<(u64, Subscriber)>>> = Arc::downgrade(&self.subscribers);
        Unsubscribe::new(move || {
            if let Some(subscribers) = weak.upgrade() {
                subscribers.lock().retain(|(sid, _)| *sid != id);
            }
        })
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// 同步通知所有订阅者
    ///
    /// 遍历快照副本，回调期间不持有任何锁；每个回调独立捕获 panic。
    pub fn notify(&self) {
        let targets: Vec<Subscriber> = self.subscribers.lock().iter().map(|(_, cb)| cb.clone()).collect();
        for callback in targets {
            if catch_unwind(AssertUnwindSafe(|| callback())).is_err() {
                error!("缓存订阅者回调 panic，已跳过");
            }
        }
    }
}

/// 取消订阅句柄
///
/// 与回调注册对应，多次调用只生效一次；丢弃句柄不会取消订阅。
pub struct Unsubscribe {
    action: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Unsubscribe {
    pub fn new<F>(action: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            action: Mutex::new(Some(Box::new(action))),
        }
    }

    pub fn unsubscribe(&self) {
        if let Some(action) = self.action.lock().take() {
            action();
        }
    }
}

impl std::fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Unsubscribe")
            .field("active", &self.action.lock().is_some())
            .finish()
    }
}
