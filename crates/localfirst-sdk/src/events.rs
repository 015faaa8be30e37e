//! 事件系统模块 - 结构化可观测事件
//!
//! 核心在关键状态变化处发出事件（model / tx / system 三类），
//! 供 devtools 面板等外部观察者订阅。发送是"发出即忘"的：
//! 没有订阅者、监听器 panic 都不会影响核心逻辑。

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use crate::utils::now_millis;

/// 事件类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventCategory {
    Model,
    Tx,
    System,
}

impl EventCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventCategory::Model => "model",
            EventCategory::Tx => "tx",
            EventCategory::System => "system",
        }
    }
}

/// 事件优先级
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventPriority {
    Low,
    Normal,
    High,
    Critical,
}

/// SDK 事件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SdkEvent {
    pub id: String,
    pub category: EventCategory,
    #[serde(rename = "type")]
    pub event_type: String,
    /// UTC 毫秒时间戳
    pub timestamp: i64,
    pub priority: EventPriority,
    pub data: serde_json::Value,
}

impl SdkEvent {
    pub fn new(category: EventCategory, event_type: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            category,
            event_type: event_type.into(),
            timestamp: now_millis(),
            priority: EventPriority::Normal,
            data,
        }
    }

    pub fn with_priority(mut self, priority: EventPriority) -> Self {
        self.priority = priority;
        self
    }

    /// 监听器注册用的 key，例如 `model:patch`
    pub fn qualified_type(&self) -> String {
        format!("{}:{}", self.category.as_str(), self.event_type)
    }
}

/// 事件过滤器
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventFilter {
    /// 事件类别过滤器
    pub categories: Option<Vec<EventCategory>>,
    /// 事件类型过滤器
    pub event_types: Option<Vec<String>>,
    /// 最低优先级
    pub min_priority: Option<EventPriority>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_categories(mut self, categories: Vec<EventCategory>) -> Self {
        self.categories = Some(categories);
        self
    }

    pub fn with_event_types(mut self, event_types: Vec<String>) -> Self {
        self.event_types = Some(event_types);
        self
    }

    pub fn with_min_priority(mut self, priority: EventPriority) -> Self {
        self.min_priority = Some(priority);
        self
    }

    /// 检查事件是否匹配过滤器
    pub fn matches(&self, event: &SdkEvent) -> bool {
        if let Some(ref categories) = self.categories {
            if !categories.contains(&event.category) {
                return false;
            }
        }

        if let Some(ref types) = self.event_types {
            if !types.iter().any(|t| t == &event.event_type) {
                return false;
            }
        }

        if let Some(min) = self.min_priority {
            if event.priority < min {
                return false;
            }
        }

        true
    }
}

/// 事件监听器类型
pub type EventListener = Arc<dyn Fn(&SdkEvent) + Send + Sync>;

/// 事件统计信息
#[derive(Debug, Clone, Default)]
pub struct EventStats {
    /// 总事件数
    pub total_events: u64,
    /// 按类型分组的事件数（key 为 `category:type`）
    pub events_by_type: HashMap<String, u64>,
    /// 监听器数量
    pub listener_count: usize,
    /// 最后事件时间
    pub last_event_time: Option<i64>,
}

/// 事件管理器
pub struct EventManager {
    sender: broadcast::Sender<SdkEvent>,
    /// key 为 `category:type` 或 `"*"`
    listeners: RwLock<HashMap<String, Vec<EventListener>>>,
    stats: RwLock<EventStats>,
}

impl std::fmt::Debug for EventManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventManager")
            .field("subscribers", &self.sender.receiver_count())
            .field("stats", &*self.stats.read())
            .finish()
    }
}

impl EventManager {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            listeners: RwLock::new(HashMap::new()),
            stats: RwLock::new(EventStats::default()),
        }
    }

    /// 发布事件
    pub fn emit(&self, event: SdkEvent) {
        debug!("Emitting event: {}", event.qualified_type());

        {
            let mut stats = self.stats.write();
            stats.total_events += 1;
            *stats.events_by_type.entry(event.qualified_type()).or_insert(0) += 1;
            stats.last_event_time = Some(event.timestamp);
        }

        // 无订阅者时 send 会失败，属正常场景
        if let Err(e) = self.sender.send(event.clone()) {
            debug!("Failed to broadcast event (no active receivers): {}", e);
        }

        // 复制一份监听器列表，回调期间不持有锁
        let targets: Vec<EventListener> = {
            let listeners = self.listeners.read();
            let mut targets = Vec::new();
            if let Some(typed) = listeners.get(&event.qualified_type()) {
                targets.extend(typed.iter().cloned());
            }
            if let Some(general) = listeners.get("*") {
                targets.extend(general.iter().cloned());
            }
            targets
        };

        for listener in targets {
            if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                error!("Event listener panicked on {}", event.qualified_type());
            }
        }
    }

    /// 便捷方法：构造并发布事件
    pub fn emit_with(
        &self,
        category: EventCategory,
        event_type: &str,
        priority: EventPriority,
        data: serde_json::Value,
    ) {
        self.emit(SdkEvent::new(category, event_type, data).with_priority(priority));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SdkEvent> {
        self.sender.subscribe()
    }

    pub fn subscribe_filtered(&self, filter: EventFilter) -> FilteredEventReceiver {
        FilteredEventReceiver::new(self.sender.subscribe(), filter)
    }

    /// 添加事件监听器，`key` 为 `category:type`（如 `model:patch`）或 `"*"`
    pub fn add_listener<F>(&self, key: &str, listener: F)
    where
        F: Fn(&SdkEvent) + Send + Sync + 'static,
    {
        let mut listeners = self.listeners.write();
        listeners.entry(key.to_string()).or_default().push(Arc::new(listener));

        let mut stats = self.stats.write();
        stats.listener_count = listeners.values().map(|v| v.len()).sum();

        info!("Added listener for event type: {}", key);
    }

    pub fn clear_listeners(&self) {
        self.listeners.write().clear();
        self.stats.write().listener_count = 0;
        info!("Cleared all event listeners");
    }

    pub fn get_stats(&self) -> EventStats {
        self.stats.read().clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventManager {
    fn default() -> Self {
        Self::new(1000)
    }
}

/// 过滤事件接收器
pub struct FilteredEventReceiver {
    receiver: broadcast::Receiver<SdkEvent>,
    filter: EventFilter,
}

impl FilteredEventReceiver {
    pub fn new(receiver: broadcast::Receiver<SdkEvent>, filter: EventFilter) -> Self {
        Self { receiver, filter }
    }

    /// 接收下一个匹配的事件
    pub async fn recv(&mut self) -> Result<SdkEvent, broadcast::error::RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }

    /// 尝试接收事件（非阻塞）
    pub fn try_recv(&mut self) -> Result<SdkEvent, broadcast::error::TryRecvError> {
        loop {
            let event = self.receiver.try_recv()?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }
}

/// 可选的事件出口：组件持有 `Option<Arc<EventManager>>` 时使用
pub(crate) fn emit_opt(
    events: &Option<Arc<EventManager>>,
    category: EventCategory,
    event_type: &str,
    priority: EventPriority,
    data: serde_json::Value,
) {
    if let Some(events) = events {
        events.emit_with(category, event_type, priority, data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_event_manager_basic_functionality() {
        let manager = EventManager::new(100);
        let mut receiver = manager.subscribe();

        manager.emit_with(EventCategory::Model, "patch", EventPriority::Normal, json!({"key": "cart"}));

        let received = receiver.recv().await.unwrap();
        assert_eq!(received.category, EventCategory::Model);
        assert_eq!(received.event_type, "patch");
        assert_eq!(received.data["key"], "cart");

        let stats = manager.get_stats();
        assert_eq!(stats.total_events, 1);
        assert_eq!(stats.events_by_type.get("model:patch"), Some(&1));
    }

    #[tokio::test]
    async fn test_event_filter() {
        let manager = EventManager::new(100);
        let filter = EventFilter::new()
            .with_categories(vec![EventCategory::Tx])
            .with_min_priority(EventPriority::High);
        let mut filtered = manager.subscribe_filtered(filter);

        manager.emit_with(EventCategory::Model, "patch", EventPriority::Critical, json!({}));
        manager.emit_with(EventCategory::Tx, "step-start", EventPriority::Low, json!({}));
        manager.emit_with(EventCategory::Tx, "compensation-failed", EventPriority::Critical, json!({}));

        let event = filtered.recv().await.unwrap();
        assert_eq!(event.event_type, "compensation-failed");
        assert!(filtered.try_recv().is_err());
    }

    #[test]
    fn test_listeners_and_panic_isolation() {
        let manager = EventManager::new(10);
        let counter = Arc::new(AtomicUsize::new(0));

        manager.add_listener("system:broadcast-unavailable", |_| panic!("bad listener"));
        let c = counter.clone();
        manager.add_listener("*", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        // 没有 receiver 也不能失败
        manager.emit_with(EventCategory::System, "broadcast-unavailable", EventPriority::High, json!({}));
        manager.emit_with(EventCategory::Model, "load", EventPriority::Low, json!({}));

        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(manager.get_stats().listener_count, 2);

        manager.clear_listeners();
        assert_eq!(manager.get_stats().listener_count, 0);
    }

    #[test]
    fn test_event_serialization_shape() {
        let event = SdkEvent::new(EventCategory::Tx, "commit", json!({"id": "tx-1"}))
            .with_priority(EventPriority::High);
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["category"], "tx");
        assert_eq!(value["type"], "commit");
        assert_eq!(value["priority"], "high");
        assert!(value["timestamp"].as_i64().unwrap() > 0);
        assert!(!value["id"].as_str().unwrap().is_empty());
    }
}
