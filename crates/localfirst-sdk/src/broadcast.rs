//! 跨标签页广播
//!
//! 每个页面（SDK 实例）一个 `ModelBroadcaster`，通过同源广播总线互相通知
//! "某个模型变了，请重新加载"。消息带发送方 id，收到自己发出的消息时忽略：
//! 本页的订阅者依赖缓存的同步通知，其他页依赖广播触发的重新加载。
//!
//! 总线不可用时退化为空实现，系统只剩单页行为，不会报错。

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::Unsubscribe;
use crate::config::SdkConfig;
use crate::events::{emit_opt, EventCategory, EventManager, EventPriority};
use crate::utils::now_millis;

/// 广播消息类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BroadcastMessageType {
    ModelPatched,
    ModelReplaced,
    ModelDeleted,
}

/// 广播消息：只是"有变化"的信号，不携带数据本身
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastMessage {
    pub sender_id: String,
    /// UTC 毫秒时间戳
    pub timestamp: i64,
    #[serde(rename = "type")]
    pub message_type: BroadcastMessageType,
    /// 模型名
    pub key: String,
}

/// 同源广播总线
///
/// 同一个总线的所有克隆共享一条频道，相当于浏览器中同名的 BroadcastChannel。
#[derive(Debug, Clone)]
pub struct CrossTabBus {
    name: String,
    sender: broadcast::Sender<BroadcastMessage>,
}

impl CrossTabBus {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            name: name.into(),
            sender,
        }
    }

    /// 按配置中的频道名与容量创建
    pub fn from_config(config: &SdkConfig) -> Self {
        Self::new(config.channel_name.clone(), config.broadcast_buffer_size)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn post(&self, message: BroadcastMessage) {
        // 没有其他页面在监听时 send 返回错误，属正常情况
        if self.sender.send(message).is_err() {
            debug!("广播无接收方: {}", self.name);
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<BroadcastMessage> {
        self.sender.subscribe()
    }
}

pub type BroadcastCallback = Arc<dyn Fn(&BroadcastMessage) + Send + Sync>;

type SubscriberMap = HashMap<String, Vec<(u64, BroadcastCallback)>>;

/// 模型广播器
pub struct ModelBroadcaster {
    sender_id: String,
    bus: Option<CrossTabBus>,
    subscribers: Arc<RwLock<SubscriberMap>>,
    next_subscriber_id: AtomicU64,
    shutdown: CancellationToken,
    events: Option<Arc<EventManager>>,
}

impl std::fmt::Debug for ModelBroadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelBroadcaster")
            .field("sender_id", &self.sender_id)
            .field("available", &self.is_available())
            .finish()
    }
}

impl ModelBroadcaster {
    /// 创建广播器
    ///
    /// `bus` 为 None，或当前不在 tokio 运行时中时，退化为空实现并发出诊断事件。
    pub fn new(bus: Option<CrossTabBus>, events: Option<Arc<EventManager>>) -> Self {
        let mut broadcaster = Self {
            sender_id: uuid::Uuid::new_v4().to_string(),
            bus: None,
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            next_subscriber_id: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
            events,
        };

        let reason = match bus {
            None => Some("broadcast channel unavailable"),
            Some(bus) => match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    broadcaster.spawn_listener(&handle, &bus);
                    broadcaster.bus = Some(bus);
                    None
                }
                Err(_) => Some("no async runtime to listen on broadcast channel"),
            },
        };

        match reason {
            Some(reason) => {
                warn!("跨标签页广播不可用，退化为单页模式: {}", reason);
                emit_opt(
                    &broadcaster.events,
                    EventCategory::System,
                    "broadcast-unavailable",
                    EventPriority::High,
                    serde_json::json!({ "reason": reason }),
                );
            }
            None => info!("跨标签页广播已启用 (sender_id={})", broadcaster.sender_id),
        }

        broadcaster
    }

    /// 不连接任何总线的空实现
    pub fn noop(events: Option<Arc<EventManager>>) -> Self {
        Self::new(None, events)
    }

    pub fn sender_id(&self) -> &str {
        &self.sender_id
    }

    pub fn is_available(&self) -> bool {
        self.bus.is_some()
    }

    fn spawn_listener(&self, handle: &tokio::runtime::Handle, bus: &CrossTabBus) {
        let mut receiver = bus.subscribe();
        let subscribers: Weak<RwLock<SubscriberMap>> = Arc::downgrade(&self.subscribers);
        let own_id = self.sender_id.clone();
        let shutdown = self.shutdown.clone();
        let channel = bus.name().to_string();

        handle.spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    received = receiver.recv() => match received {
                        Ok(message) => message,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("广播接收落后，丢弃 {} 条消息，通知所有订阅者重新加载 ({})", skipped, channel);
                            let Some(subscribers) = subscribers.upgrade() else { break };
                            resync_all(&subscribers, &channel);
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                };

                let Some(subscribers) = subscribers.upgrade() else { break };
                dispatch(&subscribers, &own_id, &message);
            }
            debug!("广播监听已退出 ({})", channel);
        });
    }

    /// 广播模型变化
    pub fn broadcast(&self, message_type: BroadcastMessageType, key: &str) {
        let Some(bus) = &self.bus else { return };
        let message = BroadcastMessage {
            sender_id: self.sender_id.clone(),
            timestamp: now_millis(),
            message_type,
            key: key.to_string(),
        };
        debug!("广播 {:?} -> {}", message_type, key);
        bus.post(message);
    }

    /// 订阅某个模型名的变化
    pub fn subscribe<F>(&self, key: &str, callback: F) -> Unsubscribe
    where
        F: Fn(&BroadcastMessage) + Send + Sync + 'static,
    {
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .write()
            .entry(key.to_string())
            .or_default()
            .push((id, Arc::new(callback)));

        let weak = Arc::downgrade(&self.subscribers);
        let key = key.to_string();
        Unsubscribe::new(move || {
            if let Some(subscribers) = weak.upgrade() {
                let mut map = subscribers.write();
                if let Some(list) = map.get_mut(&key) {
                    list.retain(|(sid, _)| *sid != id);
                    if list.is_empty() {
                        map.remove(&key);
                    }
                }
            }
        })
    }

    pub fn subscriber_count(&self, key: &str) -> usize {
        self.subscribers.read().get(key).map(|l| l.len()).unwrap_or(0)
    }

    /// 直接投递一条消息（与从总线收到等价），用于接入外部通道
    pub fn handle_message(&self, message: &BroadcastMessage) {
        dispatch(&self.subscribers, &self.sender_id, message);
    }
}

impl Drop for ModelBroadcaster {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn dispatch(subscribers: &RwLock<SubscriberMap>, own_id: &str, message: &BroadcastMessage) {
    if message.sender_id == own_id {
        return;
    }

    let targets: Vec<BroadcastCallback> = subscribers
        .read()
        .get(&message.key)
        .map(|list| list.iter().map(|(_, cb)| cb.clone()).collect())
        .unwrap_or_default();

    for callback in targets {
        if catch_unwind(AssertUnwindSafe(|| callback(message))).is_err() {
            error!("广播订阅者回调 panic (key={})", message.key);
        }
    }
}

/// 丢失消息后无法知道哪些模型变了，按"已替换"通知每个订阅的模型
fn resync_all(subscribers: &RwLock<SubscriberMap>, channel: &str) {
    let keys: Vec<String> = subscribers.read().keys().cloned().collect();
    for key in keys {
        let message = BroadcastMessage {
            sender_id: format!("{}:resync", channel),
            timestamp: now_millis(),
            message_type: BroadcastMessageType::ModelReplaced,
            key,
        };
        dispatch(subscribers, "", &message);
    }
}
