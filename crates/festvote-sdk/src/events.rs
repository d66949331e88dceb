//! 事件系统模块 - 同步层对外的通知通道
//!
//! 功能包括：
//! - 连接状态变更
//! - 缓存失效 / 查询刷新
//! - 乐观写入提交与失败（UI 的 toast 信号）
//! - 离线队列长度与回放结果
//! - 推送通道状态
//! - 事件广播和订阅机制

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::cache::DataSource;
use crate::subscription::ChannelStatus;
use crate::utils::now_millis;

/// 离线写入回放结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplayOutcome {
    /// 服务端已确认，条目移除
    Applied,
    /// 目标已在服务端删除，条目移除
    Dropped,
    /// 暂时失败，条目保留到下一次重连
    Deferred,
}

/// SDK 事件类型
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SDKEvent {
    /// 网络连接状态变更
    ConnectivityChanged {
        online: bool,
        timestamp: i64,
    },
    /// 某个 topic 的缓存被推送失效（已去抖）
    TopicInvalidated {
        topic: String,
        keys: usize,
        timestamp: i64,
    },
    /// 查询结果已刷新
    QueryRefreshed {
        key: String,
        data_source: DataSource,
        items: usize,
        timestamp: i64,
    },
    /// 乐观写入失败并已回滚
    MutationFailed {
        key: String,
        operation: String,
        error: String,
        timestamp: i64,
    },
    /// 乐观写入已被服务端确认
    MutationCommitted {
        key: String,
        operation: String,
        timestamp: i64,
    },
    /// 离线队列长度变化
    QueueSizeChanged {
        size: usize,
        timestamp: i64,
    },
    /// 离线写入回放
    PendingWriteReplayed {
        write_id: String,
        operation: String,
        outcome: ReplayOutcome,
        timestamp: i64,
    },
    /// 本地持久化降级为仅在线模式（只发一次）
    StorageDegraded {
        reason: String,
        timestamp: i64,
    },
    /// 推送通道状态变更
    SubscriptionStateChanged {
        topic: String,
        old_status: ChannelStatus,
        new_status: ChannelStatus,
        timestamp: i64,
    },
}

impl SDKEvent {
    /// 获取事件类型字符串
    pub fn event_type(&self) -> &'static str {
        match self {
            SDKEvent::ConnectivityChanged { .. } => "connectivity_changed",
            SDKEvent::TopicInvalidated { .. } => "topic_invalidated",
            SDKEvent::QueryRefreshed { .. } => "query_refreshed",
            SDKEvent::MutationFailed { .. } => "mutation_failed",
            SDKEvent::MutationCommitted { .. } => "mutation_committed",
            SDKEvent::QueueSizeChanged { .. } => "queue_size_changed",
            SDKEvent::PendingWriteReplayed { .. } => "pending_write_replayed",
            SDKEvent::StorageDegraded { .. } => "storage_degraded",
            SDKEvent::SubscriptionStateChanged { .. } => "subscription_state_changed",
        }
    }

    /// 获取事件关联的 topic
    pub fn topic(&self) -> Option<&str> {
        match self {
            SDKEvent::TopicInvalidated { topic, .. } => Some(topic),
            SDKEvent::SubscriptionStateChanged { topic, .. } => Some(topic),
            SDKEvent::QueryRefreshed { key, .. }
            | SDKEvent::MutationFailed { key, .. }
            | SDKEvent::MutationCommitted { key, .. } => key.split(':').next(),
            _ => None,
        }
    }

    /// 获取事件时间戳（毫秒）
    pub fn timestamp(&self) -> i64 {
        match self {
            SDKEvent::ConnectivityChanged { timestamp, .. }
            | SDKEvent::TopicInvalidated { timestamp, .. }
            | SDKEvent::QueryRefreshed { timestamp, .. }
            | SDKEvent::MutationFailed { timestamp, .. }
            | SDKEvent::MutationCommitted { timestamp, .. }
            | SDKEvent::QueueSizeChanged { timestamp, .. }
            | SDKEvent::PendingWriteReplayed { timestamp, .. }
            | SDKEvent::StorageDegraded { timestamp, .. }
            | SDKEvent::SubscriptionStateChanged { timestamp, .. } => *timestamp,
        }
    }
}

/// 事件过滤器
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventFilter {
    /// 事件类型过滤器
    pub event_types: Option<Vec<String>>,
    /// topic 过滤器
    pub topics: Option<Vec<String>>,
}

impl EventFilter {
    /// 创建新的事件过滤器
    pub fn new() -> Self {
        Self::default()
    }

    /// 添加事件类型过滤
    pub fn with_event_types(mut self, event_types: Vec<String>) -> Self {
        self.event_types = Some(event_types);
        self
    }

    /// 添加 topic 过滤
    pub fn with_topics(mut self, topics: Vec<String>) -> Self {
        self.topics = Some(topics);
        self
    }

    /// 检查事件是否匹配过滤器
    pub fn matches(&self, event: &SDKEvent) -> bool {
        if let Some(ref types) = self.event_types {
            if !types.iter().any(|t| t == event.event_type()) {
                return false;
            }
        }

        if let Some(ref topics) = self.topics {
            match event.topic() {
                Some(topic) => {
                    if !topics.iter().any(|t| t == topic) {
                        return false;
                    }
                }
                None => return false, // 事件没有 topic 但过滤器要求有
            }
        }

        true
    }
}

/// 事件监听器类型
pub type EventListener = Box<dyn Fn(&SDKEvent) + Send + Sync>;

/// 事件管理器
pub struct EventManager {
    /// 广播发送器
    sender: broadcast::Sender<SDKEvent>,
    /// 事件监听器映射
    listeners: Arc<tokio::sync::RwLock<HashMap<String, Vec<EventListener>>>>,
    /// 事件统计
    stats: Arc<tokio::sync::RwLock<EventStats>>,
}

/// 事件统计信息
#[derive(Debug, Clone, Default)]
pub struct EventStats {
    /// 总事件数
    pub total_events: u64,
    /// 按类型分组的事件数
    pub events_by_type: HashMap<String, u64>,
    /// 监听器数量
    pub listener_count: usize,
    /// 最后事件时间
    pub last_event_time: Option<i64>,
}

impl EventManager {
    /// 创建新的事件管理器
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));

        Self {
            sender,
            listeners: Arc::new(tokio::sync::RwLock::new(HashMap::new())),
            stats: Arc::new(tokio::sync::RwLock::new(EventStats::default())),
        }
    }

    /// 发布事件
    pub async fn emit(&self, event: SDKEvent) {
        debug!("Emitting event: {}", event.event_type());

        // 更新统计
        {
            let mut stats = self.stats.write().await;
            stats.total_events += 1;
            *stats.events_by_type.entry(event.event_type().to_string()).or_insert(0) += 1;
            stats.last_event_time = Some(event.timestamp());
        }

        // 广播事件（无订阅者时 send 会失败，属正常场景，仅打 debug）
        if let Err(e) = self.sender.send(event.clone()) {
            debug!("Failed to broadcast event (no active receivers): {}", e);
        }

        // 调用监听器
        let listeners = self.listeners.read().await;
        if let Some(event_listeners) = listeners.get(event.event_type()) {
            for listener in event_listeners {
                listener(&event);
            }
        }

        // 调用通用监听器
        if let Some(general_listeners) = listeners.get("*") {
            for listener in general_listeners {
                listener(&event);
            }
        }
    }

    /// 订阅事件
    pub fn subscribe(&self) -> broadcast::Receiver<SDKEvent> {
        self.sender.subscribe()
    }

    /// 订阅特定类型的事件
    pub fn subscribe_filtered(&self, filter: EventFilter) -> FilteredEventReceiver {
        FilteredEventReceiver::new(self.sender.subscribe(), filter)
    }

    /// 添加事件监听器，`event_type` 为 "*" 时监听全部事件
    pub async fn add_listener<F>(&self, event_type: &str, listener: F)
    where
        F: Fn(&SDKEvent) + Send + Sync + 'static,
    {
        let mut listeners = self.listeners.write().await;
        listeners.entry(event_type.to_string()).or_default().push(Box::new(listener));

        // 更新监听器统计
        let mut stats = self.stats.write().await;
        stats.listener_count = listeners.values().map(|v| v.len()).sum();

        info!("Added listener for event type: {}", event_type);
    }

    /// 移除所有监听器
    pub async fn clear_listeners(&self) {
        let mut listeners = self.listeners.write().await;
        listeners.clear();

        let mut stats = self.stats.write().await;
        stats.listener_count = 0;

        info!("Cleared all event listeners");
    }

    /// 获取事件统计
    pub async fn get_stats(&self) -> EventStats {
        self.stats.read().await.clone()
    }

    /// 获取活跃订阅者数量
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// 过滤事件接收器
pub struct FilteredEventReceiver {
    receiver: broadcast::Receiver<SDKEvent>,
    filter: EventFilter,
}

impl FilteredEventReceiver {
    /// 创建新的过滤事件接收器
    pub fn new(receiver: broadcast::Receiver<SDKEvent>, filter: EventFilter) -> Self {
        Self { receiver, filter }
    }

    /// 接收下一个匹配的事件
    pub async fn recv(&mut self) -> Result<SDKEvent, broadcast::error::RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }

    /// 尝试接收事件（非阻塞）
    pub fn try_recv(&mut self) -> Result<SDKEvent, broadcast::error::TryRecvError> {
        loop {
            let event = self.receiver.try_recv()?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }
}

/// 事件生成器 - 辅助函数
pub mod event_builders {
    use super::*;

    pub fn connectivity_changed(online: bool) -> SDKEvent {
        SDKEvent::ConnectivityChanged {
            online,
            timestamp: now_millis(),
        }
    }

    pub fn topic_invalidated(topic: &str, keys: usize) -> SDKEvent {
        SDKEvent::TopicInvalidated {
            topic: topic.to_string(),
            keys,
            timestamp: now_millis(),
        }
    }

    pub fn query_refreshed(key: &str, data_source: DataSource, items: usize) -> SDKEvent {
        SDKEvent::QueryRefreshed {
            key: key.to_string(),
            data_source,
            items,
            timestamp: now_millis(),
        }
    }

    pub fn mutation_failed(key: &str, operation: &str, error: &str) -> SDKEvent {
        SDKEvent::MutationFailed {
            key: key.to_string(),
            operation: operation.to_string(),
            error: error.to_string(),
            timestamp: now_millis(),
        }
    }

    pub fn mutation_committed(key: &str, operation: &str) -> SDKEvent {
        SDKEvent::MutationCommitted {
            key: key.to_string(),
            operation: operation.to_string(),
            timestamp: now_millis(),
        }
    }

    pub fn queue_size_changed(size: usize) -> SDKEvent {
        SDKEvent::QueueSizeChanged {
            size,
            timestamp: now_millis(),
        }
    }

    pub fn pending_write_replayed(write_id: &str, operation: &str, outcome: ReplayOutcome) -> SDKEvent {
        SDKEvent::PendingWriteReplayed {
            write_id: write_id.to_string(),
            operation: operation.to_string(),
            outcome,
            timestamp: now_millis(),
        }
    }

    pub fn storage_degraded(reason: &str) -> SDKEvent {
        SDKEvent::StorageDegraded {
            reason: reason.to_string(),
            timestamp: now_millis(),
        }
    }

    pub fn subscription_state_changed(topic: &str, old_status: ChannelStatus, new_status: ChannelStatus) -> SDKEvent {
        SDKEvent::SubscriptionStateChanged {
            topic: topic.to_string(),
            old_status,
            new_status,
            timestamp: now_millis(),
        }
    }
}
