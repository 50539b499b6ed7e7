//! 事件系统模块 - 离线队列的状态广播
//!
//! 功能包括：
//! - 队列变更事件（每次 QueueStore 写操作后发出）
//! - 同步开始 / 进度 / 完成事件
//! - 丢弃与重试调度事件
//! - 引擎阶段切换事件
//!
//! 事件投递为 at-least-once：订阅方应当按"重新推导状态"的方式处理，
//! 而不是累加增量，重复事件不应造成影响。

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info};

use crate::sync::phase::{SyncPhase, TriggerSource};
use crate::sync::retry_policy::{DropReason, FailureKind};

/// 事件命名空间，避免与宿主其它通知冲突
pub const EVENT_NAMESPACE: &str = "offline_queue";

/// 离线队列事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    /// 队列发生变更，count 为该 owner 当前待处理数量
    QueueUpdated {
        owner_id: String,
        count: usize,
        timestamp: u64,
    },
    /// 开始一轮同步
    SyncStarted {
        owner_id: String,
        total: usize,
        source: TriggerSource,
        timestamp: u64,
    },
    /// 一条记录到达终态（成功或丢弃）
    SyncProgress {
        owner_id: String,
        item_id: String,
        processed: usize,
        total: usize,
        timestamp: u64,
    },
    /// 一轮同步结束（清空、进入退避或被放弃）
    SyncCompleted {
        owner_id: String,
        succeeded: usize,
        dropped: usize,
        remaining: usize,
        timestamp: u64,
    },
    /// 记录被丢弃，用户的操作已丢失
    ItemDropped {
        owner_id: String,
        item_id: String,
        reason: DropReason,
        failure: FailureKind,
        message: String,
        attempts: u32,
        timestamp: u64,
    },
    /// 已安排退避重试
    RetryScheduled {
        owner_id: String,
        item_id: String,
        attempt: u32,
        delay_ms: u64,
        timestamp: u64,
    },
    /// 引擎阶段切换
    PhaseChanged {
        from: SyncPhase,
        to: SyncPhase,
        timestamp: u64,
    },
}

impl SyncEvent {
    /// 获取事件类型字符串（带命名空间）
    pub fn event_type(&self) -> &'static str {
        match self {
            SyncEvent::QueueUpdated { .. } => "offline_queue.queue_updated",
            SyncEvent::SyncStarted { .. } => "offline_queue.sync_start",
            SyncEvent::SyncProgress { .. } => "offline_queue.sync_progress",
            SyncEvent::SyncCompleted { .. } => "offline_queue.sync_complete",
            SyncEvent::ItemDropped { .. } => "offline_queue.item_dropped",
            SyncEvent::RetryScheduled { .. } => "offline_queue.retry_scheduled",
            SyncEvent::PhaseChanged { .. } => "offline_queue.phase_changed",
        }
    }

    /// 获取事件关联的 owner
    pub fn owner_id(&self) -> Option<&str> {
        match self {
            SyncEvent::QueueUpdated { owner_id, .. }
            | SyncEvent::SyncStarted { owner_id, .. }
            | SyncEvent::SyncProgress { owner_id, .. }
            | SyncEvent::SyncCompleted { owner_id, .. }
            | SyncEvent::ItemDropped { owner_id, .. }
            | SyncEvent::RetryScheduled { owner_id, .. } => Some(owner_id),
            SyncEvent::PhaseChanged { .. } => None,
        }
    }

    /// 获取事件时间戳（UTC 毫秒）
    pub fn timestamp(&self) -> u64 {
        match self {
            SyncEvent::QueueUpdated { timestamp, .. }
            | SyncEvent::SyncStarted { timestamp, .. }
            | SyncEvent::SyncProgress { timestamp, .. }
            | SyncEvent::SyncCompleted { timestamp, .. }
            | SyncEvent::ItemDropped { timestamp, .. }
            | SyncEvent::RetryScheduled { timestamp, .. }
            | SyncEvent::PhaseChanged { timestamp, .. } => *timestamp,
        }
    }
}

/// 当前 UTC 毫秒时间戳
pub(crate) fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// 事件过滤器
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventFilter {
    /// 事件类型过滤器
    pub event_types: Option<Vec<String>>,
    /// owner 过滤器
    pub owner_ids: Option<Vec<String>>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_event_types(mut self, event_types: Vec<String>) -> Self {
        self.event_types = Some(event_types);
        self
    }

    pub fn with_owner_ids(mut self, owner_ids: Vec<String>) -> Self {
        self.owner_ids = Some(owner_ids);
        self
    }

    /// 检查事件是否匹配过滤器
    pub fn matches(&self, event: &SyncEvent) -> bool {
        if let Some(ref types) = self.event_types {
            if !types.iter().any(|t| t == event.event_type()) {
                return false;
            }
        }

        if let Some(ref owner_ids) = self.owner_ids {
            match event.owner_id() {
                Some(owner_id) => {
                    if !owner_ids.iter().any(|o| o == owner_id) {
                        return false;
                    }
                }
                None => return false, // 事件没有 owner 但过滤器要求有
            }
        }

        true
    }
}

/// 事件监听器类型
pub type EventListener = Arc<dyn Fn(&SyncEvent) + Send + Sync>;

/// 监听器句柄，用于取消订阅
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// 事件统计信息
#[derive(Debug, Clone, Default)]
pub struct EventStats {
    pub total_events: u64,
    pub events_by_type: HashMap<String, u64>,
    pub listener_count: usize,
    pub last_event_time: Option<u64>,
}

/// 事件总线
pub struct EventBus {
    sender: broadcast::Sender<SyncEvent>,
    /// 事件类型 -> 监听器列表，"*" 表示全部事件
    listeners: RwLock<HashMap<String, Vec<(ListenerId, EventListener)>>>,
    next_listener_id: AtomicU64,
    stats: RwLock<EventStats>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));

        Self {
            sender,
            listeners: RwLock::new(HashMap::new()),
            next_listener_id: AtomicU64::new(1),
            stats: RwLock::new(EventStats::default()),
        }
    }

    /// 发布事件
    pub async fn emit(&self, event: SyncEvent) {
        debug!("Emitting event: {}", event.event_type());

        {
            let mut stats = self.stats.write().await;
            stats.total_events += 1;
            *stats.events_by_type.entry(event.event_type().to_string()).or_insert(0) += 1;
            stats.last_event_time = Some(event.timestamp());
        }

        // 无订阅者时 send 会失败，属正常场景
        if let Err(e) = self.sender.send(event.clone()) {
            debug!("Failed to broadcast event (no active receivers): {}", e);
        }

        let listeners = self.listeners.read().await;
        if let Some(event_listeners) = listeners.get(event.event_type()) {
            for (_, listener) in event_listeners {
                listener(&event);
            }
        }
        if let Some(general_listeners) = listeners.get("*") {
            for (_, listener) in general_listeners {
                listener(&event);
            }
        }
    }

    /// 订阅全部事件
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    /// 订阅过滤后的事件
    pub fn subscribe_filtered(&self, filter: EventFilter) -> FilteredEventReceiver {
        FilteredEventReceiver::new(self.sender.subscribe(), filter)
    }

    /// 添加事件监听器，event_type 传 "*" 监听全部事件
    pub async fn add_listener<F>(&self, event_type: &str, listener: F) -> ListenerId
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_listener_id.fetch_add(1, Ordering::Relaxed));
        let mut listeners = self.listeners.write().await;
        listeners
            .entry(event_type.to_string())
            .or_default()
            .push((id, Arc::new(listener)));

        let mut stats = self.stats.write().await;
        stats.listener_count = listeners.values().map(|v| v.len()).sum();

        info!("Added listener {:?} for event type: {}", id, event_type);
        id
    }

    /// 移除监听器，返回是否找到
    pub async fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write().await;
        let mut removed = false;
        for entries in listeners.values_mut() {
            let before = entries.len();
            entries.retain(|(entry_id, _)| *entry_id != id);
            removed |= entries.len() != before;
        }
        listeners.retain(|_, entries| !entries.is_empty());

        let mut stats = self.stats.write().await;
        stats.listener_count = listeners.values().map(|v| v.len()).sum();
        removed
    }

    /// 移除所有监听器
    pub async fn clear_listeners(&self) {
        let mut listeners = self.listeners.write().await;
        listeners.clear();

        let mut stats = self.stats.write().await;
        stats.listener_count = 0;

        info!("Cleared all event listeners");
    }

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
    receiver: broadcast::Receiver<SyncEvent>,
    filter: EventFilter,
}

impl FilteredEventReceiver {
    pub fn new(receiver: broadcast::Receiver<SyncEvent>, filter: EventFilter) -> Self {
        Self { receiver, filter }
    }

    /// 接收下一个匹配的事件
    pub async fn recv(&mut self) -> Result<SyncEvent, broadcast::error::RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }

    /// 尝试接收事件（非阻塞）
    pub fn try_recv(&mut self) -> Result<SyncEvent, broadcast::error::TryRecvError> {
        loop {
            let event = self.receiver.try_recv()?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }
}
