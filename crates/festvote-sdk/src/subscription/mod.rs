//! 推送订阅管理
//!
//! 每个 topic 最多一条推送通道，状态机：
//! `Idle -> Connecting -> Subscribed -> (Error -> Connecting | Idle)`
//!
//! - 通道建立后，变更事件经去抖合并为一次缓存失效
//! - 重复订阅同一 topic 会先拆除旧通道
//! - 断网时全部拆除（记住需要的 topic），恢复后重新建立
//! - `Error` 只能通过一次新的 `Connecting` 恢复，不打扰 UI

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures_util::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{FestvoteSDKError, Result};
use crate::events::{event_builders, EventManager};
use crate::remote::{RemoteDataSource, Topic};
use crate::storage::queue::{FailureReason, RetryPolicy};

pub mod debounce;

pub use debounce::{DebounceCallback, Debouncer};

/// 推送通道状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelStatus {
    Idle,
    Connecting,
    Subscribed,
    Error,
}

struct TopicSlot {
    generation: u64,
    status: ChannelStatus,
    task: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct ManagerState {
    topics: HashMap<Topic, TopicSlot>,
    next_generation: u64,
    suspended: bool,
    closed: bool,
}

struct Shared {
    remote: Arc<dyn RemoteDataSource>,
    events: Arc<EventManager>,
    debouncer: Arc<Debouncer>,
    retry_policy: RetryPolicy,
    state: Mutex<ManagerState>,
}

/// 订阅句柄
///
/// 由打开订阅的组件持有，必须显式调用 `unsubscribe()`。
/// 同一 topic 被重新订阅后，旧句柄的 `unsubscribe()` 不再生效。
#[derive(Debug)]
pub struct Subscription {
    topic: Topic,
    generation: u64,
    shared: Weak<Shared>,
}

impl Subscription {
    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// 是否仍是该 topic 的当前订阅
    pub fn is_current(&self) -> bool {
        match self.shared.upgrade() {
            Some(shared) => shared
                .state
                .lock()
                .topics
                .get(&self.topic)
                .map(|slot| slot.generation == self.generation)
                .unwrap_or(false),
            None => false,
        }
    }

    /// 退订并拆除通道，返回是否真的拆除了
    pub async fn unsubscribe(self) -> bool {
        let Some(shared) = self.shared.upgrade() else {
            return false;
        };

        let old_status = {
            let mut state = shared.state.lock();
            let current = state
                .topics
                .get(&self.topic)
                .map(|slot| slot.generation == self.generation)
                .unwrap_or(false);
            if !current {
                debug!("忽略过期的退订句柄: topic={}", self.topic);
                return false;
            }
            match state.topics.remove(&self.topic) {
                Some(slot) => {
                    if let Some(task) = slot.task {
                        task.abort();
                    }
                    slot.status
                }
                None => return false,
            }
        };

        shared.debouncer.cancel(&self.topic);
        info!("推送通道已退订: topic={}", self.topic);
        if old_status != ChannelStatus::Idle {
            shared
                .events
                .emit(event_builders::subscription_state_changed(
                    self.topic.as_str(),
                    old_status,
                    ChannelStatus::Idle,
                ))
                .await;
        }
        true
    }
}

/// 推送订阅管理器
pub struct ChangeSubscriptionManager {
    shared: Arc<Shared>,
}

impl ChangeSubscriptionManager {
    /// `on_invalidate` 在某个 topic 的去抖窗口到期时调用
    pub fn new(
        remote: Arc<dyn RemoteDataSource>,
        events: Arc<EventManager>,
        debounce_window: Duration,
        retry_policy: RetryPolicy,
        on_invalidate: DebounceCallback,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                remote,
                events,
                debouncer: Arc::new(Debouncer::new(debounce_window, on_invalidate)),
                retry_policy,
                state: Mutex::new(ManagerState::default()),
            }),
        }
    }

    /// 去抖器（可为个别 topic 调整窗口）
    pub fn debouncer(&self) -> &Debouncer {
        &self.shared.debouncer
    }

    /// 订阅 topic；已有通道时先拆除
    pub async fn subscribe(&self, topic: impl Into<Topic>) -> Result<Subscription> {
        let topic = topic.into();
        let (generation, replaced, spawned) = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return Err(FestvoteSDKError::ShuttingDown("订阅管理器已关闭".to_string()));
            }
            state.next_generation += 1;
            let generation = state.next_generation;

            let replaced = state.topics.remove(&topic).map(|old| {
                if let Some(task) = old.task {
                    task.abort();
                }
                old.status
            });

            let mut slot = TopicSlot {
                generation,
                status: ChannelStatus::Idle,
                task: None,
            };
            let spawned = !state.suspended;
            if spawned {
                slot.status = ChannelStatus::Connecting;
                slot.task = Some(spawn_channel(&self.shared, topic.clone(), generation));
            }
            state.topics.insert(topic.clone(), slot);
            (generation, replaced, spawned)
        };

        if let Some(old_status) = replaced {
            info!("重新订阅，旧通道已拆除: topic={}", topic);
            if old_status != ChannelStatus::Idle {
                self.emit_status(&topic, old_status, ChannelStatus::Idle).await;
            }
        }
        if spawned {
            self.emit_status(&topic, ChannelStatus::Idle, ChannelStatus::Connecting).await;
        } else {
            debug!("离线中，推迟建立通道: topic={}", topic);
        }

        Ok(Subscription {
            topic,
            generation,
            shared: Arc::downgrade(&self.shared),
        })
    }

    /// 当前状态，未订阅为 Idle
    pub fn status(&self, topic: &Topic) -> ChannelStatus {
        self.shared
            .state
            .lock()
            .topics
            .get(topic)
            .map(|slot| slot.status)
            .unwrap_or(ChannelStatus::Idle)
    }

    /// 正在连接或已建立的通道数
    pub fn active_channel_count(&self) -> usize {
        self.shared
            .state
            .lock()
            .topics
            .values()
            .filter(|slot| slot.task.as_ref().is_some_and(|task| !task.is_finished()))
            .count()
    }

    /// 已订阅的 topic（含暂停中的）
    pub fn topics(&self) -> Vec<Topic> {
        self.shared.state.lock().topics.keys().cloned().collect()
    }

    pub fn is_suspended(&self) -> bool {
        self.shared.state.lock().suspended
    }

    /// 断网 / 进入后台：拆除全部通道，保留订阅关系
    pub async fn suspend_all(&self) {
        let changed = {
            let mut state = self.shared.state.lock();
            state.suspended = true;
            let mut changed = Vec::new();
            for (topic, slot) in state.topics.iter_mut() {
                if let Some(task) = slot.task.take() {
                    task.abort();
                }
                if slot.status != ChannelStatus::Idle {
                    changed.push((topic.clone(), slot.status));
                    slot.status = ChannelStatus::Idle;
                }
            }
            changed
        };

        self.shared.debouncer.cancel_all();
        if !changed.is_empty() {
            info!("推送通道已全部暂停: {} 条", changed.len());
        }
        for (topic, old_status) in changed {
            self.emit_status(&topic, old_status, ChannelStatus::Idle).await;
        }
    }

    /// 恢复网络 / 回到前台：重新建立通道
    pub async fn resume_all(&self) {
        let resumed = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return;
            }
            state.suspended = false;
            let mut resumed = Vec::new();
            for (topic, slot) in state.topics.iter_mut() {
                if slot.task.is_none() {
                    slot.status = ChannelStatus::Connecting;
                    slot.task = Some(spawn_channel(&self.shared, topic.clone(), slot.generation));
                    resumed.push(topic.clone());
                }
            }
            resumed
        };

        if !resumed.is_empty() {
            info!("推送通道恢复: {} 条", resumed.len());
        }
        for topic in resumed {
            self.emit_status(&topic, ChannelStatus::Idle, ChannelStatus::Connecting).await;
        }
    }

    /// 拆除全部通道并忘记订阅关系
    pub async fn shutdown(&self) {
        let topics = {
            let mut state = self.shared.state.lock();
            state.closed = true;
            state.suspended = true;
            state
                .topics
                .drain()
                .map(|(topic, slot)| {
                    if let Some(task) = slot.task {
                        task.abort();
                    }
                    (topic, slot.status)
                })
                .collect::<Vec<_>>()
        };
        self.shared.debouncer.cancel_all();
        info!("推送订阅管理器已关闭，拆除 {} 条通道", topics.len());

        for (topic, old_status) in topics {
            if old_status != ChannelStatus::Idle {
                self.emit_status(&topic, old_status, ChannelStatus::Idle).await;
            }
        }
    }

    async fn emit_status(&self, topic: &Topic, old_status: ChannelStatus, new_status: ChannelStatus) {
        self.shared
            .events
            .emit(event_builders::subscription_state_changed(topic.as_str(), old_status, new_status))
            .await;
    }
}

impl Drop for ChangeSubscriptionManager {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        for slot in state.topics.values_mut() {
            if let Some(task) = slot.task.take() {
                task.abort();
            }
        }
    }
}

/// 更新状态（仅限当前代的通道），返回旧状态
fn transition(shared: &Weak<Shared>, topic: &Topic, generation: u64, status: ChannelStatus) -> Option<(Arc<Shared>, ChannelStatus)> {
    let shared = shared.upgrade()?;
    let old = {
        let mut state = shared.state.lock();
        let slot = state.topics.get_mut(topic)?;
        if slot.generation != generation || slot.task.is_none() {
            return None;
        }
        std::mem::replace(&mut slot.status, status)
    };
    if old == status {
        return None;
    }
    Some((shared, old))
}

/// 通道任务自行退出：清掉句柄，之后 resume_all 可以重建
fn retire(shared: &Weak<Shared>, topic: &Topic, generation: u64) {
    let Some(shared) = shared.upgrade() else { return };
    let mut state = shared.state.lock();
    if let Some(slot) = state.topics.get_mut(topic) {
        if slot.generation == generation {
            slot.task = None;
        }
    }
}

async fn report(shared: &Weak<Shared>, topic: &Topic, generation: u64, status: ChannelStatus) {
    if let Some((shared, old)) = transition(shared, topic, generation, status) {
        shared
            .events
            .emit(event_builders::subscription_state_changed(topic.as_str(), old, status))
            .await;
    }
}

/// 通道任务：连接、转发事件、出错后按退避重连
fn spawn_channel(shared: &Arc<Shared>, topic: Topic, generation: u64) -> JoinHandle<()> {
    let weak = Arc::downgrade(shared);
    let remote = shared.remote.clone();
    let debouncer = shared.debouncer.clone();
    let retry_policy = shared.retry_policy.clone();

    tokio::spawn(async move {
        let mut attempt: u32 = 0;
        loop {
            report(&weak, &topic, generation, ChannelStatus::Connecting).await;

            let failure = match remote.subscribe(&topic).await {
                Ok(mut channel) => {
                    attempt = 0;
                    report(&weak, &topic, generation, ChannelStatus::Subscribed).await;
                    debug!("推送通道已建立: topic={}", topic);

                    let failure = match channel.take_events() {
                        Some(mut events) => loop {
                            match events.next().await {
                                Some(Ok(change)) => {
                                    debug!("收到变更: topic={}, kind={:?}, id={:?}", topic, change.kind, change.record_id);
                                    debouncer.trigger(&topic);
                                }
                                Some(Err(e)) => break e,
                                None => break FestvoteSDKError::Network("推送通道被服务端关闭".to_string()),
                            }
                        },
                        None => FestvoteSDKError::Other("推送通道没有事件流".to_string()),
                    };
                    channel.close();
                    failure
                }
                Err(e) => e,
            };

            warn!("⚠️ 推送通道出错: topic={}, error={}", topic, failure);
            report(&weak, &topic, generation, ChannelStatus::Error).await;

            let delay = retry_policy.next_delay(attempt, &FailureReason::from(&failure));
            let Some(delay) = delay else {
                warn!("推送通道放弃重连: topic={}", topic);
                report(&weak, &topic, generation, ChannelStatus::Idle).await;
                retire(&weak, &topic, generation);
                return;
            };
            attempt = attempt.saturating_add(1);
            tokio::time::sleep(delay).await;
        }
    })
}
