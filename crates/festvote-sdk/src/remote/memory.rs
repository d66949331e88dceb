//! 内存数据源
//!
//! 进程内的远端实现，用于测试与演示：
//! - 可编程故障（不可达、下一次调用失败、冲突注入）
//! - 按 topic 广播变更事件
//! - 统计每个 topic 的存活推送通道数

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

use super::{ChangeEvent, ChangeKind, Filter, RemoteChannel, RemoteDataSource, Topic};
use crate::error::{ErrorKind, FestvoteSDKError, Result};
use crate::storage::record_id_of;
use crate::utils::now_millis;

/// 调用次数统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub fetch: usize,
    pub upsert: usize,
    pub remove: usize,
    pub subscribe: usize,
}

type Subscriber = (u64, mpsc::UnboundedSender<Result<ChangeEvent>>);

#[derive(Default)]
struct MemoryState {
    tables: HashMap<Topic, Vec<Value>>,
    unique_keys: HashMap<Topic, Vec<String>>,
    subscribers: HashMap<Topic, Vec<Subscriber>>,
    next_subscriber_id: u64,
    unreachable: bool,
    failures: VecDeque<ErrorKind>,
    latency: Option<Duration>,
    calls: CallCounts,
}

/// 内存数据源
#[derive(Clone, Default)]
pub struct MemoryDataSource {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryDataSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// 声明唯一约束列（upsert 时按这些列合并，而非新增）
    pub fn with_unique_key(self, topic: &str, columns: &[&str]) -> Self {
        self.state
            .lock()
            .unique_keys
            .insert(Topic::new(topic), columns.iter().map(|c| c.to_string()).collect());
        self
    }

    /// 直接写入初始数据（不广播）
    pub fn seed(&self, topic: &str, records: Vec<Value>) {
        let mut state = self.state.lock();
        state.tables.entry(Topic::new(topic)).or_default().extend(records);
    }

    /// 当前表内容
    pub fn records(&self, topic: &str) -> Vec<Value> {
        self.state.lock().tables.get(&Topic::new(topic)).cloned().unwrap_or_default()
    }

    /// 模拟网络不可达
    pub fn set_reachable(&self, reachable: bool) {
        self.state.lock().unreachable = !reachable;
    }

    /// 下一次 fetch/upsert/remove 以指定类型失败
    pub fn fail_next(&self, kind: ErrorKind) {
        self.state.lock().failures.push_back(kind);
    }

    /// 每次调用的模拟延迟
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.state.lock().latency = latency;
    }

    pub fn call_counts(&self) -> CallCounts {
        self.state.lock().calls
    }

    /// 某个 topic 的存活推送通道数
    pub fn live_channels(&self, topic: &str) -> usize {
        self.state
            .lock()
            .subscribers
            .get(&Topic::new(topic))
            .map(|subs| subs.iter().filter(|(_, tx)| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    /// 广播一条变更（模拟其他客户端的写入）
    pub fn push_change(&self, topic: &str, kind: ChangeKind, record_id: Option<&str>) {
        let topic = Topic::new(topic);
        let event = ChangeEvent {
            topic: topic.clone(),
            kind,
            record_id: record_id.map(str::to_string),
            at: now_millis(),
        };
        Self::broadcast(&mut self.state.lock(), &topic, event);
    }

    /// 模拟服务端断开某个 topic 的全部通道
    pub fn drop_channels(&self, topic: &str) {
        self.state.lock().subscribers.remove(&Topic::new(topic));
    }

    fn broadcast(state: &mut MemoryState, topic: &Topic, event: ChangeEvent) {
        if let Some(subs) = state.subscribers.get_mut(topic) {
            subs.retain(|(_, tx)| tx.unbounded_send(Ok(event.clone())).is_ok());
        }
    }

    /// 调用前置：计数、延迟、故障注入
    async fn before_call(&self, count: impl FnOnce(&mut CallCounts)) -> Result<()> {
        let latency = {
            let mut state = self.state.lock();
            count(&mut state.calls);
            state.latency
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state.lock();
        if state.unreachable {
            return Err(FestvoteSDKError::Network("memory remote unreachable".to_string()));
        }
        match state.failures.pop_front() {
            Some(ErrorKind::Conflict) => Err(FestvoteSDKError::Conflict("injected conflict".to_string())),
            Some(ErrorKind::NotFound) => Err(FestvoteSDKError::NotFound("injected not found".to_string())),
            Some(ErrorKind::StorageQuota) | Some(ErrorKind::Fatal) => {
                Err(FestvoteSDKError::Other("injected failure".to_string()))
            }
            Some(ErrorKind::Network) => Err(FestvoteSDKError::Network("injected network failure".to_string())),
            None => Ok(()),
        }
    }
}

fn same_unique_key(columns: &[String], a: &Value, b: &Value) -> bool {
    !columns.is_empty() && columns.iter().all(|c| a.get(c).is_some() && a.get(c) == b.get(c))
}

#[async_trait]
impl RemoteDataSource for MemoryDataSource {
    async fn fetch(&self, topic: &Topic, filter: &Filter) -> Result<Vec<Value>> {
        self.before_call(|c| c.fetch += 1).await?;
        let state = self.state.lock();
        Ok(state
            .tables
            .get(topic)
            .map(|rows| rows.iter().filter(|r| filter.matches(r)).cloned().collect())
            .unwrap_or_default())
    }

    async fn upsert(&self, topic: &Topic, mut record: Value) -> Result<Value> {
        self.before_call(|c| c.upsert += 1).await?;
        let mut state = self.state.lock();
        let columns = state.unique_keys.get(topic).cloned().unwrap_or_default();
        let rows = state.tables.entry(topic.clone()).or_default();

        let position = match record_id_of(&record) {
            Some(id) => rows.iter().position(|r| record_id_of(r).as_deref() == Some(id.as_str())),
            None => rows.iter().position(|r| same_unique_key(&columns, r, &record)),
        };

        let (kind, stored) = match position {
            Some(index) => {
                if let (Some(existing), Some(fields)) = (rows[index].as_object().cloned(), record.as_object_mut()) {
                    for (key, value) in existing {
                        fields.entry(key).or_insert(value);
                    }
                }
                rows[index] = record.clone();
                (ChangeKind::Update, record)
            }
            None => {
                if let Some(fields) = record.as_object_mut() {
                    fields
                        .entry("id")
                        .or_insert_with(|| Value::String(uuid::Uuid::new_v4().to_string()));
                    fields.entry("created_at").or_insert_with(|| Value::from(now_millis()));
                }
                rows.push(record.clone());
                (ChangeKind::Insert, record)
            }
        };

        let event = ChangeEvent {
            topic: topic.clone(),
            kind,
            record_id: record_id_of(&stored),
            at: now_millis(),
        };
        Self::broadcast(&mut state, topic, event);
        debug!("memory upsert {}: {:?}", topic, kind);
        Ok(stored)
    }

    async fn remove(&self, topic: &Topic, id: &str) -> Result<()> {
        self.before_call(|c| c.remove += 1).await?;
        let mut state = self.state.lock();
        let rows = state.tables.entry(topic.clone()).or_default();
        let before = rows.len();
        rows.retain(|r| record_id_of(r).as_deref() != Some(id));
        if rows.len() == before {
            return Err(FestvoteSDKError::NotFound(format!("{}:{}", topic, id)));
        }

        let event = ChangeEvent {
            topic: topic.clone(),
            kind: ChangeKind::Delete,
            record_id: Some(id.to_string()),
            at: now_millis(),
        };
        Self::broadcast(&mut state, topic, event);
        Ok(())
    }

    async fn subscribe(&self, topic: &Topic) -> Result<RemoteChannel> {
        let mut state = self.state.lock();
        state.calls.subscribe += 1;
        if state.unreachable {
            return Err(FestvoteSDKError::Network("memory remote unreachable".to_string()));
        }

        let (tx, rx) = mpsc::unbounded();
        let id = state.next_subscriber_id;
        state.next_subscriber_id += 1;
        state.subscribers.entry(topic.clone()).or_default().push((id, tx));

        let weak = Arc::downgrade(&self.state);
        let topic_key = topic.clone();
        Ok(RemoteChannel::new(Box::pin(rx)).with_closer(move || {
            if let Some(state) = weak.upgrade() {
                if let Some(subs) = state.lock().subscribers.get_mut(&topic_key) {
                    subs.retain(|(sub_id, _)| *sub_id != id);
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::json;

    #[tokio::test]
    async fn test_upsert_merges_on_unique_key() {
        let remote = MemoryDataSource::new().with_unique_key("votes", &["user_id", "target_id"]);
        let topic = Topic::new("votes");

        let first = remote
            .upsert(&topic, json!({"user_id": "u1", "target_id": "s1", "vote_type": 1}))
            .await
            .unwrap();
        let second = remote
            .upsert(&topic, json!({"user_id": "u1", "target_id": "s1", "vote_type": -1}))
            .await
            .unwrap();

        assert_eq!(first["id"], second["id"]);
        assert_eq!(remote.records("votes").len(), 1);
        assert_eq!(remote.records("votes")[0]["vote_type"], json!(-1));
    }

    #[tokio::test]
    async fn test_failure_injection_and_unreachable() {
        let remote = MemoryDataSource::new();
        let topic = Topic::new("notes");

        remote.fail_next(ErrorKind::Conflict);
        let err = remote.upsert(&topic, json!({"content": "x"})).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        remote.set_reachable(false);
        let err = remote.fetch(&topic, &Filter::new()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Network);

        let err = remote.remove(&topic, "missing").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Network);

        remote.set_reachable(true);
        let err = remote.remove(&topic, "missing").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_subscribe_receives_changes_until_closed() {
        let remote = MemoryDataSource::new();
        let topic = Topic::new("sets");

        let mut channel = remote.subscribe(&topic).await.unwrap();
        let mut events = channel.take_events().unwrap();
        assert_eq!(remote.live_channels("sets"), 1);

        remote.push_change("sets", ChangeKind::Update, Some("s1"));
        let event = events.next().await.unwrap().unwrap();
        assert_eq!(event.record_id.as_deref(), Some("s1"));

        drop(events);
        channel.close();
        assert_eq!(remote.live_channels("sets"), 0);
    }
}
