//! 乐观写入引擎
//!
//! 对缓存键 K 的一次写入：
//! 1. 记下回滚快照 V0
//! 2. 纯函数计算 V1 并同步写入缓存，调用方返回前即可见
//! 3. 按键排队发起远端调用（带超时）
//! 4. 成功：保留 V1 或按服务端规范值修正，后台失效依赖键
//! 5. 失败：恢复 V0，发出一次 `MutationFailed`，依赖键不失效
//!
//! 同一个键上前一次调用尚未返回时发起的新调用，沿用第一次调用之前的快照
//! 作为回滚基准；远端调用按发起顺序串行执行。

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::cache::{CacheKey, QueryCache};
use crate::error::Result;
use crate::events::{event_builders, EventManager};
use crate::remote::with_timeout;

/// 一次写入的描述
#[derive(Debug, Clone)]
pub struct MutationRequest {
    /// 被乐观修改的缓存键
    pub key: CacheKey,
    /// 操作名（日志与事件用）
    pub operation: String,
    /// 成功后需要失效的依赖键
    pub dependents: Vec<CacheKey>,
}

impl MutationRequest {
    pub fn new(key: CacheKey, operation: impl Into<String>) -> Self {
        Self {
            key,
            operation: operation.into(),
            dependents: Vec::new(),
        }
    }

    pub fn with_dependents(mut self, dependents: Vec<CacheKey>) -> Self {
        self.dependents = dependents;
        self
    }
}

/// 服务端修正函数
pub type Patch<T> = Box<dyn Fn(Option<T>) -> Option<T> + Send + Sync>;

/// 远端调用成功后的缓存修正方式
pub enum Reconcile<T> {
    /// 乐观值即为最终值
    Keep,
    /// 用服务端规范值整体替换（期间有更新的写入时跳过）
    Replace(Option<T>),
    /// 在当前值上应用修正（如回填服务端 id），总是执行
    Patch(Patch<T>),
}

impl<T> std::fmt::Debug for Reconcile<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Reconcile::Keep => write!(f, "Keep"),
            Reconcile::Replace(_) => write!(f, "Replace(..)"),
            Reconcile::Patch(_) => write!(f, "Patch(..)"),
        }
    }
}

/// 单个键上的在途状态
struct KeyState {
    /// 回滚基准
    base: Option<Value>,
    /// 在途调用数
    in_flight: usize,
    /// 最近一次写入的序号
    seq: u64,
}

/// 乐观写入引擎
pub struct OptimisticMutationEngine {
    cache: Arc<QueryCache>,
    events: Arc<EventManager>,
    timeout: Duration,
    states: parking_lot::Mutex<HashMap<CacheKey, KeyState>>,
    /// 每个键一个锁，保证远端调用按发起顺序执行
    locks: parking_lot::Mutex<HashMap<CacheKey, Arc<tokio::sync::Mutex<()>>>>,
    invalidations: parking_lot::Mutex<Option<mpsc::UnboundedSender<CacheKey>>>,
}

impl OptimisticMutationEngine {
    pub fn new(cache: Arc<QueryCache>, events: Arc<EventManager>, timeout: Duration) -> Self {
        Self {
            cache,
            events,
            timeout,
            states: parking_lot::Mutex::new(HashMap::new()),
            locks: parking_lot::Mutex::new(HashMap::new()),
            invalidations: parking_lot::Mutex::new(None),
        }
    }

    /// 设置依赖键失效后的重新读取通道
    pub fn set_invalidation_sink(&self, sink: mpsc::UnboundedSender<CacheKey>) {
        *self.invalidations.lock() = Some(sink);
    }

    /// 执行一次乐观写入
    ///
    /// `transform` 在当前缓存值上计算乐观值；`remote` 收到乐观值并返回远端调用。
    /// 远端调用在乐观值写入之后才会开始执行。返回提交后的值。
    pub async fn execute<T, F, R, Fut>(&self, request: MutationRequest, transform: F, remote: R) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned + Clone,
        F: FnOnce(Option<T>) -> Option<T>,
        R: FnOnce(Option<T>) -> Fut,
        Fut: Future<Output = Result<Reconcile<T>>>,
    {
        let key = request.key.clone();
        let (optimistic, optimistic_value, my_seq) = self.apply_optimistic(&key, transform)?;
        debug!("乐观写入: key={}, op={}, seq={}", key, request.operation, my_seq);

        let lock = self.key_lock(&key);
        let guard = lock.lock().await;

        let outcome = with_timeout(self.timeout, remote(optimistic.clone())).await;
        let settled = match outcome {
            Ok(reconcile) => Ok(self.commit(&key, my_seq, optimistic, optimistic_value, reconcile)),
            Err(e) => {
                self.rollback(&key, my_seq);
                Err(e)
            }
        };
        drop(guard);
        self.release_key_lock(&key, lock);

        match settled {
            Ok(committed) => {
                let committed = committed?;
                info!("✅ 写入已确认: key={}, op={}", key, request.operation);
                self.events
                    .emit(event_builders::mutation_committed(&key.to_string(), &request.operation))
                    .await;
                self.invalidate_dependents(&request.dependents);
                Ok(committed)
            }
            Err(e) => {
                warn!("⚠️ 写入失败已回滚: key={}, op={}, error={}", key, request.operation, e);
                self.events
                    .emit(event_builders::mutation_failed(&key.to_string(), &request.operation, &e.to_string()))
                    .await;
                Err(e)
            }
        }
    }

    /// 在键的 FIFO 锁内执行一次远端调用（离线回放与在线写入共用同一顺序）
    pub async fn run_exclusive<F>(&self, key: &CacheKey, future: F) -> F::Output
    where
        F: Future,
    {
        let lock = self.key_lock(key);
        let output = {
            let _guard = lock.lock().await;
            future.await
        };
        self.release_key_lock(key, lock);
        output
    }

    /// 只做本地投影，不发起远端调用（离线写入）
    pub fn apply_local<T, F>(&self, key: &CacheKey, transform: F) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(Option<T>) -> Option<T>,
    {
        let mut states = self.states.lock();
        let current: Option<T> = self.cache.get_typed(key)?;
        let next = transform(current);
        let value = next.as_ref().map(serde_json::to_value).transpose()?;
        self.cache.replace(key.clone(), value);

        // 在途调用失败时不能覆盖这次本地写入
        if let Some(state) = states.get_mut(key) {
            state.seq += 1;
        }
        Ok(next)
    }

    /// 某个键是否有在途写入
    pub fn is_pending(&self, key: &CacheKey) -> bool {
        self.states.lock().get(key).map(|s| s.in_flight > 0).unwrap_or(false)
    }

    /// 步骤 1-2：记录快照并同步写入乐观值
    fn apply_optimistic<T, F>(&self, key: &CacheKey, transform: F) -> Result<(Option<T>, Option<Value>, u64)>
    where
        T: Serialize + DeserializeOwned + Clone,
        F: FnOnce(Option<T>) -> Option<T>,
    {
        let mut states = self.states.lock();
        let snapshot = self.cache.value(key);
        let current: Option<T> = snapshot.clone().map(serde_json::from_value).transpose()?;
        let optimistic = transform(current);
        let optimistic_value = optimistic.as_ref().map(serde_json::to_value).transpose()?;

        let state = states.entry(key.clone()).or_insert_with(|| KeyState {
            base: snapshot,
            in_flight: 0,
            seq: 0,
        });
        state.in_flight += 1;
        state.seq += 1;
        let seq = state.seq;

        self.cache.replace(key.clone(), optimistic_value.clone());
        Ok((optimistic, optimistic_value, seq))
    }

    /// 步骤 4：提交
    fn commit<T>(
        &self,
        key: &CacheKey,
        my_seq: u64,
        optimistic: Option<T>,
        optimistic_value: Option<Value>,
        reconcile: Reconcile<T>,
    ) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned + Clone,
    {
        let mut states = self.states.lock();
        let newer = states.get(key).map(|s| s.seq != my_seq).unwrap_or(false);

        let (committed, committed_value) = match &reconcile {
            Reconcile::Keep => (optimistic, optimistic_value),
            Reconcile::Replace(value) => {
                let encoded = value.as_ref().map(serde_json::to_value).transpose()?;
                (value.clone(), encoded)
            }
            Reconcile::Patch(patch) => {
                let patched = patch(optimistic);
                let encoded = patched.as_ref().map(serde_json::to_value).transpose()?;
                (patched, encoded)
            }
        };

        if !newer {
            if self.cache.value(key) != committed_value {
                self.cache.replace(key.clone(), committed_value.clone());
            }
        } else if let Reconcile::Patch(patch) = &reconcile {
            let current: Option<T> = self.cache.get_typed(key)?;
            let patched = patch(current).as_ref().map(serde_json::to_value).transpose()?;
            if self.cache.value(key) != patched {
                self.cache.replace(key.clone(), patched);
            }
        }

        Self::finish(&mut states, key, Some(committed_value));
        Ok(committed)
    }

    /// 步骤 5：回滚到基准快照
    fn rollback(&self, key: &CacheKey, my_seq: u64) {
        let mut states = self.states.lock();
        if let Some(state) = states.get(key) {
            if state.seq == my_seq {
                self.cache.restore(key.clone(), state.base.clone());
            } else {
                debug!("保留更新的写入，不回滚: key={}", key);
            }
        }
        Self::finish(&mut states, key, None);
    }

    /// 在途数减一；成功时推进回滚基准，全部结束后清除状态
    fn finish(states: &mut HashMap<CacheKey, KeyState>, key: &CacheKey, committed: Option<Option<Value>>) {
        let done = match states.get_mut(key) {
            Some(state) => {
                state.in_flight = state.in_flight.saturating_sub(1);
                if let Some(value) = committed {
                    state.base = value;
                }
                state.in_flight == 0
            }
            None => false,
        };
        if done {
            states.remove(key);
        }
    }

    fn key_lock(&self, key: &CacheKey) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .entry(key.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// 没有其他持有者时移除键锁
    fn release_key_lock(&self, key: &CacheKey, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.locks.lock();
        // 表中一份 + 调用方一份
        if Arc::strong_count(&lock) == 2 {
            locks.remove(key);
        }
    }

    #[cfg(test)]
    fn lock_count(&self) -> usize {
        self.locks.lock().len()
    }

    fn invalidate_dependents(&self, dependents: &[CacheKey]) {
        if dependents.is_empty() {
            return;
        }
        let sink = self.invalidations.lock().clone();
        for key in dependents {
            self.cache.invalidate(key);
            if let Some(sink) = &sink {
                let _ = sink.send(key.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::DataSource;
    use crate::error::{ErrorKind, FestvoteSDKError};
    use crate::events::SDKEvent;
    use serde_json::json;
    use tokio::sync::oneshot;

    fn engine() -> (Arc<QueryCache>, Arc<EventManager>, Arc<OptimisticMutationEngine>) {
        let cache = Arc::new(QueryCache::new());
        let events = Arc::new(EventManager::new(64));
        let engine = Arc::new(OptimisticMutationEngine::new(
            cache.clone(),
            events.clone(),
            Duration::from_secs(5),
        ));
        (cache, events, engine)
    }

    fn key() -> CacheKey {
        CacheKey::new("counter", "c1")
    }

    #[tokio::test]
    async fn test_optimistic_value_visible_before_remote_resolves() {
        let (cache, _events, engine) = engine();
        cache.set(key(), json!(1), DataSource::Online);

        let (release_tx, release_rx) = oneshot::channel::<()>();
        let task = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .execute(
                        MutationRequest::new(key(), "increment"),
                        |v: Option<i64>| Some(v.unwrap_or(0) + 1),
                        |_| async move {
                            let _ = release_rx.await;
                            Ok(Reconcile::Keep)
                        },
                    )
                    .await
            })
        };

        // 等待乐观写入
        while cache.value(&key()) != Some(json!(2)) {
            tokio::task::yield_now().await;
        }
        assert!(engine.is_pending(&key()));

        release_tx.send(()).unwrap();
        assert_eq!(task.await.unwrap().unwrap(), Some(2));
        assert!(!engine.is_pending(&key()));
    }

    #[tokio::test]
    async fn test_failure_restores_exact_snapshot() {
        let (cache, events, engine) = engine();
        let before = json!({"votes": [{"user_id": "u1", "vote_type": 1}], "target_id": "s1"});
        cache.set(key(), before.clone(), DataSource::Offline);
        let mut rx = events.subscribe();

        let err = engine
            .execute(
                MutationRequest::new(key(), "cast_vote").with_dependents(vec![CacheKey::new("tally", "s1")]),
                |_: Option<Value>| Some(json!({"votes": [], "target_id": "s1"})),
                |_| async { Err::<Reconcile<Value>, _>(FestvoteSDKError::Network("offline".into())) },
            )
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Network);
        let entry = cache.get(&key()).unwrap();
        assert_eq!(entry.value, before);
        assert_eq!(entry.data_source, DataSource::Offline);

        match rx.recv().await.unwrap() {
            SDKEvent::MutationFailed { operation, .. } => assert_eq!(operation, "cast_vote"),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_failure_on_missing_entry_removes_it() {
        let (cache, _events, engine) = engine();

        let result = engine
            .execute(
                MutationRequest::new(key(), "create"),
                |_: Option<i64>| Some(5),
                |_| async { Err::<Reconcile<i64>, _>(FestvoteSDKError::Conflict("dup".into())) },
            )
            .await;

        assert!(result.is_err());
        assert!(cache.get(&key()).is_none());
    }

    #[tokio::test]
    async fn test_timeout_rolls_back_as_network_error() {
        let cache = Arc::new(QueryCache::new());
        let events = Arc::new(EventManager::new(16));
        let engine = OptimisticMutationEngine::new(cache.clone(), events, Duration::from_millis(20));
        cache.set(key(), json!(1), DataSource::Online);

        let err = engine
            .execute(
                MutationRequest::new(key(), "slow"),
                |v: Option<i64>| v.map(|n| n + 1),
                |_| async {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    Ok(Reconcile::Keep)
                },
            )
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Network);
        assert_eq!(cache.value(&key()), Some(json!(1)));
    }

    #[tokio::test]
    async fn test_overlapping_calls_share_rollback_base() {
        let (cache, _events, engine) = engine();
        cache.set(key(), json!(0), DataSource::Online);

        let (first_tx, first_rx) = oneshot::channel::<Result<()>>();
        let first = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .execute(
                        MutationRequest::new(key(), "set"),
                        |_: Option<i64>| Some(1),
                        |_| async move {
                            match first_rx.await {
                                Ok(Err(e)) => Err(e),
                                _ => Ok(Reconcile::Keep),
                            }
                        },
                    )
                    .await
            })
        };
        while cache.value(&key()) != Some(json!(1)) {
            tokio::task::yield_now().await;
        }

        let second = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .execute(
                        MutationRequest::new(key(), "set"),
                        |current: Option<i64>| {
                            // 基于第一次调用的乐观值计算
                            assert_eq!(current, Some(1));
                            Some(-1)
                        },
                        |_| async { Err::<Reconcile<i64>, _>(FestvoteSDKError::Network("down".into())) },
                    )
                    .await
            })
        };
        while cache.value(&key()) != Some(json!(-1)) {
            tokio::task::yield_now().await;
        }

        // 第一次失败：有更新的写入在途，不回滚
        first_tx.send(Err(FestvoteSDKError::Network("down".into()))).unwrap();
        assert!(first.await.unwrap().is_err());
        assert_eq!(cache.value(&key()), Some(json!(-1)));

        // 第二次失败：回到两次调用之前的快照
        assert!(second.await.unwrap().is_err());
        assert_eq!(cache.value(&key()), Some(json!(0)));
        assert!(!engine.is_pending(&key()));
    }

    #[tokio::test]
    async fn test_success_advances_base_for_later_failure() {
        let (cache, _events, engine) = engine();
        cache.set(key(), json!(0), DataSource::Online);

        let (first_tx, first_rx) = oneshot::channel::<()>();
        let first = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .execute(
                        MutationRequest::new(key(), "set"),
                        |_: Option<i64>| Some(1),
                        |_| async move {
                            let _ = first_rx.await;
                            Ok(Reconcile::Keep)
                        },
                    )
                    .await
            })
        };
        while cache.value(&key()) != Some(json!(1)) {
            tokio::task::yield_now().await;
        }

        let second = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .execute(
                        MutationRequest::new(key(), "set"),
                        |_: Option<i64>| Some(2),
                        |_| async { Err::<Reconcile<i64>, _>(FestvoteSDKError::Network("down".into())) },
                    )
                    .await
            })
        };
        while cache.value(&key()) != Some(json!(2)) {
            tokio::task::yield_now().await;
        }

        first_tx.send(()).unwrap();
        assert_eq!(first.await.unwrap().unwrap(), Some(1));
        assert!(second.await.unwrap().is_err());
        // 第一次已被服务端确认，回滚只回到它
        assert_eq!(cache.value(&key()), Some(json!(1)));
    }

    #[tokio::test]
    async fn test_reconcile_patch_and_dependents() {
        let (cache, _events, engine) = engine();
        let (sink, mut invalidated) = mpsc::unbounded_channel();
        engine.set_invalidation_sink(sink);
        let dependent = CacheKey::new("tally", "s1");
        cache.set(dependent.clone(), json!({"count": 0}), DataSource::Online);

        let committed = engine
            .execute(
                MutationRequest::new(key(), "create").with_dependents(vec![dependent.clone()]),
                |_: Option<Value>| Some(json!({"id": null, "content": "hi"})),
                |_| async {
                    Ok(Reconcile::Patch(Box::new(|v: Option<Value>| {
                        v.map(|mut v| {
                            v["id"] = json!("server-1");
                            v
                        })
                    })))
                },
            )
            .await
            .unwrap();

        assert_eq!(committed.unwrap()["id"], json!("server-1"));
        assert_eq!(cache.value(&key()).unwrap()["id"], json!("server-1"));
        assert!(cache.get(&dependent).unwrap().stale);
        assert_eq!(invalidated.recv().await.unwrap(), dependent);
    }

    #[tokio::test]
    async fn test_apply_local_projection() {
        let (cache, _events, engine) = engine();
        let value = engine
            .apply_local(&key(), |v: Option<Vec<String>>| {
                let mut list = v.unwrap_or_default();
                list.push("offline".into());
                Some(list)
            })
            .unwrap();
        assert_eq!(value, Some(vec!["offline".to_string()]));
        assert_eq!(cache.value(&key()), Some(json!(["offline"])));
    }

    #[tokio::test]
    async fn test_key_locks_released_after_settle() {
        let (cache, _events, engine) = engine();
        cache.set(key(), json!(0), DataSource::Online);

        for i in 0..5 {
            let other = CacheKey::new("counter", format!("other-{}", i));
            let _ = engine
                .execute(
                    MutationRequest::new(other, "set"),
                    move |_: Option<i64>| Some(i),
                    move |_| async move {
                        if i == 3 {
                            Err(FestvoteSDKError::Network("down".into()))
                        } else {
                            Ok(Reconcile::Keep)
                        }
                    },
                )
                .await;
        }
        assert_eq!(engine.lock_count(), 0);

        // 在途期间锁仍被持有，结束后释放
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let slow = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .run_exclusive(&key(), async move {
                        let _ = release_rx.await;
                    })
                    .await
            })
        };
        while engine.lock_count() == 0 {
            tokio::task::yield_now().await;
        }

        let waiter = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .execute(
                        MutationRequest::new(key(), "increment"),
                        |v: Option<i64>| v.map(|n| n + 1),
                        |_| async { Ok(Reconcile::Keep) },
                    )
                    .await
            })
        };
        while !engine.is_pending(&key()) {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(engine.is_pending(&key()));

        release_tx.send(()).unwrap();
        slow.await.unwrap();
        assert_eq!(waiter.await.unwrap().unwrap(), Some(1));
        assert_eq!(engine.lock_count(), 0);
    }
}
