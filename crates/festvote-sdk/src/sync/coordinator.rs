//! 同步协调器
//!
//! 职责：
//! - 双源读取：在线时拉取并镜像到本地存储，离线或拉取失败时回退本地数据
//! - 把离线队列中尚未确认的写入叠加到读取结果上
//! - 网络恢复时恢复推送通道并回放离线队列，断网时暂停推送通道
//! - 推送失效（已去抖）与写入依赖失效后重新读取受影响的缓存键
//!
//! 读取结果写入缓存时带版本检查，读取在途期间发生的乐观写入不会被覆盖。

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::SyncStatus;
use crate::cache::{CacheEntry, CacheKey, DataSource, QueryCache};
use crate::error::{ErrorKind, FestvoteSDKError, Result};
use crate::events::{event_builders, EventManager};
use crate::mutation::OptimisticMutationEngine;
use crate::network::{NetworkMonitor, NetworkStatusEvent};
use crate::remote::{with_timeout, Filter, RemoteDataSource, Topic};
use crate::storage::queue::{OfflineWriteQueue, ReplayReport, RetryPolicy};
use crate::storage::{keys, LocalStore, OfflineNote, PendingWrite};
use crate::subscription::{ChangeSubscriptionManager, DebounceCallback, Subscription};
use crate::utils::now_millis;

/// 读取时叠加的本地状态
#[derive(Debug, Clone, Default)]
pub struct LocalOverlay {
    /// 离线队列中尚未回放的写入（FIFO）
    pub pending: Vec<PendingWrite>,
    /// 本地保存的离线笔记
    pub offline_notes: Vec<OfflineNote>,
}

/// 把远端/本地记录投影为缓存值
pub type Projection = Arc<dyn Fn(Vec<Value>, &LocalOverlay) -> Result<Value> + Send + Sync>;

/// 原样缓存记录数组
pub fn rows_projection() -> Projection {
    Arc::new(|rows: Vec<Value>, _overlay: &LocalOverlay| -> Result<Value> { Ok(Value::Array(rows)) })
}

/// 一次读取的结果
#[derive(Debug, Clone, PartialEq)]
pub struct Fetched<T> {
    pub value: T,
    pub data_source: DataSource,
    pub fetched_at: i64,
}

impl From<CacheEntry> for Fetched<Value> {
    fn from(entry: CacheEntry) -> Self {
        Self {
            value: entry.value,
            data_source: entry.data_source,
            fetched_at: entry.fetched_at,
        }
    }
}

/// 列表读取结果
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult<T> {
    pub items: Vec<T>,
    pub data_source: DataSource,
    pub fetched_at: i64,
}

/// 回放离线写入的执行者
///
/// 返回 `Conflict` 表示已按远端记录解决，`NotFound` 表示目标已删除
/// （实现方负责丢弃对应的本地投影），其余错误使条目留在队列中。
#[async_trait]
pub trait PendingWriteHandler: Send + Sync {
    async fn apply(&self, write: PendingWrite) -> Result<()>;
}

/// 协调器参数
#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    /// 在线数据的新鲜期
    pub stale_after: Duration,
    /// 单次远端调用超时
    pub remote_timeout: Duration,
    /// 推送失效的去抖窗口
    pub debounce_window: Duration,
    /// 推送通道重连退避
    pub resubscribe_policy: RetryPolicy,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_secs(30),
            remote_timeout: Duration::from_secs(10),
            debounce_window: Duration::from_millis(500),
            resubscribe_policy: RetryPolicy::default(),
        }
    }
}

/// 协调器依赖的组件（每个会话构造一次）
pub struct SyncComponents {
    pub cache: Arc<QueryCache>,
    pub store: Arc<LocalStore>,
    pub queue: Arc<OfflineWriteQueue>,
    pub remote: Arc<dyn RemoteDataSource>,
    pub network: Arc<NetworkMonitor>,
    pub events: Arc<EventManager>,
    pub mutations: Arc<OptimisticMutationEngine>,
}

/// 已注册的查询，失效后按它重新读取
#[derive(Clone)]
struct QuerySpec {
    topic: Topic,
    filter: Filter,
    projection: Projection,
}

type InvalidationReceivers = (mpsc::UnboundedReceiver<Topic>, mpsc::UnboundedReceiver<CacheKey>);

/// 同步协调器
pub struct SyncCoordinator {
    options: CoordinatorOptions,
    cache: Arc<QueryCache>,
    store: Arc<LocalStore>,
    queue: Arc<OfflineWriteQueue>,
    remote: Arc<dyn RemoteDataSource>,
    network: Arc<NetworkMonitor>,
    events: Arc<EventManager>,
    mutations: Arc<OptimisticMutationEngine>,
    subscriptions: ChangeSubscriptionManager,
    queries: Mutex<HashMap<CacheKey, QuerySpec>>,
    watched: Mutex<HashMap<Topic, Subscription>>,
    write_handler: RwLock<Option<Arc<dyn PendingWriteHandler>>>,
    online: AtomicBool,
    storage_degraded: AtomicBool,
    last_replay_at: AtomicI64,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    receivers: Mutex<Option<InvalidationReceivers>>,
}

impl SyncCoordinator {
    pub fn new(components: SyncComponents, options: CoordinatorOptions) -> Arc<Self> {
        let (topic_tx, topic_rx) = mpsc::unbounded_channel::<Topic>();
        let (key_tx, key_rx) = mpsc::unbounded_channel::<CacheKey>();

        let cache = components.cache.clone();
        let on_invalidate: DebounceCallback = Arc::new(move |topic: &Topic| {
            // 同步标记失效，之后的读取不再命中新鲜缓存
            cache.invalidate_topic(topic);
            let _ = topic_tx.send(topic.clone());
        });
        components.mutations.set_invalidation_sink(key_tx);

        let subscriptions = ChangeSubscriptionManager::new(
            components.remote.clone(),
            components.events.clone(),
            options.debounce_window,
            options.resubscribe_policy.clone(),
            on_invalidate,
        );

        Arc::new(Self {
            options,
            cache: components.cache,
            store: components.store,
            queue: components.queue,
            remote: components.remote,
            network: components.network,
            events: components.events,
            mutations: components.mutations,
            subscriptions,
            queries: Mutex::new(HashMap::new()),
            watched: Mutex::new(HashMap::new()),
            write_handler: RwLock::new(None),
            online: AtomicBool::new(false),
            storage_degraded: AtomicBool::new(false),
            last_replay_at: AtomicI64::new(0),
            started: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
            receivers: Mutex::new(Some((topic_rx, key_rx))),
        })
    }

    /// 设置离线写入的回放执行者（需在 `init` 之前）
    pub fn set_write_handler(&self, handler: Arc<dyn PendingWriteHandler>) {
        *self.write_handler.write() = Some(handler);
    }

    /// 启动网络监听与失效处理循环
    pub async fn init(self: &Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let (topic_rx, key_rx) = self
            .receivers
            .lock()
            .take()
            .ok_or_else(|| FestvoteSDKError::Other("同步协调器已关闭".to_string()))?;

        // 先订阅再启动，避免漏掉启动期间的状态变化
        let network_rx = self.network.subscribe();
        self.network.start().await?;
        let online = self.network.check_connection().await;
        self.online.store(online, Ordering::SeqCst);
        if !online {
            self.subscriptions.suspend_all().await;
        }

        let weak = Arc::downgrade(self);
        let connectivity = tokio::spawn(Self::run_connectivity_loop(weak.clone(), network_rx));
        let invalidation = tokio::spawn(Self::run_invalidation_loop(weak, topic_rx, key_rx));
        self.tasks.lock().extend([connectivity, invalidation]);

        info!("✅ 同步协调器启动: online={}, 待回放写入={}", online, self.queue.size());
        if online && self.queue.size() > 0 {
            if let Err(e) = self.replay_pending_writes().await {
                warn!("⚠️ 启动时回放离线队列失败: {}", e);
            }
        }
        Ok(())
    }

    /// 关闭：停止后台任务、拆除推送通道并落盘
    pub async fn shutdown(&self) -> Result<()> {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.watched.lock().clear();
        self.subscriptions.shutdown().await;
        self.network.stop().await;
        self.store.flush().await?;
        info!("同步协调器已关闭");
        Ok(())
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub fn is_storage_degraded(&self) -> bool {
        self.storage_degraded.load(Ordering::SeqCst)
    }

    pub fn cache(&self) -> &Arc<QueryCache> {
        &self.cache
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<OfflineWriteQueue> {
        &self.queue
    }

    pub fn remote(&self) -> &Arc<dyn RemoteDataSource> {
        &self.remote
    }

    pub fn events(&self) -> &Arc<EventManager> {
        &self.events
    }

    pub fn mutations(&self) -> &Arc<OptimisticMutationEngine> {
        &self.mutations
    }

    pub fn subscriptions(&self) -> &ChangeSubscriptionManager {
        &self.subscriptions
    }

    pub fn remote_timeout(&self) -> Duration {
        self.options.remote_timeout
    }

    /// 同步状态快照
    pub fn status(&self) -> SyncStatus {
        let last_replay_at = self.last_replay_at.load(Ordering::SeqCst);
        SyncStatus {
            online: self.is_online(),
            pending_writes: self.queue.size(),
            replaying: self.queue.is_replaying(),
            storage_degraded: self.is_storage_degraded(),
            active_channels: self.subscriptions.active_channel_count(),
            last_replay_at: (last_replay_at > 0).then_some(last_replay_at),
            sdk_version: crate::version::SDK_VERSION.to_string(),
        }
    }

    // ========== 读取 ==========

    /// 读取一个 topic 的记录列表（缓存键由过滤条件决定）
    pub async fn read<T: DeserializeOwned>(&self, topic: impl Into<Topic>, filter: Filter) -> Result<QueryResult<T>> {
        let topic = topic.into();
        let key = CacheKey::for_query(&topic, &filter);
        let fetched = self.load(key, topic, filter, rows_projection(), false).await?;
        let items = match fetched.value {
            Value::Null => Vec::new(),
            value => serde_json::from_value(value)?,
        };
        Ok(QueryResult {
            items,
            data_source: fetched.data_source,
            fetched_at: fetched.fetched_at,
        })
    }

    /// 读取并投影为任意缓存值
    pub async fn read_with<T: DeserializeOwned>(
        &self,
        key: CacheKey,
        topic: impl Into<Topic>,
        filter: Filter,
        projection: Projection,
    ) -> Result<Fetched<T>> {
        let fetched = self.load(key, topic.into(), filter, projection, false).await?;
        Ok(Fetched {
            value: serde_json::from_value(fetched.value)?,
            data_source: fetched.data_source,
            fetched_at: fetched.fetched_at,
        })
    }

    /// 忽略新鲜期重新读取某个已注册的键
    pub async fn refresh_key(&self, key: &CacheKey) -> Result<Option<Fetched<Value>>> {
        let spec = self.queries.lock().get(key).cloned();
        match spec {
            Some(spec) => self
                .load(key.clone(), spec.topic, spec.filter, spec.projection, true)
                .await
                .map(Some),
            None => Ok(None),
        }
    }

    /// 重新读取某个 topic 下全部已注册的键，返回成功数
    pub async fn refresh_topic(&self, topic: &Topic) -> usize {
        let keys: Vec<CacheKey> = self
            .queries
            .lock()
            .keys()
            .filter(|k| &k.topic == topic)
            .cloned()
            .collect();

        let mut refreshed = 0;
        for key in keys {
            match self.refresh_key(&key).await {
                Ok(Some(_)) => refreshed += 1,
                Ok(None) => {}
                Err(e) => warn!("⚠️ 重新读取失败: key={}, error={}", key, e),
            }
        }
        debug!("🔄 topic={} 重新读取 {} 个键", topic, refreshed);
        refreshed
    }

    async fn refresh_all(&self) {
        let topics: BTreeSet<Topic> = self.queries.lock().keys().map(|k| k.topic.clone()).collect();
        for topic in topics {
            self.refresh_topic(&topic).await;
        }
    }

    /// 当前叠加层：排队写入 + 本地离线笔记
    pub async fn overlay(&self) -> LocalOverlay {
        let pending = self.queue.pending().await;
        let offline_notes = match self.store.list_by_kind::<OfflineNote>(keys::OFFLINE_NOTE).await {
            Ok(notes) => notes,
            Err(e) => {
                warn!("⚠️ 读取离线笔记失败: {}", e);
                Vec::new()
            }
        };
        LocalOverlay { pending, offline_notes }
    }

    async fn load(
        &self,
        key: CacheKey,
        topic: Topic,
        filter: Filter,
        projection: Projection,
        force: bool,
    ) -> Result<Fetched<Value>> {
        self.queries.lock().insert(
            key.clone(),
            QuerySpec {
                topic: topic.clone(),
                filter: filter.clone(),
                projection: projection.clone(),
            },
        );

        if let Some(entry) = self.cache.get(&key) {
            let fresh = !force && entry.is_fresh(self.options.stale_after.as_millis() as u64);
            // 有在途写入时以乐观值为准
            if fresh || self.mutations.is_pending(&key) {
                debug!("命中缓存: key={}", key);
                return Ok(entry.into());
            }
        }

        let seen = self.cache.version(&key);
        if !self.is_online() {
            let rows = self.local_rows(&topic, &filter).await;
            return self.settle(&key, &filter, &projection, rows, DataSource::Offline, seen).await;
        }

        match with_timeout(self.options.remote_timeout, self.remote.fetch(&topic, &filter)).await {
            Ok(rows) if rows.is_empty() => {
                let local = self.local_rows(&topic, &filter).await;
                if !local.is_empty() {
                    debug!("远端返回空结果，使用本地数据: key={}, 本地 {} 条", key, local.len());
                    return self.settle(&key, &filter, &projection, local, DataSource::Offline, seen).await;
                }
                self.settle(&key, &filter, &projection, rows, DataSource::Online, seen).await
            }
            Ok(rows) => {
                self.mirror(&topic, &filter, &rows).await;
                self.settle(&key, &filter, &projection, rows, DataSource::Online, seen).await
            }
            Err(e) => {
                warn!("⚠️ 远端读取失败，回退本地数据: key={}, error={}", key, e);
                let local = self.local_rows(&topic, &filter).await;
                if !local.is_empty() {
                    return self.settle(&key, &filter, &projection, local, DataSource::Offline, seen).await;
                }
                if let Some(entry) = self.cache.get(&key) {
                    return Ok(entry.into());
                }
                if e.is_retryable() {
                    // 网络类错误且本地无数据：返回仅含叠加层的离线结果
                    return self.settle(&key, &filter, &projection, Vec::new(), DataSource::Offline, seen).await;
                }
                Err(e)
            }
        }
    }

    /// 投影并按版本写入缓存
    async fn settle(
        &self,
        key: &CacheKey,
        filter: &Filter,
        projection: &Projection,
        rows: Vec<Value>,
        data_source: DataSource,
        seen: u64,
    ) -> Result<Fetched<Value>> {
        let overlay = self.overlay().await;
        let value = projection(rows, &overlay)?;
        let items = match &value {
            Value::Array(items) => items.len(),
            Value::Null => 0,
            _ => 1,
        };

        match self
            .cache
            .set_if_version(key.clone(), value.clone(), data_source, Some(filter.clone()), seen)
        {
            Some(_) => {
                self.events
                    .emit(event_builders::query_refreshed(&key.to_string(), data_source, items))
                    .await;
                Ok(Fetched {
                    value,
                    data_source,
                    fetched_at: now_millis(),
                })
            }
            // 读取期间有更新的写入，以缓存为准
            None => match self.cache.get(key) {
                Some(entry) => Ok(entry.into()),
                None => Ok(Fetched {
                    value,
                    data_source,
                    fetched_at: now_millis(),
                }),
            },
        }
    }

    async fn local_rows(&self, topic: &Topic, filter: &Filter) -> Vec<Value> {
        match self.store.list_by_kind::<Value>(topic.as_str()).await {
            Ok(rows) => rows.into_iter().filter(|r| filter.matches(r)).collect(),
            Err(e) => {
                warn!("⚠️ 读取本地数据失败: topic={}, error={}", topic, e);
                Vec::new()
            }
        }
    }

    async fn mirror(&self, topic: &Topic, filter: &Filter, rows: &[Value]) {
        if self.is_storage_degraded() {
            return;
        }
        if let Err(e) = self.store.replace_kind_matching(topic.as_str(), filter, rows).await {
            if e.kind() == ErrorKind::StorageQuota {
                self.degrade_storage(&e.to_string()).await;
            } else {
                warn!("⚠️ 镜像远端数据失败: topic={}, error={}", topic, e);
            }
        }
    }

    // ========== 本地写入 ==========

    /// 写入本地实体，返回是否已持久化
    ///
    /// 配额不足时降级为仅在线模式，不向调用方报错。
    pub async fn persist_local<T: Serialize + ?Sized>(&self, kind: &str, id: &str, value: &T) -> Result<bool> {
        match self.store.put(kind, id, value).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::StorageQuota => {
                self.degrade_storage(&e.to_string()).await;
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// 加入离线队列
    pub async fn enqueue_write(&self, write: PendingWrite) -> Result<()> {
        debug!("📦 离线写入入队: id={}, kind={}", write.id, write.operation.kind());
        match self.queue.enqueue(write).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::StorageQuota => {
                // 条目仍保留在内存队列中
                self.degrade_storage(&e.to_string()).await;
            }
            Err(e) => return Err(e),
        }
        self.events.emit(event_builders::queue_size_changed(self.queue.size())).await;
        Ok(())
    }

    /// 移除满足条件的排队写入（被后续写入取代时）
    pub async fn drop_pending_where<F>(&self, predicate: F) -> Result<Vec<PendingWrite>>
    where
        F: Fn(&PendingWrite) -> bool,
    {
        let removed = self.queue.remove_where(predicate).await?;
        if !removed.is_empty() {
            self.events.emit(event_builders::queue_size_changed(self.queue.size())).await;
        }
        Ok(removed)
    }

    async fn degrade_storage(&self, reason: &str) {
        if self.storage_degraded.swap(true, Ordering::SeqCst) {
            return;
        }
        self.queue.disable_persistence();
        warn!("⚠️ 本地存储空间不足，降级为仅在线模式: {}", reason);
        self.events.emit(event_builders::storage_degraded(reason)).await;
    }

    // ========== 回放 ==========

    /// 回放离线队列，之后重新读取受影响的 topic
    pub async fn replay_pending_writes(&self) -> Result<ReplayReport> {
        let handler = self.write_handler.read().clone();
        let Some(handler) = handler else {
            debug!("未设置回放执行者，跳过回放");
            return Ok(ReplayReport {
                remaining: self.queue.size(),
                ..ReplayReport::default()
            });
        };
        if !self.is_online() {
            return Ok(ReplayReport {
                remaining: self.queue.size(),
                ..ReplayReport::default()
            });
        }

        info!("🔄 开始回放离线队列: {} 条", self.queue.size());
        let report = self
            .queue
            .replay(|write| {
                let handler = handler.clone();
                async move { handler.apply(write).await }
            })
            .await?;
        if report.skipped {
            return Ok(report);
        }

        for write in &report.writes {
            self.events
                .emit(event_builders::pending_write_replayed(&write.write_id, write.operation, write.outcome))
                .await;
        }
        self.last_replay_at.store(now_millis(), Ordering::SeqCst);
        self.events.emit(event_builders::queue_size_changed(report.remaining)).await;

        let touched: BTreeSet<&'static str> = report.writes.iter().map(|w| w.topic).collect();
        for topic in touched {
            self.refresh_topic(&Topic::new(topic)).await;
        }
        Ok(report)
    }

    // ========== 推送 ==========

    /// 订阅 topic 的推送失效，重复调用只保留一条通道
    pub async fn watch_topic(&self, topic: impl Into<Topic>) -> Result<()> {
        let topic = topic.into();
        if self.watched.lock().contains_key(&topic) {
            return Ok(());
        }
        let subscription = self.subscriptions.subscribe(topic.clone()).await?;
        self.watched.lock().insert(topic, subscription);
        Ok(())
    }

    /// 退订 topic，返回是否拆除了通道
    pub async fn unwatch_topic(&self, topic: &Topic) -> bool {
        let subscription = self.watched.lock().remove(topic);
        match subscription {
            Some(subscription) => subscription.unsubscribe().await,
            None => false,
        }
    }

    /// 进入后台：暂停推送通道
    pub async fn suspend(&self) {
        self.subscriptions.suspend_all().await;
    }

    /// 回到前台：恢复推送通道并回放
    pub async fn resume(&self) -> Result<()> {
        if !self.is_online() {
            debug!("离线状态，前台恢复推迟到网络恢复");
            return Ok(());
        }
        self.subscriptions.resume_all().await;
        self.replay_pending_writes().await?;
        Ok(())
    }

    async fn on_connectivity_changed(&self, online: bool) {
        if self.online.swap(online, Ordering::SeqCst) == online {
            return;
        }
        self.events.emit(event_builders::connectivity_changed(online)).await;

        if online {
            info!("📡 网络恢复，恢复推送通道并回放离线队列");
            self.subscriptions.resume_all().await;
            if let Err(e) = self.replay_pending_writes().await {
                warn!("⚠️ 回放离线队列失败: {}", e);
            }
            self.refresh_all().await;
        } else {
            info!("📡 网络断开，暂停推送通道");
            self.subscriptions.suspend_all().await;
        }
    }

    async fn on_topic_invalidated(&self, topic: Topic) {
        let keys = self.cache.keys_for_topic(&topic);
        self.events
            .emit(event_builders::topic_invalidated(topic.as_str(), keys.len()))
            .await;
        if self.is_online() {
            self.refresh_topic(&topic).await;
        }
    }

    async fn on_key_invalidated(&self, key: CacheKey) {
        if !self.is_online() {
            return;
        }
        if let Err(e) = self.refresh_key(&key).await {
            warn!("⚠️ 依赖键重新读取失败: key={}, error={}", key, e);
        }
    }

    async fn run_connectivity_loop(weak: Weak<Self>, mut receiver: broadcast::Receiver<NetworkStatusEvent>) {
        loop {
            let online = match receiver.recv().await {
                Ok(event) => event.new_status.is_online(),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("网络事件积压，跳过 {} 条", skipped);
                    match weak.upgrade() {
                        Some(coordinator) => coordinator.network.check_connection().await,
                        None => break,
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            let Some(coordinator) = weak.upgrade() else { break };
            coordinator.on_connectivity_changed(online).await;
        }
        debug!("网络监听循环结束");
    }

    async fn run_invalidation_loop(
        weak: Weak<Self>,
        mut topics: mpsc::UnboundedReceiver<Topic>,
        mut keys: mpsc::UnboundedReceiver<CacheKey>,
    ) {
        loop {
            tokio::select! {
                Some(topic) = topics.recv() => {
                    let Some(coordinator) = weak.upgrade() else { break };
                    coordinator.on_topic_invalidated(topic).await;
                }
                Some(key) = keys.recv() => {
                    let Some(coordinator) = weak.upgrade() else { break };
                    coordinator.on_key_invalidated(key).await;
                }
                else => break,
            }
        }
        debug!("失效处理循环结束");
    }
}
