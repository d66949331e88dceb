//! 统一 SDK 接口 - FestvoteSDK 主入口
//!
//! 分层架构设计：
//! ```text
//! FestvoteSDK (投票 / 笔记 / 了解标记)
//!   ├── SyncCoordinator (双源读取、离线回放、连接切换)
//!   │     ├── OptimisticMutationEngine (乐观写入与回滚)
//!   │     ├── ChangeSubscriptionManager (推送通道 + 去抖失效)
//!   │     ├── OfflineWriteQueue (离线写入队列)
//!   │     ├── QueryCache (内存缓存)
//!   │     └── LocalStore (sled 持久化)
//!   ├── EventManager (事件系统层)
//!   ├── NetworkMonitor (网络监控层)
//!   └── LifecycleManager (前后台切换)
//! ```
//!
//! 设计原则：
//! - 离线优先：任何读取在断网时都能返回本地数据
//! - 乐观写入：调用返回前缓存已更新，失败时精确回滚
//! - 事件驱动：失败提示、队列长度等通过 `SDKEvent` 暴露

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::cache::{CacheKey, QueryCache};
use crate::error::{ErrorKind, FestvoteSDKError, Result};
use crate::events::{EventFilter, EventManager, FilteredEventReceiver, SDKEvent};
use crate::lifecycle::{LifecycleHook, LifecycleManager, SyncLifecycleHook};
use crate::mutation::{MutationRequest, OptimisticMutationEngine, Reconcile};
use crate::network::{NetworkMonitor, NetworkStatusListener};
use crate::notes;
use crate::remote::{with_timeout, Filter, RemoteDataSource, RestDataSource, RestDataSourceConfig, Topic};
use crate::storage::queue::{OfflineWriteQueue, ReplayReport, RetryPolicy};
use crate::storage::{
    keys, Artist, FestivalSet, LocalStore, Note, OfflineNote, PendingWrite, TargetVotes, VoteType, WriteOperation,
};
use crate::sync::{
    CoordinatorOptions, Fetched, PendingWriteHandler, QueryResult, SyncComponents, SyncCoordinator, SyncStatus,
};
use crate::version;
use crate::votes::{self, next_vote, KnownTargets, VoteTally};

/// SDK 配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FestvoteConfig {
    /// 数据存储目录（sled 位于 `<data_dir>/kv`）
    pub data_dir: PathBuf,
    /// 存储命名空间
    pub namespace: String,
    /// REST 数据源根地址
    pub api_base_url: Option<String>,
    /// REST 数据源 API key
    pub api_key: Option<String>,
    /// 推送失效去抖窗口（毫秒）
    pub debounce_window_ms: u64,
    /// 远端调用超时（秒），超时按网络错误处理
    pub remote_timeout_secs: u64,
    /// 在线缓存的新鲜期（毫秒）
    pub cache_stale_ms: u64,
    /// 本地存储配额，None 表示不限制
    pub storage_quota_bytes: Option<u64>,
    /// 事件广播缓冲区大小
    pub event_buffer_size: usize,
    /// 推送通道重连退避
    pub resubscribe_policy: RetryPolicy,
}

impl Default for FestvoteConfig {
    fn default() -> Self {
        Self {
            data_dir: get_default_data_dir(),
            namespace: "default".to_string(),
            api_base_url: None,
            api_key: None,
            debounce_window_ms: 500,
            remote_timeout_secs: 10,
            cache_stale_ms: 30_000,
            storage_quota_bytes: None,
            event_buffer_size: 256,
            resubscribe_policy: RetryPolicy::default(),
        }
    }
}

/// 获取默认数据目录 ~/.festvote/
fn get_default_data_dir() -> PathBuf {
    if let Some(home_dir) = std::env::var("HOME").ok().map(PathBuf::from) {
        home_dir.join(".festvote")
    } else if let Some(home_dir) = std::env::var("USERPROFILE").ok().map(PathBuf::from) {
        home_dir.join(".festvote")
    } else {
        PathBuf::from("./festvote_data")
    }
}

impl FestvoteConfig {
    pub fn builder() -> FestvoteConfigBuilder {
        FestvoteConfigBuilder::new()
    }

    /// 校验配置
    pub fn validate(&self) -> Result<()> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(FestvoteSDKError::Config("数据目录不能为空".to_string()));
        }
        if self.namespace.trim().is_empty() {
            return Err(FestvoteSDKError::Config("存储命名空间不能为空".to_string()));
        }
        if self.debounce_window_ms == 0 {
            return Err(FestvoteSDKError::Config("去抖窗口不能为0".to_string()));
        }
        if self.remote_timeout_secs == 0 {
            return Err(FestvoteSDKError::Config("远端调用超时不能为0".to_string()));
        }
        if self.event_buffer_size == 0 {
            return Err(FestvoteSDKError::Config("事件缓冲区大小不能为0".to_string()));
        }
        Ok(())
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_secs(self.remote_timeout_secs)
    }

    fn coordinator_options(&self) -> CoordinatorOptions {
        CoordinatorOptions {
            stale_after: Duration::from_millis(self.cache_stale_ms),
            remote_timeout: self.remote_timeout(),
            debounce_window: Duration::from_millis(self.debounce_window_ms),
            resubscribe_policy: self.resubscribe_policy.clone(),
        }
    }
}

/// 配置构建器
#[derive(Debug, Default)]
pub struct FestvoteConfigBuilder {
    config: FestvoteConfig,
}

impl FestvoteConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: FestvoteConfig::default(),
        }
    }

    pub fn data_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config.data_dir = path.as_ref().to_path_buf();
        self
    }

    pub fn namespace<S: Into<String>>(mut self, namespace: S) -> Self {
        self.config.namespace = namespace.into();
        self
    }

    pub fn api_base_url<S: Into<String>>(mut self, url: S) -> Self {
        self.config.api_base_url = Some(url.into());
        self
    }

    pub fn api_key<S: Into<String>>(mut self, key: S) -> Self {
        self.config.api_key = Some(key.into());
        self
    }

    pub fn debounce_window_ms(mut self, window_ms: u64) -> Self {
        self.config.debounce_window_ms = window_ms;
        self
    }

    pub fn remote_timeout_secs(mut self, secs: u64) -> Self {
        self.config.remote_timeout_secs = secs;
        self
    }

    pub fn cache_stale_ms(mut self, stale_ms: u64) -> Self {
        self.config.cache_stale_ms = stale_ms;
        self
    }

    pub fn storage_quota_bytes(mut self, quota: u64) -> Self {
        self.config.storage_quota_bytes = Some(quota);
        self
    }

    pub fn event_buffer_size(mut self, size: usize) -> Self {
        self.config.event_buffer_size = size;
        self
    }

    pub fn resubscribe_policy(mut self, policy: RetryPolicy) -> Self {
        self.config.resubscribe_policy = policy;
        self
    }

    pub fn build(self) -> FestvoteConfig {
        self.config
    }
}

/// 当前登录用户
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSession {
    pub user_id: String,
    /// 展示名（在线创建笔记时的临时署名）
    pub display_name: Option<String>,
}

impl UserSession {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: None,
        }
    }

    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = Some(display_name.into());
        self
    }
}

/// 投票 / 了解标记的调用结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteOutcome {
    /// 未登录，调用未产生任何变化
    pub requires_auth: bool,
    /// 离线写入，已进入队列等待回放
    pub queued: bool,
}

impl VoteOutcome {
    fn auth_required() -> Self {
        Self {
            requires_auth: true,
            queued: false,
        }
    }

    fn committed() -> Self {
        Self {
            requires_auth: false,
            queued: false,
        }
    }

    fn queued() -> Self {
        Self {
            requires_auth: false,
            queued: true,
        }
    }
}

fn supersedes_vote(write: &PendingWrite, user_id: &str, target_id: &str) -> bool {
    matches!(
        &write.operation,
        WriteOperation::SetVote { user_id: u, target_id: t, .. } if u == user_id && t == target_id
    )
}

fn supersedes_knowledge(write: &PendingWrite, user_id: &str, target_id: &str) -> bool {
    matches!(
        &write.operation,
        WriteOperation::SetKnowledge { user_id: u, target_id: t, .. } if u == user_id && t == target_id
    )
}

/// 离线写入的回放执行者
struct SdkWriteHandler {
    remote: Arc<dyn RemoteDataSource>,
    store: Arc<LocalStore>,
    cache: Arc<QueryCache>,
    queue: Arc<OfflineWriteQueue>,
    mutations: Arc<OptimisticMutationEngine>,
    timeout: Duration,
}

impl SdkWriteHandler {
    /// 目标已删除：丢弃缓存中的本地投影
    fn discard_vote(&self, user_id: &str, target_id: &str) -> Result<()> {
        let key = FestvoteSDK::votes_key(target_id);
        if let Some(votes) = self.cache.get_typed::<TargetVotes>(&key)? {
            let next = votes.with_user_vote(user_id, None);
            self.cache.replace(key, Some(serde_json::to_value(next)?));
        }
        Ok(())
    }

    fn discard_knowledge(&self, user_id: &str, target_id: &str) -> Result<()> {
        let key = FestvoteSDK::knowledge_key(user_id);
        if let Some(known) = self.cache.get_typed::<KnownTargets>(&key)? {
            let next = known.with_known(target_id, false);
            self.cache.replace(key, Some(serde_json::to_value(next)?));
        }
        Ok(())
    }

    async fn discard_offline_note(&self, note: &OfflineNote) -> Result<()> {
        self.store.delete(keys::OFFLINE_NOTE, &note.id).await?;
        let key = FestvoteSDK::notes_key(&note.target_id);
        if let Some(list) = self.cache.get_typed::<Vec<Note>>(&key)? {
            let next = notes::remove_note(Some(list), &note.id);
            self.cache.replace(key, next.map(serde_json::to_value).transpose()?);
        }
        Ok(())
    }

    /// 在键锁内确认条目仍在队列中；在线写入已取代它时返回 false
    async fn still_queued(&self, write_id: &str) -> bool {
        if self.queue.contains(write_id).await {
            return true;
        }
        debug!("离线写入已被更新的写入取代，跳过: {}", write_id);
        false
    }

    async fn replay_note(&self, offline_note_id: &str) -> Result<()> {
        let Some(note) = self.store.get::<OfflineNote>(keys::OFFLINE_NOTE, offline_note_id).await? else {
            debug!("离线笔记已在本地删除，跳过: {}", offline_note_id);
            return Ok(());
        };

        match with_timeout(self.timeout, notes::push_note(self.remote.as_ref(), &note)).await {
            Ok(server) => {
                // 服务端副本替换本地投影
                self.store.delete(keys::OFFLINE_NOTE, &note.id).await?;
                let key = FestvoteSDK::notes_key(&note.target_id);
                if let Some(list) = self.cache.get_typed::<Vec<Note>>(&key)? {
                    let next = notes::replace_note(Some(list), &note.id, &server);
                    self.cache.replace(key, next.map(serde_json::to_value).transpose()?);
                }
                info!("✅ 离线笔记已同步: {} -> {}", note.id, server.id);
                Ok(())
            }
            Err(e) if matches!(e.kind(), ErrorKind::Conflict | ErrorKind::NotFound) => {
                // 冲突保留远端记录，目标删除则丢弃
                self.discard_offline_note(&note).await?;
                Err(e)
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl PendingWriteHandler for SdkWriteHandler {
    async fn apply(&self, write: PendingWrite) -> Result<()> {
        debug!("回放离线写入: id={}, kind={}", write.id, write.operation.kind());
        let write_id = write.id;
        match write.operation {
            WriteOperation::SetVote {
                user_id,
                target_id,
                vote_type,
            } => {
                let key = FestvoteSDK::votes_key(&target_id);
                let pushed = self
                    .mutations
                    .run_exclusive(&key, async {
                        if !self.still_queued(&write_id).await {
                            return Ok(());
                        }
                        with_timeout(
                            self.timeout,
                            votes::push_vote(self.remote.as_ref(), &user_id, &target_id, vote_type),
                        )
                        .await
                        .map(|_| ())
                    })
                    .await;
                match pushed {
                    Ok(_) => Ok(()),
                    Err(e) if e.kind() == ErrorKind::NotFound => {
                        self.discard_vote(&user_id, &target_id)?;
                        Err(e)
                    }
                    Err(e) => Err(e),
                }
            }
            WriteOperation::SetKnowledge {
                user_id,
                target_id,
                known,
            } => {
                let key = FestvoteSDK::knowledge_key(&user_id);
                let pushed = self
                    .mutations
                    .run_exclusive(&key, async {
                        if !self.still_queued(&write_id).await {
                            return Ok(());
                        }
                        with_timeout(
                            self.timeout,
                            votes::push_knowledge(self.remote.as_ref(), &user_id, &target_id, known),
                        )
                        .await
                    })
                    .await;
                match pushed {
                    Err(e) if e.kind() == ErrorKind::NotFound => {
                        self.discard_knowledge(&user_id, &target_id)?;
                        Err(e)
                    }
                    other => other,
                }
            }
            WriteOperation::CreateNote { offline_note_id } => self.replay_note(&offline_note_id).await,
            WriteOperation::DeleteNote { note_id, .. } => {
                with_timeout(self.timeout, notes::delete_remote_note(self.remote.as_ref(), &note_id)).await?;
                if let Err(e) = self.store.delete(keys::NOTES, &note_id).await {
                    warn!("⚠️ 删除本地笔记镜像失败: {}", e);
                }
                Ok(())
            }
        }
    }
}

/// FestvoteSDK 主入口
pub struct FestvoteSDK {
    config: FestvoteConfig,
    coordinator: Arc<SyncCoordinator>,
    remote: Arc<dyn RemoteDataSource>,
    event_manager: Arc<EventManager>,
    lifecycle_manager: tokio::sync::RwLock<LifecycleManager>,
    session: parking_lot::RwLock<Option<UserSession>>,
    /// 在线保存中的临时笔记 id -> 服务端 id
    pending_note_ids: Arc<parking_lot::Mutex<HashMap<String, String>>>,
    shutting_down: AtomicBool,
}

impl FestvoteSDK {
    /// 初始化 SDK
    ///
    /// `remote` 为远端数据源，`network_listener` 由平台层提供网络状态。
    pub async fn initialize(
        config: FestvoteConfig,
        remote: Arc<dyn RemoteDataSource>,
        network_listener: Arc<dyn NetworkStatusListener>,
    ) -> Result<Arc<Self>> {
        info!("正在初始化 FestvoteSDK... {}", version::version_string());
        config.validate()?;

        // === 第1层：本地存储 ===
        let store = Arc::new(
            LocalStore::open(&config.data_dir, &config.namespace, config.storage_quota_bytes).await?,
        );

        // === 第2层：离线写入队列 ===
        let queue = Arc::new(OfflineWriteQueue::open(store.clone()).await?);
        info!("离线队列已恢复: {} 条待回放", queue.size());

        // === 第3层：缓存与事件 ===
        let cache = Arc::new(QueryCache::new());
        let event_manager = Arc::new(EventManager::new(config.event_buffer_size));

        // === 第4层：网络监控 ===
        let network = Arc::new(NetworkMonitor::new(network_listener));

        // === 第5层：乐观写入引擎 ===
        let mutations = Arc::new(OptimisticMutationEngine::new(
            cache.clone(),
            event_manager.clone(),
            config.remote_timeout(),
        ));

        // === 第6层：同步协调器 ===
        let coordinator = SyncCoordinator::new(
            SyncComponents {
                cache: cache.clone(),
                store: store.clone(),
                queue: queue.clone(),
                remote: remote.clone(),
                network,
                events: event_manager.clone(),
                mutations: mutations.clone(),
            },
            config.coordinator_options(),
        );
        coordinator.set_write_handler(Arc::new(SdkWriteHandler {
            remote: remote.clone(),
            store,
            cache,
            queue,
            mutations,
            timeout: config.remote_timeout(),
        }));
        coordinator.init().await?;

        // === 第7层：生命周期管理器 ===
        let mut lifecycle_manager = LifecycleManager::new();
        lifecycle_manager.register_hook(Arc::new(SyncLifecycleHook::new(coordinator.clone())));

        info!("✅ FestvoteSDK 初始化完成");
        Ok(Arc::new(Self {
            config,
            coordinator,
            remote,
            event_manager,
            lifecycle_manager: tokio::sync::RwLock::new(lifecycle_manager),
            session: parking_lot::RwLock::new(None),
            pending_note_ids: Arc::new(parking_lot::Mutex::new(HashMap::new())),
            shutting_down: AtomicBool::new(false),
        }))
    }

    /// 使用配置中的 REST 数据源初始化
    pub async fn initialize_rest(
        config: FestvoteConfig,
        network_listener: Arc<dyn NetworkStatusListener>,
    ) -> Result<Arc<Self>> {
        let base_url = config
            .api_base_url
            .clone()
            .ok_or_else(|| FestvoteSDKError::Config("未配置 api_base_url".to_string()))?;
        let remote = RestDataSource::new(RestDataSourceConfig {
            base_url,
            api_key: config.api_key.clone(),
            ..RestDataSourceConfig::default()
        })?;
        Self::initialize(config, Arc::new(remote), network_listener).await
    }

    /// 关闭 SDK
    pub async fn shutdown(&self) -> Result<()> {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("正在关闭 FestvoteSDK...");
        self.coordinator.shutdown().await?;
        info!("FestvoteSDK 关闭完成");
        Ok(())
    }

    pub fn config(&self) -> &FestvoteConfig {
        &self.config
    }

    pub fn coordinator(&self) -> &Arc<SyncCoordinator> {
        &self.coordinator
    }

    /// 设置当前用户，None 表示登出
    pub fn set_current_user(&self, session: Option<UserSession>) {
        match &session {
            Some(s) => info!("当前用户: {}", s.user_id),
            None => info!("已登出"),
        }
        *self.session.write() = session;
    }

    pub fn current_user(&self) -> Option<UserSession> {
        self.session.read().clone()
    }

    fn current_user_id(&self) -> Option<String> {
        self.session.read().as_ref().map(|s| s.user_id.clone())
    }

    fn require_user(&self) -> Result<UserSession> {
        self.current_user()
            .ok_or(FestvoteSDKError::AuthRequired)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(FestvoteSDKError::ShuttingDown("SDK 正在关闭".to_string()));
        }
        Ok(())
    }

    pub(crate) fn votes_key(target_id: &str) -> CacheKey {
        CacheKey::new(keys::VOTES, target_id)
    }

    pub(crate) fn knowledge_key(user_id: &str) -> CacheKey {
        CacheKey::new(keys::KNOWLEDGE, user_id)
    }

    pub(crate) fn notes_key(target_id: &str) -> CacheKey {
        CacheKey::new(keys::NOTES, target_id)
    }

    /// 订阅读取所在 topic 的推送失效
    async fn watch(&self, topic: &str) {
        if let Err(e) = self.coordinator.watch_topic(topic).await {
            debug!("订阅 {} 失败: {}", topic, e);
        }
    }

    /// 视图卸载时退订 topic
    pub async fn unwatch(&self, topic: &str) -> bool {
        self.coordinator.unwatch_topic(&Topic::new(topic)).await
    }

    // ========== 读取 ==========

    pub async fn artists(&self) -> Result<QueryResult<Artist>> {
        self.ensure_running()?;
        self.watch(keys::ARTISTS).await;
        self.coordinator.read(keys::ARTISTS, Filter::new()).await
    }

    pub async fn sets(&self) -> Result<QueryResult<FestivalSet>> {
        self.ensure_running()?;
        self.watch(keys::SETS).await;
        self.coordinator.read(keys::SETS, Filter::new()).await
    }

    /// 某个目标上的全部投票（含排队中的本地投票）
    pub async fn votes_for(&self, target_id: &str) -> Result<Fetched<TargetVotes>> {
        self.ensure_running()?;
        self.watch(keys::VOTES).await;
        self.coordinator
            .read_with(
                Self::votes_key(target_id),
                keys::VOTES,
                Filter::new().eq("target_id", target_id),
                votes::target_votes_projection(target_id),
            )
            .await
    }

    pub async fn vote_tally(&self, target_id: &str) -> Result<VoteTally> {
        Ok(self.votes_for(target_id).await?.value.tally())
    }

    /// 小组成员在某个目标上的票数
    pub async fn group_tally(&self, target_id: &str, member_ids: &[String]) -> Result<VoteTally> {
        Ok(self.votes_for(target_id).await?.value.group_tally(member_ids))
    }

    /// 当前用户在某个目标上的投票
    pub async fn my_vote(&self, target_id: &str) -> Result<Option<VoteType>> {
        let Some(user_id) = self.current_user_id() else {
            return Ok(None);
        };
        Ok(self.votes_for(target_id).await?.value.user_vote(&user_id))
    }

    /// 某个目标的笔记（服务端 + 未同步的离线笔记）
    pub async fn notes_for(&self, target_id: &str) -> Result<Fetched<Vec<Note>>> {
        self.ensure_running()?;
        self.watch(keys::NOTES).await;
        self.coordinator
            .read_with(
                Self::notes_key(target_id),
                keys::NOTES,
                Filter::new().eq("target_id", target_id),
                notes::notes_projection(target_id),
            )
            .await
    }

    /// 当前用户了解的目标
    pub async fn known_targets(&self) -> Result<KnownTargets> {
        self.ensure_running()?;
        let user = self.require_user()?;
        self.watch(keys::KNOWLEDGE).await;
        let fetched = self
            .coordinator
            .read_with(
                Self::knowledge_key(&user.user_id),
                keys::KNOWLEDGE,
                Filter::new().eq("user_id", user.user_id.as_str()),
                votes::known_targets_projection(&user.user_id),
            )
            .await?;
        Ok(fetched.value)
    }

    // ========== 写入 ==========

    /// 投票
    ///
    /// 同类型再投一次即撤销，其他类型覆盖。离线时写入本地投影并排队。
    pub async fn cast_vote(&self, target_id: &str, vote_type: VoteType) -> Result<VoteOutcome> {
        self.ensure_running()?;
        let Some(user_id) = self.current_user_id() else {
            debug!("投票需要登录: target={}", target_id);
            return Ok(VoteOutcome::auth_required());
        };

        let key = Self::votes_key(target_id);
        if self.coordinator.cache().get(&key).is_none() {
            if let Err(e) = self.votes_for(target_id).await {
                warn!("⚠️ 投票前加载失败: target={}, error={}", target_id, e);
            }
        }

        let transform = {
            let user_id = user_id.clone();
            let target = target_id.to_string();
            move |current: Option<TargetVotes>| {
                let votes = current.unwrap_or_else(|| TargetVotes::empty(target));
                let next = next_vote(votes.user_vote(&user_id), vote_type);
                Some(votes.with_user_vote(&user_id, next))
            }
        };

        // 同一 (user, target) 只需保留最后的最终状态
        let (user, target) = (user_id.clone(), target_id.to_string());
        self.coordinator
            .drop_pending_where(move |w| supersedes_vote(w, &user, &target))
            .await?;

        if !self.coordinator.is_online() {
            let projected = self.coordinator.mutations().apply_local(&key, transform)?;
            let resulting = projected.as_ref().and_then(|v| v.user_vote(&user_id));
            self.coordinator
                .enqueue_write(PendingWrite::new(WriteOperation::SetVote {
                    user_id,
                    target_id: target_id.to_string(),
                    vote_type: resulting,
                }))
                .await?;
            info!("📦 离线投票已入队: target={}, vote={:?}", target_id, resulting);
            return Ok(VoteOutcome::queued());
        }

        let remote = self.remote.clone();
        let target = target_id.to_string();
        let request = MutationRequest::new(key.clone(), "cast_vote").with_dependents(vec![key]);
        self.coordinator
            .mutations()
            .execute(request, transform, move |optimistic: Option<TargetVotes>| async move {
                let desired = optimistic.as_ref().and_then(|votes| votes.user_vote(&user_id));
                let stored = votes::push_vote(remote.as_ref(), &user_id, &target, desired).await?;
                let reconcile: Reconcile<TargetVotes> = match stored {
                    Some(record) => Reconcile::Patch(Box::new(move |current: Option<TargetVotes>| {
                        current.map(|votes| votes.with_server_record(&record))
                    })),
                    None => Reconcile::Keep,
                };
                Ok::<_, FestvoteSDKError>(reconcile)
            })
            .await?;
        Ok(VoteOutcome::committed())
    }

    /// 切换 "我了解这个艺人"
    pub async fn toggle_knowledge(&self, target_id: &str) -> Result<VoteOutcome> {
        self.ensure_running()?;
        let Some(user_id) = self.current_user_id() else {
            return Ok(VoteOutcome::auth_required());
        };

        let key = Self::knowledge_key(&user_id);
        if self.coordinator.cache().get(&key).is_none() {
            if let Err(e) = self.known_targets().await {
                warn!("⚠️ 切换前加载失败: user={}, error={}", user_id, e);
            }
        }

        let transform = {
            let user_id = user_id.clone();
            let target = target_id.to_string();
            move |current: Option<KnownTargets>| {
                let known = current.unwrap_or_else(|| KnownTargets::empty(user_id));
                let flag = !known.contains(&target);
                Some(known.with_known(&target, flag))
            }
        };

        let (user, target) = (user_id.clone(), target_id.to_string());
        self.coordinator
            .drop_pending_where(move |w| supersedes_knowledge(w, &user, &target))
            .await?;

        if !self.coordinator.is_online() {
            let projected = self.coordinator.mutations().apply_local(&key, transform)?;
            let known = projected.map(|k| k.contains(target_id)).unwrap_or(false);
            self.coordinator
                .enqueue_write(PendingWrite::new(WriteOperation::SetKnowledge {
                    user_id,
                    target_id: target_id.to_string(),
                    known,
                }))
                .await?;
            return Ok(VoteOutcome::queued());
        }

        let remote = self.remote.clone();
        let target = target_id.to_string();
        let request = MutationRequest::new(key.clone(), "toggle_knowledge").with_dependents(vec![key]);
        self.coordinator
            .mutations()
            .execute(request, transform, move |optimistic: Option<KnownTargets>| async move {
                let known = optimistic.map(|k| k.contains(&target)).unwrap_or(false);
                votes::push_knowledge(remote.as_ref(), &user_id, &target, known).await?;
                Ok::<_, FestvoteSDKError>(Reconcile::Keep)
            })
            .await?;
        Ok(VoteOutcome::committed())
    }

    /// 保存笔记，返回是否成功（在线失败已回滚时为 false）
    pub async fn save_note(&self, target_id: &str, content: &str) -> Result<bool> {
        self.ensure_running()?;
        let content = notes::validate_content(content)?.to_string();
        let user = self.require_user()?;

        let key = Self::notes_key(target_id);
        if self.coordinator.cache().get(&key).is_none() {
            if let Err(e) = self.notes_for(target_id).await {
                warn!("⚠️ 保存前加载笔记失败: target={}, error={}", target_id, e);
            }
        }

        let offline = notes::new_offline_note(&user.user_id, target_id, &content);

        if !self.coordinator.is_online() {
            self.coordinator
                .persist_local(keys::OFFLINE_NOTE, &offline.id, &offline)
                .await?;
            let projection = offline.to_note();
            self.coordinator
                .mutations()
                .apply_local(&key, move |current: Option<Vec<Note>>| notes::insert_note(current, projection))?;
            self.coordinator
                .enqueue_write(PendingWrite::new(WriteOperation::CreateNote {
                    offline_note_id: offline.id.clone(),
                }))
                .await?;
            info!("📦 离线笔记已保存: id={}, target={}", offline.id, target_id);
            return Ok(true);
        }

        // 在线：临时笔记先入列表，服务端副本返回后替换
        let temp = Note {
            id: notes::new_pending_id(),
            author_name: user.display_name.clone(),
            ..offline.to_note()
        };
        let temp_id = temp.id.clone();
        let remote = self.remote.clone();
        let resolved = self.pending_note_ids.clone();
        let pending_id = temp_id.clone();
        let request = MutationRequest::new(key.clone(), "save_note");
        let result = self
            .coordinator
            .mutations()
            .execute(
                request,
                move |current: Option<Vec<Note>>| notes::insert_note(current, temp),
                move |_optimistic: Option<Vec<Note>>| async move {
                    let server = notes::push_note(remote.as_ref(), &offline).await?;
                    resolved.lock().insert(pending_id.clone(), server.id.clone());
                    let reconcile: Reconcile<Vec<Note>> = Reconcile::Patch(Box::new(move |current: Option<Vec<Note>>| {
                        notes::replace_note(current, &pending_id, &server)
                    }));
                    Ok::<_, FestvoteSDKError>(reconcile)
                },
            )
            .await;

        // 排在后面的删除还要用这条映射
        if !self.coordinator.mutations().is_pending(&key) {
            self.pending_note_ids.lock().remove(&temp_id);
        }

        match result {
            Ok(_) => Ok(true),
            Err(e) => {
                warn!("⚠️ 保存笔记失败: target={}, error={}", target_id, e);
                Ok(false)
            }
        }
    }

    /// 删除笔记，返回是否删除
    pub async fn delete_note(&self, note_id: &str) -> Result<bool> {
        self.ensure_running()?;
        self.require_user()?;

        let Some(target_id) = self.locate_note(note_id).await? else {
            debug!("未找到笔记: {}", note_id);
            return Ok(false);
        };
        let key = Self::notes_key(&target_id);
        let id = note_id.to_string();

        if notes::is_offline_id(note_id) {
            // 未同步的离线笔记：本地删除并撤销排队的创建
            self.coordinator.store().delete(keys::OFFLINE_NOTE, note_id).await?;
            let queued = id.clone();
            self.coordinator
                .drop_pending_where(move |w| {
                    matches!(&w.operation, WriteOperation::CreateNote { offline_note_id } if *offline_note_id == queued)
                })
                .await?;
            self.coordinator
                .mutations()
                .apply_local(&key, move |current: Option<Vec<Note>>| notes::remove_note(current, &id))?;
            return Ok(true);
        }

        if !self.coordinator.is_online() {
            self.coordinator
                .mutations()
                .apply_local(&key, |current: Option<Vec<Note>>| notes::remove_note(current, note_id))?;
            let remote_id = self.pending_note_ids.lock().get(note_id).cloned().unwrap_or(id);
            self.coordinator
                .enqueue_write(PendingWrite::new(WriteOperation::DeleteNote {
                    note_id: remote_id,
                    target_id,
                }))
                .await?;
            return Ok(true);
        }

        let remote = self.remote.clone();
        let store = self.coordinator.store().clone();
        let resolved = self.pending_note_ids.clone();
        let remote_id = id.clone();
        let result = self
            .coordinator
            .mutations()
            .execute(
                MutationRequest::new(key.clone(), "delete_note"),
                move |current: Option<Vec<Note>>| notes::remove_note(current, &id),
                move |_optimistic: Option<Vec<Note>>| async move {
                    // 临时笔记：键锁保证保存已结束，查映射得到服务端 id
                    let remote_id = if notes::is_pending_id(&remote_id) {
                        let Some(server_id) = resolved.lock().remove(&remote_id) else {
                            debug!("临时笔记未写入服务端，无需远端删除: {}", remote_id);
                            return Ok(Reconcile::<Vec<Note>>::Keep);
                        };
                        server_id
                    } else {
                        remote_id
                    };
                    notes::delete_remote_note(remote.as_ref(), &remote_id).await?;
                    if let Err(e) = store.delete(keys::NOTES, &remote_id).await {
                        warn!("⚠️ 删除本地笔记镜像失败: {}", e);
                    }
                    Ok::<_, FestvoteSDKError>(Reconcile::<Vec<Note>>::Keep)
                },
            )
            .await;

        match result {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {
                // 服务端已删除，本地同样移除
                self.coordinator
                    .mutations()
                    .apply_local(&key, |current: Option<Vec<Note>>| notes::remove_note(current, note_id))?;
                if let Err(e) = self.coordinator.store().delete(keys::NOTES, note_id).await {
                    warn!("⚠️ 删除本地笔记镜像失败: {}", e);
                }
            }
            Err(e) => {
                warn!("⚠️ 删除笔记失败: id={}, error={}", note_id, e);
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// 查找笔记所属目标
    async fn locate_note(&self, note_id: &str) -> Result<Option<String>> {
        let cache = self.coordinator.cache();
        for key in cache.keys_for_topic(&Topic::new(keys::NOTES)) {
            let Ok(Some(list)) = cache.get_typed::<Vec<Note>>(&key) else { continue };
            if let Some(note) = list.iter().find(|n| n.id == note_id) {
                return Ok(Some(note.target_id.clone()));
            }
        }

        let store = self.coordinator.store();
        if let Some(note) = store.get::<OfflineNote>(keys::OFFLINE_NOTE, note_id).await? {
            return Ok(Some(note.target_id));
        }
        if let Some(note) = store.get::<Note>(keys::NOTES, note_id).await? {
            return Ok(Some(note.target_id));
        }
        Ok(None)
    }

    // ========== 状态 / 事件 / 生命周期 ==========

    pub fn is_online(&self) -> bool {
        self.coordinator.is_online()
    }

    /// 同步状态快照
    pub fn sync_status(&self) -> SyncStatus {
        self.coordinator.status()
    }

    /// 立即回放离线队列
    pub async fn replay_now(&self) -> Result<ReplayReport> {
        self.ensure_running()?;
        self.coordinator.replay_pending_writes().await
    }

    pub fn event_manager(&self) -> &Arc<EventManager> {
        &self.event_manager
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SDKEvent> {
        self.event_manager.subscribe()
    }

    pub fn subscribe_events_filtered(&self, filter: EventFilter) -> FilteredEventReceiver {
        self.event_manager.subscribe_filtered(filter)
    }

    /// 注册额外的生命周期 Hook
    pub async fn register_lifecycle_hook(&self, hook: Arc<dyn LifecycleHook>) {
        self.lifecycle_manager.write().await.register_hook(hook);
    }

    /// App 切换到后台
    pub async fn on_app_background(&self) -> Result<()> {
        self.lifecycle_manager.read().await.notify_background().await
    }

    /// App 切换到前台
    pub async fn on_app_foreground(&self) -> Result<()> {
        self.lifecycle_manager.read().await.notify_foreground().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::DataSource;
    use crate::network::{ManualNetworkListener, NetworkStatus};
    use crate::remote::{ChangeKind, MemoryDataSource, RemoteChannel};
    use crate::storage::OFFLINE_AUTHOR_NAME;
    use serde_json::json;
    use tempfile::TempDir;

    struct Harness {
        sdk: Arc<FestvoteSDK>,
        remote: MemoryDataSource,
        listener: Arc<ManualNetworkListener>,
    }

    fn memory_remote() -> MemoryDataSource {
        MemoryDataSource::new()
            .with_unique_key(keys::VOTES, &["user_id", "target_id"])
            .with_unique_key(keys::KNOWLEDGE, &["user_id", "target_id"])
    }

    fn test_config(dir: &Path) -> FestvoteConfig {
        FestvoteConfig::builder()
            .data_dir(dir)
            .debounce_window_ms(30)
            .remote_timeout_secs(2)
            .build()
    }

    async fn start(dir: &Path, remote: MemoryDataSource, online: bool) -> Harness {
        let status = if online { NetworkStatus::Online } else { NetworkStatus::Offline };
        let listener = Arc::new(ManualNetworkListener::new(status));
        let sdk = FestvoteSDK::initialize(test_config(dir), Arc::new(remote.clone()), listener.clone())
            .await
            .unwrap();
        sdk.set_current_user(Some(UserSession::new("u1")));
        Harness { sdk, remote, listener }
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) {
        for _ in 0..400 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    async fn go_online(h: &Harness, online: bool) {
        h.listener.set_online(online);
        let sdk = h.sdk.clone();
        wait_until(move || sdk.is_online() == online).await;
    }

    #[test]
    fn test_config_builder_and_validate() {
        let config = FestvoteConfig::builder()
            .data_dir("/tmp/festvote")
            .api_base_url("http://localhost:54321")
            .storage_quota_bytes(1024)
            .build();
        assert_eq!(config.debounce_window_ms, 500);
        assert_eq!(config.remote_timeout_secs, 10);
        assert_eq!(config.storage_quota_bytes, Some(1024));
        assert!(config.validate().is_ok());

        let zero_window = FestvoteConfig::builder().data_dir("/tmp/x").debounce_window_ms(0).build();
        assert!(matches!(zero_window.validate(), Err(FestvoteSDKError::Config(_))));

        let empty_dir = FestvoteConfig::builder().data_dir("").build();
        assert!(empty_dir.validate().is_err());
    }

    #[tokio::test]
    async fn test_vote_requires_auth() {
        let dir = TempDir::new().unwrap();
        let h = start(dir.path(), memory_remote(), true).await;
        h.sdk.set_current_user(None);

        let outcome = h.sdk.cast_vote("s1", VoteType::MustGo).await.unwrap();
        assert!(outcome.requires_auth);
        assert!(h.sdk.toggle_knowledge("a1").await.unwrap().requires_auth);
        assert_eq!(h.remote.call_counts().upsert, 0);
        assert!(matches!(
            h.sdk.save_note("s1", "hello").await,
            Err(FestvoteSDKError::AuthRequired)
        ));
    }

    #[tokio::test]
    async fn test_same_vote_twice_toggles_off() {
        let dir = TempDir::new().unwrap();
        let h = start(dir.path(), memory_remote(), true).await;

        for vote_type in [VoteType::MustGo, VoteType::Interested, VoteType::WontGo] {
            h.sdk.cast_vote("s1", vote_type).await.unwrap();
            assert_eq!(h.sdk.my_vote("s1").await.unwrap(), Some(vote_type));
            h.sdk.cast_vote("s1", vote_type).await.unwrap();
            assert_eq!(h.sdk.my_vote("s1").await.unwrap(), None);
        }
        assert!(h.remote.records(keys::VOTES).is_empty());
    }

    #[tokio::test]
    async fn test_failed_vote_rolls_back_exactly() {
        let dir = TempDir::new().unwrap();
        let remote = memory_remote();
        remote.seed(
            keys::VOTES,
            vec![json!({"id": "v1", "user_id": "u2", "target_id": "s1", "vote_type": 1, "created_at": 1})],
        );
        let h = start(dir.path(), remote, true).await;
        h.sdk.votes_for("s1").await.unwrap();
        let key = FestvoteSDK::votes_key("s1");
        let before = h.sdk.coordinator().cache().value(&key);
        let mut events = h.sdk.subscribe_events();

        h.remote.fail_next(ErrorKind::Network);
        let result = h.sdk.cast_vote("s1", VoteType::MustGo).await;
        assert!(result.is_err());
        assert_eq!(h.sdk.coordinator().cache().value(&key), before);
        // 在线失败不会进入离线队列
        assert_eq!(h.sdk.sync_status().pending_writes, 0);

        let mut failures = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, SDKEvent::MutationFailed { .. }) {
                failures += 1;
            }
        }
        assert_eq!(failures, 1);
    }

    #[tokio::test]
    async fn test_overlapping_votes_settle_on_last_choice() {
        let dir = TempDir::new().unwrap();
        let h = start(dir.path(), memory_remote(), true).await;
        h.sdk.votes_for("s1").await.unwrap();
        h.remote.set_latency(Some(Duration::from_millis(50)));

        let sdk = h.sdk.clone();
        let first = tokio::spawn(async move { sdk.cast_vote("s1", VoteType::Interested).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        h.sdk.cast_vote("s1", VoteType::WontGo).await.unwrap();
        first.await.unwrap().unwrap();

        h.remote.set_latency(None);
        assert_eq!(h.sdk.my_vote("s1").await.unwrap(), Some(VoteType::WontGo));
        let rows = h.remote.records(keys::VOTES);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["vote_type"], json!(-1));
        assert_eq!(h.sdk.vote_tally("s1").await.unwrap().total(), 1);
    }

    #[tokio::test]
    async fn test_offline_vote_counts_once_after_reconnect() {
        let dir = TempDir::new().unwrap();
        let remote = memory_remote();
        remote.seed(
            keys::VOTES,
            vec![json!({"id": "v1", "user_id": "u2", "target_id": "s1", "vote_type": 2, "created_at": 1})],
        );
        let h = start(dir.path(), remote, true).await;
        assert_eq!(h.sdk.vote_tally("s1").await.unwrap().must_go, 1);

        go_online(&h, false).await;
        let outcome = h.sdk.cast_vote("s1", VoteType::MustGo).await.unwrap();
        assert!(outcome.queued);
        assert_eq!(h.sdk.vote_tally("s1").await.unwrap().must_go, 2);
        assert_eq!(h.sdk.sync_status().pending_writes, 1);

        go_online(&h, true).await;
        let sdk = h.sdk.clone();
        wait_until(move || sdk.sync_status().pending_writes == 0 && !sdk.sync_status().replaying).await;

        h.sdk.coordinator().refresh_topic(&Topic::new(keys::VOTES)).await;
        let tally = h.sdk.vote_tally("s1").await.unwrap();
        assert_eq!(tally.must_go, 2);
        assert_eq!(h.remote.records(keys::VOTES).len(), 2);
    }

    /// MustGo 的写入变慢，其余调用直接转发
    struct SlowMustGoRemote {
        inner: MemoryDataSource,
        delay: Duration,
    }

    #[async_trait]
    impl RemoteDataSource for SlowMustGoRemote {
        async fn fetch(&self, topic: &Topic, filter: &Filter) -> Result<Vec<serde_json::Value>> {
            self.inner.fetch(topic, filter).await
        }

        async fn upsert(&self, topic: &Topic, record: serde_json::Value) -> Result<serde_json::Value> {
            if record["vote_type"] == json!(2) {
                tokio::time::sleep(self.delay).await;
            }
            self.inner.upsert(topic, record).await
        }

        async fn remove(&self, topic: &Topic, id: &str) -> Result<()> {
            self.inner.remove(topic, id).await
        }

        async fn subscribe(&self, topic: &Topic) -> Result<RemoteChannel> {
            self.inner.subscribe(topic).await
        }
    }

    #[tokio::test]
    async fn test_live_vote_during_replay_wins() {
        let dir = TempDir::new().unwrap();
        let inner = memory_remote();
        let remote = Arc::new(SlowMustGoRemote {
            inner: inner.clone(),
            delay: Duration::from_millis(300),
        });
        let listener = Arc::new(ManualNetworkListener::new(NetworkStatus::Offline));
        let sdk = FestvoteSDK::initialize(test_config(dir.path()), remote, listener.clone())
            .await
            .unwrap();
        sdk.set_current_user(Some(UserSession::new("u1")));

        assert!(sdk.cast_vote("s1", VoteType::MustGo).await.unwrap().queued);

        listener.set_online(true);
        {
            let sdk = sdk.clone();
            wait_until(move || sdk.is_online() && sdk.sync_status().replaying).await;
        }

        // 回放中的 MustGo 仍在路上，用户改投 Interested
        let outcome = sdk.cast_vote("s1", VoteType::Interested).await.unwrap();
        assert!(!outcome.queued);
        {
            let sdk = sdk.clone();
            wait_until(move || sdk.sync_status().pending_writes == 0 && !sdk.sync_status().replaying).await;
        }

        sdk.coordinator().refresh_topic(&Topic::new(keys::VOTES)).await;
        let rows = inner.records(keys::VOTES);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["vote_type"], json!(1));
        assert_eq!(sdk.my_vote("s1").await.unwrap(), Some(VoteType::Interested));
    }

    #[tokio::test]
    async fn test_offline_notes_survive_reload_and_merge() {
        let dir = TempDir::new().unwrap();
        let remote = memory_remote();
        remote.seed(
            keys::NOTES,
            vec![json!({"id": "n1", "target_id": "s1", "content": "server", "author_id": "u2", "created_at": 1})],
        );

        {
            let h = start(dir.path(), remote.clone(), false).await;
            assert!(h.sdk.save_note("s1", "first").await.unwrap());
            assert!(h.sdk.save_note("s1", "second").await.unwrap());
            let notes = h.sdk.notes_for("s1").await.unwrap();
            assert_eq!(notes.value.len(), 2);
            assert!(notes
                .value
                .iter()
                .all(|n| n.author_name.as_deref() == Some(OFFLINE_AUTHOR_NAME)));
            h.sdk.shutdown().await.unwrap();
        }

        // 重新加载后离线笔记仍在
        let h = start(dir.path(), remote, false).await;
        let reloaded = h.sdk.notes_for("s1").await.unwrap();
        assert_eq!(reloaded.value.len(), 2);
        assert_eq!(reloaded.data_source, DataSource::Offline);
        assert_eq!(h.sdk.sync_status().pending_writes, 2);

        go_online(&h, true).await;
        let sdk = h.sdk.clone();
        wait_until(move || sdk.sync_status().pending_writes == 0 && !sdk.sync_status().replaying).await;
        h.sdk.coordinator().refresh_topic(&Topic::new(keys::NOTES)).await;

        let merged = h.sdk.notes_for("s1").await.unwrap().value;
        assert_eq!(merged.len(), 3);
        let mut ids: Vec<&str> = merged.iter().map(|n| n.id.as_str()).collect();
        assert!(ids.iter().all(|id| !notes::is_offline_id(id)));
        assert!(merged.windows(2).all(|w| w[0].created_at >= w[1].created_at));
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 3);
    }

    #[tokio::test]
    async fn test_artists_fall_back_to_offline_copy() {
        let dir = TempDir::new().unwrap();
        let remote = memory_remote();
        remote.seed(
            keys::ARTISTS,
            (0..12).map(|i| json!({"id": format!("a{}", i), "name": format!("Artist {}", i)})).collect(),
        );
        let h = start(dir.path(), remote, true).await;
        assert_eq!(h.sdk.artists().await.unwrap().items.len(), 12);

        h.remote.set_reachable(false);
        h.sdk.coordinator().cache().invalidate_topic(&Topic::new(keys::ARTISTS));
        let artists = h.sdk.artists().await.unwrap();
        assert_eq!(artists.items.len(), 12);
        assert_eq!(artists.data_source, DataSource::Offline);
    }

    #[tokio::test]
    async fn test_push_burst_and_resubscribe() {
        let dir = TempDir::new().unwrap();
        let remote = memory_remote();
        remote.seed(keys::SETS, vec![json!({"id": "s1", "name": "Opening"})]);
        let h = start(dir.path(), remote, true).await;

        h.sdk.sets().await.unwrap();
        h.sdk.sets().await.unwrap();
        let remote = h.remote.clone();
        wait_until(move || remote.live_channels(keys::SETS) == 1).await;

        let fetches = h.remote.call_counts().fetch;
        for _ in 0..10 {
            h.remote.push_change(keys::SETS, ChangeKind::Update, Some("s1"));
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(h.remote.call_counts().fetch, fetches + 1);
        assert_eq!(h.remote.live_channels(keys::SETS), 1);

        assert!(h.sdk.unwatch(keys::SETS).await);
        let remote = h.remote.clone();
        wait_until(move || remote.live_channels(keys::SETS) == 0).await;
    }

    #[tokio::test]
    async fn test_save_note_online_replaces_temp() {
        let dir = TempDir::new().unwrap();
        let h = start(dir.path(), memory_remote(), true).await;
        h.sdk
            .set_current_user(Some(UserSession::new("u1").with_display_name("Alex")));

        assert!(matches!(
            h.sdk.save_note("s1", "   ").await,
            Err(FestvoteSDKError::InvalidArgument(_))
        ));
        assert!(h.sdk.save_note("s1", "see you at the front").await.unwrap());
        // 等推送触发的重新读取完成
        tokio::time::sleep(Duration::from_millis(150)).await;

        let notes = h.sdk.notes_for("s1").await.unwrap().value;
        assert_eq!(notes.len(), 1);
        assert!(!notes::is_offline_id(&notes[0].id));
        assert!(notes[0].synced);

        assert!(h.sdk.delete_note(&notes[0].id).await.unwrap());
        assert!(h.sdk.notes_for("s1").await.unwrap().value.is_empty());
        assert!(h.remote.records(keys::NOTES).is_empty());
        tokio::time::sleep(Duration::from_millis(150)).await;

        h.remote.fail_next(ErrorKind::Network);
        assert!(!h.sdk.save_note("s1", "lost").await.unwrap());
        assert!(h.sdk.notes_for("s1").await.unwrap().value.is_empty());
    }

    #[tokio::test]
    async fn test_delete_note_while_save_in_flight() {
        let dir = TempDir::new().unwrap();
        let h = start(dir.path(), memory_remote(), true).await;
        assert!(h.sdk.notes_for("s1").await.unwrap().value.is_empty());

        h.remote.set_latency(Some(Duration::from_millis(100)));
        let saving = {
            let sdk = h.sdk.clone();
            tokio::spawn(async move { sdk.save_note("s1", "quick one").await })
        };

        let key = FestvoteSDK::notes_key("s1");
        let cache = h.sdk.coordinator().cache().clone();
        {
            let cache = cache.clone();
            let key = key.clone();
            wait_until(move || matches!(cache.get_typed::<Vec<Note>>(&key), Ok(Some(list)) if !list.is_empty()))
                .await;
        }
        let temp = cache.get_typed::<Vec<Note>>(&key).unwrap().unwrap()[0].clone();
        assert!(notes::is_pending_id(&temp.id));
        assert!(!notes::is_offline_id(&temp.id));

        assert!(h.sdk.delete_note(&temp.id).await.unwrap());
        assert!(saving.await.unwrap().unwrap());
        assert!(h.remote.records(keys::NOTES).is_empty());
        assert!(h.sdk.pending_note_ids.lock().is_empty());

        h.remote.set_latency(None);
        tokio::time::sleep(Duration::from_millis(300)).await;
        h.sdk.coordinator().refresh_topic(&Topic::new(keys::NOTES)).await;
        assert!(h.sdk.notes_for("s1").await.unwrap().value.is_empty());
    }

    #[tokio::test]
    async fn test_delete_unsynced_note_drops_queued_create() {
        let dir = TempDir::new().unwrap();
        let h = start(dir.path(), memory_remote(), false).await;

        h.sdk.save_note("s1", "draft").await.unwrap();
        let notes = h.sdk.notes_for("s1").await.unwrap().value;
        assert_eq!(h.sdk.sync_status().pending_writes, 1);

        assert!(h.sdk.delete_note(&notes[0].id).await.unwrap());
        assert_eq!(h.sdk.sync_status().pending_writes, 0);
        assert!(h.sdk.notes_for("s1").await.unwrap().value.is_empty());
        assert!(!h.sdk.delete_note("missing").await.unwrap());
    }

    #[tokio::test]
    async fn test_toggle_knowledge_online_and_offline() {
        let dir = TempDir::new().unwrap();
        let h = start(dir.path(), memory_remote(), true).await;

        h.sdk.toggle_knowledge("a1").await.unwrap();
        assert!(h.sdk.known_targets().await.unwrap().contains("a1"));
        assert_eq!(h.remote.records(keys::KNOWLEDGE).len(), 1);

        go_online(&h, false).await;
        let outcome = h.sdk.toggle_knowledge("a1").await.unwrap();
        assert!(outcome.queued);
        assert!(!h.sdk.known_targets().await.unwrap().contains("a1"));

        // 再次切换取代排队中的旧状态
        h.sdk.toggle_knowledge("a1").await.unwrap();
        assert_eq!(h.sdk.sync_status().pending_writes, 1);

        go_online(&h, true).await;
        let sdk = h.sdk.clone();
        wait_until(move || sdk.sync_status().pending_writes == 0 && !sdk.sync_status().replaying).await;
        assert_eq!(h.remote.records(keys::KNOWLEDGE).len(), 1);
    }

    #[tokio::test]
    async fn test_group_tally() {
        let dir = TempDir::new().unwrap();
        let remote = memory_remote();
        remote.seed(
            keys::VOTES,
            vec![
                json!({"id": "v1", "user_id": "u2", "target_id": "s1", "vote_type": 2, "created_at": 1}),
                json!({"id": "v2", "user_id": "u3", "target_id": "s1", "vote_type": 1, "created_at": 2}),
                json!({"id": "v3", "user_id": "u4", "target_id": "s1", "vote_type": -1, "created_at": 3}),
            ],
        );
        let h = start(dir.path(), remote, true).await;

        let group = h
            .sdk
            .group_tally("s1", &["u2".to_string(), "u4".to_string()])
            .await
            .unwrap();
        assert_eq!(group, VoteTally { must_go: 1, interested: 0, wont_go: 1 });
        assert_eq!(h.sdk.vote_tally("s1").await.unwrap().total(), 3);
    }

    #[tokio::test]
    async fn test_lifecycle_suspends_and_resumes_channels() {
        let dir = TempDir::new().unwrap();
        let h = start(dir.path(), memory_remote(), true).await;
        h.sdk.sets().await.unwrap();
        let remote = h.remote.clone();
        wait_until(move || remote.live_channels(keys::SETS) == 1).await;

        h.sdk.on_app_background().await.unwrap();
        let remote = h.remote.clone();
        wait_until(move || remote.live_channels(keys::SETS) == 0).await;

        h.sdk.on_app_foreground().await.unwrap();
        let remote = h.remote.clone();
        wait_until(move || remote.live_channels(keys::SETS) == 1).await;

        h.sdk.shutdown().await.unwrap();
        assert!(matches!(h.sdk.artists().await, Err(FestvoteSDKError::ShuttingDown(_))));
    }
}
