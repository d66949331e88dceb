//! Festvote SDK - 离线优先的音乐节投票同步引擎
//!
//! 本 SDK 为音乐节投票应用提供数据层：
//! - 📡 双源读取：远端优先，断网或失败时回退到本地存储
//! - ⚡ 乐观写入：调用返回前界面已更新，远端失败时精确回滚
//! - 📦 离线队列：断网期间的投票、笔记持久化并在重连后按序回放
//! - 🔄 实时失效：推送变更经去抖后只触发一次重新读取
//! - ⚙️ 事件系统：连接状态、写入失败、队列长度统一通过事件暴露
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use festvote_sdk::{FestvoteConfig, FestvoteSDK, ManualNetworkListener, NetworkStatus, UserSession, VoteType};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = FestvoteConfig::builder()
//!         .data_dir("/path/to/data")
//!         .api_base_url("https://api.example.com")
//!         .build();
//!
//!     let listener = Arc::new(ManualNetworkListener::new(NetworkStatus::Online));
//!     let sdk = FestvoteSDK::initialize_rest(config, listener).await?;
//!     sdk.set_current_user(Some(UserSession::new("user123")));
//!
//!     // 投票（同类型再投一次即撤销）
//!     sdk.cast_vote("set-42", VoteType::MustGo).await?;
//!     println!("票数: {:?}", sdk.vote_tally("set-42").await?);
//!
//!     // 笔记，断网时同样可以保存
//!     sdk.save_note("set-42", "meet at the left speaker").await?;
//!
//!     sdk.shutdown().await?;
//!     Ok(())
//! }
//! ```

// 导出核心模块
pub mod cache;
pub mod error;
pub mod events;
pub mod lifecycle;
pub mod mutation;
pub mod network;
pub mod notes;
pub mod remote;
pub mod sdk;
pub mod storage;
pub mod subscription;
pub mod sync;
pub mod utils;
pub mod version;
pub mod votes;

// 重新导出核心类型，方便使用
pub use cache::{CacheEntry, CacheKey, DataSource, QueryCache};
pub use error::{ErrorKind, FestvoteSDKError, Result};
pub use events::{EventFilter, EventManager, ReplayOutcome, SDKEvent};
pub use lifecycle::{LifecycleHook, LifecycleManager, SyncLifecycleHook};
pub use mutation::{MutationRequest, OptimisticMutationEngine, Reconcile};
pub use network::{ManualNetworkListener, NetworkMonitor, NetworkStatus, NetworkStatusListener};
pub use remote::{
    ChangeEvent, ChangeKind, Filter, MemoryDataSource, RemoteChannel, RemoteDataSource, RestDataSource,
    RestDataSourceConfig, Topic,
};
pub use sdk::{FestvoteConfig, FestvoteConfigBuilder, FestvoteSDK, UserSession, VoteOutcome};
pub use storage::queue::{OfflineWriteQueue, ReplayReport, RetryPolicy};
pub use storage::{
    Artist, FestivalSet, LocalStore, Note, OfflineNote, PendingWrite, TargetVotes, VoteRecord, VoteType,
    WriteOperation,
};
pub use subscription::{ChangeSubscriptionManager, ChannelStatus, Subscription};
pub use sync::{Fetched, QueryResult, SyncCoordinator, SyncStatus};
pub use votes::{KnownTargets, VoteTally};
