/// 同步模块
///
/// 职责：
/// - 双源读取（远端优先，失败回退本地存储）
/// - 离线写入回放与连接状态切换
/// - 离线/在线记录合并

pub mod coordinator;
pub mod merge;

pub use coordinator::{
    rows_projection, CoordinatorOptions, Fetched, LocalOverlay, PendingWriteHandler, Projection, QueryResult,
    SyncComponents, SyncCoordinator,
};
pub use merge::{merge_by_id_prefer_right, Record};

/// 同步状态快照
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SyncStatus {
    /// 当前是否在线
    pub online: bool,
    /// 离线队列中的写入数
    pub pending_writes: usize,
    /// 是否正在回放
    pub replaying: bool,
    /// 本地存储是否已降级为仅在线模式
    pub storage_degraded: bool,
    /// 存活的推送通道数
    pub active_channels: usize,
    /// 最近一次回放完成时间
    pub last_replay_at: Option<i64>,
    pub sdk_version: String,
}
