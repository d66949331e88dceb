//! 数据实体定义
//!
//! 远端表（topic）与本地持久化共用同一套 JSON 结构。

use serde::{Deserialize, Serialize};
use crate::error::{FestvoteSDKError, Result};
use crate::sync::merge::Record;

/// 投票类型：必去 / 感兴趣 / 不去
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i8", into = "i8")]
pub enum VoteType {
    MustGo,
    Interested,
    WontGo,
}

impl VoteType {
    /// 服务端存储的数值
    pub fn as_i8(self) -> i8 {
        match self {
            VoteType::MustGo => 2,
            VoteType::Interested => 1,
            VoteType::WontGo => -1,
        }
    }
}

impl TryFrom<i8> for VoteType {
    type Error = FestvoteSDKError;

    fn try_from(value: i8) -> Result<Self> {
        match value {
            2 => Ok(VoteType::MustGo),
            1 => Ok(VoteType::Interested),
            -1 => Ok(VoteType::WontGo),
            other => Err(FestvoteSDKError::InvalidArgument(format!("无效的投票类型: {}", other))),
        }
    }
}

impl From<VoteType> for i8 {
    fn from(value: VoteType) -> Self {
        value.as_i8()
    }
}

impl std::fmt::Display for VoteType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VoteType::MustGo => write!(f, "must-go"),
            VoteType::Interested => write!(f, "interested"),
            VoteType::WontGo => write!(f, "won't-go"),
        }
    }
}

/// 投票记录，(user_id, target_id) 唯一
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRecord {
    /// 服务端主键，乐观写入时为空
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub user_id: String,
    pub target_id: String,
    pub vote_type: VoteType,
    #[serde(default)]
    pub created_at: i64,
}

/// 某个目标（演出/艺人）上的全部投票
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TargetVotes {
    pub target_id: String,
    pub votes: Vec<VoteRecord>,
}

/// "我了解这个艺人" 标记
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnowledgeRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub user_id: String,
    pub target_id: String,
    #[serde(default)]
    pub created_at: i64,
}

/// 笔记（服务端记录或本地投影）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    pub id: String,
    pub target_id: String,
    pub content: String,
    pub author_id: String,
    /// 展示用作者名，离线创建时为 "you (offline)"
    #[serde(default)]
    pub author_name: Option<String>,
    pub created_at: i64,
    /// 是否已被服务端确认
    #[serde(default = "default_true")]
    pub synced: bool,
}

fn default_true() -> bool {
    true
}

impl Record for Note {
    fn record_id(&self) -> &str {
        &self.id
    }

    fn created_at(&self) -> i64 {
        self.created_at
    }
}

/// 离线笔记，持久化在本地直到服务端确认
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfflineNote {
    pub id: String,
    pub target_id: String,
    pub content: String,
    pub author_id: String,
    pub timestamp: i64,
    pub synced: bool,
}

/// 离线笔记的展示作者名
pub const OFFLINE_AUTHOR_NAME: &str = "you (offline)";

impl OfflineNote {
    /// 转换为列表展示用的笔记投影
    pub fn to_note(&self) -> Note {
        Note {
            id: self.id.clone(),
            target_id: self.target_id.clone(),
            content: self.content.clone(),
            author_id: self.author_id.clone(),
            author_name: Some(OFFLINE_AUTHOR_NAME.to_string()),
            created_at: self.timestamp,
            synced: self.synced,
        }
    }
}

impl Record for OfflineNote {
    fn record_id(&self) -> &str {
        &self.id
    }

    fn created_at(&self) -> i64 {
        self.timestamp
    }
}

/// 艺人
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artist {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub genre: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub created_at: i64,
}

impl Record for Artist {
    fn record_id(&self) -> &str {
        &self.id
    }

    fn created_at(&self) -> i64 {
        self.created_at
    }
}

/// 演出场次
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FestivalSet {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub stage: Option<String>,
    #[serde(default)]
    pub artist_ids: Vec<String>,
    #[serde(default)]
    pub starts_at: Option<i64>,
    #[serde(default)]
    pub created_at: i64,
}

impl Record for FestivalSet {
    fn record_id(&self) -> &str {
        &self.id
    }

    fn created_at(&self) -> i64 {
        self.created_at
    }
}

/// 离线写操作
///
/// 投票/了解标记携带的是操作后的 **最终状态**，回放时幂等。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum WriteOperation {
    /// 设置投票，None 表示撤销
    SetVote {
        user_id: String,
        target_id: String,
        vote_type: Option<VoteType>,
    },
    /// 设置了解标记
    SetKnowledge {
        user_id: String,
        target_id: String,
        known: bool,
    },
    /// 创建离线笔记（内容保存在 offline_note:{id}）
    CreateNote {
        offline_note_id: String,
    },
    /// 删除服务端笔记
    DeleteNote {
        note_id: String,
        target_id: String,
    },
}

impl WriteOperation {
    /// 操作类型名（日志/诊断用）
    pub fn kind(&self) -> &'static str {
        match self {
            WriteOperation::SetVote { .. } => "set_vote",
            WriteOperation::SetKnowledge { .. } => "set_knowledge",
            WriteOperation::CreateNote { .. } => "create_note",
            WriteOperation::DeleteNote { .. } => "delete_note",
        }
    }

    /// 操作写入的远端 topic
    pub fn topic(&self) -> &'static str {
        match self {
            WriteOperation::SetVote { .. } => crate::storage::keys::VOTES,
            WriteOperation::SetKnowledge { .. } => crate::storage::keys::KNOWLEDGE,
            WriteOperation::CreateNote { .. } | WriteOperation::DeleteNote { .. } => crate::storage::keys::NOTES,
        }
    }
}

/// 离线队列中的待写入项
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingWrite {
    pub id: String,
    pub operation: WriteOperation,
    pub created_at: i64,
}

impl PendingWrite {
    pub fn new(operation: WriteOperation) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            operation,
            created_at: crate::utils::now_millis(),
        }
    }
}
