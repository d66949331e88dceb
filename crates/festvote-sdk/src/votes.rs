//! 投票与了解标记
//!
//! 投票状态机：
//! - `NoVote --cast(v)--> Voted(v)`
//! - `Voted(v) --cast(v)--> NoVote`
//! - `Voted(v) --cast(v2)--> Voted(v2)`
//!
//! 每个 (user_id, target_id) 至多一条投票。票数由 `TargetVotes` 现算，
//! 服务端确认后不会重复计数。

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::error::{ErrorKind, Result};
use crate::remote::{Filter, RemoteDataSource, Topic};
use crate::storage::{decode_records, keys, KnowledgeRecord, TargetVotes, VoteRecord, VoteType, WriteOperation};
use crate::sync::{LocalOverlay, Projection};
use crate::utils::now_millis;

/// 投票状态机：同类型再次投票即撤销
pub fn next_vote(current: Option<VoteType>, cast: VoteType) -> Option<VoteType> {
    match current {
        Some(existing) if existing == cast => None,
        _ => Some(cast),
    }
}

/// 各类型票数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteTally {
    pub must_go: usize,
    pub interested: usize,
    pub wont_go: usize,
}

impl VoteTally {
    pub fn total(&self) -> usize {
        self.must_go + self.interested + self.wont_go
    }

    /// 加权得分（2 / 1 / -1）
    pub fn score(&self) -> i64 {
        2 * self.must_go as i64 + self.interested as i64 - self.wont_go as i64
    }

    fn add(&mut self, vote_type: VoteType) {
        match vote_type {
            VoteType::MustGo => self.must_go += 1,
            VoteType::Interested => self.interested += 1,
            VoteType::WontGo => self.wont_go += 1,
        }
    }
}

impl TargetVotes {
    pub fn empty(target_id: impl Into<String>) -> Self {
        Self {
            target_id: target_id.into(),
            votes: Vec::new(),
        }
    }

    /// 某个用户当前的投票
    pub fn user_vote(&self, user_id: &str) -> Option<VoteType> {
        self.votes.iter().find(|v| v.user_id == user_id).map(|v| v.vote_type)
    }

    /// 设置某个用户的投票（None 表示撤销），保持每个用户至多一条
    pub fn with_user_vote(mut self, user_id: &str, vote_type: Option<VoteType>) -> Self {
        match vote_type {
            Some(vote_type) => match self.votes.iter_mut().find(|v| v.user_id == user_id) {
                Some(existing) if existing.vote_type == vote_type => {}
                Some(existing) => {
                    existing.vote_type = vote_type;
                    existing.id = None;
                }
                None => self.votes.push(VoteRecord {
                    id: None,
                    user_id: user_id.to_string(),
                    target_id: self.target_id.clone(),
                    vote_type,
                    created_at: now_millis(),
                }),
            },
            None => self.votes.retain(|v| v.user_id != user_id),
        }
        self
    }

    /// 用服务端记录回填 id（仅当本地仍是同一票）
    pub fn with_server_record(mut self, record: &VoteRecord) -> Self {
        if let Some(local) = self
            .votes
            .iter_mut()
            .find(|v| v.user_id == record.user_id && v.vote_type == record.vote_type)
        {
            local.id = record.id.clone();
            local.created_at = record.created_at;
        }
        self
    }

    pub fn tally(&self) -> VoteTally {
        let mut tally = VoteTally::default();
        for vote in &self.votes {
            tally.add(vote.vote_type);
        }
        tally
    }

    /// 只统计小组成员的投票
    pub fn group_tally(&self, member_ids: &[String]) -> VoteTally {
        let mut tally = VoteTally::default();
        for vote in self.votes.iter().filter(|v| member_ids.contains(&v.user_id)) {
            tally.add(vote.vote_type);
        }
        tally
    }
}

/// 从记录构建某个目标的投票集合，同一用户多条时保留最新一条
fn collect_votes(target_id: &str, rows: Vec<Value>) -> Result<TargetVotes> {
    let mut records: Vec<VoteRecord> = decode_records(rows)?;
    records.retain(|r| r.target_id == target_id);
    records.sort_by(|a, b| b.created_at.cmp(&a.created_at));

    let mut votes = TargetVotes::empty(target_id);
    for record in records {
        if votes.user_vote(&record.user_id).is_none() {
            votes.votes.push(record);
        }
    }
    votes.votes.sort_by(|a, b| a.created_at.cmp(&b.created_at));
    Ok(votes)
}

/// `votes:{target}` 的投影：记录 + 排队中的投票
pub fn target_votes_projection(target_id: &str) -> Projection {
    let target_id = target_id.to_string();
    Arc::new(move |rows: Vec<Value>, overlay: &LocalOverlay| -> Result<Value> {
        let mut votes = collect_votes(&target_id, rows)?;
        for write in &overlay.pending {
            if let WriteOperation::SetVote {
                user_id,
                target_id: queued_target,
                vote_type,
            } = &write.operation
            {
                if *queued_target == target_id {
                    votes = votes.with_user_vote(user_id, *vote_type);
                }
            }
        }
        Ok(serde_json::to_value(votes)?)
    })
}

/// 用户了解的目标集合
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownTargets {
    pub user_id: String,
    pub target_ids: BTreeSet<String>,
}

impl KnownTargets {
    pub fn empty(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            target_ids: BTreeSet::new(),
        }
    }

    pub fn contains(&self, target_id: &str) -> bool {
        self.target_ids.contains(target_id)
    }

    pub fn with_known(mut self, target_id: &str, known: bool) -> Self {
        if known {
            self.target_ids.insert(target_id.to_string());
        } else {
            self.target_ids.remove(target_id);
        }
        self
    }
}

/// `artist_knowledge:{user}` 的投影
pub fn known_targets_projection(user_id: &str) -> Projection {
    let user_id = user_id.to_string();
    Arc::new(move |rows: Vec<Value>, overlay: &LocalOverlay| -> Result<Value> {
        let records: Vec<KnowledgeRecord> = decode_records(rows)?;
        let mut known = KnownTargets::empty(&user_id);
        for record in records.into_iter().filter(|r| r.user_id == user_id) {
            known.target_ids.insert(record.target_id);
        }
        for write in &overlay.pending {
            if let WriteOperation::SetKnowledge {
                user_id: queued_user,
                target_id,
                known: flag,
            } = &write.operation
            {
                if *queued_user == user_id {
                    known = known.with_known(target_id, *flag);
                }
            }
        }
        Ok(serde_json::to_value(known)?)
    })
}

fn pair_filter(user_id: &str, target_id: &str) -> Filter {
    Filter::new().eq("user_id", user_id).eq("target_id", target_id)
}

/// 删除 (user, target) 的全部远端记录，不存在视为成功
async fn remove_pair(remote: &dyn RemoteDataSource, topic: &Topic, user_id: &str, target_id: &str) -> Result<usize> {
    let existing = remote.fetch(topic, &pair_filter(user_id, target_id)).await?;
    let mut removed = 0;
    for row in existing {
        let Some(id) = crate::storage::record_id_of(&row) else { continue };
        match remote.remove(topic, &id).await {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    Ok(removed)
}

/// 把投票的最终状态写到远端
///
/// 唯一约束冲突时先删除已有记录再重新插入，回放顺序中最后的写入生效。
pub async fn push_vote(
    remote: &dyn RemoteDataSource,
    user_id: &str,
    target_id: &str,
    vote_type: Option<VoteType>,
) -> Result<Option<VoteRecord>> {
    let topic = Topic::new(keys::VOTES);
    let Some(vote_type) = vote_type else {
        let removed = remove_pair(remote, &topic, user_id, target_id).await?;
        debug!("撤销投票: user={}, target={}, 删除 {} 条", user_id, target_id, removed);
        return Ok(None);
    };

    let row = json!({
        "user_id": user_id,
        "target_id": target_id,
        "vote_type": vote_type,
    });
    let stored = match remote.upsert(&topic, row.clone()).await {
        Ok(stored) => stored,
        Err(e) if e.kind() == ErrorKind::Conflict => {
            info!("投票唯一约束冲突，删除后重新插入: user={}, target={}", user_id, target_id);
            remove_pair(remote, &topic, user_id, target_id).await?;
            remote.upsert(&topic, row).await?
        }
        Err(e) => return Err(e),
    };
    Ok(Some(serde_json::from_value(stored)?))
}

/// 把了解标记的最终状态写到远端，已存在视为成功
pub async fn push_knowledge(remote: &dyn RemoteDataSource, user_id: &str, target_id: &str, known: bool) -> Result<()> {
    let topic = Topic::new(keys::KNOWLEDGE);
    if !known {
        remove_pair(remote, &topic, user_id, target_id).await?;
        return Ok(());
    }

    match remote
        .upsert(&topic, json!({"user_id": user_id, "target_id": target_id}))
        .await
    {
        Ok(_) => Ok(()),
        // 保留远端已有记录
        Err(e) if e.kind() == ErrorKind::Conflict => Ok(()),
        Err(e) => Err(e),
    }
}
