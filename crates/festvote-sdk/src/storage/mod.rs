//! 存储模块 - 离线优先的本地持久化层
//!
//! 分层设计：
//! - KvStore: 基于 sled 的键值存储（JSON 编码、配额检查）
//! - LocalStore: 按 `${entityKind}:${id}` 组织的实体存储，读取永不依赖网络
//! - OfflineWriteQueue: 离线写入队列（见 `queue` 子模块）
//! - Entities: 数据实体定义

use std::path::Path;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{FestvoteSDKError, Result};
use crate::remote::Filter;

pub mod entities;
pub mod kv;
pub mod queue;

pub use entities::*;
pub use kv::{KvStats, KvStore};

/// 实体类型与保留键
pub mod keys {
    /// 艺人
    pub const ARTISTS: &str = "artists";
    /// 演出场次
    pub const SETS: &str = "sets";
    /// 投票（按目标聚合的 TargetVotes 快照）
    pub const VOTES: &str = "votes";
    /// 了解标记（按用户聚合的目标 ID 列表）
    pub const KNOWLEDGE: &str = "artist_knowledge";
    /// 服务端笔记镜像
    pub const NOTES: &str = "notes";
    /// 离线笔记
    pub const OFFLINE_NOTE: &str = "offline_note";
    /// 离线队列条目
    pub const PENDING_WRITE: &str = "pending_write";
    /// 离线队列顺序（保留键，存放有序的条目 ID 列表）
    pub const QUEUE_ORDER: &str = "queue:order";
}

/// 拼接存储键 `${kind}:${id}`
pub fn entity_key(kind: &str, id: &str) -> String {
    format!("{}:{}", kind, id)
}

/// 本地持久化存储
///
/// 写入对调用方而言是同步完成的（sled 内部可能缓冲），`flush()` 强制落盘。
/// 超出配额时返回 `StorageQuota`，不会静默丢弃。
#[derive(Debug)]
pub struct LocalStore {
    kv: KvStore,
}

impl LocalStore {
    /// 打开本地存储
    pub async fn open(data_dir: &Path, namespace: &str, quota_bytes: Option<u64>) -> Result<Self> {
        let kv = KvStore::new(data_dir, namespace, quota_bytes).await?;
        Ok(Self { kv })
    }

    /// 读取单个实体
    pub async fn get<T: DeserializeOwned>(&self, kind: &str, id: &str) -> Result<Option<T>> {
        self.kv.get(entity_key(kind, id)).await
    }

    /// 写入单个实体
    pub async fn put<T: Serialize + ?Sized>(&self, kind: &str, id: &str, value: &T) -> Result<()> {
        self.kv.set(entity_key(kind, id), value).await
    }

    /// 删除单个实体，返回是否存在
    pub async fn delete(&self, kind: &str, id: &str) -> Result<bool> {
        self.kv.delete(entity_key(kind, id)).await
    }

    /// 列出某类实体
    pub async fn list_by_kind<T: DeserializeOwned>(&self, kind: &str) -> Result<Vec<T>> {
        let prefix = format!("{}:", kind);
        let items = self.kv.scan_prefix::<T>(prefix.as_bytes()).await?;
        Ok(items.into_iter().map(|(_, v)| v).collect())
    }

    /// 读取保留键
    pub async fn get_reserved<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.kv.get(key).await
    }

    /// 写入保留键
    pub async fn put_reserved<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        self.kv.set(key, value).await
    }

    /// 用远端结果镜像某类实体
    ///
    /// 本地满足 `filter` 但不在 `items` 中的记录会被删除（远端已删除），
    /// 然后整批写入 `items`。缺少 `id` 字段的记录会被跳过。
    pub async fn replace_kind_matching(&self, kind: &str, filter: &Filter, items: &[Value]) -> Result<usize> {
        let mut pairs = Vec::with_capacity(items.len());
        for item in items {
            match record_id_of(item) {
                Some(id) => pairs.push((entity_key(kind, &id), item.clone())),
                None => warn!("镜像 {} 时跳过缺少 id 的记录", kind),
            }
        }

        let existing: Vec<Value> = self.list_by_kind(kind).await?;
        let mut removed = 0usize;
        for old in existing.iter().filter(|v| filter.matches(v)) {
            if let Some(id) = record_id_of(old) {
                let key = entity_key(kind, &id);
                if !pairs.iter().any(|(k, _)| *k == key) {
                    self.kv.delete(&key).await?;
                    removed += 1;
                }
            }
        }

        let written = pairs.len();
        if !pairs.is_empty() {
            self.kv.set_batch(pairs).await?;
        }
        debug!("镜像 {}: 写入 {} 条, 移除 {} 条", kind, written, removed);
        Ok(written)
    }

    /// 强制落盘
    pub async fn flush(&self) -> Result<()> {
        self.kv.flush().await
    }

    /// 存储统计
    pub fn stats(&self) -> KvStats {
        self.kv.stats()
    }
}

/// 取 JSON 记录的 `id` 字段（字符串或数字）
pub fn record_id_of(value: &Value) -> Option<String> {
    match value.get("id")? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// 把 JSON 记录转换为实体
pub fn decode_records<T: DeserializeOwned>(values: Vec<Value>) -> Result<Vec<T>> {
    values
        .into_iter()
        .map(|v| serde_json::from_value(v).map_err(FestvoteSDKError::from))
        .collect()
}
