//! 离线写入队列
//!
//! 离线期间的每次写入都会进入队列，重连后按 FIFO 回放。
//!
//! 持久化布局：
//! - `pending_write:{id}` 保存条目本身
//! - 保留键 `queue:order` 保存有序的条目 ID 列表
//!
//! 内存中始终保留一份镜像，持久化降级后队列仍可工作（但不再跨重启）。

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

use crate::error::{ErrorKind, Result};
use crate::events::ReplayOutcome;
use crate::storage::{keys, LocalStore, PendingWrite};

pub mod retry_policy;

pub use retry_policy::{FailureReason, RetryPolicy};

/// 单条回放记录
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayedWrite {
    pub write_id: String,
    pub operation: &'static str,
    /// 写入的远端 topic
    pub topic: &'static str,
    pub outcome: ReplayOutcome,
}

/// 回放结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayReport {
    /// 已被服务端确认（含冲突已解决）的条目数
    pub applied: usize,
    /// 目标已删除而移除的条目数
    pub dropped: usize,
    /// 仍在队列中的条目数
    pub remaining: usize,
    /// 本轮是否因另一轮回放正在进行而跳过
    pub skipped: bool,
    pub writes: Vec<ReplayedWrite>,
}

/// 回放标记，离开作用域时自动清除
struct ReplayGuard<'a>(&'a AtomicBool);

impl Drop for ReplayGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// 离线写入队列
pub struct OfflineWriteQueue {
    store: Arc<LocalStore>,
    entries: RwLock<VecDeque<PendingWrite>>,
    size_tx: watch::Sender<usize>,
    replaying: AtomicBool,
    persistent: AtomicBool,
}

impl OfflineWriteQueue {
    /// 从本地存储恢复队列
    pub async fn open(store: Arc<LocalStore>) -> Result<Self> {
        let order: Vec<String> = store.get_reserved(keys::QUEUE_ORDER).await?.unwrap_or_default();

        let mut entries = VecDeque::with_capacity(order.len());
        for id in &order {
            match store.get::<PendingWrite>(keys::PENDING_WRITE, id).await? {
                Some(write) => entries.push_back(write),
                None => warn!("⚠️ 队列顺序中的条目缺失，已跳过: {}", id),
            }
        }

        if !entries.is_empty() {
            info!("📦 恢复离线队列: {} 条待回放", entries.len());
        }
        let (size_tx, _) = watch::channel(entries.len());

        Ok(Self {
            store,
            entries: RwLock::new(entries),
            size_tx,
            replaying: AtomicBool::new(false),
            persistent: AtomicBool::new(true),
        })
    }

    /// 追加写入
    ///
    /// 条目总是先进入内存镜像；持久化失败时返回错误，但条目不会丢失。
    pub async fn enqueue(&self, write: PendingWrite) -> Result<()> {
        debug!("离线写入入队: id={}, kind={}", write.id, write.operation.kind());
        let mut entries = self.entries.write().await;
        entries.push_back(write.clone());
        self.size_tx.send_replace(entries.len());

        if self.is_persistent() {
            self.store.put(keys::PENDING_WRITE, &write.id, &write).await?;
            self.persist_order(&entries).await?;
        }
        Ok(())
    }

    /// FIFO 快照
    pub async fn pending(&self) -> Vec<PendingWrite> {
        self.entries.read().await.iter().cloned().collect()
    }

    /// 队列中是否仍有该条写入
    pub async fn contains(&self, id: &str) -> bool {
        self.entries.read().await.iter().any(|w| w.id == id)
    }

    /// 移除条目（服务端已确认）
    pub async fn remove(&self, id: &str) -> Result<bool> {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|w| w.id != id);
        if entries.len() == before {
            return Ok(false);
        }
        self.size_tx.send_replace(entries.len());

        if self.is_persistent() {
            self.store.delete(keys::PENDING_WRITE, id).await?;
            self.persist_order(&entries).await?;
        }
        Ok(true)
    }

    /// 移除满足条件的条目，返回被移除的条目
    pub async fn remove_where<F>(&self, predicate: F) -> Result<Vec<PendingWrite>>
    where
        F: Fn(&PendingWrite) -> bool,
    {
        let mut entries = self.entries.write().await;
        let (removed, kept): (Vec<PendingWrite>, Vec<PendingWrite>) =
            entries.drain(..).partition(|w| predicate(w));
        entries.extend(kept);
        if removed.is_empty() {
            return Ok(removed);
        }
        self.size_tx.send_replace(entries.len());

        if self.is_persistent() {
            for write in &removed {
                self.store.delete(keys::PENDING_WRITE, &write.id).await?;
            }
            self.persist_order(&entries).await?;
        }
        Ok(removed)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// 队列长度信号（诊断用）
    pub fn size_watch(&self) -> watch::Receiver<usize> {
        self.size_tx.subscribe()
    }

    /// 当前队列长度（无需等待锁）
    pub fn size(&self) -> usize {
        *self.size_tx.borrow()
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent.load(Ordering::SeqCst)
    }

    /// 关闭持久化（存储配额耗尽后降级为仅内存）
    pub fn disable_persistence(&self) {
        if self.persistent.swap(false, Ordering::SeqCst) {
            warn!("⚠️ 离线队列持久化已关闭，后续条目只保存在内存中");
        }
    }

    pub fn is_replaying(&self) -> bool {
        self.replaying.load(Ordering::SeqCst)
    }

    /// 按 FIFO 回放队列
    ///
    /// - `Ok` / `Conflict`：条目移除（冲突由 `apply` 内部解决）
    /// - `NotFound`：条目移除，本地投影由调用方丢弃
    /// - 其余错误：条目保留，停止本轮回放以保证顺序
    ///
    /// 已有回放在进行时直接返回 `skipped = true`。
    pub async fn replay<F, Fut>(&self, mut apply: F) -> Result<ReplayReport>
    where
        F: FnMut(PendingWrite) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        if self
            .replaying
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("离线队列回放已在进行，跳过");
            return Ok(ReplayReport {
                remaining: self.size(),
                skipped: true,
                ..ReplayReport::default()
            });
        }
        let _guard = ReplayGuard(&self.replaying);

        let mut report = ReplayReport::default();
        loop {
            let next = self.entries.read().await.front().cloned();
            let Some(write) = next else { break };
            let write_id = write.id.clone();
            let operation = write.operation.kind();
            let topic = write.operation.topic();

            let outcome = match apply(write).await {
                Ok(()) => ReplayOutcome::Applied,
                Err(e) => match e.kind() {
                    ErrorKind::Conflict => {
                        debug!("回放冲突已按远端记录解决: id={}", write_id);
                        ReplayOutcome::Applied
                    }
                    ErrorKind::NotFound => {
                        info!("回放目标已不存在，丢弃: id={}, kind={}", write_id, operation);
                        ReplayOutcome::Dropped
                    }
                    _ => {
                        warn!("⚠️ 回放失败，保留在队列中: id={}, kind={}, error={}", write_id, operation, e);
                        ReplayOutcome::Deferred
                    }
                },
            };

            report.writes.push(ReplayedWrite {
                write_id: write_id.clone(),
                operation,
                topic,
                outcome,
            });
            match outcome {
                ReplayOutcome::Applied => report.applied += 1,
                ReplayOutcome::Dropped => report.dropped += 1,
                ReplayOutcome::Deferred => break,
            }
            self.remove(&write_id).await?;
        }

        report.remaining = self.len().await;
        if self.is_persistent() {
            self.store.flush().await?;
        }
        info!(
            "离线队列回放完成: applied={}, dropped={}, remaining={}",
            report.applied, report.dropped, report.remaining
        );
        Ok(report)
    }

    async fn persist_order(&self, entries: &VecDeque<PendingWrite>) -> Result<()> {
        let order: Vec<&str> = entries.iter().map(|w| w.id.as_str()).collect();
        self.store.put_reserved(keys::QUEUE_ORDER, &order).await
    }
}
