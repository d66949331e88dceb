//! 远端数据源
//!
//! 按 topic（逻辑表）提供 fetch / upsert / remove / subscribe。
//!
//! ## NOTE: 数据源不做重试
//!
//! 所有调用都可能以 Network / Conflict / NotFound 失败，重试策略属于调用方
//! （乐观写入引擎回滚，离线队列等待下一次重连）。

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{FestvoteSDKError, Result};

pub mod http;
pub mod memory;

pub use http::{RestDataSource, RestDataSourceConfig};
pub use memory::MemoryDataSource;

/// 逻辑表 / 推送流名称
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Topic(String);

impl Topic {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Topic {
    fn from(value: &str) -> Self {
        Topic::new(value)
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// 查询过滤条件（多个等值条件取 AND）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub eq: Vec<(String, Value)>,
}

impl Filter {
    /// 不带条件（整表）
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加等值条件
    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.eq.push((field.into(), value.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.eq.is_empty()
    }

    /// 在本地 JSON 记录上求值（离线读取用）
    pub fn matches(&self, record: &Value) -> bool {
        self.eq.iter().all(|(field, expected)| record.get(field) == Some(expected))
    }

    /// 作为缓存键的 scope 部分，条件顺序无关
    pub fn scope(&self) -> String {
        if self.eq.is_empty() {
            return "*".to_string();
        }
        let mut parts: Vec<String> = self
            .eq
            .iter()
            .map(|(field, value)| format!("{}={}", field, value_as_param(value)))
            .collect();
        parts.sort();
        parts.join("&")
    }
}

/// JSON 值转查询参数文本（字符串不带引号）
pub(crate) fn value_as_param(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// 远端变更类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// 远端推送的变更事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub topic: Topic,
    pub kind: ChangeKind,
    pub record_id: Option<String>,
    pub at: i64,
}

/// 变更事件流
pub type ChangeStream = BoxStream<'static, Result<ChangeEvent>>;

/// 已建立的推送通道
///
/// 由打开它的组件持有，`close()` 或 drop 时释放服务端资源。
pub struct RemoteChannel {
    events: Option<ChangeStream>,
    closer: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl RemoteChannel {
    pub fn new(events: ChangeStream) -> Self {
        Self { events: Some(events), closer: None }
    }

    /// 附加关闭回调（如通知服务端退订）
    pub fn with_closer(mut self, closer: impl FnOnce() + Send + Sync + 'static) -> Self {
        self.closer = Some(Box::new(closer));
        self
    }

    /// 取出事件流（只能取一次）
    pub fn take_events(&mut self) -> Option<ChangeStream> {
        self.events.take()
    }

    /// 关闭通道
    pub fn close(mut self) {
        self.events = None;
        if let Some(closer) = self.closer.take() {
            closer();
        }
    }
}

impl Drop for RemoteChannel {
    // 任务被取消时通道随之释放
    fn drop(&mut self) {
        if let Some(closer) = self.closer.take() {
            closer();
        }
    }
}

impl std::fmt::Debug for RemoteChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteChannel")
            .field("has_events", &self.events.is_some())
            .field("has_closer", &self.closer.is_some())
            .finish()
    }
}

/// 远端数据源契约
#[async_trait]
pub trait RemoteDataSource: Send + Sync {
    /// 拉取满足条件的记录
    async fn fetch(&self, topic: &Topic, filter: &Filter) -> Result<Vec<Value>>;

    /// 插入或更新，返回服务端规范化后的记录
    async fn upsert(&self, topic: &Topic, record: Value) -> Result<Value>;

    /// 按 id 删除
    async fn remove(&self, topic: &Topic, id: &str) -> Result<()>;

    /// 建立推送通道（握手完成后返回）
    async fn subscribe(&self, topic: &Topic) -> Result<RemoteChannel>;
}

/// 为远端调用加超时，超时视为网络错误
pub async fn with_timeout<T, F>(timeout: Duration, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, future).await {
        Ok(result) => result,
        Err(_) => Err(FestvoteSDKError::Timeout(format!(
            "远端调用超过 {} ms 未返回", timeout.as_millis()
        ))),
    }
}
