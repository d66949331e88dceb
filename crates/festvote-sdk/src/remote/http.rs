//! REST 数据源 - 基于 reqwest 的 PostgREST 风格客户端
//!
//! - 查询：`GET {base}/rest/v1/{topic}?col=eq.val`
//! - 写入：`POST`，`Prefer: resolution=merge-duplicates,return=representation`
//! - 删除：`DELETE {base}/rest/v1/{topic}?id=eq.{id}`
//! - 推送：`GET {base}/realtime/v1/{topic}`（server-sent events）

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::{value_as_param, ChangeEvent, ChangeKind, Filter, RemoteChannel, RemoteDataSource, Topic};
use crate::error::{FestvoteSDKError, Result};
use crate::storage::record_id_of;
use crate::utils::now_millis;

/// REST 数据源配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestDataSourceConfig {
    /// 服务根地址，例如 https://api.example.com
    pub base_url: String,
    /// 匿名 API key（apikey 头）
    pub api_key: Option<String>,
    /// 用户访问令牌（Authorization: Bearer）
    pub access_token: Option<String>,
    /// 连接超时（秒）
    pub connect_timeout_secs: u64,
    /// 各 topic 的 upsert 冲突列，如 votes -> "user_id,target_id"
    pub conflict_targets: HashMap<String, String>,
}

impl Default for RestDataSourceConfig {
    fn default() -> Self {
        let mut conflict_targets = HashMap::new();
        conflict_targets.insert("votes".to_string(), "user_id,target_id".to_string());
        conflict_targets.insert("artist_knowledge".to_string(), "user_id,target_id".to_string());
        Self {
            base_url: "http://localhost:54321".to_string(),
            api_key: None,
            access_token: None,
            connect_timeout_secs: 5,
            conflict_targets,
        }
    }
}

/// REST 数据源
pub struct RestDataSource {
    client: Client,
    config: RestDataSourceConfig,
}

impl RestDataSource {
    /// 创建 REST 数据源
    ///
    /// 请求级超时由调用方的 `with_timeout` 控制，这里只设置连接超时。
    pub fn new(config: RestDataSourceConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .map_err(|e| FestvoteSDKError::Config(format!("创建 HTTP 客户端失败: {}", e)))?;

        info!("✅ REST 数据源已创建 (base_url: {})", config.base_url);
        Ok(Self { client, config })
    }

    fn table_url(&self, topic: &Topic) -> String {
        format!("{}/rest/v1/{}", self.config.base_url.trim_end_matches('/'), topic)
    }

    fn realtime_url(&self, topic: &Topic) -> String {
        format!("{}/realtime/v1/{}", self.config.base_url.trim_end_matches('/'), topic)
    }

    fn authorize(&self, builder: RequestBuilder) -> RequestBuilder {
        let mut builder = builder;
        if let Some(key) = &self.config.api_key {
            builder = builder.header("apikey", key);
        }
        let bearer = self.config.access_token.as_ref().or(self.config.api_key.as_ref());
        if let Some(token) = bearer {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    /// 非 2xx 响应转换为错误
    async fn check(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_else(|_| "无法读取错误信息".to_string());
        warn!("REST 请求失败: status={}, body={}", status, body);
        Err(FestvoteSDKError::from_status(status.as_u16(), body))
    }
}

fn filter_query(filter: &Filter) -> Vec<(String, String)> {
    filter
        .eq
        .iter()
        .map(|(field, value)| (field.clone(), format!("eq.{}", value_as_param(value))))
        .collect()
}

#[async_trait]
impl RemoteDataSource for RestDataSource {
    async fn fetch(&self, topic: &Topic, filter: &Filter) -> Result<Vec<Value>> {
        let mut query = vec![("select".to_string(), "*".to_string())];
        query.extend(filter_query(filter));

        let request = self.authorize(self.client.get(self.table_url(topic)).query(&query));
        let response = Self::check(request.send().await?).await?;
        let rows: Vec<Value> = response.json().await?;
        debug!("REST fetch {} -> {} 条", topic, rows.len());
        Ok(rows)
    }

    async fn upsert(&self, topic: &Topic, record: Value) -> Result<Value> {
        let mut request = self
            .client
            .post(self.table_url(topic))
            .header("Prefer", "resolution=merge-duplicates,return=representation")
            .json(&record);
        if let Some(columns) = self.config.conflict_targets.get(topic.as_str()) {
            request = request.query(&[("on_conflict", columns.as_str())]);
        }

        let response = Self::check(self.authorize(request).send().await?).await?;
        let mut rows: Vec<Value> = response.json().await?;
        if rows.is_empty() {
            return Err(FestvoteSDKError::Other(format!("{} upsert 未返回记录", topic)));
        }
        Ok(rows.swap_remove(0))
    }

    async fn remove(&self, topic: &Topic, id: &str) -> Result<()> {
        let request = self
            .client
            .delete(self.table_url(topic))
            .header("Prefer", "return=representation")
            .query(&[("id", format!("eq.{}", id))]);

        let response = Self::check(self.authorize(request).send().await?).await?;
        let rows: Vec<Value> = response.json().await?;
        if rows.is_empty() {
            return Err(FestvoteSDKError::NotFound(format!("{}:{}", topic, id)));
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &Topic) -> Result<RemoteChannel> {
        let request = self
            .client
            .get(self.realtime_url(topic))
            .header("Accept", "text/event-stream");
        let response = Self::check(self.authorize(request).send().await?).await?;
        info!("📡 推送通道握手完成: {}", topic);

        let topic = topic.clone();
        let bytes = response.bytes_stream();
        let events = futures::stream::unfold(
            (bytes, String::new(), Vec::<Result<ChangeEvent>>::new()),
            move |(mut bytes, mut buffer, mut ready)| {
                let topic = topic.clone();
                async move {
                    loop {
                        if !ready.is_empty() {
                            let next = ready.remove(0);
                            return Some((next, (bytes, buffer, ready)));
                        }
                        match bytes.next().await {
                            Some(Ok(chunk)) => {
                                buffer.push_str(&String::from_utf8_lossy(&chunk));
                                for payload in drain_sse_frames(&mut buffer) {
                                    if let Some(event) = parse_change_payload(&topic, &payload) {
                                        ready.push(Ok(event));
                                    }
                                }
                            }
                            Some(Err(e)) => {
                                return Some((Err(FestvoteSDKError::from(e)), (bytes, buffer, ready)));
                            }
                            None => return None,
                        }
                    }
                }
            },
        );

        Ok(RemoteChannel::new(Box::pin(events)))
    }
}

/// 从缓冲区取出完整的 SSE 帧，返回各帧拼接后的 data 内容
fn drain_sse_frames(buffer: &mut String) -> Vec<String> {
    let mut payloads = Vec::new();
    let normalized = buffer.replace("\r\n", "\n");
    *buffer = normalized;

    while let Some(end) = buffer.find("\n\n") {
        let frame: String = buffer.drain(..end + 2).collect();
        let data: Vec<&str> = frame
            .lines()
            .filter_map(|line| line.strip_prefix("data:"))
            .map(|d| d.trim_start())
            .collect();
        if !data.is_empty() {
            payloads.push(data.join("\n"));
        }
    }
    payloads
}

/// 解析变更负载：`{"type": "INSERT|UPDATE|DELETE", "record": {...}, "old_record": {...}}`
fn parse_change_payload(topic: &Topic, payload: &str) -> Option<ChangeEvent> {
    let value: Value = match serde_json::from_str(payload) {
        Ok(v) => v,
        Err(e) => {
            warn!("忽略无法解析的推送负载 ({}): {}", topic, e);
            return None;
        }
    };
    let kind = match value.get("type").and_then(Value::as_str)? {
        "INSERT" => ChangeKind::Insert,
        "UPDATE" => ChangeKind::Update,
        "DELETE" => ChangeKind::Delete,
        other => {
            debug!("忽略未知推送类型: {}", other);
            return None;
        }
    };
    let record_id = value
        .get("record")
        .and_then(record_id_of)
        .or_else(|| value.get("old_record").and_then(record_id_of));

    Some(ChangeEvent {
        topic: topic.clone(),
        kind,
        record_id,
        at: now_millis(),
    })
}
