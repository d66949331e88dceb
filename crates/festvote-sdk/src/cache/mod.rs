//! 查询缓存
//!
//! 进程内唯一的内存缓存，所有读取结果与乐观写入都落在这里。
//! 写入是同步的（`parking_lot::RwLock`），UI 在调用返回后立即可见。
//!
//! 每个键维护单调递增的版本号：任何写入（包括回滚）都会推进版本，
//! 晚到的读取结果通过 `set_if_version` 丢弃。

use std::collections::HashMap;
use std::fmt;

use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::Result;
use crate::remote::{Filter, Topic};
use crate::utils::{millis_since, now_millis};

/// 缓存键：`topic:scope`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub topic: Topic,
    pub scope: String,
}

impl CacheKey {
    pub fn new(topic: impl Into<Topic>, scope: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            scope: scope.into(),
        }
    }

    /// 查询结果的键，scope 由过滤条件决定
    pub fn for_query(topic: &Topic, filter: &Filter) -> Self {
        Self {
            topic: topic.clone(),
            scope: filter.scope(),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.topic, self.scope)
    }
}

impl From<Topic> for CacheKey {
    fn from(topic: Topic) -> Self {
        CacheKey::new(topic, "*")
    }
}

/// 数据来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataSource {
    Online,
    Offline,
}

/// 缓存条目
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub value: Value,
    pub data_source: DataSource,
    pub fetched_at: i64,
    pub version: u64,
    /// 被推送失效，下一次读取需要重新拉取
    pub stale: bool,
    /// 产生该条目的查询条件，失效后按它重新读取
    pub filter: Option<Filter>,
}

impl CacheEntry {
    /// 在线数据在新鲜期内且未失效
    pub fn is_fresh(&self, stale_after_ms: u64) -> bool {
        !self.stale
            && self.data_source == DataSource::Online
            && millis_since(self.fetched_at) < stale_after_ms
    }

    pub fn typed<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.value.clone())?)
    }
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<CacheKey, CacheEntry>,
    /// 版本号独立保存，删除条目后也不会回退
    versions: HashMap<CacheKey, u64>,
}

impl CacheInner {
    fn bump(&mut self, key: &CacheKey) -> u64 {
        let version = self.versions.entry(key.clone()).or_insert(0);
        *version += 1;
        *version
    }
}

/// 查询缓存
#[derive(Default)]
pub struct QueryCache {
    inner: RwLock<CacheInner>,
}

impl QueryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.inner.read().entries.get(key).cloned()
    }

    /// 当前值（回滚快照用）
    pub fn value(&self, key: &CacheKey) -> Option<Value> {
        self.inner.read().entries.get(key).map(|e| e.value.clone())
    }

    pub fn get_typed<T: DeserializeOwned>(&self, key: &CacheKey) -> Result<Option<T>> {
        match self.value(key) {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// 写入并推进版本，保留已有条目的查询条件
    pub fn set(&self, key: CacheKey, value: Value, data_source: DataSource) -> u64 {
        let mut inner = self.inner.write();
        let filter = inner.entries.get(&key).and_then(|e| e.filter.clone());
        Self::write_locked(&mut inner, key, value, data_source, filter)
    }

    /// 写入查询结果
    pub fn set_query(&self, key: CacheKey, value: Value, data_source: DataSource, filter: Filter) -> u64 {
        let mut inner = self.inner.write();
        Self::write_locked(&mut inner, key, value, data_source, Some(filter))
    }

    /// 当前版本号，从未写入过为 0
    pub fn version(&self, key: &CacheKey) -> u64 {
        self.inner.read().versions.get(key).copied().unwrap_or(0)
    }

    /// 仅当版本号仍为 `seen_version` 时写入
    ///
    /// 读取开始前记下版本，结果返回时若期间发生过乐观写入则丢弃。
    pub fn set_if_version(
        &self,
        key: CacheKey,
        value: Value,
        data_source: DataSource,
        filter: Option<Filter>,
        seen_version: u64,
    ) -> Option<u64> {
        let mut inner = self.inner.write();
        let current = inner.versions.get(&key).copied().unwrap_or(0);
        if current != seen_version {
            debug!("丢弃过期读取: key={}, seen={}, current={}", key, seen_version, current);
            return None;
        }
        let filter = filter.or_else(|| inner.entries.get(&key).and_then(|e| e.filter.clone()));
        Some(Self::write_locked(&mut inner, key, value, data_source, filter))
    }

    /// 恢复快照（回滚），`None` 表示写入前没有条目
    pub fn restore(&self, key: CacheKey, snapshot: Option<Value>) -> u64 {
        self.replace(key, snapshot)
    }

    /// 写入或删除，保留已有条目的来源、拉取时间与查询条件
    pub fn replace(&self, key: CacheKey, value: Option<Value>) -> u64 {
        let mut inner = self.inner.write();
        match value {
            Some(value) => {
                let previous = inner.entries.get(&key).map(|e| (e.data_source, e.filter.clone(), e.fetched_at, e.stale));
                let (source, filter, fetched_at, stale) = previous.unwrap_or((DataSource::Online, None, now_millis(), false));
                let version = Self::write_locked(&mut inner, key.clone(), value, source, filter);
                if let Some(entry) = inner.entries.get_mut(&key) {
                    entry.fetched_at = fetched_at;
                    entry.stale = stale;
                }
                version
            }
            None => {
                inner.entries.remove(&key);
                inner.bump(&key)
            }
        }
    }

    /// 标记失效，返回条目是否存在
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        match self.inner.write().entries.get_mut(key) {
            Some(entry) => {
                entry.stale = true;
                true
            }
            None => false,
        }
    }

    /// 标记某个 topic 下的全部条目失效
    pub fn invalidate_topic(&self, topic: &Topic) -> Vec<CacheKey> {
        let mut inner = self.inner.write();
        let mut keys = Vec::new();
        for (key, entry) in inner.entries.iter_mut().filter(|(k, _)| &k.topic == topic) {
            entry.stale = true;
            keys.push(key.clone());
        }
        keys
    }

    pub fn keys_for_topic(&self, topic: &Topic) -> Vec<CacheKey> {
        self.inner
            .read()
            .entries
            .keys()
            .filter(|k| &k.topic == topic)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 清空（切换用户时）。版本号保留，在途的旧读取仍会被丢弃
    pub fn clear(&self) {
        let mut inner = self.inner.write();
        let keys: Vec<CacheKey> = inner.entries.keys().cloned().collect();
        for key in &keys {
            inner.bump(key);
        }
        inner.entries.clear();
    }

    fn write_locked(
        inner: &mut CacheInner,
        key: CacheKey,
        value: Value,
        data_source: DataSource,
        filter: Option<Filter>,
    ) -> u64 {
        let version = inner.bump(&key);
        inner.entries.insert(
            key.clone(),
            CacheEntry {
                key,
                value,
                data_source,
                fetched_at: now_millis(),
                version,
                stale: false,
                filter,
            },
        );
        version
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn key(scope: &str) -> CacheKey {
        CacheKey::new("votes", scope)
    }

    #[test]
    fn test_versions_are_monotonic() {
        let cache = QueryCache::new();
        assert_eq!(cache.version(&key("s1")), 0);

        let v1 = cache.set(key("s1"), json!(1), DataSource::Online);
        let v2 = cache.set(key("s1"), json!(2), DataSource::Online);
        assert!(v2 > v1);

        // 回滚到空也会推进版本
        let v3 = cache.restore(key("s1"), None);
        assert!(v3 > v2);
        assert!(cache.get(&key("s1")).is_none());
        assert_eq!(cache.version(&key("s1")), v3);
    }

    #[test]
    fn test_set_if_version_discards_late_read() {
        let cache = QueryCache::new();
        let seen = cache.version(&key("s1"));

        // 读取在途期间发生了乐观写入
        cache.set(key("s1"), json!({"optimistic": true}), DataSource::Online);

        let applied = cache.set_if_version(key("s1"), json!({"stale": true}), DataSource::Online, None, seen);
        assert!(applied.is_none());
        assert_eq!(cache.value(&key("s1")), Some(json!({"optimistic": true})));

        let seen = cache.version(&key("s1"));
        assert!(cache
            .set_if_version(key("s1"), json!({"fresh": true}), DataSource::Online, None, seen)
            .is_some());
    }

    #[test]
    fn test_restore_is_exact() {
        let cache = QueryCache::new();
        let before = json!({"target_id": "s1", "votes": [{"user_id": "u1", "vote_type": 1}]});
        cache.set(key("s1"), before.clone(), DataSource::Offline);
        let snapshot = cache.value(&key("s1"));

        cache.set(key("s1"), json!({"target_id": "s1", "votes": []}), DataSource::Offline);
        cache.restore(key("s1"), snapshot);

        let entry = cache.get(&key("s1")).unwrap();
        assert_eq!(entry.value, before);
        assert_eq!(entry.data_source, DataSource::Offline);
    }

    #[test]
    fn test_invalidate_topic() {
        let cache = QueryCache::new();
        let filter = Filter::new().eq("target_id", "s1");
        cache.set_query(CacheKey::for_query(&Topic::new("notes"), &filter), json!([]), DataSource::Online, filter);
        cache.set(key("s1"), json!({}), DataSource::Online);
        cache.set(key("s2"), json!({}), DataSource::Online);

        let mut keys = cache.invalidate_topic(&Topic::new("votes"));
        keys.sort_by(|a, b| a.scope.cmp(&b.scope));
        assert_eq!(keys, vec![key("s1"), key("s2")]);
        assert!(cache.get(&key("s1")).unwrap().stale);
        assert!(!cache.get(&key("s1")).unwrap().is_fresh(60_000));

        let notes = cache.keys_for_topic(&Topic::new("notes"));
        assert_eq!(notes.len(), 1);
        assert!(cache.get(&notes[0]).unwrap().filter.is_some());
    }

    #[test]
    fn test_freshness_window() {
        let cache = QueryCache::new();
        cache.set(key("s1"), json!({}), DataSource::Online);
        assert!(cache.get(&key("s1")).unwrap().is_fresh(60_000));
        assert!(!cache.get(&key("s1")).unwrap().is_fresh(0));

        cache.set(key("s2"), json!({}), DataSource::Offline);
        assert!(!cache.get(&key("s2")).unwrap().is_fresh(60_000));
    }
}
