//! KV 存储模块 - 基于 sled 的持久化键值存储
//!
//! 本模块提供：
//! - 按命名空间隔离的 Tree
//! - JSON 编码的值
//! - 批量写入和前缀扫描
//! - 存储配额检查（超限时报错，绝不静默丢弃）

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use sled::{Db, Tree};
use serde::{Serialize, Deserialize};
use tracing::{debug, info};
use crate::error::{FestvoteSDKError, Result};

/// KV 存储统计
#[derive(Debug, Clone, Default)]
pub struct KvStats {
    /// 键数量
    pub key_count: u64,
    /// 键值逻辑字节数（用于配额判断）
    pub logical_bytes: u64,
    /// 配额上限（None 表示不限制）
    pub quota_bytes: Option<u64>,
}

/// KV 存储组件
#[derive(Debug)]
pub struct KvStore {
    base_path: PathBuf,
    /// 主数据库实例
    db: Arc<Db>,
    /// 当前命名空间的 Tree
    tree: Tree,
    /// 已用逻辑字节数
    used_bytes: AtomicU64,
    /// 配额上限
    quota_bytes: Option<u64>,
}

impl KvStore {
    /// 打开 KV 存储（`<base_path>/kv`）
    pub async fn new(base_path: &Path, namespace: &str, quota_bytes: Option<u64>) -> Result<Self> {
        let base_path = base_path.to_path_buf();
        let kv_path = base_path.join("kv");

        tokio::fs::create_dir_all(&kv_path).await
            .map_err(|e| FestvoteSDKError::IO(format!("创建 KV 存储目录失败: {}", e)))?;

        // 上一个会话可能刚释放文件锁，带退避重试
        const MAX_OPEN_RETRIES: u32 = 5;
        const RETRY_DELAY_MS: u64 = 100;
        let mut attempt = 0;
        let db = loop {
            match sled::open(&kv_path) {
                Ok(db) => break db,
                Err(e) => {
                    let msg = e.to_string();
                    let is_lock = msg.contains("could not acquire lock")
                        || msg.contains("Resource temporarily unavailable")
                        || msg.contains("WouldBlock");
                    attempt += 1;
                    if !is_lock || attempt >= MAX_OPEN_RETRIES {
                        return Err(FestvoteSDKError::KvStore(format!("打开 sled 数据库失败: {}", e)));
                    }
                    let delay_ms = RETRY_DELAY_MS * (1 << attempt);
                    tokio::time::sleep(tokio::time::Duration::from_millis(delay_ms)).await;
                }
            }
        };

        let tree_name = format!("ns_{}", namespace);
        let tree = db.open_tree(&tree_name)
            .map_err(|e| FestvoteSDKError::KvStore(format!("打开命名空间 Tree 失败: {}", e)))?;

        let mut used = 0u64;
        for item in tree.iter() {
            let (k, v) = item.map_err(|e| FestvoteSDKError::KvStore(format!("遍历键值对失败: {}", e)))?;
            used += (k.len() + v.len()) as u64;
        }

        info!("KV 存储已打开: path={}, namespace={}, keys={}, bytes={}",
              kv_path.display(), namespace, tree.len(), used);

        Ok(Self {
            base_path,
            db: Arc::new(db),
            tree,
            used_bytes: AtomicU64::new(used),
            quota_bytes,
        })
    }

    /// 存储根目录
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// 写入前检查配额
    fn check_quota(&self, key: &[u8], new_len: usize) -> Result<u64> {
        let old_len = self.tree.get(key)
            .map_err(|e| FestvoteSDKError::KvStore(format!("读取旧值失败: {}", e)))?
            .map(|v| (key.len() + v.len()) as u64)
            .unwrap_or(0);
        let new_total = self.used_bytes.load(Ordering::SeqCst) - old_len + (key.len() + new_len) as u64;

        if let Some(quota) = self.quota_bytes {
            if new_total > quota {
                return Err(FestvoteSDKError::StorageQuota(format!(
                    "写入后将占用 {} 字节，超过配额 {} 字节", new_total, quota
                )));
            }
        }
        Ok(new_total)
    }

    /// 设置键值对
    pub async fn set<K, V>(&self, key: K, value: &V) -> Result<()>
    where
        K: AsRef<[u8]>,
        V: Serialize + ?Sized,
    {
        let value_bytes = serde_json::to_vec(value)
            .map_err(|e| FestvoteSDKError::Serialization(format!("序列化值失败: {}", e)))?;
        let new_total = self.check_quota(key.as_ref(), value_bytes.len())?;

        self.tree.insert(key.as_ref(), value_bytes)
            .map_err(|e| FestvoteSDKError::KvStore(format!("设置键值对失败: {}", e)))?;
        self.used_bytes.store(new_total, Ordering::SeqCst);

        Ok(())
    }

    /// 获取键值对
    pub async fn get<K, V>(&self, key: K) -> Result<Option<V>>
    where
        K: AsRef<[u8]>,
        V: for<'de> Deserialize<'de>,
    {
        let result = self.tree.get(key)
            .map_err(|e| FestvoteSDKError::KvStore(format!("获取键值对失败: {}", e)))?;

        match result {
            Some(value_bytes) => {
                let value = serde_json::from_slice(&value_bytes)
                    .map_err(|e| FestvoteSDKError::Serialization(format!("反序列化值失败: {}", e)))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// 删除键值对，返回是否存在
    pub async fn delete<K>(&self, key: K) -> Result<bool>
    where
        K: AsRef<[u8]>,
    {
        let key = key.as_ref();
        let removed = self.tree.remove(key)
            .map_err(|e| FestvoteSDKError::KvStore(format!("删除键值对失败: {}", e)))?;

        if let Some(old) = &removed {
            self.used_bytes.fetch_sub((key.len() + old.len()) as u64, Ordering::SeqCst);
        }
        Ok(removed.is_some())
    }

    /// 检查键是否存在
    pub async fn exists<K>(&self, key: K) -> Result<bool>
    where
        K: AsRef<[u8]>,
    {
        self.tree.contains_key(key)
            .map_err(|e| FestvoteSDKError::KvStore(format!("检查键存在失败: {}", e)))
    }

    /// 批量设置键值对（原子提交）
    pub async fn set_batch<K, V>(&self, pairs: Vec<(K, V)>) -> Result<()>
    where
        K: AsRef<[u8]>,
        V: Serialize,
    {
        let mut batch = sled::Batch::default();
        let mut projected = self.used_bytes.load(Ordering::SeqCst);

        for (key, value) in &pairs {
            let value_bytes = serde_json::to_vec(value)
                .map_err(|e| FestvoteSDKError::Serialization(format!("序列化值失败: {}", e)))?;
            let old_len = self.tree.get(key.as_ref())
                .map_err(|e| FestvoteSDKError::KvStore(format!("读取旧值失败: {}", e)))?
                .map(|v| (key.as_ref().len() + v.len()) as u64)
                .unwrap_or(0);
            projected = projected - old_len + (key.as_ref().len() + value_bytes.len()) as u64;
            batch.insert(key.as_ref(), value_bytes);
        }

        if let Some(quota) = self.quota_bytes {
            if projected > quota {
                return Err(FestvoteSDKError::StorageQuota(format!(
                    "批量写入后将占用 {} 字节，超过配额 {} 字节", projected, quota
                )));
            }
        }

        self.tree.apply_batch(batch)
            .map_err(|e| FestvoteSDKError::KvStore(format!("批量设置失败: {}", e)))?;
        self.used_bytes.store(projected, Ordering::SeqCst);
        debug!("批量写入 {} 个键值对", pairs.len());

        Ok(())
    }

    /// 获取指定前缀的所有键值对（按键字节序）
    pub async fn scan_prefix<V>(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, V)>>
    where
        V: for<'de> Deserialize<'de>,
    {
        let mut results = Vec::new();

        for result in self.tree.scan_prefix(prefix) {
            let (key, value_bytes) = result
                .map_err(|e| FestvoteSDKError::KvStore(format!("扫描前缀失败: {}", e)))?;

            let value = serde_json::from_slice(&value_bytes)
                .map_err(|e| FestvoteSDKError::Serialization(format!("反序列化值失败: {}", e)))?;

            results.push((key.to_vec(), value));
        }

        Ok(results)
    }

    /// 强制落盘
    pub async fn flush(&self) -> Result<()> {
        self.db.flush_async().await
            .map_err(|e| FestvoteSDKError::KvStore(format!("落盘失败: {}", e)))?;
        Ok(())
    }

    /// 获取统计信息
    pub fn stats(&self) -> KvStats {
        KvStats {
            key_count: self.tree.len() as u64,
            logical_bytes: self.used_bytes.load(Ordering::SeqCst),
            quota_bytes: self.quota_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use serde_json::json;

    #[tokio::test]
    async fn test_kv_store_basic_operations() {
        let temp_dir = TempDir::new().unwrap();
        let store = KvStore::new(temp_dir.path(), "test", None).await.unwrap();

        let test_data = json!({
            "name": "test",
            "value": 123
        });

        store.set("test_key", &test_data).await.unwrap();
        let retrieved: serde_json::Value = store.get("test_key").await.unwrap().unwrap();
        assert_eq!(retrieved, test_data);

        assert!(store.exists("test_key").await.unwrap());
        assert!(!store.exists("non_existent_key").await.unwrap());

        assert!(store.delete("test_key").await.unwrap());
        let deleted: Option<serde_json::Value> = store.get("test_key").await.unwrap();
        assert!(deleted.is_none());
        assert_eq!(store.stats().logical_bytes, 0);
    }

    #[tokio::test]
    async fn test_kv_store_batch_and_prefix() {
        let temp_dir = TempDir::new().unwrap();
        let store = KvStore::new(temp_dir.path(), "test", None).await.unwrap();

        let pairs = vec![
            ("artist:1", json!({"value": 1})),
            ("artist:2", json!({"value": 2})),
            ("set:1", json!({"value": 3})),
        ];
        store.set_batch(pairs).await.unwrap();

        let results: Vec<(Vec<u8>, serde_json::Value)> = store.scan_prefix(b"artist:").await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(store.stats().key_count, 3);
    }

    #[tokio::test]
    async fn test_kv_store_quota_is_reported() {
        let temp_dir = TempDir::new().unwrap();
        let store = KvStore::new(temp_dir.path(), "test", Some(64)).await.unwrap();

        store.set("small", &json!(1)).await.unwrap();

        let big = "x".repeat(128);
        let err = store.set("big", &big).await.unwrap_err();
        assert!(matches!(err, FestvoteSDKError::StorageQuota(_)));

        // 超限写入不应落地
        let missing: Option<String> = store.get("big").await.unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_kv_store_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        {
            let store = KvStore::new(temp_dir.path(), "test", None).await.unwrap();
            store.set("persisted", &json!({"ok": true})).await.unwrap();
            store.flush().await.unwrap();
        }

        let reopened = KvStore::new(temp_dir.path(), "test", None).await.unwrap();
        let value: serde_json::Value = reopened.get("persisted").await.unwrap().unwrap();
        assert_eq!(value, json!({"ok": true}));
        assert!(reopened.stats().logical_bytes > 0);
    }
}
