//! 精确全局缓存：规范化文本 + 数据源 ID -> 已生成查询与结果
//!
//! 跨会话共享；按键哈希分片，避免整库锁。

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::cache::CachedAnswer;

const SHARD_COUNT: usize = 16;

/// 单条精确缓存记录
#[derive(Debug, Clone)]
pub struct ExactCacheEntry {
    pub answer: CachedAnswer,
    pub created_at: DateTime<Utc>,
}

/// 分片精确缓存
pub struct ExactCache {
    shards: Vec<RwLock<HashMap<String, ExactCacheEntry>>>,
    max_entries_per_shard: usize,
}

impl ExactCache {
    pub fn new(max_entries: usize) -> Self {
        let per_shard = (max_entries / SHARD_COUNT).max(1);
        Self {
            shards: (0..SHARD_COUNT)
                .map(|_| RwLock::new(HashMap::new()))
                .collect(),
            max_entries_per_shard: per_shard,
        }
    }

    fn key(datasource_id: &str, normalized: &str) -> String {
        format!("{}\n{}", datasource_id, normalized)
    }

    fn shard_of(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % SHARD_COUNT
    }

    pub async fn lookup(&self, datasource_id: &str, normalized: &str) -> Option<CachedAnswer> {
        let key = Self::key(datasource_id, normalized);
        let shard = self.shards[self.shard_of(&key)].read().await;
        shard.get(&key).map(|e| e.answer.clone())
    }

    pub async fn store(&self, datasource_id: &str, normalized: &str, answer: CachedAnswer) {
        let key = Self::key(datasource_id, normalized);
        let idx = self.shard_of(&key);
        let mut shard = self.shards[idx].write().await;
        if shard.len() >= self.max_entries_per_shard && !shard.contains_key(&key) {
            // 满载时淘汰最旧一条
            if let Some(oldest) = shard
                .iter()
                .min_by_key(|(_, e)| e.created_at)
                .map(|(k, _)| k.clone())
            {
                shard.remove(&oldest);
            }
        }
        shard.insert(
            key,
            ExactCacheEntry {
                answer,
                created_at: Utc::now(),
            },
        );
    }
}
