//! 线程历史层：同一会话内按规范化文本精确复用
//!
//! 命中时直接重放已存的查询与结果，不再触发生成或执行。

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::cache::CachedAnswer;

/// 单条线程历史记录
#[derive(Debug, Clone)]
pub struct ThreadHistoryEntry {
    pub normalized: String,
    pub answer: CachedAnswer,
    pub created_at: DateTime<Utc>,
}

/// 按线程分桶的历史缓存；每线程条数有上限，超出丢最旧
pub struct ThreadHistoryCache {
    entries: RwLock<HashMap<String, Vec<ThreadHistoryEntry>>>,
    per_thread_limit: usize,
}

impl ThreadHistoryCache {
    pub fn new(per_thread_limit: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            per_thread_limit: per_thread_limit.max(1),
        }
    }

    /// 扫描本线程过往轮次，规范化文本精确匹配
    pub async fn lookup(&self, thread_id: &str, normalized: &str) -> Option<CachedAnswer> {
        let entries = self.entries.read().await;
        entries
            .get(thread_id)?
            .iter()
            .rev()
            .find(|e| e.normalized == normalized)
            .map(|e| e.answer.clone())
    }

    pub async fn store(&self, thread_id: &str, normalized: &str, answer: CachedAnswer) {
        let mut entries = self.entries.write().await;
        let list = entries.entry(thread_id.to_string()).or_default();
        list.push(ThreadHistoryEntry {
            normalized: normalized.to_string(),
            answer,
            created_at: Utc::now(),
        });
        if list.len() > self.per_thread_limit {
            let drop = list.len() - self.per_thread_limit;
            list.drain(..drop);
        }
    }

    /// 会话结束时清理
    pub async fn clear_thread(&self, thread_id: &str) {
        self.entries.write().await.remove(thread_id);
    }
}
