//! 检查点存储：每次阶段迁移后持久化流水线状态
//!
//! 按会话线程 ID 键控，版本号单调递增；支持「取最新」与不写数据的可达性探针。
//! 内存实现始终可用；SQLite 实现（连接池 + 事务）在 async-sqlite feature 下提供。

#[cfg(feature = "async-sqlite")]
pub mod sqlite;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::RwLock;

use crate::core::PipelineState;

#[cfg(feature = "async-sqlite")]
pub use sqlite::SqliteCheckpointStore;

/// 检查点存储错误
#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("serialization failed: {0}")]
    Serde(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// 一条已持久化的检查点
#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub version: u64,
    pub state: PipelineState,
    pub created_at: DateTime<Utc>,
}

/// 检查点存储接口
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// 持久化快照，返回该线程新的单调版本号
    async fn save(&self, thread_id: &str, state: &PipelineState) -> Result<u64, CheckpointError>;

    /// 取线程最新快照
    async fn load_latest(&self, thread_id: &str) -> Result<Option<Checkpoint>, CheckpointError>;

    /// 可达性探针；绝不改动数据
    async fn probe(&self) -> Result<(), CheckpointError>;
}

struct StoredCheckpoint {
    version: u64,
    state_json: String,
    created_at: DateTime<Utc>,
}

/// 内存检查点存储；每线程保留最近 keep_versions 个版本
pub struct MemoryCheckpointStore {
    threads: RwLock<HashMap<String, Vec<StoredCheckpoint>>>,
    keep_versions: usize,
}

impl MemoryCheckpointStore {
    pub fn new(keep_versions: usize) -> Self {
        Self {
            threads: RwLock::new(HashMap::new()),
            keep_versions: keep_versions.max(1),
        }
    }
}

impl Default for MemoryCheckpointStore {
    fn default() -> Self {
        Self::new(20)
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn save(&self, thread_id: &str, state: &PipelineState) -> Result<u64, CheckpointError> {
        let state_json =
            serde_json::to_string(state).map_err(|e| CheckpointError::Serde(e.to_string()))?;
        let mut threads = self.threads.write().await;
        let list = threads.entry(thread_id.to_string()).or_default();
        let version = list.last().map(|c| c.version + 1).unwrap_or(1);
        list.push(StoredCheckpoint {
            version,
            state_json,
            created_at: Utc::now(),
        });
        if list.len() > self.keep_versions {
            let drop = list.len() - self.keep_versions;
            list.drain(..drop);
        }
        Ok(version)
    }

    async fn load_latest(&self, thread_id: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        let threads = self.threads.read().await;
        let Some(stored) = threads.get(thread_id).and_then(|l| l.last()) else {
            return Ok(None);
        };
        let state: PipelineState = serde_json::from_str(&stored.state_json)
            .map_err(|e| CheckpointError::Serde(e.to_string()))?;
        Ok(Some(Checkpoint {
            version: stored.version,
            state,
            created_at: stored.created_at,
        }))
    }

    async fn probe(&self) -> Result<(), CheckpointError> {
        // 内存存储恒可达
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{PipelineState, Stage};
    use crate::validation::Dialect;

    fn state(stage: Stage) -> PipelineState {
        let mut s = PipelineState::new("t1", "ds", Dialect::MySql, "show orders", 3);
        s.stage = stage;
        s
    }

    #[tokio::test]
    async fn test_versions_monotonic() {
        let store = MemoryCheckpointStore::default();
        let v1 = store.save("t1", &state(Stage::CacheCheck)).await.unwrap();
        let v2 = store.save("t1", &state(Stage::SchemaLookup)).await.unwrap();
        assert!(v2 > v1);
    }

    #[tokio::test]
    async fn test_load_latest_returns_newest() {
        let store = MemoryCheckpointStore::default();
        store.save("t1", &state(Stage::CacheCheck)).await.unwrap();
        store.save("t1", &state(Stage::QueryGeneration)).await.unwrap();
        let cp = store.load_latest("t1").await.unwrap().unwrap();
        assert_eq!(cp.state.stage, Stage::QueryGeneration);
        assert_eq!(cp.version, 2);
    }

    #[tokio::test]
    async fn test_missing_thread_is_none() {
        let store = MemoryCheckpointStore::default();
        assert!(store.load_latest("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_probe_never_mutates() {
        let store = MemoryCheckpointStore::default();
        store.probe().await.unwrap();
        assert!(store.load_latest("t1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_keep_versions_trims_oldest() {
        let store = MemoryCheckpointStore::new(2);
        for _ in 0..5 {
            store.save("t1", &state(Stage::CacheCheck)).await.unwrap();
        }
        let cp = store.load_latest("t1").await.unwrap().unwrap();
        // 版本号不因裁剪回退
        assert_eq!(cp.version, 5);
    }
}
