//! SQLite 检查点存储
//!
//! 连接池 + 事务内取号写入，保证并发下版本号仍单调；跨进程重启可恢复。

#![cfg(feature = "async-sqlite")]

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;

use super::{Checkpoint, CheckpointError, CheckpointStore};
use crate::core::PipelineState;

/// SQLite 检查点存储
pub struct SqliteCheckpointStore {
    pool: sqlx::sqlite::SqlitePool,
}

impl SqliteCheckpointStore {
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self, CheckpointError> {
        let db_url = format!("sqlite:{}?mode=rwc", db_path.as_ref().display());
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await
            .map_err(unavailable)?;

        let store = Self { pool };
        store.init_tables().await?;
        Ok(store)
    }

    async fn init_tables(&self) -> Result<(), CheckpointError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS pipeline_checkpoints (
                thread_id TEXT NOT NULL,
                version INTEGER NOT NULL,
                state_json TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (thread_id, version)
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_pipeline_checkpoints_thread
             ON pipeline_checkpoints(thread_id)",
        )
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;

        Ok(())
    }
}

fn unavailable(e: sqlx::Error) -> CheckpointError {
    CheckpointError::Unavailable(e.to_string())
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn save(&self, thread_id: &str, state: &PipelineState) -> Result<u64, CheckpointError> {
        let state_json =
            serde_json::to_string(state).map_err(|e| CheckpointError::Serde(e.to_string()))?;

        // 事务内取号 + 写入，避免并发丢号
        let mut tx = self.pool.begin().await.map_err(unavailable)?;
        let row = sqlx::query(
            "SELECT COALESCE(MAX(version), 0) AS v FROM pipeline_checkpoints WHERE thread_id = ?",
        )
        .bind(thread_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(unavailable)?;
        let version: i64 = row.get::<i64, _>("v") + 1;

        sqlx::query(
            "INSERT INTO pipeline_checkpoints (thread_id, version, state_json, created_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(thread_id)
        .bind(version)
        .bind(&state_json)
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await
        .map_err(unavailable)?;
        tx.commit().await.map_err(unavailable)?;

        Ok(version as u64)
    }

    async fn load_latest(&self, thread_id: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        let row = sqlx::query(
            "SELECT version, state_json, created_at FROM pipeline_checkpoints
             WHERE thread_id = ? ORDER BY version DESC LIMIT 1",
        )
        .bind(thread_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let version: i64 = row.get("version");
        let state_json: String = row.get("state_json");
        let created_at: String = row.get("created_at");

        let state: PipelineState = serde_json::from_str(&state_json)
            .map_err(|e| CheckpointError::Serde(e.to_string()))?;
        let created_at = DateTime::parse_from_rfc3339(&created_at)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now());

        Ok(Some(Checkpoint {
            version: version as u64,
            state,
            created_at,
        }))
    }

    async fn probe(&self) -> Result<(), CheckpointError> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(unavailable)?;
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

    async fn temp_store() -> (tempfile::TempDir, SqliteCheckpointStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SqliteCheckpointStore::new(dir.path().join("cp.db"))
            .await
            .expect("store");
        (dir, store)
    }

    #[tokio::test]
    async fn test_roundtrip_and_versions() {
        let (_dir, store) = temp_store().await;
        let v1 = store.save("t1", &state(Stage::CacheCheck)).await.unwrap();
        let v2 = store.save("t1", &state(Stage::QueryGeneration)).await.unwrap();
        assert_eq!((v1, v2), (1, 2));

        let cp = store.load_latest("t1").await.unwrap().unwrap();
        assert_eq!(cp.version, 2);
        assert_eq!(cp.state.stage, Stage::QueryGeneration);
    }

    #[tokio::test]
    async fn test_threads_are_isolated() {
        let (_dir, store) = temp_store().await;
        store.save("t1", &state(Stage::CacheCheck)).await.unwrap();
        assert!(store.load_latest("t2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_probe() {
        let (_dir, store) = temp_store().await;
        store.probe().await.unwrap();
    }
}
