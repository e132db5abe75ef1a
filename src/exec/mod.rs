//! 查询执行服务：外部数据源协作方
//!
//! 调用方用 tokio::time::timeout 兜底；支持下推的方言（MySQL）另加执行时限提示，
//! 失控查询不会阻塞流水线。批量刷新用 Semaphore 限制并发，避免压垮数据源。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Semaphore;

use crate::validation::Dialect;

/// 执行错误
#[derive(Error, Debug, Clone)]
pub enum ExecError {
    #[error("query timeout after {0}s")]
    Timeout(u64),

    #[error("permission denied: {0}")]
    Permission(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("query error: {0}")]
    Query(String),
}

impl ExecError {
    /// 瞬时错误（可安全重试）
    pub fn is_transient(&self) -> bool {
        matches!(self, ExecError::Timeout(_) | ExecError::Connection(_))
    }
}

/// 一次成功执行的结果
#[derive(Debug, Clone)]
pub struct QueryOutcome {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
    pub elapsed_ms: u64,
}

/// 查询执行服务
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    /// 执行查询；实现方应尊重传入的超时
    async fn execute(
        &self,
        query: &str,
        datasource_id: &str,
        timeout: Duration,
    ) -> Result<QueryOutcome, ExecError>;
}

/// 支持下推时在查询上附加执行时限；不支持的方言原样返回
pub fn apply_timeout_hint(query: &str, dialect: Dialect, timeout: Duration) -> String {
    match dialect {
        Dialect::MySql => {
            let ms = timeout.as_millis().max(1);
            let trimmed = query.trim_start();
            if trimmed.to_lowercase().starts_with("select") {
                let rest = &trimmed["select".len()..];
                format!("SELECT /*+ MAX_EXECUTION_TIME({}) */{}", ms, rest)
            } else {
                query.to_string()
            }
        }
        _ => query.to_string(),
    }
}

/// 内存 Mock 执行器：按数据源预置结果；可注入失败脚本
pub struct MockQueryExecutor {
    results: HashMap<String, QueryOutcome>,
    failures: tokio::sync::Mutex<Vec<ExecError>>,
}

impl MockQueryExecutor {
    pub fn new() -> Self {
        Self {
            results: HashMap::new(),
            failures: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn with_result(
        mut self,
        datasource_id: impl Into<String>,
        columns: Vec<&str>,
        rows: Vec<Vec<serde_json::Value>>,
    ) -> Self {
        self.results.insert(
            datasource_id.into(),
            QueryOutcome {
                columns: columns.into_iter().map(String::from).collect(),
                rows,
                elapsed_ms: 1,
            },
        );
        self
    }

    /// 注入失败脚本：后续调用依次弹出这些错误，弹完后恢复正常
    pub async fn push_failures(&self, errors: Vec<ExecError>) {
        let mut failures = self.failures.lock().await;
        failures.extend(errors);
    }
}

impl Default for MockQueryExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueryExecutor for MockQueryExecutor {
    async fn execute(
        &self,
        _query: &str,
        datasource_id: &str,
        _timeout: Duration,
    ) -> Result<QueryOutcome, ExecError> {
        {
            let mut failures = self.failures.lock().await;
            if !failures.is_empty() {
                return Err(failures.remove(0));
            }
        }
        self.results
            .get(datasource_id)
            .cloned()
            .ok_or_else(|| ExecError::Connection(format!("unknown datasource: {}", datasource_id)))
    }
}

/// 批量刷新：对一批已缓存查询重新执行，受固定并发上限约束
pub struct BulkRefresher {
    executor: Arc<dyn QueryExecutor>,
    semaphore: Arc<Semaphore>,
    timeout: Duration,
}

impl BulkRefresher {
    pub fn new(executor: Arc<dyn QueryExecutor>, max_concurrency: usize, timeout: Duration) -> Self {
        Self {
            executor,
            semaphore: Arc::new(Semaphore::new(max_concurrency.max(1))),
            timeout,
        }
    }

    /// 逐条刷新 (query, datasource_id)；返回与输入同序的结果
    pub async fn refresh_all(
        &self,
        jobs: Vec<(String, String)>,
    ) -> Vec<Result<QueryOutcome, ExecError>> {
        let mut handles = Vec::with_capacity(jobs.len());
        for (query, datasource_id) in jobs {
            let executor = self.executor.clone();
            let semaphore = self.semaphore.clone();
            let timeout = self.timeout;
            handles.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
                match tokio::time::timeout(timeout, executor.execute(&query, &datasource_id, timeout))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(ExecError::Timeout(timeout.as_secs())),
                }
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            results.push(match handle.await {
                Ok(r) => r,
                Err(e) => Err(ExecError::Query(format!("refresh task panicked: {}", e))),
            });
        }
        results
    }
}
