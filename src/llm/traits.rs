//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / DeepSeek / Mock）实现 LlmClient；RetryingLlmClient
//! 为任意后端叠加带抖动的指数退避重试。

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::Stream;
use thiserror::Error;

use crate::llm::Message;

/// LLM 调用错误
#[derive(Error, Debug, Clone)]
pub enum LlmError {
    #[error("request timeout")]
    Timeout,

    #[error("rate limited")]
    RateLimited,

    #[error("empty response")]
    EmptyResponse,

    #[error("api error: {0}")]
    Api(String),
}

impl LlmError {
    /// 是否值得重试（瞬时故障）
    pub fn is_transient(&self) -> bool {
        matches!(self, LlmError::Timeout | LlmError::RateLimited | LlmError::Api(_))
    }
}

/// LLM 客户端 trait：非流式完成与流式完成（返回 Token 流）
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 非流式完成
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError>;

    /// 流式完成，返回 Token 流
    async fn complete_stream(
        &self,
        messages: &[Message],
    ) -> Result<Pin<Box<dyn Stream<Item = Result<String, LlmError>> + Send>>, LlmError>;

    /// 获取累计 token 使用统计：(prompt_tokens, completion_tokens, total_tokens)
    /// 默认返回 (0, 0, 0)，具体实现可覆盖
    fn token_usage(&self) -> (u64, u64, u64) {
        (0, 0, 0)
    }
}

/// 重试配置：指数退避 + 抖动 + 上限
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub jitter_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            multiplier: 2.0,
            jitter_ms: 250,
            max_delay_ms: 8_000,
        }
    }
}

impl RetryConfig {
    /// 第 attempt 次失败后的退避时长（attempt 从 0 计）
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.base_delay_ms as f64 * self.multiplier.powi(attempt as i32);
        let capped = (exp as u64).min(self.max_delay_ms);
        Duration::from_millis(capped + jitter(self.jitter_ms))
    }
}

/// 无 rand 依赖的轻量抖动：取当前时钟亚毫秒位
fn jitter(max_ms: u64) -> u64 {
    if max_ms == 0 {
        return 0;
    }
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64)
        .unwrap_or(0);
    nanos % max_ms
}

/// 重试装饰器：包装任意 LlmClient，对瞬时错误做有界退避重试
pub struct RetryingLlmClient {
    inner: Arc<dyn LlmClient>,
    cfg: RetryConfig,
}

impl RetryingLlmClient {
    pub fn new(inner: Arc<dyn LlmClient>, cfg: RetryConfig) -> Self {
        Self { inner, cfg }
    }
}

#[async_trait]
impl LlmClient for RetryingLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        let mut attempt = 0;
        loop {
            match self.inner.complete(messages).await {
                Ok(text) => return Ok(text),
                Err(e) if e.is_transient() && attempt + 1 < self.cfg.max_attempts => {
                    let delay = self.cfg.delay_for(attempt);
                    tracing::debug!(
                        "LLM attempt {} failed ({}), retrying in {:?}",
                        attempt + 1,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn complete_stream(
        &self,
        messages: &[Message],
    ) -> Result<Pin<Box<dyn Stream<Item = Result<String, LlmError>> + Send>>, LlmError> {
        self.inner.complete_stream(messages).await
    }

    fn token_usage(&self) -> (u64, u64, u64) {
        self.inner.token_usage()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// 前 fail_times 次返回瞬时错误，之后成功
    struct FlakyClient {
        fail_times: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl LlmClient for FlakyClient {
        async fn complete(&self, _messages: &[Message]) -> Result<String, LlmError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_times {
                Err(LlmError::RateLimited)
            } else {
                Ok("ok".to_string())
            }
        }

        async fn complete_stream(
            &self,
            messages: &[Message],
        ) -> Result<Pin<Box<dyn Stream<Item = Result<String, LlmError>> + Send>>, LlmError> {
            let content = self.complete(messages).await?;
            Ok(Box::pin(stream::iter(vec![Ok(content)])))
        }
    }

    fn fast_cfg(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            base_delay_ms: 1,
            multiplier: 1.0,
            jitter_ms: 0,
            max_delay_ms: 2,
        }
    }

    #[tokio::test]
    async fn test_retry_then_succeed() {
        let client = RetryingLlmClient::new(
            Arc::new(FlakyClient {
                fail_times: 2,
                calls: AtomicU32::new(0),
            }),
            fast_cfg(3),
        );
        let out = client.complete(&[Message::user("hi")]).await;
        assert_eq!(out.unwrap(), "ok");
    }

    #[tokio::test]
    async fn test_budget_exhausted_returns_error() {
        let client = RetryingLlmClient::new(
            Arc::new(FlakyClient {
                fail_times: 5,
                calls: AtomicU32::new(0),
            }),
            fast_cfg(3),
        );
        let out = client.complete(&[Message::user("hi")]).await;
        assert!(matches!(out, Err(LlmError::RateLimited)));
    }

    #[test]
    fn test_delay_is_capped() {
        let cfg = RetryConfig {
            max_attempts: 10,
            base_delay_ms: 1000,
            multiplier: 10.0,
            jitter_ms: 0,
            max_delay_ms: 3000,
        };
        assert!(cfg.delay_for(6) <= Duration::from_millis(3000));
    }
}
