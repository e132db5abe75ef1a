//! Mock LLM 客户端（用于测试与离线演示，无需 API）
//!
//! MockLlmClient 按提示词中的标记返回流水线各阶段期望的 JSON；
//! ScriptedLlmClient 按脚本逐条吐出预置回复，供测试精确控制。

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Mutex;

use async_trait::async_trait;
use futures_util::stream;

use crate::llm::{LlmClient, LlmError, Message, Role};

/// Mock 客户端：识别生成/澄清/分析/修复提示并返回合法 JSON
#[derive(Debug, Default)]
pub struct MockLlmClient;

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, messages: &[Message]) -> Result<String, LlmError> {
        let prompt = messages
            .iter()
            .rev()
            .find(|m| matches!(m.role, Role::User))
            .map(|m| m.content.as_str())
            .unwrap_or("");

        // 按提示词中的字段标记路由到对应的 canned 回复
        if prompt.contains("\"questions\"") {
            return Ok(r#"{"clear": true, "questions": []}"#.to_string());
        }
        if prompt.contains("\"tables_used\"") {
            return Ok(
                r#"{"query": "SELECT * FROM orders", "rationale": "demo query", "tables_used": ["orders"]}"#
                    .to_string(),
            );
        }
        if prompt.contains("\"fixed_query\"") {
            return Ok(r#"{"cannot_fix": true, "reason": "mock backend cannot rewrite queries"}"#
                .to_string());
        }
        Ok("The query returned the requested rows.".to_string())
    }

    async fn complete_stream(
        &self,
        messages: &[Message],
    ) -> Result<Pin<Box<dyn futures_util::Stream<Item = Result<String, LlmError>> + Send>>, LlmError>
    {
        let content = self.complete(messages).await?;
        Ok(Box::pin(stream::iter(vec![Ok(content)])))
    }
}

/// 脚本化客户端：按入队顺序返回回复；脚本耗尽后返回 EmptyResponse
pub struct ScriptedLlmClient {
    responses: Mutex<VecDeque<Result<String, LlmError>>>,
}

impl ScriptedLlmClient {
    pub fn new(responses: Vec<Result<String, LlmError>>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().collect()),
        }
    }

    /// 只含成功回复的脚本
    pub fn from_texts(texts: Vec<&str>) -> Self {
        Self::new(texts.into_iter().map(|t| Ok(t.to_string())).collect())
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(&self, _messages: &[Message]) -> Result<String, LlmError> {
        self.responses
            .lock()
            .expect("script lock")
            .pop_front()
            .unwrap_or(Err(LlmError::EmptyResponse))
    }

    async fn complete_stream(
        &self,
        messages: &[Message],
    ) -> Result<Pin<Box<dyn futures_util::Stream<Item = Result<String, LlmError>> + Send>>, LlmError>
    {
        let content = self.complete(messages).await?;
        Ok(Box::pin(stream::iter(vec![Ok(content)])))
    }
}
