//! 错误分类与有界恢复
//!
//! 常见错误走模式匹配；含糊错误用有界提示词委托外部 LLM，对方必须返回
//! 修复后的查询或显式 cannot_fix；含糊/沉默一律按 cannot_fix 处理。
//! 重试预算耗尽即 GiveUp，绝不无限重试。

use std::sync::Arc;

use serde::Deserialize;

use crate::core::planner::extract_json;
use crate::core::{PipelineState, RecoveryAction};
use crate::llm::{LlmClient, Message};

/// 错误记录的粗分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    MissingLimit,
    InvalidIdentifier,
    SyntaxError,
    WriteBlocked,
    SchemaFailure,
    ExecutionFailure,
    LlmFailure,
    Unknown,
}

/// 按错误文本模式匹配分类
pub fn classify(message: &str) -> ErrorKind {
    let m = message.to_lowercase();
    if m.contains("limit") && (m.contains("missing") || m.contains("without")) {
        ErrorKind::MissingLimit
    } else if m.contains("unknown column") || m.contains("invalid identifier") {
        ErrorKind::InvalidIdentifier
    } else if m.contains("write operation not permitted")
        || m.contains("multiple statements")
        || m.contains("read-only verb")
    {
        ErrorKind::WriteBlocked
    } else if m.contains("syntax") {
        ErrorKind::SyntaxError
    } else if m.contains("schema") || m.contains("datasource not found") {
        ErrorKind::SchemaFailure
    } else if m.contains("timeout")
        || m.contains("connection")
        || m.contains("permission")
        || m.contains("query error")
        || m.contains("execution failed")
    {
        ErrorKind::ExecutionFailure
    } else if m.contains("llm") || m.contains("rate limited") || m.contains("empty response") {
        ErrorKind::LlmFailure
    } else {
        ErrorKind::Unknown
    }
}

/// LLM 修复响应：要么给出 fixed_query，要么显式 cannot_fix
#[derive(Debug, Deserialize)]
struct FixResponse {
    #[serde(default)]
    fixed_query: Option<String>,
    #[serde(default)]
    cannot_fix: bool,
    #[serde(default)]
    reason: Option<String>,
}

/// 恢复引擎；llm 为空时含糊错误直接按重新生成处理
pub struct RecoveryEngine {
    llm: Option<Arc<dyn LlmClient>>,
}

impl RecoveryEngine {
    pub fn new() -> Self {
        Self { llm: None }
    }

    pub fn with_llm(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm: Some(llm) }
    }

    /// 根据状态决定恢复动作；先查预算，再分类
    pub async fn decide(&self, state: &PipelineState) -> RecoveryAction {
        let last = match state.last_error() {
            Some(e) => e,
            None => {
                return RecoveryAction::GiveUp {
                    reason: "recovery invoked without a recorded error".to_string(),
                }
            }
        };

        if state.retry_count >= state.max_retries {
            return RecoveryAction::GiveUp {
                reason: format!(
                    "retry budget exhausted after {} failed attempts; last error: {}",
                    state.retry_count, last.message
                ),
            };
        }

        match classify(&last.message) {
            ErrorKind::MissingLimit => {
                // 正常情况下校验器已内联注入；这里兜底用已存的 fixed_query
                if let Some(fixed) = state
                    .validation
                    .as_ref()
                    .and_then(|v| v.fixed_query.clone())
                {
                    RecoveryAction::ApplyFix {
                        query: fixed,
                        note: "applied validator limit injection".to_string(),
                        reset_retries: true,
                    }
                } else {
                    RecoveryAction::Regenerate {
                        hint: "the previous query lacked a row limit; include one".to_string(),
                    }
                }
            }
            ErrorKind::InvalidIdentifier | ErrorKind::WriteBlocked => RecoveryAction::Regenerate {
                hint: format!(
                    "the previous query was rejected: {}. Generate a corrected read-only query using only whitelisted columns.",
                    last.message
                ),
            },
            ErrorKind::ExecutionFailure => {
                // 瞬时数据源故障：原查询重走校验-执行；不算修复，不重置预算
                match &state.generated_query {
                    Some(q) => RecoveryAction::ApplyFix {
                        query: q.query.clone(),
                        note: format!("retrying after execution failure: {}", last.message),
                        reset_retries: false,
                    },
                    None => RecoveryAction::Regenerate {
                        hint: format!("execution failed: {}", last.message),
                    },
                }
            }
            ErrorKind::SchemaFailure => RecoveryAction::GiveUp {
                reason: format!("schema lookup failed: {}", last.message),
            },
            ErrorKind::SyntaxError | ErrorKind::Unknown => {
                self.delegate_fix(state, &last.message).await
            }
            ErrorKind::LlmFailure => RecoveryAction::Regenerate {
                hint: "the language model call failed; retry generation".to_string(),
            },
        }
    }

    /// 委托外部 LLM 提出修复；含糊或沉默的响应一律视为 cannot_fix
    async fn delegate_fix(&self, state: &PipelineState, error: &str) -> RecoveryAction {
        let Some(llm) = &self.llm else {
            return RecoveryAction::Regenerate {
                hint: format!("previous attempt failed: {}", error),
            };
        };
        let query = state
            .generated_query
            .as_ref()
            .map(|g| g.query.as_str())
            .unwrap_or("");
        let schema_hint = state
            .schema_context
            .as_ref()
            .map(|s| s.prompt_block())
            .unwrap_or_default();

        let prompt = format!(
            "A SQL query failed. Return ONLY a JSON object, either\n\
             {{\"fixed_query\": \"...\"}} with a corrected read-only query, or\n\
             {{\"cannot_fix\": true, \"reason\": \"...\"}} if it cannot be fixed.\n\n\
             Query:\n{}\n\nError:\n{}\n\nSchema:\n{}",
            query, error, schema_hint
        );

        let raw = match llm.complete(&[Message::user(prompt)]).await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!("recovery delegate failed: {}", e);
                return RecoveryAction::Regenerate {
                    hint: format!("previous attempt failed: {}", error),
                };
            }
        };

        let parsed: Option<FixResponse> =
            extract_json(&raw).and_then(|j| serde_json::from_str(&j).ok());
        match parsed {
            Some(FixResponse {
                fixed_query: Some(q),
                cannot_fix: false,
                ..
            }) if !q.trim().is_empty() => RecoveryAction::ApplyFix {
                query: q,
                note: "applied model-proposed fix".to_string(),
                reset_retries: true,
            },
            Some(FixResponse {
                cannot_fix: true,
                reason,
                ..
            }) => RecoveryAction::GiveUp {
                reason: format!(
                    "recovery collaborator cannot fix: {}",
                    reason.unwrap_or_else(|| "no reason given".to_string())
                ),
            },
            // 含糊或沉默：按 cannot_fix 处理
            _ => RecoveryAction::GiveUp {
                reason: format!("ambiguous recovery response for error: {}", error),
            },
        }
    }
}

impl Default for RecoveryEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Stage;
    use crate::llm::ScriptedLlmClient;
    use crate::validation::Dialect;

    fn state_with_error(message: &str, retries_used: u32) -> PipelineState {
        let mut s = PipelineState::new("t1", "ds", Dialect::MySql, "q", 3);
        s.generated_query = Some(crate::core::GeneratedQuery {
            query: "SELECT * FROM orders".to_string(),
            rationale: None,
            tables_used: vec![],
        });
        for _ in 0..retries_used {
            s.record_error(Stage::QueryValidation, message);
        }
        s
    }

    #[test]
    fn test_classify_patterns() {
        assert_eq!(classify("write operation not permitted: DROP"), ErrorKind::WriteBlocked);
        assert_eq!(
            classify("unknown column: o.custmer_id (did you mean: orders.customer_id)"),
            ErrorKind::InvalidIdentifier
        );
        assert_eq!(classify("syntax error near 'FORM'"), ErrorKind::SyntaxError);
        assert_eq!(classify("query timeout after 30s"), ErrorKind::ExecutionFailure);
        assert_eq!(classify("totally novel failure"), ErrorKind::Unknown);
    }

    #[tokio::test]
    async fn test_budget_exhausted_cites_count_and_last_error() {
        let engine = RecoveryEngine::new();
        let s = state_with_error("syntax error near X", 3);
        let action = engine.decide(&s).await;
        match action {
            RecoveryAction::GiveUp { reason } => {
                assert!(reason.contains("3 failed attempts"), "{}", reason);
                assert!(reason.contains("syntax error near X"), "{}", reason);
            }
            other => panic!("expected GiveUp, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_write_blocked_regenerates() {
        let engine = RecoveryEngine::new();
        let s = state_with_error("write operation not permitted: DROP", 1);
        let action = engine.decide(&s).await;
        assert!(matches!(action, RecoveryAction::Regenerate { .. }));
    }

    #[tokio::test]
    async fn test_transient_execution_retries_without_reset() {
        let engine = RecoveryEngine::new();
        let s = state_with_error("query timeout after 30s", 1);
        match engine.decide(&s).await {
            RecoveryAction::ApplyFix { reset_retries, .. } => assert!(!reset_retries),
            other => panic!("expected ApplyFix, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_delegate_accepts_fixed_query() {
        let llm = Arc::new(ScriptedLlmClient::from_texts(vec![
            r#"{"fixed_query": "SELECT id FROM orders LIMIT 10"}"#,
        ]));
        let engine = RecoveryEngine::with_llm(llm);
        let s = state_with_error("syntax error near 'FORM'", 1);
        match engine.decide(&s).await {
            RecoveryAction::ApplyFix { query, reset_retries, .. } => {
                assert!(query.contains("SELECT id"));
                assert!(reset_retries);
            }
            other => panic!("expected ApplyFix, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_delegate_cannot_fix_gives_up() {
        let llm = Arc::new(ScriptedLlmClient::from_texts(vec![
            r#"{"cannot_fix": true, "reason": "the table does not exist"}"#,
        ]));
        let engine = RecoveryEngine::with_llm(llm);
        let s = state_with_error("syntax error near 'FORM'", 1);
        match engine.decide(&s).await {
            RecoveryAction::GiveUp { reason } => assert!(reason.contains("table does not exist")),
            other => panic!("expected GiveUp, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ambiguous_delegate_response_treated_as_cannot_fix() {
        let llm = Arc::new(ScriptedLlmClient::from_texts(vec![
            "I think you should probably rewrite the query somehow",
        ]));
        let engine = RecoveryEngine::with_llm(llm);
        let s = state_with_error("some entirely novel failure", 1);
        match engine.decide(&s).await {
            RecoveryAction::GiveUp { reason } => assert!(reason.contains("ambiguous")),
            other => panic!("expected GiveUp, got {:?}", other),
        }
    }
}
