//! 查询规划：澄清判定、查询生成、结果解读
//!
//! 只负责「怎么调 LLM、怎么解析输出」；尝试次数、失败与缓存全部由协调器管控。

use std::sync::Arc;

use serde::Deserialize;

use crate::core::{GeneratedQuery, PipelineError};
use crate::llm::{LlmClient, Message};
use crate::schema::SchemaContext;

/// 从 LLM 输出中提取 JSON 块（```json 围栏或裸花括号）
pub(crate) fn extract_json(output: &str) -> Option<String> {
    let trimmed = output.trim();
    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        let block = rest
            .find("```")
            .map(|end| rest[..end].trim())
            .unwrap_or_else(|| rest.trim());
        return Some(block.to_string());
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if end > start {
        Some(trimmed[start..=end].to_string())
    } else {
        None
    }
}

/// 澄清判定结果
#[derive(Debug, Clone, Deserialize)]
pub struct ClarifyOutcome {
    #[serde(default = "default_clear")]
    pub clear: bool,
    #[serde(default)]
    pub questions: Vec<String>,
}

fn default_clear() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    query: Option<String>,
    #[serde(default)]
    rationale: Option<String>,
    #[serde(default)]
    tables_used: Vec<String>,
}

/// 查询规划器：持有 LLM，负责三类提示词的拼接与解析
pub struct QueryPlanner {
    llm: Arc<dyn LlmClient>,
}

impl QueryPlanner {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    pub fn token_usage(&self) -> (u64, u64, u64) {
        self.llm.token_usage()
    }

    /// 判断请求是否需要澄清；解析失败按「无需澄清」处理，不阻塞流水线
    pub async fn clarify(&self, input: &str, schema: Option<&SchemaContext>) -> ClarifyOutcome {
        let schema_block = schema.map(|s| s.prompt_block()).unwrap_or_default();
        let prompt = format!(
            "Decide whether this data question is specific enough to answer with one SQL query.\n\
             Return ONLY JSON: {{\"clear\": true|false, \"questions\": [\"...\"]}}.\n\n\
             Question: {}\n\nSchema:\n{}",
            input, schema_block
        );
        match self.llm.complete(&[Message::user(prompt)]).await {
            Ok(raw) => extract_json(&raw)
                .and_then(|j| serde_json::from_str::<ClarifyOutcome>(&j).ok())
                .unwrap_or(ClarifyOutcome {
                    clear: true,
                    questions: vec![],
                }),
            Err(e) => {
                tracing::debug!("clarify call failed ({}), treating input as clear", e);
                ClarifyOutcome {
                    clear: true,
                    questions: vec![],
                }
            }
        }
    }

    /// 生成查询；confirmed_answers 与恢复提示拼入提示词
    pub async fn generate(
        &self,
        input: &str,
        schema: &SchemaContext,
        confirmed_answers: &[String],
        hint: Option<&str>,
    ) -> Result<GeneratedQuery, PipelineError> {
        let mut prompt = format!(
            "Write ONE read-only SQL query answering the question.\n\
             Return ONLY JSON: {{\"query\": \"...\", \"rationale\": \"...\", \"tables_used\": [\"...\"]}}.\n\n\
             Question: {}\n\nSchema:\n{}",
            input,
            schema.prompt_block()
        );
        if !confirmed_answers.is_empty() {
            prompt.push_str(&format!(
                "\nClarifications from the user:\n{}",
                confirmed_answers.join("\n")
            ));
        }
        if let Some(hint) = hint {
            prompt.push_str(&format!("\nPrevious attempt feedback: {}", hint));
        }

        let raw = self
            .llm
            .complete(&[Message::user(prompt)])
            .await
            .map_err(|e| PipelineError::Llm(e.to_string()))?;

        let parsed: GenerateResponse = extract_json(&raw)
            .and_then(|j| serde_json::from_str(&j).ok())
            .ok_or_else(|| PipelineError::Llm(format!("unparseable generation output: {}", raw)))?;

        match parsed.query {
            Some(q) if !q.trim().is_empty() => Ok(GeneratedQuery {
                query: q,
                rationale: parsed.rationale,
                tables_used: parsed.tables_used,
            }),
            _ => Err(PipelineError::Llm("generation returned no query".to_string())),
        }
    }

    /// 解读执行结果；失败由协调器回退为确定性摘要
    pub async fn analyze(
        &self,
        input: &str,
        columns: &[String],
        rows: &[Vec<serde_json::Value>],
    ) -> Result<String, PipelineError> {
        let preview: Vec<&Vec<serde_json::Value>> = rows.iter().take(20).collect();
        let prompt = format!(
            "Summarize this query result for the user in two sentences or less.\n\n\
             Question: {}\nColumns: {}\nRows (first {} of {}):\n{}",
            input,
            columns.join(", "),
            preview.len(),
            rows.len(),
            serde_json::to_string(&preview).unwrap_or_default()
        );
        self.llm
            .complete(&[Message::user(prompt)])
            .await
            .map_err(|e| PipelineError::Llm(e.to_string()))
    }
}
