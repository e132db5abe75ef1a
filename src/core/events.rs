//! 流水线过程事件：用于流式/SSE 展示各阶段状态
//!
//! 事件发送为尽力而为：发送失败绝不影响流水线本身。

use serde::Serialize;
use tokio::sync::mpsc;

use crate::core::Stage;

/// 阶段状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Error,
}

/// 单步过程事件（可序列化为 JSON 供前端展示）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    /// 阶段状态更新
    StageStatus {
        stage: Stage,
        status: StepStatus,
        summary: String,
        elapsed_ms: u64,
    },
    /// 缓存命中（层级与语义相似度）
    CacheHit {
        tier: String,
        similarity: Option<f32>,
    },
    /// 错误恢复动作
    Recovery { action: String, detail: String },
    /// 需要用户澄清，流水线已暂停
    ClarificationRequired { questions: Vec<String> },
    /// 终结
    Terminated { reason: String },
    /// 错误
    Error { text: String },
}

/// 尽力而为的事件发送
pub fn send_event(tx: &Option<&mpsc::UnboundedSender<PipelineEvent>>, ev: PipelineEvent) {
    if let Some(t) = tx {
        let _ = t.send(ev);
    }
}
