//! 流水线错误分类与恢复动作
//!
//! 与 RecoveryEngine 配合：Validation/Execution 在重试预算内本地恢复；
//! Guard/Unrecoverable 立即终结并携带完整 error_history 上抛。

use thiserror::Error;

/// 流水线运行过程中可能出现的错误
#[derive(Error, Debug, Clone)]
pub enum PipelineError {
    /// 结构/安全/限额/标识符违规；可经自动修复或重新生成恢复
    #[error("validation failed: {0}")]
    Validation(String),

    /// 数据源运行时失败（超时、权限、瞬时网络）；可有界重试
    #[error("execution failed: {0}")]
    Execution(String),

    /// 轮次上限/循环/前置条件违规；不重试，立即终结
    #[error("guard violation: {0}")]
    Guard(String),

    /// 恢复协作方明确表示无法修复，或预算耗尽
    #[error("unrecoverable: {0}")]
    Unrecoverable(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("schema lookup failed: {0}")]
    Schema(String),

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error("cancelled")]
    Cancelled,
}

/// 恢复引擎根据错误给出的动作
#[derive(Debug, Clone)]
pub enum RecoveryAction {
    /// 采纳一条修复后的查询并重新校验；reset_retries 仅在真正的语义修复时为 true
    ApplyFix {
        query: String,
        note: String,
        reset_retries: bool,
    },
    /// 带提示重新生成查询
    Regenerate { hint: String },
    /// 放弃，转入 Terminated
    GiveUp { reason: String },
}
