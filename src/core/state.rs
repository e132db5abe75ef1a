//! 流水线状态：阶段枚举、每轮聚合状态与阶段增量
//!
//! 状态归当前线程的单次执行独占，只通过检查点存储共享；
//! 每个阶段以显式 StageDelta 更新状态，绝不跨线程就地可变共享。

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cache::{CachedAnswer, CacheTier};
use crate::schema::SchemaContext;
use crate::validation::{Dialect, ValidationResult};

/// 流水线阶段（状态机节点）
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Clarification,
    CacheCheck,
    CacheHit,
    SchemaLookup,
    QueryGeneration,
    QueryValidation,
    QueryExecution,
    Analysis,
    Presentation,
    ErrorRecovery,
    Completed,
    Terminated,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Clarification => "clarification",
            Stage::CacheCheck => "cache_check",
            Stage::CacheHit => "cache_hit",
            Stage::SchemaLookup => "schema_lookup",
            Stage::QueryGeneration => "query_generation",
            Stage::QueryValidation => "query_validation",
            Stage::QueryExecution => "query_execution",
            Stage::Analysis => "analysis",
            Stage::Presentation => "presentation",
            Stage::ErrorRecovery => "error_recovery",
            Stage::Completed => "completed",
            Stage::Terminated => "terminated",
        };
        write!(f, "{}", name)
    }
}

impl Stage {
    /// 固定默认路由表；ErrorRecovery 的去向由恢复动作决定
    pub fn default_next(self) -> Option<Stage> {
        match self {
            Stage::CacheCheck => Some(Stage::Clarification),
            Stage::CacheHit => Some(Stage::Presentation),
            Stage::Clarification => Some(Stage::SchemaLookup),
            Stage::SchemaLookup => Some(Stage::QueryGeneration),
            Stage::QueryGeneration => Some(Stage::QueryValidation),
            Stage::QueryValidation => Some(Stage::QueryExecution),
            Stage::QueryExecution => Some(Stage::Analysis),
            Stage::Analysis => Some(Stage::Presentation),
            Stage::Presentation => Some(Stage::Completed),
            Stage::ErrorRecovery | Stage::Completed | Stage::Terminated => None,
        }
    }

    /// 当前状态静态合法的后继；建议钩子只能在其中选择
    pub fn valid_transitions(self) -> &'static [Stage] {
        match self {
            Stage::CacheCheck => &[Stage::Clarification, Stage::CacheHit],
            Stage::CacheHit => &[Stage::Presentation],
            Stage::Clarification => &[Stage::SchemaLookup, Stage::CacheHit],
            Stage::SchemaLookup => &[Stage::QueryGeneration],
            Stage::QueryGeneration => &[Stage::QueryValidation],
            Stage::QueryValidation => &[Stage::QueryExecution],
            Stage::QueryExecution => &[Stage::Analysis],
            Stage::Analysis => &[Stage::Presentation],
            Stage::Presentation => &[Stage::Completed],
            Stage::ErrorRecovery => &[
                Stage::QueryGeneration,
                Stage::QueryValidation,
                Stage::Terminated,
            ],
            Stage::Completed | Stage::Terminated => &[],
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Completed | Stage::Terminated)
    }
}

/// 执行结果（和类型，替代散落的可空字段）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionResult {
    #[default]
    Pending,
    Succeeded {
        columns: Vec<String>,
        rows: Vec<Vec<serde_json::Value>>,
        elapsed_ms: u64,
    },
    Failed {
        error: String,
    },
}

impl ExecutionResult {
    pub fn is_succeeded(&self) -> bool {
        matches!(self, ExecutionResult::Succeeded { .. })
    }
}

/// 单条错误记录；追加后不可变
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub stage: Stage,
    pub message: String,
    /// 出错时的查询快照
    pub query: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// 缓存命中元数据（随状态持久化，供 CacheHit 阶段重放）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheHitMeta {
    pub tier: CacheTier,
    pub answer: CachedAnswer,
    pub similarity: Option<f32>,
    pub matched_text: Option<String>,
    /// 语义命中落入确认区间时为 false，经澄清确认后置 true
    pub confirmed: bool,
}

/// 生成的查询与其依据
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratedQuery {
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
    #[serde(default)]
    pub tables_used: Vec<String>,
}

/// 每轮聚合状态
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineState {
    pub thread_id: String,
    pub datasource_id: String,
    pub dialect: Dialect,
    /// 当前顶层用户输入
    pub input: String,
    pub stage: Stage,
    /// 本轮成功派发的阶段数；只在全新顶层输入时归零
    pub turn_count: u32,
    /// 每次失败尝试恰好加一；只在显式采纳修复时归零
    pub retry_count: u32,
    pub max_retries: u32,
    /// 有界窗口，仅用于循环检测
    pub agent_call_history: Vec<Stage>,
    /// 幂等集合，无重复
    pub completed_stages: BTreeSet<Stage>,
    /// 只追加；仅在新顶层输入开始时清空
    pub error_history: Vec<ErrorRecord>,
    pub cache_hit: Option<CacheHitMeta>,
    pub schema_context: Option<SchemaContext>,
    pub generated_query: Option<GeneratedQuery>,
    pub validation: Option<ValidationResult>,
    #[serde(default)]
    pub execution: ExecutionResult,
    pub analysis: Option<String>,
    pub response: Option<String>,
    #[serde(default)]
    pub pending_questions: Vec<String>,
    #[serde(default)]
    pub confirmed_answers: Vec<String>,
    /// 恢复引擎留给下一次生成的提示
    pub recovery_hint: Option<String>,
    pub termination_reason: Option<String>,
}

impl PipelineState {
    pub fn new(
        thread_id: impl Into<String>,
        datasource_id: impl Into<String>,
        dialect: Dialect,
        input: impl Into<String>,
        max_retries: u32,
    ) -> Self {
        Self {
            thread_id: thread_id.into(),
            datasource_id: datasource_id.into(),
            dialect,
            input: input.into(),
            stage: Stage::Clarification,
            turn_count: 0,
            retry_count: 0,
            max_retries,
            agent_call_history: Vec::new(),
            completed_stages: BTreeSet::new(),
            error_history: Vec::new(),
            cache_hit: None,
            schema_context: None,
            generated_query: None,
            validation: None,
            execution: ExecutionResult::Pending,
            analysis: None,
            response: None,
            pending_questions: Vec::new(),
            confirmed_answers: Vec::new(),
            recovery_hint: None,
            termination_reason: None,
        }
    }

    /// 记录一次失败；retry_count 恰好加一（绝不对同一失败加两次）
    pub fn record_error(&mut self, stage: Stage, message: impl Into<String>) {
        self.error_history.push(ErrorRecord {
            stage,
            message: message.into(),
            query: self.generated_query.as_ref().map(|g| g.query.clone()),
            timestamp: Utc::now(),
        });
        self.retry_count += 1;
    }

    /// 记录守卫违规/取消；不是失败尝试，不动 retry_count
    pub fn record_guard_violation(&mut self, stage: Stage, message: impl Into<String>) {
        self.error_history.push(ErrorRecord {
            stage,
            message: message.into(),
            query: self.generated_query.as_ref().map(|g| g.query.clone()),
            timestamp: Utc::now(),
        });
    }

    pub fn last_error(&self) -> Option<&ErrorRecord> {
        self.error_history.last()
    }

    /// 全新顶层输入：重置轮次计数、调用历史与错误历史（恢复续跑不会走到这里）
    pub fn reset_for_new_input(&mut self, input: impl Into<String>) {
        self.input = input.into();
        self.turn_count = 0;
        self.retry_count = 0;
        self.agent_call_history.clear();
        self.error_history.clear();
        self.completed_stages.clear();
        self.cache_hit = None;
        self.generated_query = None;
        self.validation = None;
        self.execution = ExecutionResult::Pending;
        self.analysis = None;
        self.response = None;
        self.pending_questions.clear();
        self.confirmed_answers.clear();
        self.recovery_hint = None;
        self.termination_reason = None;
    }

    /// 应用一个阶段增量
    pub fn apply(&mut self, delta: StageDelta) {
        if let Some(ctx) = delta.schema_context {
            self.schema_context = Some(ctx);
        }
        if let Some(q) = delta.generated_query {
            self.generated_query = Some(q);
        }
        if let Some(v) = delta.validation {
            self.validation = Some(v);
        }
        if let Some(e) = delta.execution {
            self.execution = e;
        }
        if let Some(a) = delta.analysis {
            self.analysis = Some(a);
        }
        if let Some(r) = delta.response {
            self.response = Some(r);
        }
        if let Some(meta) = delta.cache_hit {
            self.cache_hit = Some(meta);
        }
        if delta.confirm_cache_hit {
            if let Some(meta) = &mut self.cache_hit {
                meta.confirmed = true;
            }
        }
        if delta.clear_cache_hit {
            self.cache_hit = None;
        }
        if let Some(qs) = delta.pending_questions {
            self.pending_questions = qs;
        }
        if delta.clear_pending_questions {
            self.pending_questions.clear();
        }
        if let Some(hint) = delta.recovery_hint {
            self.recovery_hint = Some(hint);
        }
        if delta.accept_fix {
            // 显式的「采纳修复」迁移：给新候选一次全新的校验机会
            self.retry_count = 0;
        }
        if let Some(reason) = delta.termination_reason {
            self.termination_reason = Some(reason);
        }
        if let Some(next) = delta.next_stage {
            self.stage = next;
        }
    }
}

/// 一个阶段产生的显式状态增量
#[derive(Debug, Default)]
pub struct StageDelta {
    pub next_stage: Option<Stage>,
    pub schema_context: Option<SchemaContext>,
    pub generated_query: Option<GeneratedQuery>,
    pub validation: Option<ValidationResult>,
    pub execution: Option<ExecutionResult>,
    pub analysis: Option<String>,
    pub response: Option<String>,
    pub cache_hit: Option<CacheHitMeta>,
    pub confirm_cache_hit: bool,
    pub clear_cache_hit: bool,
    pub pending_questions: Option<Vec<String>>,
    pub clear_pending_questions: bool,
    pub recovery_hint: Option<String>,
    /// 真正的语义修复被采纳：重置 retry_count
    pub accept_fix: bool,
    pub termination_reason: Option<String>,
    /// 本阶段要求暂停（等待用户澄清）
    pub pause: bool,
}

impl StageDelta {
    pub fn next(stage: Stage) -> Self {
        Self {
            next_stage: Some(stage),
            ..Self::default()
        }
    }
}
