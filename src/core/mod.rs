//! 核心编排层：状态机、守卫、恢复、规划与主控循环

pub mod coordinator;
pub mod error;
pub mod events;
pub mod guard;
pub mod planner;
pub mod recovery;
pub mod state;

pub use coordinator::{
    CompletedTurn, Coordinator, CoordinatorConfig, ResumeRequest, StageSuggester, TurnOutcome,
    TurnRequest,
};
pub use error::{PipelineError, RecoveryAction};
pub use events::{send_event, PipelineEvent, StepStatus};
pub use guard::{Guard, GuardConfig, GuardVerdict};
pub use planner::{ClarifyOutcome, QueryPlanner};
pub use recovery::{classify, ErrorKind, RecoveryEngine};
pub use state::{
    CacheHitMeta, ErrorRecord, ExecutionResult, GeneratedQuery, PipelineState, Stage, StageDelta,
};
