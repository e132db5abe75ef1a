//! 流水线协调器：显式状态机主控循环
//!
//! 每个阶段派发前跑全部守卫，派发后应用增量、更新守卫状态并写检查点；
//! 任意阶段失败转入 error_recovery；澄清需求触发暂停-续跑；
//! 缓存三层在入口短路，回写只发生在校验通过且执行成功之后。
//! 所有协作方（LLM / schema / 执行 / 缓存 / 检查点）显式注入，便于用假实现单测。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::cache::{CachedAnswer, CacheService, CacheTier};
use crate::checkpoint::CheckpointStore;
use crate::core::events::{send_event, PipelineEvent, StepStatus};
use crate::core::planner::QueryPlanner;
use crate::core::{
    CacheHitMeta, ErrorRecord, ExecutionResult, GeneratedQuery, Guard, GuardConfig,
    PipelineError, PipelineState, RecoveryAction, RecoveryEngine, Stage, StageDelta,
};
use crate::exec::{apply_timeout_hint, QueryExecutor};
use crate::llm::LlmClient;
use crate::schema::SchemaProvider;
use crate::validation::{Dialect, Validator};

/// 肯定回答判定（澄清确认语义缓存命中时用）
const AFFIRMATIVE_ANSWERS: &[&str] = &[
    "yes", "y", "yeah", "yep", "ok", "sure", "confirm", "correct", "是", "是的", "对", "好", "可以",
];

fn is_affirmative(answer: &str) -> bool {
    AFFIRMATIVE_ANSWERS.contains(&answer.trim().to_lowercase().as_str())
}

/// 建议钩子：可在静态合法后继中挑选下一阶段；守卫仍会校验其选择
pub trait StageSuggester: Send + Sync {
    fn suggest(&self, state: &PipelineState, default_next: Stage) -> Option<Stage>;
}

/// 协调器配置
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub guard: GuardConfig,
    pub max_retries: u32,
    pub execution_timeout: Duration,
    /// 是否用 LLM 判定澄清需求（Mock/离线场景可关）
    pub clarify_with_llm: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            guard: GuardConfig::default(),
            max_retries: 3,
            execution_timeout: Duration::from_secs(30),
            clarify_with_llm: true,
        }
    }
}

/// 一次新的顶层请求
pub struct TurnRequest<'a> {
    pub thread_id: &'a str,
    pub datasource_id: &'a str,
    pub dialect: Dialect,
    pub input: &'a str,
    pub event_tx: Option<&'a mpsc::UnboundedSender<PipelineEvent>>,
    pub cancel_token: CancellationToken,
}

impl<'a> TurnRequest<'a> {
    pub fn new(thread_id: &'a str, datasource_id: &'a str, dialect: Dialect, input: &'a str) -> Self {
        Self {
            thread_id,
            datasource_id,
            dialect,
            input,
            event_tx: None,
            cancel_token: CancellationToken::new(),
        }
    }

    pub fn with_events(mut self, tx: &'a mpsc::UnboundedSender<PipelineEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel_token = token;
        self
    }
}

/// 续跑请求：携带用户对澄清问题的回答
pub struct ResumeRequest<'a> {
    pub thread_id: &'a str,
    pub answers: Vec<String>,
    pub event_tx: Option<&'a mpsc::UnboundedSender<PipelineEvent>>,
    pub cancel_token: CancellationToken,
}

impl<'a> ResumeRequest<'a> {
    pub fn new(thread_id: &'a str, answers: Vec<String>) -> Self {
        Self {
            thread_id,
            answers,
            event_tx: None,
            cancel_token: CancellationToken::new(),
        }
    }

    pub fn with_events(mut self, tx: &'a mpsc::UnboundedSender<PipelineEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }
}

/// 成功完成的一轮
#[derive(Debug, Clone)]
pub struct CompletedTurn {
    pub response: String,
    pub query: String,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
    pub analysis: Option<String>,
    pub from_cache: Option<CacheTier>,
}

/// 每轮必达的确定结局
#[derive(Debug, Clone)]
pub enum TurnOutcome {
    Completed(Box<CompletedTurn>),
    /// 流水线已暂停，等待用户回答
    Paused { questions: Vec<String> },
    /// 终结；附完整错误历史供诊断
    Terminated {
        reason: String,
        error_history: Vec<ErrorRecord>,
    },
}

/// 线程级互斥：同一会话线程内阶段严格串行
#[derive(Default)]
struct ThreadLocks {
    inner: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ThreadLocks {
    async fn acquire(&self, thread_id: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().await;
            map.entry(thread_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

/// 流水线协调器
pub struct Coordinator {
    cfg: CoordinatorConfig,
    schema: Arc<dyn SchemaProvider>,
    executor: Arc<dyn QueryExecutor>,
    cache: Arc<CacheService>,
    checkpoints: Arc<dyn CheckpointStore>,
    validator: Validator,
    guard: Guard,
    recovery: RecoveryEngine,
    planner: QueryPlanner,
    suggester: Option<Arc<dyn StageSuggester>>,
    locks: ThreadLocks,
}

impl Coordinator {
    pub fn new(
        cfg: CoordinatorConfig,
        llm: Arc<dyn LlmClient>,
        schema: Arc<dyn SchemaProvider>,
        executor: Arc<dyn QueryExecutor>,
        cache: Arc<CacheService>,
        checkpoints: Arc<dyn CheckpointStore>,
        validator: Validator,
    ) -> Self {
        Self {
            guard: Guard::new(cfg.guard.clone()),
            recovery: RecoveryEngine::with_llm(llm.clone()),
            planner: QueryPlanner::new(llm),
            cfg,
            schema,
            executor,
            cache,
            checkpoints,
            validator,
            suggester: None,
            locks: ThreadLocks::default(),
        }
    }

    /// 设置建议钩子
    pub fn with_suggester(mut self, suggester: Arc<dyn StageSuggester>) -> Self {
        self.suggester = Some(suggester);
        self
    }

    fn initial_stage(&self) -> Stage {
        if self.cache.enabled() {
            Stage::CacheCheck
        } else {
            Stage::Clarification
        }
    }

    /// 处理一次全新的顶层用户输入
    pub async fn run_turn(&self, req: TurnRequest<'_>) -> Result<TurnOutcome, PipelineError> {
        let _thread_guard = self.locks.acquire(req.thread_id).await;

        // 复用上一轮状态中的 schema 等进度；轮次/历史按「全新输入」重置
        let mut state = match self.load_checkpoint(req.thread_id).await? {
            Some(prev) if prev.datasource_id == req.datasource_id => {
                let mut s = prev;
                s.reset_for_new_input(req.input);
                s.dialect = req.dialect;
                s
            }
            _ => PipelineState::new(
                req.thread_id,
                req.datasource_id,
                req.dialect,
                req.input,
                self.cfg.max_retries,
            ),
        };
        state.max_retries = self.cfg.max_retries;
        state.stage = self.initial_stage();

        self.drive(&mut state, &req.event_tx, &req.cancel_token).await
    }

    /// 从暂停处续跑：合并回答，从持久化的阶段继续，不重置轮次
    pub async fn resume(&self, req: ResumeRequest<'_>) -> Result<TurnOutcome, PipelineError> {
        let _thread_guard = self.locks.acquire(req.thread_id).await;

        let mut state = self.load_checkpoint(req.thread_id).await?.ok_or_else(|| {
            PipelineError::Unrecoverable(format!("no checkpoint to resume: {}", req.thread_id))
        })?;
        if state.stage.is_terminal() {
            return Err(PipelineError::Unrecoverable(format!(
                "thread {} already reached {}",
                req.thread_id, state.stage
            )));
        }
        state
            .confirmed_answers
            .extend(req.answers.iter().map(|a| a.trim().to_string()));
        state.pending_questions.clear();

        self.drive(&mut state, &req.event_tx, &req.cancel_token).await
    }

    /// 检查点存储可达性探针
    pub async fn probe_checkpoint_store(&self) -> Result<(), PipelineError> {
        self.checkpoints
            .probe()
            .await
            .map_err(|e| PipelineError::Checkpoint(e.to_string()))
    }

    async fn load_checkpoint(&self, thread_id: &str) -> Result<Option<PipelineState>, PipelineError> {
        Ok(self
            .checkpoints
            .load_latest(thread_id)
            .await
            .map_err(|e| PipelineError::Checkpoint(e.to_string()))?
            .map(|cp| cp.state))
    }

    async fn persist(&self, state: &PipelineState) -> Result<(), PipelineError> {
        self.checkpoints
            .save(&state.thread_id, state)
            .await
            .map(|_| ())
            .map_err(|e| PipelineError::Checkpoint(e.to_string()))
    }

    /// 主控循环：守卫 -> 派发 -> 应用增量 -> 更新守卫状态 -> 写检查点
    async fn drive(
        &self,
        state: &mut PipelineState,
        events: &Option<&mpsc::UnboundedSender<PipelineEvent>>,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome, PipelineError> {
        loop {
            match state.stage {
                Stage::Completed => return Ok(self.completed_outcome(state)),
                Stage::Terminated => {
                    return Ok(TurnOutcome::Terminated {
                        reason: state
                            .termination_reason
                            .clone()
                            .unwrap_or_else(|| "terminated".to_string()),
                        error_history: state.error_history.clone(),
                    })
                }
                _ => {}
            }

            if cancel.is_cancelled() {
                state.record_guard_violation(state.stage, "cancelled by caller");
                return self.terminate(state, "cancelled by caller", events).await;
            }

            let stage = state.stage;
            let verdict = self.guard.run_all_guards(state, stage);
            if verdict.should_stop {
                let reason = verdict.reason.unwrap_or_else(|| "guard violation".to_string());
                state.record_guard_violation(stage, reason.clone());
                return self.terminate(state, &reason, events).await;
            }

            send_event(
                events,
                PipelineEvent::StageStatus {
                    stage,
                    status: StepStatus::Running,
                    summary: String::new(),
                    elapsed_ms: 0,
                },
            );
            let started = Instant::now();

            match self.dispatch(stage, state, events, cancel).await {
                Ok(delta) => {
                    let paused = delta.pause;
                    let mut next = delta.next_stage;
                    // 建议钩子只能在静态合法后继中挑选；守卫在下一轮派发前仍会复核
                    if let (Some(suggester), Some(default_next)) = (&self.suggester, next) {
                        if let Some(suggested) = suggester.suggest(state, default_next) {
                            if stage.valid_transitions().contains(&suggested) {
                                next = Some(suggested);
                            } else {
                                tracing::warn!(
                                    "suggester proposed invalid transition {} -> {}, ignoring",
                                    stage,
                                    suggested
                                );
                            }
                        }
                    }
                    let delta = StageDelta {
                        next_stage: next,
                        ..delta
                    };
                    state.apply(delta);
                    self.guard.update_guard_state(state, stage);
                    self.persist(state).await?;
                    send_event(
                        events,
                        PipelineEvent::StageStatus {
                            stage,
                            status: StepStatus::Completed,
                            summary: stage.to_string(),
                            elapsed_ms: started.elapsed().as_millis() as u64,
                        },
                    );

                    if paused {
                        send_event(
                            events,
                            PipelineEvent::ClarificationRequired {
                                questions: state.pending_questions.clone(),
                            },
                        );
                        return Ok(TurnOutcome::Paused {
                            questions: state.pending_questions.clone(),
                        });
                    }
                }
                Err(PipelineError::Cancelled) => {
                    state.record_guard_violation(stage, "cancelled by caller");
                    return self.terminate(state, "cancelled by caller", events).await;
                }
                Err(e) => {
                    let message = e.to_string();
                    send_event(events, PipelineEvent::Error { text: message.clone() });
                    send_event(
                        events,
                        PipelineEvent::StageStatus {
                            stage,
                            status: StepStatus::Error,
                            summary: message.clone(),
                            elapsed_ms: started.elapsed().as_millis() as u64,
                        },
                    );
                    if stage == Stage::QueryExecution {
                        state.execution = ExecutionResult::Failed {
                            error: message.clone(),
                        };
                    }
                    state.record_error(stage, message);
                    state.stage = Stage::ErrorRecovery;
                    self.persist(state).await?;
                }
            }
        }
    }

    async fn dispatch(
        &self,
        stage: Stage,
        state: &PipelineState,
        events: &Option<&mpsc::UnboundedSender<PipelineEvent>>,
        cancel: &CancellationToken,
    ) -> Result<StageDelta, PipelineError> {
        match stage {
            Stage::CacheCheck => self.stage_cache_check(state, events).await,
            Stage::CacheHit => Ok(Self::stage_cache_hit(state)),
            Stage::Clarification => self.stage_clarification(state).await,
            Stage::SchemaLookup => self.stage_schema_lookup(state).await,
            Stage::QueryGeneration => self.stage_query_generation(state).await,
            Stage::QueryValidation => self.stage_query_validation(state),
            Stage::QueryExecution => self.stage_query_execution(state, cancel).await,
            Stage::Analysis => self.stage_analysis(state).await,
            Stage::Presentation => self.stage_presentation(state).await,
            Stage::ErrorRecovery => self.stage_error_recovery(state, events).await,
            Stage::Completed | Stage::Terminated => Ok(StageDelta::default()),
        }
    }

    /// 三层缓存入口；未命中落到澄清
    async fn stage_cache_check(
        &self,
        state: &PipelineState,
        events: &Option<&mpsc::UnboundedSender<PipelineEvent>>,
    ) -> Result<StageDelta, PipelineError> {
        let hit = self
            .cache
            .lookup(&state.thread_id, &state.datasource_id, &state.input)
            .await;
        let Some(hit) = hit else {
            return Ok(StageDelta::next(Stage::Clarification));
        };

        send_event(
            events,
            PipelineEvent::CacheHit {
                tier: hit.tier.to_string(),
                similarity: hit.similarity,
            },
        );
        tracing::info!("cache hit ({}) for thread {}", hit.tier, state.thread_id);

        let meta = CacheHitMeta {
            tier: hit.tier,
            answer: hit.answer,
            similarity: hit.similarity,
            matched_text: hit.matched_text.clone(),
            confirmed: !hit.needs_confirmation,
        };
        if hit.needs_confirmation {
            // 语义命中落在确认区间：必须经澄清确认等价，不能静默复用
            let question = format!(
                "A very similar question was answered before: \"{}\" (similarity {:.2}). Reuse that result? (yes/no)",
                hit.matched_text.unwrap_or_default(),
                hit.similarity.unwrap_or(0.0)
            );
            Ok(StageDelta {
                cache_hit: Some(meta),
                pending_questions: Some(vec![question]),
                next_stage: Some(Stage::Clarification),
                ..StageDelta::default()
            })
        } else {
            Ok(StageDelta {
                cache_hit: Some(meta),
                next_stage: Some(Stage::CacheHit),
                ..StageDelta::default()
            })
        }
    }

    /// 重放缓存答案，不再生成或执行
    fn stage_cache_hit(state: &PipelineState) -> StageDelta {
        let Some(meta) = &state.cache_hit else {
            return StageDelta::next(Stage::Clarification);
        };
        let answer = &meta.answer;
        StageDelta {
            generated_query: Some(GeneratedQuery {
                query: answer.query.clone(),
                rationale: None,
                tables_used: vec![],
            }),
            execution: Some(ExecutionResult::Succeeded {
                columns: answer.columns.clone(),
                rows: answer.rows.clone(),
                elapsed_ms: 0,
            }),
            analysis: answer.analysis.clone(),
            next_stage: Some(Stage::Presentation),
            ..StageDelta::default()
        }
    }

    /// 澄清：待确认的语义命中、挂起问题与（可选）LLM 澄清判定
    async fn stage_clarification(&self, state: &PipelineState) -> Result<StageDelta, PipelineError> {
        // 1. 语义命中待确认
        if let Some(meta) = &state.cache_hit {
            if !meta.confirmed {
                if state.confirmed_answers.is_empty() {
                    // 还没有回答：暂停，把问题抛给调用方
                    return Ok(StageDelta {
                        pause: true,
                        ..StageDelta::default()
                    });
                }
                let affirmed = state.confirmed_answers.iter().any(|a| is_affirmative(a));
                return if affirmed {
                    Ok(StageDelta {
                        confirm_cache_hit: true,
                        next_stage: Some(Stage::CacheHit),
                        ..StageDelta::default()
                    })
                } else {
                    // 用户否认等价：丢弃命中，走完整流水线
                    Ok(StageDelta {
                        clear_cache_hit: true,
                        clear_pending_questions: true,
                        next_stage: Some(Stage::SchemaLookup),
                        ..StageDelta::default()
                    })
                };
            }
        }

        // 2. 仍有挂起问题且无回答：暂停
        if !state.pending_questions.is_empty() && state.confirmed_answers.is_empty() {
            return Ok(StageDelta {
                pause: true,
                ..StageDelta::default()
            });
        }

        // 3. 首次经过且启用 LLM 澄清判定
        if self.cfg.clarify_with_llm
            && state.confirmed_answers.is_empty()
            && state.pending_questions.is_empty()
        {
            let outcome = self
                .planner
                .clarify(&state.input, state.schema_context.as_ref())
                .await;
            if !outcome.clear && !outcome.questions.is_empty() {
                return Ok(StageDelta {
                    pending_questions: Some(outcome.questions),
                    pause: true,
                    ..StageDelta::default()
                });
            }
        }

        Ok(StageDelta {
            clear_pending_questions: true,
            next_stage: Some(Stage::SchemaLookup),
            ..StageDelta::default()
        })
    }

    /// schema 已在（重放/续跑）则直接跳过，保留部分进度
    async fn stage_schema_lookup(&self, state: &PipelineState) -> Result<StageDelta, PipelineError> {
        if state.schema_context.is_some() {
            return Ok(StageDelta::next(Stage::QueryGeneration));
        }
        let ctx = self
            .schema
            .schema_context(&state.datasource_id, &state.input)
            .await
            .map_err(|e| PipelineError::Schema(e.to_string()))?;
        Ok(StageDelta {
            schema_context: Some(ctx),
            next_stage: Some(Stage::QueryGeneration),
            ..StageDelta::default()
        })
    }

    async fn stage_query_generation(&self, state: &PipelineState) -> Result<StageDelta, PipelineError> {
        let schema = state
            .schema_context
            .as_ref()
            .ok_or_else(|| PipelineError::Unrecoverable("schema context missing".to_string()))?;
        let generated = self
            .planner
            .generate(
                &state.input,
                schema,
                &state.confirmed_answers,
                state.recovery_hint.as_deref(),
            )
            .await?;
        tracing::debug!("generated query: {}", generated.query);
        Ok(StageDelta {
            generated_query: Some(generated),
            next_stage: Some(Stage::QueryValidation),
            ..StageDelta::default()
        })
    }

    fn stage_query_validation(&self, state: &PipelineState) -> Result<StageDelta, PipelineError> {
        let generated = state
            .generated_query
            .as_ref()
            .ok_or_else(|| PipelineError::Unrecoverable("no query to validate".to_string()))?;
        let result =
            self.validator
                .validate(&generated.query, state.dialect, state.schema_context.as_ref());

        if !result.is_valid {
            return Err(PipelineError::Validation(result.errors.join("; ")));
        }
        for warning in &result.warnings {
            tracing::warn!("validation warning: {}", warning);
        }

        // 保语义自动修复（行限制注入）直接采纳
        let fixed = result.fixed_query.clone();
        let mut delta = StageDelta {
            validation: Some(result),
            next_stage: Some(Stage::QueryExecution),
            ..StageDelta::default()
        };
        if let Some(fixed) = fixed {
            delta.generated_query = Some(GeneratedQuery {
                query: fixed,
                rationale: generated.rationale.clone(),
                tables_used: generated.tables_used.clone(),
            });
        }
        Ok(delta)
    }

    /// 双重超时：调用方 tokio timeout + 支持下推的方言执行时限
    async fn stage_query_execution(
        &self,
        state: &PipelineState,
        cancel: &CancellationToken,
    ) -> Result<StageDelta, PipelineError> {
        let generated = state
            .generated_query
            .as_ref()
            .ok_or_else(|| PipelineError::Unrecoverable("no query to execute".to_string()))?;
        let timeout = self.cfg.execution_timeout;
        let query = apply_timeout_hint(&generated.query, state.dialect, timeout);

        let execution = tokio::select! {
            _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
            result = tokio::time::timeout(
                timeout,
                self.executor.execute(&query, &state.datasource_id, timeout),
            ) => result,
        };

        let outcome = match execution {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => return Err(PipelineError::Execution(e.to_string())),
            Err(_) => {
                return Err(PipelineError::Execution(format!(
                    "query timeout after {}s",
                    timeout.as_secs()
                )))
            }
        };

        Ok(StageDelta {
            execution: Some(ExecutionResult::Succeeded {
                columns: outcome.columns,
                rows: outcome.rows,
                elapsed_ms: outcome.elapsed_ms,
            }),
            next_stage: Some(Stage::Analysis),
            ..StageDelta::default()
        })
    }

    /// 结果解读；LLM 失败时回退为确定性摘要，分析绝不让整轮失败
    async fn stage_analysis(&self, state: &PipelineState) -> Result<StageDelta, PipelineError> {
        let ExecutionResult::Succeeded { columns, rows, elapsed_ms } = &state.execution else {
            return Err(PipelineError::Unrecoverable(
                "analysis invoked without execution result".to_string(),
            ));
        };
        let analysis = match self.planner.analyze(&state.input, columns, rows).await {
            Ok(text) if !text.trim().is_empty() => text,
            Ok(_) | Err(_) => format!(
                "Returned {} rows x {} columns in {} ms.",
                rows.len(),
                columns.len(),
                elapsed_ms
            ),
        };
        Ok(StageDelta {
            analysis: Some(analysis),
            next_stage: Some(Stage::Presentation),
            ..StageDelta::default()
        })
    }

    /// 组装回复；非缓存来源且执行成功时回写三层缓存
    async fn stage_presentation(&self, state: &PipelineState) -> Result<StageDelta, PipelineError> {
        let ExecutionResult::Succeeded { columns, rows, .. } = &state.execution else {
            return Err(PipelineError::Unrecoverable(
                "presentation invoked without execution result".to_string(),
            ));
        };
        let analysis = state.analysis.clone().unwrap_or_default();
        let response = if analysis.is_empty() {
            format!("{} rows x {} columns", rows.len(), columns.len())
        } else {
            format!("{}\n\n({} rows x {} columns)", analysis, rows.len(), columns.len())
        };

        let validated = state
            .validation
            .as_ref()
            .map(|v| v.is_valid)
            .unwrap_or(false);
        if state.cache_hit.is_none() && validated {
            if let Some(generated) = &state.generated_query {
                self.cache
                    .store(
                        &state.thread_id,
                        &state.datasource_id,
                        &state.input,
                        CachedAnswer {
                            query: generated.query.clone(),
                            columns: columns.clone(),
                            rows: rows.clone(),
                            analysis: state.analysis.clone(),
                        },
                    )
                    .await;
            }
        }

        Ok(StageDelta {
            response: Some(response),
            next_stage: Some(Stage::Completed),
            ..StageDelta::default()
        })
    }

    /// 恢复：预算内按分类决定 修复/重生成/放弃
    async fn stage_error_recovery(
        &self,
        state: &PipelineState,
        events: &Option<&mpsc::UnboundedSender<PipelineEvent>>,
    ) -> Result<StageDelta, PipelineError> {
        let action = self.recovery.decide(state).await;
        match action {
            RecoveryAction::ApplyFix {
                query,
                note,
                reset_retries,
            } => {
                send_event(
                    events,
                    PipelineEvent::Recovery {
                        action: "apply_fix".to_string(),
                        detail: note.clone(),
                    },
                );
                let rationale = state.generated_query.as_ref().and_then(|g| g.rationale.clone());
                let tables_used = state
                    .generated_query
                    .as_ref()
                    .map(|g| g.tables_used.clone())
                    .unwrap_or_default();
                Ok(StageDelta {
                    generated_query: Some(GeneratedQuery {
                        query,
                        rationale,
                        tables_used,
                    }),
                    recovery_hint: Some(note),
                    accept_fix: reset_retries,
                    next_stage: Some(Stage::QueryValidation),
                    ..StageDelta::default()
                })
            }
            RecoveryAction::Regenerate { hint } => {
                send_event(
                    events,
                    PipelineEvent::Recovery {
                        action: "regenerate".to_string(),
                        detail: hint.clone(),
                    },
                );
                Ok(StageDelta {
                    recovery_hint: Some(hint),
                    next_stage: Some(Stage::QueryGeneration),
                    ..StageDelta::default()
                })
            }
            RecoveryAction::GiveUp { reason } => {
                send_event(
                    events,
                    PipelineEvent::Recovery {
                        action: "give_up".to_string(),
                        detail: reason.clone(),
                    },
                );
                Ok(StageDelta {
                    termination_reason: Some(reason),
                    next_stage: Some(Stage::Terminated),
                    ..StageDelta::default()
                })
            }
        }
    }

    fn completed_outcome(&self, state: &PipelineState) -> TurnOutcome {
        let (columns, rows) = match &state.execution {
            ExecutionResult::Succeeded { columns, rows, .. } => (columns.clone(), rows.clone()),
            _ => (Vec::new(), Vec::new()),
        };
        TurnOutcome::Completed(Box::new(CompletedTurn {
            response: state.response.clone().unwrap_or_default(),
            query: state
                .generated_query
                .as_ref()
                .map(|g| g.query.clone())
                .unwrap_or_default(),
            columns,
            rows,
            analysis: state.analysis.clone(),
            from_cache: state.cache_hit.as_ref().map(|m| m.tier),
        }))
    }

    /// 终结：写终态、持久化（含完整 error_history）、发事件
    async fn terminate(
        &self,
        state: &mut PipelineState,
        reason: &str,
        events: &Option<&mpsc::UnboundedSender<PipelineEvent>>,
    ) -> Result<TurnOutcome, PipelineError> {
        state.stage = Stage::Terminated;
        state.termination_reason = Some(reason.to_string());
        if let Err(e) = self.persist(state).await {
            // 终态必须返回给调用方；持久化失败只记日志
            tracing::warn!("failed to persist terminal state: {}", e);
        }
        send_event(
            events,
            PipelineEvent::Terminated {
                reason: reason.to_string(),
            },
        );
        Ok(TurnOutcome::Terminated {
            reason: reason.to_string(),
            error_history: state.error_history.clone(),
        })
    }
}
