//! 守卫子系统：轮次上限、循环检测、前置条件
//!
//! 三项检查固定顺序组合（turn-limit -> loop -> prerequisites），最先失败者胜出，
//! 因此最严重的问题总是被确定性地首先报告。守卫失败即 fail-closed，绝不静默越限。

use crate::core::{PipelineState, Stage};

/// 守卫配置
#[derive(Debug, Clone)]
pub struct GuardConfig {
    /// 单轮最大阶段派发数
    pub max_turns: u32,
    /// 连续相同阶段多少次判定为循环
    pub loop_window: usize,
    /// 生成-校验-恢复循环最多重复多少次
    pub max_gen_retries: u32,
    /// agent_call_history 的固定窗口长度
    pub history_window: usize,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            max_turns: 30,
            loop_window: 3,
            max_gen_retries: 3,
            history_window: 12,
        }
    }
}

/// 守卫判定：should_stop 为 true 时 reason 必然非空
#[derive(Debug, Clone)]
pub struct GuardVerdict {
    pub should_stop: bool,
    pub reason: Option<String>,
}

impl GuardVerdict {
    pub fn pass() -> Self {
        Self {
            should_stop: false,
            reason: None,
        }
    }

    pub fn stop(reason: impl Into<String>) -> Self {
        Self {
            should_stop: true,
            reason: Some(reason.into()),
        }
    }
}

/// 守卫
#[derive(Debug, Clone, Default)]
pub struct Guard {
    cfg: GuardConfig,
}

impl Guard {
    pub fn new(cfg: GuardConfig) -> Self {
        Self { cfg }
    }

    pub fn config(&self) -> &GuardConfig {
        &self.cfg
    }

    /// 轮次上限；到达即 fail-closed
    pub fn check_turn_limit(&self, state: &PipelineState) -> GuardVerdict {
        if state.turn_count >= self.cfg.max_turns {
            GuardVerdict::stop(format!(
                "turn limit reached ({} of {}); start a new request to continue",
                state.turn_count, self.cfg.max_turns
            ))
        } else {
            GuardVerdict::pass()
        }
    }

    /// 循环检测：连续重复 + 生成-校验-恢复震荡
    ///
    /// 第二种模式专捕「每次修复被采纳、retry_count 被重置」时普通重复计数漏掉的 thrash。
    pub fn check_agent_loop(&self, state: &PipelineState, candidate: Stage) -> GuardVerdict {
        let history = &state.agent_call_history;
        let n = self.cfg.loop_window;
        if n > 0 && history.len() >= n {
            let tail = &history[history.len() - n..];
            if tail.iter().all(|s| *s == candidate) {
                return GuardVerdict::stop(format!(
                    "stage {} dispatched {} times in a row; aborting to avoid an infinite loop",
                    candidate, n
                ));
            }
        }

        let cycles = history
            .windows(2)
            .filter(|w| {
                w[0] == Stage::ErrorRecovery
                    && matches!(w[1], Stage::QueryGeneration | Stage::QueryValidation)
            })
            .count() as u32;
        if cycles >= self.cfg.max_gen_retries {
            return GuardVerdict::stop(format!(
                "generate-validate-recover cycle repeated {} times (max {}); aborting",
                cycles, self.cfg.max_gen_retries
            ));
        }
        GuardVerdict::pass()
    }

    /// 目标阶段的前置条件；违规时指出应先运行的阶段
    pub fn check_prerequisites(&self, state: &PipelineState, target: Stage) -> GuardVerdict {
        match target {
            Stage::QueryGeneration if state.schema_context.is_none() => GuardVerdict::stop(
                "query generation requires schema context; run schema_lookup first".to_string(),
            ),
            Stage::QueryExecution => {
                let validated = state
                    .validation
                    .as_ref()
                    .map(|v| v.is_valid)
                    .unwrap_or(false);
                if state.generated_query.is_none() || !validated {
                    GuardVerdict::stop(
                        "execution requires a validated query; run query_validation first"
                            .to_string(),
                    )
                } else {
                    GuardVerdict::pass()
                }
            }
            Stage::Analysis if !state.execution.is_succeeded() => GuardVerdict::stop(
                "analysis requires an execution result; run query_execution first".to_string(),
            ),
            _ => GuardVerdict::pass(),
        }
    }

    /// 固定顺序组合三项检查；最先失败者胜出
    pub fn run_all_guards(&self, state: &PipelineState, target: Stage) -> GuardVerdict {
        let verdict = self.check_turn_limit(state);
        if verdict.should_stop {
            return verdict;
        }
        let verdict = self.check_agent_loop(state, target);
        if verdict.should_stop {
            return verdict;
        }
        self.check_prerequisites(state, target)
    }

    /// 每次成功派发后更新：轮次 +1、调用历史追加并裁剪、completed_stages 幂等插入
    pub fn update_guard_state(&self, state: &mut PipelineState, stage: Stage) {
        state.turn_count += 1;
        state.agent_call_history.push(stage);
        if state.agent_call_history.len() > self.cfg.history_window {
            let drop = state.agent_call_history.len() - self.cfg.history_window;
            state.agent_call_history.drain(..drop);
        }
        state.completed_stages.insert(stage);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::Dialect;

    fn state() -> PipelineState {
        PipelineState::new("t1", "ds", Dialect::MySql, "q", 3)
    }

    fn guard() -> Guard {
        Guard::default()
    }

    #[test]
    fn test_turn_count_equals_dispatches() {
        let g = guard();
        let mut s = state();
        for i in 0..5 {
            g.update_guard_state(&mut s, Stage::SchemaLookup);
            assert_eq!(s.turn_count, i + 1);
        }
    }

    #[test]
    fn test_turn_limit_fails_closed() {
        let g = guard();
        let mut s = state();
        s.turn_count = 30;
        let v = g.run_all_guards(&s, Stage::QueryGeneration);
        assert!(v.should_stop);
        assert!(v.reason.unwrap().contains("turn limit"));
    }

    #[test]
    fn test_three_consecutive_same_stage_stops() {
        let g = guard();
        let mut s = state();
        for _ in 0..3 {
            g.update_guard_state(&mut s, Stage::QueryGeneration);
        }
        s.schema_context = Some(Default::default());
        let v = g.run_all_guards(&s, Stage::QueryGeneration);
        assert!(v.should_stop);
        assert!(!v.reason.unwrap_or_default().is_empty());
    }

    #[test]
    fn test_two_consecutive_passes() {
        let g = guard();
        let mut s = state();
        s.schema_context = Some(Default::default());
        for _ in 0..2 {
            g.update_guard_state(&mut s, Stage::QueryGeneration);
        }
        assert!(!g.run_all_guards(&s, Stage::QueryGeneration).should_stop);
    }

    #[test]
    fn test_gen_cycle_detected_despite_retry_reset() {
        let g = guard();
        let mut s = state();
        s.schema_context = Some(Default::default());
        // 三次 恢复->重新生成 震荡；retry_count 可能每次都被修复重置
        for _ in 0..3 {
            g.update_guard_state(&mut s, Stage::QueryGeneration);
            g.update_guard_state(&mut s, Stage::ErrorRecovery);
            g.update_guard_state(&mut s, Stage::QueryGeneration);
            g.update_guard_state(&mut s, Stage::QueryValidation);
        }
        let v = g.check_agent_loop(&s, Stage::QueryGeneration);
        assert!(v.should_stop);
        assert!(v.reason.unwrap().contains("cycle"));
    }

    #[test]
    fn test_prerequisite_generation_needs_schema() {
        let g = guard();
        let s = state();
        let v = g.check_prerequisites(&s, Stage::QueryGeneration);
        assert!(v.should_stop);
        assert!(v.reason.unwrap().contains("schema_lookup"));
    }

    #[test]
    fn test_prerequisite_execution_needs_valid_query() {
        let g = guard();
        let mut s = state();
        s.generated_query = Some(crate::core::GeneratedQuery {
            query: "SELECT 1".to_string(),
            rationale: None,
            tables_used: vec![],
        });
        // 查询在但未通过校验
        let v = g.check_prerequisites(&s, Stage::QueryExecution);
        assert!(v.should_stop);
        assert!(v.reason.unwrap().contains("query_validation"));
    }

    #[test]
    fn test_prerequisite_analysis_needs_execution() {
        let g = guard();
        let s = state();
        let v = g.check_prerequisites(&s, Stage::Analysis);
        assert!(v.should_stop);
        assert!(v.reason.unwrap().contains("query_execution"));
    }

    #[test]
    fn test_guard_order_turn_limit_first() {
        let g = guard();
        let mut s = state();
        s.turn_count = 30;
        for _ in 0..3 {
            s.agent_call_history.push(Stage::QueryGeneration);
        }
        // 同时满足轮次上限与循环，报告的必须是轮次上限
        let v = g.run_all_guards(&s, Stage::QueryGeneration);
        assert!(v.reason.unwrap().contains("turn limit"));
    }

    #[test]
    fn test_history_window_trimmed() {
        let g = guard();
        let mut s = state();
        for _ in 0..40 {
            g.update_guard_state(&mut s, Stage::SchemaLookup);
        }
        assert_eq!(s.agent_call_history.len(), g.config().history_window);
        assert_eq!(s.turn_count, 40);
    }

    #[test]
    fn test_completed_stages_idempotent() {
        let g = guard();
        let mut s = state();
        g.update_guard_state(&mut s, Stage::SchemaLookup);
        g.update_guard_state(&mut s, Stage::SchemaLookup);
        assert_eq!(s.completed_stages.len(), 1);
    }
}
