//! 脚本执行器：按依赖顺序逐步执行
//!
//! step() 每次只执行一步，由控制器在 EXECUTE_SCRIPT 的自环里反复调用；嵌套脚本在一步之内跑完。
//! 每一步之前先检查回合耗时与步数预算，进入嵌套前检查递归深度。

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;

use crate::core::error::{ErrorKind, Failure};
use crate::core::guard::GuardTracker;
use crate::core::state::Trigger;
use crate::core::turn::Turn;
use crate::script::graph::ScriptGraph;
use crate::script::types::{ScriptStep, StepAction, StepStatus};
use crate::tools::{ToolError, ToolExecutor};

/// 单步执行结果
#[derive(Debug, Clone)]
pub enum StepOutcome {
    /// 一步完成；remaining 为剩余待执行步数
    Completed {
        step_id: String,
        output: String,
        remaining: usize,
    },
    /// 没有待执行步骤
    Exhausted,
    Failed(Failure),
}

impl StepOutcome {
    pub fn trigger(&self) -> Trigger {
        match self {
            StepOutcome::Completed { remaining, .. } if *remaining > 0 => Trigger::ScriptStepComplete,
            StepOutcome::Completed { .. } | StepOutcome::Exhausted => Trigger::ScriptExecutionComplete,
            StepOutcome::Failed(f) => f.trigger,
        }
    }
}

pub struct ScriptExecutor {
    tools: Arc<ToolExecutor>,
    guard: GuardTracker,
}

impl ScriptExecutor {
    pub fn new(tools: Arc<ToolExecutor>, guard: GuardTracker) -> Self {
        Self { tools, guard }
    }

    /// 执行下一个就绪步骤（依赖全部 done、列表顺序最靠前）
    pub fn step<'a>(&'a self, steps: &'a mut [ScriptStep], turn: &'a mut Turn) -> BoxFuture<'a, StepOutcome> {
        async move {
            if let Err(v) = self.guard.check_elapsed(turn) {
                return StepOutcome::Failed(v.into_failure());
            }
            let graph = match ScriptGraph::new(steps) {
                Ok(g) => g,
                Err(e) => {
                    return StepOutcome::Failed(Failure::new(
                        ErrorKind::Planning,
                        Trigger::ErrorOccurred,
                        e.to_string(),
                    ))
                }
            };

            let pending = steps.iter().filter(|s| s.status == StepStatus::Pending).count();
            if pending == 0 {
                return StepOutcome::Exhausted;
            }
            let Some(idx) = next_ready(steps) else {
                let blocked: Vec<&str> = steps
                    .iter()
                    .filter(|s| s.status == StepStatus::Pending)
                    .map(|s| s.id.as_str())
                    .collect();
                return StepOutcome::Failed(Failure::new(
                    ErrorKind::ToolFailure,
                    Trigger::ErrorOccurred,
                    format!("script blocked, no runnable step among {blocked:?}"),
                ));
            };

            if let Err(v) = self.guard.check_and_increment_step(turn) {
                tracing::warn!(step = %steps[idx].id, step_count = turn.step_count, "step budget exhausted");
                return StepOutcome::Failed(v.into_failure());
            }

            steps[idx].status = StepStatus::Running;
            let step_id = steps[idx].id.clone();
            tracing::debug!(step = %step_id, step_count = turn.step_count, depth = turn.recursion_depth, "script step");

            match self.run_action(&mut steps[idx].action, turn).await {
                Ok(output) => {
                    let step = &mut steps[idx];
                    step.status = StepStatus::Done;
                    step.result = Some(output.clone());
                    StepOutcome::Completed {
                        step_id,
                        output,
                        remaining: pending - 1,
                    }
                }
                Err(failure) => {
                    let index: HashMap<String, usize> =
                        steps.iter().enumerate().map(|(i, s)| (s.id.clone(), i)).collect();
                    steps[idx].status = StepStatus::Failed;
                    steps[idx].error = Some(failure.message.clone());
                    // 依赖失败步骤的下游不再执行
                    for dependent in graph.dependents(&step_id) {
                        if let Some(&i) = index.get(&dependent) {
                            if steps[i].status == StepStatus::Pending {
                                steps[i].status = StepStatus::Failed;
                                steps[i].error = Some(format!("dependency {step_id} failed"));
                            }
                        }
                    }
                    StepOutcome::Failed(failure.with_source(step_id))
                }
            }
        }
        .boxed()
    }

    /// 执行整段脚本直到全部完成或第一个失败，返回各步输出
    pub fn run_all<'a>(
        &'a self,
        steps: &'a mut [ScriptStep],
        turn: &'a mut Turn,
    ) -> BoxFuture<'a, Result<Vec<String>, Failure>> {
        async move {
            let mut outputs = Vec::new();
            loop {
                match self.step(steps, turn).await {
                    StepOutcome::Completed { output, .. } => outputs.push(output),
                    StepOutcome::Exhausted => return Ok(outputs),
                    StepOutcome::Failed(f) => return Err(f),
                }
            }
        }
        .boxed()
    }

    fn run_action<'a>(&'a self, action: &'a mut StepAction, turn: &'a mut Turn) -> BoxFuture<'a, Result<String, Failure>> {
        async move {
            match action {
                StepAction::Tool(call) => self
                    .tools
                    .execute(&call.tool, call.args.clone())
                    .await
                    .map_err(tool_failure),
                StepAction::Script(children) => {
                    self.guard.descend(turn).map_err(|v| v.into_failure())?;
                    let res = self.run_all(children, turn).await;
                    self.guard.ascend(turn);
                    res.map(|outputs| outputs.join("\n"))
                }
            }
        }
        .boxed()
    }
}

fn next_ready(steps: &[ScriptStep]) -> Option<usize> {
    let status: HashMap<&str, StepStatus> = steps.iter().map(|s| (s.id.as_str(), s.status)).collect();
    steps.iter().position(|s| {
        s.status == StepStatus::Pending
            && s
                .depends_on
                .iter()
                .all(|d| status.get(d.as_str()) == Some(&StepStatus::Done))
    })
}

fn tool_failure(e: ToolError) -> Failure {
    let trigger = match e {
        ToolError::Timeout(_) => Trigger::TimeoutDetected,
        _ => Trigger::ErrorOccurred,
    };
    Failure::new(e.kind(), trigger, e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::guard::GuardLimits;
    use crate::script::types::chain;
    use crate::tools::{EchoTool, ToolCall, ToolRegistry};
    use serde_json::json;
    use std::time::Duration;

    fn executor(limits: GuardLimits) -> ScriptExecutor {
        let mut reg = ToolRegistry::new();
        reg.register(EchoTool);
        let tools = Arc::new(ToolExecutor::new(Arc::new(reg), Duration::from_secs(5)));
        ScriptExecutor::new(tools, GuardTracker::new(limits))
    }

    fn echo(text: &str) -> ToolCall {
        ToolCall::new("echo", json!({ "text": text }))
    }

    fn nest(depth: usize) -> ScriptStep {
        let mut step = ScriptStep::tool("leaf", echo("deep"));
        for level in 0..depth {
            step = ScriptStep::nested(format!("level{level}"), vec![step]);
        }
        step
    }

    #[tokio::test]
    async fn test_steps_run_in_dependency_order() {
        let exec = executor(GuardLimits::default());
        let mut turn = Turn::new("x");
        let mut steps = vec![
            ScriptStep::tool("c", echo("third")).after("b"),
            ScriptStep::tool("a", echo("first")),
            ScriptStep::tool("b", echo("second")).after("a"),
        ];
        let mut triggers = Vec::new();
        let mut order = Vec::new();
        loop {
            let outcome = exec.step(&mut steps, &mut turn).await;
            triggers.push(outcome.trigger());
            match outcome {
                StepOutcome::Completed { step_id, remaining, .. } => {
                    order.push(step_id);
                    if remaining == 0 {
                        break;
                    }
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(order, vec!["a", "b", "c"]);
        assert_eq!(
            triggers,
            vec![
                Trigger::ScriptStepComplete,
                Trigger::ScriptStepComplete,
                Trigger::ScriptExecutionComplete
            ]
        );
        assert_eq!(turn.step_count, 3);
    }

    #[tokio::test]
    async fn test_failed_dependency_blocks_dependents() {
        let exec = executor(GuardLimits::default());
        let mut turn = Turn::new("x");
        let mut steps = vec![
            ScriptStep::tool("a", ToolCall::new("echo", json!({}))),
            ScriptStep::tool("b", echo("never")).after("a"),
            ScriptStep::tool("c", echo("independent")),
        ];
        let outcome = exec.step(&mut steps, &mut turn).await;
        let StepOutcome::Failed(failure) = outcome else {
            panic!("expected failure");
        };
        assert_eq!(failure.kind, ErrorKind::ToolFailure);
        assert_eq!(failure.trigger, Trigger::ErrorOccurred);
        assert_eq!(failure.source_id.as_deref(), Some("a"));
        assert_eq!(steps[1].status, StepStatus::Failed);
        assert!(steps[1].result.is_none());
        assert_eq!(steps[2].status, StepStatus::Pending);
    }

    #[tokio::test]
    async fn test_step_budget_halts_script() {
        let exec = executor(GuardLimits {
            step_budget: 10,
            ..GuardLimits::default()
        });
        let mut turn = Turn::new("x");
        let mut steps = chain((0..15).map(|i| echo(&i.to_string())));
        let err = exec.run_all(&mut steps, &mut turn).await.unwrap_err();
        assert_eq!(err.trigger, Trigger::StepBudgetExhausted);
        assert_eq!(turn.step_count, 10);
        assert_eq!(steps.iter().filter(|s| s.status == StepStatus::Done).count(), 10);
        assert_eq!(steps[10].status, StepStatus::Pending);
    }

    #[tokio::test]
    async fn test_nested_within_limit() {
        let exec = executor(GuardLimits::default());
        let mut turn = Turn::new("x");
        let mut steps = vec![nest(5)];
        let out = exec.run_all(&mut steps, &mut turn).await.unwrap();
        assert_eq!(out, vec!["deep".to_string()]);
        assert_eq!(turn.peak_recursion_depth, 5);
        assert_eq!(turn.recursion_depth, 0);
    }

    #[tokio::test]
    async fn test_recursion_limit_exceeded() {
        let exec = executor(GuardLimits::default());
        let mut turn = Turn::new("x");
        let mut steps = vec![nest(6)];
        let outcome = exec.step(&mut steps, &mut turn).await;
        assert_eq!(outcome.trigger(), Trigger::RecursionLimitExceeded);
        assert!(turn.peak_recursion_depth <= 5);
        assert_eq!(turn.recursion_depth, 0);
    }

    #[tokio::test]
    async fn test_timeout_before_step() {
        let exec = executor(GuardLimits {
            timeout: Duration::ZERO,
            ..GuardLimits::default()
        });
        let mut turn = Turn::new("x");
        let mut steps = chain([echo("a")]);
        let outcome = exec.step(&mut steps, &mut turn).await;
        assert_eq!(outcome.trigger(), Trigger::TimeoutDetected);
        assert_eq!(turn.step_count, 0);
    }

    #[tokio::test]
    async fn test_empty_script_is_exhausted() {
        let exec = executor(GuardLimits::default());
        let mut turn = Turn::new("x");
        let outcome = exec.step(&mut [], &mut turn).await;
        assert_eq!(outcome.trigger(), Trigger::ScriptExecutionComplete);
    }

    #[tokio::test]
    async fn test_invalid_graph_is_planning_error() {
        let exec = executor(GuardLimits::default());
        let mut turn = Turn::new("x");
        let mut steps = vec![ScriptStep::tool("a", echo("x")).after("ghost")];
        let StepOutcome::Failed(f) = exec.step(&mut steps, &mut turn).await else {
            panic!("expected failure");
        };
        assert_eq!(f.kind, ErrorKind::Planning);
    }
}
