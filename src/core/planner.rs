//! 意图 / 规划器接口
//!
//! 核心把规划器当作不透明的决策来源：ENGAGE 时给出路线，UNDERSTAND 按路线分派。
//! 恢复阶梯的降级路线优先取规划器提供的，否则用内置的缩小范围规则。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::core::error::{ErrorKind, Failure};
use crate::core::parallel::ParallelTaskSpec;
use crate::core::state::Trigger;
use crate::script::{ScriptStep, StepAction};
use crate::tools::{ToolCall, ToolDescriptor};

/// 动态工具请求：描述需要的能力，由规划器合成 Schema
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DynamicToolRequest {
    pub description: String,
}

/// 路由决策
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    /// 直接回答
    Respond(String),
    /// 依次调用工具，最后一个输出即回答
    Tools(Vec<ToolCall>),
    Script(Vec<ScriptStep>),
    DynamicTool(DynamicToolRequest),
    Parallel(Vec<ParallelTaskSpec>),
}

impl Route {
    /// UNDERSTAND 分派该路线时触发的触发器
    pub fn trigger(&self) -> Trigger {
        match self {
            Route::Respond(_) | Route::Tools(_) => Trigger::ToolsRouted,
            Route::Script(_) => Trigger::ScriptParsed,
            Route::DynamicTool(_) => Trigger::DynamicToolRequest,
            Route::Parallel(_) => Trigger::ParallelTasksReady,
        }
    }

    /// 路线里直接点名的工具（嵌套脚本递归展开）
    pub fn tool_names(&self) -> Vec<&str> {
        fn walk<'a>(steps: &'a [ScriptStep], out: &mut Vec<&'a str>) {
            for step in steps {
                match &step.action {
                    StepAction::Tool(call) => out.push(call.tool.as_str()),
                    StepAction::Script(children) => walk(children, out),
                }
            }
        }
        let mut out = Vec::new();
        match self {
            Route::Respond(_) | Route::DynamicTool(_) => {}
            Route::Tools(calls) => out.extend(calls.iter().map(|c| c.tool.as_str())),
            Route::Script(steps) => walk(steps, &mut out),
            Route::Parallel(specs) => out.extend(specs.iter().map(|s| s.call.tool.as_str())),
        }
        out
    }
}

/// 规划结果：主路线 + 可选的降级路线
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub route: Route,
    #[serde(default)]
    pub fallback: Option<Route>,
}

impl Plan {
    pub fn new(route: Route) -> Self {
        Self { route, fallback: None }
    }

    pub fn with_fallback(mut self, fallback: Route) -> Self {
        self.fallback = Some(fallback);
        self
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    /// 走恢复阶梯（ERROR_OCCURRED）
    #[error("Planning failed: {0}")]
    Recoverable(String),

    /// 会话损坏（FATAL_ERROR），不恢复
    #[error("Fatal planning error: {0}")]
    Fatal(String),
}

impl PlanError {
    pub fn into_failure(self) -> Failure {
        match &self {
            PlanError::Recoverable(_) => Failure::new(ErrorKind::Planning, Trigger::ErrorOccurred, self.to_string()),
            PlanError::Fatal(_) => Failure::new(ErrorKind::Fatal, Trigger::FatalError, self.to_string()),
        }
    }
}

/// 意图识别与规划
#[async_trait]
pub trait IntentPlanner: Send + Sync {
    /// ENGAGE：识别意图，给出路线。tools 为后端列出的可用工具（可能为空）
    async fn detect(&self, input: &str, tools: &[ToolDescriptor]) -> Result<Plan, PlanError>;

    /// CREATE_DYNAMIC_TOOL：合成候选 Schema（JSON），随后交给 SchemaValidator
    async fn synthesize_tool(&self, request: &DynamicToolRequest) -> Result<Value, PlanError> {
        Err(PlanError::Recoverable(format!(
            "dynamic tool synthesis not supported: {}",
            request.description
        )))
    }

    /// GENERATE：根据脚本 / 并行任务的输出生成回答
    async fn respond(&self, _input: &str, observations: &[String]) -> Result<String, String> {
        Ok(observations.join("\n"))
    }

    /// 恢复阶梯第二级的替代路线
    fn fallback(&self, plan: &Plan, failure: &Failure) -> Option<Route> {
        plan.fallback.clone().or_else(|| reduce_route(&plan.route, failure))
    }
}

/// 内置降级：并行批次去掉失败的任务；脚本退化为失败步骤的单次工具调用。
/// 超时没有内置降级（部分结果不合并）
pub fn reduce_route(route: &Route, failure: &Failure) -> Option<Route> {
    if failure.kind == ErrorKind::Timeout {
        return None;
    }
    let source = failure.source_id.as_deref()?;
    match route {
        Route::Parallel(specs) => {
            let rest: Vec<ParallelTaskSpec> = specs.iter().filter(|s| s.id != source).cloned().collect();
            (!rest.is_empty() && rest.len() < specs.len()).then_some(Route::Parallel(rest))
        }
        Route::Script(steps) => steps
            .iter()
            .find(|s| s.id == source)
            .and_then(|s| s.tool_call())
            .map(|call| Route::Tools(vec![call.clone()])),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn call(name: &str) -> ToolCall {
        ToolCall::new(name, json!({}))
    }

    fn parallel(ids: &[&str]) -> Route {
        Route::Parallel(ids.iter().map(|id| ParallelTaskSpec::new(*id, call(id))).collect())
    }

    #[test]
    fn test_route_triggers() {
        assert_eq!(Route::Respond("hi".into()).trigger(), Trigger::ToolsRouted);
        assert_eq!(Route::Tools(vec![]).trigger(), Trigger::ToolsRouted);
        assert_eq!(Route::Script(vec![]).trigger(), Trigger::ScriptParsed);
        assert_eq!(
            Route::DynamicTool(DynamicToolRequest {
                description: "fib".into()
            })
            .trigger(),
            Trigger::DynamicToolRequest
        );
        assert_eq!(parallel(&["a"]).trigger(), Trigger::ParallelTasksReady);
    }

    #[test]
    fn test_tool_names_walks_nested_scripts() {
        let route = Route::Script(vec![
            ScriptStep::tool("a", call("echo")),
            ScriptStep::nested("b", vec![ScriptStep::tool("c", call("search"))]),
        ]);
        assert_eq!(route.tool_names(), vec!["echo", "search"]);
    }

    #[test]
    fn test_reduce_parallel_drops_failed_task() {
        let failure = Failure::new(ErrorKind::ToolFailure, Trigger::ErrorOccurred, "boom").with_source("b");
        let reduced = reduce_route(&parallel(&["a", "b", "c"]), &failure).unwrap();
        assert_eq!(reduced, parallel(&["a", "c"]));
    }

    #[test]
    fn test_reduce_parallel_timeout_has_no_fallback() {
        let failure = Failure::new(ErrorKind::Timeout, Trigger::TimeoutDetected, "late").with_source("b");
        assert!(reduce_route(&parallel(&["a", "b"]), &failure).is_none());
    }

    #[test]
    fn test_reduce_script_to_single_tool() {
        let route = Route::Script(vec![
            ScriptStep::tool("s1", call("fetch")),
            ScriptStep::tool("s2", call("parse")).after("s1"),
        ]);
        let failure = Failure::new(ErrorKind::ToolFailure, Trigger::ErrorOccurred, "x").with_source("s2");
        assert_eq!(reduce_route(&route, &failure), Some(Route::Tools(vec![call("parse")])));
    }

    #[test]
    fn test_plan_error_mapping() {
        let f = PlanError::Fatal("corrupt".into()).into_failure();
        assert_eq!(f.trigger, Trigger::FatalError);
        let f = PlanError::Recoverable("unclear".into()).into_failure();
        assert_eq!(f.kind, ErrorKind::Planning);
    }
}
