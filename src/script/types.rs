//! 脚本类型定义
//!
//! 脚本是有序的步骤列表；步骤可以调用工具，也可以嵌套一段子脚本。

use serde::{Deserialize, Serialize};

use crate::tools::ToolCall;

pub type StepId = String;

/// 步骤状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// 等待执行
    #[default]
    Pending,
    /// 正在执行
    Running,
    /// 已完成
    Done,
    /// 失败（自身出错，或依赖失败未执行）
    Failed,
}

/// 步骤动作
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepAction {
    Tool(ToolCall),
    /// 嵌套子脚本，进入前检查递归深度
    Script(Vec<ScriptStep>),
}

/// 脚本中的一步
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptStep {
    pub id: StepId,
    #[serde(default)]
    pub depends_on: Vec<StepId>,
    pub action: StepAction,
    #[serde(default)]
    pub status: StepStatus,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ScriptStep {
    pub fn tool(id: impl Into<StepId>, call: ToolCall) -> Self {
        Self::with_action(id, StepAction::Tool(call))
    }

    pub fn nested(id: impl Into<StepId>, steps: Vec<ScriptStep>) -> Self {
        Self::with_action(id, StepAction::Script(steps))
    }

    fn with_action(id: impl Into<StepId>, action: StepAction) -> Self {
        Self {
            id: id.into(),
            depends_on: Vec::new(),
            action,
            status: StepStatus::Pending,
            result: None,
            error: None,
        }
    }

    /// 追加一个依赖
    pub fn after(mut self, dep: impl Into<StepId>) -> Self {
        self.depends_on.push(dep.into());
        self
    }

    /// 本步骤调用的工具（嵌套脚本返回 None）
    pub fn tool_call(&self) -> Option<&ToolCall> {
        match &self.action {
            StepAction::Tool(call) => Some(call),
            StepAction::Script(_) => None,
        }
    }
}

/// 把失败步骤重置为待执行（重试时使用），已完成的步骤保留
pub fn reset_failed(steps: &mut [ScriptStep]) {
    for step in steps.iter_mut().filter(|s| s.status == StepStatus::Failed) {
        step.status = StepStatus::Pending;
        step.error = None;
        if let StepAction::Script(children) = &mut step.action {
            reset_failed(children);
        }
    }
}

/// 线性链：step_i 依赖 step_{i-1}
pub fn chain(calls: impl IntoIterator<Item = ToolCall>) -> Vec<ScriptStep> {
    let mut steps: Vec<ScriptStep> = Vec::new();
    for (i, call) in calls.into_iter().enumerate() {
        let mut step = ScriptStep::tool(format!("step{}", i + 1), call);
        if i > 0 {
            step = step.after(format!("step{i}"));
        }
        steps.push(step);
    }
    steps
}
