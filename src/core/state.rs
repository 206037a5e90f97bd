//! 状态与触发器定义，以及 TurnSnapshot 投影
//!
//! 外部观察者（前端、测试）只持有轻量的 TurnSnapshot；完整 Turn 由 TurnController 维护并投影出来。

use std::fmt;

use serde::Serialize;

use crate::core::mailbox::Mailbox;
use crate::core::turn::{OpId, Turn, TurnId};

/// 回合状态。READY 为初始状态，SHUTDOWN 为唯一终止状态
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TurnState {
    #[default]
    Ready,
    Engage,
    Understand,
    ExecuteScript,
    CreateDynamicTool,
    ValidateToolSchema,
    ParallelizeTasks,
    AwaitParallelResults,
    Generate,
    ErrorRecoveryUnified,
    Complete,
    Shutdown,
}

impl TurnState {
    pub const ALL: [TurnState; 12] = [
        TurnState::Ready,
        TurnState::Engage,
        TurnState::Understand,
        TurnState::ExecuteScript,
        TurnState::CreateDynamicTool,
        TurnState::ValidateToolSchema,
        TurnState::ParallelizeTasks,
        TurnState::AwaitParallelResults,
        TurnState::Generate,
        TurnState::ErrorRecoveryUnified,
        TurnState::Complete,
        TurnState::Shutdown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TurnState::Ready => "READY",
            TurnState::Engage => "ENGAGE",
            TurnState::Understand => "UNDERSTAND",
            TurnState::ExecuteScript => "EXECUTE_SCRIPT",
            TurnState::CreateDynamicTool => "CREATE_DYNAMIC_TOOL",
            TurnState::ValidateToolSchema => "VALIDATE_TOOL_SCHEMA",
            TurnState::ParallelizeTasks => "PARALLELIZE_TASKS",
            TurnState::AwaitParallelResults => "AWAIT_PARALLEL_RESULTS",
            TurnState::Generate => "GENERATE",
            TurnState::ErrorRecoveryUnified => "ERROR_RECOVERY_UNIFIED",
            TurnState::Complete => "COMPLETE",
            TurnState::Shutdown => "SHUTDOWN",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TurnState::Shutdown)
    }
}

impl fmt::Display for TurnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 触发器：核心消费与产生的全部事件词汇
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Trigger {
    UserInput,
    IntentDetected,
    ToolsRouted,
    ScriptParsed,
    DynamicToolRequest,
    ParallelTasksReady,
    ErrorOccurred,
    FatalError,
    ScriptStepComplete,
    ScriptExecutionComplete,
    TimeoutDetected,
    RecursionLimitExceeded,
    StepBudgetExhausted,
    DynamicToolCreated,
    SchemaValidated,
    SchemaInvalid,
    ToolSuccess,
    ToolFailure,
    ResponseReady,
    ParallelResultsReady,
    RecoverySuccess,
    TurnComplete,
    ShutdownRequested,
}

impl Trigger {
    pub const ALL: [Trigger; 23] = [
        Trigger::UserInput,
        Trigger::IntentDetected,
        Trigger::ToolsRouted,
        Trigger::ScriptParsed,
        Trigger::DynamicToolRequest,
        Trigger::ParallelTasksReady,
        Trigger::ErrorOccurred,
        Trigger::FatalError,
        Trigger::ScriptStepComplete,
        Trigger::ScriptExecutionComplete,
        Trigger::TimeoutDetected,
        Trigger::RecursionLimitExceeded,
        Trigger::StepBudgetExhausted,
        Trigger::DynamicToolCreated,
        Trigger::SchemaValidated,
        Trigger::SchemaInvalid,
        Trigger::ToolSuccess,
        Trigger::ToolFailure,
        Trigger::ResponseReady,
        Trigger::ParallelResultsReady,
        Trigger::RecoverySuccess,
        Trigger::TurnComplete,
        Trigger::ShutdownRequested,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::UserInput => "USER_INPUT",
            Trigger::IntentDetected => "INTENT_DETECTED",
            Trigger::ToolsRouted => "TOOLS_ROUTED",
            Trigger::ScriptParsed => "SCRIPT_PARSED",
            Trigger::DynamicToolRequest => "DYNAMIC_TOOL_REQUEST",
            Trigger::ParallelTasksReady => "PARALLEL_TASKS_READY",
            Trigger::ErrorOccurred => "ERROR_OCCURRED",
            Trigger::FatalError => "FATAL_ERROR",
            Trigger::ScriptStepComplete => "SCRIPT_STEP_COMPLETE",
            Trigger::ScriptExecutionComplete => "SCRIPT_EXECUTION_COMPLETE",
            Trigger::TimeoutDetected => "TIMEOUT_DETECTED",
            Trigger::RecursionLimitExceeded => "RECURSION_LIMIT_EXCEEDED",
            Trigger::StepBudgetExhausted => "STEP_BUDGET_EXHAUSTED",
            Trigger::DynamicToolCreated => "DYNAMIC_TOOL_CREATED",
            Trigger::SchemaValidated => "SCHEMA_VALIDATED",
            Trigger::SchemaInvalid => "SCHEMA_INVALID",
            Trigger::ToolSuccess => "TOOL_SUCCESS",
            Trigger::ToolFailure => "TOOL_FAILURE",
            Trigger::ResponseReady => "RESPONSE_READY",
            Trigger::ParallelResultsReady => "PARALLEL_RESULTS_READY",
            Trigger::RecoverySuccess => "RECOVERY_SUCCESS",
            Trigger::TurnComplete => "TURN_COMPLETE",
            Trigger::ShutdownRequested => "SHUTDOWN_REQUESTED",
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 控制器对外的「投影」状态，轻量且可序列化
#[derive(Clone, Debug, Serialize)]
pub struct TurnSnapshot {
    pub state: TurnState,
    pub turn_id: Option<TurnId>,
    pub op_id: Option<OpId>,
    pub step_count: u32,
    pub recursion_depth: u32,
    pub retry_count: u32,
    pub mailbox_len: usize,
    /// 邮箱压力：队列长度 / 上限
    pub mailbox_pressure: f32,
}

impl Default for TurnSnapshot {
    fn default() -> Self {
        Self {
            state: TurnState::Ready,
            turn_id: None,
            op_id: None,
            step_count: 0,
            recursion_depth: 0,
            retry_count: 0,
            mailbox_len: 0,
            mailbox_pressure: 0.0,
        }
    }
}

impl TurnSnapshot {
    /// 将控制器状态、活动回合与邮箱合并为快照
    pub fn project(state: TurnState, turn: Option<&Turn>, mailbox: &Mailbox) -> Self {
        Self {
            state,
            turn_id: turn.map(|t| t.id),
            op_id: turn.map(|t| t.op_id),
            step_count: turn.map_or(0, |t| t.step_count),
            recursion_depth: turn.map_or(0, |t| t.recursion_depth),
            retry_count: turn.map_or(0, |t| t.retry_count),
            mailbox_len: mailbox.len(),
            mailbox_pressure: mailbox.pressure(),
        }
    }
}
