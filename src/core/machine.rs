//! 转换表：(state, trigger) -> state 的唯一真相来源
//!
//! 表外的转换一律拒绝（ReugError::IllegalTransition），这是调用方的编程错误，不会被吞掉。

use std::collections::HashMap;

use serde::Serialize;

use crate::core::error::ReugError;
use crate::core::state::{Trigger, TurnState};

/// 表中的一行
#[derive(Clone, Debug, Serialize)]
pub struct Transition {
    pub from: TurnState,
    pub trigger: Trigger,
    pub to: TurnState,
    pub description: &'static str,
}

const fn row(from: TurnState, trigger: Trigger, to: TurnState, description: &'static str) -> Transition {
    Transition {
        from,
        trigger,
        to,
        description,
    }
}

/// 默认转换表
pub fn default_table() -> Vec<Transition> {
    use Trigger as T;
    use TurnState as S;

    vec![
        row(S::Ready, T::UserInput, S::Engage, "new turn begins"),
        row(S::Ready, T::ShutdownRequested, S::Shutdown, "shutdown while idle"),
        row(S::Engage, T::IntentDetected, S::Understand, "planner produced a route"),
        row(S::Engage, T::ErrorOccurred, S::ErrorRecoveryUnified, "intent detection failed"),
        row(S::Engage, T::FatalError, S::Complete, "session corrupted during engage"),
        row(S::Understand, T::ToolsRouted, S::Generate, "direct tool route or answer"),
        row(S::Understand, T::ScriptParsed, S::ExecuteScript, "multi-step script"),
        row(S::Understand, T::DynamicToolRequest, S::CreateDynamicTool, "tool must be synthesized"),
        row(S::Understand, T::ParallelTasksReady, S::ParallelizeTasks, "independent task fan-out"),
        row(S::Understand, T::ErrorOccurred, S::ErrorRecoveryUnified, "routing failed"),
        row(S::Understand, T::FatalError, S::Complete, "session corrupted during routing"),
        row(S::ExecuteScript, T::ScriptStepComplete, S::ExecuteScript, "next script step"),
        row(S::ExecuteScript, T::ScriptExecutionComplete, S::Generate, "all steps done"),
        row(S::ExecuteScript, T::ErrorOccurred, S::ErrorRecoveryUnified, "script step failed"),
        row(S::ExecuteScript, T::TimeoutDetected, S::ErrorRecoveryUnified, "turn deadline passed"),
        row(S::ExecuteScript, T::RecursionLimitExceeded, S::ErrorRecoveryUnified, "nesting too deep"),
        row(S::ExecuteScript, T::StepBudgetExhausted, S::ErrorRecoveryUnified, "step budget used up"),
        row(S::CreateDynamicTool, T::DynamicToolCreated, S::ValidateToolSchema, "candidate schema ready"),
        row(S::CreateDynamicTool, T::ErrorOccurred, S::ErrorRecoveryUnified, "synthesis failed"),
        row(S::CreateDynamicTool, T::FatalError, S::Complete, "session corrupted during synthesis"),
        row(S::ValidateToolSchema, T::SchemaValidated, S::Complete, "tool registered"),
        row(S::ValidateToolSchema, T::SchemaInvalid, S::ErrorRecoveryUnified, "schema rejected"),
        row(S::ParallelizeTasks, T::ToolSuccess, S::AwaitParallelResults, "batch launched"),
        row(S::ParallelizeTasks, T::ErrorOccurred, S::ErrorRecoveryUnified, "batch rejected"),
        row(S::AwaitParallelResults, T::ParallelResultsReady, S::Generate, "all tasks done"),
        row(S::AwaitParallelResults, T::TimeoutDetected, S::ErrorRecoveryUnified, "batch deadline passed"),
        row(S::AwaitParallelResults, T::ErrorOccurred, S::ErrorRecoveryUnified, "a task failed"),
        row(S::Generate, T::ToolSuccess, S::Complete, "tool output is the response"),
        row(S::Generate, T::ResponseReady, S::Complete, "response generated"),
        row(S::Generate, T::FatalError, S::Complete, "session corrupted during generation"),
        row(S::Generate, T::ToolFailure, S::ErrorRecoveryUnified, "tool or responder failed"),
        row(S::ErrorRecoveryUnified, T::RecoverySuccess, S::Understand, "retry or fallback route"),
        row(S::ErrorRecoveryUnified, T::FatalError, S::Complete, "degraded completion"),
        row(S::Complete, T::TurnComplete, S::Ready, "turn retired"),
        row(S::Complete, T::UserInput, S::Engage, "next turn without explicit reset"),
        row(S::Complete, T::ShutdownRequested, S::Shutdown, "shutdown after turn"),
    ]
}

/// 状态机：除转换表外无状态
#[derive(Clone, Debug)]
pub struct StateMachine {
    table: Vec<Transition>,
    index: HashMap<(TurnState, Trigger), TurnState>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    pub fn new() -> Self {
        Self::from_table(default_table())
    }

    /// 用自定义表构建；同一 (state, trigger) 出现多次时以第一行为准
    pub fn from_table(table: Vec<Transition>) -> Self {
        let mut index = HashMap::with_capacity(table.len());
        for t in &table {
            index.entry((t.from, t.trigger)).or_insert(t.to);
        }
        Self { table, index }
    }

    pub fn transition(&self, current: TurnState, trigger: Trigger) -> Result<TurnState, ReugError> {
        self.index
            .get(&(current, trigger))
            .copied()
            .ok_or(ReugError::IllegalTransition {
                state: current,
                trigger,
            })
    }

    pub fn outgoing(&self, state: TurnState) -> impl Iterator<Item = &Transition> {
        self.table.iter().filter(move |t| t.from == state)
    }

    pub fn table(&self) -> &[Transition] {
        &self.table
    }

    /// 非终止却没有出边的状态（应为空）
    pub fn deadlocked_states(&self) -> Vec<TurnState> {
        TurnState::ALL
            .into_iter()
            .filter(|s| !s.is_terminal() && self.outgoing(*s).next().is_none())
            .collect()
    }

    /// 渲染为 Mermaid stateDiagram-v2，文档直接由转换表生成
    pub fn to_mermaid(&self) -> String {
        let mut out = String::from("stateDiagram-v2\n    [*] --> READY\n");
        for t in &self.table {
            out.push_str(&format!("    {} --> {} : {}\n", t.from, t.to, t.trigger));
        }
        out.push_str("    SHUTDOWN --> [*]\n");
        out
    }
}
