//! 回合记录：Turn、只追加的历史、恢复尝试与最终结果

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::core::error::{ErrorKind, Strategy};
use crate::core::parallel::ParallelTask;
use crate::core::state::{Trigger, TurnState};

/// 回合 id：每个回合唯一
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct TurnId(Uuid);

impl TurnId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TurnId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TurnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "turn_{}", self.0)
    }
}

/// 操作 id：每次尝试唯一，异步回调必须携带它
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct OpId(Uuid);

impl OpId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for OpId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op_{}", self.0)
    }
}

/// 一次状态转换
#[derive(Clone, Debug, Serialize)]
pub struct TransitionEntry {
    pub trigger: Trigger,
    pub from: TurnState,
    pub to: TurnState,
    pub at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryOutcome {
    Recovered,
    Escalate,
    Fatal,
}

/// 恢复阶梯上的一次尝试（无论结果如何都记录）
#[derive(Clone, Debug, Serialize)]
pub struct RecoveryAttempt {
    pub error_kind: ErrorKind,
    pub strategy: Strategy,
    pub strategy_index: usize,
    pub outcome: RecoveryOutcome,
    /// 审计用：失败描述与本回合累计的 Schema 拒绝原因
    pub reasons: Vec<String>,
    pub at: DateTime<Utc>,
}

impl RecoveryAttempt {
    pub fn new(error_kind: ErrorKind, strategy: Strategy, outcome: RecoveryOutcome, reasons: Vec<String>) -> Self {
        Self {
            error_kind,
            strategy,
            strategy_index: strategy.index(),
            outcome,
            reasons,
            at: Utc::now(),
        }
    }
}

/// 历史条目：转换或恢复尝试
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HistoryEntry {
    Transition(TransitionEntry),
    Recovery(RecoveryAttempt),
}

/// 回合最终结果，只在 COMPLETE 时写入
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TurnResult {
    Success { response: String },
    /// 恢复阶梯走到告警：降级结束
    Degraded { reason: String },
    /// FATAL_ERROR 直接短路
    Fatal { reason: String },
}

impl TurnResult {
    pub fn is_success(&self) -> bool {
        matches!(self, TurnResult::Success { .. })
    }
}

/// 一次用户交互的工作单元
#[derive(Clone, Debug, Serialize)]
pub struct Turn {
    pub id: TurnId,
    pub op_id: OpId,
    pub state: TurnState,
    pub input: String,
    pub step_count: u32,
    pub recursion_depth: u32,
    /// 本回合出现过的最大嵌套深度
    pub peak_recursion_depth: u32,
    pub retry_count: u32,
    pub started_at: DateTime<Utc>,
    pub history: Vec<HistoryEntry>,
    /// 最近一次并行批次的任务记录
    pub parallel_tasks: Vec<ParallelTask>,
    pub result: Option<TurnResult>,
    #[serde(skip)]
    started: Instant,
    #[serde(skip)]
    retries: HashMap<ErrorKind, u32>,
    #[serde(skip)]
    fallbacks_used: HashSet<ErrorKind>,
}

impl Turn {
    pub fn new(input: impl Into<String>) -> Self {
        Self {
            id: TurnId::new(),
            op_id: OpId::new(),
            state: TurnState::Ready,
            input: input.into(),
            step_count: 0,
            recursion_depth: 0,
            peak_recursion_depth: 0,
            retry_count: 0,
            started_at: Utc::now(),
            history: Vec::new(),
            parallel_tasks: Vec::new(),
            result: None,
            started: Instant::now(),
            retries: HashMap::new(),
            fallbacks_used: HashSet::new(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn record_transition(&mut self, trigger: Trigger, from: TurnState, to: TurnState) {
        self.state = to;
        self.history.push(HistoryEntry::Transition(TransitionEntry {
            trigger,
            from,
            to,
            at: Utc::now(),
        }));
    }

    pub fn record_recovery(&mut self, attempt: RecoveryAttempt) {
        self.history.push(HistoryEntry::Recovery(attempt));
    }

    pub fn transitions(&self) -> impl Iterator<Item = &TransitionEntry> {
        self.history.iter().filter_map(|e| match e {
            HistoryEntry::Transition(t) => Some(t),
            HistoryEntry::Recovery(_) => None,
        })
    }

    pub fn recovery_attempts(&self) -> impl Iterator<Item = &RecoveryAttempt> {
        self.history.iter().filter_map(|e| match e {
            HistoryEntry::Recovery(r) => Some(r),
            HistoryEntry::Transition(_) => None,
        })
    }

    /// 按顺序列出本回合触发过的触发器
    pub fn trigger_trail(&self) -> Vec<Trigger> {
        self.transitions().map(|t| t.trigger).collect()
    }

    pub fn retries_for(&self, kind: ErrorKind) -> u32 {
        self.retries.get(&kind).copied().unwrap_or(0)
    }

    pub(crate) fn bump_retry(&mut self, kind: ErrorKind) -> u32 {
        let count = self.retries.entry(kind).or_insert(0);
        *count += 1;
        self.retry_count += 1;
        *count
    }

    pub fn fallback_used(&self, kind: ErrorKind) -> bool {
        self.fallbacks_used.contains(&kind)
    }

    pub(crate) fn mark_fallback(&mut self, kind: ErrorKind) {
        self.fallbacks_used.insert(kind);
    }

    pub(crate) fn finish(&mut self, result: TurnResult) {
        self.result = Some(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_turns_have_distinct_ids() {
        let a = Turn::new("hi");
        let b = Turn::new("hi");
        assert_ne!(a.id, b.id);
        assert_ne!(a.op_id, b.op_id);
    }

    #[test]
    fn test_history_is_append_only_log() {
        let mut turn = Turn::new("hello");
        turn.record_transition(Trigger::UserInput, TurnState::Ready, TurnState::Engage);
        turn.record_recovery(RecoveryAttempt::new(
            ErrorKind::ToolFailure,
            Strategy::Retry,
            RecoveryOutcome::Recovered,
            vec!["boom".into()],
        ));
        turn.record_transition(Trigger::IntentDetected, TurnState::Engage, TurnState::Understand);

        assert_eq!(turn.history.len(), 3);
        assert_eq!(turn.state, TurnState::Understand);
        assert_eq!(
            turn.trigger_trail(),
            vec![Trigger::UserInput, Trigger::IntentDetected]
        );
        assert_eq!(turn.recovery_attempts().count(), 1);
    }

    #[test]
    fn test_retry_counters_are_per_kind() {
        let mut turn = Turn::new("x");
        turn.bump_retry(ErrorKind::ToolFailure);
        turn.bump_retry(ErrorKind::ToolFailure);
        turn.bump_retry(ErrorKind::Validation);
        assert_eq!(turn.retries_for(ErrorKind::ToolFailure), 2);
        assert_eq!(turn.retries_for(ErrorKind::Validation), 1);
        assert_eq!(turn.retries_for(ErrorKind::Planning), 0);
        assert_eq!(turn.retry_count, 3);
    }

    #[test]
    fn test_result_serializes_with_status_tag() {
        let json = serde_json::to_value(TurnResult::Degraded {
            reason: "limit".into(),
        })
        .unwrap();
        assert_eq!(json["status"], "degraded");
        assert_eq!(json["reason"], "limit");
    }
}
