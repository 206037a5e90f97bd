//! 控制器错误类型与运行时失败分类
//!
//! ReugError 只用于真正返回给调用方的错误（非法转换、邮箱拒收、已关闭）；
//! 运行时失败一律用 Failure 表达，由 ERROR_RECOVERY_UNIFIED 的恢复阶梯消费。

use serde::Serialize;
use thiserror::Error;

use crate::core::state::{Trigger, TurnState};

/// 返回给调用方的错误
#[derive(Error, Debug)]
pub enum ReugError {
    /// (state, trigger) 不在转换表中：调用方的编程错误
    #[error("Illegal transition: {trigger} is not accepted in state {state}")]
    IllegalTransition { state: TurnState, trigger: Trigger },

    #[error("Mailbox full: {0} entries queued")]
    MailboxFull(usize),

    #[error("Mailbox circuit breaker is open")]
    CircuitOpen,

    #[error("Controller has shut down")]
    ShutDown,

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),
}

/// 错误分类，决定恢复阶梯从哪一级开始
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// 动态工具 Schema 不合法，总可经阶梯恢复
    Validation,
    /// 工具调用失败，可重试至上限
    ToolFailure,
    /// 超时：跳过重试，只允许一次降级
    Timeout,
    RecursionLimitExceeded,
    StepBudgetExhausted,
    /// 意图识别 / 规划失败
    Planning,
    /// 并行批次被拒收（任务数超限、id 重复）；原样重试必然再被拒，只允许降级
    BatchRejected,
    /// 会话损坏，不进入恢复
    Fatal,
}

impl ErrorKind {
    /// 是否允许第一级「重试」
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::Validation | ErrorKind::ToolFailure | ErrorKind::Planning
        )
    }

    /// 是否允许第二级「降级」
    pub fn allows_fallback(&self) -> bool {
        self.is_retryable() || matches!(self, ErrorKind::Timeout | ErrorKind::BatchRejected)
    }
}

/// 一次运行时失败：分类、产生它的触发器、描述，以及失败的步骤 / 并行任务 id
#[derive(Clone, Debug, Serialize)]
pub struct Failure {
    pub kind: ErrorKind,
    pub trigger: Trigger,
    pub message: String,
    pub source_id: Option<String>,
}

impl Failure {
    pub fn new(kind: ErrorKind, trigger: Trigger, message: impl Into<String>) -> Self {
        Self {
            kind,
            trigger,
            message: message.into(),
            source_id: None,
        }
    }

    pub fn with_source(mut self, id: impl Into<String>) -> Self {
        self.source_id = Some(id.into());
        self
    }
}

/// 恢复阶梯的三级策略
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// 原样重试失败的动作
    Retry,
    /// 切换到缩小范围的替代路线，再试一次
    Fallback,
    /// 告警运维并以降级结果结束回合
    OperatorAlert,
}

impl Strategy {
    pub fn index(&self) -> usize {
        match self {
            Strategy::Retry => 0,
            Strategy::Fallback => 1,
            Strategy::OperatorAlert => 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_breaches_are_not_retryable() {
        assert!(!ErrorKind::RecursionLimitExceeded.is_retryable());
        assert!(!ErrorKind::StepBudgetExhausted.is_retryable());
        assert!(!ErrorKind::RecursionLimitExceeded.allows_fallback());
        assert!(!ErrorKind::StepBudgetExhausted.allows_fallback());
    }

    #[test]
    fn test_timeout_only_falls_back() {
        assert!(!ErrorKind::Timeout.is_retryable());
        assert!(ErrorKind::Timeout.allows_fallback());
    }

    #[test]
    fn test_batch_rejection_skips_retry() {
        assert!(!ErrorKind::BatchRejected.is_retryable());
        assert!(ErrorKind::BatchRejected.allows_fallback());
    }

    #[test]
    fn test_illegal_transition_message() {
        let err = ReugError::IllegalTransition {
            state: TurnState::Ready,
            trigger: Trigger::ToolSuccess,
        };
        assert_eq!(
            err.to_string(),
            "Illegal transition: TOOL_SUCCESS is not accepted in state READY"
        );
    }
}
