//! 守卫计数：步数预算、递归深度、回合耗时、按错误类型的重试次数
//!
//! 纯记账，不做 I/O。每个检查都在对应状态做事之前调用，失败被翻译成对应触发器回灌状态机。

use std::time::Duration;

use thiserror::Error;

use crate::core::error::{ErrorKind, Failure};
use crate::core::state::Trigger;
use crate::core::turn::Turn;

/// 资源上限
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GuardLimits {
    pub recursion_limit: u32,
    pub step_budget: u32,
    pub timeout: Duration,
    pub max_parallel_tasks: usize,
    pub max_tool_retries: u32,
}

impl Default for GuardLimits {
    fn default() -> Self {
        Self {
            recursion_limit: 5,
            step_budget: 100,
            timeout: Duration::from_secs(300),
            max_parallel_tasks: 10,
            max_tool_retries: 3,
        }
    }
}

/// 守卫检查失败
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardViolation {
    #[error("Step budget exhausted after {budget} steps")]
    StepBudgetExhausted { budget: u32 },

    #[error("Recursion limit {limit} exceeded")]
    RecursionLimitExceeded { limit: u32 },

    #[error("Turn timed out after {elapsed_ms}ms")]
    TimeoutDetected { elapsed_ms: u64 },

    #[error("Retries exhausted for {kind:?} after {attempts} attempts")]
    RetryExhausted { kind: ErrorKind, attempts: u32 },
}

impl GuardViolation {
    /// 回灌状态机的触发器；重试耗尽只在恢复阶梯内部消费，没有触发器
    pub fn trigger(&self) -> Option<Trigger> {
        match self {
            GuardViolation::StepBudgetExhausted { .. } => Some(Trigger::StepBudgetExhausted),
            GuardViolation::RecursionLimitExceeded { .. } => Some(Trigger::RecursionLimitExceeded),
            GuardViolation::TimeoutDetected { .. } => Some(Trigger::TimeoutDetected),
            GuardViolation::RetryExhausted { .. } => None,
        }
    }

    pub fn error_kind(&self) -> ErrorKind {
        match self {
            GuardViolation::StepBudgetExhausted { .. } => ErrorKind::StepBudgetExhausted,
            GuardViolation::RecursionLimitExceeded { .. } => ErrorKind::RecursionLimitExceeded,
            GuardViolation::TimeoutDetected { .. } => ErrorKind::Timeout,
            GuardViolation::RetryExhausted { kind, .. } => *kind,
        }
    }

    pub fn into_failure(self) -> Failure {
        let trigger = self.trigger().unwrap_or(Trigger::ErrorOccurred);
        Failure::new(self.error_kind(), trigger, self.to_string())
    }
}

/// 守卫追踪器：只读上限 + 对 Turn 计数器的检查与递增
#[derive(Clone, Debug, Default)]
pub struct GuardTracker {
    limits: GuardLimits,
}

impl GuardTracker {
    pub fn new(limits: GuardLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &GuardLimits {
        &self.limits
    }

    /// 预算内则步数 +1 并返回新步数；已用满时不递增
    pub fn check_and_increment_step(&self, turn: &mut Turn) -> Result<u32, GuardViolation> {
        if turn.step_count >= self.limits.step_budget {
            return Err(GuardViolation::StepBudgetExhausted {
                budget: self.limits.step_budget,
            });
        }
        turn.step_count += 1;
        Ok(turn.step_count)
    }

    /// 能否再下降一层嵌套
    pub fn check_recursion(&self, turn: &Turn) -> Result<(), GuardViolation> {
        if turn.recursion_depth >= self.limits.recursion_limit {
            return Err(GuardViolation::RecursionLimitExceeded {
                limit: self.limits.recursion_limit,
            });
        }
        Ok(())
    }

    /// 检查后进入下一层嵌套脚本
    pub fn descend(&self, turn: &mut Turn) -> Result<u32, GuardViolation> {
        self.check_recursion(turn)?;
        turn.recursion_depth += 1;
        turn.peak_recursion_depth = turn.peak_recursion_depth.max(turn.recursion_depth);
        Ok(turn.recursion_depth)
    }

    pub fn ascend(&self, turn: &mut Turn) {
        turn.recursion_depth = turn.recursion_depth.saturating_sub(1);
    }

    pub fn check_elapsed(&self, turn: &Turn) -> Result<(), GuardViolation> {
        let elapsed = turn.elapsed();
        if elapsed >= self.limits.timeout {
            return Err(GuardViolation::TimeoutDetected {
                elapsed_ms: elapsed.as_millis() as u64,
            });
        }
        Ok(())
    }

    /// 本回合剩余时间
    pub fn remaining(&self, turn: &Turn) -> Duration {
        self.limits.timeout.saturating_sub(turn.elapsed())
    }

    /// 按 (turn, kind) 计数；未达上限则消耗一次并返回这是第几次重试
    pub fn check_retry(&self, turn: &mut Turn, kind: ErrorKind) -> Result<u32, GuardViolation> {
        let attempts = turn.retries_for(kind);
        if attempts >= self.limits.max_tool_retries {
            return Err(GuardViolation::RetryExhausted { kind, attempts });
        }
        Ok(turn.bump_retry(kind))
    }
}
