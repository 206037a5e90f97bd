//! 统一错误恢复：按错误类型走固定的升级阶梯
//!
//! 重试（受 max_tool_retries 限制）-> 降级路线（每个错误类型每回合一次）-> 运维告警 + 降级结束。
//! 步数预算与递归深度超限不可重试，直接走第三级。每一次尝试都写入 Turn.history。

use chrono::Utc;

use crate::core::error::{Failure, Strategy};
use crate::core::guard::GuardTracker;
use crate::core::state::Trigger;
use crate::core::turn::{RecoveryAttempt, RecoveryOutcome, Turn};
use crate::observability::OperatorAlert;

/// 恢复决定
#[derive(Clone, Debug)]
pub struct RecoveryDecision {
    /// RECOVERY_SUCCESS 或 FATAL_ERROR
    pub trigger: Trigger,
    pub strategy: Strategy,
    /// 走到第三级时的告警
    pub alert: Option<OperatorAlert>,
}

#[derive(Clone, Debug, Default)]
pub struct RecoveryOrchestrator {
    guard: GuardTracker,
}

impl RecoveryOrchestrator {
    pub fn new(guard: GuardTracker) -> Self {
        Self { guard }
    }

    /// fallback_available：调用方是否拿得到替代路线；reasons：附加审计原因（如 Schema 拒绝原因）
    pub fn recover(
        &self,
        turn: &mut Turn,
        failure: &Failure,
        fallback_available: bool,
        reasons: &[String],
    ) -> RecoveryDecision {
        let kind = failure.kind;
        let mut audit = Vec::with_capacity(reasons.len() + 1);
        audit.push(failure.message.clone());
        audit.extend(reasons.iter().cloned());

        if kind.is_retryable() {
            match self.guard.check_retry(turn, kind) {
                Ok(attempt) => {
                    tracing::info!(turn_id = %turn.id, ?kind, attempt, "recovery: retry");
                    turn.record_recovery(RecoveryAttempt::new(
                        kind,
                        Strategy::Retry,
                        RecoveryOutcome::Recovered,
                        audit,
                    ));
                    return decided(Trigger::RecoverySuccess, Strategy::Retry);
                }
                Err(exhausted) => {
                    let mut reasons = audit.clone();
                    reasons.push(exhausted.to_string());
                    turn.record_recovery(RecoveryAttempt::new(
                        kind,
                        Strategy::Retry,
                        RecoveryOutcome::Escalate,
                        reasons,
                    ));
                }
            }
        }

        if kind.allows_fallback() && !turn.fallback_used(kind) {
            if fallback_available {
                turn.mark_fallback(kind);
                tracing::info!(turn_id = %turn.id, ?kind, "recovery: fallback route");
                turn.record_recovery(RecoveryAttempt::new(
                    kind,
                    Strategy::Fallback,
                    RecoveryOutcome::Recovered,
                    audit,
                ));
                return decided(Trigger::RecoverySuccess, Strategy::Fallback);
            }
            let mut reasons = audit.clone();
            reasons.push("no fallback route available".to_string());
            turn.record_recovery(RecoveryAttempt::new(
                kind,
                Strategy::Fallback,
                RecoveryOutcome::Escalate,
                reasons,
            ));
        }

        tracing::error!(turn_id = %turn.id, ?kind, message = %failure.message, "recovery exhausted, degrading turn");
        turn.record_recovery(RecoveryAttempt::new(
            kind,
            Strategy::OperatorAlert,
            RecoveryOutcome::Fatal,
            audit.clone(),
        ));
        RecoveryDecision {
            trigger: Trigger::FatalError,
            strategy: Strategy::OperatorAlert,
            alert: Some(OperatorAlert {
                turn_id: turn.id,
                error_kind: kind,
                message: failure.message.clone(),
                reasons: audit,
                timestamp: Utc::now(),
            }),
        }
    }
}

fn decided(trigger: Trigger, strategy: Strategy) -> RecoveryDecision {
    RecoveryDecision {
        trigger,
        strategy,
        alert: None,
    }
}
