//! 遥测：每次转换一条 (state, trigger, timestamp, turn_id) 记录，另有运维告警
//!
//! 控制器只负责发出，不依赖投递成功：发送失败只记一条 warn。

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::core::error::ErrorKind;
use crate::core::state::{Trigger, TurnState};
use crate::core::turn::TurnId;

/// 一次转换
#[derive(Clone, Debug, Serialize)]
pub struct TransitionRecord {
    /// 转换后的状态
    pub state: TurnState,
    pub from: TurnState,
    pub trigger: Trigger,
    pub timestamp: DateTime<Utc>,
    pub turn_id: Option<TurnId>,
}

/// 高优先级告警：恢复阶梯走到第三级
#[derive(Clone, Debug, Serialize)]
pub struct OperatorAlert {
    pub turn_id: TurnId,
    pub error_kind: ErrorKind,
    pub message: String,
    pub reasons: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TelemetryEvent {
    Transition(TransitionRecord),
    Alert(OperatorAlert),
}

pub trait TelemetryEmitter: Send + Sync {
    fn emit(&self, record: &TransitionRecord) -> anyhow::Result<()>;

    fn alert(&self, alert: &OperatorAlert) -> anyhow::Result<()>;
}

/// 写入 tracing 日志
#[derive(Debug, Default)]
pub struct TracingTelemetry;

impl TelemetryEmitter for TracingTelemetry {
    fn emit(&self, record: &TransitionRecord) -> anyhow::Result<()> {
        tracing::debug!(
            from = %record.from,
            trigger = %record.trigger,
            state = %record.state,
            turn_id = ?record.turn_id.map(|id| id.to_string()),
            "transition"
        );
        Ok(())
    }

    fn alert(&self, alert: &OperatorAlert) -> anyhow::Result<()> {
        tracing::error!(
            turn_id = %alert.turn_id,
            kind = ?alert.error_kind,
            message = %alert.message,
            reasons = ?alert.reasons,
            "operator alert"
        );
        Ok(())
    }
}

/// 推送到 mpsc 通道，供前端或测试订阅
#[derive(Debug, Clone)]
pub struct ChannelTelemetry {
    tx: mpsc::UnboundedSender<TelemetryEvent>,
}

impl ChannelTelemetry {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TelemetryEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl TelemetryEmitter for ChannelTelemetry {
    fn emit(&self, record: &TransitionRecord) -> anyhow::Result<()> {
        self.tx
            .send(TelemetryEvent::Transition(record.clone()))
            .map_err(|_| anyhow::anyhow!("telemetry receiver dropped"))
    }

    fn alert(&self, alert: &OperatorAlert) -> anyhow::Result<()> {
        self.tx
            .send(TelemetryEvent::Alert(alert.clone()))
            .map_err(|_| anyhow::anyhow!("telemetry receiver dropped"))
    }
}
