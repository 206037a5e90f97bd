//! 控制器构建器：统一的组件初始化逻辑
//!
//! 规划器与工具后端是必需的协作者；上限、邮箱参数、工具超时、遥测、转换表都有默认值，可从 AppConfig 一次性覆盖。

use std::sync::Arc;
use std::time::Duration;

use crate::config::AppConfig;
use crate::core::controller::TurnController;
use crate::core::guard::{GuardLimits, GuardTracker};
use crate::core::machine::StateMachine;
use crate::core::mailbox::{Mailbox, MailboxLimits};
use crate::core::planner::IntentPlanner;
use crate::observability::{TelemetryEmitter, TracingTelemetry};
use crate::tools::{ToolBackend, ToolExecutor};

pub struct ControllerBuilder {
    planner: Arc<dyn IntentPlanner>,
    backend: Arc<dyn ToolBackend>,
    limits: GuardLimits,
    mailbox: MailboxLimits,
    tool_timeout: Duration,
    telemetry: Arc<dyn TelemetryEmitter>,
    machine: StateMachine,
}

impl ControllerBuilder {
    pub fn new(planner: Arc<dyn IntentPlanner>, backend: Arc<dyn ToolBackend>) -> Self {
        Self {
            planner,
            backend,
            limits: GuardLimits::default(),
            mailbox: MailboxLimits::default(),
            tool_timeout: Duration::from_secs(30),
            telemetry: Arc::new(TracingTelemetry),
            machine: StateMachine::new(),
        }
    }

    /// 用配置文件中的 [guards] / [mailbox] / [tools] 覆盖默认值
    pub fn with_config(mut self, cfg: &AppConfig) -> Self {
        self.limits = cfg.guard_limits();
        self.mailbox = cfg.mailbox_limits();
        self.tool_timeout = cfg.tool_timeout();
        self
    }

    pub fn with_limits(mut self, limits: GuardLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_mailbox_limits(mut self, limits: MailboxLimits) -> Self {
        self.mailbox = limits;
        self
    }

    pub fn with_tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout = timeout;
        self
    }

    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetryEmitter>) -> Self {
        self.telemetry = telemetry;
        self
    }

    /// 自定义转换表（测试死锁检测等）
    pub fn with_machine(mut self, machine: StateMachine) -> Self {
        self.machine = machine;
        self
    }

    pub fn build(self) -> TurnController {
        let tools = Arc::new(ToolExecutor::new(self.backend, self.tool_timeout));
        let deadlocked = self.machine.deadlocked_states();
        if !deadlocked.is_empty() {
            tracing::warn!(states = ?deadlocked, "transition table has states without outgoing edges");
        }
        TurnController::from_parts(
            self.machine,
            GuardTracker::new(self.limits),
            Mailbox::new(self.mailbox),
            self.planner,
            tools,
            self.telemetry,
        )
    }
}

impl TurnController {
    pub fn builder(planner: Arc<dyn IntentPlanner>, backend: Arc<dyn ToolBackend>) -> ControllerBuilder {
        ControllerBuilder::new(planner, backend)
    }
}
