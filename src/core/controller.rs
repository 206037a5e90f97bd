//! 回合控制器：组合根
//!
//! 持有邮箱、活动回合与各执行组件，以单写者的 drain 循环推进状态机：
//! 一次只应用一个邮箱条目；条目触发的后续触发器在同一条目内串联执行，直到进入需要外部事件的状态
//! （READY / COMPLETE / SHUTDOWN）。携带旧 op_id 的回调只计数，不触碰当前回合；
//! 被转换表拒绝的条目计入 DrainReport，drain 继续处理其后的条目。

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::core::error::{ErrorKind, Failure, ReugError, Strategy};
use crate::core::guard::GuardTracker;
use crate::core::machine::StateMachine;
use crate::core::mailbox::{Event, Mailbox, MailboxEntry, MailboxHandle};
use crate::core::parallel::{ParallelBatch, ParallelCoordinator};
use crate::core::planner::{IntentPlanner, Plan, Route};
use crate::core::recovery::RecoveryOrchestrator;
use crate::core::state::{Trigger, TurnSnapshot, TurnState};
use crate::core::supervisor::TurnSupervisor;
use crate::core::turn::{Turn, TurnResult};
use crate::observability::{ControllerMetrics, MetricsSnapshot, TelemetryEmitter, TransitionRecord};
use crate::script::{reset_failed, ScriptExecutor, ScriptStep, StepOutcome};
use crate::tools::{SchemaValidator, ToolExecutor, ToolSchema};

/// 一次 drain 的统计
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// 应用到状态机的条目数
    pub applied: usize,
    /// 因 op_id 过期被丢弃的条目数
    pub stale: usize,
    /// 被转换表拒绝的条目数
    pub rejected: usize,
    /// 第一次被拒绝的 (state, trigger)
    pub first_rejection: Option<(TurnState, Trigger)>,
    /// drain 结束时的状态
    pub state: TurnState,
}

impl DrainReport {
    /// 有条目被拒绝时转成 IllegalTransition；其余条目此时已全部处理完
    pub fn into_result(self) -> Result<DrainReport, ReugError> {
        match self.first_rejection {
            Some((state, trigger)) => Err(ReugError::IllegalTransition { state, trigger }),
            None => Ok(self),
        }
    }
}

/// 单回合的工作数据，回合开始时清空
#[derive(Default)]
struct TurnScratch {
    plan: Option<Plan>,
    script: Vec<ScriptStep>,
    batch: Option<ParallelBatch>,
    observations: Vec<String>,
    failure: Option<Failure>,
    candidate: Option<Value>,
    /// Schema 拒绝原因，累计写入恢复记录
    reasons: Vec<String>,
    result: Option<TurnResult>,
}

impl TurnScratch {
    fn fail(&mut self, failure: Failure) -> Option<Trigger> {
        let trigger = failure.trigger;
        tracing::warn!(kind = ?failure.kind, %trigger, message = %failure.message, "turn failure");
        if trigger == Trigger::FatalError {
            self.result = Some(TurnResult::Fatal {
                reason: failure.message.clone(),
            });
        }
        self.failure = Some(failure);
        Some(trigger)
    }
}

pub struct TurnController {
    pub(crate) machine: StateMachine,
    pub(crate) guard: GuardTracker,
    pub(crate) state: TurnState,
    turn: Option<Turn>,
    previous: Option<Turn>,
    scratch: TurnScratch,
    pub(crate) mailbox: Mailbox,
    inbox_tx: mpsc::UnboundedSender<Event>,
    inbox_rx: mpsc::UnboundedReceiver<Event>,
    pub(crate) planner: Arc<dyn IntentPlanner>,
    pub(crate) tools: Arc<ToolExecutor>,
    pub(crate) scripts: ScriptExecutor,
    pub(crate) parallel: ParallelCoordinator,
    pub(crate) validator: SchemaValidator,
    pub(crate) recovery: RecoveryOrchestrator,
    pub(crate) telemetry: Arc<dyn TelemetryEmitter>,
    supervisor: TurnSupervisor,
    metrics: Arc<ControllerMetrics>,
    snapshot_tx: watch::Sender<TurnSnapshot>,
    dynamic_tools: Vec<ToolSchema>,
}

impl TurnController {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn from_parts(
        machine: StateMachine,
        guard: GuardTracker,
        mailbox: Mailbox,
        planner: Arc<dyn IntentPlanner>,
        tools: Arc<ToolExecutor>,
        telemetry: Arc<dyn TelemetryEmitter>,
    ) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, _) = watch::channel(TurnSnapshot::default());
        let scripts = ScriptExecutor::new(tools.clone(), guard.clone());
        let parallel = ParallelCoordinator::new(tools.clone(), guard.limits().max_parallel_tasks);
        let recovery = RecoveryOrchestrator::new(guard.clone());
        Self {
            machine,
            guard,
            state: TurnState::Ready,
            turn: None,
            previous: None,
            scratch: TurnScratch::default(),
            mailbox,
            inbox_tx,
            inbox_rx,
            planner,
            tools,
            scripts,
            parallel,
            validator: SchemaValidator::new(),
            recovery,
            telemetry,
            supervisor: TurnSupervisor::new(),
            metrics: Arc::new(ControllerMetrics::default()),
            snapshot_tx,
            dynamic_tools: Vec::new(),
        }
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    /// 活动回合（READY 空闲时为 None）
    pub fn turn(&self) -> Option<&Turn> {
        self.turn.as_ref()
    }

    /// 最近一个被退役的回合
    pub fn previous_turn(&self) -> Option<&Turn> {
        self.previous.as_ref()
    }

    pub fn machine(&self) -> &StateMachine {
        &self.machine
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot(self.mailbox.breaker_stats())
    }

    pub fn metrics_handle(&self) -> Arc<ControllerMetrics> {
        self.metrics.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<TurnSnapshot> {
        self.snapshot_tx.subscribe()
    }

    /// 本控制器校验通过的动态工具
    pub fn dynamic_tools(&self) -> &[ToolSchema] {
        &self.dynamic_tools
    }

    pub fn mailbox_len(&self) -> usize {
        self.mailbox.len()
    }

    /// 可克隆的投递端，供并发生产者与异步回调使用
    pub fn handle(&self) -> MailboxHandle {
        MailboxHandle::new(self.inbox_tx.clone())
    }

    /// 入队并立即 drain；有条目被转换表拒绝时返回 IllegalTransition
    pub async fn submit(&mut self, event: Event) -> Result<DrainReport, ReugError> {
        self.enqueue(event)?;
        self.drain().await.into_result()
    }

    /// 只入队，不 drain
    pub fn enqueue(&mut self, event: Event) -> Result<u64, ReugError> {
        if self.state == TurnState::Shutdown {
            return Err(ReugError::ShutDown);
        }
        self.mailbox.push(event).map_err(|e| {
            ControllerMetrics::incr(&self.metrics.mailbox_rejected);
            e
        })
    }

    /// 按 FIFO 顺序应用邮箱中的全部条目，直到邮箱为空；drain 期间经 MailboxHandle 到达的事件排在队尾
    pub async fn drain(&mut self) -> DrainReport {
        let mut report = DrainReport::default();
        loop {
            self.pull_inbox();
            let Some(entry) = self.mailbox.pop() else { break };
            if self.state == TurnState::Shutdown {
                let dropped = self.mailbox.clear() + 1;
                tracing::warn!(dropped, "controller shut down, discarding queued events");
                break;
            }
            match self.apply(entry).await {
                Ok(true) => report.applied += 1,
                Ok(false) => report.stale += 1,
                Err(ReugError::IllegalTransition { state, trigger }) => {
                    report.rejected += 1;
                    if report.first_rejection.is_none() {
                        report.first_rejection = Some((state, trigger));
                    }
                }
                Err(e) => tracing::error!(error = %e, "entry aborted"),
            }
            self.publish();
        }
        report.state = self.state;
        report
    }

    /// 把控制器移到 tokio 任务上运行：每收到一个事件就入队并 drain，SHUTDOWN 后退出；
    /// 全部 MailboxHandle 被丢弃时也退出
    pub fn spawn(mut self) -> (MailboxHandle, watch::Receiver<TurnSnapshot>, JoinHandle<()>) {
        let handle = self.handle();
        let snapshots = self.subscribe();
        // 控制器自己不再持有可用的发送端
        let (detached, _) = mpsc::unbounded_channel();
        self.inbox_tx = detached;

        let join = tokio::spawn(async move {
            while let Some(event) = self.inbox_rx.recv().await {
                if let Err(e) = self.enqueue(event) {
                    tracing::warn!(error = %e, "event rejected");
                    continue;
                }
                let report = self.drain().await;
                if report.rejected > 0 {
                    tracing::warn!(
                        rejected = report.rejected,
                        first = ?report.first_rejection,
                        "entries rejected by transition table"
                    );
                }
                if self.state == TurnState::Shutdown {
                    break;
                }
            }
            tracing::info!(state = %self.state, "controller task exiting");
        });
        (handle, snapshots, join)
    }

    fn pull_inbox(&mut self) {
        while let Ok(event) = self.inbox_rx.try_recv() {
            if let Err(e) = self.enqueue(event) {
                tracing::warn!(error = %e, "event from handle rejected");
            }
        }
    }

    fn publish(&self) {
        self.snapshot_tx
            .send_replace(TurnSnapshot::project(self.state, self.turn.as_ref(), &self.mailbox));
    }

    /// 应用一个条目；返回 false 表示条目已过期被丢弃
    async fn apply(&mut self, entry: MailboxEntry) -> Result<bool, ReugError> {
        let event = entry.payload;
        if let Some(op_id) = event.target() {
            let current = self.turn.as_ref().map(|t| t.op_id);
            if current != Some(op_id) {
                ControllerMetrics::incr(&self.metrics.stale);
                tracing::warn!(
                    seq = entry.sequence_no,
                    %op_id,
                    trigger = %event.trigger(),
                    "stale callback dropped"
                );
                return Ok(false);
            }
        }

        let mut input = match &event {
            Event::UserInput(text) => Some(text.clone()),
            _ => None,
        };
        let mut next = Some(event.trigger());
        while let Some(trigger) = next {
            let from = self.state;
            let to = match self.machine.transition(from, trigger) {
                Ok(to) => to,
                Err(e) => {
                    ControllerMetrics::incr(&self.metrics.rejected);
                    tracing::error!(state = %from, %trigger, "illegal transition requested");
                    return Err(e);
                }
            };
            self.on_transition(from, trigger, to, input.take());
            next = self.enter(to).await;
        }
        Ok(true)
    }

    fn on_transition(&mut self, from: TurnState, trigger: Trigger, to: TurnState, input: Option<String>) {
        if trigger == Trigger::UserInput {
            if let Some(old) = self.turn.take() {
                self.previous = Some(old);
            }
            self.scratch = TurnScratch::default();
            self.supervisor.begin_turn();
            let turn = Turn::new(input.unwrap_or_default());
            ControllerMetrics::incr(&self.metrics.turns_started);
            tracing::info!(turn_id = %turn.id, op_id = %turn.op_id, "turn started");
            self.turn = Some(turn);
        }

        self.state = to;
        if let Some(turn) = self.turn.as_mut() {
            turn.record_transition(trigger, from, to);
        }
        ControllerMetrics::incr(&self.metrics.transitions);
        self.mailbox.record_transition();
        tracing::debug!(%from, %trigger, %to, "transition");

        let record = TransitionRecord {
            state: to,
            from,
            trigger,
            timestamp: chrono::Utc::now(),
            turn_id: self.turn.as_ref().map(|t| t.id),
        };
        if let Err(e) = self.telemetry.emit(&record) {
            tracing::warn!(error = %e, "telemetry delivery failed");
        }

        match trigger {
            Trigger::TurnComplete => self.retire_turn(),
            Trigger::ShutdownRequested => {
                self.retire_turn();
                self.supervisor.shutdown();
                tracing::info!("controller shut down");
            }
            _ => {}
        }
    }

    fn retire_turn(&mut self) {
        self.supervisor.retire_turn();
        self.scratch = TurnScratch::default();
        if let Some(old) = self.turn.take() {
            self.previous = Some(old);
        }
    }

    /// 进入状态后执行该状态的动作，返回下一个触发器；None 表示等待外部事件
    async fn enter(&mut self, state: TurnState) -> Option<Trigger> {
        match state {
            TurnState::Ready | TurnState::Shutdown => None,
            TurnState::Engage => self.engage().await,
            TurnState::Understand => self.understand().await,
            TurnState::ExecuteScript => self.execute_script().await,
            TurnState::CreateDynamicTool => self.create_dynamic_tool().await,
            TurnState::ValidateToolSchema => self.validate_tool_schema(),
            TurnState::ParallelizeTasks => self.parallelize_tasks(),
            TurnState::AwaitParallelResults => self.await_parallel_results().await,
            TurnState::Generate => self.generate().await,
            TurnState::ErrorRecoveryUnified => self.error_recovery(),
            TurnState::Complete => {
                self.complete();
                None
            }
        }
    }

    async fn engage(&mut self) -> Option<Trigger> {
        let input = self.turn.as_ref().map(|t| t.input.clone()).unwrap_or_default();
        let tools = self.tools.available_tools();
        match self.planner.detect(&input, &tools).await {
            Ok(plan) => {
                tracing::debug!(route = ?plan.route.trigger(), "intent detected");
                self.scratch.plan = Some(plan);
                Some(Trigger::IntentDetected)
            }
            Err(e) => self.scratch.fail(e.into_failure()),
        }
    }

    async fn understand(&mut self) -> Option<Trigger> {
        let Some(turn) = self.turn.as_ref() else {
            return missing_turn(self.state);
        };
        // UNDERSTAND 没有 TIMEOUT_DETECTED 出边，超时以 ERROR_OCCURRED 上报
        if let Err(v) = self.guard.check_elapsed(turn) {
            return self
                .scratch
                .fail(Failure::new(ErrorKind::Timeout, Trigger::ErrorOccurred, v.to_string()));
        }

        if self.scratch.plan.is_none() {
            let input = turn.input.clone();
            let tools = self.tools.available_tools();
            match self.planner.detect(&input, &tools).await {
                Ok(plan) => self.scratch.plan = Some(plan),
                Err(e) => return self.scratch.fail(e.into_failure()),
            }
        }
        let Some(plan) = self.scratch.plan.as_ref() else {
            return missing_turn(self.state);
        };

        // 只有后端提供工具列表时才能识别臆造的工具
        let unknown = plan
            .route
            .tool_names()
            .into_iter()
            .find_map(|name| self.tools.check_known(name).err());
        let trigger = plan.route.trigger();
        let steps = match &plan.route {
            Route::Script(steps) => Some(steps.clone()),
            _ => None,
        };

        if let Some(e) = unknown {
            let failure = Failure::new(e.kind(), Trigger::ErrorOccurred, e.to_string());
            return self.scratch.fail(failure);
        }
        if let Some(steps) = steps {
            if self.scratch.script.is_empty() {
                self.scratch.script = steps;
            } else {
                // 重试：保留已完成的步骤，只重跑失败的
                reset_failed(&mut self.scratch.script);
            }
        }
        Some(trigger)
    }

    async fn execute_script(&mut self) -> Option<Trigger> {
        let Some(turn) = self.turn.as_mut() else {
            return missing_turn(self.state);
        };
        let outcome = self.scripts.step(&mut self.scratch.script, turn).await;
        let trigger = outcome.trigger();
        match outcome {
            StepOutcome::Completed { output, .. } => {
                self.scratch.observations.push(output);
                Some(trigger)
            }
            StepOutcome::Exhausted => Some(trigger),
            StepOutcome::Failed(failure) => self.scratch.fail(failure),
        }
    }

    async fn create_dynamic_tool(&mut self) -> Option<Trigger> {
        let request = match self.scratch.plan.as_ref().map(|p| &p.route) {
            Some(Route::DynamicTool(req)) => req.clone(),
            _ => {
                return self.scratch.fail(Failure::new(
                    ErrorKind::Planning,
                    Trigger::ErrorOccurred,
                    "no dynamic tool request in plan",
                ))
            }
        };
        match self.planner.synthesize_tool(&request).await {
            Ok(candidate) => {
                self.scratch.candidate = Some(candidate);
                Some(Trigger::DynamicToolCreated)
            }
            Err(e) => self.scratch.fail(e.into_failure()),
        }
    }

    fn validate_tool_schema(&mut self) -> Option<Trigger> {
        let candidate = self.scratch.candidate.take().unwrap_or(Value::Null);
        let schema = match self.validator.validate(&candidate) {
            Ok(schema) => schema,
            Err(rejection) => {
                self.scratch.reasons.push(rejection.reason.clone());
                return self.scratch.fail(Failure::new(
                    ErrorKind::Validation,
                    Trigger::SchemaInvalid,
                    rejection.reason,
                ));
            }
        };

        if let Some(provider) = self.tools.provider() {
            if let Err(reason) = provider.register_dynamic(schema.clone()) {
                self.scratch.reasons.push(reason.clone());
                return self
                    .scratch
                    .fail(Failure::new(ErrorKind::Validation, Trigger::SchemaInvalid, reason));
            }
        }
        tracing::info!(tool = %schema.name, "dynamic tool validated");
        self.scratch.result = Some(TurnResult::Success {
            response: format!("dynamic tool `{}` registered", schema.name),
        });
        self.dynamic_tools.push(schema);
        Some(Trigger::SchemaValidated)
    }

    fn parallelize_tasks(&mut self) -> Option<Trigger> {
        let specs = match self.scratch.plan.as_ref().map(|p| &p.route) {
            Some(Route::Parallel(specs)) => specs.clone(),
            _ => {
                return self.scratch.fail(Failure::new(
                    ErrorKind::Planning,
                    Trigger::ErrorOccurred,
                    "no parallel tasks in plan",
                ))
            }
        };
        match self.parallel.launch(&specs, self.supervisor.turn_token()) {
            Ok(batch) => {
                if let Some(turn) = self.turn.as_mut() {
                    turn.parallel_tasks = batch.tasks().to_vec();
                }
                self.scratch.batch = Some(batch);
                Some(Trigger::ToolSuccess)
            }
            Err(e) => self.scratch.fail(e.into_failure()),
        }
    }

    async fn await_parallel_results(&mut self) -> Option<Trigger> {
        let Some(batch) = self.scratch.batch.take() else {
            return self.scratch.fail(Failure::new(
                ErrorKind::Planning,
                Trigger::ErrorOccurred,
                "no parallel batch in flight",
            ));
        };
        let Some(turn) = self.turn.as_mut() else {
            return missing_turn(self.state);
        };
        let outcome = batch.collect(self.guard.remaining(turn)).await;
        turn.parallel_tasks = outcome.tasks().to_vec();
        match outcome.failure() {
            None => {
                self.scratch
                    .observations
                    .extend(outcome.tasks().iter().filter_map(|t| t.result.clone()));
                Some(outcome.trigger())
            }
            Some(failure) => self.scratch.fail(failure),
        }
    }

    async fn generate(&mut self) -> Option<Trigger> {
        let Some(route) = self.scratch.plan.as_ref().map(|p| p.route.clone()) else {
            return missing_turn(self.state);
        };
        match route {
            Route::Respond(text) => {
                self.scratch.result = Some(TurnResult::Success { response: text });
                Some(Trigger::ResponseReady)
            }
            Route::Tools(calls) if !calls.is_empty() => {
                let mut last = String::new();
                for call in calls {
                    match self.tools.execute(&call.tool, call.args).await {
                        Ok(out) => last = out,
                        Err(e) => {
                            let failure = Failure::new(e.kind(), Trigger::ToolFailure, e.to_string());
                            return self.scratch.fail(failure);
                        }
                    }
                }
                self.scratch.result = Some(TurnResult::Success { response: last });
                Some(Trigger::ToolSuccess)
            }
            _ => {
                let input = self.turn.as_ref().map(|t| t.input.clone()).unwrap_or_default();
                match self.planner.respond(&input, &self.scratch.observations).await {
                    Ok(response) => {
                        self.scratch.result = Some(TurnResult::Success { response });
                        Some(Trigger::ResponseReady)
                    }
                    Err(msg) => self
                        .scratch
                        .fail(Failure::new(ErrorKind::ToolFailure, Trigger::ToolFailure, msg)),
                }
            }
        }
    }

    fn error_recovery(&mut self) -> Option<Trigger> {
        let Some(turn) = self.turn.as_mut() else {
            return missing_turn(self.state);
        };
        let failure = self.scratch.failure.take().unwrap_or_else(|| {
            Failure::new(ErrorKind::ToolFailure, Trigger::ErrorOccurred, "unspecified failure")
        });
        let fallback = self
            .scratch
            .plan
            .as_ref()
            .and_then(|plan| self.planner.fallback(plan, &failure));
        let decision = self
            .recovery
            .recover(turn, &failure, fallback.is_some(), &self.scratch.reasons);

        match decision.strategy {
            Strategy::Retry => {
                // 规划失败的「原动作」就是规划本身：UNDERSTAND 会重新识别
                if failure.kind == ErrorKind::Planning {
                    self.scratch.plan = None;
                }
            }
            Strategy::Fallback => {
                if let (Some(plan), Some(route)) = (self.scratch.plan.as_mut(), fallback) {
                    tracing::info!(from = ?plan.route.trigger(), to = ?route.trigger(), "switching to fallback route");
                    plan.route = route;
                    plan.fallback = None;
                    self.scratch.script.clear();
                }
            }
            Strategy::OperatorAlert => {
                if let Some(alert) = &decision.alert {
                    ControllerMetrics::incr(&self.metrics.alerts);
                    if let Err(e) = self.telemetry.alert(alert) {
                        tracing::warn!(error = %e, "operator alert delivery failed");
                    }
                }
                self.scratch.result = Some(TurnResult::Degraded {
                    reason: failure.message.clone(),
                });
            }
        }
        Some(decision.trigger)
    }

    fn complete(&mut self) {
        let result = self.scratch.result.take().unwrap_or_else(|| TurnResult::Degraded {
            reason: "turn completed without a result".to_string(),
        });
        if let Some(turn) = self.turn.as_mut() {
            tracing::info!(
                turn_id = %turn.id,
                success = result.is_success(),
                steps = turn.step_count,
                retries = turn.retry_count,
                elapsed_ms = turn.elapsed().as_millis() as u64,
                "turn complete"
            );
            turn.finish(result);
        }
        ControllerMetrics::incr(&self.metrics.turns_finished);
    }
}

fn missing_turn(state: TurnState) -> Option<Trigger> {
    tracing::error!(%state, "no active turn, waiting for input");
    None
}
