//! 并行协调：有界扇出 + 扇入，或整体超时
//!
//! 任务数超过 max_parallel_tasks 时直接拒绝，不启动任何任务。Semaphore 限制同时 running 的任务数；
//! 每个任务持有回合令牌的子令牌，超时或有任务失败时取消其余任务。部分结果一律丢弃。

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::core::error::{ErrorKind, Failure};
use crate::core::state::Trigger;
use crate::tools::{ToolCall, ToolError, ToolExecutor};

/// 待启动的并行任务
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParallelTaskSpec {
    pub id: String,
    pub call: ToolCall,
}

impl ParallelTaskSpec {
    pub fn new(id: impl Into<String>, call: ToolCall) -> Self {
        Self { id: id.into(), call }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Running,
    Done,
    Failed,
    TimedOut,
    /// 同批次其他任务失败后被取消
    Cancelled,
}

/// 任务记录
#[derive(Clone, Debug, Serialize)]
pub struct ParallelTask {
    pub id: String,
    pub status: TaskStatus,
    pub result: Option<String>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
}

impl ParallelTask {
    fn running(id: &str) -> Self {
        Self {
            id: id.to_string(),
            status: TaskStatus::Running,
            result: None,
            error: None,
            started_at: Utc::now(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParallelError {
    #[error("Parallel batch of {requested} tasks exceeds limit {max}")]
    TooManyTasks { requested: usize, max: usize },

    #[error("Duplicate parallel task id: {0}")]
    DuplicateTask(String),
}

impl ParallelError {
    pub fn into_failure(self) -> Failure {
        Failure::new(ErrorKind::BatchRejected, Trigger::ErrorOccurred, self.to_string())
    }
}

/// 批次结果：全部完成、整体超时，或某个任务失败
#[derive(Debug)]
pub enum BatchOutcome {
    Ready(Vec<ParallelTask>),
    TimedOut {
        tasks: Vec<ParallelTask>,
        elapsed: Duration,
    },
    Failed {
        task_id: String,
        error: ToolError,
        tasks: Vec<ParallelTask>,
    },
}

impl BatchOutcome {
    pub fn trigger(&self) -> Trigger {
        match self {
            BatchOutcome::Ready(_) => Trigger::ParallelResultsReady,
            BatchOutcome::TimedOut { .. } => Trigger::TimeoutDetected,
            BatchOutcome::Failed { .. } => Trigger::ErrorOccurred,
        }
    }

    pub fn tasks(&self) -> &[ParallelTask] {
        match self {
            BatchOutcome::Ready(tasks) => tasks,
            BatchOutcome::TimedOut { tasks, .. } => tasks,
            BatchOutcome::Failed { tasks, .. } => tasks,
        }
    }

    /// 非 Ready 时转为恢复阶梯消费的 Failure
    pub fn failure(&self) -> Option<Failure> {
        match self {
            BatchOutcome::Ready(_) => None,
            BatchOutcome::TimedOut { elapsed, .. } => Some(Failure::new(
                ErrorKind::Timeout,
                Trigger::TimeoutDetected,
                format!("parallel batch timed out after {}ms", elapsed.as_millis()),
            )),
            BatchOutcome::Failed { task_id, error, .. } => Some(
                Failure::new(error.kind(), Trigger::ErrorOccurred, error.to_string()).with_source(task_id.clone()),
            ),
        }
    }
}

enum TaskOutcome {
    Done(String),
    Failed(ToolError),
    Cancelled,
}

/// 同时 running 的任务计数（含历史峰值）
#[derive(Clone, Default)]
struct RunningGauge {
    running: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl RunningGauge {
    fn enter(&self) -> RunningGuard {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        RunningGuard {
            running: self.running.clone(),
        }
    }
}

struct RunningGuard {
    running: Arc<AtomicUsize>,
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.running.fetch_sub(1, Ordering::SeqCst);
    }
}

/// 并行协调器
#[derive(Clone)]
pub struct ParallelCoordinator {
    max_parallel: usize,
    semaphore: Arc<Semaphore>,
    executor: Arc<ToolExecutor>,
    gauge: RunningGauge,
}

impl ParallelCoordinator {
    pub fn new(executor: Arc<ToolExecutor>, max_parallel: usize) -> Self {
        let max_parallel = max_parallel.max(1);
        Self {
            max_parallel,
            semaphore: Arc::new(Semaphore::new(max_parallel)),
            executor,
            gauge: RunningGauge::default(),
        }
    }

    pub fn max_parallel(&self) -> usize {
        self.max_parallel
    }

    /// 当前 running 的任务数
    pub fn running(&self) -> usize {
        self.gauge.running.load(Ordering::SeqCst)
    }

    /// 协调器生命周期内同时 running 的最大任务数
    pub fn peak_running(&self) -> usize {
        self.gauge.peak.load(Ordering::SeqCst)
    }

    /// 启动一批任务；超过上限或 id 重复时什么都不启动
    pub fn launch(&self, specs: &[ParallelTaskSpec], token: CancellationToken) -> Result<ParallelBatch, ParallelError> {
        if specs.len() > self.max_parallel {
            return Err(ParallelError::TooManyTasks {
                requested: specs.len(),
                max: self.max_parallel,
            });
        }
        let mut seen = std::collections::HashSet::new();
        if let Some(dup) = specs.iter().find(|s| !seen.insert(s.id.as_str())) {
            return Err(ParallelError::DuplicateTask(dup.id.clone()));
        }

        let mut set = JoinSet::new();
        let mut tasks = Vec::with_capacity(specs.len());
        for spec in specs {
            tasks.push(ParallelTask::running(&spec.id));
            let id = spec.id.clone();
            let call = spec.call.clone();
            let executor = self.executor.clone();
            let semaphore = self.semaphore.clone();
            let gauge = self.gauge.clone();
            let task_token = token.child_token();
            set.spawn(async move {
                let outcome = run_task(call, executor, semaphore, gauge, task_token).await;
                (id, outcome)
            });
        }
        tracing::info!(tasks = specs.len(), max = self.max_parallel, "parallel batch launched");
        Ok(ParallelBatch { set, tasks, token })
    }

    /// launch + collect
    pub async fn run(
        &self,
        specs: &[ParallelTaskSpec],
        token: CancellationToken,
        timeout: Duration,
    ) -> Result<BatchOutcome, ParallelError> {
        Ok(self.launch(specs, token)?.collect(timeout).await)
    }
}

async fn run_task(
    call: ToolCall,
    executor: Arc<ToolExecutor>,
    semaphore: Arc<Semaphore>,
    gauge: RunningGauge,
    token: CancellationToken,
) -> TaskOutcome {
    let _permit = tokio::select! {
        _ = token.cancelled() => return TaskOutcome::Cancelled,
        permit = semaphore.acquire_owned() => match permit {
            Ok(p) => p,
            Err(_) => return TaskOutcome::Failed(ToolError::Failed("task pool closed".into())),
        },
    };
    let _running = gauge.enter();

    let ToolCall { tool, args } = call;
    let fut = executor.execute(&tool, args);
    tokio::select! {
        _ = token.cancelled() => TaskOutcome::Cancelled,
        res = AssertUnwindSafe(fut).catch_unwind() => match res {
            Ok(Ok(out)) => TaskOutcome::Done(out),
            Ok(Err(e)) => TaskOutcome::Failed(e),
            Err(_) => TaskOutcome::Failed(ToolError::Failed(format!("tool `{tool}` panicked"))),
        },
    }
}

/// 已启动的批次
pub struct ParallelBatch {
    set: JoinSet<(String, TaskOutcome)>,
    tasks: Vec<ParallelTask>,
    token: CancellationToken,
}

impl std::fmt::Debug for ParallelBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelBatch")
            .field("tasks", &self.tasks)
            .field("pending", &self.set.len())
            .finish()
    }
}

impl ParallelBatch {
    pub fn tasks(&self) -> &[ParallelTask] {
        &self.tasks
    }

    /// 等待全部任务结束或超时，先到者为准
    pub async fn collect(mut self, timeout: Duration) -> BatchOutcome {
        let started = tokio::time::Instant::now();
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        while !self.set.is_empty() {
            tokio::select! {
                _ = &mut deadline => {
                    self.abort();
                    for task in &mut self.tasks {
                        if task.status == TaskStatus::Running {
                            task.status = TaskStatus::TimedOut;
                        }
                        // 部分结果丢弃，不合并
                        task.result = None;
                    }
                    let elapsed = started.elapsed();
                    tracing::warn!(elapsed_ms = elapsed.as_millis() as u64, "parallel batch timed out, outstanding tasks cancelled");
                    return BatchOutcome::TimedOut { tasks: self.tasks, elapsed };
                }
                joined = self.set.join_next() => {
                    let (id, outcome) = match joined {
                        Some(Ok(pair)) => pair,
                        Some(Err(e)) => {
                            tracing::warn!(error = %e, "parallel task join error");
                            continue;
                        }
                        None => break,
                    };
                    let error = match outcome {
                        TaskOutcome::Done(out) => {
                            if let Some(task) = self.find(&id) {
                                task.status = TaskStatus::Done;
                                task.result = Some(out);
                            }
                            continue;
                        }
                        TaskOutcome::Failed(e) => e,
                        TaskOutcome::Cancelled => ToolError::Failed(format!("task `{id}` cancelled")),
                    };
                    if let Some(task) = self.find(&id) {
                        task.status = TaskStatus::Failed;
                        task.error = Some(error.to_string());
                    }
                    self.abort();
                    for task in &mut self.tasks {
                        if task.status == TaskStatus::Running {
                            task.status = TaskStatus::Cancelled;
                        }
                        task.result = None;
                    }
                    tracing::warn!(task = %id, error = %error, "parallel task failed, cancelling the rest");
                    return BatchOutcome::Failed { task_id: id, error, tasks: self.tasks };
                }
            }
        }
        BatchOutcome::Ready(self.tasks)
    }

    fn find(&mut self, id: &str) -> Option<&mut ParallelTask> {
        self.tasks.iter_mut().find(|t| t.id == id)
    }

    fn abort(&mut self) {
        self.token.cancel();
        self.set.abort_all();
    }
}
