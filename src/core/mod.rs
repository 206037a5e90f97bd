//! 核心编排层：状态表、守卫计数、回合记录、邮箱、错误恢复、并行协调、回合控制器

pub mod builder;
pub mod controller;
pub mod error;
pub mod guard;
pub mod machine;
pub mod mailbox;
pub mod parallel;
pub mod planner;
pub mod recovery;
pub mod state;
pub mod supervisor;
pub mod turn;

pub use builder::ControllerBuilder;
pub use controller::{DrainReport, TurnController};
pub use error::{ErrorKind, Failure, ReugError, Strategy};
pub use guard::{GuardLimits, GuardTracker, GuardViolation};
pub use machine::{default_table, StateMachine, Transition};
pub use mailbox::{BreakerStats, Event, Mailbox, MailboxEntry, MailboxHandle, MailboxLimits, TripReason};
pub use parallel::{BatchOutcome, ParallelBatch, ParallelCoordinator, ParallelError, ParallelTask, ParallelTaskSpec, TaskStatus};
pub use planner::{reduce_route, DynamicToolRequest, IntentPlanner, Plan, PlanError, Route};
pub use recovery::{RecoveryDecision, RecoveryOrchestrator};
pub use state::{Trigger, TurnSnapshot, TurnState};
pub use supervisor::TurnSupervisor;
pub use turn::{HistoryEntry, OpId, RecoveryAttempt, RecoveryOutcome, TransitionEntry, Turn, TurnId, TurnResult};
