//! 多步脚本：步骤类型、依赖图、逐步执行器

pub mod executor;
pub mod graph;
pub mod types;

pub use executor::{ScriptExecutor, StepOutcome};
pub use graph::{ScriptError, ScriptGraph};
pub use types::{chain, reset_failed, ScriptStep, StepAction, StepId, StepStatus};
