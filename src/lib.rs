//! REUG - Agent 回合编排状态机
//!
//! 模块划分：
//! - **config**: 配置加载（TOML + 环境变量 `REUG__*`）
//! - **core**: 状态表、守卫计数、回合记录、邮箱、错误恢复阶梯、并行协调、回合控制器
//! - **observability**: 日志初始化、遥测事件、计数指标
//! - **script**: 多步脚本（依赖图 + 逐步执行器）
//! - **tools**: 工具注册表、带超时的执行器、动态工具 Schema 与校验

pub mod config;
pub mod core;
pub mod observability;
pub mod script;
pub mod tools;

pub use crate::core::{
    ControllerBuilder, Event, GuardLimits, IntentPlanner, MailboxHandle, Plan, PlanError, ReugError, Route,
    StateMachine, Trigger, Turn, TurnController, TurnResult, TurnSnapshot, TurnState,
};
