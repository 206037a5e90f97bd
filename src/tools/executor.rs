//! 工具执行器
//!
//! 持有 ToolBackend 与单次调用超时，execute(tool_name, args) 在超时内调用 backend.invoke，
//! 超时或失败时转为 ToolError；每次调用输出结构化审计日志（JSON）。

use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::time::timeout;

use crate::core::error::ErrorKind;
use crate::tools::registry::{available_tools, ToolBackend, ToolDescriptor, ToolProvider};

/// 工具调用失败
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ToolError {
    #[error("Tool timeout: {0}")]
    Timeout(String),

    #[error("Tool execution failed: {0}")]
    Failed(String),

    /// provider 存在但未列出该工具（规划器臆造的工具名）
    #[error("Unknown tool: {0}")]
    Unknown(String),
}

impl ToolError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ToolError::Timeout(_) => ErrorKind::Timeout,
            ToolError::Failed(_) | ToolError::Unknown(_) => ErrorKind::ToolFailure,
        }
    }
}

/// 工具执行器：对每次调用施加超时，并将结果映射为 ToolError
pub struct ToolExecutor {
    backend: Arc<dyn ToolBackend>,
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(backend: Arc<dyn ToolBackend>, timeout: Duration) -> Self {
        Self { backend, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// 执行指定工具；超时返回 Timeout，backend 返回 Err 则转为 Failed；输出 JSON 审计日志
    pub async fn execute(&self, tool_name: &str, args: serde_json::Value) -> Result<String, ToolError> {
        let start = Instant::now();
        let args_preview = args_preview(&args);
        let result = timeout(self.timeout, self.backend.invoke(tool_name, args)).await;

        let (ok, outcome): (bool, &str) = match &result {
            Ok(Ok(_)) => (true, "ok"),
            Ok(Err(_)) => (false, "error"),
            Err(_) => (false, "timeout"),
        };
        let duration_ms = start.elapsed().as_millis() as u64;
        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": tool_name,
            "ok": ok,
            "outcome": outcome,
            "duration_ms": duration_ms,
            "args_preview": args_preview,
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        match result {
            Ok(Ok(content)) => Ok(content),
            Ok(Err(e)) => Err(ToolError::Failed(e)),
            Err(_) => Err(ToolError::Timeout(tool_name.to_string())),
        }
    }

    /// 工具是否可调用：没有 provider 能力时无从判断，一律视为可调用
    pub fn check_known(&self, tool_name: &str) -> Result<(), ToolError> {
        match self.backend.provider() {
            Some(p) if !p.list_tools().iter().any(|d| d.name == tool_name) => {
                Err(ToolError::Unknown(tool_name.to_string()))
            }
            _ => Ok(()),
        }
    }

    pub fn available_tools(&self) -> Vec<ToolDescriptor> {
        available_tools(self.backend.as_ref())
    }

    pub fn provider(&self) -> Option<&dyn ToolProvider> {
        self.backend.provider()
    }
}

fn args_preview(args: &serde_json::Value) -> String {
    let s = args.to_string();
    if s.len() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
