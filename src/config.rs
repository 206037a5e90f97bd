//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `REUG__*` 覆盖（双下划线表示嵌套，如 `REUG__GUARDS__STEP_BUDGET=50`）。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::core::guard::GuardLimits;
use crate::core::mailbox::MailboxLimits;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub guards: GuardSection,
    pub mailbox: MailboxSection,
    pub tools: ToolsSection,
}

/// [guards] 段：每回合的资源上限
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GuardSection {
    pub recursion_limit: u32,
    pub step_budget: u32,
    pub timeout_seconds: u64,
    pub max_parallel_tasks: usize,
    pub max_tool_retries: u32,
}

impl Default for GuardSection {
    fn default() -> Self {
        Self {
            recursion_limit: 5,
            step_budget: 100,
            timeout_seconds: 300,
            max_parallel_tasks: 10,
            max_tool_retries: 3,
        }
    }
}

impl From<&GuardSection> for GuardLimits {
    fn from(s: &GuardSection) -> Self {
        GuardLimits {
            recursion_limit: s.recursion_limit,
            step_budget: s.step_budget,
            timeout: Duration::from_secs(s.timeout_seconds),
            max_parallel_tasks: s.max_parallel_tasks,
            max_tool_retries: s.max_tool_retries,
        }
    }
}

/// [mailbox] 段：队列上限与熔断冷却
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MailboxSection {
    pub max_size: usize,
    /// 超过此长度开始告警
    pub warning_size: usize,
    pub circuit_breaker_timeout_secs: u64,
    /// 每秒允许的状态转换数，0 表示不限
    pub transition_rate_limit: u32,
}

impl Default for MailboxSection {
    fn default() -> Self {
        Self {
            max_size: 100,
            warning_size: 50,
            circuit_breaker_timeout_secs: 30,
            transition_rate_limit: 200,
        }
    }
}

impl From<&MailboxSection> for MailboxLimits {
    fn from(s: &MailboxSection) -> Self {
        MailboxLimits {
            max_size: s.max_size,
            warning_size: s.warning_size,
            breaker_timeout: Duration::from_secs(s.circuit_breaker_timeout_secs),
            transition_rate_limit: s.transition_rate_limit,
        }
    }
}

/// [tools] 段
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒）
    pub tool_timeout_secs: u64,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self { tool_timeout_secs: 30 }
    }
}

impl AppConfig {
    pub fn guard_limits(&self) -> GuardLimits {
        GuardLimits::from(&self.guards)
    }

    pub fn mailbox_limits(&self) -> MailboxLimits {
        MailboxLimits::from(&self.mailbox)
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_secs(self.tools.tool_timeout_secs)
    }
}

/// 从默认路径 config/default.toml 及可选路径加载，环境变量 REUG__* 覆盖
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("REUG")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}

/// 重新从磁盘与环境变量加载配置；已运行的控制器不受影响，调用方用新配置构建新的控制器
pub fn reload_config() -> Result<AppConfig, config::ConfigError> {
    load_config(None)
}
