//! 可观测性：日志初始化、遥测事件、计数指标

pub mod metrics;
pub mod telemetry;

pub use metrics::{ControllerMetrics, MetricsSnapshot};
pub use telemetry::{ChannelTelemetry, OperatorAlert, TelemetryEmitter, TelemetryEvent, TracingTelemetry, TransitionRecord};

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 安装全局 subscriber：RUST_LOG 优先，默认 info。重复调用时忽略
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .try_init();
}
