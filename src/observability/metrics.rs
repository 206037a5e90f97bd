//! 控制器计数指标（原子计数，可跨任务共享）

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::core::mailbox::BreakerStats;

#[derive(Debug, Default)]
pub struct ControllerMetrics {
    pub transitions: AtomicU64,
    /// 非法转换请求
    pub rejected: AtomicU64,
    /// 因 op_id 不匹配被丢弃的回调
    pub stale: AtomicU64,
    pub turns_started: AtomicU64,
    pub turns_finished: AtomicU64,
    pub alerts: AtomicU64,
    /// 邮箱拒收（满或熔断中）
    pub mailbox_rejected: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub transitions: u64,
    pub rejected: u64,
    pub stale: u64,
    pub turns_started: u64,
    pub turns_finished: u64,
    pub alerts: u64,
    pub mailbox_rejected: u64,
    /// 跳闸总数（溢出 + 速率）
    pub breaker_trips: u64,
    pub breaker_overflow_trips: u64,
    pub breaker_rate_limit_trips: u64,
    pub breaker_open: bool,
}

impl ControllerMetrics {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// 熔断状态由邮箱自己维护，快照时并入
    pub fn snapshot(&self, breaker: BreakerStats) -> MetricsSnapshot {
        MetricsSnapshot {
            transitions: self.transitions.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
            turns_started: self.turns_started.load(Ordering::Relaxed),
            turns_finished: self.turns_finished.load(Ordering::Relaxed),
            alerts: self.alerts.load(Ordering::Relaxed),
            mailbox_rejected: self.mailbox_rejected.load(Ordering::Relaxed),
            breaker_trips: breaker.total_trips(),
            breaker_overflow_trips: breaker.overflow_trips,
            breaker_rate_limit_trips: breaker.rate_limit_trips,
            breaker_open: breaker.open,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reads_counters() {
        let m = ControllerMetrics::default();
        ControllerMetrics::incr(&m.stale);
        ControllerMetrics::incr(&m.stale);
        ControllerMetrics::incr(&m.transitions);
        let snap = m.snapshot(BreakerStats {
            open: true,
            overflow_trips: 1,
            rate_limit_trips: 2,
        });
        assert_eq!(snap.stale, 2);
        assert_eq!(snap.transitions, 1);
        assert_eq!(snap.breaker_trips, 3);
        assert_eq!(snap.breaker_rate_limit_trips, 2);
        assert!(snap.breaker_open);
        assert_eq!(snap.alerts, 0);
    }
}
