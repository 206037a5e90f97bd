//! 邮箱：串行化入站事件的 FIFO 队列，带熔断器
//!
//! 两种情况会让熔断器跳闸：队列堆满，或一秒窗口内的状态转换数超过 transition_rate_limit。
//! 跳闸后冷却期内拒收一切事件；冷却期过后下一次 push 时自动复位。

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::core::error::ReugError;
use crate::core::state::Trigger;
use crate::core::turn::OpId;

/// 入站事件
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    /// 用户输入，开始新回合
    UserInput(String),
    /// 显式结束当前回合（COMPLETE -> READY）
    TurnComplete,
    Shutdown,
    /// 异步回调（工具结果、定时器），必须携带发起它的回合的 op_id
    Callback {
        op_id: OpId,
        trigger: Trigger,
        detail: Option<String>,
    },
}

impl Event {
    pub fn trigger(&self) -> Trigger {
        match self {
            Event::UserInput(_) => Trigger::UserInput,
            Event::TurnComplete => Trigger::TurnComplete,
            Event::Shutdown => Trigger::ShutdownRequested,
            Event::Callback { trigger, .. } => *trigger,
        }
    }

    /// 只作用于指定回合的事件返回其 op_id
    pub fn target(&self) -> Option<OpId> {
        match self {
            Event::Callback { op_id, .. } => Some(*op_id),
            _ => None,
        }
    }
}

/// 邮箱条目
#[derive(Clone, Debug)]
pub struct MailboxEntry {
    pub sequence_no: u64,
    pub payload: Event,
    pub enqueued_at: DateTime<Utc>,
}

/// 邮箱容量与熔断参数
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MailboxLimits {
    pub max_size: usize,
    pub warning_size: usize,
    pub breaker_timeout: Duration,
    /// 每秒允许的状态转换数，0 表示不限
    pub transition_rate_limit: u32,
}

impl Default for MailboxLimits {
    fn default() -> Self {
        Self {
            max_size: 100,
            warning_size: 50,
            breaker_timeout: Duration::from_secs(30),
            transition_rate_limit: 200,
        }
    }
}

/// 转换速率的统计窗口
const RATE_WINDOW: Duration = Duration::from_secs(1);

/// 跳闸原因
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TripReason {
    MailboxOverflow,
    RateLimit,
}

/// 熔断器状态与按原因的跳闸计数
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BreakerStats {
    pub open: bool,
    pub overflow_trips: u64,
    pub rate_limit_trips: u64,
}

impl BreakerStats {
    pub fn total_trips(&self) -> u64 {
        self.overflow_trips + self.rate_limit_trips
    }
}

#[derive(Debug)]
struct CircuitBreaker {
    open_since: Option<Instant>,
    overflow_trips: u64,
    rate_limit_trips: u64,
    window_start: Instant,
    window_transitions: u32,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self {
            open_since: None,
            overflow_trips: 0,
            rate_limit_trips: 0,
            window_start: Instant::now(),
            window_transitions: 0,
        }
    }
}

impl CircuitBreaker {
    fn trip(&mut self, reason: TripReason, now: Instant) {
        self.open_since = Some(now);
        match reason {
            TripReason::MailboxOverflow => self.overflow_trips += 1,
            TripReason::RateLimit => self.rate_limit_trips += 1,
        }
    }
}

/// FIFO 邮箱
#[derive(Debug)]
pub struct Mailbox {
    queue: VecDeque<MailboxEntry>,
    next_seq: u64,
    limits: MailboxLimits,
    breaker: CircuitBreaker,
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::new(MailboxLimits::default())
    }
}

impl Mailbox {
    pub fn new(limits: MailboxLimits) -> Self {
        Self {
            queue: VecDeque::new(),
            next_seq: 0,
            limits,
            breaker: CircuitBreaker::default(),
        }
    }

    /// 入队，返回序号
    pub fn push(&mut self, payload: Event) -> Result<u64, ReugError> {
        if let Some(since) = self.breaker.open_since {
            if since.elapsed() < self.limits.breaker_timeout {
                tracing::warn!(trigger = %payload.trigger(), "Circuit breaker open, rejecting event");
                return Err(ReugError::CircuitOpen);
            }
            tracing::info!("Circuit breaker cooldown expired, resetting");
            self.breaker.open_since = None;
        }

        if self.queue.len() >= self.limits.max_size {
            self.breaker.trip(TripReason::MailboxOverflow, Instant::now());
            tracing::error!(
                len = self.queue.len(),
                trips = self.breaker.overflow_trips,
                reason = ?TripReason::MailboxOverflow,
                "Mailbox overflow, circuit breaker tripped"
            );
            return Err(ReugError::MailboxFull(self.queue.len()));
        }

        let sequence_no = self.next_seq;
        self.next_seq += 1;
        self.queue.push_back(MailboxEntry {
            sequence_no,
            payload,
            enqueued_at: Utc::now(),
        });

        if self.queue.len() > self.limits.warning_size {
            tracing::warn!(
                len = self.queue.len(),
                max = self.limits.max_size,
                "Mailbox approaching limit"
            );
        }
        Ok(sequence_no)
    }

    pub fn pop(&mut self) -> Option<MailboxEntry> {
        self.queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn pressure(&self) -> f32 {
        if self.limits.max_size == 0 {
            return 1.0;
        }
        self.queue.len() as f32 / self.limits.max_size as f32
    }

    pub fn is_open(&self) -> bool {
        self.breaker.open_since.is_some()
    }

    pub fn trips(&self) -> u64 {
        self.breaker_stats().total_trips()
    }

    pub fn breaker_stats(&self) -> BreakerStats {
        BreakerStats {
            open: self.is_open(),
            overflow_trips: self.breaker.overflow_trips,
            rate_limit_trips: self.breaker.rate_limit_trips,
        }
    }

    /// 记一次状态转换；窗口内超过速率上限时跳闸，返回是否因此跳闸
    pub fn record_transition(&mut self) -> bool {
        self.record_transition_at(Instant::now())
    }

    fn record_transition_at(&mut self, now: Instant) -> bool {
        let limit = self.limits.transition_rate_limit;
        if limit == 0 {
            return false;
        }
        let breaker = &mut self.breaker;
        if now.saturating_duration_since(breaker.window_start) >= RATE_WINDOW {
            breaker.window_start = now;
            breaker.window_transitions = 0;
        }
        breaker.window_transitions += 1;
        if breaker.window_transitions <= limit || breaker.open_since.is_some() {
            return false;
        }
        breaker.trip(TripReason::RateLimit, now);
        tracing::error!(
            transitions = breaker.window_transitions,
            limit,
            trips = breaker.rate_limit_trips,
            reason = ?TripReason::RateLimit,
            "Transition rate exceeded, circuit breaker tripped"
        );
        true
    }

    /// 丢弃全部排队条目，返回丢弃数量
    pub fn clear(&mut self) -> usize {
        let n = self.queue.len();
        self.queue.clear();
        n
    }
}

/// 可克隆的投递端：并发生产者与异步回调通过它把事件送进控制器
#[derive(Clone, Debug)]
pub struct MailboxHandle {
    tx: mpsc::UnboundedSender<Event>,
}

impl MailboxHandle {
    pub(crate) fn new(tx: mpsc::UnboundedSender<Event>) -> Self {
        Self { tx }
    }

    pub fn submit(&self, event: Event) -> Result<(), ReugError> {
        self.tx.send(event).map_err(|_| ReugError::ShutDown)
    }

    pub fn user_input(&self, text: impl Into<String>) -> Result<(), ReugError> {
        self.submit(Event::UserInput(text.into()))
    }

    pub fn turn_complete(&self) -> Result<(), ReugError> {
        self.submit(Event::TurnComplete)
    }

    pub fn shutdown(&self) -> Result<(), ReugError> {
        self.submit(Event::Shutdown)
    }

    /// 投递携带 op_id 的异步结果
    pub fn callback(&self, op_id: OpId, trigger: Trigger) -> Result<(), ReugError> {
        self.submit(Event::Callback {
            op_id,
            trigger,
            detail: None,
        })
    }
}
