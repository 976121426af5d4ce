//! 指标埋点
//!
//! 埋点位置与名称固定，阈值与告警策略由外部系统决定。

use crate::error::FailureClass;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

pub const EVENTS_PROCESSED_TOTAL: &str = "agora_events_processed_total";
pub const EVENTS_FAILED_TOTAL: &str = "agora_events_failed_total";
pub const EVENTS_RETRIED_TOTAL: &str = "agora_events_retried_total";
pub const EVENTS_DEAD_LETTERED_TOTAL: &str = "agora_events_dead_lettered_total";
pub const OPERATION_DURATION_SECONDS: &str = "agora_operation_duration_seconds";

/// 被计时的操作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Publish,
    Decode,
    Handle,
    Ack,
    Retry,
    DeadLetter,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Publish => "publish",
            Operation::Decode => "decode",
            Operation::Handle => "handle",
            Operation::Ack => "ack",
            Operation::Retry => "retry",
            Operation::DeadLetter => "dead_letter",
        }
    }
}

/// 指标记录器；默认实现均为空操作
pub trait MetricsRecorder: Send + Sync {
    fn processed(&self) {}

    fn failed(&self, _class: FailureClass) {}

    /// `attempt` 为即将进行的重试序号（从 1 开始）
    fn retried(&self, _attempt: u32) {}

    fn dead_lettered(&self) {}

    fn duration(&self, _operation: Operation, _elapsed: Duration) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsRecorder for NoopMetrics {}

/// 进程内计数器，供测试与本地观测
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    processed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    durations: Mutex<HashMap<Operation, OperationStats>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OperationStats {
    pub count: u64,
    pub total: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub processed: u64,
    pub failed: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub durations: HashMap<Operation, OperationStats>,
}

impl MetricsSnapshot {
    pub fn count_of(&self, operation: Operation) -> u64 {
        self.durations.get(&operation).map(|s| s.count).unwrap_or(0)
    }
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            durations: self
                .durations
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
        }
    }
}

impl MetricsRecorder for InMemoryMetrics {
    fn processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    fn failed(&self, _class: FailureClass) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    fn retried(&self, _attempt: u32) {
        self.retried.fetch_add(1, Ordering::Relaxed);
    }

    fn dead_lettered(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    fn duration(&self, operation: Operation, elapsed: Duration) {
        let mut durations = self.durations.lock().unwrap_or_else(|e| e.into_inner());
        let stats = durations.entry(operation).or_default();
        stats.count += 1;
        stats.total += elapsed;
    }
}
