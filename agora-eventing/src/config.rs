use crate::error::{EventingError, EventingResult};
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 去重记录处于 `InProgress`（另一 worker 正在处理）时的处理方式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InProgressPolicy {
    /// 经延迟队列在 `base_delay` 后重新入队，不消耗重试次数
    #[default]
    Delay,
    /// 直接 reject 并重入队
    Requeue,
}

/// 消费运行时配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConsumerConfig {
    pub max_retries: u32,
    #[serde(with = "humantime_serde")]
    pub base_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub max_delay: Duration,
    /// 并发处理的消息数上限
    pub concurrency: usize,
    /// broker 侧未确认消息上限
    pub prefetch: u16,
    #[serde(with = "humantime_serde")]
    pub dedup_retention_window: Duration,
    #[serde(with = "humantime_serde")]
    pub in_progress_ttl: Duration,
    #[serde(with = "humantime_serde")]
    pub dedup_sweep_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,
    pub in_progress_policy: InProgressPolicy,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            concurrency: 8,
            prefetch: 16,
            dedup_retention_window: Duration::from_secs(24 * 60 * 60),
            in_progress_ttl: Duration::from_secs(5 * 60),
            dedup_sweep_interval: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(30),
            in_progress_policy: InProgressPolicy::Delay,
        }
    }
}

impl ConsumerConfig {
    pub fn validate(&self) -> EventingResult<()> {
        if self.concurrency == 0 {
            return Err(EventingError::config("concurrency must be at least 1"));
        }
        if self.prefetch == 0 {
            return Err(EventingError::config("prefetch must be at least 1"));
        }
        if self.base_delay.is_zero() {
            return Err(EventingError::config("base delay must be positive"));
        }
        if self.max_delay < self.base_delay {
            return Err(EventingError::config(
                "max delay must not be shorter than base delay",
            ));
        }
        if self.dedup_sweep_interval.is_zero() {
            return Err(EventingError::config("dedup sweep interval must be positive"));
        }
        // 去重窗口须覆盖完整的重试周期，否则重试副本可能被再次执行
        if self.dedup_retention_window <= self.max_delay.saturating_mul(self.max_retries) {
            return Err(EventingError::config(format!(
                "dedup retention window {:?} must exceed max_retries x max_delay",
                self.dedup_retention_window
            )));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: self.base_delay,
            max_delay: self.max_delay,
        }
    }
}
