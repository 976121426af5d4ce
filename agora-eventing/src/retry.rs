//! 重试调度
//!
//! 退避：`min(base_delay * 2^attempt, max_delay)`。
//!
//! 默认实现 `BrokerDelayScheduler` 复用 broker 自身的死信机制作为延迟原语：
//! 消息带单条过期时间发布到重试交换机，进入无消费者的延迟队列；过期后经默认
//! 交换机回到工作队列。在 `next_eligible_at` 之前，消息对消费者不可见。
//! 调度器从不直接调用处理器。

use crate::broker::PublishOptions;
use crate::dead_letter::ErrorInfo;
use crate::envelope::{Envelope, ServiceIdentity};
use crate::error::{EventingError, EventingResult};
use crate::metrics::{MetricsRecorder, NoopMetrics, Operation};
use crate::publisher::Publisher;
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

/// 退避策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// 第 `attempt` 次失败后的等待时长
    pub fn delay_for(&self, attempt: u32) -> Duration {
        1u32.checked_shl(attempt)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    pub fn is_exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_retries
    }
}

/// 单条消息的重试状态
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryState {
    pub attempt: u32,
    pub last_error: Option<ErrorInfo>,
    pub next_eligible_at: Option<DateTime<Utc>>,
}

impl RetryState {
    pub fn failed(attempt: u32, error: ErrorInfo) -> Self {
        Self {
            attempt,
            last_error: Some(error),
            next_eligible_at: None,
        }
    }
}

#[async_trait]
pub trait RetryScheduler: Send + Sync {
    /// 以 `attempt + 1` 重新注入流水线，返回新的重试状态
    async fn schedule_retry(
        &self,
        envelope: &Envelope,
        state: &RetryState,
    ) -> EventingResult<RetryState>;

    /// 延迟 `delay` 后重新入队，不改变重试次数
    async fn defer(&self, envelope: &Envelope, delay: Duration) -> EventingResult<()>;
}

/// 基于延迟队列的调度器
pub struct BrokerDelayScheduler {
    publisher: Publisher,
    identity: ServiceIdentity,
    policy: RetryPolicy,
    metrics: Arc<dyn MetricsRecorder>,
}

impl BrokerDelayScheduler {
    pub fn new(publisher: Publisher, identity: ServiceIdentity, policy: RetryPolicy) -> Self {
        Self {
            publisher,
            identity,
            policy,
            metrics: Arc::new(NoopMetrics),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsRecorder>) -> Self {
        self.metrics = metrics;
        self
    }

    async fn enqueue_delayed(&self, envelope: &Envelope, delay: Duration) -> EventingResult<()> {
        self.publisher
            .send(
                &self.identity.retry_exchange(),
                &self.identity.queue(),
                envelope,
                PublishOptions::delayed(delay),
            )
            .await
    }
}

#[async_trait]
impl RetryScheduler for BrokerDelayScheduler {
    async fn schedule_retry(
        &self,
        envelope: &Envelope,
        state: &RetryState,
    ) -> EventingResult<RetryState> {
        if self.policy.is_exhausted(state.attempt) {
            return Err(EventingError::validation(format!(
                "retry budget exhausted after {} attempts",
                state.attempt
            )));
        }

        let started = Instant::now();
        let delay = self.policy.delay_for(state.attempt);
        let next_attempt = state.attempt + 1;

        let mut retried = envelope.clone();
        retried.headers.retry_attempt = next_attempt;
        self.enqueue_delayed(&retried, delay).await?;

        self.metrics.retried(next_attempt);
        self.metrics.duration(Operation::Retry, started.elapsed());
        info!(
            event_id = %envelope.event_id,
            routing_key = %envelope.routing_key,
            attempt = next_attempt,
            delay_ms = delay.as_millis() as u64,
            "retry scheduled"
        );

        Ok(RetryState {
            attempt: next_attempt,
            last_error: state.last_error.clone(),
            next_eligible_at: TimeDelta::from_std(delay).ok().map(|d| Utc::now() + d),
        })
    }

    async fn defer(&self, envelope: &Envelope, delay: Duration) -> EventingResult<()> {
        self.enqueue_delayed(envelope, delay).await
    }
}
