//! 事件发布
//!
//! 发布走会话的专用发布通道，等待 broker 确认后才返回；失败以
//! `EventingError::Publish` 交给调用方，内部不做重试。

use crate::broker::{BrokerChannel, PublishOptions, Topology, WireMessage};
use crate::codec::EnvelopeCodec;
use crate::envelope::routing::exchange_name;
use crate::envelope::{Envelope, EventId, EventPayload, Headers};
use crate::error::{EventingError, EventingResult};
use crate::metrics::{MetricsRecorder, NoopMetrics, Operation};
use crate::trace::{TracePropagator, W3cTraceContextPropagator};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// 发布器；克隆共享同一通道
#[derive(Clone)]
pub struct Publisher {
    channel: Arc<dyn BrokerChannel>,
    service: String,
    codec: EnvelopeCodec,
    propagator: Arc<dyn TracePropagator>,
    metrics: Arc<dyn MetricsRecorder>,
}

impl Publisher {
    pub fn new(channel: Arc<dyn BrokerChannel>, service: impl Into<String>) -> Self {
        Self {
            channel,
            service: service.into(),
            codec: EnvelopeCodec::new(),
            propagator: Arc::new(W3cTraceContextPropagator),
            metrics: Arc::new(NoopMetrics),
        }
    }

    pub fn with_propagator(mut self, propagator: Arc<dyn TracePropagator>) -> Self {
        self.propagator = propagator;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsRecorder>) -> Self {
        self.metrics = metrics;
        self
    }

    /// 生产方服务名
    pub fn service(&self) -> &str {
        &self.service
    }

    /// 声明本服务在 `domain` 下的 topic 交换机
    pub async fn declare_exchange(&self, domain: &str) -> EventingResult<()> {
        self.channel
            .declare(&Topology::for_producer(&self.service, domain))
            .await
    }

    /// 发布到 `agora.<producer>.<domain>`，路由键沿用信封自身
    pub async fn publish(&self, envelope: &Envelope) -> EventingResult<()> {
        let mut envelope = envelope.clone();
        self.propagator.inject(&mut envelope.headers);
        let exchange = exchange_name(&envelope.producer, envelope.routing_key.domain());
        self.send(
            &exchange,
            envelope.routing_key.as_str(),
            &envelope,
            PublishOptions::default(),
        )
        .await
    }

    /// 以强类型载荷构建信封并发布，返回分配的 `EventId`
    pub async fn publish_event<E: EventPayload>(
        &self,
        event: &E,
        mut headers: Headers,
    ) -> EventingResult<EventId> {
        if headers.service_name.is_empty() {
            headers.service_name = self.service.clone();
        }
        if headers.correlation_id.is_empty() {
            headers.correlation_id = Uuid::new_v4().to_string();
        }
        let envelope = Envelope::for_event(self.service.clone(), event, headers)?;
        self.publish(&envelope).await?;
        Ok(envelope.event_id)
    }

    /// 原样发送信封（不注入链路头），供重试与死信路径使用
    pub(crate) async fn send(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
        options: PublishOptions,
    ) -> EventingResult<()> {
        let message = self.codec.encode(envelope)?;
        self.send_raw(exchange, routing_key, message, options).await
    }

    pub(crate) async fn send_raw(
        &self,
        exchange: &str,
        routing_key: &str,
        message: WireMessage,
        options: PublishOptions,
    ) -> EventingResult<()> {
        let started = Instant::now();
        let result = self
            .channel
            .publish(exchange, routing_key, message, options)
            .await;
        self.metrics.duration(Operation::Publish, started.elapsed());

        match result {
            Ok(()) => {
                debug!(exchange, routing_key, "published");
                Ok(())
            }
            Err(err) => {
                warn!(exchange, routing_key, error = %err, "publish failed");
                Err(EventingError::Publish {
                    exchange: exchange.to_string(),
                    reason: err.to_string(),
                })
            }
        }
    }
}
