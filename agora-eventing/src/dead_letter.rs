//! 死信路由
//!
//! 重试耗尽或永久失败的消息被包装为 `DeadLetterEnvelope`，发布到
//! `<service>.<domain>.dlx`，路由键即死信队列名 `<service>.<domain>.dlq`。
//!
//! 死信发布本身失败时绝不静默：记录最高级别日志并返回致命错误，
//! 由消费运行时中止处理循环。
//!
use crate::broker::{BrokerConnection, PublishOptions, WireMessage};
use crate::codec::EnvelopeCodec;
use crate::envelope::{Envelope, EventId, ServiceIdentity, TransportHeaders};
use crate::error::{ErrorKind, EventingError, EventingResult};
use crate::metrics::{MetricsRecorder, NoopMetrics, Operation};
use crate::publisher::Publisher;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// 默认交换机：按队列名直接路由
const DEFAULT_EXCHANGE: &str = "";

/// 死信中记录的失败信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

impl ErrorInfo {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            context: None,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

impl From<&EventingError> for ErrorInfo {
    fn from(err: &EventingError) -> Self {
        let info = ErrorInfo::new(err.kind(), err.to_string());
        match err {
            EventingError::Handler { handler, .. } => info.with_context(format!("handler={handler}")),
            _ => info,
        }
    }
}

/// 死信中保存的原始消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DeadLetterOriginal {
    /// 已解码的信封
    Envelope(Envelope),
    /// 无法解码的原始字节
    Raw(RawMessage),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawMessage {
    #[serde(with = "base64_body")]
    pub raw: Vec<u8>,
    #[serde(skip)]
    pub headers: TransportHeaders,
}

mod base64_body {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer, de};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(de::Error::custom)
    }
}

/// 死信信封
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterEnvelope {
    pub original: DeadLetterOriginal,
    pub error: ErrorInfo,
    pub retry_count: u32,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetterEnvelope {
    pub fn new(original: DeadLetterOriginal, error: ErrorInfo, retry_count: u32) -> Self {
        Self {
            original,
            error,
            retry_count,
            dead_lettered_at: Utc::now(),
        }
    }

    /// 原始信封（若可解码）
    pub fn envelope(&self) -> Option<&Envelope> {
        match &self.original {
            DeadLetterOriginal::Envelope(envelope) => Some(envelope),
            DeadLetterOriginal::Raw(_) => None,
        }
    }

    pub(crate) fn transport_headers(&self) -> TransportHeaders {
        match &self.original {
            DeadLetterOriginal::Envelope(envelope) => envelope.headers.to_transport(),
            DeadLetterOriginal::Raw(raw) => raw.headers.clone(),
        }
    }

    pub(crate) fn restore_headers(&mut self, headers: &TransportHeaders) {
        match &mut self.original {
            DeadLetterOriginal::Envelope(envelope) => {
                envelope.headers = crate::envelope::Headers::from_transport(headers);
            }
            DeadLetterOriginal::Raw(raw) => raw.headers = headers.clone(),
        }
    }
}

/// 死信路由器
pub struct DeadLetterRouter {
    publisher: Publisher,
    identity: ServiceIdentity,
    codec: EnvelopeCodec,
    metrics: Arc<dyn MetricsRecorder>,
}

impl DeadLetterRouter {
    pub fn new(publisher: Publisher, identity: ServiceIdentity) -> Self {
        Self {
            publisher,
            identity,
            codec: EnvelopeCodec::new(),
            metrics: Arc::new(NoopMetrics),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsRecorder>) -> Self {
        self.metrics = metrics;
        self
    }

    pub async fn dead_letter(
        &self,
        envelope: &Envelope,
        error: ErrorInfo,
        retry_count: u32,
    ) -> EventingResult<DeadLetterEnvelope> {
        let dead_letter = DeadLetterEnvelope::new(
            DeadLetterOriginal::Envelope(envelope.clone()),
            error,
            retry_count,
        );
        self.route(&dead_letter, &envelope.event_id.to_string())
            .await?;
        Ok(dead_letter)
    }

    /// 无法解码的消息，原样（base64）进入死信，`retry_count` 为 0
    pub async fn dead_letter_raw(
        &self,
        message: &WireMessage,
        error: ErrorInfo,
    ) -> EventingResult<DeadLetterEnvelope> {
        let dead_letter = DeadLetterEnvelope::new(
            DeadLetterOriginal::Raw(RawMessage {
                raw: message.body.clone(),
                headers: message.headers.clone(),
            }),
            error,
            0,
        );
        self.route(&dead_letter, "<undecodable>").await?;
        Ok(dead_letter)
    }

    async fn route(&self, dead_letter: &DeadLetterEnvelope, event_id: &str) -> EventingResult<()> {
        let started = Instant::now();
        let dlq = self.identity.dlq();

        let result = match self.codec.encode_dead_letter(dead_letter) {
            Ok(message) => {
                self.publisher
                    .send_raw(&self.identity.dlx(), &dlq, message, PublishOptions::default())
                    .await
            }
            Err(err) => Err(err),
        };

        if let Err(err) = result {
            error!(
                event_id,
                dlq = %dlq,
                error = %err,
                "dead-letter publish failed, message at risk of loss"
            );
            return Err(EventingError::DeadLetterPublish {
                event_id: event_id.to_string(),
                reason: err.to_string(),
            });
        }

        self.metrics.dead_lettered();
        self.metrics
            .duration(Operation::DeadLetter, started.elapsed());
        error!(
            event_id,
            dlq = %dlq,
            kind = ?dead_letter.error.kind,
            retry_count = dead_letter.retry_count,
            reason = %dead_letter.error.message,
            "event dead-lettered"
        );
        Ok(())
    }

    /// 将死信中的原始信封直接投回本消费方的工作队列：`event_id` 不变，重试计数归零
    ///
    /// 经默认交换机按队列名路由，绑定同一来源交换机的其他服务不会再次收到。
    pub async fn replay(&self, dead_letter: &DeadLetterEnvelope) -> EventingResult<EventId> {
        let Some(original) = dead_letter.envelope() else {
            return Err(EventingError::validation(
                "undecodable dead letters cannot be replayed",
            ));
        };

        let mut envelope = original.clone();
        envelope.headers.retry_attempt = 0;
        let queue = self.identity.queue();
        self.publisher
            .send(DEFAULT_EXCHANGE, &queue, &envelope, PublishOptions::default())
            .await?;

        info!(event_id = %envelope.event_id, queue = %queue, "dead letter replayed");
        Ok(envelope.event_id)
    }

    /// 排空死信队列并逐条重放
    ///
    /// 在独立通道上消费，最多处理 `limit` 条；`idle` 时间内没有新消息即结束。
    /// 本轮已重放过的事件再次出现（重放后又进入死信）时停止，该死信留在队列中。
    /// 无法重放的死信同样保留，返回成功重放的数量。
    pub async fn redrive(
        &self,
        connection: &dyn BrokerConnection,
        limit: usize,
        idle: Duration,
    ) -> EventingResult<usize> {
        let channel = connection.open_channel().await?;
        let mut stream = channel.consume(&self.identity.dlq(), 1).await?;
        let mut replayed: HashSet<EventId> = HashSet::new();

        while replayed.len() < limit {
            let delivery = match tokio::time::timeout(idle, stream.next()).await {
                Ok(Some(delivery)) => delivery?,
                Ok(None) | Err(_) => break,
            };

            let outcome = match self.codec.decode_dead_letter(&delivery.message) {
                Ok(dead_letter) => match dead_letter.envelope() {
                    Some(envelope) if replayed.contains(&envelope.event_id) => {
                        info!(
                            event_id = %envelope.event_id,
                            "dead letter failed again during this redrive, stopping"
                        );
                        channel.reject(delivery.delivery_tag, true).await?;
                        break;
                    }
                    _ => self.replay(&dead_letter).await,
                },
                Err(err) => Err(err),
            };

            match outcome {
                Ok(event_id) => {
                    channel.ack(delivery.delivery_tag).await?;
                    replayed.insert(event_id);
                }
                Err(err) => {
                    warn!(error = %err, "dead letter left in queue");
                    channel.reject(delivery.delivery_tag, true).await?;
                    break;
                }
            }
        }

        drop(stream);
        channel.close().await?;
        Ok(replayed.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{Headers, RoutingKey};
    use serde_json::json;

    fn envelope() -> Envelope {
        Envelope::new(
            "product",
            RoutingKey::parse("product.item.published").unwrap(),
            1,
            json!({"sku": "A-1"}),
            Headers::new("product").with_user_id("u-1"),
        )
    }

    #[test]
    fn wire_format_uses_camel_case_and_error_kind_names() {
        let dead_letter = DeadLetterEnvelope::new(
            DeadLetterOriginal::Envelope(envelope()),
            ErrorInfo::new(ErrorKind::Handler, "boom"),
            3,
        );
        let value = serde_json::to_value(&dead_letter).unwrap();
        assert_eq!(value["retryCount"], 3);
        assert_eq!(value["error"]["kind"], "HandlerError");
        assert!(value["error"].get("context").is_none());
        assert_eq!(value["original"]["routingKey"], "product.item.published");
        assert!(value.get("deadLetteredAt").is_some());
    }

    #[test]
    fn codec_keeps_original_headers_out_of_band() {
        let codec = EnvelopeCodec::new();
        let dead_letter = DeadLetterEnvelope::new(
            DeadLetterOriginal::Envelope(envelope()),
            ErrorInfo::new(ErrorKind::Validation, "bad"),
            0,
        );
        let wire = codec.encode_dead_letter(&dead_letter).unwrap();
        assert_eq!(wire.headers.get("x-user-id").map(String::as_str), Some("u-1"));
        assert_eq!(codec.decode_dead_letter(&wire).unwrap(), dead_letter);
    }

    #[test]
    fn raw_originals_round_trip_as_base64() {
        let codec = EnvelopeCodec::new();
        let dead_letter = DeadLetterEnvelope::new(
            DeadLetterOriginal::Raw(RawMessage {
                raw: b"\xff{garbage".to_vec(),
                headers: Default::default(),
            }),
            ErrorInfo::new(ErrorKind::MalformedMessage, "expected value"),
            0,
        );
        let wire = codec.encode_dead_letter(&dead_letter).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&wire.body).unwrap();
        assert_eq!(value["original"]["raw"], "/3tnYXJiYWdl");

        let decoded = codec.decode_dead_letter(&wire).unwrap();
        assert!(decoded.envelope().is_none());
        assert_eq!(decoded, dead_letter);
    }
}
