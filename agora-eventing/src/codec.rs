//! 信封编解码
//!
//! 消息体为 JSON，头部走传输层元数据。解码错误分两类：
//! - 结构性错误（非 JSON、缺字段、类型不符）→ `MalformedMessage`
//! - 结构完整但语义非法 → `Validation`
//!
//! 两者都是永久错误，消费侧直接送入死信。

use crate::broker::WireMessage;
use crate::dead_letter::DeadLetterEnvelope;
use crate::envelope::{Envelope, Headers, WireEnvelope};
use crate::error::{EventingError, EventingResult};

#[derive(Debug, Clone, Copy, Default)]
pub struct EnvelopeCodec;

impl EnvelopeCodec {
    pub fn new() -> Self {
        Self
    }

    pub fn encode(&self, envelope: &Envelope) -> EventingResult<WireMessage> {
        envelope.validate()?;
        let body = serde_json::to_vec(envelope)?;
        Ok(WireMessage::new(body, envelope.headers.to_transport()))
    }

    pub fn decode(&self, message: &WireMessage) -> EventingResult<Envelope> {
        let wire: WireEnvelope = serde_json::from_slice(&message.body)
            .map_err(|e| EventingError::malformed(e.to_string()))?;
        let mut envelope = Envelope::try_from(wire)?;

        let mut headers = Headers::from_transport(&message.headers);
        if headers.correlation_id.is_empty() {
            headers.correlation_id = envelope.event_id.to_string();
        }
        if headers.service_name.is_empty() {
            headers.service_name = envelope.producer.clone();
        }
        envelope.headers = headers;
        Ok(envelope)
    }

    /// 死信消息：信封 JSON 为体，原始头部随行
    pub fn encode_dead_letter(&self, dead_letter: &DeadLetterEnvelope) -> EventingResult<WireMessage> {
        let body = serde_json::to_vec(dead_letter)?;
        Ok(WireMessage::new(body, dead_letter.transport_headers()))
    }

    pub fn decode_dead_letter(&self, message: &WireMessage) -> EventingResult<DeadLetterEnvelope> {
        let mut dead_letter: DeadLetterEnvelope = serde_json::from_slice(&message.body)
            .map_err(|e| EventingError::malformed(e.to_string()))?;
        dead_letter.restore_headers(&message.headers);
        Ok(dead_letter)
    }
}
