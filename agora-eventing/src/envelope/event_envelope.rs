use super::headers::is_reserved_header;
use super::{EventId, EventPayload, Headers, RoutingKey, routing::is_kebab_segment};
use crate::error::{EventingError, EventingResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 事件信封：一经发布即不可变
///
/// 消息体只承载 `eventId/timestamp/version/producer/routingKey/payload`，
/// `headers` 作为传输元数据在带外传递，因此不参与 JSON 序列化。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "WireEnvelope", into = "WireEnvelope")]
pub struct Envelope {
    pub event_id: EventId,
    pub timestamp: DateTime<Utc>,
    pub schema_version: u32,
    pub producer: String,
    pub routing_key: RoutingKey,
    pub payload: Value,
    pub headers: Headers,
}

impl Envelope {
    /// 新建信封，分配新的 `event_id` 与当前时间
    pub fn new(
        producer: impl Into<String>,
        routing_key: RoutingKey,
        schema_version: u32,
        payload: Value,
        headers: Headers,
    ) -> Self {
        Self {
            event_id: EventId::new(),
            timestamp: Utc::now(),
            schema_version,
            producer: producer.into(),
            routing_key,
            payload,
            headers,
        }
    }

    /// 由强类型载荷构建信封
    pub fn for_event<E: EventPayload>(
        producer: impl Into<String>,
        event: &E,
        headers: Headers,
    ) -> EventingResult<Self> {
        Ok(Self::new(
            producer,
            RoutingKey::parse(E::ROUTING_KEY)?,
            E::SCHEMA_VERSION,
            serde_json::to_value(event)?,
            headers,
        ))
    }

    /// 发布前的完整性校验
    pub fn validate(&self) -> EventingResult<()> {
        if self.event_id.as_uuid().is_nil() {
            return Err(EventingError::validation("event id must not be nil"));
        }
        if self.schema_version == 0 {
            return Err(EventingError::validation("schema version must be positive"));
        }
        if !is_kebab_segment(&self.producer) {
            return Err(EventingError::validation(format!(
                "producer '{}' must be lower-kebab",
                self.producer
            )));
        }
        if self.headers.correlation_id.is_empty() {
            return Err(EventingError::validation("missing correlation id header"));
        }
        if self.headers.service_name.is_empty() {
            return Err(EventingError::validation("missing service name header"));
        }
        if let Some(key) = self.headers.extra.keys().find(|k| is_reserved_header(k)) {
            return Err(EventingError::validation(format!(
                "extra header '{key}' collides with a named header"
            )));
        }
        Ok(())
    }

    /// 当前重试次数
    pub fn attempt(&self) -> u32 {
        self.headers.retry_attempt
    }

    /// 反序列化载荷为强类型
    pub fn decode_payload<E: EventPayload>(&self) -> EventingResult<E> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// 线上 JSON 结构，字段级类型错误在这一层暴露为结构性错误
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireEnvelope {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub version: u32,
    pub producer: String,
    pub routing_key: String,
    pub payload: Value,
}

impl TryFrom<WireEnvelope> for Envelope {
    type Error = EventingError;

    fn try_from(wire: WireEnvelope) -> Result<Self, Self::Error> {
        let envelope = Envelope {
            event_id: EventId::parse(&wire.event_id)?,
            timestamp: wire.timestamp,
            schema_version: wire.version,
            producer: wire.producer,
            routing_key: RoutingKey::parse(wire.routing_key)?,
            payload: wire.payload,
            headers: Headers::default(),
        };
        if envelope.schema_version == 0 {
            return Err(EventingError::validation("schema version must be positive"));
        }
        if !is_kebab_segment(&envelope.producer) {
            return Err(EventingError::validation(format!(
                "producer '{}' must be lower-kebab",
                envelope.producer
            )));
        }
        Ok(envelope)
    }
}

impl From<Envelope> for WireEnvelope {
    fn from(envelope: Envelope) -> Self {
        WireEnvelope {
            event_id: envelope.event_id.to_string(),
            timestamp: envelope.timestamp,
            version: envelope.schema_version,
            producer: envelope.producer,
            routing_key: envelope.routing_key.into(),
            payload: envelope.payload,
        }
    }
}
