//! 事件信封（Envelope）与路由约定
//!
//! 定义在 broker 上流转的最小单元 `Envelope`、其带外头部 `Headers`、
//! 去重键 `EventId`，以及路由键语法与交换机/队列命名。

mod event_envelope;
mod event_id;
mod headers;
mod payload;
pub mod routing;

pub(crate) use event_envelope::WireEnvelope;
pub use event_envelope::Envelope;
pub use event_id::EventId;
pub use headers::{Headers, TransportHeaders};
pub use payload::EventPayload;
pub use routing::{RoutingKey, ServiceIdentity};

pub mod header_names {
    pub use super::headers::{
        HEADER_CORRELATION_ID, HEADER_RETRY_ATTEMPT, HEADER_SERVICE_NAME, HEADER_STORE_ID,
        HEADER_TRACEPARENT, HEADER_TRACESTATE, HEADER_USER_ID, is_reserved_header,
    };
}
