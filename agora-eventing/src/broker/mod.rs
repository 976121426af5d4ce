//! Broker 传输协议
//!
//! 运行时只依赖下面两个抽象，不绑定具体 broker：
//! - `BrokerConnection`：进程级长连接，只负责开通道与关闭；
//! - `BrokerChannel`：声明拓扑、确认式发布、独占消费、ack/reject。
//!
//! 发布与消费使用同一连接上的不同通道，互不因流控阻塞。
//! 内置 `InMemoryBroker` 用于测试与本地开发；启用 `amqp` 特性后提供基于 lapin 的实现。
//!
use crate::envelope::TransportHeaders;
use crate::error::EventingResult;
use async_trait::async_trait;
use futures_core::stream::BoxStream;
use std::sync::Arc;
use std::time::Duration;

mod memory;
mod topology;

#[cfg(feature = "amqp")]
pub mod amqp;

pub use memory::{InMemoryBroker, InMemoryChannel};
pub use topology::{Binding, ExchangeKind, ExchangeSpec, QueueSpec, Topology};

/// 线上消息：消息体 + 带外头部
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WireMessage {
    pub body: Vec<u8>,
    pub headers: TransportHeaders,
}

impl WireMessage {
    pub fn new(body: Vec<u8>, headers: TransportHeaders) -> Self {
        Self { body, headers }
    }
}

/// 发布选项
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishOptions {
    /// 单条消息过期时间；配合队列的死信交换机可作为延迟原语
    pub expiration: Option<Duration>,
}

impl PublishOptions {
    pub fn delayed(delay: Duration) -> Self {
        Self {
            expiration: Some(delay),
        }
    }
}

/// broker 投递给消费者的一条消息
#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub message: WireMessage,
}

/// 进程级 broker 连接
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// 在该连接上开一个新通道
    async fn open_channel(&self) -> EventingResult<Arc<dyn BrokerChannel>>;

    async fn close(&self) -> EventingResult<()>;
}

/// broker 通道
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// 幂等声明交换机、队列与绑定
    async fn declare(&self, topology: &Topology) -> EventingResult<()>;

    /// 发布并等待 broker 确认
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: WireMessage,
        options: PublishOptions,
    ) -> EventingResult<()>;

    /// 独占消费队列；`prefetch` 为未确认消息上限
    async fn consume(
        &self,
        queue: &str,
        prefetch: u16,
    ) -> EventingResult<BoxStream<'static, EventingResult<Delivery>>>;

    async fn ack(&self, delivery_tag: u64) -> EventingResult<()>;

    /// 拒绝消息；`requeue = false` 时由队列的死信设置决定去向
    async fn reject(&self, delivery_tag: u64, requeue: bool) -> EventingResult<()>;

    async fn close(&self) -> EventingResult<()>;
}
