//! 进程级 broker 会话
//!
//! 启动时建立一次，关闭时拆除一次；句柄显式传给发布器与消费运行时。
//! 发布与消费使用同一连接上的不同通道，消费侧背压不会阻塞发布，反之亦然。

use crate::broker::{BrokerChannel, BrokerConnection};
use crate::error::EventingResult;
use crate::publisher::Publisher;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

pub struct BrokerSession {
    connection: Arc<dyn BrokerConnection>,
    publish_channel: Arc<dyn BrokerChannel>,
    consumer_channels: Mutex<Vec<Arc<dyn BrokerChannel>>>,
}

impl BrokerSession {
    /// 建立会话并开通专用发布通道
    pub async fn open(connection: Arc<dyn BrokerConnection>) -> EventingResult<Self> {
        let publish_channel = connection.open_channel().await?;
        info!("broker session opened");
        Ok(Self {
            connection,
            publish_channel,
            consumer_channels: Mutex::new(Vec::new()),
        })
    }

    pub fn connection(&self) -> &Arc<dyn BrokerConnection> {
        &self.connection
    }

    /// 为一个消费运行时开通独立通道
    pub async fn consumer_channel(&self) -> EventingResult<Arc<dyn BrokerChannel>> {
        let channel = self.connection.open_channel().await?;
        self.consumer_channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(channel.clone());
        Ok(channel)
    }

    /// 以 `service` 为生产方的发布器，共享发布通道
    pub fn publisher(&self, service: impl Into<String>) -> Publisher {
        Publisher::new(self.publish_channel.clone(), service)
    }

    /// 依次关闭消费通道、发布通道与连接
    pub async fn shutdown(&self) -> EventingResult<()> {
        let consumers: Vec<_> = self
            .consumer_channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for channel in consumers {
            if let Err(err) = channel.close().await {
                warn!(error = %err, "failed to close consumer channel");
            }
        }
        self.publish_channel.close().await?;
        self.connection.close().await?;
        info!("broker session closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{InMemoryBroker, Topology};

    #[tokio::test]
    async fn shutdown_closes_every_channel() {
        let broker = InMemoryBroker::new();
        let session = BrokerSession::open(Arc::new(broker.clone())).await.unwrap();
        let consumer = session.consumer_channel().await.unwrap();
        let publisher = session.publisher("product");
        publisher.declare_exchange("item").await.unwrap();

        session.shutdown().await.unwrap();
        assert!(consumer.declare(&Topology::default()).await.is_err());
        assert!(publisher.declare_exchange("item").await.is_err());
        assert!(broker.open_channel().await.is_err());
    }
}
