#![allow(dead_code)]

use agora_eventing::broker::{BrokerConnection, InMemoryBroker, WireMessage};
use agora_eventing::codec::EnvelopeCodec;
use agora_eventing::config::ConsumerConfig;
use agora_eventing::consumer::{ConsumerHandle, ConsumerRuntime, EventHandler};
use agora_eventing::dead_letter::DeadLetterEnvelope;
use agora_eventing::envelope::ServiceIdentity;
use agora_eventing::idempotency::InMemoryIdempotencyStore;
use agora_eventing::metrics::{InMemoryMetrics, MetricsRecorder};
use agora_eventing::publisher::Publisher;
use agora_eventing::session::BrokerSession;
use agora_macros::EventPayload;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, EventPayload)]
#[event(routing_key = "product.item.published")]
pub struct ItemPublished {
    pub sku: String,
}

pub struct Harness {
    pub broker: InMemoryBroker,
    pub session: BrokerSession,
    pub publisher: Publisher,
    pub identity: ServiceIdentity,
    pub metrics: Arc<InMemoryMetrics>,
    pub store: Arc<InMemoryIdempotencyStore>,
}

impl Harness {
    pub async fn new() -> Self {
        let broker = InMemoryBroker::new();
        let session = BrokerSession::open(Arc::new(broker.clone())).await.unwrap();
        let publisher = session.publisher("product");
        publisher.declare_exchange("item").await.unwrap();
        Self {
            broker,
            session,
            publisher,
            identity: ServiceIdentity::new("search", "catalog", "indexer").unwrap(),
            metrics: Arc::new(InMemoryMetrics::new()),
            store: Arc::new(InMemoryIdempotencyStore::new(
                Duration::from_secs(24 * 60 * 60),
                Duration::from_secs(5 * 60),
            )),
        }
    }

    pub async fn start(
        &self,
        handlers: Vec<Arc<dyn EventHandler>>,
        config: ConsumerConfig,
    ) -> ConsumerHandle {
        self.start_as(self.identity.clone(), self.store.clone(), handlers, config)
            .await
    }

    /// 以另一个服务身份（独立去重存储）启动消费者
    pub async fn start_as(
        &self,
        identity: ServiceIdentity,
        store: Arc<InMemoryIdempotencyStore>,
        handlers: Vec<Arc<dyn EventHandler>>,
        config: ConsumerConfig,
    ) -> ConsumerHandle {
        let runtime = ConsumerRuntime::builder()
            .channel(self.session.consumer_channel().await.unwrap())
            .publisher(self.publisher.clone())
            .identity(identity)
            .event_handlers(handlers)
            .idempotency(store)
            .metrics(self.metrics.clone() as Arc<dyn MetricsRecorder>)
            .config(config)
            .build();
        Arc::new(runtime).start().await.unwrap()
    }

    pub fn connection(&self) -> &dyn BrokerConnection {
        &self.broker
    }

    /// 取走死信队列中的全部死信
    pub fn dead_letters(&self) -> Vec<DeadLetterEnvelope> {
        let codec = EnvelopeCodec::new();
        self.broker
            .drain_queue(&self.identity.dlq())
            .iter()
            .map(|m: &WireMessage| codec.decode_dead_letter(m).unwrap())
            .collect()
    }

    pub fn dlq_depth(&self) -> usize {
        self.broker.queue_depth(&self.identity.dlq())
    }
}

pub fn config() -> ConsumerConfig {
    ConsumerConfig {
        concurrency: 1,
        ..Default::default()
    }
}

/// 轮询直到条件成立；暂停时钟下每次 sleep 会被自动推进
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..20_000 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not met in time");
}
