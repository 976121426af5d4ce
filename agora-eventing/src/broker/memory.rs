//! 内存版 broker（InMemoryBroker）
//!
//! 用于测试、示例与本地开发，模拟运行时依赖的 broker 语义：
//! - topic / direct / fanout 交换机，默认交换机 `""` 按队列名路由；
//! - 独占消费、prefetch 上限、ack / reject(requeue)；
//! - 带死信交换机的队列上，单条消息过期后被转发（延迟重试依赖于此）；
//! - 通道关闭时，其未确认消息以 redelivered 身份回到队首。
//!
//! 注意：消息过期只在声明了死信交换机的队列上生效，这类队列约定不挂消费者。

use super::{
    BrokerChannel, BrokerConnection, Delivery, ExchangeKind, PublishOptions, Topology,
    WireMessage,
};
use crate::envelope::routing::matches_pattern;
use crate::error::{EventingError, EventingResult};
use async_trait::async_trait;
use futures_core::stream::BoxStream;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;

/// 内存 broker；克隆共享同一份状态
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<Mutex<BrokerState>>,
}

#[derive(Default)]
struct BrokerState {
    closed: bool,
    exchanges: HashMap<String, ExchangeState>,
    queues: HashMap<String, QueueState>,
    /// delivery tag → 队列名
    tags: HashMap<u64, String>,
    next_tag: u64,
    next_channel: u64,
    failing: HashSet<String>,
}

struct ExchangeState {
    kind: ExchangeKind,
    /// (模式, 队列)
    bindings: Vec<(String, String)>,
}

struct QueueState {
    dead_letter_exchange: Option<String>,
    dead_letter_routing_key: Option<String>,
    ready: VecDeque<Stored>,
    unacked: HashMap<u64, Stored>,
    notify: Arc<Notify>,
    consumer: Option<u64>,
    prefetch: u16,
}

#[derive(Clone)]
struct Stored {
    exchange: String,
    routing_key: String,
    message: WireMessage,
    redelivered: bool,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 队列中待投递（未被取走）的消息数
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.state()
            .queues
            .get(queue)
            .map(|q| q.ready.len())
            .unwrap_or(0)
    }

    /// 已投递但未确认的消息数
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.state()
            .queues
            .get(queue)
            .map(|q| q.unacked.len())
            .unwrap_or(0)
    }

    /// 取走队列中全部待投递消息（用于排空死信队列等场景）
    pub fn drain_queue(&self, queue: &str) -> Vec<WireMessage> {
        self.state()
            .queues
            .get_mut(queue)
            .map(|q| q.ready.drain(..).map(|s| s.message).collect())
            .unwrap_or_default()
    }

    /// 模拟到某交换机的发布失败（如连接中断）
    pub fn fail_exchange(&self, exchange: &str, failing: bool) {
        let mut state = self.state();
        if failing {
            state.failing.insert(exchange.to_string());
        } else {
            state.failing.remove(exchange);
        }
    }

    fn route(state: &BrokerState, exchange: &str, routing_key: &str) -> Option<Vec<String>> {
        if exchange.is_empty() {
            return Some(
                state
                    .queues
                    .contains_key(routing_key)
                    .then(|| routing_key.to_string())
                    .into_iter()
                    .collect(),
            );
        }

        let ex = state.exchanges.get(exchange)?;
        let mut targets: Vec<String> = Vec::new();
        for (pattern, queue) in &ex.bindings {
            let hit = match ex.kind {
                ExchangeKind::Topic => matches_pattern(pattern, routing_key),
                ExchangeKind::Direct => pattern == routing_key,
                ExchangeKind::Fanout => true,
            };
            if hit && !targets.contains(queue) {
                targets.push(queue.clone());
            }
        }
        Some(targets)
    }

    fn enqueue(
        &self,
        state: &mut BrokerState,
        queue: &str,
        stored: Stored,
        expiration: Option<Duration>,
    ) {
        let Some(q) = state.queues.get_mut(queue) else {
            return;
        };

        match expiration {
            Some(ttl) if q.dead_letter_exchange.is_some() => {
                let broker = self.clone();
                let queue = queue.to_string();
                tokio::spawn(async move {
                    tokio::time::sleep(ttl).await;
                    let mut state = broker.state();
                    broker.dead_letter(&mut state, &queue, stored);
                });
            }
            _ => {
                q.ready.push_back(stored);
                q.notify.notify_one();
            }
        }
    }

    /// 按队列的死信设置转发；未配置死信交换机时丢弃
    fn dead_letter(&self, state: &mut BrokerState, queue: &str, stored: Stored) {
        let Some(q) = state.queues.get(queue) else {
            return;
        };
        let Some(dlx) = q.dead_letter_exchange.clone() else {
            return;
        };
        let routing_key = q
            .dead_letter_routing_key
            .clone()
            .unwrap_or_else(|| stored.routing_key.clone());

        for target in Self::route(state, &dlx, &routing_key).unwrap_or_default() {
            let forwarded = Stored {
                exchange: dlx.clone(),
                routing_key: routing_key.clone(),
                message: stored.message.clone(),
                redelivered: false,
            };
            self.enqueue(state, &target, forwarded, None);
        }
    }

    /// 释放某通道持有的消费者，未确认消息回到队首
    fn release_consumer(state: &mut BrokerState, channel_id: Option<u64>) {
        let BrokerState { queues, tags, .. } = state;
        for q in queues.values_mut() {
            let owned = match channel_id {
                Some(id) => q.consumer == Some(id),
                None => q.consumer.is_some(),
            };
            if !owned {
                continue;
            }
            q.consumer = None;
            let mut pending: Vec<(u64, Stored)> = q.unacked.drain().collect();
            pending.sort_by_key(|(tag, _)| std::cmp::Reverse(*tag));
            for (tag, mut stored) in pending {
                tags.remove(&tag);
                stored.redelivered = true;
                q.ready.push_front(stored);
            }
            q.notify.notify_one();
        }
    }
}

#[async_trait]
impl BrokerConnection for InMemoryBroker {
    async fn open_channel(&self) -> EventingResult<Arc<dyn BrokerChannel>> {
        let mut state = self.state();
        if state.closed {
            return Err(EventingError::transport("connection closed"));
        }
        state.next_channel += 1;
        Ok(Arc::new(InMemoryChannel {
            broker: self.clone(),
            id: state.next_channel,
            closed: AtomicBool::new(false),
        }))
    }

    async fn close(&self) -> EventingResult<()> {
        let mut state = self.state();
        state.closed = true;
        Self::release_consumer(&mut state, None);
        Ok(())
    }
}

/// 内存 broker 上的通道
pub struct InMemoryChannel {
    broker: InMemoryBroker,
    id: u64,
    closed: AtomicBool,
}

impl InMemoryChannel {
    /// 取出下一条可投递消息；窗口已满或队列为空时返回需等待的通知；消费者已变更时返回 `None`
    fn next_ready(
        broker: &InMemoryBroker,
        queue: &str,
        channel_id: u64,
    ) -> Option<Result<Delivery, Arc<Notify>>> {
        let mut guard = broker.state();
        let state = &mut *guard;
        let q = state.queues.get_mut(queue)?;
        if q.consumer != Some(channel_id) {
            return None;
        }
        let window_open = q.prefetch == 0 || q.unacked.len() < usize::from(q.prefetch);
        let Some(stored) = window_open.then(|| q.ready.pop_front()).flatten() else {
            return Some(Err(q.notify.clone()));
        };

        state.next_tag += 1;
        let tag = state.next_tag;
        q.unacked.insert(tag, stored.clone());
        state.tags.insert(tag, queue.to_string());
        Some(Ok(Delivery {
            delivery_tag: tag,
            exchange: stored.exchange,
            routing_key: stored.routing_key,
            redelivered: stored.redelivered,
            message: stored.message,
        }))
    }

    fn ensure_open(&self, state: &BrokerState) -> EventingResult<()> {
        if state.closed {
            return Err(EventingError::transport("connection closed"));
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(EventingError::transport("channel closed"));
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerChannel for InMemoryChannel {
    async fn declare(&self, topology: &Topology) -> EventingResult<()> {
        let mut state = self.broker.state();
        self.ensure_open(&state)?;

        for ex in &topology.exchanges {
            match state.exchanges.get(&ex.name) {
                Some(existing) if existing.kind != ex.kind => {
                    return Err(EventingError::transport(format!(
                        "exchange '{}' already declared with a different kind",
                        ex.name
                    )));
                }
                Some(_) => {}
                None => {
                    state.exchanges.insert(
                        ex.name.clone(),
                        ExchangeState {
                            kind: ex.kind,
                            bindings: Vec::new(),
                        },
                    );
                }
            }
        }

        for spec in &topology.queues {
            state
                .queues
                .entry(spec.name.clone())
                .or_insert_with(|| QueueState {
                    dead_letter_exchange: spec.dead_letter_exchange.clone(),
                    dead_letter_routing_key: spec.dead_letter_routing_key.clone(),
                    ready: VecDeque::new(),
                    unacked: HashMap::new(),
                    notify: Arc::new(Notify::new()),
                    consumer: None,
                    prefetch: 0,
                });
        }

        for binding in &topology.bindings {
            if !state.queues.contains_key(&binding.queue) {
                return Err(EventingError::transport(format!(
                    "cannot bind unknown queue '{}'",
                    binding.queue
                )));
            }
            let Some(ex) = state.exchanges.get_mut(&binding.exchange) else {
                return Err(EventingError::transport(format!(
                    "cannot bind to unknown exchange '{}'",
                    binding.exchange
                )));
            };
            let entry = (binding.pattern.clone(), binding.queue.clone());
            if !ex.bindings.contains(&entry) {
                ex.bindings.push(entry);
            }
        }

        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: WireMessage,
        options: PublishOptions,
    ) -> EventingResult<()> {
        let mut state = self.broker.state();
        self.ensure_open(&state)?;
        if state.failing.contains(exchange) {
            return Err(EventingError::transport(format!(
                "broker unreachable while publishing to '{exchange}'"
            )));
        }

        let Some(targets) = InMemoryBroker::route(&state, exchange, routing_key) else {
            return Err(EventingError::transport(format!(
                "no exchange '{exchange}'"
            )));
        };

        for queue in targets {
            let stored = Stored {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                message: message.clone(),
                redelivered: false,
            };
            self.broker
                .enqueue(&mut state, &queue, stored, options.expiration);
        }
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        prefetch: u16,
    ) -> EventingResult<BoxStream<'static, EventingResult<Delivery>>> {
        {
            let mut state = self.broker.state();
            self.ensure_open(&state)?;
            let Some(q) = state.queues.get_mut(queue) else {
                return Err(EventingError::transport(format!("no queue '{queue}'")));
            };
            if q.consumer.is_some() {
                return Err(EventingError::transport(format!(
                    "queue '{queue}' already has an exclusive consumer"
                )));
            }
            q.consumer = Some(self.id);
            q.prefetch = prefetch;
        }

        let channel_id = self.id;
        let stream = futures_util::stream::unfold(
            (self.broker.clone(), queue.to_string()),
            move |(broker, queue)| async move {
                loop {
                    let notify = match InMemoryChannel::next_ready(&broker, &queue, channel_id)? {
                        Ok(delivery) => return Some((Ok(delivery), (broker, queue))),
                        Err(notify) => notify,
                    };
                    notify.notified().await;
                }
            },
        );

        Ok(Box::pin(stream))
    }

    async fn ack(&self, delivery_tag: u64) -> EventingResult<()> {
        let mut guard = self.broker.state();
        self.ensure_open(&guard)?;
        let state = &mut *guard;
        let Some(queue) = state.tags.remove(&delivery_tag) else {
            return Err(EventingError::transport(format!(
                "unknown delivery tag {delivery_tag}"
            )));
        };
        if let Some(q) = state.queues.get_mut(&queue) {
            q.unacked.remove(&delivery_tag);
            q.notify.notify_one();
        }
        Ok(())
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> EventingResult<()> {
        let mut guard = self.broker.state();
        self.ensure_open(&guard)?;
        let state = &mut *guard;
        let Some(queue) = state.tags.remove(&delivery_tag) else {
            return Err(EventingError::transport(format!(
                "unknown delivery tag {delivery_tag}"
            )));
        };
        let Some(q) = state.queues.get_mut(&queue) else {
            return Ok(());
        };
        let Some(mut stored) = q.unacked.remove(&delivery_tag) else {
            return Ok(());
        };

        if requeue {
            stored.redelivered = true;
            q.ready.push_back(stored);
            q.notify.notify_one();
        } else {
            q.notify.notify_one();
            self.broker.dead_letter(state, &queue, stored);
        }
        Ok(())
    }

    async fn close(&self) -> EventingResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut state = self.broker.state();
        InMemoryBroker::release_consumer(&mut state, Some(self.id));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Binding, ExchangeSpec, QueueSpec};
    use futures_util::StreamExt;

    fn msg(body: &str) -> WireMessage {
        WireMessage::new(body.as_bytes().to_vec(), Default::default())
    }

    fn topic_topology() -> Topology {
        Topology {
            exchanges: vec![ExchangeSpec {
                name: "agora.product.item".into(),
                kind: ExchangeKind::Topic,
            }],
            queues: vec![QueueSpec::plain("work"), QueueSpec::plain("audit")],
            bindings: vec![
                Binding {
                    exchange: "agora.product.item".into(),
                    queue: "work".into(),
                    pattern: "product.item.published".into(),
                },
                Binding {
                    exchange: "agora.product.item".into(),
                    queue: "audit".into(),
                    pattern: "product.#".into(),
                },
            ],
        }
    }

    #[tokio::test]
    async fn topic_exchange_routes_by_pattern() {
        let broker = InMemoryBroker::new();
        let ch = broker.open_channel().await.unwrap();
        ch.declare(&topic_topology()).await.unwrap();

        ch.publish("agora.product.item", "product.item.published", msg("a"), Default::default())
            .await
            .unwrap();
        ch.publish("agora.product.item", "product.item.deleted", msg("b"), Default::default())
            .await
            .unwrap();

        assert_eq!(broker.queue_depth("work"), 1);
        assert_eq!(broker.queue_depth("audit"), 2);
        assert!(
            ch.publish("agora.missing.x", "a.b.c", msg("c"), Default::default())
                .await
                .is_err()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn expired_messages_are_dead_lettered_back_to_the_work_queue() {
        let broker = InMemoryBroker::new();
        let ch = broker.open_channel().await.unwrap();
        let mut topology = Topology::default();
        topology.exchanges.push(ExchangeSpec {
            name: "retry".into(),
            kind: ExchangeKind::Direct,
        });
        topology.queues.push(QueueSpec::plain("work"));
        topology.queues.push(QueueSpec {
            name: "delay".into(),
            dead_letter_exchange: Some(String::new()),
            dead_letter_routing_key: Some("work".into()),
        });
        topology.bindings.push(Binding {
            exchange: "retry".into(),
            queue: "delay".into(),
            pattern: "work".into(),
        });
        ch.declare(&topology).await.unwrap();

        ch.publish(
            "retry",
            "work",
            msg("later"),
            PublishOptions::delayed(Duration::from_secs(2)),
        )
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(1900)).await;
        assert_eq!(broker.queue_depth("work"), 0);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(broker.queue_depth("work"), 1);
    }

    #[tokio::test]
    async fn closing_a_channel_requeues_unacked_deliveries() {
        let broker = InMemoryBroker::new();
        let ch = broker.open_channel().await.unwrap();
        ch.declare(&topic_topology()).await.unwrap();
        ch.publish("agora.product.item", "product.item.published", msg("a"), Default::default())
            .await
            .unwrap();

        let consumer = broker.open_channel().await.unwrap();
        let mut stream = consumer.consume("work", 1).await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert!(!first.redelivered);
        assert_eq!(broker.unacked_count("work"), 1);

        consumer.close().await.unwrap();
        assert!(stream.next().await.is_none());
        assert_eq!(broker.queue_depth("work"), 1);

        let again = broker.open_channel().await.unwrap();
        let mut stream = again.consume("work", 1).await.unwrap();
        let redelivered = stream.next().await.unwrap().unwrap();
        assert!(redelivered.redelivered);
        again.ack(redelivered.delivery_tag).await.unwrap();
        assert_eq!(broker.unacked_count("work"), 0);
    }

    #[tokio::test]
    async fn prefetch_window_holds_deliveries_until_ack() {
        let broker = InMemoryBroker::new();
        let ch = broker.open_channel().await.unwrap();
        ch.declare(&topic_topology()).await.unwrap();
        for body in ["a", "b"] {
            ch.publish("agora.product.item", "product.item.published", msg(body), Default::default())
                .await
                .unwrap();
        }

        let consumer = broker.open_channel().await.unwrap();
        let mut stream = consumer.consume("work", 1).await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.message.body, b"a".to_vec());
        assert!(
            tokio::time::timeout(Duration::from_millis(50), stream.next())
                .await
                .is_err()
        );
        assert_eq!(broker.queue_depth("work"), 1);

        consumer.ack(first.delivery_tag).await.unwrap();
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second.message.body, b"b".to_vec());
        assert_eq!(broker.queue_depth("work"), 0);
    }

    #[tokio::test]
    async fn queues_allow_a_single_consumer() {
        let broker = InMemoryBroker::new();
        let ch = broker.open_channel().await.unwrap();
        ch.declare(&topic_topology()).await.unwrap();
        let _stream = ch.consume("work", 4).await.unwrap();
        let other = broker.open_channel().await.unwrap();
        assert!(other.consume("work", 4).await.is_err());
    }
}
