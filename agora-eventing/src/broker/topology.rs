//! 拓扑声明
//!
//! 消费方拓扑由 `ServiceIdentity` 与绑定模式推导：
//! - 来源交换机 `agora.<service>.<domain>`（topic）→ 工作队列；
//! - 重试交换机（direct）→ 延迟队列，延迟队列的死信指向默认交换机 + 工作队列名，
//!   消息过期即回到工作队列；
//! - 死信交换机（direct）→ 死信队列。
//!
use crate::envelope::ServiceIdentity;
use crate::envelope::routing::{exchange_name, is_kebab_segment, validate_pattern};
use crate::error::{EventingError, EventingResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Topic,
    Direct,
    Fanout,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    /// 过期或被拒绝（不重入队）时转发到的交换机；空字符串为默认交换机
    pub dead_letter_exchange: Option<String>,
    pub dead_letter_routing_key: Option<String>,
}

impl QueueSpec {
    pub fn plain(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dead_letter_exchange: None,
            dead_letter_routing_key: None,
        }
    }
}

/// 队列与交换机之间的绑定
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub exchange: String,
    pub queue: String,
    pub pattern: String,
}

impl Binding {
    /// 根据模式推导来源交换机；模式前两段（service/domain）必须是字面量
    pub fn for_pattern(queue: impl Into<String>, pattern: &str) -> EventingResult<Self> {
        validate_pattern(pattern)?;
        let mut segments = pattern.split('.');
        let (Some(service), Some(domain)) = (segments.next(), segments.next()) else {
            return Err(EventingError::validation(format!(
                "binding pattern '{pattern}' must name a service and a domain"
            )));
        };
        if !is_kebab_segment(service) || !is_kebab_segment(domain) {
            return Err(EventingError::validation(format!(
                "binding pattern '{pattern}' must use literal service and domain segments"
            )));
        }
        Ok(Self {
            exchange: exchange_name(service, domain),
            queue: queue.into(),
            pattern: pattern.to_string(),
        })
    }
}

/// 一组需要声明的交换机、队列与绑定
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topology {
    pub exchanges: Vec<ExchangeSpec>,
    pub queues: Vec<QueueSpec>,
    pub bindings: Vec<Binding>,
}

impl Topology {
    /// 生产方只需声明自己的 topic 交换机
    pub fn for_producer(service: &str, domain: &str) -> Self {
        Self {
            exchanges: vec![ExchangeSpec {
                name: exchange_name(service, domain),
                kind: ExchangeKind::Topic,
            }],
            ..Default::default()
        }
    }

    pub fn for_consumer(identity: &ServiceIdentity, patterns: &[String]) -> EventingResult<Self> {
        let queue = identity.queue();
        let mut topology = Topology::default();

        for pattern in patterns {
            let binding = Binding::for_pattern(queue.clone(), pattern)?;
            topology.add_exchange(&binding.exchange, ExchangeKind::Topic);
            if !topology.bindings.contains(&binding) {
                topology.bindings.push(binding);
            }
        }
        topology.queues.push(QueueSpec::plain(queue.clone()));

        // 重试：retry 交换机 → 延迟队列 →（过期）→ 默认交换机 → 工作队列
        topology.add_exchange(&identity.retry_exchange(), ExchangeKind::Direct);
        topology.queues.push(QueueSpec {
            name: identity.delay_queue(),
            dead_letter_exchange: Some(String::new()),
            dead_letter_routing_key: Some(queue.clone()),
        });
        topology.bindings.push(Binding {
            exchange: identity.retry_exchange(),
            queue: identity.delay_queue(),
            pattern: queue,
        });

        // 死信
        topology.add_exchange(&identity.dlx(), ExchangeKind::Direct);
        topology.queues.push(QueueSpec::plain(identity.dlq()));
        topology.bindings.push(Binding {
            exchange: identity.dlx(),
            queue: identity.dlq(),
            pattern: identity.dlq(),
        });

        Ok(topology)
    }

    fn add_exchange(&mut self, name: &str, kind: ExchangeKind) {
        if !self.exchanges.iter().any(|e| e.name == name) {
            self.exchanges.push(ExchangeSpec {
                name: name.to_string(),
                kind,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn consumer_topology_wires_retry_and_dead_letter_paths() {
        let identity = ServiceIdentity::new("search", "catalog", "indexer").unwrap();
        let topology = Topology::for_consumer(
            &identity,
            &["product.item.*".to_string(), "product.item.published".to_string()],
        )
        .unwrap();

        let names: Vec<&str> = topology.exchanges.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["agora.product.item", "search.catalog.retry", "search.catalog.dlx"]
        );

        let delay = topology
            .queues
            .iter()
            .find(|q| q.name == "search.catalog.indexer-delay-queue")
            .unwrap();
        assert_eq!(delay.dead_letter_exchange.as_deref(), Some(""));
        assert_eq!(
            delay.dead_letter_routing_key.as_deref(),
            Some("search.catalog.indexer-queue")
        );
        assert!(topology.bindings.iter().any(|b| b.exchange == "search.catalog.dlx"
            && b.queue == "search.catalog.dlq"
            && b.pattern == "search.catalog.dlq"));
    }

    #[test]
    fn wildcard_service_or_domain_cannot_pick_an_exchange() {
        assert!(Binding::for_pattern("q", "*.item.published").is_err());
        assert!(Binding::for_pattern("q", "product.#").is_err());
        assert!(Binding::for_pattern("q", "product.item.#").is_ok());
    }
}
