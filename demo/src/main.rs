use agora_eventing::broker::InMemoryBroker;
use agora_eventing::config::ConsumerConfig;
use agora_eventing::consumer::{ConsumerRuntime, DeliveryContext, Typed, TypedEventHandler};
use agora_eventing::dead_letter::DeadLetterRouter;
use agora_eventing::envelope::{Headers, ServiceIdentity};
use agora_eventing::error::HandlerError;
use agora_eventing::idempotency::InMemoryIdempotencyStore;
use agora_eventing::metrics::{InMemoryMetrics, MetricsRecorder, MetricsSnapshot};
use agora_eventing::session::BrokerSession;
use agora_macros::EventPayload;
use async_trait::async_trait;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "agora-demo", about = "Publish, consume, retry and redrive events in memory")]
struct Cli {
    /// 发布的事件数量
    #[arg(long, env = "AGORA_DEMO_EVENTS", default_value_t = 6)]
    events: usize,
    #[arg(long, env = "AGORA_DEMO_MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,
    /// 首次重试的等待时长（毫秒）
    #[arg(long, env = "AGORA_DEMO_BASE_DELAY_MS", default_value_t = 200)]
    base_delay_ms: u64,
    #[arg(long, env = "AGORA_DEMO_CONCURRENCY", default_value_t = 4)]
    concurrency: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, EventPayload)]
#[event(routing_key = "product.item.published", version = 1)]
struct ItemPublished {
    sku: String,
    price_cents: u64,
}

/// 搜索索引：`flaky-*` 首次失败后重试成功；`retired-*` 在目录修复前永久失败
struct SearchIndexer {
    catalog_repaired: Arc<AtomicBool>,
}

#[async_trait]
impl TypedEventHandler<ItemPublished> for SearchIndexer {
    async fn handle(&self, event: ItemPublished, ctx: &DeliveryContext) -> Result<(), HandlerError> {
        if event.sku.starts_with("flaky-") && ctx.attempt == 0 {
            return Err(HandlerError::transient(anyhow::anyhow!(
                "search cluster busy"
            )));
        }
        if event.sku.starts_with("retired-") && !self.catalog_repaired.load(Ordering::SeqCst) {
            return Err(HandlerError::permanent(anyhow::anyhow!(
                "sku {} missing from catalog",
                event.sku
            )));
        }
        info!(
            sku = %event.sku,
            price_cents = event.price_cents,
            attempt = ctx.attempt,
            "item indexed"
        );
        Ok(())
    }

    fn handler_name(&self) -> &str {
        "search-indexer"
    }
}

fn sku_for(n: usize) -> String {
    match n % 3 {
        0 => format!("plain-{n}"),
        1 => format!("flaky-{n}"),
        _ => format!("retired-{n}"),
    }
}

async fn wait_for(
    metrics: &InMemoryMetrics,
    timeout: Duration,
    cond: impl Fn(&MetricsSnapshot) -> bool,
) -> anyhow::Result<MetricsSnapshot> {
    let polling = async {
        loop {
            let snapshot = metrics.snapshot();
            if cond(&snapshot) {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    };
    tokio::time::timeout(timeout, polling)
        .await
        .map_err(|_| anyhow::anyhow!("events not settled within {timeout:?}"))
}

const LOG_ENV: &str = "AGORA_LOG";

/// 日志过滤：读取 `AGORA_LOG`，缺省为 `info`
fn log_filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(log_filter()).init();

    let cli = Cli::parse();
    let config = ConsumerConfig {
        max_retries: cli.max_retries,
        base_delay: Duration::from_millis(cli.base_delay_ms),
        max_delay: Duration::from_millis(cli.base_delay_ms).saturating_mul(8),
        concurrency: cli.concurrency,
        shutdown_grace: Duration::from_secs(5),
        ..Default::default()
    };

    let broker = InMemoryBroker::new();
    let session = BrokerSession::open(Arc::new(broker.clone())).await?;
    let metrics = Arc::new(InMemoryMetrics::new());
    let publisher = session
        .publisher("product")
        .with_metrics(metrics.clone() as Arc<dyn MetricsRecorder>);
    publisher.declare_exchange("item").await?;

    let identity = ServiceIdentity::new("search", "catalog", "indexer")?;
    let catalog_repaired = Arc::new(AtomicBool::new(false));
    let runtime = ConsumerRuntime::builder()
        .channel(session.consumer_channel().await?)
        .publisher(publisher.clone())
        .identity(identity.clone())
        .event_handlers(vec![
            Typed::<ItemPublished, _>::new(SearchIndexer {
                catalog_repaired: catalog_repaired.clone(),
            })
            .into_handler(),
        ])
        .idempotency(Arc::new(InMemoryIdempotencyStore::new(
            config.dedup_retention_window,
            config.in_progress_ttl,
        )))
        .metrics(metrics.clone() as Arc<dyn MetricsRecorder>)
        .config(config)
        .build();
    let handle = Arc::new(runtime).start().await?;

    for n in 0..cli.events {
        let event = ItemPublished {
            sku: sku_for(n),
            price_cents: 1_000 + n as u64 * 250,
        };
        let headers = Headers::new("product").with_tenant_id("store-7");
        let event_id = publisher.publish_event(&event, headers).await?;
        info!(event_id = %event_id, sku = %event.sku, "published");
    }

    let retired = (0..cli.events).filter(|n| n % 3 == 2).count() as u64;
    let healthy = cli.events as u64 - retired;
    let settled = wait_for(&metrics, Duration::from_secs(30), |s| {
        s.processed == healthy && s.dead_lettered == retired
    })
    .await?;
    info!(
        processed = settled.processed,
        retried = settled.retried,
        dead_lettered = settled.dead_lettered,
        "first pass settled"
    );

    // 修复目录后重放死信
    catalog_repaired.store(true, Ordering::SeqCst);
    let router = DeadLetterRouter::new(publisher.clone(), identity.clone());
    let replayed = router
        .redrive(session.connection().as_ref(), usize::MAX, Duration::from_millis(500))
        .await?;
    info!(replayed, "dead letters redriven");

    let settled = wait_for(&metrics, Duration::from_secs(30), |s| {
        s.processed == cli.events as u64
    })
    .await?;
    info!(
        processed = settled.processed,
        failed = settled.failed,
        retried = settled.retried,
        dead_lettered = settled.dead_lettered,
        "all events indexed"
    );

    handle.stop().await?;
    session.shutdown().await?;
    Ok(())
}
