mod support;

use agora_eventing::config::ConsumerConfig;
use agora_eventing::consumer::{EventHandler, handler_fn};
use agora_eventing::envelope::{Envelope, EventId, EventPayload, Headers, RoutingKey};
use agora_eventing::error::{ErrorKind, HandlerError};
use agora_eventing::metrics::Operation;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use support::{Harness, ItemPublished, wait_until};
use tokio::sync::Notify;
use tokio::time::Instant;

fn backoff_config(max_retries: u32, max_delay: Duration) -> ConsumerConfig {
    ConsumerConfig {
        concurrency: 1,
        max_retries,
        base_delay: Duration::from_secs(1),
        max_delay,
        ..Default::default()
    }
}

/// 前 `failures` 次调用以临时错误失败，记录每次调用的时刻
fn flaky(
    failures: usize,
    calls: Arc<Mutex<Vec<Instant>>>,
) -> Arc<dyn EventHandler> {
    handler_fn("indexer", ItemPublished::ROUTING_KEY, move |_ctx| {
        let calls = calls.clone();
        async move {
            let n = {
                let mut calls = calls.lock().unwrap();
                calls.push(Instant::now());
                calls.len()
            };
            if n <= failures {
                Err(HandlerError::transient(anyhow::anyhow!("index unavailable")))
            } else {
                Ok(())
            }
        }
    })
}

fn gaps(calls: &[Instant]) -> Vec<Duration> {
    calls.windows(2).map(|w| w[1] - w[0]).collect()
}

fn assert_close(actual: Duration, expected: Duration) {
    let diff = if actual > expected {
        actual - expected
    } else {
        expected - actual
    };
    assert!(
        diff <= Duration::from_millis(100),
        "expected ~{expected:?}, got {actual:?}"
    );
}

fn fixed_envelope() -> Envelope {
    let mut envelope = Envelope::new(
        "product",
        RoutingKey::parse("product.item.published").unwrap(),
        1,
        json!({"sku": "A-1"}),
        Headers::new("product"),
    );
    envelope.event_id = EventId::parse("4f0f09ff-6f1c-4d3e-9a51-0c2e7399b7d1").unwrap();
    envelope
}

#[tokio::test(start_paused = true)]
async fn transient_failures_back_off_exponentially_then_dead_letter() {
    let h = Harness::new().await;
    let calls = Arc::new(Mutex::new(Vec::new()));
    let handle = h
        .start(
            vec![flaky(usize::MAX, calls.clone())],
            backoff_config(3, Duration::from_secs(8)),
        )
        .await;

    let envelope = fixed_envelope();
    h.publisher.publish(&envelope).await.unwrap();
    wait_until(|| h.dlq_depth() == 1).await;

    let calls = calls.lock().unwrap().clone();
    assert_eq!(calls.len(), 4);
    let gaps = gaps(&calls);
    for (actual, secs) in gaps.iter().zip([1, 2, 4]) {
        assert_close(*actual, Duration::from_secs(secs));
    }

    let dead = h.dead_letters();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].retry_count, 3);
    assert_eq!(dead[0].error.kind, ErrorKind::Handler);
    assert!(dead[0].error.message.contains("index unavailable"));
    let original = dead[0].envelope().unwrap();
    assert_eq!(original.event_id.to_string(), "4f0f09ff-6f1c-4d3e-9a51-0c2e7399b7d1");
    assert_eq!(original.payload, json!({"sku": "A-1"}));

    let snap = h.metrics.snapshot();
    assert_eq!(snap.retried, 3);
    assert_eq!(snap.dead_lettered, 1);
    assert_eq!(snap.failed, 4);
    assert_eq!(snap.processed, 0);
    assert_eq!(h.broker.queue_depth(&h.identity.queue()), 0);
    assert_eq!(h.broker.queue_depth(&h.identity.delay_queue()), 0);
    handle.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn backoff_is_capped_at_max_delay() {
    let h = Harness::new().await;
    let calls = Arc::new(Mutex::new(Vec::new()));
    let handle = h
        .start(
            vec![flaky(usize::MAX, calls.clone())],
            backoff_config(4, Duration::from_secs(2)),
        )
        .await;

    h.publisher.publish(&fixed_envelope()).await.unwrap();
    wait_until(|| h.dlq_depth() == 1).await;

    let calls = calls.lock().unwrap().clone();
    assert_eq!(calls.len(), 5);
    for (actual, secs) in gaps(&calls).iter().zip([1, 2, 2, 2]) {
        assert_close(*actual, Duration::from_secs(secs));
    }
    assert_eq!(h.dead_letters()[0].retry_count, 4);
    handle.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn a_retry_that_succeeds_is_processed_once() {
    let h = Harness::new().await;
    let calls = Arc::new(Mutex::new(Vec::new()));
    let handle = h
        .start(
            vec![flaky(2, calls.clone())],
            backoff_config(3, Duration::from_secs(8)),
        )
        .await;

    h.publisher.publish(&fixed_envelope()).await.unwrap();
    wait_until(|| h.metrics.snapshot().processed == 1).await;

    assert_eq!(calls.lock().unwrap().len(), 3);
    let snap = h.metrics.snapshot();
    assert_eq!(snap.retried, 2);
    assert_eq!(snap.dead_lettered, 0);
    assert_eq!(h.dlq_depth(), 0);
    handle.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn failing_retry_publish_falls_back_to_requeue() {
    let h = Harness::new().await;
    h.broker.fail_exchange(&h.identity.retry_exchange(), true);

    let calls = Arc::new(AtomicUsize::new(0));
    let handler = {
        let calls = calls.clone();
        handler_fn("indexer", ItemPublished::ROUTING_KEY, move |ctx| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                if ctx.redelivered {
                    Ok(())
                } else {
                    Err(HandlerError::transient(anyhow::anyhow!("index unavailable")))
                }
            }
        })
    };
    let handle = h
        .start(vec![handler], backoff_config(3, Duration::from_secs(8)))
        .await;

    h.publisher.publish(&fixed_envelope()).await.unwrap();
    wait_until(|| h.metrics.snapshot().processed == 1).await;

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    let snap = h.metrics.snapshot();
    assert_eq!(snap.retried, 0);
    assert_eq!(snap.dead_lettered, 0);
    handle.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn in_progress_duplicates_are_deferred_not_run_twice() {
    let h = Harness::new().await;
    let calls = Arc::new(AtomicUsize::new(0));
    let gate = Arc::new(Notify::new());
    let handler = {
        let calls = calls.clone();
        let gate = gate.clone();
        handler_fn("indexer", ItemPublished::ROUTING_KEY, move |_ctx| {
            let calls = calls.clone();
            let gate = gate.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    gate.notified().await;
                }
                Ok(())
            }
        })
    };
    let handle = h
        .start(
            vec![handler],
            ConsumerConfig {
                concurrency: 2,
                ..Default::default()
            },
        )
        .await;

    let envelope = fixed_envelope();
    h.publisher.publish(&envelope).await.unwrap();
    h.publisher.publish(&envelope).await.unwrap();

    // 第二份副本遇到 InProgress，经延迟队列延后并确认
    wait_until(|| h.metrics.snapshot().count_of(Operation::Ack) == 1).await;
    gate.notify_one();

    // 第一份完成后确认；延后的副本回到队列，命中 Succeeded 后确认
    wait_until(|| h.metrics.snapshot().count_of(Operation::Ack) == 3).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.metrics.snapshot().processed, 1);
    assert_eq!(h.metrics.snapshot().retried, 0);
    assert_eq!(h.dlq_depth(), 0);
    handle.stop().await.unwrap();
}
