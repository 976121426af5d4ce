//! 消费运行时（ConsumerRuntime）
//!
//! 每条投递由一个 worker 端到端处理：解码 → 去重 → 处理 → 确认。
//! - 解码失败：原样进入死信并确认，不触达处理器、不计重试；
//! - 去重命中 `Succeeded`：直接确认；命中 `InProgress`：按 `InProgressPolicy` 延后；
//! - 处理成功：标记成功并确认；
//! - 处理失败：永久错误或重试耗尽进入死信，否则交给重试调度器；
//! - 死信发布失败为致命错误：消息重入队，运行时停止接收新投递，错误经
//!   `ConsumerHandle::join` 返回。
//!
use super::{DeliveryContext, EventHandler, HandlerRegistry};
use crate::broker::{BrokerChannel, Delivery, Topology};
use crate::codec::EnvelopeCodec;
use crate::config::{ConsumerConfig, InProgressPolicy};
use crate::dead_letter::{DeadLetterRouter, ErrorInfo};
use crate::envelope::{Envelope, ServiceIdentity};
use crate::error::{EventingError, EventingResult, FailureClass, HandlerError};
use crate::idempotency::{DedupStatus, IdempotencyStore};
use crate::metrics::{MetricsRecorder, NoopMetrics, Operation};
use crate::publisher::Publisher;
use crate::retry::{BrokerDelayScheduler, RetryPolicy, RetryScheduler, RetryState};
use crate::trace::{TraceContext, TracePropagator, W3cTraceContextPropagator};
use bon::Builder;
use futures_util::{FutureExt, StreamExt};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

// 导入由 bon::Builder 生成的 typestate 模块与状态转换别名
use self::consumer_runtime_builder::{IsUnset, SetRegistry, State as BuilderState};

/// 单条投递的最终去向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    /// 已成功处理过，跳过
    Duplicate,
    /// 另一 worker 正在处理，经延迟队列稍后再投
    Deferred,
    RetryScheduled,
    /// reject 并重入队，由 broker 重投
    Requeued,
    DeadLettered,
}

#[derive(Builder)]
pub struct ConsumerRuntime {
    /// 消费专用通道
    channel: Arc<dyn BrokerChannel>,
    /// 重试与死信经发布通道发出
    publisher: Publisher,
    identity: ServiceIdentity,
    #[builder(setters(vis = "pub(crate)"))]
    registry: HandlerRegistry,
    idempotency: Arc<dyn IdempotencyStore>,
    #[builder(default = Arc::new(W3cTraceContextPropagator) as Arc<dyn TracePropagator>)]
    propagator: Arc<dyn TracePropagator>,
    #[builder(default = Arc::new(NoopMetrics) as Arc<dyn MetricsRecorder>)]
    metrics: Arc<dyn MetricsRecorder>,
    /// 缺省为基于延迟队列的 `BrokerDelayScheduler`
    retry_scheduler: Option<Arc<dyn RetryScheduler>>,
    #[builder(default)]
    config: ConsumerConfig,
}

impl<S: BuilderState> ConsumerRuntimeBuilder<S> {
    pub fn event_handlers(
        self,
        handlers: Vec<Arc<dyn EventHandler>>,
    ) -> ConsumerRuntimeBuilder<SetRegistry<S>>
    where
        <S as BuilderState>::Registry: IsUnset,
    {
        self.registry(HandlerRegistry::new(handlers))
    }
}

impl ConsumerRuntime {
    pub fn identity(&self) -> &ServiceIdentity {
        &self.identity
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// 声明拓扑、开始消费，返回运行句柄
    pub async fn start(self: Arc<Self>) -> EventingResult<ConsumerHandle> {
        self.config.validate()?;
        if self.registry.is_empty() {
            return Err(EventingError::config("no event handlers registered"));
        }

        let topology = Topology::for_consumer(&self.identity, &self.registry.patterns())?;
        self.channel.declare(&topology).await?;
        let queue = self.identity.queue();
        let stream = self.channel.consume(&queue, self.config.prefetch).await?;

        let token = CancellationToken::new();
        let fatal: Arc<Mutex<Option<EventingError>>> = Arc::new(Mutex::new(None));
        let policy = self.config.retry_policy();
        let scheduler = self.retry_scheduler.clone().unwrap_or_else(|| {
            Arc::new(
                BrokerDelayScheduler::new(self.publisher.clone(), self.identity.clone(), policy)
                    .with_metrics(self.metrics.clone()),
            )
        });
        let worker = Arc::new(Worker {
            dead_letters: DeadLetterRouter::new(self.publisher.clone(), self.identity.clone())
                .with_metrics(self.metrics.clone()),
            runtime: self.clone(),
            scheduler,
            policy,
            codec: EnvelopeCodec::new(),
            token: token.clone(),
            fatal: fatal.clone(),
        });

        let mut tasks: Vec<JoinHandle<()>> = Vec::with_capacity(2);

        // dispatch worker（长循环）
        {
            let token = token.clone();
            let concurrency = self.config.concurrency;
            let queue = queue.clone();
            tasks.push(tokio::spawn(async move {
                stream
                    .take_until(token.clone().cancelled_owned())
                    .for_each_concurrent(Some(concurrency), move |delivery| {
                        let worker = worker.clone();
                        async move { worker.process(delivery).await }
                    })
                    .await;
                token.cancel();
                info!(queue = %queue, "consumer stopped");
            }));
        }

        // dedup sweep（周期任务）
        {
            let idempotency = self.idempotency.clone();
            tasks.push(Self::spawn_periodic(
                token.clone(),
                self.config.dedup_sweep_interval,
                move || {
                    let idempotency = idempotency.clone();
                    async move {
                        match idempotency.purge_expired().await {
                            Ok(0) => {}
                            Ok(purged) => debug!(purged, "expired dedup records purged"),
                            Err(err) => warn!(error = %err, "dedup sweep failed"),
                        }
                    }
                },
            ));
        }

        info!(
            queue = %queue,
            concurrency = self.config.concurrency,
            prefetch = self.config.prefetch,
            "consumer started"
        );

        Ok(ConsumerHandle {
            token,
            tasks,
            fatal,
            grace: self.config.shutdown_grace,
        })
    }

    fn spawn_periodic<F, Fut>(
        token: CancellationToken,
        interval: Duration,
        mut f: F,
    ) -> JoinHandle<()>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => f().await,
                }
            }
        })
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

struct Worker {
    runtime: Arc<ConsumerRuntime>,
    scheduler: Arc<dyn RetryScheduler>,
    dead_letters: DeadLetterRouter,
    policy: RetryPolicy,
    codec: EnvelopeCodec,
    token: CancellationToken,
    fatal: Arc<Mutex<Option<EventingError>>>,
}

impl Worker {
    async fn process(&self, delivery: EventingResult<Delivery>) {
        let delivery = match delivery {
            Ok(delivery) => delivery,
            Err(err) => {
                error!(error = %err, "consume stream failed");
                self.escalate(err);
                return;
            }
        };

        let tag = delivery.delivery_tag;
        match self.dispatch(&delivery).await {
            Ok(outcome) => debug!(delivery_tag = tag, ?outcome, "delivery settled"),
            Err(err) if err.class() == FailureClass::Fatal => {
                error!(delivery_tag = tag, error = %err, "fatal error, consumer stopping");
                self.escalate(err);
                self.requeue(tag).await;
            }
            Err(err) => {
                warn!(delivery_tag = tag, error = %err, "delivery requeued");
                self.requeue(tag).await;
            }
        }
    }

    async fn dispatch(&self, delivery: &Delivery) -> EventingResult<Outcome> {
        let rt = &self.runtime;
        let tag = delivery.delivery_tag;

        // 1. 解码
        let started = Instant::now();
        let decoded = self.codec.decode(&delivery.message);
        rt.metrics.duration(Operation::Decode, started.elapsed());
        let envelope = match decoded {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(
                    routing_key = %delivery.routing_key,
                    error = %err,
                    "undecodable delivery"
                );
                rt.metrics.failed(err.class());
                self.dead_letters
                    .dead_letter_raw(&delivery.message, ErrorInfo::from(&err))
                    .await?;
                self.ack(tag).await?;
                return Ok(Outcome::DeadLettered);
            }
        };
        let event_id = envelope.event_id;
        let attempt = envelope.attempt();

        // 2. 去重
        match rt.idempotency.check_and_mark(&event_id).await? {
            DedupStatus::New => {}
            DedupStatus::Succeeded => {
                debug!(event_id = %event_id, "duplicate delivery skipped");
                self.ack(tag).await?;
                return Ok(Outcome::Duplicate);
            }
            DedupStatus::InProgress => return self.defer(tag, &envelope).await,
        }

        // 3. 选择处理器
        let Some(handler) = rt.registry.resolve(envelope.routing_key.as_str()) else {
            let err = EventingError::validation(format!(
                "no handler bound for routing key '{}'",
                envelope.routing_key
            ));
            warn!(event_id = %event_id, error = %err, "unroutable event");
            rt.metrics.failed(err.class());
            self.release(&envelope).await;
            return self.dead_letter(tag, &envelope, &err).await;
        };

        // 4. 处理
        let ctx = DeliveryContext {
            trace: rt.propagator.extract(&envelope.headers),
            envelope: envelope.clone(),
            attempt,
            redelivered: delivery.redelivered,
        };
        let span = info_span!(
            "handle_event",
            event_id = %event_id,
            routing_key = %envelope.routing_key,
            attempt,
            trace_id = %ctx.trace.trace_id_hex(),
            handler = handler.handler_name(),
        );
        let started = Instant::now();
        let result = AssertUnwindSafe(
            TraceContext::scope(ctx.trace.clone(), handler.handle(&ctx)).instrument(span),
        )
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| {
            Err(HandlerError::transient(anyhow::anyhow!(
                "handler panicked: {}",
                panic_message(panic.as_ref())
            )))
        });
        rt.metrics.duration(Operation::Handle, started.elapsed());

        match result {
            Ok(()) => {
                if let Err(err) = rt.idempotency.mark_succeeded(&event_id).await {
                    warn!(event_id = %event_id, error = %err, "failed to record success");
                }
                self.ack(tag).await?;
                rt.metrics.processed();
                Ok(Outcome::Succeeded)
            }
            Err(source) => {
                let err = EventingError::Handler {
                    handler: handler.handler_name().to_string(),
                    source,
                };
                rt.metrics.failed(err.class());
                warn!(event_id = %event_id, attempt, error = %err, "handler failed");
                self.release(&envelope).await;

                if err.class() == FailureClass::Permanent || self.policy.is_exhausted(attempt) {
                    return self.dead_letter(tag, &envelope, &err).await;
                }

                let state = RetryState::failed(attempt, ErrorInfo::from(&err));
                match self.scheduler.schedule_retry(&envelope, &state).await {
                    Ok(_) => {
                        self.ack(tag).await?;
                        Ok(Outcome::RetryScheduled)
                    }
                    Err(retry_err) => {
                        warn!(
                            event_id = %event_id,
                            error = %retry_err,
                            "retry publish failed, requeueing"
                        );
                        self.reject(tag, true).await?;
                        Ok(Outcome::Requeued)
                    }
                }
            }
        }
    }

    async fn defer(&self, tag: u64, envelope: &Envelope) -> EventingResult<Outcome> {
        let rt = &self.runtime;
        debug!(event_id = %envelope.event_id, "event in progress elsewhere");
        match rt.config.in_progress_policy {
            InProgressPolicy::Requeue => {
                self.reject(tag, true).await?;
                Ok(Outcome::Requeued)
            }
            InProgressPolicy::Delay => {
                match self.scheduler.defer(envelope, rt.config.base_delay).await {
                    Ok(()) => {
                        self.ack(tag).await?;
                        Ok(Outcome::Deferred)
                    }
                    Err(err) => {
                        warn!(event_id = %envelope.event_id, error = %err, "defer failed, requeueing");
                        self.reject(tag, true).await?;
                        Ok(Outcome::Requeued)
                    }
                }
            }
        }
    }

    async fn dead_letter(
        &self,
        tag: u64,
        envelope: &Envelope,
        err: &EventingError,
    ) -> EventingResult<Outcome> {
        self.dead_letters
            .dead_letter(envelope, ErrorInfo::from(err), envelope.attempt())
            .await?;
        self.ack(tag).await?;
        Ok(Outcome::DeadLettered)
    }

    async fn release(&self, envelope: &Envelope) {
        if let Err(err) = self.runtime.idempotency.release(&envelope.event_id).await {
            warn!(event_id = %envelope.event_id, error = %err, "failed to release dedup mark");
        }
    }

    async fn ack(&self, tag: u64) -> EventingResult<()> {
        let started = Instant::now();
        let result = self.runtime.channel.ack(tag).await;
        self.runtime
            .metrics
            .duration(Operation::Ack, started.elapsed());
        match &result {
            Ok(()) => debug!(delivery_tag = tag, "acked"),
            Err(err) => warn!(delivery_tag = tag, error = %err, "ack failed"),
        }
        result
    }

    async fn reject(&self, tag: u64, requeue: bool) -> EventingResult<()> {
        self.runtime.channel.reject(tag, requeue).await
    }

    /// 尽力重入队；通道已失效时由 broker 在关闭后重投
    async fn requeue(&self, tag: u64) {
        if let Err(err) = self.reject(tag, true).await {
            warn!(delivery_tag = tag, error = %err, "requeue failed");
        }
    }

    fn escalate(&self, err: EventingError) {
        let mut fatal = self.fatal.lock().unwrap_or_else(|e| e.into_inner());
        if fatal.is_none() {
            *fatal = Some(err);
        }
        self.token.cancel();
    }
}

/// 消费运行句柄：用于优雅关闭与等待任务结束
pub struct ConsumerHandle {
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    fatal: Arc<Mutex<Option<EventingError>>>,
    grace: Duration,
}

impl ConsumerHandle {
    /// 停止接收新投递
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    /// 等待处理循环结束；致命错误在此返回
    pub async fn join(mut self) -> EventingResult<()> {
        let tasks = std::mem::take(&mut self.tasks);

        for t in tasks {
            if let Err(err) = t.await {
                self.record_task_failure(err);
            }
        }
        self.take_fatal()
    }

    /// 关闭并在宽限期内等待在途消息；超时后放弃，未确认的消息由 broker 重投
    pub async fn stop(mut self) -> EventingResult<()> {
        self.shutdown();
        let tasks = std::mem::take(&mut self.tasks);
        let aborts: Vec<_> = tasks.iter().map(|t| t.abort_handle()).collect();

        match time::timeout(self.grace, futures_util::future::join_all(tasks)).await {
            Ok(results) => {
                for err in results.into_iter().filter_map(Result::err) {
                    self.record_task_failure(err);
                }
            }
            Err(_) => {
                warn!(
                    grace_ms = self.grace.as_millis() as u64,
                    "shutdown grace elapsed, abandoning in-flight deliveries"
                );
                for handle in aborts {
                    handle.abort();
                }
            }
        }
        self.take_fatal()
    }

    /// 任务异常退出（panic）视为致命错误，并停止其余任务
    fn record_task_failure(&self, err: JoinError) {
        if err.is_cancelled() {
            return;
        }
        error!(error = %err, "consumer task failed");
        self.token.cancel();
        let mut fatal = self.fatal.lock().unwrap_or_else(|e| e.into_inner());
        if fatal.is_none() {
            *fatal = Some(EventingError::TaskFailed {
                task: "consumer".to_string(),
                reason: err.to_string(),
            });
        }
    }

    fn take_fatal(&self) -> EventingResult<()> {
        match self.fatal.lock().unwrap_or_else(|e| e.into_inner()).take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Drop for ConsumerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
