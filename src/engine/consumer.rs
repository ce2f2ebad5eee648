//! Consume loop shared by the worker and the completer.
//!
//! Each delivery gets its own unit of work: the queue's handler stages its
//! effects, the loop stages the ack, and the unit commits. Any error rolls
//! the unit back and releases the message for redelivery; the loop itself
//! keeps going.

use async_trait::async_trait;
use futures::StreamExt;
use opentelemetry::KeyValue;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Notify, Semaphore};
use tracing::{Instrument, debug, error, info, warn};

use super::rollback_quietly;
use crate::backend::{Backend, ConsumeOptions, Delivery, UnitOfWork, consume};
use crate::config::ProtocolConfig;
use crate::error::{Error, Result};
use crate::telemetry::metrics;
use crate::telemetry::work::start_delivery_span;

/// The single handler registered for a queue.
#[async_trait]
pub trait DeliveryHandler<U: UnitOfWork>: Send + Sync + 'static {
    /// Stage this delivery's effects in `unit`. Returning `Ok` lets the loop
    /// ack and commit; returning `Err` rolls everything back.
    async fn handle(&self, unit: &mut U, delivery: &Delivery) -> Result<()>;
}

/// Per-queue consumer settings.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub queue: String,
    pub prefetch: usize,
    pub visibility_timeout: Duration,
    pub poll_interval: Duration,
    pub retry_delay: Duration,
    pub max_deliveries: Option<i32>,
}

impl ConsumerConfig {
    pub fn for_queue(queue: impl Into<String>, protocol: &ProtocolConfig) -> Self {
        Self {
            queue: queue.into(),
            prefetch: protocol.prefetch.max(1),
            visibility_timeout: protocol.visibility_timeout,
            poll_interval: protocol.poll_interval,
            retry_delay: protocol.retry_delay,
            max_deliveries: protocol.max_deliveries,
        }
    }
}

/// Consumes one queue until shut down.
pub struct Consumer<B: Backend, H> {
    backend: Arc<B>,
    handler: Arc<H>,
    config: ConsumerConfig,
    shutdown: Arc<Notify>,
}

impl<B: Backend, H> Clone for Consumer<B, H> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            handler: Arc::clone(&self.handler),
            config: self.config.clone(),
            shutdown: Arc::clone(&self.shutdown),
        }
    }
}

impl<B, H> Consumer<B, H>
where
    B: Backend,
    H: DeliveryHandler<B::Unit>,
{
    pub fn new(backend: Arc<B>, handler: H, config: ConsumerConfig) -> Self {
        Self {
            backend,
            handler: Arc::new(handler),
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn queue(&self) -> &str {
        &self.config.queue
    }

    /// Signal the loop to stop receiving. In-flight deliveries finish first.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Run until [`shutdown`](Self::shutdown) is called.
    ///
    /// # Errors
    ///
    /// Only startup failures (declaring the queue, opening the listener) are
    /// returned. Per-delivery faults are logged and retried.
    pub async fn run(&self) -> Result<()> {
        let queue = self.config.queue.clone();
        self.backend.declare(&queue).await?;

        let deliveries = consume(
            Arc::clone(&self.backend),
            queue.clone(),
            ConsumeOptions {
                visibility_timeout: self.config.visibility_timeout,
                poll_interval: self.config.poll_interval,
            },
        )
        .await?;
        tokio::pin!(deliveries);

        let permits = Arc::new(Semaphore::new(self.config.prefetch));
        info!(queue = %queue, prefetch = self.config.prefetch, "consumer started");

        loop {
            let permit = tokio::select! {
                _ = self.shutdown.notified() => break,
                permit = Arc::clone(&permits).acquire_owned() => permit
                    .map_err(|e| Error::Other(format!("consumer permits closed: {e}")))?,
            };

            let next = tokio::select! {
                _ = self.shutdown.notified() => break,
                next = deliveries.next() => next,
            };

            match next {
                Some(Ok(delivery)) => {
                    let this = self.clone();
                    tokio::spawn(async move {
                        this.process(delivery).await;
                        drop(permit);
                    });
                }
                Some(Err(e)) => {
                    drop(permit);
                    warn!(queue = %queue, "receive failed: {e}, retrying after poll interval");
                    tokio::time::sleep(self.config.poll_interval).await;
                }
                None => break,
            }
        }

        info!(queue = %queue, "consumer shutting down, draining in-flight deliveries");
        let all = u32::try_from(self.config.prefetch).unwrap_or(u32::MAX);
        let _drained = permits.acquire_many(all).await;
        Ok(())
    }

    /// Process one delivery. Never fails: faults end in rollback + release.
    async fn process(&self, delivery: Delivery) {
        let span = start_delivery_span(&delivery.queue, delivery.msg_id, delivery.read_ct);

        async {
            let started = Instant::now();

            let result = if self.exceeds_max_deliveries(&delivery) {
                self.dead_letter(&delivery).await.map(|()| "dead_lettered")
            } else {
                self.handle_in_unit(&delivery).await.map(|()| "committed")
            };

            let label = match result {
                Ok(label) => {
                    debug!(result = label, "delivery finished");
                    label
                }
                Err(e) => {
                    error!(error = %e, "delivery failed, rolled back for redelivery");
                    if let Err(release_err) =
                        self.backend.release(&delivery, self.config.retry_delay).await
                    {
                        warn!("release failed, message returns after its visibility timeout: {release_err}");
                    }
                    "rolled_back"
                }
            };

            metrics::deliveries().add(
                1,
                &[
                    KeyValue::new("queue", self.config.queue.clone()),
                    KeyValue::new("result", label),
                ],
            );
            metrics::operation_duration_ms().record(
                started.elapsed().as_secs_f64() * 1000.0,
                &[KeyValue::new("operation", "delivery.process")],
            );
        }
        .instrument(span)
        .await
    }

    fn exceeds_max_deliveries(&self, delivery: &Delivery) -> bool {
        self.config
            .max_deliveries
            .is_some_and(|max| delivery.read_ct > max)
    }

    async fn handle_in_unit(&self, delivery: &Delivery) -> Result<()> {
        let mut unit = self.backend.begin().await?;

        if let Err(e) = self.handler.handle(&mut unit, delivery).await {
            rollback_quietly(unit).await;
            return Err(e);
        }
        if let Err(e) = unit.ack(delivery).await {
            rollback_quietly(unit).await;
            return Err(e);
        }
        unit.commit().await
    }

    async fn dead_letter(&self, delivery: &Delivery) -> Result<()> {
        warn!(
            read_ct = delivery.read_ct,
            max_deliveries = ?self.config.max_deliveries,
            "delivery exceeded max deliveries, dead-lettering"
        );

        let mut unit = self.backend.begin().await?;
        if let Err(e) = unit.nack(delivery, false).await {
            rollback_quietly(unit).await;
            return Err(e);
        }
        unit.commit().await
    }
}
