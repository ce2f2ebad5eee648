//! Worker: executes requests and replies.
//!
//! The reply publish and the request ack commit together. Delivery is
//! at-least-once: if the unit rolls back, or the process dies before commit,
//! the request is redelivered and the task runs again. Tasks must tolerate
//! being executed more than once for the same item.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{Span, debug, info};

use super::consumer::{Consumer, ConsumerConfig, DeliveryHandler};
use crate::backend::{Backend, Delivery, UnitOfWork};
use crate::config::ProtocolConfig;
use crate::error::Result;
use crate::model::{DEFAULT_SUCCESS_BODY, Outcome, ReplyMessage, RequestMessage, WorkId};
use crate::telemetry::work::record_work_id;

/// The work a worker performs for one request.
#[async_trait]
pub trait Task: Send + Sync + 'static {
    /// Produce an outcome. `Ok(Outcome::failure(..))` is a reported failure
    /// that completes the item as `Failed`; `Err` is a fault that rolls back
    /// and retries the request.
    async fn execute(&self, request: &RequestMessage) -> Result<Outcome>;
}

/// Stand-in task: waits `latency`, then reports success.
#[derive(Debug, Clone)]
pub struct SimulatedTask {
    latency: Duration,
}

impl SimulatedTask {
    pub fn new(latency: Duration) -> Self {
        Self { latency }
    }
}

#[async_trait]
impl Task for SimulatedTask {
    async fn execute(&self, request: &RequestMessage) -> Result<Outcome> {
        debug!(body = %request.body, latency_ms = self.latency.as_millis() as u64, "simulating work");
        tokio::time::sleep(self.latency).await;
        Ok(Outcome::success(DEFAULT_SUCCESS_BODY))
    }
}

/// Handler for the request queue.
pub struct RequestHandler<T> {
    task: T,
}

impl<T: Task> RequestHandler<T> {
    pub fn new(task: T) -> Self {
        Self { task }
    }
}

#[async_trait]
impl<U: UnitOfWork, T: Task> DeliveryHandler<U> for RequestHandler<T> {
    async fn handle(&self, unit: &mut U, delivery: &Delivery) -> Result<()> {
        let request = RequestMessage::from_payload(&delivery.payload)?;
        if let Ok(id) = request.correlation_id.parse::<WorkId>() {
            record_work_id(&Span::current(), id);
        }
        info!(body = %request.body, "received request");

        let outcome = self.task.execute(&request).await?;
        let reply = ReplyMessage::new(request.correlation_id.clone(), outcome);
        unit.publish(&request.reply_to, &reply.to_payload()?).await?;

        info!(
            reply_to = %request.reply_to,
            success = reply.is_success(),
            "reply staged"
        );
        Ok(())
    }
}

/// Consumes the request queue.
pub struct Worker<B: Backend, T> {
    consumer: Consumer<B, RequestHandler<T>>,
    backend: Arc<B>,
    reply_queue: String,
}

impl<B: Backend, T> Clone for Worker<B, T> {
    fn clone(&self) -> Self {
        Self {
            consumer: self.consumer.clone(),
            backend: Arc::clone(&self.backend),
            reply_queue: self.reply_queue.clone(),
        }
    }
}

impl<B: Backend, T: Task> Worker<B, T> {
    pub fn new(backend: Arc<B>, task: T, config: &ProtocolConfig) -> Self {
        Self {
            consumer: Consumer::new(
                Arc::clone(&backend),
                RequestHandler::new(task),
                ConsumerConfig::for_queue(&config.request_queue, config),
            ),
            backend,
            reply_queue: config.reply_queue.clone(),
        }
    }

    /// Declare both queues, then process requests until shut down.
    pub async fn run(&self) -> Result<()> {
        self.backend.declare(&self.reply_queue).await?;
        info!(queue = self.consumer.queue(), "worker listening for requests");
        self.consumer.run().await
    }

    pub fn shutdown(&self) {
        self.consumer.shutdown();
    }
}
