//! Completer: applies replies to work items.
//!
//! A reply for an item that is no longer `InProgress` (a duplicate or a
//! redelivery after a crash) is acknowledged without touching the item.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use tracing::{Span, info};

use super::consumer::{Consumer, ConsumerConfig, DeliveryHandler};
use crate::backend::{Backend, Delivery, UnitOfWork};
use crate::config::ProtocolConfig;
use crate::error::Result;
use crate::model::{ReplyMessage, Status, TransitionFields};
use crate::telemetry::work::{record_state_transition, record_work_id};

/// Handler for the reply queue.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReplyHandler;

#[async_trait]
impl<U: UnitOfWork> DeliveryHandler<U> for ReplyHandler {
    async fn handle(&self, unit: &mut U, delivery: &Delivery) -> Result<()> {
        let reply = ReplyMessage::from_payload(&delivery.payload)?;
        let id = reply.work_id()?;
        let span = Span::current();
        record_work_id(&span, id);

        let success = reply.is_success();
        let to = if success {
            Status::Completed
        } else {
            Status::Failed
        };
        info!(%id, success, body = %reply.body, "received reply");

        let applied = unit
            .try_transition(
                id,
                Status::InProgress,
                to,
                TransitionFields::completed(Utc::now(), reply.body),
            )
            .await?;

        if applied {
            record_state_transition(&span, Status::InProgress, to);
        } else {
            info!(%id, "work item not in progress, acknowledging reply as a no-op");
        }
        Ok(())
    }
}

/// Consumes the reply queue.
pub struct Completer<B: Backend> {
    consumer: Consumer<B, ReplyHandler>,
}

impl<B: Backend> Clone for Completer<B> {
    fn clone(&self) -> Self {
        Self {
            consumer: self.consumer.clone(),
        }
    }
}

impl<B: Backend> Completer<B> {
    pub fn new(backend: Arc<B>, config: &ProtocolConfig) -> Self {
        Self {
            consumer: Consumer::new(
                backend,
                ReplyHandler,
                ConsumerConfig::for_queue(&config.reply_queue, config),
            ),
        }
    }

    /// Process replies until shut down.
    pub async fn run(&self) -> Result<()> {
        info!(queue = self.consumer.queue(), "completer listening for replies");
        self.consumer.run().await
    }

    pub fn shutdown(&self) {
        self.consumer.shutdown();
    }
}
