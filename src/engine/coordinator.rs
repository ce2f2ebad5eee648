//! Coordinator: dispatches work items.
//!
//! `start_work` moves an item from `Pending` to `InProgress` and publishes
//! its request in one unit of work, so either both happen or the item stays
//! `Pending` and can be retried.

use chrono::Utc;
use opentelemetry::KeyValue;
use std::sync::Arc;
use std::time::Instant;
use tracing::{Instrument, Span, error, info};

use super::completer::Completer;
use super::rollback_quietly;
use crate::backend::{Backend, UnitOfWork};
use crate::config::ProtocolConfig;
use crate::error::{Error, Result};
use crate::model::{RequestMessage, Status, TransitionFields, WorkId};
use crate::telemetry::metrics;
use crate::telemetry::work::{record_state_transition, start_work_span};

pub struct Coordinator<B: Backend> {
    backend: Arc<B>,
    config: ProtocolConfig,
}

impl<B: Backend> Clone for Coordinator<B> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            config: self.config.clone(),
        }
    }
}

impl<B: Backend> Coordinator<B> {
    pub fn new(backend: Arc<B>, config: ProtocolConfig) -> Self {
        Self { backend, config }
    }

    /// Declare the request and reply queues.
    pub async fn declare_queues(&self) -> Result<()> {
        self.backend.declare(&self.config.request_queue).await?;
        self.backend.declare(&self.config.reply_queue).await
    }

    /// Dispatch `id` with the standard request body.
    ///
    /// # Errors
    ///
    /// [`Error::NotAvailable`] if the item was not `Pending` (already
    /// dispatched, possibly by a concurrent caller). Any other error is a
    /// fault; the unit was rolled back and the item is still `Pending`.
    pub async fn start_work(&self, id: WorkId) -> Result<()> {
        self.start_work_with_body(id, RequestMessage::default_body(id))
            .await
    }

    /// Dispatch `id` with a caller-supplied task payload.
    pub async fn start_work_with_body(&self, id: WorkId, body: impl Into<String>) -> Result<()> {
        let span = start_work_span(id);
        let body = body.into();

        async {
            let started = Instant::now();
            let result = self.dispatch(id, body, &span).await;

            let label = match &result {
                Ok(()) => {
                    info!(%id, "work item started and request sent");
                    "ok"
                }
                Err(Error::NotAvailable(_)) => {
                    info!(%id, "work item not available");
                    "not_available"
                }
                Err(e) => {
                    error!(%id, error = %e, "failed to start work, rolled back");
                    "error"
                }
            };

            metrics::work_started().add(1, &[KeyValue::new("result", label)]);
            metrics::operation_duration_ms().record(
                started.elapsed().as_secs_f64() * 1000.0,
                &[KeyValue::new("operation", "work.start")],
            );

            result
        }
        .instrument(span.clone())
        .await
    }

    /// Start each item in turn. Returns the ids whose dispatch faulted;
    /// items that were not `Pending` are skipped, not counted.
    pub async fn start_all(&self, ids: &[WorkId]) -> Vec<WorkId> {
        let mut failed = Vec::new();
        for &id in ids {
            match self.start_work(id).await {
                Ok(()) | Err(Error::NotAvailable(_)) => {}
                Err(_) => failed.push(id),
            }
        }
        failed
    }

    /// A completer for this coordinator's reply queue, sharing its backend.
    pub fn completer(&self) -> Completer<B> {
        Completer::new(Arc::clone(&self.backend), &self.config)
    }

    async fn dispatch(&self, id: WorkId, body: String, span: &Span) -> Result<()> {
        let mut unit = self.backend.begin().await?;

        match self.stage(&mut unit, id, body).await {
            Ok(true) => {
                unit.commit().await?;
                record_state_transition(span, Status::Pending, Status::InProgress);
                Ok(())
            }
            Ok(false) => {
                rollback_quietly(unit).await;
                Err(Error::NotAvailable(id))
            }
            Err(e) => {
                rollback_quietly(unit).await;
                Err(e)
            }
        }
    }

    /// Stage the claim and the request. `false` means the claim missed.
    async fn stage(&self, unit: &mut B::Unit, id: WorkId, body: String) -> Result<bool> {
        let claimed = unit
            .try_transition(
                id,
                Status::Pending,
                Status::InProgress,
                TransitionFields::started(Utc::now()),
            )
            .await?;
        if !claimed {
            return Ok(false);
        }

        let request = RequestMessage::new(id, &self.config.reply_queue, body);
        unit.publish(&self.config.request_queue, &request.to_payload()?)
            .await?;
        Ok(true)
    }
}
