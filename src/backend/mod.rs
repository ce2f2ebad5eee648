//! Store, channel and unit-of-work contracts shared by every backend.
//!
//! A backend provides a durable store of work items and a set of durable
//! queues, and can open a [`UnitOfWork`] that groups one store mutation with
//! channel operations so they commit or roll back together.
//!
//! Two implementations ship with the crate: [`crate::db::Db`] (Postgres with
//! pgmq, where queues are tables in the same database) and
//! [`memory::MemoryBackend`] (in-process, for tests and local runs).

pub mod memory;

use async_trait::async_trait;
use futures::Stream;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::error::Result;
use crate::model::{Status, TransitionFields, WorkId, WorkItem};

/// A message handed to a consumer. Acknowledge or reject it through a
/// [`UnitOfWork`]; otherwise it reappears once the visibility timeout lapses.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub queue: String,
    pub msg_id: i64,
    /// How many times this message has been read, this delivery included.
    pub read_ct: i32,
    pub enqueued_at: chrono::DateTime<chrono::Utc>,
    pub payload: serde_json::Value,
}

/// Non-transactional access to work item records.
#[async_trait]
pub trait WorkStore: Send + Sync {
    /// Insert a `Pending` item. Returns `false` if the id already exists.
    async fn create_work_item(&self, id: WorkId) -> Result<bool>;

    /// Fetch an item, or [`crate::error::Error::NotFound`].
    async fn get_work_item(&self, id: WorkId) -> Result<WorkItem>;

    /// List items ordered by id, optionally filtered by status.
    async fn list_work_items(&self, status: Option<Status>, limit: i64) -> Result<Vec<WorkItem>>;
}

/// Queue operations that happen outside any unit of work.
#[async_trait]
pub trait Channel: Send + Sync {
    type Listener: ReadyListener + 'static;

    /// Create a durable queue. No-op if it already exists.
    async fn declare(&self, queue: &str) -> Result<()>;

    /// Take the next visible message and hide it for `visibility`.
    async fn receive(&self, queue: &str, visibility: Duration) -> Result<Option<Delivery>>;

    /// Make a delivery visible again after `delay`. Used after a rollback.
    async fn release(&self, delivery: &Delivery, delay: Duration) -> Result<()>;

    /// Subscribe to "messages committed to `queue`" wakeups.
    async fn listen(&self, queue: &str) -> Result<Self::Listener>;
}

/// Wakeup source for a single queue.
#[async_trait]
pub trait ReadyListener: Send {
    /// Resolves once something was committed to the queue since the last call.
    async fn ready(&mut self) -> Result<()>;
}

/// A coordination scope that makes its store mutation and channel operations
/// visible together on [`commit`](UnitOfWork::commit), or not at all.
///
/// Dropping a unit without committing rolls it back.
#[async_trait]
pub trait UnitOfWork: Send + Sized + 'static {
    /// Conditionally move `id` from `from` to `to`, writing `fields`.
    ///
    /// Returns `Ok(false)` when the item is not in `from`; that is the
    /// normal "someone else got there first" outcome. Concurrent callers on
    /// the same id serialize: at most one sees `true`. A terminal `from` is
    /// always `Ok(false)`: terminal items never change.
    ///
    /// # Errors
    ///
    /// `InvalidTransition` if `from` is live and the state machine never
    /// allows `from -> to`, `NotFound` if the item does not exist.
    async fn try_transition(
        &mut self,
        id: WorkId,
        from: Status,
        to: Status,
        fields: TransitionFields,
    ) -> Result<bool>;

    /// Enqueue a persistent message, visible to consumers only after commit.
    async fn publish(&mut self, queue: &str, payload: &serde_json::Value) -> Result<()>;

    /// Finalize a delivery. Rolled back acks leave the message to be redelivered.
    async fn ack(&mut self, delivery: &Delivery) -> Result<()>;

    /// Reject a delivery: requeue it for immediate redelivery, or move it to
    /// the queue's archive (dead-letter).
    async fn nack(&mut self, delivery: &Delivery, requeue: bool) -> Result<()>;

    async fn commit(self) -> Result<()>;

    async fn rollback(self) -> Result<()>;
}

/// Something that can open units of work.
#[async_trait]
pub trait Transactor: Send + Sync {
    type Unit: UnitOfWork;

    async fn begin(&self) -> Result<Self::Unit>;
}

/// Everything the coordinator, worker and completer need from a backend.
pub trait Backend: WorkStore + Channel + Transactor + 'static {}

impl<T> Backend for T where T: WorkStore + Channel + Transactor + 'static {}

/// Polling parameters for [`consume`].
#[derive(Debug, Clone, Copy)]
pub struct ConsumeOptions {
    /// How long a received message stays hidden from other consumers.
    pub visibility_timeout: Duration,
    /// Upper bound on how long to wait for a wakeup before polling again.
    pub poll_interval: Duration,
}

/// Lazily stream deliveries from `queue`.
///
/// The stream never ends on its own. When the queue is empty it waits for a
/// commit wakeup or `poll_interval`, whichever comes first. Receive errors
/// are yielded so the caller can decide how to back off; the stream stays
/// usable afterwards.
pub async fn consume<C>(
    channel: Arc<C>,
    queue: String,
    options: ConsumeOptions,
) -> Result<impl Stream<Item = Result<Delivery>> + Send + 'static>
where
    C: Channel + 'static,
{
    let listener = channel.listen(&queue).await?;

    Ok(futures::stream::unfold(
        (channel, listener, queue, options),
        |(channel, mut listener, queue, options)| async move {
            loop {
                match channel.receive(&queue, options.visibility_timeout).await {
                    Ok(Some(delivery)) => {
                        return Some((Ok(delivery), (channel, listener, queue, options)));
                    }
                    Ok(None) => {
                        match tokio::time::timeout(options.poll_interval, listener.ready()).await {
                            Ok(Err(e)) => {
                                warn!(queue = %queue, "queue listener error: {e}, falling back to poll");
                                tokio::time::sleep(options.poll_interval).await;
                            }
                            Ok(Ok(())) | Err(_) => {}
                        }
                    }
                    Err(e) => return Some((Err(e), (channel, listener, queue, options))),
                }
            }
        },
    ))
}
