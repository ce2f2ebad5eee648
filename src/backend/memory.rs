//! In-process backend for tests and local runs.
//!
//! Mirrors the Postgres backend's observable behaviour: a conditional
//! transition takes a row lock that other units wait on until the holder
//! commits or rolls back, staged publishes and acks become visible only on
//! commit, and received messages hide behind a visibility timeout.
//! Faults can be injected at each step to exercise rollback paths.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{Notify, broadcast};
use tokio::time::Instant;

use super::{Channel, Delivery, ReadyListener, Transactor, UnitOfWork, WorkStore};
use crate::error::{Error, Result};
use crate::model::{Status, TransitionFields, WorkId, WorkItem, validate_transition};

/// A step that can be made to fail once via [`MemoryBackend::inject_fault`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Transition,
    Publish,
    Ack,
    Commit,
    Receive,
}

/// Thread-safe in-memory store and queues.
#[derive(Clone)]
pub struct MemoryBackend {
    shared: Arc<Shared>,
}

struct Shared {
    state: Mutex<State>,
    /// Signalled whenever a unit releases its row locks.
    released: Notify,
    /// Queue names that had messages committed.
    ready: broadcast::Sender<String>,
    next_unit: AtomicU64,
}

#[derive(Default)]
struct State {
    items: BTreeMap<WorkId, WorkItem>,
    /// Row locks: item id -> owning unit.
    locks: HashMap<WorkId, u64>,
    queues: HashMap<String, Queue>,
    next_msg_id: i64,
    faults: Vec<Fault>,
}

#[derive(Default)]
struct Queue {
    messages: VecDeque<StoredMessage>,
    archive: Vec<StoredMessage>,
}

#[derive(Clone)]
struct StoredMessage {
    msg_id: i64,
    read_ct: i32,
    enqueued_at: chrono::DateTime<Utc>,
    visible_at: Instant,
    payload: serde_json::Value,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl State {
    /// Consume one injected fault of this kind, if any.
    fn take_fault(&mut self, fault: Fault) -> Result<()> {
        match self.faults.iter().position(|f| *f == fault) {
            Some(pos) => {
                self.faults.remove(pos);
                Err(Error::Channel(format!("injected {fault:?} failure")))
            }
            None => Ok(()),
        }
    }

    fn queue_mut(&mut self, queue: &str) -> Result<&mut Queue> {
        self.queues
            .get_mut(queue)
            .ok_or_else(|| Error::Channel(format!("queue {queue} does not exist")))
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (ready, _) = broadcast::channel(64);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                released: Notify::new(),
                ready,
                next_unit: AtomicU64::new(1),
            }),
        }
    }

    /// Make the next operation of this kind fail. Faults queue up: injecting
    /// the same kind twice fails the next two such operations.
    pub fn inject_fault(&self, fault: Fault) {
        self.shared.lock().faults.push(fault);
    }

    /// Payloads of every unacknowledged message on `queue`, visible or not,
    /// in queue order.
    pub fn queued(&self, queue: &str) -> Vec<serde_json::Value> {
        self.shared
            .lock()
            .queues
            .get(queue)
            .map(|q| q.messages.iter().map(|m| m.payload.clone()).collect())
            .unwrap_or_default()
    }

    /// Payloads moved to `queue`'s archive by a non-requeueing nack.
    pub fn archived(&self, queue: &str) -> Vec<serde_json::Value> {
        self.shared
            .lock()
            .queues
            .get(queue)
            .map(|q| q.archive.iter().map(|m| m.payload.clone()).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl WorkStore for MemoryBackend {
    async fn create_work_item(&self, id: WorkId) -> Result<bool> {
        let mut state = self.shared.lock();
        if state.items.contains_key(&id) {
            return Ok(false);
        }
        state.items.insert(id, WorkItem::pending(id));
        Ok(true)
    }

    async fn get_work_item(&self, id: WorkId) -> Result<WorkItem> {
        self.shared
            .lock()
            .items
            .get(&id)
            .cloned()
            .ok_or(Error::NotFound(id))
    }

    async fn list_work_items(&self, status: Option<Status>, limit: i64) -> Result<Vec<WorkItem>> {
        let limit = usize::try_from(limit).unwrap_or(0);
        Ok(self
            .shared
            .lock()
            .items
            .values()
            .filter(|item| status.is_none_or(|s| item.status == s))
            .take(limit)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl Channel for MemoryBackend {
    type Listener = MemoryListener;

    async fn declare(&self, queue: &str) -> Result<()> {
        self.shared
            .lock()
            .queues
            .entry(queue.to_string())
            .or_default();
        Ok(())
    }

    async fn receive(&self, queue: &str, visibility: Duration) -> Result<Option<Delivery>> {
        let now = Instant::now();
        let mut state = self.shared.lock();
        state.take_fault(Fault::Receive)?;

        let q = state.queue_mut(queue)?;
        let Some(msg) = q.messages.iter_mut().find(|m| m.visible_at <= now) else {
            return Ok(None);
        };
        msg.read_ct += 1;
        msg.visible_at = now + visibility;

        Ok(Some(Delivery {
            queue: queue.to_string(),
            msg_id: msg.msg_id,
            read_ct: msg.read_ct,
            enqueued_at: msg.enqueued_at,
            payload: msg.payload.clone(),
        }))
    }

    async fn release(&self, delivery: &Delivery, delay: Duration) -> Result<()> {
        let mut state = self.shared.lock();
        let q = state.queue_mut(&delivery.queue)?;
        if let Some(msg) = q.messages.iter_mut().find(|m| m.msg_id == delivery.msg_id) {
            msg.visible_at = Instant::now() + delay;
        }
        Ok(())
    }

    async fn listen(&self, queue: &str) -> Result<MemoryListener> {
        Ok(MemoryListener {
            rx: self.shared.ready.subscribe(),
            queue: queue.to_string(),
        })
    }
}

/// Wakes when a unit commits a publish to the watched queue.
pub struct MemoryListener {
    rx: broadcast::Receiver<String>,
    queue: String,
}

#[async_trait]
impl ReadyListener for MemoryListener {
    async fn ready(&mut self) -> Result<()> {
        loop {
            match self.rx.recv().await {
                Ok(queue) if queue == self.queue => return Ok(()),
                Ok(_) => continue,
                // Missed some wakeups; one of them may have been ours.
                Err(broadcast::error::RecvError::Lagged(_)) => return Ok(()),
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(Error::Channel("backend dropped".to_string()));
                }
            }
        }
    }
}

#[async_trait]
impl Transactor for MemoryBackend {
    type Unit = MemoryUnit;

    async fn begin(&self) -> Result<MemoryUnit> {
        Ok(MemoryUnit {
            shared: Arc::clone(&self.shared),
            id: self.shared.next_unit.fetch_add(1, Ordering::Relaxed),
            staged: Vec::new(),
            finished: false,
        })
    }
}

/// Operations buffered until commit.
enum Staged {
    Transition(WorkItem),
    Publish {
        queue: String,
        payload: serde_json::Value,
    },
    Ack {
        queue: String,
        msg_id: i64,
    },
    Nack {
        queue: String,
        msg_id: i64,
        requeue: bool,
    },
}

/// Unit of work against [`MemoryBackend`].
pub struct MemoryUnit {
    shared: Arc<Shared>,
    id: u64,
    staged: Vec<Staged>,
    finished: bool,
}

impl MemoryUnit {
    /// This unit's own uncommitted view of an item, if it changed one.
    fn staged_item(&self, id: WorkId) -> Option<WorkItem> {
        self.staged.iter().rev().find_map(|op| match op {
            Staged::Transition(item) if item.id == id => Some(item.clone()),
            _ => None,
        })
    }

    fn finish(&mut self) {
        {
            let mut state = self.shared.lock();
            state.locks.retain(|_, owner| *owner != self.id);
        }
        self.staged.clear();
        self.finished = true;
        self.shared.released.notify_waiters();
    }
}

impl Drop for MemoryUnit {
    fn drop(&mut self) {
        if !self.finished {
            self.finish();
        }
    }
}

#[async_trait]
impl UnitOfWork for MemoryUnit {
    async fn try_transition(
        &mut self,
        id: WorkId,
        from: Status,
        to: Status,
        fields: TransitionFields,
    ) -> Result<bool> {
        if !validate_transition(from, to)? {
            let state = self.shared.lock();
            return if state.items.contains_key(&id) {
                Ok(false)
            } else {
                Err(Error::NotFound(id))
            };
        }
        let shared = Arc::clone(&self.shared);

        loop {
            let released = shared.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            {
                let mut state = shared.lock();
                state.take_fault(Fault::Transition)?;

                let committed = state.items.get(&id).cloned().ok_or(Error::NotFound(id))?;
                let locked_elsewhere = state.locks.get(&id).is_some_and(|owner| *owner != self.id);

                if !locked_elsewhere {
                    let mut current = self.staged_item(id).unwrap_or(committed);
                    if current.status != from {
                        return Ok(false);
                    }
                    fields.apply(&mut current, to);
                    state.locks.insert(id, self.id);
                    self.staged.push(Staged::Transition(current));
                    return Ok(true);
                }
            }

            // Another unit holds the row; re-check once it finishes.
            released.await;
        }
    }

    async fn publish(&mut self, queue: &str, payload: &serde_json::Value) -> Result<()> {
        {
            let mut state = self.shared.lock();
            state.take_fault(Fault::Publish)?;
            state.queue_mut(queue)?;
        }
        self.staged.push(Staged::Publish {
            queue: queue.to_string(),
            payload: payload.clone(),
        });
        Ok(())
    }

    async fn ack(&mut self, delivery: &Delivery) -> Result<()> {
        self.shared.lock().take_fault(Fault::Ack)?;
        self.staged.push(Staged::Ack {
            queue: delivery.queue.clone(),
            msg_id: delivery.msg_id,
        });
        Ok(())
    }

    async fn nack(&mut self, delivery: &Delivery, requeue: bool) -> Result<()> {
        self.staged.push(Staged::Nack {
            queue: delivery.queue.clone(),
            msg_id: delivery.msg_id,
            requeue,
        });
        Ok(())
    }

    async fn commit(mut self) -> Result<()> {
        let mut published = Vec::new();
        {
            let mut state = self.shared.lock();
            state.take_fault(Fault::Commit)?;

            for op in std::mem::take(&mut self.staged) {
                match op {
                    Staged::Transition(item) => {
                        state.items.insert(item.id, item);
                    }
                    Staged::Publish { queue, payload } => {
                        state.next_msg_id += 1;
                        let msg = StoredMessage {
                            msg_id: state.next_msg_id,
                            read_ct: 0,
                            enqueued_at: Utc::now(),
                            visible_at: Instant::now(),
                            payload,
                        };
                        state
                            .queues
                            .entry(queue.clone())
                            .or_default()
                            .messages
                            .push_back(msg);
                        published.push(queue);
                    }
                    Staged::Ack { queue, msg_id } => {
                        if let Some(q) = state.queues.get_mut(&queue) {
                            q.messages.retain(|m| m.msg_id != msg_id);
                        }
                    }
                    Staged::Nack {
                        queue,
                        msg_id,
                        requeue,
                    } => {
                        let Some(q) = state.queues.get_mut(&queue) else {
                            continue;
                        };
                        let Some(pos) = q.messages.iter().position(|m| m.msg_id == msg_id) else {
                            continue;
                        };
                        if requeue {
                            q.messages[pos].visible_at = Instant::now();
                        } else if let Some(msg) = q.messages.remove(pos) {
                            q.archive.push(msg);
                        }
                    }
                }
            }
        }

        self.finish();
        for queue in published {
            // No subscribers is fine.
            let _ = self.shared.ready.send(queue);
        }
        Ok(())
    }

    async fn rollback(mut self) -> Result<()> {
        self.finish();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const VT: Duration = Duration::from_secs(30);

    async fn backend_with_queue(queue: &str) -> MemoryBackend {
        let backend = MemoryBackend::new();
        backend.declare(queue).await.unwrap();
        backend
    }

    #[tokio::test]
    async fn declare_is_idempotent() {
        let backend = backend_with_queue("q").await;
        let mut unit = backend.begin().await.unwrap();
        unit.publish("q", &json!(1)).await.unwrap();
        unit.commit().await.unwrap();

        backend.declare("q").await.unwrap();
        assert_eq!(backend.queued("q"), vec![json!(1)]);
    }

    #[tokio::test]
    async fn publish_to_undeclared_queue_fails() {
        let backend = MemoryBackend::new();
        let mut unit = backend.begin().await.unwrap();
        let err = unit.publish("nowhere", &json!(1)).await.unwrap_err();
        assert!(matches!(err, Error::Channel(_)));
    }

    #[tokio::test]
    async fn publish_is_invisible_until_commit() {
        let backend = backend_with_queue("q").await;
        let mut unit = backend.begin().await.unwrap();
        unit.publish("q", &json!({"n": 1})).await.unwrap();

        assert!(backend.receive("q", VT).await.unwrap().is_none());
        unit.commit().await.unwrap();

        let delivery = backend.receive("q", VT).await.unwrap().unwrap();
        assert_eq!(delivery.payload, json!({"n": 1}));
        assert_eq!(delivery.read_ct, 1);
    }

    #[tokio::test]
    async fn dropped_unit_discards_publish() {
        let backend = backend_with_queue("q").await;
        {
            let mut unit = backend.begin().await.unwrap();
            unit.publish("q", &json!(1)).await.unwrap();
        }
        assert!(backend.queued("q").is_empty());
    }

    #[tokio::test]
    async fn deliveries_are_fifo_within_a_queue() {
        let backend = backend_with_queue("q").await;
        let mut unit = backend.begin().await.unwrap();
        for n in 0..3 {
            unit.publish("q", &json!(n)).await.unwrap();
        }
        unit.commit().await.unwrap();

        for n in 0..3 {
            let d = backend.receive("q", VT).await.unwrap().unwrap();
            assert_eq!(d.payload, json!(n));
        }
        assert!(backend.receive("q", VT).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rolled_back_ack_leaves_message_for_redelivery() {
        let backend = backend_with_queue("q").await;
        let mut unit = backend.begin().await.unwrap();
        unit.publish("q", &json!("m")).await.unwrap();
        unit.commit().await.unwrap();

        let first = backend
            .receive("q", Duration::from_millis(20))
            .await
            .unwrap()
            .unwrap();
        let mut unit = backend.begin().await.unwrap();
        unit.ack(&first).await.unwrap();
        unit.rollback().await.unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        let again = backend.receive("q", VT).await.unwrap().unwrap();
        assert_eq!(again.msg_id, first.msg_id);
        assert_eq!(again.read_ct, 2);
    }

    #[tokio::test]
    async fn committed_ack_removes_message() {
        let backend = backend_with_queue("q").await;
        let mut unit = backend.begin().await.unwrap();
        unit.publish("q", &json!("m")).await.unwrap();
        unit.commit().await.unwrap();

        let d = backend.receive("q", VT).await.unwrap().unwrap();
        let mut unit = backend.begin().await.unwrap();
        unit.ack(&d).await.unwrap();
        unit.commit().await.unwrap();
        assert!(backend.queued("q").is_empty());
    }

    #[tokio::test]
    async fn nack_requeue_and_dead_letter() {
        let backend = backend_with_queue("q").await;
        let mut unit = backend.begin().await.unwrap();
        unit.publish("q", &json!("a")).await.unwrap();
        unit.publish("q", &json!("b")).await.unwrap();
        unit.commit().await.unwrap();

        let a = backend.receive("q", VT).await.unwrap().unwrap();
        let b = backend.receive("q", VT).await.unwrap().unwrap();

        let mut unit = backend.begin().await.unwrap();
        unit.nack(&a, true).await.unwrap();
        unit.nack(&b, false).await.unwrap();
        unit.commit().await.unwrap();

        let again = backend.receive("q", VT).await.unwrap().unwrap();
        assert_eq!(again.msg_id, a.msg_id);
        assert_eq!(backend.archived("q"), vec![json!("b")]);
        assert_eq!(backend.queued("q"), vec![json!("a")]);
    }

    #[tokio::test]
    async fn release_makes_message_visible_again() {
        let backend = backend_with_queue("q").await;
        let mut unit = backend.begin().await.unwrap();
        unit.publish("q", &json!("m")).await.unwrap();
        unit.commit().await.unwrap();

        let d = backend.receive("q", VT).await.unwrap().unwrap();
        assert!(backend.receive("q", VT).await.unwrap().is_none());
        backend.release(&d, Duration::ZERO).await.unwrap();
        assert!(backend.receive("q", VT).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn transition_on_missing_item_is_not_found() {
        let backend = MemoryBackend::new();
        let mut unit = backend.begin().await.unwrap();
        let err = unit
            .try_transition(
                WorkId(9),
                Status::Pending,
                Status::InProgress,
                TransitionFields::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(WorkId(9))));
    }

    #[tokio::test]
    async fn disallowed_transition_is_rejected_before_lookup() {
        let backend = MemoryBackend::new();
        let mut unit = backend.begin().await.unwrap();
        let err = unit
            .try_transition(
                WorkId(9),
                Status::Pending,
                Status::Completed,
                TransitionFields::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn transition_from_terminal_state_is_a_no_op() {
        let backend = MemoryBackend::new();
        backend.create_work_item(WorkId(1)).await.unwrap();

        let mut unit = backend.begin().await.unwrap();
        assert!(
            !unit
                .try_transition(
                    WorkId(1),
                    Status::Failed,
                    Status::Completed,
                    TransitionFields::default(),
                )
                .await
                .unwrap()
        );
        let err = unit
            .try_transition(
                WorkId(2),
                Status::Completed,
                Status::Failed,
                TransitionFields::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(WorkId(2))));
        unit.commit().await.unwrap();

        assert_eq!(
            backend.get_work_item(WorkId(1)).await.unwrap(),
            WorkItem::pending(WorkId(1))
        );
    }

    #[tokio::test]
    async fn contending_transition_waits_for_row_lock() {
        let backend = MemoryBackend::new();
        backend.create_work_item(WorkId(1)).await.unwrap();

        let mut winner = backend.begin().await.unwrap();
        assert!(
            winner
                .try_transition(
                    WorkId(1),
                    Status::Pending,
                    Status::InProgress,
                    TransitionFields::started(Utc::now()),
                )
                .await
                .unwrap()
        );

        let contender = {
            let backend = backend.clone();
            tokio::spawn(async move {
                let mut unit = backend.begin().await.unwrap();
                unit.try_transition(
                    WorkId(1),
                    Status::Pending,
                    Status::InProgress,
                    TransitionFields::started(Utc::now()),
                )
                .await
                .unwrap()
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        winner.commit().await.unwrap();
        assert!(!contender.await.unwrap());
    }

    #[tokio::test]
    async fn rolled_back_transition_frees_the_row() {
        let backend = MemoryBackend::new();
        backend.create_work_item(WorkId(1)).await.unwrap();

        let mut first = backend.begin().await.unwrap();
        first
            .try_transition(
                WorkId(1),
                Status::Pending,
                Status::InProgress,
                TransitionFields::started(Utc::now()),
            )
            .await
            .unwrap();
        first.rollback().await.unwrap();

        let item = backend.get_work_item(WorkId(1)).await.unwrap();
        assert_eq!(item.status, Status::Pending);
        assert!(item.started_at.is_none());

        let mut second = backend.begin().await.unwrap();
        assert!(
            second
                .try_transition(
                    WorkId(1),
                    Status::Pending,
                    Status::InProgress,
                    TransitionFields::started(Utc::now()),
                )
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn injected_fault_fires_once() {
        let backend = backend_with_queue("q").await;
        backend.inject_fault(Fault::Publish);

        let mut unit = backend.begin().await.unwrap();
        assert!(unit.publish("q", &json!(1)).await.is_err());
        assert!(unit.publish("q", &json!(2)).await.is_ok());
    }

    #[tokio::test]
    async fn listener_wakes_on_commit_to_its_queue() {
        let backend = backend_with_queue("q").await;
        backend.declare("other").await.unwrap();
        let mut listener = backend.listen("q").await.unwrap();

        let mut unit = backend.begin().await.unwrap();
        unit.publish("other", &json!(1)).await.unwrap();
        unit.publish("q", &json!(2)).await.unwrap();
        unit.commit().await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), listener.ready())
            .await
            .expect("listener should wake")
            .unwrap();
    }
}
