//! Protocol roles: coordinator, worker, completer, and the consume loop the
//! two message-driven roles share.

pub mod completer;
pub mod consumer;
pub mod coordinator;
pub mod worker;

pub use completer::{Completer, ReplyHandler};
pub use consumer::{Consumer, ConsumerConfig, DeliveryHandler};
pub use coordinator::Coordinator;
pub use worker::{RequestHandler, SimulatedTask, Task, Worker};

use crate::backend::UnitOfWork;
use tracing::warn;

/// Roll back, logging any failure. The caller returns its own error.
pub(crate) async fn rollback_quietly<U: UnitOfWork>(unit: U) {
    if let Err(e) = unit.rollback().await {
        warn!("rollback failed: {e}");
    }
}
