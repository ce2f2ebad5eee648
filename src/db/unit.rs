//! Units of work over a single Postgres transaction.
//!
//! Because the queues are pgmq tables, a publish is an INSERT and an ack is
//! a DELETE in the same transaction as the `work_items` update. Commit makes
//! all of it visible at once; rollback (or dropping the unit) discards it,
//! and an un-deleted message resurfaces when its visibility timeout lapses.

use async_trait::async_trait;
use sqlx::{Postgres, Transaction};

use super::{pgmq, work};
use crate::backend::{Delivery, Transactor, UnitOfWork};
use crate::error::Result;
use crate::model::{Status, TransitionFields, WorkId};

/// A unit of work holding one pooled connection with an open transaction.
pub struct PgUnit {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl Transactor for super::Db {
    type Unit = PgUnit;

    async fn begin(&self) -> Result<PgUnit> {
        Ok(PgUnit {
            tx: self.pool().begin().await?,
        })
    }
}

#[async_trait]
impl UnitOfWork for PgUnit {
    async fn try_transition(
        &mut self,
        id: WorkId,
        from: Status,
        to: Status,
        fields: TransitionFields,
    ) -> Result<bool> {
        work::try_transition_on(&mut self.tx, id, from, to, &fields).await
    }

    async fn publish(&mut self, queue: &str, payload: &serde_json::Value) -> Result<()> {
        pgmq::send_on(&mut self.tx, queue, payload).await?;
        Ok(())
    }

    async fn ack(&mut self, delivery: &Delivery) -> Result<()> {
        pgmq::delete_on(&mut self.tx, &delivery.queue, delivery.msg_id).await
    }

    async fn nack(&mut self, delivery: &Delivery, requeue: bool) -> Result<()> {
        if requeue {
            pgmq::set_vt_on(&mut self.tx, &delivery.queue, delivery.msg_id, 0).await
        } else {
            pgmq::archive_on(&mut self.tx, &delivery.queue, delivery.msg_id).await
        }
    }

    async fn commit(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
