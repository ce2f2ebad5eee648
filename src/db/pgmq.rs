//! pgmq queue operations via direct SQLx.
//!
//! Calls pgmq's SQL functions: pgmq.create, pgmq.send, pgmq.read,
//! pgmq.set_vt, pgmq.archive, pgmq.delete. Sends also raise a
//! `pg_notify` on [`READY_CHANNEL`] with the queue name as payload; being
//! transactional, it only fires when the sending transaction commits.

use async_trait::async_trait;
use sqlx::PgConnection;
use sqlx::postgres::PgListener;
use std::time::Duration;

use crate::backend::{Channel, Delivery, ReadyListener};
use crate::error::Result;
use crate::telemetry::metrics;
use opentelemetry::KeyValue;

/// NOTIFY channel used to wake consumers.
pub const READY_CHANNEL: &str = "txflow_queue_ready";

/// pgmq turns queue names into table names, where `-` is not allowed.
pub fn pgmq_name(queue: &str) -> String {
    queue.replace('-', "_")
}

fn record(queue: &str, operation: &'static str) {
    metrics::queue_operations().add(
        1,
        &[
            KeyValue::new("queue", queue.to_string()),
            KeyValue::new("operation", operation),
        ],
    );
}

fn seconds(d: Duration) -> i32 {
    i32::try_from(d.as_secs()).unwrap_or(i32::MAX)
}

#[async_trait]
impl Channel for super::Db {
    type Listener = PgQueueListener;

    async fn declare(&self, queue: &str) -> Result<()> {
        sqlx::query("SELECT pgmq.create($1)")
            .bind(pgmq_name(queue))
            .execute(self.pool())
            .await?;
        record(queue, "create");
        Ok(())
    }

    async fn receive(&self, queue: &str, visibility: Duration) -> Result<Option<Delivery>> {
        // pgmq's visibility timeout has whole-second granularity.
        let vt = seconds(visibility).max(1);
        let row = sqlx::query_as::<
            _,
            (
                i64,
                i32,
                chrono::DateTime<chrono::Utc>,
                serde_json::Value,
            ),
        >("SELECT msg_id, read_ct, enqueued_at, message FROM pgmq.read($1, $2, 1)")
        .bind(pgmq_name(queue))
        .bind(vt)
        .fetch_optional(self.pool())
        .await?;

        let delivery = row.map(|(msg_id, read_ct, enqueued_at, payload)| Delivery {
            queue: queue.to_string(),
            msg_id,
            read_ct,
            enqueued_at,
            payload,
        });

        record(
            queue,
            if delivery.is_some() {
                "read"
            } else {
                "read_empty"
            },
        );

        Ok(delivery)
    }

    async fn release(&self, delivery: &Delivery, delay: Duration) -> Result<()> {
        let mut conn = self.pool().acquire().await?;
        set_vt_on(&mut conn, &delivery.queue, delivery.msg_id, seconds(delay)).await
    }

    async fn listen(&self, queue: &str) -> Result<PgQueueListener> {
        let mut listener = PgListener::connect_with(self.pool()).await?;
        listener.listen(READY_CHANNEL).await?;
        Ok(PgQueueListener {
            listener,
            queue: queue.to_string(),
        })
    }
}

/// LISTEN connection filtered to one queue's commit notifications.
pub struct PgQueueListener {
    listener: PgListener,
    queue: String,
}

#[async_trait]
impl ReadyListener for PgQueueListener {
    async fn ready(&mut self) -> Result<()> {
        loop {
            let notification = self.listener.recv().await?;
            if notification.payload() == self.queue {
                return Ok(());
            }
        }
    }
}

/// Send a message on an open connection. Returns the message ID.
pub(crate) async fn send_on(
    conn: &mut PgConnection,
    queue: &str,
    payload: &serde_json::Value,
) -> Result<i64> {
    let row: (i64,) = sqlx::query_as("SELECT pgmq.send($1, $2, $3)")
        .bind(pgmq_name(queue))
        .bind(payload)
        .bind(0i32)
        .fetch_one(&mut *conn)
        .await?;

    sqlx::query("SELECT pg_notify($1, $2)")
        .bind(READY_CHANNEL)
        .bind(queue)
        .execute(&mut *conn)
        .await?;

    record(queue, "send");
    Ok(row.0)
}

/// Delete a message permanently.
pub(crate) async fn delete_on(conn: &mut PgConnection, queue: &str, msg_id: i64) -> Result<()> {
    sqlx::query("SELECT pgmq.delete($1, $2)")
        .bind(pgmq_name(queue))
        .bind(msg_id)
        .execute(&mut *conn)
        .await?;
    record(queue, "delete");
    Ok(())
}

/// Archive a message (moves to the archive table, kept for inspection).
pub(crate) async fn archive_on(conn: &mut PgConnection, queue: &str, msg_id: i64) -> Result<()> {
    sqlx::query("SELECT pgmq.archive($1, $2)")
        .bind(pgmq_name(queue))
        .bind(msg_id)
        .execute(&mut *conn)
        .await?;
    record(queue, "archive");
    Ok(())
}

/// Move a message's visibility to `now + offset_seconds`.
pub(crate) async fn set_vt_on(
    conn: &mut PgConnection,
    queue: &str,
    msg_id: i64,
    offset_seconds: i32,
) -> Result<()> {
    sqlx::query("SELECT msg_id FROM pgmq.set_vt($1, $2, $3)")
        .bind(pgmq_name(queue))
        .bind(msg_id)
        .bind(offset_seconds)
        .execute(&mut *conn)
        .await?;
    record(queue, "set_vt");
    Ok(())
}
