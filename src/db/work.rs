//! Work item rows: seeding, lookup, and the conditional status update.

use async_trait::async_trait;
use sqlx::PgConnection;

use crate::backend::WorkStore;
use crate::error::{Error, Result};
use crate::model::{Status, TransitionFields, WorkId, WorkItem, validate_transition};
use crate::telemetry::metrics;
use opentelemetry::KeyValue;

#[async_trait]
impl WorkStore for super::Db {
    async fn create_work_item(&self, id: WorkId) -> Result<bool> {
        let inserted: Option<(i64,)> = sqlx::query_as(
            "INSERT INTO work_items (id, status) VALUES ($1, $2)
             ON CONFLICT (id) DO NOTHING
             RETURNING id",
        )
        .bind(id.0)
        .bind(Status::Pending.as_str())
        .fetch_optional(self.pool())
        .await?;
        Ok(inserted.is_some())
    }

    async fn get_work_item(&self, id: WorkId) -> Result<WorkItem> {
        let row: Option<WorkItemRow> = sqlx::query_as(
            "SELECT id, status, started_at, completed_at, result FROM work_items WHERE id = $1",
        )
        .bind(id.0)
        .fetch_optional(self.pool())
        .await?;

        row.ok_or(Error::NotFound(id))?.try_into_work_item()
    }

    async fn list_work_items(&self, status: Option<Status>, limit: i64) -> Result<Vec<WorkItem>> {
        let rows: Vec<WorkItemRow> = sqlx::query_as(
            "SELECT id, status, started_at, completed_at, result FROM work_items
             WHERE ($1::text IS NULL OR status = $1)
             ORDER BY id
             LIMIT $2",
        )
        .bind(status.map(Status::as_str))
        .bind(limit)
        .fetch_all(self.pool())
        .await?;

        rows.into_iter()
            .map(WorkItemRow::try_into_work_item)
            .collect()
    }
}

/// Conditional status update on an open transaction.
///
/// Under READ COMMITTED a concurrent update of the same row blocks on the row
/// lock and re-evaluates `status = from` once the holder commits, so exactly
/// one of several racing callers sees `true`.
pub(crate) async fn try_transition_on(
    conn: &mut PgConnection,
    id: WorkId,
    from: Status,
    to: Status,
    fields: &TransitionFields,
) -> Result<bool> {
    if !validate_transition(from, to)? {
        ensure_exists(conn, id).await?;
        record_transition(from, to, false);
        return Ok(false);
    }

    let rows_affected = sqlx::query(
        "UPDATE work_items
         SET status = $1,
             started_at = COALESCE($2, started_at),
             completed_at = COALESCE($3, completed_at),
             result = COALESCE($4, result)
         WHERE id = $5 AND status = $6",
    )
    .bind(to.as_str())
    .bind(fields.started_at)
    .bind(fields.completed_at)
    .bind(fields.result.as_deref())
    .bind(id.0)
    .bind(from.as_str())
    .execute(&mut *conn)
    .await?
    .rows_affected();

    let applied = rows_affected > 0;
    if !applied {
        ensure_exists(conn, id).await?;
    }
    record_transition(from, to, applied);

    Ok(applied)
}

async fn ensure_exists(conn: &mut PgConnection, id: WorkId) -> Result<()> {
    let exists: Option<(i64,)> = sqlx::query_as("SELECT id FROM work_items WHERE id = $1")
        .bind(id.0)
        .fetch_optional(&mut *conn)
        .await?;
    exists.map(|_| ()).ok_or(Error::NotFound(id))
}

fn record_transition(from: Status, to: Status, applied: bool) {
    metrics::work_state_transitions().add(
        1,
        &[
            KeyValue::new("from", from.as_str()),
            KeyValue::new("to", to.as_str()),
            KeyValue::new("applied", applied),
        ],
    );
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct WorkItemRow {
    id: i64,
    status: String,
    started_at: Option<chrono::DateTime<chrono::Utc>>,
    completed_at: Option<chrono::DateTime<chrono::Utc>>,
    result: Option<String>,
}

impl WorkItemRow {
    fn try_into_work_item(self) -> Result<WorkItem> {
        Ok(WorkItem {
            id: WorkId(self.id),
            status: self.status.parse()?,
            started_at: self.started_at,
            completed_at: self.completed_at,
            result: self.result,
        })
    }
}
