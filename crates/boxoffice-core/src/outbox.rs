//! Transactional file outbox.
//!
//! Rows are inserted on the caller's open transaction so the intent to
//! touch the object store commits atomically with the business write that
//! requires it. A row is pending iff `processed_at` is null; the timestamp
//! is set only after the object-store call confirms success and is never
//! cleared afterwards.

use chrono::{DateTime, Utc};
use sqlx::{PgConnection, Row};
use uuid::Uuid;

use crate::db::DbPool;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxOperation {
    Upload,
    Delete,
}

impl OutboxOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxOperation::Upload => "UPLOAD",
            OutboxOperation::Delete => "DELETE",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "UPLOAD" => Some(Self::Upload),
            "DELETE" => Some(Self::Delete),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OutboxEvent {
    pub event_id: Uuid,
    pub job_id: Uuid,
    pub operation: OutboxOperation,
    pub file_name: String,
    pub file_path: String,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

pub async fn insert_upload_event(
    conn: &mut PgConnection,
    job_id: Uuid,
    file_name: &str,
    file_path: &str,
) -> Result<Uuid> {
    insert_event(conn, job_id, OutboxOperation::Upload, file_name, file_path).await
}

pub async fn insert_delete_event(
    conn: &mut PgConnection,
    job_id: Uuid,
    file_name: &str,
) -> Result<Uuid> {
    insert_event(conn, job_id, OutboxOperation::Delete, file_name, "").await
}

async fn insert_event(
    conn: &mut PgConnection,
    job_id: Uuid,
    operation: OutboxOperation,
    file_name: &str,
    file_path: &str,
) -> Result<Uuid> {
    let event_id = Uuid::new_v4();
    sqlx::query(
        r#"
            INSERT INTO file_outbox (event_id, job_id, operation, file_name, file_path)
            VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(event_id)
    .bind(job_id)
    .bind(operation.as_str())
    .bind(file_name)
    .bind(file_path)
    .execute(conn)
    .await?;

    tracing::info!(%job_id, operation = operation.as_str(), file_name, "created outbox event");
    Ok(event_id)
}

/// Oldest pending events, up to `limit`.
pub async fn pending_events(pool: &DbPool, limit: i64) -> Result<Vec<OutboxEvent>> {
    let rows = sqlx::query(
        r#"
            SELECT event_id, job_id, operation, file_name, file_path, created_at, processed_at
            FROM file_outbox
            WHERE processed_at IS NULL
            ORDER BY created_at ASC
            LIMIT $1
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;

    let mut events = Vec::with_capacity(rows.len());
    for row in rows {
        let operation_str: String = row.try_get("operation")?;
        let Some(operation) = OutboxOperation::parse(&operation_str) else {
            tracing::warn!(operation = operation_str, "skipping outbox row with unknown operation");
            continue;
        };
        events.push(OutboxEvent {
            event_id: row.try_get("event_id")?,
            job_id: row.try_get("job_id")?,
            operation,
            file_name: row.try_get("file_name")?,
            file_path: row.try_get("file_path")?,
            created_at: row.try_get("created_at")?,
            processed_at: row.try_get("processed_at")?,
        });
    }

    Ok(events)
}

/// Marks an event delivered. Returns false when the row was already
/// processed, letting duplicate deliveries detect each other.
pub async fn mark_processed(pool: &DbPool, event_id: Uuid) -> Result<bool> {
    let result = sqlx::query(
        r#"
            UPDATE file_outbox
            SET processed_at = now()
            WHERE event_id = $1 AND processed_at IS NULL
        "#,
    )
    .bind(event_id)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}
