//! Persisted state machine for one batch within an import job.

use serde::Serialize;
use serde_json::Value;
use sqlx::Row;
use uuid::Uuid;

use crate::db::DbPool;
use crate::error::{ImportError, Result};
use crate::worker::backoff_delay;

/// Ledger-row lookups tolerate the race against asynchronous row
/// visibility with this many attempts.
pub const LOOKUP_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    Pending,
    Processing,
    Success,
    PartialSuccess,
    Failed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Pending => "PENDING",
            BatchStatus::Processing => "PROCESSING",
            BatchStatus::Success => "SUCCESS",
            BatchStatus::PartialSuccess => "PARTIAL_SUCCESS",
            BatchStatus::Failed => "FAILED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(Self::Pending),
            "PROCESSING" => Some(Self::Processing),
            "SUCCESS" => Some(Self::Success),
            "PARTIAL_SUCCESS" => Some(Self::PartialSuccess),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BatchStatus::Success | BatchStatus::PartialSuccess | BatchStatus::Failed
        )
    }

    /// Final status of a batch after all its records were attempted.
    pub fn from_outcome(success_count: usize, total_records: usize) -> Self {
        if success_count == total_records {
            BatchStatus::Success
        } else if success_count > 0 {
            BatchStatus::PartialSuccess
        } else {
            BatchStatus::Failed
        }
    }
}

#[derive(Debug, Clone)]
pub struct ImportBatch {
    pub batch_id: Uuid,
    pub job_id: Uuid,
    pub batch_number: i32,
    pub batch_size: i32,
    pub batch_status: BatchStatus,
    pub processed_records: i32,
}

/// Status, size, and processed count of one batch, as seen by the
/// progress aggregator.
#[derive(Debug, Clone, Copy)]
pub struct BatchOutcome {
    pub status: BatchStatus,
    pub batch_size: i32,
    pub processed_records: i32,
}

/// Inserts a `PENDING` batch row. Committed before the corresponding queue
/// message is published.
pub async fn create_batch(
    pool: &DbPool,
    job_id: Uuid,
    batch_number: i32,
    records: &[Value],
) -> Result<Uuid> {
    let batch_id = Uuid::new_v4();
    sqlx::query(
        r#"
            INSERT INTO import_batches
                (batch_id, job_id, batch_number, batch_size, batch_status, processed_records, records)
            VALUES ($1, $2, $3, $4, 'PENDING', 0, $5)
        "#,
    )
    .bind(batch_id)
    .bind(job_id)
    .bind(batch_number)
    .bind(records.len() as i32)
    .bind(Value::Array(records.to_vec()))
    .execute(pool)
    .await?;

    Ok(batch_id)
}

pub async fn get_batch(pool: &DbPool, batch_id: Uuid) -> Result<Option<ImportBatch>> {
    let row = sqlx::query(
        r#"
            SELECT batch_id, job_id, batch_number, batch_size, batch_status, processed_records
            FROM import_batches
            WHERE batch_id = $1
        "#,
    )
    .bind(batch_id)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let status_str: String = row.try_get("batch_status")?;
    let batch_status = BatchStatus::parse(&status_str)
        .ok_or_else(|| ImportError::System(format!("invalid batch status '{status_str}'")))?;

    Ok(Some(ImportBatch {
        batch_id: row.try_get("batch_id")?,
        job_id: row.try_get("job_id")?,
        batch_number: row.try_get("batch_number")?,
        batch_size: row.try_get("batch_size")?,
        batch_status,
        processed_records: row.try_get("processed_records")?,
    }))
}

/// Fetches a batch row, retrying with backoff when it is not yet visible.
/// A message can legitimately arrive before the row that created it is
/// readable from this connection.
pub async fn get_batch_with_retry(pool: &DbPool, batch_id: Uuid) -> Result<ImportBatch> {
    for attempt in 1..=LOOKUP_ATTEMPTS {
        match get_batch(pool, batch_id).await {
            Ok(Some(batch)) => return Ok(batch),
            Ok(None) => {
                tracing::debug!(
                    %batch_id,
                    attempt,
                    "batch row not yet visible, retrying lookup"
                );
            }
            Err(err) => {
                tracing::warn!(%batch_id, attempt, error = %err, "batch lookup failed");
                if attempt == LOOKUP_ATTEMPTS {
                    return Err(err);
                }
            }
        }
        if attempt < LOOKUP_ATTEMPTS {
            tokio::time::sleep(backoff_delay(attempt)).await;
        }
    }
    Err(ImportError::BatchNotFound(batch_id))
}

pub async fn update_batch_status(
    pool: &DbPool,
    batch_id: Uuid,
    status: BatchStatus,
    processed: i32,
) -> Result<()> {
    sqlx::query(
        r#"
            UPDATE import_batches
            SET batch_status = $1, processed_records = $2
            WHERE batch_id = $3
        "#,
    )
    .bind(status.as_str())
    .bind(processed)
    .bind(batch_id)
    .execute(pool)
    .await?;

    tracing::debug!(%batch_id, status = status.as_str(), processed, "updated batch status");
    Ok(())
}

pub async fn update_batch_progress(pool: &DbPool, batch_id: Uuid, processed: i32) -> Result<()> {
    sqlx::query(
        r#"
            UPDATE import_batches
            SET processed_records = $1
            WHERE batch_id = $2
        "#,
    )
    .bind(processed)
    .bind(batch_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Best-effort mid-batch progress write. The records already committed are
/// durable regardless, so a failed progress hint is logged and swallowed
/// rather than aborting the remainder of the batch.
pub async fn record_progress(pool: &DbPool, batch_id: Uuid, processed: i32) {
    if let Err(err) = update_batch_progress(pool, batch_id, processed).await {
        tracing::warn!(
            %batch_id,
            processed,
            error = %err,
            "progress update failed, continuing batch"
        );
    }
}

/// All batch outcomes for a job; the aggregator's sole input.
pub async fn batch_outcomes_for_job(pool: &DbPool, job_id: Uuid) -> Result<Vec<BatchOutcome>> {
    let rows = sqlx::query(
        r#"
            SELECT batch_status, batch_size, processed_records
            FROM import_batches
            WHERE job_id = $1
            ORDER BY batch_number ASC
        "#,
    )
    .bind(job_id)
    .fetch_all(pool)
    .await?;

    let mut outcomes = Vec::with_capacity(rows.len());
    for row in rows {
        let status_str: String = row.try_get("batch_status")?;
        let Some(status) = BatchStatus::parse(&status_str) else {
            tracing::warn!(%job_id, status = status_str, "skipping batch with unknown status");
            continue;
        };
        outcomes.push(BatchOutcome {
            status,
            batch_size: row.try_get("batch_size")?,
            processed_records: row.try_get("processed_records")?,
        });
    }

    Ok(outcomes)
}
