//! Persisted state machine for import jobs.
//!
//! Job rows are an audit trail: they are never deleted and are mutated only
//! through the transition calls below.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::Row;
use uuid::Uuid;

use crate::db::DbPool;
use crate::error::{ImportError, Result};
use crate::outbox;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ImportStatus {
    Pending,
    Processing,
    Success,
    PartialSuccess,
    Failed,
    ValidationFailed,
}

impl ImportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImportStatus::Pending => "PENDING",
            ImportStatus::Processing => "PROCESSING",
            ImportStatus::Success => "SUCCESS",
            ImportStatus::PartialSuccess => "PARTIAL_SUCCESS",
            ImportStatus::Failed => "FAILED",
            ImportStatus::ValidationFailed => "VALIDATION_FAILED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(Self::Pending),
            "PROCESSING" => Some(Self::Processing),
            "SUCCESS" => Some(Self::Success),
            "PARTIAL_SUCCESS" => Some(Self::PartialSuccess),
            "FAILED" => Some(Self::Failed),
            "VALIDATION_FAILED" => Some(Self::ValidationFailed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ImportStatus::Success
                | ImportStatus::PartialSuccess
                | ImportStatus::Failed
                | ImportStatus::ValidationFailed
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportJob {
    pub job_id: Uuid,
    pub filename: String,
    pub entity_type: String,
    pub status: ImportStatus,
    pub result_description: String,
    pub total_records: i32,
    pub processed_records: i32,
    pub error_records: i32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobPage {
    pub jobs: Vec<ImportJob>,
    pub page: i64,
    pub per_page: i64,
    pub total: i64,
}

/// Creates a job in `PENDING` on the caller's transaction, so it commits
/// atomically with the UPLOAD outbox intent.
pub async fn create_pending(
    conn: &mut sqlx::PgConnection,
    original_filename: &str,
    entity_type: &str,
) -> Result<ImportJob> {
    let job_id = Uuid::new_v4();
    // Uploads are keyed by this name; the uuid prefix makes it unique and
    // the object-store operations deterministic.
    let filename = format!("{}_{}", Uuid::new_v4(), original_filename);

    let row = sqlx::query(
        r#"
            INSERT INTO import_jobs (job_id, filename, entity_type, status, result_description)
            VALUES ($1, $2, $3, 'PENDING', 'Import initiated')
            RETURNING created_at
        "#,
    )
    .bind(job_id)
    .bind(&filename)
    .bind(entity_type)
    .fetch_one(conn)
    .await?;

    Ok(ImportJob {
        job_id,
        filename,
        entity_type: entity_type.to_string(),
        status: ImportStatus::Pending,
        result_description: "Import initiated".to_string(),
        total_records: 0,
        processed_records: 0,
        error_records: 0,
        created_at: row.try_get("created_at")?,
    })
}

pub async fn get_job(pool: &DbPool, job_id: Uuid) -> Result<ImportJob> {
    let row = sqlx::query(
        r#"
            SELECT job_id, filename, entity_type, status, result_description,
                   total_records, processed_records, error_records, created_at
            FROM import_jobs
            WHERE job_id = $1
        "#,
    )
    .bind(job_id)
    .fetch_optional(pool)
    .await?
    .ok_or(ImportError::JobNotFound(job_id))?;

    job_from_row(&row)
}

/// Transitions a job's status, recording the compensation DELETE outbox
/// event in the same transaction when the job newly becomes `FAILED`.
pub async fn update_status(
    pool: &DbPool,
    job_id: Uuid,
    status: ImportStatus,
    description: &str,
) -> Result<()> {
    let mut tx = pool.begin().await?;

    let row = sqlx::query(
        r#"
            SELECT filename, status FROM import_jobs
            WHERE job_id = $1
            FOR UPDATE
        "#,
    )
    .bind(job_id)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or(ImportError::JobNotFound(job_id))?;

    let filename: String = row.try_get("filename")?;
    let previous: String = row.try_get("status")?;
    let previous = ImportStatus::parse(&previous);

    sqlx::query(
        r#"
            UPDATE import_jobs
            SET status = $1, result_description = $2
            WHERE job_id = $3
        "#,
    )
    .bind(status.as_str())
    .bind(description)
    .bind(job_id)
    .execute(&mut *tx)
    .await?;

    if status == ImportStatus::Failed && previous != Some(ImportStatus::Failed) {
        outbox::insert_delete_event(&mut *tx, job_id, &filename).await?;
        tracing::info!(%job_id, filename, "compensation: scheduled file delete after import failure");
    }

    tx.commit().await?;

    tracing::info!(%job_id, status = status.as_str(), "updated import status");
    Ok(())
}

pub async fn update_counts(
    pool: &DbPool,
    job_id: Uuid,
    total: i32,
    processed: i32,
    errors: i32,
) -> Result<()> {
    sqlx::query(
        r#"
            UPDATE import_jobs
            SET total_records = $1, processed_records = $2, error_records = $3
            WHERE job_id = $4
        "#,
    )
    .bind(total)
    .bind(processed)
    .bind(errors)
    .bind(job_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Paged listing, newest first.
pub async fn list_jobs_page(pool: &DbPool, page: i64, per_page: i64) -> Result<JobPage> {
    let page = page.max(1);
    let per_page = per_page.clamp(1, 200);

    let total: i64 = sqlx::query(r#"SELECT count(*) AS total FROM import_jobs"#)
        .fetch_one(pool)
        .await?
        .try_get("total")?;

    let rows = sqlx::query(
        r#"
            SELECT job_id, filename, entity_type, status, result_description,
                   total_records, processed_records, error_records, created_at
            FROM import_jobs
            ORDER BY created_at DESC
            LIMIT $1 OFFSET $2
        "#,
    )
    .bind(per_page)
    .bind((page - 1) * per_page)
    .fetch_all(pool)
    .await?;

    let mut jobs = Vec::with_capacity(rows.len());
    for row in rows {
        jobs.push(job_from_row(&row)?);
    }

    Ok(JobPage {
        jobs,
        page,
        per_page,
        total,
    })
}

/// Crash recovery: jobs whose owning process died mid-flight can never
/// self-complete, so anything non-terminal is forced to `FAILED` before the
/// service accepts new imports. Coarse and non-resumable.
pub async fn fail_incomplete_jobs(pool: &DbPool) -> Result<u64> {
    let rows = sqlx::query(
        r#"
            SELECT job_id, status FROM import_jobs
            WHERE status NOT IN ('SUCCESS', 'PARTIAL_SUCCESS', 'FAILED', 'VALIDATION_FAILED')
        "#,
    )
    .fetch_all(pool)
    .await?;

    if rows.is_empty() {
        tracing::info!("no incomplete import jobs found on startup");
        return Ok(0);
    }

    let mut failed = 0u64;
    for row in rows {
        let job_id: Uuid = row.try_get("job_id")?;
        let previous: String = row.try_get("status")?;
        update_status(
            pool,
            job_id,
            ImportStatus::Failed,
            "Import interrupted by process restart",
        )
        .await?;
        tracing::debug!(%job_id, previous, "marked interrupted import job as failed");
        failed += 1;
    }

    tracing::info!(count = failed, "marked incomplete import jobs as failed");
    Ok(failed)
}

fn job_from_row(row: &sqlx::postgres::PgRow) -> Result<ImportJob> {
    let status_str: String = row.try_get("status")?;
    let status = ImportStatus::parse(&status_str)
        .ok_or_else(|| ImportError::System(format!("invalid job status '{status_str}'")))?;

    Ok(ImportJob {
        job_id: row.try_get("job_id")?,
        filename: row.try_get("filename")?,
        entity_type: row.try_get("entity_type")?,
        status,
        result_description: row.try_get("result_description")?,
        total_records: row.try_get("total_records")?,
        processed_records: row.try_get("processed_records")?,
        error_records: row.try_get("error_records")?,
        created_at: row.try_get("created_at")?,
    })
}
