//! Synchronous import path for small files.
//!
//! Runs on the caller's task with the same per-record retry semantics as
//! the batch worker, but sequential end to end and with coarse ledger
//! updates every ~10% of records. A duplicate natural key aborts the
//! remaining records and fails the job with the first encountered error.

use std::sync::Arc;

use serde_json::Value;

use crate::db::DbPool;
use crate::error::{ImportError, Result};
use crate::ledger::{self, ImportJob, ImportStatus};
use crate::notify::{ImportEvent, ImportEventKind, NotificationSink};
use crate::processor::EntityKind;
use crate::processor::ProcessorRegistry;
use crate::worker::retry_record;

#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub processed_records: usize,
    pub error_records: usize,
}

pub async fn run_sync_import(
    pool: &DbPool,
    registry: &ProcessorRegistry,
    sink: &dyn NotificationSink,
    job: &ImportJob,
    entity_kind: EntityKind,
    records: &[Value],
) -> Result<SyncOutcome> {
    let total = records.len();
    tracing::info!(job_id = %job.job_id, total, "starting synchronous import");

    let processor: Arc<_> = registry.get(entity_kind)?;

    ledger::update_status(
        pool,
        job.job_id,
        ImportStatus::Processing,
        &format!("Synchronous import started. Processing {total} records"),
    )
    .await?;

    let progress_step = (total / 10).max(1);
    let mut errors: Vec<String> = Vec::new();
    let mut success_count = 0usize;

    for (index, record) in records.iter().enumerate() {
        match retry_record(|| processor.import_record(record, index)).await {
            Ok(record_errors) if record_errors.is_empty() => success_count += 1,
            Ok(record_errors) => errors.extend(record_errors),
            Err(err) if err.is_duplicate_key() => {
                // Uniqueness violations abort the remainder by design.
                let message = err.to_string();
                ledger::update_status(pool, job.job_id, ImportStatus::Failed, &message).await?;
                ledger::update_counts(
                    pool,
                    job.job_id,
                    total as i32,
                    success_count as i32,
                    (total - success_count) as i32,
                )
                .await?;
                sink.notify(ImportEvent {
                    job_id: job.job_id,
                    kind: ImportEventKind::Failed,
                    message,
                });
                return Err(err);
            }
            Err(err) => {
                tracing::error!(job_id = %job.job_id, record = index, error = %err, "record failed");
                errors.push(format!("Record {index}: {err}"));
            }
        }

        if index > 0 && index % progress_step == 0 {
            ledger::update_status(
                pool,
                job.job_id,
                ImportStatus::Processing,
                &format!("Processed {index} records"),
            )
            .await?;
            sink.notify(ImportEvent {
                job_id: job.job_id,
                kind: ImportEventKind::Processing,
                message: format!("Processed {index}/{total} records"),
            });
        }
    }

    let error_count = total - success_count;
    ledger::update_counts(
        pool,
        job.job_id,
        total as i32,
        success_count as i32,
        error_count as i32,
    )
    .await?;

    if !errors.is_empty() {
        let first = errors
            .first()
            .cloned()
            .unwrap_or_else(|| "import failed".to_string());
        let message = format!("Import failed with {} error(s): {first}", errors.len());
        ledger::update_status(pool, job.job_id, ImportStatus::Failed, &message).await?;
        sink.notify(ImportEvent {
            job_id: job.job_id,
            kind: ImportEventKind::Failed,
            message,
        });
        return Err(ImportError::Validation(errors));
    }

    ledger::update_status(
        pool,
        job.job_id,
        ImportStatus::Success,
        &format!("Successfully imported {success_count} record(s)"),
    )
    .await?;
    sink.notify(ImportEvent {
        job_id: job.job_id,
        kind: ImportEventKind::Success,
        message: format!("Import completed. Processed: {success_count}, Errors: 0"),
    });

    Ok(SyncOutcome {
        processed_records: success_count,
        error_records: error_count,
    })
}
