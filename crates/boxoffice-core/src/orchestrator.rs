//! Top-level entry point for one import submission.
//!
//! Creates the job ledger row and the UPLOAD outbox intent in a single
//! database transaction, spools the raw bytes for the delivery agent, then
//! routes the parsed records down the synchronous or asynchronous path
//! based on the configured record-count threshold.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::classify::describe_db_error;
use crate::config::ImportConfig;
use crate::db::DbPool;
use crate::error::{ImportError, Result};
use crate::ledger::{self, ImportJob, ImportStatus};
use crate::notify::{ImportEvent, ImportEventKind, NotificationSink};
use crate::outbox;
use crate::planner;
use crate::processor::{EntityKind, ProcessorRegistry};
use crate::progress::ProgressCache;
use crate::queue::BatchQueue;
use crate::sync_import;
use crate::validate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportMode {
    Sync,
    Async,
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportResponse {
    pub job_id: Uuid,
    pub filename: String,
    pub entity_type: String,
    pub mode: ImportMode,
    pub message: String,
    pub total_records: usize,
    pub processed_records: usize,
    pub error_records: usize,
}

/// Bundle of pipeline collaborators shared by the API and CLI surfaces.
pub struct ImportPipeline {
    pool: DbPool,
    queue: Arc<dyn BatchQueue>,
    registry: Arc<ProcessorRegistry>,
    cache: Arc<ProgressCache>,
    sink: Arc<dyn NotificationSink>,
    config: ImportConfig,
}

impl ImportPipeline {
    pub fn new(
        pool: DbPool,
        queue: Arc<dyn BatchQueue>,
        registry: Arc<ProcessorRegistry>,
        cache: Arc<ProgressCache>,
        sink: Arc<dyn NotificationSink>,
        config: ImportConfig,
    ) -> Self {
        Self {
            pool,
            queue,
            registry,
            cache,
            sink,
            config,
        }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub fn config(&self) -> &ImportConfig {
        &self.config
    }

    /// Imports one uploaded file. On success returns the response
    /// descriptor; on failure the job ledger always reflects the terminal
    /// state before the error reaches the caller.
    pub async fn import_file(
        &self,
        original_filename: &str,
        entity_type: &str,
        bytes: &[u8],
    ) -> Result<ImportResponse> {
        let job = self.create_job_with_upload_intent(original_filename, entity_type, bytes).await?;

        match self.run_import(&job, entity_type, bytes).await {
            Ok(response) => Ok(response),
            Err(err) => Err(self.record_failure(&job, err).await),
        }
    }

    /// Creates the job row and the UPLOAD outbox event atomically, spooling
    /// the file contents last. A failure at any point leaves neither a spool
    /// file nor a ledger row behind; a crash after the commit leaves both,
    /// and the delivery agent picks the upload up.
    async fn create_job_with_upload_intent(
        &self,
        original_filename: &str,
        entity_type: &str,
        bytes: &[u8],
    ) -> Result<ImportJob> {
        tokio::fs::create_dir_all(&self.config.spool_dir).await?;

        let mut tx = self.pool.begin().await?;
        let job = ledger::create_pending(&mut *tx, original_filename, entity_type).await?;

        let spool_path = self.spool_path(&job.filename);
        outbox::insert_upload_event(
            &mut *tx,
            job.job_id,
            &job.filename,
            &spool_path.to_string_lossy(),
        )
        .await?;

        if let Err(err) = tokio::fs::write(&spool_path, bytes).await {
            // A failed write can still leave a partial file.
            let _ = tokio::fs::remove_file(&spool_path).await;
            return Err(err.into());
        }

        if let Err(err) = tx.commit().await {
            // The intent rows are gone; the spool file must not outlive them.
            if let Err(remove_err) = tokio::fs::remove_file(&spool_path).await {
                tracing::warn!(
                    path = %spool_path.display(),
                    error = %remove_err,
                    "could not remove spool file after failed commit"
                );
            }
            return Err(err.into());
        }

        tracing::info!(
            job_id = %job.job_id,
            filename = job.filename,
            size = bytes.len(),
            "created import job with upload intent"
        );
        Ok(job)
    }

    async fn run_import(
        &self,
        job: &ImportJob,
        entity_type: &str,
        bytes: &[u8],
    ) -> Result<ImportResponse> {
        let entity_kind = EntityKind::parse(entity_type)
            .ok_or_else(|| ImportError::NoProcessor(entity_type.to_string()))?;
        // Fails fast when no processor is registered for the kind.
        self.registry.get(entity_kind)?;

        let records = validate::parse_records(bytes)?;
        let total = records.len();
        ledger::update_counts(&self.pool, job.job_id, total as i32, 0, 0).await?;

        if total > self.config.sync_threshold {
            tracing::info!(job_id = %job.job_id, total, "using asynchronous processing");
            let total_batches = planner::start_async_import(
                &self.pool,
                self.queue.as_ref(),
                &self.cache,
                self.sink.as_ref(),
                job,
                entity_kind,
                records,
            )
            .await?;

            Ok(ImportResponse {
                job_id: job.job_id,
                filename: job.filename.clone(),
                entity_type: entity_type.to_string(),
                mode: ImportMode::Async,
                message: format!(
                    "Asynchronous import started. Processing {total} {entity_type} records in \
                     {total_batches} batches. Use job id '{}' to track progress.",
                    job.job_id
                ),
                total_records: total,
                processed_records: 0,
                error_records: 0,
            })
        } else {
            tracing::info!(job_id = %job.job_id, total, "using synchronous processing");
            let outcome = sync_import::run_sync_import(
                &self.pool,
                &self.registry,
                self.sink.as_ref(),
                job,
                entity_kind,
                &records,
            )
            .await?;

            Ok(ImportResponse {
                job_id: job.job_id,
                filename: job.filename.clone(),
                entity_type: entity_type.to_string(),
                mode: ImportMode::Sync,
                message: format!(
                    "Import completed. Processed: {}, Errors: {}",
                    outcome.processed_records, outcome.error_records
                ),
                total_records: total,
                processed_records: outcome.processed_records,
                error_records: outcome.error_records,
            })
        }
    }

    /// Persists the terminal failure state before re-raising, so the ledger
    /// is never inconsistent with what the caller is told.
    async fn record_failure(&self, job: &ImportJob, err: ImportError) -> ImportError {
        let (status, description, returned) = match err {
            ImportError::Validation(errors) => {
                let description = format!("Validation errors: {}", errors.join("; "));
                (
                    ImportStatus::ValidationFailed,
                    description,
                    ImportError::Validation(errors),
                )
            }
            ImportError::NoProcessor(kind) => {
                let description = format!("No import processor for entity type '{kind}'");
                (
                    ImportStatus::Failed,
                    description,
                    ImportError::NoProcessor(kind),
                )
            }
            ImportError::DuplicateKey(detail) => (
                ImportStatus::Failed,
                detail.clone(),
                ImportError::DuplicateKey(detail),
            ),
            ImportError::Database(db_err) => {
                let description = describe_db_error(&db_err);
                (
                    ImportStatus::Failed,
                    description.clone(),
                    ImportError::System(description),
                )
            }
            other => {
                let description = format!("System error: {other}");
                (
                    ImportStatus::Failed,
                    description.clone(),
                    ImportError::System(description),
                )
            }
        };

        // The sync path may have already settled the job; never overwrite a
        // terminal status here.
        match ledger::get_job(&self.pool, job.job_id).await {
            Ok(current) if !current.status.is_terminal() => {
                if let Err(update_err) =
                    ledger::update_status(&self.pool, job.job_id, status, &description).await
                {
                    tracing::error!(
                        job_id = %job.job_id,
                        error = %update_err,
                        "failed to persist import failure"
                    );
                }
                self.sink.notify(ImportEvent {
                    job_id: job.job_id,
                    kind: ImportEventKind::from_status(status),
                    message: description.clone(),
                });
            }
            Ok(_) => {}
            Err(lookup_err) => {
                tracing::error!(job_id = %job.job_id, error = %lookup_err, "failed to load job");
            }
        }

        tracing::warn!(job_id = %job.job_id, description, "import failed");
        returned
    }

    fn spool_path(&self, filename: &str) -> PathBuf {
        self.config.spool_dir.join(filename)
    }
}
