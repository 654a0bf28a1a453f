//! Queue consumer: processes batch messages with per-record retries.
//!
//! Batches run concurrently across a bounded pool of consumers; records
//! within one batch run strictly sequentially. Only serialization conflicts
//! are retried; every other failure is a permanent record failure that does
//! not abort the rest of the batch.

use std::sync::Arc;
use std::time::Duration;

use crate::batch::{self, BatchStatus};
use crate::db::DbPool;
use crate::error::{ImportError, Result};
use crate::notify::NotificationSink;
use crate::processor::ProcessorRegistry;
use crate::progress::{self, ProgressCache};
use crate::queue::{BatchMessage, BatchReceiver};

pub const MAX_RECORD_ATTEMPTS: u32 = 10;

const BACKOFF_BASE_MS: u64 = 50;
const BACKOFF_CAP_MS: u64 = 1_000;

/// Exponential backoff: `min(50ms * 2^(attempt-1), 1000ms)`.
pub fn backoff_delay(attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(10);
    let millis = BACKOFF_BASE_MS.saturating_mul(1u64 << exponent);
    Duration::from_millis(millis.min(BACKOFF_CAP_MS))
}

/// Runs one record import, retrying serialization conflicts up to
/// `MAX_RECORD_ATTEMPTS` times. Any other error is returned immediately.
pub async fn retry_record<F, Fut>(mut operation: F) -> Result<Vec<String>>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<Vec<String>>>,
{
    let mut last_error = None;

    for attempt in 1..=MAX_RECORD_ATTEMPTS {
        match operation().await {
            Ok(errors) => return Ok(errors),
            Err(err) if err.is_serialization_conflict() => {
                if attempt < MAX_RECORD_ATTEMPTS {
                    let delay = backoff_delay(attempt);
                    tracing::warn!(
                        attempt,
                        max = MAX_RECORD_ATTEMPTS,
                        delay_ms = delay.as_millis() as u64,
                        "serialization conflict, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                last_error = Some(err);
            }
            Err(err) => return Err(err),
        }
    }

    Err(last_error.unwrap_or(ImportError::SerializationConflict))
}

/// Shared dependencies of the batch consumers.
#[derive(Clone)]
pub struct WorkerContext {
    pub pool: DbPool,
    pub registry: Arc<ProcessorRegistry>,
    pub cache: Arc<ProgressCache>,
    pub sink: Arc<dyn NotificationSink>,
}

/// Spawns `count` consumers over a shared receiver. Each consumer exits
/// when the queue closes.
pub fn spawn_workers(
    context: WorkerContext,
    receiver: BatchReceiver,
    count: usize,
) -> Vec<tokio::task::JoinHandle<()>> {
    (0..count)
        .map(|worker_id| {
            let context = context.clone();
            let receiver = receiver.clone();
            tokio::spawn(async move {
                tracing::debug!(worker_id, "batch worker started");
                loop {
                    let message = { receiver.lock().await.recv().await };
                    let Some(message) = message else {
                        tracing::debug!(worker_id, "batch queue closed, worker exiting");
                        break;
                    };
                    process_message(&context, message).await;
                }
            })
        })
        .collect()
}

/// Handles one batch message end to end. Never propagates an error to the
/// consumer loop; failures settle the batch as `FAILED` instead.
pub async fn process_message(context: &WorkerContext, message: BatchMessage) {
    tracing::info!(
        batch_id = %message.batch_id,
        job_id = %message.job_id,
        batch_number = message.batch_number,
        total_batches = message.total_batches,
        "processing batch"
    );

    match run_batch(context, &message).await {
        Ok(success_count) => {
            tracing::info!(
                batch_id = %message.batch_id,
                success_count,
                total = message.records.len(),
                "finished processing batch"
            );
        }
        Err(err) => {
            tracing::error!(batch_id = %message.batch_id, error = %err, "failed to process batch");
            if let Err(err) =
                batch::update_batch_status(&context.pool, message.batch_id, BatchStatus::Failed, 0)
                    .await
            {
                tracing::error!(batch_id = %message.batch_id, error = %err, "could not mark batch failed");
            }
        }
    }

    if let Err(err) =
        progress::refresh_job_status(&context.pool, &context.cache, context.sink.as_ref(), message.job_id)
            .await
    {
        tracing::error!(job_id = %message.job_id, error = %err, "failed to refresh job status");
    }
}

async fn run_batch(context: &WorkerContext, message: &BatchMessage) -> Result<usize> {
    // The ledger row may lag behind the message; the lookup retries.
    let batch = batch::get_batch_with_retry(&context.pool, message.batch_id).await?;
    batch::update_batch_status(&context.pool, batch.batch_id, BatchStatus::Processing, 0).await?;

    let processor = context.registry.get(message.entity_kind)?;

    let total = message.records.len();
    let progress_step = (total / 10).max(1);
    let mut success_count = 0usize;
    let mut errors: Vec<String> = Vec::new();

    for (index, record) in message.records.iter().enumerate() {
        match retry_record(|| processor.import_record(record, index)).await {
            Ok(record_errors) if record_errors.is_empty() => success_count += 1,
            Ok(record_errors) => errors.extend(record_errors),
            Err(err) => {
                tracing::error!(
                    batch_id = %message.batch_id,
                    record = index,
                    error = %err,
                    "record failed permanently"
                );
                errors.push(format!("Record {index}: {err}"));
            }
        }

        if index > 0 && index % progress_step == 0 {
            batch::record_progress(&context.pool, batch.batch_id, index as i32).await;
        }
    }

    let final_status = BatchStatus::from_outcome(success_count, total);
    batch::update_batch_status(
        &context.pool,
        batch.batch_id,
        final_status,
        success_count as i32,
    )
    .await?;

    if !errors.is_empty() {
        tracing::warn!(
            batch_id = %message.batch_id,
            error_count = errors.len(),
            first = errors.first().map(String::as_str).unwrap_or_default(),
            "batch finished with record errors"
        );
    }

    Ok(success_count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_is_exponential_and_capped() {
        assert_eq!(backoff_delay(1), Duration::from_millis(50));
        assert_eq!(backoff_delay(2), Duration::from_millis(100));
        assert_eq!(backoff_delay(3), Duration::from_millis(200));
        assert_eq!(backoff_delay(5), Duration::from_millis(800));
        assert_eq!(backoff_delay(6), Duration::from_millis(1_000));
        assert_eq!(backoff_delay(10), Duration::from_millis(1_000));
    }

    #[test]
    fn backoff_is_non_decreasing() {
        let mut previous = Duration::ZERO;
        for attempt in 1..=MAX_RECORD_ATTEMPTS {
            let delay = backoff_delay(attempt);
            assert!(delay >= previous);
            assert!(delay <= Duration::from_millis(1_000));
            previous = delay;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn serialization_conflicts_retry_up_to_the_limit() {
        let attempts = AtomicU32::new(0);
        let result = retry_record(|| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(ImportError::SerializationConflict) }
        })
        .await;

        assert!(matches!(result, Err(ImportError::SerializationConflict)));
        assert_eq!(attempts.load(Ordering::SeqCst), MAX_RECORD_ATTEMPTS);
    }

    #[tokio::test(start_paused = true)]
    async fn conflict_then_success_returns_ok() {
        let attempts = AtomicU32::new(0);
        let result = retry_record(|| {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Err(ImportError::SerializationConflict)
                } else {
                    Ok(Vec::new())
                }
            }
        })
        .await;

        assert!(result.unwrap().is_empty());
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn non_retryable_errors_fail_immediately() {
        let attempts = AtomicU32::new(0);
        let result = retry_record(|| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(ImportError::DuplicateKey("passport".to_string())) }
        })
        .await;

        assert!(matches!(result, Err(ImportError::DuplicateKey(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn record_errors_are_not_retried() {
        let attempts = AtomicU32::new(0);
        let result = retry_record(|| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Ok(vec!["Entity[1]: Venue is required".to_string()]) }
        })
        .await;

        assert_eq!(result.unwrap().len(), 1);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
