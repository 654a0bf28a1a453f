//! Splits a record set into batches and fans them out to the queue.

use rand::Rng;
use serde_json::Value;
use uuid::Uuid;

use crate::batch;
use crate::db::DbPool;
use crate::error::Result;
use crate::ledger::{self, ImportJob, ImportStatus};
use crate::notify::{ImportEvent, ImportEventKind, NotificationSink};
use crate::processor::EntityKind;
use crate::progress::ProgressCache;
use crate::queue::{BatchMessage, BatchQueue};

pub const MIN_BATCH_SIZE: usize = 1_000;
pub const MAX_BATCH_SIZE: usize = 50_000;

/// Batch size for a record set: a random 5-10% of the total, clamped to
/// [MIN_BATCH_SIZE, MAX_BATCH_SIZE]. Randomized sizing spreads write
/// contention across concurrently processed batches instead of hitting the
/// same rows in lock-step.
pub fn batch_size_for(total_records: usize) -> usize {
    let percentage = 5.0 + rand::thread_rng().gen::<f64>() * 5.0;
    let size = (total_records as f64 * (percentage / 100.0)) as usize;
    size.clamp(MIN_BATCH_SIZE, MAX_BATCH_SIZE)
}

/// Contiguous chunks of at most `batch_size_for(n)` records. Always yields
/// at least one batch; sizes sum to the input length.
pub fn split_records(records: Vec<Value>) -> Vec<Vec<Value>> {
    if records.is_empty() {
        return Vec::new();
    }

    let batch_size = batch_size_for(records.len());
    let mut batches = Vec::with_capacity(records.len().div_ceil(batch_size));
    let mut remaining = records;

    while remaining.len() > batch_size {
        let rest = remaining.split_off(batch_size);
        batches.push(remaining);
        remaining = rest;
    }
    batches.push(remaining);

    batches
}

/// Marks the job `PROCESSING`, creates one ledger row per batch, and
/// publishes one message per batch. Row creation commits before the message
/// is published; a message referring to a not-yet-visible row is tolerated
/// by the worker's retried lookups.
pub async fn start_async_import(
    pool: &DbPool,
    queue: &dyn BatchQueue,
    cache: &ProgressCache,
    sink: &dyn NotificationSink,
    job: &ImportJob,
    entity_kind: EntityKind,
    records: Vec<Value>,
) -> Result<usize> {
    let total_records = records.len();

    ledger::update_status(
        pool,
        job.job_id,
        ImportStatus::Processing,
        &format!("Distributed import started. Processing {total_records} records in batches"),
    )
    .await?;

    let batches = split_records(records);
    let total_batches = batches.len();

    tracing::info!(
        job_id = %job.job_id,
        total_records,
        total_batches,
        "split records into batches"
    );

    // Initialize before the first publish: a fast worker can settle every
    // batch (and drop this entry) while the loop below is still running, and
    // a late insert would never be cleaned up.
    cache.initialize(job.job_id, total_batches, total_records);

    for (index, chunk) in batches.into_iter().enumerate() {
        let batch_number = (index + 1) as i32;
        let batch_id = match enqueue_batch(
            pool,
            queue,
            job.job_id,
            entity_kind,
            batch_number,
            total_batches,
            total_records,
            chunk,
        )
        .await
        {
            Ok(batch_id) => batch_id,
            Err(err) => {
                // The caller fails the job; drop the tracking entry so it
                // does not outlive it.
                cache.remove(job.job_id);
                return Err(err);
            }
        };
        tracing::debug!(
            job_id = %job.job_id,
            %batch_id,
            batch_number,
            total_batches,
            "sent batch to queue"
        );
    }

    sink.notify(ImportEvent {
        job_id: job.job_id,
        kind: ImportEventKind::Started,
        message: format!("Import task initialized: {total_batches} batches"),
    });

    Ok(total_batches)
}

#[allow(clippy::too_many_arguments)]
async fn enqueue_batch(
    pool: &DbPool,
    queue: &dyn BatchQueue,
    job_id: Uuid,
    entity_kind: EntityKind,
    batch_number: i32,
    total_batches: usize,
    total_records: usize,
    records: Vec<Value>,
) -> Result<Uuid> {
    let batch_id = batch::create_batch(pool, job_id, batch_number, &records).await?;

    let published = queue
        .publish(BatchMessage {
            batch_id,
            job_id,
            entity_kind,
            records,
            batch_number: batch_number as usize,
            total_batches,
            total_records,
        })
        .await;

    if let Err(err) = published {
        // The row was created but no worker will ever see the message. Left
        // PENDING it would pin the derived job status at PROCESSING forever.
        if let Err(update_err) =
            batch::update_batch_status(pool, batch_id, batch::BatchStatus::Failed, 0).await
        {
            tracing::error!(
                %job_id,
                %batch_id,
                error = %update_err,
                "failed to settle batch row after publish failure"
            );
        }
        return Err(err);
    }

    Ok(batch_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn records(n: usize) -> Vec<Value> {
        (0..n).map(|i| json!({ "index": i })).collect()
    }

    #[test]
    fn sizes_sum_to_input_length() {
        for n in [1, 999, 1_000, 1_001, 25_000, 200_000] {
            let batches = split_records(records(n));
            let total: usize = batches.iter().map(Vec::len).sum();
            assert_eq!(total, n, "lost records splitting {n}");
            assert!(!batches.is_empty());
        }
    }

    #[test]
    fn small_sets_become_a_single_batch() {
        // Clamping to MIN_BATCH_SIZE makes the chunk larger than the input.
        let batches = split_records(records(500));
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 500);
    }

    #[test]
    fn batch_sizes_stay_within_bounds() {
        for n in [1_000, 50_000, 400_000, 2_000_000] {
            let batches = split_records(records(n));
            for chunk in &batches {
                assert!(chunk.len() >= 1);
                assert!(chunk.len() <= MAX_BATCH_SIZE.min(n));
            }
        }
    }

    #[test]
    fn batch_size_respects_percentage_band() {
        // 1M records: 5-10% is 50k-100k, clamped to the 50k ceiling.
        assert_eq!(batch_size_for(1_000_000), MAX_BATCH_SIZE);

        // 10 records: 5-10% rounds to 0, clamped to the floor.
        assert_eq!(batch_size_for(10), MIN_BATCH_SIZE);

        // 200k records: 5-10% is 10k-20k, no clamp applies.
        for _ in 0..32 {
            let size = batch_size_for(200_000);
            assert!((10_000..=20_000).contains(&size), "size {size} outside band");
        }
    }

    #[test]
    fn empty_input_yields_no_batches() {
        assert!(split_records(Vec::new()).is_empty());
    }
}
