//! Merges batch outcomes into job-level status.
//!
//! The derivation is a pure function of the full batch set, so recomputing
//! it is idempotent and tolerates any batch completion order. The in-memory
//! cache is a convenience view only; the durable batch rows stay the sole
//! source of truth and the cache can be dropped and rebuilt at any time.

use std::collections::HashMap;
use std::sync::Mutex;

use uuid::Uuid;

use crate::batch::{self, BatchOutcome, BatchStatus};
use crate::db::DbPool;
use crate::error::Result;
use crate::ledger::{self, ImportStatus};
use crate::notify::{ImportEvent, ImportEventKind, NotificationSink};

/// Job status derived from the statuses of all its batches.
pub fn derive_job_status(statuses: &[BatchStatus]) -> Option<(ImportStatus, String)> {
    if statuses.is_empty() {
        return None;
    }

    let total = statuses.len();
    let in_flight = statuses
        .iter()
        .filter(|status| !status.is_terminal())
        .count();
    let succeeded = statuses
        .iter()
        .filter(|status| matches!(status, BatchStatus::Success))
        .count();
    let failed = statuses
        .iter()
        .filter(|status| matches!(status, BatchStatus::Failed))
        .count();

    let derived = if in_flight > 0 {
        (
            ImportStatus::Processing,
            format!("Processing batches. Completed: {}/{}", total - in_flight, total),
        )
    } else if succeeded == total {
        (
            ImportStatus::Success,
            format!("All {total} batches completed successfully"),
        )
    } else if failed == total {
        (ImportStatus::Failed, format!("All {total} batches failed"))
    } else {
        // Some records made it in and some did not: either a mix of batch
        // outcomes or at least one PARTIAL_SUCCESS batch.
        (
            ImportStatus::PartialSuccess,
            format!(
                "Partial success: {} of {total} batches fully succeeded, {failed} failed",
                succeeded
            ),
        )
    };

    Some(derived)
}

/// In-memory, rebuildable summary of one active job.
#[derive(Debug, Clone, Copy)]
pub struct Progress {
    pub total_batches: usize,
    pub completed_batches: usize,
    pub total_records: usize,
    pub processed_records: usize,
    pub error_records: usize,
}

impl Progress {
    pub fn is_completed(&self) -> bool {
        self.completed_batches >= self.total_batches
    }

    pub fn is_failed(&self) -> bool {
        self.is_completed() && self.processed_records == 0
    }
}

/// Derived cache keyed by job id; dropped once the job settles.
#[derive(Default)]
pub struct ProgressCache {
    inner: Mutex<HashMap<Uuid, Progress>>,
}

impl ProgressCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn initialize(&self, job_id: Uuid, total_batches: usize, total_records: usize) {
        let mut map = self.inner.lock().expect("progress lock poisoned");
        map.insert(
            job_id,
            Progress {
                total_batches,
                completed_batches: 0,
                total_records,
                processed_records: 0,
                error_records: 0,
            },
        );
        tracing::info!(%job_id, total_batches, total_records, "initialized progress tracking");
    }

    pub fn get(&self, job_id: Uuid) -> Option<Progress> {
        self.inner
            .lock()
            .expect("progress lock poisoned")
            .get(&job_id)
            .copied()
    }

    fn replace(&self, job_id: Uuid, outcomes: &[BatchOutcome]) {
        let mut map = self.inner.lock().expect("progress lock poisoned");
        let progress = rebuild(outcomes);
        map.insert(job_id, progress);
    }

    pub fn remove(&self, job_id: Uuid) {
        self.inner
            .lock()
            .expect("progress lock poisoned")
            .remove(&job_id);
    }
}

/// Rebuilds a progress summary purely from durable batch rows.
pub fn rebuild(outcomes: &[BatchOutcome]) -> Progress {
    let completed = outcomes
        .iter()
        .filter(|outcome| outcome.status.is_terminal())
        .count();
    let processed: i32 = outcomes
        .iter()
        .filter(|outcome| outcome.status.is_terminal())
        .map(|outcome| outcome.processed_records)
        .sum();
    let errors: i32 = outcomes
        .iter()
        .filter(|outcome| outcome.status.is_terminal())
        .map(|outcome| outcome.batch_size - outcome.processed_records)
        .sum();
    let total_records: i32 = outcomes.iter().map(|outcome| outcome.batch_size).sum();

    Progress {
        total_batches: outcomes.len(),
        completed_batches: completed,
        total_records: total_records as usize,
        processed_records: processed as usize,
        error_records: errors as usize,
    }
}

/// Recomputes and persists the owning job's status from its batch rows,
/// emitting a progress notification. Safe to run concurrently from multiple
/// batch completions; last write wins on the job row.
pub async fn refresh_job_status(
    pool: &DbPool,
    cache: &ProgressCache,
    sink: &dyn NotificationSink,
    job_id: Uuid,
) -> Result<()> {
    let outcomes = batch::batch_outcomes_for_job(pool, job_id).await?;
    let statuses: Vec<BatchStatus> = outcomes.iter().map(|outcome| outcome.status).collect();

    let Some((status, description)) = derive_job_status(&statuses) else {
        return Ok(());
    };

    let progress = rebuild(&outcomes);

    ledger::update_status(pool, job_id, status, &description).await?;
    ledger::update_counts(
        pool,
        job_id,
        progress.total_records as i32,
        progress.processed_records as i32,
        progress.error_records as i32,
    )
    .await?;

    sink.notify(ImportEvent {
        job_id,
        kind: ImportEventKind::from_status(status),
        message: description,
    });

    if status.is_terminal() {
        cache.remove(job_id);
        tracing::info!(%job_id, status = status.as_str(), "import job settled");
    } else {
        cache.replace(job_id, &outcomes);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use BatchStatus::*;

    fn derive(statuses: &[BatchStatus]) -> Option<ImportStatus> {
        derive_job_status(statuses).map(|(status, _)| status)
    }

    #[test]
    fn any_in_flight_batch_keeps_job_processing() {
        assert_eq!(derive(&[Pending]), Some(ImportStatus::Processing));
        assert_eq!(derive(&[Success, Processing]), Some(ImportStatus::Processing));
        assert_eq!(derive(&[Failed, Pending, Success]), Some(ImportStatus::Processing));
    }

    #[test]
    fn mixed_terminal_outcomes_are_partial_success() {
        assert_eq!(derive(&[Success, Failed]), Some(ImportStatus::PartialSuccess));
        assert_eq!(
            derive(&[PartialSuccess, Failed]),
            Some(ImportStatus::PartialSuccess)
        );
    }

    #[test]
    fn all_success_is_success() {
        assert_eq!(derive(&[Success]), Some(ImportStatus::Success));
        assert_eq!(derive(&[Success, Success, Success]), Some(ImportStatus::Success));
    }

    #[test]
    fn partial_batches_keep_the_job_partial() {
        assert_eq!(derive(&[PartialSuccess]), Some(ImportStatus::PartialSuccess));
        assert_eq!(
            derive(&[Success, PartialSuccess]),
            Some(ImportStatus::PartialSuccess)
        );
        assert_eq!(
            derive(&[PartialSuccess, PartialSuccess]),
            Some(ImportStatus::PartialSuccess)
        );
    }

    #[test]
    fn all_failed_is_failed() {
        assert_eq!(derive(&[Failed, Failed]), Some(ImportStatus::Failed));
    }

    #[test]
    fn no_batches_derives_nothing() {
        assert_eq!(derive(&[]), None);
    }

    #[test]
    fn derivation_is_idempotent_and_order_independent() {
        let forward = [Success, Failed, PartialSuccess, Success];
        let backward = [Success, PartialSuccess, Failed, Success];
        assert_eq!(derive(&forward), derive(&backward));
        assert_eq!(derive(&forward), derive(&forward));
    }

    fn outcome(status: BatchStatus, size: i32, processed: i32) -> BatchOutcome {
        BatchOutcome {
            status,
            batch_size: size,
            processed_records: processed,
        }
    }

    #[test]
    fn rebuild_counts_only_terminal_batches() {
        let outcomes = [
            outcome(Success, 10, 10),
            outcome(PartialSuccess, 10, 6),
            outcome(Processing, 10, 3),
        ];
        let progress = rebuild(&outcomes);
        assert_eq!(progress.total_batches, 3);
        assert_eq!(progress.completed_batches, 2);
        assert_eq!(progress.total_records, 30);
        assert_eq!(progress.processed_records, 16);
        assert_eq!(progress.error_records, 4);
        assert!(!progress.is_completed());
    }

    #[test]
    fn rebuilt_progress_flags_total_failure() {
        let outcomes = [outcome(Failed, 5, 0), outcome(Failed, 5, 0)];
        let progress = rebuild(&outcomes);
        assert!(progress.is_completed());
        assert!(progress.is_failed());
    }

    #[test]
    fn cache_is_droppable_and_rebuildable() {
        let cache = ProgressCache::new();
        let job_id = Uuid::new_v4();
        cache.initialize(job_id, 4, 100);
        assert!(cache.get(job_id).is_some());

        let outcomes = [outcome(Success, 50, 50), outcome(Failed, 50, 0)];
        cache.replace(job_id, &outcomes);
        let progress = cache.get(job_id).unwrap();
        assert_eq!(progress.processed_records, 50);
        assert_eq!(progress.error_records, 50);

        cache.remove(job_id);
        assert!(cache.get(job_id).is_none());
    }
}
