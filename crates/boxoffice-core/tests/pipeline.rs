use std::env;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use boxoffice_bucket::{BucketStore, MemoryBucketStore};
use boxoffice_core::batch::{self, BatchStatus};
use boxoffice_core::config::ImportConfig;
use boxoffice_core::db::{self, DbPool};
use boxoffice_core::delivery::{object_key, OutboxDeliveryAgent};
use boxoffice_core::error::ImportError;
use boxoffice_core::ledger::{self, ImportStatus};
use boxoffice_core::notify::{NotificationSink, RecordingSink};
use boxoffice_core::orchestrator::{ImportMode, ImportPipeline};
use boxoffice_core::outbox::{self, OutboxOperation};
use boxoffice_core::processor::ProcessorRegistry;
use boxoffice_core::progress::ProgressCache;
use boxoffice_core::queue::InProcessQueue;
use boxoffice_core::worker::{self, WorkerContext};
use serde_json::{json, Value};
use tokio::runtime::Runtime;
use uuid::Uuid;

// The tests share one database; serialize them.
static DB_LOCK: Mutex<()> = Mutex::new(());

fn test_database_url(test_name: &str) -> Option<String> {
    match env::var("BOXOFFICE_TEST_DATABASE_URL") {
        Ok(url) => Some(url),
        Err(_) => {
            eprintln!("Skipping {test_name} because BOXOFFICE_TEST_DATABASE_URL is not set");
            None
        }
    }
}

async fn fresh_pool(database_url: &str) -> Result<DbPool> {
    let pool = db::connect(database_url).await?;
    db::run_migrations(&pool).await?;
    sqlx::query(
        "TRUNCATE TABLE tickets, persons, events, venues, coordinates, \
         file_outbox, import_batches, import_jobs CASCADE",
    )
    .execute(&pool)
    .await?;
    Ok(pool)
}

fn test_config(sync_threshold: usize) -> ImportConfig {
    ImportConfig {
        sync_threshold,
        worker_count: 2,
        queue_depth: 16,
        outbox_poll_interval: Duration::from_millis(50),
        outbox_batch_limit: 10,
        spool_dir: env::temp_dir().join(format!("boxoffice-test-{}", Uuid::new_v4())),
    }
}

/// Pipeline wired like the service, with batch workers running.
fn build_pipeline(pool: &DbPool, config: ImportConfig, sink: Arc<RecordingSink>) -> ImportPipeline {
    let (queue, receiver) = InProcessQueue::new(config.queue_depth);
    let registry = Arc::new(ProcessorRegistry::with_defaults(pool.clone()));
    let cache = Arc::new(ProgressCache::new());
    let sink: Arc<dyn NotificationSink> = sink;

    worker::spawn_workers(
        WorkerContext {
            pool: pool.clone(),
            registry: registry.clone(),
            cache: cache.clone(),
            sink: sink.clone(),
        },
        receiver,
        config.worker_count,
    );

    ImportPipeline::new(pool.clone(), queue, registry, cache, sink, config)
}

/// Like `build_pipeline`, but hands back the progress cache for inspection.
/// With zero workers the receiver is dropped, so every publish fails.
fn build_pipeline_with_cache(
    pool: &DbPool,
    config: ImportConfig,
    worker_count: usize,
) -> (ImportPipeline, Arc<ProgressCache>) {
    let (queue, receiver) = InProcessQueue::new(config.queue_depth);
    let registry = Arc::new(ProcessorRegistry::with_defaults(pool.clone()));
    let cache = Arc::new(ProgressCache::new());
    let sink: Arc<dyn NotificationSink> = Arc::new(RecordingSink::new());

    if worker_count > 0 {
        worker::spawn_workers(
            WorkerContext {
                pool: pool.clone(),
                registry: registry.clone(),
                cache: cache.clone(),
                sink: sink.clone(),
            },
            receiver,
            worker_count,
        );
    } else {
        drop(receiver);
    }

    let pipeline =
        ImportPipeline::new(pool.clone(), queue, registry, cache.clone(), sink, config);
    (pipeline, cache)
}

fn ticket(index: usize) -> Value {
    json!({
        "name": format!("Seat {index}"),
        "price": 100 + index as i64,
        "number": (index + 1) as f64,
        "refundable": index % 2 == 0,
        "coordinates": { "x": index as i64, "y": 1.5 },
        "venue": { "name": format!("Hall {index}"), "capacity": 300 }
    })
}

fn tickets_json(count: usize) -> Vec<u8> {
    let records: Vec<Value> = (0..count).map(ticket).collect();
    serde_json::to_vec(&records).expect("serialize tickets")
}

async fn wait_until_terminal(pool: &DbPool, job_id: Uuid) -> Result<ledger::ImportJob> {
    for _ in 0..200 {
        let job = ledger::get_job(pool, job_id).await?;
        if job.status.is_terminal() {
            return Ok(job);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    anyhow::bail!("job {job_id} did not settle in time");
}

async fn count_rows(pool: &DbPool, table: &str) -> Result<i64> {
    let (count,): (i64,) = sqlx::query_as(&format!("SELECT count(*) FROM {table}"))
        .fetch_one(pool)
        .await?;
    Ok(count)
}

#[test]
fn sync_import_completes_and_delivers_upload() -> Result<()> {
    let Some(database_url) = test_database_url("sync_import_completes_and_delivers_upload") else {
        return Ok(());
    };
    let _guard = DB_LOCK.lock().unwrap_or_else(|err| err.into_inner());

    let rt = Runtime::new()?;
    rt.block_on(async move {
        let pool = fresh_pool(&database_url).await?;
        let config = test_config(1_000);
        let sink = Arc::new(RecordingSink::new());
        let pipeline = build_pipeline(&pool, config.clone(), sink.clone());

        let response = pipeline
            .import_file("tickets.json", "ticket", &tickets_json(3))
            .await?;

        assert_eq!(response.mode, ImportMode::Sync);
        assert_eq!(response.total_records, 3);
        assert_eq!(response.processed_records, 3);
        assert_eq!(response.error_records, 0);

        let job = ledger::get_job(&pool, response.job_id).await?;
        assert_eq!(job.status, ImportStatus::Success);
        assert_eq!(count_rows(&pool, "tickets").await?, 3);

        // One pending UPLOAD intent committed with the job row.
        let pending = outbox::pending_events(&pool, 10).await?;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].operation, OutboxOperation::Upload);
        assert_eq!(pending[0].job_id, response.job_id);

        let store = Arc::new(MemoryBucketStore::new());
        let agent = OutboxDeliveryAgent::new(
            pool.clone(),
            store.clone() as Arc<dyn BucketStore>,
            &config,
        );
        assert_eq!(agent.run_once().await?, 1);
        assert!(store.contains(&object_key(&response.filename)));

        // Nothing left pending; a second poll is a no-op.
        assert_eq!(agent.run_once().await?, 0);
        assert!(outbox::pending_events(&pool, 10).await?.is_empty());

        Ok(())
    })
}

#[test]
fn unparseable_file_ends_validation_failed() -> Result<()> {
    let Some(database_url) = test_database_url("unparseable_file_ends_validation_failed") else {
        return Ok(());
    };
    let _guard = DB_LOCK.lock().unwrap_or_else(|err| err.into_inner());

    let rt = Runtime::new()?;
    rt.block_on(async move {
        let pool = fresh_pool(&database_url).await?;
        let pipeline = build_pipeline(
            &pool,
            test_config(1_000),
            Arc::new(RecordingSink::new()),
        );

        let result = pipeline
            .import_file("garbage.json", "ticket", b"this is not json")
            .await;
        assert!(matches!(result, Err(ImportError::Validation(_))));

        let page = ledger::list_jobs_page(&pool, 1, 10).await?;
        assert_eq!(page.jobs.len(), 1);
        assert_eq!(page.jobs[0].status, ImportStatus::ValidationFailed);

        // VALIDATION_FAILED is not FAILED: no compensating delete, only the
        // original upload intent remains.
        let pending = outbox::pending_events(&pool, 10).await?;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].operation, OutboxOperation::Upload);

        Ok(())
    })
}

#[test]
fn failed_sync_import_schedules_compensating_delete() -> Result<()> {
    let Some(database_url) = test_database_url("failed_sync_import_schedules_compensating_delete")
    else {
        return Ok(());
    };
    let _guard = DB_LOCK.lock().unwrap_or_else(|err| err.into_inner());

    let rt = Runtime::new()?;
    rt.block_on(async move {
        let pool = fresh_pool(&database_url).await?;
        let pipeline = build_pipeline(
            &pool,
            test_config(1_000),
            Arc::new(RecordingSink::new()),
        );

        let mut bad = ticket(0);
        bad.as_object_mut().expect("object").remove("venue");
        let payload = serde_json::to_vec(&json!([ticket(1), bad]))?;

        let result = pipeline.import_file("tickets.json", "ticket", &payload).await;
        assert!(matches!(result, Err(ImportError::Validation(_))));

        let page = ledger::list_jobs_page(&pool, 1, 10).await?;
        let job = &page.jobs[0];
        assert_eq!(job.status, ImportStatus::Failed);
        assert_eq!(job.processed_records, 1);
        assert_eq!(job.error_records, 1);

        let pending = outbox::pending_events(&pool, 10).await?;
        let operations: Vec<OutboxOperation> =
            pending.iter().map(|event| event.operation).collect();
        assert!(operations.contains(&OutboxOperation::Upload));
        assert!(operations.contains(&OutboxOperation::Delete));

        Ok(())
    })
}

#[test]
fn async_import_settles_to_success() -> Result<()> {
    let Some(database_url) = test_database_url("async_import_settles_to_success") else {
        return Ok(());
    };
    let _guard = DB_LOCK.lock().unwrap_or_else(|err| err.into_inner());

    let rt = Runtime::new()?;
    rt.block_on(async move {
        let pool = fresh_pool(&database_url).await?;
        let sink = Arc::new(RecordingSink::new());
        let pipeline = build_pipeline(&pool, test_config(5), sink.clone());

        let response = pipeline
            .import_file("tickets.json", "ticket", &tickets_json(25))
            .await?;
        assert_eq!(response.mode, ImportMode::Async);
        assert_eq!(response.total_records, 25);

        let job = wait_until_terminal(&pool, response.job_id).await?;
        assert_eq!(job.status, ImportStatus::Success);
        assert_eq!(job.processed_records, 25);
        assert_eq!(job.error_records, 0);
        assert_eq!(count_rows(&pool, "tickets").await?, 25);

        let outcomes = boxoffice_core::batch::batch_outcomes_for_job(&pool, response.job_id).await?;
        assert!(!outcomes.is_empty());
        assert!(outcomes
            .iter()
            .all(|outcome| outcome.status == boxoffice_core::batch::BatchStatus::Success));

        Ok(())
    })
}

#[test]
fn async_import_with_bad_records_is_partial() -> Result<()> {
    let Some(database_url) = test_database_url("async_import_with_bad_records_is_partial") else {
        return Ok(());
    };
    let _guard = DB_LOCK.lock().unwrap_or_else(|err| err.into_inner());

    let rt = Runtime::new()?;
    rt.block_on(async move {
        let pool = fresh_pool(&database_url).await?;
        let pipeline = build_pipeline(&pool, test_config(5), Arc::new(RecordingSink::new()));

        let mut records: Vec<Value> = (0..16).map(ticket).collect();
        for index in 0..4 {
            records.push(json!({ "name": format!("broken {index}") }));
        }
        let payload = serde_json::to_vec(&records)?;

        let response = pipeline.import_file("tickets.json", "ticket", &payload).await?;
        assert_eq!(response.mode, ImportMode::Async);

        let job = wait_until_terminal(&pool, response.job_id).await?;
        assert_eq!(job.status, ImportStatus::PartialSuccess);
        assert_eq!(job.processed_records, 16);
        assert_eq!(job.error_records, 4);
        assert_eq!(count_rows(&pool, "tickets").await?, 16);

        Ok(())
    })
}

#[test]
fn settled_async_job_drops_its_progress_entry() -> Result<()> {
    let Some(database_url) = test_database_url("settled_async_job_drops_its_progress_entry") else {
        return Ok(());
    };
    let _guard = DB_LOCK.lock().unwrap_or_else(|err| err.into_inner());

    let rt = Runtime::new()?;
    rt.block_on(async move {
        let pool = fresh_pool(&database_url).await?;
        let (pipeline, cache) = build_pipeline_with_cache(&pool, test_config(5), 2);

        // Small enough that workers can settle every batch while the
        // fan-out is still in flight.
        let response = pipeline
            .import_file("tickets.json", "ticket", &tickets_json(25))
            .await?;
        assert_eq!(response.mode, ImportMode::Async);

        let job = wait_until_terminal(&pool, response.job_id).await?;
        assert_eq!(job.status, ImportStatus::Success);

        // The entry is dropped right after the terminal status write; give
        // the last worker a moment to get there.
        for _ in 0..40 {
            if cache.get(response.job_id).is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(cache.get(response.job_id).is_none());

        Ok(())
    })
}

#[test]
fn failed_fan_out_settles_job_and_batches() -> Result<()> {
    let Some(database_url) = test_database_url("failed_fan_out_settles_job_and_batches") else {
        return Ok(());
    };
    let _guard = DB_LOCK.lock().unwrap_or_else(|err| err.into_inner());

    let rt = Runtime::new()?;
    rt.block_on(async move {
        let pool = fresh_pool(&database_url).await?;
        // Zero workers: the queue is closed and every publish fails.
        let (pipeline, cache) = build_pipeline_with_cache(&pool, test_config(5), 0);

        let result = pipeline
            .import_file("tickets.json", "ticket", &tickets_json(25))
            .await;
        assert!(matches!(result, Err(ImportError::System(_))));

        let page = ledger::list_jobs_page(&pool, 1, 10).await?;
        let job = &page.jobs[0];
        assert_eq!(job.status, ImportStatus::Failed);

        // Rows created before the failed publish are settled, not left
        // PENDING to pin later status derivations at PROCESSING.
        let outcomes = batch::batch_outcomes_for_job(&pool, job.job_id).await?;
        assert!(!outcomes.is_empty());
        assert!(outcomes
            .iter()
            .all(|outcome| outcome.status == BatchStatus::Failed));

        assert!(cache.get(job.job_id).is_none());

        Ok(())
    })
}

#[test]
fn lost_progress_hint_does_not_abort_the_batch() -> Result<()> {
    let Some(database_url) = test_database_url("lost_progress_hint_does_not_abort_the_batch")
    else {
        return Ok(());
    };
    let _guard = DB_LOCK.lock().unwrap_or_else(|err| err.into_inner());

    let rt = Runtime::new()?;
    rt.block_on(async move {
        let pool = fresh_pool(&database_url).await?;

        let mut tx = pool.begin().await?;
        let job = ledger::create_pending(&mut *tx, "tickets.json", "ticket").await?;
        tx.commit().await?;
        let batch_id = batch::create_batch(&pool, job.job_id, 1, &[ticket(0)]).await?;

        // processed_records is constrained to the batch size, so this write
        // is rejected by the database and swallowed.
        batch::record_progress(&pool, batch_id, 5).await;

        let row = batch::get_batch(&pool, batch_id).await?.expect("batch row");
        assert_eq!(row.processed_records, 0);

        // The final status write still lands.
        batch::update_batch_status(&pool, batch_id, BatchStatus::Success, 1).await?;
        let row = batch::get_batch(&pool, batch_id).await?.expect("batch row");
        assert_eq!(row.batch_status, BatchStatus::Success);
        assert_eq!(row.processed_records, 1);

        Ok(())
    })
}

#[test]
fn failed_job_creation_leaves_no_residue() -> Result<()> {
    let Some(database_url) = test_database_url("failed_job_creation_leaves_no_residue") else {
        return Ok(());
    };
    let _guard = DB_LOCK.lock().unwrap_or_else(|err| err.into_inner());

    let rt = Runtime::new()?;
    rt.block_on(async move {
        let pool = fresh_pool(&database_url).await?;
        let config = test_config(1_000);
        // A regular file where the spool directory should be makes job
        // creation fail before anything commits.
        std::fs::write(&config.spool_dir, b"not a directory")?;
        let pipeline = build_pipeline(&pool, config.clone(), Arc::new(RecordingSink::new()));

        let result = pipeline
            .import_file("tickets.json", "ticket", &tickets_json(3))
            .await;
        assert!(result.is_err());

        // Nothing recorded, nothing spooled.
        assert_eq!(count_rows(&pool, "import_jobs").await?, 0);
        assert_eq!(count_rows(&pool, "file_outbox").await?, 0);
        assert_eq!(std::fs::read(&config.spool_dir)?, b"not a directory");

        Ok(())
    })
}

#[test]
fn startup_recovery_fails_interrupted_jobs() -> Result<()> {
    let Some(database_url) = test_database_url("startup_recovery_fails_interrupted_jobs") else {
        return Ok(());
    };
    let _guard = DB_LOCK.lock().unwrap_or_else(|err| err.into_inner());

    let rt = Runtime::new()?;
    rt.block_on(async move {
        let pool = fresh_pool(&database_url).await?;

        let mut tx = pool.begin().await?;
        let stuck = ledger::create_pending(&mut *tx, "stuck.json", "ticket").await?;
        let finished = ledger::create_pending(&mut *tx, "finished.json", "ticket").await?;
        tx.commit().await?;

        ledger::update_status(&pool, stuck.job_id, ImportStatus::Processing, "in flight").await?;
        ledger::update_status(&pool, finished.job_id, ImportStatus::Success, "done").await?;

        assert_eq!(ledger::fail_incomplete_jobs(&pool).await?, 1);

        let stuck = ledger::get_job(&pool, stuck.job_id).await?;
        assert_eq!(stuck.status, ImportStatus::Failed);
        assert_eq!(stuck.result_description, "Import interrupted by process restart");

        let finished = ledger::get_job(&pool, finished.job_id).await?;
        assert_eq!(finished.status, ImportStatus::Success);

        // Newly FAILED job gets the compensating delete.
        let pending = outbox::pending_events(&pool, 10).await?;
        assert!(pending
            .iter()
            .any(|event| event.operation == OutboxOperation::Delete
                && event.job_id == stuck.job_id));

        // Recovery is idempotent across restarts.
        assert_eq!(ledger::fail_incomplete_jobs(&pool).await?, 0);

        Ok(())
    })
}

#[test]
fn outbox_rows_are_marked_processed_once() -> Result<()> {
    let Some(database_url) = test_database_url("outbox_rows_are_marked_processed_once") else {
        return Ok(());
    };
    let _guard = DB_LOCK.lock().unwrap_or_else(|err| err.into_inner());

    let rt = Runtime::new()?;
    rt.block_on(async move {
        let pool = fresh_pool(&database_url).await?;

        let mut tx = pool.begin().await?;
        let job = ledger::create_pending(&mut *tx, "tickets.json", "ticket").await?;
        let event_id =
            outbox::insert_upload_event(&mut *tx, job.job_id, &job.filename, "/tmp/missing").await?;
        tx.commit().await?;

        assert!(outbox::mark_processed(&pool, event_id).await?);
        assert!(!outbox::mark_processed(&pool, event_id).await?);
        assert!(outbox::pending_events(&pool, 10).await?.is_empty());

        Ok(())
    })
}

#[test]
fn delete_delivery_tolerates_missing_objects() -> Result<()> {
    let Some(database_url) = test_database_url("delete_delivery_tolerates_missing_objects") else {
        return Ok(());
    };
    let _guard = DB_LOCK.lock().unwrap_or_else(|err| err.into_inner());

    let rt = Runtime::new()?;
    rt.block_on(async move {
        let pool = fresh_pool(&database_url).await?;
        let config = test_config(1_000);

        let mut tx = pool.begin().await?;
        let job = ledger::create_pending(&mut *tx, "tickets.json", "ticket").await?;
        outbox::insert_delete_event(&mut *tx, job.job_id, &job.filename).await?;
        tx.commit().await?;

        let store = Arc::new(MemoryBucketStore::new());
        let agent = OutboxDeliveryAgent::new(
            pool.clone(),
            store.clone() as Arc<dyn BucketStore>,
            &config,
        );

        // The object was never uploaded; the delete still settles the row.
        assert_eq!(agent.run_once().await?, 1);
        assert!(outbox::pending_events(&pool, 10).await?.is_empty());
        assert_eq!(store.object_count(), 0);

        Ok(())
    })
}
