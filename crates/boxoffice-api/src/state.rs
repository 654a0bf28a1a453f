use std::sync::Arc;

use anyhow::Context;
use boxoffice_bucket::{BucketStore, S3BucketStore};
use boxoffice_core::config::{bucket_config_from_env, ImportConfig};
use boxoffice_core::db;
use boxoffice_core::delivery::OutboxDeliveryAgent;
use boxoffice_core::ledger;
use boxoffice_core::notify::{LogSink, NotificationSink};
use boxoffice_core::orchestrator::ImportPipeline;
use boxoffice_core::processor::ProcessorRegistry;
use boxoffice_core::progress::ProgressCache;
use boxoffice_core::queue::InProcessQueue;
use boxoffice_core::worker::{self, WorkerContext};

#[derive(Clone)]
pub struct AppState {
    pipeline: Arc<ImportPipeline>,
}

impl AppState {
    /// Connects, migrates, recovers interrupted jobs, and starts the batch
    /// workers and the outbox delivery agent. Imports are accepted only
    /// after recovery has settled the ledger.
    pub async fn initialize() -> anyhow::Result<Arc<Self>> {
        let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL not set")?;
        let config = ImportConfig::from_env();

        let pool = db::connect(&database_url).await?;
        db::run_migrations(&pool).await?;

        let recovered = ledger::fail_incomplete_jobs(&pool).await?;
        if recovered > 0 {
            tracing::warn!(recovered, "failed interrupted import jobs from previous run");
        }

        let (queue, receiver) = InProcessQueue::new(config.queue_depth);
        let registry = Arc::new(ProcessorRegistry::with_defaults(pool.clone()));
        let cache = Arc::new(ProgressCache::new());
        let sink: Arc<dyn NotificationSink> = Arc::new(LogSink);

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

        let store: Arc<dyn BucketStore> =
            Arc::new(S3BucketStore::new(bucket_config_from_env()).await?);
        OutboxDeliveryAgent::new(pool.clone(), store, &config).spawn();

        let pipeline = Arc::new(ImportPipeline::new(
            pool, queue, registry, cache, sink, config,
        ));

        Ok(Arc::new(Self { pipeline }))
    }

    pub fn pipeline(&self) -> &ImportPipeline {
        &self.pipeline
    }
}
