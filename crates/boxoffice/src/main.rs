use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use boxoffice_bucket::{BucketStore, S3BucketStore};
use boxoffice_core::config::{bucket_config_from_env, ImportConfig};
use boxoffice_core::db;
use boxoffice_core::delivery::OutboxDeliveryAgent;
use boxoffice_core::ledger::{self, ImportStatus};
use boxoffice_core::notify::{LogSink, NotificationSink};
use boxoffice_core::orchestrator::{ImportMode, ImportPipeline};
use boxoffice_core::processor::ProcessorRegistry;
use boxoffice_core::progress::ProgressCache;
use boxoffice_core::queue::InProcessQueue;
use boxoffice_core::worker::{self, WorkerContext};
use clap::Parser;

/// Operations console for the ticket import service.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Apply pending database migrations.
    Migrate,
    /// Fail import jobs left non-terminal by a previous process.
    Recover,
    /// Import a JSON file of records and wait for completion.
    Import {
        /// Path to the JSON array file.
        file: PathBuf,
        /// Entity type of the records, e.g. "ticket".
        #[arg(short, long)]
        entity_type: String,
    },
    /// List import jobs, newest first.
    Jobs {
        #[arg(long, default_value_t = 1)]
        page: i64,
        #[arg(long, default_value_t = 20)]
        per_page: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL not set")?;
    let pool = db::connect(&database_url).await?;

    match cli.command {
        Commands::Migrate => {
            db::run_migrations(&pool).await?;
            println!("Migrations applied.");
        }
        Commands::Recover => {
            db::run_migrations(&pool).await?;
            let failed = ledger::fail_incomplete_jobs(&pool).await?;
            println!("Marked {failed} interrupted job(s) as FAILED.");
        }
        Commands::Import { file, entity_type } => {
            db::run_migrations(&pool).await?;
            // Settle anything a previous process left in flight first.
            ledger::fail_incomplete_jobs(&pool).await?;
            run_import(&pool, &file, &entity_type).await?;
        }
        Commands::Jobs { page, per_page } => {
            let jobs = ledger::list_jobs_page(&pool, page, per_page).await?;
            println!(
                "Import jobs (page {}/{}):",
                jobs.page,
                (jobs.total + jobs.per_page - 1) / jobs.per_page.max(1)
            );
            for job in &jobs.jobs {
                println!(
                    "  {}  {:<18} {:<8} {}/{} ok, {} errors  {}",
                    job.job_id,
                    job.status.as_str(),
                    job.entity_type,
                    job.processed_records,
                    job.total_records,
                    job.error_records,
                    job.filename,
                );
            }
        }
    }

    Ok(())
}

/// Runs one import end to end in-process: batch workers and the outbox
/// delivery agent are started for the duration of the command.
async fn run_import(pool: &db::DbPool, file: &PathBuf, entity_type: &str) -> Result<()> {
    let bytes = std::fs::read(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let filename = file
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "import.json".to_string());

    let config = ImportConfig::from_env();

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

    let store: Arc<dyn BucketStore> = Arc::new(S3BucketStore::new(bucket_config_from_env()).await?);
    let delivery = OutboxDeliveryAgent::new(pool.clone(), store, &config);

    let pipeline = ImportPipeline::new(
        pool.clone(),
        queue,
        registry,
        cache,
        sink,
        config,
    );

    let result = pipeline.import_file(&filename, entity_type, &bytes).await;
    let response = match result {
        Ok(response) => response,
        Err(err) => {
            flush_outbox(&delivery).await?;
            return Err(err.into());
        }
    };
    println!("{}", response.message);

    if response.mode == ImportMode::Async {
        // Poll the ledger until the batches settle.
        loop {
            tokio::time::sleep(Duration::from_millis(500)).await;
            let job = ledger::get_job(pool, response.job_id).await?;
            if job.status.is_terminal() {
                println!(
                    "Job {} finished: {} ({}). Processed {}/{} records, {} errors.",
                    job.job_id,
                    job.status.as_str(),
                    job.result_description,
                    job.processed_records,
                    job.total_records,
                    job.error_records,
                );
                if !matches!(job.status, ImportStatus::Success | ImportStatus::PartialSuccess) {
                    anyhow::bail!("import finished in status {}", job.status.as_str());
                }
                break;
            }
        }
    }

    flush_outbox(&delivery).await?;
    Ok(())
}

/// Drains pending file operations before the process exits.
async fn flush_outbox(delivery: &OutboxDeliveryAgent) -> Result<()> {
    let mut delivered = delivery.run_once().await?;
    while delivered > 0 {
        delivered = delivery.run_once().await?;
    }
    Ok(())
}
