use std::path::PathBuf;
use std::time::Duration;

use boxoffice_bucket::S3Config;

/// Tunables for the import pipeline, read from `BOXOFFICE_*` environment
/// variables with defaults suitable for local development.
#[derive(Debug, Clone)]
pub struct ImportConfig {
    /// Record count above which the asynchronous path is used.
    pub sync_threshold: usize,
    /// Number of concurrent batch consumers.
    pub worker_count: usize,
    /// Bound of the in-process batch queue.
    pub queue_depth: usize,
    /// Cadence of the outbox delivery agent.
    pub outbox_poll_interval: Duration,
    /// Maximum outbox rows drained per poll.
    pub outbox_batch_limit: i64,
    /// Directory holding spooled upload files awaiting delivery.
    pub spool_dir: PathBuf,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            sync_threshold: 1_000,
            worker_count: 5,
            queue_depth: 64,
            outbox_poll_interval: Duration::from_secs(5),
            outbox_batch_limit: 10,
            spool_dir: std::env::temp_dir().join("boxoffice-spool"),
        }
    }
}

impl ImportConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            sync_threshold: env_usize("BOXOFFICE_SYNC_THRESHOLD", defaults.sync_threshold),
            worker_count: env_usize("BOXOFFICE_WORKER_COUNT", defaults.worker_count),
            queue_depth: env_usize("BOXOFFICE_QUEUE_DEPTH", defaults.queue_depth),
            outbox_poll_interval: Duration::from_millis(env_u64(
                "BOXOFFICE_OUTBOX_POLL_MS",
                defaults.outbox_poll_interval.as_millis() as u64,
            )),
            outbox_batch_limit: env_u64(
                "BOXOFFICE_OUTBOX_BATCH_LIMIT",
                defaults.outbox_batch_limit as u64,
            ) as i64,
            spool_dir: std::env::var("BOXOFFICE_SPOOL_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.spool_dir),
        }
    }
}

/// Bucket settings from `BUCKET_*` variables; defaults target a local
/// MinIO endpoint.
pub fn bucket_config_from_env() -> S3Config {
    S3Config {
        bucket: std::env::var("BUCKET_NAME").unwrap_or_else(|_| "boxoffice-imports".to_string()),
        region: std::env::var("BUCKET_REGION").unwrap_or_else(|_| "us-east-1".to_string()),
        endpoint: std::env::var("BUCKET_ENDPOINT").ok(),
        access_key_id: std::env::var("BUCKET_ACCESS_KEY").ok(),
        secret_access_key: std::env::var("BUCKET_SECRET_KEY").ok(),
        force_path_style: true,
    }
}

fn env_usize(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}
