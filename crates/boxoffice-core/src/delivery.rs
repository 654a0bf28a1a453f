//! Outbox delivery agent.
//!
//! A background task polls `file_outbox` for pending rows and replays each
//! intent against the object store. Rows are marked processed only after
//! the store confirms the operation, so a crash between the call and the
//! mark causes a redelivery; both operations are idempotent, making the
//! duplicate harmless. Store unavailability leaves rows pending for the
//! next poll.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use boxoffice_bucket::{BucketError, BucketStore};
use tokio::time::MissedTickBehavior;

use crate::config::ImportConfig;
use crate::db::DbPool;
use crate::error::{ImportError, Result};
use crate::outbox::{self, OutboxEvent, OutboxOperation};

/// Object key under which an import file is stored.
pub fn object_key(file_name: &str) -> String {
    format!("imports/{file_name}")
}

pub struct OutboxDeliveryAgent {
    pool: DbPool,
    store: Arc<dyn BucketStore>,
    spool_dir: PathBuf,
    poll_interval: Duration,
    batch_limit: i64,
}

impl OutboxDeliveryAgent {
    pub fn new(pool: DbPool, store: Arc<dyn BucketStore>, config: &ImportConfig) -> Self {
        Self {
            pool,
            store,
            spool_dir: config.spool_dir.clone(),
            poll_interval: config.outbox_poll_interval,
            batch_limit: config.outbox_batch_limit,
        }
    }

    /// Runs the poll loop until the task is aborted.
    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!(
                interval_ms = self.poll_interval.as_millis() as u64,
                "outbox delivery agent started"
            );
            let mut ticker = tokio::time::interval(self.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match self.run_once().await {
                    Ok(0) => {}
                    Ok(delivered) => {
                        tracing::info!(delivered, "delivered outbox events");
                    }
                    Err(err) => {
                        tracing::error!(error = %err, "outbox poll failed");
                    }
                }
            }
        })
    }

    /// Drains one poll's worth of pending events. A failed event is logged
    /// and left pending; later events in the same poll still run.
    pub async fn run_once(&self) -> Result<usize> {
        let events = outbox::pending_events(&self.pool, self.batch_limit).await?;
        let mut delivered = 0usize;

        for event in &events {
            match self.deliver(event).await {
                Ok(()) => delivered += 1,
                Err(err) => {
                    tracing::warn!(
                        event_id = %event.event_id,
                        operation = event.operation.as_str(),
                        file_name = event.file_name,
                        error = %err,
                        "outbox event delivery failed, will retry"
                    );
                }
            }
        }

        Ok(delivered)
    }

    async fn deliver(&self, event: &OutboxEvent) -> Result<()> {
        let key = object_key(&event.file_name);

        match event.operation {
            OutboxOperation::Upload => self.deliver_upload(event, &key).await?,
            OutboxOperation::Delete => {
                // Deleting an absent object succeeds, so redelivery is safe.
                self.store
                    .delete_object(&key)
                    .await
                    .map_err(store_unavailable)?;
            }
        }

        if !outbox::mark_processed(&self.pool, event.event_id).await? {
            tracing::debug!(event_id = %event.event_id, "event was already marked processed");
        }
        tracing::info!(
            event_id = %event.event_id,
            operation = event.operation.as_str(),
            key,
            "delivered outbox event"
        );
        Ok(())
    }

    async fn deliver_upload(&self, event: &OutboxEvent, key: &str) -> Result<()> {
        let spool_path = if event.file_path.is_empty() {
            self.spool_dir.join(&event.file_name)
        } else {
            PathBuf::from(&event.file_path)
        };

        let bytes = match tokio::fs::read(&spool_path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                // A previous delivery may have uploaded and removed the spool
                // file before the row was marked. Confirm against the store.
                return match self.store.get_object(key).await {
                    Ok(_) => Ok(()),
                    Err(BucketError::NotFound(_)) => Err(ImportError::System(format!(
                        "spool file missing and object absent for '{}'",
                        event.file_name
                    ))),
                    Err(err) => Err(store_unavailable(err)),
                };
            }
            Err(err) => return Err(err.into()),
        };

        let mut metadata = HashMap::new();
        metadata.insert("event-id".to_string(), event.event_id.to_string());
        metadata.insert("job-id".to_string(), event.job_id.to_string());

        self.store
            .put_object(key, bytes.into(), "application/json", &metadata)
            .await
            .map_err(store_unavailable)?;

        if let Err(err) = tokio::fs::remove_file(&spool_path).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %spool_path.display(), error = %err, "could not remove spool file");
            }
        }
        Ok(())
    }
}

fn store_unavailable(err: BucketError) -> ImportError {
    ImportError::StorageUnavailable(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_keys_live_under_the_imports_prefix() {
        let key = object_key("4a0a2e1c_tickets.json");
        assert_eq!(key, "imports/4a0a2e1c_tickets.json");
    }
}
