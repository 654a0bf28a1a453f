//! Point-to-point delivery of batch messages to a bounded consumer pool.
//!
//! The broker is an external collaborator; this module only defines the
//! seam plus an in-process implementation backed by a bounded tokio channel.
//! Consumers share one receiver, so each message is delivered to exactly one
//! worker.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::error::{ImportError, Result};
use crate::processor::EntityKind;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchMessage {
    pub batch_id: Uuid,
    pub job_id: Uuid,
    pub entity_kind: EntityKind,
    pub records: Vec<Value>,
    pub batch_number: usize,
    pub total_batches: usize,
    pub total_records: usize,
}

#[async_trait]
pub trait BatchQueue: Send + Sync {
    async fn publish(&self, message: BatchMessage) -> Result<()>;
}

/// Shared handle the worker pool consumes from.
pub type BatchReceiver = Arc<Mutex<mpsc::Receiver<BatchMessage>>>;

pub struct InProcessQueue {
    tx: mpsc::Sender<BatchMessage>,
}

impl InProcessQueue {
    pub fn new(depth: usize) -> (Arc<Self>, BatchReceiver) {
        let (tx, rx) = mpsc::channel(depth);
        (Arc::new(Self { tx }), Arc::new(Mutex::new(rx)))
    }
}

#[async_trait]
impl BatchQueue for InProcessQueue {
    async fn publish(&self, message: BatchMessage) -> Result<()> {
        let batch_id = message.batch_id;
        self.tx
            .send(message)
            .await
            .map_err(|_| ImportError::StorageUnavailable("batch queue closed".to_string()))?;
        tracing::debug!(%batch_id, "published batch message");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(number: usize) -> BatchMessage {
        BatchMessage {
            batch_id: Uuid::new_v4(),
            job_id: Uuid::new_v4(),
            entity_kind: EntityKind::Ticket,
            records: vec![],
            batch_number: number,
            total_batches: 4,
            total_records: 0,
        }
    }

    #[tokio::test]
    async fn each_message_is_delivered_to_one_consumer() {
        let (queue, receiver) = InProcessQueue::new(8);

        for number in 1..=4 {
            queue.publish(message(number)).await.unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..2 {
            let receiver = receiver.clone();
            handles.push(tokio::spawn(async move {
                let mut seen = Vec::new();
                loop {
                    let next = { receiver.lock().await.try_recv() };
                    match next {
                        Ok(msg) => seen.push(msg.batch_number),
                        Err(_) => break,
                    }
                }
                seen
            }));
        }

        let mut all: Vec<usize> = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        all.sort_unstable();
        assert_eq!(all, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn publish_to_closed_queue_is_unavailable() {
        let (queue, receiver) = InProcessQueue::new(1);
        drop(receiver);
        let err = queue.publish(message(1)).await.unwrap_err();
        assert!(matches!(err, ImportError::StorageUnavailable(_)));
    }
}
