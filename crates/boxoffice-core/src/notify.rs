//! Fire-and-forget progress notifications.
//!
//! Subscribers (UI, monitoring) live outside the pipeline; a sink that
//! drops events or fails must never fail an import.

use std::sync::Mutex;

use serde::Serialize;
use uuid::Uuid;

use crate::ledger::ImportStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportEventKind {
    Started,
    Processing,
    Success,
    PartialSuccess,
    Failed,
    ValidationFailed,
    Updated,
}

impl ImportEventKind {
    pub fn from_status(status: ImportStatus) -> Self {
        match status {
            ImportStatus::Pending => ImportEventKind::Started,
            ImportStatus::Processing => ImportEventKind::Processing,
            ImportStatus::Success => ImportEventKind::Success,
            ImportStatus::PartialSuccess => ImportEventKind::PartialSuccess,
            ImportStatus::Failed => ImportEventKind::Failed,
            ImportStatus::ValidationFailed => ImportEventKind::ValidationFailed,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ImportEvent {
    pub job_id: Uuid,
    pub kind: ImportEventKind,
    pub message: String,
}

pub trait NotificationSink: Send + Sync {
    /// Must not block and must not fail the caller.
    fn notify(&self, event: ImportEvent);
}

/// Default sink: structured log lines.
pub struct LogSink;

impl NotificationSink for LogSink {
    fn notify(&self, event: ImportEvent) {
        tracing::info!(
            job_id = %event.job_id,
            kind = ?event.kind,
            message = event.message,
            "import progress"
        );
    }
}

/// Captures events for assertions in tests.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<ImportEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ImportEvent> {
        self.events.lock().expect("sink lock poisoned").clone()
    }

    pub fn kinds(&self) -> Vec<ImportEventKind> {
        self.events().into_iter().map(|event| event.kind).collect()
    }
}

impl NotificationSink for RecordingSink {
    fn notify(&self, event: ImportEvent) {
        self.events.lock().expect("sink lock poisoned").push(event);
    }
}
