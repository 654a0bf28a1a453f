use thiserror::Error;
use uuid::Uuid;

use crate::classify::{classify_db_error, DbErrorKind};

#[derive(Error, Debug)]
pub enum ImportError {
    #[error("validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("serialization conflict")]
    SerializationConflict,

    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("no import processor registered for entity type '{0}'")]
    NoProcessor(String),

    #[error("import job {0} not found")]
    JobNotFound(Uuid),

    #[error("import batch {0} not found")]
    BatchNotFound(Uuid),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("system error: {0}")]
    System(String),
}

impl ImportError {
    /// Taxonomy kind used by the retry layer and the sync path.
    pub fn db_kind(&self) -> DbErrorKind {
        match self {
            ImportError::SerializationConflict => DbErrorKind::Serialization,
            ImportError::DuplicateKey(_) => DbErrorKind::DuplicateKey,
            ImportError::StorageUnavailable(_) => DbErrorKind::Unavailable,
            ImportError::Database(err) => classify_db_error(err),
            _ => DbErrorKind::Other,
        }
    }

    pub fn is_serialization_conflict(&self) -> bool {
        matches!(self.db_kind(), DbErrorKind::Serialization)
    }

    pub fn is_duplicate_key(&self) -> bool {
        matches!(self.db_kind(), DbErrorKind::DuplicateKey)
    }
}

pub type Result<T> = std::result::Result<T, ImportError>;
