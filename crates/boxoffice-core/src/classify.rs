//! Maps driver-level database errors onto the pipeline's error taxonomy.
//!
//! All classification goes through one explicit function instead of being
//! scattered across call sites, so the SQLSTATE table below is the single
//! place that decides what counts as retryable.

use sqlx::postgres::PgDatabaseError;

/// SQLSTATE raised by Postgres when a SERIALIZABLE transaction aborts.
pub const SQLSTATE_SERIALIZATION_FAILURE: &str = "40001";
/// SQLSTATE for unique-constraint violations.
pub const SQLSTATE_UNIQUE_VIOLATION: &str = "23505";

const SQLSTATE_FOREIGN_KEY_VIOLATION: &str = "23503";
const SQLSTATE_NOT_NULL_VIOLATION: &str = "23502";
const SQLSTATE_CHECK_VIOLATION: &str = "23514";

/// Maximum depth walked along `Error::source()` chains.
const MAX_CAUSE_DEPTH: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbErrorKind {
    /// Transient concurrency-control abort; the only retryable kind.
    Serialization,
    /// Unique-constraint violation on a natural key.
    DuplicateKey,
    /// Any other integrity-constraint violation.
    Constraint,
    /// Database or network transport unreachable.
    Unavailable,
    Other,
}

pub fn classify_sqlstate(code: &str) -> DbErrorKind {
    match code {
        SQLSTATE_SERIALIZATION_FAILURE => DbErrorKind::Serialization,
        SQLSTATE_UNIQUE_VIOLATION => DbErrorKind::DuplicateKey,
        SQLSTATE_FOREIGN_KEY_VIOLATION | SQLSTATE_NOT_NULL_VIOLATION | SQLSTATE_CHECK_VIOLATION => {
            DbErrorKind::Constraint
        }
        _ => DbErrorKind::Other,
    }
}

pub fn classify_db_error(err: &sqlx::Error) -> DbErrorKind {
    match err {
        sqlx::Error::Database(db_err) => db_err
            .code()
            .map(|code| classify_sqlstate(&code))
            .unwrap_or(DbErrorKind::Other),
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            DbErrorKind::Unavailable
        }
        _ => DbErrorKind::Other,
    }
}

/// Walks an arbitrary error chain looking for a nested `sqlx::Error`.
///
/// Iterative with a bounded depth; callers get a tagged kind back rather
/// than a re-thrown exception.
pub fn classify_error(err: &(dyn std::error::Error + 'static)) -> DbErrorKind {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
    for _ in 0..MAX_CAUSE_DEPTH {
        let Some(cause) = current else {
            break;
        };
        if let Some(sqlx_err) = cause.downcast_ref::<sqlx::Error>() {
            return classify_db_error(sqlx_err);
        }
        current = cause.source();
    }
    DbErrorKind::Other
}

/// Best-effort human-readable description of a database failure, suitable
/// for the job ledger's result description.
pub fn describe_db_error(err: &sqlx::Error) -> String {
    let sqlx::Error::Database(db_err) = err else {
        return format!("System error: {err}");
    };

    let Some(pg_err) = db_err.try_downcast_ref::<PgDatabaseError>() else {
        return db_err.message().to_string();
    };

    match classify_sqlstate(pg_err.code()) {
        DbErrorKind::DuplicateKey => {
            let constraint = pg_err.constraint().unwrap_or("unknown");
            match pg_err.detail() {
                Some(detail) => format!(
                    "Duplicate value violates unique constraint: {constraint}. {detail}"
                ),
                None => format!("Duplicate value violates unique constraint: {constraint}"),
            }
        }
        DbErrorKind::Constraint => match pg_err.constraint() {
            Some(constraint) => format!(
                "Constraint violation: {constraint} - value does not meet required conditions"
            ),
            None => "Constraint violation: value does not meet required conditions".to_string(),
        },
        _ => pg_err.message().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlstate_table_maps_taxonomy() {
        assert_eq!(classify_sqlstate("40001"), DbErrorKind::Serialization);
        assert_eq!(classify_sqlstate("23505"), DbErrorKind::DuplicateKey);
        assert_eq!(classify_sqlstate("23503"), DbErrorKind::Constraint);
        assert_eq!(classify_sqlstate("23502"), DbErrorKind::Constraint);
        assert_eq!(classify_sqlstate("23514"), DbErrorKind::Constraint);
        assert_eq!(classify_sqlstate("42601"), DbErrorKind::Other);
    }

    #[test]
    fn io_errors_are_unavailable() {
        let err = sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        ));
        assert_eq!(classify_db_error(&err), DbErrorKind::Unavailable);
    }

    #[derive(Debug)]
    struct Wrapper {
        source: Option<Box<dyn std::error::Error + 'static>>,
    }

    impl std::fmt::Display for Wrapper {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "wrapper")
        }
    }

    impl std::error::Error for Wrapper {
        fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
            self.source.as_deref()
        }
    }

    fn wrap(depth: usize, inner: Box<dyn std::error::Error + 'static>) -> Wrapper {
        let mut current = Wrapper {
            source: Some(inner),
        };
        for _ in 0..depth {
            current = Wrapper {
                source: Some(Box::new(current)),
            };
        }
        current
    }

    #[test]
    fn cause_walk_finds_nested_sqlx_error() {
        let inner = sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "broken",
        ));
        let chained = wrap(3, Box::new(inner));
        assert_eq!(classify_error(&chained), DbErrorKind::Unavailable);
    }

    #[test]
    fn cause_walk_is_depth_bounded() {
        let inner = sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "broken",
        ));
        let chained = wrap(10, Box::new(inner));
        assert_eq!(classify_error(&chained), DbErrorKind::Other);
    }

    #[test]
    fn plain_errors_classify_as_other() {
        let err = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        assert_eq!(classify_error(&err), DbErrorKind::Other);
    }
}
