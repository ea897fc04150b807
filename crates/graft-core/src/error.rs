use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Core error type for graft operations.
#[derive(Error, Debug)]
pub enum GraftError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Statement failed: {message}\n  statement: {statement}")]
    Statement { statement: String, message: String },

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Validation failed: {}", format_issues(.0))]
    Validation(Vec<ValidationIssue>),

    #[error("Checksum mismatch for migration {name}: recorded {expected}, computed {actual}")]
    ChecksumMismatch {
        name: String,
        expected: String,
        actual: String,
    },

    #[error("Migration {name} failed during {phase}: {source}")]
    Migration {
        name: String,
        phase: MigrationPhase,
        #[source]
        source: Box<GraftError>,
    },

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GraftError {
    /// Wrap an error as the failure of a named migration step.
    pub fn migration(name: impl Into<String>, phase: MigrationPhase, source: GraftError) -> Self {
        GraftError::Migration {
            name: name.into(),
            phase,
            source: Box::new(source),
        }
    }

    /// Attach the statement that was running when this error occurred.
    /// Errors that already name a statement, pool errors and cancellation pass through.
    pub fn in_statement(self, statement: &str) -> Self {
        match self {
            GraftError::Statement { .. } | GraftError::Pool(_) | GraftError::Cancelled => self,
            other => GraftError::Statement {
                statement: statement.trim().to_string(),
                message: other.to_string(),
            },
        }
    }

    /// Whether retrying the same operation later could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            GraftError::Pool(e) => e.is_retryable(),
            GraftError::Database(_) | GraftError::Io(_) => true,
            GraftError::Migration { source, .. } => source.is_retryable(),
            _ => false,
        }
    }
}

/// Errors raised by the connection pool.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("Timed out after {0:?} waiting for a connection")]
    Timeout(Duration),

    #[error("Connection pool is closed")]
    Closed,

    #[error("Connection acquisition cancelled")]
    Cancelled,
}

impl PoolError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, PoolError::Closed)
    }
}

/// The step of a migration that was running when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationPhase {
    Up,
    Down,
    Record,
    Delete,
}

impl fmt::Display for MigrationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationPhase::Up => write!(f, "up"),
            MigrationPhase::Down => write!(f, "down"),
            MigrationPhase::Record => write!(f, "record"),
            MigrationPhase::Delete => write!(f, "delete"),
        }
    }
}

/// How serious a validation finding is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// The input cannot be run.
    Error,
    /// The input was corrected automatically.
    Warning,
}

/// A single finding from validating a migration list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationIssue {
    pub name: String,
    pub message: String,
    pub severity: Severity,
}

impl ValidationIssue {
    pub fn error(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            severity: Severity::Error,
        }
    }

    pub fn warning(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            severity: Severity::Warning,
        }
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
        };
        write!(f, "{} ({}): {}", self.name, level, self.message)
    }
}

fn format_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result type alias using GraftError.
pub type Result<T> = std::result::Result<T, GraftError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_message_lists_issues() {
        let err = GraftError::Validation(vec![
            ValidationIssue::error("[index 0]", "migration name is empty"),
            ValidationIssue::error("001_init", "duplicate migration name"),
        ]);
        let msg = err.to_string();
        assert!(msg.contains("[index 0] (error): migration name is empty"));
        assert!(msg.contains("001_init (error): duplicate migration name"));
    }

    #[test]
    fn test_migration_error_names_phase() {
        let err = GraftError::migration(
            "002_people",
            MigrationPhase::Up,
            GraftError::Database("boom".into()),
        );
        assert_eq!(
            err.to_string(),
            "Migration 002_people failed during up: Database error: boom"
        );
        assert!(err.is_retryable());
    }

    #[test]
    fn test_in_statement_names_the_statement() {
        let err =
            GraftError::Database("type conflict".into()).in_statement("define entity person;\n");
        match &err {
            GraftError::Statement { statement, message } => {
                assert_eq!(statement, "define entity person;");
                assert_eq!(message, "Database error: type conflict");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.to_string().contains("define entity person;"));
    }

    #[test]
    fn test_in_statement_keeps_existing_context() {
        let original = GraftError::Statement {
            statement: "define a;".into(),
            message: "bad".into(),
        };
        match original.in_statement("define b;") {
            GraftError::Statement { statement, .. } => assert_eq!(statement, "define a;"),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(matches!(
            GraftError::Cancelled.in_statement("define b;"),
            GraftError::Cancelled
        ));
    }

    #[test]
    fn test_pool_error_retryable() {
        assert!(PoolError::Timeout(Duration::from_millis(10)).is_retryable());
        assert!(PoolError::Cancelled.is_retryable());
        assert!(!PoolError::Closed.is_retryable());
        assert!(!GraftError::from(PoolError::Closed).is_retryable());
    }
}
