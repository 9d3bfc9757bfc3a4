//! Error types for the extraction library.

use std::fmt;
use thiserror::Error;

/// Exit codes used by the CLI for each error class.
pub const EXIT_CONFIG_ERROR: u8 = 1;
pub const EXIT_AUTH_ERROR: u8 = 2;
pub const EXIT_SCHEMA_ERROR: u8 = 3;
pub const EXIT_DATABASE_ERROR: u8 = 4;
pub const EXIT_STATE_ERROR: u8 = 5;
pub const EXIT_CANCELLED: u8 = 6;
pub const EXIT_IO_ERROR: u8 = 7;

/// Classification of a failed database call.
///
/// Drivers derive the kind from the server's structured error (SQLSTATE for
/// PostgreSQL) so the engine never has to match on message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DbErrorKind {
    /// The referenced relation does not exist.
    UndefinedTable,
    /// The referenced column does not exist.
    UndefinedColumn,
    /// Login rejected by the server.
    Authentication,
    /// Logged in, but not allowed to read the object.
    Authorization,
    /// Statement rejected before running (syntax or access rule error).
    InvalidStatement,
    /// Connection could not be established or was lost.
    Connection,
    /// Statement or connect timeout.
    Timeout,
    /// Any other operational error.
    Other,
}

impl DbErrorKind {
    /// Whether a failure of this kind may succeed on a fresh connection.
    #[inline]
    pub const fn is_transient(self) -> bool {
        matches!(self, Self::Connection | Self::Timeout | Self::Other)
    }
}

impl fmt::Display for DbErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::UndefinedTable => "undefined table",
            Self::UndefinedColumn => "undefined column",
            Self::Authentication => "authentication",
            Self::Authorization => "authorization",
            Self::InvalidStatement => "invalid statement",
            Self::Connection => "connection",
            Self::Timeout => "timeout",
            Self::Other => "database",
        };
        f.write_str(s)
    }
}

/// Structured error returned by the database collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbError {
    pub kind: DbErrorKind,
    /// Driver-specific code (SQLSTATE for PostgreSQL).
    pub code: Option<String>,
    pub message: String,
}

impl DbError {
    pub fn new(kind: DbErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: None,
            message: message.into(),
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{} error [{}]: {}", self.kind, code, self.message),
            None => write!(f, "{} error: {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for DbError {}

/// Main error type for extraction operations.
#[derive(Error, Debug)]
pub enum ExtractError {
    /// Configuration error (invalid YAML, malformed table reference, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Login rejected. Never retried.
    #[error("Login failed for user: {user} ({message})")]
    Authentication { user: String, message: String },

    /// Insufficient privilege on a table or schema. Never retried.
    #[error("Permission denied for user: {user} ({message})")]
    PermissionDenied { user: String, message: String },

    /// Table does not exist in the source database.
    #[error("Table \"{schema}\".\"{table}\" does not exist")]
    TableNotFound { schema: String, table: String },

    /// Configured incremental column is not present on the table.
    #[error("Incremental key \"{column}\" does not exist in the table \"{table}\"")]
    IncrementalColumnMissing { table: String, column: String },

    /// Database call failed.
    #[error("Source database error: {0}")]
    Database(#[from] DbError),

    /// Checkpoint file or checkpoint contents are unusable.
    #[error("State error: {0}")]
    State(String),

    /// Extraction was stopped by the caller (SIGINT, etc.)
    #[error("Extraction cancelled")]
    Cancelled,

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ExtractError {
    /// Create a database error of the given kind.
    pub fn db(kind: DbErrorKind, message: impl Into<String>) -> Self {
        ExtractError::Database(DbError::new(kind, message))
    }

    /// Whether the retrying executor may attempt the call again.
    pub fn is_retryable(&self) -> bool {
        match self {
            ExtractError::Database(e) => e.kind.is_transient(),
            _ => false,
        }
    }

    /// Kind of the underlying database error, if any.
    pub fn db_kind(&self) -> Option<DbErrorKind> {
        match self {
            ExtractError::Database(e) => Some(e.kind),
            _ => None,
        }
    }

    /// Process exit code for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            ExtractError::Config(_) | ExtractError::Yaml(_) | ExtractError::Json(_) => {
                EXIT_CONFIG_ERROR
            }
            ExtractError::Authentication { .. } | ExtractError::PermissionDenied { .. } => {
                EXIT_AUTH_ERROR
            }
            ExtractError::TableNotFound { .. } | ExtractError::IncrementalColumnMissing { .. } => {
                EXIT_SCHEMA_ERROR
            }
            ExtractError::Database(_) => EXIT_DATABASE_ERROR,
            ExtractError::State(_) => EXIT_STATE_ERROR,
            ExtractError::Cancelled => EXIT_CANCELLED,
            ExtractError::Io(_) => EXIT_IO_ERROR,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for extraction operations.
pub type Result<T> = std::result::Result<T, ExtractError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_kinds_are_retryable() {
        for kind in [DbErrorKind::Connection, DbErrorKind::Timeout, DbErrorKind::Other] {
            assert!(ExtractError::db(kind, "boom").is_retryable());
        }
    }

    #[test]
    fn test_fatal_kinds_are_not_retryable() {
        for kind in [
            DbErrorKind::UndefinedTable,
            DbErrorKind::UndefinedColumn,
            DbErrorKind::Authentication,
            DbErrorKind::Authorization,
            DbErrorKind::InvalidStatement,
        ] {
            assert!(!ExtractError::db(kind, "boom").is_retryable());
        }
        assert!(!ExtractError::Config("bad".into()).is_retryable());
        assert!(!ExtractError::TableNotFound {
            schema: "public".into(),
            table: "t".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(ExtractError::Config("x".into()).exit_code(), EXIT_CONFIG_ERROR);
        assert_eq!(
            ExtractError::Authentication {
                user: "u".into(),
                message: "m".into()
            }
            .exit_code(),
            EXIT_AUTH_ERROR
        );
        assert_eq!(
            ExtractError::PermissionDenied {
                user: "u".into(),
                message: "permission denied for table t".into()
            }
            .exit_code(),
            EXIT_AUTH_ERROR
        );
        assert_eq!(
            ExtractError::db(DbErrorKind::Connection, "x").exit_code(),
            EXIT_DATABASE_ERROR
        );
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        assert_eq!(ExtractError::from(io).exit_code(), EXIT_IO_ERROR);
    }

    #[test]
    fn test_messages_name_table_and_column() {
        let err = ExtractError::IncrementalColumnMissing {
            table: "public.table1".into(),
            column: "id".into(),
        };
        assert_eq!(
            err.to_string(),
            "Incremental key \"id\" does not exist in the table \"public.table1\""
        );

        let err = ExtractError::TableNotFound {
            schema: "public".into(),
            table: "gone".into(),
        };
        assert_eq!(err.to_string(), "Table \"public\".\"gone\" does not exist");
    }

    #[test]
    fn test_format_detailed_includes_chain() {
        let err = ExtractError::from(DbError::new(DbErrorKind::Timeout, "statement timeout").with_code("57014"));
        let detailed = err.format_detailed();
        assert!(detailed.contains("Source database error"));
        assert!(detailed.contains("[57014]"));
    }
}
