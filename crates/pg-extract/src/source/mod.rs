//! Database collaborator interfaces.
//!
//! - [`SourceConnector`]: opens one fresh session per call, no pooling
//! - [`SourceSession`]: metadata lookups, cursor statements and fetches on
//!   one open connection
//!
//! [`postgres`] implements both for PostgreSQL.

pub mod postgres;

use async_trait::async_trait;

use crate::core::{SqlValue, TableRef};
use crate::error::Result;
use crate::key_strategy::IndexColumn;

pub use postgres::PgConnector;

/// Rows returned by one fetch, in select-list order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchedBatch {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<SqlValue>>,
}

impl FetchedBatch {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }
}

/// Opens sessions against the source database.
#[async_trait]
pub trait SourceConnector: Send + Sync {
    /// Open a new session with a transaction already begun.
    async fn connect(&self) -> Result<Box<dyn SourceSession>>;

    /// Name of the database rows are read from.
    fn database_name(&self) -> &str;

    /// Login used for connections.
    fn user(&self) -> &str;
}

/// One open connection. Never shared, never reused after an error.
#[async_trait]
pub trait SourceSession: Send {
    /// Index membership of every indexed column of `table`.
    ///
    /// Fails with an `UndefinedTable` error if the table does not exist.
    async fn index_columns(&mut self, table: &TableRef) -> Result<Vec<IndexColumn>>;

    /// Name of the table's first column, if it has any.
    async fn first_column(&mut self, table: &TableRef) -> Result<Option<String>>;

    /// First column of the first row returned by `sql`.
    async fn query_scalar(&mut self, sql: &str) -> Result<Option<SqlValue>>;

    /// Run a statement that returns no rows.
    async fn execute(&mut self, sql: &str) -> Result<()>;

    /// Run a statement and decode all of its rows.
    async fn fetch(&mut self, sql: &str) -> Result<FetchedBatch>;

    /// Roll back and release the connection. Errors are logged, not returned.
    async fn close(&mut self);
}
