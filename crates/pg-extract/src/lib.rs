//! # pg-extract
//!
//! Incremental, resumable extraction of PostgreSQL tables.
//!
//! Tables are read one at a time, in bounded batches from a server-side
//! cursor, ordered by a resume key chosen from each table's indexes:
//!
//! - **Resume keys** from the primary key, then a unique index, then any index
//! - **Incremental columns** with a snapshotted upper bound
//! - **Checkpoints** after every delivered batch, persisted by the caller
//! - **Retry with reconnect** on transient database errors, resuming from
//!   the last checkpoint instead of the start of the table
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use pg_extract::{Config, ExtractionEngine, PgConnector, ReadOutcome, TracingHost};
//!
//! #[tokio::main]
//! async fn main() -> pg_extract::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let connector = Arc::new(PgConnector::new(&config.source)?);
//!     let mut engine = ExtractionEngine::new(
//!         config.engine_options()?,
//!         connector,
//!         Arc::new(TracingHost::new()),
//!     );
//!
//!     while let ReadOutcome::Batch(rows) = engine.read(None).await? {
//!         for row in rows {
//!             println!("{}", row.to_json());
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod checkpoint;
pub mod config;
pub mod core;
pub mod engine;
pub mod error;
pub mod host;
pub mod key_strategy;
pub mod query;
pub mod retry;
pub mod source;
pub mod state;

// Re-exports for convenient access
pub use checkpoint::{BatchId, Checkpoint};
pub use config::{Config, ExtractionConfig, RetryConfig, SourceConfig};
pub use crate::core::{Row, SqlValue, TableRef};
pub use engine::{EngineOptions, ExtractionEngine, IncrementalOptions, Phase, ReadOutcome};
pub use error::{DbError, DbErrorKind, ExtractError, Result};
pub use host::{ExtractionHost, TracingHost};
pub use key_strategy::{IndexColumn, KeyStrategy, ResumeKey};
pub use query::{IncrementalBound, ResumePredicate};
pub use retry::{RetryPolicy, RetryableExecutor};
pub use source::{FetchedBatch, PgConnector, SourceConnector, SourceSession};
pub use state::CheckpointFile;
