//! Table-by-table extraction in resumable batches.
//!
//! For the table at the checkpoint's index the engine resolves the resume
//! key once, snapshots the incremental upper bound once, declares a cursor
//! from the checkpoint position and fetches batches. Every non-empty batch
//! moves the checkpoint to the key of its last row and is handed to the
//! host; an empty batch releases the session and moves to the next table.
//!
//! Any failed database call drops the session. The next attempt, whether by
//! the retrying executor or by a later `read()`, declares a fresh cursor from
//! the last delivered position.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::checkpoint::{BatchId, Checkpoint};
use crate::core::{Row, SqlValue, TableRef};
use crate::error::{DbErrorKind, ExtractError, Result};
use crate::host::ExtractionHost;
use crate::key_strategy::{self, ResumeKey};
use crate::query::{self, IncrementalBound, ResumePredicate};
use crate::retry::{self, ActiveSession, RetryPolicy, RetryableExecutor};
use crate::source::{FetchedBatch, SourceConnector};

/// Rows per fetch when the caller does not say.
pub const DEFAULT_BATCH_SIZE: usize = 5000;

/// What to extract and how.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineOptions {
    /// Tables in extraction order.
    pub tables: Vec<TableRef>,
    pub batch_size: usize,
    pub incremental: Option<IncrementalOptions>,
    pub resume_predicate: ResumePredicate,
}

impl EngineOptions {
    pub fn new(tables: Vec<TableRef>) -> Self {
        Self {
            tables,
            batch_size: DEFAULT_BATCH_SIZE,
            incremental: None,
            resume_predicate: ResumePredicate::default(),
        }
    }
}

/// Caller-declared incremental column and its lower bound.
#[derive(Debug, Clone, PartialEq)]
pub struct IncrementalOptions {
    pub column: String,
    pub lower: Option<SqlValue>,
}

/// Result of one `read()`.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadOutcome {
    /// Rows of the current table. Empty when that table just ran out and
    /// more tables remain.
    Batch(Vec<Row>),
    /// Every table has been read.
    EndOfStream,
}

/// Where the engine is within the current table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No work done on the current table yet.
    Idle,
    /// Resume key chosen.
    KeysResolved,
    /// Incremental upper bound captured.
    BoundSnapshotted,
    /// Cursor declared, nothing fetched yet.
    CursorOpen,
    /// At least one batch fetched from the cursor.
    Fetching,
    /// All tables read.
    Finished,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Idle => "idle",
            Phase::KeysResolved => "keys_resolved",
            Phase::BoundSnapshotted => "bound_snapshotted",
            Phase::CursorOpen => "cursor_open",
            Phase::Fetching => "fetching",
            Phase::Finished => "finished",
        };
        f.write_str(s)
    }
}

/// State kept for the table being read.
#[derive(Debug, Clone)]
struct TableRun {
    table: TableRef,
    key: Option<ResumeKey>,
    /// `Some` once the bound has been snapshotted (or is not needed).
    bound: Option<Option<IncrementalBound>>,
}

impl TableRun {
    fn new(table: TableRef) -> Self {
        Self {
            table,
            key: None,
            bound: None,
        }
    }
}

/// Sequential, resumable extraction over a fixed list of tables.
pub struct ExtractionEngine {
    options: EngineOptions,
    executor: RetryableExecutor,
    connector: Arc<dyn SourceConnector>,
    host: Arc<dyn ExtractionHost>,
    checkpoint: Checkpoint,
    phase: Phase,
    current: Option<TableRun>,
    session: Option<ActiveSession>,
    started: Instant,
    duration_logged: bool,
}

impl ExtractionEngine {
    pub fn new(
        options: EngineOptions,
        connector: Arc<dyn SourceConnector>,
        host: Arc<dyn ExtractionHost>,
    ) -> Self {
        let executor = RetryableExecutor::new(
            RetryPolicy::default(),
            Arc::clone(&connector),
            Arc::clone(&host),
        );
        Self {
            options,
            executor,
            connector,
            host,
            checkpoint: Checkpoint::start(),
            phase: Phase::Idle,
            current: None,
            session: None,
            started: Instant::now(),
            duration_logged: false,
        }
    }

    /// Use `policy` for every database call and report a heartbeat every
    /// `heartbeat` while one runs. A zero interval disables the heartbeat.
    pub fn with_retry(mut self, policy: RetryPolicy, heartbeat: Duration) -> Self {
        self.executor = RetryableExecutor::new(
            policy,
            Arc::clone(&self.connector),
            Arc::clone(&self.host),
        )
        .with_heartbeat(heartbeat);
        self
    }

    /// Resume from a checkpoint persisted by an earlier run.
    pub fn with_checkpoint(mut self, checkpoint: Checkpoint) -> Self {
        self.checkpoint = checkpoint;
        self
    }

    pub fn checkpoint(&self) -> &Checkpoint {
        &self.checkpoint
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn tables(&self) -> &[TableRef] {
        &self.options.tables
    }

    /// Table at the checkpoint's index, unless extraction has finished.
    pub fn current_table(&self) -> Option<&TableRef> {
        self.options.tables.get(self.checkpoint.table_index)
    }

    /// Resume key of the current table, once resolved.
    pub fn resume_key(&self) -> Option<&ResumeKey> {
        self.current.as_ref().and_then(|run| run.key.as_ref())
    }

    /// Read the next batch.
    ///
    /// `batch_size` of `None` or zero uses the configured size. Returns an
    /// empty batch when a table has just been exhausted and
    /// [`ReadOutcome::EndOfStream`] once every table has been read.
    pub async fn read(&mut self, batch_size: Option<usize>) -> Result<ReadOutcome> {
        let batch_size = batch_size
            .filter(|n| *n > 0)
            .unwrap_or(self.options.batch_size)
            .max(1);

        let Some(table) = self.current_table().cloned() else {
            self.finish().await;
            return Ok(ReadOutcome::EndOfStream);
        };

        if self.current.as_ref().map(|run| &run.table) != Some(&table) {
            self.begin_table(table.clone());
        }

        let key = self.resolve_key(&table).await?;
        let bound = self.snapshot_bound(&table).await?;
        let select = query::build_select(
            &table,
            &key,
            self.checkpoint.last_key_values.as_deref(),
            bound.as_ref(),
            self.options.resume_predicate,
        )?;

        let batch = self.fetch(&table, &select, batch_size).await?;

        if batch.is_empty() {
            self.end_table(&table).await;
            return Ok(ReadOutcome::Batch(Vec::new()));
        }

        // The checkpoint only moves once the host has stored it. Otherwise the
        // cursor is dropped so the next read re-reads from the stored position.
        let batch_id = BatchId::new();
        let persisted = match self.deliver(&table, &key, batch, batch_id) {
            Ok((rows, checkpoint)) => self
                .host
                .persist_checkpoint(batch_id, &checkpoint)
                .await
                .map(|()| (rows, checkpoint)),
            Err(e) => Err(e),
        };

        match persisted {
            Ok((rows, checkpoint)) => {
                self.checkpoint = checkpoint;
                Ok(ReadOutcome::Batch(rows))
            }
            Err(e) => {
                warn!("Batch from {} not checkpointed, it will be read again: {}", table, e);
                self.rewind().await;
                Err(e)
            }
        }
    }

    /// Abandon the current table and move to the next one.
    pub async fn skip_table(&mut self) {
        if let Some(table) = self.current_table() {
            info!("Skipping table {}", table);
            self.host.log(&format!("Skipping table {}", table));
        }
        retry::release(&mut self.session).await;
        self.current = None;
        self.checkpoint.advance();
        self.phase = Phase::Idle;
    }

    /// Roll back and drop the open session, if any.
    pub async fn close(&mut self) {
        retry::release(&mut self.session).await;
    }

    fn begin_table(&mut self, table: TableRef) {
        let message = format!(
            "Reading table {} ({}) out of {}",
            self.checkpoint.table_index + 1,
            table,
            self.options.tables.len()
        );
        self.host.log(&message);
        self.host.report_progress(
            Some(self.checkpoint.table_index + 1),
            Some(self.options.tables.len()),
            &message,
        );
        self.current = Some(TableRun::new(table));
        self.phase = Phase::Idle;
    }

    /// Drop the cursor; key and bound stay resolved for the table.
    async fn rewind(&mut self) {
        retry::release(&mut self.session).await;
        self.phase = match self.current.as_ref().and_then(|run| run.bound.as_ref()) {
            Some(Some(_)) => Phase::BoundSnapshotted,
            _ => Phase::KeysResolved,
        };
    }

    async fn end_table(&mut self, table: &TableRef) {
        retry::release(&mut self.session).await;
        self.host
            .log(&format!("Finished collection of table: {}", table));
        self.current = None;
        self.checkpoint.advance();
        self.phase = Phase::Idle;
    }

    async fn finish(&mut self) {
        retry::release(&mut self.session).await;
        self.current = None;
        self.phase = Phase::Finished;
        if !self.duration_logged {
            self.duration_logged = true;
            self.host.log(&format!(
                "Collection duration: {}",
                format_duration(self.started.elapsed())
            ));
        }
    }

    async fn resolve_key(&mut self, table: &TableRef) -> Result<ResumeKey> {
        if let Some(key) = self.current.as_ref().and_then(|run| run.key.clone()) {
            return Ok(key);
        }

        let key = match &self.options.incremental {
            Some(inc) => ResumeKey::single(inc.column.clone()),
            None => self.key_from_metadata(table).await?,
        };
        debug!("resume key for {}: {:?}", table, key.columns());

        if let Some(values) = &self.checkpoint.last_key_values {
            if !key.is_empty() && values.len() != key.len() {
                return Err(ExtractError::State(format!(
                    "Checkpoint for {} has {} key values but the resume key ({}) has {} columns",
                    table,
                    values.len(),
                    key.columns().join(", "),
                    key.len()
                )));
            }
        }

        if let Some(run) = self.current.as_mut() {
            run.key = Some(key.clone());
        }
        self.phase = Phase::KeysResolved;
        Ok(key)
    }

    async fn key_from_metadata(&mut self, table: &TableRef) -> Result<ResumeKey> {
        let columns = {
            let t = table.clone();
            self.executor
                .run("index lookup", &mut self.session, move |s| {
                    let t = t.clone();
                    Box::pin(async move { s.conn.index_columns(&t).await })
                })
                .await
                .map_err(|e| self.classify(e, table))?
        };

        if let Some(key) = key_strategy::select(&columns) {
            return Ok(key);
        }

        let t = table.clone();
        let first = self
            .executor
            .run("column lookup", &mut self.session, move |s| {
                let t = t.clone();
                Box::pin(async move { s.conn.first_column(&t).await })
            })
            .await
            .map_err(|e| self.classify(e, table))?;

        Ok(first.map(ResumeKey::single).unwrap_or_default())
    }

    async fn snapshot_bound(&mut self, table: &TableRef) -> Result<Option<IncrementalBound>> {
        if let Some(bound) = self.current.as_ref().and_then(|run| run.bound.clone()) {
            return Ok(bound);
        }

        let bound = match self.options.incremental.clone() {
            None => None,
            Some(inc) => {
                let sql = query::max_value_query(table, &inc.column)?;
                debug!("{}", sql);
                let upper = self
                    .executor
                    .run("max value", &mut self.session, move |s| {
                        let sql = sql.clone();
                        Box::pin(async move { s.conn.query_scalar(&sql).await })
                    })
                    .await
                    .map_err(|e| self.classify(e, table))?;
                self.phase = Phase::BoundSnapshotted;
                Some(IncrementalBound {
                    column: inc.column,
                    lower: inc.lower,
                    upper,
                })
            }
        };

        if let Some(run) = self.current.as_mut() {
            run.bound = Some(bound.clone());
        }
        Ok(bound)
    }

    async fn fetch(&mut self, table: &TableRef, select: &str, batch_size: usize) -> Result<FetchedBatch> {
        let declare = query::declare_cursor(select);
        let fetch = query::fetch_forward(batch_size);

        if !self.session.as_ref().is_some_and(|s| s.cursor_open) {
            debug!("{}", declare);
            let declare = declare.clone();
            self.executor
                .run("open cursor", &mut self.session, move |s| {
                    let declare = declare.clone();
                    Box::pin(async move { ensure_cursor(s, &declare).await })
                })
                .await
                .map_err(|e| self.classify(e, table))?;
            self.phase = Phase::CursorOpen;
        }

        let batch = self
            .executor
            .run("fetch", &mut self.session, move |s| {
                let declare = declare.clone();
                let fetch = fetch.clone();
                Box::pin(async move {
                    ensure_cursor(s, &declare).await?;
                    s.conn.fetch(&fetch).await
                })
            })
            .await
            .map_err(|e| self.classify(e, table))?;

        self.phase = Phase::Fetching;
        debug!("fetched {} rows from {}", batch.len(), table);
        Ok(batch)
    }

    /// Annotated rows plus the checkpoint positioned after the last of them.
    fn deliver(
        &self,
        table: &TableRef,
        key: &ResumeKey,
        batch: FetchedBatch,
        batch_id: BatchId,
    ) -> Result<(Vec<Row>, Checkpoint)> {
        let mut checkpoint = self.checkpoint.clone();
        if let Some(last) = batch.rows.last() {
            checkpoint.last_key_values = Some(key_values(key, &batch.columns, last)?);
        }

        let database_name = self.connector.database_name().to_string();
        let columns = batch.columns;
        let rows = batch
            .rows
            .into_iter()
            .map(|values| Row {
                fields: columns.iter().cloned().zip(values).collect(),
                schema_name: table.schema.clone(),
                table_name: table.name.clone(),
                database_name: database_name.clone(),
                batch_id,
            })
            .collect();
        Ok((rows, checkpoint))
    }

    /// Turn driver error kinds into the errors callers act on.
    fn classify(&self, err: ExtractError, table: &TableRef) -> ExtractError {
        let ExtractError::Database(db) = &err else {
            return err;
        };
        match db.kind {
            DbErrorKind::UndefinedTable => ExtractError::TableNotFound {
                schema: table.schema.clone(),
                table: table.name.clone(),
            },
            DbErrorKind::UndefinedColumn => match &self.options.incremental {
                Some(inc) => ExtractError::IncrementalColumnMissing {
                    table: table.to_string(),
                    column: inc.column.clone(),
                },
                None => err,
            },
            DbErrorKind::Authentication => ExtractError::Authentication {
                user: self.connector.user().to_string(),
                message: db.message.clone(),
            },
            DbErrorKind::Authorization => ExtractError::PermissionDenied {
                user: self.connector.user().to_string(),
                message: db.message.clone(),
            },
            _ => err,
        }
    }
}

async fn ensure_cursor(session: &mut ActiveSession, declare: &str) -> Result<()> {
    if !session.cursor_open {
        session.conn.execute(declare).await?;
        session.cursor_open = true;
    }
    Ok(())
}

fn key_values(key: &ResumeKey, columns: &[String], row: &[SqlValue]) -> Result<Vec<SqlValue>> {
    key.columns()
        .iter()
        .map(|k| {
            columns
                .iter()
                .position(|c| c == k)
                .and_then(|i| row.get(i))
                .cloned()
                .ok_or_else(|| {
                    ExtractError::State(format!("Resume key column {:?} missing from fetched rows", k))
                })
        })
        .collect()
}

/// `HH:MM:SS`
pub fn format_duration(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}
