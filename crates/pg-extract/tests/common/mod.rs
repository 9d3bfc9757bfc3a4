//! Scripted in-memory database and recording host for engine tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pg_extract::{
    BatchId, Checkpoint, DbErrorKind, EngineOptions, ExtractError, ExtractionEngine,
    ExtractionHost, FetchedBatch, IndexColumn, Result, RetryPolicy, SourceConnector,
    SourceSession, SqlValue, TableRef,
};

/// A table whose fetches return scripted batches in order.
#[derive(Default, Clone)]
pub struct MockTable {
    pub columns: Vec<String>,
    pub index: Vec<IndexColumn>,
    pub batches: VecDeque<Vec<Vec<SqlValue>>>,
    pub max: Option<SqlValue>,
}

impl MockTable {
    pub fn new(columns: &[&str]) -> Self {
        Self {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn with_index(mut self, index: Vec<IndexColumn>) -> Self {
        self.index = index;
        self
    }

    pub fn with_batch(mut self, rows: Vec<Vec<SqlValue>>) -> Self {
        self.batches.push_back(rows);
        self
    }

    pub fn with_max(mut self, max: SqlValue) -> Self {
        self.max = Some(max);
        self
    }
}

#[derive(Default)]
pub struct MockDb {
    pub tables: HashMap<String, MockTable>,
    /// Every statement run through `execute`, `query_scalar` or `fetch`.
    pub statements: Vec<String>,
    pub connects: usize,
    pub closes: usize,
    pub index_lookups: usize,
    pub max_queries: usize,
    pub fetch_failures: VecDeque<DbErrorKind>,
    pub connect_failures: VecDeque<DbErrorKind>,
}

impl MockDb {
    pub fn with_table(mut self, name: &str, table: MockTable) -> Self {
        self.tables.insert(name.to_string(), table);
        self
    }

    /// Statements that declared a cursor.
    pub fn declares(&self) -> Vec<String> {
        self.statements
            .iter()
            .filter(|s| s.starts_with("DECLARE"))
            .cloned()
            .collect()
    }

    pub fn fetches(&self) -> Vec<String> {
        self.statements
            .iter()
            .filter(|s| s.starts_with("FETCH"))
            .cloned()
            .collect()
    }

    fn table_in_sql(&self, sql: &str) -> Option<String> {
        self.tables
            .keys()
            .find(|name| {
                let t = TableRef::parse(name).unwrap();
                sql.contains(&t.qualified().unwrap())
            })
            .cloned()
    }
}

fn db_error(kind: DbErrorKind, message: &str) -> ExtractError {
    ExtractError::db(kind, message)
}

pub struct MockConnector {
    pub db: Arc<Mutex<MockDb>>,
}

impl MockConnector {
    pub fn new(db: MockDb) -> (Arc<Self>, Arc<Mutex<MockDb>>) {
        let db = Arc::new(Mutex::new(db));
        (
            Arc::new(Self {
                db: Arc::clone(&db),
            }),
            db,
        )
    }
}

#[async_trait]
impl SourceConnector for MockConnector {
    async fn connect(&self) -> Result<Box<dyn SourceSession>> {
        let mut db = self.db.lock().unwrap();
        db.connects += 1;
        if let Some(kind) = db.connect_failures.pop_front() {
            let message = match kind {
                DbErrorKind::Authentication => "password authentication failed for user \"reader\"",
                _ => "could not connect to server",
            };
            return Err(db_error(kind, message));
        }
        Ok(Box::new(MockSession {
            db: Arc::clone(&self.db),
            cursor: None,
        }))
    }

    fn database_name(&self) -> &str {
        "foobar"
    }

    fn user(&self) -> &str {
        "reader"
    }
}

pub struct MockSession {
    db: Arc<Mutex<MockDb>>,
    cursor: Option<String>,
}

#[async_trait]
impl SourceSession for MockSession {
    async fn index_columns(&mut self, table: &TableRef) -> Result<Vec<IndexColumn>> {
        let mut db = self.db.lock().unwrap();
        db.index_lookups += 1;
        match db.tables.get(&table.to_string()) {
            Some(t) => Ok(t.index.clone()),
            None => Err(db_error(DbErrorKind::UndefinedTable, "relation does not exist")),
        }
    }

    async fn first_column(&mut self, table: &TableRef) -> Result<Option<String>> {
        let db = self.db.lock().unwrap();
        match db.tables.get(&table.to_string()) {
            Some(t) => Ok(t.columns.first().cloned()),
            None => Err(db_error(DbErrorKind::UndefinedTable, "relation does not exist")),
        }
    }

    async fn query_scalar(&mut self, sql: &str) -> Result<Option<SqlValue>> {
        let mut db = self.db.lock().unwrap();
        db.statements.push(sql.to_string());
        db.max_queries += 1;
        let Some(name) = db.table_in_sql(sql) else {
            return Err(db_error(DbErrorKind::UndefinedTable, "relation does not exist"));
        };
        let table = &db.tables[&name];
        if !table
            .columns
            .iter()
            .any(|c| sql.contains(&format!("MAX(\"{}\")", c)))
        {
            return Err(db_error(DbErrorKind::UndefinedColumn, "column does not exist"));
        }
        Ok(table.max.clone())
    }

    async fn execute(&mut self, sql: &str) -> Result<()> {
        let mut db = self.db.lock().unwrap();
        db.statements.push(sql.to_string());
        if sql.starts_with("DECLARE") {
            match db.table_in_sql(sql) {
                Some(name) => self.cursor = Some(name),
                None => return Err(db_error(DbErrorKind::UndefinedTable, "relation does not exist")),
            }
        }
        Ok(())
    }

    async fn fetch(&mut self, sql: &str) -> Result<FetchedBatch> {
        let mut db = self.db.lock().unwrap();
        db.statements.push(sql.to_string());
        if let Some(kind) = db.fetch_failures.pop_front() {
            return Err(db_error(kind, "server closed the connection unexpectedly"));
        }
        let Some(name) = self.cursor.clone() else {
            return Err(db_error(DbErrorKind::Other, "cursor \"cur\" does not exist"));
        };
        let table = db.tables.get_mut(&name).unwrap();
        let rows = table.batches.pop_front().unwrap_or_default();
        Ok(FetchedBatch {
            columns: table.columns.clone(),
            rows,
        })
    }

    async fn close(&mut self) {
        self.db.lock().unwrap().closes += 1;
    }
}

/// Host that keeps everything it is told.
#[derive(Default)]
pub struct RecordingHost {
    pub logs: Mutex<Vec<String>>,
    pub progress: Mutex<Vec<String>>,
    pub checkpoints: Mutex<Vec<(BatchId, Checkpoint)>>,
    /// Number of upcoming `persist_checkpoint` calls that fail.
    pub persist_failures: Mutex<usize>,
}

impl RecordingHost {
    pub fn fail_next_persists(&self, count: usize) {
        *self.persist_failures.lock().unwrap() = count;
    }

    pub fn checkpoints(&self) -> Vec<(BatchId, Checkpoint)> {
        self.checkpoints.lock().unwrap().clone()
    }

    pub fn logs(&self) -> Vec<String> {
        self.logs.lock().unwrap().clone()
    }
}

#[async_trait]
impl ExtractionHost for RecordingHost {
    fn log(&self, message: &str) {
        self.logs.lock().unwrap().push(message.to_string());
    }

    fn report_progress(&self, _current: Option<usize>, _total: Option<usize>, message: &str) {
        self.progress.lock().unwrap().push(message.to_string());
    }

    async fn persist_checkpoint(&self, batch_id: BatchId, checkpoint: &Checkpoint) -> Result<()> {
        {
            let mut failures = self.persist_failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(ExtractError::State("disk full".into()));
            }
        }
        self.checkpoints
            .lock()
            .unwrap()
            .push((batch_id, checkpoint.clone()));
        Ok(())
    }
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_tries: 5,
        base_delay: Duration::from_millis(1),
        factor: 2.0,
        max_delay: Duration::from_millis(10),
    }
}

pub fn engine(
    options: EngineOptions,
    db: MockDb,
) -> (ExtractionEngine, Arc<Mutex<MockDb>>, Arc<RecordingHost>) {
    let (connector, db) = MockConnector::new(db);
    let host = Arc::new(RecordingHost::default());
    let engine = ExtractionEngine::new(options, connector, Arc::clone(&host) as Arc<dyn ExtractionHost>)
        .with_retry(fast_retry(), Duration::ZERO);
    (engine, db, host)
}

pub fn index_col(name: &str, index_id: u32, count: i32, unique: bool, primary: bool, ordinal: i32) -> IndexColumn {
    IndexColumn {
        name: name.to_string(),
        is_unique: unique,
        is_primary: primary,
        index_id,
        column_count: count,
        ordinal,
    }
}

pub fn text_row(values: &[&str]) -> Vec<SqlValue> {
    values.iter().map(|v| SqlValue::from(*v)).collect()
}
