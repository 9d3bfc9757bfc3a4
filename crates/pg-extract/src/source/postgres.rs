//! PostgreSQL implementation of the database collaborator.
//!
//! Every `connect()` opens a new `tokio_postgres` connection and begins a
//! transaction so that a server-side cursor can be declared on it. Sessions
//! are never pooled: a session that failed is rolled back and dropped.

use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use rustls::ClientConfig;
use tokio_postgres::types::{FromSql, Type};
use tokio_postgres::{Client, NoTls, Row as PgRow};
use tokio_postgres_rustls::MakeRustlsConnect;
use tracing::{debug, info, warn};

use crate::config::SourceConfig;
use crate::core::{SqlValue, TableRef};
use crate::error::{DbError, DbErrorKind, ExtractError, Result};
use crate::key_strategy::IndexColumn;
use crate::source::{FetchedBatch, SourceConnector, SourceSession};

const INDEX_COLUMNS_SQL: &str = r#"
    SELECT a.attname::text,
           i.indexrelid,
           i.indnatts::int4,
           i.indisunique,
           i.indisprimary,
           array_position(i.indkey::int2[], a.attnum)::int4
    FROM   pg_index i
           JOIN pg_attribute a ON a.attrelid = i.indrelid
           AND a.attnum = ANY(i.indkey)
    WHERE  i.indrelid = $1::text::regclass
    ORDER  BY i.indexrelid
"#;

const FIRST_COLUMN_SQL: &str = r#"
    SELECT a.attname::text
    FROM   pg_attribute a
    WHERE  a.attrelid = $1::text::regclass
           AND a.attnum > 0
           AND NOT a.attisdropped
    ORDER  BY a.attnum
    LIMIT  1
"#;

const LIST_TABLES_SQL: &str = r#"
    SELECT table_schema::text, table_name::text
    FROM   information_schema.tables
    WHERE  table_schema NOT IN ('information_schema', 'pg_catalog')
    ORDER  BY table_schema, table_name
"#;

/// SSL verification modes, named as in PostgreSQL's `sslmode`.
/// An unset mode is `Require`, the same as the config file default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SslMode {
    Disable,
    /// Encrypt without verifying the server certificate.
    #[default]
    Require,
    VerifyCa,
    VerifyFull,
}

impl SslMode {
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "disable" => Ok(SslMode::Disable),
            "require" | "" => Ok(SslMode::Require),
            "verify-ca" => Ok(SslMode::VerifyCa),
            "verify-full" => Ok(SslMode::VerifyFull),
            other => Err(ExtractError::Config(format!(
                "Invalid ssl_mode '{}'. Valid values: disable, require, verify-ca, verify-full",
                other
            ))),
        }
    }

    pub fn requires_tls(&self) -> bool {
        !matches!(self, SslMode::Disable)
    }
}

fn build_tls(ssl_mode: SslMode) -> Result<Option<MakeRustlsConnect>> {
    if !ssl_mode.requires_tls() {
        return Ok(None);
    }

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| ExtractError::Config(format!("Failed to build TLS config: {}", e)))?;

    let config = match ssl_mode {
        SslMode::Require => {
            warn!(
                "ssl_mode=require enables TLS but does NOT verify the server certificate. \
                 Use ssl_mode=verify-full to verify it."
            );
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerifier))
                .with_no_client_auth()
        }
        SslMode::VerifyCa | SslMode::VerifyFull => {
            let mut root_store = rustls::RootCertStore::empty();
            root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            builder
                .with_root_certificates(root_store)
                .with_no_client_auth()
        }
        SslMode::Disable => return Ok(None),
    };

    Ok(Some(MakeRustlsConnect::new(config)))
}

/// Accepts any server certificate. Used for `ssl_mode=require` only.
#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Map a SQLSTATE code to the kind the engine acts on.
pub fn classify_sqlstate(code: &str) -> DbErrorKind {
    match code {
        "42P01" | "3F000" => DbErrorKind::UndefinedTable,
        "42703" => DbErrorKind::UndefinedColumn,
        "28000" | "28P01" => DbErrorKind::Authentication,
        "42501" => DbErrorKind::Authorization,
        c if c.starts_with("42") => DbErrorKind::InvalidStatement,
        "57014" => DbErrorKind::Timeout,
        "57P01" | "57P02" | "57P03" => DbErrorKind::Connection,
        c if c.starts_with("08") => DbErrorKind::Connection,
        _ => DbErrorKind::Other,
    }
}

/// Classify errors that carry no SQLSTATE from their message.
fn classify_message(message: &str) -> DbErrorKind {
    let lower = message.to_lowercase();
    if lower.contains("authentication failed") {
        DbErrorKind::Authentication
    } else if lower.contains("timeout") || lower.contains("timed out") {
        DbErrorKind::Timeout
    } else {
        DbErrorKind::Connection
    }
}

fn map_pg_error(err: tokio_postgres::Error) -> ExtractError {
    if let Some(db) = err.as_db_error() {
        let code = db.code().code();
        return DbError::new(classify_sqlstate(code), db.message())
            .with_code(code)
            .into();
    }

    let message = err.to_string();
    let kind = if err.is_closed() {
        DbErrorKind::Connection
    } else {
        classify_message(&message)
    };
    DbError::new(kind, message).into()
}

/// Outcome of a connectivity check.
#[derive(Debug, Clone)]
pub struct HealthCheck {
    pub latency_ms: u64,
    pub server_version: String,
}

/// Opens PostgreSQL sessions for the engine.
pub struct PgConnector {
    pg_config: tokio_postgres::Config,
    tls: Option<MakeRustlsConnect>,
    database: String,
    user: String,
}

impl PgConnector {
    pub fn new(source: &SourceConfig) -> Result<Self> {
        let pg_config: tokio_postgres::Config = source
            .connection_string()
            .parse()
            .map_err(|e| ExtractError::Config(format!("Invalid connection settings: {}", e)))?;
        let ssl_mode = SslMode::parse(&source.ssl_mode)?;

        Ok(Self {
            pg_config,
            tls: build_tls(ssl_mode)?,
            database: source.database.clone(),
            user: source.user.clone(),
        })
    }

    async fn open_client(&self) -> Result<Client> {
        let client = match &self.tls {
            Some(tls) => {
                let (client, connection) = self
                    .pg_config
                    .connect(tls.clone())
                    .await
                    .map_err(map_pg_error)?;
                tokio::spawn(async move {
                    if let Err(e) = connection.await {
                        debug!("PostgreSQL connection closed: {}", e);
                    }
                });
                client
            }
            None => {
                let (client, connection) = self
                    .pg_config
                    .connect(NoTls)
                    .await
                    .map_err(map_pg_error)?;
                tokio::spawn(async move {
                    if let Err(e) = connection.await {
                        debug!("PostgreSQL connection closed: {}", e);
                    }
                });
                client
            }
        };
        Ok(client)
    }

    /// Every table and view outside the system schemas.
    pub async fn list_tables(&self) -> Result<Vec<TableRef>> {
        let client = self.open_client().await?;
        let rows = client
            .query(LIST_TABLES_SQL, &[])
            .await
            .map_err(map_pg_error)?;

        rows.iter()
            .map(|row| -> Result<TableRef> {
                let schema: String = row.try_get(0).map_err(map_pg_error)?;
                let name: String = row.try_get(1).map_err(map_pg_error)?;
                Ok(TableRef::new(schema, name))
            })
            .collect()
    }

    /// Open a connection and run `SELECT version()`.
    pub async fn health_check(&self) -> Result<HealthCheck> {
        let start = Instant::now();
        let client = self.open_client().await?;
        let row = client
            .query_one("SELECT version()", &[])
            .await
            .map_err(map_pg_error)?;
        let server_version: String = row.try_get(0).map_err(map_pg_error)?;

        Ok(HealthCheck {
            latency_ms: start.elapsed().as_millis() as u64,
            server_version,
        })
    }
}

#[async_trait]
impl SourceConnector for PgConnector {
    async fn connect(&self) -> Result<Box<dyn SourceSession>> {
        let client = self.open_client().await?;
        client.batch_execute("BEGIN").await.map_err(map_pg_error)?;
        info!("Connected to PostgreSQL database {}", self.database);
        Ok(Box::new(PgSession {
            client,
            closed: false,
        }))
    }

    fn database_name(&self) -> &str {
        &self.database
    }

    fn user(&self) -> &str {
        &self.user
    }
}

/// One connection with an open transaction.
pub struct PgSession {
    client: Client,
    closed: bool,
}

#[async_trait]
impl SourceSession for PgSession {
    async fn index_columns(&mut self, table: &TableRef) -> Result<Vec<IndexColumn>> {
        let qualified = table.qualified()?;
        let rows = self
            .client
            .query(INDEX_COLUMNS_SQL, &[&qualified])
            .await
            .map_err(map_pg_error)?;

        rows.iter()
            .map(|row| -> Result<IndexColumn> {
                Ok(IndexColumn {
                    name: row.try_get(0).map_err(map_pg_error)?,
                    index_id: row.try_get(1).map_err(map_pg_error)?,
                    column_count: row.try_get(2).map_err(map_pg_error)?,
                    is_unique: row.try_get(3).map_err(map_pg_error)?,
                    is_primary: row.try_get(4).map_err(map_pg_error)?,
                    ordinal: row
                        .try_get::<_, Option<i32>>(5)
                        .map_err(map_pg_error)?
                        .unwrap_or(i32::MAX),
                })
            })
            .collect()
    }

    async fn first_column(&mut self, table: &TableRef) -> Result<Option<String>> {
        let qualified = table.qualified()?;
        let row = self
            .client
            .query_opt(FIRST_COLUMN_SQL, &[&qualified])
            .await
            .map_err(map_pg_error)?;
        match row {
            Some(row) => Ok(Some(row.try_get(0).map_err(map_pg_error)?)),
            None => Ok(None),
        }
    }

    async fn query_scalar(&mut self, sql: &str) -> Result<Option<SqlValue>> {
        let rows = self.client.query(sql, &[]).await.map_err(map_pg_error)?;
        Ok(rows
            .first()
            .filter(|row| !row.is_empty())
            .map(|row| convert_row_value(row, 0))
            .filter(|v| !v.is_null()))
    }

    async fn execute(&mut self, sql: &str) -> Result<()> {
        self.client.execute(sql, &[]).await.map_err(map_pg_error)?;
        Ok(())
    }

    async fn fetch(&mut self, sql: &str) -> Result<FetchedBatch> {
        let rows = self.client.query(sql, &[]).await.map_err(map_pg_error)?;

        let columns = rows
            .first()
            .map(|row| row.columns().iter().map(|c| c.name().to_string()).collect())
            .unwrap_or_default();
        let rows = rows
            .iter()
            .map(|row| (0..row.len()).map(|idx| convert_row_value(row, idx)).collect())
            .collect();

        Ok(FetchedBatch { columns, rows })
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.client.batch_execute("ROLLBACK").await {
            debug!("rollback on close failed: {}", e);
        }
    }
}

/// Raw wire bytes of any column type.
struct RawValue(Vec<u8>);

impl<'a> FromSql<'a> for RawValue {
    fn from_sql(_ty: &Type, raw: &'a [u8]) -> std::result::Result<Self, Box<dyn StdError + Sync + Send>> {
        Ok(RawValue(raw.to_vec()))
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }
}

fn decode<'a, T, F>(row: &'a PgRow, idx: usize, wrap: F) -> SqlValue
where
    T: FromSql<'a>,
    F: FnOnce(T) -> SqlValue,
{
    match row.try_get::<_, Option<T>>(idx) {
        Ok(Some(v)) => wrap(v),
        Ok(None) => SqlValue::Null,
        Err(_) => raw_value(row, idx),
    }
}

/// Values the typed decoders reject (BC dates, infinity timestamps, types
/// without a mapping) keep their payload: text when it is UTF-8.
fn raw_value(row: &PgRow, idx: usize) -> SqlValue {
    match row.try_get::<_, Option<RawValue>>(idx) {
        Ok(Some(RawValue(bytes))) => match String::from_utf8(bytes) {
            Ok(text) => SqlValue::Text(text),
            Err(e) => SqlValue::Bytes(e.into_bytes()),
        },
        _ => SqlValue::Null,
    }
}

fn convert_row_value(row: &PgRow, idx: usize) -> SqlValue {
    let type_name = row.columns()[idx].type_().name().to_string();

    match type_name.as_str() {
        "bool" => decode(row, idx, SqlValue::Bool),
        "int2" => decode(row, idx, SqlValue::I16),
        "int4" => decode(row, idx, SqlValue::I32),
        "int8" => decode(row, idx, SqlValue::I64),
        "float4" => decode(row, idx, SqlValue::F32),
        "float8" => decode(row, idx, SqlValue::F64),
        "numeric" => decode(row, idx, SqlValue::Decimal),
        "uuid" => decode(row, idx, SqlValue::Uuid),
        "date" => decode(row, idx, SqlValue::Date),
        "time" => decode(row, idx, SqlValue::Time),
        "timestamp" => decode(row, idx, SqlValue::DateTime),
        "timestamptz" => decode(row, idx, SqlValue::DateTimeOffset),
        "bytea" => decode(row, idx, SqlValue::Bytes),
        "json" | "jsonb" => decode(row, idx, SqlValue::Json),
        "text" | "varchar" | "bpchar" | "name" | "unknown" => {
            decode(row, idx, SqlValue::Text)
        }
        _ => raw_value(row, idx),
    }
}
