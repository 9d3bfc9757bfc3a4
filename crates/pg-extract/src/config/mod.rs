//! Configuration loading and validation.

mod types;
mod validation;

pub use types::*;

use crate::core::{SqlValue, TableRef};
use crate::engine::{EngineOptions, IncrementalOptions};
use crate::error::Result;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::path::Path;

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let mut config: Config = serde_yaml::from_str(yaml)?;
        config.source.apply_addr()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        validation::validate(self)
    }

    /// SHA256 of what identifies an extraction: source, tables and
    /// incremental column. Stored in checkpoint files so a resume against
    /// a different extraction is refused.
    pub fn hash(&self) -> String {
        #[derive(Serialize)]
        struct Identity<'a> {
            host: &'a str,
            port: u16,
            database: &'a str,
            tables: Vec<&'a str>,
            incremental_column: Option<&'a str>,
        }

        let identity = Identity {
            host: &self.source.host,
            port: self.source.port,
            database: &self.source.database,
            tables: self.extraction.tables.iter().map(|t| t.as_str()).collect(),
            incremental_column: self
                .extraction
                .incremental
                .as_ref()
                .map(|inc| inc.column.as_str()),
        };

        let yaml = serde_yaml::to_string(&identity).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(yaml.as_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Configured tables, parsed.
    pub fn table_refs(&self) -> Result<Vec<TableRef>> {
        self.extraction
            .tables
            .iter()
            .map(|t| t.to_table_ref())
            .collect()
    }

    /// Engine settings for this configuration.
    pub fn engine_options(&self) -> Result<EngineOptions> {
        Ok(EngineOptions {
            tables: self.table_refs()?,
            batch_size: self.extraction.batch_size,
            incremental: self
                .extraction
                .incremental
                .as_ref()
                .map(|inc| IncrementalOptions {
                    column: inc.column.clone(),
                    lower: inc.value.clone().map(SqlValue::Text),
                }),
            resume_predicate: self.extraction.resume_predicate,
        })
    }
}

impl SourceConfig {
    /// Fill host, port and database from `addr` when it is set.
    pub fn apply_addr(&mut self) -> Result<()> {
        let Some(addr) = self.addr.clone() else {
            return Ok(());
        };
        let parsed = validation::parse_addr(&addr)?;
        self.host = parsed.host;
        if let Some(port) = parsed.port {
            self.port = port;
        }
        if let Some(database) = parsed.database {
            self.database = database;
        }
        Ok(())
    }

    /// Connection string for tokio-postgres. TLS is configured separately.
    pub fn connection_string(&self) -> String {
        format!(
            "host={} port={} dbname={} user={} password={} connect_timeout={}",
            quote_conn_value(&self.host),
            self.port,
            quote_conn_value(&self.database),
            quote_conn_value(&self.user),
            quote_conn_value(&self.password),
            self.connect_timeout_secs
        )
    }
}

fn quote_conn_value(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}
