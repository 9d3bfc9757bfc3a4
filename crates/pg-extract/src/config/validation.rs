//! Configuration validation.

use super::Config;
use crate::core::identifier::validate_identifier;
use crate::error::{ExtractError, Result};

const SSL_MODES: [&str; 4] = ["disable", "require", "verify-ca", "verify-full"];

const MAX_HOSTNAME_LENGTH: usize = 255;
const MAX_LABEL_LENGTH: usize = 63;

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    let source = &config.source;

    if source.host.is_empty() {
        return Err(ExtractError::Config("source.host is required".into()));
    }
    validate_hostname(&source.host)?;
    if source.port == 0 {
        return Err(ExtractError::Config(
            "source.port must be between 1 and 65535".into(),
        ));
    }
    if source.database.is_empty() {
        return Err(ExtractError::Config("source.database is required".into()));
    }
    if source.user.is_empty() {
        return Err(ExtractError::Config("source.user is required".into()));
    }
    if !SSL_MODES.contains(&source.ssl_mode.as_str()) {
        return Err(ExtractError::Config(format!(
            "source.ssl_mode must be one of {}, got '{}'",
            SSL_MODES.join(", "),
            source.ssl_mode
        )));
    }

    let extraction = &config.extraction;
    if extraction.tables.is_empty() {
        return Err(ExtractError::Config(
            "extraction.tables must list at least one table".into(),
        ));
    }
    for table in &extraction.tables {
        let table = table.to_table_ref()?;
        validate_identifier(&table.schema)?;
        validate_identifier(&table.name)?;
    }
    if extraction.batch_size == 0 {
        return Err(ExtractError::Config(
            "extraction.batch_size must be at least 1".into(),
        ));
    }
    if let Some(inc) = &extraction.incremental {
        validate_identifier(&inc.column).map_err(|e| {
            ExtractError::Config(format!("extraction.incremental.column: {}", e))
        })?;
    }

    let retry = &config.retry;
    if retry.max_tries == 0 {
        return Err(ExtractError::Config("retry.max_tries must be at least 1".into()));
    }
    if retry.factor.is_nan() || retry.factor < 1.0 {
        return Err(ExtractError::Config("retry.factor must be at least 1.0".into()));
    }
    if retry.max_delay_ms < retry.base_delay_ms {
        return Err(ExtractError::Config(
            "retry.max_delay_ms must not be less than retry.base_delay_ms".into(),
        ));
    }

    Ok(())
}

/// Check a DNS name or IPv4 address: dot-separated labels of letters,
/// digits and hyphens, no label starting or ending with a hyphen.
pub fn validate_hostname(host: &str) -> Result<()> {
    let invalid = || ExtractError::Config(format!("source.host is not a valid hostname: {:?}", host));

    if host.len() > MAX_HOSTNAME_LENGTH {
        return Err(invalid());
    }
    let host = host.strip_suffix('.').unwrap_or(host);
    if host.is_empty() {
        return Err(invalid());
    }

    for label in host.split('.') {
        let valid = !label.is_empty()
            && label.len() <= MAX_LABEL_LENGTH
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
            && !label.starts_with('-')
            && !label.ends_with('-');
        if !valid {
            return Err(invalid());
        }
    }
    Ok(())
}

/// Components of a `host[:port][/database]` address.
#[derive(Debug, PartialEq, Eq)]
pub struct ParsedAddr {
    pub host: String,
    pub port: Option<u16>,
    pub database: Option<String>,
}

pub fn parse_addr(addr: &str) -> Result<ParsedAddr> {
    let (host_port, database) = match addr.split_once('/') {
        Some((hp, db)) => (hp, Some(db.to_string()).filter(|d| !d.is_empty())),
        None => (addr, None),
    };

    let (host, port) = match host_port.split_once(':') {
        Some((host, port)) => (host, Some(parse_port(port)?)),
        None => (host_port, None),
    };

    Ok(ParsedAddr {
        host: host.to_string(),
        port,
        database,
    })
}

fn parse_port(port: &str) -> Result<u16> {
    let invalid = || ExtractError::Config(format!("source port must be between 1 and 65535, got {:?}", port));

    if port.is_empty() || !port.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }
    match port.parse::<u16>() {
        Ok(0) | Err(_) => Err(invalid()),
        Ok(p) => Ok(p),
    }
}
