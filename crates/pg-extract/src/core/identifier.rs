//! Identifier and literal quoting for generated PostgreSQL statements.
//!
//! Table and column names cannot be bound as statement parameters, and the
//! resume predicate embeds checkpoint values directly in the query text. Every
//! name and value that ends up in SQL goes through this module.

use crate::error::{ExtractError, Result};

/// Maximum identifier length accepted before quoting.
const MAX_IDENTIFIER_LENGTH: usize = 128;

/// Reject identifiers that cannot be quoted safely.
pub fn validate_identifier(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(ExtractError::Config(
            "Identifier cannot be empty".to_string(),
        ));
    }

    if name.contains('\0') {
        return Err(ExtractError::Config(format!(
            "Identifier contains null byte: {:?}",
            name
        )));
    }

    if name.len() > MAX_IDENTIFIER_LENGTH {
        return Err(ExtractError::Config(format!(
            "Identifier exceeds maximum length of {} bytes (got {} bytes): {:?}",
            MAX_IDENTIFIER_LENGTH,
            name.len(),
            name
        )));
    }

    Ok(())
}

/// Wrap an identifier in double quotes, doubling embedded quotes.
///
/// ```ignore
/// assert_eq!(quote_ident("users")?, "\"users\"");
/// assert_eq!(quote_ident("odd\"name")?, "\"odd\"\"name\"");
/// ```
pub fn quote_ident(name: &str) -> Result<String> {
    validate_identifier(name)?;
    Ok(format!("\"{}\"", name.replace('"', "\"\"")))
}

/// `"schema"."table"`
pub fn qualify(schema: &str, table: &str) -> Result<String> {
    Ok(format!("{}.{}", quote_ident(schema)?, quote_ident(table)?))
}

/// Quote a comma-separated column list: `"a", "b"`.
pub fn quote_list<S: AsRef<str>>(columns: &[S]) -> Result<String> {
    let quoted = columns
        .iter()
        .map(|c| quote_ident(c.as_ref()))
        .collect::<Result<Vec<_>>>()?;
    Ok(quoted.join(", "))
}

/// Wrap text in single quotes, doubling embedded single quotes.
pub fn quote_literal(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}
