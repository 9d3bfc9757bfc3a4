//! Table references and the descriptor forms accepted in configuration.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::core::identifier::qualify;
use crate::error::{ExtractError, Result};

/// A table in the source database, addressed by schema and name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TableRef {
    pub schema: String,
    pub name: String,
}

impl TableRef {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }

    /// Parse `"schema.table"`, splitting at the first dot.
    pub fn parse(reference: &str) -> Result<Self> {
        match reference.split_once('.') {
            Some((schema, name)) if !schema.is_empty() && !name.is_empty() => {
                Ok(Self::new(schema, name))
            }
            _ => Err(ExtractError::Config(format!(
                "Table reference must have the form schema.table, got {:?}",
                reference
            ))),
        }
    }

    /// Quoted `"schema"."table"` for use in SQL.
    pub fn qualified(&self) -> Result<String> {
        qualify(&self.schema, &self.name)
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

impl FromStr for TableRef {
    type Err = ExtractError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Table entry as written in configuration: a bare string or `{value: ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TableDescriptor {
    Name(String),
    Object { value: String },
}

impl TableDescriptor {
    pub fn as_str(&self) -> &str {
        match self {
            TableDescriptor::Name(s) => s,
            TableDescriptor::Object { value } => value,
        }
    }

    pub fn to_table_ref(&self) -> Result<TableRef> {
        TableRef::parse(self.as_str())
    }
}

impl From<&str> for TableDescriptor {
    fn from(s: &str) -> Self {
        TableDescriptor::Name(s.to_string())
    }
}
