//! Resumable extraction position.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::SqlValue;

/// Which table is being read and the key values of the last delivered row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub table_index: usize,
    #[serde(default)]
    pub last_key_values: Option<Vec<SqlValue>>,
}

impl Checkpoint {
    /// Start of the first table.
    pub fn start() -> Self {
        Self::default()
    }

    /// Position at the start of `table_index`.
    pub fn at_table(table_index: usize) -> Self {
        Self {
            table_index,
            last_key_values: None,
        }
    }

    /// Whether at least one batch of the current table was delivered.
    pub fn is_mid_table(&self) -> bool {
        self.last_key_values.is_some()
    }

    /// Move to the start of the next table.
    pub(crate) fn advance(&mut self) {
        self.table_index += 1;
        self.last_key_values = None;
    }
}

/// Token minted once per delivered batch, attached to every row in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(Uuid);

impl BatchId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_clears_last_values() {
        let mut cp = Checkpoint {
            table_index: 2,
            last_key_values: Some(vec![SqlValue::I32(9)]),
        };
        assert!(cp.is_mid_table());
        cp.advance();
        assert_eq!(cp, Checkpoint::at_table(3));
    }

    #[test]
    fn test_missing_last_values_deserializes_as_none() {
        let cp: Checkpoint = serde_json::from_str(r#"{"table_index": 1}"#).unwrap();
        assert_eq!(cp, Checkpoint::at_table(1));
    }

    #[test]
    fn test_batch_ids_are_unique() {
        assert_ne!(BatchId::new(), BatchId::new());
    }
}
