//! Resume key selection.
//!
//! The resume key orders a table's rows deterministically and expresses
//! "rows not yet delivered" as a predicate. It is chosen once per table from
//! the table's index metadata, trying [`KEY_STRATEGY_ORDER`] in sequence.

use serde::{Deserialize, Serialize};

/// One row of index metadata: a column's membership in one index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexColumn {
    pub name: String,
    pub is_unique: bool,
    pub is_primary: bool,
    /// Identifies the index the column belongs to.
    pub index_id: u32,
    /// Number of columns in the index.
    pub column_count: i32,
    /// 1-based position of the column within the index.
    pub ordinal: i32,
}

/// Ordered column names used for `ORDER BY` and resume predicates.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResumeKey(Vec<String>);

impl ResumeKey {
    pub fn new<S: Into<String>>(columns: impl IntoIterator<Item = S>) -> Self {
        Self(columns.into_iter().map(Into::into).collect())
    }

    pub fn single(column: impl Into<String>) -> Self {
        Self(vec![column.into()])
    }

    pub fn columns(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A way of picking key columns from index metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyStrategy {
    /// Every primary key column.
    Primary,
    /// The first unique index, all of its columns.
    Unique,
    /// The first non-unique index, all of its columns.
    NonUnique,
}

/// Strategies tried in this order; the first non-empty result wins.
pub const KEY_STRATEGY_ORDER: [KeyStrategy; 3] = [
    KeyStrategy::Primary,
    KeyStrategy::Unique,
    KeyStrategy::NonUnique,
];

impl KeyStrategy {
    /// Columns this strategy picks, in metadata order. Empty if none apply.
    pub fn apply<'a>(&self, columns: &'a [IndexColumn]) -> Vec<&'a IndexColumn> {
        match self {
            KeyStrategy::Primary => columns.iter().filter(|c| c.is_primary).collect(),
            KeyStrategy::Unique => first_index(columns, true),
            KeyStrategy::NonUnique => first_index(columns, false),
        }
    }
}

fn first_index(columns: &[IndexColumn], unique: bool) -> Vec<&IndexColumn> {
    let mut candidates = columns.iter().filter(|c| c.is_unique == unique);
    let Some(first) = candidates.next() else {
        return Vec::new();
    };

    if first.column_count > 1 {
        std::iter::once(first)
            .chain(candidates.filter(|c| c.index_id == first.index_id))
            .collect()
    } else {
        vec![first]
    }
}

/// Pick the resume key from index metadata.
///
/// Returns `None` when no strategy yields columns; the caller then falls
/// back to the table's first column.
pub fn select(columns: &[IndexColumn]) -> Option<ResumeKey> {
    KEY_STRATEGY_ORDER.iter().find_map(|strategy| {
        let mut picked = strategy.apply(columns);
        if picked.is_empty() {
            return None;
        }
        picked.sort_by_key(|c| c.ordinal);
        Some(ResumeKey::new(picked.into_iter().map(|c| c.name.clone())))
    })
}
