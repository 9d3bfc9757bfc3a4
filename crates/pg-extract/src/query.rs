//! SQL text generation for paginated, resumable table reads.
//!
//! Everything here is a pure function of its inputs: the same table, key,
//! checkpoint values and bound always produce the same statement.

use serde::{Deserialize, Serialize};

use crate::core::identifier::{quote_ident, quote_list};
use crate::core::{SqlValue, TableRef};
use crate::error::{ExtractError, Result};
use crate::key_strategy::ResumeKey;

/// Name of the server-side cursor declared for each table.
pub const CURSOR_NAME: &str = "cur";

/// How the "not yet delivered" predicate compares composite keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumePredicate {
    /// `("c1", "c2") >= ('v1', 'v2')`
    #[default]
    RowWise,
    /// `"c1" >= 'v1' AND "c2" >= 'v2'`
    PerColumn,
}

/// Value range of the incremental column for one table.
#[derive(Debug, Clone, PartialEq)]
pub struct IncrementalBound {
    pub column: String,
    /// From configuration.
    pub lower: Option<SqlValue>,
    /// `MAX(column)` snapshot taken before the table's first query.
    pub upper: Option<SqlValue>,
}

impl IncrementalBound {
    fn predicate(&self) -> Result<Option<String>> {
        let column = quote_ident(&self.column)?;
        let lower = self.lower.as_ref().filter(|v| !v.is_null());
        let upper = self.upper.as_ref().filter(|v| !v.is_null());

        Ok(match (lower, upper) {
            (Some(lo), Some(hi)) => Some(format!(
                "({col} >= {lo} AND {col} <= {hi})",
                col = column,
                lo = lo.to_literal(),
                hi = hi.to_literal()
            )),
            (Some(lo), None) => Some(format!("{} >= {}", column, lo.to_literal())),
            (None, Some(hi)) => Some(format!("{} <= {}", column, hi.to_literal())),
            (None, None) => None,
        })
    }
}

fn resume_predicate(
    key: &ResumeKey,
    last_values: &[SqlValue],
    mode: ResumePredicate,
) -> Result<String> {
    if key.len() != last_values.len() {
        return Err(ExtractError::State(format!(
            "Checkpoint has {} key values but the resume key has {} columns",
            last_values.len(),
            key.len()
        )));
    }

    if last_values.iter().any(SqlValue::is_null) {
        return null_aware_predicate(key.columns(), last_values);
    }

    if key.len() == 1 {
        return Ok(format!(
            "{} >= {}",
            quote_ident(&key.columns()[0])?,
            last_values[0].to_literal()
        ));
    }

    match mode {
        ResumePredicate::RowWise => {
            let values: Vec<String> = last_values.iter().map(SqlValue::to_literal).collect();
            Ok(format!(
                "({}) >= ({})",
                quote_list(key.columns())?,
                values.join(", ")
            ))
        }
        ResumePredicate::PerColumn => {
            let conditions = key
                .columns()
                .iter()
                .zip(last_values)
                .map(|(column, value)| -> Result<String> {
                    Ok(format!("{} >= {}", quote_ident(column)?, value.to_literal()))
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(conditions.join(" AND "))
        }
    }
}

/// Row-wise `>=` spelled out column by column, for checkpoints that hold a
/// NULL. Rows are ordered ascending with NULLs last, so nothing sorts after
/// NULL except NULL and every non-NULL value sorts before it.
///
/// `("a", "b") >= ('x', NULL)` becomes
/// `(("a" > 'x' OR "a" IS NULL) OR ("a" = 'x' AND "b" IS NULL))`.
fn null_aware_predicate(columns: &[String], last_values: &[SqlValue]) -> Result<String> {
    let quoted = columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Result<Vec<_>>>()?;

    let equal = |column: &str, value: &SqlValue| match value {
        SqlValue::Null => format!("{} IS NULL", column),
        v => format!("{} = {}", column, v.to_literal()),
    };

    let last = quoted.len() - 1;
    let mut terms = Vec::with_capacity(quoted.len());
    for (i, (column, value)) in quoted.iter().zip(last_values).enumerate() {
        let tail = match value {
            SqlValue::Null if i == last => format!("{} IS NULL", column),
            SqlValue::Null => continue,
            v if i == last => format!("({c} >= {v} OR {c} IS NULL)", c = column, v = v.to_literal()),
            v => format!("({c} > {v} OR {c} IS NULL)", c = column, v = v.to_literal()),
        };

        let mut conjuncts: Vec<String> = quoted[..i]
            .iter()
            .zip(last_values)
            .map(|(c, v)| equal(c.as_str(), v))
            .collect();
        conjuncts.push(tail);

        if conjuncts.len() == 1 {
            terms.extend(conjuncts);
        } else {
            terms.push(format!("({})", conjuncts.join(" AND ")));
        }
    }

    Ok(format!("({})", terms.join(" OR ")))
}

/// Build the `SELECT` that reads `table` from the given position.
///
/// With no checkpoint values and no bound the statement has no `WHERE`
/// clause; with an empty key it has no `ORDER BY`.
pub fn build_select(
    table: &TableRef,
    key: &ResumeKey,
    last_values: Option<&[SqlValue]>,
    bound: Option<&IncrementalBound>,
    mode: ResumePredicate,
) -> Result<String> {
    let mut sql = format!("SELECT * FROM {}", table.qualified()?);

    let mut conditions = Vec::with_capacity(2);
    if let Some(values) = last_values {
        if !key.is_empty() {
            conditions.push(resume_predicate(key, values, mode)?);
        }
    }
    if let Some(bound) = bound {
        if let Some(predicate) = bound.predicate()? {
            conditions.push(predicate);
        }
    }

    if !conditions.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&conditions.join(" AND "));
    }

    if !key.is_empty() {
        sql.push_str(" ORDER BY ");
        sql.push_str(&quote_list(key.columns())?);
    }

    Ok(sql)
}

/// `SELECT MAX("column")::text FROM "schema"."table"`
pub fn max_value_query(table: &TableRef, column: &str) -> Result<String> {
    Ok(format!(
        "SELECT MAX({})::text FROM {}",
        quote_ident(column)?,
        table.qualified()?
    ))
}

pub fn declare_cursor(select: &str) -> String {
    format!("DECLARE {} CURSOR FOR {}", CURSOR_NAME, select)
}

pub fn fetch_forward(batch_size: usize) -> String {
    format!("FETCH FORWARD {} FROM {}", batch_size, CURSOR_NAME)
}
