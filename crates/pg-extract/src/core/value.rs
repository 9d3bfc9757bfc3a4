//! Owned SQL values and the annotated rows the engine emits.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value as JsonValue};
use uuid::Uuid;

use crate::checkpoint::BatchId;
use crate::core::identifier::quote_literal;

/// A single column value read from the source.
///
/// Values are owned so that the last row of a batch can be stored in the
/// checkpoint and serialized between runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SqlValue {
    Null,
    Bool(bool),
    I16(i16),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Decimal(Decimal),
    Text(String),
    Bytes(Vec<u8>),
    Uuid(Uuid),
    Date(NaiveDate),
    Time(NaiveTime),
    DateTime(NaiveDateTime),
    DateTimeOffset(DateTime<FixedOffset>),
    Json(JsonValue),
}

impl SqlValue {
    /// Check if this value is NULL.
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// Render as a single-quoted SQL literal. NULL renders as the bare keyword.
    pub fn to_literal(&self) -> String {
        match self {
            SqlValue::Null => "NULL".to_string(),
            SqlValue::Bool(v) => quote_literal(&v.to_string()),
            SqlValue::I16(v) => quote_literal(&v.to_string()),
            SqlValue::I32(v) => quote_literal(&v.to_string()),
            SqlValue::I64(v) => quote_literal(&v.to_string()),
            SqlValue::F32(v) => quote_literal(&v.to_string()),
            SqlValue::F64(v) => quote_literal(&v.to_string()),
            SqlValue::Decimal(v) => quote_literal(&v.to_string()),
            SqlValue::Text(s) => quote_literal(s),
            SqlValue::Bytes(b) => format!("'\\x{}'", hex::encode(b)),
            SqlValue::Uuid(u) => quote_literal(&u.to_string()),
            SqlValue::Date(d) => quote_literal(&d.format("%Y-%m-%d").to_string()),
            SqlValue::Time(t) => quote_literal(&t.format("%H:%M:%S%.f").to_string()),
            SqlValue::DateTime(dt) => {
                quote_literal(&dt.format("%Y-%m-%d %H:%M:%S%.f").to_string())
            }
            SqlValue::DateTimeOffset(dt) => quote_literal(&dt.to_rfc3339()),
            SqlValue::Json(v) => quote_literal(&v.to_string()),
        }
    }

    /// Convert to a JSON value for row output.
    pub fn to_json(&self) -> JsonValue {
        match self {
            SqlValue::Null => JsonValue::Null,
            SqlValue::Bool(v) => json!(v),
            SqlValue::I16(v) => json!(v),
            SqlValue::I32(v) => json!(v),
            SqlValue::I64(v) => json!(v),
            SqlValue::F32(v) => json!(v),
            SqlValue::F64(v) => json!(v),
            SqlValue::Decimal(v) => json!(v.to_string()),
            SqlValue::Text(s) => json!(s),
            SqlValue::Bytes(b) => json!(format!("\\x{}", hex::encode(b))),
            SqlValue::Uuid(u) => json!(u.to_string()),
            SqlValue::Date(d) => json!(d.format("%Y-%m-%d").to_string()),
            SqlValue::Time(t) => json!(t.format("%H:%M:%S%.f").to_string()),
            SqlValue::DateTime(dt) => json!(dt.format("%Y-%m-%dT%H:%M:%S%.f").to_string()),
            SqlValue::DateTimeOffset(dt) => json!(dt.to_rfc3339()),
            SqlValue::Json(v) => v.clone(),
        }
    }
}

impl From<&str> for SqlValue {
    fn from(s: &str) -> Self {
        SqlValue::Text(s.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(s: String) -> Self {
        SqlValue::Text(s)
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> Self {
        SqlValue::I32(v)
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> Self {
        SqlValue::I64(v)
    }
}

/// One extracted row, annotated with where it came from and which batch
/// delivered it.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    /// Column values in select-list order.
    pub fields: Vec<(String, SqlValue)>,
    pub schema_name: String,
    pub table_name: String,
    pub database_name: String,
    pub batch_id: BatchId,
}

impl Row {
    /// Look up a column value by name.
    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.fields
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, v)| v)
    }

    /// Column map plus the injected `__schemaname`, `__tablename`,
    /// `__databasename` and `__batchid` fields.
    pub fn to_json(&self) -> JsonValue {
        let mut map = Map::with_capacity(self.fields.len() + 4);
        for (name, value) in &self.fields {
            map.insert(name.clone(), value.to_json());
        }
        map.insert("__schemaname".into(), json!(self.schema_name));
        map.insert("__tablename".into(), json!(self.table_name));
        map.insert("__databasename".into(), json!(self.database_name));
        map.insert("__batchid".into(), json!(self.batch_id.to_string()));
        JsonValue::Object(map)
    }
}
