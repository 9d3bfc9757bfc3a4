//! Core types shared by the engine and the database drivers.
//!
//! - [`identifier`]: quoting of identifiers and literals
//! - [`table`]: table references and configured table descriptors
//! - [`value`]: owned SQL values and annotated output rows

pub mod identifier;
pub mod table;
pub mod value;

pub use table::{TableDescriptor, TableRef};
pub use value::{Row, SqlValue};
