//! Records and row-schema introspection.
//!
//! A row flowing through the graph can be one of three shapes behind the
//! same access interface:
//!
//! - a statically-typed struct implementing [`SchemaRow`], whose accessor
//!   table is compiled once per type;
//! - an [`ArrayRow`] of positional values;
//! - a [`DynamicRow`] key/value map.
//!
//! Rows are exclusively owned by whichever buffer currently holds them and
//! move downstream by value; no two stages touch the same row instance
//! concurrently.

mod array;
mod dynamic;
mod schema;
mod value;

pub use array::ArrayRow;
pub use dynamic::DynamicRow;
pub use schema::{Field, FieldRoles, RowAccess, Schema, SchemaBuilder, SchemaRow};
pub use value::RowValue;

use serde::Serialize;
use std::fmt::Debug;

/// The bound every buffer payload satisfies.
///
/// `Clone` supports broadcast links, `Serialize` supports error-record
/// snapshots, and the rest makes rows movable across worker tasks.
pub trait FlowRow: Clone + Debug + Send + Sync + Serialize + 'static {}

impl<T> FlowRow for T where T: Clone + Debug + Send + Sync + Serialize + 'static {}

/// Separator between column values inside a composite identity key.
///
/// The ASCII unit separator never occurs in normal column data, so
/// composite keys cannot collide with each other by concatenation.
pub const IDENTITY_SEPARATOR: char = '\u{1f}';

/// Builds the identity key of a row from its designated identity columns.
///
/// Missing columns contribute an empty segment. Identity keys must be
/// unique within a merge snapshot or matching is ambiguous.
pub fn identity_key<T: RowAccess + ?Sized>(row: &T, columns: &[String]) -> String {
    let mut key = String::new();
    for (i, column) in columns.iter().enumerate() {
        if i > 0 {
            key.push(IDENTITY_SEPARATOR);
        }
        if let Some(value) = row.get(column) {
            key.push_str(&value.to_string());
        }
    }
    key
}
