//! Test doubles for the database contracts.
//!
//! Public so downstream crates can exercise their own pipelines against
//! scripted databases without standing up a real one.

mod mocks;

pub use mocks::{MockSqlExecutor, RecordingBulkLoader, StaticSchemaProvider};
