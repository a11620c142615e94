//! Error types for the rowflow engine.
//!
//! The taxonomy separates configuration errors (raised synchronously at
//! setup), per-row processing errors (redirectable to an error sink),
//! database collaborator errors (batch granularity), and stage faults
//! (the cloneable error carried by completion handles).

use thiserror::Error;

/// The main error type for rowflow operations.
#[derive(Debug, Error)]
pub enum FlowError {
    /// Missing or contradictory wiring, reported at setup or first use.
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// A row-level processing error inside a transformation function.
    #[error("processing error: {0}")]
    Processing(String),

    /// An error from a database collaborator.
    #[error("{0}")]
    Db(#[from] DbError),

    /// A buffer or stage reached the Faulted state.
    #[error("{0}")]
    Faulted(#[from] StageError),

    /// The pipeline was cancelled.
    #[error("pipeline cancelled: {0}")]
    Cancelled(String),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl FlowError {
    /// Creates a row-level processing error.
    #[must_use]
    pub fn processing(message: impl Into<String>) -> Self {
        Self::Processing(message.into())
    }
}

impl From<serde_json::Error> for FlowError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Error raised when a stage is wired incorrectly.
///
/// Configuration errors are never redirected to an error sink; they are
/// returned synchronously from [`Stage::start`](crate::stages::Stage::start).
#[derive(Debug, Clone, Error)]
#[error("configuration error in stage '{stage}': {message}")]
pub struct ConfigError {
    /// The stage that was misconfigured.
    pub stage: String,
    /// The error message.
    pub message: String,
}

impl ConfigError {
    /// Creates a new configuration error.
    #[must_use]
    pub fn new(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            message: message.into(),
        }
    }
}

/// Errors from database collaborators (SQL execution, bulk load, schema).
#[derive(Debug, Clone, Error)]
pub enum DbError {
    /// A SQL statement failed.
    #[error("sql error: {message}")]
    Sql {
        /// The failing statement, if available.
        sql: Option<String>,
        /// The error message.
        message: String,
    },

    /// A bulk load into a table failed.
    #[error("bulk load into '{table}' failed: {message}")]
    BulkLoad {
        /// The destination table.
        table: String,
        /// The error message.
        message: String,
    },

    /// A table schema could not be resolved.
    #[error("schema for table '{table}' could not be resolved: {message}")]
    Schema {
        /// The table name.
        table: String,
        /// The error message.
        message: String,
    },
}

impl DbError {
    /// Creates a SQL error without a statement.
    #[must_use]
    pub fn sql(message: impl Into<String>) -> Self {
        Self::Sql {
            sql: None,
            message: message.into(),
        }
    }

    /// Creates a SQL error carrying the failing statement.
    #[must_use]
    pub fn sql_with_statement(sql: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Sql {
            sql: Some(sql.into()),
            message: message.into(),
        }
    }

    /// Creates a bulk load error.
    #[must_use]
    pub fn bulk_load(table: impl Into<String>, message: impl Into<String>) -> Self {
        Self::BulkLoad {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Creates a schema resolution error.
    #[must_use]
    pub fn schema(table: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Schema {
            table: table.into(),
            message: message.into(),
        }
    }
}

/// The cloneable error carried by faulted buffers and completion handles.
///
/// Buffers broadcast their terminal state to every observer, so the fault
/// payload must be cheap to clone; the original error is flattened into a
/// message at the point of the fault.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("stage '{stage}' faulted: {message}")]
pub struct StageError {
    /// The stage (or buffer) where the fault originated.
    pub stage: String,
    /// The flattened error message.
    pub message: String,
}

impl StageError {
    /// Creates a new stage error.
    #[must_use]
    pub fn new(stage: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self {
            stage: stage.into(),
            message: message.to_string(),
        }
    }

    /// Creates a cancellation fault for a stage.
    #[must_use]
    pub fn cancelled(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            message: "cancelled".to_string(),
        }
    }
}
