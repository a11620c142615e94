//! # Rowflow
//!
//! An embeddable dataflow engine for tabular ETL pipelines.
//!
//! Rowflow lets you assemble directed graphs of data-producing,
//! data-transforming, and data-consuming stages that move tabular records
//! between heterogeneous endpoints (databases, memory, custom codecs) with:
//!
//! - **Bounded buffering**: every edge is a capacity-bounded queue with
//!   producer backpressure
//! - **Completion and fault propagation**: completion is an AND-join over a
//!   stage's upstream links; faults fan out downstream immediately
//! - **Batch-oriented processing**: fixed-size chunking for bulk-load
//!   efficiency
//! - **Stateful transformations**: hash-based distinct, ordered merge-join,
//!   materialized lookups, and destination synchronization (upsert/delete)
//! - **Per-record error isolation**: failing rows can be redirected to an
//!   error sink instead of faulting the whole graph
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use rowflow::prelude::*;
//!
//! let source = MemorySource::new("orders", rows);
//! let mut dedup = Distinct::new("dedup").with_columns(["order_id"]);
//! let dest = MemoryDestination::new("sink");
//!
//! source.link_to(&dedup);
//! dedup.link_to(&dest);
//!
//! let collected = dest.rows();
//! Pipeline::new("orders")
//!     .add(source)
//!     .add(dedup)
//!     .add(dest)
//!     .run(&ExecutionContext::new())
//!     .await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod buffer;
pub mod cancellation;
pub mod context;
pub mod db;
pub mod errors;
pub mod events;
pub mod link;
pub mod observe;
pub mod pipeline;
pub mod row;
pub mod stages;
pub mod testing;


/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::buffer::{Buffer, Capacity, Completion};
    pub use crate::cancellation::CancellationToken;
    pub use crate::context::ExecutionContext;
    pub use crate::db::{
        BulkLoader, ChangeAction, DbDestination, DbMerge, DbSource, DeletionStrategy,
        MergeDelta, MergeMode, RowReader, SchemaProvider, SqlExecutor, TableColumn,
        TableData, TableDefinition,
    };
    pub use crate::errors::{ConfigError, DbError, FlowError, StageError};
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::link::{LinkSource, LinkTarget};
    pub use crate::pipeline::Pipeline;
    pub use crate::row::{
        identity_key, ArrayRow, DynamicRow, Field, FieldRoles, FlowRow, RowAccess, RowValue,
        Schema, SchemaBuilder, SchemaRow,
    };
    pub use crate::stages::{
        BatchTransform, BlockTransform, ColumnMap, CustomDestination, CustomSource, Distinct,
        ErrorRecord, InputHandle, IterSource, Lookup, MemoryDestination, MemorySource, MergeJoin,
        RowConsumer, RowProducer, RowTransform, Stage,
    };
}
