//! Duplicate elimination.

use super::Stage;
use crate::buffer::{Buffer, Capacity, Completion};
use crate::context::ExecutionContext;
use crate::errors::{ConfigError, FlowError, StageError};
use crate::link::{LinkSource, LinkTarget, OutputPort};
use crate::row::{FlowRow, RowAccess};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use tracing::debug;

/// Forwards only the first occurrence of each distinct row.
///
/// Rows are fingerprinted by a 64-bit hash over the configured columns
/// (or every column of the row when none are configured); a hash
/// collision is treated as a duplicate. The first occurrence wins and is
/// forwarded unchanged; later occurrences are dropped. The fingerprint
/// cache grows with the number of distinct rows and is never evicted.
///
/// For typed rows, pass the schema's distinct-role columns:
/// `Distinct::new("d").with_columns(Order::schema().distinct_columns())`.
pub struct Distinct<T> {
    name: String,
    input: Buffer<T>,
    output: OutputPort<T>,
    columns: Option<Vec<String>>,
    capacity: Capacity,
    started: bool,
}

impl<T: FlowRow + RowAccess> Distinct<T> {
    /// Creates a distinct stage fingerprinting every column.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            input: Buffer::new(format!("{name}.in"), None),
            output: OutputPort::new(format!("{name}.out")),
            name,
            columns: None,
            capacity: Capacity::Default,
            started: false,
        }
    }

    /// Restricts the fingerprint to the given columns.
    #[must_use]
    pub fn with_columns(mut self, columns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.columns = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    /// Overrides the buffer capacity for this stage's input and output.
    #[must_use]
    pub fn with_capacity(mut self, capacity: Capacity) -> Self {
        self.capacity = capacity;
        self
    }
}

fn fingerprint<T: RowAccess>(row: &T, columns: Option<&[String]>) -> u64 {
    let mut hasher = DefaultHasher::new();
    match columns {
        Some(columns) => {
            for column in columns {
                column.hash(&mut hasher);
                row.get(column).hash(&mut hasher);
            }
        }
        None => {
            for column in row.columns() {
                column.hash(&mut hasher);
                row.get(&column).hash(&mut hasher);
            }
        }
    }
    hasher.finish()
}

impl<T: FlowRow + RowAccess> LinkTarget<T> for Distinct<T> {
    fn input_buffer(&self) -> Buffer<T> {
        self.input.clone()
    }
}

impl<T: FlowRow + RowAccess> LinkSource<T> for Distinct<T> {
    fn output_port(&self) -> &OutputPort<T> {
        &self.output
    }
}

impl<T: FlowRow + RowAccess> Stage for Distinct<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&mut self, ctx: &ExecutionContext) -> Result<(), FlowError> {
        if self.started {
            return Err(ConfigError::new(&self.name, "stage already started").into());
        }
        if self.columns.as_ref().is_some_and(Vec::is_empty) {
            return Err(ConfigError::new(&self.name, "distinct column list is empty").into());
        }
        self.started = true;

        let capacity = self.capacity.resolve(ctx.buffer_capacity());
        self.input.set_capacity(capacity);
        self.output.buffer().set_capacity(capacity);
        self.output.start_router(ctx, &self.name);
        self.output.buffer().add_producer();

        let input = self.input.clone();
        let output = self.output.buffer().clone();
        let columns = self.columns.clone();
        let cancel = ctx.cancellation().clone();
        let name = self.name.clone();

        tokio::spawn(async move {
            let mut seen: HashSet<u64> = HashSet::new();
            let mut dropped = 0u64;
            loop {
                let popped = tokio::select! {
                    () = cancel.cancelled() => {
                        let err = StageError::cancelled(&name);
                        input.fault(err.clone());
                        output.fault(err);
                        return;
                    }
                    popped = input.pop() => popped,
                };
                match popped {
                    Ok(Some(row)) => {
                        let key = fingerprint(&row, columns.as_deref());
                        if seen.insert(key) {
                            if output.push(row).await.is_err() {
                                input.fault(StageError::new(&name, "downstream terminated"));
                                return;
                            }
                        } else {
                            dropped += 1;
                        }
                    }
                    Ok(None) => {
                        debug!(stage = %name, distinct = seen.len(), dropped, "input exhausted");
                        output.producer_done();
                        return;
                    }
                    Err(err) => {
                        output.fault(err);
                        return;
                    }
                }
            }
        });
        Ok(())
    }

    fn completion(&self) -> Completion {
        self.output.completion()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::DynamicRow;

    async fn drain<T: FlowRow>(buffer: &Buffer<T>) -> Vec<T> {
        let mut out = Vec::new();
        while let Some(row) = buffer.pop().await.unwrap() {
            out.push(row);
        }
        out
    }

    fn row(id: i64, name: &str) -> DynamicRow {
        DynamicRow::new().with("id", id).with("name", name)
    }

    #[tokio::test]
    async fn test_first_occurrence_wins() {
        let ctx = ExecutionContext::new();
        let mut stage: Distinct<DynamicRow> = Distinct::new("dedupe");
        let sink: Buffer<DynamicRow> = Buffer::new("sink", None);
        stage.link_to(&sink);
        stage.start(&ctx).unwrap();

        let input = stage.input_buffer();
        input.push(row(1, "a")).await.unwrap();
        input.push(row(2, "b")).await.unwrap();
        input.push(row(1, "a")).await.unwrap();
        input.complete();

        let rows = drain(&sink).await;
        assert_eq!(rows, vec![row(1, "a"), row(2, "b")]);
    }

    #[tokio::test]
    async fn test_fingerprint_restricted_to_columns() {
        let ctx = ExecutionContext::new();
        let mut stage: Distinct<DynamicRow> = Distinct::new("dedupe").with_columns(["id"]);
        let sink: Buffer<DynamicRow> = Buffer::new("sink", None);
        stage.link_to(&sink);
        stage.start(&ctx).unwrap();

        let input = stage.input_buffer();
        input.push(row(1, "a")).await.unwrap();
        // Same id, different payload: dropped, first occurrence kept.
        input.push(row(1, "b")).await.unwrap();
        input.push(row(2, "c")).await.unwrap();
        input.complete();

        let rows = drain(&sink).await;
        assert_eq!(rows, vec![row(1, "a"), row(2, "c")]);
    }

    #[tokio::test]
    async fn test_missing_column_is_part_of_the_fingerprint() {
        let ctx = ExecutionContext::new();
        let mut stage: Distinct<DynamicRow> = Distinct::new("dedupe").with_columns(["id", "x"]);
        let sink: Buffer<DynamicRow> = Buffer::new("sink", None);
        stage.link_to(&sink);
        stage.start(&ctx).unwrap();

        let input = stage.input_buffer();
        input.push(row(1, "a")).await.unwrap();
        input.push(DynamicRow::new().with("id", 1i64).with("x", 0i64)).await.unwrap();
        input.complete();

        // Absent "x" and present "x" fingerprint differently.
        assert_eq!(drain(&sink).await.len(), 2);
    }

    #[tokio::test]
    async fn test_empty_column_list_rejected() {
        let ctx = ExecutionContext::new();
        let mut stage: Distinct<DynamicRow> =
            Distinct::new("dedupe").with_columns(Vec::<String>::new());
        assert!(matches!(stage.start(&ctx), Err(FlowError::Config(_))));
    }
}
