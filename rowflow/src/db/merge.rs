//! Synchronizing a table with an incoming row set.

use super::{fetch_all, select_list, BulkLoader, SchemaProvider, SqlExecutor, TableData};
use crate::buffer::{Buffer, Capacity, Completion};
use crate::context::ExecutionContext;
use crate::errors::{ConfigError, DbError, FlowError, StageError};
use crate::link::{LinkSource, LinkTarget, OutputPort};
use crate::row::{identity_key, FlowRow, RowAccess, RowValue};
use crate::stages::{ErrorPort, ErrorRecord, Stage};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// How a merge classified one row against the destination table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ChangeAction {
    /// The row is new: absent from the destination.
    Insert,
    /// The row exists but its compare columns differ.
    Update,
    /// The row exists unchanged.
    Exists,
    /// The row is to be removed from the destination.
    Delete,
}

/// Which classes of change a merge writes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MergeMode {
    /// Inserts, updates, and deletion of destination rows absent from
    /// the input.
    #[default]
    Full,
    /// Inserts and updates only; nothing is deleted.
    NoDeletions,
    /// Updates only; new rows are not inserted, nothing is deleted.
    OnlyUpdates,
    /// Inserts and updates, plus explicit deletions of input rows marked
    /// by the delta predicate. The destination is never scanned for
    /// absent rows.
    Delta,
}

/// How a merge physically removes rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeletionStrategy {
    /// Targeted DELETE statements over identity keys.
    #[default]
    Targeted,
    /// Truncate the table and reinsert every surviving row. The only
    /// strategy usable without identity columns; requires
    /// [`MergeMode::Full`], since rows a mode retains without matching
    /// would not survive the truncate.
    TruncateReinsert,
}

/// One classified row, emitted downstream after the merge has written.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergeDelta<T> {
    /// The classification.
    pub action: ChangeAction,
    /// The row. For [`ChangeAction::Delete`] from an absence scan this is
    /// the destination's row, rebuilt from the snapshot.
    pub row: T,
}

type DeltaPredicate<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

/// Synchronizes a destination table with the incoming row set.
///
/// The merge drains its whole input, reads a snapshot of the destination,
/// classifies every row as [`ChangeAction::Insert`], `Update`, `Exists`
/// or `Delete`, applies the writes its [`MergeMode`] calls for (updates
/// are delete-then-reinsert), and finally emits every classification
/// downstream as a [`MergeDelta`]. Rows match by identity key; identity
/// keys must be unique in the destination or matching is ambiguous
/// (duplicates resolve last-wins).
pub struct DbMerge<T> {
    name: String,
    input: Buffer<T>,
    executor: Arc<dyn SqlExecutor>,
    loader: Arc<dyn BulkLoader>,
    table: String,
    provider: Option<Arc<dyn SchemaProvider>>,
    columns: Option<Vec<String>>,
    id_columns: Option<Vec<String>>,
    compare_columns: Option<Vec<String>>,
    mode: MergeMode,
    strategy: DeletionStrategy,
    delta_predicate: Option<DeltaPredicate<T>>,
    output: OutputPort<MergeDelta<T>>,
    errors: ErrorPort,
    batch_size: Option<usize>,
    capacity: Capacity,
    started: bool,
}

impl<T> DbMerge<T>
where
    T: FlowRow + RowAccess + Default,
{
    /// Creates a merge against `table`.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        executor: Arc<dyn SqlExecutor>,
        loader: Arc<dyn BulkLoader>,
        table: impl Into<String>,
    ) -> Self {
        let name = name.into();
        Self {
            input: Buffer::new(format!("{name}.in"), None),
            output: OutputPort::new(format!("{name}.deltas")),
            errors: ErrorPort::new(&name),
            name,
            executor,
            loader,
            table: table.into(),
            provider: None,
            columns: None,
            id_columns: None,
            compare_columns: None,
            mode: MergeMode::default(),
            strategy: DeletionStrategy::default(),
            delta_predicate: None,
            batch_size: None,
            capacity: Capacity::Default,
            started: false,
        }
    }

    /// Resolves columns and identity columns from the catalog.
    #[must_use]
    pub fn with_schema_provider(mut self, provider: Arc<dyn SchemaProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Fixes the full column set explicitly.
    #[must_use]
    pub fn with_columns(mut self, columns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.columns = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    /// Fixes the identity key columns explicitly.
    #[must_use]
    pub fn with_id_columns(
        mut self,
        columns: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.id_columns = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    /// Fixes the compare columns explicitly (defaults to every column
    /// that is not an identity column).
    #[must_use]
    pub fn with_compare_columns(
        mut self,
        columns: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.compare_columns = Some(columns.into_iter().map(Into::into).collect());
        self
    }

    /// Sets the merge mode.
    #[must_use]
    pub fn with_mode(mut self, mode: MergeMode) -> Self {
        self.mode = mode;
        self
    }

    /// Sets the deletion strategy.
    #[must_use]
    pub fn with_strategy(mut self, strategy: DeletionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Marks input rows as deletions in [`MergeMode::Delta`].
    #[must_use]
    pub fn with_delta_predicate(mut self, predicate: impl Fn(&T) -> bool + Send + Sync + 'static) -> Self {
        self.delta_predicate = Some(Arc::new(predicate));
        self
    }

    /// Overrides the write batch size (defaults to the context's).
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    /// Overrides the buffer capacity for this stage's buffers.
    #[must_use]
    pub fn with_capacity(mut self, capacity: Capacity) -> Self {
        self.capacity = capacity;
        self
    }

    /// Links the error output to a sink; failing insert batches are
    /// redirected there instead of faulting the stage.
    pub fn link_error_to<D: LinkTarget<ErrorRecord> + ?Sized>(&mut self, sink: &D) {
        self.errors.link_to(sink);
    }
}

struct SnapEntry<T> {
    row: T,
    matched: bool,
}

struct Plan<T> {
    deltas: Vec<MergeDelta<T>>,
    /// Identity values of rows to delete with targeted statements, in
    /// identity column order.
    delete_keys: Vec<Vec<RowValue>>,
}

struct Worker<T> {
    name: String,
    executor: Arc<dyn SqlExecutor>,
    loader: Arc<dyn BulkLoader>,
    table: String,
    columns: Vec<String>,
    id_columns: Vec<String>,
    compare_columns: Vec<String>,
    mode: MergeMode,
    strategy: DeletionStrategy,
    delta_predicate: Option<DeltaPredicate<T>>,
    batch_size: usize,
    errors: crate::stages::ErrorHandle,
}

impl<T> Worker<T>
where
    T: FlowRow + RowAccess + Default,
{
    /// Reads the destination snapshot keyed by identity. Duplicate keys
    /// resolve last-wins.
    async fn read_snapshot(
        &self,
    ) -> Result<(Vec<String>, HashMap<String, SnapEntry<T>>), DbError> {
        let sql = format!(
            "SELECT {} FROM {}",
            select_list(&self.columns),
            self.table
        );
        let raw = fetch_all(self.executor.as_ref(), &sql, self.columns.len()).await?;

        let mut order = Vec::with_capacity(raw.len());
        let mut entries: HashMap<String, SnapEntry<T>> = HashMap::with_capacity(raw.len());
        for values in raw {
            let mut row = T::default();
            for (column, value) in self.columns.iter().zip(values) {
                row.set(column, value);
            }
            let key = identity_key(&row, &self.id_columns);
            if entries
                .insert(key.clone(), SnapEntry { row, matched: false })
                .is_none()
            {
                order.push(key);
            }
        }
        Ok((order, entries))
    }

    fn rows_differ(&self, incoming: &T, existing: &T) -> bool {
        self.compare_columns
            .iter()
            .any(|c| incoming.get(c) != existing.get(c))
    }

    fn id_values(&self, row: &T) -> Vec<RowValue> {
        self.id_columns
            .iter()
            .map(|c| row.get(c).unwrap_or(RowValue::Null))
            .collect()
    }

    /// Classifies the drained input against the snapshot.
    fn classify(
        &self,
        rows: Vec<T>,
        order: &[String],
        entries: &mut HashMap<String, SnapEntry<T>>,
    ) -> Plan<T> {
        let mut deltas = Vec::with_capacity(rows.len());
        let mut delete_keys = Vec::new();

        for row in rows {
            let key = identity_key(&row, &self.id_columns);
            if let Some(predicate) = &self.delta_predicate {
                if self.mode == MergeMode::Delta && predicate(&row) {
                    if let Some(entry) = entries.get_mut(&key) {
                        entry.matched = true;
                    }
                    delete_keys.push(self.id_values(&row));
                    deltas.push(MergeDelta {
                        action: ChangeAction::Delete,
                        row,
                    });
                    continue;
                }
            }
            let action = match entries.get_mut(&key) {
                None => ChangeAction::Insert,
                Some(entry) => {
                    entry.matched = true;
                    if self.rows_differ(&row, &entry.row) {
                        delete_keys.push(self.id_values(&row));
                        ChangeAction::Update
                    } else {
                        ChangeAction::Exists
                    }
                }
            };
            deltas.push(MergeDelta { action, row });
        }

        // Destination rows the input never mentioned.
        if self.mode == MergeMode::Full {
            for key in order {
                if let Some(entry) = entries.get(key) {
                    if !entry.matched {
                        delete_keys.push(self.id_values(&entry.row));
                    }
                }
            }
            for key in order {
                let absent = entries.get(key).is_some_and(|e| !e.matched);
                if absent {
                    if let Some(entry) = entries.remove(key) {
                        deltas.push(MergeDelta {
                            action: ChangeAction::Delete,
                            row: entry.row,
                        });
                    }
                }
            }
        }

        Plan {
            deltas,
            delete_keys,
        }
    }

    fn delete_statement(&self, keys: &[Vec<RowValue>]) -> String {
        if self.id_columns.len() == 1 {
            let list = keys
                .iter()
                .map(|k| k[0].to_sql_literal())
                .collect::<Vec<_>>()
                .join(", ");
            format!(
                "DELETE FROM {} WHERE {} IN ({})",
                self.table, self.id_columns[0], list
            )
        } else {
            let groups = keys
                .iter()
                .map(|key| {
                    let clauses = self
                        .id_columns
                        .iter()
                        .zip(key)
                        .map(|(c, v)| format!("{} = {}", c, v.to_sql_literal()))
                        .collect::<Vec<_>>()
                        .join(" AND ");
                    format!("({clauses})")
                })
                .collect::<Vec<_>>()
                .join(" OR ");
            format!("DELETE FROM {} WHERE {}", self.table, groups)
        }
    }

    /// Applies deletions. A delete failure is fatal: the merge must not
    /// reinsert rows it failed to clear.
    async fn apply_deletes(&self, delete_keys: &[Vec<RowValue>]) -> Result<(), DbError> {
        match self.strategy {
            DeletionStrategy::Targeted => {
                for chunk in delete_keys.chunks(self.batch_size) {
                    let sql = self.delete_statement(chunk);
                    self.executor.execute_non_query(&sql).await.map_err(|e| {
                        DbError::sql_with_statement(sql.clone(), e.to_string())
                    })?;
                }
                Ok(())
            }
            DeletionStrategy::TruncateReinsert => {
                let sql = format!("TRUNCATE TABLE {}", self.table);
                self.executor.execute_non_query(&sql).await?;
                Ok(())
            }
        }
    }

    fn writes(&self, delta: &MergeDelta<T>) -> bool {
        match delta.action {
            ChangeAction::Insert => !matches!(self.mode, MergeMode::OnlyUpdates),
            ChangeAction::Update => true,
            // After a truncate every surviving row must come back.
            ChangeAction::Exists => {
                matches!(self.strategy, DeletionStrategy::TruncateReinsert)
            }
            ChangeAction::Delete => false,
        }
    }

    /// Bulk-loads the rows the mode writes; a failing batch is redirected
    /// or fatal.
    async fn apply_inserts(&self, deltas: &[MergeDelta<T>]) -> Result<u64, StageError> {
        let rows: Vec<&T> = deltas
            .iter()
            .filter(|d| self.writes(d))
            .map(|d| &d.row)
            .collect();
        if rows.is_empty() {
            return Ok(0);
        }

        if let Err(err) = self.loader.prepare(&self.table).await {
            return Err(StageError::new(&self.name, &err));
        }

        let mut loaded = 0u64;
        let mut outcome = Ok(());
        for chunk in rows.chunks(self.batch_size) {
            let mut data = TableData::new(&self.table, self.columns.clone());
            for row in chunk {
                data.push_row(
                    self.columns
                        .iter()
                        .map(|c| row.get(c).unwrap_or(RowValue::Null))
                        .collect(),
                );
            }
            match self.loader.bulk_insert(&data).await {
                Ok(()) => loaded += chunk.len() as u64,
                Err(err) => {
                    if self.errors.is_linked()
                        && self.errors.redirect(err.to_string(), &chunk).await.is_ok()
                    {
                        continue;
                    }
                    outcome = Err(StageError::new(&self.name, &err));
                    break;
                }
            }
        }

        let cleanup = self.loader.cleanup(&self.table).await;
        outcome?;
        cleanup.map_err(|err| StageError::new(&self.name, &err))?;
        Ok(loaded)
    }
}

impl<T: FlowRow + RowAccess + Default> LinkTarget<T> for DbMerge<T> {
    fn input_buffer(&self) -> Buffer<T> {
        self.input.clone()
    }
}

impl<T: FlowRow + RowAccess + Default> LinkSource<MergeDelta<T>> for DbMerge<T> {
    fn output_port(&self) -> &OutputPort<MergeDelta<T>> {
        &self.output
    }
}

impl<T> Stage for DbMerge<T>
where
    T: FlowRow + RowAccess + Default,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&mut self, ctx: &ExecutionContext) -> Result<(), FlowError> {
        if self.started {
            return Err(ConfigError::new(&self.name, "stage already started").into());
        }
        if self.mode == MergeMode::Delta && self.delta_predicate.is_none() {
            return Err(ConfigError::new(
                &self.name,
                "delta mode requires a delta predicate",
            )
            .into());
        }
        if self.strategy == DeletionStrategy::TruncateReinsert && self.mode != MergeMode::Full {
            return Err(ConfigError::new(
                &self.name,
                "truncate-reinsert requires full merge mode",
            )
            .into());
        }
        if self.strategy == DeletionStrategy::Targeted
            && self.id_columns.is_none()
            && self.provider.is_none()
        {
            return Err(ConfigError::new(
                &self.name,
                "no identity columns configured and no schema provider to resolve them",
            )
            .into());
        }
        if self.columns.is_none() && self.provider.is_none() {
            return Err(ConfigError::new(
                &self.name,
                "no columns configured and no schema provider to resolve them",
            )
            .into());
        }
        let batch_size = self.batch_size.unwrap_or_else(|| ctx.batch_size());
        if batch_size == 0 {
            return Err(ConfigError::new(&self.name, "batch size must be at least 1").into());
        }
        self.started = true;

        let capacity = self.capacity.resolve(ctx.buffer_capacity());
        self.input.set_capacity(capacity);
        self.output.buffer().set_capacity(capacity);
        self.output.start_router(ctx, &self.name);
        self.output.buffer().add_producer();
        self.errors.start(ctx);
        self.errors.add_producer();

        let input = self.input.clone();
        let output = self.output.buffer().clone();
        let errors = self.errors.handle();
        let cancel = ctx.cancellation().clone();
        let name = self.name.clone();
        let executor = Arc::clone(&self.executor);
        let loader = Arc::clone(&self.loader);
        let table = self.table.clone();
        let provider = self.provider.clone();
        let columns = self.columns.clone();
        let id_columns = self.id_columns.clone();
        let compare_columns = self.compare_columns.clone();
        let mode = self.mode;
        let strategy = self.strategy;
        let delta_predicate = self.delta_predicate.clone();

        tokio::spawn(async move {
            let fault_all = |err: StageError| {
                input.fault(err.clone());
                output.fault(err.clone());
                errors.fault(err);
            };

            // Resolve the column sets before touching anything.
            let (columns, id_columns) = {
                let mut columns = columns;
                let mut id_columns = id_columns;
                if columns.is_none() || id_columns.is_none() {
                    if let Some(provider) = &provider {
                        match provider.table_definition(&table).await {
                            Ok(def) => {
                                if columns.is_none() {
                                    columns = Some(def.column_names());
                                }
                                if id_columns.is_none() {
                                    id_columns = Some(def.identity_columns());
                                }
                            }
                            Err(err) => {
                                fault_all(StageError::new(&name, &err));
                                return;
                            }
                        }
                    }
                }
                match (columns, id_columns) {
                    (Some(c), Some(i)) if !i.is_empty() => (c, i),
                    // Truncate-reinsert can run identity-less: nothing
                    // is matched, every input row reinserts.
                    (Some(c), _) if strategy == DeletionStrategy::TruncateReinsert => {
                        (c, Vec::new())
                    }
                    _ => {
                        fault_all(StageError::new(
                            &name,
                            "could not resolve columns and identity columns",
                        ));
                        return;
                    }
                }
            };
            let compare_columns = compare_columns.unwrap_or_else(|| {
                columns
                    .iter()
                    .filter(|c| !id_columns.contains(c))
                    .cloned()
                    .collect()
            });

            let worker = Worker {
                name: name.clone(),
                executor,
                loader,
                table,
                columns,
                id_columns,
                compare_columns,
                mode,
                strategy,
                delta_predicate,
                batch_size,
                errors: errors.clone(),
            };

            // The snapshot is read before the input drains so a read
            // failure aborts before any destination mutation. Without
            // identity columns there is nothing to match against and the
            // read is skipped.
            let (order, mut entries) = if worker.id_columns.is_empty() {
                (Vec::new(), HashMap::new())
            } else {
                match worker.read_snapshot().await {
                    Ok(snapshot) => snapshot,
                    Err(err) => {
                        fault_all(StageError::new(&name, &err));
                        return;
                    }
                }
            };
            if !worker.id_columns.is_empty() {
                debug!(stage = %name, snapshot = entries.len(), "destination snapshot read");
            }

            let mut rows: Vec<T> = Vec::new();
            loop {
                let popped = tokio::select! {
                    () = cancel.cancelled() => {
                        fault_all(StageError::cancelled(&name));
                        return;
                    }
                    popped = input.pop() => popped,
                };
                match popped {
                    Ok(Some(row)) => rows.push(row),
                    Ok(None) => break,
                    Err(err) => {
                        fault_all(err);
                        return;
                    }
                }
            }

            let plan = worker.classify(rows, &order, &mut entries);

            if !plan.delete_keys.is_empty()
                || worker.strategy == DeletionStrategy::TruncateReinsert
            {
                if let Err(err) = worker.apply_deletes(&plan.delete_keys).await {
                    fault_all(StageError::new(&name, &err));
                    return;
                }
            }

            match worker.apply_inserts(&plan.deltas).await {
                Ok(loaded) => {
                    info!(
                        stage = %name,
                        classified = plan.deltas.len(),
                        deleted = plan.delete_keys.len(),
                        loaded,
                        "merge applied"
                    );
                }
                Err(err) => {
                    fault_all(err);
                    return;
                }
            }

            for delta in plan.deltas {
                if output.push(delta).await.is_err() {
                    errors.producer_done();
                    return;
                }
            }
            output.producer_done();
            errors.producer_done();
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
    use crate::testing::{MockSqlExecutor, RecordingBulkLoader};

    fn item(id: i64, qty: i64) -> DynamicRow {
        DynamicRow::new().with("id", id).with("qty", qty)
    }

    fn snapshot_rows() -> Vec<Vec<RowValue>> {
        // Destination: {1: 10, 2: 20, 3: 30}
        vec![
            vec![RowValue::Int(1), RowValue::Int(10)],
            vec![RowValue::Int(2), RowValue::Int(20)],
            vec![RowValue::Int(3), RowValue::Int(30)],
        ]
    }

    fn merge(
        executor: &Arc<MockSqlExecutor>,
        loader: &Arc<RecordingBulkLoader>,
    ) -> DbMerge<DynamicRow> {
        DbMerge::new(
            "sync",
            Arc::clone(executor) as _,
            Arc::clone(loader) as _,
            "items",
        )
        .with_columns(["id", "qty"])
        .with_id_columns(["id"])
    }

    async fn drain_actions(sink: &Buffer<MergeDelta<DynamicRow>>) -> Vec<(String, ChangeAction)> {
        let mut out = Vec::new();
        while let Some(delta) = sink.pop().await.unwrap() {
            out.push((delta.row.get("id").unwrap_or(RowValue::Null).to_string(), delta.action));
        }
        out
    }

    #[tokio::test]
    async fn test_full_merge_classification() {
        let ctx = ExecutionContext::new();
        let executor = Arc::new(MockSqlExecutor::new().with_result_set(snapshot_rows()));
        let loader = Arc::new(RecordingBulkLoader::new());
        let mut stage = merge(&executor, &loader);
        let sink: Buffer<MergeDelta<DynamicRow>> = Buffer::new("sink", None);
        stage.link_to(&sink);
        stage.start(&ctx).unwrap();

        // Input: {2: 20 unchanged, 3: 99 changed, 4: 40 new}; id 1 absent.
        let input = stage.input_buffer();
        input.push(item(2, 20)).await.unwrap();
        input.push(item(3, 99)).await.unwrap();
        input.push(item(4, 40)).await.unwrap();
        input.complete();

        // Input rows come first in input order, then the absence scan's
        // deletes in snapshot order.
        let actions = drain_actions(&sink).await;
        assert_eq!(
            actions,
            vec![
                ("2".to_string(), ChangeAction::Exists),
                ("3".to_string(), ChangeAction::Update),
                ("4".to_string(), ChangeAction::Insert),
                ("1".to_string(), ChangeAction::Delete),
            ]
        );
        stage.completion().wait().await.unwrap();

        // Updates are delete-then-reinsert; absent id 1 is also deleted.
        let sql = executor.executed_sql();
        let delete = sql
            .iter()
            .find(|s| s.starts_with("DELETE"))
            .expect("a targeted delete");
        assert!(delete.contains('3') && delete.contains('1'));

        // Insert + Update rows are loaded; Exists is not.
        let loaded: usize = loader.batches().iter().map(TableData::len).sum();
        assert_eq!(loaded, 2);
    }

    #[tokio::test]
    async fn test_no_deletions_mode_keeps_absent_rows() {
        let ctx = ExecutionContext::new();
        let executor = Arc::new(MockSqlExecutor::new().with_result_set(snapshot_rows()));
        let loader = Arc::new(RecordingBulkLoader::new());
        let mut stage = merge(&executor, &loader).with_mode(MergeMode::NoDeletions);
        let sink: Buffer<MergeDelta<DynamicRow>> = Buffer::new("sink", None);
        stage.link_to(&sink);
        stage.start(&ctx).unwrap();

        let input = stage.input_buffer();
        input.push(item(4, 40)).await.unwrap();
        input.complete();

        let actions = drain_actions(&sink).await;
        assert_eq!(actions, vec![("4".to_string(), ChangeAction::Insert)]);
        // No absence deletes were issued.
        assert!(executor.executed_sql().iter().all(|s| !s.starts_with("DELETE")));
    }

    #[tokio::test]
    async fn test_only_updates_mode_skips_inserts() {
        let ctx = ExecutionContext::new();
        let executor = Arc::new(MockSqlExecutor::new().with_result_set(snapshot_rows()));
        let loader = Arc::new(RecordingBulkLoader::new());
        let mut stage = merge(&executor, &loader).with_mode(MergeMode::OnlyUpdates);
        let sink: Buffer<MergeDelta<DynamicRow>> = Buffer::new("sink", None);
        stage.link_to(&sink);
        stage.start(&ctx).unwrap();

        let input = stage.input_buffer();
        input.push(item(3, 99)).await.unwrap();
        input.push(item(4, 40)).await.unwrap();
        input.complete();

        // The new row is still classified, just not written.
        let actions = drain_actions(&sink).await;
        assert_eq!(
            actions,
            vec![
                ("3".to_string(), ChangeAction::Update),
                ("4".to_string(), ChangeAction::Insert),
            ]
        );

        let loaded: usize = loader.batches().iter().map(TableData::len).sum();
        assert_eq!(loaded, 1);
    }

    #[tokio::test]
    async fn test_delta_mode_deletes_marked_rows() {
        let ctx = ExecutionContext::new();
        let executor = Arc::new(MockSqlExecutor::new().with_result_set(snapshot_rows()));
        let loader = Arc::new(RecordingBulkLoader::new());
        let mut stage = merge(&executor, &loader)
            .with_mode(MergeMode::Delta)
            .with_delta_predicate(|row: &DynamicRow| {
                row.get("qty") == Some(RowValue::Int(-1))
            });
        let sink: Buffer<MergeDelta<DynamicRow>> = Buffer::new("sink", None);
        stage.link_to(&sink);
        stage.start(&ctx).unwrap();

        let input = stage.input_buffer();
        input.push(item(2, -1)).await.unwrap();
        input.push(item(4, 40)).await.unwrap();
        input.complete();

        let actions = drain_actions(&sink).await;
        assert_eq!(
            actions,
            vec![
                ("2".to_string(), ChangeAction::Delete),
                ("4".to_string(), ChangeAction::Insert),
            ]
        );
        // The marked row is deleted, id 1 and 3 are untouched.
        let delete = executor
            .executed_sql()
            .into_iter()
            .find(|s| s.starts_with("DELETE"))
            .expect("a targeted delete");
        assert!(delete.contains('2'));
        assert!(!delete.contains('1') && !delete.contains('3'));
    }

    #[tokio::test]
    async fn test_truncate_reinsert_restores_survivors() {
        let ctx = ExecutionContext::new();
        let executor = Arc::new(MockSqlExecutor::new().with_result_set(snapshot_rows()));
        let loader = Arc::new(RecordingBulkLoader::new());
        let mut stage =
            merge(&executor, &loader).with_strategy(DeletionStrategy::TruncateReinsert);
        let sink: Buffer<MergeDelta<DynamicRow>> = Buffer::new("sink", None);
        stage.link_to(&sink);
        stage.start(&ctx).unwrap();

        let input = stage.input_buffer();
        input.push(item(2, 20)).await.unwrap();
        input.push(item(3, 99)).await.unwrap();
        input.complete();
        stage.completion().wait().await.unwrap();

        assert!(executor
            .executed_sql()
            .iter()
            .any(|s| s == "TRUNCATE TABLE items"));
        // Exists rows are reinserted after a truncate.
        let loaded: usize = loader.batches().iter().map(TableData::len).sum();
        assert_eq!(loaded, 2);
        drain_actions(&sink).await;
    }

    #[tokio::test]
    async fn test_truncate_outside_full_mode_rejected() {
        // Truncate destroys destination rows the input never mentioned;
        // modes that promise to keep them cannot use it.
        let ctx = ExecutionContext::new();
        let executor = Arc::new(MockSqlExecutor::new());
        let loader = Arc::new(RecordingBulkLoader::new());
        for mode in [MergeMode::NoDeletions, MergeMode::OnlyUpdates] {
            let mut stage = merge(&executor, &loader)
                .with_mode(mode)
                .with_strategy(DeletionStrategy::TruncateReinsert);
            assert!(matches!(stage.start(&ctx), Err(FlowError::Config(_))));
        }
        assert!(executor.executed_sql().is_empty());
    }

    #[tokio::test]
    async fn test_truncate_without_identity_reinserts_all() {
        let ctx = ExecutionContext::new();
        let executor = Arc::new(MockSqlExecutor::new());
        let loader = Arc::new(RecordingBulkLoader::new());
        let mut stage = DbMerge::new(
            "sync",
            Arc::clone(&executor) as _,
            Arc::clone(&loader) as _,
            "items",
        )
        .with_columns(["id", "qty"])
        .with_strategy(DeletionStrategy::TruncateReinsert);
        let sink: Buffer<MergeDelta<DynamicRow>> = Buffer::new("sink", None);
        stage.link_to(&sink);
        stage.start(&ctx).unwrap();

        let input = stage.input_buffer();
        input.push(item(2, 20)).await.unwrap();
        input.push(item(4, 40)).await.unwrap();
        input.complete();

        // No identity, no snapshot: every row is an insert after the
        // truncate.
        let actions = drain_actions(&sink).await;
        assert_eq!(
            actions,
            vec![
                ("2".to_string(), ChangeAction::Insert),
                ("4".to_string(), ChangeAction::Insert),
            ]
        );
        stage.completion().wait().await.unwrap();
        assert_eq!(executor.executed_sql(), vec!["TRUNCATE TABLE items".to_string()]);
        let loaded: usize = loader.batches().iter().map(TableData::len).sum();
        assert_eq!(loaded, 2);
    }

    #[tokio::test]
    async fn test_composite_identity_delete_statement() {
        let worker: Worker<DynamicRow> = Worker {
            name: "sync".to_string(),
            executor: Arc::new(MockSqlExecutor::new()),
            loader: Arc::new(RecordingBulkLoader::new()),
            table: "t".to_string(),
            columns: vec!["region".to_string(), "id".to_string()],
            id_columns: vec!["region".to_string(), "id".to_string()],
            compare_columns: vec![],
            mode: MergeMode::Full,
            strategy: DeletionStrategy::Targeted,
            delta_predicate: None,
            batch_size: 100,
            errors: ErrorPort::new("sync").handle(),
        };
        let sql = worker.delete_statement(&[
            vec![RowValue::from("eu"), RowValue::Int(1)],
            vec![RowValue::from("us"), RowValue::Int(2)],
        ]);
        assert_eq!(
            sql,
            "DELETE FROM t WHERE (region = 'eu' AND id = 1) OR (region = 'us' AND id = 2)"
        );
    }

    #[tokio::test]
    async fn test_snapshot_failure_aborts_before_writes() {
        let ctx = ExecutionContext::new();
        let executor = Arc::new(MockSqlExecutor::new().failing_on("SELECT"));
        let loader = Arc::new(RecordingBulkLoader::new());
        let mut stage = merge(&executor, &loader);
        stage.start(&ctx).unwrap();

        let input = stage.input_buffer();
        let err = stage.completion().wait().await.unwrap_err();
        assert_eq!(err.stage, "sync");
        assert!(input.is_faulted());
        assert!(loader.batches().is_empty());
        assert!(!loader.prepared());
    }

    #[tokio::test]
    async fn test_delta_without_predicate_rejected() {
        let ctx = ExecutionContext::new();
        let executor = Arc::new(MockSqlExecutor::new());
        let loader = Arc::new(RecordingBulkLoader::new());
        let mut stage = merge(&executor, &loader).with_mode(MergeMode::Delta);
        assert!(matches!(stage.start(&ctx), Err(FlowError::Config(_))));
    }

    #[tokio::test]
    async fn test_delta_with_truncate_rejected() {
        let ctx = ExecutionContext::new();
        let executor = Arc::new(MockSqlExecutor::new());
        let loader = Arc::new(RecordingBulkLoader::new());
        let mut stage = merge(&executor, &loader)
            .with_mode(MergeMode::Delta)
            .with_delta_predicate(|_: &DynamicRow| false)
            .with_strategy(DeletionStrategy::TruncateReinsert);
        assert!(matches!(stage.start(&ctx), Err(FlowError::Config(_))));
    }
}
