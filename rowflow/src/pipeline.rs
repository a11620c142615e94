//! Whole-graph orchestration.

use crate::context::ExecutionContext;
use crate::errors::FlowError;
use crate::stages::Stage;
use serde_json::json;
use tracing::{error, info};

/// A set of pre-wired stages run as one unit.
///
/// The pipeline owns no topology of its own: stages are wired to each
/// other before being added, and `run` simply starts every stage and
/// awaits every stage's completion. The run succeeds only when all of
/// them - error sinks included - have terminated successfully; otherwise
/// the first fault is returned after every stage has settled.
pub struct Pipeline {
    name: String,
    stages: Vec<Box<dyn Stage>>,
}

impl Pipeline {
    /// Creates an empty pipeline.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stages: Vec::new(),
        }
    }

    /// Adds a stage. Wire stages before moving them in; the pipeline
    /// takes ownership.
    #[must_use]
    pub fn add(mut self, stage: impl Stage + 'static) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    /// Returns the pipeline name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the number of stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Returns true if no stages were added.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Starts every stage, then awaits every stage's completion.
    ///
    /// A startup failure cancels the run so already started stages tear
    /// down. Faults during the run do not cancel sibling branches; the
    /// first fault (in stage order) is returned once all stages settled.
    pub async fn run(mut self, ctx: &ExecutionContext) -> Result<(), FlowError> {
        info!(pipeline = %self.name, run_id = %ctx.run_id(), stages = self.stages.len(), "pipeline starting");

        for stage in &mut self.stages {
            if let Err(err) = stage.start(ctx) {
                error!(pipeline = %self.name, stage = %stage.name(), error = %err, "startup failed");
                ctx.cancellation()
                    .cancel(format!("startup of '{}' failed", stage.name()));
                return Err(err);
            }
            ctx.try_emit("stage.started", Some(json!({ "stage": stage.name() })));
        }

        let mut first_fault = None;
        for stage in &self.stages {
            let name = stage.name().to_string();
            match stage.completion().wait().await {
                Ok(()) => {
                    ctx.try_emit("stage.completed", Some(json!({ "stage": name })));
                }
                Err(err) => {
                    ctx.try_emit(
                        "stage.faulted",
                        Some(json!({ "stage": name, "error": err.to_string() })),
                    );
                    if first_fault.is_none() {
                        first_fault = Some(err);
                    }
                }
            }
        }

        match first_fault {
            None => {
                info!(pipeline = %self.name, run_id = %ctx.run_id(), "pipeline completed");
                Ok(())
            }
            Some(err) => {
                error!(pipeline = %self.name, run_id = %ctx.run_id(), error = %err, "pipeline faulted");
                Err(err.into())
            }
        }
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field("stages", &self.stages.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::LinkSource;
    use crate::stages::{MemoryDestination, MemorySource, RowTransform};

    #[tokio::test]
    async fn test_linear_pipeline_runs_to_completion() {
        let ctx = ExecutionContext::new();
        let source = MemorySource::new("src", vec![1i64, 2, 3]);
        let double = RowTransform::new("double", |v: i64| v * 2);
        let dest: MemoryDestination<i64> = MemoryDestination::new("dest");
        source.link_to(&double);
        double.link_to(&dest);
        let rows = dest.rows();

        Pipeline::new("p")
            .add(source)
            .add(double)
            .add(dest)
            .run(&ctx)
            .await
            .unwrap();

        assert_eq!(*rows.lock(), vec![2, 4, 6]);
    }

    #[tokio::test]
    async fn test_fault_surfaces_after_all_stages_settle() {
        let ctx = ExecutionContext::new();
        let source = MemorySource::new("src", vec![1i64, -1]);
        let strict = RowTransform::try_new("strict", |v: i64| {
            if v < 0 {
                Err(FlowError::processing("negative"))
            } else {
                Ok(Some(v))
            }
        });
        let dest: MemoryDestination<i64> = MemoryDestination::new("dest");
        source.link_to(&strict);
        strict.link_to(&dest);

        let err = Pipeline::new("p")
            .add(source)
            .add(strict)
            .add(dest)
            .run(&ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, FlowError::Faulted(_)));
    }

    #[tokio::test]
    async fn test_startup_failure_cancels_run() {
        let ctx = ExecutionContext::new();
        let source = MemorySource::new("src", vec![1i64]);
        let bad = RowTransform::new("bad", |v: i64| v).with_parallelism(0);
        source.link_to(&bad);

        let err = Pipeline::new("p").add(source).add(bad).run(&ctx).await.unwrap_err();
        assert!(matches!(err, FlowError::Config(_)));
        assert!(ctx.is_cancelled());
    }
}
