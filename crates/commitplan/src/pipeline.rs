//! Compile, execute and reconcile one commit.

use crate::compiler::CommitCompiler;
use crate::config::CommitConfig;
use crate::executor::{BatchExecutor, BoundBatch};
use crate::input::CommitInput;
use crate::observer::observe_batch;
use crate::plan::{BoundRow, CommitPlan};
use crate::reconciler::IdentityReconciler;
use crate::report::CommitReport;
use crate::row_op::RowOpKind;
use commitplan_core::{Error, MappingModel, Result};

/// Drives a commit end to end against a [`BatchExecutor`].
///
/// Batches are bound right before they execute, so keys generated by one
/// batch flow into the foreign keys of the next. Identities are only
/// reassigned after the last batch succeeded; a failure anywhere leaves the
/// caller's identities untouched.
#[derive(Debug, Clone)]
pub struct CommitPipeline<'m> {
    model: &'m MappingModel,
    config: CommitConfig,
}

impl<'m> CommitPipeline<'m> {
    /// Create a pipeline with the default configuration.
    pub fn new(model: &'m MappingModel) -> Self {
        Self {
            model,
            config: CommitConfig::default(),
        }
    }

    /// Use a specific configuration (builder pattern).
    #[must_use]
    pub fn with_config(mut self, config: CommitConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &CommitConfig {
        &self.config
    }

    /// Compile without executing.
    pub fn compile(&self, input: &CommitInput) -> Result<CommitPlan<'m>> {
        CommitCompiler::new(self.model)
            .with_config(self.config.clone())
            .compile(input)
    }

    /// Compile, execute every batch and reconcile identities.
    #[tracing::instrument(level = "info", skip(self, input, executor), fields(changes = input.changes.len()))]
    pub fn run<E: BatchExecutor>(&self, input: &CommitInput, executor: &mut E) -> Result<CommitReport> {
        let mut plan = self.compile(input)?;
        tracing::info!(
            inserts = plan.count(RowOpKind::Insert),
            updates = plan.count(RowOpKind::Update),
            deletes = plan.count(RowOpKind::Delete),
            batches = plan.batches().len(),
            "Executing commit plan"
        );

        let start = std::time::Instant::now();
        let mut report = CommitReport::default();
        execute_plan(&mut plan, executor, &mut report)?;

        let reconciled = IdentityReconciler::new(&mut plan).reconcile()?;
        report.id_changes = reconciled.id_changes;
        report.backfills = reconciled.backfills;
        report.flattened_paths = reconciled.flattened_paths;
        if self.config.archive_operations {
            report.archived = Some(plan.summaries());
        }

        tracing::info!(
            elapsed_ms = start.elapsed().as_millis(),
            inserted = report.inserted,
            updated = report.updated,
            deleted = report.deleted,
            id_changes = report.id_changes.len(),
            lock_conflicts = report.lock_conflicts.len(),
            "Commit complete"
        );
        Ok(report)
    }
}

/// Bind, execute and observe every batch in order.
fn execute_plan<E: BatchExecutor>(plan: &mut CommitPlan<'_>, executor: &mut E, report: &mut CommitReport) -> Result<()> {
    let batches = plan.batches().to_vec();
    for batch in &batches {
        let table = plan.registry().model().table(&batch.table)?;
        let generated_columns = if batch.kind == RowOpKind::Insert {
            table.generated_primary_keys().map(|c| c.name.clone()).collect()
        } else {
            Vec::new()
        };
        let rows = batch
            .ops
            .iter()
            .map(|op| plan.bind(*op))
            .collect::<Result<Vec<BoundRow>>>()?;
        let bound = BoundBatch {
            table: batch.table.clone(),
            kind: batch.kind,
            rows,
            generated_columns,
        };

        tracing::debug!(table = %bound.table, kind = %bound.kind, count = bound.len(), "Executing batch");
        let result = executor.execute(&bound).map_err(|mut e| {
            if e.table.is_none() {
                e.table = Some(bound.table.clone());
            }
            Error::Execution(e)
        })?;
        observe_batch(plan, batch, &bound, &result, report)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::BatchResult;
    use commitplan_core::{ColumnMapping, EntityMapping, ExecutionError, GraphChange, ObjectId, TableMapping};

    struct Failing;

    impl BatchExecutor for Failing {
        fn execute(&mut self, _batch: &BoundBatch) -> std::result::Result<BatchResult, ExecutionError> {
            Err(ExecutionError::new("disk full"))
        }
    }

    fn model() -> MappingModel {
        MappingModel::new()
            .with_table(TableMapping::new("ARTIST").with_column(ColumnMapping::pk("ARTIST_ID").generated(true)))
            .with_entity(EntityMapping::new("Artist", "ARTIST"))
    }

    #[test]
    fn test_executor_failure_names_the_table() {
        let model = model();
        let input = CommitInput::from_changes([GraphChange::NodeCreated {
            id: ObjectId::temporary("Artist"),
        }]);

        let err = CommitPipeline::new(&model).run(&input, &mut Failing).unwrap_err();
        match err {
            Error::Execution(e) => {
                assert_eq!(e.table.as_deref(), Some("ARTIST"));
                assert_eq!(e.message, "disk full");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_empty_commit_runs_nothing() {
        let model = model();
        let report = CommitPipeline::new(&model)
            .run(&CommitInput::new(), &mut Failing)
            .unwrap();
        assert_eq!(report.total(), 0);
        assert!(report.id_changes.is_empty());
    }
}
