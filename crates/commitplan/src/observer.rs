//! Feeds executor results back into the commit.

use crate::executor::{BatchResult, BoundBatch};
use crate::plan::{Batch, CommitPlan};
use crate::report::{CommitReport, LockConflict};
use crate::row_op::RowOpKind;
use commitplan_core::{Error, ExecutionError, IdentityErrorKind, Result, Value};
use std::collections::BTreeMap;

/// Apply one batch's result: generated keys first, then affected counts.
pub(crate) fn observe_batch(
    plan: &mut CommitPlan<'_>,
    batch: &Batch,
    bound: &BoundBatch,
    result: &BatchResult,
    report: &mut CommitReport,
) -> Result<()> {
    observe_generated_keys(plan, batch, bound, &result.generated_keys)?;
    observe_counts(bound, &result.affected, report)
}

fn observe_generated_keys(
    plan: &mut CommitPlan<'_>,
    batch: &Batch,
    bound: &BoundBatch,
    keys: &[BTreeMap<String, Value>],
) -> Result<()> {
    if bound.kind != RowOpKind::Insert || bound.generated_columns.is_empty() {
        if !keys.is_empty() {
            tracing::trace!(table = %bound.table, kind = %bound.kind, "Ignoring keys for a batch without generated columns");
        }
        return Ok(());
    }
    if keys.is_empty() && !bound.needs_generated_keys() {
        return Ok(());
    }
    if keys.len() != batch.ops.len() {
        return Err(Error::identity(
            IdentityErrorKind::GeneratedKeyCountMismatch,
            format!(
                "Generated key count mismatch for '{}': expected {}, got {}",
                bound.table,
                batch.ops.len(),
                keys.len()
            ),
        ));
    }

    let fallback = plan.config().generated_key_fallback;
    for (op, key) in batch.ops.iter().zip(keys) {
        let r = plan.registry().op(*op).id();
        let id = plan.registry().ids().object_id(r).clone();
        if key.is_empty() {
            return Err(Error::identity(
                IdentityErrorKind::EmptyGeneratedKey,
                format!("Empty generated key row for {id}"),
            ));
        }
        if !id.is_temporary() {
            tracing::warn!(id = %id, "Generated key for a permanent id ignored");
            continue;
        }

        for column in &bound.generated_columns {
            let value = match key.get(column) {
                Some(value) => value.clone(),
                None if fallback && key.len() == 1 => {
                    let Some(value) = key.values().next() else {
                        continue;
                    };
                    tracing::warn!(
                        table = %bound.table,
                        column = %column,
                        "Generated key column not found by name, using the only returned column"
                    );
                    value.clone()
                }
                None => {
                    tracing::trace!(table = %bound.table, column = %column, "Generated key column not returned");
                    continue;
                }
            };
            tracing::debug!(id = %id, column = %column, value = %value, "Generated key received");
            plan.registry_mut()
                .ids_mut()
                .set_replacement(r, column.clone(), value.into());
        }
    }
    Ok(())
}

fn observe_counts(bound: &BoundBatch, affected: &[u64], report: &mut CommitReport) -> Result<()> {
    if affected.is_empty() {
        report.record_affected(bound.kind, bound.rows.len() as u64);
        return Ok(());
    }
    if affected.len() != bound.rows.len() {
        return Err(Error::Execution(
            ExecutionError::new(format!(
                "Executor reported {} counts for {} rows",
                affected.len(),
                bound.rows.len()
            ))
            .with_table(bound.table.clone()),
        ));
    }

    for (row, count) in bound.rows.iter().zip(affected) {
        report.record_affected(bound.kind, *count);
        if *count == 0 && row.optimistic_lock {
            tracing::warn!(table = %row.table, kind = %row.kind, id = %row.id, "Optimistic lock conflict");
            report.lock_conflicts.push(LockConflict {
                table: row.table.clone(),
                kind: row.kind,
                id: row.id.clone(),
                qualifier: row.key.keys().chain(row.qualifier.keys()).cloned().collect(),
            });
        }
    }
    Ok(())
}
