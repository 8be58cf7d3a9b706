//! The statement-execution seam.
//!
//! The compiler never talks to a database. Each batch of bound rows is handed
//! to a [`BatchExecutor`], which runs the statements and reports affected-row
//! counts plus, for inserts, the generated keys in submission order.

use crate::plan::BoundRow;
use crate::row_op::RowOpKind;
use commitplan_core::{ExecutionError, Value};
use std::collections::BTreeMap;

/// Rows of one table and kind, in execution order.
#[derive(Debug, Clone, PartialEq)]
pub struct BoundBatch {
    pub table: String,
    pub kind: RowOpKind,
    pub rows: Vec<BoundRow>,
    /// Generated primary key columns the executor should return for inserts.
    pub generated_columns: Vec<String>,
}

impl BoundBatch {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Whether any row leaves a generated key to the database.
    pub fn needs_generated_keys(&self) -> bool {
        self.kind == RowOpKind::Insert
            && self
                .rows
                .iter()
                .any(|row| self.generated_columns.iter().any(|c| !row.values.contains_key(c)))
    }
}

/// What the executor reports back for one batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchResult {
    /// Affected rows per submitted row. Empty means every row succeeded once.
    pub affected: Vec<u64>,
    /// Generated key rows, one per submitted insert row, in order.
    pub generated_keys: Vec<BTreeMap<String, Value>>,
}

impl BatchResult {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set per-row affected counts (builder pattern).
    #[must_use]
    pub fn with_affected(mut self, affected: Vec<u64>) -> Self {
        self.affected = affected;
        self
    }

    /// Append a generated key row (builder pattern).
    #[must_use]
    pub fn with_generated_key<K, V>(mut self, key: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
    {
        self.generated_keys
            .push(key.into_iter().map(|(k, v)| (k.into(), v.into())).collect());
        self
    }
}

/// Executes bound batches against a store.
///
/// Implementations run inside the caller's transaction; an error aborts the
/// commit and the caller rolls back.
pub trait BatchExecutor {
    fn execute(&mut self, batch: &BoundBatch) -> Result<BatchResult, ExecutionError>;
}

impl<E: BatchExecutor + ?Sized> BatchExecutor for &mut E {
    fn execute(&mut self, batch: &BoundBatch) -> Result<BatchResult, ExecutionError> {
        (**self).execute(batch)
    }
}
