//! Registry key of a row operation.

use crate::id_table::{IdRef, IdTable};
use commitplan_core::{Result, Value};
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};

/// Normalized identity of one table row.
///
/// The key snapshot is computed once, when the operation is registered, and
/// never changes afterwards. Two keys with resolved snapshots are equal when
/// the snapshots are equal, so that a temporary id whose key is already
/// fully known meets the permanent id of the same row. A key without a
/// snapshot only equals keys of the very same interned id.
#[derive(Debug, Clone)]
pub struct EffectiveId {
    table: String,
    snapshot: BTreeMap<String, Value>,
    id: IdRef,
}

impl EffectiveId {
    /// Compute the key of `id` in `table` from its current key values.
    pub fn new(table: impl Into<String>, id: IdRef, ids: &IdTable) -> Result<Self> {
        Ok(Self {
            table: table.into(),
            snapshot: ids.current_key(id)?,
            id,
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn id(&self) -> IdRef {
        self.id
    }

    pub fn snapshot(&self) -> &BTreeMap<String, Value> {
        &self.snapshot
    }
}

impl PartialEq for EffectiveId {
    fn eq(&self, other: &Self) -> bool {
        if self.table != other.table {
            return false;
        }
        match (self.snapshot.is_empty(), other.snapshot.is_empty()) {
            (true, true) => self.id == other.id,
            (false, false) => self.snapshot == other.snapshot,
            _ => false,
        }
    }
}

impl Eq for EffectiveId {}

impl Hash for EffectiveId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.table.hash(state);
        if self.snapshot.is_empty() {
            self.id.hash(state);
        } else {
            self.snapshot.hash(state);
        }
    }
}
