//! Planned row operations.

use crate::effective_id::EffectiveId;
use crate::id_table::{IdRef, PendingValue};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Kind of a row operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RowOpKind {
    Insert,
    Update,
    Delete,
}

/// Outcome of requesting `requested` for a row already planned as `self`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindMerge {
    /// The existing kind already covers the request.
    Keep,
    /// The operation must become the requested kind.
    Escalate(RowOpKind),
    /// Insert and delete of the same row; the existing kind is kept.
    Conflict,
}

impl RowOpKind {
    /// Merge a requested kind into the existing one.
    ///
    /// Update is the bottom of the lattice: it escalates to Insert or Delete
    /// and is absorbed by both. Insert and Delete never turn into each other.
    pub fn merge(self, requested: RowOpKind) -> KindMerge {
        use RowOpKind::{Delete, Insert, Update};
        match (self, requested) {
            (a, b) if a == b => KindMerge::Keep,
            (Update, other) => KindMerge::Escalate(other),
            (Insert | Delete, Update) => KindMerge::Keep,
            (Insert, Delete) | (Delete, Insert) => KindMerge::Conflict,
            _ => KindMerge::Keep,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RowOpKind::Insert => "INSERT",
            RowOpKind::Update => "UPDATE",
            RowOpKind::Delete => "DELETE",
        }
    }
}

impl fmt::Display for RowOpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Column assignments of an insert or update.
#[derive(Debug, Clone, Default)]
pub struct Values {
    assignments: BTreeMap<String, PendingValue>,
    /// Intermediate rows created for flattened paths, by path.
    flattened_ids: BTreeMap<String, IdRef>,
}

impl Values {
    /// Assign a column, replacing any previous assignment.
    pub fn add(&mut self, column: impl Into<String>, value: PendingValue) {
        self.assignments.insert(column.into(), value);
    }

    /// Remember the intermediate row realizing `path`.
    pub fn add_flattened_id(&mut self, path: impl Into<String>, id: IdRef) {
        self.flattened_ids.insert(path.into(), id);
    }

    pub fn get(&self, column: &str) -> Option<&PendingValue> {
        self.assignments.get(column)
    }

    pub fn assignments(&self) -> &BTreeMap<String, PendingValue> {
        &self.assignments
    }

    pub fn flattened_ids(&self) -> &BTreeMap<String, IdRef> {
        &self.flattened_ids
    }

    /// Whether no column is assigned.
    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }
}

/// WHERE-clause conditions of an update or delete, on top of the key.
#[derive(Debug, Clone, Default)]
pub struct Qualifier {
    additional: BTreeMap<String, PendingValue>,
    lock: BTreeMap<String, PendingValue>,
    optimistic_lock: bool,
}

impl Qualifier {
    /// Add a relationship-derived condition.
    pub fn add_additional(&mut self, column: impl Into<String>, value: PendingValue) {
        self.additional.insert(column.into(), value);
    }

    /// Add an optimistic lock condition.
    pub fn add_lock(&mut self, column: impl Into<String>, value: PendingValue) {
        self.lock.insert(column.into(), value);
    }

    /// Mark the qualifier as an optimistic lock.
    pub fn set_optimistic_lock(&mut self) {
        self.optimistic_lock = true;
    }

    pub fn additional(&self) -> &BTreeMap<String, PendingValue> {
        &self.additional
    }

    pub fn lock(&self) -> &BTreeMap<String, PendingValue> {
        &self.lock
    }

    pub fn is_optimistic_lock(&self) -> bool {
        self.optimistic_lock
    }

    /// Additional and lock conditions together; lock values win on clashes.
    pub fn conditions(&self) -> impl Iterator<Item = (&String, &PendingValue)> {
        self.additional
            .iter()
            .filter(|(column, _)| !self.lock.contains_key(*column))
            .chain(self.lock.iter())
    }
}

/// Kind-specific payload of a [`RowOp`].
#[derive(Debug, Clone)]
pub enum RowOpBody {
    Insert { values: Values },
    Update { values: Values, qualifier: Qualifier },
    Delete { qualifier: Qualifier },
}

/// One planned operation on one table row.
#[derive(Debug, Clone)]
pub struct RowOp {
    table: String,
    id: IdRef,
    effective: EffectiveId,
    body: RowOpBody,
}

impl RowOp {
    /// Create an empty operation of the given kind.
    pub fn new(effective: EffectiveId, kind: RowOpKind) -> Self {
        let body = match kind {
            RowOpKind::Insert => RowOpBody::Insert {
                values: Values::default(),
            },
            RowOpKind::Update => RowOpBody::Update {
                values: Values::default(),
                qualifier: Qualifier::default(),
            },
            RowOpKind::Delete => RowOpBody::Delete {
                qualifier: Qualifier::default(),
            },
        };
        Self {
            table: effective.table().to_string(),
            id: effective.id(),
            effective,
            body,
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Handle of the row identity.
    pub fn id(&self) -> IdRef {
        self.id
    }

    pub fn effective_id(&self) -> &EffectiveId {
        &self.effective
    }

    pub fn body(&self) -> &RowOpBody {
        &self.body
    }

    pub fn kind(&self) -> RowOpKind {
        match self.body {
            RowOpBody::Insert { .. } => RowOpKind::Insert,
            RowOpBody::Update { .. } => RowOpKind::Update,
            RowOpBody::Delete { .. } => RowOpKind::Delete,
        }
    }

    /// Column assignments; `None` for deletes.
    pub fn values(&self) -> Option<&Values> {
        match &self.body {
            RowOpBody::Insert { values } | RowOpBody::Update { values, .. } => Some(values),
            RowOpBody::Delete { .. } => None,
        }
    }

    pub fn values_mut(&mut self) -> Option<&mut Values> {
        match &mut self.body {
            RowOpBody::Insert { values } | RowOpBody::Update { values, .. } => Some(values),
            RowOpBody::Delete { .. } => None,
        }
    }

    /// WHERE-clause conditions; `None` for inserts.
    pub fn qualifier(&self) -> Option<&Qualifier> {
        match &self.body {
            RowOpBody::Update { qualifier, .. } | RowOpBody::Delete { qualifier } => Some(qualifier),
            RowOpBody::Insert { .. } => None,
        }
    }

    pub fn qualifier_mut(&mut self) -> Option<&mut Qualifier> {
        match &mut self.body {
            RowOpBody::Update { qualifier, .. } | RowOpBody::Delete { qualifier } => Some(qualifier),
            RowOpBody::Insert { .. } => None,
        }
    }

    /// Apply a requested kind, returning the merge decision.
    ///
    /// Escalating Update to Insert keeps the values; escalating Update to
    /// Delete keeps the qualifier.
    pub fn escalate(&mut self, requested: RowOpKind) -> KindMerge {
        let merge = self.kind().merge(requested);
        if let KindMerge::Escalate(kind) = merge {
            let body = std::mem::replace(
                &mut self.body,
                RowOpBody::Delete {
                    qualifier: Qualifier::default(),
                },
            );
            self.body = match (body, kind) {
                (RowOpBody::Update { values, .. }, RowOpKind::Insert) => RowOpBody::Insert { values },
                (RowOpBody::Update { qualifier, .. }, RowOpKind::Delete) => RowOpBody::Delete { qualifier },
                (body, _) => body,
            };
        }
        merge
    }

    /// Whether executing this operation would change nothing.
    pub fn is_noop(&self) -> bool {
        match &self.body {
            RowOpBody::Update { values, .. } => values.is_empty(),
            RowOpBody::Insert { .. } | RowOpBody::Delete { .. } => false,
        }
    }
}
