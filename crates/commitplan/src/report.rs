//! Outcome of an executed commit.

use crate::plan::RowOpSummary;
use crate::row_op::RowOpKind;
use commitplan_core::{ObjectId, Result, Value};
use serde::{Deserialize, Serialize};

/// An object's identity was replaced by its permanent one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdChange {
    pub old: ObjectId,
    pub new: ObjectId,
}

/// A primary-key-bound property whose value became known during the commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyBackfill {
    /// Permanent identity of the object.
    pub id: ObjectId,
    pub property: String,
    pub value: Value,
}

/// A locked update or delete that matched no row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockConflict {
    pub table: String,
    pub kind: RowOpKind,
    pub id: ObjectId,
    /// The predicate that matched nothing (key plus qualifier).
    pub qualifier: Vec<String>,
}

/// One entry of the flattened-path index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlattenedPath {
    /// The row the path starts from.
    pub source: ObjectId,
    /// Relationship path, e.g. `toArtistInfo` or `a.b`.
    pub path: String,
    /// Intermediate row realizing the path.
    pub target: ObjectId,
}

impl FlattenedPath {
    pub fn new(source: ObjectId, path: impl Into<String>, target: ObjectId) -> Self {
        Self {
            source,
            path: path.into(),
            target,
        }
    }
}

/// Everything the caller needs to apply after a commit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommitReport {
    /// Identity-change notifications, in execution order.
    pub id_changes: Vec<IdChange>,
    pub backfills: Vec<PropertyBackfill>,
    pub inserted: u64,
    pub updated: u64,
    pub deleted: u64,
    /// Optimistic-lock conflicts. Reported, never retried.
    pub lock_conflicts: Vec<LockConflict>,
    /// Compiled operations, when archiving is enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archived: Option<Vec<RowOpSummary>>,
    /// Flattened-path index after the commit, keyed by permanent identities.
    pub flattened_paths: Vec<FlattenedPath>,
}

impl CommitReport {
    /// Total rows affected.
    pub fn total(&self) -> u64 {
        self.inserted + self.updated + self.deleted
    }

    pub fn has_conflicts(&self) -> bool {
        !self.lock_conflicts.is_empty()
    }

    pub(crate) fn record_affected(&mut self, kind: RowOpKind, count: u64) {
        match kind {
            RowOpKind::Insert => self.inserted += count,
            RowOpKind::Update => self.updated += count,
            RowOpKind::Delete => self.deleted += count,
        }
    }

    /// Serialize the report to JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
