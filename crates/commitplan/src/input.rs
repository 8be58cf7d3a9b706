//! Input of one commit.

use crate::report::FlattenedPath;
use commitplan_core::{GraphChange, ObjectId, ObjectSnapshot};
use std::collections::HashMap;

/// Everything the compiler needs to know about one commit.
///
/// `changes` is the graph diff in the order the changes happened. Snapshots
/// hold the committed state of modified and deleted objects; they are only
/// consulted for optimistic lock qualifiers. `flattened_paths` carries the
/// path index of already persistent objects from earlier commits.
#[derive(Debug, Clone, Default)]
pub struct CommitInput {
    pub changes: Vec<GraphChange>,
    pub snapshots: HashMap<ObjectId, ObjectSnapshot>,
    pub flattened_paths: Vec<FlattenedPath>,
}

impl CommitInput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an input from a list of changes.
    pub fn from_changes(changes: impl IntoIterator<Item = GraphChange>) -> Self {
        Self {
            changes: changes.into_iter().collect(),
            ..Self::default()
        }
    }

    /// Append a change (builder pattern).
    #[must_use]
    pub fn with_change(mut self, change: GraphChange) -> Self {
        self.changes.push(change);
        self
    }

    /// Record the committed state of an object (builder pattern).
    #[must_use]
    pub fn with_snapshot(mut self, id: ObjectId, snapshot: ObjectSnapshot) -> Self {
        self.snapshots.insert(id, snapshot);
        self
    }

    /// Seed one flattened-path entry (builder pattern).
    #[must_use]
    pub fn with_flattened_path(mut self, path: FlattenedPath) -> Self {
        self.flattened_paths.push(path);
        self
    }

    /// Append a change.
    pub fn push(&mut self, change: GraphChange) {
        self.changes.push(change);
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}
