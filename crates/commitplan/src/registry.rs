//! Commit-scoped row operation registry.
//!
//! The registry is the single owner of everything one commit accumulates:
//! interned identities, planned row operations, the processed-arcs set used
//! to deduplicate bidirectional edits, and the flattened-path index mapping
//! `(source row, relationship path)` to the intermediate row realizing it.
//! Nothing here is process-global; independent commits use independent
//! registries.

use crate::arc::ArcTarget;
use crate::effective_id::EffectiveId;
use crate::id_table::{IdRef, IdTable};
use crate::row_op::{KindMerge, RowOp, RowOpKind};
use commitplan_core::{Error, MappingError, MappingModel, ObjectId, Result};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

/// Handle of a registered row operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpRef(usize);

impl OpRef {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for OpRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op{}", self.0)
    }
}

/// Get-or-create store of row operations for one commit.
#[derive(Debug)]
pub struct RowOpRegistry<'m> {
    model: &'m MappingModel,
    ids: IdTable,
    ops: Vec<RowOp>,
    by_ref: HashMap<(String, IdRef), OpRef>,
    by_effective: HashMap<EffectiveId, OpRef>,
    processed_arcs: HashSet<ArcTarget>,
    flattened: HashMap<IdRef, BTreeMap<String, IdRef>>,
}

impl<'m> RowOpRegistry<'m> {
    /// Create an empty registry.
    pub fn new(model: &'m MappingModel, max_supplier_depth: usize) -> Self {
        Self {
            model,
            ids: IdTable::new(max_supplier_depth),
            ops: Vec::new(),
            by_ref: HashMap::new(),
            by_effective: HashMap::new(),
            processed_arcs: HashSet::new(),
            flattened: HashMap::new(),
        }
    }

    pub fn model(&self) -> &'m MappingModel {
        self.model
    }

    pub fn ids(&self) -> &IdTable {
        &self.ids
    }

    pub fn ids_mut(&mut self) -> &mut IdTable {
        &mut self.ids
    }

    /// Intern an identity.
    pub fn intern(&mut self, id: &ObjectId) -> IdRef {
        self.ids.intern(id)
    }

    /// Table the row of an identity lives in.
    pub fn table_of(&self, id: IdRef) -> Result<&'m str> {
        let model = self.model;
        Ok(model.table_for_id(self.ids.object_id(id))?.name.as_str())
    }

    /// Fail if values are about to be written to a read-only entity.
    pub fn ensure_writable(&self, id: IdRef) -> Result<()> {
        if let Some(entity) = self.model.entity_for_id(self.ids.object_id(id))? {
            if entity.read_only {
                return Err(Error::Mapping(MappingError::read_only(&entity.name)));
            }
        }
        Ok(())
    }

    /// Find or register the operation for a row, merging the requested kind.
    pub fn get_or_create(&mut self, table: &str, id: IdRef, kind: RowOpKind) -> Result<OpRef> {
        let op = match self.by_ref.get(&(table.to_string(), id)).copied() {
            Some(op) => op,
            None => {
                let effective = EffectiveId::new(table, id, &self.ids)?;
                if let Some(op) = self.by_effective.get(&effective).copied() {
                    tracing::trace!(
                        table = table,
                        id = %self.ids.object_id(id),
                        existing = %self.ids.object_id(self.ops[op.0].id()),
                        "Row already planned under an equal key"
                    );
                    self.by_ref.insert((table.to_string(), id), op);
                    op
                } else {
                    let op = OpRef(self.ops.len());
                    tracing::trace!(table = table, id = %self.ids.object_id(id), kind = %kind, "Row operation registered");
                    self.ops.push(RowOp::new(effective.clone(), kind));
                    self.by_effective.insert(effective, op);
                    self.by_ref.insert((table.to_string(), id), op);
                    return Ok(op);
                }
            }
        };

        let existing = self.ops[op.0].kind();
        match self.ops[op.0].escalate(kind) {
            KindMerge::Keep => {}
            KindMerge::Escalate(to) => {
                tracing::debug!(table = table, from = %existing, to = %to, "Row operation kind escalated");
            }
            KindMerge::Conflict => {
                tracing::debug!(
                    table = table,
                    existing = %existing,
                    requested = %kind,
                    "Conflicting row operation kinds, keeping existing"
                );
            }
        }
        Ok(op)
    }

    /// Find or register the operation for an identity's own table.
    pub fn get_or_create_for(&mut self, id: IdRef, kind: RowOpKind) -> Result<OpRef> {
        let table = self.table_of(id)?;
        self.get_or_create(table, id, kind)
    }

    /// Operation already registered for an identity's own table.
    pub fn find(&self, id: IdRef) -> Result<Option<OpRef>> {
        let table = self.table_of(id)?;
        Ok(self.find_in(table, id))
    }

    /// Operation already registered for a row of `table`.
    pub fn find_in(&self, table: &str, id: IdRef) -> Option<OpRef> {
        self.by_ref.get(&(table.to_string(), id)).copied()
    }

    pub fn op(&self, op: OpRef) -> &RowOp {
        &self.ops[op.0]
    }

    pub fn op_mut(&mut self, op: OpRef) -> &mut RowOp {
        &mut self.ops[op.0]
    }

    /// All operations in registration order.
    pub fn ops(&self) -> impl Iterator<Item = (OpRef, &RowOp)> {
        self.ops.iter().enumerate().map(|(i, op)| (OpRef(i), op))
    }

    /// Number of registered operations.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Whether an edit has been processed in this commit.
    pub fn is_processed(&self, arc: &ArcTarget) -> bool {
        self.processed_arcs.contains(arc)
    }

    /// Record an edit as processed.
    pub fn mark_processed(&mut self, arc: ArcTarget) {
        self.processed_arcs.insert(arc);
    }

    /// Intermediate row recorded for `(source, path)`.
    pub fn flattened_id(&self, source: IdRef, path: &str) -> Option<IdRef> {
        self.flattened.get(&source).and_then(|paths| paths.get(path)).copied()
    }

    /// All intermediate rows recorded for a source row, in path order.
    pub fn flattened_ids(&self, source: IdRef) -> Vec<IdRef> {
        self.flattened
            .get(&source)
            .map(|paths| paths.values().copied().collect())
            .unwrap_or_default()
    }

    /// Whether any intermediate row is recorded for a source row.
    pub fn has_flattened_ids(&self, source: IdRef) -> bool {
        self.flattened.get(&source).is_some_and(|paths| !paths.is_empty())
    }

    /// Record the intermediate row realizing `(source, path)`.
    pub fn mark_flattened_path(&mut self, source: IdRef, path: impl Into<String>, target: IdRef) {
        let path = path.into();
        tracing::trace!(source = %self.ids.object_id(source), path = %path, target = %self.ids.object_id(target), "Flattened path marked");
        self.flattened.entry(source).or_default().insert(path, target);
    }

    /// The whole flattened-path index.
    pub fn flattened_paths(&self) -> impl Iterator<Item = (IdRef, &str, IdRef)> {
        self.flattened
            .iter()
            .flat_map(|(source, paths)| paths.iter().map(move |(path, target)| (*source, path.as_str(), *target)))
    }

    /// Drop every path entry touching one of `removed`.
    pub fn forget_flattened(&mut self, removed: &HashSet<IdRef>) {
        self.flattened.retain(|source, _| !removed.contains(source));
        for paths in self.flattened.values_mut() {
            paths.retain(|_, target| !removed.contains(target));
        }
        self.flattened.retain(|_, paths| !paths.is_empty());
    }
}
