//! Per-root dispatch of graph changes.

use crate::id_table::IdRef;
use crate::lock::build_lock_qualifier;
use crate::projection::Projector;
use crate::registry::{OpRef, RowOpRegistry};
use crate::row_op::RowOpKind;
use commitplan_core::{ArcId, Error, MappingError, ObjectSnapshot, Result, Value};
use std::collections::HashMap;

/// A change of one root object, with identities interned.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum NodeChange {
    Property { property: String, new: Value },
    Arc { target: IdRef, arc: ArcId, created: bool },
}

/// All changes of one root object in one commit.
#[derive(Debug, Clone)]
pub(crate) struct RootChanges {
    pub id: IdRef,
    pub kind: RowOpKind,
    pub changes: Vec<NodeChange>,
}

/// Turns the changes of each root object into row operations.
pub(crate) struct RootProcessor<'a, 'm> {
    registry: &'a mut RowOpRegistry<'m>,
    snapshots: &'a HashMap<IdRef, ObjectSnapshot>,
}

impl<'a, 'm> RootProcessor<'a, 'm> {
    pub fn new(registry: &'a mut RowOpRegistry<'m>, snapshots: &'a HashMap<IdRef, ObjectSnapshot>) -> Self {
        Self { registry, snapshots }
    }

    pub fn process(&mut self, root: &RootChanges) -> Result<()> {
        tracing::trace!(
            id = %self.registry.ids().object_id(root.id),
            kind = %root.kind,
            changes = root.changes.len(),
            "Processing root object"
        );
        match root.kind {
            RowOpKind::Insert => self.process_insert(root),
            RowOpKind::Update => self.process_update(root),
            RowOpKind::Delete => self.process_delete(root),
        }
    }

    fn process_insert(&mut self, root: &RootChanges) -> Result<()> {
        self.registry.ensure_writable(root.id)?;
        self.registry.get_or_create_for(root.id, RowOpKind::Insert)?;
        self.project(root, RowOpKind::Insert, true)
    }

    fn process_update(&mut self, root: &RootChanges) -> Result<()> {
        let op = self.registry.get_or_create_for(root.id, RowOpKind::Update)?;
        self.project(root, RowOpKind::Update, true)?;
        self.lock(root.id, op)
    }

    fn process_delete(&mut self, root: &RootChanges) -> Result<()> {
        let model = self.registry.model();
        if let Some(entity) = model.entity_for_id(self.registry.ids().object_id(root.id))? {
            if entity.read_only {
                return Err(Error::Mapping(MappingError::read_only(&entity.name)));
            }
        }
        let op = self.registry.get_or_create_for(root.id, RowOpKind::Delete)?;
        self.project(root, RowOpKind::Delete, false)?;

        for row in self.registry.flattened_ids(root.id) {
            let table = self.registry.table_of(row)?;
            if model.table(table)?.no_delete {
                tracing::trace!(table = table, "Shared intermediate row kept");
                continue;
            }
            tracing::debug!(table = table, "Intermediate row deleted with its owner");
            self.registry.get_or_create(table, row, RowOpKind::Delete)?;
        }

        self.lock(root.id, op)
    }

    fn project(&mut self, root: &RootChanges, kind: RowOpKind, with_properties: bool) -> Result<()> {
        let mut projector = Projector::new(self.registry, root.id, kind)?;
        for change in &root.changes {
            match change {
                NodeChange::Property { property, new } => {
                    if with_properties {
                        projector.property_changed(root.id, property, new)?;
                    }
                }
                NodeChange::Arc { target, arc, created } => {
                    projector.arc_changed(root.id, *target, arc, *created)?;
                }
            }
        }
        Ok(())
    }

    fn lock(&mut self, id: IdRef, op: OpRef) -> Result<()> {
        let model = self.registry.model();
        let Some(entity) = model.entity_for_id(self.registry.ids().object_id(id))? else {
            return Ok(());
        };
        if !entity.optimistic_locking || self.registry.op(op).qualifier().is_none() {
            return Ok(());
        }
        build_lock_qualifier(self.registry, op, entity, self.snapshots.get(&id))
    }
}
