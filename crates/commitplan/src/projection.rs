//! Projection of property and arc changes onto row operations.
//!
//! A [`Projector`] is created per root object with the kind of the root's own
//! row operation. Property changes become column assignments, possibly on an
//! intermediate row when the attribute is flattened. Arc changes become key
//! propagation across each join of the relationship, walking every hop of a
//! flattened path and synthesizing intermediate rows where none is known yet.

use crate::arc::ArcTarget;
use crate::id_table::{IdRef, PendingValue};
use crate::registry::{OpRef, RowOpRegistry};
use crate::row_op::RowOpKind;
use commitplan_core::{
    ArcId, EntityMapping, Error, MappingError, MappingErrorKind, ObjectId, Result, TableRelationship, Value,
    DB_PREFIX,
};
use std::collections::BTreeMap;

/// One relationship hop: source table and the relationship leaving it.
type Hop<'m> = (String, &'m TableRelationship);

/// Result of walking a flattened path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FlattenedOutcome {
    /// `false` when the walk was deferred to the other side of the arc.
    pub processed: bool,
    /// Row reached by the last hop.
    pub target: Option<IdRef>,
}

impl FlattenedOutcome {
    fn skipped() -> Self {
        Self {
            processed: false,
            target: None,
        }
    }
}

/// Applies the changes of one root object to the registry.
pub(crate) struct Projector<'r, 'm> {
    registry: &'r mut RowOpRegistry<'m>,
    entity: Option<&'m EntityMapping>,
    default_kind: RowOpKind,
}

impl<'r, 'm> Projector<'r, 'm> {
    pub fn new(registry: &'r mut RowOpRegistry<'m>, root: IdRef, default_kind: RowOpKind) -> Result<Self> {
        let model = registry.model();
        let entity = model.entity_for_id(registry.ids().object_id(root))?;
        Ok(Self {
            registry,
            entity,
            default_kind,
        })
    }

    /// Apply an attribute change of the root object.
    pub fn property_changed(&mut self, id: IdRef, property: &str, new: &Value) -> Result<()> {
        let model = self.registry.model();
        let Some(entity) = self.entity else {
            // synthetic rows carry column names directly
            let table = self.registry.table_of(id)?;
            return self.assign(table, id, property, new);
        };
        if entity.read_only {
            return Err(Error::Mapping(MappingError::read_only(&entity.name)));
        }
        let attribute = entity.attribute(property).ok_or_else(|| {
            Error::mapping(
                MappingErrorKind::UnknownProperty,
                &entity.name,
                format!("Entity '{}' has no attribute '{property}'", entity.name),
            )
        })?;

        let (row, table) = match attribute.relationship_path() {
            Some(path) => {
                let hops = model.resolve_path(&entity.table, path)?;
                let outcome = self.process_flattened_path(id, None, &hops, false, !new.is_null())?;
                let table: &'m str = match hops.last() {
                    Some((_, rel)) => {
                        let rel: &'m TableRelationship = *rel;
                        &rel.target
                    }
                    None => &entity.table,
                };
                match outcome.target {
                    Some(row) => (row, table),
                    None => return Ok(()),
                }
            }
            None => (id, entity.table.as_str()),
        };
        self.assign(table, row, attribute.column_name(), new)
    }

    fn assign(&mut self, table: &str, row: IdRef, column: &str, new: &Value) -> Result<()> {
        let model = self.registry.model();
        if model.table(table)?.is_primary_key(column) && !new.is_null() && !new.is_zero() {
            self.registry
                .ids_mut()
                .set_replacement(row, column, PendingValue::Value(new.clone()));
        }
        if let Some(op) = self.registry.find_in(table, row) {
            self.registry.ensure_writable(row)?;
            if let Some(values) = self.registry.op_mut(op).values_mut() {
                values.add(column, PendingValue::Value(new.clone()));
            }
        }
        Ok(())
    }

    /// Apply a relationship change observed on `source`.
    ///
    /// An arc of a mapped relationship that names no reverse gets the reverse
    /// from the mapping, so both sides of one edit deduplicate.
    pub fn arc_changed(&mut self, source: IdRef, target: IdRef, arc: &ArcId, created: bool) -> Result<()> {
        let model = self.registry.model();
        let relationship = self.entity.and_then(|e| e.relationship(&arc.forward));
        let arc = match (self.entity, relationship) {
            (Some(entity), Some(rel)) if arc.reverse.is_none() => match model.reverse_entity_relationship(entity, rel) {
                Some(reverse) => ArcId::with_reverse(arc.forward.clone(), reverse.name.clone()),
                None => arc.clone(),
            },
            _ => arc.clone(),
        };

        let arc_target = ArcTarget::new(source, target, arc.clone(), !created);
        if self.registry.is_processed(&arc_target.reversed()) {
            tracing::trace!(
                arc = %arc.forward,
                source = %self.registry.ids().object_id(source),
                "Reverse arc already processed, skipping"
            );
            return Ok(());
        }

        let source_table = self.registry.table_of(source)?;

        match relationship {
            Some(rel) if rel.is_flattened() => {
                let hops = model.resolve_path(source_table, &rel.db_path)?;
                let outcome = self.process_flattened_path(source, Some(target), &hops, true, created)?;
                if outcome.processed {
                    self.registry.mark_processed(arc_target);
                }
            }
            Some(rel) => {
                let db_rel = model.table_relationship(source_table, rel.first_hop())?;
                self.process_relationship(source_table, db_rel, source, target, created)?;
                self.registry.mark_processed(arc_target);
            }
            None => {
                let Some(name) = arc.forward.strip_prefix(DB_PREFIX) else {
                    let owner = self.entity.map_or(source_table, |e| e.name.as_str());
                    return Err(Error::mapping(
                        MappingErrorKind::UnknownRelationship,
                        owner,
                        format!("'{owner}' has no relationship '{}'", arc.forward),
                    ));
                };
                let db_rel = model.table_relationship(source_table, name)?;
                self.process_relationship(source_table, db_rel, source, target, created)?;
            }
        }
        Ok(())
    }

    /// Walk a relationship path from `id`, resolving or synthesizing the row
    /// behind every hop and propagating keys across each hop's joins.
    ///
    /// With `ends_at_target` the last hop lands on `final_target`; otherwise
    /// (attribute paths) every hop is intermediate.
    pub(crate) fn process_flattened_path(
        &mut self,
        id: IdRef,
        final_target: Option<IdRef>,
        hops: &[Hop<'m>],
        ends_at_target: bool,
        add: bool,
    ) -> Result<FlattenedOutcome> {
        if let Some(final_target) = final_target {
            // the other side knows the intermediate rows; let it do the work
            if !self.registry.has_flattened_ids(id) && self.registry.has_flattened_ids(final_target) {
                tracing::trace!(
                    source = %self.registry.ids().object_id(id),
                    "Deferring flattened path to the reverse side"
                );
                return Ok(FlattenedOutcome::skipped());
            }
        }

        let mut path = String::new();
        let mut source = id;
        let mut reached = None;

        for (i, (source_table, rel)) in hops.iter().enumerate() {
            if !path.is_empty() {
                path.push('.');
            }
            path.push_str(&rel.name);
            let is_last = ends_at_target && i + 1 == hops.len();

            let mut target = if is_last {
                final_target
            } else if rel.to_many {
                None
            } else {
                self.registry.flattened_id(id, &path)
            };

            if target.is_none() {
                if let Some(final_id) = final_target {
                    if let Some(key) = self.derive_key_from_final(&rel.target, final_id, &hops[i + 1..])? {
                        let derived = self.registry.intern(&ObjectId::permanent_row(&rel.target, key));
                        if !rel.to_many {
                            self.registry.mark_flattened_path(id, path.clone(), derived);
                        }
                        target = Some(derived);
                    }
                }
            }

            let target = match target {
                Some(existing) => {
                    if !is_last {
                        let kind = if add { RowOpKind::Update } else { self.default_kind };
                        self.registry.get_or_create(&rel.target, existing, kind)?;
                    }
                    existing
                }
                None => self.synthesize_row(id, &path, rel, add)?,
            };

            let as_addition = self.process_as_addition(source_table, rel, add)?;
            self.process_relationship(source_table, rel, source, target, as_addition)?;
            source = target;
            reached = Some(target);
        }

        Ok(FlattenedOutcome {
            processed: true,
            target: reached,
        })
    }

    fn synthesize_row(&mut self, owner: IdRef, path: &str, rel: &TableRelationship, add: bool) -> Result<IdRef> {
        let row = self.registry.intern(&ObjectId::temporary_row(&rel.target));
        tracing::debug!(table = %rel.target, path = path, add = add, "Intermediate row synthesized");
        if rel.to_many {
            let kind = if add { RowOpKind::Insert } else { RowOpKind::Delete };
            self.registry.get_or_create(&rel.target, row, kind)?;
        } else {
            self.registry.mark_flattened_path(owner, path, row);
            let kind = if add { RowOpKind::Insert } else { RowOpKind::Update };
            let op = self.registry.get_or_create(&rel.target, row, kind)?;
            if let Some(values) = self.registry.op_mut(op).values_mut() {
                values.add_flattened_id(path, row);
            }
        }
        Ok(row)
    }

    /// Key of the row of `table` derived from the final target's key, when
    /// the rest of the path is a chain of to-one primary-key joins.
    fn derive_key_from_final(
        &self,
        table: &str,
        final_target: IdRef,
        remaining: &[Hop<'m>],
    ) -> Result<Option<BTreeMap<String, Value>>> {
        let model = self.registry.model();
        let Some(final_key) = self.registry.ids().object_id(final_target).snapshot() else {
            return Ok(None);
        };

        // key column of `table` -> matching column of the current hop's table
        let mut columns: BTreeMap<String, String> = model
            .table(table)?
            .primary_key_columns()
            .map(|c| (c.name.clone(), c.name.clone()))
            .collect();
        if columns.is_empty() {
            return Ok(None);
        }

        for (source_table, rel) in remaining {
            let reverse = model.reverse_relationship(source_table, rel);
            let pk_to_pk = rel.to_dependent_pk || reverse.is_some_and(|r| r.to_dependent_pk);
            if !pk_to_pk || rel.to_many {
                return Ok(None);
            }
            let source_mapping = model.table(source_table)?;
            let target_mapping = model.table(&rel.target)?;
            let mut next = BTreeMap::new();
            for join in &rel.joins {
                if !source_mapping.is_primary_key(&join.source) || !target_mapping.is_primary_key(&join.target) {
                    return Ok(None);
                }
                for (key_column, current) in &columns {
                    if *current == join.source {
                        next.insert(key_column.clone(), join.target.clone());
                    }
                }
            }
            if next.len() != columns.len() {
                return Ok(None);
            }
            columns = next;
        }

        let mut key = BTreeMap::new();
        for (key_column, final_column) in columns {
            match final_key.get(&final_column) {
                Some(value) if !value.is_null() => {
                    key.insert(key_column, value.clone());
                }
                _ => return Ok(None),
            }
        }
        Ok(Some(key))
    }

    /// Removals across primary-key-to-primary-key joins still carry the
    /// values, so the deleted row's key is known.
    fn process_as_addition(&self, source_table: &str, rel: &TableRelationship, add: bool) -> Result<bool> {
        if add {
            return Ok(true);
        }
        let model = self.registry.model();
        let source_mapping = model.table(source_table)?;
        let target_mapping = model.table(&rel.target)?;
        Ok(rel
            .joins
            .iter()
            .all(|j| source_mapping.is_primary_key(&j.source) && target_mapping.is_primary_key(&j.target)))
    }

    /// Propagate key values across every join of one relationship.
    pub(crate) fn process_relationship(
        &mut self,
        source_table: &str,
        rel: &TableRelationship,
        source: IdRef,
        target: IdRef,
        add: bool,
    ) -> Result<()> {
        let model = self.registry.model();
        let source_mapping = model.table(source_table)?;
        let target_mapping = model.table(&rel.target)?;

        for join in &rel.joins {
            let source_pk = source_mapping.is_primary_key(&join.source);
            let target_pk = target_mapping.is_primary_key(&join.target);

            let value;
            let column;
            let op;
            let mut keyed = None;
            let process_delete;

            if source_pk != target_pk {
                // master key into the foreign key of the other side
                process_delete = true;
                if source_pk {
                    value = self.registry.ids().value_for(source, &join.source);
                    op = Some(self.registry.get_or_create(&rel.target, target, RowOpKind::Update)?);
                    column = join.target.as_str();
                } else {
                    value = self.registry.ids().value_for(target, &join.target);
                    op = Some(self.registry.get_or_create(source_table, source, self.default_kind)?);
                    column = join.source.as_str();
                }
            } else if rel.to_dependent_pk {
                process_delete = false;
                value = self.registry.ids().value_for(source, &join.source);
                column = join.target.as_str();
                keyed = Some((target, target_pk));
                op = if rel.to_many {
                    tracing::trace!(relationship = %rel.name, "To-many dependent key relationship, no row values");
                    None
                } else {
                    Some(self.registry.get_or_create(&rel.target, target, RowOpKind::Update)?)
                };
            } else {
                process_delete = false;
                value = self.registry.ids().value_for(target, &join.target);
                column = join.source.as_str();
                keyed = Some((source, source_pk));
                let reverse_to_many = model
                    .reverse_relationship(source_table, rel)
                    .is_some_and(|r| r.to_many);
                op = if reverse_to_many {
                    None
                } else {
                    Some(self.registry.get_or_create(source_table, source, self.default_kind)?)
                };
            }

            if let Some((id, true)) = keyed {
                self.registry.ids_mut().set_replacement(id, column, value.clone());
            }
            if let Some(op) = op {
                self.propagate(op, column, add, value, process_delete)?;
            }
        }
        Ok(())
    }

    fn propagate(&mut self, op: OpRef, column: &str, add: bool, value: PendingValue, process_delete: bool) -> Result<()> {
        match self.registry.op(op).kind() {
            RowOpKind::Insert | RowOpKind::Update => {
                let row = self.registry.op(op).id();
                self.registry.ensure_writable(row)?;
                if let Some(values) = self.registry.op_mut(op).values_mut() {
                    values.add(column, if add { value } else { PendingValue::null() });
                }
            }
            RowOpKind::Delete => {
                if process_delete {
                    if let Some(qualifier) = self.registry.op_mut(op).qualifier_mut() {
                        qualifier.add_additional(column, value);
                    }
                }
            }
        }
        Ok(())
    }
}
