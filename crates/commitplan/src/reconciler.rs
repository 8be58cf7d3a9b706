//! Post-execution identity reconciliation.
//!
//! Once every batch has run and generated keys are recorded, each inserted
//! object gets its permanent identity. Intermediate rows of flattened paths are
//! re-keyed too, so the path index handed back to the caller only holds
//! permanent identities.

use crate::id_table::{IdRef, not_generated};
use crate::plan::CommitPlan;
use crate::registry::OpRef;
use crate::report::{FlattenedPath, IdChange, PropertyBackfill};
use crate::row_op::{RowOpBody, RowOpKind};
use commitplan_core::{Error, IdentityErrorKind, ObjectId, Result};
use std::collections::HashSet;

/// Identity updates produced by one commit.
#[derive(Debug, Default)]
pub(crate) struct Reconciliation {
    pub id_changes: Vec<IdChange>,
    pub backfills: Vec<PropertyBackfill>,
    pub flattened_paths: Vec<FlattenedPath>,
}

pub(crate) struct IdentityReconciler<'p, 'm> {
    plan: &'p mut CommitPlan<'m>,
    out: Reconciliation,
}

impl<'p, 'm> IdentityReconciler<'p, 'm> {
    pub fn new(plan: &'p mut CommitPlan<'m>) -> Self {
        Self {
            plan,
            out: Reconciliation::default(),
        }
    }

    #[tracing::instrument(level = "debug", skip(self), fields(ops = self.plan.len()))]
    pub fn reconcile(mut self) -> Result<Reconciliation> {
        let order = self.plan.order().to_vec();
        let mut removed = HashSet::new();

        for op in order {
            match self.plan.registry().op(op).kind() {
                RowOpKind::Insert => self.reconcile_insert(op)?,
                RowOpKind::Update => self.reconcile_update(op)?,
                RowOpKind::Delete => {
                    removed.insert(self.plan.registry().op(op).id());
                }
            }
        }

        let registry = self.plan.registry_mut();
        registry.forget_flattened(&removed);
        let ids = registry.ids();
        self.out.flattened_paths = registry
            .flattened_paths()
            .map(|(source, path, target)| {
                FlattenedPath::new(ids.object_id(source).clone(), path, ids.object_id(target).clone())
            })
            .collect();

        tracing::debug!(
            id_changes = self.out.id_changes.len(),
            backfills = self.out.backfills.len(),
            flattened_paths = self.out.flattened_paths.len(),
            "Identities reconciled"
        );
        Ok(self.out)
    }

    fn reconcile_insert(&mut self, op: OpRef) -> Result<()> {
        let r = self.plan.registry().op(op).id();
        let ids = self.plan.registry().ids();
        let old = ids.object_id(r).clone();
        if old.is_temporary() && !ids.has_replacement(r) {
            let column = self
                .plan
                .registry()
                .model()
                .table(self.plan.registry().op(op).table())?
                .primary_key_columns()
                .next()
                .map_or_else(String::new, |c| c.name.clone());
            return Err(not_generated(&old, &column));
        }

        let replacement = self.plan.registry_mut().ids_mut().replacement_id(r)?;
        self.reconcile_flattened(op)?;

        let Some(new) = replacement else {
            return Ok(());
        };
        if !old.is_temporary() || new == old {
            return Ok(());
        }
        self.plan.registry_mut().ids_mut().reassign(r, new.clone());
        if new.is_synthetic() {
            tracing::trace!(old = %old, new = %new, "Intermediate row re-keyed");
            return Ok(());
        }

        self.backfill(&new)?;
        tracing::debug!(old = %old, new = %new, "Identity changed");
        self.out.id_changes.push(IdChange { old, new });
        Ok(())
    }

    fn reconcile_update(&mut self, op: OpRef) -> Result<()> {
        let r = self.plan.registry().op(op).id();
        if self.plan.registry().ids().has_replacement(r) {
            self.plan.registry_mut().ids_mut().resolve_replacement(r)?;
        }
        self.reconcile_flattened(op)
    }

    /// Every intermediate row recorded on an insert or update must have a
    /// key by now.
    fn reconcile_flattened(&mut self, op: OpRef) -> Result<()> {
        let flattened: Vec<(String, IdRef)> = match self.plan.registry().op(op).body() {
            RowOpBody::Insert { values } | RowOpBody::Update { values, .. } => values
                .flattened_ids()
                .iter()
                .map(|(path, id)| (path.clone(), *id))
                .collect(),
            RowOpBody::Delete { .. } => return Ok(()),
        };

        for (path, row) in flattened {
            let ids = self.plan.registry_mut().ids_mut();
            let current = ids.object_id(row).clone();
            if !current.is_temporary() {
                continue;
            }
            let Some(new) = ids.replacement_id(row)? else {
                return Err(Error::identity(
                    IdentityErrorKind::FlattenedIdNotSet,
                    format!("Flattened id for path '{path}' is not set: {current}"),
                ));
            };
            tracing::trace!(path = %path, old = %current, new = %new, "Flattened id reconciled");
            ids.reassign(row, new);
        }
        Ok(())
    }

    /// Report primary-key-bound properties of the entity.
    fn backfill(&mut self, id: &ObjectId) -> Result<()> {
        let model = self.plan.registry().model();
        let Some(entity) = model.entity_for_id(id)? else {
            return Ok(());
        };
        let table = model.table(&entity.table)?;
        for attribute in &entity.attributes {
            if attribute.is_flattened() || !table.is_primary_key(attribute.column_name()) {
                continue;
            }
            if let Some(value) = id.key_value(attribute.column_name()) {
                self.out.backfills.push(PropertyBackfill {
                    id: id.clone(),
                    property: attribute.name.clone(),
                    value: value.clone(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CommitConfig;
    use crate::id_table::PendingValue;
    use crate::registry::RowOpRegistry;
    use crate::sorter::RowOpSorter;
    use commitplan_core::{AttributeMapping, ColumnMapping, EntityMapping, MappingModel, TableMapping, TableRelationship, Value};

    fn model() -> MappingModel {
        MappingModel::new()
            .with_table(
                TableMapping::new("ARTIST")
                    .with_column(ColumnMapping::pk("ARTIST_ID").generated(true))
                    .with_column(ColumnMapping::new("NAME"))
                    .with_relationship(
                        TableRelationship::to_one("info", "ARTIST_INFO")
                            .join("ARTIST_ID", "ARTIST_ID")
                            .dependent_pk(true),
                    ),
            )
            .with_table(
                TableMapping::new("ARTIST_INFO")
                    .with_column(ColumnMapping::pk("ARTIST_ID"))
                    .with_column(ColumnMapping::new("BIO")),
            )
            .with_table(TableMapping::new("CODE").with_column(ColumnMapping::pk("CODE")))
            .with_entity(EntityMapping::new("Artist", "ARTIST"))
            .with_entity(EntityMapping::new("Code", "CODE").with_attribute(AttributeMapping::new("code", "CODE")))
    }

    fn plan(registry: RowOpRegistry<'_>) -> CommitPlan<'_> {
        let order = RowOpSorter::new(registry.model()).sort(&registry).unwrap();
        CommitPlan::new(registry, order, CommitConfig::default())
    }

    #[test]
    fn test_insert_gets_permanent_id_and_one_notification() {
        let model = model();
        let mut registry = RowOpRegistry::new(&model, 10);
        let temp = ObjectId::temporary("Artist");
        let artist = registry.intern(&temp);
        registry.get_or_create_for(artist, RowOpKind::Insert).unwrap();
        registry
            .ids_mut()
            .set_replacement(artist, "ARTIST_ID", PendingValue::Value(Value::BigInt(7)));

        let mut plan = plan(registry);
        let out = IdentityReconciler::new(&mut plan).reconcile().unwrap();

        assert_eq!(out.id_changes.len(), 1);
        assert_eq!(out.id_changes[0].old, temp);
        assert_eq!(out.id_changes[0].new, ObjectId::single("Artist", "ARTIST_ID", 7_i64));
        assert!(out.backfills.is_empty());
        assert_eq!(plan.registry().ids().object_id(artist), &out.id_changes[0].new);
    }

    #[test]
    fn test_missing_key_is_fatal() {
        let model = model();
        let mut registry = RowOpRegistry::new(&model, 10);
        let artist = registry.intern(&ObjectId::temporary("Artist"));
        registry.get_or_create_for(artist, RowOpKind::Insert).unwrap();

        let mut plan = plan(registry);
        let err = IdentityReconciler::new(&mut plan).reconcile().unwrap_err();
        assert_eq!(err.identity_kind(), Some(IdentityErrorKind::PrimaryKeyNotGenerated));
    }

    #[test]
    fn test_meaningful_key_is_backfilled() {
        let model = model();
        let mut registry = RowOpRegistry::new(&model, 10);
        let code = registry.intern(&ObjectId::temporary("Code"));
        registry.get_or_create_for(code, RowOpKind::Insert).unwrap();
        registry
            .ids_mut()
            .set_replacement(code, "CODE", PendingValue::Value(Value::from("EUR")));

        let mut plan = plan(registry);
        let out = IdentityReconciler::new(&mut plan).reconcile().unwrap();

        assert_eq!(out.backfills.len(), 1);
        assert_eq!(out.backfills[0].property, "code");
        assert_eq!(out.backfills[0].value, Value::from("EUR"));
    }

    #[test]
    fn test_flattened_row_is_rekeyed() {
        let model = model();
        let mut registry = RowOpRegistry::new(&model, 10);
        let artist = registry.intern(&ObjectId::temporary("Artist"));
        let info = registry.intern(&ObjectId::temporary_row("ARTIST_INFO"));
        registry.get_or_create_for(artist, RowOpKind::Insert).unwrap();
        let info_op = registry.get_or_create("ARTIST_INFO", info, RowOpKind::Insert).unwrap();
        registry.op_mut(info_op).values_mut().unwrap().add_flattened_id("info", info);
        registry.mark_flattened_path(artist, "info", info);
        let pk = registry.ids().value_for(artist, "ARTIST_ID");
        registry.ids_mut().set_replacement(info, "ARTIST_ID", pk);
        registry
            .ids_mut()
            .set_replacement(artist, "ARTIST_ID", PendingValue::Value(Value::BigInt(3)));

        let mut plan = plan(registry);
        let out = IdentityReconciler::new(&mut plan).reconcile().unwrap();

        assert_eq!(out.id_changes.len(), 1);
        assert_eq!(out.flattened_paths.len(), 1);
        let entry = &out.flattened_paths[0];
        assert_eq!(entry.source, ObjectId::single("Artist", "ARTIST_ID", 3_i64));
        assert_eq!(entry.path, "info");
        assert!(!entry.target.is_temporary());
        assert_eq!(entry.target.key_value("ARTIST_ID"), Some(&Value::BigInt(3)));
    }

    #[test]
    fn test_unset_flattened_row_is_fatal() {
        let model = model();
        let mut registry = RowOpRegistry::new(&model, 10);
        let artist = registry.intern(&ObjectId::single("Artist", "ARTIST_ID", 1_i64));
        let info = registry.intern(&ObjectId::temporary_row("ARTIST_INFO"));
        let op = registry.get_or_create_for(artist, RowOpKind::Update).unwrap();
        let values = registry.op_mut(op).values_mut().unwrap();
        values.add("NAME", PendingValue::Value(Value::from("Monet")));
        values.add_flattened_id("info", info);

        let mut plan = plan(registry);
        let err = IdentityReconciler::new(&mut plan).reconcile().unwrap_err();
        assert_eq!(err.identity_kind(), Some(IdentityErrorKind::FlattenedIdNotSet));
    }

    #[test]
    fn test_deleted_rows_leave_the_path_index() {
        let model = model();
        let mut registry = RowOpRegistry::new(&model, 10);
        let artist = registry.intern(&ObjectId::single("Artist", "ARTIST_ID", 1_i64));
        let info = registry.intern(&ObjectId::permanent_row(
            "ARTIST_INFO",
            std::collections::BTreeMap::from([("ARTIST_ID".to_string(), Value::BigInt(1))]),
        ));
        registry.mark_flattened_path(artist, "info", info);
        registry.get_or_create_for(artist, RowOpKind::Delete).unwrap();

        let mut plan = plan(registry);
        let out = IdentityReconciler::new(&mut plan).reconcile().unwrap();
        assert!(out.flattened_paths.is_empty());
    }
}
