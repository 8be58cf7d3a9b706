//! Optimistic lock qualifiers.

use crate::id_table::PendingValue;
use crate::registry::{OpRef, RowOpRegistry};
use commitplan_core::{EntityMapping, Error, IdentityErrorKind, ObjectSnapshot, PropertyKind, Result};

/// Add the optimistic lock conditions of `entity` to an update or delete.
///
/// Locking attributes contribute their prior value. Locking to-one
/// relationships contribute the prior target's key on every foreign-key
/// column of the join. To-many relationships never take part.
///
/// Prior values come from `snapshot`; an entity with locking properties and
/// no snapshot fails with `MissingSnapshot`.
pub(crate) fn build_lock_qualifier(
    registry: &mut RowOpRegistry<'_>,
    op: OpRef,
    entity: &EntityMapping,
    snapshot: Option<&ObjectSnapshot>,
) -> Result<()> {
    let model = registry.model();
    let locks_anything = entity.properties().any(|property| match property {
        PropertyKind::Attribute(attribute) => attribute.used_for_locking && !attribute.is_flattened(),
        PropertyKind::ToOne(relationship) => relationship.used_for_locking && !relationship.is_flattened(),
        PropertyKind::ToMany(_) => false,
    });
    let empty = ObjectSnapshot::default();
    let snapshot = match snapshot {
        Some(snapshot) => snapshot,
        None if locks_anything => {
            let op = registry.op(op);
            return Err(Error::identity(
                IdentityErrorKind::MissingSnapshot,
                format!(
                    "{} {} of entity '{}' uses optimistic locking but no prior snapshot was supplied",
                    op.kind(),
                    registry.ids().object_id(op.id()),
                    entity.name
                ),
            ));
        }
        None => &empty,
    };
    let mut conditions = Vec::new();

    for property in entity.properties() {
        match property {
            PropertyKind::Attribute(attribute) => {
                if attribute.used_for_locking && !attribute.is_flattened() {
                    conditions.push((
                        attribute.column_name().to_string(),
                        PendingValue::Value(snapshot.attribute(&attribute.name)),
                    ));
                }
            }
            PropertyKind::ToOne(relationship) => {
                if !relationship.used_for_locking || relationship.is_flattened() {
                    continue;
                }
                let db_rel = model.table_relationship(&entity.table, relationship.first_hop())?;
                let table = model.table(&entity.table)?;
                let prior = snapshot
                    .to_one_target(&relationship.name)
                    .map(|target| registry.intern(target));
                for join in &db_rel.joins {
                    if table.is_primary_key(&join.source) {
                        continue;
                    }
                    let value = match prior {
                        Some(target) => registry.ids().value_for(target, &join.target),
                        None => PendingValue::null(),
                    };
                    conditions.push((join.source.clone(), value));
                }
            }
            PropertyKind::ToMany(_) => {}
        }
    }

    tracing::trace!(
        entity = %entity.name,
        conditions = conditions.len(),
        "Optimistic lock qualifier built"
    );
    if let Some(qualifier) = registry.op_mut(op).qualifier_mut() {
        for (column, value) in conditions {
            qualifier.add_lock(column, value);
        }
        qualifier.set_optimistic_lock();
    }
    Ok(())
}
