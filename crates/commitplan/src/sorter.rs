//! Dependency-respecting execution order.
//!
//! Tables are ranked from the mapping: a table holding a foreign key depends
//! on the table owning the referenced key, and a dependent-key table depends
//! on its master. Inserts and updates run parents first, deletes run children
//! first. Within one table, inserts are additionally ordered by the deferred
//! values they read from each other (self-referencing rows).
//!
//! Operations are registered before every key is known, so an insert and a
//! delete may turn out to address the same row once keys resolve. A link row
//! that is removed and re-created cancels out; any other re-inserted key has
//! its delete run ahead of all inserts.

use crate::id_table::{IdRef, PendingValue};
use crate::registry::{OpRef, RowOpRegistry};
use crate::row_op::RowOpKind;
use commitplan_core::{MappingModel, OrderingError, Result, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

/// Orders row operations for execution.
#[derive(Debug)]
pub struct RowOpSorter {
    ranks: HashMap<String, usize>,
}

impl RowOpSorter {
    /// Rank every table of the model.
    pub fn new(model: &MappingModel) -> Self {
        let dependencies = table_dependencies(model);
        let ranks = rank_tables(&dependencies);
        Self { ranks }
    }

    /// Position of a table in parent-first order.
    pub fn rank(&self, table: &str) -> usize {
        self.ranks.get(table).copied().unwrap_or(usize::MAX)
    }

    /// Execution order of all non-empty operations of a registry.
    #[tracing::instrument(level = "debug", skip(self, registry))]
    pub fn sort(&self, registry: &RowOpRegistry<'_>) -> Result<Vec<OpRef>> {
        let mut inserts = Vec::new();
        let mut updates = Vec::new();
        let mut deletes = Vec::new();

        for (op, row) in registry.ops() {
            if row.is_noop() {
                tracing::trace!(table = row.table(), "Skipping update without values");
                continue;
            }
            match row.kind() {
                RowOpKind::Insert => inserts.push(op),
                RowOpKind::Update => updates.push(op),
                RowOpKind::Delete => deletes.push(op),
            }
        }

        let replaced = pair_replaced_rows(registry, &inserts, &deletes)?;
        inserts.retain(|op| !replaced.cancelled.contains(op));
        let (mut deletes_first, mut deletes): (Vec<OpRef>, Vec<OpRef>) = deletes
            .into_iter()
            .filter(|op| !replaced.cancelled.contains(op))
            .partition(|op| replaced.deletes_first.contains(op));

        let by_table = |op: &OpRef| {
            let table = registry.op(*op).table();
            (self.rank(table), table.to_string())
        };
        // stable sorts keep registration order within a table
        inserts.sort_by_key(by_table);
        updates.sort_by_key(by_table);
        deletes_first.sort_by_key(|op| std::cmp::Reverse(by_table(op)));
        deletes.sort_by_key(|op| std::cmp::Reverse(by_table(op)));

        let inserts = order_rows(registry, &inserts)?;

        tracing::debug!(
            inserts = inserts.len(),
            updates = updates.len(),
            deletes = deletes_first.len() + deletes.len(),
            cancelled = replaced.cancelled.len(),
            "Row operations ordered"
        );

        let mut order = deletes_first;
        order.extend(inserts);
        order.extend(updates);
        order.extend(deletes);
        Ok(order)
    }
}

/// Inserts and deletes that meet on the same resolved row key.
#[derive(Debug, Default)]
struct ReplacedRows {
    /// Pairs that leave the row as it was.
    cancelled: HashSet<OpRef>,
    /// Deletes that must run before the insert re-using their key.
    deletes_first: HashSet<OpRef>,
}

fn pair_replaced_rows(registry: &RowOpRegistry<'_>, inserts: &[OpRef], deletes: &[OpRef]) -> Result<ReplacedRows> {
    let mut replaced = ReplacedRows::default();
    let mut deleted: HashMap<(&str, BTreeMap<String, Value>), OpRef> = HashMap::new();
    for op in deletes {
        if let Some(key) = resolved_key(registry, *op)? {
            deleted.entry((registry.op(*op).table(), key)).or_insert(*op);
        }
    }
    if deleted.is_empty() {
        return Ok(replaced);
    }

    for op in inserts {
        let Some(key) = resolved_key(registry, *op)? else {
            continue;
        };
        let table = registry.op(*op).table();
        let Some(delete) = deleted.remove(&(table, key)) else {
            continue;
        };
        if is_relinked(registry, *op, delete)? {
            tracing::debug!(table = table, "Link row removed and re-created, dropping both operations");
            replaced.cancelled.insert(*op);
            replaced.cancelled.insert(delete);
        } else {
            tracing::debug!(table = table, "Row key deleted and re-inserted, deleting first");
            replaced.deletes_first.insert(delete);
        }
    }
    Ok(replaced)
}

/// Complete primary key of an operation's row, when every column resolves.
fn resolved_key(registry: &RowOpRegistry<'_>, op: OpRef) -> Result<Option<BTreeMap<String, Value>>> {
    let row = registry.op(op);
    let table = registry.model().table(row.table())?;
    let current = registry.ids().current_key(row.id())?;
    let mut key = BTreeMap::new();
    for column in table.primary_key_columns() {
        match current.get(&column.name) {
            Some(value) => {
                key.insert(column.name.clone(), value.clone());
            }
            None => return Ok(None),
        }
    }
    Ok((!key.is_empty()).then_some(key))
}

/// A synthesized row carrying nothing but its key, deleted without extra
/// conditions: the pair is a link removed and re-created.
fn is_relinked(registry: &RowOpRegistry<'_>, insert: OpRef, delete: OpRef) -> Result<bool> {
    let row = registry.op(insert);
    if !registry.ids().object_id(row.id()).is_synthetic() {
        return Ok(false);
    }
    let table = registry.model().table(row.table())?;
    let key_only = row
        .values()
        .is_none_or(|values| values.assignments().keys().all(|c| table.is_primary_key(c)));
    let unconditional = registry
        .op(delete)
        .qualifier()
        .is_none_or(|q| q.conditions().next().is_none());
    Ok(key_only && unconditional)
}

/// Table -> tables it depends on.
pub(crate) fn table_dependencies(model: &MappingModel) -> BTreeMap<String, BTreeSet<String>> {
    let mut dependencies: BTreeMap<String, BTreeSet<String>> =
        model.tables().map(|t| (t.name.clone(), BTreeSet::new())).collect();

    for table in model.tables() {
        for rel in &table.relationships {
            if rel.target == table.name || rel.joins.is_empty() {
                continue;
            }
            let Ok(target) = model.table(&rel.target) else {
                continue;
            };
            let source_pk = rel.joins.iter().all(|j| table.is_primary_key(&j.source));
            let target_pk = rel.joins.iter().all(|j| target.is_primary_key(&j.target));

            let edge = match (source_pk, target_pk) {
                (true, true) => {
                    let reverse_dependent = model
                        .reverse_relationship(&table.name, rel)
                        .is_some_and(|r| r.to_dependent_pk);
                    if rel.to_dependent_pk {
                        Some((rel.target.clone(), table.name.clone()))
                    } else if reverse_dependent {
                        Some((table.name.clone(), rel.target.clone()))
                    } else {
                        None
                    }
                }
                (false, true) => Some((table.name.clone(), rel.target.clone())),
                (true, false) => Some((rel.target.clone(), table.name.clone())),
                (false, false) => None,
            };
            if let Some((dependent, master)) = edge {
                dependencies.entry(dependent).or_default().insert(master);
            }
        }
    }
    dependencies
}

/// Kahn's algorithm over the table graph. Cycles are broken by taking the
/// smallest remaining table name.
fn rank_tables(dependencies: &BTreeMap<String, BTreeSet<String>>) -> HashMap<String, usize> {
    let mut remaining: BTreeMap<&str, BTreeSet<&str>> = dependencies
        .iter()
        .map(|(table, deps)| {
            let deps = deps
                .iter()
                .filter(|d| dependencies.contains_key(*d))
                .map(String::as_str)
                .collect();
            (table.as_str(), deps)
        })
        .collect();
    let mut ranks = HashMap::new();

    while !remaining.is_empty() {
        let ready: Vec<&str> = remaining
            .iter()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(table, _)| *table)
            .collect();
        let batch = if ready.is_empty() {
            let Some(table) = remaining.keys().next().copied() else {
                break;
            };
            tracing::debug!(table = table, "Table dependency cycle, breaking at table");
            vec![table]
        } else {
            ready
        };
        for table in batch {
            ranks.insert(table.to_string(), ranks.len());
            remaining.remove(table);
            for deps in remaining.values_mut() {
                deps.remove(table);
            }
        }
    }
    ranks
}

/// Reorder inserts so that within one table a row reading a deferred value
/// of another row of the batch comes after it.
fn order_rows(registry: &RowOpRegistry<'_>, ops: &[OpRef]) -> Result<Vec<OpRef>> {
    let by_id: HashMap<IdRef, OpRef> = ops.iter().map(|op| (registry.op(*op).id(), *op)).collect();

    let mut dependencies: HashMap<OpRef, Vec<OpRef>> = HashMap::new();
    for op in ops {
        let row = registry.op(*op);
        let mut deps = Vec::new();
        let mut push = |value: &PendingValue| {
            if let PendingValue::Deferred { id, .. } = value {
                if let Some(master) = by_id.get(id) {
                    if master != op && registry.op(*master).table() == row.table() {
                        deps.push(*master);
                    }
                }
            }
        };
        if let Some(values) = row.values() {
            values.assignments().values().for_each(&mut push);
        }
        registry.ids().replacement(row.id()).values().for_each(&mut push);
        dependencies.insert(*op, deps);
    }

    let mut visited = HashSet::new();
    let mut on_stack = HashSet::new();
    let mut path = Vec::new();
    let mut ordered = Vec::with_capacity(ops.len());
    for op in ops {
        visit(*op, &dependencies, &mut visited, &mut on_stack, &mut path, &mut ordered, registry)?;
    }
    Ok(ordered)
}

fn visit(
    op: OpRef,
    dependencies: &HashMap<OpRef, Vec<OpRef>>,
    visited: &mut HashSet<OpRef>,
    on_stack: &mut HashSet<OpRef>,
    path: &mut Vec<OpRef>,
    ordered: &mut Vec<OpRef>,
    registry: &RowOpRegistry<'_>,
) -> Result<()> {
    if visited.contains(&op) {
        return Ok(());
    }
    if !on_stack.insert(op) {
        path.push(op);
        let rows = path
            .iter()
            .skip_while(|o| **o != op)
            .map(|o| registry.ids().object_id(registry.op(*o).id()).to_string())
            .collect::<Vec<_>>();
        return Err(OrderingError {
            message: format!("Rows depend on each other's generated keys: {}", rows.join(" -> ")),
            tables: vec![registry.op(op).table().to_string()],
        }
        .into());
    }
    path.push(op);
    if let Some(deps) = dependencies.get(&op) {
        for dep in deps {
            visit(*dep, dependencies, visited, on_stack, path, ordered, registry)?;
        }
    }
    path.pop();
    on_stack.remove(&op);
    visited.insert(op);
    ordered.push(op);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id_table::PendingValue;
    use commitplan_core::{ColumnMapping, EntityMapping, ObjectId, TableMapping, TableRelationship};

    fn model() -> MappingModel {
        MappingModel::new()
            .with_table(
                TableMapping::new("PAINTING")
                    .with_column(ColumnMapping::pk("PAINTING_ID"))
                    .with_column(ColumnMapping::new("ARTIST_ID"))
                    .with_relationship(TableRelationship::to_one("artist", "ARTIST").join("ARTIST_ID", "ARTIST_ID")),
            )
            .with_table(
                TableMapping::new("ARTIST")
                    .with_column(ColumnMapping::pk("ARTIST_ID").generated(true))
                    .with_column(ColumnMapping::new("MENTOR_ID"))
                    .with_relationship(TableRelationship::to_many("paintings", "PAINTING").join("ARTIST_ID", "ARTIST_ID"))
                    .with_relationship(TableRelationship::to_one("mentor", "ARTIST").join("MENTOR_ID", "ARTIST_ID"))
                    .with_relationship(
                        TableRelationship::to_one("info", "ARTIST_INFO")
                            .join("ARTIST_ID", "ARTIST_ID")
                            .dependent_pk(true),
                    ),
            )
            .with_table(
                TableMapping::new("ARTIST_INFO")
                    .with_column(ColumnMapping::pk("ARTIST_ID"))
                    .with_column(ColumnMapping::new("BIO"))
                    .with_relationship(TableRelationship::to_one("artist", "ARTIST").join("ARTIST_ID", "ARTIST_ID")),
            )
            .with_entity(EntityMapping::new("Artist", "ARTIST"))
            .with_entity(EntityMapping::new("Painting", "PAINTING"))
    }

    #[test]
    fn test_dependencies_follow_key_direction() {
        let deps = table_dependencies(&model());
        assert!(deps["PAINTING"].contains("ARTIST"));
        assert!(deps["ARTIST_INFO"].contains("ARTIST"));
        assert!(deps["ARTIST"].is_empty());
    }

    #[test]
    fn test_parents_rank_first() {
        let sorter = RowOpSorter::new(&model());
        assert!(sorter.rank("ARTIST") < sorter.rank("PAINTING"));
        assert!(sorter.rank("ARTIST") < sorter.rank("ARTIST_INFO"));
    }

    #[test]
    fn test_cycle_is_broken_deterministically() {
        let mut deps = BTreeMap::new();
        deps.insert("A".to_string(), BTreeSet::from(["B".to_string()]));
        deps.insert("B".to_string(), BTreeSet::from(["A".to_string()]));
        deps.insert("C".to_string(), BTreeSet::from(["A".to_string()]));
        let ranks = rank_tables(&deps);
        assert_eq!(ranks["A"], 0);
        assert_eq!(ranks["B"], 1);
        assert_eq!(ranks["C"], 2);
    }

    #[test]
    fn test_sort_phases() {
        let model = model();
        let mut registry = RowOpRegistry::new(&model, 10);
        let painting = registry.intern(&ObjectId::temporary("Painting"));
        let artist = registry.intern(&ObjectId::temporary("Artist"));
        let old_painting = registry.intern(&ObjectId::single("Painting", "PAINTING_ID", 1_i64));
        let old_artist = registry.intern(&ObjectId::single("Artist", "ARTIST_ID", 1_i64));

        let del_artist = registry.get_or_create_for(old_artist, RowOpKind::Delete).unwrap();
        let del_painting = registry.get_or_create_for(old_painting, RowOpKind::Delete).unwrap();
        let ins_painting = registry.get_or_create_for(painting, RowOpKind::Insert).unwrap();
        let ins_artist = registry.get_or_create_for(artist, RowOpKind::Insert).unwrap();

        let order = RowOpSorter::new(&model).sort(&registry).unwrap();
        assert_eq!(order, vec![ins_artist, ins_painting, del_painting, del_artist]);
    }

    #[test]
    fn test_empty_updates_are_dropped() {
        let model = model();
        let mut registry = RowOpRegistry::new(&model, 10);
        let artist = registry.intern(&ObjectId::single("Artist", "ARTIST_ID", 1_i64));
        registry.get_or_create_for(artist, RowOpKind::Update).unwrap();
        assert!(RowOpSorter::new(&model).sort(&registry).unwrap().is_empty());
    }

    #[test]
    fn test_self_reference_inserts_master_first() {
        let model = model();
        let mut registry = RowOpRegistry::new(&model, 10);
        let student = registry.intern(&ObjectId::temporary("Artist"));
        let mentor = registry.intern(&ObjectId::temporary("Artist"));
        let student_op = registry.get_or_create_for(student, RowOpKind::Insert).unwrap();
        let mentor_op = registry.get_or_create_for(mentor, RowOpKind::Insert).unwrap();
        let value = registry.ids().value_for(mentor, "ARTIST_ID");
        registry.op_mut(student_op).values_mut().unwrap().add("MENTOR_ID", value);

        let order = RowOpSorter::new(&model).sort(&registry).unwrap();
        assert_eq!(order, vec![mentor_op, student_op]);
    }

    #[test]
    fn test_mutual_row_dependency_is_ordering_error() {
        let model = model();
        let mut registry = RowOpRegistry::new(&model, 10);
        let a = registry.intern(&ObjectId::temporary("Artist"));
        let b = registry.intern(&ObjectId::temporary("Artist"));
        let a_op = registry.get_or_create_for(a, RowOpKind::Insert).unwrap();
        let b_op = registry.get_or_create_for(b, RowOpKind::Insert).unwrap();
        let to_b = registry.ids().value_for(b, "ARTIST_ID");
        let to_a = registry.ids().value_for(a, "ARTIST_ID");
        registry.op_mut(a_op).values_mut().unwrap().add("MENTOR_ID", to_b);
        registry.op_mut(b_op).values_mut().unwrap().add("MENTOR_ID", to_a);

        let err = RowOpSorter::new(&model).sort(&registry).unwrap_err();
        assert!(matches!(err, commitplan_core::Error::Ordering(_)));
    }

    /// Delete of the existing ARTIST_INFO row for artist 1 plus an insert of
    /// a synthesized row whose key resolves to the same artist.
    fn delete_and_insert_same_key(registry: &mut RowOpRegistry<'_>) -> (OpRef, OpRef) {
        let new = registry.intern(&ObjectId::temporary_row("ARTIST_INFO"));
        let insert = registry.get_or_create("ARTIST_INFO", new, RowOpKind::Insert).unwrap();
        // the key only becomes known once the relationship is projected
        registry
            .ids_mut()
            .set_replacement(new, "ARTIST_ID", PendingValue::Value(Value::BigInt(1)));
        let old = registry.intern(&ObjectId::permanent_row(
            "ARTIST_INFO",
            BTreeMap::from([("ARTIST_ID".to_string(), Value::BigInt(1))]),
        ));
        let delete = registry.get_or_create("ARTIST_INFO", old, RowOpKind::Delete).unwrap();
        assert_ne!(delete, insert);
        (delete, insert)
    }

    #[test]
    fn test_recreated_link_row_cancels_out() {
        let model = model();
        let mut registry = RowOpRegistry::new(&model, 10);
        delete_and_insert_same_key(&mut registry);

        let order = RowOpSorter::new(&model).sort(&registry).unwrap();
        assert!(order.is_empty());
    }

    #[test]
    fn test_reinserted_key_is_deleted_first() {
        let model = model();
        let mut registry = RowOpRegistry::new(&model, 10);
        let (delete, insert) = delete_and_insert_same_key(&mut registry);
        registry
            .op_mut(insert)
            .values_mut()
            .unwrap()
            .add("BIO", PendingValue::Value(Value::from("Painter")));
        let artist = registry.intern(&ObjectId::temporary("Artist"));
        let new_artist = registry.get_or_create_for(artist, RowOpKind::Insert).unwrap();

        let order = RowOpSorter::new(&model).sort(&registry).unwrap();
        assert_eq!(order, vec![delete, new_artist, insert]);
    }

    #[test]
    fn test_unresolved_insert_key_is_not_paired() {
        let model = model();
        let mut registry = RowOpRegistry::new(&model, 10);
        let old = registry.intern(&ObjectId::single("Artist", "ARTIST_ID", 1_i64));
        let new = registry.intern(&ObjectId::temporary("Artist"));
        let delete = registry.get_or_create_for(old, RowOpKind::Delete).unwrap();
        let insert = registry.get_or_create_for(new, RowOpKind::Insert).unwrap();

        let order = RowOpSorter::new(&model).sort(&registry).unwrap();
        assert_eq!(order, vec![insert, delete]);
    }
}
