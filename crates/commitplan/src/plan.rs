//! Compiled commit plans and statement binding.

use crate::config::CommitConfig;
use crate::id_table::{IdTable, PendingValue, Resolution, not_generated};
use crate::registry::{OpRef, RowOpRegistry};
use crate::row_op::{RowOpBody, RowOpKind};
use commitplan_core::{ColumnMapping, Error, IdentityErrorKind, ObjectId, Result, TableMapping, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Consecutive operations of one kind on one table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub table: String,
    pub kind: RowOpKind,
    pub ops: Vec<OpRef>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// A row operation with every deferred value resolved, ready for a
/// statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundRow {
    pub table: String,
    pub kind: RowOpKind,
    /// Identity of the row at binding time.
    pub id: ObjectId,
    /// Assigned columns (inserts include the known key columns).
    pub values: BTreeMap<String, Value>,
    /// Primary key predicate (updates and deletes).
    pub key: BTreeMap<String, Value>,
    /// Additional and lock predicates (updates and deletes).
    pub qualifier: BTreeMap<String, Value>,
    /// Whether zero affected rows means a concurrent modification.
    pub optimistic_lock: bool,
}

/// Diagnostic view of one compiled operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowOpSummary {
    pub table: String,
    pub kind: RowOpKind,
    pub id: ObjectId,
    pub columns: Vec<String>,
    pub qualifier_columns: Vec<String>,
    pub optimistic_lock: bool,
}

/// Ordered row operations of one commit.
///
/// Produced by [`CommitCompiler`](crate::CommitCompiler). Deferred values are
/// resolved only when an operation is bound, so keys generated by earlier
/// batches are visible to later ones.
#[derive(Debug)]
pub struct CommitPlan<'m> {
    registry: RowOpRegistry<'m>,
    order: Vec<OpRef>,
    batches: Vec<Batch>,
    config: CommitConfig,
}

impl<'m> CommitPlan<'m> {
    pub(crate) fn new(registry: RowOpRegistry<'m>, order: Vec<OpRef>, config: CommitConfig) -> Self {
        let batches = Self::batch_by_table(&registry, &order);
        Self {
            registry,
            order,
            batches,
            config,
        }
    }

    /// Group consecutive operations by table and kind.
    fn batch_by_table(registry: &RowOpRegistry<'_>, order: &[OpRef]) -> Vec<Batch> {
        let mut batches: Vec<Batch> = Vec::new();
        for op in order {
            let row = registry.op(*op);
            match batches.last_mut() {
                Some(batch) if batch.table == row.table() && batch.kind == row.kind() => batch.ops.push(*op),
                _ => batches.push(Batch {
                    table: row.table().to_string(),
                    kind: row.kind(),
                    ops: vec![*op],
                }),
            }
        }
        batches
    }

    /// Operations in execution order.
    pub fn order(&self) -> &[OpRef] {
        &self.order
    }

    /// Execution batches.
    pub fn batches(&self) -> &[Batch] {
        &self.batches
    }

    /// Number of operations to execute.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn config(&self) -> &CommitConfig {
        &self.config
    }

    pub fn registry(&self) -> &RowOpRegistry<'m> {
        &self.registry
    }

    pub(crate) fn registry_mut(&mut self) -> &mut RowOpRegistry<'m> {
        &mut self.registry
    }

    /// Current identity of an operation's row.
    pub fn object_id(&self, op: OpRef) -> &ObjectId {
        self.registry.ids().object_id(self.registry.op(op).id())
    }

    /// Operation planned for an object's own row.
    pub fn operation_for(&self, id: &ObjectId) -> Result<OpRef> {
        let unknown = || Error::identity(IdentityErrorKind::UnknownId, format!("{id} is not part of this commit"));
        let r = self.registry.ids().lookup(id).ok_or_else(unknown)?;
        self.registry.find(r)?.ok_or_else(unknown)
    }

    /// Number of operations of a kind.
    pub fn count(&self, kind: RowOpKind) -> usize {
        self.order
            .iter()
            .filter(|op| self.registry.op(**op).kind() == kind)
            .count()
    }

    /// Diagnostic summaries in execution order.
    pub fn summaries(&self) -> Vec<RowOpSummary> {
        self.order
            .iter()
            .map(|op| {
                let row = self.registry.op(*op);
                RowOpSummary {
                    table: row.table().to_string(),
                    kind: row.kind(),
                    id: self.object_id(*op).clone(),
                    columns: row
                        .values()
                        .map(|v| v.assignments().keys().cloned().collect())
                        .unwrap_or_default(),
                    qualifier_columns: row
                        .qualifier()
                        .map(|q| q.conditions().map(|(c, _)| c.clone()).collect())
                        .unwrap_or_default(),
                    optimistic_lock: row.qualifier().is_some_and(|q| q.is_optimistic_lock()),
                }
            })
            .collect()
    }

    /// Resolve one operation into a [`BoundRow`].
    ///
    /// Must run after the batches this operation depends on have reported
    /// their generated keys.
    pub fn bind(&self, op: OpRef) -> Result<BoundRow> {
        let row = self.registry.op(op);
        let ids = self.registry.ids();
        let table = self.registry.model().table(row.table())?;
        let id = ids.object_id(row.id());

        let mut bound = BoundRow {
            table: row.table().to_string(),
            kind: row.kind(),
            id: id.clone(),
            values: BTreeMap::new(),
            key: BTreeMap::new(),
            qualifier: BTreeMap::new(),
            optimistic_lock: false,
        };

        match row.body() {
            RowOpBody::Insert { values } => {
                for (column, value) in values.assignments() {
                    if let Some(value) = resolve_column(ids, table, id, column, value)? {
                        bound.values.insert(column.clone(), value);
                    }
                }
                for column in table.primary_key_columns() {
                    if bound.values.contains_key(&column.name) {
                        continue;
                    }
                    match ids.key_value(row.id(), &column.name) {
                        Some(value) => {
                            if let Some(value) = resolve_column(ids, table, id, &column.name, &value)? {
                                bound.values.insert(column.name.clone(), value);
                            }
                        }
                        None if column.generated => {}
                        None => return Err(not_generated(id, &column.name)),
                    }
                }
                bound.key = table
                    .primary_key_columns()
                    .filter_map(|c| bound.values.get(&c.name).map(|v| (c.name.clone(), v.clone())))
                    .collect();
            }
            RowOpBody::Update { values, qualifier } => {
                for (column, value) in values.assignments() {
                    bound.values.insert(column.clone(), ids.resolve_required(value)?);
                }
                bound.key = key_predicate(ids, table, row.id())?;
                for (column, value) in qualifier.conditions() {
                    bound.qualifier.insert(column.clone(), ids.resolve_required(value)?);
                }
                bound.optimistic_lock = qualifier.is_optimistic_lock();
            }
            RowOpBody::Delete { qualifier } => {
                bound.key = key_predicate(ids, table, row.id())?;
                for (column, value) in qualifier.conditions() {
                    bound.qualifier.insert(column.clone(), ids.resolve_required(value)?);
                }
                bound.optimistic_lock = qualifier.is_optimistic_lock();
            }
        }

        tracing::trace!(table = %bound.table, kind = %bound.kind, id = %bound.id, "Row bound");
        Ok(bound)
    }
}

/// Resolve an insert value; an unresolved generated key column is left to
/// the database.
fn resolve_column(
    ids: &IdTable,
    table: &TableMapping,
    id: &ObjectId,
    column: &str,
    value: &PendingValue,
) -> Result<Option<Value>> {
    match ids.resolve(value)? {
        Resolution::Resolved(value) => Ok(Some(value)),
        Resolution::NotGenerated { .. } if table.column(column).is_some_and(is_generated_key) => Ok(None),
        Resolution::NotGenerated { .. } => Err(not_generated(id, column)),
    }
}

fn is_generated_key(column: &ColumnMapping) -> bool {
    column.primary_key && column.generated
}

/// Primary key of an existing row; every key column must be known.
fn key_predicate(ids: &IdTable, table: &TableMapping, id: crate::id_table::IdRef) -> Result<BTreeMap<String, Value>> {
    let current = ids.current_key(id)?;
    let mut key = BTreeMap::new();
    for column in table.primary_key_columns() {
        match current.get(&column.name) {
            Some(value) => {
                key.insert(column.name.clone(), value.clone());
            }
            None => return Err(not_generated(ids.object_id(id), &column.name)),
        }
    }
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sorter::RowOpSorter;
    use commitplan_core::{EntityMapping, MappingModel, TableRelationship};

    fn model() -> MappingModel {
        MappingModel::new()
            .with_table(
                TableMapping::new("ARTIST")
                    .with_column(ColumnMapping::pk("ARTIST_ID").generated(true))
                    .with_column(ColumnMapping::new("NAME"))
                    .with_relationship(TableRelationship::to_many("paintings", "PAINTING").join("ARTIST_ID", "ARTIST_ID")),
            )
            .with_table(
                TableMapping::new("PAINTING")
                    .with_column(ColumnMapping::pk("PAINTING_ID"))
                    .with_column(ColumnMapping::new("ARTIST_ID"))
                    .with_relationship(TableRelationship::to_one("artist", "ARTIST").join("ARTIST_ID", "ARTIST_ID")),
            )
            .with_entity(EntityMapping::new("Artist", "ARTIST"))
            .with_entity(EntityMapping::new("Painting", "PAINTING"))
    }

    fn plan(registry: RowOpRegistry<'_>) -> CommitPlan<'_> {
        let order = RowOpSorter::new(registry.model()).sort(&registry).unwrap();
        CommitPlan::new(registry, order, CommitConfig::default())
    }

    #[test]
    fn test_batches_group_consecutive_ops() {
        let model = model();
        let mut registry = RowOpRegistry::new(&model, 10);
        for _ in 0..2 {
            let id = registry.intern(&ObjectId::temporary("Artist"));
            registry.get_or_create_for(id, RowOpKind::Insert).unwrap();
        }
        let id = registry.intern(&ObjectId::single("Painting", "PAINTING_ID", 1_i64));
        registry.get_or_create_for(id, RowOpKind::Delete).unwrap();

        let plan = plan(registry);
        assert_eq!(plan.batches().len(), 2);
        assert_eq!(plan.batches()[0].table, "ARTIST");
        assert_eq!(plan.batches()[0].len(), 2);
        assert_eq!(plan.batches()[1].kind, RowOpKind::Delete);
        assert_eq!(plan.count(RowOpKind::Insert), 2);
    }

    #[test]
    fn test_operation_lookup_by_object_id() {
        let model = model();
        let mut registry = RowOpRegistry::new(&model, 10);
        let id = ObjectId::single("Painting", "PAINTING_ID", 1_i64);
        let r = registry.intern(&id);
        let op = registry.get_or_create_for(r, RowOpKind::Delete).unwrap();

        let plan = plan(registry);
        assert_eq!(plan.operation_for(&id).unwrap(), op);
        let err = plan.operation_for(&ObjectId::temporary("Painting")).unwrap_err();
        assert_eq!(err.identity_kind(), Some(IdentityErrorKind::UnknownId));
    }

    #[test]
    fn test_insert_leaves_generated_key_to_database() {
        let model = model();
        let mut registry = RowOpRegistry::new(&model, 10);
        let artist = registry.intern(&ObjectId::temporary("Artist"));
        let op = registry.get_or_create_for(artist, RowOpKind::Insert).unwrap();
        registry
            .op_mut(op)
            .values_mut()
            .unwrap()
            .add("NAME", PendingValue::Value(Value::from("Monet")));

        let plan = plan(registry);
        let bound = plan.bind(op).unwrap();
        assert_eq!(bound.values.len(), 1);
        assert!(bound.key.is_empty());
    }

    #[test]
    fn test_insert_without_key_is_fatal() {
        let model = model();
        let mut registry = RowOpRegistry::new(&model, 10);
        let painting = registry.intern(&ObjectId::temporary("Painting"));
        let op = registry.get_or_create_for(painting, RowOpKind::Insert).unwrap();

        let err = plan(registry).bind(op).unwrap_err();
        assert_eq!(err.identity_kind(), Some(IdentityErrorKind::PrimaryKeyNotGenerated));
    }

    #[test]
    fn test_foreign_key_resolves_at_binding_time() {
        let model = model();
        let mut registry = RowOpRegistry::new(&model, 10);
        let artist = registry.intern(&ObjectId::temporary("Artist"));
        let painting = registry.intern(&ObjectId::temporary("Painting"));
        registry.get_or_create_for(artist, RowOpKind::Insert).unwrap();
        let op = registry.get_or_create_for(painting, RowOpKind::Insert).unwrap();
        registry
            .ids_mut()
            .set_replacement(painting, "PAINTING_ID", PendingValue::Value(Value::BigInt(10)));
        let fk = registry.ids().value_for(artist, "ARTIST_ID");
        registry.op_mut(op).values_mut().unwrap().add("ARTIST_ID", fk);

        let mut plan = plan(registry);
        assert!(plan.bind(op).is_err());

        plan.registry_mut()
            .ids_mut()
            .set_replacement(artist, "ARTIST_ID", PendingValue::Value(Value::BigInt(42)));
        let bound = plan.bind(op).unwrap();
        assert_eq!(bound.values["ARTIST_ID"], Value::BigInt(42));
        assert_eq!(bound.values["PAINTING_ID"], Value::BigInt(10));
    }

    #[test]
    fn test_delete_binds_key_and_qualifier() {
        let model = model();
        let mut registry = RowOpRegistry::new(&model, 10);
        let painting = registry.intern(&ObjectId::single("Painting", "PAINTING_ID", 3_i64));
        let op = registry.get_or_create_for(painting, RowOpKind::Delete).unwrap();
        registry
            .op_mut(op)
            .qualifier_mut()
            .unwrap()
            .add_additional("ARTIST_ID", PendingValue::Value(Value::BigInt(1)));

        let bound = plan(registry).bind(op).unwrap();
        assert_eq!(bound.key["PAINTING_ID"], Value::BigInt(3));
        assert_eq!(bound.qualifier["ARTIST_ID"], Value::BigInt(1));
        assert!(!bound.optimistic_lock);
    }
}
