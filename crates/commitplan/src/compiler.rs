//! Graph diff to commit plan.

use crate::config::CommitConfig;
use crate::id_table::IdRef;
use crate::input::CommitInput;
use crate::plan::CommitPlan;
use crate::processor::{NodeChange, RootChanges, RootProcessor};
use crate::registry::RowOpRegistry;
use crate::row_op::RowOpKind;
use crate::sorter::RowOpSorter;
use commitplan_core::{GraphChange, MappingModel, ObjectId, ObjectSnapshot, Result};
use std::collections::HashMap;

/// Compiles the graph changes of one commit into an ordered [`CommitPlan`].
///
/// The compiler itself is stateless; every call to [`compile`](Self::compile)
/// works on a fresh registry, so one compiler can serve many sessions.
///
/// # Example
///
/// ```ignore
/// let compiler = CommitCompiler::new(&model);
/// let plan = compiler.compile(&input)?;
/// for batch in plan.batches() {
///     println!("{} {} x{}", batch.kind, batch.table, batch.len());
/// }
/// ```
#[derive(Debug, Clone)]
pub struct CommitCompiler<'m> {
    model: &'m MappingModel,
    config: CommitConfig,
}

/// Changes of one root object while grouping.
#[derive(Debug)]
struct RootState {
    id: IdRef,
    created: bool,
    removed: bool,
    changes: Vec<NodeChange>,
}

impl<'m> CommitCompiler<'m> {
    /// Create a compiler with the default configuration.
    pub fn new(model: &'m MappingModel) -> Self {
        Self {
            model,
            config: CommitConfig::default(),
        }
    }

    /// Use a specific configuration (builder pattern).
    #[must_use]
    pub fn with_config(mut self, config: CommitConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &CommitConfig {
        &self.config
    }

    pub fn model(&self) -> &'m MappingModel {
        self.model
    }

    /// Compile one commit.
    ///
    /// Fails without side effects on the first mapping, identity or ordering
    /// error; nothing outside the returned plan is modified.
    #[tracing::instrument(level = "debug", skip(self, input), fields(changes = input.changes.len()))]
    pub fn compile(&self, input: &CommitInput) -> Result<CommitPlan<'m>> {
        self.config.validate()?;
        self.model.validate()?;
        let mut registry = RowOpRegistry::new(self.model, self.config.max_supplier_depth);

        let aliases = collect_aliases(&input.changes);
        for old in aliases.keys() {
            let new = canonical(&aliases, old);
            let r = registry.intern(new);
            registry.ids_mut().alias(old, r);
        }

        for entry in &input.flattened_paths {
            let source = registry.intern(&entry.source);
            let target = registry.intern(&entry.target);
            registry.mark_flattened_path(source, entry.path.clone(), target);
        }

        let snapshots: HashMap<IdRef, ObjectSnapshot> = input
            .snapshots
            .iter()
            .map(|(id, snapshot)| (registry.intern(id), snapshot.clone()))
            .collect();

        let roots = group_by_root(&mut registry, &input.changes);
        tracing::debug!(roots = roots.len(), aliases = aliases.len(), "Graph changes grouped");

        let mut processor = RootProcessor::new(&mut registry, &snapshots);
        for root in &roots {
            processor.process(root)?;
        }

        let order = RowOpSorter::new(self.model).sort(&registry)?;
        tracing::debug!(registered = registry.len(), planned = order.len(), "Commit compiled");
        Ok(CommitPlan::new(registry, order, self.config.clone()))
    }
}

/// Old identity to new identity, from `NodeIdChanged` events.
fn collect_aliases(changes: &[GraphChange]) -> HashMap<ObjectId, ObjectId> {
    changes
        .iter()
        .filter_map(|change| match change {
            GraphChange::NodeIdChanged { old, new } if old != new => Some((old.clone(), new.clone())),
            _ => None,
        })
        .collect()
}

/// Follow an alias chain to its last identity.
fn canonical<'a>(aliases: &'a HashMap<ObjectId, ObjectId>, id: &'a ObjectId) -> &'a ObjectId {
    let mut current = id;
    // a cycle stops after visiting every alias once
    for _ in 0..=aliases.len() {
        match aliases.get(current) {
            Some(next) => current = next,
            None => break,
        }
    }
    current
}

/// Group changes per root object, in the order roots are first seen.
fn group_by_root(registry: &mut RowOpRegistry<'_>, changes: &[GraphChange]) -> Vec<RootChanges> {
    let mut states: Vec<RootState> = Vec::new();
    let mut index: HashMap<IdRef, usize> = HashMap::new();

    for change in changes {
        if matches!(change, GraphChange::NodeIdChanged { .. }) {
            continue;
        }
        let id = registry.intern(change.node());
        let slot = *index.entry(id).or_insert_with(|| {
            states.push(RootState {
                id,
                created: false,
                removed: false,
                changes: Vec::new(),
            });
            states.len() - 1
        });
        let state = &mut states[slot];

        match change {
            GraphChange::NodeCreated { .. } => state.created = true,
            GraphChange::NodeRemoved { .. } => state.removed = true,
            GraphChange::NodePropertyChanged { property, new, .. } => state.changes.push(NodeChange::Property {
                property: property.clone(),
                new: new.clone(),
            }),
            GraphChange::ArcCreated { target, arc, .. } | GraphChange::ArcDeleted { target, arc, .. } => {
                let created = matches!(change, GraphChange::ArcCreated { .. });
                let target = registry.intern(target);
                state.changes.push(NodeChange::Arc {
                    target,
                    arc: arc.clone(),
                    created,
                });
            }
            GraphChange::NodeIdChanged { .. } => {}
        }
    }

    states
        .into_iter()
        .filter_map(|state| {
            let kind = match (state.created, state.removed) {
                (true, true) => {
                    tracing::debug!(id = %registry.ids().object_id(state.id), "Object created and removed in one commit");
                    return None;
                }
                (true, false) => RowOpKind::Insert,
                (false, true) => RowOpKind::Delete,
                (false, false) => RowOpKind::Update,
            };
            Some(RootChanges {
                id: state.id,
                kind,
                changes: state.changes,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use commitplan_core::{ArcId, ColumnMapping, EntityMapping, AttributeMapping, TableMapping, Value};

    fn model() -> MappingModel {
        MappingModel::new()
            .with_table(
                TableMapping::new("ARTIST")
                    .with_column(ColumnMapping::pk("ARTIST_ID"))
                    .with_column(ColumnMapping::new("NAME")),
            )
            .with_entity(EntityMapping::new("Artist", "ARTIST").with_attribute(AttributeMapping::new("name", "NAME")))
    }

    fn name_change(id: &ObjectId, name: &str) -> GraphChange {
        GraphChange::NodePropertyChanged {
            id: id.clone(),
            property: "name".to_string(),
            old: Value::Null,
            new: Value::from(name),
        }
    }

    #[test]
    fn test_roots_grouped_in_first_seen_order() {
        let a = ObjectId::single("Artist", "ARTIST_ID", 1_i64);
        let b = ObjectId::single("Artist", "ARTIST_ID", 2_i64);
        let changes = vec![
            name_change(&b, "B"),
            GraphChange::NodeCreated { id: a.clone() },
            name_change(&b, "B2"),
            GraphChange::NodeRemoved { id: a.clone() },
        ];
        let model = model();
        let mut registry = RowOpRegistry::new(&model, 10);
        let roots = group_by_root(&mut registry, &changes);

        assert_eq!(roots.len(), 1);
        assert_eq!(roots[0].kind, RowOpKind::Update);
        assert_eq!(roots[0].changes.len(), 2);
    }

    #[test]
    fn test_alias_chain_is_followed() {
        let a = ObjectId::temporary("Artist");
        let b = ObjectId::temporary("Artist");
        let c = ObjectId::single("Artist", "ARTIST_ID", 3_i64);
        let changes = vec![
            GraphChange::NodeIdChanged { old: a.clone(), new: b.clone() },
            GraphChange::NodeIdChanged { old: b.clone(), new: c.clone() },
        ];
        let aliases = collect_aliases(&changes);
        assert_eq!(canonical(&aliases, &a), &c);
        assert_eq!(canonical(&aliases, &c), &c);
    }

    #[test]
    fn test_alias_cycle_terminates() {
        let a = ObjectId::temporary("Artist");
        let b = ObjectId::temporary("Artist");
        let changes = vec![
            GraphChange::NodeIdChanged { old: a.clone(), new: b.clone() },
            GraphChange::NodeIdChanged { old: b.clone(), new: a.clone() },
        ];
        let aliases = collect_aliases(&changes);
        let end = canonical(&aliases, &a);
        assert!(end == &a || end == &b);
    }

    #[test]
    fn test_changes_before_id_change_use_new_identity() {
        let old = ObjectId::single("Artist", "ARTIST_ID", 1_i64);
        let new = ObjectId::single("Artist", "ARTIST_ID", 2_i64);
        let input = CommitInput::from_changes([
            name_change(&old, "Before"),
            GraphChange::NodeIdChanged { old: old.clone(), new: new.clone() },
            name_change(&new, "After"),
        ]);
        let model = model();

        let plan = CommitCompiler::new(&model).compile(&input).unwrap();

        assert_eq!(plan.len(), 1);
        assert_eq!(plan.object_id(plan.order()[0]), &new);
        let bound = plan.bind(plan.order()[0]).unwrap();
        assert_eq!(bound.values["NAME"], Value::from("After"));
        assert_eq!(bound.key["ARTIST_ID"], Value::BigInt(2));
    }

    #[test]
    fn test_created_then_removed_plans_nothing() {
        let id = ObjectId::temporary("Artist");
        let input = CommitInput::from_changes([
            GraphChange::NodeCreated { id: id.clone() },
            name_change(&id, "Gone"),
            GraphChange::NodeRemoved { id },
        ]);
        let model = model();
        let plan = CommitCompiler::new(&model).compile(&input).unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let model = model();
        let compiler = CommitCompiler::new(&model).with_config(CommitConfig::default().max_supplier_depth(0));
        assert!(compiler.compile(&CommitInput::new()).is_err());
    }

    #[test]
    fn test_unknown_db_arc_is_an_error() {
        let model = model();
        let a = ObjectId::single("Artist", "ARTIST_ID", 1_i64);
        let b = ObjectId::single("Artist", "ARTIST_ID", 2_i64);
        let input = CommitInput::from_changes([GraphChange::ArcCreated {
            source: a,
            target: b,
            arc: ArcId::new("db:missing"),
        }]);
        assert!(CommitCompiler::new(&model).compile(&input).is_err());
    }
}
