//! Graph-change events and prior-state snapshots.
//!
//! A commit is described by the ordered list of changes the object graph went
//! through since the last commit, plus a snapshot of what each modified or
//! deleted object looked like before those changes.

use crate::{ObjectId, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Identifies a relationship arc, as seen from one side.
///
/// `forward` is the property name on the source object. `reverse` is the
/// property name on the target object pointing back, when one is mapped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArcId {
    pub forward: String,
    pub reverse: Option<String>,
}

impl ArcId {
    /// An arc with no mapped reverse.
    pub fn new(forward: impl Into<String>) -> Self {
        Self {
            forward: forward.into(),
            reverse: None,
        }
    }

    /// An arc with a mapped reverse.
    pub fn with_reverse(forward: impl Into<String>, reverse: impl Into<String>) -> Self {
        Self {
            forward: forward.into(),
            reverse: Some(reverse.into()),
        }
    }

    /// The same arc seen from the other side.
    pub fn reversed(&self) -> Self {
        match &self.reverse {
            Some(reverse) => Self {
                forward: reverse.clone(),
                reverse: Some(self.forward.clone()),
            },
            None => Self {
                forward: String::new(),
                reverse: Some(self.forward.clone()),
            },
        }
    }
}

/// One change of the object graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GraphChange {
    /// A new object was registered.
    NodeCreated { id: ObjectId },
    /// An object was deleted.
    NodeRemoved { id: ObjectId },
    /// An attribute of an object changed.
    NodePropertyChanged {
        id: ObjectId,
        property: String,
        old: Value,
        new: Value,
    },
    /// A relationship instance was created.
    ArcCreated {
        source: ObjectId,
        target: ObjectId,
        arc: ArcId,
    },
    /// A relationship instance was removed.
    ArcDeleted {
        source: ObjectId,
        target: ObjectId,
        arc: ArcId,
    },
    /// An object's identity was replaced before this commit.
    NodeIdChanged { old: ObjectId, new: ObjectId },
}

impl GraphChange {
    /// The object this change belongs to.
    pub fn node(&self) -> &ObjectId {
        match self {
            GraphChange::NodeCreated { id }
            | GraphChange::NodeRemoved { id }
            | GraphChange::NodePropertyChanged { id, .. } => id,
            GraphChange::ArcCreated { source, .. } | GraphChange::ArcDeleted { source, .. } => source,
            GraphChange::NodeIdChanged { new, .. } => new,
        }
    }
}

/// Committed state of one object before the current changes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectSnapshot {
    /// Prior attribute values by property name.
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
    /// Prior to-one targets by property name (`None` = no target).
    #[serde(default)]
    pub to_one: BTreeMap<String, Option<ObjectId>>,
}

impl ObjectSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a prior attribute value.
    pub fn with_attribute(mut self, property: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(property.into(), value.into());
        self
    }

    /// Record a prior to-one target.
    pub fn with_to_one(mut self, property: impl Into<String>, target: Option<ObjectId>) -> Self {
        self.to_one.insert(property.into(), target);
        self
    }

    /// Prior value of an attribute; NULL when not recorded.
    pub fn attribute(&self, property: &str) -> Value {
        self.attributes.get(property).cloned().unwrap_or(Value::Null)
    }

    /// Prior target of a to-one relationship.
    pub fn to_one_target(&self, property: &str) -> Option<&ObjectId> {
        self.to_one.get(property).and_then(Option::as_ref)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reversing_twice_is_identity() {
        let arc = ArcId::with_reverse("paintings", "artist");
        assert_eq!(arc.reversed(), ArcId::with_reverse("artist", "paintings"));
        assert_eq!(arc.reversed().reversed(), arc);
    }

    #[test]
    fn test_node_of_arc_change_is_source() {
        let a = ObjectId::temporary("Artist");
        let p = ObjectId::temporary("Painting");
        let change = GraphChange::ArcCreated {
            source: a.clone(),
            target: p,
            arc: ArcId::new("paintings"),
        };
        assert_eq!(change.node(), &a);
    }

    #[test]
    fn test_snapshot_defaults_to_null() {
        let snapshot = ObjectSnapshot::new().with_attribute("name", "x");
        assert_eq!(snapshot.attribute("name"), Value::from("x"));
        assert_eq!(snapshot.attribute("missing"), Value::Null);
        assert!(snapshot.to_one_target("artist").is_none());
    }
}
