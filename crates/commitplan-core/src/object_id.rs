//! Object identities.
//!
//! An [`ObjectId`] names one persistent object: its entity plus either a
//! durable key snapshot (permanent) or a process-unique placeholder
//! (temporary). Temporary ids are handed out before insert and are replaced by
//! permanent ones once the database has produced the key.

use crate::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Entity-name prefix of synthetic identities for rows that have no object of
/// their own (join rows, flattened intermediate rows, `db:` arcs).
pub const DB_PREFIX: &str = "db:";

static NEXT_TEMPORARY: AtomicU64 = AtomicU64::new(1);

/// Key part of an [`ObjectId`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IdKey {
    /// Placeholder key; unique for the process lifetime.
    Temporary(u64),
    /// Durable key: attribute (column) name to value.
    Permanent(BTreeMap<String, Value>),
}

/// Identity of a persistent object.
///
/// Equality is structural. A temporary id is never equal to a permanent one,
/// even when the permanent snapshot looks like what the temporary id will
/// eventually receive.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectId {
    entity: String,
    key: IdKey,
}

impl ObjectId {
    /// Create a fresh temporary id for an entity.
    pub fn temporary(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            key: IdKey::Temporary(NEXT_TEMPORARY.fetch_add(1, Ordering::Relaxed)),
        }
    }

    /// Create a permanent id from key attribute values.
    pub fn permanent<K, V>(entity: impl Into<String>, snapshot: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
    {
        Self {
            entity: entity.into(),
            key: IdKey::Permanent(
                snapshot
                    .into_iter()
                    .map(|(k, v)| (k.into(), v.into()))
                    .collect(),
            ),
        }
    }

    /// Create a permanent id with a single key attribute.
    pub fn single(entity: impl Into<String>, attribute: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::permanent(entity, [(attribute.into(), value.into())])
    }

    /// Create a temporary synthetic id for a row of `table`.
    pub fn temporary_row(table: &str) -> Self {
        Self::temporary(format!("{DB_PREFIX}{table}"))
    }

    /// Create a permanent synthetic id for a row of `table`.
    pub fn permanent_row(table: &str, snapshot: BTreeMap<String, Value>) -> Self {
        Self {
            entity: format!("{DB_PREFIX}{table}"),
            key: IdKey::Permanent(snapshot),
        }
    }

    /// Entity name (prefixed with [`DB_PREFIX`] for synthetic ids).
    pub fn entity_name(&self) -> &str {
        &self.entity
    }

    /// Table name of a synthetic id.
    pub fn row_table(&self) -> Option<&str> {
        self.entity.strip_prefix(DB_PREFIX)
    }

    /// Whether this id lives in the synthetic row namespace.
    pub fn is_synthetic(&self) -> bool {
        self.entity.starts_with(DB_PREFIX)
    }

    /// Whether this id is a placeholder awaiting a durable key.
    pub fn is_temporary(&self) -> bool {
        matches!(self.key, IdKey::Temporary(_))
    }

    /// The key part.
    pub fn key(&self) -> &IdKey {
        &self.key
    }

    /// Durable key snapshot; `None` for temporary ids.
    pub fn snapshot(&self) -> Option<&BTreeMap<String, Value>> {
        match &self.key {
            IdKey::Permanent(snapshot) => Some(snapshot),
            IdKey::Temporary(_) => None,
        }
    }

    /// Value of one key attribute of a permanent id.
    pub fn key_value(&self, attribute: &str) -> Option<&Value> {
        self.snapshot().and_then(|s| s.get(attribute))
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<ObjectId:{}", self.entity)?;
        match &self.key {
            IdKey::Temporary(serial) => write!(f, ", TEMP:{serial}")?,
            IdKey::Permanent(snapshot) => {
                for (name, value) in snapshot {
                    write!(f, ", {name}={value}")?;
                }
            }
        }
        write!(f, ">")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temporary_ids_are_unique() {
        let a = ObjectId::temporary("Artist");
        let b = ObjectId::temporary("Artist");
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
        assert!(a.is_temporary());
        assert!(a.snapshot().is_none());
    }

    #[test]
    fn test_permanent_ids_compare_structurally() {
        let a = ObjectId::single("Artist", "ID", 5_i64);
        let b = ObjectId::permanent("Artist", [("ID", 5_i64)]);
        assert_eq!(a, b);
        assert_ne!(a, ObjectId::single("Painting", "ID", 5_i64));
        assert_eq!(a.key_value("ID"), Some(&Value::BigInt(5)));
    }

    #[test]
    fn test_synthetic_row_namespace() {
        let id = ObjectId::temporary_row("ARTIST_EXHIBIT");
        assert!(id.is_synthetic());
        assert_eq!(id.row_table(), Some("ARTIST_EXHIBIT"));
        assert!(!ObjectId::temporary("Artist").is_synthetic());
    }

    #[test]
    fn test_display_shows_key() {
        let id = ObjectId::single("Artist", "ID", 7_i64);
        assert_eq!(id.to_string(), "<ObjectId:Artist, ID=7>");
    }
}
