//! Commit-scoped identity table.
//!
//! Every [`ObjectId`] a commit touches is interned here and addressed by a
//! copyable [`IdRef`]. The entry owns the id's *replacement map*: key values
//! collected during compilation (propagated master keys, meaningful PK edits)
//! and after execution (generated keys), from which the permanent identity is
//! built at reconciliation time.
//!
//! Replacement values may be deferred: "whatever attribute X of identity Y
//! turns out to be". Deferred values are plain data ([`PendingValue::Deferred`])
//! and are resolved by an explicit loop bounded by the configured depth.

use commitplan_core::{Error, IdentityErrorKind, ObjectId, Result, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Handle of an identity interned in an [`IdTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdRef(usize);

impl IdRef {
    /// Position in the owning table.
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for IdRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A value that may not be known yet.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PendingValue {
    /// Known value.
    Value(Value),
    /// Key attribute of another identity, read at resolution time.
    Deferred { id: IdRef, attribute: String },
}

impl PendingValue {
    /// NULL.
    pub fn null() -> Self {
        PendingValue::Value(Value::Null)
    }

    /// Whether resolution is still needed.
    pub fn is_deferred(&self) -> bool {
        matches!(self, PendingValue::Deferred { .. })
    }

    /// The value, if already known.
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            PendingValue::Value(v) => Some(v),
            PendingValue::Deferred { .. } => None,
        }
    }
}

impl From<Value> for PendingValue {
    fn from(v: Value) -> Self {
        PendingValue::Value(v)
    }
}

/// Outcome of resolving a [`PendingValue`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Resolved(Value),
    /// The chain ended at a key attribute nobody has produced yet.
    NotGenerated { id: IdRef, attribute: String },
}

impl Resolution {
    /// The value, if resolution succeeded.
    pub fn value(self) -> Option<Value> {
        match self {
            Resolution::Resolved(v) => Some(v),
            Resolution::NotGenerated { .. } => None,
        }
    }
}

#[derive(Debug)]
struct IdEntry {
    id: ObjectId,
    replacement: BTreeMap<String, PendingValue>,
}

/// Interned identities of one commit plus their replacement maps.
#[derive(Debug)]
pub struct IdTable {
    entries: Vec<IdEntry>,
    index: HashMap<ObjectId, IdRef>,
    max_depth: usize,
}

impl IdTable {
    /// Create an empty table with the given deferred-chain bound.
    pub fn new(max_depth: usize) -> Self {
        Self {
            entries: Vec::new(),
            index: HashMap::new(),
            max_depth,
        }
    }

    /// Number of interned identities.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing has been interned.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Intern an id, returning the existing handle for an equal id.
    pub fn intern(&mut self, id: &ObjectId) -> IdRef {
        if let Some(r) = self.index.get(id) {
            return *r;
        }
        let r = IdRef(self.entries.len());
        self.entries.push(IdEntry {
            id: id.clone(),
            replacement: BTreeMap::new(),
        });
        self.index.insert(id.clone(), r);
        r
    }

    /// Handle of an already interned id.
    pub fn lookup(&self, id: &ObjectId) -> Option<IdRef> {
        self.index.get(id).copied()
    }

    /// Make `alias` resolve to the same handle as `target`.
    pub fn alias(&mut self, alias: &ObjectId, target: IdRef) {
        self.index.insert(alias.clone(), target);
    }

    /// Replace the identity behind a handle once its permanent key is known.
    ///
    /// The previous id keeps resolving to the same handle.
    pub fn reassign(&mut self, r: IdRef, id: ObjectId) {
        self.index.insert(id.clone(), r);
        self.entries[r.0].id = id;
    }

    /// The interned id.
    pub fn object_id(&self, r: IdRef) -> &ObjectId {
        &self.entries[r.0].id
    }

    /// The replacement map of an id.
    pub fn replacement(&self, r: IdRef) -> &BTreeMap<String, PendingValue> {
        &self.entries[r.0].replacement
    }

    /// Whether any replacement value has been recorded.
    pub fn has_replacement(&self, r: IdRef) -> bool {
        !self.entries[r.0].replacement.is_empty()
    }

    /// Record a replacement value, overriding any previous one.
    pub fn set_replacement(&mut self, r: IdRef, attribute: impl Into<String>, value: PendingValue) {
        let attribute = attribute.into();
        tracing::trace!(id = %self.entries[r.0].id, attribute = %attribute, "Replacement value recorded");
        self.entries[r.0].replacement.insert(attribute, value);
    }

    /// Current value of a key attribute: replacement first, then the durable
    /// snapshot of a permanent id.
    pub fn key_value(&self, r: IdRef, attribute: &str) -> Option<PendingValue> {
        let entry = &self.entries[r.0];
        if let Some(v) = entry.replacement.get(attribute) {
            return Some(v.clone());
        }
        entry.id.key_value(attribute).cloned().map(PendingValue::Value)
    }

    /// Value to propagate for a key attribute of `r`.
    ///
    /// Known values of a permanent id are copied directly; everything else is
    /// deferred so that keys generated later are picked up.
    pub fn value_for(&self, r: IdRef, attribute: &str) -> PendingValue {
        let entry = &self.entries[r.0];
        if !entry.replacement.contains_key(attribute) {
            if let Some(v) = entry.id.key_value(attribute) {
                return PendingValue::Value(v.clone());
            }
        }
        PendingValue::Deferred {
            id: r,
            attribute: attribute.to_string(),
        }
    }

    /// Resolve a value by following deferred references.
    pub fn resolve(&self, value: &PendingValue) -> Result<Resolution> {
        let mut current = value.clone();
        for _ in 0..self.max_depth {
            match current {
                PendingValue::Value(v) => return Ok(Resolution::Resolved(v)),
                PendingValue::Deferred { id, attribute } => match self.key_value(id, &attribute) {
                    Some(next) => current = next,
                    None => return Ok(Resolution::NotGenerated { id, attribute }),
                },
            }
        }
        match current {
            PendingValue::Value(v) => Ok(Resolution::Resolved(v)),
            PendingValue::Deferred { id, attribute } => Err(Error::identity(
                IdentityErrorKind::SupplierChainTooLong,
                format!(
                    "Possible recursive supplier chain for {} (attribute '{}'): more than {} levels",
                    self.object_id(id),
                    attribute,
                    self.max_depth
                ),
            )),
        }
    }

    /// Resolve a value that must be known, failing with
    /// `PrimaryKeyNotGenerated` otherwise.
    pub fn resolve_required(&self, value: &PendingValue) -> Result<Value> {
        match self.resolve(value)? {
            Resolution::Resolved(v) => Ok(v),
            Resolution::NotGenerated { id, attribute } => Err(not_generated(self.object_id(id), &attribute)),
        }
    }

    /// Current row key of an id.
    ///
    /// For a permanent id this is its durable snapshot (the row as it exists
    /// now). For a temporary id it is whatever part of the replacement map
    /// already resolves; unresolved attributes are left out.
    pub fn current_key(&self, r: IdRef) -> Result<BTreeMap<String, Value>> {
        let entry = &self.entries[r.0];
        if let Some(snapshot) = entry.id.snapshot() {
            return Ok(snapshot.clone());
        }
        let mut key = BTreeMap::new();
        for (attribute, value) in &entry.replacement {
            if let Resolution::Resolved(v) = self.resolve(value)? {
                if !v.is_null() {
                    key.insert(attribute.clone(), v);
                }
            }
        }
        Ok(key)
    }

    /// Fully resolve the replacement map in place.
    ///
    /// Fails on the first attribute whose chain ends at a key nobody produced.
    pub fn resolve_replacement(&mut self, r: IdRef) -> Result<BTreeMap<String, Value>> {
        let mut resolved = BTreeMap::new();
        for (attribute, value) in &self.entries[r.0].replacement {
            match self.resolve(value)? {
                Resolution::Resolved(v) => {
                    resolved.insert(attribute.clone(), v);
                }
                Resolution::NotGenerated { id, attribute: missing } => {
                    return Err(Error::identity(
                        IdentityErrorKind::PrimaryKeyNotGenerated,
                        format!(
                            "PK for {} is not set: '{}' depends on {}.{} which was never generated \
                             (missing key generator or mutual dependency)",
                            self.object_id(r),
                            attribute,
                            self.object_id(id),
                            missing
                        ),
                    ));
                }
            }
        }
        for (attribute, value) in &resolved {
            self.entries[r.0]
                .replacement
                .insert(attribute.clone(), PendingValue::Value(value.clone()));
        }
        Ok(resolved)
    }

    /// Build the identity an id turns into once its replacement map is
    /// applied; `None` when nothing was recorded.
    pub fn replacement_id(&mut self, r: IdRef) -> Result<Option<ObjectId>> {
        if !self.has_replacement(r) {
            return Ok(None);
        }
        let resolved = self.resolve_replacement(r)?;
        let id = &self.entries[r.0].id;
        let mut snapshot = id.snapshot().cloned().unwrap_or_default();
        snapshot.extend(resolved);
        Ok(Some(ObjectId::permanent(id.entity_name(), snapshot)))
    }
}

pub(crate) fn not_generated(id: &ObjectId, attribute: &str) -> Error {
    Error::identity(
        IdentityErrorKind::PrimaryKeyNotGenerated,
        format!("PK attribute '{attribute}' of {id} is not generated"),
    )
}
