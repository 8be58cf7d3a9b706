//! Read-only mapping model.
//!
//! Two layers are described here. Tables ([`TableMapping`]) carry columns and
//! table-level relationships expressed as join column pairs. Entities
//! ([`EntityMapping`]) map object properties onto tables through *db paths*:
//! a dot-separated list of table relationship names, optionally ending in a
//! column name for attributes. A path with more than one relationship hop, or
//! an attribute path with any hop at all, is *flattened* and is realized
//! through intermediate rows.
//!
//! The compiler never mutates the model; it is built once (by hand or from
//! JSON) and shared by every commit.

use crate::error::{Error, MappingErrorKind, Result};
use crate::object_id::ObjectId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A table column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMapping {
    /// Column name
    pub name: String,
    /// Whether this column is part of the primary key
    #[serde(default)]
    pub primary_key: bool,
    /// Whether the database generates the value on insert
    #[serde(default)]
    pub generated: bool,
}

impl ColumnMapping {
    /// Create a plain (non-key) column.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            primary_key: false,
            generated: false,
        }
    }

    /// Create a primary key column.
    pub fn pk(name: impl Into<String>) -> Self {
        Self::new(name).primary_key(true)
    }

    /// Set the primary key flag.
    pub fn primary_key(mut self, value: bool) -> Self {
        self.primary_key = value;
        self
    }

    /// Set the generated flag.
    pub fn generated(mut self, value: bool) -> Self {
        self.generated = value;
        self
    }
}

/// One `source = target` column pair of a relationship join.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinPair {
    /// Column on the relationship's source table.
    pub source: String,
    /// Column on the relationship's target table.
    pub target: String,
}

/// A relationship between two tables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRelationship {
    /// Relationship name, unique within the source table.
    pub name: String,
    /// Target table name.
    pub target: String,
    /// Join column pairs.
    pub joins: Vec<JoinPair>,
    /// Whether one source row relates to many target rows.
    #[serde(default)]
    pub to_many: bool,
    /// Whether the target row's primary key is derived from the source row's
    /// primary key (the target is the dependent side).
    #[serde(default)]
    pub to_dependent_pk: bool,
    /// Name of the reverse relationship on the target table.
    #[serde(default)]
    pub reverse: Option<String>,
}

impl TableRelationship {
    /// Create a to-one relationship.
    pub fn to_one(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            joins: Vec::new(),
            to_many: false,
            to_dependent_pk: false,
            reverse: None,
        }
    }

    /// Create a to-many relationship.
    pub fn to_many(name: impl Into<String>, target: impl Into<String>) -> Self {
        let mut rel = Self::to_one(name, target);
        rel.to_many = true;
        rel
    }

    /// Add a join column pair.
    pub fn join(mut self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.joins.push(JoinPair {
            source: source.into(),
            target: target.into(),
        });
        self
    }

    /// Mark the target as the dependent-PK side.
    pub fn dependent_pk(mut self, value: bool) -> Self {
        self.to_dependent_pk = value;
        self
    }

    /// Name the reverse relationship.
    pub fn reverse(mut self, name: impl Into<String>) -> Self {
        self.reverse = Some(name.into());
        self
    }
}

/// A table and its relationships.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMapping {
    /// Table name
    pub name: String,
    /// Columns in declaration order
    pub columns: Vec<ColumnMapping>,
    /// Outgoing relationships
    #[serde(default)]
    pub relationships: Vec<TableRelationship>,
    /// Rows of this table are shared between owners and must not be deleted
    /// when one owner goes away.
    #[serde(default)]
    pub no_delete: bool,
}

impl TableMapping {
    /// Create an empty table mapping.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            relationships: Vec::new(),
            no_delete: false,
        }
    }

    /// Add a column.
    pub fn with_column(mut self, column: ColumnMapping) -> Self {
        self.columns.push(column);
        self
    }

    /// Add a relationship.
    pub fn with_relationship(mut self, relationship: TableRelationship) -> Self {
        self.relationships.push(relationship);
        self
    }

    /// Set the no-delete flag.
    pub fn no_delete(mut self, value: bool) -> Self {
        self.no_delete = value;
        self
    }

    /// Look up a column.
    pub fn column(&self, name: &str) -> Option<&ColumnMapping> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Whether `name` is a primary key column.
    pub fn is_primary_key(&self, name: &str) -> bool {
        self.column(name).is_some_and(|c| c.primary_key)
    }

    /// Primary key columns in declaration order.
    pub fn primary_key_columns(&self) -> impl Iterator<Item = &ColumnMapping> {
        self.columns.iter().filter(|c| c.primary_key)
    }

    /// Database-generated columns that are part of the primary key.
    pub fn generated_primary_keys(&self) -> impl Iterator<Item = &ColumnMapping> {
        self.columns.iter().filter(|c| c.primary_key && c.generated)
    }

    /// Look up an outgoing relationship.
    pub fn relationship(&self, name: &str) -> Option<&TableRelationship> {
        self.relationships.iter().find(|r| r.name == name)
    }
}

/// Maps an object property onto a column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeMapping {
    /// Property name
    pub name: String,
    /// `column` or `rel.rel.column`
    pub db_path: String,
    /// Whether the prior value takes part in the optimistic lock qualifier
    #[serde(default)]
    pub used_for_locking: bool,
}

impl AttributeMapping {
    pub fn new(name: impl Into<String>, db_path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            db_path: db_path.into(),
            used_for_locking: false,
        }
    }

    /// Set the locking flag.
    pub fn locking(mut self, value: bool) -> Self {
        self.used_for_locking = value;
        self
    }

    /// Whether the column lives in a table reached through relationships.
    pub fn is_flattened(&self) -> bool {
        self.db_path.contains('.')
    }

    /// Column name (last path segment).
    pub fn column_name(&self) -> &str {
        self.db_path
            .rsplit_once('.')
            .map_or(self.db_path.as_str(), |(_, column)| column)
    }

    /// Relationship prefix of a flattened path.
    pub fn relationship_path(&self) -> Option<&str> {
        self.db_path.rsplit_once('.').map(|(path, _)| path)
    }
}

/// Maps an object relationship onto one or more table relationships.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRelationship {
    /// Property (arc) name
    pub name: String,
    /// Target entity name
    pub target_entity: String,
    /// `rel` or `rel.rel...`
    pub db_path: String,
    /// Whether the relationship is to-many at the object level
    #[serde(default)]
    pub to_many: bool,
    /// Whether the prior target's key takes part in the lock qualifier
    #[serde(default)]
    pub used_for_locking: bool,
}

impl EntityRelationship {
    /// Create a to-one object relationship.
    pub fn to_one(name: impl Into<String>, target_entity: impl Into<String>, db_path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target_entity: target_entity.into(),
            db_path: db_path.into(),
            to_many: false,
            used_for_locking: false,
        }
    }

    /// Create a to-many object relationship.
    pub fn to_many(name: impl Into<String>, target_entity: impl Into<String>, db_path: impl Into<String>) -> Self {
        let mut rel = Self::to_one(name, target_entity, db_path);
        rel.to_many = true;
        rel
    }

    /// Set the locking flag.
    pub fn locking(mut self, value: bool) -> Self {
        self.used_for_locking = value;
        self
    }

    /// Whether the relationship goes through intermediate tables.
    pub fn is_flattened(&self) -> bool {
        self.db_path.contains('.')
    }

    /// Name of the first table relationship of the path.
    pub fn first_hop(&self) -> &str {
        self.db_path
            .split_once('.')
            .map_or(self.db_path.as_str(), |(first, _)| first)
    }
}

/// A property of an entity, classified by shape.
#[derive(Debug, Clone, Copy)]
pub enum PropertyKind<'a> {
    Attribute(&'a AttributeMapping),
    ToOne(&'a EntityRelationship),
    ToMany(&'a EntityRelationship),
}

impl PropertyKind<'_> {
    /// Property name.
    pub fn name(&self) -> &str {
        match self {
            PropertyKind::Attribute(a) => &a.name,
            PropertyKind::ToOne(r) | PropertyKind::ToMany(r) => &r.name,
        }
    }
}

/// An object entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityMapping {
    /// Entity name
    pub name: String,
    /// Root table
    pub table: String,
    /// Writes to this entity abort the commit
    #[serde(default)]
    pub read_only: bool,
    /// Updates and deletes carry an optimistic lock qualifier
    #[serde(default)]
    pub optimistic_locking: bool,
    /// Attributes in declaration order
    #[serde(default)]
    pub attributes: Vec<AttributeMapping>,
    /// Relationships in declaration order
    #[serde(default)]
    pub relationships: Vec<EntityRelationship>,
}

impl EntityMapping {
    pub fn new(name: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            read_only: false,
            optimistic_locking: false,
            attributes: Vec::new(),
            relationships: Vec::new(),
        }
    }

    /// Set the read-only flag.
    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    /// Set the optimistic locking flag.
    pub fn optimistic_locking(mut self, value: bool) -> Self {
        self.optimistic_locking = value;
        self
    }

    /// Add an attribute.
    pub fn with_attribute(mut self, attribute: AttributeMapping) -> Self {
        self.attributes.push(attribute);
        self
    }

    /// Add a relationship.
    pub fn with_relationship(mut self, relationship: EntityRelationship) -> Self {
        self.relationships.push(relationship);
        self
    }

    /// Look up an attribute by property name.
    pub fn attribute(&self, name: &str) -> Option<&AttributeMapping> {
        self.attributes.iter().find(|a| a.name == name)
    }

    /// Look up a relationship by property name.
    pub fn relationship(&self, name: &str) -> Option<&EntityRelationship> {
        self.relationships.iter().find(|r| r.name == name)
    }

    /// All properties: attributes first, then relationships, each in
    /// declaration order.
    pub fn properties(&self) -> impl Iterator<Item = PropertyKind<'_>> {
        let attributes = self.attributes.iter().map(PropertyKind::Attribute);
        let relationships = self.relationships.iter().map(|r| {
            if r.to_many {
                PropertyKind::ToMany(r)
            } else {
                PropertyKind::ToOne(r)
            }
        });
        attributes.chain(relationships)
    }
}

#[derive(Serialize, Deserialize)]
struct MappingDocument {
    #[serde(default)]
    tables: Vec<TableMapping>,
    #[serde(default)]
    entities: Vec<EntityMapping>,
}

/// The complete mapping: tables and entities by name.
#[derive(Debug, Clone, Default)]
pub struct MappingModel {
    tables: BTreeMap<String, TableMapping>,
    entities: BTreeMap<String, EntityMapping>,
}

impl MappingModel {
    /// Create an empty model.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a table (builder pattern).
    pub fn with_table(mut self, table: TableMapping) -> Self {
        self.add_table(table);
        self
    }

    /// Add an entity (builder pattern).
    pub fn with_entity(mut self, entity: EntityMapping) -> Self {
        self.add_entity(entity);
        self
    }

    /// Add or replace a table.
    pub fn add_table(&mut self, table: TableMapping) {
        self.tables.insert(table.name.clone(), table);
    }

    /// Add or replace an entity.
    pub fn add_entity(&mut self, entity: EntityMapping) {
        self.entities.insert(entity.name.clone(), entity);
    }

    /// Parse and validate a JSON mapping document
    /// (`{"tables": [...], "entities": [...]}`).
    pub fn from_json(json: &str) -> Result<Self> {
        let doc: MappingDocument = serde_json::from_str(json)?;
        let mut model = Self::new();
        for table in doc.tables {
            model.add_table(table);
        }
        for entity in doc.entities {
            model.add_entity(entity);
        }
        model.validate()?;
        Ok(model)
    }

    /// Serialize the model as a JSON mapping document.
    pub fn to_json(&self) -> Result<String> {
        let doc = MappingDocument {
            tables: self.tables.values().cloned().collect(),
            entities: self.entities.values().cloned().collect(),
        };
        Ok(serde_json::to_string_pretty(&doc)?)
    }

    /// All tables by name.
    pub fn tables(&self) -> impl Iterator<Item = &TableMapping> {
        self.tables.values()
    }

    /// All entities by name.
    pub fn entities(&self) -> impl Iterator<Item = &EntityMapping> {
        self.entities.values()
    }

    /// Look up a table.
    pub fn table(&self, name: &str) -> Result<&TableMapping> {
        self.tables.get(name).ok_or_else(|| {
            Error::mapping(
                MappingErrorKind::UnknownTable,
                name,
                format!("Table '{name}' is not mapped"),
            )
        })
    }

    /// Look up an entity.
    pub fn entity(&self, name: &str) -> Result<&EntityMapping> {
        self.entities.get(name).ok_or_else(|| {
            Error::mapping(
                MappingErrorKind::UnknownEntity,
                name,
                format!("Entity '{name}' is not mapped"),
            )
        })
    }

    /// Entity an id belongs to; `None` for synthetic row ids.
    pub fn entity_for_id(&self, id: &ObjectId) -> Result<Option<&EntityMapping>> {
        if id.is_synthetic() {
            return Ok(None);
        }
        self.entity(id.entity_name()).map(Some)
    }

    /// Table the row of an id lives in.
    pub fn table_for_id(&self, id: &ObjectId) -> Result<&TableMapping> {
        match id.row_table() {
            Some(table) => self.table(table),
            None => {
                let entity = self.entity(id.entity_name())?;
                self.table(&entity.table)
            }
        }
    }

    /// Look up a relationship of a table.
    pub fn table_relationship(&self, table: &str, name: &str) -> Result<&TableRelationship> {
        self.table(table)?.relationship(name).ok_or_else(|| {
            Error::mapping(
                MappingErrorKind::UnknownRelationship,
                table,
                format!("Table '{table}' has no relationship '{name}'"),
            )
        })
    }

    /// Reverse of a table relationship.
    ///
    /// Uses the declared reverse name when present, otherwise searches the
    /// target table for a relationship pointing back with mirrored joins.
    pub fn reverse_relationship(&self, source_table: &str, rel: &TableRelationship) -> Option<&TableRelationship> {
        let target = self.tables.get(&rel.target)?;
        if let Some(name) = &rel.reverse {
            return target.relationship(name);
        }
        target.relationships.iter().find(|candidate| {
            candidate.target == source_table
                && candidate.joins.len() == rel.joins.len()
                && candidate.joins.iter().all(|j| {
                    rel.joins
                        .iter()
                        .any(|r| r.source == j.target && r.target == j.source)
                })
        })
    }

    /// Object relationship on the target entity walking the same path back.
    ///
    /// `None` when some hop has no reverse or the target entity maps no
    /// relationship along the reversed path.
    pub fn reverse_entity_relationship(
        &self,
        entity: &EntityMapping,
        rel: &EntityRelationship,
    ) -> Option<&EntityRelationship> {
        let target = self.entities.get(&rel.target_entity)?;
        let hops = self.resolve_path(&entity.table, &rel.db_path).ok()?;
        let mut reversed = Vec::with_capacity(hops.len());
        for (source_table, hop) in hops.iter().rev() {
            reversed.push(self.reverse_relationship(source_table, hop)?.name.as_str());
        }
        let path = reversed.join(".");
        target
            .relationships
            .iter()
            .find(|candidate| candidate.target_entity == entity.name && candidate.db_path == path)
    }

    /// Resolve a dot-separated relationship path starting at `table`.
    pub fn resolve_path(&self, table: &str, path: &str) -> Result<Vec<(String, &TableRelationship)>> {
        if path.is_empty() {
            return Err(Error::mapping(
                MappingErrorKind::InvalidPath,
                table,
                format!("Empty relationship path on table '{table}'"),
            ));
        }
        let mut current = table.to_string();
        let mut hops = Vec::new();
        for segment in path.split('.') {
            let rel = self.table_relationship(&current, segment)?;
            hops.push((current.clone(), rel));
            current.clone_from(&rel.target);
        }
        Ok(hops)
    }

    /// Check internal consistency: every referenced table, column,
    /// relationship and reverse name must exist.
    pub fn validate(&self) -> Result<()> {
        for table in self.tables.values() {
            for rel in &table.relationships {
                let target = self.table(&rel.target)?;
                if rel.joins.is_empty() {
                    return Err(Error::mapping(
                        MappingErrorKind::UnsupportedRelationship,
                        &table.name,
                        format!("Relationship '{}.{}' has no joins", table.name, rel.name),
                    ));
                }
                if rel.to_dependent_pk
                    && !rel
                        .joins
                        .iter()
                        .all(|j| table.is_primary_key(&j.source) && target.is_primary_key(&j.target))
                {
                    return Err(Error::mapping(
                        MappingErrorKind::UnsupportedRelationship,
                        &table.name,
                        format!(
                            "Relationship '{}.{}' propagates a dependent key but does not join primary keys",
                            table.name, rel.name
                        ),
                    ));
                }
                for join in &rel.joins {
                    if table.column(&join.source).is_none() || target.column(&join.target).is_none() {
                        return Err(Error::mapping(
                            MappingErrorKind::UnknownProperty,
                            &table.name,
                            format!(
                                "Relationship '{}' joins unknown column(s) {}.{} = {}.{}",
                                rel.name, table.name, join.source, target.name, join.target
                            ),
                        ));
                    }
                }
                if let Some(reverse) = &rel.reverse {
                    if target.relationship(reverse).is_none() {
                        return Err(Error::mapping(
                            MappingErrorKind::UnknownRelationship,
                            &target.name,
                            format!(
                                "Reverse relationship '{reverse}' of '{}.{}' not found",
                                table.name, rel.name
                            ),
                        ));
                    }
                }
            }
        }

        for entity in self.entities.values() {
            self.table(&entity.table)?;
            for attribute in &entity.attributes {
                let column_table = match attribute.relationship_path() {
                    Some(path) => self
                        .resolve_path(&entity.table, path)?
                        .last()
                        .map_or(entity.table.clone(), |(_, rel)| rel.target.clone()),
                    None => entity.table.clone(),
                };
                if self.table(&column_table)?.column(attribute.column_name()).is_none() {
                    return Err(Error::mapping(
                        MappingErrorKind::UnknownProperty,
                        &entity.name,
                        format!(
                            "Attribute '{}' maps to unknown column '{}' of table '{}'",
                            attribute.name,
                            attribute.column_name(),
                            column_table
                        ),
                    ));
                }
            }
            for rel in &entity.relationships {
                let hops = self.resolve_path(&entity.table, &rel.db_path)?;
                let target_entity = self.entity(&rel.target_entity)?;
                let end_table = hops.last().map(|(_, r)| r.target.as_str()).unwrap_or_default();
                if end_table != target_entity.table {
                    return Err(Error::mapping(
                        MappingErrorKind::InvalidPath,
                        &entity.name,
                        format!(
                            "Relationship '{}' ends at table '{}' but entity '{}' maps to '{}'",
                            rel.name, end_table, target_entity.name, target_entity.table
                        ),
                    ));
                }
            }
        }
        Ok(())
    }
}
