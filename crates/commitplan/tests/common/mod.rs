//! Shared fixtures for commit pipeline integration tests.

#![allow(dead_code)]

use commitplan::{BatchExecutor, BatchResult, BoundBatch, BoundRow, RowOpKind, Value};
use commitplan_core::{
    AttributeMapping, ColumnMapping, EntityMapping, EntityRelationship, ExecutionError,
    MappingModel, TableMapping, TableRelationship,
};
use std::collections::{BTreeMap, HashMap};

/// Artist 1-n Painting, Artist n-n Exhibit through ARTIST_EXHIBIT, a two-hop
/// flattened attribute through ARTIST_INFO and ARTIST_NOTE, a Genre keyed by
/// a meaningful code, and a read-only Gallery.
pub fn gallery_model() -> MappingModel {
    MappingModel::new()
        .with_table(
            TableMapping::new("ARTIST")
                .with_column(ColumnMapping::pk("ARTIST_ID").generated(true))
                .with_column(ColumnMapping::new("NAME"))
                .with_relationship(TableRelationship::to_many("paintings", "PAINTING").join("ARTIST_ID", "ARTIST_ID"))
                .with_relationship(
                    TableRelationship::to_many("artistExhibits", "ARTIST_EXHIBIT")
                        .join("ARTIST_ID", "ARTIST_ID")
                        .dependent_pk(true),
                )
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
                .with_relationship(
                    TableRelationship::to_one("note", "ARTIST_NOTE")
                        .join("ARTIST_ID", "ARTIST_ID")
                        .dependent_pk(true),
                ),
        )
        .with_table(
            TableMapping::new("ARTIST_NOTE")
                .with_column(ColumnMapping::pk("ARTIST_ID"))
                .with_column(ColumnMapping::new("NOTE")),
        )
        .with_table(
            TableMapping::new("PAINTING")
                .with_column(ColumnMapping::pk("PAINTING_ID").generated(true))
                .with_column(ColumnMapping::new("TITLE"))
                .with_column(ColumnMapping::new("ARTIST_ID"))
                .with_relationship(TableRelationship::to_one("artist", "ARTIST").join("ARTIST_ID", "ARTIST_ID")),
        )
        .with_table(
            TableMapping::new("EXHIBIT")
                .with_column(ColumnMapping::pk("EXHIBIT_ID").generated(true))
                .with_relationship(
                    TableRelationship::to_many("artistExhibits", "ARTIST_EXHIBIT")
                        .join("EXHIBIT_ID", "EXHIBIT_ID")
                        .dependent_pk(true),
                ),
        )
        .with_table(
            TableMapping::new("ARTIST_EXHIBIT")
                .with_column(ColumnMapping::pk("ARTIST_ID"))
                .with_column(ColumnMapping::pk("EXHIBIT_ID"))
                .with_relationship(TableRelationship::to_one("toArtist", "ARTIST").join("ARTIST_ID", "ARTIST_ID"))
                .with_relationship(TableRelationship::to_one("toExhibit", "EXHIBIT").join("EXHIBIT_ID", "EXHIBIT_ID")),
        )
        .with_table(
            TableMapping::new("GENRE")
                .with_column(ColumnMapping::pk("CODE"))
                .with_column(ColumnMapping::new("NAME")),
        )
        .with_table(
            TableMapping::new("GALLERY")
                .with_column(ColumnMapping::pk("GALLERY_ID"))
                .with_column(ColumnMapping::new("NAME")),
        )
        .with_entity(
            EntityMapping::new("Artist", "ARTIST")
                .with_attribute(AttributeMapping::new("name", "NAME"))
                .with_attribute(AttributeMapping::new("bio", "info.BIO"))
                .with_attribute(AttributeMapping::new("note", "info.note.NOTE"))
                .with_relationship(EntityRelationship::to_many("paintings", "Painting", "paintings"))
                .with_relationship(EntityRelationship::to_many("exhibits", "Exhibit", "artistExhibits.toExhibit")),
        )
        .with_entity(
            EntityMapping::new("Painting", "PAINTING")
                .optimistic_locking(true)
                .with_attribute(AttributeMapping::new("title", "TITLE").locking(true))
                .with_relationship(EntityRelationship::to_one("artist", "Artist", "artist")),
        )
        .with_entity(
            EntityMapping::new("Exhibit", "EXHIBIT")
                .with_relationship(EntityRelationship::to_many("artists", "Artist", "artistExhibits.toArtist")),
        )
        .with_entity(
            EntityMapping::new("Genre", "GENRE")
                .with_attribute(AttributeMapping::new("code", "CODE"))
                .with_attribute(AttributeMapping::new("name", "NAME")),
        )
        .with_entity(
            EntityMapping::new("Gallery", "GALLERY")
                .read_only(true)
                .with_attribute(AttributeMapping::new("name", "NAME")),
        )
}

/// In-memory executor recording every batch it receives.
///
/// Generated keys count up per table from a configurable first value; rows
/// that already carry the key get it echoed back, as a database would.
#[derive(Debug, Default)]
pub struct RecordingExecutor {
    pub batches: Vec<BoundBatch>,
    next_keys: HashMap<String, i64>,
    affected: HashMap<String, u64>,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// First generated key of a table.
    pub fn with_first_key(mut self, table: &str, key: i64) -> Self {
        self.next_keys.insert(table.to_string(), key);
        self
    }

    /// Report `count` affected rows for every row of a table.
    pub fn with_affected(mut self, table: &str, count: u64) -> Self {
        self.affected.insert(table.to_string(), count);
        self
    }

    /// Rows of every recorded batch for a table and kind.
    pub fn rows(&self, table: &str, kind: RowOpKind) -> Vec<&BoundRow> {
        self.batches
            .iter()
            .filter(|b| b.table == table && b.kind == kind)
            .flat_map(|b| b.rows.iter())
            .collect()
    }

    /// `(kind, table)` of every recorded batch, in execution order.
    pub fn sequence(&self) -> Vec<(RowOpKind, String)> {
        self.batches.iter().map(|b| (b.kind, b.table.clone())).collect()
    }

    fn next_key(&mut self, table: &str) -> i64 {
        let next = self.next_keys.entry(table.to_string()).or_insert(1);
        let key = *next;
        *next += 1;
        key
    }
}

impl BatchExecutor for RecordingExecutor {
    fn execute(&mut self, batch: &BoundBatch) -> Result<BatchResult, ExecutionError> {
        let mut result = BatchResult::new();
        if let Some(count) = self.affected.get(&batch.table) {
            result.affected = vec![*count; batch.rows.len()];
        }
        if batch.kind == RowOpKind::Insert && !batch.generated_columns.is_empty() {
            for row in &batch.rows {
                let mut key = BTreeMap::new();
                for column in &batch.generated_columns {
                    let value = match row.values.get(column) {
                        Some(value) => value.clone(),
                        None => Value::BigInt(self.next_key(&batch.table)),
                    };
                    key.insert(column.clone(), value);
                }
                result.generated_keys.push(key);
            }
        }
        self.batches.push(batch.clone());
        Ok(result)
    }
}
