//! Core types for the commit compiler.
//!
//! This crate provides the vocabulary shared by the compiler and its callers:
//!
//! - `Value` for column values usable as identity snapshot members
//! - `ObjectId` for temporary and permanent object identities
//! - `MappingModel` describing tables, entities and (flattened) relationships
//! - `GraphChange` events and `ObjectSnapshot` prior state
//! - `Error` with the fatal error taxonomy of a commit

pub mod error;
pub mod graph;
pub mod mapping;
pub mod object_id;
pub mod value;

pub use error::{
    ConfigError, Error, ExecutionError, IdentityError, IdentityErrorKind, MappingError,
    MappingErrorKind, OrderingError, Result,
};
pub use graph::{ArcId, GraphChange, ObjectSnapshot};
pub use mapping::{
    AttributeMapping, ColumnMapping, EntityMapping, EntityRelationship, JoinPair, MappingModel,
    PropertyKind, TableMapping, TableRelationship,
};
pub use object_id::{DB_PREFIX, IdKey, ObjectId};
pub use value::Value;
