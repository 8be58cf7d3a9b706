//! Commit compiler: object graph changes to ordered row operations.
//!
//! `commitplan` is the **flush layer** of an object-relational mapper. It takes
//! the changes an object graph went through since the last commit and turns
//! them into per-table insert, update and delete operations, then reconciles
//! generated keys back into object identities once the operations ran.
//!
//! # Role In The Architecture
//!
//! - **Projection**: attribute and relationship changes become column values,
//!   including primary-key propagation across joins and rows synthesized for
//!   flattened (multi-hop) relationships.
//! - **Deduplication**: one row operation per physical row, even when it is
//!   reached through different identities or from both ends of a relationship.
//! - **Ordering**: referenced rows are inserted first and deleted last.
//! - **Reconciliation**: temporary identities become permanent ones after
//!   execution, with exactly one notification per object.
//!
//! # Design Philosophy
//!
//! - **No SQL**: statements are the job of a [`BatchExecutor`].
//! - **Commit-scoped state**: every commit gets its own registry; nothing is
//!   global.
//! - **Deferred values**: keys not known yet are referenced, not copied, and
//!   resolved when a batch is bound.
//! - **Fail whole**: any error aborts the commit before identities change.
//!
//! # Example
//!
//! ```ignore
//! let model = MappingModel::from_json(&mapping_json)?;
//! let input = CommitInput::from_changes(changes);
//!
//! let report = CommitPipeline::new(&model).run(&input, &mut executor)?;
//! for change in &report.id_changes {
//!     graph.replace_id(&change.old, &change.new);
//! }
//! ```

pub mod arc;
pub mod compiler;
pub mod config;
pub mod effective_id;
pub mod executor;
pub mod id_table;
pub mod input;
mod lock;
mod observer;
pub mod pipeline;
pub mod plan;
mod processor;
mod projection;
mod reconciler;
pub mod registry;
pub mod report;
pub mod row_op;
pub mod sorter;

pub use arc::ArcTarget;
pub use compiler::CommitCompiler;
pub use config::{CommitConfig, DEFAULT_MAX_SUPPLIER_DEPTH};
pub use effective_id::EffectiveId;
pub use executor::{BatchExecutor, BatchResult, BoundBatch};
pub use id_table::{IdRef, IdTable, PendingValue, Resolution};
pub use input::CommitInput;
pub use pipeline::CommitPipeline;
pub use plan::{Batch, BoundRow, CommitPlan, RowOpSummary};
pub use registry::{OpRef, RowOpRegistry};
pub use report::{CommitReport, FlattenedPath, IdChange, LockConflict, PropertyBackfill};
pub use row_op::{KindMerge, Qualifier, RowOp, RowOpBody, RowOpKind, Values};
pub use sorter::RowOpSorter;

pub use commitplan_core::{
    ArcId, Error, GraphChange, MappingModel, ObjectId, ObjectSnapshot, Result, Value,
};
