//! # caseboard-core — Replica container and read model for Caseboard
//!
//! The local half of the collaborative replication engine: a mergeable
//! CRDT replica of one investigation board, the incremental projection
//! into an application-facing read model, and transactional undo/redo.
//!
//! ## Architecture
//!
//! ```text
//! UI mutation
//!      │
//!      ▼
//! ReplicaDocument::transact()  ──► encoded update (network + disk)
//!      │  (deep observers)
//!      ▼
//! change queue ──► Reconciler (debounced pass)
//!      │
//!      ▼
//! ReadModel  (Arc-stable records, single writer, many readers)
//! ```
//!
//! ## Modules
//!
//! - [`replica`] — Yrs-backed replica with named collections and transactions
//! - [`model`] — schema-validated record types over the generic field maps
//! - [`reconcile`] — incremental projector with debounced change batching
//! - [`history`] — bounded undo/redo stacks of self-contained actions

pub mod history;
pub mod model;
pub mod reconcile;
pub mod replica;

// Re-exports for convenience
pub use history::{ActionKind, HistoryAction, HistoryOp, HistoryStack};
pub use model::{
    Asset, BoardRecord, Comment, Element, Link, SchemaError,
};
pub use reconcile::{ReadModel, Reconciler};
pub use replica::{
    ChangeKind, Collection, DocChange, ReplicaDocument, ReplicaError, ReplicaTxn,
};
