//! Durable offline-first storage for board documents.
//!
//! - [`rocks`] — RocksDB-backed store: LZ4 snapshots, delta log, metadata
//! - [`flush`] — background writer: non-blocking delta appends with
//!   retry, threshold compaction into fresh snapshots
//!
//! The in-memory replica stays authoritative under storage failure; the
//! engine accepts losing only the most recent unflushed writes on
//! abrupt termination.

pub mod flush;
pub mod rocks;

pub use flush::{spawn_flusher, FlushConfig, FlushHandle};
pub use rocks::{DocumentStore, StoreConfig, StoreError, StoreMeta};
