//! # caseboard-collab — Encrypted multi-party sync for Caseboard
//!
//! Connects the replica engine in `caseboard-core` to other
//! participants through an untrusted relay, under end-to-end
//! encryption, with offline-first persistence.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   AEAD frames    ┌─────────────┐
//! │ SyncSession  │ ◄──────────────► │ RelayServer │   (content-blind)
//! │  (per doc)   │    WebSocket     │  room fanout│
//! └──────┬───────┘                  └─────────────┘
//!        │
//!        ├── ReplicaDocument + Reconciler  (caseboard-core)
//!        ├── DocumentStore (RocksDB, offline-first)
//!        └── PresenceRoster (ephemeral, never persisted)
//! ```
//!
//! The relay routes on `(room id, frame kind)` only. Room ids and
//! access tokens are derived one-way from the share secret, so the
//! relay can neither read board contents nor correlate a room with a
//! document.
//!
//! ## Performance Targets
//!
//! | Metric | Target |
//! |--------|--------|
//! | Seal + envelope encode (1KB delta) | <10μs |
//! | Relay fan-out, 100 peers | <1ms |
//! | Delta flush (background) | never blocks a mutation |
//! | Reopen from snapshot (1MB doc) | <10ms |
//!
//! ## Modules
//!
//! - [`access`] — room id / access token / payload key derivation
//! - [`cipher`] — frame payload AEAD (XChaCha20-Poly1305)
//! - [`protocol`] — plaintext routing envelope + encrypted sync messages
//! - [`broadcast`] — per-room fan-out with backpressure
//! - [`relay`] — the untrusted relay server
//! - [`client`] — reconnecting secure channel with offline queue
//! - [`presence`] — heartbeat-refreshed participant roster
//! - [`storage`] — RocksDB persistence adapter
//! - [`session`] — the per-document sync orchestrator
//! - [`share`] — share-link construction and parsing

pub mod access;
pub mod broadcast;
pub mod cipher;
pub mod client;
pub mod presence;
pub mod protocol;
pub mod relay;
pub mod session;
pub mod share;
pub mod storage;

// Re-exports for convenience
pub use access::{
    derive_access_token, derive_credential, derive_payload_key, derive_room_id, AccessCredential,
    AccessError, AccessToken, RoomId, Secret,
};
pub use broadcast::{BroadcastGroup, BroadcastStats};
pub use cipher::{CipherError, PayloadCipher};
pub use client::{
    ChannelConfig, ChannelError, ChannelEvent, ConnectionState, OfflineQueue, SecureChannel,
};
pub use presence::{Point, PresenceRecord, PresenceRoster, PresenceState, PresenceUpdate};
pub use protocol::{FrameKind, JoinRequest, ProtocolError, RelayFrame, SyncMessage, WelcomeInfo};
pub use relay::{RelayConfig, RelayServer, RelayStats};
pub use session::{
    HistoryOutcome, SessionConfig, SessionError, SessionMode, ShareGrant, SyncSession, SyncState,
};
pub use share::{ShareLink, ShareLinkError};
pub use storage::{DocumentStore, FlushHandle, StoreConfig, StoreError, StoreMeta};
