//! The per-document sync orchestrator.
//!
//! One [`SyncSession`] owns everything belonging to one open board:
//! the replica, the reconciler and its read model, the history stacks,
//! the persistence flusher, and (while shared) the secure channel and
//! presence roster. Sessions are explicit objects — several can exist
//! side by side, and tests get full isolation.
//!
//! State machine: `Closed → Local → Shared → Local → Closed`. While
//! shared, [`SyncState`] exposes the observable substates (connected,
//! syncing, reconnecting, peer count) through a watch channel.
//!
//! Every mutation takes the same path: short-circuit into the read
//! model, transactional replica write, history record, then background
//! broadcast and persistence. The mutation call itself never waits on
//! network or disk.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde_json::{Map as JsonMap, Value};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use caseboard_core::model::BoardRecord;
use caseboard_core::reconcile::DEFAULT_DEBOUNCE;
use caseboard_core::{
    ActionKind, Asset, Collection, Comment, Element, HistoryAction, HistoryOp, HistoryStack, Link,
    ReadModel, Reconciler, ReplicaDocument, ReplicaError, SchemaError,
};

use crate::access::{
    derive_access_token, derive_room_id, AccessCredential, AccessError, RoomId, Secret,
};
use crate::cipher::PayloadCipher;
use crate::client::{ChannelConfig, ChannelError, ChannelEvent, SecureChannel};
use crate::presence::{Point, PresenceRecord, PresenceRoster, HEARTBEAT_INTERVAL};
use crate::protocol::SyncMessage;
use crate::share::{ShareLink, ShareLinkError};
use crate::storage::{spawn_flusher, DocumentStore, FlushConfig, FlushHandle, StoreConfig};

/// Session lifecycle mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    Closed,
    Local,
    Shared,
}

/// Derived, observable sync state. Published through a watch channel;
/// consumers re-render on change.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncState {
    pub mode: SessionMode,
    pub connected: bool,
    pub syncing: bool,
    pub reconnecting: bool,
    pub peer_count: usize,
    pub room_id: Option<String>,
    pub error: Option<String>,
}

impl Default for SyncState {
    fn default() -> Self {
        Self {
            mode: SessionMode::Closed,
            connected: false,
            syncing: false,
            reconnecting: false,
            peer_count: 0,
            room_id: None,
            error: None,
        }
    }
}

/// What a share() call hands back to the UI.
#[derive(Debug, Clone)]
pub struct ShareGrant {
    pub share_url: String,
    pub secret: Secret,
}

/// Result of replaying one undo/redo action.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HistoryOutcome {
    pub applied: usize,
    /// Ops whose target entity a remote peer deleted meanwhile.
    pub skipped: usize,
}

/// Session errors. Configuration problems surface immediately;
/// transport and storage problems never show up here (they recover in
/// the background and only move state flags).
#[derive(Debug)]
pub enum SessionError {
    /// No relay URL configured for a shared operation.
    MissingRelay,
    /// The supplied secret failed to decode.
    MalformedSecret(AccessError),
    /// share() on an already-shared session.
    AlreadyShared,
    /// Mutation target does not exist.
    NotFound { collection: Collection, id: Uuid },
    Replica(ReplicaError),
    Channel(ChannelError),
    Schema(SchemaError),
    ShareLink(ShareLinkError),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::MissingRelay => write!(f, "No relay server configured"),
            SessionError::MalformedSecret(e) => write!(f, "Malformed secret: {e}"),
            SessionError::AlreadyShared => write!(f, "Document is already shared"),
            SessionError::NotFound { collection, id } => {
                write!(f, "Entity not found: {collection}/{id}")
            }
            SessionError::Replica(e) => write!(f, "Replica error: {e}"),
            SessionError::Channel(e) => write!(f, "Channel error: {e}"),
            SessionError::Schema(e) => write!(f, "Schema error: {e}"),
            SessionError::ShareLink(e) => write!(f, "Share link error: {e}"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<ReplicaError> for SessionError {
    fn from(e: ReplicaError) -> Self {
        SessionError::Replica(e)
    }
}

impl From<ChannelError> for SessionError {
    fn from(e: ChannelError) -> Self {
        SessionError::Channel(e)
    }
}

impl From<SchemaError> for SessionError {
    fn from(e: SchemaError) -> Self {
        SessionError::Schema(e)
    }
}

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Relay websocket URL; required for shared sessions only.
    pub relay_url: Option<String>,
    /// Storage directory; `None` keeps the session memory-only.
    pub storage_path: Option<PathBuf>,
    /// Base (`scheme://host`) for rendered share links.
    pub share_base_url: String,
    pub participant_name: String,
    pub debounce: Duration,
    pub heartbeat: Duration,
    /// Bounded wait for the initial sync handshake; after this the
    /// session proceeds with whatever local state exists.
    pub handshake_timeout: Duration,
    pub history_limit: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            relay_url: None,
            storage_path: None,
            share_base_url: "https://caseboard.example".to_string(),
            participant_name: "Anonymous".to_string(),
            debounce: DEFAULT_DEBOUNCE,
            heartbeat: HEARTBEAT_INTERVAL,
            handshake_timeout: Duration::from_secs(5),
            history_limit: caseboard_core::history::DEFAULT_HISTORY_LIMIT,
        }
    }
}

/// One open board document. Exclusive owner of its replica.
pub struct SyncSession {
    document_id: Uuid,
    participant_id: Uuid,
    config: SessionConfig,
    replica: Arc<ReplicaDocument>,
    reconciler: Reconciler,
    history: Arc<Mutex<HistoryStack>>,
    roster: Arc<Mutex<PresenceRoster>>,
    state_tx: watch::Sender<SyncState>,
    store: Option<Arc<DocumentStore>>,
    flush: Option<FlushHandle>,
    flush_task: Option<tokio::task::JoinHandle<()>>,
    channel: Option<SecureChannel>,
    secret: Option<Secret>,
    buffering: bool,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl SyncSession {
    // ─── Lifecycle ────────────────────────────────────────────────────

    /// Open a document locally: replica, persistence and read model,
    /// no network. Resolves once persisted state is loaded. Must be
    /// called from within a tokio runtime.
    pub fn open_local(document_id: Uuid, config: SessionConfig) -> Self {
        let participant_id = Uuid::new_v4();
        let replica = Arc::new(ReplicaDocument::new());

        let (store, flush, flush_task) = match &config.storage_path {
            Some(path) => {
                let store_config = StoreConfig {
                    path: path.clone(),
                    ..StoreConfig::default()
                };
                match DocumentStore::open(store_config) {
                    Ok(store) => {
                        let store = Arc::new(store);
                        match store.hydrate_into(document_id, &replica) {
                            Ok(true) => log::info!("Hydrated document {document_id} from disk"),
                            Ok(false) => log::debug!("No persisted state for {document_id}"),
                            Err(e) => {
                                log::error!("Hydration failed for {document_id}: {e}")
                            }
                        }
                        let (flush, task) = spawn_flusher(
                            store.clone(),
                            replica.clone(),
                            document_id,
                            FlushConfig::default(),
                        );
                        (Some(store), Some(flush), Some(task))
                    }
                    Err(e) => {
                        // The in-memory document stays authoritative.
                        log::error!("Store open failed, continuing in memory: {e}");
                        (None, None, None)
                    }
                }
            }
            None => (None, None, None),
        };

        let reconciler = Reconciler::new(replica.clone(), config.debounce);
        reconciler.run_initial();
        let tasks = vec![reconciler.spawn_debounce()];

        let (state_tx, _) = watch::channel(SyncState {
            mode: SessionMode::Local,
            ..SyncState::default()
        });

        let roster = Arc::new(Mutex::new(PresenceRoster::new(
            participant_id,
            config.participant_name.clone(),
        )));
        let history = Arc::new(Mutex::new(HistoryStack::new(config.history_limit)));

        Self {
            document_id,
            participant_id,
            config,
            replica,
            reconciler,
            history,
            roster,
            state_tx,
            store,
            flush,
            flush_task,
            channel: None,
            secret: None,
            buffering: false,
            tasks,
        }
    }

    /// Open a document and connect to its room. With `secret: None` a
    /// fresh secret is minted (use [`SyncSession::share_url`] to render
    /// the link afterwards).
    pub fn open_shared(
        document_id: Uuid,
        secret: Option<Secret>,
        room_id: Option<RoomId>,
        buffering: bool,
        config: SessionConfig,
    ) -> Result<Self, SessionError> {
        let relay_url = config.relay_url.clone().ok_or(SessionError::MissingRelay)?;
        let mut session = Self::open_local(document_id, config);
        let secret = secret.unwrap_or_else(Secret::generate);
        session.connect_channel(relay_url, secret, room_id, buffering)?;
        Ok(session)
    }

    /// Open from a parsed share link (join flow).
    pub fn open_from_link(link: &ShareLink, mut config: SessionConfig) -> Result<Self, SessionError> {
        config.relay_url = Some(link.relay_url.clone());
        Self::open_shared(
            link.document_id,
            Some(link.secret.clone()),
            Some(link.room_id),
            link.buffering,
            config,
        )
    }

    /// Promote an open local document to shared. Mints a fresh secret,
    /// which makes any previously distributed link useless, and
    /// connects under the newly derived room.
    pub fn share(&mut self, buffering: bool) -> Result<ShareGrant, SessionError> {
        if self.channel.is_some() {
            return Err(SessionError::AlreadyShared);
        }
        let relay_url = self
            .config
            .relay_url
            .clone()
            .ok_or(SessionError::MissingRelay)?;

        let secret = Secret::generate();
        self.connect_channel(relay_url, secret.clone(), None, buffering)?;
        let share_url = self.share_url()?;
        Ok(ShareGrant { share_url, secret })
    }

    /// Render the share link for the current secret.
    pub fn share_url(&self) -> Result<String, SessionError> {
        let secret = match (&self.channel, &self.secret) {
            (Some(_), Some(secret)) => secret.clone(),
            _ => return Err(SessionError::MissingRelay),
        };
        let relay_url = self
            .config
            .relay_url
            .clone()
            .ok_or(SessionError::MissingRelay)?;
        let link = ShareLink {
            room_id: derive_room_id(self.document_id, &secret),
            relay_url,
            buffering: self.buffering,
            secret,
            document_id: self.document_id,
            display_name: Some(self.config.participant_name.clone()),
        };
        link.to_url(&self.config.share_base_url)
            .map_err(SessionError::ShareLink)
    }

    /// Stop collaborating: push a final snapshot (buffering rooms),
    /// say goodbye, disconnect, return to Local. Local edits continue
    /// to work and persist.
    pub fn unshare(&mut self) {
        if let Some(channel) = self.channel.take() {
            if self.buffering {
                if let Err(e) = channel.push_snapshot(self.replica.encode_state()) {
                    log::warn!("Final snapshot push failed: {e}");
                }
            }
            let goodbye = self.roster.lock().unwrap().goodbye_message();
            let _ = channel.send(&SyncMessage::Presence {
                participant_id: self.participant_id,
                update: goodbye,
            });
            // Commands are ordered: the snapshot and goodbye flush
            // before the stop is processed.
            channel.stop();
        }
        self.secret = None;
        self.roster.lock().unwrap().clear_remotes();
        self.buffering = false;
        self.update_state(|s| {
            s.mode = SessionMode::Local;
            s.connected = false;
            s.syncing = false;
            s.reconnecting = false;
            s.peer_count = 0;
            s.room_id = None;
        });
    }

    /// Unconditional teardown: disconnect, cancel timers, await the
    /// final persistence flush on a best-effort basis.
    pub async fn close(mut self) {
        self.unshare();
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Some(flush) = self.flush.take() {
            flush.shutdown();
        }
        if let Some(task) = self.flush_task.take() {
            if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
                log::warn!("Persistence flush still running at teardown");
            }
        }
        self.update_state(|s| *s = SyncState::default());
        log::info!("Session for {} closed", self.document_id);
    }

    fn connect_channel(
        &mut self,
        relay_url: String,
        secret: Secret,
        room_id: Option<RoomId>,
        buffering: bool,
    ) -> Result<(), SessionError> {
        let room_id = room_id.unwrap_or_else(|| derive_room_id(self.document_id, &secret));
        let token = derive_access_token(&secret, &room_id);
        let credential = AccessCredential { room_id, token };
        let cipher = PayloadCipher::from_secret(&secret);

        let mut channel_config = ChannelConfig::new(relay_url, credential, self.participant_id);
        channel_config.buffering = buffering;
        let mut channel = SecureChannel::new(channel_config, cipher);
        let event_rx = match channel.take_event_rx() {
            Some(rx) => rx,
            None => return Err(SessionError::Channel(ChannelError::AlreadyStarted)),
        };
        let supervisor = channel.start()?;

        self.tasks.push(supervisor);
        let event_loop = self.spawn_event_loop(channel.clone(), event_rx);
        self.tasks.push(event_loop);
        let heartbeat = self.spawn_heartbeat(channel.clone());
        self.tasks.push(heartbeat);

        self.channel = Some(channel);
        self.secret = Some(secret);
        self.buffering = buffering;
        self.update_state(|s| {
            s.mode = SessionMode::Shared;
            s.syncing = true;
            s.room_id = Some(room_id.to_text());
            s.error = None;
        });
        Ok(())
    }

    // ─── Background tasks ─────────────────────────────────────────────

    fn spawn_event_loop(
        &self,
        channel: SecureChannel,
        mut event_rx: mpsc::Receiver<ChannelEvent>,
    ) -> tokio::task::JoinHandle<()> {
        let replica = self.replica.clone();
        let roster = self.roster.clone();
        let state_tx = self.state_tx.clone();
        let flush = self.flush.clone();
        let participant_id = self.participant_id;
        let handshake_timeout = self.config.handshake_timeout;

        tokio::spawn(async move {
            let mut handshake_deadline: Option<tokio::time::Instant> = None;
            loop {
                let event = match handshake_deadline {
                    Some(deadline) => {
                        match tokio::time::timeout_at(deadline, event_rx.recv()).await {
                            Ok(event) => event,
                            Err(_) => {
                                // Bounded wait: proceed with local state.
                                handshake_deadline = None;
                                state_tx.send_modify(|s| s.syncing = false);
                                log::info!("Sync handshake timed out; using local state");
                                continue;
                            }
                        }
                    }
                    None => event_rx.recv().await,
                };
                let Some(event) = event else { break };

                match event {
                    ChannelEvent::Connected { peers } => {
                        state_tx.send_modify(|s| {
                            s.connected = true;
                            s.reconnecting = false;
                            s.syncing = true;
                            s.peer_count = peers;
                            s.error = None;
                        });

                        // Re-run the handshake on every (re)connect;
                        // idempotent merges absorb any redelivery.
                        let request = SyncMessage::SyncRequest {
                            participant_id,
                            state_vector: replica.state_vector(),
                        };
                        if let Err(e) = channel.send(&request) {
                            log::warn!("Sync request failed: {e}");
                        }
                        let hello = roster.lock().unwrap().hello_message();
                        let _ = channel.send(&SyncMessage::Presence {
                            participant_id,
                            update: hello,
                        });
                        handshake_deadline =
                            Some(tokio::time::Instant::now() + handshake_timeout);
                    }

                    ChannelEvent::Message(SyncMessage::SyncRequest {
                        participant_id: from,
                        state_vector,
                    }) => {
                        if from == participant_id {
                            continue;
                        }
                        match replica.diff(&state_vector) {
                            Ok(update) => {
                                let response = SyncMessage::SyncResponse {
                                    participant_id,
                                    update,
                                };
                                if let Err(e) = channel.send(&response) {
                                    log::warn!("Sync response failed: {e}");
                                }
                            }
                            Err(e) => log::warn!("Ignoring bad sync request: {e}"),
                        }
                    }

                    ChannelEvent::Message(SyncMessage::SyncResponse {
                        participant_id: from,
                        update,
                    }) => {
                        if from == participant_id {
                            continue;
                        }
                        match replica.apply_update(&update) {
                            Ok(()) => {
                                if let Some(flush) = &flush {
                                    flush.enqueue_update(update);
                                }
                                handshake_deadline = None;
                                state_tx.send_modify(|s| s.syncing = false);
                            }
                            Err(e) => log::warn!("Dropping bad sync response: {e}"),
                        }
                    }

                    ChannelEvent::Message(SyncMessage::Update {
                        participant_id: from,
                        update,
                    }) => {
                        if from == participant_id {
                            continue;
                        }
                        match replica.apply_update(&update) {
                            Ok(()) => {
                                if let Some(flush) = &flush {
                                    flush.enqueue_update(update);
                                }
                            }
                            // A bad frame is dropped; the session continues.
                            Err(e) => log::warn!("Dropping bad update: {e}"),
                        }
                    }

                    ChannelEvent::Message(SyncMessage::Presence { update, .. }) => {
                        let is_hello = matches!(
                            update,
                            crate::presence::PresenceUpdate::Hello(_)
                        );
                        let (count, beat) = {
                            let mut roster = roster.lock().unwrap();
                            roster.handle_update(&update);
                            (roster.remote_count(), roster.heartbeat_message())
                        };
                        state_tx.send_modify(|s| s.peer_count = count);
                        // Answer a newcomer's hello right away so it
                        // does not wait a full heartbeat to see us.
                        if is_hello && update.participant_id() != participant_id {
                            let _ = channel.send(&SyncMessage::Presence {
                                participant_id,
                                update: beat,
                            });
                        }
                    }

                    ChannelEvent::Reconnecting { attempt } => {
                        log::debug!("Reconnecting (attempt {attempt})");
                        state_tx.send_modify(|s| {
                            s.connected = false;
                            s.reconnecting = true;
                        });
                    }

                    ChannelEvent::Disconnected => {
                        roster.lock().unwrap().clear_remotes();
                        state_tx.send_modify(|s| {
                            s.connected = false;
                            s.peer_count = 0;
                        });
                    }

                    ChannelEvent::Denied { reason } => {
                        log::error!("Relay denied access: {reason}");
                        state_tx.send_modify(|s| {
                            s.connected = false;
                            s.reconnecting = false;
                            s.syncing = false;
                            s.error = Some(reason);
                        });
                    }
                }
            }
        })
    }

    fn spawn_heartbeat(&self, channel: SecureChannel) -> tokio::task::JoinHandle<()> {
        let roster = self.roster.clone();
        let state_tx = self.state_tx.clone();
        let participant_id = self.participant_id;
        let interval = self.config.heartbeat;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let (beat, pruned, count) = {
                    let mut roster = roster.lock().unwrap();
                    let pruned = roster.prune_stale();
                    (roster.heartbeat_message(), pruned, roster.remote_count())
                };
                if !pruned.is_empty() {
                    state_tx.send_modify(|s| s.peer_count = count);
                }
                if channel
                    .send(&SyncMessage::Presence {
                        participant_id,
                        update: beat,
                    })
                    .is_err()
                {
                    break; // channel gone, session is tearing down
                }
            }
        })
    }

    // ─── Mutations ────────────────────────────────────────────────────

    pub fn create_element(&self, element: Element) -> Result<Uuid, SessionError> {
        self.insert_record(element, |model, record| {
            model.elements.insert(record.id, record);
        })
    }

    pub fn create_link(&self, link: Link) -> Result<Uuid, SessionError> {
        for endpoint in [link.source, link.target] {
            if !self.replica.contains(Collection::Elements, endpoint) {
                return Err(SessionError::NotFound {
                    collection: Collection::Elements,
                    id: endpoint,
                });
            }
        }
        self.insert_record(link, |model, record| {
            model.links.insert(record.id, record);
        })
    }

    pub fn add_comment(&self, comment: Comment) -> Result<Uuid, SessionError> {
        self.insert_record(comment, |model, record| {
            model.comments.insert(record.id, record);
        })
    }

    pub fn add_asset(&self, asset: Asset) -> Result<Uuid, SessionError> {
        self.insert_record(asset, |model, record| {
            model.assets.insert(record.id, record);
        })
    }

    pub fn update_element(
        &self,
        id: Uuid,
        patch: JsonMap<String, Value>,
    ) -> Result<(), SessionError> {
        self.patch_record::<Element, _>(id, patch, ActionKind::Edit, move |model, record| {
            model.elements.insert(id, record);
        })
    }

    /// Position change; a distinct history kind so the UI can label it.
    pub fn move_element(&self, id: Uuid, x: f64, y: f64) -> Result<(), SessionError> {
        let mut patch = JsonMap::new();
        patch.insert("x".into(), number(x));
        patch.insert("y".into(), number(y));
        self.patch_record::<Element, _>(id, patch, ActionKind::Move, move |model, record| {
            model.elements.insert(id, record);
        })
    }

    pub fn update_link(&self, id: Uuid, patch: JsonMap<String, Value>) -> Result<(), SessionError> {
        self.patch_record::<Link, _>(id, patch, ActionKind::Edit, move |model, record| {
            model.links.insert(id, record);
        })
    }

    /// Delete one element; incident links go in the same transaction.
    pub fn delete_element(&self, id: Uuid) -> Result<(), SessionError> {
        self.delete_elements(&[id])
    }

    /// Delete several elements and every link touching them, as one
    /// atomic transaction and one history entry.
    pub fn delete_elements(&self, ids: &[Uuid]) -> Result<(), SessionError> {
        let mut undo = Vec::new();
        let mut redo = Vec::new();
        let mut element_ids = Vec::new();

        for &id in ids {
            let Some(fields) = self.replica.entity_fields(Collection::Elements, id) else {
                continue; // already gone (possibly remotely)
            };
            undo.push(HistoryOp::PutEntity {
                collection: Collection::Elements,
                id,
                fields,
            });
            redo.push(HistoryOp::RemoveEntity {
                collection: Collection::Elements,
                id,
            });
            element_ids.push(id);
        }
        if element_ids.is_empty() {
            return Ok(());
        }

        // Cascade: relations incident to any deleted element.
        let mut link_ids = Vec::new();
        for link_id in self.replica.entity_ids(Collection::Links) {
            let Some(fields) = self.replica.entity_fields(Collection::Links, link_id) else {
                continue;
            };
            let Ok(link) = Link::from_fields(link_id, &fields) else {
                continue;
            };
            if element_ids.iter().any(|id| link.is_incident_to(*id)) {
                undo.push(HistoryOp::PutEntity {
                    collection: Collection::Links,
                    id: link_id,
                    fields,
                });
                redo.push(HistoryOp::RemoveEntity {
                    collection: Collection::Links,
                    id: link_id,
                });
                link_ids.push(link_id);
            }
        }

        let mut touched: Vec<(Collection, Uuid)> = element_ids
            .iter()
            .map(|id| (Collection::Elements, *id))
            .collect();
        touched.extend(link_ids.iter().map(|id| (Collection::Links, *id)));

        self.reconciler.apply_local(&touched, |model| {
            for id in &element_ids {
                model.elements.remove(id);
            }
            for id in &link_ids {
                model.links.remove(id);
            }
        });

        let ((), update) = self.replica.transact(|t| {
            for id in &element_ids {
                t.remove_entity(Collection::Elements, *id);
            }
            for id in &link_ids {
                t.remove_entity(Collection::Links, *id);
            }
            Ok(())
        })?;

        self.push_history(ActionKind::Delete, undo, redo);
        self.commit(update);
        Ok(())
    }

    pub fn delete_link(&self, id: Uuid) -> Result<(), SessionError> {
        self.remove_record(Collection::Links, id, |model| {
            model.links.remove(&id);
        })
    }

    pub fn delete_comment(&self, id: Uuid) -> Result<(), SessionError> {
        self.remove_record(Collection::Comments, id, |model| {
            model.comments.remove(&id);
        })
    }

    pub fn delete_asset(&self, id: Uuid) -> Result<(), SessionError> {
        self.remove_record(Collection::Assets, id, |model| {
            model.assets.remove(&id);
        })
    }

    /// Insert a copied subgraph in one transaction and one history
    /// entry. Ids must already be re-minted by the caller.
    pub fn paste_batch(
        &self,
        elements: Vec<Element>,
        links: Vec<Link>,
    ) -> Result<(), SessionError> {
        if elements.is_empty() && links.is_empty() {
            return Ok(());
        }

        let mut undo = Vec::new();
        let mut redo = Vec::new();
        let mut touched = Vec::new();

        for element in &elements {
            let fields = element.to_fields();
            undo.push(HistoryOp::RemoveEntity {
                collection: Collection::Elements,
                id: element.id,
            });
            redo.push(HistoryOp::PutEntity {
                collection: Collection::Elements,
                id: element.id,
                fields,
            });
            touched.push((Collection::Elements, element.id));
        }
        for link in &links {
            undo.push(HistoryOp::RemoveEntity {
                collection: Collection::Links,
                id: link.id,
            });
            redo.push(HistoryOp::PutEntity {
                collection: Collection::Links,
                id: link.id,
                fields: link.to_fields(),
            });
            touched.push((Collection::Links, link.id));
        }

        {
            let elements = elements.clone();
            let links = links.clone();
            self.reconciler.apply_local(&touched, move |model| {
                for element in elements {
                    model.elements.insert(element.id, Arc::new(element));
                }
                for link in links {
                    model.links.insert(link.id, Arc::new(link));
                }
            });
        }

        let ((), update) = self.replica.transact(|t| {
            for element in &elements {
                t.put_entity(Collection::Elements, element.id, &element.to_fields());
            }
            for link in &links {
                t.put_entity(Collection::Links, link.id, &link.to_fields());
            }
            Ok(())
        })?;

        self.push_history(ActionKind::Paste, undo, redo);
        self.commit(update);
        Ok(())
    }

    /// Set (or, with `Null`, clear) a document metadata value.
    pub fn set_meta(&self, key: &str, value: Value) -> Result<(), SessionError> {
        let old = self.replica.meta_value(key).unwrap_or(Value::Null);

        {
            let key = key.to_string();
            let value = value.clone();
            self.reconciler.apply_local(&[], move |model| {
                if value.is_null() {
                    model.meta.remove(&key);
                } else {
                    model.meta.insert(key, value);
                }
            });
        }

        let ((), update) = self.replica.transact(|t| {
            t.set_meta(key, &value);
            Ok(())
        })?;

        self.push_history(
            ActionKind::Meta,
            vec![HistoryOp::SetMeta {
                key: key.to_string(),
                value: old,
            }],
            vec![HistoryOp::SetMeta {
                key: key.to_string(),
                value,
            }],
        );
        self.commit(update);
        Ok(())
    }

    // ─── Undo / redo ──────────────────────────────────────────────────

    /// Replay the most recent action's inverse. Ops whose target a
    /// remote peer deleted meanwhile degrade to per-op no-ops.
    pub fn undo(&self) -> Result<HistoryOutcome, SessionError> {
        let action = self.history.lock().unwrap().undo();
        match action {
            Some(action) => self.replay(&action.undo),
            None => Ok(HistoryOutcome::default()),
        }
    }

    /// Replay the most recently undone action.
    pub fn redo(&self) -> Result<HistoryOutcome, SessionError> {
        let action = self.history.lock().unwrap().redo();
        match action {
            Some(action) => self.replay(&action.redo),
            None => Ok(HistoryOutcome::default()),
        }
    }

    pub fn can_undo(&self) -> bool {
        self.history.lock().unwrap().can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.history.lock().unwrap().can_redo()
    }

    fn replay(&self, ops: &[HistoryOp]) -> Result<HistoryOutcome, SessionError> {
        let mut outcome = HistoryOutcome::default();
        let ((), update) = self.replica.transact(|t| {
            for op in ops {
                match op {
                    HistoryOp::PutEntity {
                        collection,
                        id,
                        fields,
                    } => {
                        t.put_entity(*collection, *id, fields);
                        outcome.applied += 1;
                    }
                    HistoryOp::PatchEntity {
                        collection,
                        id,
                        patch,
                    } => {
                        if t.patch_entity(*collection, *id, patch) {
                            outcome.applied += 1;
                        } else {
                            log::warn!("History replay: {collection}/{id} is gone, skipping");
                            outcome.skipped += 1;
                        }
                    }
                    HistoryOp::RemoveEntity { collection, id } => {
                        if t.remove_entity(*collection, *id) {
                            outcome.applied += 1;
                        } else {
                            outcome.skipped += 1;
                        }
                    }
                    HistoryOp::SetMeta { key, value } => {
                        t.set_meta(key, value);
                        outcome.applied += 1;
                    }
                }
            }
            Ok(())
        })?;

        // Replay bypasses the short-circuit; reconcile synchronously so
        // the undo is visible before this call returns.
        self.reconciler.run_pass();
        self.commit(update);
        Ok(outcome)
    }

    // ─── Presence ─────────────────────────────────────────────────────

    pub fn set_cursor(&self, cursor: Option<Point>) {
        let update = self.roster.lock().unwrap().set_cursor(cursor);
        if let Some(update) = update {
            self.send_presence(update);
        }
    }

    pub fn set_selection(&self, selection: Vec<Uuid>) {
        let update = self.roster.lock().unwrap().set_selection(selection);
        self.send_presence(update);
    }

    pub fn set_editing_target(&self, target: Option<Uuid>) {
        let update = self.roster.lock().unwrap().set_editing_target(target);
        self.send_presence(update);
    }

    /// Name/color change, published immediately.
    pub fn set_identity(&self, name: impl Into<String>, color: Option<[f32; 4]>) {
        let update = self.roster.lock().unwrap().set_identity(name, color);
        self.send_presence(update);
    }

    fn send_presence(&self, update: crate::presence::PresenceUpdate) {
        if let Some(channel) = &self.channel {
            let _ = channel.send(&SyncMessage::Presence {
                participant_id: self.participant_id,
                update,
            });
        }
    }

    // ─── Reads ────────────────────────────────────────────────────────

    pub fn read_model(&self) -> Arc<RwLock<ReadModel>> {
        self.reconciler.model()
    }

    /// Revision ticks; consumers re-read the model on change.
    pub fn model_changes(&self) -> watch::Receiver<u64> {
        self.reconciler.subscribe()
    }

    pub fn sync_state(&self) -> watch::Receiver<SyncState> {
        self.state_tx.subscribe()
    }

    pub fn current_state(&self) -> SyncState {
        self.state_tx.borrow().clone()
    }

    /// Live remote participants.
    pub fn presence(&self) -> Vec<PresenceRecord> {
        self.roster.lock().unwrap().remote_records()
    }

    pub fn document_id(&self) -> Uuid {
        self.document_id
    }

    pub fn participant_id(&self) -> Uuid {
        self.participant_id
    }

    /// Direct replica access, mainly for tests and export tooling.
    pub fn replica(&self) -> &Arc<ReplicaDocument> {
        &self.replica
    }

    /// The persistent store, when this session has one.
    pub fn store(&self) -> Option<&Arc<DocumentStore>> {
        self.store.as_ref()
    }

    // ─── Internals ────────────────────────────────────────────────────

    fn insert_record<R, F>(&self, record: R, insert: F) -> Result<Uuid, SessionError>
    where
        R: BoardRecord,
        F: FnOnce(&mut ReadModel, Arc<R>),
    {
        let collection = R::COLLECTION;
        let id = record.id();
        let fields = record.to_fields();

        // Read model first: read-your-own-write before any flush.
        self.reconciler
            .apply_local(&[(collection, id)], move |model| {
                insert(model, Arc::new(record));
            });

        let ((), update) = self.replica.transact(|t| {
            t.put_entity(collection, id, &fields);
            Ok(())
        })?;

        self.push_history(
            ActionKind::Create,
            vec![HistoryOp::RemoveEntity { collection, id }],
            vec![HistoryOp::PutEntity {
                collection,
                id,
                fields,
            }],
        );
        self.commit(update);
        Ok(id)
    }

    fn patch_record<R, F>(
        &self,
        id: Uuid,
        patch: JsonMap<String, Value>,
        kind: ActionKind,
        insert: F,
    ) -> Result<(), SessionError>
    where
        R: BoardRecord,
        F: FnOnce(&mut ReadModel, Arc<R>),
    {
        let collection = R::COLLECTION;
        let current = self
            .replica
            .entity_fields(collection, id)
            .ok_or(SessionError::NotFound { collection, id })?;

        let mut undo_patch = JsonMap::new();
        for key in patch.keys() {
            undo_patch.insert(
                key.clone(),
                current.get(key).cloned().unwrap_or(Value::Null),
            );
        }

        let mut merged = current;
        for (key, value) in &patch {
            if value.is_null() {
                merged.remove(key);
            } else {
                merged.insert(key.clone(), value.clone());
            }
        }
        let record = R::from_fields(id, &merged)?;

        self.reconciler
            .apply_local(&[(collection, id)], move |model| {
                insert(model, Arc::new(record));
            });

        let ((), update) = self.replica.transact(|t| {
            t.patch_entity(collection, id, &patch);
            Ok(())
        })?;

        self.push_history(
            kind,
            vec![HistoryOp::PatchEntity {
                collection,
                id,
                patch: undo_patch,
            }],
            vec![HistoryOp::PatchEntity {
                collection,
                id,
                patch,
            }],
        );
        self.commit(update);
        Ok(())
    }

    fn remove_record<F>(
        &self,
        collection: Collection,
        id: Uuid,
        remove: F,
    ) -> Result<(), SessionError>
    where
        F: FnOnce(&mut ReadModel),
    {
        let Some(fields) = self.replica.entity_fields(collection, id) else {
            return Ok(()); // already gone
        };

        self.reconciler.apply_local(&[(collection, id)], remove);

        let ((), update) = self.replica.transact(|t| {
            t.remove_entity(collection, id);
            Ok(())
        })?;

        self.push_history(
            ActionKind::Delete,
            vec![HistoryOp::PutEntity {
                collection,
                id,
                fields,
            }],
            vec![HistoryOp::RemoveEntity { collection, id }],
        );
        self.commit(update);
        Ok(())
    }

    fn push_history(&self, kind: ActionKind, undo: Vec<HistoryOp>, redo: Vec<HistoryOp>) {
        self.history
            .lock()
            .unwrap()
            .push(HistoryAction { kind, undo, redo });
    }

    /// Background propagation of one committed update: persistence
    /// flush and (when shared) broadcast. Never blocks the caller.
    fn commit(&self, update: Vec<u8>) {
        if let Some(flush) = &self.flush {
            flush.enqueue_update(update.clone());
        }
        if let Some(channel) = &self.channel {
            if let Err(e) = channel.send(&SyncMessage::Update {
                participant_id: self.participant_id,
                update,
            }) {
                log::warn!("Broadcast failed: {e}");
            }
        }
    }

    fn update_state(&self, f: impl FnOnce(&mut SyncState)) {
        self.state_tx.send_modify(f);
    }
}

fn number(v: f64) -> Value {
    serde_json::Number::from_f64(v)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}
