//! Mergeable replica of one investigation board document.
//!
//! All shared state lives in a single Yrs document with named top-level
//! collections: `meta` (flat key/value) plus `elements`, `links`,
//! `comments` and `assets`, each an id-keyed map of per-entity field maps.
//!
//! Convergence contract: merging encoded updates is commutative,
//! associative and idempotent. Two replicas that apply the same set of
//! updates, in any order and with any duplication, reach identical state.
//! Concurrent writes to different fields of one record never conflict;
//! same-field writes resolve deterministically by causal order.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value};
use uuid::Uuid;
use yrs::types::{EntryChange, Event, PathSegment};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Any, DeepObservable, Doc, Map, MapPrelim, MapRef, Out, ReadTxn, StateVector, Subscription,
    Transact, TransactionMut, Update,
};

/// Map name for the flat document metadata collection.
const META: &str = "meta";

/// The id-keyed entity collections of a board document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Collection {
    Elements,
    Links,
    Comments,
    Assets,
}

impl Collection {
    /// All entity collections, in rebuild order.
    pub const ALL: [Collection; 4] = [
        Collection::Elements,
        Collection::Links,
        Collection::Comments,
        Collection::Assets,
    ];

    /// The Yrs root map name backing this collection.
    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Elements => "elements",
            Collection::Links => "links",
            Collection::Comments => "comments",
            Collection::Assets => "assets",
        }
    }
}

impl std::fmt::Display for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What happened to a single entity within one transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeKind {
    /// Entity map inserted (or wholesale replaced) under its id.
    Added,
    /// Entity map removed.
    Removed,
    /// Individual fields of an existing entity changed.
    Fields(Vec<String>),
}

/// One change record emitted to subscribers after a transaction commits.
#[derive(Debug, Clone, PartialEq)]
pub enum DocChange {
    Entity {
        collection: Collection,
        entity_id: Uuid,
        kind: ChangeKind,
    },
    Meta {
        keys: Vec<String>,
    },
}

/// Replica-level errors.
#[derive(Debug, Clone)]
pub enum ReplicaError {
    /// An incremental update failed to decode or apply.
    InvalidUpdate(String),
    /// A full-state snapshot failed to decode or apply.
    InvalidSnapshot(String),
    /// A remote state vector failed to decode.
    InvalidStateVector(String),
    /// Entity lookup failed.
    NotFound {
        collection: Collection,
        entity_id: Uuid,
    },
}

impl std::fmt::Display for ReplicaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplicaError::InvalidUpdate(e) => write!(f, "Invalid update: {e}"),
            ReplicaError::InvalidSnapshot(e) => write!(f, "Invalid snapshot: {e}"),
            ReplicaError::InvalidStateVector(e) => write!(f, "Invalid state vector: {e}"),
            ReplicaError::NotFound {
                collection,
                entity_id,
            } => write!(f, "Entity not found: {collection}/{entity_id}"),
        }
    }
}

impl std::error::Error for ReplicaError {}

type ChangeHandler = Box<dyn Fn(&[DocChange]) + Send + Sync>;

/// Fan-out point for change records; observers are registered once and
/// live as long as the document.
#[derive(Default)]
struct ChangeHub {
    handlers: RwLock<Vec<ChangeHandler>>,
}

impl ChangeHub {
    fn dispatch(&self, changes: &[DocChange]) {
        for handler in self.handlers.read().unwrap().iter() {
            handler(changes);
        }
    }
}

/// The mergeable CRDT container holding all shared state of one board.
///
/// Owned exclusively by one sync session. Local writes and incoming
/// remote updates both go through the same transactional API; no outer
/// lock is needed because the merge is commutative by construction.
pub struct ReplicaDocument {
    doc: Doc,
    meta: MapRef,
    collections: HashMap<Collection, MapRef>,
    hub: Arc<ChangeHub>,
    _subscriptions: Vec<Subscription>,
}

impl ReplicaDocument {
    /// Create an empty replica with all collections pre-registered.
    pub fn new() -> Self {
        let doc = Doc::new();
        let meta = doc.get_or_insert_map(META);

        let mut collections = HashMap::new();
        for collection in Collection::ALL {
            collections.insert(collection, doc.get_or_insert_map(collection.as_str()));
        }

        let hub = Arc::new(ChangeHub::default());

        let mut subscriptions = Vec::with_capacity(Collection::ALL.len() + 1);
        for collection in Collection::ALL {
            let map = collections[&collection].clone();
            subscriptions.push(Self::observe_collection(&map, collection, hub.clone()));
        }
        subscriptions.push(Self::observe_meta(&meta, hub.clone()));

        Self {
            doc,
            meta,
            collections,
            hub,
            _subscriptions: subscriptions,
        }
    }

    /// Register a change observer. Observers fire once per committed
    /// transaction per touched root collection, after the write is applied.
    pub fn on_change(&self, handler: impl Fn(&[DocChange]) + Send + Sync + 'static) {
        self.hub.handlers.write().unwrap().push(Box::new(handler));
    }

    fn observe_collection(
        map: &MapRef,
        collection: Collection,
        hub: Arc<ChangeHub>,
    ) -> Subscription {
        map.observe_deep(move |txn, events| {
            let mut changes = Vec::new();
            for event in events.iter() {
                let Event::Map(e) = event else { continue };
                let path = e.path();
                if path.is_empty() {
                    // Top level of the collection: entity added / removed.
                    for (key, change) in e.keys(txn) {
                        let Ok(entity_id) = Uuid::parse_str(key.as_ref()) else {
                            log::warn!("Ignoring non-uuid key in {collection}: {key}");
                            continue;
                        };
                        let kind = match change {
                            EntryChange::Inserted(_) | EntryChange::Updated(_, _) => {
                                ChangeKind::Added
                            }
                            EntryChange::Removed(_) => ChangeKind::Removed,
                        };
                        changes.push(DocChange::Entity {
                            collection,
                            entity_id,
                            kind,
                        });
                    }
                } else {
                    // Nested one level down: field edits within an entity map.
                    let Some(PathSegment::Key(id_key)) = path.into_iter().next() else {
                        continue;
                    };
                    let Ok(entity_id) = Uuid::parse_str(id_key.as_ref()) else {
                        continue;
                    };
                    let fields = e.keys(txn).keys().map(|k| k.to_string()).collect();
                    changes.push(DocChange::Entity {
                        collection,
                        entity_id,
                        kind: ChangeKind::Fields(fields),
                    });
                }
            }
            if !changes.is_empty() {
                hub.dispatch(&changes);
            }
        })
    }

    fn observe_meta(map: &MapRef, hub: Arc<ChangeHub>) -> Subscription {
        map.observe_deep(move |txn, events| {
            let mut keys = Vec::new();
            for event in events.iter() {
                let Event::Map(e) = event else { continue };
                if !e.path().is_empty() {
                    continue;
                }
                keys.extend(e.keys(txn).keys().map(|k| k.to_string()));
            }
            if !keys.is_empty() {
                hub.dispatch(&[DocChange::Meta { keys }]);
            }
        })
    }

    // ─── Transactions ─────────────────────────────────────────────────

    /// Group writes into one atomic transaction.
    ///
    /// Observers fire once when the transaction commits; the returned
    /// bytes are the encoded incremental update for broadcast and
    /// persistence.
    pub fn transact<T, F>(&self, f: F) -> Result<(T, Vec<u8>), ReplicaError>
    where
        F: FnOnce(&mut ReplicaTxn<'_>) -> Result<T, ReplicaError>,
    {
        let txn = self.doc.transact_mut();
        let mut replica_txn = ReplicaTxn {
            txn,
            meta: &self.meta,
            collections: &self.collections,
        };
        let out = f(&mut replica_txn)?;
        let update = replica_txn.txn.encode_update_v1();
        Ok((out, update))
    }

    // ─── Reads ────────────────────────────────────────────────────────

    /// Read one entity's field map, or `None` if absent.
    pub fn entity_fields(
        &self,
        collection: Collection,
        entity_id: Uuid,
    ) -> Option<JsonMap<String, Value>> {
        let txn = self.doc.transact();
        let map = &self.collections[&collection];
        match map.get(&txn, &entity_id.to_string()) {
            Some(Out::YMap(entity)) => Some(map_to_json(&txn, &entity)),
            _ => None,
        }
    }

    /// All entity ids currently present in a collection.
    pub fn entity_ids(&self, collection: Collection) -> Vec<Uuid> {
        let txn = self.doc.transact();
        let map = &self.collections[&collection];
        map.keys(&txn)
            .filter_map(|k| Uuid::parse_str(k).ok())
            .collect()
    }

    /// Whether an entity exists.
    pub fn contains(&self, collection: Collection, entity_id: Uuid) -> bool {
        let txn = self.doc.transact();
        self.collections[&collection]
            .get(&txn, &entity_id.to_string())
            .is_some()
    }

    /// Number of entities in a collection.
    pub fn len(&self, collection: Collection) -> u32 {
        let txn = self.doc.transact();
        self.collections[&collection].len(&txn)
    }

    /// Whether a collection is empty.
    pub fn is_empty(&self, collection: Collection) -> bool {
        self.len(collection) == 0
    }

    /// Read one metadata value.
    pub fn meta_value(&self, key: &str) -> Option<Value> {
        let txn = self.doc.transact();
        match self.meta.get(&txn, key) {
            Some(out) => {
                let v = json_from_out(&txn, out);
                if v.is_null() {
                    None
                } else {
                    Some(v)
                }
            }
            None => None,
        }
    }

    /// All metadata entries.
    pub fn meta_entries(&self) -> JsonMap<String, Value> {
        let txn = self.doc.transact();
        map_to_json(&txn, &self.meta)
    }

    // ─── Sync surface ─────────────────────────────────────────────────

    /// Encode this replica's state vector for a sync handshake.
    pub fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Encode the full document state as one update blob.
    pub fn encode_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Encode the updates a remote replica is missing, given its state vector.
    pub fn diff(&self, remote_state_vector: &[u8]) -> Result<Vec<u8>, ReplicaError> {
        let sv = StateVector::decode_v1(remote_state_vector)
            .map_err(|e| ReplicaError::InvalidStateVector(e.to_string()))?;
        let txn = self.doc.transact();
        Ok(txn.encode_state_as_update_v1(&sv))
    }

    /// Apply an incremental update received from a peer.
    ///
    /// Duplicate and out-of-order delivery are safe: already-known
    /// updates are absorbed without effect.
    pub fn apply_update(&self, update: &[u8]) -> Result<(), ReplicaError> {
        let decoded =
            Update::decode_v1(update).map_err(|e| ReplicaError::InvalidUpdate(e.to_string()))?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(decoded)
            .map_err(|e| ReplicaError::InvalidUpdate(e.to_string()))
    }

    /// Apply a full-state snapshot (hydration, initial sync).
    ///
    /// A corrupt or incompatible blob is rejected before any mutation;
    /// the caller must start from an empty replica and resynchronize.
    pub fn apply_state(&self, snapshot: &[u8]) -> Result<(), ReplicaError> {
        let decoded =
            Update::decode_v1(snapshot).map_err(|e| ReplicaError::InvalidSnapshot(e.to_string()))?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(decoded)
            .map_err(|e| ReplicaError::InvalidSnapshot(e.to_string()))
    }
}

impl Default for ReplicaDocument {
    fn default() -> Self {
        Self::new()
    }
}

/// Write handle inside one transaction.
pub struct ReplicaTxn<'doc> {
    txn: TransactionMut<'doc>,
    meta: &'doc MapRef,
    collections: &'doc HashMap<Collection, MapRef>,
}

impl ReplicaTxn<'_> {
    /// Insert (or wholesale replace) an entity with the given fields.
    /// `Null` field values are skipped.
    pub fn put_entity(
        &mut self,
        collection: Collection,
        entity_id: Uuid,
        fields: &JsonMap<String, Value>,
    ) {
        let map = &self.collections[&collection];
        let entity = map.insert(&mut self.txn, entity_id.to_string(), MapPrelim::default());
        for (key, value) in fields {
            if value.is_null() {
                continue;
            }
            entity.insert(&mut self.txn, key.as_str(), any_from_json(value));
        }
    }

    /// Patch individual fields of an existing entity. A `Null` value
    /// removes the field. Returns `false` if the entity does not exist.
    pub fn patch_entity(
        &mut self,
        collection: Collection,
        entity_id: Uuid,
        patch: &JsonMap<String, Value>,
    ) -> bool {
        let map = &self.collections[&collection];
        let entity = match map.get(&self.txn, &entity_id.to_string()) {
            Some(Out::YMap(entity)) => entity,
            _ => return false,
        };
        for (key, value) in patch {
            if value.is_null() {
                entity.remove(&mut self.txn, key);
            } else {
                entity.insert(&mut self.txn, key.as_str(), any_from_json(value));
            }
        }
        true
    }

    /// Remove an entity. Returns `false` if it was already absent.
    pub fn remove_entity(&mut self, collection: Collection, entity_id: Uuid) -> bool {
        let map = &self.collections[&collection];
        map.remove(&mut self.txn, &entity_id.to_string()).is_some()
    }

    /// Set (or, with `Null`, clear) one metadata value.
    pub fn set_meta(&mut self, key: &str, value: &Value) {
        if value.is_null() {
            self.meta.remove(&mut self.txn, key);
        } else {
            self.meta.insert(&mut self.txn, key, any_from_json(value));
        }
    }
}

// ─── Value conversion ─────────────────────────────────────────────────

fn any_from_json(value: &Value) -> Any {
    match value {
        Value::Null => Any::Null,
        Value::Bool(b) => Any::Bool(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Any::BigInt(i)
            } else {
                Any::Number(n.as_f64().unwrap_or(0.0))
            }
        }
        Value::String(s) => Any::from(s.as_str()),
        Value::Array(items) => {
            let converted: Vec<Any> = items.iter().map(any_from_json).collect();
            Any::from(converted)
        }
        Value::Object(map) => {
            let converted: HashMap<String, Any> = map
                .iter()
                .map(|(k, v)| (k.clone(), any_from_json(v)))
                .collect();
            Any::from(converted)
        }
    }
}

fn json_from_any(any: &Any) -> Value {
    match any {
        Any::Null | Any::Undefined => Value::Null,
        Any::Bool(b) => Value::Bool(*b),
        Any::Number(n) => serde_json::Number::from_f64(*n)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Any::BigInt(i) => Value::Number((*i).into()),
        Any::String(s) => Value::String(s.to_string()),
        Any::Buffer(_) => Value::Null,
        Any::Array(items) => Value::Array(items.iter().map(json_from_any).collect()),
        Any::Map(map) => {
            let mut out = JsonMap::new();
            for (k, v) in map.iter() {
                out.insert(k.clone(), json_from_any(v));
            }
            Value::Object(out)
        }
    }
}

fn json_from_out<T: ReadTxn>(txn: &T, out: Out) -> Value {
    match out {
        Out::Any(any) => json_from_any(&any),
        Out::YMap(map) => Value::Object(map_to_json(txn, &map)),
        _ => Value::Null,
    }
}

fn map_to_json<T: ReadTxn>(txn: &T, map: &MapRef) -> JsonMap<String, Value> {
    let mut out = JsonMap::new();
    let keys: Vec<String> = map.keys(txn).map(|k| k.to_string()).collect();
    for key in keys {
        if let Some(value) = map.get(txn, &key) {
            out.insert(key, json_from_out(txn, value));
        }
    }
    out
}
