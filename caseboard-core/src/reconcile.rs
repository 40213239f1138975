//! Incremental projection of the replica into an application-facing
//! read model.
//!
//! Change records from [`ReplicaDocument`] accumulate in a pending set;
//! a debounce timer (independent of any rendering cycle) coalesces
//! bursts into one pass. Each pass partitions changes into structural
//! (entity added/removed — rebuild that collection) and field-level
//! (re-parse only the touched entity ids). Untouched records keep their
//! `Arc` identity across passes, so consumers can compare by pointer.
//!
//! Local writes short-circuit: `apply_local` updates the read model
//! synchronously before the replica write, and the matching change flag
//! is skipped on the next pass. A safety pass one debounce window later
//! re-parses those ids anyway, in case a concurrent remote write landed
//! in the same window.

use std::collections::{HashMap, HashSet};
use std::mem;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{watch, Notify};
use uuid::Uuid;

use crate::model::{Asset, BoardRecord, Comment, Element, Link};
use crate::replica::{ChangeKind, Collection, DocChange, ReplicaDocument};

/// Default debounce window for coalescing change bursts.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(15);

/// The normalized, application-facing view of one board document.
///
/// Single writer (the reconciler), many readers. Records are wrapped in
/// `Arc` and reused across passes when untouched.
#[derive(Debug, Default)]
pub struct ReadModel {
    pub elements: HashMap<Uuid, Arc<Element>>,
    pub links: HashMap<Uuid, Arc<Link>>,
    pub comments: HashMap<Uuid, Arc<Comment>>,
    pub assets: HashMap<Uuid, Arc<Asset>>,
    pub meta: HashMap<String, Value>,
    /// Bumped once per pass and per local short-circuit.
    pub revision: u64,
}

impl ReadModel {
    pub fn element(&self, id: Uuid) -> Option<Arc<Element>> {
        self.elements.get(&id).cloned()
    }

    pub fn link(&self, id: Uuid) -> Option<Arc<Link>> {
        self.links.get(&id).cloned()
    }

    /// All links touching the given element.
    pub fn links_incident_to(&self, element_id: Uuid) -> Vec<Arc<Link>> {
        self.links
            .values()
            .filter(|l| l.is_incident_to(element_id))
            .cloned()
            .collect()
    }
}

/// Accumulated, not-yet-reconciled change flags.
#[derive(Default)]
struct Pending {
    /// Collections with at least one entity added or removed.
    structural: HashSet<Collection>,
    /// Every entity id touched since the last pass, per collection.
    touched: HashMap<Collection, HashSet<Uuid>>,
    /// Entities already applied to the read model by a local
    /// short-circuit; skipped once, then rechecked.
    clean: HashSet<(Collection, Uuid)>,
    meta: bool,
}

impl Pending {
    fn is_empty(&self) -> bool {
        self.structural.is_empty() && self.touched.is_empty() && !self.meta
    }
}

struct Inner {
    replica: Arc<ReplicaDocument>,
    model: Arc<RwLock<ReadModel>>,
    pending: Mutex<Pending>,
    notify: Notify,
    debounce: Duration,
    changed_tx: watch::Sender<u64>,
}

/// The incremental projector. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Reconciler {
    inner: Arc<Inner>,
}

impl Reconciler {
    /// Create a reconciler over the given replica and subscribe to its
    /// change feed. The debounce task is spawned separately via
    /// [`Reconciler::spawn_debounce`].
    pub fn new(replica: Arc<ReplicaDocument>, debounce: Duration) -> Self {
        let (changed_tx, _) = watch::channel(0u64);
        let inner = Arc::new(Inner {
            replica: replica.clone(),
            model: Arc::new(RwLock::new(ReadModel::default())),
            pending: Mutex::new(Pending::default()),
            notify: Notify::new(),
            debounce,
            changed_tx,
        });

        // Weak so that dropping the session tears the cycle down.
        let weak: Weak<Inner> = Arc::downgrade(&inner);
        replica.on_change(move |changes| {
            let Some(inner) = weak.upgrade() else { return };
            {
                let mut pending = inner.pending.lock().unwrap();
                for change in changes {
                    match change {
                        DocChange::Entity {
                            collection,
                            entity_id,
                            kind,
                        } => {
                            if !matches!(kind, ChangeKind::Fields(_)) {
                                pending.structural.insert(*collection);
                            }
                            pending
                                .touched
                                .entry(*collection)
                                .or_default()
                                .insert(*entity_id);
                        }
                        DocChange::Meta { .. } => pending.meta = true,
                    }
                }
            }
            inner.notify.notify_one();
        });

        Self { inner }
    }

    /// Shared handle to the read model.
    pub fn model(&self) -> Arc<RwLock<ReadModel>> {
        self.inner.model.clone()
    }

    /// Revision notifications; consumers re-read the model on change.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.changed_tx.subscribe()
    }

    /// Wake the debounce task even without a replica change.
    pub fn schedule(&self) {
        self.inner.notify.notify_one();
    }

    /// Local-write short-circuit: apply a mutation to the read model
    /// *before* the corresponding replica write, and mark the touched
    /// entities so the next pass skips re-parsing them.
    pub fn apply_local<F>(&self, touched: &[(Collection, Uuid)], f: F)
    where
        F: FnOnce(&mut ReadModel),
    {
        {
            let mut model = self.inner.model.write().unwrap();
            f(&mut model);
            model.revision += 1;
            let _ = self.inner.changed_tx.send(model.revision);
        }
        let mut pending = self.inner.pending.lock().unwrap();
        for entry in touched {
            pending.clean.insert(*entry);
        }
    }

    /// Run one reconciliation pass synchronously. After it returns, the
    /// read model and the replica agree on every flagged entity.
    pub fn run_pass(&self) {
        self.inner.run_pass();
    }

    /// Rebuild every collection and the metadata from scratch.
    /// Used after hydration and initial sync.
    pub fn run_initial(&self) {
        {
            let mut pending = self.inner.pending.lock().unwrap();
            for collection in Collection::ALL {
                pending.structural.insert(collection);
            }
            pending.meta = true;
        }
        self.inner.run_pass();
    }

    /// Spawn the debounce loop: wait for a change notification, sleep
    /// one window so bursts coalesce, then run a pass.
    pub fn spawn_debounce(&self) -> tokio::task::JoinHandle<()> {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            loop {
                inner.notify.notified().await;
                tokio::time::sleep(inner.debounce).await;
                inner.run_pass();
            }
        })
    }
}

impl Inner {
    fn run_pass(&self) {
        let drained = {
            let mut pending = self.pending.lock().unwrap();
            if pending.is_empty() {
                return;
            }
            mem::take(&mut *pending)
        };

        let mut recheck: Vec<(Collection, Uuid)> = Vec::new();
        {
            let mut model = self.model.write().unwrap();
            for collection in Collection::ALL {
                let structural = drained.structural.contains(&collection);
                let empty = HashSet::new();
                let touched = drained.touched.get(&collection).unwrap_or(&empty);
                if !structural && touched.is_empty() {
                    continue;
                }
                match collection {
                    Collection::Elements => reconcile_collection::<Element>(
                        &self.replica,
                        &mut model.elements,
                        structural,
                        touched,
                        &drained.clean,
                        &mut recheck,
                    ),
                    Collection::Links => reconcile_collection::<Link>(
                        &self.replica,
                        &mut model.links,
                        structural,
                        touched,
                        &drained.clean,
                        &mut recheck,
                    ),
                    Collection::Comments => reconcile_collection::<Comment>(
                        &self.replica,
                        &mut model.comments,
                        structural,
                        touched,
                        &drained.clean,
                        &mut recheck,
                    ),
                    Collection::Assets => reconcile_collection::<Asset>(
                        &self.replica,
                        &mut model.assets,
                        structural,
                        touched,
                        &drained.clean,
                        &mut recheck,
                    ),
                }
            }
            if drained.meta {
                model.meta = self.replica.meta_entries().into_iter().collect();
            }
            model.revision += 1;
            let _ = self.changed_tx.send(model.revision);
        }

        // Safety pass: entities the local short-circuit already wrote
        // are re-parsed one window later to catch concurrent remote
        // edits that landed before the replica write.
        if !recheck.is_empty() {
            let mut pending = self.pending.lock().unwrap();
            for (collection, id) in recheck {
                pending.touched.entry(collection).or_default().insert(id);
            }
            self.notify.notify_one();
        }
    }
}

fn reconcile_collection<R: BoardRecord>(
    replica: &ReplicaDocument,
    records: &mut HashMap<Uuid, Arc<R>>,
    structural: bool,
    touched: &HashSet<Uuid>,
    clean: &HashSet<(Collection, Uuid)>,
    recheck: &mut Vec<(Collection, Uuid)>,
) {
    if structural {
        let mut rebuilt = HashMap::with_capacity(records.len());
        for id in replica.entity_ids(R::COLLECTION) {
            let skip = clean.contains(&(R::COLLECTION, id));
            if skip {
                recheck.push((R::COLLECTION, id));
            }
            // Untouched (and short-circuited) records keep their Arc.
            let reusable = if touched.contains(&id) && !skip {
                None
            } else {
                records.get(&id).cloned()
            };
            match reusable {
                Some(existing) => {
                    rebuilt.insert(id, existing);
                }
                None => {
                    if let Some(record) = parse_record::<R>(replica, id) {
                        rebuilt.insert(id, Arc::new(record));
                    } else if let Some(old) = records.get(&id) {
                        rebuilt.insert(id, old.clone());
                    }
                }
            }
        }
        *records = rebuilt;
    } else {
        for id in touched {
            if clean.contains(&(R::COLLECTION, *id)) {
                recheck.push((R::COLLECTION, *id));
                continue;
            }
            match replica.entity_fields(R::COLLECTION, *id) {
                None => {
                    records.remove(id);
                }
                Some(_) => {
                    if let Some(record) = parse_record::<R>(replica, *id) {
                        records.insert(*id, Arc::new(record));
                    }
                }
            }
        }
    }
}

fn parse_record<R: BoardRecord>(replica: &ReplicaDocument, id: Uuid) -> Option<R> {
    let fields = replica.entity_fields(R::COLLECTION, id)?;
    match R::from_fields(id, &fields) {
        Ok(record) => Some(record),
        Err(e) => {
            log::warn!("Skipping unparseable record {}/{id}: {e}", R::COLLECTION);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn put_element(replica: &ReplicaDocument, element: &Element) -> Vec<u8> {
        let ((), update) = replica
            .transact(|t| {
                t.put_entity(Collection::Elements, element.id, &element.to_fields());
                Ok(())
            })
            .unwrap();
        update
    }

    #[test]
    fn test_initial_pass_projects_everything() {
        let replica = Arc::new(ReplicaDocument::new());
        let element = Element::new("Shell Corp", "organization", 10.0, 20.0);
        put_element(&replica, &element);
        replica
            .transact(|t| {
                t.set_meta("title", &json!("Case 7"));
                Ok(())
            })
            .unwrap();

        let reconciler = Reconciler::new(replica, DEFAULT_DEBOUNCE);
        reconciler.run_initial();

        let model = reconciler.model();
        let model = model.read().unwrap();
        assert_eq!(model.elements.len(), 1);
        assert_eq!(model.elements[&element.id].label, "Shell Corp");
        assert_eq!(model.meta.get("title"), Some(&json!("Case 7")));
    }

    #[test]
    fn test_field_pass_preserves_untouched_identity() {
        let replica = Arc::new(ReplicaDocument::new());
        let a = Element::new("A", "person", 0.0, 0.0);
        let b = Element::new("B", "person", 5.0, 5.0);
        put_element(&replica, &a);
        put_element(&replica, &b);

        let reconciler = Reconciler::new(replica.clone(), DEFAULT_DEBOUNCE);
        reconciler.run_initial();

        let model_handle = reconciler.model();
        let (arc_a, arc_b) = {
            let model = model_handle.read().unwrap();
            (model.elements[&a.id].clone(), model.elements[&b.id].clone())
        };

        // Field edit on A only.
        replica
            .transact(|t| {
                let mut patch = serde_json::Map::new();
                patch.insert("x".into(), json!(99.0));
                t.patch_entity(Collection::Elements, a.id, &patch);
                Ok(())
            })
            .unwrap();
        reconciler.run_pass();

        let model = model_handle.read().unwrap();
        assert_eq!(model.elements[&a.id].x, 99.0);
        assert!(!Arc::ptr_eq(&model.elements[&a.id], &arc_a), "A re-parsed");
        assert!(Arc::ptr_eq(&model.elements[&b.id], &arc_b), "B untouched");
    }

    #[test]
    fn test_structural_pass_adds_and_removes() {
        let replica = Arc::new(ReplicaDocument::new());
        let a = Element::new("A", "person", 0.0, 0.0);
        put_element(&replica, &a);

        let reconciler = Reconciler::new(replica.clone(), DEFAULT_DEBOUNCE);
        reconciler.run_initial();

        let b = Element::new("B", "person", 1.0, 1.0);
        put_element(&replica, &b);
        replica
            .transact(|t| {
                t.remove_entity(Collection::Elements, a.id);
                Ok(())
            })
            .unwrap();
        reconciler.run_pass();

        let model = reconciler.model();
        let model = model.read().unwrap();
        assert!(!model.elements.contains_key(&a.id));
        assert!(model.elements.contains_key(&b.id));
    }

    #[test]
    fn test_unparseable_record_skipped() {
        let replica = Arc::new(ReplicaDocument::new());
        let good = Element::new("ok", "person", 0.0, 0.0);
        put_element(&replica, &good);

        // A link without endpoints never parses.
        let bad = Uuid::new_v4();
        replica
            .transact(|t| {
                let mut fields = serde_json::Map::new();
                fields.insert("label".into(), json!("dangling"));
                t.put_entity(Collection::Links, bad, &fields);
                Ok(())
            })
            .unwrap();

        let reconciler = Reconciler::new(replica, DEFAULT_DEBOUNCE);
        reconciler.run_initial();

        let model = reconciler.model();
        let model = model.read().unwrap();
        assert_eq!(model.elements.len(), 1);
        assert!(model.links.is_empty());
    }

    #[test]
    fn test_local_short_circuit_and_safety_recheck() {
        let replica = Arc::new(ReplicaDocument::new());
        let reconciler = Reconciler::new(replica.clone(), DEFAULT_DEBOUNCE);
        reconciler.run_initial();

        let element = Element::new("local", "note", 3.0, 4.0);

        // Read model first, replica second — read-your-own-write.
        reconciler.apply_local(&[(Collection::Elements, element.id)], |model| {
            model.elements.insert(element.id, Arc::new(element.clone()));
        });
        {
            let model = reconciler.model();
            let model = model.read().unwrap();
            assert!(model.elements.contains_key(&element.id));
        }

        put_element(&replica, &element);

        // First pass skips the short-circuited entity, keeping identity.
        let before = reconciler.model().read().unwrap().elements[&element.id].clone();
        reconciler.run_pass();
        let after = reconciler.model().read().unwrap().elements[&element.id].clone();
        assert!(Arc::ptr_eq(&before, &after));

        // Safety pass re-parses; model still agrees with the replica.
        reconciler.run_pass();
        let model = reconciler.model();
        let model = model.read().unwrap();
        assert_eq!(model.elements[&element.id].label, "local");
        assert_eq!(model.elements[&element.id].x, 3.0);
    }

    #[tokio::test]
    async fn test_debounce_coalesces_bursts() {
        let replica = Arc::new(ReplicaDocument::new());
        let reconciler = Reconciler::new(replica.clone(), Duration::from_millis(10));
        reconciler.run_initial();
        let task = reconciler.spawn_debounce();

        for i in 0..5 {
            let element = Element::new(format!("e{i}"), "note", i as f64, 0.0);
            put_element(&replica, &element);
        }

        tokio::time::sleep(Duration::from_millis(100)).await;

        {
            let model = reconciler.model();
            let model = model.read().unwrap();
            assert_eq!(model.elements.len(), 5);
        }
        task.abort();
    }
}
