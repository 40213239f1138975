//! Convergence properties of the replica + reconciler pipeline.
//!
//! A fixed update set is applied to independent replicas in different
//! orders, with duplicates, and the resulting read models must be
//! identical.

use std::sync::Arc;
use std::time::Duration;

use caseboard_core::{Collection, Element, Link, Reconciler, ReplicaDocument};
use caseboard_core::model::BoardRecord;
use uuid::Uuid;

/// Build a fixed set of updates from a scratch writer replica:
/// creates, edits, a delete, and a link between two elements.
fn scripted_updates() -> (Vec<Vec<u8>>, Uuid, Uuid) {
    let writer = ReplicaDocument::new();
    let mut updates = Vec::new();

    let a = Element::new("Alice Vane", "person", 0.0, 0.0);
    let b = Element::new("Harbor Freight Ltd", "organization", 200.0, 80.0);
    let doomed = Element::new("scratch note", "note", -10.0, -10.0);
    let link = Link::new(a.id, b.id, "director of");

    for element in [&a, &b, &doomed] {
        let ((), update) = writer
            .transact(|t| {
                t.put_entity(Collection::Elements, element.id, &element.to_fields());
                Ok(())
            })
            .unwrap();
        updates.push(update);
    }

    let ((), update) = writer
        .transact(|t| {
            t.put_entity(Collection::Links, link.id, &link.to_fields());
            Ok(())
        })
        .unwrap();
    updates.push(update);

    let ((), update) = writer
        .transact(|t| {
            let mut patch = serde_json::Map::new();
            patch.insert("x".into(), serde_json::json!(42.0));
            patch.insert("pinned".into(), serde_json::json!(true));
            t.patch_entity(Collection::Elements, a.id, &patch);
            Ok(())
        })
        .unwrap();
    updates.push(update);

    let ((), update) = writer
        .transact(|t| {
            t.remove_entity(Collection::Elements, doomed.id);
            Ok(())
        })
        .unwrap();
    updates.push(update);

    (updates, a.id, link.id)
}

fn project(replica: Arc<ReplicaDocument>) -> Reconciler {
    let reconciler = Reconciler::new(replica, Duration::from_millis(1));
    reconciler.run_initial();
    reconciler
}

fn assert_models_equal(left: &Reconciler, right: &Reconciler) {
    let left_model = left.model();
    let left_model = left_model.read().unwrap();
    let right_model = right.model();
    let right_model = right_model.read().unwrap();

    assert_eq!(left_model.elements.len(), right_model.elements.len());
    for (id, record) in &left_model.elements {
        assert_eq!(**record, *right_model.elements[id]);
    }
    assert_eq!(left_model.links.len(), right_model.links.len());
    for (id, record) in &left_model.links {
        assert_eq!(**record, *right_model.links[id]);
    }
}

#[test]
fn replicas_converge_under_permutation_and_duplication() {
    let (updates, element_a, link_id) = scripted_updates();
    let n = updates.len();

    // In-order baseline.
    let baseline = Arc::new(ReplicaDocument::new());
    for update in &updates {
        baseline.apply_update(update).unwrap();
    }
    let baseline_view = project(baseline.clone());

    // Rotations, the full reversal, and an everything-twice schedule.
    let mut schedules: Vec<Vec<usize>> = Vec::new();
    for rotation in 0..n {
        schedules.push((0..n).map(|i| (i + rotation) % n).collect());
    }
    schedules.push((0..n).rev().collect());
    schedules.push((0..n).chain(0..n).collect());

    for schedule in schedules {
        let replica = Arc::new(ReplicaDocument::new());
        for index in &schedule {
            replica.apply_update(&updates[*index]).unwrap();
        }
        assert_eq!(
            replica.encode_state(),
            baseline.encode_state(),
            "replica state diverged for schedule {schedule:?}"
        );

        let view = project(replica);
        assert_models_equal(&baseline_view, &view);

        let model = view.model();
        let model = model.read().unwrap();
        assert_eq!(model.elements.len(), 2, "deleted element stays deleted");
        assert_eq!(model.elements[&element_a].x, 42.0);
        assert!(model.elements[&element_a].pinned);
        assert!(model.links.contains_key(&link_id));
    }
}

#[test]
fn double_apply_equals_single_apply() {
    let (updates, _, _) = scripted_updates();

    let once = ReplicaDocument::new();
    let twice = ReplicaDocument::new();
    for update in &updates {
        once.apply_update(update).unwrap();
        twice.apply_update(update).unwrap();
        twice.apply_update(update).unwrap();
    }

    assert_eq!(once.encode_state(), twice.encode_state());
}

#[test]
fn full_state_exchange_bootstraps_a_joiner() {
    let (updates, element_a, _) = scripted_updates();

    let veteran = ReplicaDocument::new();
    for update in &updates {
        veteran.apply_update(update).unwrap();
    }

    // A later joiner receives the full state in one blob.
    let joiner = Arc::new(ReplicaDocument::new());
    joiner.apply_state(&veteran.encode_state()).unwrap();
    assert_eq!(joiner.encode_state(), veteran.encode_state());

    let view = project(joiner);
    let model = view.model();
    let model = model.read().unwrap();
    assert_eq!(model.elements[&element_a].label, "Alice Vane");
}
