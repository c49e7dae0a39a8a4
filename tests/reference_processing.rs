//! Soft/weak/finalizer/phantom reference semantics across collections.

use cinder::collector::GcCause;
use cinder::config::{CollectorType, HeapConfig};
use cinder::object::{store_ref_slot, ObjectModel, ReferenceKind};
use cinder::test_model::{TestHarness, TestObjectModel};

fn ms_config() -> HeapConfig {
    HeapConfig {
        collector_type: CollectorType::Ms,
        post_zygote_collector_type: CollectorType::Ms,
        background_collector_type: CollectorType::Ms,
        initial_size: 4 * 1024 * 1024,
        growth_limit: 16 * 1024 * 1024,
        capacity: 16 * 1024 * 1024,
        ..HeapConfig::default()
    }
}

#[test]
fn soft_references_survive_non_clearing_gc() {
    let h = TestHarness::new(ms_config());
    let referent = h.alloc(0);
    let soft = h.alloc_reference(ReferenceKind::Soft, Some(referent));
    h.thread.push_root(soft);

    h.heap.collect(GcCause::Explicit, false);

    assert_eq!(h.referent_of(soft), Some(referent));
    assert!(h.heap.is_live_object(referent));
    assert!(h.heap.take_cleared_references().is_empty());
}

#[test]
fn soft_references_cleared_on_explicit_clearing_gc() {
    let h = TestHarness::new(ms_config());
    let referent = h.alloc(0);
    let soft = h.alloc_reference(ReferenceKind::Soft, Some(referent));
    h.thread.push_root(soft);

    h.heap.collect(GcCause::Explicit, true);

    assert_eq!(h.referent_of(soft), None);
    let cleared = h.heap.take_cleared_references();
    assert_eq!(cleared, vec![soft]);
    // Cleared exactly once: a second collection leaves the list empty.
    h.heap.collect(GcCause::Explicit, true);
    assert!(h.heap.take_cleared_references().is_empty());
}

#[test]
fn weak_references_cleared_when_referent_unreachable() {
    let h = TestHarness::new(ms_config());
    let strong_target = h.alloc(0);
    let dead_target = h.alloc(0);
    let weak_live = h.alloc_reference(ReferenceKind::Weak, Some(strong_target));
    let weak_dead = h.alloc_reference(ReferenceKind::Weak, Some(dead_target));
    h.thread.push_root(weak_live);
    h.thread.push_root(weak_dead);
    h.thread.push_root(strong_target);

    h.heap.collect(GcCause::Explicit, false);

    assert_eq!(h.referent_of(weak_live), Some(strong_target));
    assert_eq!(h.referent_of(weak_dead), None);
    assert_eq!(h.heap.take_cleared_references(), vec![weak_dead]);
}

#[test]
fn finalizer_references_revive_their_referent_once() {
    let h = TestHarness::new(ms_config());
    let referent = h.alloc(0);
    let finalizer = h.alloc_reference(ReferenceKind::Finalizer, Some(referent));
    h.thread.push_root(finalizer);

    h.heap.collect(GcCause::Explicit, false);

    // Revived: referent cleared, zombie set, referent still live so the
    // finalizer body can run against it.
    assert_eq!(h.referent_of(finalizer), None);
    assert_eq!(h.zombie_of(finalizer), Some(referent));
    assert!(h.heap.is_live_object(referent));
    assert_eq!(h.heap.take_cleared_references(), vec![finalizer]);

    // The zombie link keeps it alive across further collections.
    h.heap.collect(GcCause::Explicit, false);
    assert!(h.heap.is_live_object(referent));

    // Once the finalizer daemon consumes the zombie, the object dies.
    // SAFETY: the zombie slot is in-bounds for the reference layout.
    unsafe { store_ref_slot(TestObjectModel.zombie_slot(finalizer), None) };
    h.heap.collect(GcCause::Explicit, false);
    assert!(!h.heap.is_live_object(referent));
}

#[test]
fn phantom_references_cleared_after_finalizer_marking() {
    let h = TestHarness::new(ms_config());
    let referent = h.alloc(0);
    let phantom = h.alloc_reference(ReferenceKind::Phantom, Some(referent));
    h.thread.push_root(phantom);

    h.heap.collect(GcCause::Explicit, false);

    assert_eq!(h.referent_of(phantom), None);
    assert_eq!(h.heap.take_cleared_references(), vec![phantom]);
    assert!(!h.heap.is_live_object(referent));
}

#[test]
fn unreachable_reference_objects_are_simply_swept() {
    let h = TestHarness::new(ms_config());
    let referent = h.alloc(0);
    let _weak = h.alloc_reference(ReferenceKind::Weak, Some(referent));

    h.heap.collect(GcCause::Explicit, false);

    // Neither the reference nor its referent was reachable; nothing lands
    // on the cleared list.
    assert!(h.heap.take_cleared_references().is_empty());
    assert_eq!(h.heap.main_space().unwrap().objects_allocated(), 0);
}

#[test]
fn heap_fill_with_soft_references_then_clearing_pass() {
    // A heap filled mostly with softly-held buffers keeps them through the
    // allocation-pressure GCs, and an explicit clearing pass drops them all.
    let config = HeapConfig {
        initial_size: 2 * 1024 * 1024,
        growth_limit: 8 * 1024 * 1024,
        capacity: 8 * 1024 * 1024,
        large_object_threshold: 64 * 1024 * 1024,
        ..ms_config()
    };
    let h = TestHarness::new(config);

    const BUFFERS: usize = 300;
    let mut softs = Vec::new();
    for _ in 0..BUFFERS {
        let buffer = h.alloc_bytes(8 * 1024).unwrap();
        let soft = h.alloc_reference(ReferenceKind::Soft, Some(buffer));
        h.thread.push_root(soft);
        softs.push(soft);
    }

    // A big non-soft allocation forces the heap through its GC plan; the
    // non-clearing cycles preserve every soft referent.
    let big = h.alloc_bytes(800 * 1024).unwrap();
    h.thread.push_root(big);
    for &soft in &softs {
        assert!(h.referent_of(soft).is_some(), "soft reference was cleared");
    }

    h.heap.collect(GcCause::Explicit, true);
    for &soft in &softs {
        assert_eq!(h.referent_of(soft), None);
    }
    assert_eq!(h.heap.take_cleared_references().len(), BUFFERS);
}
