//! Mark-sweep collection semantics: reachability, bitmap handling, sticky
//! collections, and card aging.

use cinder::accounting::{CARD_AGED, CARD_CLEAN, CARD_DIRTY};
use cinder::collector::{GcCause, GcType};
use cinder::config::{CollectorType, HeapConfig};
use cinder::space::ContinuousSpace;
use cinder::test_model::TestHarness;

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
fn full_gc_reclaims_every_unrooted_object() {
    let h = TestHarness::new(ms_config());
    let kept = h.alloc(1);
    h.thread.push_root(kept);
    let _dead_a = h.alloc(0);
    let _dead_b = h.alloc(3);

    h.heap.collect(GcCause::Explicit, true);

    let main = h.heap.main_space().unwrap();
    assert_eq!(main.objects_allocated(), 1, "only the rooted object remains");
    assert!(h.heap.is_live_object(kept));
    assert_eq!(h.heap.bytes_allocated(), main.bytes_allocated());
}

#[test]
fn marking_traces_transitive_closure() {
    let h = TestHarness::new(ms_config());
    let a = h.alloc(1);
    let b = h.alloc(1);
    let c = h.alloc(0);
    h.set_field(a, 0, Some(b));
    h.set_field(b, 0, Some(c));
    h.thread.push_root(a);
    // An unrooted chain dies as a unit.
    let x = h.alloc(1);
    let y = h.alloc(0);
    h.set_field(x, 0, Some(y));

    h.heap.collect(GcCause::Explicit, false);

    for obj in [a, b, c] {
        assert!(h.heap.is_live_object(obj));
    }
    assert_eq!(h.heap.main_space().unwrap().objects_allocated(), 3);
    assert_eq!(h.get_field(b, 0), Some(c), "fields survive collection");
}

#[test]
fn back_to_back_full_gcs_are_idempotent() {
    let h = TestHarness::new(ms_config());
    let root = h.alloc(1);
    let child = h.alloc(0);
    h.set_field(root, 0, Some(child));
    h.thread.push_root(root);
    h.alloc(2); // garbage

    h.heap.collect(GcCause::Explicit, false);
    let live_after_first = h.heap.main_space().unwrap().live_bitmap().snapshot();
    let bytes_after_first = h.heap.bytes_allocated();

    h.heap.collect(GcCause::Explicit, false);
    let live_after_second = h.heap.main_space().unwrap().live_bitmap().snapshot();

    assert_eq!(live_after_first, live_after_second);
    assert_eq!(h.heap.bytes_allocated(), bytes_after_first);
}

#[test]
fn sticky_gc_collects_only_objects_allocated_since_last_gc() {
    let h = TestHarness::new(ms_config());
    let old = h.alloc(1);
    h.thread.push_root(old);
    h.heap.collect(GcCause::Explicit, false);
    assert_eq!(h.heap.main_space().unwrap().objects_allocated(), 1);

    // Allocated after the full GC: one reachable, one garbage.
    let young_kept = h.alloc(0);
    h.set_field(old, 0, Some(young_kept));
    let _young_dead = h.alloc(0);

    let ran = h.heap.run_gc(GcType::Sticky, GcCause::Explicit, false);
    assert!(ran);

    let main = h.heap.main_space().unwrap();
    assert_eq!(main.objects_allocated(), 2, "old and young_kept survive");
    assert!(h.heap.is_live_object(old));
    assert!(h.heap.is_live_object(young_kept));
    // Sticky folds its marks into the live bitmap instead of swapping.
    assert!(main.live_bitmap().test(young_kept));
    assert!(main.live_bitmap().test(old));
}

#[test]
fn cards_age_to_clean_over_two_quiet_gcs() {
    let h = TestHarness::new(ms_config());
    let a = h.alloc(1);
    let b = h.alloc(0);
    h.thread.push_root(a);
    h.thread.push_root(b);

    h.set_field(a, 0, Some(b));
    let card_addr = a.to_address();
    assert_eq!(h.heap.card_table().get_card(card_addr), CARD_DIRTY);

    h.heap.collect(GcCause::Explicit, false);
    assert_eq!(
        h.heap.card_table().get_card(card_addr),
        CARD_AGED,
        "one quiet GC ages the card"
    );

    h.heap.collect(GcCause::Explicit, false);
    assert_eq!(
        h.heap.card_table().get_card(card_addr),
        CARD_CLEAN,
        "a second quiet GC cleans it"
    );
    // The reference itself is unaffected by aging.
    assert_eq!(h.get_field(a, 0), Some(b));
}

#[test]
fn large_objects_are_swept_with_the_heap() {
    let h = TestHarness::new(ms_config());
    let threshold = h.heap.config().large_object_threshold;
    let kept = h.alloc_bytes(threshold * 4).unwrap();
    let _dead = h.alloc_bytes(threshold * 4).unwrap();
    h.thread.push_root(kept);

    h.heap.collect(GcCause::Explicit, false);

    let los = h.heap.large_object_space();
    assert_eq!(los.objects_allocated(), 1);
    assert!(los.contains(kept));
    assert!(h.heap.is_live_object(kept));
}

#[test]
fn stw_and_explicit_gcs_record_statistics() {
    let h = TestHarness::new(ms_config());
    h.alloc(0);
    h.heap.collect(GcCause::Explicit, false);
    h.heap.run_gc(GcType::Sticky, GcCause::Explicit, false);
    let dump = h.heap.dump_gc_performance_info();
    assert!(dump.contains("sticky mark sweep"), "got: {dump}");
}
