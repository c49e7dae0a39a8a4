//! Zygote creation (pre-fork bin-packing compaction) and collector
//! transitions driven by process state.

use cinder::collector::{GcCause, GcType};
use cinder::config::{CollectorType, HeapConfig};
use cinder::heap::ProcessState;
use cinder::space::ContinuousSpace;
use cinder::test_model::TestHarness;

#[test]
fn pre_zygote_fork_bin_packs_the_bump_space() {
    // Moving configuration: allocations land in the bump-pointer space and
    // the pre-fork compaction packs them densely into the non-moving space.
    let config = HeapConfig {
        collector_type: CollectorType::Ss,
        post_zygote_collector_type: CollectorType::Cms,
        background_collector_type: CollectorType::Ms,
        initial_size: 16 * 1024 * 1024,
        growth_limit: 32 * 1024 * 1024,
        capacity: 32 * 1024 * 1024,
        ..HeapConfig::default()
    };
    let h = TestHarness::new(config);
    assert!(h.heap.current_allocator().is_moving());

    const COUNT: usize = 10 * 1024;
    const SIZE: usize = 1024;
    for _ in 0..COUNT {
        let obj = h.alloc_bytes(SIZE).unwrap();
        h.thread.push_root(obj);
    }
    let live_bytes = h.heap.bytes_allocated();
    assert!(live_bytes >= COUNT * SIZE);

    h.heap.pre_zygote_fork().unwrap();

    let zygote = h.heap.zygote_space().expect("zygote space exists");
    let packed = zygote.end() - zygote.begin();
    assert!(
        packed <= live_bytes + live_bytes / 20,
        "packed {packed} bytes for {live_bytes} live bytes"
    );
    assert!(h.heap.bump_pointer_space().unwrap().is_empty());
    assert!(!h.heap.current_allocator().is_moving());
    assert!(h.heap.have_zygote_space());

    // Roots were forwarded into the zygote range.
    for i in 0..COUNT {
        let moved = h.thread.root_at(i).unwrap();
        assert!(zygote.contains(moved));
    }
    assert_eq!(h.heap.verify_heap_references(), 0);
}

#[test]
fn partial_gc_roots_through_the_zygote_remembered_set() {
    let config = HeapConfig {
        collector_type: CollectorType::Ms,
        post_zygote_collector_type: CollectorType::Ms,
        background_collector_type: CollectorType::Ms,
        initial_size: 4 * 1024 * 1024,
        growth_limit: 16 * 1024 * 1024,
        capacity: 16 * 1024 * 1024,
        ..HeapConfig::default()
    };
    let h = TestHarness::new(config);

    let elder = h.alloc(1);
    h.thread.push_root(elder);
    h.heap.pre_zygote_fork().unwrap();
    assert_eq!(
        h.heap.gc_plan(),
        vec![GcType::Sticky, GcType::Partial, GcType::Full]
    );

    // A young object reachable only from the (uncollected) zygote space.
    let young = h.alloc(0);
    h.set_field(elder, 0, Some(young));
    let _young_garbage = h.alloc(0);

    let ran = h.heap.run_gc(GcType::Partial, GcCause::Explicit, false);
    assert!(ran);

    assert!(h.heap.is_live_object(young));
    assert_eq!(h.get_field(elder, 0), Some(young));
    assert_eq!(
        h.heap.main_space().unwrap().objects_allocated(),
        1,
        "the unreferenced young object was collected"
    );

    // Full collections still cover the zygote itself.
    h.heap.run_gc(GcType::Full, GcCause::Explicit, false);
    assert!(h.heap.is_live_object(elder));
    assert!(h.heap.is_live_object(young));
}

#[test]
fn background_process_state_switches_to_moving_collector_and_back() {
    let config = HeapConfig {
        collector_type: CollectorType::Ms,
        post_zygote_collector_type: CollectorType::Ms,
        background_collector_type: CollectorType::Ss,
        initial_size: 4 * 1024 * 1024,
        growth_limit: 16 * 1024 * 1024,
        capacity: 16 * 1024 * 1024,
        ..HeapConfig::default()
    };
    let h = TestHarness::new(config);
    assert_eq!(h.heap.collector_type(), CollectorType::Ms);

    let obj = h.alloc(1);
    let child = h.alloc(0);
    h.set_field(obj, 0, Some(child));
    h.thread.push_root(obj);
    let old_address = obj.to_address();

    // Foreground -> background: evacuate into the bump-pointer space.
    h.heap.update_process_state(ProcessState::JankImperceptible);
    assert_eq!(h.heap.collector_type(), CollectorType::Ss);
    assert!(h.heap.current_allocator().is_moving());

    let moved = h.thread.root_at(0).unwrap();
    assert_ne!(moved.to_address(), old_address, "object was evacuated");
    assert!(h.heap.bump_pointer_space().unwrap().contains(moved));
    assert!(h.heap.is_live_object(moved));
    let moved_child = h.get_field(moved, 0).unwrap();
    assert_ne!(moved_child, child, "field was repointed at the copy");
    assert_eq!(h.heap.main_space().unwrap().objects_allocated(), 0);

    // Allocation now goes through the bump pointer.
    let fresh = h.alloc(0);
    assert!(h.heap.bump_pointer_space().unwrap().contains(fresh));

    // Background -> foreground: back to the free-list space.
    h.heap.update_process_state(ProcessState::JankPerceptible);
    assert_eq!(h.heap.collector_type(), CollectorType::Ms);
    assert!(!h.heap.current_allocator().is_moving());
    let back = h.thread.root_at(0).unwrap();
    assert!(h.heap.main_space().unwrap().objects_allocated() >= 2);
    assert!(h.heap.is_live_object(back));
    assert_eq!(h.heap.verify_heap_references(), 0);
}

#[test]
fn moving_transition_is_skipped_while_pinned() {
    let config = HeapConfig {
        collector_type: CollectorType::Ms,
        post_zygote_collector_type: CollectorType::Ms,
        background_collector_type: CollectorType::Ss,
        ..HeapConfig::default()
    };
    let h = TestHarness::new(config);
    h.heap.increment_disable_moving_gc();
    let error = h.heap.transition_collector(CollectorType::Ss).unwrap_err();
    assert!(matches!(
        error,
        cinder::error::HeapError::MovingGcDisabled { disable_count: 1 }
    ));
    assert_eq!(h.heap.collector_type(), CollectorType::Ms);

    h.heap.decrement_disable_moving_gc();
    h.heap.transition_collector(CollectorType::Ss).unwrap();
    assert_eq!(h.heap.collector_type(), CollectorType::Ss);
}

#[test]
fn semi_space_gc_swaps_the_bump_spaces() {
    let config = HeapConfig {
        collector_type: CollectorType::Ss,
        post_zygote_collector_type: CollectorType::Cms,
        background_collector_type: CollectorType::Ss,
        initial_size: 4 * 1024 * 1024,
        growth_limit: 16 * 1024 * 1024,
        capacity: 16 * 1024 * 1024,
        ..HeapConfig::default()
    };
    let h = TestHarness::new(config);

    let keep = h.alloc(1);
    h.thread.push_root(keep);
    for _ in 0..50 {
        h.alloc(2); // garbage
    }
    let bump_before = h.heap.bump_pointer_space().unwrap().begin();

    h.heap.collect(GcCause::Explicit, false);

    let bump_after = h.heap.bump_pointer_space().unwrap();
    assert_ne!(bump_after.begin(), bump_before, "from and to spaces swapped");
    let survivor = h.thread.root_at(0).unwrap();
    assert!(bump_after.contains(survivor));
    assert_eq!(bump_after.objects_allocated(), 1, "only the root survived");
    assert_eq!(h.heap.verify_heap_references(), 0);
}
