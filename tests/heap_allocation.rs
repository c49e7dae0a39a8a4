//! Allocation-path behavior: routing, zeroing, accounting, and the staged
//! out-of-memory path.

use cinder::collector::GcCause;
use cinder::config::{CollectorType, HeapConfig};
use cinder::error::HeapError;
use cinder::object::OBJECT_ALIGNMENT;
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
fn allocations_are_aligned_and_zeroed() {
    let h = TestHarness::new(ms_config());
    let obj = h.alloc(4);
    assert!(obj.to_address().is_aligned(OBJECT_ALIGNMENT));
    for i in 0..4 {
        assert_eq!(h.get_field(obj, i), None, "field {i} must start null");
    }
}

#[test]
fn bytes_allocated_matches_space_accounting() {
    let h = TestHarness::new(ms_config());
    for fields in [0, 1, 5, 16] {
        h.alloc(fields);
    }
    let big = h
        .alloc_bytes(h.heap.config().large_object_threshold * 2)
        .unwrap();
    assert!(h.heap.large_object_space().contains(big));

    let main = h.heap.main_space().unwrap();
    assert_eq!(
        h.heap.bytes_allocated(),
        main.bytes_allocated() + h.heap.large_object_space().bytes_allocated()
    );
}

#[test]
fn large_allocations_route_to_large_object_space() {
    let h = TestHarness::new(ms_config());
    let threshold = h.heap.config().large_object_threshold;
    let small = h.alloc_bytes(threshold - 8).unwrap();
    let large = h.alloc_bytes(threshold).unwrap();
    assert!(!h.heap.large_object_space().contains(small));
    assert!(h.heap.large_object_space().contains(large));
    assert_eq!(h.heap.large_object_space().objects_allocated(), 1);
}

#[test]
fn continuous_spaces_are_sorted_and_disjoint() {
    let h = TestHarness::new(ms_config());
    let spaces = h.heap.continuous_spaces();
    assert!(!spaces.is_empty());
    for pair in spaces.windows(2) {
        assert!(pair[0].begin() < pair[1].begin());
        assert!(pair[0].limit() <= pair[1].begin());
    }
}

#[test]
fn tlab_allocation_in_moving_configuration() {
    let config = HeapConfig {
        collector_type: CollectorType::Ss,
        use_tlab: true,
        ..ms_config()
    };
    let h = TestHarness::new(config);
    assert!(h.heap.current_allocator().is_moving());

    let a = h.alloc(1);
    let b = h.alloc(1);
    let bump = h.heap.bump_pointer_space().unwrap();
    assert!(bump.contains(a) && bump.contains(b));
    // Same TLAB: consecutive objects are adjacent.
    assert_eq!(a.to_address() + 16usize, b.to_address());
}

#[test]
fn oom_reports_fragmentation_after_full_plan() {
    // Scenario: a small capacity heap filled with alternating 16 KiB and
    // 48 KiB rooted objects until allocation fails.
    let config = HeapConfig {
        initial_size: 8 * 1024 * 1024,
        growth_limit: 8 * 1024 * 1024,
        capacity: 8 * 1024 * 1024,
        min_free: 256 * 1024,
        max_free: 1024 * 1024,
        ..ms_config()
    };
    let h = TestHarness::new(config);

    let mut flip = false;
    let error = loop {
        let size = if flip { 16 * 1024 } else { 48 * 1024 };
        flip = !flip;
        match h.alloc_bytes(size) {
            Ok(obj) => {
                h.thread.push_root(obj);
            }
            Err(error) => break error,
        }
    };

    assert!(matches!(error, HeapError::OutOfMemory { .. }));
    let message = error.to_string();
    assert!(message.contains("fragmentation"), "got: {message}");
    assert!(
        h.heap.bytes_allocated() >= 6 * 1024 * 1024,
        "only {} bytes allocated before OOM",
        h.heap.bytes_allocated()
    );
    // The heap stays consistent after the failure.
    h.heap.collect(GcCause::Explicit, false);
    assert_eq!(h.heap.verify_heap_references(), 0);
}

#[test]
fn native_allocation_accounting_rejects_over_free() {
    let h = TestHarness::new(ms_config());
    h.heap.register_native_allocation(4096);
    assert_eq!(h.heap.native_bytes_allocated(), 4096);
    let error = h.heap.register_native_free(8192).unwrap_err();
    assert!(matches!(
        error,
        HeapError::NativeOverFree {
            bytes: 8192,
            registered: 4096
        }
    ));
    // Counter untouched by the failed free.
    assert_eq!(h.heap.native_bytes_allocated(), 4096);
    h.heap.register_native_free(4096).unwrap();
    assert_eq!(h.heap.native_bytes_allocated(), 0);
}

#[test]
fn gc_performance_dump_mentions_collectors_after_gc() {
    let h = TestHarness::new(ms_config());
    h.alloc(0);
    h.heap.collect(GcCause::Explicit, false);
    let dump = h.heap.dump_gc_performance_info();
    assert!(dump.contains("mark sweep"), "got: {dump}");
    assert!(dump.contains("total bytes allocated"));
}
