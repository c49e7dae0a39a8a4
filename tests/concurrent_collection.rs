//! Concurrent mark-sweep correctness while a mutator keeps rewriting the
//! object graph.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cinder::collector::{GcCause, GcType};
use cinder::config::{CollectorType, HeapConfig};
use cinder::object::{store_ref_slot, ObjectRef};
use cinder::test_model::{regular_class, TestHarness};

fn cms_config() -> HeapConfig {
    HeapConfig {
        collector_type: CollectorType::Cms,
        post_zygote_collector_type: CollectorType::Cms,
        background_collector_type: CollectorType::Cms,
        initial_size: 8 * 1024 * 1024,
        growth_limit: 32 * 1024 * 1024,
        capacity: 32 * 1024 * 1024,
        parallel_gc_threads: 2,
        conc_gc_threads: 2,
        ..HeapConfig::default()
    }
}

const CELLS: usize = 1500;
const MUTATIONS: usize = 20_000;

#[test]
fn concurrent_marking_with_racing_mutator() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let h = TestHarness::new(cms_config());
    // The test driver never polls from here on; keep it out of the
    // suspend set so collections proceed without it.
    h.thread.transition_to_native();

    let heap = Arc::clone(&h.heap);
    let done = Arc::new(AtomicBool::new(false));

    crossbeam::scope(|scope| {
        let mutator_heap = Arc::clone(&heap);
        let mutator_done = Arc::clone(&done);
        scope.spawn(move |_| {
            let thread = mutator_heap.registry().attach();
            let mut cells: Vec<ObjectRef> = Vec::with_capacity(CELLS);
            for _ in 0..CELLS {
                let obj = mutator_heap.allocate(&thread, 3 * 8).unwrap();
                // SAFETY: freshly allocated two-field test object.
                unsafe { obj.set_class_word(regular_class(2)) };
                thread.push_root(obj);
                cells.push(obj);
            }

            // Deterministic pseudo-random rewiring of the cell graph, with
            // the write barrier after every reference store.
            let mut state = 0x9e3779b97f4a7c15u64;
            let mut next = || {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                state as usize
            };
            for i in 0..MUTATIONS {
                let src = cells[next() % CELLS];
                let dst = cells[next() % CELLS];
                let field = next() % 2;
                let slot = src.to_address() + (1 + field) * 8;
                // SAFETY: slot is a field of a live, rooted test object.
                unsafe { store_ref_slot(slot, Some(dst)) };
                mutator_heap.card_table().mark_card(src.to_address());
                if i % 64 == 0 {
                    thread.poll_safepoint();
                }
            }

            while !mutator_done.load(Ordering::Acquire) {
                thread.poll_safepoint();
                std::hint::spin_loop();
            }

            // Everything rooted must have survived the collector barrage.
            for &cell in &cells {
                assert!(mutator_heap.is_live_object(cell));
            }
            thread.pop_roots_to(0);
            mutator_heap.registry().detach(&thread);
        });

        for _ in 0..5 {
            heap.run_gc(GcType::Full, GcCause::Explicit, false);
        }
        done.store(true, Ordering::Release);
    })
    .unwrap();

    assert_eq!(heap.verify_heap_references(), 0);
    heap.shutdown();
}

#[test]
fn concurrent_collector_reclaims_garbage_between_cycles() {
    let h = TestHarness::new(cms_config());
    let keeper = h.alloc(1);
    h.thread.push_root(keeper);
    for _ in 0..100 {
        h.alloc(1);
    }

    h.heap.run_gc(GcType::Full, GcCause::Explicit, false);

    assert!(h.heap.is_live_object(keeper));
    assert_eq!(h.heap.main_space().unwrap().objects_allocated(), 1);
    assert_eq!(h.heap.verify_heap_references(), 0);
}

#[test]
fn write_barrier_keeps_concurrently_stored_references_alive() {
    // A reference stored during the concurrent phase is found at remark via
    // its dirty card, even though the holder was scanned before the store.
    let h = TestHarness::new(cms_config());
    let holder = h.alloc(1);
    h.thread.push_root(holder);
    let stashed = h.alloc(0);
    h.set_field(holder, 0, Some(stashed));

    h.heap.run_gc(GcType::Full, GcCause::Explicit, false);

    assert!(h.heap.is_live_object(stashed));
    assert_eq!(h.get_field(holder, 0), Some(stashed));
}
