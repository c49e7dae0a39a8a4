//! Heap verification modes and image-space loading.

use cinder::collector::GcCause;
use cinder::config::{CollectorType, HeapConfig};
use cinder::object::{store_ref_slot, Address};
use cinder::space::image::{ImageHeader, IMAGE_OBJECTS_OFFSET, IMAGE_VERSION};
use cinder::space::{ContinuousSpace, Space};
use cinder::test_model::{regular_class, TestHarness, TestObjectModel};

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
fn verification_passes_on_a_well_formed_graph() {
    let h = TestHarness::new(ms_config());
    let a = h.alloc(2);
    let b = h.alloc(1);
    let c = h.alloc(0);
    h.set_field(a, 0, Some(b));
    h.set_field(a, 1, Some(c));
    h.set_field(b, 0, Some(c));
    h.thread.push_root(a);

    assert_eq!(h.heap.verify_heap_references(), 0);
    h.heap.collect(GcCause::Explicit, false);
    assert_eq!(h.heap.verify_heap_references(), 0);
}

#[test]
fn verification_catches_references_to_swept_objects() {
    let h = TestHarness::new(ms_config());
    let holder = h.alloc(1);
    h.thread.push_root(holder);
    let doomed = h.alloc(0);
    h.heap.collect(GcCause::Explicit, false);

    // Resurrect the swept object's address by hand, bypassing the barrier.
    let slot = holder.to_address() + 8usize;
    // SAFETY: slot is holder's first field.
    unsafe { store_ref_slot(slot, Some(doomed)) };

    assert!(h.heap.verify_heap_references() > 0);
    // Repairing the field makes verification pass again.
    // SAFETY: as above.
    unsafe { store_ref_slot(slot, None) };
    assert_eq!(h.heap.verify_heap_references(), 0);
}

#[test]
fn missing_card_mark_detection() {
    let h = TestHarness::new(ms_config());
    let old = h.alloc(1);
    h.thread.push_root(old);
    h.heap.collect(GcCause::Explicit, false);
    h.heap.collect(GcCause::Explicit, false); // age old's cards to clean

    // A store into an old object without the write barrier: the new object
    // is only discoverable through a card that was never dirtied.
    let young = h.alloc(0);
    let slot = old.to_address() + 8usize;
    // SAFETY: slot is old's first field.
    unsafe { store_ref_slot(slot, Some(young)) };

    assert!(h.heap.verify_missing_card_marks() > 0);

    // The barrier byte store repairs it.
    h.heap.card_table().mark_card(old.to_address());
    assert_eq!(h.heap.verify_missing_card_marks(), 0);
}

fn write_test_image(objects: usize) -> std::path::PathBuf {
    let object_size = 16; // one-field test object
    let total = IMAGE_OBJECTS_OFFSET + objects * object_size;
    let mut data = vec![0u8; total];
    let header = ImageHeader {
        version: IMAGE_VERSION,
        objects_end: total as u64,
    };
    data[0..ImageHeader::SIZE].copy_from_slice(&header.encode());
    for i in 0..objects {
        let at = IMAGE_OBJECTS_OFFSET + i * object_size;
        data[at..at + 8].copy_from_slice(&regular_class(1).to_le_bytes());
    }
    let path = std::env::temp_dir().join(format!(
        "cinder-test-image-{}-{objects}.img",
        std::process::id()
    ));
    std::fs::write(&path, data).unwrap();
    path
}

#[test]
fn image_space_loads_and_stays_immune() {
    let path = write_test_image(8);
    let config = HeapConfig {
        image_file: Some(path.clone()),
        ..ms_config()
    };
    let h = TestHarness::new(config);

    let spaces = h.heap.continuous_spaces();
    let image = spaces
        .iter()
        .find(|s| s.name() == "image space")
        .expect("image space mapped");
    assert_eq!(image.live_bitmap().count(), 8);

    // Collections never touch it.
    h.heap.collect(GcCause::Explicit, true);
    assert_eq!(image.live_bitmap().count(), 8);
    assert_eq!(h.heap.verify_heap_references(), 0);

    std::fs::remove_file(path).ok();
}

#[test]
fn image_with_bad_magic_is_rejected() {
    let path = std::env::temp_dir().join(format!("cinder-bad-image-{}.img", std::process::id()));
    std::fs::write(&path, vec![0u8; IMAGE_OBJECTS_OFFSET]).unwrap();
    let config = HeapConfig {
        image_file: Some(path.clone()),
        ..ms_config()
    };
    let result = cinder::heap::Heap::new(config, std::sync::Arc::new(TestObjectModel));
    assert!(result.is_err());
    std::fs::remove_file(path).ok();
}

#[test]
fn biased_card_table_base_matches_barrier_contract() {
    use cinder::accounting::{CARD_DIRTY, CARD_SHIFT};
    let h = TestHarness::new(ms_config());
    let obj = h.alloc(1);
    let target = h.alloc(0);
    h.set_field(obj, 0, Some(target));

    // What the emitted stub computes: *(biased_begin + (addr >> shift)).
    let biased: Address = h.heap.card_table().biased_begin();
    let card_ptr = biased
        .as_usize()
        .wrapping_add(obj.to_address().as_usize() >> CARD_SHIFT) as *const u8;
    // SAFETY: the card table covers every continuous space.
    assert_eq!(unsafe { *card_ptr }, CARD_DIRTY);
}
