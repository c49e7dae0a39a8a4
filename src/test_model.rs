//! A deterministic object model for tests.
//!
//! Real runtimes provide the class-descriptor callbacks; tests use this
//! fixed layout instead. Every test object starts with its class word
//! (pointing at a leaked [`TestClassInfo`]), followed by word-sized
//! reference fields. Reference objects use the layout
//! `[class, referent, pending_next, zombie]`.

use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::Lazy;

use crate::heap::Heap;
use crate::object::{
    load_ref_slot, store_ref_slot, Address, ObjectModel, ObjectRef, ReferenceKind,
};
use crate::thread::MutatorThread;

#[derive(Debug)]
pub struct TestClassInfo {
    pub size: usize,
    pub num_fields: usize,
    pub kind: ReferenceKind,
}

const HEADER_WORDS: usize = 1;
const WORD: usize = std::mem::size_of::<usize>();

static REGULAR_CLASSES: Lazy<DashMap<usize, usize>> = Lazy::new(DashMap::new);
static SIZED_CLASSES: Lazy<DashMap<usize, usize>> = Lazy::new(DashMap::new);
static REFERENCE_CLASSES: Lazy<DashMap<u8, usize>> = Lazy::new(DashMap::new);

fn leak_class(info: TestClassInfo) -> usize {
    Box::leak(Box::new(info)) as *const TestClassInfo as usize
}

/// Class word for a plain object with `num_fields` reference fields.
pub fn regular_class(num_fields: usize) -> usize {
    *REGULAR_CLASSES.entry(num_fields).or_insert_with(|| {
        leak_class(TestClassInfo {
            size: (HEADER_WORDS + num_fields) * WORD,
            num_fields,
            kind: ReferenceKind::None,
        })
    })
}

/// Class word for a field-free object of exactly `size` bytes (8-byte
/// aligned), for tests that care about allocation sizes.
pub fn sized_class(size: usize) -> usize {
    debug_assert!(size >= WORD && size % WORD == 0);
    *SIZED_CLASSES.entry(size).or_insert_with(|| {
        leak_class(TestClassInfo {
            size,
            num_fields: 0,
            kind: ReferenceKind::None,
        })
    })
}

/// Class word for a reference object of the given strength.
pub fn reference_class(kind: ReferenceKind) -> usize {
    let key = match kind {
        ReferenceKind::Soft => 1,
        ReferenceKind::Weak => 2,
        ReferenceKind::Finalizer => 3,
        ReferenceKind::Phantom => 4,
        ReferenceKind::None => panic!("use regular_class for non-reference objects"),
    };
    *REFERENCE_CLASSES.entry(key).or_insert_with(|| {
        leak_class(TestClassInfo {
            size: 4 * WORD,
            num_fields: 1,
            kind,
        })
    })
}

fn class_info(obj: ObjectRef) -> Option<&'static TestClassInfo> {
    // SAFETY: test objects are mapped and their class word is either zero
    // (not yet initialized) or a leaked TestClassInfo pointer.
    let word = unsafe { obj.class_word() };
    if word == 0 || word & 1 != 0 {
        return None;
    }
    Some(unsafe { &*(word as *const TestClassInfo) })
}

/// The [`ObjectModel`] implementation backing the test layout.
#[derive(Debug, Default)]
pub struct TestObjectModel;

impl ObjectModel for TestObjectModel {
    fn size_of(&self, obj: ObjectRef) -> usize {
        class_info(obj).map_or(WORD, |info| info.size)
    }

    fn visit_reference_slots(&self, obj: ObjectRef, visitor: &mut dyn FnMut(Address)) {
        let Some(info) = class_info(obj) else {
            return;
        };
        let base = obj.to_address();
        match info.kind {
            ReferenceKind::None => {
                for i in 0..info.num_fields {
                    visitor(base + (HEADER_WORDS + i) * WORD);
                }
            }
            _ => {
                // The referent is traced specially by the collectors; the
                // zombie link is a strong edge until the finalizer consumes
                // it.
                visitor(self.referent_slot(obj));
                visitor(self.zombie_slot(obj));
            }
        }
    }

    fn reference_kind(&self, obj: ObjectRef) -> ReferenceKind {
        class_info(obj).map_or(ReferenceKind::None, |info| info.kind)
    }

    fn referent_slot(&self, reference: ObjectRef) -> Address {
        reference.to_address() + WORD
    }

    fn pending_next_slot(&self, reference: ObjectRef) -> Address {
        reference.to_address() + 2 * WORD
    }

    fn zombie_slot(&self, reference: ObjectRef) -> Address {
        reference.to_address() + 3 * WORD
    }
}

/// A heap plus one attached mutator, with typed helpers for building object
/// graphs under test.
pub struct TestHarness {
    pub heap: Arc<Heap>,
    pub thread: MutatorThread,
}

impl TestHarness {
    pub fn new(config: crate::config::HeapConfig) -> TestHarness {
        let heap = Heap::new(config, Arc::new(TestObjectModel)).expect("heap creation failed");
        let thread = heap.registry().attach();
        TestHarness { heap, thread }
    }

    /// Allocate a plain object with `num_fields` null reference fields.
    pub fn alloc(&self, num_fields: usize) -> ObjectRef {
        let size = (HEADER_WORDS + num_fields) * WORD;
        let obj = self
            .heap
            .allocate(&self.thread, size)
            .expect("test allocation failed");
        // SAFETY: freshly allocated, zeroed object of at least one word.
        unsafe { obj.set_class_word(regular_class(num_fields)) };
        obj
    }

    pub fn try_alloc(&self, num_fields: usize) -> crate::error::HeapResult<ObjectRef> {
        let size = (HEADER_WORDS + num_fields) * WORD;
        let obj = self.heap.allocate(&self.thread, size)?;
        // SAFETY: as in `alloc`.
        unsafe { obj.set_class_word(regular_class(num_fields)) };
        Ok(obj)
    }

    /// Allocate a raw object of `size` bytes with no reference fields.
    pub fn alloc_bytes(&self, size: usize) -> crate::error::HeapResult<ObjectRef> {
        let size = size.max(WORD).next_multiple_of(WORD);
        let obj = self.heap.allocate(&self.thread, size)?;
        // SAFETY: as in `alloc`.
        unsafe { obj.set_class_word(sized_class(size)) };
        Ok(obj)
    }

    /// Allocate a reference object of the given strength.
    pub fn alloc_reference(&self, kind: ReferenceKind, referent: Option<ObjectRef>) -> ObjectRef {
        let obj = self
            .heap
            .allocate(&self.thread, 4 * WORD)
            .expect("test allocation failed");
        // SAFETY: as in `alloc`.
        unsafe { obj.set_class_word(reference_class(kind)) };
        self.store_reference_field(obj, TestObjectModel.referent_slot(obj), referent);
        obj
    }

    /// `obj.field[index] = value`, with the card-table write barrier the
    /// code generator would emit.
    pub fn set_field(&self, obj: ObjectRef, index: usize, value: Option<ObjectRef>) {
        let slot = obj.to_address() + (HEADER_WORDS + index) * WORD;
        self.store_reference_field(obj, slot, value);
    }

    fn store_reference_field(&self, obj: ObjectRef, slot: Address, value: Option<ObjectRef>) {
        // SAFETY: slot is in-bounds for the test layout.
        unsafe { store_ref_slot(slot, value) };
        self.heap.card_table().mark_card(obj.to_address());
    }

    pub fn get_field(&self, obj: ObjectRef, index: usize) -> Option<ObjectRef> {
        let slot = obj.to_address() + (HEADER_WORDS + index) * WORD;
        // SAFETY: slot is in-bounds for the test layout.
        unsafe { load_ref_slot(slot) }
    }

    pub fn referent_of(&self, reference: ObjectRef) -> Option<ObjectRef> {
        // SAFETY: reference objects carry the referent slot.
        unsafe { load_ref_slot(TestObjectModel.referent_slot(reference)) }
    }

    pub fn zombie_of(&self, reference: ObjectRef) -> Option<ObjectRef> {
        // SAFETY: reference objects carry the zombie slot.
        unsafe { load_ref_slot(TestObjectModel.zombie_slot(reference)) }
    }

    /// Root `obj` on the harness thread for the duration of `f`.
    pub fn with_root<R>(&self, obj: ObjectRef, f: impl FnOnce() -> R) -> R {
        let depth = self.thread.push_root(obj);
        let result = f();
        self.thread.pop_roots_to(depth);
        result
    }
}
