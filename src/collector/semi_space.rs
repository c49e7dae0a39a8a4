//! Semi-space copying collector.
//!
//! Runs entirely stop-the-world: every root is forwarded, `mark` copies a
//! from-space object into the target and installs a forwarding pointer over
//! its class word, and subsequent encounters of the old address resolve to
//! the copy. Nothing is swept in from-space; evacuation reclaims it
//! wholesale and the pages are returned to the OS.
//!
//! The same engine drives three shapes of cycle: the regular semi-space GC
//! between the two bump-pointer spaces, the collector transitions that
//! evacuate a malloc space into a bump space (and back), and the pre-fork
//! zygote compaction that bin-packs survivors into the non-moving space
//! best-fit.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::accounting::bitmap::LargeObjectSet;
use crate::accounting::ObjectStack;
use crate::heap::Heap;
use crate::object::{load_ref_slot, store_ref_slot, ObjectRef, ReferenceKind};
use crate::reference_processor::ReferenceClosures;
use crate::space::bump_pointer::align_object;
use crate::space::{BumpPointerSpace, ContinuousSpace, MallocSpace, SweepableSpace};

use super::{GcCause, GcIteration, GcType};

const MARK_STACK_CAPACITY: usize = 256 * 1024;
const SWEEP_BATCH: usize = 1024;

/// Where evacuated objects land.
pub enum CopyTarget {
    /// The other bump-pointer space (the regular semi-space cycle, and the
    /// non-moving-to-moving transition).
    Bump(Arc<BumpPointerSpace>),
    /// A malloc space, first-fit (the moving-to-non-moving transition).
    Malloc(Arc<MallocSpace>),
    /// A malloc space, best-fit into inter-object gaps (zygote compaction).
    MallocBestFit(Arc<MallocSpace>),
}

impl CopyTarget {
    fn alloc(&self, bytes: usize) -> Option<ObjectRef> {
        match self {
            CopyTarget::Bump(space) => space.alloc(bytes).map(|(obj, _)| obj),
            CopyTarget::Malloc(space) => space.alloc_with_growth(bytes).map(|(obj, _)| obj),
            CopyTarget::MallocBestFit(space) => space.alloc_best_fit(bytes).map(|(obj, _)| obj),
        }
    }

    /// Malloc targets track liveness in bitmaps; bump targets are walked
    /// densely instead.
    fn bitmap_space(&self) -> Option<&Arc<MallocSpace>> {
        match self {
            CopyTarget::Bump(_) => None,
            CopyTarget::Malloc(space) | CopyTarget::MallocBestFit(space) => Some(space),
        }
    }
}

struct NonMovingSpace {
    begin: usize,
    limit: usize,
    space: Arc<dyn SweepableSpace>,
}

pub struct SemiSpace<'h> {
    heap: &'h Heap,
    from: Arc<dyn ContinuousSpace>,
    target: CopyTarget,
    /// Generational mode: the mature (non-moving) spaces are immune and
    /// rooted through their remembered sets instead of being traced.
    generational: bool,
    /// Non-moving spaces marked through and swept this cycle (empty in
    /// generational mode, where they are rooted via remembered sets).
    non_moving: Vec<NonMovingSpace>,
    mark_stack: ObjectStack,
    los_mark: Arc<LargeObjectSet>,
    bytes_moved: AtomicU64,
    objects_moved: AtomicU64,
}

impl<'h> SemiSpace<'h> {
    pub fn new(
        heap: &'h Heap,
        from: Arc<dyn ContinuousSpace>,
        target: CopyTarget,
        generational: bool,
    ) -> SemiSpace<'h> {
        let mut non_moving = Vec::new();
        if !generational {
            for space in heap.sweepable_spaces(GcType::Full) {
                let begin = space.begin().as_usize();
                if begin == from.begin().as_usize() {
                    continue; // the from-space itself when evacuating a malloc space
                }
                if let Some(target_space) = target.bitmap_space() {
                    if begin == target_space.begin().as_usize() {
                        // Objects are being packed into this space; it is
                        // not collected this cycle.
                        continue;
                    }
                }
                non_moving.push(NonMovingSpace {
                    begin,
                    limit: space.limit().as_usize(),
                    space,
                });
            }
        }
        let los = heap.large_object_space();
        SemiSpace {
            heap,
            from,
            target,
            generational,
            non_moving,
            mark_stack: ObjectStack::new("copy mark stack", MARK_STACK_CAPACITY),
            los_mark: los.mark_objects(),
            bytes_moved: AtomicU64::new(0),
            objects_moved: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> String {
        if self.generational {
            "generational semi space".to_string()
        } else {
            "semi space".to_string()
        }
    }

    pub fn bytes_moved(&self) -> u64 {
        self.bytes_moved.load(Ordering::Relaxed)
    }

    pub fn objects_moved(&self) -> u64 {
        self.objects_moved.load(Ordering::Relaxed)
    }

    /// Run one evacuation cycle. The caller has already stopped the world.
    pub fn run(
        &mut self,
        cause: GcCause,
        clear_soft: bool,
        preserve_soft: Option<&dyn Fn(ObjectRef) -> bool>,
    ) -> GcIteration {
        let start = Instant::now();
        self.heap.revoke_all_tlabs();
        self.heap.swap_stacks();
        self.heap.process_cards();
        // Snapshot from-space occupancy before forwarding clobbers it.
        let (from_objects, from_bytes) = self.heap.space_allocation_counts(&self.from);

        for nm in &self.non_moving {
            nm.space.mark_bitmap().clear_all();
        }
        self.los_mark.clear_all();

        // Remembered references out of the spaces this cycle will not trace.
        self.update_immune_references();

        // Forward every root in place.
        for thread in self.heap.registry().threads() {
            thread.visit_roots(&mut |root| *root = self.forward_object(*root));
        }
        self.heap.visit_global_roots(&mut |root| *root = self.forward_object(*root));

        self.process_mark_stack();

        let mut freed = (0u64, 0u64, 0u64, 0u64);
        self.process_references(clear_soft, preserve_soft);
        self.sweep(&mut freed);

        // Evacuation reclaims the rest of from-space outright: everything
        // that was there minus what got copied out.
        freed.0 += (from_objects as u64).saturating_sub(self.objects_moved());
        freed.1 += (from_bytes as u64).saturating_sub(self.bytes_moved());
        self.heap.reclaim_from_space(&self.from);

        self.heap.allocation_stack().reset();
        self.heap.live_stack().reset();
        self.mark_stack.reset();
        for nm in &self.non_moving {
            nm.space.mark_bitmap().clear_all();
        }
        self.heap.large_object_space().mark_objects().clear_all();

        let duration = start.elapsed();
        GcIteration {
            gc_type: GcType::Full,
            cause,
            concurrent: false,
            duration,
            pauses: vec![duration],
            freed_objects: freed.0,
            freed_bytes: freed.1,
            freed_large_objects: freed.2,
            freed_large_object_bytes: freed.3,
        }
    }

    fn update_immune_references(&self) {
        let tables = self.heap.mod_union_tables_for_moving(self.generational);
        for table in tables {
            table.clear_cards();
            table.update_and_mark_references(&mut |slot| {
                // SAFETY: tables record in-object slots of live objects.
                unsafe {
                    if let Some(target) = load_ref_slot(slot) {
                        let forwarded = self.forward_object(target);
                        if forwarded != target {
                            store_ref_slot(slot, Some(forwarded));
                        }
                    }
                }
            });
        }
    }

    fn in_from_space(&self, obj: ObjectRef) -> bool {
        let addr = obj.to_address();
        addr >= self.from.begin() && addr < self.from.limit()
    }

    fn non_moving_of(&self, obj: ObjectRef) -> Option<&NonMovingSpace> {
        let addr = obj.to_address().as_usize();
        self.non_moving
            .iter()
            .find(|s| addr >= s.begin && addr < s.limit)
    }

    /// Mark `obj`, copying it out of from-space if needed, and return its
    /// current address.
    fn forward_object(&self, obj: ObjectRef) -> ObjectRef {
        if self.in_from_space(obj) {
            // SAFETY: from-space objects stay mapped for the whole cycle.
            if let Some(forwarded) = unsafe { obj.forwarded() } {
                return forwarded;
            }
            return self.copy_object(obj);
        }
        if let Some(nm) = self.non_moving_of(obj) {
            if !nm.space.mark_bitmap().set(obj) {
                let _ = self.mark_stack.push_back(obj);
            }
            return obj;
        }
        if self.heap.large_object_space().contains(obj) {
            if !self.los_mark.set(obj) {
                let _ = self.mark_stack.push_back(obj);
            }
            return obj;
        }
        obj
    }

    fn copy_object(&self, obj: ObjectRef) -> ObjectRef {
        let size = self.heap.model().size_of(obj);
        let bytes = align_object(size);
        let copy = self
            .target
            .alloc(bytes)
            .or_else(|| {
                // The target filled up mid-evacuation; spill into the main
                // free-list space rather than lose the object.
                self.heap
                    .main_space()
                    .and_then(|space| space.alloc_with_growth(bytes))
                    .map(|(o, _)| o)
            })
            .unwrap_or_else(|| {
                panic!("out of memory evacuating {:?} ({} bytes)", obj, bytes)
            });
        // SAFETY: source and destination are live mappings of at least
        // `size` bytes and cannot overlap (different spaces).
        unsafe {
            std::ptr::copy_nonoverlapping(
                obj.to_address().as_ptr::<u8>(),
                copy.to_address().as_mut_ptr::<u8>(),
                size,
            );
            obj.set_forwarding_address(copy);
        }
        if let Some(space) = self.target.bitmap_space() {
            space.live_bitmap().set(copy);
            space.mark_bitmap().set(copy);
        }
        let _ = self.mark_stack.push_back(copy);
        self.objects_moved.fetch_add(1, Ordering::Relaxed);
        self.bytes_moved.fetch_add(bytes as u64, Ordering::Relaxed);
        copy
    }

    fn scan_object(&self, obj: ObjectRef) {
        let model = self.heap.model();
        let kind = model.reference_kind(obj);
        let referent_slot = if kind == ReferenceKind::None {
            None
        } else {
            Some(model.referent_slot(obj))
        };
        let mut delayed = false;
        model.visit_reference_slots(obj, &mut |slot| {
            // SAFETY: the model yields in-object field slots.
            let target = match unsafe { load_ref_slot(slot) } {
                Some(target) => target,
                None => return,
            };
            if referent_slot == Some(slot) {
                if self.is_marked(target).is_none() && !delayed {
                    self.heap.reference_processor().delay_reference(kind, obj);
                    delayed = true;
                }
                return;
            }
            let forwarded = self.forward_object(target);
            if forwarded != target {
                // SAFETY: as above.
                unsafe { store_ref_slot(slot, Some(forwarded)) };
            }
        });
    }

    fn process_mark_stack(&self) {
        while let Some(obj) = self.mark_stack.pop_back() {
            self.scan_object(obj);
        }
    }

    fn is_marked(&self, obj: ObjectRef) -> Option<ObjectRef> {
        if self.in_from_space(obj) {
            // SAFETY: from-space stays mapped during the cycle.
            return unsafe { obj.forwarded() };
        }
        if let Some(nm) = self.non_moving_of(obj) {
            return nm.space.mark_bitmap().test(obj).then_some(obj);
        }
        if self.heap.large_object_space().contains(obj) {
            return self.los_mark.test(obj).then_some(obj);
        }
        Some(obj)
    }

    fn process_references(
        &self,
        clear_soft: bool,
        preserve_soft: Option<&dyn Fn(ObjectRef) -> bool>,
    ) {
        let mut is_marked = |obj: ObjectRef| self.is_marked(obj);
        let mut mark_and_push = |obj: ObjectRef| self.forward_object(obj);
        let mut drain = || self.process_mark_stack();
        self.heap.reference_processor().process_references(
            clear_soft,
            preserve_soft,
            &mut ReferenceClosures {
                is_marked: &mut is_marked,
                mark_and_push: &mut mark_and_push,
                drain_mark_stack: &mut drain,
            },
        );
    }

    fn sweep(&self, freed: &mut (u64, u64, u64, u64)) {
        // New objects outside from-space (large objects, free-list spills)
        // sit on the swapped-out stack; record them before the diff below.
        self.heap.mark_alloc_stack_as_live();
        if !self.generational {
            for nm in &self.non_moving {
                nm.space.swap_bitmaps();
                let alloc_bitmap = nm.space.mark_bitmap();
                let marked_bitmap = nm.space.live_bitmap();
                let mut batch: Vec<ObjectRef> = Vec::with_capacity(SWEEP_BATCH);
                alloc_bitmap.walk(&mut |obj| {
                    if !marked_bitmap.test(obj) {
                        batch.push(obj);
                        if batch.len() == SWEEP_BATCH {
                            freed.0 += batch.len() as u64;
                            freed.1 += nm.space.sweep_free_list(&batch) as u64;
                            batch.clear();
                        }
                    }
                });
                if !batch.is_empty() {
                    freed.0 += batch.len() as u64;
                    freed.1 += nm.space.sweep_free_list(&batch) as u64;
                }
                nm.space.mark_bitmap().clear_all();
            }
        }
        self.heap.large_object_space().swap_object_sets();
        let (los_objects, los_bytes) = self.heap.large_object_space().sweep(true);
        freed.2 += los_objects as u64;
        freed.3 += los_bytes as u64;
    }

}
