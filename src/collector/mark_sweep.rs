//! Mark-sweep collectors: full, partial, and sticky, each in concurrent and
//! stop-the-world flavors.
//!
//! Marking is a gray-stack walk sharded into object chunks and balanced
//! across the GC worker pool through a shared overflow queue. The concurrent
//! flavor runs the bulk of marking while mutators execute (they cooperate
//! through the card-table write barrier) and stops the world only to take
//! roots and to drain the cards dirtied in the meantime.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam::queue::SegQueue;
use crossbeam_utils::Backoff;

use crate::accounting::bitmap::LargeObjectSet;
use crate::accounting::card_table::{CARD_AGED, CARD_DIRTY};
use crate::accounting::{ObjectStack, SpaceBitmap};
use crate::heap::Heap;
use crate::object::{load_ref_slot, ObjectRef, ReferenceKind};
use crate::reference_processor::ReferenceClosures;
use crate::space::{ContinuousSpace, SweepableSpace};

use super::{GcCause, GcIteration, GcType};

/// Objects per work chunk handed between marking workers.
const MARK_CHUNK: usize = 128;
/// Batched frees per `free_list` call during sweeping.
const SWEEP_BATCH: usize = 1024;
const MARK_STACK_CAPACITY: usize = 256 * 1024;

struct MarkableSpace {
    begin: usize,
    limit: usize,
    live: Arc<SpaceBitmap>,
    mark: Arc<SpaceBitmap>,
    space: Arc<dyn SweepableSpace>,
}

pub struct MarkSweep<'h> {
    heap: &'h Heap,
    gc_type: GcType,
    concurrent: bool,
    mark_stack: ObjectStack,
    /// Overflow/parallel work chunks.
    work_queue: SegQueue<Vec<ObjectRef>>,
    /// Chunks pushed but not fully processed; drives parallel termination.
    pending_chunks: AtomicUsize,
    immune: Vec<(usize, usize)>,
    spaces: Vec<MarkableSpace>,
    los_live: Arc<LargeObjectSet>,
    los_mark: Arc<LargeObjectSet>,
    objects_marked: AtomicUsize,
}

impl<'h> MarkSweep<'h> {
    pub fn new(heap: &'h Heap, gc_type: GcType, concurrent: bool) -> MarkSweep<'h> {
        let mut immune = Vec::new();
        let mut spaces = Vec::new();
        for space in heap.sweepable_spaces(gc_type) {
            spaces.push(MarkableSpace {
                begin: space.begin().as_usize(),
                limit: space.limit().as_usize(),
                live: space.live_bitmap(),
                mark: space.mark_bitmap(),
                space,
            });
        }
        for space in heap.immune_spaces(gc_type) {
            immune.push((space.begin().as_usize(), space.limit().as_usize()));
        }
        let los = heap.large_object_space();
        MarkSweep {
            heap,
            gc_type,
            concurrent,
            mark_stack: ObjectStack::new("mark stack", MARK_STACK_CAPACITY),
            work_queue: SegQueue::new(),
            pending_chunks: AtomicUsize::new(0),
            immune,
            spaces,
            los_live: los.live_objects(),
            los_mark: los.mark_objects(),
            objects_marked: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> String {
        let base = match self.gc_type {
            GcType::Sticky => "sticky mark sweep",
            GcType::Partial => "partial mark sweep",
            GcType::Full => "mark sweep",
        };
        if self.concurrent {
            format!("concurrent {base}")
        } else {
            base.to_string()
        }
    }

    pub fn gc_type(&self) -> GcType {
        self.gc_type
    }

    /// Run a full cycle. The caller holds the GC-running token; this method
    /// performs its own pauses.
    pub fn run(
        &mut self,
        cause: GcCause,
        clear_soft: bool,
        preserve_soft: Option<&dyn Fn(ObjectRef) -> bool>,
    ) -> GcIteration {
        let total_start = Instant::now();
        let mut pauses = Vec::new();

        if self.gc_type != GcType::Sticky {
            for space in &self.spaces {
                space.mark.clear_all();
            }
            self.los_mark.clear_all();
        }

        let mut freed = (0u64, 0u64, 0u64, 0u64);
        if self.concurrent {
            let pause_start = Instant::now();
            self.heap.suspend_all_for_gc();
            self.initial_mark_pause();
            self.heap.resume_all_after_gc();
            pauses.push(pause_start.elapsed());

            self.marking_phase();

            let pause_start = Instant::now();
            self.heap.suspend_all_for_gc();
            self.remark_pause(clear_soft, preserve_soft, &mut freed);
            self.heap.resume_all_after_gc();
            pauses.push(pause_start.elapsed());
        } else {
            let pause_start = Instant::now();
            self.heap.suspend_all_for_gc();
            self.initial_mark_pause();
            self.marking_phase();
            self.remark_pause(clear_soft, preserve_soft, &mut freed);
            self.heap.resume_all_after_gc();
            pauses.push(pause_start.elapsed());
        }

        self.reclaim_phase(&mut freed);
        self.finish_phase();

        GcIteration {
            gc_type: self.gc_type,
            cause,
            concurrent: self.concurrent,
            duration: total_start.elapsed(),
            pauses,
            freed_objects: freed.0,
            freed_bytes: freed.1,
            freed_large_objects: freed.2,
            freed_large_object_bytes: freed.3,
        }
    }

    // ---- phases ----

    fn initial_mark_pause(&self) {
        self.heap.revoke_all_tlabs();
        self.heap.swap_stacks();
        self.heap.process_cards();
        self.mark_roots();
    }

    fn marking_phase(&self) {
        // References out of spaces this GC does not collect.
        self.heap.update_and_mark_mod_union(self.gc_type, &mut |slot| {
            // SAFETY: mod-union tables only record in-object slots.
            if let Some(target) = unsafe { load_ref_slot(slot) } {
                self.mark_and_push(target, None);
            }
        });

        if self.concurrent {
            // Pick up roots that appeared since the initial pause: each
            // mutator scans its own stack at a checkpoint instead of a
            // global stop.
            let collected = Arc::new(SegQueue::new());
            let sink = Arc::clone(&collected);
            self.heap
                .registry()
                .run_checkpoint(Arc::new(move |thread: &crate::thread::MutatorThread| {
                    thread.visit_roots(&mut |root| sink.push(*root));
                }));
            while let Some(root) = collected.pop() {
                self.mark_and_push(root, None);
            }
        }

        if self.gc_type == GcType::Sticky {
            // Old objects that gained references since the last GC: their
            // cards are DIRTY (stored after the aging pass) or DIRTY-1
            // (stored before it).
            self.scan_dirty_cards(CARD_AGED);
        }

        self.process_mark_stack(true);
    }

    fn remark_pause(
        &self,
        clear_soft: bool,
        preserve_soft: Option<&dyn Fn(ObjectRef) -> bool>,
        freed: &mut (u64, u64, u64, u64),
    ) {
        if self.concurrent {
            // Mutators ran during marking: refresh roots and drain the cards
            // they dirtied.
            self.mark_roots();
            self.scan_dirty_cards(CARD_DIRTY);
            self.process_mark_stack(true);
        }

        let mut is_marked = |obj: ObjectRef| self.is_marked(obj).then_some(obj);
        let mut mark_and_push = |obj: ObjectRef| {
            self.mark_and_push(obj, None);
            obj
        };
        let mut drain = || self.process_mark_stack(false);
        self.heap.reference_processor().process_references(
            clear_soft,
            preserve_soft,
            &mut ReferenceClosures {
                is_marked: &mut is_marked,
                mark_and_push: &mut mark_and_push,
                drain_mark_stack: &mut drain,
            },
        );

        if self.gc_type == GcType::Sticky {
            // New objects live on the (swapped) live stack; free the ones
            // marking never reached, then fold the mark bits into live.
            self.sweep_array(freed);
        } else {
            // Everything allocated before this pause participates in the
            // live-vs-mark sweep below.
            self.heap.mark_alloc_stack_as_live();
        }

        self.heap.pre_sweep_verification();

        if self.gc_type != GcType::Sticky {
            for space in &self.spaces {
                space.space.swap_bitmaps();
            }
            self.heap.large_object_space().swap_object_sets();
        }
    }

    fn reclaim_phase(&self, freed: &mut (u64, u64, u64, u64)) {
        if self.gc_type == GcType::Sticky {
            return;
        }
        // Bitmaps were swapped in the pause: the allocation snapshot is in
        // the mark role, the marked set in the live role.
        for markable in &self.spaces {
            let alloc_bitmap = markable.space.mark_bitmap();
            let marked_bitmap = markable.space.live_bitmap();
            let mut batch: Vec<ObjectRef> = Vec::with_capacity(SWEEP_BATCH);
            let mut objects = 0u64;
            let mut bytes = 0u64;
            alloc_bitmap.walk(&mut |obj| {
                if !marked_bitmap.test(obj) {
                    batch.push(obj);
                    if batch.len() == SWEEP_BATCH {
                        objects += batch.len() as u64;
                        bytes += markable.space.sweep_free_list(&batch) as u64;
                        batch.clear();
                    }
                }
            });
            if !batch.is_empty() {
                objects += batch.len() as u64;
                bytes += markable.space.sweep_free_list(&batch) as u64;
            }
            freed.0 += objects;
            freed.1 += bytes;
        }

        let (los_objects, los_bytes) = self.heap.large_object_space().sweep(true);
        freed.2 += los_objects as u64;
        freed.3 += los_bytes as u64;
    }

    /// Sticky reclaim: free unmarked objects on the live stack (everything
    /// allocated since the previous collection).
    fn sweep_array(&self, freed: &mut (u64, u64, u64, u64)) {
        let live_stack = self.heap.live_stack();
        let los = self.heap.large_object_space();
        let mut batch: Vec<ObjectRef> = Vec::with_capacity(SWEEP_BATCH);
        live_stack.visit(&mut |obj| {
            if self.is_marked(obj) {
                return;
            }
            if let Some(markable) = self.space_of(obj) {
                batch.push(obj);
                if batch.len() == SWEEP_BATCH {
                    freed.0 += batch.len() as u64;
                    freed.1 += markable.space.sweep_free_list(&batch) as u64;
                    batch.clear();
                }
            } else if los.contains(obj) {
                freed.2 += 1;
                freed.3 += los.free(obj) as u64;
            }
        });
        if !batch.is_empty() {
            // All batched objects live in the single main space in the
            // sticky configuration.
            if let Some(markable) = self.spaces.first() {
                freed.0 += batch.len() as u64;
                freed.1 += markable.space.sweep_free_list(&batch) as u64;
            }
        }

        for space in &self.spaces {
            space.live.union_from(&space.mark);
        }
        self.los_live.take_from(&self.los_mark);
    }

    fn finish_phase(&self) {
        for space in &self.spaces {
            space.space.mark_bitmap().clear_all();
        }
        self.heap.large_object_space().mark_objects().clear_all();
        self.heap.live_stack().reset();
        self.mark_stack.reset();
    }

    // ---- roots ----

    fn mark_roots(&self) {
        for thread in self.heap.registry().threads() {
            thread.visit_roots(&mut |root| {
                self.mark_and_push(*root, None);
            });
        }
        self.heap.visit_global_roots(&mut |root| {
            self.mark_and_push(*root, None);
        });
    }

    fn scan_dirty_cards(&self, minimum_age: u8) {
        let card_table = self.heap.card_table();
        for space in self.heap.continuous_spaces() {
            if space.begin() == space.end() {
                continue;
            }
            card_table.scan(
                &space.live_bitmap(),
                space.begin(),
                space.end(),
                minimum_age,
                &mut |obj| {
                    // Gray the object: re-scan its fields without requiring
                    // it to be newly marked.
                    self.scan_object(obj, None);
                },
            );
        }
    }

    // ---- marking ----

    fn space_of(&self, obj: ObjectRef) -> Option<&MarkableSpace> {
        let addr = obj.to_address().as_usize();
        self.spaces
            .iter()
            .find(|s| addr >= s.begin && addr < s.limit)
    }

    fn is_immune(&self, obj: ObjectRef) -> bool {
        let addr = obj.to_address().as_usize();
        self.immune.iter().any(|&(b, l)| addr >= b && addr < l)
    }

    pub(crate) fn is_marked(&self, obj: ObjectRef) -> bool {
        if self.is_immune(obj) {
            return true;
        }
        if let Some(space) = self.space_of(obj) {
            return match self.gc_type {
                GcType::Sticky => space.live.test(obj) || space.mark.test(obj),
                _ => space.mark.test(obj),
            };
        }
        if self.heap.large_object_space().contains(obj) {
            return match self.gc_type {
                GcType::Sticky => self.los_live.test(obj) || self.los_mark.test(obj),
                _ => self.los_mark.test(obj),
            };
        }
        // Outside every collected space (e.g. an evacuation reserve):
        // treated as unconditionally live.
        true
    }

    /// Set the mark bit; true when this call marked it.
    fn mark_object(&self, obj: ObjectRef) -> bool {
        if self.is_immune(obj) {
            return false;
        }
        if let Some(space) = self.space_of(obj) {
            if self.gc_type == GcType::Sticky && space.live.test(obj) {
                return false;
            }
            let newly = !space.mark.set(obj);
            if newly {
                self.objects_marked.fetch_add(1, Ordering::Relaxed);
            }
            return newly;
        }
        if self.heap.large_object_space().contains(obj) {
            if self.gc_type == GcType::Sticky && self.los_live.test(obj) {
                return false;
            }
            return !self.los_mark.set(obj);
        }
        tracing::warn!(object = ?obj, "marking object outside every space");
        false
    }

    /// Mark and, if newly marked, queue for scanning: to `sink` when given
    /// (parallel workers), to the shared mark stack otherwise.
    fn mark_and_push(&self, obj: ObjectRef, sink: Option<&mut Vec<ObjectRef>>) {
        if !self.mark_object(obj) {
            return;
        }
        match sink {
            Some(local) => local.push(obj),
            None => {
                if !self.mark_stack.push_back(obj) {
                    // Stack full: spill a chunk to the shared queue and retry.
                    let mut spill = Vec::with_capacity(MARK_CHUNK);
                    for _ in 0..MARK_CHUNK {
                        match self.mark_stack.pop_back() {
                            Some(entry) => spill.push(entry),
                            None => break,
                        }
                    }
                    self.push_chunk(spill);
                    let _ = self.mark_stack.push_back(obj);
                }
            }
        }
    }

    fn scan_object(&self, obj: ObjectRef, mut sink: Option<&mut Vec<ObjectRef>>) {
        let model = self.heap.model();
        let kind = model.reference_kind(obj);
        if kind == ReferenceKind::None {
            model.visit_reference_slots(obj, &mut |slot| {
                // SAFETY: the model yields in-object field slots.
                if let Some(target) = unsafe { load_ref_slot(slot) } {
                    self.mark_and_push(target, sink.as_deref_mut());
                }
            });
            return;
        }

        // Reference object: trace every field except the referent, which is
        // deferred to the reference processor while unmarked.
        let referent_slot = model.referent_slot(obj);
        let mut delayed = false;
        model.visit_reference_slots(obj, &mut |slot| {
            // SAFETY: as above.
            let target = unsafe { load_ref_slot(slot) };
            if slot == referent_slot {
                if let Some(referent) = target {
                    if !self.is_marked(referent) && !delayed {
                        self.heap.reference_processor().delay_reference(kind, obj);
                        delayed = true;
                    }
                }
            } else if let Some(target) = target {
                self.mark_and_push(target, sink.as_deref_mut());
            }
        });
    }

    fn push_chunk(&self, chunk: Vec<ObjectRef>) {
        if chunk.is_empty() {
            return;
        }
        self.pending_chunks.fetch_add(1, Ordering::AcqRel);
        self.work_queue.push(chunk);
    }

    /// Drain the gray set to empty. With `parallel` and a worker pool of
    /// more than one thread, chunks are balanced across workers through the
    /// shared queue.
    fn process_mark_stack(&self, parallel: bool) {
        let workers = self.heap.gc_worker_count(self.concurrent);
        if !parallel || workers <= 1 {
            loop {
                while let Some(obj) = self.mark_stack.pop_back() {
                    self.scan_object(obj, None);
                }
                match self.work_queue.pop() {
                    Some(chunk) => {
                        self.pending_chunks.fetch_sub(1, Ordering::AcqRel);
                        for obj in chunk {
                            self.scan_object(obj, None);
                        }
                    }
                    None => {
                        if self.mark_stack.is_empty() {
                            return;
                        }
                    }
                }
            }
        }

        // Shard the mark stack into chunks before fanning out.
        let mut chunk = Vec::with_capacity(MARK_CHUNK);
        while let Some(obj) = self.mark_stack.pop_back() {
            chunk.push(obj);
            if chunk.len() == MARK_CHUNK {
                self.push_chunk(std::mem::take(&mut chunk));
            }
        }
        self.push_chunk(chunk);

        self.heap.gc_pool().scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|_| self.marking_worker());
            }
        });
        debug_assert!(self.work_queue.is_empty());
    }

    fn marking_worker(&self) {
        let backoff = Backoff::new();
        let mut local: Vec<ObjectRef> = Vec::with_capacity(2 * MARK_CHUNK);
        loop {
            match self.work_queue.pop() {
                Some(chunk) => {
                    backoff.reset();
                    for obj in chunk {
                        self.scan_object(obj, Some(&mut local));
                        // Share surplus gray objects with other workers.
                        while local.len() >= 2 * MARK_CHUNK {
                            let spill = local.split_off(local.len() - MARK_CHUNK);
                            self.push_chunk(spill);
                        }
                    }
                    // Finish the local residue before declaring the chunk
                    // done so `pending_chunks` covers all derived work.
                    while let Some(obj) = local.pop() {
                        self.scan_object(obj, Some(&mut local));
                    }
                    self.pending_chunks.fetch_sub(1, Ordering::AcqRel);
                }
                None => {
                    if self.pending_chunks.load(Ordering::Acquire) == 0 {
                        return;
                    }
                    backoff.snooze();
                }
            }
        }
    }
}
