//! The heap manager: allocation routing, collector selection, growth policy,
//! process-state handling, collector transitions, the zygote fork, and heap
//! verification.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use arc_swap::{ArcSwap, ArcSwapOption};
use crossbeam_utils::atomic::AtomicCell;
use parking_lot::{Condvar, Mutex};

use crate::accounting::card_table::{age_card, CARD_AGED, CARD_DIRTY};
use crate::accounting::{CardTable, ModUnionTable, ModUnionTableCardCache, ModUnionTableReferenceCache, ObjectStack};
use crate::collector::{CollectorRecord, GcCause, GcIteration, GcType, MarkSweep, SemiSpace};
use crate::collector::semi_space::CopyTarget;
use crate::config::{CollectorType, HeapConfig, VerifyFlags};
use crate::error::{HeapError, HeapResult};
use crate::mem_map::{MemMap, Protection};
use crate::object::{load_ref_slot, Address, ObjectModel, ObjectRef};
use crate::reference_processor::ReferenceProcessor;
use crate::space::bump_pointer::align_object;
use crate::space::{
    BumpPointerSpace, ContinuousSpace, FreeListKind, GcRetentionPolicy, ImageSpace,
    LargeObjectSpace, MallocSpace, SweepableSpace, ZygoteSpace,
};
use crate::thread::{MutatorThread, ThreadRegistry};

/// Which allocator the fast path dispatches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocatorType {
    BumpPointer,
    Tlab,
    RosAlloc,
    DlMalloc,
}

impl AllocatorType {
    pub fn is_moving(self) -> bool {
        matches!(self, AllocatorType::BumpPointer | AllocatorType::Tlab)
    }
}

/// Coarse process state reported by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    /// Foreground: pauses are user-visible.
    JankPerceptible,
    /// Background: throughput and footprint win over pause time.
    JankImperceptible,
}

struct GcState {
    is_gc_running: bool,
    last_gc_type: Option<GcType>,
    disable_moving_gc_count: usize,
    collector_type: CollectorType,
}

struct AllocationRate {
    last_gc_end: Instant,
    bytes_at_last_gc: usize,
    bytes_per_second: usize,
    last_gc_duration: Duration,
}

pub struct Heap {
    config: HeapConfig,
    model: Arc<dyn ObjectModel>,
    registry: Arc<ThreadRegistry>,

    image_space: Option<Arc<ImageSpace>>,
    main_space: ArcSwapOption<MallocSpace>,
    zygote_space: ArcSwapOption<ZygoteSpace>,
    bump_space: ArcSwapOption<BumpPointerSpace>,
    temp_space: ArcSwapOption<BumpPointerSpace>,
    large_object_space: Arc<LargeObjectSpace>,
    /// Sorted, non-overlapping snapshot of every continuous space.
    continuous: ArcSwap<Vec<Arc<dyn ContinuousSpace>>>,

    card_table: Arc<CardTable>,
    /// (covered space, table) pairs; a table's applicability per GC type is
    /// decided by its space's retention policy.
    mod_union_tables: Mutex<Vec<(Arc<dyn ContinuousSpace>, Arc<dyn ModUnionTable>)>>,

    allocation_stack: ArcSwap<ObjectStack>,
    live_stack: ArcSwap<ObjectStack>,
    reference_processor: ReferenceProcessor,
    global_roots: Mutex<Vec<ObjectRef>>,

    gc_state: Mutex<GcState>,
    gc_complete_cond: Condvar,
    zygote_creation_lock: Mutex<()>,
    concurrent_gc_pending: AtomicBool,

    num_bytes_allocated: AtomicUsize,
    native_bytes_allocated: AtomicUsize,
    native_footprint_gc_watermark: AtomicUsize,
    native_footprint_limit: AtomicUsize,
    max_allowed_footprint: AtomicUsize,
    concurrent_start_bytes: AtomicUsize,
    total_bytes_freed_ever: AtomicUsize,
    total_objects_freed_ever: AtomicUsize,

    next_gc_type: AtomicCell<GcType>,
    have_zygote_space: AtomicBool,
    process_state: AtomicCell<ProcessState>,
    current_allocator: AtomicCell<AllocatorType>,

    allocation_rate: Mutex<AllocationRate>,
    collector_records: Mutex<HashMap<String, CollectorRecord>>,
    gc_pool: rayon::ThreadPool,

    self_ref: OnceLock<Weak<Heap>>,
}

impl Heap {
    pub fn new(config: HeapConfig, model: Arc<dyn ObjectModel>) -> HeapResult<Arc<Heap>> {
        let config = config.normalized();
        let capacity = config.capacity;

        // One contiguous reservation carved into the main space and the two
        // bump-pointer regions keeps the card table dense.
        let mut reserve = MemMap::map_anonymous(
            "heap reserve",
            None,
            3 * capacity,
            Protection::ReadWrite,
        )?;
        let mut bump_map = reserve.split_at(capacity, "bump pointer space 1");
        let temp_map = bump_map.split_at(capacity, "bump pointer space 2");

        let free_list_kind = if config.low_memory_mode {
            FreeListKind::Dl
        } else {
            FreeListKind::Ros
        };
        let main_space = Arc::new(MallocSpace::from_mem_map(
            "main space",
            free_list_kind,
            reserve,
            config.initial_size,
            config.growth_limit,
        ));
        let bump_space = Arc::new(BumpPointerSpace::from_mem_map(
            "bump pointer space 1",
            bump_map,
        ));
        let temp_space = Arc::new(BumpPointerSpace::from_mem_map(
            "bump pointer space 2",
            temp_map,
        ));
        let large_object_space = LargeObjectSpace::new("large object space");

        let image_space = match &config.image_file {
            Some(path) => Some(ImageSpace::load("image space", path, model.as_ref())?),
            None => None,
        };

        // Card-table coverage spans every continuous space.
        let mut coverage_begin = main_space.begin();
        let mut coverage_end = temp_space.limit();
        if let Some(image) = &image_space {
            coverage_begin = coverage_begin.min(image.begin());
            coverage_end = coverage_end.max(image.limit());
        }
        let card_table = Arc::new(CardTable::new(
            coverage_begin,
            coverage_end - coverage_begin,
        )?);

        let stack_capacity = (capacity / 64).max(64 * 1024);
        let worker_threads = config
            .parallel_gc_threads
            .max(config.conc_gc_threads)
            .max(1);
        let gc_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(worker_threads)
            .thread_name(|index| format!("gc-mark-{index}"))
            .build()
            .expect("failed to build GC worker pool");

        let current_allocator = match config.collector_type {
            CollectorType::Ms | CollectorType::Cms => match free_list_kind {
                FreeListKind::Ros => AllocatorType::RosAlloc,
                FreeListKind::Dl => AllocatorType::DlMalloc,
            },
            CollectorType::Ss | CollectorType::Gss => {
                if config.use_tlab {
                    AllocatorType::Tlab
                } else {
                    AllocatorType::BumpPointer
                }
            }
        };

        let heap = Arc::new(Heap {
            model: Arc::clone(&model),
            registry: Arc::new(ThreadRegistry::new()),
            main_space: ArcSwapOption::new(Some(main_space)),
            zygote_space: ArcSwapOption::new(None),
            bump_space: ArcSwapOption::new(Some(bump_space)),
            temp_space: ArcSwapOption::new(Some(temp_space)),
            large_object_space,
            continuous: ArcSwap::from_pointee(Vec::new()),
            card_table,
            mod_union_tables: Mutex::new(Vec::new()),
            allocation_stack: ArcSwap::from_pointee(ObjectStack::new(
                "allocation stack",
                stack_capacity,
            )),
            live_stack: ArcSwap::from_pointee(ObjectStack::new("live stack", stack_capacity)),
            reference_processor: ReferenceProcessor::new(Arc::clone(&model)),
            global_roots: Mutex::new(Vec::new()),
            gc_state: Mutex::new(GcState {
                is_gc_running: false,
                last_gc_type: None,
                disable_moving_gc_count: 0,
                collector_type: config.collector_type,
            }),
            gc_complete_cond: Condvar::new(),
            zygote_creation_lock: Mutex::new(()),
            concurrent_gc_pending: AtomicBool::new(false),
            num_bytes_allocated: AtomicUsize::new(0),
            native_bytes_allocated: AtomicUsize::new(0),
            native_footprint_gc_watermark: AtomicUsize::new(config.initial_size),
            native_footprint_limit: AtomicUsize::new(config.initial_size + config.max_free),
            max_allowed_footprint: AtomicUsize::new(config.initial_size),
            concurrent_start_bytes: AtomicUsize::new(
                config.initial_size.saturating_sub(128 * 1024).max(1),
            ),
            total_bytes_freed_ever: AtomicUsize::new(0),
            total_objects_freed_ever: AtomicUsize::new(0),
            next_gc_type: AtomicCell::new(GcType::Full),
            have_zygote_space: AtomicBool::new(false),
            process_state: AtomicCell::new(ProcessState::JankPerceptible),
            current_allocator: AtomicCell::new(current_allocator),
            allocation_rate: Mutex::new(AllocationRate {
                last_gc_end: Instant::now(),
                bytes_at_last_gc: 0,
                bytes_per_second: 0,
                last_gc_duration: Duration::ZERO,
            }),
            collector_records: Mutex::new(HashMap::new()),
            gc_pool,
            image_space,
            config,
            self_ref: OnceLock::new(),
        });
        let _ = heap.self_ref.set(Arc::downgrade(&heap));

        heap.rebuild_continuous_spaces();
        if let Some(image) = &heap.image_space {
            let table: Arc<dyn ModUnionTable> = Arc::new(ModUnionTableReferenceCache::new(
                "image mod-union table",
                Arc::clone(&heap.card_table),
                Arc::clone(&heap.model),
                image.clone() as Arc<dyn ContinuousSpace>,
            ));
            heap.mod_union_tables
                .lock()
                .push((image.clone() as Arc<dyn ContinuousSpace>, table));
            // Seed the table: treat every image object as recently written
            // so the first collection records all of its outgoing
            // references.
            heap.card_table.modify_cards_atomic(
                image.objects_begin(),
                image.end(),
                &|_| CARD_DIRTY,
                &mut |_, _| {},
            );
        }
        if heap.config.collector_type == CollectorType::Gss {
            heap.install_main_space_remembered_set();
        }

        tracing::debug!(
            capacity = heap.config.capacity,
            growth_limit = heap.config.growth_limit,
            initial = heap.config.initial_size,
            collector = ?heap.config.collector_type,
            "heap created"
        );
        Ok(heap)
    }

    fn this(&self) -> Arc<Heap> {
        self.self_ref
            .get()
            .and_then(Weak::upgrade)
            .expect("heap used after shutdown")
    }

    // ---- accessors used by the collectors ----

    pub fn config(&self) -> &HeapConfig {
        &self.config
    }

    pub fn model(&self) -> &Arc<dyn ObjectModel> {
        &self.model
    }

    pub fn registry(&self) -> &ThreadRegistry {
        &self.registry
    }

    pub fn card_table(&self) -> &CardTable {
        &self.card_table
    }

    pub fn reference_processor(&self) -> &ReferenceProcessor {
        &self.reference_processor
    }

    pub fn large_object_space(&self) -> &Arc<LargeObjectSpace> {
        &self.large_object_space
    }

    pub fn main_space(&self) -> Option<Arc<MallocSpace>> {
        self.main_space.load_full()
    }

    pub fn zygote_space(&self) -> Option<Arc<ZygoteSpace>> {
        self.zygote_space.load_full()
    }

    pub fn bump_pointer_space(&self) -> Option<Arc<BumpPointerSpace>> {
        self.bump_space.load_full()
    }

    pub fn continuous_spaces(&self) -> Vec<Arc<dyn ContinuousSpace>> {
        self.continuous.load().as_ref().clone()
    }

    pub fn allocation_stack(&self) -> Arc<ObjectStack> {
        self.allocation_stack.load_full()
    }

    pub fn live_stack(&self) -> Arc<ObjectStack> {
        self.live_stack.load_full()
    }

    pub fn bytes_allocated(&self) -> usize {
        self.num_bytes_allocated.load(Ordering::Relaxed)
    }

    pub fn max_allowed_footprint(&self) -> usize {
        self.max_allowed_footprint.load(Ordering::Relaxed)
    }

    pub fn current_allocator(&self) -> AllocatorType {
        self.current_allocator.load()
    }

    pub fn have_zygote_space(&self) -> bool {
        self.have_zygote_space.load(Ordering::Relaxed)
    }

    pub fn total_bytes_freed_ever(&self) -> usize {
        self.total_bytes_freed_ever.load(Ordering::Relaxed)
    }

    pub(crate) fn gc_pool(&self) -> &rayon::ThreadPool {
        &self.gc_pool
    }

    pub(crate) fn gc_worker_count(&self, concurrent_phase: bool) -> usize {
        if concurrent_phase {
            self.config.conc_gc_threads.max(1)
        } else {
            self.config.parallel_gc_threads.max(1)
        }
    }

    fn rebuild_continuous_spaces(&self) {
        let mut spaces: Vec<Arc<dyn ContinuousSpace>> = Vec::new();
        if let Some(image) = &self.image_space {
            spaces.push(image.clone());
        }
        if let Some(zygote) = self.zygote_space.load_full() {
            spaces.push(zygote);
        }
        if let Some(main) = self.main_space.load_full() {
            spaces.push(main);
        }
        if let Some(bump) = self.bump_space.load_full() {
            spaces.push(bump);
        }
        if let Some(temp) = self.temp_space.load_full() {
            spaces.push(temp);
        }
        spaces.sort_by_key(|s| s.begin());
        for pair in spaces.windows(2) {
            assert!(
                pair[0].limit() <= pair[1].begin(),
                "continuous spaces overlap: {} and {}",
                pair[0].name(),
                pair[1].name()
            );
        }
        self.continuous.store(Arc::new(spaces));
    }

    fn install_main_space_remembered_set(&self) {
        if let Some(main) = self.main_space.load_full() {
            let table: Arc<dyn ModUnionTable> = Arc::new(ModUnionTableCardCache::new(
                "main space remembered set",
                Arc::clone(&self.card_table),
                Arc::clone(&self.model),
                main.clone() as Arc<dyn ContinuousSpace>,
            ));
            self.mod_union_tables
                .lock()
                .push((main as Arc<dyn ContinuousSpace>, table));
        }
    }

    fn remove_main_space_remembered_set(&self) {
        if let Some(main) = self.main_space.load_full() {
            self.mod_union_tables
                .lock()
                .retain(|(space, _)| space.begin() != main.begin());
        }
    }

    // ---- allocation ----

    /// Allocate a zero-initialized, 8-byte-aligned object of `size` bytes on
    /// behalf of `thread`. Entering the allocator is a safepoint.
    pub fn allocate(&self, thread: &MutatorThread, size: usize) -> HeapResult<ObjectRef> {
        thread.poll_safepoint();
        let aligned = align_object(size);
        let allocator = self.current_allocator.load();
        let allocated = match self.try_to_allocate(thread, allocator, aligned) {
            Some(result) => result,
            None => self.allocate_internal_with_gc(thread, allocator, aligned)?,
        };
        let (mut obj, bytes) = allocated;
        self.num_bytes_allocated.fetch_add(bytes, Ordering::Relaxed);

        // Every newborn object lands on the allocation stack; overflow
        // forces a collection to drain it. The object is rooted across the
        // collection so a moving cycle forwards it.
        while !self.allocation_stack.load().push_back(obj) {
            let depth = thread.push_root(obj);
            self.collect_garbage_inner(
                self.next_gc_type.load(),
                GcCause::ForAlloc,
                false,
                Some(thread),
            );
            obj = thread.root_at(depth).expect("rooted allocation disappeared");
            thread.pop_roots_to(depth);
        }

        if self.bytes_allocated() >= self.concurrent_start_bytes.load(Ordering::Relaxed) {
            self.request_concurrent_gc();
        }
        Ok(obj)
    }

    /// The allocation fast path: route to the current allocator, fail
    /// without growing.
    fn try_to_allocate(
        &self,
        thread: &MutatorThread,
        allocator: AllocatorType,
        aligned_size: usize,
    ) -> Option<(ObjectRef, usize)> {
        if aligned_size >= self.config.large_object_threshold {
            return self.large_object_space.alloc(aligned_size);
        }
        match allocator {
            AllocatorType::RosAlloc | AllocatorType::DlMalloc => {
                self.main_space.load_full()?.alloc(aligned_size)
            }
            AllocatorType::BumpPointer => self.bump_space.load_full()?.alloc(aligned_size),
            AllocatorType::Tlab => {
                if let Some(obj) = thread.tlab_alloc(aligned_size) {
                    return Some((obj, aligned_size));
                }
                let bump = self.bump_space.load_full()?;
                self.revoke_tlab(thread, &bump);
                let (start, end) = bump.alloc_new_tlab(aligned_size)?;
                thread.set_tlab(start, end);
                thread.tlab_alloc(aligned_size).map(|obj| (obj, aligned_size))
            }
        }
    }

    fn try_to_allocate_with_growth(
        &self,
        thread: &MutatorThread,
        allocator: AllocatorType,
        aligned_size: usize,
    ) -> Option<(ObjectRef, usize)> {
        if aligned_size >= self.config.large_object_threshold {
            return self.large_object_space.alloc(aligned_size);
        }
        match allocator {
            AllocatorType::RosAlloc | AllocatorType::DlMalloc => self
                .main_space
                .load_full()?
                .alloc_with_growth(aligned_size),
            // Bump-pointer spaces have no soft footprint to exceed.
            AllocatorType::BumpPointer | AllocatorType::Tlab => {
                self.try_to_allocate(thread, allocator, aligned_size)
            }
        }
    }

    /// The staged slow path: wait out a running GC, escalate through the
    /// collector plan, allow growth, clear soft references, then report OOM.
    fn allocate_internal_with_gc(
        &self,
        thread: &MutatorThread,
        allocator: AllocatorType,
        aligned_size: usize,
    ) -> HeapResult<(ObjectRef, usize)> {
        self.wait_for_gc_to_complete_polling(thread);
        if self.current_allocator.load() != allocator {
            // A collector transition changed the allocator under us; the
            // next attempt re-dispatches.
            return self
                .retry_with_current_allocator(thread, aligned_size)
                .ok_or_else(|| self.out_of_memory_error(aligned_size));
        }
        if let Some(result) = self.try_to_allocate(thread, allocator, aligned_size) {
            return Ok(result);
        }

        let plan = self.gc_plan();
        for &gc_type in &plan {
            let ran = self.collect_garbage_inner(gc_type, GcCause::ForAlloc, false, Some(thread));
            if self.current_allocator.load() != allocator {
                return self
                    .retry_with_current_allocator(thread, aligned_size)
                    .ok_or_else(|| self.out_of_memory_error(aligned_size));
            }
            if ran {
                if let Some(result) = self.try_to_allocate(thread, allocator, aligned_size) {
                    return Ok(result);
                }
            }
        }

        // Allow the footprint to grow toward the hard limit.
        if let Some(result) = self.try_to_allocate_with_growth(thread, allocator, aligned_size) {
            return Ok(result);
        }

        // Last resort: most severe GC in the plan, clearing soft references.
        self.collect_garbage_inner(*plan.last().unwrap(), GcCause::ForAlloc, true, Some(thread));
        if let Some(result) = self.try_to_allocate_with_growth(thread, allocator, aligned_size) {
            return Ok(result);
        }

        let error = self.out_of_memory_error(aligned_size);
        tracing::warn!("{error}");
        Err(error)
    }

    fn retry_with_current_allocator(
        &self,
        thread: &MutatorThread,
        aligned_size: usize,
    ) -> Option<(ObjectRef, usize)> {
        let allocator = self.current_allocator.load();
        self.try_to_allocate(thread, allocator, aligned_size)
    }

    fn out_of_memory_error(&self, size: usize) -> HeapError {
        HeapError::OutOfMemory {
            size,
            allocated: self.bytes_allocated(),
            footprint: self.max_allowed_footprint(),
            largest_contiguous: self.largest_contiguous_allocation(),
        }
    }

    /// The largest single allocation the current allocator could satisfy,
    /// reported in OOM logs to distinguish exhaustion from fragmentation.
    pub fn largest_contiguous_allocation(&self) -> usize {
        match self.current_allocator.load() {
            AllocatorType::RosAlloc | AllocatorType::DlMalloc => self
                .main_space
                .load_full()
                .map_or(0, |space| space.largest_contiguous_free()),
            AllocatorType::BumpPointer | AllocatorType::Tlab => self
                .bump_space
                .load_full()
                .map_or(0, |space| space.limit() - space.end()),
        }
    }

    fn revoke_tlab(&self, thread: &MutatorThread, bump: &BumpPointerSpace) {
        if let Some(tlab) = thread.take_tlab() {
            bump.record_tlab_revoke(tlab.start, tlab.pos, tlab.objects);
        }
    }

    pub(crate) fn revoke_all_tlabs(&self) {
        if let Some(bump) = self.bump_space.load_full() {
            for thread in self.registry.threads() {
                self.revoke_tlab(&thread, &bump);
            }
        }
    }

    // ---- roots ----

    /// Register a global root (interned-string and class-loader tables).
    pub fn register_global_root(&self, obj: ObjectRef) {
        self.global_roots.lock().push(obj);
    }

    pub fn global_roots(&self) -> Vec<ObjectRef> {
        self.global_roots.lock().clone()
    }

    pub fn clear_global_roots(&self) {
        self.global_roots.lock().clear();
    }

    pub(crate) fn visit_global_roots(&self, visitor: &mut dyn FnMut(&mut ObjectRef)) {
        let mut roots = self.global_roots.lock();
        for root in roots.iter_mut() {
            visitor(root);
        }
    }

    // ---- GC machinery shared with the collectors ----

    pub(crate) fn suspend_all_for_gc(&self) {
        self.registry.suspend_all();
    }

    pub(crate) fn resume_all_after_gc(&self) {
        self.registry.resume_all();
    }

    pub(crate) fn swap_stacks(&self) {
        let alloc = self.allocation_stack.load_full();
        let live = self.live_stack.load_full();
        self.allocation_stack.store(live);
        self.live_stack.store(alloc);
    }

    /// Fold this cycle's allocations (now on the live stack) into the live
    /// bitmaps so the upcoming sweep sees them.
    pub(crate) fn mark_alloc_stack_as_live(&self) {
        let spaces = self.continuous_spaces();
        let live_stack = self.live_stack.load_full();
        live_stack.visit(&mut |obj| {
            if let Some(space) = spaces.iter().find(|s| s.contains(obj)) {
                space.live_bitmap().set(obj);
            } else if self.large_object_space.contains(obj) {
                self.large_object_space.live_objects().set(obj);
            }
        });
    }

    /// Per-space card handling before marking: spaces with a mod-union table
    /// have their cards folded into it; plain allocation spaces age theirs
    /// (`DIRTY -> DIRTY-1 -> CLEAN`).
    pub(crate) fn process_cards(&self) {
        let tables = self.mod_union_tables.lock();
        for (_, table) in tables.iter() {
            table.clear_cards();
        }
        for space in self.continuous_spaces().iter() {
            let has_table = tables
                .iter()
                .any(|(covered, _)| covered.begin() == space.begin());
            if !has_table && space.retention_policy() == GcRetentionPolicy::AlwaysCollect {
                self.card_table.modify_cards_atomic(
                    space.begin(),
                    space.limit(),
                    &age_card,
                    &mut |_, _| {},
                );
            }
        }
    }

    /// Replay remembered references out of the spaces `gc_type` does not
    /// collect.
    pub(crate) fn update_and_mark_mod_union(
        &self,
        gc_type: GcType,
        visitor: &mut dyn FnMut(Address),
    ) {
        let tables = self.mod_union_tables.lock();
        for (space, table) in tables.iter() {
            let applies = match space.retention_policy() {
                GcRetentionPolicy::NeverCollect => true,
                GcRetentionPolicy::FullCollect => gc_type != GcType::Full,
                GcRetentionPolicy::AlwaysCollect => false,
            };
            if applies {
                table.update_and_mark_references(visitor);
            }
        }
    }

    /// Tables consulted by the copying collector: the never-collected image,
    /// plus every mature space when running generationally.
    pub(crate) fn mod_union_tables_for_moving(
        &self,
        generational: bool,
    ) -> Vec<Arc<dyn ModUnionTable>> {
        let tables = self.mod_union_tables.lock();
        tables
            .iter()
            .filter(|(space, _)| {
                generational || space.retention_policy() == GcRetentionPolicy::NeverCollect
            })
            .map(|(_, table)| Arc::clone(table))
            .collect()
    }

    /// Spaces swept by a collection of `gc_type`.
    pub(crate) fn sweepable_spaces(&self, gc_type: GcType) -> Vec<Arc<dyn SweepableSpace>> {
        let mut spaces: Vec<Arc<dyn SweepableSpace>> = Vec::new();
        if let Some(main) = self.main_space.load_full() {
            spaces.push(main);
        }
        if gc_type == GcType::Full {
            if let Some(zygote) = self.zygote_space.load_full() {
                spaces.push(zygote);
            }
        }
        spaces
    }

    /// Spaces a collection of `gc_type` must not touch.
    pub(crate) fn immune_spaces(&self, gc_type: GcType) -> Vec<Arc<dyn ContinuousSpace>> {
        let mut spaces: Vec<Arc<dyn ContinuousSpace>> = Vec::new();
        if let Some(image) = &self.image_space {
            spaces.push(image.clone());
        }
        if gc_type != GcType::Full {
            if let Some(zygote) = self.zygote_space.load_full() {
                spaces.push(zygote);
            }
        }
        spaces
    }

    pub(crate) fn space_allocation_counts(
        &self,
        space: &Arc<dyn ContinuousSpace>,
    ) -> (usize, usize) {
        let begin = space.begin();
        if let Some(bump) = self.bump_space.load_full() {
            if bump.begin() == begin {
                return (bump.objects_allocated(), bump.bytes_allocated());
            }
        }
        if let Some(temp) = self.temp_space.load_full() {
            if temp.begin() == begin {
                return (temp.objects_allocated(), temp.bytes_allocated());
            }
        }
        if let Some(main) = self.main_space.load_full() {
            if main.begin() == begin {
                return (main.objects_allocated(), main.bytes_allocated());
            }
        }
        (0, 0)
    }

    /// Release an evacuated from-space wholesale.
    pub(crate) fn reclaim_from_space(&self, space: &Arc<dyn ContinuousSpace>) {
        let begin = space.begin();
        if let Some(bump) = self.bump_space.load_full() {
            if bump.begin() == begin {
                bump.clear();
                return;
            }
        }
        if let Some(temp) = self.temp_space.load_full() {
            if temp.begin() == begin {
                temp.clear();
                return;
            }
        }
        if let Some(main) = self.main_space.load_full() {
            if main.begin() == begin {
                main.clear();
            }
        }
    }

    // ---- collection entry points ----

    /// Run the most severe collection in the current plan synchronously.
    pub fn collect(&self, cause: GcCause, clear_soft_references: bool) {
        let gc_type = *self.gc_plan().last().unwrap();
        self.collect_garbage_internal(gc_type, cause, clear_soft_references);
    }

    /// Run a collection of a specific type synchronously. Requests the
    /// current configuration cannot honor are demoted (partial without a
    /// zygote becomes full; moving collectors only run full cycles).
    pub fn run_gc(&self, gc_type: GcType, cause: GcCause, clear_soft_references: bool) -> bool {
        self.collect_garbage_internal(gc_type, cause, clear_soft_references)
    }

    /// The ordered list of GC types the allocation slow path escalates
    /// through.
    pub fn gc_plan(&self) -> Vec<GcType> {
        let collector = self.gc_state.lock().collector_type;
        if collector.is_moving() {
            vec![GcType::Full]
        } else if self.have_zygote_space() {
            vec![GcType::Sticky, GcType::Partial, GcType::Full]
        } else {
            vec![GcType::Sticky, GcType::Full]
        }
    }

    /// Block until no collection is in progress. Returns the type of the
    /// last collection that ran, if any.
    pub fn wait_for_gc_to_complete(&self) -> Option<GcType> {
        let mut state = self.gc_state.lock();
        while state.is_gc_running {
            self.gc_complete_cond.wait(&mut state);
        }
        state.last_gc_type
    }

    /// As [`Heap::wait_for_gc_to_complete`], but keeps servicing safepoints
    /// so a concurrent collector can checkpoint or suspend the waiter.
    fn wait_for_gc_to_complete_polling(&self, thread: &MutatorThread) -> Option<GcType> {
        loop {
            {
                let mut state = self.gc_state.lock();
                if !state.is_gc_running {
                    return state.last_gc_type;
                }
                let _ = self
                    .gc_complete_cond
                    .wait_for(&mut state, Duration::from_millis(2));
                if !state.is_gc_running {
                    return state.last_gc_type;
                }
            }
            thread.poll_safepoint();
        }
    }

    pub(crate) fn collect_garbage_internal(
        &self,
        gc_type: GcType,
        cause: GcCause,
        clear_soft_references: bool,
    ) -> bool {
        self.collect_garbage_inner(gc_type, cause, clear_soft_references, None)
    }

    fn collect_garbage_inner(
        &self,
        gc_type: GcType,
        cause: GcCause,
        clear_soft_references: bool,
        requester: Option<&MutatorThread>,
    ) -> bool {
        let collector_type = loop {
            let mut state = self.gc_state.lock();
            if !state.is_gc_running {
                state.is_gc_running = true;
                break state.collector_type;
            }
            match requester {
                Some(thread) => {
                    let _ = self
                        .gc_complete_cond
                        .wait_for(&mut state, Duration::from_millis(2));
                    drop(state);
                    thread.poll_safepoint();
                }
                None => {
                    self.gc_complete_cond.wait(&mut state);
                }
            }
        };
        self.concurrent_gc_pending.store(false, Ordering::Relaxed);

        // Demote requests the current configuration cannot honor.
        let gc_type = if collector_type.is_moving() {
            GcType::Full
        } else if gc_type == GcType::Partial && !self.have_zygote_space() {
            GcType::Full
        } else {
            gc_type
        };

        let bytes_allocated_before = self.bytes_allocated();
        self.update_allocation_rate(bytes_allocated_before);
        self.pre_gc_verification();

        let (name, iteration) = match collector_type {
            CollectorType::Ms | CollectorType::Cms => {
                let concurrent = collector_type == CollectorType::Cms;
                let mut collector = MarkSweep::new(self, gc_type, concurrent);
                let name = collector.name();
                let iteration = collector.run(cause, clear_soft_references, None);
                (name, iteration)
            }
            CollectorType::Ss | CollectorType::Gss => {
                let generational = collector_type == CollectorType::Gss;
                let iteration =
                    self.run_semi_space_cycle(cause, clear_soft_references, generational);
                let name = if generational {
                    "generational semi space".to_string()
                } else {
                    "semi space".to_string()
                };
                (name, iteration)
            }
        };

        self.finish_gc(&name, &iteration);
        self.post_gc_verification();
        true
    }

    fn run_semi_space_cycle(
        &self,
        cause: GcCause,
        clear_soft: bool,
        generational: bool,
    ) -> GcIteration {
        let from = self
            .bump_space
            .load_full()
            .expect("moving collector without a bump-pointer space");
        let to = self
            .temp_space
            .load_full()
            .expect("moving collector without a temp space");

        self.suspend_all_for_gc();
        let iteration = {
            let mut collector = SemiSpace::new(
                self,
                from.clone() as Arc<dyn ContinuousSpace>,
                CopyTarget::Bump(Arc::clone(&to)),
                generational,
            );
            collector.run(cause, clear_soft, None)
        };
        // The spaces trade roles: evacuation emptied `from`.
        self.bump_space.store(Some(to));
        self.temp_space.store(Some(from));
        self.rebuild_continuous_spaces();
        self.resume_all_after_gc();
        iteration
    }

    fn finish_gc(&self, name: &str, iteration: &GcIteration) {
        let freed_bytes = iteration.total_freed_bytes() as usize;
        let freed_objects = iteration.total_freed_objects() as usize;
        let clamped = freed_bytes.min(self.num_bytes_allocated.load(Ordering::Relaxed));
        self.num_bytes_allocated.fetch_sub(clamped, Ordering::Relaxed);
        self.total_bytes_freed_ever
            .fetch_add(freed_bytes, Ordering::Relaxed);
        self.total_objects_freed_ever
            .fetch_add(freed_objects, Ordering::Relaxed);

        self.grow_for_utilization(iteration.gc_type, iteration.duration);

        {
            let mut records = self.collector_records.lock();
            records
                .entry(name.to_string())
                .or_default()
                .update(iteration);
        }

        let bytes_allocated = self.bytes_allocated();
        let footprint = self.max_allowed_footprint().max(1);
        let percent_free = 100 - (bytes_allocated * 100 / footprint).min(100);
        let max_pause = iteration
            .pauses
            .iter()
            .copied()
            .max()
            .unwrap_or(Duration::ZERO);
        tracing::info!(
            collector = name,
            cause = %iteration.cause,
            gc_type = %iteration.gc_type,
            freed_objects = iteration.freed_objects,
            freed_bytes = iteration.freed_bytes,
            freed_los_objects = iteration.freed_large_objects,
            freed_los_bytes = iteration.freed_large_object_bytes,
            percent_free,
            bytes_allocated,
            footprint,
            pauses = ?iteration.pauses,
            total = ?iteration.duration,
            "gc finished"
        );
        if max_pause > self.config.long_pause_log_threshold {
            tracing::warn!(
                collector = name,
                pause = ?max_pause,
                threshold = ?self.config.long_pause_log_threshold,
                "long GC pause"
            );
        }
        if iteration.duration > self.config.long_gc_log_threshold {
            tracing::warn!(
                collector = name,
                duration = ?iteration.duration,
                threshold = ?self.config.long_gc_log_threshold,
                "long GC"
            );
        }

        let mut state = self.gc_state.lock();
        state.is_gc_running = false;
        state.last_gc_type = Some(iteration.gc_type);
        drop(state);
        self.gc_complete_cond.notify_all();
    }

    /// Hand the references cleared by the last collection to the runtime for
    /// enqueueing.
    pub fn take_cleared_references(&self) -> Vec<ObjectRef> {
        self.reference_processor.collect_cleared_references()
    }

    // ---- growth policy ----

    fn update_allocation_rate(&self, bytes_allocated_now: usize) {
        let mut rate = self.allocation_rate.lock();
        let elapsed = rate.last_gc_end.elapsed();
        let allocated_since = bytes_allocated_now.saturating_sub(rate.bytes_at_last_gc);
        let seconds = elapsed.as_secs_f64().max(0.001);
        rate.bytes_per_second = (allocated_since as f64 / seconds) as usize;
    }

    fn grow_for_utilization(&self, gc_type: GcType, gc_duration: Duration) {
        let bytes_allocated = self.bytes_allocated();
        let target;
        if gc_type != GcType::Sticky {
            let by_utilization =
                (bytes_allocated as f64 / self.config.target_utilization) as usize;
            target = by_utilization
                .min(bytes_allocated + self.config.max_free)
                .max(bytes_allocated + self.config.min_free);
            self.next_gc_type.store(GcType::Sticky);
        } else {
            let footprint = self.max_allowed_footprint();
            if bytes_allocated + self.config.min_free <= footprint {
                self.next_gc_type.store(GcType::Sticky);
            } else if self.have_zygote_space() {
                self.next_gc_type.store(GcType::Partial);
            } else {
                self.next_gc_type.store(GcType::Full);
            }
            if bytes_allocated + self.config.max_free < footprint {
                target = bytes_allocated + self.config.max_free;
            } else {
                target = footprint;
            }
        }

        if !self.config.ignore_max_footprint {
            let clamped = target.min(self.config.growth_limit);
            self.max_allowed_footprint.store(clamped, Ordering::Relaxed);
            if let Some(main) = self.main_space.load_full() {
                main.set_footprint_limit(clamped);
            }

            let concurrent = self.gc_state.lock().collector_type == CollectorType::Cms;
            if concurrent {
                let mut rate = self.allocation_rate.lock();
                rate.last_gc_duration = gc_duration;
                let headroom = ((rate.bytes_per_second as f64
                    * rate.last_gc_duration.as_secs_f64()) as usize)
                    .clamp(128 * 1024, 512 * 1024);
                rate.last_gc_end = Instant::now();
                rate.bytes_at_last_gc = bytes_allocated;
                drop(rate);
                self.concurrent_start_bytes.store(
                    clamped.saturating_sub(headroom).max(bytes_allocated),
                    Ordering::Relaxed,
                );
            } else {
                let mut rate = self.allocation_rate.lock();
                rate.last_gc_end = Instant::now();
                rate.bytes_at_last_gc = bytes_allocated;
                drop(rate);
                self.concurrent_start_bytes
                    .store(usize::MAX, Ordering::Relaxed);
            }

            self.native_footprint_gc_watermark
                .store(clamped, Ordering::Relaxed);
            self.native_footprint_limit
                .store(clamped + self.config.max_free, Ordering::Relaxed);
        }
    }

    // ---- concurrent GC requests ----

    fn request_concurrent_gc(&self) {
        if self.gc_state.lock().collector_type != CollectorType::Cms {
            return;
        }
        if self
            .concurrent_gc_pending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return;
        }
        let heap = self.this();
        std::thread::Builder::new()
            .name("gc-concurrent".to_string())
            .spawn(move || {
                let gc_type = heap.next_gc_type.load();
                heap.collect_garbage_internal(gc_type, GcCause::Background, false);
            })
            .expect("failed to spawn concurrent GC thread");
    }

    // ---- native allocation accounting ----

    pub fn register_native_allocation(&self, bytes: usize) {
        let total = self
            .native_bytes_allocated
            .fetch_add(bytes, Ordering::Relaxed)
            + bytes;
        if total > self.native_footprint_limit.load(Ordering::Relaxed) {
            // Over the hard watermark: finalization has had its chance, run
            // a blocking collection.
            self.wait_for_gc_to_complete();
            let gc_type = if self.have_zygote_space() {
                GcType::Partial
            } else {
                GcType::Full
            };
            self.collect_garbage_internal(gc_type, GcCause::NativeAlloc, false);
        } else if total > self.native_footprint_gc_watermark.load(Ordering::Relaxed) {
            self.request_concurrent_gc();
        }
    }

    pub fn register_native_free(&self, bytes: usize) -> HeapResult<()> {
        let mut current = self.native_bytes_allocated.load(Ordering::Relaxed);
        loop {
            if bytes > current {
                return Err(HeapError::NativeOverFree {
                    bytes,
                    registered: current,
                });
            }
            match self.native_bytes_allocated.compare_exchange_weak(
                current,
                current - bytes,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    pub fn native_bytes_allocated(&self) -> usize {
        self.native_bytes_allocated.load(Ordering::Relaxed)
    }

    // ---- process state and collector transitions ----

    pub fn update_process_state(&self, state: ProcessState) {
        let old = self.process_state.swap(state);
        if old == state {
            return;
        }
        let target = match state {
            ProcessState::JankPerceptible => self.config.post_zygote_collector_type,
            ProcessState::JankImperceptible => self.config.background_collector_type,
        };
        let current = self.gc_state.lock().collector_type;
        if current == target {
            // Already in the right collector: take the opportunity to shrink
            // the footprint with a forced full collection.
            self.collect_garbage_internal(GcType::Full, GcCause::Background, false);
        } else if let Err(error) = self.transition_collector(target) {
            tracing::warn!("{error}");
        }
    }

    pub fn process_state(&self) -> ProcessState {
        self.process_state.load()
    }

    pub fn collector_type(&self) -> CollectorType {
        self.gc_state.lock().collector_type
    }

    /// Pin-count guard: while nonzero, moving transitions are refused.
    pub fn increment_disable_moving_gc(&self) {
        self.gc_state.lock().disable_moving_gc_count += 1;
    }

    pub fn decrement_disable_moving_gc(&self) {
        let mut state = self.gc_state.lock();
        debug_assert!(state.disable_moving_gc_count > 0);
        state.disable_moving_gc_count = state.disable_moving_gc_count.saturating_sub(1);
    }

    /// Reshape the heap between the moving and non-moving configurations
    /// under stop-the-world.
    pub fn transition_collector(&self, target: CollectorType) -> HeapResult<()> {
        let current = {
            let mut state = self.gc_state.lock();
            while state.is_gc_running {
                self.gc_complete_cond.wait(&mut state);
            }
            if (target.is_moving() || state.collector_type.is_moving())
                && state.disable_moving_gc_count > 0
            {
                return Err(HeapError::MovingGcDisabled {
                    disable_count: state.disable_moving_gc_count,
                });
            }
            state.is_gc_running = true;
            state.collector_type
        };

        if current == target || current.is_moving() == target.is_moving() {
            let mut state = self.gc_state.lock();
            state.collector_type = target;
            state.is_gc_running = false;
            drop(state);
            self.gc_complete_cond.notify_all();
            return Ok(());
        }

        let start = Instant::now();
        self.suspend_all_for_gc();
        if target.is_moving() {
            // Evacuate the free-list space into a bump-pointer space and
            // switch the fast path to linear allocation.
            let main = self.main_space.load_full().expect("no main space");
            let bump = self.bump_space.load_full().expect("no bump space");
            {
                let mut collector = SemiSpace::new(
                    self,
                    main.clone() as Arc<dyn ContinuousSpace>,
                    CopyTarget::Bump(Arc::clone(&bump)),
                    false,
                );
                collector.run(GcCause::CollectorTransition, false, None);
            }
            self.current_allocator.store(if self.config.use_tlab {
                AllocatorType::Tlab
            } else {
                AllocatorType::BumpPointer
            });
            if target == CollectorType::Gss {
                self.install_main_space_remembered_set();
            }
        } else {
            // Evacuate the bump-pointer space back into the free-list space.
            let main = self.main_space.load_full().expect("no main space");
            let bump = self.bump_space.load_full().expect("no bump space");
            {
                let mut collector = SemiSpace::new(
                    self,
                    bump.clone() as Arc<dyn ContinuousSpace>,
                    CopyTarget::Malloc(Arc::clone(&main)),
                    false,
                );
                collector.run(GcCause::CollectorTransition, false, None);
            }
            self.remove_main_space_remembered_set();
            self.current_allocator.store(match main.kind() {
                FreeListKind::Ros => AllocatorType::RosAlloc,
                FreeListKind::Dl => AllocatorType::DlMalloc,
            });
        }
        self.resume_all_after_gc();

        let mut state = self.gc_state.lock();
        state.collector_type = target;
        state.is_gc_running = false;
        state.last_gc_type = Some(GcType::Full);
        drop(state);
        self.gc_complete_cond.notify_all();

        tracing::info!(
            from = ?current,
            to = ?target,
            duration = ?start.elapsed(),
            "collector transition"
        );
        Ok(())
    }

    // ---- zygote ----

    /// Compact the heap and freeze the main space ahead of the first fork:
    /// survivors are bin-packed into the non-moving space, which becomes the
    /// shared zygote space; a fresh main space takes over the remainder.
    pub fn pre_zygote_fork(&self) -> HeapResult<()> {
        let _zygote_guard = self.zygote_creation_lock.lock();
        if self.have_zygote_space() {
            return Ok(());
        }
        {
            let mut state = self.gc_state.lock();
            while state.is_gc_running {
                self.gc_complete_cond.wait(&mut state);
            }
            state.is_gc_running = true;
        }

        self.suspend_all_for_gc();
        let main = self.main_space.load_full().expect("no main space");

        // Pack every live bump-pointer object into the main space, best-fit.
        if let Some(bump) = self.bump_space.load_full() {
            if !bump.is_empty() {
                let mut collector = SemiSpace::new(
                    self,
                    bump.clone() as Arc<dyn ContinuousSpace>,
                    CopyTarget::MallocBestFit(Arc::clone(&main)),
                    false,
                );
                collector.run(GcCause::CollectorTransition, true, None);
            }
        }

        // Every object surviving into the zygote is considered live from
        // here on; full collections re-derive liveness from marking.
        let zygote_live = main.live_bitmap();
        main.walk(&mut |obj, _| {
            zygote_live.set(obj);
        });

        let successor = main.create_zygote_space("alloc space")?;
        let zygote = ZygoteSpace::new("zygote space", Arc::clone(&main));
        self.main_space.store(Some(Arc::clone(&successor)));
        self.zygote_space.store(Some(Arc::clone(&zygote)));
        self.have_zygote_space.store(true, Ordering::Relaxed);

        // References out of the frozen space are discovered through a
        // card-grained remembered set from here on.
        let table: Arc<dyn ModUnionTable> = Arc::new(ModUnionTableCardCache::new(
            "zygote mod-union table",
            Arc::clone(&self.card_table),
            Arc::clone(&self.model),
            zygote.clone() as Arc<dyn ContinuousSpace>,
        ));
        self.mod_union_tables
            .lock()
            .push((zygote as Arc<dyn ContinuousSpace>, table));

        // Post-fork allocation goes through the successor free-list space.
        self.current_allocator.store(match successor.kind() {
            FreeListKind::Ros => AllocatorType::RosAlloc,
            FreeListKind::Dl => AllocatorType::DlMalloc,
        });
        self.rebuild_continuous_spaces();
        self.resume_all_after_gc();

        let mut state = self.gc_state.lock();
        state.collector_type = self.config.post_zygote_collector_type;
        if state.collector_type.is_moving() {
            // The zygote layout allocates from the free-list space; moving
            // collectors re-engage on the next transition.
            state.collector_type = CollectorType::Cms;
        }
        state.is_gc_running = false;
        drop(state);
        self.gc_complete_cond.notify_all();

        tracing::info!(
            zygote_bytes = self.zygote_space.load_full().map_or(0, |z| z.bytes_allocated()),
            "zygote space created"
        );
        Ok(())
    }

    // ---- trimming ----

    /// Return free pages of the free-list spaces to the OS.
    pub fn trim(&self) -> usize {
        self.wait_for_gc_to_complete();
        let start = Instant::now();
        let mut reclaimed = 0;
        if let Some(main) = self.main_space.load_full() {
            reclaimed += main.trim();
        }
        let footprint = self.max_allowed_footprint().max(1);
        let managed_utilization = self.bytes_allocated() * 100 / footprint;
        tracing::info!(
            reclaimed,
            managed_utilization_percent = managed_utilization,
            duration = ?start.elapsed(),
            "heap trim"
        );
        reclaimed
    }

    pub fn request_trim(&self) {
        let heap = self.this();
        std::thread::Builder::new()
            .name("gc-trim".to_string())
            .spawn(move || {
                heap.trim();
            })
            .expect("failed to spawn trim thread");
    }

    // ---- verification ----

    /// True when `obj` is a live object in some space (or a newborn still on
    /// the allocation stack).
    pub fn is_live_object(&self, obj: ObjectRef) -> bool {
        for space in self.continuous_spaces().iter() {
            if space.contains(obj) {
                let addr = obj.to_address();
                if let Some(bump) = self.bump_space.load_full() {
                    if bump.begin() == space.begin() {
                        return addr < bump.end();
                    }
                }
                if let Some(temp) = self.temp_space.load_full() {
                    if temp.begin() == space.begin() {
                        return addr < temp.end();
                    }
                }
                return space.live_bitmap().test(obj)
                    || self.allocation_stack.load().contains(obj)
                    || self.live_stack.load().contains(obj);
            }
        }
        if self.large_object_space.contains(obj) {
            return self.large_object_space.live_objects().test(obj)
                || self.allocation_stack.load().contains(obj)
                || self.live_stack.load().contains(obj);
        }
        false
    }

    /// Walk every live object and check each outgoing reference lands on a
    /// live object. Returns the number of violations (each one is dumped).
    pub fn verify_heap_references(&self) -> usize {
        let mut failures = 0;
        let mut verify = |obj: ObjectRef| {
            self.model.visit_reference_slots(obj, &mut |slot| {
                // SAFETY: the model yields in-object field slots.
                if let Some(target) = unsafe { load_ref_slot(slot) } {
                    if !self.is_live_object(target) {
                        failures += 1;
                        self.dump_broken_reference(obj, slot, target);
                    }
                }
            });
        };

        for space in self.continuous_spaces().iter() {
            let is_bump = self
                .bump_space
                .load_full()
                .is_some_and(|b| b.begin() == space.begin())
                || self
                    .temp_space
                    .load_full()
                    .is_some_and(|t| t.begin() == space.begin());
            if is_bump {
                if let Some(bump) = self.bump_space.load_full() {
                    if bump.begin() == space.begin() {
                        bump.walk(self.model.as_ref(), &mut verify);
                    }
                }
            } else {
                space.live_bitmap().walk(&mut verify);
            }
        }
        self.large_object_space.live_objects().walk(&mut verify);
        self.allocation_stack.load().visit(&mut verify);
        failures
    }

    fn dump_broken_reference(&self, referrer: ObjectRef, slot: Address, target: ObjectRef) {
        let card = self.card_table.get_card(referrer.to_address());
        tracing::error!(
            referrer = ?referrer,
            slot = %slot,
            target = ?target,
            referrer_card = card,
            "heap corruption: reference to non-live object"
        );
        if let Some(main) = self.main_space.load_full() {
            for (addr, class) in main.recently_freed() {
                if addr == target.to_address() {
                    tracing::error!(
                        target = ?target,
                        class_word = format_args!("0x{class:x}"),
                        "target was recently freed"
                    );
                }
            }
        }
    }

    /// Check that every reference into the newly allocated set comes from an
    /// object whose card is dirty or aged. Returns violations.
    pub fn verify_missing_card_marks(&self) -> usize {
        let alloc_stack = self.allocation_stack.load_full();
        alloc_stack.sort();
        let mut failures = 0;
        for space in self.continuous_spaces().iter() {
            if space.retention_policy() != GcRetentionPolicy::AlwaysCollect {
                continue;
            }
            space.live_bitmap().walk(&mut |obj| {
                let card = self.card_table.get_card(obj.to_address());
                if card >= CARD_AGED {
                    return;
                }
                self.model.visit_reference_slots(obj, &mut |slot| {
                    // SAFETY: the model yields in-object field slots.
                    if let Some(target) = unsafe { load_ref_slot(slot) } {
                        if alloc_stack.contains_sorted(target) {
                            failures += 1;
                            tracing::error!(
                                referrer = ?obj,
                                target = ?target,
                                card,
                                "missing card mark for reference to new object"
                            );
                        }
                    }
                });
            });
        }
        failures
    }

    fn verify_or_die(&self, phase: &str) {
        let failures = self.verify_heap_references();
        if failures > 0 {
            self.dump_spaces();
            panic!("{phase} heap verification found {failures} broken references");
        }
    }

    fn pre_gc_verification(&self) {
        if self.config.verify.contains(VerifyFlags::PRE_GC) {
            self.suspend_all_for_gc();
            self.verify_or_die("pre-GC");
            self.resume_all_after_gc();
        }
        if self.config.verify.contains(VerifyFlags::MISSING_CARD_MARKS) {
            self.suspend_all_for_gc();
            let failures = self.verify_missing_card_marks();
            self.resume_all_after_gc();
            if failures > 0 {
                self.dump_spaces();
                panic!("missing-card-mark verification found {failures} violations");
            }
        }
    }

    pub(crate) fn pre_sweep_verification(&self) {
        if self.config.verify.contains(VerifyFlags::PRE_SWEEP) {
            self.verify_or_die("pre-sweep");
        }
    }

    fn post_gc_verification(&self) {
        if self.config.verify.contains(VerifyFlags::POST_GC) {
            self.suspend_all_for_gc();
            self.verify_or_die("post-GC");
            self.resume_all_after_gc();
        }
    }

    // ---- diagnostics ----

    pub fn dump_spaces(&self) {
        for space in self.continuous_spaces().iter() {
            tracing::error!(
                space = space.name(),
                begin = %space.begin(),
                end = %space.end(),
                limit = %space.limit(),
                policy = ?space.retention_policy(),
                live = space.live_bitmap().count(),
                "space dump"
            );
        }
        tracing::error!(
            los_objects = self.large_object_space.objects_allocated(),
            los_bytes = self.large_object_space.bytes_allocated(),
            "large object space dump"
        );
        let tables = self.mod_union_tables.lock();
        for (_, table) in tables.iter() {
            tracing::error!(dump = %table.dump(), "mod-union table");
        }
    }

    pub fn dump_gc_performance_info(&self) -> String {
        use std::fmt::Write as _;
        let mut out = String::new();
        let records = self.collector_records.lock();
        for (name, record) in records.iter() {
            let _ = writeln!(
                out,
                "{name}: {} GCs, {:?} total, freed {} objects / {} bytes, \
                 pauses: {} (mean {:?}, max {:?}), last {:?} ({})",
                record.runs,
                record.cumulative_time,
                record.cumulative_freed_objects,
                record.cumulative_freed_bytes,
                record.pause_histogram.count(),
                record.pause_histogram.mean(),
                record.pause_histogram.max(),
                record.last_duration,
                record
                    .last_gc_type
                    .map_or("none".to_string(), |t| t.to_string()),
            );
        }
        let _ = writeln!(
            out,
            "total bytes allocated: {}, total freed: {}, native: {}",
            self.bytes_allocated(),
            self.total_bytes_freed_ever.load(Ordering::Relaxed),
            self.native_bytes_allocated(),
        );
        out
    }

    /// Tear the heap down: wait out any in-flight collection and drop the
    /// shared self-reference so background requests stop resolving.
    pub fn shutdown(&self) {
        self.wait_for_gc_to_complete();
    }
}

