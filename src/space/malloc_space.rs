//! Free-list malloc spaces.
//!
//! Two allocator flavors share one space type: `Dl` is a first-fit free list
//! with address-ordered coalescing, `Ros` buckets small allocations into
//! power-of-two size brackets backed by runs carved off the arena and falls
//! back to the first-fit path for anything larger. The space keeps a
//! footprint limit distinct from its capacity, and a small ring buffer of
//! recently freed (object, class) pairs for post-mortem diagnostics when a
//! corruption dump hits a stale pointer.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_utils::atomic::AtomicCell;
use parking_lot::Mutex;

use crate::accounting::SpaceBitmap;
use crate::error::HeapResult;
use crate::mem_map::{page_aligned, MemMap, Protection};
use crate::object::{Address, ObjectRef};

use super::bump_pointer::align_object;
use super::{BitmapPair, ContinuousSpace, GcRetentionPolicy, Space};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeListKind {
    /// First-fit free list with coalescing, dlmalloc-style.
    Dl,
    /// Size-bracketed runs for small allocations, rosalloc-style.
    Ros,
}

const MIN_CHUNK: usize = 16;
const MAX_BRACKET: usize = 2048;
const NUM_BRACKETS: usize = 8; // 16, 32, 64, ..., 2048
const SLOTS_PER_RUN: usize = 64;
const RECENT_FREE_CAPACITY: usize = 64;

fn bracket_index(size: usize) -> Option<usize> {
    if size > MAX_BRACKET {
        return None;
    }
    let rounded = size.max(MIN_CHUNK).next_power_of_two();
    Some(rounded.trailing_zeros() as usize - MIN_CHUNK.trailing_zeros() as usize)
}

fn bracket_size(index: usize) -> usize {
    MIN_CHUNK << index
}

struct FreeListAllocator {
    kind: FreeListKind,
    arena_begin: usize,
    arena_limit: usize,
    /// High-water mark of fresh carves; the space footprint.
    arena_end: usize,
    footprint_limit: usize,
    /// (addr, size), sorted by address.
    free_chunks: Vec<(usize, usize)>,
    brackets: Vec<Vec<usize>>,
    /// Live allocation sizes, ordered by address for `walk`.
    allocated: BTreeMap<usize, usize>,
    bytes_allocated: usize,
    objects_allocated: usize,
}

impl FreeListAllocator {
    fn new(kind: FreeListKind, begin: usize, capacity: usize, footprint_limit: usize) -> Self {
        FreeListAllocator {
            kind,
            arena_begin: begin,
            arena_limit: begin + capacity,
            arena_end: begin,
            footprint_limit: footprint_limit.min(capacity),
            free_chunks: Vec::new(),
            brackets: (0..NUM_BRACKETS).map(|_| Vec::new()).collect(),
            allocated: BTreeMap::new(),
            bytes_allocated: 0,
            objects_allocated: 0,
        }
    }

    fn carve(&mut self, bytes: usize) -> Option<usize> {
        let budget_end = (self.arena_begin + self.footprint_limit).min(self.arena_limit);
        if self.arena_end + bytes > budget_end {
            return None;
        }
        let addr = self.arena_end;
        self.arena_end += bytes;
        Some(addr)
    }

    fn alloc_first_fit(&mut self, bytes: usize) -> Option<usize> {
        if let Some(pos) = self.free_chunks.iter().position(|&(_, size)| size >= bytes) {
            let (addr, size) = self.free_chunks[pos];
            if size - bytes >= MIN_CHUNK {
                self.free_chunks[pos] = (addr + bytes, size - bytes);
            } else {
                self.free_chunks.remove(pos);
            }
            return Some(addr);
        }
        self.carve(bytes)
    }

    fn alloc_bracket(&mut self, index: usize) -> Option<usize> {
        if let Some(addr) = self.brackets[index].pop() {
            return Some(addr);
        }
        // Refill the bracket with a freshly carved run.
        let slot = bracket_size(index);
        let run = self.carve(slot * SLOTS_PER_RUN).or_else(|| {
            // Under footprint pressure fall back to a single slot.
            self.carve(slot)
        })?;
        let slots = (self.arena_end - run) / slot;
        for i in (1..slots).rev() {
            self.brackets[index].push(run + i * slot);
        }
        Some(run)
    }

    /// Best-fit allocation: the smallest free chunk that fits, falling back
    /// to a fresh carve. Used by the zygote bin-packing evacuation.
    fn alloc_best_fit(&mut self, num_bytes: usize) -> Option<(usize, usize)> {
        let bytes = align_object(num_bytes).max(MIN_CHUNK);
        let best = self
            .free_chunks
            .iter()
            .enumerate()
            .filter(|(_, &(_, size))| size >= bytes)
            .min_by_key(|(_, &(_, size))| size)
            .map(|(pos, _)| pos);
        let addr = match best {
            Some(pos) => {
                let (addr, size) = self.free_chunks[pos];
                if size - bytes >= MIN_CHUNK {
                    self.free_chunks[pos] = (addr + bytes, size - bytes);
                } else {
                    self.free_chunks.remove(pos);
                }
                addr
            }
            None => self.carve(bytes)?,
        };
        self.allocated.insert(addr, bytes);
        self.bytes_allocated += bytes;
        self.objects_allocated += 1;
        Some((addr, bytes))
    }

    /// Returns (addr, bytes actually consumed).
    fn alloc(&mut self, num_bytes: usize) -> Option<(usize, usize)> {
        let bytes = align_object(num_bytes).max(MIN_CHUNK);
        let (addr, usable) = match self.kind {
            FreeListKind::Ros => match bracket_index(bytes) {
                Some(index) => (self.alloc_bracket(index)?, bracket_size(index)),
                None => (self.alloc_first_fit(bytes)?, bytes),
            },
            FreeListKind::Dl => (self.alloc_first_fit(bytes)?, bytes),
        };
        self.allocated.insert(addr, usable);
        self.bytes_allocated += usable;
        self.objects_allocated += 1;
        Some((addr, usable))
    }

    fn insert_chunk(&mut self, addr: usize, size: usize) {
        let pos = self
            .free_chunks
            .partition_point(|&(chunk, _)| chunk < addr);
        self.free_chunks.insert(pos, (addr, size));
        // Coalesce with the following then the preceding neighbor.
        if pos + 1 < self.free_chunks.len() {
            let (next, next_size) = self.free_chunks[pos + 1];
            if addr + size == next {
                self.free_chunks[pos].1 += next_size;
                self.free_chunks.remove(pos + 1);
            }
        }
        if pos > 0 {
            let (prev, prev_size) = self.free_chunks[pos - 1];
            if prev + prev_size == self.free_chunks[pos].0 {
                self.free_chunks[pos - 1].1 += self.free_chunks[pos].1;
                self.free_chunks.remove(pos);
            }
        }
    }

    /// Returns the bytes returned to the free pool, or None if the address
    /// was not a live allocation.
    fn free(&mut self, addr: usize) -> Option<usize> {
        let size = self.allocated.remove(&addr)?;
        self.bytes_allocated -= size;
        self.objects_allocated -= 1;
        match self.kind {
            FreeListKind::Ros if size <= MAX_BRACKET => {
                // Bracket slots are exact powers of two by construction.
                self.brackets[bracket_index(size).unwrap()].push(addr);
            }
            _ => self.insert_chunk(addr, size),
        }
        Some(size)
    }

    fn largest_contiguous_free(&self) -> usize {
        let tail = (self.arena_begin + self.footprint_limit).min(self.arena_limit)
            - self.arena_end;
        self.free_chunks
            .iter()
            .map(|&(_, size)| size)
            .max()
            .unwrap_or(0)
            .max(tail)
    }
}

pub struct MallocSpace {
    name: String,
    kind: FreeListKind,
    mem: Mutex<MemMap>,
    begin: Address,
    limit: AtomicUsize,
    growth_limit: usize,
    bitmaps: BitmapPair,
    allocator: Mutex<FreeListAllocator>,
    recently_freed: Mutex<VecDeque<(usize, usize)>>,
    can_alloc: AtomicBool,
    policy: AtomicCell<GcRetentionPolicy>,
}

impl MallocSpace {
    pub fn new(
        name: &str,
        kind: FreeListKind,
        initial_footprint: usize,
        growth_limit: usize,
        capacity: usize,
    ) -> HeapResult<Arc<MallocSpace>> {
        let mem = MemMap::map_anonymous(name, None, capacity, Protection::ReadWrite)?;
        Ok(Arc::new(MallocSpace::from_mem_map(
            name,
            kind,
            mem,
            initial_footprint,
            growth_limit,
        )))
    }

    pub(crate) fn from_mem_map(
        name: &str,
        kind: FreeListKind,
        mem: MemMap,
        initial_footprint: usize,
        growth_limit: usize,
    ) -> MallocSpace {
        let begin = mem.begin();
        let capacity = mem.size();
        MallocSpace {
            name: name.to_string(),
            kind,
            begin,
            limit: AtomicUsize::new(mem.end().as_usize()),
            growth_limit: growth_limit.min(capacity),
            bitmaps: BitmapPair::new(name, begin, capacity),
            allocator: Mutex::new(FreeListAllocator::new(
                kind,
                begin.as_usize(),
                capacity,
                initial_footprint.min(capacity),
            )),
            recently_freed: Mutex::new(VecDeque::with_capacity(RECENT_FREE_CAPACITY)),
            can_alloc: AtomicBool::new(true),
            policy: AtomicCell::new(GcRetentionPolicy::AlwaysCollect),
            mem: Mutex::new(mem),
        }
    }

    pub fn kind(&self) -> FreeListKind {
        self.kind
    }

    fn alloc_inner(&self, num_bytes: usize, grow: bool) -> Option<(ObjectRef, usize)> {
        if !self.can_alloc.load(Ordering::Relaxed) {
            return None;
        }
        let mut allocator = self.allocator.lock();
        let result = if grow {
            let old_limit = allocator.footprint_limit;
            allocator.footprint_limit = self.growth_limit;
            let result = allocator.alloc(num_bytes);
            let used = allocator.arena_end - allocator.arena_begin;
            allocator.footprint_limit = old_limit.max(used);
            result
        } else {
            allocator.alloc(num_bytes)
        };
        let (addr, bytes) = result?;
        drop(allocator);
        // Recycled chunks hold stale bytes; allocation hands out zeroed
        // memory.
        // SAFETY: [addr, addr + bytes) was exclusively claimed above.
        unsafe { std::ptr::write_bytes(addr as *mut u8, 0, bytes) };
        Some((
            // SAFETY: the allocator returns aligned, non-null arena addresses.
            unsafe { ObjectRef::from_address_unchecked(Address::from_usize(addr)) },
            bytes,
        ))
    }

    pub fn alloc(&self, num_bytes: usize) -> Option<(ObjectRef, usize)> {
        self.alloc_inner(num_bytes, false)
    }

    /// Allocation that may push the footprint past its soft limit up to the
    /// growth limit.
    pub fn alloc_with_growth(&self, num_bytes: usize) -> Option<(ObjectRef, usize)> {
        self.alloc_inner(num_bytes, true)
    }

    /// Best-fit allocation into the smallest free gap, with the footprint
    /// free to grow. The zygote compaction packs evacuated objects this way.
    pub fn alloc_best_fit(&self, num_bytes: usize) -> Option<(ObjectRef, usize)> {
        if !self.can_alloc.load(Ordering::Relaxed) {
            return None;
        }
        let mut allocator = self.allocator.lock();
        let old_limit = allocator.footprint_limit;
        allocator.footprint_limit = self.growth_limit;
        let result = allocator.alloc_best_fit(num_bytes);
        let used = allocator.arena_end - allocator.arena_begin;
        allocator.footprint_limit = old_limit.max(used);
        let (addr, bytes) = result?;
        drop(allocator);
        // SAFETY: [addr, addr + bytes) was exclusively claimed above.
        unsafe { std::ptr::write_bytes(addr as *mut u8, 0, bytes) };
        Some((
            // SAFETY: the allocator returns aligned, non-null arena addresses.
            unsafe { ObjectRef::from_address_unchecked(Address::from_usize(addr)) },
            bytes,
        ))
    }

    /// Drop every allocation and release the pages: the space ends up empty
    /// with a zeroed arena. Used when a collector transition evacuates this
    /// space wholesale.
    pub fn clear(&self) {
        let mem = self.mem.lock();
        let mut allocator = self.allocator.lock();
        allocator.free_chunks.clear();
        for bracket in &mut allocator.brackets {
            bracket.clear();
        }
        allocator.allocated.clear();
        allocator.arena_end = allocator.arena_begin;
        allocator.bytes_allocated = 0;
        allocator.objects_allocated = 0;
        mem.madvise_dont_need(self.begin, mem.end());
        drop(allocator);
        drop(mem);
        self.bitmaps.live().clear_all();
        self.bitmaps.mark().clear_all();
    }

    /// Free a single object; returns the bytes returned to the free list.
    pub fn free(&self, obj: ObjectRef) -> usize {
        let addr = obj.to_address().as_usize();
        // The class word is still intact for dead-but-unswept objects; keep
        // it for the recently-freed diagnostics ring.
        let class = unsafe { obj.class_word() };
        let freed = self.allocator.lock().free(addr);
        match freed {
            Some(bytes) => {
                let mut ring = self.recently_freed.lock();
                if ring.len() == RECENT_FREE_CAPACITY {
                    ring.pop_front();
                }
                ring.push_back((addr, class));
                bytes
            }
            None => {
                tracing::error!(space = %self.name, object = ?obj, "free of unallocated object");
                0
            }
        }
    }

    /// Batched free used by the sweep phase.
    pub fn free_list(&self, objs: &[ObjectRef]) -> usize {
        let mut freed = 0;
        for &obj in objs {
            freed += self.free(obj);
        }
        freed
    }

    pub fn bytes_allocated(&self) -> usize {
        self.allocator.lock().bytes_allocated
    }

    pub fn objects_allocated(&self) -> usize {
        self.allocator.lock().objects_allocated
    }

    /// Current footprint: the high-water mark of carved arena bytes.
    pub fn footprint(&self) -> usize {
        let allocator = self.allocator.lock();
        allocator.arena_end - allocator.arena_begin
    }

    pub fn footprint_limit(&self) -> usize {
        self.allocator.lock().footprint_limit
    }

    pub fn set_footprint_limit(&self, limit: usize) {
        let mut allocator = self.allocator.lock();
        let used = allocator.arena_end - allocator.arena_begin;
        allocator.footprint_limit = limit.clamp(used, self.growth_limit);
    }

    pub fn growth_limit(&self) -> usize {
        self.growth_limit
    }

    pub fn largest_contiguous_free(&self) -> usize {
        self.allocator.lock().largest_contiguous_free()
    }

    /// Visit live allocations in address order.
    pub fn walk(&self, visitor: &mut dyn FnMut(ObjectRef, usize)) {
        let entries: Vec<(usize, usize)> = {
            let allocator = self.allocator.lock();
            allocator.allocated.iter().map(|(&a, &s)| (a, s)).collect()
        };
        for (addr, size) in entries {
            // SAFETY: the allocated map only holds object addresses.
            visitor(
                unsafe { ObjectRef::from_address_unchecked(Address::from_usize(addr)) },
                size,
            );
        }
    }

    /// Return free pages to the OS. Returns bytes madvised.
    pub fn trim(&self) -> usize {
        let mem = self.mem.lock();
        let allocator = self.allocator.lock();
        let mut reclaimed = 0;
        for &(addr, size) in &allocator.free_chunks {
            reclaimed += mem.madvise_dont_need(
                Address::from_usize(addr),
                Address::from_usize(addr + size),
            );
        }
        reclaimed += mem.madvise_dont_need(Address::from_usize(allocator.arena_end), mem.end());
        reclaimed
    }

    /// Recently freed (object, class-word) pairs, newest last.
    pub fn recently_freed(&self) -> Vec<(Address, usize)> {
        self.recently_freed
            .lock()
            .iter()
            .map(|&(addr, class)| (Address::from_usize(addr), class))
            .collect()
    }

    /// Freeze this space's allocated prefix and return a successor malloc
    /// space built from the remaining reserve. The caller wraps `self` in a
    /// [`super::ZygoteSpace`] afterwards.
    pub fn create_zygote_space(&self, successor_name: &str) -> HeapResult<Arc<MallocSpace>> {
        let mut mem = self.mem.lock();
        let mut allocator = self.allocator.lock();
        let frozen_bytes = page_aligned(allocator.arena_end - allocator.arena_begin).max(
            crate::mem_map::page_size(),
        );
        let tail = mem.split_at(frozen_bytes, successor_name);
        let tail_capacity = tail.size();

        // Shrink this space to the frozen prefix.
        self.limit.store(mem.end().as_usize(), Ordering::Relaxed);
        allocator.arena_limit = mem.end().as_usize();
        allocator.footprint_limit = allocator.arena_end - allocator.arena_begin;
        allocator.free_chunks.clear();
        for bracket in &mut allocator.brackets {
            bracket.clear();
        }
        self.can_alloc.store(false, Ordering::Relaxed);
        self.policy.store(GcRetentionPolicy::FullCollect);

        // Narrow the bitmaps to the frozen extent, preserving set bits.
        let capacity = mem.end() - self.begin;
        let live = SpaceBitmap::new(&format!("{} live", self.name), self.begin, capacity);
        let mark = SpaceBitmap::new(&format!("{} mark", self.name), self.begin, capacity);
        live.copy_from(&self.bitmaps.live());
        mark.copy_from(&self.bitmaps.mark());
        self.bitmaps.replace(live, mark);

        drop(allocator);
        drop(mem);

        Ok(Arc::new(MallocSpace::from_mem_map(
            successor_name,
            self.kind,
            tail,
            tail_capacity,
            tail_capacity,
        )))
    }
}

impl Space for MallocSpace {
    fn name(&self) -> &str {
        &self.name
    }

    fn retention_policy(&self) -> GcRetentionPolicy {
        self.policy.load()
    }
}

impl ContinuousSpace for MallocSpace {
    fn begin(&self) -> Address {
        self.begin
    }

    fn end(&self) -> Address {
        Address::from_usize(self.allocator.lock().arena_end)
    }

    fn limit(&self) -> Address {
        Address::from_usize(self.limit.load(Ordering::Relaxed))
    }

    fn live_bitmap(&self) -> Arc<SpaceBitmap> {
        self.bitmaps.live()
    }

    fn mark_bitmap(&self) -> Arc<SpaceBitmap> {
        self.bitmaps.mark()
    }

    fn swap_bitmaps(&self) {
        self.bitmaps.swap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn space(kind: FreeListKind) -> Arc<MallocSpace> {
        MallocSpace::new("test", kind, 256 * 1024, 1024 * 1024, 1024 * 1024).unwrap()
    }

    #[test]
    fn alloc_zeroes_recycled_memory() {
        let space = space(FreeListKind::Dl);
        let (obj, bytes) = space.alloc(64).unwrap();
        unsafe { obj.to_address().store_word(0xdead) };
        space.free(obj);
        let (again, _) = space.alloc(64).unwrap();
        assert_eq!(again, obj, "first fit reuses the freed chunk");
        assert_eq!(unsafe { again.to_address().load_word() }, 0);
        assert!(bytes >= 64);
    }

    #[test]
    fn free_returns_bytes_and_coalesces() {
        let space = space(FreeListKind::Dl);
        let (a, a_bytes) = space.alloc(128).unwrap();
        let (b, b_bytes) = space.alloc(128).unwrap();
        let (_c, _) = space.alloc(128).unwrap();
        assert_eq!(space.free(a), a_bytes);
        assert_eq!(space.free(b), b_bytes);
        // Coalesced a+b satisfies an allocation bigger than either alone.
        let (d, _) = space.alloc(200).unwrap();
        assert_eq!(d, a);
    }

    #[test]
    fn ros_brackets_recycle_slots() {
        let space = space(FreeListKind::Ros);
        let (a, a_bytes) = space.alloc(24).unwrap();
        assert_eq!(a_bytes, 32, "24 bytes rounds into the 32-byte bracket");
        space.free(a);
        let (b, _) = space.alloc(30).unwrap();
        assert_eq!(b, a, "bracket reuses the freed slot");
    }

    #[test]
    fn footprint_limit_blocks_growth() {
        let space = MallocSpace::new("tight", FreeListKind::Dl, 4096, 64 * 1024, 64 * 1024).unwrap();
        // Exhaust the 4 KiB footprint.
        let mut held = Vec::new();
        while let Some((obj, _)) = space.alloc(512) {
            held.push(obj);
        }
        assert!(space.alloc(512).is_none());
        assert!(space.alloc_with_growth(512).is_some());
        assert!(space.footprint() > 4096);
    }

    #[test]
    fn accounting_tracks_allocations() {
        let space = space(FreeListKind::Dl);
        let (a, a_bytes) = space.alloc(100).unwrap();
        let (_b, b_bytes) = space.alloc(50).unwrap();
        assert_eq!(space.bytes_allocated(), a_bytes + b_bytes);
        assert_eq!(space.objects_allocated(), 2);
        space.free(a);
        assert_eq!(space.bytes_allocated(), b_bytes);
        assert_eq!(space.objects_allocated(), 1);
        assert_eq!(space.recently_freed().len(), 1);
    }

    #[test]
    fn zygote_split_freezes_prefix() {
        let space = space(FreeListKind::Dl);
        let (obj, _) = space.alloc(64).unwrap();
        space.live_bitmap().set(obj);
        let successor = space.create_zygote_space("successor").unwrap();
        assert!(space.alloc(64).is_none(), "frozen space rejects allocation");
        assert_eq!(space.retention_policy(), GcRetentionPolicy::FullCollect);
        assert_eq!(space.limit(), successor.begin());
        assert!(space.live_bitmap().test(obj), "bits survive the narrowing");
        assert!(successor.alloc(64).is_some());
    }
}
