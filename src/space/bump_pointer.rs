//! Bump-pointer space: lock-free linear allocation out of one mapping.
//!
//! Mutators either bump the shared cursor directly or carve thread-local
//! allocation buffers (TLABs) from it and bump privately. Allocation extents
//! are tracked in a small block ledger so the space can be walked densely
//! even when revoked TLABs leave unused tails.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::accounting::SpaceBitmap;
use crate::error::HeapResult;
use crate::mem_map::{MemMap, Protection};
use crate::object::{Address, ObjectModel, ObjectRef, OBJECT_ALIGNMENT};

use super::{BitmapPair, ContinuousSpace, GcRetentionPolicy, Space};

/// Bytes handed to a thread per TLAB refill.
pub const TLAB_SIZE: usize = 256 * 1024;

#[derive(Debug, Clone, Copy)]
struct Block {
    begin: usize,
    /// One past the last allocated byte within the block.
    used_end: usize,
}

#[derive(Default)]
struct BlockLedger {
    /// End of the densely packed region allocated by direct bumps before the
    /// first TLAB was carved.
    main_end: usize,
    /// TLAB extents, each densely packed up to its `used_end`.
    blocks: Vec<Block>,
    block_mode: bool,
}

pub struct BumpPointerSpace {
    name: String,
    mem: MemMap,
    cursor: AtomicUsize,
    bitmaps: BitmapPair,
    ledger: Mutex<BlockLedger>,
    objects_allocated: AtomicUsize,
    bytes_allocated: AtomicUsize,
}

impl BumpPointerSpace {
    pub fn new(name: &str, capacity: usize) -> HeapResult<Arc<BumpPointerSpace>> {
        let mem = MemMap::map_anonymous(name, None, capacity, Protection::ReadWrite)?;
        Ok(Arc::new(BumpPointerSpace::from_mem_map(name, mem)))
    }

    pub fn from_mem_map(name: &str, mem: MemMap) -> BumpPointerSpace {
        let begin = mem.begin();
        let capacity = mem.size();
        BumpPointerSpace {
            name: name.to_string(),
            bitmaps: BitmapPair::new(name, begin, capacity),
            cursor: AtomicUsize::new(begin.as_usize()),
            ledger: Mutex::new(BlockLedger {
                main_end: begin.as_usize(),
                ..BlockLedger::default()
            }),
            objects_allocated: AtomicUsize::new(0),
            bytes_allocated: AtomicUsize::new(0),
            mem,
        }
    }

    /// Claim `bytes` from the shared cursor. Returns the claimed range begin.
    fn bump(&self, bytes: usize) -> Option<Address> {
        let limit = self.limit().as_usize();
        let mut current = self.cursor.load(Ordering::Relaxed);
        loop {
            if current + bytes > limit {
                return None;
            }
            match self.cursor.compare_exchange_weak(
                current,
                current + bytes,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(Address::from_usize(current)),
                Err(actual) => current = actual,
            }
        }
    }

    /// Direct (non-TLAB) allocation. The returned memory is zeroed: pages
    /// are fresh from the kernel or were madvised away by the last clear.
    pub fn alloc(&self, num_bytes: usize) -> Option<(ObjectRef, usize)> {
        let bytes = align_object(num_bytes);
        let addr = self.bump(bytes)?;
        self.objects_allocated.fetch_add(1, Ordering::Relaxed);
        self.bytes_allocated.fetch_add(bytes, Ordering::Relaxed);
        let mut ledger = self.ledger.lock();
        if ledger.block_mode {
            ledger.blocks.push(Block {
                begin: addr.as_usize(),
                used_end: addr.as_usize() + bytes,
            });
        } else {
            ledger.main_end = self.cursor.load(Ordering::Relaxed);
        }
        drop(ledger);
        // SAFETY: bump() returned an aligned, in-bounds, non-null address.
        Some((unsafe { ObjectRef::from_address_unchecked(addr) }, bytes))
    }

    /// Carve a fresh TLAB of at least `min_bytes`. Returns `[start, end)`.
    pub fn alloc_new_tlab(&self, min_bytes: usize) -> Option<(Address, Address)> {
        let bytes = align_object(min_bytes.max(TLAB_SIZE));
        let start = self.bump(bytes)?;
        let mut ledger = self.ledger.lock();
        ledger.block_mode = true;
        ledger.blocks.push(Block {
            begin: start.as_usize(),
            used_end: start.as_usize(),
        });
        Some((start, start + bytes))
    }

    /// Record the used extent of a revoked TLAB along with its allocation
    /// counts, which thread-local allocation kept private until now.
    pub fn record_tlab_revoke(&self, start: Address, pos: Address, objects: usize) {
        let mut ledger = self.ledger.lock();
        if let Some(block) = ledger
            .blocks
            .iter_mut()
            .find(|b| b.begin == start.as_usize())
        {
            block.used_end = pos.as_usize();
        }
        drop(ledger);
        self.objects_allocated.fetch_add(objects, Ordering::Relaxed);
        self.bytes_allocated
            .fetch_add(pos - start, Ordering::Relaxed);
    }

    pub fn objects_allocated(&self) -> usize {
        self.objects_allocated.load(Ordering::Relaxed)
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.end() == self.begin()
    }

    /// Visit every object in address order using the object-size callback to
    /// step through the packed extents.
    pub fn walk(&self, model: &dyn ObjectModel, visitor: &mut dyn FnMut(ObjectRef)) {
        let (main_end, mut blocks) = {
            let ledger = self.ledger.lock();
            (ledger.main_end, ledger.blocks.clone())
        };
        blocks.sort_unstable_by_key(|b| b.begin);
        let mut extents = Vec::with_capacity(blocks.len() + 1);
        extents.push((self.begin().as_usize(), main_end));
        extents.extend(blocks.iter().map(|b| (b.begin, b.used_end)));
        for (begin, end) in extents {
            let mut addr = begin;
            while addr < end {
                // SAFETY: extents contain densely packed live objects.
                let obj = unsafe { ObjectRef::from_address_unchecked(Address::from_usize(addr)) };
                visitor(obj);
                addr += align_object(model.size_of(obj));
            }
        }
    }

    /// Drop every object: reset the cursor, release the pages, clear both
    /// bitmaps. The space reads as zero afterwards.
    pub fn clear(&self) {
        self.mem.madvise_dont_need(self.begin(), self.mem.end());
        self.cursor.store(self.begin().as_usize(), Ordering::Relaxed);
        let mut ledger = self.ledger.lock();
        ledger.main_end = self.begin().as_usize();
        ledger.blocks.clear();
        ledger.block_mode = false;
        drop(ledger);
        self.objects_allocated.store(0, Ordering::Relaxed);
        self.bytes_allocated.store(0, Ordering::Relaxed);
        self.bitmaps.live().clear_all();
        self.bitmaps.mark().clear_all();
    }
}

impl Space for BumpPointerSpace {
    fn name(&self) -> &str {
        &self.name
    }

    fn retention_policy(&self) -> GcRetentionPolicy {
        GcRetentionPolicy::AlwaysCollect
    }
}

impl ContinuousSpace for BumpPointerSpace {
    fn begin(&self) -> Address {
        self.mem.begin()
    }

    fn end(&self) -> Address {
        Address::from_usize(self.cursor.load(Ordering::Relaxed))
    }

    fn limit(&self) -> Address {
        self.mem.end()
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

#[inline]
pub fn align_object(size: usize) -> usize {
    (size.max(OBJECT_ALIGNMENT) + OBJECT_ALIGNMENT - 1) & !(OBJECT_ALIGNMENT - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump_allocations_are_adjacent() {
        let space = BumpPointerSpace::new("bump", 1024 * 1024).unwrap();
        let (a, a_bytes) = space.alloc(24).unwrap();
        let (b, _) = space.alloc(8).unwrap();
        assert_eq!(a.to_address() + a_bytes, b.to_address());
        assert_eq!(space.objects_allocated(), 2);
        assert_eq!(space.bytes_allocated(), a_bytes + 8);
    }

    #[test]
    fn exhaustion_returns_none_without_growing() {
        let space = BumpPointerSpace::new("bump", 64 * 1024).unwrap();
        assert!(space.alloc(space.capacity() + 8).is_none());
        let (_, bytes) = space.alloc(space.capacity() / 2).unwrap();
        assert!(bytes <= space.capacity());
    }

    #[test]
    fn tlab_extents_walk_densely() {
        struct FixedSize;
        impl ObjectModel for FixedSize {
            fn size_of(&self, _obj: ObjectRef) -> usize {
                32
            }
            fn visit_reference_slots(&self, _obj: ObjectRef, _v: &mut dyn FnMut(Address)) {}
            fn reference_kind(&self, _obj: ObjectRef) -> crate::object::ReferenceKind {
                crate::object::ReferenceKind::None
            }
            fn referent_slot(&self, r: ObjectRef) -> Address {
                r.to_address()
            }
            fn pending_next_slot(&self, r: ObjectRef) -> Address {
                r.to_address()
            }
        }

        let space = BumpPointerSpace::new("bump", 1024 * 1024).unwrap();
        let (start, end) = space.alloc_new_tlab(1024).unwrap();
        assert!(end - start >= TLAB_SIZE);
        // Simulate three TLAB object allocations then a revoke at 96 bytes.
        space.record_tlab_revoke(start, start + 96, 3);

        let mut walked = 0;
        space.walk(&FixedSize, &mut |_| walked += 1);
        assert_eq!(walked, 3);
        assert_eq!(space.objects_allocated(), 3);
        assert_eq!(space.bytes_allocated(), 96);
    }

    #[test]
    fn clear_empties_the_space() {
        let space = BumpPointerSpace::new("bump", 128 * 1024).unwrap();
        let (obj, _) = space.alloc(64).unwrap();
        unsafe { obj.to_address().store_word(0x5a5a) };
        space.clear();
        assert!(space.is_empty());
        assert_eq!(unsafe { obj.to_address().load_word() }, 0);
    }
}
