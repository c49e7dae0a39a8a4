//! Allocation spaces.
//!
//! The hierarchy is sealed by construction: every continuous space is backed
//! by exactly one mapping and one concrete allocator variant (bump pointer,
//! free list, read-only image, frozen zygote), and the discontinuous
//! large-object space maps each object individually. The heap keeps typed
//! handles to each concrete space and a sorted snapshot list of the
//! continuous ones, so nothing re-derives a space's flavor at runtime.

pub mod bump_pointer;
pub mod image;
pub mod large_object;
pub mod malloc_space;
pub mod zygote;

use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::accounting::SpaceBitmap;
use crate::object::{Address, ObjectRef};

pub use bump_pointer::BumpPointerSpace;
pub use image::ImageSpace;
pub use large_object::LargeObjectSpace;
pub use malloc_space::{FreeListKind, MallocSpace};
pub use zygote::ZygoteSpace;

/// How often a space participates in collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcRetentionPolicy {
    /// Collected by every GC type (main allocation spaces).
    AlwaysCollect,
    /// Collected only by full GCs (the zygote space).
    FullCollect,
    /// Never collected (the image space).
    NeverCollect,
}

pub trait Space: Send + Sync {
    fn name(&self) -> &str;
    fn retention_policy(&self) -> GcRetentionPolicy;
}

/// A space backed by a single contiguous mapping: `[begin, end) <= limit`.
pub trait ContinuousSpace: Space {
    fn begin(&self) -> Address;

    /// Current high-water mark of allocation.
    fn end(&self) -> Address;

    fn limit(&self) -> Address;

    fn live_bitmap(&self) -> Arc<SpaceBitmap>;

    fn mark_bitmap(&self) -> Arc<SpaceBitmap>;

    /// Swap the live and mark bitmaps. Only under stop-the-world.
    fn swap_bitmaps(&self);

    fn contains(&self, obj: ObjectRef) -> bool {
        let addr = obj.to_address();
        addr >= self.begin() && addr < self.limit()
    }

    fn capacity(&self) -> usize {
        self.limit() - self.begin()
    }
}

/// A continuous space whose dead objects are returned to a free list by the
/// mark-sweep family.
pub trait SweepableSpace: ContinuousSpace {
    /// Batched free of swept objects; returns the bytes reclaimed.
    fn sweep_free_list(&self, objs: &[ObjectRef]) -> usize;
}

impl SweepableSpace for MallocSpace {
    fn sweep_free_list(&self, objs: &[ObjectRef]) -> usize {
        self.free_list(objs)
    }
}

impl SweepableSpace for ZygoteSpace {
    fn sweep_free_list(&self, objs: &[ObjectRef]) -> usize {
        self.free_list(objs)
    }
}

/// The live/mark bitmap pair every continuous space owns. The pair is
/// swapped at the end of a full collection cycle; readers snapshot an `Arc`
/// and stay coherent across the swap.
pub(crate) struct BitmapPair {
    live: ArcSwap<SpaceBitmap>,
    mark: ArcSwap<SpaceBitmap>,
}

impl BitmapPair {
    pub(crate) fn new(space_name: &str, begin: Address, capacity: usize) -> BitmapPair {
        BitmapPair {
            live: ArcSwap::from_pointee(SpaceBitmap::new(
                &format!("{space_name} live"),
                begin,
                capacity,
            )),
            mark: ArcSwap::from_pointee(SpaceBitmap::new(
                &format!("{space_name} mark"),
                begin,
                capacity,
            )),
        }
    }

    pub(crate) fn live(&self) -> Arc<SpaceBitmap> {
        self.live.load_full()
    }

    pub(crate) fn mark(&self) -> Arc<SpaceBitmap> {
        self.mark.load_full()
    }

    pub(crate) fn swap(&self) {
        let live = self.live.load_full();
        let mark = self.mark.load_full();
        self.live.store(mark);
        self.mark.store(live);
    }

    /// Install a fresh pair, used when a space's covered range changes.
    pub(crate) fn replace(&self, live: SpaceBitmap, mark: SpaceBitmap) {
        self.live.store(Arc::new(live));
        self.mark.store(Arc::new(mark));
    }
}
