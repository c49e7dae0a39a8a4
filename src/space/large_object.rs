//! Large-object space: one anonymous mapping per object.
//!
//! Membership cannot be an address-range test, so the space keeps a
//! concurrent map of its objects and a pair of object sets playing the role
//! of live/mark bitmaps.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use dashmap::DashMap;

use crate::accounting::LargeObjectSet;
use crate::mem_map::{MemMap, Protection};
use crate::object::{Address, ObjectRef};

use super::{GcRetentionPolicy, Space};

pub struct LargeObjectSpace {
    name: String,
    maps: DashMap<usize, MemMap>,
    live_objects: ArcSwap<LargeObjectSet>,
    mark_objects: ArcSwap<LargeObjectSet>,
    bytes_allocated: AtomicUsize,
    objects_allocated: AtomicUsize,
    total_bytes_allocated: AtomicUsize,
}

impl LargeObjectSpace {
    pub fn new(name: &str) -> Arc<LargeObjectSpace> {
        Arc::new(LargeObjectSpace {
            name: name.to_string(),
            maps: DashMap::new(),
            live_objects: ArcSwap::from_pointee(LargeObjectSet::new(&format!("{name} live"))),
            mark_objects: ArcSwap::from_pointee(LargeObjectSet::new(&format!("{name} mark"))),
            bytes_allocated: AtomicUsize::new(0),
            objects_allocated: AtomicUsize::new(0),
            total_bytes_allocated: AtomicUsize::new(0),
        })
    }

    pub fn alloc(&self, num_bytes: usize) -> Option<(ObjectRef, usize)> {
        let mem =
            MemMap::map_anonymous("large object", None, num_bytes, Protection::ReadWrite).ok()?;
        let addr = mem.begin();
        let bytes = mem.size();
        self.maps.insert(addr.as_usize(), mem);
        self.bytes_allocated.fetch_add(bytes, Ordering::Relaxed);
        self.total_bytes_allocated.fetch_add(bytes, Ordering::Relaxed);
        self.objects_allocated.fetch_add(1, Ordering::Relaxed);
        // SAFETY: a fresh mapping is non-null and page (hence object) aligned.
        Some((unsafe { ObjectRef::from_address_unchecked(addr) }, bytes))
    }

    /// Unmap `obj`; returns the bytes released, 0 when the object was not
    /// ours.
    pub fn free(&self, obj: ObjectRef) -> usize {
        match self.maps.remove(&obj.to_address().as_usize()) {
            Some((_, mem)) => {
                let bytes = mem.size();
                self.bytes_allocated.fetch_sub(bytes, Ordering::Relaxed);
                self.objects_allocated.fetch_sub(1, Ordering::Relaxed);
                self.live_objects.load().clear(obj);
                self.mark_objects.load().clear(obj);
                bytes
            }
            None => {
                tracing::error!(space = %self.name, object = ?obj, "free of unmapped large object");
                0
            }
        }
    }

    pub fn contains(&self, obj: ObjectRef) -> bool {
        self.maps.contains_key(&obj.to_address().as_usize())
    }

    /// Address-range membership for interior pointers: true when `addr`
    /// falls inside any large object's mapping.
    pub fn contains_address(&self, addr: Address) -> bool {
        self.maps.iter().any(|entry| entry.value().contains(addr))
    }

    pub fn object_size(&self, obj: ObjectRef) -> usize {
        self.maps
            .get(&obj.to_address().as_usize())
            .map_or(0, |entry| entry.value().size())
    }

    pub fn live_objects(&self) -> Arc<LargeObjectSet> {
        self.live_objects.load_full()
    }

    pub fn mark_objects(&self) -> Arc<LargeObjectSet> {
        self.mark_objects.load_full()
    }

    pub fn swap_object_sets(&self) {
        let live = self.live_objects.load_full();
        let mark = self.mark_objects.load_full();
        self.live_objects.store(mark);
        self.mark_objects.store(live);
    }

    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated.load(Ordering::Relaxed)
    }

    pub fn objects_allocated(&self) -> usize {
        self.objects_allocated.load(Ordering::Relaxed)
    }

    pub fn total_bytes_allocated(&self) -> usize {
        self.total_bytes_allocated.load(Ordering::Relaxed)
    }

    /// Free every allocated-but-unmarked object. When the collector has
    /// already swapped the object sets, the allocation set is found in the
    /// mark role and the marked set in the live role. Returns
    /// (objects, bytes) freed.
    pub fn sweep(&self, swapped: bool) -> (usize, usize) {
        let (alloc_set, marked_set) = if swapped {
            (self.mark_objects.load_full(), self.live_objects.load_full())
        } else {
            (self.live_objects.load_full(), self.mark_objects.load_full())
        };
        let mut dead = Vec::new();
        alloc_set.walk(&mut |obj| {
            if !marked_set.test(obj) {
                dead.push(obj);
            }
        });
        let mut freed_bytes = 0;
        for obj in &dead {
            alloc_set.clear(*obj);
            freed_bytes += self.free(*obj);
        }
        (dead.len(), freed_bytes)
    }
}

impl Space for LargeObjectSpace {
    fn name(&self) -> &str {
        &self.name
    }

    fn retention_policy(&self) -> GcRetentionPolicy {
        GcRetentionPolicy::AlwaysCollect
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_and_membership() {
        let space = LargeObjectSpace::new("los");
        let (obj, bytes) = space.alloc(100 * 1024).unwrap();
        assert!(bytes >= 100 * 1024);
        assert!(space.contains(obj));
        assert!(space.contains_address(obj.to_address() + 4096));
        assert_eq!(space.bytes_allocated(), bytes);
        assert_eq!(space.free(obj), bytes);
        assert!(!space.contains(obj));
        assert_eq!(space.bytes_allocated(), 0);
    }

    #[test]
    fn sweep_frees_unmarked() {
        let space = LargeObjectSpace::new("los");
        let (keep, _) = space.alloc(64 * 1024).unwrap();
        let (drop_me, drop_bytes) = space.alloc(64 * 1024).unwrap();
        space.live_objects().set(keep);
        space.live_objects().set(drop_me);
        space.mark_objects().set(keep);

        let (objects, bytes) = space.sweep(false);
        assert_eq!(objects, 1);
        assert_eq!(bytes, drop_bytes);
        assert!(space.contains(keep));
        assert!(!space.contains(drop_me));
    }
}
