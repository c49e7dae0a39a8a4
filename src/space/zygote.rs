//! Zygote space: the main malloc space frozen after the pre-fork compaction
//! so child processes share its pages.
//!
//! The wrapped space no longer accepts allocation; it is collected only by
//! full GCs, and its references into younger spaces are discovered through a
//! mod-union table rather than whole-space scans.

use std::sync::Arc;

use crate::accounting::SpaceBitmap;
use crate::object::{Address, ObjectRef};

use super::{ContinuousSpace, GcRetentionPolicy, MallocSpace, Space};

pub struct ZygoteSpace {
    name: String,
    inner: Arc<MallocSpace>,
}

impl ZygoteSpace {
    /// Wrap a malloc space that was just frozen by
    /// [`MallocSpace::create_zygote_space`].
    pub fn new(name: &str, frozen: Arc<MallocSpace>) -> Arc<ZygoteSpace> {
        debug_assert_eq!(frozen.retention_policy(), GcRetentionPolicy::FullCollect);
        Arc::new(ZygoteSpace {
            name: name.to_string(),
            inner: frozen,
        })
    }

    /// Batched free used when a full collection sweeps the zygote.
    pub fn free_list(&self, objs: &[ObjectRef]) -> usize {
        self.inner.free_list(objs)
    }

    pub fn bytes_allocated(&self) -> usize {
        self.inner.bytes_allocated()
    }

    pub fn objects_allocated(&self) -> usize {
        self.inner.objects_allocated()
    }

    pub fn walk(&self, visitor: &mut dyn FnMut(ObjectRef, usize)) {
        self.inner.walk(visitor)
    }
}

impl Space for ZygoteSpace {
    fn name(&self) -> &str {
        &self.name
    }

    fn retention_policy(&self) -> GcRetentionPolicy {
        GcRetentionPolicy::FullCollect
    }
}

impl ContinuousSpace for ZygoteSpace {
    fn begin(&self) -> Address {
        self.inner.begin()
    }

    fn end(&self) -> Address {
        self.inner.end()
    }

    fn limit(&self) -> Address {
        self.inner.limit()
    }

    fn live_bitmap(&self) -> Arc<SpaceBitmap> {
        self.inner.live_bitmap()
    }

    fn mark_bitmap(&self) -> Arc<SpaceBitmap> {
        self.inner.mark_bitmap()
    }

    fn swap_bitmaps(&self) {
        self.inner.swap_bitmaps()
    }
}
