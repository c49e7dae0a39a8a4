//! Heap construction parameters.

use std::path::PathBuf;
use std::time::Duration;

use bitflags::bitflags;

/// Collector families the heap can be configured to run.
///
/// `Ms`/`Cms` are the non-moving mark-sweep family (stop-the-world and
/// concurrent flavors); `Ss`/`Gss` are the moving semi-space family
/// (whole-heap and generational flavors).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CollectorType {
    Ms,
    Cms,
    Ss,
    Gss,
}

impl CollectorType {
    /// Whether this collector family evacuates objects.
    pub fn is_moving(self) -> bool {
        matches!(self, CollectorType::Ss | CollectorType::Gss)
    }
}

bitflags! {
    /// Which of the independent heap-verification passes run around each GC.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VerifyFlags: u32 {
        const PRE_GC = 1 << 0;
        const PRE_SWEEP = 1 << 1;
        const POST_GC = 1 << 2;
        const MISSING_CARD_MARKS = 1 << 3;
    }
}

/// Configuration for [`crate::heap::Heap`] construction.
///
/// # Examples
///
/// ```
/// use cinder::config::{CollectorType, HeapConfig};
///
/// let config = HeapConfig {
///     capacity: 16 * 1024 * 1024,
///     collector_type: CollectorType::Cms,
///     ..HeapConfig::default()
/// };
/// assert!(config.target_utilization > 0.0 && config.target_utilization < 1.0);
/// ```
#[derive(Debug, Clone)]
pub struct HeapConfig {
    /// Initial soft footprint target in bytes.
    pub initial_size: usize,
    /// Soft cap the growth policy will not exceed; raised to `capacity` only
    /// on the allocation retry that is allowed to grow.
    pub growth_limit: usize,
    /// Hard capacity of the managed address range in bytes.
    pub capacity: usize,
    /// Lower bound of free headroom kept around each resize target.
    pub min_free: usize,
    /// Upper bound of free headroom kept around each resize target.
    pub max_free: usize,
    /// Desired live/footprint ratio after a non-sticky GC, in (0, 1).
    pub target_utilization: f64,
    /// Collector the heap starts in.
    pub collector_type: CollectorType,
    /// Collector adopted for foreground work once the zygote has forked.
    pub post_zygote_collector_type: CollectorType,
    /// Collector adopted when the process drops to the background.
    pub background_collector_type: CollectorType,
    /// Worker threads for stop-the-world collections (0 = GC thread only).
    pub parallel_gc_threads: usize,
    /// Worker threads for the concurrent phases of concurrent collections.
    pub conc_gc_threads: usize,
    /// Shrink the heap aggressively after each GC.
    pub low_memory_mode: bool,
    /// Treat the soft footprint target as unlimited (test configurations).
    pub ignore_max_footprint: bool,
    /// Carve thread-local allocation buffers out of bump-pointer spaces.
    pub use_tlab: bool,
    /// Pauses longer than this are logged at WARN.
    pub long_pause_log_threshold: Duration,
    /// Collections longer than this are logged at WARN.
    pub long_gc_log_threshold: Duration,
    /// Verification passes to run around each collection.
    pub verify: VerifyFlags,
    /// Optional pre-baked image to map read-only at startup.
    pub image_file: Option<PathBuf>,
    /// Allocations at or above this many bytes go to the large-object space.
    pub large_object_threshold: usize,
}

impl Default for HeapConfig {
    fn default() -> Self {
        HeapConfig {
            initial_size: 2 * 1024 * 1024,
            growth_limit: 32 * 1024 * 1024,
            capacity: 64 * 1024 * 1024,
            min_free: 512 * 1024,
            max_free: 2 * 1024 * 1024,
            target_utilization: 0.5,
            collector_type: CollectorType::Cms,
            post_zygote_collector_type: CollectorType::Cms,
            background_collector_type: CollectorType::Ms,
            parallel_gc_threads: 1,
            conc_gc_threads: 1,
            low_memory_mode: false,
            ignore_max_footprint: false,
            use_tlab: false,
            long_pause_log_threshold: Duration::from_millis(5),
            long_gc_log_threshold: Duration::from_millis(100),
            verify: VerifyFlags::empty(),
            image_file: None,
            large_object_threshold: 3 * 4096,
        }
    }
}

impl HeapConfig {
    /// Clamp derived quantities into a consistent state. Called by the heap
    /// constructor so ad-hoc test configs do not need to be exact.
    pub(crate) fn normalized(mut self) -> Self {
        self.growth_limit = self.growth_limit.min(self.capacity);
        self.initial_size = self.initial_size.min(self.growth_limit);
        self.min_free = self.min_free.min(self.max_free);
        self.target_utilization = self.target_utilization.clamp(0.05, 0.95);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_consistent() {
        let config = HeapConfig::default().normalized();
        assert!(config.initial_size <= config.growth_limit);
        assert!(config.growth_limit <= config.capacity);
        assert!(config.min_free <= config.max_free);
    }

    #[test]
    fn normalize_clamps_growth_limit() {
        let config = HeapConfig {
            growth_limit: usize::MAX,
            ..HeapConfig::default()
        }
        .normalized();
        assert_eq!(config.growth_limit, config.capacity);
    }

    #[test]
    fn moving_families() {
        assert!(!CollectorType::Ms.is_moving());
        assert!(!CollectorType::Cms.is_moving());
        assert!(CollectorType::Ss.is_moving());
        assert!(CollectorType::Gss.is_moving());
    }
}
