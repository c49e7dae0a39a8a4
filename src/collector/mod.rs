//! Collectors and their bookkeeping.

pub mod mark_sweep;
pub mod semi_space;

use std::time::Duration;

pub use mark_sweep::MarkSweep;
pub use semi_space::SemiSpace;

/// Severity classes of a collection, in escalating order of effort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum GcType {
    /// Mark only objects allocated since the last GC plus their closure.
    Sticky,
    /// Collect everything except the zygote and image spaces.
    Partial,
    /// Collect every malloc space and the large-object space.
    Full,
}

impl std::fmt::Display for GcType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GcType::Sticky => write!(f, "sticky"),
            GcType::Partial => write!(f, "partial"),
            GcType::Full => write!(f, "full"),
        }
    }
}

/// Why a collection ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcCause {
    /// The allocation slow path needed memory.
    ForAlloc,
    /// The concurrent-start watermark was crossed.
    Background,
    /// An explicit runtime request.
    Explicit,
    /// The registered-native-bytes watermark was crossed.
    NativeAlloc,
    /// A collector transition needed the heap evacuated.
    CollectorTransition,
    /// Compaction ahead of the zygote fork.
    Trim,
}

impl std::fmt::Display for GcCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GcCause::ForAlloc => write!(f, "Alloc"),
            GcCause::Background => write!(f, "Background"),
            GcCause::Explicit => write!(f, "Explicit"),
            GcCause::NativeAlloc => write!(f, "NativeAlloc"),
            GcCause::CollectorTransition => write!(f, "CollectorTransition"),
            GcCause::Trim => write!(f, "Trim"),
        }
    }
}

/// Log2-bucketed pause-time histogram.
#[derive(Debug, Clone)]
pub struct PauseHistogram {
    /// bucket i counts pauses in [2^i, 2^(i+1)) microseconds.
    buckets: [u64; 32],
    count: u64,
    total: Duration,
    max: Duration,
}

impl PauseHistogram {
    pub fn new() -> PauseHistogram {
        PauseHistogram {
            buckets: [0; 32],
            count: 0,
            total: Duration::ZERO,
            max: Duration::ZERO,
        }
    }

    pub fn add(&mut self, pause: Duration) {
        let micros = pause.as_micros().max(1) as u64;
        let bucket = (63 - micros.leading_zeros() as usize).min(31);
        self.buckets[bucket] += 1;
        self.count += 1;
        self.total += pause;
        self.max = self.max.max(pause);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn total(&self) -> Duration {
        self.total
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    pub fn mean(&self) -> Duration {
        if self.count == 0 {
            Duration::ZERO
        } else {
            self.total / self.count as u32
        }
    }

    /// Populated buckets as (microsecond lower bound, count) pairs.
    pub fn nonzero_buckets(&self) -> Vec<(u64, u64)> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, &count)| count > 0)
            .map(|(index, &count)| (1u64 << index, count))
            .collect()
    }
}

impl Default for PauseHistogram {
    fn default() -> Self {
        PauseHistogram::new()
    }
}

/// Result of one collection.
#[derive(Debug, Clone)]
pub struct GcIteration {
    pub gc_type: GcType,
    pub cause: GcCause,
    pub concurrent: bool,
    pub duration: Duration,
    pub pauses: Vec<Duration>,
    pub freed_objects: u64,
    pub freed_bytes: u64,
    pub freed_large_objects: u64,
    pub freed_large_object_bytes: u64,
}

impl GcIteration {
    pub fn total_freed_bytes(&self) -> u64 {
        self.freed_bytes + self.freed_large_object_bytes
    }

    pub fn total_freed_objects(&self) -> u64 {
        self.freed_objects + self.freed_large_objects
    }
}

/// Cumulative per-collector record reported by
/// `Heap::dump_gc_performance_info`.
#[derive(Debug, Clone, Default)]
pub struct CollectorRecord {
    pub runs: u64,
    pub cumulative_time: Duration,
    pub cumulative_freed_bytes: u64,
    pub cumulative_freed_objects: u64,
    pub pause_histogram: PauseHistogram,
    pub last_gc_type: Option<GcType>,
    pub last_duration: Duration,
}

impl CollectorRecord {
    pub fn update(&mut self, iteration: &GcIteration) {
        self.runs += 1;
        self.cumulative_time += iteration.duration;
        self.cumulative_freed_bytes += iteration.total_freed_bytes();
        self.cumulative_freed_objects += iteration.total_freed_objects();
        for &pause in &iteration.pauses {
            self.pause_histogram.add(pause);
        }
        self.last_gc_type = Some(iteration.gc_type);
        self.last_duration = iteration.duration;
    }
}

impl Default for GcIteration {
    fn default() -> Self {
        GcIteration {
            gc_type: GcType::Full,
            cause: GcCause::Explicit,
            concurrent: false,
            duration: Duration::ZERO,
            pauses: Vec::new(),
            freed_objects: 0,
            freed_bytes: 0,
            freed_large_objects: 0,
            freed_large_object_bytes: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn histogram_tracks_extremes() {
        let mut histogram = PauseHistogram::new();
        histogram.add(Duration::from_micros(3));
        histogram.add(Duration::from_micros(900));
        histogram.add(Duration::from_millis(7));
        assert_eq!(histogram.count(), 3);
        assert_eq!(histogram.max(), Duration::from_millis(7));
        assert!(histogram.mean() > Duration::from_micros(3));
    }

    #[test]
    fn record_accumulates_iterations() {
        let mut record = CollectorRecord::default();
        let iteration = GcIteration {
            gc_type: GcType::Partial,
            duration: Duration::from_millis(2),
            pauses: vec![Duration::from_micros(100)],
            freed_objects: 10,
            freed_bytes: 4096,
            ..GcIteration::default()
        };
        record.update(&iteration);
        record.update(&iteration);
        assert_eq!(record.runs, 2);
        assert_eq!(record.cumulative_freed_objects, 20);
        assert_eq!(record.last_gc_type, Some(GcType::Partial));
        assert_eq!(record.pause_histogram.count(), 2);
    }
}
