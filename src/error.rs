//! Error types for the heap subsystem.
//!
//! Allocation failure is the only recoverable error class: it propagates up
//! the call chain as [`HeapError::OutOfMemory`] so the runtime can raise a
//! language-level exception on the failing mutator. Heap corruption and
//! startup mapping failures are fatal; the heap dumps its state through
//! `tracing` and panics.

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum HeapError {
    /// Allocation failed after the full collector plan, including the
    /// soft-reference-clearing pass.
    #[error(
        "out of memory on a {size}-byte allocation: {allocated} bytes allocated, \
         footprint {footprint}; failed due to fragmentation (largest possible \
         contiguous allocation {largest_contiguous} bytes)"
    )]
    OutOfMemory {
        size: usize,
        allocated: usize,
        footprint: usize,
        largest_contiguous: usize,
    },

    /// `register_native_free` would drive the native counter negative. The
    /// counter is left at its prior value.
    #[error("attempted to free {bytes} native bytes with only {registered} registered")]
    NativeOverFree { bytes: usize, registered: usize },

    /// A moving collector transition was requested while pinned regions hold
    /// raw pointers into a bump-pointer space. The transition is skipped.
    #[error("moving collector transition disabled ({disable_count} pinned sections)")]
    MovingGcDisabled { disable_count: usize },

    /// An address-space reservation failed. Fatal at startup.
    #[error("failed to map {name}: {reason}")]
    MapFailed { name: String, reason: String },

    /// The image file failed validation.
    #[error("image {path}: {reason}")]
    ImageInvalid { path: String, reason: String },
}

pub type HeapResult<T> = Result<T, HeapError>;
