//! The reference-processing pipeline run once per collection, after main
//! marking and before cleanup.
//!
//! Strength order: soft, weak, finalizer, phantom. Soft referents may be
//! preserved by a runtime-supplied heuristic when the cycle is not
//! soft-clearing; finalizer referents are revived exactly once so their
//! finalizers can run; phantom references are cleared last so they observe
//! every revival.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::object::{ObjectModel, ObjectRef, ReferenceKind};
use crate::reference_queue::ReferenceQueue;

/// Collector-supplied callbacks threaded through reference processing.
pub struct ReferenceClosures<'a> {
    /// `Some(address)` when the object is marked, carrying its post-move
    /// address; `None` when it is garbage this cycle.
    pub is_marked: &'a mut dyn FnMut(ObjectRef) -> Option<ObjectRef>,
    /// Mark an object, push it for tracing, and return its (possibly moved)
    /// address.
    pub mark_and_push: &'a mut dyn FnMut(ObjectRef) -> ObjectRef,
    /// Drain the mark stack, completing the transitive closure of everything
    /// pushed since the last drain.
    pub drain_mark_stack: &'a mut dyn FnMut(),
}

pub struct ReferenceProcessor {
    soft: ReferenceQueue,
    weak: ReferenceQueue,
    finalizer: ReferenceQueue,
    phantom: ReferenceQueue,
    cleared: ReferenceQueue,
    lock: Mutex<()>,
}

impl ReferenceProcessor {
    pub fn new(model: Arc<dyn ObjectModel>) -> ReferenceProcessor {
        ReferenceProcessor {
            soft: ReferenceQueue::new("soft references", Arc::clone(&model)),
            weak: ReferenceQueue::new("weak references", Arc::clone(&model)),
            finalizer: ReferenceQueue::new("finalizer references", Arc::clone(&model)),
            phantom: ReferenceQueue::new("phantom references", Arc::clone(&model)),
            cleared: ReferenceQueue::new("cleared references", model),
            lock: Mutex::new(()),
        }
    }

    /// Called from object scanning when a reference object's referent is not
    /// yet marked: queue the reference for processing instead of tracing
    /// through the referent.
    pub fn delay_reference(&self, kind: ReferenceKind, reference: ObjectRef) {
        match kind {
            ReferenceKind::Soft => self.soft.enqueue_if_not_enqueued(reference),
            ReferenceKind::Weak => self.weak.enqueue_if_not_enqueued(reference),
            ReferenceKind::Finalizer => self.finalizer.enqueue_if_not_enqueued(reference),
            ReferenceKind::Phantom => self.phantom.enqueue_if_not_enqueued(reference),
            ReferenceKind::None => unreachable!("strong references are never delayed"),
        };
    }

    /// Run the full pipeline. `preserve_soft` is the runtime heuristic
    /// consulted when `clear_soft` is false; absent, unpreserved soft
    /// references survive only if their referent is otherwise reachable.
    pub fn process_references(
        &self,
        clear_soft: bool,
        preserve_soft: Option<&dyn Fn(ObjectRef) -> bool>,
        closures: &mut ReferenceClosures<'_>,
    ) {
        let _guard = self.lock.lock();

        if !clear_soft {
            // A non-clearing cycle keeps soft referents alive; the runtime's
            // heuristic, when supplied, decides which ones to let go.
            let preserve_all = |_: ObjectRef| true;
            let preserve: &dyn Fn(ObjectRef) -> bool = match preserve_soft {
                Some(heuristic) => heuristic,
                None => &preserve_all,
            };
            self.soft.preserve_some_soft_references(
                preserve,
                closures.is_marked,
                closures.mark_and_push,
            );
            (closures.drain_mark_stack)();
        }

        self.soft
            .clear_white_references(&self.cleared, closures.is_marked);
        self.weak
            .clear_white_references(&self.cleared, closures.is_marked);

        // Revive finalizable referents and trace everything they keep alive.
        self.finalizer.enqueue_finalizer_references(
            &self.cleared,
            closures.is_marked,
            closures.mark_and_push,
        );
        (closures.drain_mark_stack)();

        // Finalizer marking can expose further soft/weak references.
        self.soft
            .clear_white_references(&self.cleared, closures.is_marked);
        self.weak
            .clear_white_references(&self.cleared, closures.is_marked);

        self.phantom
            .clear_white_references(&self.cleared, closures.is_marked);

        debug_assert!(self.soft.is_empty());
        debug_assert!(self.weak.is_empty());
        debug_assert!(self.finalizer.is_empty());
        debug_assert!(self.phantom.is_empty());
    }

    /// Hand the accumulated cleared references to the runtime, emptying the
    /// list.
    pub fn collect_cleared_references(&self) -> Vec<ObjectRef> {
        self.cleared.drain()
    }

    pub fn cleared(&self) -> &ReferenceQueue {
        &self.cleared
    }
}
