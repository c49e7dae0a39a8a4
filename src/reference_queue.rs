//! Reference queues: singly-linked lists threaded through the
//! `pending_next` field of reference objects.
//!
//! The list is circular with an explicit tail pointer, so "enqueued" is
//! exactly "`pending_next` is non-null"; dequeuing restores the null. One
//! queue exists per reachability class plus the global cleared list handed
//! to the runtime after each collection.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::object::{load_ref_slot, store_ref_slot, ObjectModel, ObjectRef};

pub struct ReferenceQueue {
    name: String,
    model: Arc<dyn ObjectModel>,
    /// Tail of the circular pending list; `tail.pending_next` is the head.
    list: Mutex<Option<ObjectRef>>,
}

impl ReferenceQueue {
    pub fn new(name: &str, model: Arc<dyn ObjectModel>) -> ReferenceQueue {
        ReferenceQueue {
            name: name.to_string(),
            model,
            list: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn pending_next(&self, reference: ObjectRef) -> Option<ObjectRef> {
        // SAFETY: the model returns an in-object slot for reference objects.
        unsafe { load_ref_slot(self.model.pending_next_slot(reference)) }
    }

    fn set_pending_next(&self, reference: ObjectRef, next: Option<ObjectRef>) {
        // SAFETY: same as pending_next.
        unsafe { store_ref_slot(self.model.pending_next_slot(reference), next) }
    }

    /// Enqueue a reference whose `pending_next` is currently null. Atomic
    /// with respect to other enqueuers when called outside a pause.
    pub fn enqueue(&self, reference: ObjectRef) {
        let mut list = self.list.lock();
        debug_assert!(
            self.pending_next(reference).is_none(),
            "{:?} already enqueued",
            reference
        );
        match *list {
            None => {
                // Single element: self-linked.
                self.set_pending_next(reference, Some(reference));
            }
            Some(tail) => {
                let head = self.pending_next(tail);
                self.set_pending_next(reference, head);
                self.set_pending_next(tail, Some(reference));
            }
        }
        *list = Some(reference);
    }

    /// Enqueue unless already on some queue. Returns whether it enqueued.
    pub fn enqueue_if_not_enqueued(&self, reference: ObjectRef) -> bool {
        let mut list = self.list.lock();
        if self.pending_next(reference).is_some() {
            return false;
        }
        match *list {
            None => self.set_pending_next(reference, Some(reference)),
            Some(tail) => {
                let head = self.pending_next(tail);
                self.set_pending_next(reference, head);
                self.set_pending_next(tail, Some(reference));
            }
        }
        *list = Some(reference);
        true
    }

    /// Pop the head of the queue, restoring its `pending_next` to null.
    pub fn dequeue(&self) -> Option<ObjectRef> {
        let mut list = self.list.lock();
        let tail = (*list)?;
        let head = self
            .pending_next(tail)
            .expect("enqueued tail must be linked");
        if head == tail {
            *list = None;
        } else {
            let next = self.pending_next(head);
            self.set_pending_next(tail, next);
        }
        self.set_pending_next(head, None);
        Some(head)
    }

    pub fn is_empty(&self) -> bool {
        self.list.lock().is_none()
    }

    /// Drain every reference into a vector, oldest first.
    pub fn drain(&self) -> Vec<ObjectRef> {
        let mut out = Vec::new();
        while let Some(reference) = self.dequeue() {
            out.push(reference);
        }
        out
    }

    fn referent(&self, reference: ObjectRef) -> Option<ObjectRef> {
        // SAFETY: the model returns an in-object slot for reference objects.
        unsafe { load_ref_slot(self.model.referent_slot(reference)) }
    }

    fn set_referent(&self, reference: ObjectRef, value: Option<ObjectRef>) {
        // SAFETY: same as referent.
        unsafe { store_ref_slot(self.model.referent_slot(reference), value) }
    }

    /// Clear every reference whose referent is unmarked and move it to
    /// `cleared`; update referent slots of the survivors (the referent may
    /// have been forwarded by a moving collector).
    pub fn clear_white_references(
        &self,
        cleared: &ReferenceQueue,
        is_marked: &mut dyn FnMut(ObjectRef) -> Option<ObjectRef>,
    ) {
        while let Some(reference) = self.dequeue() {
            let Some(referent) = self.referent(reference) else {
                continue;
            };
            match is_marked(referent) {
                Some(forwarded) => {
                    if forwarded != referent {
                        self.set_referent(reference, Some(forwarded));
                    }
                }
                None => {
                    self.set_referent(reference, None);
                    cleared.enqueue(reference);
                }
            }
        }
    }

    /// Invoke the runtime's preserve heuristic on each soft referent; the
    /// preserved ones are marked (and their closure traced by the caller's
    /// subsequent mark-stack drain). References stay queued for the clearing
    /// pass that follows.
    pub fn preserve_some_soft_references(
        &self,
        preserve: &dyn Fn(ObjectRef) -> bool,
        is_marked: &mut dyn FnMut(ObjectRef) -> Option<ObjectRef>,
        mark_and_push: &mut dyn FnMut(ObjectRef) -> ObjectRef,
    ) {
        let references = self.drain();
        for reference in references {
            if let Some(referent) = self.referent(reference) {
                if is_marked(referent).is_none() && preserve(referent) {
                    let forwarded = mark_and_push(referent);
                    if forwarded != referent {
                        self.set_referent(reference, Some(forwarded));
                    }
                }
            }
            self.enqueue(reference);
        }
    }

    /// Revive unmarked finalizer referents: mark them (the caller drains the
    /// transitive closure), stash the revived object in the reference's
    /// zombie field for the finalizer to consume, clear the referent, and
    /// hand the reference to `cleared`.
    pub fn enqueue_finalizer_references(
        &self,
        cleared: &ReferenceQueue,
        is_marked: &mut dyn FnMut(ObjectRef) -> Option<ObjectRef>,
        mark_and_push: &mut dyn FnMut(ObjectRef) -> ObjectRef,
    ) {
        while let Some(reference) = self.dequeue() {
            let Some(referent) = self.referent(reference) else {
                continue;
            };
            match is_marked(referent) {
                Some(forwarded) => {
                    if forwarded != referent {
                        self.set_referent(reference, Some(forwarded));
                    }
                }
                None => {
                    let revived = mark_and_push(referent);
                    // SAFETY: finalizer-kind references carry a zombie slot.
                    unsafe {
                        store_ref_slot(self.model.zombie_slot(reference), Some(revived));
                    }
                    self.set_referent(reference, None);
                    cleared.enqueue(reference);
                }
            }
        }
    }
}
