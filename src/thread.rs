//! Mutator thread state and the registry the collectors coordinate through.
//!
//! Each mutator periodically passes a safepoint ([`MutatorThread::poll_safepoint`]),
//! where it either executes a pending checkpoint closure (scanning its own
//! stack while briefly self-suspended) or parks for a stop-the-world pause.
//! Threads that leave managed code flip to the `Native` state; the registry
//! does not wait for them during suspension and runs their checkpoints on
//! their behalf.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_utils::atomic::AtomicCell;
use crossbeam_utils::Backoff;
use parking_lot::lock_api::RawRwLock as _;
use parking_lot::{Condvar, Mutex, RwLock};

use crate::object::{Address, ObjectRef};

/// Thread-local allocation buffer carved from a bump-pointer space.
#[derive(Debug, Clone, Copy)]
pub struct Tlab {
    pub start: Address,
    pub pos: Address,
    pub end: Address,
    pub objects: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Executing managed code; must poll safepoints.
    Runnable,
    /// Outside managed code; ignored by suspend, checkpoints run remotely.
    Native,
}

pub type CheckpointFn = Arc<dyn Fn(&MutatorThread) + Send + Sync>;

struct MutatorInner {
    id: usize,
    /// OS thread this mutator runs on, for self-exclusion during suspends.
    owner: Mutex<Option<std::thread::ThreadId>>,
    state: AtomicCell<ThreadState>,
    suspend_requested: AtomicBool,
    parked: AtomicBool,
    lock: Mutex<()>,
    cv: Condvar,
    tlab: Mutex<Option<Tlab>>,
    /// Shadow stack of references this thread's frames hold.
    roots: Mutex<Vec<ObjectRef>>,
    checkpoint: Mutex<Option<(CheckpointFn, flume::Sender<()>)>>,
    checkpoint_pending: AtomicBool,
}

/// Handle to one mutator thread, shared between the thread itself and the
/// registry.
pub struct MutatorThread {
    inner: Arc<MutatorInner>,
}

impl MutatorThread {
    pub fn new(id: usize) -> MutatorThread {
        MutatorThread {
            inner: Arc::new(MutatorInner {
                id,
                owner: Mutex::new(None),
                state: AtomicCell::new(ThreadState::Runnable),
                suspend_requested: AtomicBool::new(false),
                parked: AtomicBool::new(false),
                lock: Mutex::new(()),
                cv: Condvar::new(),
                tlab: Mutex::new(None),
                roots: Mutex::new(Vec::new()),
                checkpoint: Mutex::new(None),
                checkpoint_pending: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> usize {
        self.inner.id
    }

    pub fn state(&self) -> ThreadState {
        self.inner.state.load()
    }

    /// Bind this mutator to the calling OS thread.
    pub fn claim_ownership(&self) {
        *self.inner.owner.lock() = Some(std::thread::current().id());
    }

    fn owned_by_current_thread(&self) -> bool {
        *self.inner.owner.lock() == Some(std::thread::current().id())
    }

    /// The safepoint. Runs a pending checkpoint, then parks if a
    /// stop-the-world suspension is in progress.
    pub fn poll_safepoint(&self) {
        if self.inner.checkpoint_pending.load(Ordering::Acquire) {
            self.run_pending_checkpoint();
        }
        if self.inner.suspend_requested.load(Ordering::Acquire) {
            let mut guard = self.inner.lock.lock();
            self.inner.parked.store(true, Ordering::Release);
            while self.inner.suspend_requested.load(Ordering::Acquire) {
                self.inner.cv.wait(&mut guard);
            }
            self.inner.parked.store(false, Ordering::Release);
        }
    }

    /// Leave managed code. Runs any pending checkpoint first so the
    /// requester does not wait on us.
    pub fn transition_to_native(&self) {
        if self.inner.checkpoint_pending.load(Ordering::Acquire) {
            self.run_pending_checkpoint();
        }
        self.inner.state.store(ThreadState::Native);
    }

    /// Re-enter managed code; blocks while a stop-the-world pause is active.
    pub fn transition_to_runnable(&self) {
        self.inner.state.store(ThreadState::Runnable);
        self.poll_safepoint();
    }

    fn run_pending_checkpoint(&self) {
        let taken = self.inner.checkpoint.lock().take();
        self.inner.checkpoint_pending.store(false, Ordering::Release);
        if let Some((closure, ack)) = taken {
            closure(self);
            let _ = ack.send(());
        }
    }

    fn request_suspend(&self) {
        self.inner.suspend_requested.store(true, Ordering::Release);
    }

    fn clear_suspend(&self) {
        let _guard = self.inner.lock.lock();
        self.inner.suspend_requested.store(false, Ordering::Release);
        self.inner.cv.notify_all();
    }

    fn wait_until_parked(&self) {
        let backoff = Backoff::new();
        while !self.inner.parked.load(Ordering::Acquire)
            && self.inner.state.load() == ThreadState::Runnable
        {
            backoff.snooze();
        }
    }

    fn install_checkpoint(&self, closure: CheckpointFn, ack: flume::Sender<()>) {
        *self.inner.checkpoint.lock() = Some((closure, ack));
        self.inner.checkpoint_pending.store(true, Ordering::Release);
    }

    // ---- TLAB ----

    /// Bump-allocate from the thread-local buffer.
    pub fn tlab_alloc(&self, bytes: usize) -> Option<ObjectRef> {
        let mut tlab = self.inner.tlab.lock();
        let t = tlab.as_mut()?;
        if t.pos + bytes > t.end {
            return None;
        }
        let addr = t.pos;
        t.pos += bytes;
        t.objects += 1;
        // SAFETY: the TLAB range was claimed from a bump-pointer space.
        Some(unsafe { ObjectRef::from_address_unchecked(addr) })
    }

    pub fn set_tlab(&self, start: Address, end: Address) {
        *self.inner.tlab.lock() = Some(Tlab {
            start,
            pos: start,
            end,
            objects: 0,
        });
    }

    /// Detach and return the TLAB, if any. The caller reports the used
    /// extent back to the owning space.
    pub fn take_tlab(&self) -> Option<Tlab> {
        self.inner.tlab.lock().take()
    }

    // ---- Roots ----

    /// Register a stack reference. Returns the shadow-stack depth before the
    /// push, for use with [`MutatorThread::pop_roots_to`].
    pub fn push_root(&self, obj: ObjectRef) -> usize {
        let mut roots = self.inner.roots.lock();
        roots.push(obj);
        roots.len() - 1
    }

    pub fn pop_roots_to(&self, depth: usize) {
        self.inner.roots.lock().truncate(depth);
    }

    pub fn roots_len(&self) -> usize {
        self.inner.roots.lock().len()
    }

    /// Read back a root slot (it may have been updated by a moving GC).
    pub fn root_at(&self, index: usize) -> Option<ObjectRef> {
        self.inner.roots.lock().get(index).copied()
    }

    /// Visit every root slot; the visitor may replace the reference, which
    /// is how moving collectors repoint stacks.
    pub fn visit_roots(&self, visitor: &mut dyn FnMut(&mut ObjectRef)) {
        let mut roots = self.inner.roots.lock();
        for root in roots.iter_mut() {
            visitor(root);
        }
    }
}

impl Clone for MutatorThread {
    fn clone(&self) -> MutatorThread {
        MutatorThread {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl fmt::Debug for MutatorThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutatorThread")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}

/// Registry of every attached mutator.
pub struct ThreadRegistry {
    mutators: Mutex<Vec<MutatorThread>>,
    next_id: AtomicUsize,
    /// Held shared by runnable mutators via [`ThreadRegistry::mutator_lock`],
    /// exclusively by the collector during stop-the-world sections.
    mutator_lock: RwLock<()>,
}

impl ThreadRegistry {
    pub fn new() -> ThreadRegistry {
        ThreadRegistry {
            mutators: Mutex::new(Vec::new()),
            next_id: AtomicUsize::new(1),
            mutator_lock: RwLock::new(()),
        }
    }

    /// Attach a new mutator, bound to the calling OS thread, and hand back
    /// its handle.
    pub fn attach(&self) -> MutatorThread {
        let thread = MutatorThread::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        thread.claim_ownership();
        self.mutators.lock().push(thread.clone());
        thread
    }

    pub fn detach(&self, thread: &MutatorThread) {
        self.mutators.lock().retain(|t| t.id() != thread.id());
    }

    pub fn threads(&self) -> Vec<MutatorThread> {
        self.mutators.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.mutators.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.mutators.lock().is_empty()
    }

    pub fn mutator_lock(&self) -> &RwLock<()> {
        &self.mutator_lock
    }

    /// Request every runnable mutator to park and wait until they have,
    /// then take the mutator lock exclusively for the stop-the-world
    /// section. The calling thread's own mutator (when the requester is a
    /// mutator running a synchronous collection) is exempt.
    pub fn suspend_all(&self) {
        let threads = self.threads();
        for thread in &threads {
            if !thread.owned_by_current_thread() {
                thread.request_suspend();
            }
        }
        for thread in &threads {
            if !thread.owned_by_current_thread() {
                thread.wait_until_parked();
            }
        }
        // All mutators are parked or native; no shared holders remain.
        unsafe { self.mutator_lock.raw() }.lock_exclusive();
    }

    pub fn resume_all(&self) {
        // SAFETY: paired with the lock_exclusive in suspend_all.
        unsafe { self.mutator_lock.raw().unlock_exclusive() };
        for thread in self.threads() {
            thread.clear_suspend();
        }
    }

    /// Run `closure` once per attached thread: runnable threads execute it
    /// themselves at their next safepoint, native threads have it run on
    /// their behalf. Returns the number of threads that ran it remotely
    /// (i.e. at their own safepoint).
    pub fn run_checkpoint(&self, closure: CheckpointFn) -> usize {
        let (ack_tx, ack_rx) = flume::unbounded();
        let mut expected = 0;
        for thread in self.threads() {
            if thread.state() == ThreadState::Runnable && !thread.owned_by_current_thread() {
                thread.install_checkpoint(Arc::clone(&closure), ack_tx.clone());
                expected += 1;
            } else {
                closure(&thread);
            }
        }
        drop(ack_tx);
        for _ in 0..expected {
            if ack_rx.recv_timeout(Duration::from_secs(10)).is_err() {
                tracing::warn!("checkpoint acknowledgement timed out");
                break;
            }
        }
        expected
    }
}

impl Default for ThreadRegistry {
    fn default() -> Self {
        ThreadRegistry::new()
    }
}
