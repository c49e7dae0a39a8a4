//! Fixed-capacity LIFO buffers of object pointers.
//!
//! The heap owns two of these: the allocation stack, which mutators push
//! every newly allocated object onto, and the live stack, its swap target
//! during collection. Collectors additionally use transient mark stacks.
//! Pushes are lock-free; everything else runs while the pushing threads are
//! suspended or quiescent.

use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

use crate::object::{Address, ObjectRef};

pub struct ObjectStack {
    name: String,
    entries: Vec<AtomicUsize>,
    back: CachePadded<AtomicUsize>,
}

impl ObjectStack {
    pub fn new(name: &str, capacity: usize) -> ObjectStack {
        ObjectStack {
            name: name.to_string(),
            entries: (0..capacity).map(|_| AtomicUsize::new(0)).collect(),
            back: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.back.load(Ordering::Relaxed).min(self.capacity())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() == self.capacity()
    }

    /// Push `obj`; returns false when the stack is at capacity (the caller
    /// then forces a collection to drain it).
    pub fn push_back(&self, obj: ObjectRef) -> bool {
        let mut index = self.back.load(Ordering::Relaxed);
        loop {
            if index >= self.capacity() {
                return false;
            }
            match self.back.compare_exchange_weak(
                index,
                index + 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    self.entries[index].store(obj.to_address().as_usize(), Ordering::Release);
                    return true;
                }
                Err(actual) => index = actual,
            }
        }
    }

    pub fn pop_back(&self) -> Option<ObjectRef> {
        let mut index = self.back.load(Ordering::Relaxed);
        loop {
            if index == 0 {
                return None;
            }
            match self.back.compare_exchange_weak(
                index,
                index - 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    let word = self.entries[index - 1].load(Ordering::Acquire);
                    return ObjectRef::from_address(Address::from_usize(word));
                }
                Err(actual) => index = actual,
            }
        }
    }

    pub fn reset(&self) {
        self.back.store(0, Ordering::Relaxed);
    }

    /// Sort entries in ascending address order. Only while pushers are
    /// quiescent.
    pub fn sort(&self) {
        let len = self.len();
        let mut values: Vec<usize> = (0..len)
            .map(|i| self.entries[i].load(Ordering::Relaxed))
            .collect();
        values.sort_unstable();
        for (i, value) in values.into_iter().enumerate() {
            self.entries[i].store(value, Ordering::Relaxed);
        }
    }

    /// Linear membership scan.
    pub fn contains(&self, obj: ObjectRef) -> bool {
        let target = obj.to_address().as_usize();
        (0..self.len()).any(|i| self.entries[i].load(Ordering::Relaxed) == target)
    }

    /// Binary-search membership; requires a prior [`ObjectStack::sort`].
    pub fn contains_sorted(&self, obj: ObjectRef) -> bool {
        let target = obj.to_address().as_usize();
        let mut lo = 0;
        let mut hi = self.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            let value = self.entries[mid].load(Ordering::Relaxed);
            if value < target {
                lo = mid + 1;
            } else if value > target {
                hi = mid;
            } else {
                return true;
            }
        }
        false
    }

    /// Visit entries oldest-first. Skips slots whose write has not landed
    /// yet (a racing push that lost its store ordering to our snapshot).
    pub fn visit(&self, visitor: &mut dyn FnMut(ObjectRef)) {
        for i in 0..self.len() {
            let word = self.entries[i].load(Ordering::Acquire);
            if let Some(obj) = ObjectRef::from_address(Address::from_usize(word)) {
                visitor(obj);
            }
        }
    }

    /// Drain the whole stack into a vector, newest first, and reset.
    pub fn drain(&self) -> Vec<ObjectRef> {
        let mut out = Vec::with_capacity(self.len());
        while let Some(obj) = self.pop_back() {
            out.push(obj);
        }
        out
    }
}

impl std::fmt::Debug for ObjectStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ObjectStack[{} {}/{}]",
            self.name,
            self.len(),
            self.capacity()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(at: usize) -> ObjectRef {
        ObjectRef::from_address(Address::from_usize(at)).unwrap()
    }

    #[test]
    fn lifo_order() {
        let stack = ObjectStack::new("test", 8);
        assert!(stack.push_back(obj(0x10)));
        assert!(stack.push_back(obj(0x20)));
        assert_eq!(stack.pop_back(), Some(obj(0x20)));
        assert_eq!(stack.pop_back(), Some(obj(0x10)));
        assert_eq!(stack.pop_back(), None);
    }

    #[test]
    fn rejects_past_capacity() {
        let stack = ObjectStack::new("test", 2);
        assert!(stack.push_back(obj(0x10)));
        assert!(stack.push_back(obj(0x20)));
        assert!(!stack.push_back(obj(0x30)));
        assert!(stack.is_full());
        stack.reset();
        assert!(stack.is_empty());
    }

    #[test]
    fn sorted_membership() {
        let stack = ObjectStack::new("test", 16);
        for at in [0x40, 0x10, 0x30, 0x20] {
            stack.push_back(obj(at));
        }
        stack.sort();
        assert!(stack.contains_sorted(obj(0x30)));
        assert!(!stack.contains_sorted(obj(0x38)));
        assert!(stack.contains(obj(0x10)));
    }

    #[test]
    fn concurrent_pushes_land_exactly_once() {
        use std::sync::Arc;
        let stack = Arc::new(ObjectStack::new("test", 4096));
        let threads: Vec<_> = (0..4)
            .map(|t| {
                let stack = Arc::clone(&stack);
                std::thread::spawn(move || {
                    for i in 0..1000 {
                        assert!(stack.push_back(obj(0x1_0000 + t * 0x1_0000 + i * 8)));
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(stack.len(), 4000);
        let mut seen = std::collections::HashSet::new();
        stack.visit(&mut |o| {
            assert!(seen.insert(o.to_address().as_usize()));
        });
        assert_eq!(seen.len(), 4000);
    }
}
