//! Live/mark bitmaps for continuous spaces and the object sets that play the
//! same role for discontinuous ones.
//!
//! A [`SpaceBitmap`] carries one bit per 8-byte slot of its covered range.
//! The live bitmap records the objects believed live at the start of the
//! current collection; the mark bitmap accumulates reachable objects during
//! it. At the end of a full cycle the two swap roles.

use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashSet;

use crate::object::{Address, ObjectRef, OBJECT_ALIGNMENT};

const BITS_PER_WORD: usize = usize::BITS as usize;

/// One bit per [`OBJECT_ALIGNMENT`]-sized slot in `[heap_begin, heap_limit)`.
pub struct SpaceBitmap {
    name: String,
    words: Vec<AtomicUsize>,
    heap_begin: Address,
    heap_limit: Address,
}

impl SpaceBitmap {
    pub fn new(name: &str, heap_begin: Address, capacity: usize) -> SpaceBitmap {
        let num_bits = capacity / OBJECT_ALIGNMENT;
        let num_words = num_bits.div_ceil(BITS_PER_WORD);
        SpaceBitmap {
            name: name.to_string(),
            words: (0..num_words).map(|_| AtomicUsize::new(0)).collect(),
            heap_begin,
            heap_limit: heap_begin + capacity,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn heap_begin(&self) -> Address {
        self.heap_begin
    }

    pub fn heap_limit(&self) -> Address {
        self.heap_limit
    }

    /// Bytes of backing storage, for accounting dumps.
    pub fn size(&self) -> usize {
        self.words.len() * std::mem::size_of::<usize>()
    }

    #[inline]
    fn bit_index(&self, obj: ObjectRef) -> usize {
        let addr = obj.to_address();
        debug_assert!(
            addr >= self.heap_begin && addr < self.heap_limit,
            "{:?} outside bitmap {} [{}, {})",
            obj,
            self.name,
            self.heap_begin,
            self.heap_limit
        );
        (addr - self.heap_begin) / OBJECT_ALIGNMENT
    }

    #[inline]
    fn address_for(&self, bit: usize) -> ObjectRef {
        // SAFETY: bit indices derive from covered, aligned addresses.
        unsafe {
            ObjectRef::from_address_unchecked(self.heap_begin + bit * OBJECT_ALIGNMENT)
        }
    }

    pub fn covers(&self, obj: ObjectRef) -> bool {
        let addr = obj.to_address();
        addr >= self.heap_begin && addr < self.heap_limit
    }

    /// Set the bit for `obj`; returns whether it was already set.
    #[inline]
    pub fn set(&self, obj: ObjectRef) -> bool {
        let bit = self.bit_index(obj);
        let mask = 1usize << (bit % BITS_PER_WORD);
        let old = self.words[bit / BITS_PER_WORD].fetch_or(mask, Ordering::Relaxed);
        old & mask != 0
    }

    #[inline]
    pub fn clear(&self, obj: ObjectRef) {
        let bit = self.bit_index(obj);
        let mask = 1usize << (bit % BITS_PER_WORD);
        self.words[bit / BITS_PER_WORD].fetch_and(!mask, Ordering::Relaxed);
    }

    #[inline]
    pub fn test(&self, obj: ObjectRef) -> bool {
        let bit = self.bit_index(obj);
        let mask = 1usize << (bit % BITS_PER_WORD);
        self.words[bit / BITS_PER_WORD].load(Ordering::Relaxed) & mask != 0
    }

    /// Visit every set bit in ascending address order.
    pub fn walk(&self, visitor: &mut dyn FnMut(ObjectRef)) {
        for (word_index, word) in self.words.iter().enumerate() {
            let mut bits = word.load(Ordering::Relaxed);
            while bits != 0 {
                let shift = bits.trailing_zeros() as usize;
                visitor(self.address_for(word_index * BITS_PER_WORD + shift));
                bits &= bits - 1;
            }
        }
    }

    /// Visit set bits whose addresses fall in `[visit_begin, visit_end)`,
    /// ascending.
    pub fn visit_marked_range(
        &self,
        visit_begin: Address,
        visit_end: Address,
        visitor: &mut dyn FnMut(ObjectRef),
    ) {
        let begin = visit_begin.max(self.heap_begin);
        let end = visit_end.min(self.heap_limit);
        if begin >= end {
            return;
        }
        let first_bit = (begin - self.heap_begin) / OBJECT_ALIGNMENT;
        let last_bit = (end - self.heap_begin).div_ceil(OBJECT_ALIGNMENT);
        let mut bit = first_bit;
        while bit < last_bit {
            let word_index = bit / BITS_PER_WORD;
            let mut bits = self.words[word_index].load(Ordering::Relaxed);
            // Mask off bits below the window start within the first word.
            bits &= !0usize << (bit % BITS_PER_WORD);
            while bits != 0 {
                let shift = bits.trailing_zeros() as usize;
                let index = word_index * BITS_PER_WORD + shift;
                if index >= last_bit {
                    return;
                }
                visitor(self.address_for(index));
                bits &= bits - 1;
            }
            bit = (word_index + 1) * BITS_PER_WORD;
        }
    }

    pub fn clear_all(&self) {
        for word in &self.words {
            word.store(0, Ordering::Relaxed);
        }
    }

    pub fn clear_range(&self, begin: Address, end: Address) {
        let begin = begin.max(self.heap_begin);
        let end = end.min(self.heap_limit);
        if begin >= end {
            return;
        }
        let mut bit = (begin - self.heap_begin) / OBJECT_ALIGNMENT;
        let last = (end - self.heap_begin) / OBJECT_ALIGNMENT;
        while bit < last {
            let word_index = bit / BITS_PER_WORD;
            let word_first = word_index * BITS_PER_WORD;
            let lo = bit - word_first;
            let hi = (last - word_first).min(BITS_PER_WORD);
            let mut mask = !0usize << lo;
            if hi < BITS_PER_WORD {
                mask &= (1usize << hi) - 1;
            }
            self.words[word_index].fetch_and(!mask, Ordering::Relaxed);
            bit = word_first + hi;
        }
    }

    /// OR every bit of `other` into `self`. Both bitmaps must cover the same
    /// range. Used by the sticky collector instead of a bitmap swap.
    pub fn union_from(&self, other: &SpaceBitmap) {
        assert_eq!(self.heap_begin, other.heap_begin);
        assert_eq!(self.words.len(), other.words.len());
        for (dst, src) in self.words.iter().zip(other.words.iter()) {
            let bits = src.load(Ordering::Relaxed);
            if bits != 0 {
                dst.fetch_or(bits, Ordering::Relaxed);
            }
        }
    }

    /// Number of set bits.
    pub fn count(&self) -> usize {
        self.words
            .iter()
            .map(|w| w.load(Ordering::Relaxed).count_ones() as usize)
            .sum()
    }

    /// Raw word snapshot, for equality checks in tests and verification.
    pub fn snapshot(&self) -> Vec<usize> {
        self.words.iter().map(|w| w.load(Ordering::Relaxed)).collect()
    }

    /// Copy the overlapping prefix of `other` into `self`. Both bitmaps must
    /// share a begin address; `self` may cover a shorter range (used when a
    /// space is narrowed during the zygote split).
    pub fn copy_from(&self, other: &SpaceBitmap) {
        assert_eq!(self.heap_begin, other.heap_begin);
        for (dst, src) in self.words.iter().zip(other.words.iter()) {
            dst.store(src.load(Ordering::Relaxed), Ordering::Relaxed);
        }
    }
}

impl std::fmt::Debug for SpaceBitmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "SpaceBitmap[{} [{}, {}) {} set]",
            self.name,
            self.heap_begin,
            self.heap_limit,
            self.count()
        )
    }
}

/// Hash-set analogue of [`SpaceBitmap`] for discontinuous spaces.
#[derive(Debug)]
pub struct LargeObjectSet {
    name: String,
    objects: DashSet<usize>,
}

impl LargeObjectSet {
    pub fn new(name: &str) -> LargeObjectSet {
        LargeObjectSet {
            name: name.to_string(),
            objects: DashSet::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Insert `obj`; returns whether it was already present.
    pub fn set(&self, obj: ObjectRef) -> bool {
        !self.objects.insert(obj.to_address().as_usize())
    }

    pub fn clear(&self, obj: ObjectRef) {
        self.objects.remove(&obj.to_address().as_usize());
    }

    pub fn test(&self, obj: ObjectRef) -> bool {
        self.objects.contains(&obj.to_address().as_usize())
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn clear_all(&self) {
        self.objects.clear();
    }

    /// Visit members in ascending address order.
    pub fn walk(&self, visitor: &mut dyn FnMut(ObjectRef)) {
        let mut sorted: Vec<usize> = self.objects.iter().map(|e| *e).collect();
        sorted.sort_unstable();
        for addr in sorted {
            // SAFETY: only valid object addresses are inserted.
            visitor(unsafe { ObjectRef::from_address_unchecked(Address::from_usize(addr)) });
        }
    }

    /// Move all members of `other` into `self`, leaving `other` empty.
    pub fn take_from(&self, other: &LargeObjectSet) {
        for entry in other.objects.iter() {
            self.objects.insert(*entry);
        }
        other.objects.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(at: usize) -> ObjectRef {
        ObjectRef::from_address(Address::from_usize(at)).unwrap()
    }

    #[test]
    fn set_test_clear() {
        let bitmap = SpaceBitmap::new("test", Address::from_usize(0x10000), 0x1000);
        let o = obj(0x10040);
        assert!(!bitmap.test(o));
        assert!(!bitmap.set(o));
        assert!(bitmap.set(o));
        assert!(bitmap.test(o));
        bitmap.clear(o);
        assert!(!bitmap.test(o));
    }

    #[test]
    fn walk_is_ascending() {
        let bitmap = SpaceBitmap::new("test", Address::from_usize(0x10000), 0x10000);
        for at in [0x10008, 0x1fff8, 0x14000, 0x10000] {
            bitmap.set(obj(at));
        }
        let mut seen = Vec::new();
        bitmap.walk(&mut |o| seen.push(o.to_address().as_usize()));
        assert_eq!(seen, vec![0x10000, 0x10008, 0x14000, 0x1fff8]);
    }

    #[test]
    fn visit_marked_range_clips_window() {
        let bitmap = SpaceBitmap::new("test", Address::from_usize(0), 0x10000);
        for at in [0x100, 0x200, 0x300, 0x400] {
            bitmap.set(obj(at));
        }
        let mut seen = Vec::new();
        bitmap.visit_marked_range(
            Address::from_usize(0x180),
            Address::from_usize(0x400),
            &mut |o| seen.push(o.to_address().as_usize()),
        );
        assert_eq!(seen, vec![0x200, 0x300]);
    }

    #[test]
    fn clear_range_leaves_neighbors() {
        let bitmap = SpaceBitmap::new("test", Address::from_usize(0), 0x10000);
        for at in (0x0..0x1000).step_by(8) {
            bitmap.set(obj(at.max(8)));
        }
        bitmap.clear_range(Address::from_usize(0x100), Address::from_usize(0x200));
        assert!(bitmap.test(obj(0xf8)));
        assert!(!bitmap.test(obj(0x100)));
        assert!(!bitmap.test(obj(0x1f8)));
        assert!(bitmap.test(obj(0x200)));
    }

    #[test]
    fn union_matches_bitwise_or() {
        let a = SpaceBitmap::new("a", Address::from_usize(0), 0x1000);
        let b = SpaceBitmap::new("b", Address::from_usize(0), 0x1000);
        a.set(obj(0x10));
        b.set(obj(0x20));
        b.set(obj(0x10));
        a.union_from(&b);
        assert!(a.test(obj(0x10)));
        assert!(a.test(obj(0x20)));
        assert_eq!(a.count(), 2);
    }

    #[test]
    fn large_object_set_mirrors_bitmap_interface() {
        let set = LargeObjectSet::new("los");
        let o = obj(0x8000);
        assert!(!set.set(o));
        assert!(set.set(o));
        assert!(set.test(o));
        set.clear(o);
        assert!(!set.test(o));
        assert!(set.is_empty());
    }
}
