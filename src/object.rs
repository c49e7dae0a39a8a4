//! Object addressing and the runtime-supplied object model.
//!
//! The heap treats objects as opaque memory regions: an object is an
//! 8-byte-aligned address whose first word holds the class pointer. Everything
//! the collectors need to know about an object's interior (its size, its
//! reference fields, whether it is a soft/weak/finalizer/phantom reference)
//! is obtained through the [`ObjectModel`] callback installed by the runtime
//! when the heap is constructed.

use std::fmt;
use std::ops::{Add, AddAssign, Sub};
use std::sync::atomic::{AtomicUsize, Ordering};

/// All objects are aligned to this many bytes.
pub const OBJECT_ALIGNMENT: usize = 8;

/// A raw heap address.
///
/// # Examples
///
/// ```
/// use cinder::object::Address;
///
/// let a = Address::from_usize(0x1000);
/// assert_eq!((a + 8usize) - a, 8);
/// assert!(a.is_aligned(8));
/// assert_eq!(a.align_up(4096), Address::from_usize(0x1000));
/// ```
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address(usize);

impl Address {
    pub const ZERO: Address = Address(0);

    #[inline]
    pub const fn from_usize(addr: usize) -> Address {
        Address(addr)
    }

    #[inline]
    pub fn from_ptr<T>(ptr: *const T) -> Address {
        Address(ptr as usize)
    }

    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    #[inline]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn as_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    #[inline]
    pub fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    #[inline]
    pub const fn is_aligned(self, alignment: usize) -> bool {
        self.0 % alignment == 0
    }

    #[inline]
    pub const fn align_up(self, alignment: usize) -> Address {
        Address((self.0 + alignment - 1) & !(alignment - 1))
    }

    #[inline]
    pub const fn align_down(self, alignment: usize) -> Address {
        Address(self.0 & !(alignment - 1))
    }

    /// Load a word-sized slot at this address atomically.
    ///
    /// # Safety
    ///
    /// The address must be word-aligned and point into mapped memory that
    /// stays valid for the duration of the call.
    #[inline]
    pub unsafe fn load_word(self) -> usize {
        (*(self.0 as *const AtomicUsize)).load(Ordering::Relaxed)
    }

    /// Store a word-sized slot at this address atomically.
    ///
    /// # Safety
    ///
    /// Same contract as [`Address::load_word`].
    #[inline]
    pub unsafe fn store_word(self, value: usize) {
        (*(self.0 as *const AtomicUsize)).store(value, Ordering::Relaxed);
    }

    /// Compare-and-swap on the word at this address.
    ///
    /// # Safety
    ///
    /// Same contract as [`Address::load_word`].
    #[inline]
    pub unsafe fn cas_word(self, old: usize, new: usize) -> bool {
        (*(self.0 as *const AtomicUsize))
            .compare_exchange(old, new, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }
}

impl Add<usize> for Address {
    type Output = Address;

    #[inline]
    fn add(self, rhs: usize) -> Address {
        Address(self.0 + rhs)
    }
}

impl AddAssign<usize> for Address {
    #[inline]
    fn add_assign(&mut self, rhs: usize) {
        self.0 += rhs;
    }
}

impl Sub<usize> for Address {
    type Output = Address;

    #[inline]
    fn sub(self, rhs: usize) -> Address {
        Address(self.0 - rhs)
    }
}

impl Sub<Address> for Address {
    type Output = usize;

    #[inline]
    fn sub(self, rhs: Address) -> usize {
        self.0 - rhs.0
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// A non-null reference to a heap object.
///
/// The first word of every live object is its class pointer. While a copying
/// collector is evacuating, the first word of an already-copied object is
/// replaced with a forwarding pointer tagged in its low bit; consumers that
/// can observe objects mid-evacuation must check [`ObjectRef::forwarded`].
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectRef(Address);

const FORWARDING_TAG: usize = 0b1;

impl ObjectRef {
    #[inline]
    pub fn from_address(addr: Address) -> Option<ObjectRef> {
        if addr.is_zero() {
            None
        } else {
            debug_assert!(addr.is_aligned(OBJECT_ALIGNMENT));
            Some(ObjectRef(addr))
        }
    }

    /// # Safety
    ///
    /// `addr` must be a non-null, 8-byte-aligned object address.
    #[inline]
    pub unsafe fn from_address_unchecked(addr: Address) -> ObjectRef {
        ObjectRef(addr)
    }

    #[inline]
    pub fn to_address(self) -> Address {
        self.0
    }

    /// Read the class word (first word) of the object.
    ///
    /// # Safety
    ///
    /// The object must be mapped and at least one word in size.
    #[inline]
    pub unsafe fn class_word(self) -> usize {
        self.0.load_word()
    }

    /// # Safety
    ///
    /// Same contract as [`ObjectRef::class_word`].
    #[inline]
    pub unsafe fn set_class_word(self, class: usize) {
        self.0.store_word(class);
    }

    /// If this object has been evacuated, the to-space copy; `None` while the
    /// class word still holds a class pointer.
    ///
    /// # Safety
    ///
    /// Same contract as [`ObjectRef::class_word`].
    #[inline]
    pub unsafe fn forwarded(self) -> Option<ObjectRef> {
        let word = self.0.load_word();
        if word & FORWARDING_TAG != 0 {
            Some(ObjectRef(Address::from_usize(word & !FORWARDING_TAG)))
        } else {
            None
        }
    }

    /// Install a forwarding pointer over the class word.
    ///
    /// # Safety
    ///
    /// Only a stop-the-world copying collector may call this; mutators must
    /// not be able to observe the tagged word.
    #[inline]
    pub unsafe fn set_forwarding_address(self, to: ObjectRef) {
        self.0.store_word(to.to_address().as_usize() | FORWARDING_TAG);
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj@{}", self.0)
    }
}

/// Read a reference-typed field slot. A zero word is a null reference.
///
/// # Safety
///
/// `slot` must be a word-aligned address inside a mapped object.
#[inline]
pub unsafe fn load_ref_slot(slot: Address) -> Option<ObjectRef> {
    ObjectRef::from_address(Address::from_usize(slot.load_word()))
}

/// Overwrite a reference-typed field slot.
///
/// # Safety
///
/// Same contract as [`load_ref_slot`].
#[inline]
pub unsafe fn store_ref_slot(slot: Address, value: Option<ObjectRef>) {
    slot.store_word(value.map_or(0, |o| o.to_address().as_usize()));
}

/// Reachability class of a reference object, in decreasing strength order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReferenceKind {
    /// An ordinary object; the collectors trace straight through it.
    None,
    Soft,
    Weak,
    Finalizer,
    Phantom,
}

/// The class-descriptor callback surface supplied by the runtime.
///
/// Implementations must be GC-safe: no allocation through the heap, no lock
/// acquisition, no blocking. They are invoked under stop-the-world pauses and
/// from GC worker threads concurrently.
pub trait ObjectModel: Send + Sync + 'static {
    /// Total size of the object in bytes (unaligned; the spaces round up to
    /// [`OBJECT_ALIGNMENT`]).
    fn size_of(&self, obj: ObjectRef) -> usize;

    /// Invoke `visitor` with the address of every reference-typed field slot
    /// of `obj`, including the referent slot of reference objects.
    fn visit_reference_slots(&self, obj: ObjectRef, visitor: &mut dyn FnMut(Address));

    /// Reachability class of `obj`, derived from its class pointer.
    fn reference_kind(&self, obj: ObjectRef) -> ReferenceKind;

    /// Address of the `referent` field of a reference object.
    fn referent_slot(&self, reference: ObjectRef) -> Address;

    /// Address of the `pending_next` queue link of a reference object.
    fn pending_next_slot(&self, reference: ObjectRef) -> Address;

    /// Address of the zombie field of a finalizer reference, where the
    /// collector stashes the revived referent for the finalizer daemon.
    /// Only called for objects whose kind is [`ReferenceKind::Finalizer`].
    fn zombie_slot(&self, reference: ObjectRef) -> Address {
        self.referent_slot(reference)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_arithmetic() {
        let a = Address::from_usize(0x1008);
        assert_eq!(a.align_down(16), Address::from_usize(0x1000));
        assert_eq!(a.align_up(16), Address::from_usize(0x1010));
        assert_eq!((a + 24usize) - a, 24);
        assert!(!a.is_zero());
        assert!(Address::ZERO.is_zero());
    }

    #[test]
    fn object_ref_null_and_tagging() {
        assert!(ObjectRef::from_address(Address::ZERO).is_none());
        let obj = ObjectRef::from_address(Address::from_usize(0x2000)).unwrap();
        assert_eq!(obj.to_address().as_usize(), 0x2000);
    }

    #[test]
    fn forwarding_round_trip_through_a_real_word() {
        let mut word: usize = 0xdead_0000;
        let obj =
            ObjectRef::from_address(Address::from_ptr(&mut word as *mut usize)).unwrap();
        unsafe {
            assert!(obj.forwarded().is_none());
            let target = ObjectRef::from_address(Address::from_usize(0x4000)).unwrap();
            obj.set_forwarding_address(target);
            assert_eq!(obj.forwarded(), Some(target));
        }
    }
}
