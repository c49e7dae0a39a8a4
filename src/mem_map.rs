//! Anonymous memory mappings.
//!
//! Every address range the heap owns — space backings, bitmaps, the card
//! table, large objects — comes from this pool. Nothing else in the crate
//! calls into `libc` directly.

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::ptr;

use crate::error::{HeapError, HeapResult};
use crate::object::Address;

/// Page-protection request for [`MemMap::protect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    None,
    ReadOnly,
    ReadWrite,
}

impl Protection {
    fn to_prot(self) -> libc::c_int {
        match self {
            Protection::None => libc::PROT_NONE,
            Protection::ReadOnly => libc::PROT_READ,
            Protection::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
        }
    }
}

pub fn page_size() -> usize {
    // SAFETY: sysconf is always callable.
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

pub fn page_aligned(size: usize) -> usize {
    let page = page_size();
    (size + page - 1) & !(page - 1)
}

/// An owned anonymous mapping, unmapped on drop.
#[derive(Debug)]
pub struct MemMap {
    name: String,
    begin: Address,
    size: usize,
}

// The mapping is plain memory; all interior mutation goes through atomics or
// happens under the locks of the owning structure.
unsafe impl Send for MemMap {}
unsafe impl Sync for MemMap {}

impl MemMap {
    /// Map `byte_count` bytes of zeroed anonymous memory, optionally at a
    /// requested base address (a hint, not a demand).
    pub fn map_anonymous(
        name: &str,
        requested_begin: Option<Address>,
        byte_count: usize,
        prot: Protection,
    ) -> HeapResult<MemMap> {
        let size = page_aligned(byte_count.max(1));
        let hint = requested_begin.map_or(ptr::null_mut(), |a| a.as_mut_ptr::<libc::c_void>());
        // SAFETY: anonymous private mapping with no fixed flag; the kernel
        // either honors the hint or picks an address.
        let mapped = unsafe {
            libc::mmap(
                hint,
                size,
                prot.to_prot(),
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if mapped == libc::MAP_FAILED {
            return Err(HeapError::MapFailed {
                name: name.to_string(),
                reason: std::io::Error::last_os_error().to_string(),
            });
        }
        Ok(MemMap {
            name: name.to_string(),
            begin: Address::from_usize(mapped as usize),
            size,
        })
    }

    /// Map a file's contents into a private read-only mapping. Used by the
    /// image space loader.
    pub fn map_file(name: &str, path: &Path) -> HeapResult<MemMap> {
        let mut file = File::open(path).map_err(|e| HeapError::MapFailed {
            name: name.to_string(),
            reason: e.to_string(),
        })?;
        let mut contents = Vec::new();
        file.read_to_end(&mut contents)
            .map_err(|e| HeapError::MapFailed {
                name: name.to_string(),
                reason: e.to_string(),
            })?;
        let map = MemMap::map_anonymous(name, None, contents.len().max(1), Protection::ReadWrite)?;
        // SAFETY: the mapping was just created with at least contents.len()
        // writable bytes.
        unsafe {
            ptr::copy_nonoverlapping(
                contents.as_ptr(),
                map.begin.as_mut_ptr::<u8>(),
                contents.len(),
            );
        }
        map.protect(Protection::ReadOnly);
        Ok(map)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn begin(&self) -> Address {
        self.begin
    }

    pub fn end(&self) -> Address {
        self.begin + self.size
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.begin && addr < self.end()
    }

    /// Change protection on the whole mapping.
    pub fn protect(&self, prot: Protection) {
        // SAFETY: [begin, begin+size) is exactly the range this object mapped.
        let rc = unsafe {
            libc::mprotect(
                self.begin.as_mut_ptr::<libc::c_void>(),
                self.size,
                prot.to_prot(),
            )
        };
        debug_assert_eq!(rc, 0, "mprotect({}) failed", self.name);
    }

    /// Return the pages in `[begin, end)` to the OS; the range reads as zero
    /// afterwards. Returns the number of bytes released.
    pub fn madvise_dont_need(&self, begin: Address, end: Address) -> usize {
        let begin = begin.align_up(page_size());
        let end = end.align_down(page_size());
        if begin >= end {
            return 0;
        }
        debug_assert!(begin >= self.begin && end <= self.end());
        // SAFETY: the page-aligned subrange lies inside this mapping.
        unsafe {
            libc::madvise(
                begin.as_mut_ptr::<libc::c_void>(),
                end - begin,
                libc::MADV_DONTNEED,
            );
        }
        end - begin
    }

    /// Split this mapping at `offset` (page-aligned). `self` keeps the head;
    /// the returned map owns the tail. Used when the main space is frozen
    /// into a zygote space and the remainder becomes the new main space.
    pub fn split_at(&mut self, offset: usize, tail_name: &str) -> MemMap {
        let offset = page_aligned(offset);
        assert!(offset <= self.size, "split offset beyond {}", self.name);
        let tail = MemMap {
            name: tail_name.to_string(),
            begin: self.begin + offset,
            size: self.size - offset,
        };
        self.size = offset;
        tail
    }
}

impl Drop for MemMap {
    fn drop(&mut self) {
        if self.size > 0 {
            // SAFETY: this object owns [begin, begin+size).
            unsafe {
                libc::munmap(self.begin.as_mut_ptr::<libc::c_void>(), self.size);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_and_write() {
        let map = MemMap::map_anonymous("test", None, 8192, Protection::ReadWrite).unwrap();
        assert!(map.size() >= 8192);
        unsafe {
            map.begin().store_word(0x1234);
            assert_eq!(map.begin().load_word(), 0x1234);
        }
        assert!(map.contains(map.begin()));
        assert!(!map.contains(map.end()));
    }

    #[test]
    fn madvise_zeroes_pages() {
        let map = MemMap::map_anonymous("test", None, 16384, Protection::ReadWrite).unwrap();
        unsafe { map.begin().store_word(42) };
        let released = map.madvise_dont_need(map.begin(), map.end());
        assert_eq!(released, map.size());
        assert_eq!(unsafe { map.begin().load_word() }, 0);
    }

    #[test]
    fn split_keeps_disjoint_halves() {
        let mut map = MemMap::map_anonymous("head", None, 4 * 4096, Protection::ReadWrite).unwrap();
        let total = map.size();
        let tail = map.split_at(2 * 4096, "tail");
        assert_eq!(map.size() + tail.size(), total);
        assert_eq!(map.end(), tail.begin());
        // Both halves stay writable after the split.
        unsafe {
            map.begin().store_word(1);
            tail.begin().store_word(2);
        }
    }
}
