//! Anonymous memory mappings for the veld heap.
//!
//! The collector reserves one large arena up front and carves fixed-size,
//! aligned GC pages out of it. This crate provides the mapping primitives:
//! the cached system page size, anonymous maps with lazy commit, and a
//! `discard` operation that hands the physical memory behind dead GC pages
//! back to the operating system without giving up the address range.

use std::io;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as os;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as os;

pub use os::page_size;

/// A handle to an anonymous memory mapped region.
///
/// The region is unmapped when the handle is dropped.
pub struct Mmap {
    inner: os::MmapInner,
}

impl Mmap {
    /// Pointer to the start of the mapping.
    pub fn ptr(&self) -> *mut u8 {
        self.inner.ptr()
    }

    /// Length of the mapping in bytes.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether the mapping is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }

    /// Release the physical memory behind `[offset, offset + len)` while
    /// keeping the address range mapped. The range is re-committed lazily
    /// (and reads back as zero on Linux) the next time it is touched.
    ///
    /// `offset` and `len` must be multiples of the system page size and lie
    /// within the mapping.
    pub fn discard(&self, offset: usize, len: usize) -> io::Result<()> {
        assert!(offset % page_size() == 0 && len % page_size() == 0);
        assert!(offset.checked_add(len).is_some_and(|end| end <= self.len()));
        // SAFETY: the range is inside our own mapping.
        unsafe { self.inner.discard(offset, len) }
    }
}

unsafe impl Send for Mmap {}
unsafe impl Sync for Mmap {}

/// Configuration for creating an anonymous memory mapping.
#[derive(Debug, Clone)]
pub struct MmapOptions {
    len: usize,
    hint_addr: usize,
    populate: bool,
    no_reserve: bool,
}

impl MmapOptions {
    /// Creates a new `MmapOptions`. A length must be set before mapping.
    pub fn new() -> Self {
        Self {
            len: 0,
            hint_addr: 0,
            populate: false,
            no_reserve: false,
        }
    }

    /// Sets the length of the mapping in bytes.
    pub fn len(mut self, len: usize) -> Self {
        self.len = len;
        self
    }

    /// Requests a placement of the mapping at a specific virtual address.
    /// The OS may ignore the hint; callers must check the returned pointer
    /// if the exact address matters.
    pub fn with_hint(mut self, addr: usize) -> Self {
        self.hint_addr = addr;
        self
    }

    /// Pre-faults the page tables (Linux `MAP_POPULATE`).
    pub fn populate(mut self, populate: bool) -> Self {
        self.populate = populate;
        self
    }

    /// Skips swap reservation (Linux `MAP_NORESERVE`). Used for the heap
    /// arena, which is mostly untouched address space.
    pub fn no_reserve(mut self, no_reserve: bool) -> Self {
        self.no_reserve = no_reserve;
        self
    }

    /// Creates an anonymous memory map.
    ///
    /// # Safety
    ///
    /// Raw OS mapping; the caller takes responsibility for every access
    /// through pointers derived from the returned region.
    pub unsafe fn map_anon(&self) -> io::Result<Mmap> {
        if self.len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "length must be greater than 0",
            ));
        }
        let inner = unsafe {
            os::MmapInner::map_anon(self.hint_addr, self.len, self.populate, self.no_reserve)?
        };
        Ok(Mmap { inner })
    }
}

impl Default for MmapOptions {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr;

    #[test]
    fn page_size_is_power_of_two() {
        let ps = page_size();
        assert!(ps > 0);
        assert_eq!(ps & (ps - 1), 0);
    }

    #[test]
    fn basic_map_is_usable() {
        let len = page_size();
        let mmap = unsafe { MmapOptions::new().len(len).map_anon().expect("map failed") };
        let ptr = mmap.ptr();
        assert!(!ptr.is_null());
        assert_eq!(ptr as usize % page_size(), 0);
        unsafe {
            ptr::write_volatile(ptr, 42);
            assert_eq!(ptr::read_volatile(ptr), 42);
        }
    }

    #[test]
    fn discard_keeps_range_mapped() {
        let len = 4 * page_size();
        let mmap = unsafe {
            MmapOptions::new()
                .len(len)
                .no_reserve(true)
                .map_anon()
                .expect("map failed")
        };
        unsafe {
            ptr::write_volatile(mmap.ptr().add(page_size()), 7);
        }
        mmap.discard(page_size(), page_size()).expect("discard failed");
        // The range must still be addressable after the discard.
        unsafe {
            ptr::write_volatile(mmap.ptr().add(page_size()), 9);
            assert_eq!(ptr::read_volatile(mmap.ptr().add(page_size())), 9);
        }
    }

    #[test]
    fn large_no_reserve_map() {
        // The collector reserves a multi-GiB arena; make sure an oversized
        // lazy mapping succeeds.
        let len = 1usize << 30;
        if let Ok(mmap) = unsafe { MmapOptions::new().len(len).no_reserve(true).map_anon() } {
            unsafe {
                ptr::write_volatile(mmap.ptr(), 1);
                ptr::write_volatile(mmap.ptr().add(len - 1), 1);
            }
        }
    }
}
