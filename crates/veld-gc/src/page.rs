//! Page map and metadata.
//!
//! The heap arena is one large lazily-committed mapping reserved at
//! startup. Pool pages are fixed 16 KiB regions carved out of it, always
//! aligned to their own size so the owning page of any interior pointer is
//! one mask away. A two-level radix table maps page addresses to metadata;
//! each level keeps a 32-bit allocation bitmap per 32 entries so the sweep
//! can skip empty subtrees with `trailing_zeros`.

use std::sync::atomic::{AtomicPtr, AtomicU32, AtomicUsize, Ordering};

use parking_lot::Mutex;
use sys_alloc::{Mmap, MmapOptions};

use crate::error::AllocError;

/// Size of a pool page.
pub const PAGE_SZ: usize = 16 * 1024;
/// log2 of [`PAGE_SZ`].
pub const PAGE_LG2: u32 = 14;
/// Offset of the first cell in a page. The first word of a page stores the
/// next-page link of the bump-allocation list; the rest of the gap keeps
/// cells cache-line aligned.
pub const PAGE_OFFSET: usize = 64;

/// Sentinel for "no freelist" in `fl_begin_offset`/`fl_end_offset`.
pub const FL_NONE: u16 = u16::MAX;

/// Smallest cell size; bounds the per-page age bitmap.
const MIN_OSIZE: usize = 16;
const MAX_CELLS: usize = (PAGE_SZ - PAGE_OFFSET) / MIN_OSIZE;
/// Bytes in the per-page age bitmap (one bit per cell slot).
pub const AGES_BYTES: usize = MAX_CELLS.div_ceil(8);

/// Pages covered by one leaf node of the radix table.
const LEVEL0_PAGES: usize = 1024;

#[cfg(target_pointer_width = "64")]
const ARENA_BYTES: usize = 32 << 30;
#[cfg(target_pointer_width = "32")]
const ARENA_BYTES: usize = 512 << 20;

/// Base address of the page containing `addr`.
#[inline]
pub fn page_of(addr: usize) -> usize {
    addr & !(PAGE_SZ - 1)
}

/// Metadata of one pool page.
///
/// All fields are owned by the collector; mutators only reach them through
/// the allocation slow paths of their own pools, and the collector only
/// while the world is stopped.
pub struct PageMeta {
    /// Start of the page's data (16 KiB, page-aligned).
    pub data: *mut u8,
    /// Index of the owning size class.
    pub pool_n: u8,
    /// Registry index of the owning thread.
    pub thread_n: u16,
    /// Cell size in bytes, header included.
    pub osize: u16,
    /// Some cell on this page was reached during the last mark.
    pub has_marked: bool,
    /// Some cell on this page is young (allocated or demoted since the
    /// last sweep).
    pub has_young: bool,
    /// Free cells according to the last sweep.
    pub nfree: u16,
    /// Old cells counted during this cycle's marking.
    pub nold: u16,
    /// Old-cell count recorded by the previous full sweep; the quick-sweep
    /// skip heuristic compares it against `nold`.
    pub prev_nold: u16,
    /// Byte offset (from `data`) of the first freelist cell, or `FL_NONE`.
    pub fl_begin_offset: u16,
    /// Byte offset one past the last freelist link, or `FL_NONE`.
    pub fl_end_offset: u16,
    /// One age bit per cell slot: set once the cell has survived a sweep,
    /// making it eligible for promotion at the next one.
    pub ages: [u8; AGES_BYTES],
}

impl PageMeta {
    /// Cell index of an interior pointer, by address order.
    #[inline]
    pub fn cell_index(&self, addr: usize) -> usize {
        (addr - self.data as usize - PAGE_OFFSET) / self.osize as usize
    }

    /// Age bit for the cell at `idx`.
    #[inline]
    pub fn age_bit(&self, idx: usize) -> bool {
        self.ages[idx / 8] & (1 << (idx % 8)) != 0
    }

    /// Clears the age bit for the cell at `idx`.
    #[inline]
    pub fn clear_age_bit(&mut self, idx: usize) {
        self.ages[idx / 8] &= !(1 << (idx % 8));
    }
}

/// Leaf node of the radix table: metadata and an allocation bitmap for
/// [`LEVEL0_PAGES`] consecutive pages.
pub struct Level0 {
    allocmap: [AtomicU32; LEVEL0_PAGES / 32],
    meta: [PageMeta; LEVEL0_PAGES],
}

impl Level0 {
    fn new_boxed() -> Result<Box<Level0>, AllocError> {
        // All-zero PageMeta is a valid "unallocated" state; build the node
        // directly in zeroed memory, it is far too large for the stack.
        let layout = std::alloc::Layout::new::<Level0>();
        // SAFETY: layout has non-zero size; the zero bit pattern is valid
        // for every field of Level0.
        let raw = unsafe { std::alloc::alloc_zeroed(layout) };
        if raw.is_null() {
            return Err(AllocError::OutOfMemory);
        }
        // SAFETY: raw is a fresh allocation of the right layout.
        Ok(unsafe { Box::from_raw(raw.cast::<Level0>()) })
    }

    #[inline]
    fn is_allocated(&self, idx0: usize) -> bool {
        self.allocmap[idx0 / 32].load(Ordering::Relaxed) & (1 << (idx0 % 32)) != 0
    }

    #[inline]
    fn set_allocated(&self, idx0: usize) {
        self.allocmap[idx0 / 32].fetch_or(1 << (idx0 % 32), Ordering::Relaxed);
    }

    #[inline]
    fn clear_allocated(&self, idx0: usize) {
        self.allocmap[idx0 / 32].fetch_and(!(1 << (idx0 % 32)), Ordering::Relaxed);
    }
}

/// Two-level radix map from page address to [`PageMeta`].
pub struct PageTable {
    start: usize,
    end: usize,
    level1: Box<[AtomicPtr<Level0>]>,
    /// One bit per level-0 node that may contain allocated pages.
    level1_map: Box<[AtomicU32]>,
}

impl PageTable {
    fn new(start: usize, npages: usize) -> Self {
        let nodes = npages.div_ceil(LEVEL0_PAGES);
        let level1 = (0..nodes)
            .map(|_| AtomicPtr::new(std::ptr::null_mut()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let level1_map = (0..nodes.div_ceil(32))
            .map(|_| AtomicU32::new(0))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        PageTable {
            start,
            end: start + npages * PAGE_SZ,
            level1,
            level1_map,
        }
    }

    #[inline]
    fn node(&self, idx1: usize) -> *mut Level0 {
        self.level1[idx1].load(Ordering::Acquire)
    }

    /// Metadata of the allocated pool page containing `addr`, or `None` if
    /// `addr` is not inside any allocated page.
    #[inline]
    pub fn meta_of(&self, addr: usize) -> Option<*mut PageMeta> {
        if addr < self.start || addr >= self.end {
            return None;
        }
        let pg = (addr - self.start) >> PAGE_LG2;
        let node = self.node(pg / LEVEL0_PAGES);
        if node.is_null() {
            return None;
        }
        let idx0 = pg % LEVEL0_PAGES;
        // SAFETY: node pointers are never freed once published.
        let node = unsafe { &*node };
        if !node.is_allocated(idx0) {
            return None;
        }
        Some(&node.meta[idx0] as *const PageMeta as *mut PageMeta)
    }

    fn ensure_node(&self, idx1: usize) -> Result<*mut Level0, AllocError> {
        let cur = self.node(idx1);
        if !cur.is_null() {
            return Ok(cur);
        }
        let fresh = Box::into_raw(Level0::new_boxed()?);
        match self.level1[idx1].compare_exchange(
            std::ptr::null_mut(),
            fresh,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(fresh),
            Err(existing) => {
                // SAFETY: fresh was just created and never published.
                drop(unsafe { Box::from_raw(fresh) });
                Ok(existing)
            }
        }
    }

    /// Visits the metadata of every allocated page. Clears level-1 map bits
    /// for subtrees that turn out to hold no allocated pages, so later
    /// sweeps skip them.
    pub fn each_allocated(&self, mut f: impl FnMut(*mut PageMeta)) {
        for (w1, word_cell) in self.level1_map.iter().enumerate() {
            let mut word = word_cell.load(Ordering::Relaxed);
            while word != 0 {
                let j = word.trailing_zeros() as usize;
                word &= word - 1;
                let idx1 = w1 * 32 + j;
                let node = self.node(idx1);
                if node.is_null() {
                    continue;
                }
                // SAFETY: published node.
                let node = unsafe { &*node };
                let mut any = false;
                for (w0, amap) in node.allocmap.iter().enumerate() {
                    let mut line = amap.load(Ordering::Relaxed);
                    while line != 0 {
                        let k = line.trailing_zeros() as usize;
                        line &= line - 1;
                        any = true;
                        let idx0 = w0 * 32 + k;
                        f(&node.meta[idx0] as *const PageMeta as *mut PageMeta);
                    }
                }
                if !any {
                    word_cell.fetch_and(!(1u32 << j), Ordering::Relaxed);
                }
            }
        }
    }
}

/// The arena-backed pool page allocator.
pub struct PageAlloc {
    arena: Mmap,
    start: usize,
    npages: usize,
    /// Next never-used page index.
    bump: AtomicUsize,
    /// Indices of freed pages available for reuse.
    free_pages: Mutex<Vec<u32>>,
    /// Number of pages currently allocated.
    pub current_pg_count: AtomicUsize,
    /// The address-to-metadata radix map.
    pub table: PageTable,
}

impl PageAlloc {
    /// Reserves the arena and builds an empty page table.
    pub fn new() -> Result<PageAlloc, AllocError> {
        // Reserve an extra page so the usable range can be aligned up to
        // PAGE_SZ regardless of what mmap returns.
        let arena = unsafe {
            MmapOptions::new()
                .len(ARENA_BYTES + PAGE_SZ)
                .no_reserve(true)
                .map_anon()
        }
        .map_err(|_| AllocError::OutOfMemory)?;
        let start = (arena.ptr() as usize + PAGE_SZ - 1) & !(PAGE_SZ - 1);
        let npages = ARENA_BYTES >> PAGE_LG2;
        let table = PageTable::new(start, npages);
        Ok(PageAlloc {
            arena,
            start,
            npages,
            bump: AtomicUsize::new(0),
            free_pages: Mutex::new(Vec::new()),
            current_pg_count: AtomicUsize::new(0),
            table,
        })
    }

    /// Acquires a page and registers it in the radix map. The caller fills
    /// in the pool fields of the returned metadata.
    pub fn alloc_page(&self) -> Result<*mut PageMeta, AllocError> {
        let idx = match self.free_pages.lock().pop() {
            Some(idx) => idx as usize,
            None => {
                let idx = self.bump.fetch_add(1, Ordering::Relaxed);
                if idx >= self.npages {
                    self.bump.store(self.npages, Ordering::Relaxed);
                    return Err(AllocError::OutOfMemory);
                }
                idx
            }
        };
        let idx1 = idx / LEVEL0_PAGES;
        let idx0 = idx % LEVEL0_PAGES;
        let node = self.table.ensure_node(idx1)?;
        // SAFETY: published node.
        let node = unsafe { &*node };
        let meta = &node.meta[idx0] as *const PageMeta as *mut PageMeta;
        // SAFETY: the page is not allocated, so nothing else references
        // this metadata slot.
        unsafe {
            (*meta).data = (self.start + idx * PAGE_SZ) as *mut u8;
        }
        node.set_allocated(idx0);
        self.table.level1_map[idx1 / 32].fetch_or(1 << (idx1 % 32), Ordering::Relaxed);
        self.current_pg_count.fetch_add(1, Ordering::Relaxed);
        Ok(meta)
    }

    /// Returns a page to the allocator: unregisters it from the radix map
    /// and hands its physical memory back to the OS.
    ///
    /// # Safety
    ///
    /// No live object may remain on the page.
    pub unsafe fn free_page(&self, meta: *mut PageMeta) {
        // SAFETY: caller owns the page.
        let data = unsafe { (*meta).data } as usize;
        let idx = (data - self.start) >> PAGE_LG2;
        let node = self.table.node(idx / LEVEL0_PAGES);
        debug_assert!(!node.is_null());
        // SAFETY: the page was allocated, so its node exists.
        unsafe { &*node }.clear_allocated(idx % LEVEL0_PAGES);
        // Dropping the physical memory is advisory; the address range
        // stays reserved for reuse.
        let _ = self.arena.discard(data - self.arena.ptr() as usize, PAGE_SZ);
        self.free_pages.lock().push(idx as u32);
        self.current_pg_count.fetch_sub(1, Ordering::Relaxed);
    }

    /// Metadata lookup for any interior pointer.
    #[inline]
    pub fn meta_of(&self, addr: usize) -> Option<*mut PageMeta> {
        self.table.meta_of(addr)
    }
}

// SAFETY: the table only hands out raw metadata pointers; synchronization
// is the collector's stop-the-world protocol.
unsafe impl Send for PageAlloc {}
unsafe impl Sync for PageAlloc {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_registers_and_free_unregisters() {
        let pa = PageAlloc::new().expect("arena");
        let meta = pa.alloc_page().expect("page");
        let data = unsafe { (*meta).data } as usize;
        assert_eq!(data % PAGE_SZ, 0);
        assert_eq!(pa.meta_of(data), Some(meta));
        assert_eq!(pa.meta_of(data + PAGE_SZ / 2), Some(meta));
        assert_eq!(pa.meta_of(data + PAGE_SZ), None);
        unsafe { pa.free_page(meta) };
        assert_eq!(pa.meta_of(data), None);
        assert_eq!(pa.current_pg_count.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn freed_pages_are_reused() {
        let pa = PageAlloc::new().expect("arena");
        let meta = pa.alloc_page().expect("page");
        let data = unsafe { (*meta).data };
        unsafe { pa.free_page(meta) };
        let meta2 = pa.alloc_page().expect("page");
        assert_eq!(unsafe { (*meta2).data }, data);
    }

    #[test]
    fn each_allocated_sees_every_page() {
        let pa = PageAlloc::new().expect("arena");
        let mut pages = Vec::new();
        for _ in 0..40 {
            pages.push(pa.alloc_page().expect("page"));
        }
        let mut seen = 0;
        pa.table.each_allocated(|m| {
            assert!(pages.contains(&m));
            seen += 1;
        });
        assert_eq!(seen, pages.len());
        for &m in &pages {
            unsafe { pa.free_page(m) };
        }
        let mut seen = 0;
        pa.table.each_allocated(|_| seen += 1);
        assert_eq!(seen, 0);
    }
}
