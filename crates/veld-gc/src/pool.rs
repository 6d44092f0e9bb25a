//! Size-classed pool allocation.
//!
//! Small objects come from per-thread pools, one per size class, backed by
//! 16 KiB pages. Allocation pops the pool's freelist when it has one and
//! bump-allocates from the head of the `newpages` list otherwise. Each
//! page's freelist is singly linked through the first word of its free
//! cells and never crosses a page boundary; the pool-level freelist is the
//! concatenation of per-page segments, so popping onto a new page is the
//! signal to refresh the old page's metadata.

use std::ptr::NonNull;

use crate::collect::Collector;
use crate::error::AllocError;
use crate::page::{page_of, PageMeta, FL_NONE, PAGE_OFFSET, PAGE_SZ};
use crate::rt::BUFFER_TYPE;
use crate::tag::{CellHeader, WORD};
use crate::thread::{check_safepoint, Thread};

/// Cell sizes in bytes, header word included. All classes are multiples of
/// 16 so payloads keep 16-byte alignment behind the 8-byte header.
pub const SIZE_CLASSES: [u16; 24] = [
    16, 32, 48, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 384, 448, 512, 640, 768, 896, 1024,
    1280, 1536, 1792, 2048,
];

/// Number of size classes.
pub const N_POOLS: usize = SIZE_CLASSES.len();

/// Largest cell size served by the pools (header included).
pub const MAX_POOL_ALLOC: usize = 2048;

/// Largest payload the pools serve; anything bigger is a big object.
pub const MAX_SZCLASS: usize = MAX_POOL_ALLOC - WORD;

// Maps ceil(allocsz / 16) to a size-class index.
static CLASS_OF: [u8; MAX_POOL_ALLOC / 16 + 1] = build_class_table();

const fn build_class_table() -> [u8; MAX_POOL_ALLOC / 16 + 1] {
    let mut table = [0u8; MAX_POOL_ALLOC / 16 + 1];
    let mut unit = 1;
    while unit <= MAX_POOL_ALLOC / 16 {
        let mut class = 0;
        while (SIZE_CLASSES[class] as usize) < unit * 16 {
            class += 1;
        }
        table[unit] = class as u8;
        unit += 1;
    }
    table
}

/// Size-class index for an allocation of `allocsz` bytes (header
/// included). `allocsz` must not exceed [`MAX_POOL_ALLOC`].
#[inline]
pub fn szclass(allocsz: usize) -> usize {
    debug_assert!(allocsz <= MAX_POOL_ALLOC);
    CLASS_OF[allocsz.div_ceil(16)] as usize
}

/// A free cell: the header word doubles as the freelist link.
#[repr(C)]
pub struct FreeCell {
    /// Next free cell, or null.
    pub next: *mut FreeCell,
}

/// One per-thread allocation pool.
pub struct GcPool {
    /// Concatenated per-page freelists.
    pub freelist: *mut FreeCell,
    /// Bump cursor into the head page of the fresh-page list; pages link
    /// through their first data word.
    pub newpages: *mut FreeCell,
}

impl GcPool {
    pub(crate) fn new() -> GcPool {
        GcPool {
            freelist: std::ptr::null_mut(),
            newpages: std::ptr::null_mut(),
        }
    }
}

/// Triggers a collection when the thread's allocation budget is spent,
/// otherwise polls the safepoint.
#[inline]
pub(crate) fn maybe_collect(th: &Thread) {
    if th.ptls().gc_num.allocd.load(std::sync::atomic::Ordering::Relaxed) >= 0 {
        crate::collect::collect(th, crate::Collection::Auto);
    } else {
        check_safepoint(&th.tcb);
    }
}

/// Re-initializes a page as a fresh bump target for `pool`, chaining it
/// into the existing `newpages` list (`fl`) if one exists. Returns the new
/// bump cursor.
///
/// The fresh page is inserted *after* the current head page so that
/// allocation keeps draining a single page at a time; the conservative
/// resolver relies on only the head page of `newpages` ever being
/// allocated from.
pub(crate) unsafe fn reset_page(
    pool_n: u8,
    osize: u16,
    meta: *mut PageMeta,
    fl: *mut FreeCell,
) -> *mut FreeCell {
    unsafe {
        let meta = &mut *meta;
        meta.pool_n = pool_n;
        meta.osize = osize;
        meta.nfree = ((PAGE_SZ - PAGE_OFFSET) / osize as usize) as u16;
        meta.has_marked = false;
        meta.has_young = false;
        meta.fl_begin_offset = FL_NONE;
        meta.fl_end_offset = FL_NONE;
        meta.ages = [0; crate::page::AGES_BYTES];
        let data = meta.data;
        let beg = data.add(PAGE_OFFSET).cast::<FreeCell>();
        let link = data.cast::<*mut FreeCell>();
        if fl.is_null() {
            *link = std::ptr::null_mut();
            beg
        } else {
            // Splice behind the head page so the head keeps being drained.
            let fl_link = (page_of(fl as usize) as *mut u8).cast::<*mut FreeCell>();
            *link = *fl_link;
            *fl_link = beg;
            fl
        }
    }
}

#[cold]
unsafe fn add_page(tid: u16, pool_i: usize, osize: usize) -> Result<*mut FreeCell, AllocError> {
    let collector = Collector::global();
    let meta = collector.page_alloc.alloc_page()?;
    unsafe {
        (*meta).thread_n = tid;
        Ok(reset_page(pool_i as u8, osize as u16, meta, std::ptr::null_mut()))
    }
}

/// Allocates one cell from the given size class. The returned pointer is
/// the payload; the header word is reserved and not yet initialized.
pub fn pool_alloc(
    th: &Thread,
    pool_i: usize,
    osize: usize,
) -> Result<NonNull<u8>, AllocError> {
    maybe_collect(th);
    let ptls = th.ptls();
    ptls.gc_num
        .allocd
        .fetch_add(osize as isize, std::sync::atomic::Ordering::Relaxed);
    ptls.gc_num.poolalloc += 1;
    let tid = ptls.tid;

    let collector = Collector::global();
    let pool = &mut ptls.pools[pool_i];

    // Fast path: pop the freelist.
    let v = pool.freelist;
    if !v.is_null() {
        // SAFETY: freelist cells are dead memory owned by this pool.
        let next = unsafe { (*v).next };
        pool.freelist = next;
        if page_of(v as usize) != page_of(next as usize) {
            // Only touch the page metadata when the freelist leaves the
            // page; it is unlikely to be in cache otherwise.
            let meta = collector
                .page_alloc
                .meta_of(v as usize)
                .expect("freelist cell outside any page");
            unsafe {
                debug_assert_eq!((*meta).osize as usize, osize);
                (*meta).nfree = 0;
                (*meta).has_young = true;
            }
        }
        // SAFETY: v points at a cell-sized region.
        return Ok(unsafe { NonNull::new_unchecked((v as *mut u8).add(WORD)) });
    }

    // Bump path: consume the head of the newpages list.
    let mut v = pool.newpages;
    if !v.is_null() {
        let next = unsafe { (v as *mut u8).add(osize) };
        let cur_page = page_of(v as usize - 1);
        if next as usize > cur_page + PAGE_SZ {
            // Head page exhausted: refresh its metadata and move on to the
            // next page in the list, if any.
            let meta = collector
                .page_alloc
                .meta_of(v as usize - 1)
                .expect("bump cursor outside any page");
            unsafe {
                debug_assert_eq!((*meta).osize as usize, osize);
                (*meta).nfree = 0;
                (*meta).has_young = true;
                v = *(cur_page as *mut u8).cast::<*mut FreeCell>();
            }
        }
    }
    if v.is_null() {
        // SAFETY: slow path installs a fresh page for this pool.
        v = unsafe { add_page(tid, pool_i, osize)? };
    }
    pool.newpages = unsafe { (v as *mut u8).add(osize) }.cast();
    // SAFETY: v points at a cell-sized region inside the head page.
    Ok(unsafe { NonNull::new_unchecked((v as *mut u8).add(WORD)) })
}

// ============================================================================
// Conservative interior-pointer resolution
// ============================================================================

/// Resolves an arbitrary machine pointer to the payload of the live pool
/// cell containing it, or `None`.
///
/// Must run while no sweep is in progress (either from the stopped-world
/// window or from embedder marking callbacks). Three page states are
/// distinguished: full pages, the head of a pool's `newpages` list (where
/// addresses at or past the bump cursor are dead), and pages with a
/// freelist (where cells below the freelist cursor are live and the rest
/// answer to their age bit). Cells carrying the buffer sentinel type are
/// storage, not objects, and are never returned.
pub fn internal_obj_base_ptr(p: *mut u8) -> Option<*mut u8> {
    let collector = Collector::global();
    // Back up one byte so payload-base pointers resolve into their own
    // cell rather than the next one.
    let addr = (p as usize).checked_sub(1)?;
    let meta = collector.page_alloc.meta_of(addr)?;
    // SAFETY: metadata of an allocated page.
    let meta = unsafe { &*meta };
    let page = meta.data as usize;
    let off = addr - page;
    if off < PAGE_OFFSET {
        return None;
    }
    let osize = meta.osize as usize;
    let off2 = (off - PAGE_OFFSET) % osize;
    if off - off2 + osize > PAGE_SZ {
        // Into the tail waste past the last full cell.
        return None;
    }
    let cell = (addr - off2) as *mut u8;
    let obj_id = meta.cell_index(cell as usize);

    let live = 'live: {
        if meta.nfree == 0 {
            // Case 1: full page, every cell is an object.
            break 'live true;
        }
        let threads = crate::thread::all_threads();
        let owner = threads.get(meta.thread_n as usize)?;
        // SAFETY: resolver contract excludes concurrent sweeps; reading a
        // foreign pool is safe while its owner is stopped.
        let pool = unsafe { &owner.ptls().pools[meta.pool_n as usize] };
        if meta.fl_begin_offset == FL_NONE {
            // Case 2: a page on the newpages list. Only the head page is
            // ever allocated from; anything at or past the bump cursor is
            // dead space.
            let newpages = pool.newpages;
            if newpages.is_null() {
                return None;
            }
            if page_of(newpages as usize) != page {
                return None;
            }
            break 'live (cell as usize) < newpages as usize;
        }
        // Case 3: a page with a freelist. Marked or old cells can't be on
        // the freelist.
        let header = unsafe { &*(cell.cast::<CellHeader>()) };
        if header.bits() != 0 {
            break 'live true;
        }
        // Freelist entries are consumed in address order: anything below
        // the freelist cursor on the cursor's page was live at the last
        // sweep or has been allocated since.
        if page_of(pool.freelist as usize) == page && (cell as usize) < pool.freelist as usize {
            break 'live true;
        }
        // Otherwise the age bit still reflects the last sweep: zero for
        // freelist entries, one for live objects.
        meta.age_bit(obj_id)
    };
    if !live {
        return None;
    }
    let header = unsafe { &*(cell.cast::<CellHeader>()) };
    if std::ptr::eq(header.type_of(), &BUFFER_TYPE) {
        return None;
    }
    Some(unsafe { cell.add(WORD) })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_table_is_monotonic() {
        let mut last = 0;
        for allocsz in (16..=MAX_POOL_ALLOC).step_by(16) {
            let class = szclass(allocsz);
            assert!(SIZE_CLASSES[class] as usize >= allocsz);
            assert!(class >= last);
            last = class;
        }
        assert_eq!(szclass(MAX_POOL_ALLOC), N_POOLS - 1);
        assert_eq!(szclass(1), 0);
        assert_eq!(szclass(17), 1);
    }

    #[test]
    fn classes_cover_header_plus_max_payload() {
        assert_eq!(MAX_SZCLASS + WORD, MAX_POOL_ALLOC);
        for win in SIZE_CLASSES.windows(2) {
            assert!(win[0] < win[1]);
            assert_eq!(win[0] % 16, 0);
        }
    }
}
