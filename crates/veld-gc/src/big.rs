//! Big-object allocation.
//!
//! Objects too large for any pool class get an individual host allocation
//! with a [`BigVal`] header in front of the cell. Big objects live on an
//! intrusive doubly-linked list per thread; during marking, survivors
//! observed to be old migrate to the global `big_objects_marked` list and
//! are merged back into the collector thread's list by the next full
//! sweep.

use std::alloc::Layout;
use std::ptr::NonNull;
use std::sync::atomic::Ordering;

use crate::error::AllocError;
use crate::pool::maybe_collect;
use crate::tag::{CellHeader, WORD};
use crate::thread::Thread;

/// Cache-line alignment for big allocations.
pub const BIG_ALIGNMENT: usize = 64;

/// Saturating age ceiling; one survived collection promotes.
pub const PROMOTE_AGE: u8 = 1;

/// Header preceding every big-object cell.
///
/// `prev` points at the `next` field that links to this node, so unlinking
/// needs no list head comparison.
#[repr(C)]
pub struct BigVal {
    /// Next node, or null.
    pub next: *mut BigVal,
    /// The `next` slot pointing at this node.
    pub prev: *mut *mut BigVal,
    /// Total allocation size in bytes (header included).
    pub sz: usize,
    /// Collections survived, saturating at [`PROMOTE_AGE`].
    pub age: u8,
    _pad: [u8; 15],
    /// The cell's tagged header word; the payload follows it.
    pub header: CellHeader,
}

impl BigVal {
    /// Offset of the cell header within a big allocation.
    pub const HEADER_OFFSET: usize = std::mem::offset_of!(BigVal, header);

    /// The `BigVal` owning the cell whose payload is `payload`.
    ///
    /// # Safety
    ///
    /// `payload` must belong to a big-object cell.
    #[inline]
    pub unsafe fn of_payload(payload: *mut u8) -> *mut BigVal {
        unsafe { payload.sub(WORD + Self::HEADER_OFFSET) }.cast()
    }

    /// The `BigVal` owning the given cell header.
    ///
    /// # Safety
    ///
    /// `header` must be the header of a big-object cell.
    #[inline]
    pub unsafe fn of_header(header: *mut CellHeader) -> *mut BigVal {
        unsafe { header.cast::<u8>().sub(Self::HEADER_OFFSET) }.cast()
    }

    /// Host-allocation layout for this node.
    #[inline]
    pub fn layout(sz: usize) -> Layout {
        // sz is cache-line rounded at allocation time.
        Layout::from_size_align(sz, BIG_ALIGNMENT).expect("big object layout")
    }
}

/// Links `v` at the head of the list rooted at `head`.
///
/// # Safety
///
/// `v` must be unlinked and `head` must be a valid list head slot.
pub unsafe fn big_object_link(v: *mut BigVal, head: *mut *mut BigVal) {
    unsafe {
        (*v).next = *head;
        (*v).prev = head;
        if !(*v).next.is_null() {
            (*(*v).next).prev = &mut (*v).next;
        }
        *head = v;
    }
}

/// Unlinks `v` from whatever list it is on.
///
/// # Safety
///
/// `v` must be linked.
pub unsafe fn big_object_unlink(v: *mut BigVal) {
    unsafe {
        *(*v).prev = (*v).next;
        if !(*v).next.is_null() {
            (*(*v).next).prev = (*v).prev;
        }
    }
}

/// Allocates a big-object cell with room for `sz` payload bytes. Returns
/// the payload pointer; the header word is reserved and not initialized.
pub fn big_alloc(th: &Thread, sz: usize) -> Result<NonNull<u8>, AllocError> {
    maybe_collect(th);
    let total = sz
        .checked_add(BigVal::HEADER_OFFSET + WORD)
        .and_then(|t| t.checked_add(BIG_ALIGNMENT - 1))
        .ok_or(AllocError::SizeOverflow)?
        & !(BIG_ALIGNMENT - 1);
    // SAFETY: non-zero, cache-line aligned layout.
    let raw = unsafe { std::alloc::alloc(BigVal::layout(total)) };
    let Some(v) = NonNull::new(raw.cast::<BigVal>()) else {
        return Err(AllocError::OutOfMemory);
    };
    let collector = crate::collect::Collector::global();
    collector
        .callbacks
        .notify_external_alloc(raw, total);
    let ptls = th.ptls();
    ptls.gc_num
        .allocd
        .fetch_add(total as isize, Ordering::Relaxed);
    ptls.gc_num.bigalloc += 1;
    unsafe {
        let v = v.as_ptr();
        (*v).sz = total;
        (*v).age = 0;
        big_object_link(v, &mut ptls.big_objects);
        Ok(NonNull::new_unchecked(
            (*v).header.payload(),
        ))
    }
}

/// Frees a big node, notifying the external-free callbacks.
///
/// # Safety
///
/// `v` must be unlinked and dead.
pub unsafe fn big_free(v: *mut BigVal) {
    let collector = crate::collect::Collector::global();
    collector.callbacks.notify_external_free(v.cast());
    unsafe {
        let sz = (*v).sz;
        std::alloc::dealloc(v.cast(), BigVal::layout(sz));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_offset_keeps_payload_aligned() {
        // The payload must land on a 16-byte boundary when the node is
        // cache-line aligned.
        assert_eq!((BigVal::HEADER_OFFSET + WORD) % 16, 0);
    }

    #[test]
    fn link_unlink_roundtrip() {
        let mut head: *mut BigVal = std::ptr::null_mut();
        let layout = BigVal::layout(256);
        unsafe {
            let a = std::alloc::alloc_zeroed(layout).cast::<BigVal>();
            let b = std::alloc::alloc_zeroed(layout).cast::<BigVal>();
            (*a).sz = 256;
            (*b).sz = 256;
            big_object_link(a, &mut head);
            big_object_link(b, &mut head);
            assert_eq!(head, b);
            assert_eq!((*b).next, a);
            big_object_unlink(a);
            assert_eq!(head, b);
            assert!((*b).next.is_null());
            big_object_unlink(b);
            assert!(head.is_null());
            std::alloc::dealloc(a.cast(), layout);
            std::alloc::dealloc(b.cast(), layout);
        }
    }
}
