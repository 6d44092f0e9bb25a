//! Tracking of malloc-backed buffers.
//!
//! Array storage allocated with the C allocator is not managed memory, but
//! it must be released when its owning object dies. Each such buffer is
//! registered as a small record on the owning thread; the sweep walks the
//! records and frees buffers whose owner is unmarked.

use std::sync::atomic::Ordering;

use crate::tag::{gc_marked, CellHeader};
use crate::thread::{Ptls, Thread};

/// One tracked buffer.
pub struct MallocBuf {
    /// The managed cell owning the buffer.
    pub owner: *mut u8,
    /// The malloc'd storage.
    pub data: *mut u8,
    /// Buffer size in bytes.
    pub bytes: usize,
}

/// Registers a malloc'd buffer owned by `owner`. The buffer must come from
/// the C allocator; the collector frees it with `free` when the owner is
/// collected.
pub fn track_malloced_buffer(th: &Thread, owner: *mut u8, data: *mut u8, bytes: usize) {
    let ptls = th.ptls();
    ptls.malloc_bufs.push(MallocBuf { owner, data, bytes });
    ptls.gc_num
        .allocd
        .fetch_add(bytes as isize, Ordering::Relaxed);
    ptls.gc_num.malloc += bytes as u64;
}

/// Sweeps one thread's tracked buffers, freeing those with a dead owner.
/// Returns the bytes freed.
pub(crate) unsafe fn sweep_malloced_buffers(ptls: &mut Ptls) -> usize {
    let mut freed = 0;
    let mut ncalls = 0u64;
    ptls.malloc_bufs.retain(|buf| {
        // SAFETY: owners are managed cells; their headers are valid until
        // the pool/big sweep below this one in the phase order.
        let bits = unsafe { (*CellHeader::of(buf.owner)).bits() };
        if gc_marked(bits) {
            true
        } else {
            // SAFETY: the buffer was malloc'd per the tracking contract.
            unsafe { libc::free(buf.data.cast()) };
            freed += buf.bytes;
            ncalls += 1;
            false
        }
    });
    ptls.gc_num.freed += freed as u64;
    ptls.gc_num.freecall += ncalls;
    freed
}
