//! Permanent allocation region.
//!
//! Objects that outlive every collection (singletons, layout metadata)
//! bump-allocate from 2 MiB pools under a dedicated lock. Allocations of
//! 20 KiB or more go straight to the host allocator. Nothing here is ever
//! reclaimed; permanent cells are born `OLD_MARKED` and the sweep never
//! visits them.

use std::alloc::Layout;
use std::ptr::NonNull;

use parking_lot::Mutex;

use crate::error::AllocError;
use crate::tag::{CellHeader, TypeDescriptor, GC_OLD_MARKED, WORD};

const PERM_POOL_SZ: usize = 2 << 20;
/// Allocations at or above this size bypass the bump pool.
const PERM_DIRECT_LIMIT: usize = 20 << 10;

struct PermState {
    pool: *mut u8,
    offset: usize,
}

// SAFETY: the state is only touched under the lock.
unsafe impl Send for PermState {}

/// The permanent bump allocator.
pub struct PermPool {
    state: Mutex<PermState>,
}

impl PermPool {
    pub(crate) fn new() -> PermPool {
        PermPool {
            state: Mutex::new(PermState {
                pool: std::ptr::null_mut(),
                offset: PERM_POOL_SZ,
            }),
        }
    }

    /// Bump-allocates `size` bytes whose address is congruent to `offset`
    /// modulo `align`. Never reclaimed.
    pub fn alloc(
        &self,
        size: usize,
        zero: bool,
        align: usize,
        offset: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        debug_assert!(align.is_power_of_two() && offset < align);
        if size >= PERM_DIRECT_LIMIT {
            return Self::alloc_large(size, zero, align, offset);
        }
        let mut state = self.state.lock();
        loop {
            if !state.pool.is_null() {
                let base = state.pool as usize + state.offset;
                // Place `base + pad` so that (base + pad + offset) % align == 0.
                let pad = align.wrapping_sub(base + offset) & (align - 1);
                let start = state.offset + pad;
                if let Some(end) = start.checked_add(size) {
                    if end <= PERM_POOL_SZ {
                        state.offset = end;
                        let ptr = unsafe { state.pool.add(start) };
                        if zero {
                            unsafe { std::ptr::write_bytes(ptr, 0, size) };
                        }
                        // SAFETY: inside the pool allocation.
                        return Ok(unsafe { NonNull::new_unchecked(ptr) });
                    }
                }
            }
            // Start a fresh pool; the remainder of the old one is wasted,
            // which is fine for a region this coarse.
            let layout = Layout::from_size_align(PERM_POOL_SZ, 64)
                .map_err(|_| AllocError::SizeOverflow)?;
            // SAFETY: non-zero layout. Pool memory starts zeroed so callers
            // relying on `zero` for partial words stay correct.
            let pool = unsafe { std::alloc::alloc_zeroed(layout) };
            if pool.is_null() {
                return Err(AllocError::OutOfMemory);
            }
            state.pool = pool;
            state.offset = 0;
        }
    }

    fn alloc_large(
        size: usize,
        zero: bool,
        align: usize,
        offset: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        // Over-allocate so any congruence class fits.
        let total = size
            .checked_add(align)
            .ok_or(AllocError::SizeOverflow)?;
        let layout =
            Layout::from_size_align(total, align).map_err(|_| AllocError::SizeOverflow)?;
        // SAFETY: non-zero layout.
        let raw = unsafe {
            if zero {
                std::alloc::alloc_zeroed(layout)
            } else {
                std::alloc::alloc(layout)
            }
        };
        if raw.is_null() {
            return Err(AllocError::OutOfMemory);
        }
        let base = raw as usize;
        let pad = align.wrapping_sub(base + offset) & (align - 1);
        // SAFETY: pad < align <= total - size.
        Ok(unsafe { NonNull::new_unchecked(raw.add(pad)) })
    }

    /// Allocates a permanent managed cell: header plus `size` payload
    /// bytes, born `OLD_MARKED`. The mark loop treats it as always marked
    /// and the sweep never sees it.
    pub fn alloc_cell(
        &self,
        size: usize,
        ty: &'static TypeDescriptor,
    ) -> Result<NonNull<u8>, AllocError> {
        let total = size.checked_add(WORD).ok_or(AllocError::SizeOverflow)?;
        // Headers want the payload 16-aligned one word in.
        let cell = self.alloc(total, true, 16, WORD)?;
        unsafe {
            let header = &*cell.as_ptr().cast::<CellHeader>();
            header.init(ty);
            header.set_bits(GC_OLD_MARKED);
            Ok(NonNull::new_unchecked(cell.as_ptr().add(WORD)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rt::NOTHING_TYPE;

    #[test]
    fn respects_alignment_offset() {
        let pool = PermPool::new();
        for &(align, offset) in &[(16usize, 0usize), (64, 8), (4096, 16), (32, 24)] {
            let p = pool.alloc(128, false, align, offset).expect("perm alloc");
            assert_eq!((p.as_ptr() as usize + offset) % align, 0);
        }
    }

    #[test]
    fn large_allocations_bypass_pool() {
        let pool = PermPool::new();
        let p = pool.alloc(64 << 10, true, 64, 0).expect("perm alloc");
        assert_eq!(p.as_ptr() as usize % 64, 0);
        unsafe {
            assert_eq!(*p.as_ptr(), 0);
            assert_eq!(*p.as_ptr().add((64 << 10) - 1), 0);
        }
    }

    #[test]
    fn perm_cells_are_old_marked() {
        let pool = PermPool::new();
        let payload = pool.alloc_cell(0, &NOTHING_TYPE).expect("perm cell");
        unsafe {
            let header = &*CellHeader::of(payload.as_ptr());
            assert_eq!(header.bits(), GC_OLD_MARKED);
            assert!(std::ptr::eq(header.type_of(), &NOTHING_TYPE));
        }
    }
}
