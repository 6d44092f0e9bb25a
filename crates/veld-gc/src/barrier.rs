//! Generational write barrier and remembered sets.
//!
//! An `OLD_MARKED` object is finished as far as this cycle's marking is
//! concerned, so storing a young reference into it would hide the child
//! from the next quick collection. The forward barrier re-opens the
//! parent: it drops the bits back to `MARKED` and appends the parent to
//! the thread's remembered set, which the next mark phase scans as a root.
//! Module bindings get the same treatment on a separate list.
//!
//! Each thread owns two remset buffers; the collector swaps them at the
//! start of marking so `last_remset` is a frozen root set while new edges
//! accumulate in `remset`.

use crate::tag::{gc_marked, CellHeader, GC_MARKED, GC_OLD_MARKED};
use crate::thread::Thread;

/// Forward write barrier: call after storing a (possibly young) reference
/// into `parent` when `parent` is `OLD_MARKED`.
///
/// The bits update is not atomic; the collector cannot run concurrently
/// (we are outside any safepoint) and duplicated remset entries are
/// harmless.
pub fn queue_root(th: &Thread, parent: *mut u8) {
    // SAFETY: parent is a managed cell per the API contract.
    unsafe { (*CellHeader::of(parent)).set_bits(GC_MARKED) };
    let ptls = th.ptls();
    ptls.remset.push(parent);
    // Conservative: one intergenerational pointer per barrier hit.
    ptls.remset_nptr += 1;
}

/// Binding barrier: the analog of [`queue_root`] for module binding cells,
/// kept on their own remembered list.
pub fn queue_binding(th: &Thread, binding: *mut u8) {
    // SAFETY: binding is a managed binding cell per the API contract.
    unsafe { (*CellHeader::of(binding)).set_bits(GC_MARKED) };
    th.ptls().rem_bindings.push(binding);
}

/// Combined store barrier: applies [`queue_root`] only when the parent is
/// old-marked and the child young, the only edge the remset needs.
#[inline]
pub fn write_barrier(th: &Thread, parent: *mut u8, child: *mut u8) {
    if child.is_null() {
        return;
    }
    // SAFETY: both pointers are managed cells per the API contract.
    let (pbits, cbits) = unsafe {
        (
            (*CellHeader::of(parent)).bits(),
            (*CellHeader::of(child)).bits(),
        )
    };
    if pbits == GC_OLD_MARKED && !gc_marked(cbits) {
        queue_root(th, parent);
    }
}

/// Swaps the remset buffers at the start of a collection and re-tags the
/// frozen entries `OLD_MARKED` so the mark loop scans them as old roots.
/// Runs with the world stopped.
pub(crate) unsafe fn premark(ptls: &mut crate::thread::Ptls) {
    std::mem::swap(&mut ptls.remset, &mut ptls.last_remset);
    ptls.remset.clear();
    ptls.remset_nptr = 0;
    for &obj in &ptls.last_remset {
        // SAFETY: remset entries are managed cells kept alive by the
        // old-generation invariant.
        unsafe { (*CellHeader::of(obj)).set_bits(GC_OLD_MARKED) };
    }
    for &bnd in &ptls.rem_bindings {
        // SAFETY: as above.
        unsafe { (*CellHeader::of(bnd)).set_bits(GC_OLD_MARKED) };
    }
}
