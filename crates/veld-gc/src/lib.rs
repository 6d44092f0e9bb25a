//! Generational stop-the-world mark-and-sweep heap for the veld runtime.
//!
//! The collector is non-moving and generational: small objects live in
//! size-classed cells inside 16 KiB pool pages, large objects get
//! individual host allocations, and every managed cell carries one header
//! word with the type descriptor and two GC mark bits. Mutators allocate
//! through per-thread pools, record old-to-young edges through the write
//! barrier, and park at safepoints while the single collector thread
//! marks and sweeps.
//!
//! # Quick start
//!
//! ```ignore
//! use veld_gc::{alloc, collect, Collection, Thread, TypeDescriptor, TypeLayout};
//!
//! static PAIR: TypeDescriptor = TypeDescriptor {
//!     name: "Pair",
//!     size: 16,
//!     layout: TypeLayout::Ptr8(&[0, 1]),
//! };
//!
//! let th = Thread::current();
//! let pair = alloc(&th, PAIR.size, &PAIR).unwrap();
//! veld_gc::add_global_root(pair.as_ptr());
//! collect(&th, Collection::Auto);
//! ```
//!
//! # Threads
//!
//! Every entry point takes a [`Thread`] handle; [`Thread::current`]
//! registers the calling thread on first use. Mutators must poll
//! [`safepoint`] in long allocation-free loops, and bracket blocking
//! calls with [`Thread::gc_safe_enter`]/[`Thread::gc_safe_leave`] so the
//! collector does not wait on them.

#![warn(missing_docs)]

pub mod barrier;
pub mod big;
pub mod callbacks;
mod collect;
pub mod error;
pub mod finalizer;
mod malloc_buf;
mod mark;
pub mod metrics;
pub mod page;
pub mod pool;
pub mod perm;
pub mod rt;
pub mod tag;
mod sweep;
mod thread;
mod tracing;

use std::ptr::NonNull;

pub use barrier::{queue_binding, queue_root, write_barrier};
pub use collect::{collect, Collection, Collector, GcStats};
pub use error::AllocError;
pub use finalizer::{
    add_finalizer, add_ptr_finalizer, add_quiescent, enable_finalizers, finalize,
    have_pending_finalizers, run_all_finalizers, run_pending_finalizers, set_managed_invoker,
    ManagedInvoker, NativeFinalizer,
};
pub use metrics::{last_gc_metrics, CollectionKind, GcMetrics};
pub use pool::{internal_obj_base_ptr, MAX_SZCLASS};
pub use tag::{ArrayElem, ArrayHow, ArrayRepr, CellHeader, TypeDescriptor, TypeLayout};
pub use thread::Thread;

use tag::{CellHeader as Header, WORD};

/// Allocates a managed cell with room for `size` payload bytes and
/// installs `ty` in its header with `CLEAN` bits. Returns the payload
/// pointer; its contents are uninitialized.
pub fn alloc(
    th: &Thread,
    size: usize,
    ty: &'static TypeDescriptor,
) -> Result<NonNull<u8>, AllocError> {
    let allocsz = size.checked_add(WORD).ok_or(AllocError::SizeOverflow)?;
    let payload = if allocsz <= pool::MAX_POOL_ALLOC {
        let class = pool::szclass(allocsz);
        pool::pool_alloc(th, class, pool::SIZE_CLASSES[class] as usize)?
    } else {
        big::big_alloc(th, size)?
    };
    // SAFETY: freshly allocated cell with a reserved header word.
    unsafe { (*Header::of(payload.as_ptr())).init(ty) };
    Ok(payload)
}

/// Allocates a weak reference to `value`, auto-registered on the calling
/// thread's weak-reference list. After a collection in which `value` was
/// unreachable, the reference reads as the nothing sentinel.
pub fn new_weakref(th: &Thread, value: *mut u8) -> Result<NonNull<u8>, AllocError> {
    let wr = alloc(th, WORD, &rt::WEAKREF_TYPE)?;
    // SAFETY: weak-ref payload is one managed slot.
    unsafe { *wr.as_ptr().cast::<*mut u8>() = value };
    th.ptls().weak_refs.push(wr.as_ptr());
    Ok(wr)
}

/// Reads a weak reference, returning the target or the nothing sentinel.
pub fn weakref_value(wr: *mut u8) -> *mut u8 {
    // SAFETY: weak-ref payload is one managed slot.
    unsafe { *wr.cast::<*mut u8>() }
}

/// The runtime's `nothing` singleton.
pub fn nothing_value() -> *mut u8 {
    Collector::global().nothing_value()
}

/// GC mark bits of a managed cell, for diagnostics and tests.
pub fn object_gc_bits(obj: *mut u8) -> u8 {
    // SAFETY: obj is a managed cell per the API contract.
    unsafe { (*Header::of(obj)).bits() }
}

/// Polls for a pending collection on the current thread.
pub fn safepoint() {
    Thread::current().safepoint();
}

/// Live bytes after the last collection (approximate between cycles).
pub fn live_bytes() -> i64 {
    Collector::global().live_bytes()
}

/// Snapshot of the global allocation and pause counters.
pub fn gc_stats() -> GcStats {
    Collector::global().stats()
}

/// Entries in the calling thread's remembered set; diagnostics only.
#[doc(hidden)]
pub fn remset_len(th: &Thread) -> usize {
    th.ptls().remset.len()
}

/// Registers a buffer malloc'd by the runtime as owned by `owner`; the
/// collector frees it with the C allocator when `owner` dies.
pub fn track_malloced_buffer(th: &Thread, owner: *mut u8, data: *mut u8, bytes: usize) {
    malloc_buf::track_malloced_buffer(th, owner, data, bytes);
}

/// Schedules `obj`'s foreign sweep hook to run when it becomes
/// unreachable. `obj`'s descriptor must use [`TypeLayout::Foreign`].
pub fn schedule_foreign_sweep(th: &Thread, obj: *mut u8) {
    th.ptls().sweep_objs.push(obj);
}

/// Registers an always-reachable root.
pub fn add_global_root(obj: *mut u8) {
    Collector::global().global_roots.lock().push(obj as usize);
}

/// Removes a previously registered global root (first match).
pub fn delete_global_root(obj: *mut u8) {
    let mut roots = Collector::global().global_roots.lock();
    if let Some(pos) = roots.iter().position(|&r| r == obj as usize) {
        roots.remove(pos);
    }
}

/// Installs the module-tree root scanned by every collection.
pub fn set_root_module(module: *mut u8) {
    Collector::global()
        .root_module
        .store(module, std::sync::atomic::Ordering::Relaxed);
}

/// Toggles the global collection gate; returns whether collection was
/// enabled before the call. While disabled, spent allocation budgets
/// accumulate in a deferred counter.
pub fn enable(on: bool) -> bool {
    Collector::global().enable(on)
}

/// Whether collection is enabled.
pub fn is_enabled() -> bool {
    Collector::global().is_enabled()
}

/// Suggests the soft cap on total live memory used to force full sweeps.
pub fn set_max_memory(bytes: usize) {
    Collector::global().set_max_memory(bytes);
}

/// Idempotently enables conservative-marking support; the first call
/// forces one full collection to realign the age bits.
pub fn enable_conservative_gc_support(th: &Thread) {
    Collector::global().enable_conservative_gc_support(th);
}

/// Whether conservative-marking support is enabled.
pub fn conservative_gc_support_enabled() -> bool {
    Collector::global().conservative_gc_support_enabled()
}

/// Bump-allocates permanently-live memory; see
/// [`perm::PermPool::alloc`].
pub fn perm_alloc(
    size: usize,
    zero: bool,
    align: usize,
    offset: usize,
) -> Result<NonNull<u8>, AllocError> {
    Collector::global().perm.alloc(size, zero, align, offset)
}

/// Allocates a permanent managed cell, born `OLD_MARKED` and never swept.
pub fn perm_alloc_cell(
    size: usize,
    ty: &'static TypeDescriptor,
) -> Result<NonNull<u8>, AllocError> {
    Collector::global().perm.alloc_cell(size, ty)
}

/// Registers or removes a root-scanner callback.
pub fn set_cb_root_scanner(cb: callbacks::RootScannerCb, enable: bool) {
    Collector::global().callbacks.set_root_scanner(cb, enable);
}

/// Registers or removes a task-scanner callback.
pub fn set_cb_task_scanner(cb: callbacks::TaskScannerCb, enable: bool) {
    Collector::global().callbacks.set_task_scanner(cb, enable);
}

/// Registers or removes a pre-GC callback.
pub fn set_cb_pre_gc(cb: callbacks::PreGcCb, enable: bool) {
    Collector::global().callbacks.set_pre_gc(cb, enable);
}

/// Registers or removes a post-GC callback.
pub fn set_cb_post_gc(cb: callbacks::PostGcCb, enable: bool) {
    Collector::global().callbacks.set_post_gc(cb, enable);
}

/// Registers or removes an external-allocation notification callback.
pub fn set_cb_notify_external_alloc(cb: callbacks::NotifyExternalAllocCb, enable: bool) {
    Collector::global()
        .callbacks
        .set_notify_external_alloc(cb, enable);
}

/// Registers or removes an external-free notification callback.
pub fn set_cb_notify_external_free(cb: callbacks::NotifyExternalFreeCb, enable: bool) {
    Collector::global()
        .callbacks
        .set_notify_external_free(cb, enable);
}
