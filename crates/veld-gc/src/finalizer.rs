//! Finalizer registration, scheduling and execution.
//!
//! Finalizers are stored as two consecutive slots (object, finalizer) in a
//! per-thread list. The low bits of the object slot tag the entry:
//!
//! * bit 0 — the finalizer slot is a plain native function pointer, not a
//!   managed function object;
//! * bit 1 — the entry is already "freed" and fires at the next quiescent
//!   point regardless of reachability.
//!
//! The packed representation is observable by embedders and is preserved
//! at the byte level. Owners append with release stores of the list
//! length; cross-thread scans (explicit [`finalize`]) acquire-load the
//! length so they see a consistent prefix, and any list growth happens
//! under the global finalizer lock.

use std::cell::UnsafeCell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::collect::Collector;
use crate::tag::{gc_marked, CellHeader, GC_OLD_MARKED};
use crate::thread::Thread;

/// Object-slot tag: the finalizer is a native function pointer.
pub const FIN_TAG_PTR: usize = 1;
/// Object-slot tag: fire at the next quiescent point unconditionally.
pub const FIN_TAG_FREED: usize = 2;
const FIN_TAG_MASK: usize = 3;

/// Native finalizer signature for tag-bit-0 entries.
pub type NativeFinalizer = unsafe fn(obj: *mut u8);

/// Invoker for managed finalizer objects, supplied by the runtime.
pub type ManagedInvoker = fn(finalizer: *mut u8, obj: *mut u8);

#[inline]
fn fin_tag(v: usize) -> usize {
    v & FIN_TAG_MASK
}

#[inline]
fn fin_obj(v: usize) -> *mut u8 {
    (v & !FIN_TAG_MASK) as *mut u8
}

// ============================================================================
// Per-thread finalizer list
// ============================================================================

/// A per-thread list of (object, finalizer) slot pairs.
///
/// The backing buffer always has `capacity` slots; the logical length is
/// published separately so another thread holding the finalizer lock can
/// read a consistent prefix while the owner keeps appending.
pub struct FinList {
    buf: UnsafeCell<Vec<usize>>,
    len: AtomicUsize,
}

impl FinList {
    pub(crate) fn new() -> FinList {
        FinList {
            buf: UnsafeCell::new(Vec::new()),
            len: AtomicUsize::new(0),
        }
    }

    /// Published length (acquire).
    pub fn len_acquire(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    /// The raw slot buffer.
    ///
    /// # Safety
    ///
    /// Caller must be the owner thread, hold the finalizer lock, or run
    /// during the stopped-world window.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn slots(&self) -> &mut Vec<usize> {
        unsafe { &mut *self.buf.get() }
    }

    /// Appends a pair. Called by the owning thread; growth of the backing
    /// buffer synchronizes with cross-thread readers via the finalizer
    /// lock.
    fn push_pair(&self, v: usize, f: usize) {
        let len = self.len.load(Ordering::Relaxed);
        // SAFETY: owner thread.
        let buf = unsafe { self.slots() };
        if len + 2 > buf.len() {
            let collector = Collector::global();
            let _guard = collector.finalizers.lock();
            let grown = (buf.len() * 2).max(16);
            buf.resize(grown, 0);
        }
        buf[len] = v;
        buf[len + 1] = f;
        self.len.store(len + 2, Ordering::Release);
    }

    /// Publishes a compacted length after an in-place sweep.
    fn set_len_release(&self, len: usize) {
        self.len.store(len, Ordering::Release);
    }
}

// ============================================================================
// Registration
// ============================================================================

fn add_tagged(th: &Thread, obj: *mut u8, fin: usize, tag: usize) {
    debug_assert_eq!(obj as usize & FIN_TAG_MASK, 0);
    th.ptls().finalizers.push_pair(obj as usize | tag, fin);
}

/// Registers a managed finalizer object for `obj`.
pub fn add_finalizer(th: &Thread, obj: *mut u8, fin: *mut u8) {
    add_tagged(th, obj, fin as usize, 0);
}

/// Registers a native finalizer function for `obj` (tag bit 0).
pub fn add_ptr_finalizer(th: &Thread, obj: *mut u8, fin: NativeFinalizer) {
    add_tagged(th, obj, fin as usize, FIN_TAG_PTR);
}

/// Registers a native finalizer that fires at the next quiescent point
/// regardless of reachability (both tag bits).
pub fn add_quiescent(th: &Thread, obj: *mut u8, fin: NativeFinalizer) {
    add_tagged(th, obj, fin as usize, FIN_TAG_PTR | FIN_TAG_FREED);
}

/// Installs the runtime's managed-finalizer invoker.
pub fn set_managed_invoker(invoker: ManagedInvoker) {
    MANAGED_INVOKER.store(invoker as usize, Ordering::Release);
}

static MANAGED_INVOKER: AtomicUsize = AtomicUsize::new(0);

// ============================================================================
// Execution
// ============================================================================

fn run_finalizer(v: usize, f: usize) {
    let obj = fin_obj(v);
    let result = if fin_tag(v) & FIN_TAG_PTR != 0 {
        // SAFETY: tag bit 0 promises a NativeFinalizer in the slot.
        let func: NativeFinalizer = unsafe { std::mem::transmute::<usize, NativeFinalizer>(f) };
        catch_unwind(AssertUnwindSafe(|| unsafe { func(obj) }))
    } else {
        let invoker = MANAGED_INVOKER.load(Ordering::Acquire);
        if invoker == 0 {
            eprintln!("veld-gc: no managed finalizer invoker installed; dropping finalizer");
            return;
        }
        // SAFETY: set_managed_invoker stored a ManagedInvoker.
        let invoker: ManagedInvoker = unsafe { std::mem::transmute::<usize, ManagedInvoker>(invoker) };
        catch_unwind(AssertUnwindSafe(|| invoker(f as *mut u8, obj)))
    };
    if let Err(err) = result {
        let msg = err
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| err.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        eprintln!("error in running finalizer: {msg}");
    }
}

/// Runs the pairs of `list` in reverse order of registration, so
/// lower-level finalizers run last.
fn run_finalizer_list(list: &[usize]) {
    let mut i = list.len();
    while i >= 2 {
        i -= 2;
        let v = list[i];
        if v == 0 {
            continue;
        }
        run_finalizer(v, list[i + 1]);
    }
}

fn run_finalizers(th: &Thread) {
    let collector = Collector::global();
    let list = {
        let mut g = collector.finalizers.lock();
        if g.to_finalize.is_empty() {
            return;
        }
        collector.have_pending_finalizers.store(false, Ordering::Relaxed);
        std::mem::take(&mut g.to_finalize)
    };
    let ptls = th.ptls();
    let was_in_finalizer = ptls.in_finalizer;
    ptls.in_finalizer = true;
    run_finalizer_list(&list);
    th.ptls().in_finalizer = was_in_finalizer;
}

/// Runs scheduled finalizers unless the thread currently inhibits them
/// (inside a finalizer, holding a runtime lock, or explicitly disabled).
pub fn run_pending_finalizers(th: &Thread) {
    let ptls = th.ptls();
    if !ptls.in_finalizer && ptls.held_locks == 0 && ptls.finalizers_inhibited == 0 {
        run_finalizers(th);
    }
}

/// Whether finalizers are scheduled and waiting for a quiescent point.
pub fn have_pending_finalizers() -> bool {
    Collector::global()
        .have_pending_finalizers
        .load(Ordering::Relaxed)
}

/// Adjusts the calling thread's finalizer inhibition counter. `enable =
/// false` increments it; `enable = true` decrements it and runs anything
/// that became runnable. Over-enabling prints a one-shot warning and
/// leaves the counter unchanged.
pub fn enable_finalizers(th: &Thread, enable: bool) {
    let ptls = th.ptls();
    let new_val = ptls.finalizers_inhibited + if enable { -1 } else { 1 };
    if new_val < 0 {
        static WARNED: AtomicBool = AtomicBool::new(false);
        if !WARNED.swap(true, Ordering::Relaxed) {
            eprintln!("WARNING: GC finalizers already enabled on this thread.");
        }
        return;
    }
    ptls.finalizers_inhibited = new_val;
    if new_val == 0 && have_pending_finalizers() {
        run_pending_finalizers(th);
    }
}

// ============================================================================
// Explicit finalization
// ============================================================================

/// Extracts every pair registered for `o` from `slots[..len]` into
/// `copied`, compacting the list in place. Returns the new length.
fn extract_object(slots: &mut [usize], len: usize, o: *mut u8, copied: &mut Vec<usize>) -> usize {
    let mut j = 0;
    for i in (0..len).step_by(2) {
        let v = slots[i];
        let matches = !fin_obj(v).is_null() && fin_obj(v) == o;
        if matches {
            copied.push(v);
            copied.push(slots[i + 1]);
        }
        if matches || v == 0 {
            continue;
        }
        if j < i {
            slots[j] = slots[i];
            slots[j + 1] = slots[i + 1];
        }
        j += 2;
    }
    // Zero the vacated tail before publishing the shorter length, so a
    // racing owner append never exposes stale pairs.
    for slot in &mut slots[j..len] {
        *slot = 0;
    }
    j
}

/// Runs every finalizer registered for `obj`, removing the entries from
/// all threads' lists and the survivor list.
pub fn finalize(th: &Thread, obj: *mut u8) {
    let collector = Collector::global();
    let mut copied: Vec<usize> = Vec::new();
    {
        let mut g = collector.finalizers.lock();
        for tcb in crate::thread::all_threads() {
            // SAFETY: list growth requires the lock we hold; the prefix up
            // to the acquired length is stable.
            let list = unsafe { &tcb.ptls().finalizers };
            let len = list.len_acquire();
            let slots = unsafe { list.slots() };
            if len == 0 {
                continue;
            }
            let newlen = extract_object(slots, len, obj, &mut copied);
            if newlen != len {
                // The owner may have appended past `len`; only shrink if
                // the length is still what we saw.
                let _ = list.len.compare_exchange(
                    len,
                    newlen,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
            }
        }
        let marked_len = g.marked.len();
        let newlen = extract_object(&mut g.marked, marked_len, obj, &mut copied);
        g.marked.truncate(newlen);
    }
    if copied.is_empty() {
        return;
    }
    let ptls = th.ptls();
    let was_in_finalizer = ptls.in_finalizer;
    ptls.in_finalizer = true;
    run_finalizer_list(&copied);
    th.ptls().in_finalizer = was_in_finalizer;
}

/// Schedules every registered finalizer and runs them; used at runtime
/// shutdown.
pub fn run_all_finalizers(th: &Thread) {
    let collector = Collector::global();
    {
        let mut g = collector.finalizers.lock();
        let marked = std::mem::take(&mut g.marked);
        schedule_list(&mut g, &marked);
        for tcb in crate::thread::all_threads() {
            // SAFETY: we hold the finalizer lock; shutdown implies no
            // concurrent registration.
            let list = unsafe { &tcb.ptls().finalizers };
            let len = list.len_acquire();
            let pairs: Vec<usize> = unsafe { list.slots() }[..len].to_vec();
            schedule_list(&mut g, &pairs);
            (unsafe { list.slots() })[..len].fill(0);
            list.set_len_release(0);
        }
    }
    run_finalizers(th);
}

fn schedule_list(g: &mut GlobalFinalizers, pairs: &[usize]) {
    for pair in pairs.chunks_exact(2) {
        if pair[0] != 0 {
            g.to_finalize.push(pair[0]);
            g.to_finalize.push(pair[1]);
        }
    }
    if !g.to_finalize.is_empty() {
        Collector::global()
            .have_pending_finalizers
            .store(true, Ordering::Relaxed);
    }
}

// ============================================================================
// Post-mark sweep
// ============================================================================

/// Global finalizer bookkeeping, guarded by the finalizer lock.
pub(crate) struct GlobalFinalizers {
    /// Pairs scheduled for execution at the next quiescent point.
    pub to_finalize: Vec<usize>,
    /// Pairs whose object survived and is old; scanned as roots so a
    /// finalizer keeps its object alive.
    pub marked: Vec<usize>,
}

impl GlobalFinalizers {
    pub(crate) const fn new() -> GlobalFinalizers {
        GlobalFinalizers {
            to_finalize: Vec::new(),
            marked: Vec::new(),
        }
    }
}

/// Sweeps one thread's finalizer list after marking: unreachable entries
/// move to `to_finalize`; old surviving pairs migrate to the survivor
/// list. Runs with the world stopped.
pub(crate) unsafe fn sweep_finalizer_list(list: &FinList, g: &mut GlobalFinalizers) {
    // SAFETY: stop-the-world window.
    let slots = unsafe { list.slots() };
    let len = list.len_acquire();
    let mut j = 0;
    for i in (0..len).step_by(2) {
        let v0 = slots[i];
        if v0 == 0 {
            continue;
        }
        let fin = slots[i + 1];
        let (is_freed, is_old);
        if fin_tag(v0) & FIN_TAG_FREED != 0 {
            is_freed = true;
            is_old = false;
        } else {
            let obj = fin_obj(v0);
            // SAFETY: registered objects are managed cells.
            let bits = unsafe { (*CellHeader::of(obj)).bits() };
            is_freed = !gc_marked(bits);
            is_old = bits == GC_OLD_MARKED
                && (fin_tag(v0) & FIN_TAG_PTR != 0 || unsafe {
                    (*CellHeader::of(fin as *mut u8)).bits() == GC_OLD_MARKED
                });
        }
        if !(is_freed || is_old) {
            if j < i {
                slots[j] = slots[i];
                slots[j + 1] = slots[i + 1];
            }
            j += 2;
        }
        if is_freed {
            g.to_finalize.push(v0);
            g.to_finalize.push(fin);
        }
        if is_old {
            // Callers rely on new entries landing at the end of the
            // survivor list.
            g.marked.push(v0);
            g.marked.push(fin);
        }
    }
    for slot in &mut slots[j..len] {
        *slot = 0;
    }
    list.set_len_release(j);
    if !g.to_finalize.is_empty() {
        Collector::global()
            .have_pending_finalizers
            .store(true, Ordering::Relaxed);
    }
}

/// Sweeps the survivor list itself (only on the cycle after a full sweep,
/// when its entries' marks are meaningful again).
pub(crate) unsafe fn sweep_marked_list(g: &mut GlobalFinalizers) {
    let marked = std::mem::take(&mut g.marked);
    let mut kept = Vec::with_capacity(marked.len());
    for pair in marked.chunks_exact(2) {
        let v0 = pair[0];
        if v0 == 0 {
            continue;
        }
        let fin = pair[1];
        let is_freed = if fin_tag(v0) & FIN_TAG_FREED != 0 {
            true
        } else {
            // SAFETY: registered objects are managed cells.
            !gc_marked(unsafe { (*CellHeader::of(fin_obj(v0))).bits() })
        };
        if is_freed {
            g.to_finalize.push(v0);
            g.to_finalize.push(fin);
        } else {
            kept.push(v0);
            kept.push(fin);
        }
    }
    g.marked = kept;
    if !g.to_finalize.is_empty() {
        Collector::global()
            .have_pending_finalizers
            .store(true, Ordering::Relaxed);
    }
}
