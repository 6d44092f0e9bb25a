//! Per-thread heap state and the stop-the-world protocol.
//!
//! Every mutator owns a [`Ptls`]: its size-class pools, big-object list,
//! remembered sets, finalizer list and mark cache. A [`ThreadControlBlock`]
//! wraps the `Ptls` with the coordination state the collector needs: the
//! `gc_state` flag, the stop request, and a condvar the thread parks on at
//! safepoints.
//!
//! The collector publishes "world is stopping" with release stores to each
//! thread's `gc_requested`; mutators acquire-load it on allocation slow
//! paths and explicit [`crate::safepoint`] calls, then park until resumed.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use crate::big::BigVal;
use crate::finalizer::FinList;
use crate::malloc_buf::MallocBuf;
use crate::mark::MarkCache;
use crate::pool::{GcPool, N_POOLS};

/// Mutator is executing.
pub const GC_STATE_RUNNING: u8 = 0;
/// Mutator is parked at a safepoint.
pub const GC_STATE_WAITING: u8 = 1;
/// Mutator is inside a GC-safe region (blocking call); the collector may
/// run without it parking.
pub const GC_STATE_SAFE: u8 = 2;

/// Per-thread allocation counters. `allocd` starts at `-interval` and
/// counts up; crossing zero is the collection trigger. The other counters
/// are owner-written and only read while the world is stopped.
pub struct ThreadGcNum {
    /// Bytes allocated since the counter was last re-armed, minus the
    /// collect interval.
    pub allocd: AtomicIsize,
    /// Pool allocations.
    pub poolalloc: u64,
    /// Big-object allocations.
    pub bigalloc: u64,
    /// Bytes of tracked malloc'd buffers.
    pub malloc: u64,
    /// Bytes freed on behalf of this thread over the process lifetime.
    pub freed: u64,
    /// Host `free` calls issued during sweeps of this thread's buffers,
    /// over the process lifetime.
    pub freecall: u64,
}

impl ThreadGcNum {
    fn new(interval: usize) -> Self {
        ThreadGcNum {
            allocd: AtomicIsize::new(-(interval as isize)),
            poolalloc: 0,
            bigalloc: 0,
            malloc: 0,
            freed: 0,
            freecall: 0,
        }
    }
}

/// Thread-local heap state.
pub struct Ptls {
    /// Registry index of this thread.
    pub tid: u16,
    /// One pool per size class.
    pub pools: [GcPool; N_POOLS],
    /// Head of the intrusive big-object list.
    pub big_objects: *mut BigVal,
    /// Tracked malloc-backed buffers.
    pub malloc_bufs: Vec<MallocBuf>,
    /// Weak-reference cells allocated by this thread.
    pub weak_refs: Vec<*mut u8>,
    /// Task cells registered for the stack sweep.
    pub live_tasks: Vec<*mut u8>,
    /// Objects with a foreign sweep hook.
    pub sweep_objs: Vec<*mut u8>,
    /// Old objects that acquired young children since the last collection.
    pub remset: Vec<*mut u8>,
    /// Frozen remset scanned as roots by the current collection.
    pub last_remset: Vec<*mut u8>,
    /// Remembered module bindings.
    pub rem_bindings: Vec<*mut u8>,
    /// Heuristic count of intergenerational pointers.
    pub remset_nptr: usize,
    /// Registered (object, finalizer) pairs.
    pub finalizers: FinList,
    /// Mark work stack and big-object notification buffer.
    pub mark_cache: MarkCache,
    /// Allocation counters.
    pub gc_num: ThreadGcNum,
    /// The thread's root task cell, or null.
    pub root_task: *mut u8,
    /// The currently running task cell, or null.
    pub current_task: *mut u8,
    /// The scheduler's next task cell, or null.
    pub next_task: *mut u8,
    /// The previously running task cell, or null.
    pub previous_task: *mut u8,
    /// Backtrace buffer; words use the exception-stack entry tagging.
    pub bt_buffer: Vec<usize>,
    /// The thread is currently running a finalizer.
    pub in_finalizer: bool,
    /// Finalizer inhibition counter; positive means inhibited.
    pub finalizers_inhibited: i32,
    /// Runtime locks currently held; finalizers do not run while nonzero.
    pub held_locks: u32,
}

impl Ptls {
    fn new(tid: u16, interval: usize) -> Self {
        Ptls {
            tid,
            pools: std::array::from_fn(|_| GcPool::new()),
            big_objects: std::ptr::null_mut(),
            malloc_bufs: Vec::new(),
            weak_refs: Vec::new(),
            live_tasks: Vec::new(),
            sweep_objs: Vec::new(),
            remset: Vec::new(),
            last_remset: Vec::new(),
            rem_bindings: Vec::new(),
            remset_nptr: 0,
            finalizers: FinList::new(),
            mark_cache: MarkCache::new(),
            gc_num: ThreadGcNum::new(interval),
            root_task: std::ptr::null_mut(),
            current_task: std::ptr::null_mut(),
            next_task: std::ptr::null_mut(),
            previous_task: std::ptr::null_mut(),
            bt_buffer: Vec::new(),
            in_finalizer: false,
            finalizers_inhibited: 0,
            held_locks: 0,
        }
    }
}

/// Coordination block shared between a mutator and the collector.
pub struct ThreadControlBlock {
    /// Registry index.
    pub index: u16,
    /// One of the `GC_STATE_*` values.
    pub gc_state: AtomicU8,
    /// Set by the collector to stop this thread.
    pub gc_requested: AtomicBool,
    park_lock: Mutex<()>,
    park_cond: Condvar,
    ptls: UnsafeCell<Ptls>,
}

// SAFETY: Ptls is only touched by its owner thread, or by the collector
// while the owner is stopped at a safepoint.
unsafe impl Send for ThreadControlBlock {}
unsafe impl Sync for ThreadControlBlock {}

impl ThreadControlBlock {
    /// The thread's heap state.
    ///
    /// # Safety
    ///
    /// Caller must be the owning thread, or the collector while the world
    /// is stopped.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn ptls(&self) -> &mut Ptls {
        unsafe { &mut *self.ptls.get() }
    }
}

// ============================================================================
// Registry
// ============================================================================

static REGISTRY: parking_lot::Mutex<Vec<Arc<ThreadControlBlock>>> =
    parking_lot::Mutex::new(Vec::new());

/// Collector election flag; also the "a collection is running" gate.
pub(crate) static GC_RUNNING: AtomicBool = AtomicBool::new(false);

static GC_DONE_LOCK: Mutex<()> = Mutex::new(());
static GC_DONE_CV: Condvar = Condvar::new();

/// Keeps the thread registered for its lifetime; on thread exit the
/// control block flips to the GC-safe state so the collector never waits
/// on a thread that no longer runs.
struct ThreadRegistration {
    tcb: Arc<ThreadControlBlock>,
}

impl Drop for ThreadRegistration {
    fn drop(&mut self) {
        self.tcb.gc_state.store(GC_STATE_SAFE, Ordering::Release);
    }
}

thread_local! {
    static CURRENT: UnsafeCell<Option<ThreadRegistration>> =
        const { UnsafeCell::new(None) };
}

/// Snapshot of every registered thread.
pub(crate) fn all_threads() -> Vec<Arc<ThreadControlBlock>> {
    REGISTRY.lock().clone()
}

fn attach_current() -> Arc<ThreadControlBlock> {
    // A thread attaching mid-collection would neither be stopped nor
    // swept consistently; wait the collection out first. Holding the
    // registry lock while checking pairs with the collector taking the
    // same lock for its snapshot after winning the election.
    let mut registry = loop {
        let registry = REGISTRY.lock();
        if !GC_RUNNING.load(Ordering::Acquire) {
            break registry;
        }
        drop(registry);
        wait_for_gc();
    };
    let index = registry.len() as u16;
    let interval = crate::collect::current_interval();
    let tcb = Arc::new(ThreadControlBlock {
        index,
        gc_state: AtomicU8::new(GC_STATE_RUNNING),
        gc_requested: AtomicBool::new(false),
        park_lock: Mutex::new(()),
        park_cond: Condvar::new(),
        ptls: UnsafeCell::new(Ptls::new(index, interval)),
    });
    registry.push(tcb.clone());
    tcb
}

/// Handle to a mutator thread's heap state; the first parameter of every
/// allocation entry point.
#[derive(Clone)]
pub struct Thread {
    pub(crate) tcb: Arc<ThreadControlBlock>,
}

impl Thread {
    /// The calling thread's handle, registering it on first use.
    pub fn current() -> Thread {
        CURRENT.with(|slot| {
            // SAFETY: thread-local slot, only touched from this thread.
            let slot = unsafe { &mut *slot.get() };
            let reg = slot.get_or_insert_with(|| ThreadRegistration {
                tcb: attach_current(),
            });
            Thread {
                tcb: reg.tcb.clone(),
            }
        })
    }

    /// Registry index of this thread.
    pub fn index(&self) -> u16 {
        self.tcb.index
    }

    /// The thread's heap state. Only valid from the owning thread (or the
    /// collector during a stop-the-world window).
    #[allow(clippy::mut_from_ref)]
    pub(crate) fn ptls(&self) -> &mut Ptls {
        // SAFETY: Thread handles are only used from their owning thread;
        // the collector uses TCB snapshots instead.
        unsafe { self.tcb.ptls() }
    }

    /// Polls for a pending collection and parks until it finishes.
    pub fn safepoint(&self) {
        check_safepoint(&self.tcb);
    }

    /// Enters a GC-safe region (e.g. a blocking syscall): the collector
    /// will not wait for this thread.
    pub fn gc_safe_enter(&self) {
        self.tcb.gc_state.store(GC_STATE_SAFE, Ordering::Release);
    }

    /// Leaves a GC-safe region, parking first if a collection is underway.
    pub fn gc_safe_leave(&self) {
        self.tcb.gc_state.store(GC_STATE_RUNNING, Ordering::Release);
        check_safepoint(&self.tcb);
    }

    /// Installs the task cells scanned as this thread's roots.
    pub fn set_tasks(
        &self,
        root: *mut u8,
        current: *mut u8,
        next: *mut u8,
        previous: *mut u8,
    ) {
        let ptls = self.ptls();
        ptls.root_task = root;
        ptls.current_task = current;
        ptls.next_task = next;
        ptls.previous_task = previous;
    }

    /// Registers a task cell for the stack sweep; dead tasks get their
    /// malloc-backed machine stacks released.
    pub fn register_task(&self, task: *mut u8) {
        self.ptls().live_tasks.push(task);
    }

    /// Notes that the runtime acquired an internal lock; finalizers are
    /// inhibited while any lock is held.
    pub fn lock_acquired(&self) {
        self.ptls().held_locks += 1;
    }

    /// Notes that the runtime released an internal lock.
    pub fn lock_released(&self) {
        let ptls = self.ptls();
        debug_assert!(ptls.held_locks > 0);
        ptls.held_locks -= 1;
    }
}

// ============================================================================
// Safepoints
// ============================================================================

/// Fast-path safepoint poll.
pub(crate) fn check_safepoint(tcb: &ThreadControlBlock) {
    if tcb.gc_requested.load(Ordering::Acquire) {
        park_at_safepoint(tcb);
    }
}

#[cold]
fn park_at_safepoint(tcb: &ThreadControlBlock) {
    let mut guard = tcb.park_lock.lock().unwrap_or_else(|e| e.into_inner());
    tcb.gc_state.store(GC_STATE_WAITING, Ordering::Release);
    while tcb.gc_requested.load(Ordering::Acquire) {
        guard = tcb
            .park_cond
            .wait(guard)
            .unwrap_or_else(|e| e.into_inner());
    }
    drop(guard);
    tcb.gc_state.store(GC_STATE_RUNNING, Ordering::Release);
}

/// Tries to become the collector. Returns `false` after waiting for the
/// concurrent collection to finish, in which case the caller must not
/// collect (at-most-one-collector).
pub(crate) fn try_start_gc(tcb: &ThreadControlBlock) -> (bool, u8) {
    let old_state = tcb.gc_state.swap(GC_STATE_WAITING, Ordering::Release);
    if GC_RUNNING
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
    {
        return (true, old_state);
    }
    // Lost the race: wait out the winner's collection.
    wait_for_gc();
    tcb.gc_state.store(old_state, Ordering::Release);
    // A stop request may have landed while we waited.
    check_safepoint(tcb);
    (false, old_state)
}

fn wait_for_gc() {
    let mut guard = GC_DONE_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    while GC_RUNNING.load(Ordering::Acquire) {
        guard = GC_DONE_CV.wait(guard).unwrap_or_else(|e| e.into_inner());
    }
}

/// Stops every other mutator: raises the stop request, then spin-waits
/// until each thread reports a non-running `gc_state`.
pub(crate) fn stop_the_world(collector: &ThreadControlBlock) -> Vec<Arc<ThreadControlBlock>> {
    let threads = all_threads();
    for tcb in &threads {
        if tcb.index != collector.index {
            tcb.gc_requested.store(true, Ordering::Release);
        }
    }
    std::sync::atomic::fence(Ordering::SeqCst);
    for tcb in &threads {
        if tcb.index == collector.index {
            continue;
        }
        while tcb.gc_state.load(Ordering::Acquire) == GC_STATE_RUNNING {
            std::hint::spin_loop();
        }
    }
    threads
}

/// Resumes every stopped mutator and releases the collector election.
pub(crate) fn resume_the_world(
    collector: &ThreadControlBlock,
    threads: &[Arc<ThreadControlBlock>],
    restore_state: u8,
) {
    for tcb in threads {
        if tcb.index == collector.index {
            continue;
        }
        let _guard = tcb.park_lock.lock().unwrap_or_else(|e| e.into_inner());
        tcb.gc_requested.store(false, Ordering::Release);
        tcb.park_cond.notify_all();
    }
    collector.gc_state.store(restore_state, Ordering::Release);
    GC_RUNNING.store(false, Ordering::Release);
    let _guard = GC_DONE_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    GC_DONE_CV.notify_all();
}
