//! Collection driver and heuristics.
//!
//! One [`Collector`] exists per process. A mutator whose allocation budget
//! is spent (or an explicit [`collect`] call) races to become the sole
//! collector; losers park until the winner finishes. The winner stops the
//! world, drains per-thread caches, marks from the roots, runs the
//! post-mark weak-reference and finalizer logic, sweeps, retunes the
//! collect interval, restarts the world and finally drains the pending
//! finalizer queue.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicPtr, AtomicU32, AtomicUsize, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::barrier::premark;
use crate::big::BigVal;
use crate::callbacks::Callbacks;
use crate::finalizer::{
    run_pending_finalizers, sweep_finalizer_list, sweep_marked_list, GlobalFinalizers,
};
use crate::mark::Marker;
use crate::metrics::{record_metrics, CollectionKind, GcMetrics};
use crate::page::PageAlloc;
use crate::perm::PermPool;
use crate::rt::NOTHING_TYPE;
use crate::sweep::{
    clear_weak_refs, sweep_big, sweep_foreign_objs, sweep_pools, sweep_stacks, sweep_weak_refs,
    SweepStats,
};
use crate::tag::{CellHeader, GC_MARKED, WORD};
use crate::thread::{resume_the_world, stop_the_world, try_start_gc, Ptls, Thread};

/// Which collection the caller wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Collection {
    /// Let the heuristics pick quick or full.
    Auto,
    /// Force a full sweep (scheduling a recollection if the previous
    /// sweep was quick).
    Full,
}

/// Allocation budget between automatic collections.
#[cfg(target_pointer_width = "64")]
pub(crate) const DEFAULT_COLLECT_INTERVAL: usize = 5600 * 1024 * WORD;
#[cfg(target_pointer_width = "32")]
pub(crate) const DEFAULT_COLLECT_INTERVAL: usize = 3200 * 1024 * WORD;

#[cfg(target_pointer_width = "64")]
const MAX_COLLECT_INTERVAL: usize = 1_250_000_000;
#[cfg(target_pointer_width = "32")]
const MAX_COLLECT_INTERVAL: usize = 500_000_000;

#[cfg(target_pointer_width = "64")]
const DEFAULT_MAX_TOTAL_MEMORY: usize = 2 << 40;
#[cfg(target_pointer_width = "32")]
const DEFAULT_MAX_TOTAL_MEMORY: usize = 2 << 30;

/// Global allocation and pause accounting, updated while the world is
/// stopped.
#[derive(Default)]
pub(crate) struct GcNum {
    pub allocd: i64,
    pub since_sweep: i64,
    pub freed: i64,
    pub total_allocd: i64,
    pub interval: usize,
    pub pause: u64,
    pub full_sweep: u64,
    pub total_time: Duration,
    pub max_pause: Duration,
}

struct DriverState {
    gc_num: GcNum,
    live_bytes: i64,
    last_live_bytes: i64,
    perm_scanned_bytes: i64,
    prev_sweep_full: bool,
    #[cfg(target_os = "linux")]
    last_trim_rss: i64,
}

/// Read-only snapshot of the global allocation and pause counters.
/// Between collections the values are approximate.
#[derive(Debug, Clone, Copy, Default)]
pub struct GcStats {
    /// Bytes allocated over the process lifetime, as of the last
    /// collection.
    pub total_allocd: i64,
    /// Live bytes after the last collection.
    pub live_bytes: i64,
    /// Collections performed.
    pub collections: u64,
    /// Full sweeps among them.
    pub full_sweeps: u64,
    /// Current collect interval in bytes.
    pub interval: usize,
    /// Total stop-the-world time.
    pub total_time: Duration,
    /// Longest single pause.
    pub max_pause: Duration,
    /// Allocation spent while the collector was disabled.
    pub deferred_alloc: i64,
    /// Pool allocations across all threads.
    pub pool_allocs: u64,
    /// Big-object allocations across all threads.
    pub big_allocs: u64,
    /// Bytes of tracked malloc'd buffers across all threads.
    pub malloc_bytes: u64,
    /// Bytes freed on behalf of mutators (malloc'd buffers, machine
    /// stacks) over the process lifetime.
    pub freed_bytes: u64,
    /// Host `free` calls issued by sweeps over the process lifetime.
    pub free_calls: u64,
}

/// Head of the global big-object survivor list.
pub(crate) struct BigListHead(pub *mut BigVal);

// SAFETY: access is serialized by the mutex around it.
unsafe impl Send for BigListHead {}

/// Process-wide collector state. Every entry point takes the global
/// instance; submodule state (page map, permanent region, survivor lists)
/// is owned here.
pub struct Collector {
    /// The arena-backed page allocator and address map.
    pub(crate) page_alloc: PageAlloc,
    /// The permanent bump region.
    pub(crate) perm: PermPool,
    /// Big objects observed old-marked during marking; merged back into
    /// the collector thread's list by the next full sweep. The lock is the
    /// mark-cache lock of the coordination protocol.
    pub(crate) big_objects_marked: Mutex<BigListHead>,
    /// Global finalizer bookkeeping behind the finalizer lock.
    pub(crate) finalizers: Mutex<GlobalFinalizers>,
    /// Finalizers are queued and waiting for a quiescent point.
    pub(crate) have_pending_finalizers: AtomicBool,
    /// Observer callback chains.
    pub(crate) callbacks: Callbacks,
    /// Registered always-reachable roots.
    pub(crate) global_roots: Mutex<Vec<usize>>,
    /// The root of the module tree, or null.
    pub(crate) root_module: AtomicPtr<u8>,
    nothing: AtomicPtr<u8>,
    disable_counter: AtomicU32,
    conservative: AtomicBool,
    max_total_memory: AtomicUsize,
    deferred_alloc: AtomicI64,
    interval: AtomicUsize,
    state: UnsafeCell<DriverState>,
}

// SAFETY: `state` is only touched by the thread holding the collector
// election; everything else is internally synchronized.
unsafe impl Sync for Collector {}
unsafe impl Send for Collector {}

static GLOBAL: OnceLock<Collector> = OnceLock::new();

impl Collector {
    /// The process-wide collector, initialized on first use.
    pub fn global() -> &'static Collector {
        GLOBAL.get_or_init(|| {
            let page_alloc = PageAlloc::new().expect("failed to reserve the GC heap arena");
            let perm = PermPool::new();
            let nothing = perm
                .alloc_cell(0, &NOTHING_TYPE)
                .expect("failed to allocate the nothing sentinel");
            let mut max_total = DEFAULT_MAX_TOTAL_MEMORY;
            if let Some(avail) = available_physical_memory() {
                max_total = max_total.min(avail / 10 * 7);
            }
            Collector {
                page_alloc,
                perm,
                big_objects_marked: Mutex::new(BigListHead(std::ptr::null_mut())),
                finalizers: Mutex::new(GlobalFinalizers::new()),
                have_pending_finalizers: AtomicBool::new(false),
                callbacks: Callbacks::new(),
                global_roots: Mutex::new(Vec::new()),
                root_module: AtomicPtr::new(std::ptr::null_mut()),
                nothing: AtomicPtr::new(nothing.as_ptr()),
                disable_counter: AtomicU32::new(0),
                conservative: AtomicBool::new(false),
                max_total_memory: AtomicUsize::new(max_total),
                deferred_alloc: AtomicI64::new(0),
                interval: AtomicUsize::new(DEFAULT_COLLECT_INTERVAL),
                state: UnsafeCell::new(DriverState {
                    gc_num: GcNum {
                        interval: DEFAULT_COLLECT_INTERVAL,
                        ..GcNum::default()
                    },
                    live_bytes: 0,
                    last_live_bytes: 0,
                    perm_scanned_bytes: 0,
                    // The first sweep behaves like the one after a full.
                    prev_sweep_full: true,
                    #[cfg(target_os = "linux")]
                    last_trim_rss: 0,
                }),
            }
        })
    }

    /// The runtime's `nothing` singleton; weak references point here after
    /// their target dies.
    pub fn nothing_value(&self) -> *mut u8 {
        self.nothing.load(Ordering::Relaxed)
    }

    /// Suggests the soft memory cap used to force full sweeps.
    pub fn set_max_memory(&self, bytes: usize) {
        self.max_total_memory.store(bytes, Ordering::Relaxed);
    }

    /// Toggles the global collection gate. Returns whether collection was
    /// enabled before the call.
    pub fn enable(&self, on: bool) -> bool {
        let prev = if on {
            let mut cur = self.disable_counter.load(Ordering::Acquire);
            loop {
                if cur == 0 {
                    break cur;
                }
                match self.disable_counter.compare_exchange(
                    cur,
                    cur - 1,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(prev) => break prev,
                    Err(now) => cur = now,
                }
            }
        } else {
            self.disable_counter.fetch_add(1, Ordering::AcqRel)
        };
        prev == 0
    }

    /// Whether collection is currently enabled.
    pub fn is_enabled(&self) -> bool {
        self.disable_counter.load(Ordering::Acquire) == 0
    }

    /// Idempotently enables conservative-marking support. The first call
    /// forces one full collection so the age bits accurately reflect
    /// liveness, which the interior-pointer resolver depends on.
    pub fn enable_conservative_gc_support(&self, th: &Thread) {
        if !self.conservative.swap(true, Ordering::AcqRel) {
            collect(th, Collection::Full);
        }
    }

    /// Whether conservative-marking support is on.
    pub fn conservative_gc_support_enabled(&self) -> bool {
        self.conservative.load(Ordering::Acquire)
    }

    /// Live bytes after the last collection (approximate between cycles).
    pub fn live_bytes(&self) -> i64 {
        // SAFETY: read-only snapshot; the field is word-sized.
        unsafe { (*self.state.get()).live_bytes }
    }

    /// Collections performed, quick and full.
    pub fn collection_counts(&self) -> (u64, u64) {
        // SAFETY: read-only snapshot.
        let state = unsafe { &*self.state.get() };
        (state.gc_num.pause, state.gc_num.full_sweep)
    }

    /// Snapshot of the global counters.
    pub fn stats(&self) -> GcStats {
        // SAFETY: read-only snapshot; torn reads between collections are
        // acceptable for diagnostics.
        let state = unsafe { &*self.state.get() };
        let mut stats = GcStats {
            total_allocd: state.gc_num.total_allocd,
            live_bytes: state.live_bytes,
            collections: state.gc_num.pause,
            full_sweeps: state.gc_num.full_sweep,
            interval: state.gc_num.interval,
            total_time: state.gc_num.total_time,
            max_pause: state.gc_num.max_pause,
            deferred_alloc: self.deferred_alloc.load(Ordering::Relaxed),
            ..GcStats::default()
        };
        for tcb in crate::thread::all_threads() {
            // SAFETY: owner-written counters; stale values are fine here.
            let ptls = unsafe { tcb.ptls() };
            stats.pool_allocs += ptls.gc_num.poolalloc;
            stats.big_allocs += ptls.gc_num.bigalloc;
            stats.malloc_bytes += ptls.gc_num.malloc;
            stats.freed_bytes += ptls.gc_num.freed;
            stats.free_calls += ptls.gc_num.freecall;
        }
        stats
    }
}

/// The collect interval newly attached threads arm their counter with.
pub(crate) fn current_interval() -> usize {
    match GLOBAL.get() {
        Some(c) => c.interval.load(Ordering::Relaxed),
        None => DEFAULT_COLLECT_INTERVAL,
    }
}

// ============================================================================
// Entry point
// ============================================================================

/// Performs a garbage collection, or waits for the one already running.
///
/// With the collector disabled, the thread's spent allocation budget is
/// folded into a deferred counter and no collection happens.
pub fn collect(th: &Thread, collection: Collection) {
    let collector = Collector::global();
    if collector.disable_counter.load(Ordering::Acquire) != 0 {
        let interval = collector.interval.load(Ordering::Relaxed) as i64;
        let local = th
            .ptls()
            .gc_num
            .allocd
            .swap(-(interval as isize), Ordering::Relaxed) as i64
            + interval;
        collector.deferred_alloc.fetch_add(local, Ordering::Relaxed);
        return;
    }

    let (won, old_state) = try_start_gc(&th.tcb);
    if !won {
        // Another thread collected on our behalf (at-most-one-collector).
        return;
    }

    #[cfg(feature = "tracing")]
    let _span = crate::tracing::internal::trace_gc_collection(
        collection == Collection::Full,
        crate::tracing::internal::next_gc_id(),
    );

    let pause_start = Instant::now();
    let threads = stop_the_world(&th.tcb);
    let time_to_safepoint = pause_start.elapsed();

    collector
        .callbacks
        .invoke_pre_gc(collection == Collection::Full);

    if collector.disable_counter.load(Ordering::Acquire) == 0 {
        let mut gfin = collector.finalizers.lock();
        // SAFETY: we hold the collector election and the world is stopped.
        unsafe {
            let recollect =
                collector.do_collect(th, &threads, collection, &mut gfin, time_to_safepoint);
            if recollect {
                collector.do_collect(th, &threads, Collection::Auto, &mut gfin, Duration::ZERO);
            }
        }
    }

    resume_the_world(&th.tcb, &threads, old_state);

    // Scheduled finalizers run outside the stop-the-world window, and only
    // if the caller is not already inside one.
    run_pending_finalizers(th);

    collector
        .callbacks
        .invoke_post_gc(collection == Collection::Full);
}

// ============================================================================
// The driver
// ============================================================================

impl Collector {
    unsafe fn do_collect(
        &self,
        th: &Thread,
        threads: &[std::sync::Arc<crate::thread::ThreadControlBlock>],
        collection: Collection,
        gfin: &mut GlobalFinalizers,
        time_to_safepoint: Duration,
    ) -> bool {
        // SAFETY: sole collector.
        let state = unsafe { &mut *self.state.get() };
        let interval = state.gc_num.interval;
        combine_thread_gc_counts(state, threads, interval, &self.deferred_alloc);

        let pause_start = Instant::now();
        let mark_start = Instant::now();

        #[cfg(feature = "tracing")]
        let mark_span = crate::tracing::internal::trace_phase(crate::tracing::internal::GcPhase::Mark);

        // 1. Fix the GC bits of remset entries and freeze the buffers.
        for tcb in threads {
            // SAFETY: stopped world.
            unsafe { premark(tcb.ptls()) };
        }

        let collector_ptls: *mut Ptls = th.ptls();
        let mut marker = Marker::new(self, collector_ptls);

        // 2. Per-thread roots: remsets, bindings, tasks, backtraces.
        for tcb in threads {
            // SAFETY: stopped world; the marker aliases only its own
            // mark-cache fields.
            let target: *mut Ptls = unsafe { tcb.ptls() };
            unsafe {
                marker.queue_remset(&mut *target);
                marker.queue_thread_local(&*target);
            }
        }

        // 3. Global roots, then drain.
        marker.queue_global_roots();
        marker.invoke_root_scanners(&self.callbacks, collection == Collection::Full);
        marker.mark_loop();

        state.gc_num.since_sweep += state.gc_num.allocd;
        let actual_allocd = state.gc_num.since_sweep;

        // 4. Weak references and finalizers.
        unsafe { clear_weak_refs(threads, self.nothing_value()) };
        let mut orig_marked_len = gfin.marked.len();
        for tcb in threads {
            // SAFETY: stopped world.
            unsafe { sweep_finalizer_list(&tcb.ptls().finalizers, gfin) };
        }
        if state.prev_sweep_full {
            unsafe { sweep_marked_list(gfin) };
            orig_marked_len = 0;
        }
        // A finalizer keeps its object alive for this cycle: scan the
        // surviving lists as roots.
        for tcb in threads {
            // SAFETY: stopped world; list mutation is done for this cycle.
            let list = unsafe { &tcb.ptls().finalizers };
            let len = list.len_acquire();
            let slots = unsafe { list.slots() };
            marker.queue_finlist(&slots[..len], 0);
        }
        marker.queue_finlist(&gfin.marked, orig_marked_len);
        marker.mark_loop();

        // Objects reachable only from `to_finalize` get their age reset so
        // the next cycle retraces them after the finalizers resurrect
        // them. Conservative marking needs stable age bits instead.
        marker.mark_reset_age = !self.conservative_gc_support_enabled();
        marker.queue_finlist(&gfin.to_finalize, 0);
        marker.mark_loop();
        marker.mark_reset_age = false;
        marker.sync_big_cache();

        #[cfg(feature = "tracing")]
        drop(mark_span);

        let mark_time = mark_start.elapsed();
        let cache = unsafe { &mut (*collector_ptls).mark_cache };
        let scanned_bytes = std::mem::take(&mut cache.scanned_bytes) as i64;
        state.perm_scanned_bytes += std::mem::take(&mut cache.perm_scanned_bytes) as i64;

        // 5. Next-cycle decision.
        let live_sz_ub = state.live_bytes + actual_allocd;
        let live_sz_est = scanned_bytes + state.perm_scanned_bytes;
        let estimate_freed = live_sz_ub - live_sz_est;
        let auto = collection == Collection::Auto;
        let not_freed_enough = auto && estimate_freed < 7 * (actual_allocd / 10);
        let remset_nptr: usize = threads
            .iter()
            // SAFETY: stopped world.
            .map(|tcb| unsafe { tcb.ptls() }.remset_nptr)
            .sum();
        // Many pointers in the intergenerational frontier means a quick
        // mark is not quick anymore.
        let large_frontier = remset_nptr * WORD >= DEFAULT_COLLECT_INTERVAL;
        let mut sweep_full = false;
        let mut recollect = false;

        if auto {
            if not_freed_enough {
                state.gc_num.interval *= 2;
            }
            if large_frontier {
                sweep_full = true;
            }
            let mut maxmem = 0;
            #[cfg(target_pointer_width = "64")]
            if let Some(total) = total_physical_memory() {
                maxmem = total / threads.len().max(1) / 2;
            }
            if maxmem < MAX_COLLECT_INTERVAL {
                maxmem = MAX_COLLECT_INTERVAL;
            }
            if state.gc_num.interval > maxmem {
                sweep_full = true;
                state.gc_num.interval = maxmem;
            }
        }
        if state.live_bytes > self.max_total_memory.load(Ordering::Relaxed) as i64 {
            sweep_full = true;
        }
        if collection == Collection::Full && !state.prev_sweep_full {
            sweep_full = true;
            recollect = true;
        }
        if sweep_full {
            state.perm_scanned_bytes = 0;
        }

        // 6. Sweep.
        let sweep_start = Instant::now();

        #[cfg(feature = "tracing")]
        let sweep_span =
            crate::tracing::internal::trace_phase(crate::tracing::internal::GcPhase::Sweep);

        let mut stats = SweepStats::default();
        unsafe {
            sweep_weak_refs(threads);
            sweep_stacks(threads);
            sweep_foreign_objs(threads);
            for tcb in threads {
                stats.freed += crate::malloc_buf::sweep_malloced_buffers(tcb.ptls()) as i64;
            }
            sweep_big(self, threads, th.index(), sweep_full, &mut stats);
            sweep_pools(self, threads, sweep_full, state.prev_sweep_full, &mut stats);
        }
        state.gc_num.freed += stats.freed;

        #[cfg(feature = "tracing")]
        drop(sweep_span);

        // 7. Quick sweeps put remembered objects back in the queued state
        // so the barrier does not fire on them again; full sweeps drop the
        // remembered sets entirely.
        for tcb in threads {
            // SAFETY: stopped world.
            let ptls = unsafe { tcb.ptls() };
            if !sweep_full {
                for &obj in &ptls.remset {
                    unsafe { (*CellHeader::of(obj)).set_bits(GC_MARKED) };
                }
                for &bnd in &ptls.rem_bindings {
                    unsafe { (*CellHeader::of(bnd)).set_bits(GC_MARKED) };
                }
            } else {
                ptls.remset.clear();
                ptls.rem_bindings.clear();
                ptls.remset_nptr = 0;
            }
        }

        #[cfg(target_os = "linux")]
        if sweep_full {
            // The malloc runaway empirically shows up within a 20-25%
            // growth gap over the last trim watermark.
            if let Some(rss) = resident_set_size() {
                if rss > state.last_trim_rss / 4 * 5 {
                    // SAFETY: plain libc call.
                    unsafe { libc::malloc_trim(0) };
                    state.last_trim_rss = rss;
                }
            }
        }

        let sweep_time = sweep_start.elapsed();
        let pause = time_to_safepoint + pause_start.elapsed();

        // 8. Counter rollover and interval tuning.
        state.gc_num.total_allocd += state.gc_num.since_sweep;
        state.gc_num.full_sweep += sweep_full as u64;
        state.gc_num.allocd = 0;
        state.last_live_bytes = state.live_bytes;
        state.live_bytes += state.gc_num.since_sweep - state.gc_num.freed;

        if auto {
            // Shrink toward half the live set, never below the default.
            let half = (state.live_bytes / 2).max(0) as usize;
            if state.gc_num.interval > half {
                state.gc_num.interval = half;
            }
            if state.gc_num.interval < DEFAULT_COLLECT_INTERVAL {
                state.gc_num.interval = DEFAULT_COLLECT_INTERVAL;
            }
        }
        let max_total = self.max_total_memory.load(Ordering::Relaxed) as i64;
        if state.gc_num.interval as i64 + state.live_bytes > max_total {
            if state.live_bytes < max_total {
                state.gc_num.interval = (max_total - state.live_bytes) as usize;
            } else {
                // Cannot stay under the goal; fall back to the minimum
                // interval and keep forcing full sweeps.
                state.gc_num.interval = DEFAULT_COLLECT_INTERVAL;
            }
        }

        state.prev_sweep_full = sweep_full;
        state.gc_num.pause += u64::from(!recollect);
        state.gc_num.total_time += pause;
        if pause > state.gc_num.max_pause {
            state.gc_num.max_pause = pause;
        }
        let freed_total = state.gc_num.freed;
        state.gc_num.since_sweep = 0;
        state.gc_num.freed = 0;

        reset_thread_gc_counts(threads, state.gc_num.interval);
        self.interval.store(state.gc_num.interval, Ordering::Relaxed);

        #[cfg(feature = "tracing")]
        crate::tracing::internal::log_collection_end(
            sweep_full,
            freed_total.max(0) as usize,
            state.live_bytes.max(0) as usize,
            pause.as_nanos() as u64,
        );

        record_metrics(GcMetrics {
            pause,
            mark_time,
            sweep_time,
            time_to_safepoint,
            bytes_freed: freed_total.max(0) as usize,
            live_bytes: state.live_bytes.max(0) as usize,
            pages_freed: stats.pages_freed + stats.pages_retained,
            big_objects_freed: stats.big_freed,
            kind: if sweep_full {
                CollectionKind::Full
            } else {
                CollectionKind::Quick
            },
            recollect,
            total_collections: 0,
        });

        recollect
    }
}

fn combine_thread_gc_counts(
    state: &mut DriverState,
    threads: &[std::sync::Arc<crate::thread::ThreadControlBlock>],
    interval: usize,
    deferred: &AtomicI64,
) {
    for tcb in threads {
        // SAFETY: stopped world.
        let ptls = unsafe { tcb.ptls() };
        state.gc_num.allocd +=
            ptls.gc_num.allocd.load(Ordering::Relaxed) as i64 + interval as i64;
    }
    state.gc_num.allocd += deferred.swap(0, Ordering::Relaxed);
}

fn reset_thread_gc_counts(
    threads: &[std::sync::Arc<crate::thread::ThreadControlBlock>],
    interval: usize,
) {
    for tcb in threads {
        // SAFETY: stopped world.
        let ptls = unsafe { tcb.ptls() };
        ptls.gc_num
            .allocd
            .store(-(interval as isize), Ordering::Relaxed);
    }
}

// ============================================================================
// Host memory probes
// ============================================================================

#[cfg(unix)]
fn total_physical_memory() -> Option<usize> {
    // SAFETY: plain sysconf calls.
    unsafe {
        let pages = libc::sysconf(libc::_SC_PHYS_PAGES);
        if pages <= 0 {
            return None;
        }
        Some(pages as usize * sys_alloc::page_size())
    }
}

#[cfg(not(unix))]
fn total_physical_memory() -> Option<usize> {
    None
}

#[cfg(target_os = "linux")]
fn available_physical_memory() -> Option<usize> {
    // SAFETY: plain sysconf calls.
    unsafe {
        let pages = libc::sysconf(libc::_SC_AVPHYS_PAGES);
        if pages <= 0 {
            return None;
        }
        Some(pages as usize * sys_alloc::page_size())
    }
}

#[cfg(not(target_os = "linux"))]
fn available_physical_memory() -> Option<usize> {
    total_physical_memory()
}

#[cfg(target_os = "linux")]
fn resident_set_size() -> Option<i64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let resident: i64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(resident * sys_alloc::page_size() as i64)
}
