//! Generational sweep.
//!
//! Sweep order: weak references, task stacks, foreign-swept objects,
//! malloc-backed buffers, big objects, pool pages. A quick sweep leaves
//! `OLD_MARKED` objects untouched (the old generation stays black); a full
//! sweep demotes them to `OLD` so the next mark retraces everything.
//!
//! Pool pages use three paths: pages with no marked cell are released (or
//! retained empty while under the quick-sweep quota); quick sweeps skip
//! pages with no young survivors whose old count matches the last full
//! sweep, rewiring their recorded freelist without touching cells; every
//! other page is walked cell by cell, rebuilding its freelist and applying
//! the age-based promotion rules.

use std::sync::Arc;

use crate::big::{big_free, BigVal, PROMOTE_AGE};
use crate::collect::Collector;
use crate::page::{PageMeta, FL_NONE, PAGE_OFFSET, PAGE_SZ};
use crate::pool::{reset_page, FreeCell, N_POOLS};
use crate::rt::TaskRepr;
use crate::tag::{gc_marked, CellHeader, TypeDescriptor, TypeLayout, GC_CLEAN, GC_MARKED, GC_OLD, GC_OLD_MARKED};
use crate::thread::ThreadControlBlock;

/// Byte and object counts accumulated by one sweep.
#[derive(Default)]
pub(crate) struct SweepStats {
    /// Net bytes freed (may go negative when stale page counts correct).
    pub freed: i64,
    /// Pages released to the page allocator.
    pub pages_freed: usize,
    /// Pages retained empty for reuse.
    pub pages_retained: usize,
    /// Big objects freed.
    pub big_freed: usize,
}

// ============================================================================
// Weak references
// ============================================================================

/// Clears the target slot of every weak reference whose target is
/// unmarked, pointing it at the nothing sentinel.
pub(crate) unsafe fn clear_weak_refs(threads: &[Arc<ThreadControlBlock>], nothing: *mut u8) {
    for tcb in threads {
        // SAFETY: stopped world.
        let ptls = unsafe { tcb.ptls() };
        for &wr in &ptls.weak_refs {
            // SAFETY: weak-ref cells hold one managed slot.
            unsafe {
                let slot = wr.cast::<*mut u8>();
                let value = *slot;
                if !value.is_null() && !gc_marked((*CellHeader::of(value)).bits()) {
                    *slot = nothing;
                }
            }
        }
    }
}

/// Drops dead weak-reference cells from each thread's list.
pub(crate) unsafe fn sweep_weak_refs(threads: &[Arc<ThreadControlBlock>]) {
    for tcb in threads {
        // SAFETY: stopped world.
        let ptls = unsafe { tcb.ptls() };
        ptls.weak_refs
            .retain(|&wr| unsafe { gc_marked((*CellHeader::of(wr)).bits()) });
    }
}

// ============================================================================
// Stacks and foreign objects
// ============================================================================

/// Drops dead tasks from the per-thread task lists, releasing their
/// malloc-backed machine stacks.
pub(crate) unsafe fn sweep_stacks(threads: &[Arc<ThreadControlBlock>]) {
    for tcb in threads {
        // SAFETY: stopped world.
        let ptls = unsafe { tcb.ptls() };
        ptls.live_tasks.retain(|&task| {
            // SAFETY: registered tasks are managed cells.
            if unsafe { gc_marked((*CellHeader::of(task)).bits()) } {
                true
            } else {
                // SAFETY: Task layout; dead task's machine stack goes back
                // to the host allocator.
                unsafe {
                    let repr = &mut *task.cast::<TaskRepr>();
                    if !repr.stkbuf.is_null() {
                        libc::free(repr.stkbuf.cast());
                        repr.stkbuf = std::ptr::null_mut();
                    }
                }
                false
            }
        });
    }
}

/// Runs the foreign sweep hook of every dead object on the per-thread
/// foreign-sweep lists.
pub(crate) unsafe fn sweep_foreign_objs(threads: &[Arc<ThreadControlBlock>]) {
    for tcb in threads {
        // SAFETY: stopped world.
        let ptls = unsafe { tcb.ptls() };
        ptls.sweep_objs.retain(|&obj| {
            // SAFETY: registered objects are managed cells.
            unsafe {
                if gc_marked((*CellHeader::of(obj)).bits()) {
                    true
                } else {
                    let ty = &*TypeDescriptor::of(obj);
                    if let TypeLayout::Foreign {
                        sweep: Some(sweep), ..
                    } = ty.layout
                    {
                        sweep(obj);
                    }
                    false
                }
            }
        });
    }
}

// ============================================================================
// Big objects
// ============================================================================

unsafe fn sweep_big_list(
    mut pv: *mut *mut BigVal,
    sweep_full: bool,
    stats: &mut SweepStats,
) -> *mut *mut BigVal {
    unsafe {
        let mut v = *pv;
        while !v.is_null() {
            let nxt = (*v).next;
            let bits = (*v).header.bits();
            if gc_marked(bits) {
                pv = std::ptr::addr_of_mut!((*v).next);
                let age = (*v).age;
                if age >= PROMOTE_AGE || bits == GC_OLD_MARKED {
                    if sweep_full || bits == GC_MARKED {
                        (*v).header.set_bits(GC_OLD);
                    }
                } else {
                    (*v).age = (age + 1).min(PROMOTE_AGE);
                    (*v).header.set_bits(GC_CLEAN);
                }
            } else {
                *pv = nxt;
                if !nxt.is_null() {
                    (*nxt).prev = pv;
                }
                stats.freed += (*v).sz as i64;
                stats.big_freed += 1;
                big_free(v);
            }
            v = nxt;
        }
        pv
    }
}

/// Sweeps every thread's big-object list. On a full sweep, the global
/// survivor list (`big_objects_marked`) is swept too and its remainder is
/// merged into the collector thread's list; the collector thread is the
/// one that won the start-GC election, and the merge happens while the
/// world is stopped.
pub(crate) unsafe fn sweep_big(
    collector: &Collector,
    threads: &[Arc<ThreadControlBlock>],
    collector_index: u16,
    sweep_full: bool,
    stats: &mut SweepStats,
) {
    for tcb in threads {
        // SAFETY: stopped world.
        let head = unsafe { std::ptr::addr_of_mut!(tcb.ptls().big_objects) };
        unsafe { sweep_big_list(head, sweep_full, stats) };
    }
    if sweep_full {
        let mut survivors = collector.big_objects_marked.lock();
        let head: *mut *mut BigVal = &mut survivors.0;
        let last_next = unsafe { sweep_big_list(head, sweep_full, stats) };
        let remaining = survivors.0;
        if !remaining.is_null() {
            let target = threads
                .iter()
                .find(|tcb| tcb.index == collector_index)
                .expect("collector thread in snapshot");
            // SAFETY: stopped world; splice the survivor list in front of
            // the collector thread's list.
            unsafe {
                let ptls = target.ptls();
                *last_next = ptls.big_objects;
                if !ptls.big_objects.is_null() {
                    (*ptls.big_objects).prev = last_next;
                }
                ptls.big_objects = remaining;
                (*remaining).prev = std::ptr::addr_of_mut!(ptls.big_objects);
            }
            survivors.0 = std::ptr::null_mut();
        }
    }
}

// ============================================================================
// Pool pages
// ============================================================================

fn page_cell_count(osize: usize) -> usize {
    (PAGE_SZ - PAGE_OFFSET) / osize
}

/// Re-counts the free cells of the page currently at the head of a pool's
/// freelist by walking its freelist segment.
unsafe fn sync_nfree(meta: *mut PageMeta, last: *mut FreeCell) {
    unsafe {
        debug_assert!((*meta).fl_begin_offset != FL_NONE);
        let page = (*meta).data as usize;
        let fl_beg = (page + (*meta).fl_begin_offset as usize) as *mut FreeCell;
        if last == fl_beg {
            return;
        }
        let mut nfree = 0;
        let mut cur = last;
        while crate::page::page_of(cur as usize) == page {
            nfree += 1;
            cur = (*cur).next;
            if cur.is_null() {
                break;
            }
        }
        (*meta).nfree = nfree;
    }
}

/// Sweeps one pool page. `pfl` is the current tail slot of the
/// (thread, size-class) freelist being rebuilt; returns the new tail.
#[allow(clippy::too_many_arguments)]
unsafe fn sweep_page(
    collector: &Collector,
    pool_newpages: *mut *mut FreeCell,
    meta: *mut PageMeta,
    mut pfl: *mut *mut FreeCell,
    sweep_full: bool,
    prev_sweep_full: bool,
    lazy_freed_pages: &mut usize,
    stats: &mut SweepStats,
) -> *mut *mut FreeCell {
    unsafe {
        let meta_ref = &mut *meta;
        let data = meta_ref.data;
        let osize = meta_ref.osize as usize;
        let old_nfree = meta_ref.nfree as usize;

        if !meta_ref.has_marked {
            // No survivors at all. Under the quick-sweep quota, keep the
            // page mapped and hand it back to the pool's fresh list;
            // otherwise release it.
            let quota = crate::collect::DEFAULT_COLLECT_INTERVAL / PAGE_SZ;
            if !sweep_full && *lazy_freed_pages <= quota {
                let pool_n = meta_ref.pool_n;
                let begin = reset_page(pool_n, osize as u16, meta, *pool_newpages);
                *pool_newpages = begin;
                (*begin).next = std::ptr::null_mut();
                *lazy_freed_pages += 1;
                stats.pages_retained += 1;
            } else {
                collector.page_alloc.free_page(meta);
                stats.pages_freed += 1;
            }
            let nfree = page_cell_count(osize);
            stats.freed += ((nfree - old_nfree) * osize) as i64;
            return pfl;
        }

        if !sweep_full && !meta_ref.has_young {
            debug_assert!(!prev_sweep_full || meta_ref.prev_nold >= meta_ref.nold);
            if !prev_sweep_full || meta_ref.prev_nold == meta_ref.nold {
                // Quick sweep, no young cells, same old population as the
                // last full sweep: splice the recorded freelist without
                // walking the cells.
                if meta_ref.fl_begin_offset != FL_NONE {
                    *pfl = (data.add(meta_ref.fl_begin_offset as usize)).cast();
                    pfl = (data.add(meta_ref.fl_end_offset as usize)).cast();
                }
                return pfl;
            }
        }

        // Full walk in address order.
        let mut has_marked = false;
        let mut has_young = false;
        let mut prev_nold: u16 = 0;
        let mut pg_nfree: usize = 0;
        let mut pfl_begin: *mut *mut FreeCell = std::ptr::null_mut();
        let mut v = data.add(PAGE_OFFSET);
        let lim = data.add(PAGE_SZ - osize);
        let mut idx = 0usize;
        while v <= lim {
            let header = &*v.cast::<CellHeader>();
            let mut bits = header.bits();
            if !gc_marked(bits) {
                *pfl = v.cast();
                pfl = v.cast::<*mut FreeCell>();
                if pfl_begin.is_null() {
                    pfl_begin = pfl;
                }
                pg_nfree += 1;
                meta_ref.clear_age_bit(idx);
            } else {
                if meta_ref.age_bit(idx) || bits == GC_OLD_MARKED {
                    // Old enough: promote (full sweeps also demote
                    // OLD_MARKED survivors back to OLD for retracing).
                    if sweep_full || bits == GC_MARKED {
                        bits = GC_OLD;
                        header.set_bits(bits);
                    }
                    prev_nold += 1;
                } else {
                    debug_assert_eq!(bits, GC_MARKED);
                    bits = GC_CLEAN;
                    header.set_bits(bits);
                    has_young = true;
                }
                has_marked |= gc_marked(bits);
                meta_ref.ages[idx / 8] |= 1 << (idx % 8);
            }
            v = v.add(osize);
            idx += 1;
        }

        meta_ref.has_marked = has_marked;
        meta_ref.has_young = has_young;
        if !pfl_begin.is_null() {
            meta_ref.fl_begin_offset = (pfl_begin as usize - data as usize) as u16;
            meta_ref.fl_end_offset = (pfl as usize - data as usize) as u16;
        } else {
            meta_ref.fl_begin_offset = FL_NONE;
            meta_ref.fl_end_offset = FL_NONE;
        }
        meta_ref.nfree = pg_nfree as u16;
        if sweep_full {
            meta_ref.nold = 0;
            meta_ref.prev_nold = prev_nold;
        }
        stats.freed += (pg_nfree as i64 - old_nfree as i64) * osize as i64;
        pfl
    }
}

/// Sweeps every pool page of every thread, rebuilding the per-pool
/// freelists in address order.
pub(crate) unsafe fn sweep_pools(
    collector: &Collector,
    threads: &[Arc<ThreadControlBlock>],
    sweep_full: bool,
    prev_sweep_full: bool,
    stats: &mut SweepStats,
) {
    let n_threads = threads.len();
    let mut pfl: Vec<*mut *mut FreeCell> = vec![std::ptr::null_mut(); n_threads * N_POOLS];
    let mut newpages: Vec<*mut *mut FreeCell> = vec![std::ptr::null_mut(); n_threads * N_POOLS];

    // Refresh the metadata of the pages currently targeted by a freelist
    // or bump cursor, then detach the pools for rebuilding.
    for tcb in threads {
        // SAFETY: stopped world.
        let ptls = unsafe { tcb.ptls() };
        let t_i = ptls.tid as usize;
        for (i, pool) in ptls.pools.iter_mut().enumerate() {
            let last = pool.freelist;
            if !last.is_null() {
                let meta = collector
                    .page_alloc
                    .meta_of(last as usize)
                    .expect("freelist head outside any page");
                unsafe {
                    sync_nfree(meta, last);
                    (*meta).has_young = true;
                }
                pool.freelist = std::ptr::null_mut();
            }
            pfl[t_i * N_POOLS + i] = std::ptr::addr_of_mut!(pool.freelist);

            let last = pool.newpages;
            if !last.is_null() {
                let meta = collector
                    .page_alloc
                    .meta_of(last as usize - 1)
                    .expect("bump cursor outside any page");
                unsafe {
                    let used = last as usize - crate::page::page_of(last as usize - 1);
                    (*meta).nfree = ((PAGE_SZ - used) / (*meta).osize as usize) as u16;
                    (*meta).has_young = true;
                }
                pool.newpages = std::ptr::null_mut();
            }
            newpages[t_i * N_POOLS + i] = std::ptr::addr_of_mut!(pool.newpages);
        }
    }

    let mut lazy_freed_pages = 0usize;
    collector.page_alloc.table.each_allocated(|meta| {
        // SAFETY: stopped world; meta belongs to an allocated page.
        unsafe {
            let t_i = (*meta).thread_n as usize;
            let p_i = (*meta).pool_n as usize;
            let slot = t_i * N_POOLS + p_i;
            pfl[slot] = sweep_page(
                collector,
                newpages[slot],
                meta,
                pfl[slot],
                sweep_full,
                prev_sweep_full,
                &mut lazy_freed_pages,
                stats,
            );
        }
    });

    // Null out the terminal pointers of the rebuilt freelists.
    for tail in pfl {
        if !tail.is_null() {
            unsafe { *tail = std::ptr::null_mut() };
        }
    }
}
