//! Finalizer scheduling: reverse execution order, exactly-once runs,
//! inhibition, quiescent entries, and explicit finalization.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use common::{new_leaf, new_node};
use veld_gc::{
    add_ptr_finalizer, add_quiescent, collect, enable_finalizers, finalize, Collection, Thread,
};

static ORDER: Mutex<Vec<u8>> = Mutex::new(Vec::new());
static RUNS: AtomicUsize = AtomicUsize::new(0);
static QUIESCENT_RUNS: AtomicUsize = AtomicUsize::new(0);

unsafe fn fin_a(_obj: *mut u8) {
    ORDER.lock().unwrap().push(b'a');
    RUNS.fetch_add(1, Ordering::SeqCst);
}

unsafe fn fin_b(_obj: *mut u8) {
    ORDER.lock().unwrap().push(b'b');
    RUNS.fetch_add(1, Ordering::SeqCst);
}

unsafe fn fin_c(_obj: *mut u8) {
    ORDER.lock().unwrap().push(b'c');
    RUNS.fetch_add(1, Ordering::SeqCst);
}

unsafe fn fin_quiescent(_obj: *mut u8) {
    QUIESCENT_RUNS.fetch_add(1, Ordering::SeqCst);
}

unsafe fn fin_panicking(_obj: *mut u8) {
    RUNS.fetch_add(1, Ordering::SeqCst);
    panic!("finalizer failure is contained");
}

#[test]
fn finalizer_protocol() {
    let th = Thread::current();

    // --- Reverse execution order -------------------------------------
    let obj = new_leaf(&th);
    add_ptr_finalizer(&th, obj, fin_a);
    add_ptr_finalizer(&th, obj, fin_b);
    add_ptr_finalizer(&th, obj, fin_c);
    // No references left; the collection schedules all three and runs
    // them before returning.
    collect(&th, Collection::Full);
    assert_eq!(&*ORDER.lock().unwrap(), b"cba", "not reverse order");
    assert_eq!(RUNS.load(Ordering::SeqCst), 3);

    // A second collection must not run them again.
    collect(&th, Collection::Full);
    assert_eq!(RUNS.load(Ordering::SeqCst), 3);

    // --- Exactly once, even with resurrection-style graphs ------------
    RUNS.store(0, Ordering::SeqCst);
    let a = new_node(&th, std::ptr::null_mut(), std::ptr::null_mut(), 0);
    add_ptr_finalizer(&th, a, fin_a);
    collect(&th, Collection::Auto);
    collect(&th, Collection::Auto);
    assert_eq!(RUNS.load(Ordering::SeqCst), 1);

    // --- Inhibition ----------------------------------------------------
    RUNS.store(0, Ordering::SeqCst);
    ORDER.lock().unwrap().clear();
    let b = new_leaf(&th);
    add_ptr_finalizer(&th, b, fin_b);
    enable_finalizers(&th, false);
    collect(&th, Collection::Full);
    assert_eq!(
        RUNS.load(Ordering::SeqCst),
        0,
        "finalizer ran while inhibited"
    );
    enable_finalizers(&th, true);
    assert_eq!(RUNS.load(Ordering::SeqCst), 1, "pending finalizer not run");

    // Over-enabling warns once and leaves the counter alone.
    enable_finalizers(&th, true);
    enable_finalizers(&th, true);

    // --- Quiescent entries fire regardless of reachability -------------
    let rooted = new_leaf(&th);
    veld_gc::add_global_root(rooted);
    add_quiescent(&th, rooted, fin_quiescent);
    collect(&th, Collection::Auto);
    assert_eq!(
        QUIESCENT_RUNS.load(Ordering::SeqCst),
        1,
        "quiescent finalizer must fire even for live objects"
    );
    veld_gc::delete_global_root(rooted);

    // --- Explicit finalize runs and deregisters ------------------------
    RUNS.store(0, Ordering::SeqCst);
    let c = new_leaf(&th);
    veld_gc::add_global_root(c);
    add_ptr_finalizer(&th, c, fin_c);
    finalize(&th, c);
    assert_eq!(RUNS.load(Ordering::SeqCst), 1);
    // Entry was removed: dropping the object does not re-run it.
    veld_gc::delete_global_root(c);
    collect(&th, Collection::Full);
    assert_eq!(RUNS.load(Ordering::SeqCst), 1);

    // --- A panicking finalizer is contained ----------------------------
    RUNS.store(0, Ordering::SeqCst);
    let d = new_leaf(&th);
    let e = new_leaf(&th);
    add_ptr_finalizer(&th, d, fin_panicking);
    add_ptr_finalizer(&th, e, fin_a);
    collect(&th, Collection::Full);
    assert_eq!(
        RUNS.load(Ordering::SeqCst),
        2,
        "finalizers after a failing one must still run"
    );
}
