//! Callback chains: idempotent registration, removal, and invocation
//! around collections, plus the enable gate and deferred accounting.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};

use common::new_leaf;
use veld_gc::{
    collect, enable, is_enabled, set_cb_post_gc, set_cb_pre_gc, set_cb_root_scanner, Collection,
    Thread,
};

static PRE: AtomicUsize = AtomicUsize::new(0);
static POST: AtomicUsize = AtomicUsize::new(0);
static ROOTS: AtomicUsize = AtomicUsize::new(0);

fn pre_gc(_full: bool) {
    PRE.fetch_add(1, Ordering::SeqCst);
}

fn post_gc(_full: bool) {
    POST.fetch_add(1, Ordering::SeqCst);
}

fn root_scanner(_full: bool) {
    ROOTS.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn callback_chains_and_enable_gate() {
    let th = Thread::current();

    // Registration is idempotent: three enables leave one registration.
    set_cb_pre_gc(pre_gc, true);
    set_cb_pre_gc(pre_gc, true);
    set_cb_pre_gc(pre_gc, true);
    set_cb_post_gc(post_gc, true);
    set_cb_root_scanner(root_scanner, true);

    collect(&th, Collection::Auto);
    assert_eq!(PRE.load(Ordering::SeqCst), 1, "pre-GC ran more than once");
    assert_eq!(POST.load(Ordering::SeqCst), 1);
    assert_eq!(ROOTS.load(Ordering::SeqCst), 1);

    // One disable removes the registration entirely.
    set_cb_pre_gc(pre_gc, false);
    collect(&th, Collection::Auto);
    assert_eq!(PRE.load(Ordering::SeqCst), 1, "removed callback still ran");
    assert_eq!(POST.load(Ordering::SeqCst), 2);

    // Removing again is a harmless no-op.
    set_cb_pre_gc(pre_gc, false);

    // The enable gate: while disabled, collect() accumulates the budget
    // and performs no collection (no callbacks fire).
    assert!(is_enabled());
    let was_enabled = enable(false);
    assert!(was_enabled);
    assert!(!is_enabled());
    for _ in 0..1000 {
        let _ = new_leaf(&th);
    }
    collect(&th, Collection::Auto);
    assert_eq!(POST.load(Ordering::SeqCst), 2, "collected while disabled");

    let was_enabled = enable(true);
    assert!(!was_enabled);
    assert!(is_enabled());
    collect(&th, Collection::Auto);
    assert_eq!(POST.load(Ordering::SeqCst), 3);

    set_cb_post_gc(post_gc, false);
    set_cb_root_scanner(root_scanner, false);
}
