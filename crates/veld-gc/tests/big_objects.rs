//! Big-object lifecycle: host-allocator notifications, survival,
//! promotion, and reclamation above the pool size classes.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};

use veld_gc::{
    alloc, collect, last_gc_metrics, set_cb_notify_external_alloc, set_cb_notify_external_free,
    Collection, Thread, TypeDescriptor, TypeLayout,
};

static BIG: TypeDescriptor = TypeDescriptor {
    name: "BigBlob",
    size: 64 * 1024,
    layout: TypeLayout::Opaque,
};

static ALLOCS: AtomicUsize = AtomicUsize::new(0);
static FREES: AtomicUsize = AtomicUsize::new(0);

fn on_alloc(_addr: *mut u8, _size: usize) {
    ALLOCS.fetch_add(1, Ordering::SeqCst);
}

fn on_free(_addr: *mut u8) {
    FREES.fetch_add(1, Ordering::SeqCst);
}

#[test]
fn big_objects_age_and_die() {
    let th = Thread::current();
    set_cb_notify_external_alloc(on_alloc, true);
    set_cb_notify_external_free(on_free, true);

    // Unreachable big objects die on the next sweep, with the free
    // notification fired.
    for i in 0..8 {
        let p = alloc(&th, BIG.size, &BIG).expect("big alloc");
        unsafe { p.as_ptr().cast::<u64>().write(i) };
    }
    assert_eq!(ALLOCS.load(Ordering::SeqCst), 8);
    collect(&th, Collection::Auto);
    assert_eq!(FREES.load(Ordering::SeqCst), 8);
    assert_eq!(last_gc_metrics().big_objects_freed, 8);

    // A rooted big object survives, ages, and promotes across two full
    // collections like any pool object.
    let kept = alloc(&th, BIG.size, &BIG).expect("big alloc").as_ptr();
    unsafe { kept.cast::<u64>().write(0x5EED) };
    veld_gc::add_global_root(kept);

    collect(&th, Collection::Full);
    collect(&th, Collection::Full);
    assert!(common::is_old(kept), "big object did not promote");
    unsafe { assert_eq!(kept.cast::<u64>().read(), 0x5EED) };

    // Old big objects ride the survivor list through quick sweeps and
    // come back to a thread list at the next full sweep.
    collect(&th, Collection::Auto);
    collect(&th, Collection::Auto);
    collect(&th, Collection::Full);
    unsafe { assert_eq!(kept.cast::<u64>().read(), 0x5EED) };

    // Dropping the root lets the next cycles reclaim it.
    veld_gc::delete_global_root(kept);
    let before = FREES.load(Ordering::SeqCst);
    collect(&th, Collection::Full);
    collect(&th, Collection::Full);
    assert!(
        FREES.load(Ordering::SeqCst) > before,
        "dead big object was never freed"
    );

    set_cb_notify_external_alloc(on_alloc, false);
    set_cb_notify_external_free(on_free, false);
}
