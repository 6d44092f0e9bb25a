//! Conservative interior-pointer resolution over the three page states:
//! full pages, bump pages, and freelist pages.

mod common;

use common::{new_leaf, LEAF};
use veld_gc::page::{PAGE_OFFSET, PAGE_SZ};
use veld_gc::{
    alloc, collect, conservative_gc_support_enabled, enable_conservative_gc_support,
    internal_obj_base_ptr, rt::BUFFER_TYPE, Collection, Thread,
};

// LEAF cells are 16 payload bytes + the header word, so they sit in the
// 32-byte class.
const OSIZE: usize = 32;
const CELLS_PER_PAGE: usize = (PAGE_SZ - PAGE_OFFSET) / OSIZE;

fn page_of(addr: usize) -> usize {
    addr & !(PAGE_SZ - 1)
}

#[test]
fn resolver_distinguishes_page_states() {
    let th = Thread::current();

    enable_conservative_gc_support(&th);
    assert!(conservative_gc_support_enabled());
    // Idempotent: a second call must not force another collection.
    enable_conservative_gc_support(&th);

    // Allocate enough leaves to fully populate at least one page.
    let mut leaves = Vec::new();
    for _ in 0..CELLS_PER_PAGE * 3 + 10 {
        leaves.push(new_leaf(&th));
    }

    // Find a fully-bumped page: one that holds the first and last cell of
    // a CELLS_PER_PAGE run.
    let probe = leaves[CELLS_PER_PAGE];

    // Any pointer into the payload resolves to the payload base.
    assert_eq!(internal_obj_base_ptr(probe), Some(probe));
    assert_eq!(
        internal_obj_base_ptr(unsafe { probe.add(7) }),
        Some(probe),
        "interior pointer did not resolve"
    );
    assert_eq!(
        internal_obj_base_ptr(unsafe { probe.add(LEAF.size - 1) }),
        Some(probe)
    );

    // Pointers into the page header resolve to nothing.
    let page = page_of(probe as usize);
    assert_eq!(internal_obj_base_ptr((page + 8) as *mut u8), None);

    // Pointers past the current bump cursor are dead space. The newest
    // leaf sits right below the cursor on the head bump page.
    let newest = *leaves.last().unwrap();
    let past_bump = unsafe { newest.add(OSIZE * 2) };
    if page_of(past_bump as usize) == page_of(newest as usize) {
        assert_eq!(internal_obj_base_ptr(past_bump), None);
    }

    // Outside any page: nothing.
    assert_eq!(internal_obj_base_ptr(std::ptr::null_mut()), None);
    let stack_local = 0usize;
    assert_eq!(
        internal_obj_base_ptr(&stack_local as *const usize as *mut u8),
        None
    );

    // Buffer cells are storage, not objects.
    let buf = alloc(&th, 16, &BUFFER_TYPE).expect("buffer alloc").as_ptr();
    assert_eq!(internal_obj_base_ptr(buf), None);

    // Freelist pages: drop every other leaf and collect so the pages get
    // rebuilt freelists, then check both sides of the cursor.
    let survivors: Vec<*mut u8> = leaves.iter().copied().step_by(2).collect();
    for &p in &survivors {
        veld_gc::add_global_root(p);
    }
    drop(leaves);
    collect(&th, Collection::Auto);

    // Survivors still resolve.
    for &p in survivors.iter().take(8) {
        assert_eq!(internal_obj_base_ptr(p), Some(p));
        assert_eq!(internal_obj_base_ptr(unsafe { p.add(3) }), Some(p));
    }

    // A freed neighbor (freelist entry, age bit clear) does not resolve.
    let dead = unsafe { survivors[4].add(OSIZE) };
    if page_of(dead as usize) == page_of(survivors[4] as usize) {
        assert_eq!(internal_obj_base_ptr(dead), None);
    }

    // A cell allocated out of the freelist resolves again.
    let recycled = new_leaf(&th);
    assert_eq!(internal_obj_base_ptr(recycled), Some(recycled));

    for &p in &survivors {
        veld_gc::delete_global_root(p);
    }
}
