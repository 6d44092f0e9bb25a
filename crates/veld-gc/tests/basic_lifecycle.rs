//! Allocation churn with nothing retained: a collection reclaims almost
//! everything and pages flow back to the allocator.

mod common;

use common::{new_leaf, new_node, node, LEAF};
use veld_gc::{alloc, collect, last_gc_metrics, live_bytes, object_gc_bits, Collection, Thread};

const GARBAGE: usize = 1_000_000;

#[test]
fn unreachable_churn_is_reclaimed() {
    let th = Thread::current();

    // Warm up the collector so live_bytes reflects a settled baseline.
    collect(&th, Collection::Auto);
    let baseline = live_bytes();

    for _ in 0..GARBAGE {
        let p = alloc(&th, LEAF.size, &LEAF).expect("leaf alloc");
        unsafe { p.as_ptr().cast::<u64>().write(0xDEAD_BEEF) };
    }

    // Keep one survivor so the cycle is not trivially empty.
    let keeper = new_node(&th, std::ptr::null_mut(), std::ptr::null_mut(), 41);
    veld_gc::add_global_root(keeper);

    collect(&th, Collection::Auto);

    // The garbage was 24 MiB+; the surviving delta must be a rounding
    // error next to it.
    let after = live_bytes();
    let churn = (GARBAGE * (LEAF.size + common::WORD)) as i64;
    assert!(
        after - baseline < churn / 10,
        "live_bytes {after} should be within 10% of baseline {baseline}"
    );

    // Whole-dead pages go back to the allocator (or the retained pool).
    let metrics = last_gc_metrics();
    assert!(metrics.pages_freed > 0, "no pages were reclaimed");
    assert!(metrics.bytes_freed > 0);

    // The survivor is intact and still allocatable-after.
    assert_eq!(node(keeper).value, 41);
    let fresh = new_leaf(&th);
    assert!(!fresh.is_null());

    // Permanent cells are born old-marked and never swept.
    let perm = veld_gc::perm_alloc_cell(LEAF.size, &LEAF)
        .expect("perm cell")
        .as_ptr();
    collect(&th, Collection::Full);
    collect(&th, Collection::Auto);
    assert_eq!(object_gc_bits(perm), 3);

    veld_gc::delete_global_root(keeper);
}
