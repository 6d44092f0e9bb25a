//! Long runs of quick sweeps between fulls: the page-skip heuristic
//! (`prev_nold == nold`, maintained only by full sweeps) must never lose a
//! live old object or retain dead young ones.

mod common;

use common::{new_leaf, new_node, node};
use veld_gc::{collect, last_gc_metrics, Collection, CollectionKind, Thread};

const OLD_OBJECTS: usize = 600;
const QUICK_SWEEPS: usize = 1000;

#[test]
fn a_thousand_quick_sweeps_between_fulls() {
    let th = Thread::current();

    // Build a stable old population spanning a couple of pages.
    let mut old = Vec::new();
    for i in 0..OLD_OBJECTS {
        let p = new_node(&th, std::ptr::null_mut(), std::ptr::null_mut(), i);
        veld_gc::add_global_root(p);
        old.push(p);
    }
    collect(&th, Collection::Full);
    collect(&th, Collection::Full);
    for &p in &old {
        assert!(common::is_old(p), "population did not promote");
    }

    // Hammer the young generation; the old pages have no young cells and
    // an unchanged old count, so the skip path rewires their freelists
    // without walking them, a thousand times over.
    for round in 0..QUICK_SWEEPS {
        for _ in 0..64 {
            let garbage = new_leaf(&th);
            unsafe { garbage.cast::<u64>().write(round as u64) };
        }
        collect(&th, Collection::Auto);
        assert_eq!(
            last_gc_metrics().kind,
            CollectionKind::Quick,
            "round {round} escalated to a full sweep"
        );
    }

    // Nothing was lost and nothing young leaked into the old pages.
    for (i, &p) in old.iter().enumerate() {
        assert!(common::is_old(p), "object {i} lost its generation");
        assert_eq!(node(p).value, i, "object {i} corrupted");
    }

    // The next full sweep re-walks everything and keeps the population.
    collect(&th, Collection::Full);
    collect(&th, Collection::Auto);
    for (i, &p) in old.iter().enumerate() {
        assert_eq!(node(p).value, i);
    }

    for &p in &old {
        veld_gc::delete_global_root(p);
    }
}
