//! The old-to-young discipline: an old-marked parent that gains a young
//! child must sit in the remembered set until the child is old too.

mod common;

use common::{is_old, new_node, node};
use veld_gc::{collect, queue_root, remset_len, Collection, Thread};

#[test]
fn barrier_keeps_young_children_alive() {
    let th = Thread::current();

    let parent = new_node(&th, std::ptr::null_mut(), std::ptr::null_mut(), 1);
    veld_gc::add_global_root(parent);

    // Promote the parent to the old generation.
    collect(&th, Collection::Full);
    collect(&th, Collection::Full);
    assert!(is_old(parent));

    // Store a young child into the old parent; the forward barrier
    // re-opens the parent and remembers it.
    let child = new_node(&th, std::ptr::null_mut(), std::ptr::null_mut(), 2);
    node(parent).next = child;
    queue_root(&th, parent);
    assert!(remset_len(&th) > 0, "barrier did not remember the parent");

    // A quick collection scans the remset as roots: the child survives
    // even though nothing else references it.
    collect(&th, Collection::Auto);
    assert_eq!(node(child).value, 2);
    assert!(is_old(parent));

    // Once the child has been promoted, rescans stop finding young
    // children and the parent drops out of the remembered set.
    collect(&th, Collection::Auto);
    collect(&th, Collection::Auto);
    assert!(is_old(child), "child should have promoted");
    assert_eq!(
        remset_len(&th),
        0,
        "parent should have left the remembered set"
    );
    assert_eq!(node(child).value, 2);

    veld_gc::delete_global_root(parent);
}
