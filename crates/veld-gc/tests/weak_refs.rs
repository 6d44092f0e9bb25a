//! Weak references: dead targets are replaced by the nothing sentinel,
//! live targets are left alone.

mod common;

use common::{new_node, node};
use veld_gc::{collect, new_weakref, nothing_value, weakref_value, Collection, Thread};

#[test]
fn dead_targets_are_cleared() {
    let th = Thread::current();

    let doomed = new_node(&th, std::ptr::null_mut(), std::ptr::null_mut(), 13);
    let kept = new_node(&th, std::ptr::null_mut(), std::ptr::null_mut(), 14);
    veld_gc::add_global_root(kept);

    let wr_doomed = new_weakref(&th, doomed).expect("weakref").as_ptr();
    let wr_kept = new_weakref(&th, kept).expect("weakref").as_ptr();
    veld_gc::add_global_root(wr_doomed);
    veld_gc::add_global_root(wr_kept);

    assert_eq!(weakref_value(wr_doomed), doomed);

    // A weak reference alone does not keep its target alive.
    collect(&th, Collection::Auto);
    assert_eq!(
        weakref_value(wr_doomed),
        nothing_value(),
        "dead target not cleared"
    );
    assert_eq!(weakref_value(wr_kept), kept, "live target was disturbed");
    assert_eq!(node(kept).value, 14);

    // Cleared references stay cleared; live ones keep tracking their
    // target across further collections.
    collect(&th, Collection::Full);
    collect(&th, Collection::Full);
    assert_eq!(weakref_value(wr_doomed), nothing_value());
    assert_eq!(weakref_value(wr_kept), kept);

    // An unrooted weak reference is itself collectable.
    let transient = new_weakref(&th, kept).expect("weakref").as_ptr();
    let _ = transient;
    collect(&th, Collection::Auto);

    veld_gc::delete_global_root(kept);
    veld_gc::delete_global_root(wr_doomed);
    veld_gc::delete_global_root(wr_kept);
}
