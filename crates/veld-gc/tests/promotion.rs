//! Generational promotion: an object must survive one full collection
//! before it can turn old, and surviving another promotes it.

mod common;

use common::{is_old, new_node, node};
use veld_gc::{collect, object_gc_bits, Collection, Thread};

#[test]
fn survivors_promote_after_one_full_cycle() {
    let th = Thread::current();

    let obj = new_node(&th, std::ptr::null_mut(), std::ptr::null_mut(), 7);
    veld_gc::add_global_root(obj);

    // Freshly allocated: young and unmarked.
    assert_eq!(object_gc_bits(obj), 0);

    // One collection is never enough to promote (age threshold = 1).
    collect(&th, Collection::Full);
    assert!(
        !is_old(obj),
        "promoted too early: bits {:#x}",
        object_gc_bits(obj)
    );

    // The second full collection sees the age bit and promotes.
    collect(&th, Collection::Full);
    assert!(
        is_old(obj),
        "expected promotion, bits {:#x}",
        object_gc_bits(obj)
    );
    assert_eq!(node(obj).value, 7);

    // Old objects stay old across further quick collections.
    collect(&th, Collection::Auto);
    assert!(is_old(obj));
    assert_eq!(node(obj).value, 7);

    veld_gc::delete_global_root(obj);
}
