//! Deep and wide object graphs: the iterative mark loop must survive
//! structures that would blow any recursive marker off the host stack,
//! and reference arrays must trace every slot.

mod common;

use common::{new_node, node, NODE};
use veld_gc::tag::{ArrayElem, ArrayHow, ArrayRepr};
use veld_gc::{alloc, collect, track_malloced_buffer, Collection, Thread, TypeDescriptor, TypeLayout};

static REF_ARRAY: TypeDescriptor = TypeDescriptor {
    name: "RefArray",
    size: std::mem::size_of::<ArrayRepr>(),
    layout: TypeLayout::Array,
};

const CHAIN: usize = 50_000;
const SLOTS: usize = 4096;

#[test]
fn deep_chains_and_arrays_mark_iteratively() {
    let th = Thread::current();

    // A 50k-deep singly linked chain, rooted only at the head.
    let mut head = std::ptr::null_mut();
    for i in 0..CHAIN {
        head = new_node(&th, head, std::ptr::null_mut(), i);
    }
    veld_gc::add_global_root(head);

    collect(&th, Collection::Auto);

    // Walk the whole chain: every node survived with its payload.
    let mut cursor = head;
    let mut seen = 0;
    while !cursor.is_null() {
        assert_eq!(node(cursor).value, CHAIN - 1 - seen);
        cursor = node(cursor).next;
        seen += 1;
    }
    assert_eq!(seen, CHAIN);

    // A malloc-backed reference array: elements are traced, and the
    // buffer is released with its owner.
    let buf_bytes = SLOTS * common::WORD;
    // SAFETY: plain C allocation, handed to the tracker below.
    let buf = unsafe { libc::calloc(SLOTS, common::WORD) }.cast::<u8>();
    assert!(!buf.is_null());

    let array = alloc(&th, REF_ARRAY.size, &REF_ARRAY)
        .expect("array alloc")
        .as_ptr();
    unsafe {
        array.cast::<ArrayRepr>().write(ArrayRepr {
            data: buf,
            length: SLOTS,
            elsize: common::WORD,
            how: ArrayHow::Malloced,
            elem: ArrayElem::Refs,
            owner: std::ptr::null_mut(),
        });
    }
    track_malloced_buffer(&th, array, buf, buf_bytes);
    veld_gc::add_global_root(array);

    let mut elems = Vec::new();
    for i in 0..SLOTS {
        let e = new_node(&th, std::ptr::null_mut(), std::ptr::null_mut(), i);
        unsafe { *buf.cast::<*mut u8>().add(i) = e };
        elems.push(e);
    }

    collect(&th, Collection::Auto);
    for (i, &e) in elems.iter().enumerate() {
        assert_eq!(node(e).value, i, "array element {i} was collected");
        // SAFETY: e is a live managed cell.
        assert!(std::ptr::eq(unsafe { TypeDescriptor::of(e) }, &NODE));
    }

    // Dropping the array drops the buffer too: the tracker frees it on
    // the next sweep and counts the host free call.
    let calls_before = veld_gc::gc_stats().free_calls;
    veld_gc::delete_global_root(array);
    collect(&th, Collection::Auto);
    collect(&th, Collection::Auto);
    assert!(
        veld_gc::gc_stats().free_calls > calls_before,
        "tracked buffer was never freed"
    );

    veld_gc::delete_global_root(head);
    collect(&th, Collection::Auto);
}
