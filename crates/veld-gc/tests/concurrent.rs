//! Several mutators allocating and requesting collections at once:
//! exactly one wins each election, the rest park and return, and nobody's
//! rooted data is lost.
//!
//! The main thread never registers with the collector, so blocking in
//! `join` does not stall the safepoint handshake.

mod common;

use std::thread;

use common::{new_leaf, new_node, node};
use veld_gc::{collect, Collection, Thread};

const WORKERS: usize = 3;
const ROUNDS: u64 = 50;

#[test]
fn concurrent_collectors_elect_one() {
    let handles: Vec<_> = (0..WORKERS)
        .map(|t| {
            thread::spawn(move || {
                let th = Thread::current();
                let keeper = new_node(&th, std::ptr::null_mut(), std::ptr::null_mut(), t);
                veld_gc::add_global_root(keeper);
                for round in 0..ROUNDS {
                    for _ in 0..500 {
                        let p = new_leaf(&th);
                        // Touch it before the next allocation can poll a
                        // safepoint; nothing roots it afterwards.
                        unsafe { p.cast::<u64>().write(round) };
                    }
                    collect(&th, Collection::Auto);
                    assert_eq!(node(keeper).value, t, "worker {t} lost its root");
                }
                veld_gc::delete_global_root(keeper);
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("worker panicked");
    }

    // The collections all completed; the counters saw every election.
    assert!(veld_gc::gc_stats().collections > 0);
}
