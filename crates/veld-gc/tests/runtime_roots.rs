//! Marking through the runtime structures: task shadow stacks, exception
//! stacks, and the module binding tree.

mod common;

use common::{new_node, node};
use veld_gc::rt::{
    BindingRepr, ExcStackData, ModuleRepr, ShadowFrame, TaskRepr, BINDING_TYPE, BUFFER_TYPE,
    MODULE_TYPE, TASK_TYPE,
};
use veld_gc::{alloc, collect, queue_binding, Collection, Thread};

// A shadow frame with two direct root slots, embedder style.
#[repr(C)]
struct TestFrame {
    frame: ShadowFrame,
    roots: [*mut u8; 2],
}

#[test]
fn runtime_structures_are_roots() {
    let th = Thread::current();

    // --- Task with a shadow stack and an exception stack ---------------
    let stack_kept = new_node(&th, std::ptr::null_mut(), std::ptr::null_mut(), 21);
    let stack_kept2 = new_node(&th, std::ptr::null_mut(), std::ptr::null_mut(), 22);
    let mut frame = TestFrame {
        frame: ShadowFrame {
            nroots: 2 << 2,
            prev: std::ptr::null_mut(),
        },
        roots: [stack_kept, stack_kept2],
    };

    let exc_kept = new_node(&th, std::ptr::null_mut(), std::ptr::null_mut(), 23);
    let bt_kept = new_node(&th, std::ptr::null_mut(), std::ptr::null_mut(), 24);
    // Exception stack layout, one entry: [bt word, bt_size=1, exception].
    let excstack = alloc(&th, ExcStackData::byte_size(8), &BUFFER_TYPE)
        .expect("excstack alloc")
        .as_ptr();
    unsafe {
        let es = excstack.cast::<ExcStackData>();
        (*es).top = 3;
        (*es).reserved = 8;
        let data = ExcStackData::data(es);
        *data = ExcStackData::bt_entry_from_value(bt_kept);
        *data.add(1) = 1;
        *data.add(2) = exc_kept as usize;
    }

    let result_kept = new_node(&th, std::ptr::null_mut(), std::ptr::null_mut(), 25);
    let task = alloc(&th, TASK_TYPE.size, &TASK_TYPE).expect("task alloc").as_ptr();
    unsafe {
        task.cast::<TaskRepr>().write(TaskRepr {
            gcstack: &mut frame.frame,
            excstack,
            stkbuf: std::ptr::null_mut(),
            result: result_kept,
            next: std::ptr::null_mut(),
        });
    }
    th.set_tasks(task, task, std::ptr::null_mut(), std::ptr::null_mut());
    th.register_task(task);

    // --- Module tree with bindings --------------------------------------
    let bound = new_node(&th, std::ptr::null_mut(), std::ptr::null_mut(), 31);
    let binding = alloc(&th, BINDING_TYPE.size, &BINDING_TYPE)
        .expect("binding alloc")
        .as_ptr();
    unsafe { binding.cast::<BindingRepr>().write(BindingRepr { value: bound }) };

    let mut binding_table = [binding, std::ptr::null_mut()];
    let module = alloc(&th, MODULE_TYPE.size, &MODULE_TYPE)
        .expect("module alloc")
        .as_ptr();
    unsafe {
        module.cast::<ModuleRepr>().write(ModuleRepr {
            bindings: binding_table.as_mut_ptr(),
            bindings_len: binding_table.len(),
            usings: std::ptr::null_mut(),
            usings_len: 0,
            parent: std::ptr::null_mut(),
        });
    }
    veld_gc::set_root_module(module);

    // Everything above survives purely through the runtime structures.
    collect(&th, Collection::Auto);
    assert_eq!(node(stack_kept).value, 21);
    assert_eq!(node(stack_kept2).value, 22);
    assert_eq!(node(exc_kept).value, 23);
    assert_eq!(node(bt_kept).value, 24);
    assert_eq!(node(result_kept).value, 25);
    assert_eq!(node(bound).value, 31);

    // Binding barrier: promote the world, rebind a young value, and make
    // sure the remembered binding keeps it alive across a quick sweep.
    collect(&th, Collection::Full);
    collect(&th, Collection::Full);
    let young = new_node(&th, std::ptr::null_mut(), std::ptr::null_mut(), 32);
    unsafe { (*binding.cast::<BindingRepr>()).value = young };
    queue_binding(&th, binding);
    collect(&th, Collection::Auto);
    assert_eq!(node(young).value, 32, "rebound young value was collected");

    // Chained shadow frames: an older frame is still scanned.
    let deep_kept = new_node(&th, std::ptr::null_mut(), std::ptr::null_mut(), 26);
    let mut older = TestFrame {
        frame: ShadowFrame {
            nroots: 1 << 2,
            prev: std::ptr::null_mut(),
        },
        roots: [deep_kept, std::ptr::null_mut()],
    };
    frame.frame.prev = &mut older.frame;
    collect(&th, Collection::Auto);
    assert_eq!(node(deep_kept).value, 26);

    // Detach the runtime structures before the test thread goes away.
    th.set_tasks(
        std::ptr::null_mut(),
        std::ptr::null_mut(),
        std::ptr::null_mut(),
        std::ptr::null_mut(),
    );
    veld_gc::set_root_module(std::ptr::null_mut());
}
