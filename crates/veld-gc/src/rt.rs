//! Host-runtime collaborator types.
//!
//! The collector does not own tasks, modules or exception stacks; the
//! runtime does. These are the byte-level contracts the mark loop walks:
//! shadow-stack frames, exception stacks with interleaved backtraces, and
//! module binding tables. The runtime allocates cells of these shapes with
//! the builtin descriptors below.

use crate::tag::{TypeDescriptor, TypeLayout, WORD};

// ============================================================================
// Builtin descriptors
// ============================================================================

/// The `nothing` singleton's descriptor. The singleton itself lives in the
/// permanent region; see [`crate::nothing_value`].
pub static NOTHING_TYPE: TypeDescriptor = TypeDescriptor {
    name: "Nothing",
    size: 0,
    layout: TypeLayout::Opaque,
};

/// Weak reference cells: one managed slot, never traced.
pub static WEAKREF_TYPE: TypeDescriptor = TypeDescriptor {
    name: "WeakRef",
    size: WORD,
    layout: TypeLayout::WeakRef,
};

/// Unmanaged buffer cells (array storage and similar). The conservative
/// resolver must never return these.
pub static BUFFER_TYPE: TypeDescriptor = TypeDescriptor {
    name: "Buffer",
    size: 0,
    layout: TypeLayout::Buffer,
};

/// Task cells; see [`TaskRepr`].
pub static TASK_TYPE: TypeDescriptor = TypeDescriptor {
    name: "Task",
    size: std::mem::size_of::<TaskRepr>(),
    layout: TypeLayout::Task {
        extra: &TASK_EXTRA_PTRS,
    },
};

/// Word offsets of `TaskRepr`'s managed fields (`result`, `next`).
const TASK_EXTRA_PTRS: [u8; 2] = [3, 4];

/// Module cells; see [`ModuleRepr`].
pub static MODULE_TYPE: TypeDescriptor = TypeDescriptor {
    name: "Module",
    size: std::mem::size_of::<ModuleRepr>(),
    layout: TypeLayout::Module,
};

/// Module binding cells: a single managed `value` slot at word offset 0.
pub static BINDING_TYPE: TypeDescriptor = TypeDescriptor {
    name: "Binding",
    size: std::mem::size_of::<BindingRepr>(),
    layout: TypeLayout::Ptr8(&BINDING_PTRS),
};

const BINDING_PTRS: [u8; 1] = [0];

// ============================================================================
// Shadow stacks
// ============================================================================

/// One frame of a task's shadow stack.
///
/// `nroots` packs the slot count in the high bits and an "indirect" flag in
/// bit 0: when set, the root slots hold pointers to stack locations rather
/// than the references themselves. Frames link through `prev`; the root
/// slots follow the struct inline.
#[repr(C)]
pub struct ShadowFrame {
    /// `(count << 2) | flags`; bit 0 = indirect roots.
    pub nroots: usize,
    /// Older frame, or null.
    pub prev: *mut ShadowFrame,
    // root slots follow inline
}

impl ShadowFrame {
    /// Number of root slots in this frame.
    #[inline]
    pub fn count(nroots: usize) -> usize {
        nroots >> 2
    }

    /// Whether the root slots are pointers to slots.
    #[inline]
    pub fn indirect(nroots: usize) -> bool {
        nroots & 1 != 0
    }

    /// Pointer to the first root slot.
    ///
    /// # Safety
    ///
    /// `frame` must point at a live shadow frame.
    #[inline]
    pub unsafe fn roots(frame: *mut ShadowFrame) -> *mut *mut u8 {
        unsafe { frame.add(1) }.cast()
    }
}

// ============================================================================
// Exception stacks
// ============================================================================

/// Exception stack buffer, allocated as a `BUFFER_TYPE` cell owned by a
/// task.
///
/// Entries grow upward and are read from the top down. Each entry is
/// `[bt words..., bt_size, exception]`, so for an iterator `itr`:
/// the exception value is `data[itr - 1]`, the backtrace length is
/// `data[itr - 2]`, and the backtrace words occupy
/// `data[itr - 2 - bt_size .. itr - 2]`. A backtrace word with bit 0 set
/// carries a managed reference in its remaining bits; all other words are
/// native program counters the collector skips.
#[repr(C)]
pub struct ExcStackData {
    /// One past the last used word.
    pub top: usize,
    /// Capacity of the data area in words.
    pub reserved: usize,
    // data words follow inline
}

impl ExcStackData {
    /// Pointer to the first data word.
    ///
    /// # Safety
    ///
    /// `stack` must point at a live exception stack buffer.
    #[inline]
    pub unsafe fn data(stack: *mut ExcStackData) -> *mut usize {
        unsafe { stack.add(1) }.cast()
    }

    /// Bytes needed for a stack with `reserved` data words (payload only).
    #[inline]
    pub fn byte_size(reserved: usize) -> usize {
        std::mem::size_of::<ExcStackData>() + reserved * WORD
    }

    /// Whether a backtrace word carries a managed reference.
    #[inline]
    pub fn bt_entry_is_managed(word: usize) -> bool {
        word & 1 != 0
    }

    /// The managed reference carried by a tagged backtrace word.
    #[inline]
    pub fn bt_entry_value(word: usize) -> *mut u8 {
        (word & !1) as *mut u8
    }

    /// Tags a managed reference for storage in a backtrace buffer.
    #[inline]
    pub fn bt_entry_from_value(value: *mut u8) -> usize {
        value as usize | 1
    }
}

// ============================================================================
// Tasks
// ============================================================================

/// Payload of a task cell.
///
/// `gcstack` heads the shadow-stack frame list; `excstack` is a managed
/// `BUFFER_TYPE` cell holding an [`ExcStackData`], or null. `stkbuf` is a
/// malloc-backed machine stack released when the task dies. `result` and
/// `next` are ordinary managed fields traced through the task's offset
/// map.
#[repr(C)]
pub struct TaskRepr {
    /// Shadow stack head, or null.
    pub gcstack: *mut ShadowFrame,
    /// Managed exception stack buffer cell, or null.
    pub excstack: *mut u8,
    /// Malloc-backed machine stack, or null; freed when the task dies.
    pub stkbuf: *mut u8,
    /// Managed result slot.
    pub result: *mut u8,
    /// Managed link to another task.
    pub next: *mut u8,
}

// ============================================================================
// Modules
// ============================================================================

/// Payload of a module cell.
///
/// `bindings` is a table of binding cells (`BINDING_TYPE`, entries may be
/// null); `usings` is a table of module cells. Both tables are owned by
/// the runtime (they are unmanaged storage); only their entries are
/// managed.
#[repr(C)]
pub struct ModuleRepr {
    /// Binding-cell table, entries may be null.
    pub bindings: *mut *mut u8,
    /// Number of binding-table slots.
    pub bindings_len: usize,
    /// Used-module table.
    pub usings: *mut *mut u8,
    /// Number of used modules.
    pub usings_len: usize,
    /// Parent module cell, or null for the root.
    pub parent: *mut u8,
}

/// Payload of a binding cell.
#[repr(C)]
pub struct BindingRepr {
    /// Managed bound value, or null.
    pub value: *mut u8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shadow_frame_packing() {
        let nroots = (3usize << 2) | 1;
        assert_eq!(ShadowFrame::count(nroots), 3);
        assert!(ShadowFrame::indirect(nroots));
        assert!(!ShadowFrame::indirect(8));
    }

    #[test]
    fn bt_entry_tagging() {
        let fake = 0x1000usize as *mut u8;
        let word = ExcStackData::bt_entry_from_value(fake);
        assert!(ExcStackData::bt_entry_is_managed(word));
        assert_eq!(ExcStackData::bt_entry_value(word), fake);
        assert!(!ExcStackData::bt_entry_is_managed(0x2000));
    }

    #[test]
    fn task_extra_offsets_match_layout() {
        assert_eq!(
            TASK_EXTRA_PTRS[0] as usize * WORD,
            std::mem::offset_of!(TaskRepr, result)
        );
        assert_eq!(
            TASK_EXTRA_PTRS[1] as usize * WORD,
            std::mem::offset_of!(TaskRepr, next)
        );
    }
}
