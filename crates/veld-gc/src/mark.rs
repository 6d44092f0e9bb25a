//! Mark work-stack and mark loop.
//!
//! Marking is an iterative DFS over the object graph. Two parallel stacks
//! hold the traversal state: a pc stack of [`FrameKind`] discriminants and
//! a data stack of fixed-size [`FrameData`] frames. The split keeps frames
//! contiguous and self-describing so a future parallel marker could steal
//! whole frames; both stacks grow together by doubling.
//!
//! Children are marked with a relaxed atomic exchange of the header word
//! (`try_setmark`) and queued as `MarkedObj` frames; metadata updates
//! (page `has_marked`, big-object survivor queues) happen exactly once,
//! when the frame is popped. Every traversal frame carries an `nptr` word:
//! the count of scanned references in the high bits, bit 1 set when the
//! parent is old, bit 0 set when any traced child turned out young. A
//! frame finishing with both low bits set pushes its parent back onto the
//! collector's remembered set.

use crate::big::BigVal;
use crate::callbacks::Callbacks;
use crate::collect::Collector;
use crate::page::PageMeta;
use crate::rt::{ExcStackData, ModuleRepr, ShadowFrame, TaskRepr};
use crate::tag::{
    gc_marked, gc_old, ArrayHow, ArrayElem, ArrayRepr, CellHeader, TypeDescriptor, TypeLayout,
    GC_MARKED, GC_OLD_MARKED, WORD,
};
use crate::thread::Ptls;

/// Initial capacity of both mark stacks, in frames.
const MARK_STACK_INIT: usize = 1 << 10;

/// Capacity of the per-thread big-object notification buffer.
const BIG_MARK_BUFFER: usize = 1024;

// ============================================================================
// Frames
// ============================================================================

/// Handler kind of a mark frame; the pc stack stores these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Object just marked; update metadata, then traverse.
    MarkedObj,
    /// Metadata already updated; only traverse.
    ScanOnly,
    /// (object, finalizer) slot list with tag bits.
    Finlist,
    /// Dense reference array.
    ObjArray,
    /// Element-struct array with an 8-bit field map.
    Array8,
    /// Element-struct array with a 16-bit field map.
    Array16,
    /// Struct with an 8-bit pointer-offset map.
    Obj8,
    /// Struct with a 16-bit pointer-offset map.
    Obj16,
    /// Struct with a 32-bit pointer-offset map.
    Obj32,
    /// Task shadow-stack frame chain.
    Stack,
    /// Exception stack with backtrace/value interleaving.
    ExcStack,
    /// Module binding table.
    ModuleBinding,
}

/// An object queued for metadata update and traversal.
#[derive(Clone, Copy)]
pub struct ObjFrame {
    /// The object payload.
    pub obj: *mut u8,
    /// Header word with the GC bits cleared (the descriptor).
    pub tag: usize,
    /// The bits the object was marked with.
    pub bits: u8,
}

/// A finalizer-list segment.
#[derive(Clone, Copy)]
pub struct FinlistFrame {
    /// First slot.
    pub items: *const usize,
    /// One past the last slot.
    pub len: usize,
    /// Current slot index.
    pub idx: usize,
}

/// A dense reference array segment.
#[derive(Clone, Copy)]
pub struct ObjArrayFrame {
    /// The owning object.
    pub parent: *mut u8,
    /// First reference slot.
    pub begin: *mut *mut u8,
    /// One past the last reference slot.
    pub end: *mut *mut u8,
    /// Slot stride in words.
    pub step: usize,
    /// Reference counter and old/young flags.
    pub nptr: usize,
}

/// An inline-struct array with an 8-bit per-element field map.
#[derive(Clone, Copy)]
pub struct ArrayFrame8 {
    /// First element, as a word pointer.
    pub begin: *mut *mut u8,
    /// One past the last element.
    pub end: *mut *mut u8,
    /// Element stride in words.
    pub elsize: usize,
    /// Word offsets of pointer fields within one element.
    pub offsets: &'static [u8],
    /// The owning object.
    pub parent: *mut u8,
    /// Reference counter and old/young flags.
    pub nptr: usize,
}

/// An inline-struct array with a 16-bit per-element field map.
#[derive(Clone, Copy)]
pub struct ArrayFrame16 {
    /// First element, as a word pointer.
    pub begin: *mut *mut u8,
    /// One past the last element.
    pub end: *mut *mut u8,
    /// Element stride in words.
    pub elsize: usize,
    /// Word offsets of pointer fields within one element.
    pub offsets: &'static [u16],
    /// The owning object.
    pub parent: *mut u8,
    /// Reference counter and old/young flags.
    pub nptr: usize,
}

/// A struct traversal over an 8-bit offset map.
#[derive(Clone, Copy)]
pub struct Obj8Frame {
    /// The object being scanned.
    pub parent: *mut u8,
    /// Word offsets of the pointer fields.
    pub offsets: &'static [u8],
    /// Reference counter and old/young flags.
    pub nptr: usize,
}

/// A struct traversal over a 16-bit offset map.
#[derive(Clone, Copy)]
pub struct Obj16Frame {
    /// The object being scanned.
    pub parent: *mut u8,
    /// Word offsets of the pointer fields.
    pub offsets: &'static [u16],
    /// Reference counter and old/young flags.
    pub nptr: usize,
}

/// A struct traversal over a 32-bit offset map.
#[derive(Clone, Copy)]
pub struct Obj32Frame {
    /// The object being scanned.
    pub parent: *mut u8,
    /// Word offsets of the pointer fields.
    pub offsets: &'static [u32],
    /// Reference counter and old/young flags.
    pub nptr: usize,
}

/// A task shadow-stack walk.
#[derive(Clone, Copy)]
pub struct StackFrame {
    /// Current frame.
    pub frame: *mut ShadowFrame,
    /// Current root index.
    pub i: u32,
    /// Raw packed `nroots` of the current frame.
    pub nroots: usize,
    /// Relocation offset for partially copied stacks.
    pub offset: usize,
    /// Lower bound of the relocated window.
    pub lb: usize,
    /// Upper bound of the relocated window.
    pub ub: usize,
}

/// An exception-stack walk.
#[derive(Clone, Copy)]
pub struct ExcStackFrame {
    /// The stack buffer.
    pub stack: *mut ExcStackData,
    /// Current iterator (one past the top entry in words).
    pub itr: usize,
}

/// A module binding-table walk.
#[derive(Clone, Copy)]
pub struct ModuleFrame {
    /// The module cell.
    pub module: *mut u8,
    /// Reference counter and old/young flags.
    pub nptr: usize,
    /// The module's own mark bits (bindings are marked with them).
    pub bits: u8,
}

/// Data stack entry; parallel to the pc stack.
#[derive(Clone, Copy)]
pub enum FrameData {
    /// State for `MarkedObj`/`ScanOnly`.
    Obj(ObjFrame),
    /// State for `Finlist`.
    Finlist(FinlistFrame),
    /// State for `ObjArray`.
    ObjArray(ObjArrayFrame),
    /// State for `Array8`.
    Array8(ArrayFrame8),
    /// State for `Array16`.
    Array16(ArrayFrame16),
    /// State for `Obj8`.
    Obj8(Obj8Frame),
    /// State for `Obj16`.
    Obj16(Obj16Frame),
    /// State for `Obj32`.
    Obj32(Obj32Frame),
    /// State for `Stack`.
    Stack(StackFrame),
    /// State for `ExcStack`.
    ExcStack(ExcStackFrame),
    /// State for `ModuleBinding`.
    Module(ModuleFrame),
}

/// The two parallel mark stacks.
pub struct MarkStack {
    pc: Vec<FrameKind>,
    data: Vec<FrameData>,
}

impl MarkStack {
    fn new() -> MarkStack {
        MarkStack {
            pc: Vec::new(),
            data: Vec::new(),
        }
    }

    /// Pushes one frame, growing both stacks together by doubling when the
    /// pc stack is full.
    #[inline]
    pub fn push(&mut self, kind: FrameKind, data: FrameData) {
        debug_assert_eq!(self.pc.len(), self.data.len());
        if self.pc.len() == self.pc.capacity() {
            let grown = (self.pc.capacity() * 2).max(MARK_STACK_INIT);
            self.pc.reserve_exact(grown - self.pc.len());
            self.data.reserve_exact(grown - self.data.len());
        }
        self.pc.push(kind);
        self.data.push(data);
    }

    /// Pops one frame.
    #[inline]
    pub fn pop(&mut self) -> Option<(FrameKind, FrameData)> {
        let kind = self.pc.pop()?;
        let data = self.data.pop().expect("mark stacks out of sync");
        Some((kind, data))
    }

    /// Whether any frames remain.
    pub fn is_empty(&self) -> bool {
        self.pc.is_empty()
    }
}

/// Per-thread marking state: the work stack plus a fixed-capacity buffer
/// of big objects newly marked by this thread, drained into the global
/// survivor list under the mark-cache lock.
pub struct MarkCache {
    /// The work stack.
    pub stack: MarkStack,
    /// (node, back-to-young) notifications awaiting the locked drain.
    big_objs: Vec<(*mut BigVal, bool)>,
    /// Bytes of young/new objects scanned this cycle.
    pub scanned_bytes: usize,
    /// Bytes of old objects scanned this cycle.
    pub perm_scanned_bytes: usize,
}

impl MarkCache {
    pub(crate) fn new() -> MarkCache {
        MarkCache {
            stack: MarkStack::new(),
            big_objs: Vec::new(),
            scanned_bytes: 0,
            perm_scanned_bytes: 0,
        }
    }
}

#[inline]
fn read_stack(addr: *const usize, offset: usize, lb: usize, ub: usize) -> usize {
    let mut a = addr as usize;
    if a >= lb && a < ub {
        a = a.wrapping_add(offset);
    }
    // SAFETY: shadow-stack slots are live for the duration of the walk.
    unsafe { *(a as *const usize) }
}

// ============================================================================
// The marker
// ============================================================================

/// Marking context for one collection, driven by the collector thread.
pub(crate) struct Marker<'a> {
    pub collector: &'a Collector,
    /// The collector thread's heap state: the mark cache lives here, and
    /// re-remembered parents land in its remset. Raw because the same
    /// thread's state can also appear as a scan target.
    pub ptls: *mut Ptls,
    /// Force newly marked objects to `MARKED` with the old bit cleared so
    /// the next cycle retraces them (finalizer resurrection).
    pub mark_reset_age: bool,
}

impl<'a> Marker<'a> {
    pub(crate) fn new(collector: &'a Collector, ptls: *mut Ptls) -> Marker<'a> {
        // SAFETY: collector-owned Ptls during the stopped world.
        debug_assert!(unsafe { (*ptls).mark_cache.stack.is_empty() });
        Marker {
            collector,
            ptls,
            mark_reset_age: false,
        }
    }

    #[inline]
    fn cache(&mut self) -> &mut MarkCache {
        // SAFETY: the marker runs on the collector thread, which owns this
        // Ptls for the duration of the stopped world.
        unsafe { &mut (*self.ptls).mark_cache }
    }

    #[inline]
    fn stack(&mut self) -> &mut MarkStack {
        &mut self.cache().stack
    }

    /// Atomically marks `obj` if it is unmarked. Updates the parent's
    /// `nptr` young flag either way. Returns the descriptor word and the
    /// new bits when the object still needs its metadata update and
    /// traversal.
    #[inline]
    fn try_setmark(&mut self, obj: *mut u8, nptr: &mut usize) -> Option<(usize, u8)> {
        if obj.is_null() {
            return None;
        }
        // SAFETY: obj is a managed reference found in traced memory.
        let header = unsafe { &*CellHeader::of(obj) };
        let word = header.word();
        let bits = (word & 3) as u8;
        if !gc_marked(bits) {
            let mark_bits = if self.mark_reset_age {
                // Reset the object as if it was just allocated.
                GC_MARKED
            } else if gc_old(bits) {
                GC_OLD_MARKED
            } else {
                GC_MARKED
            };
            let new_word = (word & !3) | mark_bits as usize;
            let prev = header.exchange(new_word);
            if !gc_old(mark_bits) {
                *nptr |= 1;
            }
            if gc_marked((prev & 3) as u8) {
                // Another marker got here first (single-threaded today,
                // but the protocol allows racing markers).
                return None;
            }
            Some((word & !3, mark_bits))
        } else {
            if !gc_old(bits) {
                *nptr |= 1;
            }
            None
        }
    }

    /// One-time metadata update for a freshly marked object: pool pages
    /// record `has_marked`/`nold`, big objects queue for the survivor
    /// drain.
    fn setmark_meta(&mut self, obj: *mut u8, bits: u8) {
        // SAFETY: obj is a managed cell.
        let header = unsafe { CellHeader::of(obj) };
        match self.collector.page_alloc.meta_of(header as usize) {
            Some(meta) => self.setmark_pool_meta(header, meta, bits),
            None => self.setmark_big_meta(header, bits),
        }
    }

    fn setmark_pool_meta(&mut self, header: *mut CellHeader, meta: *mut PageMeta, bits: u8) {
        // SAFETY: metadata of an allocated page; the world is stopped.
        let meta = unsafe { &mut *meta };
        let osize = meta.osize as usize;
        if bits == GC_OLD_MARKED {
            self.cache().perm_scanned_bytes += osize;
            meta.nold += 1;
        } else {
            self.cache().scanned_bytes += osize;
            if self.mark_reset_age {
                meta.has_young = true;
                let idx = meta.cell_index(header as usize);
                meta.clear_age_bit(idx);
            }
        }
        meta.has_marked = true;
    }

    fn setmark_big_meta(&mut self, header: *mut CellHeader, bits: u8) {
        // SAFETY: cells outside the page table are big objects.
        let hdr = unsafe { BigVal::of_header(header) };
        let sz = unsafe { (*hdr).sz };
        if bits == GC_OLD_MARKED {
            self.cache().perm_scanned_bytes += sz;
            self.queue_big(hdr, false);
        } else {
            self.cache().scanned_bytes += sz;
            if self.mark_reset_age && unsafe { (*hdr).age } != 0 {
                unsafe { (*hdr).age = 0 };
                self.queue_big(hdr, true);
            }
        }
    }

    fn queue_big(&mut self, hdr: *mut BigVal, to_young: bool) {
        if self.cache().big_objs.len() >= BIG_MARK_BUFFER {
            self.sync_big_cache();
        }
        self.cache().big_objs.push((hdr, to_young));
    }

    /// Drains the big-object notification buffer: survivors move to the
    /// global `big_objects_marked` list, age-reset objects back to this
    /// thread's list. Serialized by the mark-cache lock.
    pub(crate) fn sync_big_cache(&mut self) {
        if self.cache().big_objs.is_empty() {
            return;
        }
        let mut survivors = self.collector.big_objects_marked.lock();
        let pending: Vec<_> = self.cache().big_objs.drain(..).collect();
        for (hdr, to_young) in pending {
            // SAFETY: hdr is linked on some big list; the world is
            // stopped.
            unsafe {
                crate::big::big_object_unlink(hdr);
                if to_young {
                    crate::big::big_object_link(hdr, std::ptr::addr_of_mut!((*self.ptls).big_objects));
                } else {
                    crate::big::big_object_link(hdr, &mut survivors.0);
                }
            }
        }
    }

    /// Marks a dependent buffer cell (array storage, exception stacks,
    /// binding cells) with its owner's bits.
    fn setmark_buf(&mut self, payload: *mut u8, owner_bits: u8) {
        if payload.is_null() {
            return;
        }
        // SAFETY: payload is a managed buffer cell.
        let header = unsafe { &*CellHeader::of(payload) };
        let word = header.word();
        let bits = (word & 3) as u8;
        if gc_marked(bits) {
            return;
        }
        let mark_bits = if self.mark_reset_age {
            GC_MARKED
        } else if gc_old(bits) || gc_old(owner_bits) {
            GC_OLD_MARKED
        } else {
            GC_MARKED
        };
        header.exchange((word & !3) | mark_bits as usize);
        self.setmark_meta(payload, mark_bits);
    }

    /// Pushes `parent` to the collector's remembered set when the frame's
    /// `nptr` says old-parent and some-child-young.
    fn push_remset(&mut self, parent: *mut u8, nptr: usize) {
        if nptr & 0x3 == 0x3 {
            // SAFETY: collector-owned Ptls; see `cache`.
            unsafe {
                (*self.ptls).remset_nptr += nptr >> 2;
                (*self.ptls).remset.push(parent);
            }
        }
    }

    /// Marks and queues a root. Returns whether the object is young.
    pub(crate) fn queue_obj(&mut self, obj: *mut u8) -> bool {
        let mut nptr = 0;
        if let Some((tag, bits)) = self.try_setmark(obj, &mut nptr) {
            self.stack().push(FrameKind::MarkedObj, FrameData::Obj(ObjFrame { obj, tag, bits }));
        }
        nptr & 1 != 0
    }

    /// Queues an already-marked object for traversal only.
    pub(crate) fn queue_scan_obj(&mut self, obj: *mut u8) {
        // SAFETY: obj is a managed cell.
        let header = unsafe { &*CellHeader::of(obj) };
        let word = header.word();
        self.stack().push(
            FrameKind::ScanOnly,
            FrameData::Obj(ObjFrame {
                obj,
                tag: word & !3,
                bits: (word & 3) as u8,
            }),
        );
    }

    /// Queues a finalizer slot list starting at `start`.
    pub(crate) fn queue_finlist(&mut self, items: &[usize], start: usize) {
        if items.len() <= start {
            return;
        }
        self.stack().push(
            FrameKind::Finlist,
            FrameData::Finlist(FinlistFrame {
                items: items.as_ptr(),
                len: items.len(),
                idx: start,
            }),
        );
    }

    // ------------------------------------------------------------------
    // The loop
    // ------------------------------------------------------------------

    /// Drains the mark stack.
    pub(crate) fn mark_loop(&mut self) {
        while let Some((kind, data)) = self.stack().pop() {
            match (kind, data) {
                (FrameKind::MarkedObj, FrameData::Obj(f)) => self.scan_obj(f, true),
                (FrameKind::ScanOnly, FrameData::Obj(f)) => self.scan_obj(f, false),
                (FrameKind::Finlist, FrameData::Finlist(f)) => self.scan_finlist(f),
                (FrameKind::ObjArray, FrameData::ObjArray(f)) => self.scan_objarray(f),
                (FrameKind::Array8, FrameData::Array8(f)) => self.scan_array8(f),
                (FrameKind::Array16, FrameData::Array16(f)) => self.scan_array16(f),
                (FrameKind::Obj8, FrameData::Obj8(f)) => self.scan_obj8(f),
                (FrameKind::Obj16, FrameData::Obj16(f)) => self.scan_obj16(f),
                (FrameKind::Obj32, FrameData::Obj32(f)) => self.scan_obj32(f),
                (FrameKind::Stack, FrameData::Stack(f)) => self.scan_stack(f),
                (FrameKind::ExcStack, FrameData::ExcStack(f)) => self.scan_excstack(f),
                (FrameKind::ModuleBinding, FrameData::Module(f)) => self.scan_module(f),
                _ => corruption_abort("mark stacks disagree on frame kind"),
            }
        }
    }

    /// Generic scanning entry: metadata update (unless `ScanOnly`), then
    /// dispatch on the type descriptor.
    fn scan_obj(&mut self, f: ObjFrame, update_meta: bool) {
        let ObjFrame { obj, tag, bits } = f;
        let ty = tag as *const TypeDescriptor;
        if ty.is_null() || tag & 0x7 != 0 {
            corruption_abort("invalid type descriptor in header");
        }
        // SAFETY: descriptors are 'static and the tag was validated.
        let ty = unsafe { &*ty };
        match ty.layout {
            TypeLayout::Opaque | TypeLayout::Buffer => {
                if update_meta {
                    self.setmark_meta(obj, bits);
                }
            }
            TypeLayout::WeakRef => {
                // The target slot is weak: never traced here, cleared by
                // the post-mark sweep when the target dies.
                if update_meta {
                    self.setmark_meta(obj, bits);
                }
            }
            TypeLayout::Ptr8(offsets) => {
                if update_meta {
                    self.setmark_meta(obj, bits);
                }
                if !offsets.is_empty() {
                    let nptr = (offsets.len() << 2) | (bits & 2) as usize;
                    self.stack().push(
                        FrameKind::Obj8,
                        FrameData::Obj8(Obj8Frame {
                            parent: obj,
                            offsets,
                            nptr,
                        }),
                    );
                }
            }
            TypeLayout::Ptr16(offsets) => {
                if update_meta {
                    self.setmark_meta(obj, bits);
                }
                if !offsets.is_empty() {
                    let nptr = (offsets.len() << 2) | (bits & 2) as usize;
                    self.stack().push(
                        FrameKind::Obj16,
                        FrameData::Obj16(Obj16Frame {
                            parent: obj,
                            offsets,
                            nptr,
                        }),
                    );
                }
            }
            TypeLayout::Ptr32(offsets) => {
                if update_meta {
                    self.setmark_meta(obj, bits);
                }
                if !offsets.is_empty() {
                    let nptr = (offsets.len() << 2) | (bits & 2) as usize;
                    self.stack().push(
                        FrameKind::Obj32,
                        FrameData::Obj32(Obj32Frame {
                            parent: obj,
                            offsets,
                            nptr,
                        }),
                    );
                }
            }
            TypeLayout::Array => self.scan_array_obj(obj, bits, update_meta),
            TypeLayout::Module => {
                if update_meta {
                    self.setmark_meta(obj, bits);
                }
                // SAFETY: Module layout promises a ModuleRepr payload.
                let m = unsafe { &*obj.cast::<ModuleRepr>() };
                let nptr =
                    ((m.bindings_len + m.usings_len + 1) << 2) | (bits & 2) as usize;
                self.stack().push(
                    FrameKind::ModuleBinding,
                    FrameData::Module(ModuleFrame {
                        module: obj,
                        nptr,
                        bits,
                    }),
                );
            }
            TypeLayout::Task { extra } => self.scan_task_obj(obj, bits, extra, update_meta),
            TypeLayout::Foreign { mark, .. } => {
                if update_meta {
                    self.setmark_meta(obj, bits);
                }
                let mut queued = Vec::new();
                // SAFETY: Foreign layout promises a mark hook matching the
                // object's shape.
                unsafe { mark(obj, &mut |child| queued.push(child)) };
                for child in queued {
                    self.queue_obj(child);
                }
            }
        }
    }

    fn scan_array_obj(&mut self, obj: *mut u8, bits: u8, update_meta: bool) {
        if update_meta {
            self.setmark_meta(obj, bits);
        }
        // SAFETY: Array layout promises an ArrayRepr payload.
        let a = unsafe { &*obj.cast::<ArrayRepr>() };
        match a.how {
            ArrayHow::SharedBuffer => self.setmark_buf(a.owner, bits),
            ArrayHow::Malloced => {
                if update_meta {
                    if bits == GC_OLD_MARKED {
                        self.cache().perm_scanned_bytes += a.data_bytes();
                    } else {
                        self.cache().scanned_bytes += a.data_bytes();
                    }
                }
            }
            ArrayHow::Owned => {
                let mut nptr = (1 << 2) | (bits & 2) as usize;
                let marked = self.try_setmark(a.owner, &mut nptr);
                self.push_remset(obj, nptr);
                if let Some((tag, obits)) = marked {
                    self.stack().push(
                        FrameKind::MarkedObj,
                        FrameData::Obj(ObjFrame {
                            obj: a.owner,
                            tag,
                            bits: obits,
                        }),
                    );
                }
                return;
            }
            ArrayHow::Inline => {}
        }
        if a.data.is_null() || a.length == 0 {
            return;
        }
        let step = a.elsize / WORD;
        match a.elem {
            ArrayElem::Bits => {}
            ArrayElem::Refs => {
                let begin = a.data.cast::<*mut u8>();
                let nptr = (a.length << 2) | (bits & 2) as usize;
                self.stack().push(
                    FrameKind::ObjArray,
                    FrameData::ObjArray(ObjArrayFrame {
                        parent: obj,
                        begin,
                        // SAFETY: length elements of elsize bytes.
                        end: unsafe { begin.add(a.length * step) },
                        step,
                        nptr,
                    }),
                );
            }
            ArrayElem::Inline8 { offsets } => {
                let begin = a.data.cast::<*mut u8>();
                let nptr = ((a.length * offsets.len()) << 2) | (bits & 2) as usize;
                self.stack().push(
                    FrameKind::Array8,
                    FrameData::Array8(ArrayFrame8 {
                        begin,
                        end: unsafe { begin.add(a.length * step) },
                        elsize: step,
                        offsets,
                        parent: obj,
                        nptr,
                    }),
                );
            }
            ArrayElem::Inline16 { offsets } => {
                let begin = a.data.cast::<*mut u8>();
                let nptr = ((a.length * offsets.len()) << 2) | (bits & 2) as usize;
                self.stack().push(
                    FrameKind::Array16,
                    FrameData::Array16(ArrayFrame16 {
                        begin,
                        end: unsafe { begin.add(a.length * step) },
                        elsize: step,
                        offsets,
                        parent: obj,
                        nptr,
                    }),
                );
            }
        }
    }

    fn scan_task_obj(&mut self, obj: *mut u8, bits: u8, extra: &'static [u8], update_meta: bool) {
        if update_meta {
            self.setmark_meta(obj, bits);
        }
        // SAFETY: Task layout promises a TaskRepr payload.
        let t = unsafe { &*obj.cast::<TaskRepr>() };
        if self.collector.callbacks.has_task_scanner() {
            let is_root = crate::thread::all_threads().iter().any(|tcb| {
                // SAFETY: stopped-world snapshot.
                unsafe { tcb.ptls() }.root_task == obj
            });
            self.collector.callbacks.invoke_task_scanner(obj, is_root);
        }
        if !t.gcstack.is_null() {
            // SAFETY: the runtime keeps shadow frames alive while the task
            // lives.
            let nroots = unsafe { (*t.gcstack).nroots };
            self.stack().push(
                FrameKind::Stack,
                FrameData::Stack(StackFrame {
                    frame: t.gcstack,
                    i: 0,
                    nroots,
                    offset: 0,
                    lb: 0,
                    ub: usize::MAX,
                }),
            );
        }
        if !t.excstack.is_null() {
            self.setmark_buf(t.excstack, bits);
            let stack = t.excstack.cast::<ExcStackData>();
            // SAFETY: excstack buffers hold an ExcStackData header.
            let itr = unsafe { (*stack).top };
            self.stack().push(
                FrameKind::ExcStack,
                FrameData::ExcStack(ExcStackFrame { stack, itr }),
            );
        }
        if !extra.is_empty() {
            // Tasks are assumed to always reference young objects: the
            // young flag starts set so old tasks stay remembered.
            let nptr = (extra.len() << 2) | 1 | bits as usize;
            self.stack().push(
                FrameKind::Obj8,
                FrameData::Obj8(Obj8Frame {
                    parent: obj,
                    offsets: extra,
                    nptr,
                }),
            );
        }
    }

    fn scan_finlist(&mut self, f: FinlistFrame) {
        let FinlistFrame { items, len, idx } = f;
        let mut i = idx;
        while i < len {
            // SAFETY: the list outlives the mark phase.
            let mut v = unsafe { *items.add(i) };
            i += 1;
            if v == 0 {
                continue;
            }
            if v & 1 != 0 {
                // Native finalizer: the next slot is a raw function
                // pointer, not a managed object.
                v &= !1;
                i += 1;
            }
            if v & 2 != 0 {
                // Already freed; fires regardless of reachability.
                continue;
            }
            let obj = (v & !3) as *mut u8;
            let mut nptr = 0;
            if let Some((tag, bits)) = self.try_setmark(obj, &mut nptr) {
                self.stack().push(
                    FrameKind::MarkedObj,
                    FrameData::Obj(ObjFrame { obj, tag, bits }),
                );
            }
        }
    }

    fn scan_objarray(&mut self, f: ObjArrayFrame) {
        let ObjArrayFrame {
            parent,
            begin,
            end,
            step,
            mut nptr,
        } = f;
        let mut p = begin;
        while p < end {
            // SAFETY: slots inside the array's element storage.
            let child = unsafe { *p };
            if let Some((tag, bits)) = self.try_setmark(child, &mut nptr) {
                self.stack().push(
                    FrameKind::MarkedObj,
                    FrameData::Obj(ObjFrame {
                        obj: child,
                        tag,
                        bits,
                    }),
                );
            }
            p = unsafe { p.add(step) };
        }
        self.push_remset(parent, nptr);
    }

    fn scan_array8(&mut self, f: ArrayFrame8) {
        let ArrayFrame8 {
            begin,
            end,
            elsize,
            offsets,
            parent,
            mut nptr,
        } = f;
        let mut elem = begin;
        while elem < end {
            for &off in offsets {
                // SAFETY: field offsets stay within one element.
                let child = unsafe { *elem.add(off as usize) };
                if let Some((tag, bits)) = self.try_setmark(child, &mut nptr) {
                    self.stack().push(
                        FrameKind::MarkedObj,
                        FrameData::Obj(ObjFrame {
                            obj: child,
                            tag,
                            bits,
                        }),
                    );
                }
            }
            elem = unsafe { elem.add(elsize) };
        }
        self.push_remset(parent, nptr);
    }

    fn scan_array16(&mut self, f: ArrayFrame16) {
        let ArrayFrame16 {
            begin,
            end,
            elsize,
            offsets,
            parent,
            mut nptr,
        } = f;
        let mut elem = begin;
        while elem < end {
            for &off in offsets {
                // SAFETY: field offsets stay within one element.
                let child = unsafe { *elem.add(off as usize) };
                if let Some((tag, bits)) = self.try_setmark(child, &mut nptr) {
                    self.stack().push(
                        FrameKind::MarkedObj,
                        FrameData::Obj(ObjFrame {
                            obj: child,
                            tag,
                            bits,
                        }),
                    );
                }
            }
            elem = unsafe { elem.add(elsize) };
        }
        self.push_remset(parent, nptr);
    }

    fn scan_obj8(&mut self, f: Obj8Frame) {
        let Obj8Frame {
            parent,
            offsets,
            mut nptr,
        } = f;
        let base = parent.cast::<*mut u8>();
        for &off in offsets {
            // SAFETY: the offset map matches the object's layout.
            let child = unsafe { *base.add(off as usize) };
            if let Some((tag, bits)) = self.try_setmark(child, &mut nptr) {
                self.stack().push(
                    FrameKind::MarkedObj,
                    FrameData::Obj(ObjFrame {
                        obj: child,
                        tag,
                        bits,
                    }),
                );
            }
        }
        self.push_remset(parent, nptr);
    }

    fn scan_obj16(&mut self, f: Obj16Frame) {
        let Obj16Frame {
            parent,
            offsets,
            mut nptr,
        } = f;
        let base = parent.cast::<*mut u8>();
        for &off in offsets {
            // SAFETY: the offset map matches the object's layout.
            let child = unsafe { *base.add(off as usize) };
            if let Some((tag, bits)) = self.try_setmark(child, &mut nptr) {
                self.stack().push(
                    FrameKind::MarkedObj,
                    FrameData::Obj(ObjFrame {
                        obj: child,
                        tag,
                        bits,
                    }),
                );
            }
        }
        self.push_remset(parent, nptr);
    }

    fn scan_obj32(&mut self, f: Obj32Frame) {
        let Obj32Frame {
            parent,
            offsets,
            mut nptr,
        } = f;
        let base = parent.cast::<*mut u8>();
        for &off in offsets {
            // SAFETY: the offset map matches the object's layout.
            let child = unsafe { *base.add(off as usize) };
            if let Some((tag, bits)) = self.try_setmark(child, &mut nptr) {
                self.stack().push(
                    FrameKind::MarkedObj,
                    FrameData::Obj(ObjFrame {
                        obj: child,
                        tag,
                        bits,
                    }),
                );
            }
        }
        self.push_remset(parent, nptr);
    }

    fn scan_stack(&mut self, f: StackFrame) {
        let StackFrame {
            mut frame,
            i,
            mut nroots,
            offset,
            lb,
            ub,
        } = f;
        // The first frame may resume mid-way (stolen or re-pushed work).
        let mut start = i as usize;
        while !frame.is_null() {
            // SAFETY: shadow frames are live while their task is.
            let roots = unsafe { ShadowFrame::roots(frame) };
            let nr = ShadowFrame::count(nroots);
            let indirect = ShadowFrame::indirect(nroots);
            for i in start..nr {
                let slot = unsafe { roots.add(i) };
                let obj = if indirect {
                    let slotp = read_stack(slot.cast(), offset, lb, ub);
                    if slotp == 0 {
                        continue;
                    }
                    read_stack(slotp as *const usize, offset, lb, ub)
                } else {
                    read_stack(slot.cast(), offset, lb, ub)
                } as *mut u8;
                let mut nptr = 0;
                if let Some((tag, bits)) = self.try_setmark(obj, &mut nptr) {
                    self.stack().push(
                        FrameKind::MarkedObj,
                        FrameData::Obj(ObjFrame { obj, tag, bits }),
                    );
                }
            }
            start = 0;
            frame = read_stack(
                unsafe { std::ptr::addr_of!((*frame).prev) }.cast(),
                offset,
                lb,
                ub,
            ) as *mut ShadowFrame;
            if !frame.is_null() {
                nroots = read_stack(
                    unsafe { std::ptr::addr_of!((*frame).nroots) },
                    offset,
                    lb,
                    ub,
                );
            }
        }
    }

    fn scan_excstack(&mut self, f: ExcStackFrame) {
        let ExcStackFrame { stack, mut itr } = f;
        // SAFETY: the buffer stays alive; it was marked by the task scan.
        let data = unsafe { ExcStackData::data(stack) };
        while itr > 0 {
            let exc = unsafe { *data.add(itr - 1) } as *mut u8;
            let mut nptr = 0;
            if let Some((tag, bits)) = self.try_setmark(exc, &mut nptr) {
                self.stack().push(
                    FrameKind::MarkedObj,
                    FrameData::Obj(ObjFrame {
                        obj: exc,
                        tag,
                        bits,
                    }),
                );
            }
            let nbt = unsafe { *data.add(itr - 2) };
            for k in 0..nbt {
                let word = unsafe { *data.add(itr - 2 - nbt + k) };
                if ExcStackData::bt_entry_is_managed(word) {
                    let obj = ExcStackData::bt_entry_value(word);
                    let mut nptr = 0;
                    if let Some((tag, bits)) = self.try_setmark(obj, &mut nptr) {
                        self.stack().push(
                            FrameKind::MarkedObj,
                            FrameData::Obj(ObjFrame { obj, tag, bits }),
                        );
                    }
                }
            }
            itr -= 2 + nbt;
        }
    }

    fn scan_module(&mut self, f: ModuleFrame) {
        let ModuleFrame {
            module,
            mut nptr,
            bits,
        } = f;
        // SAFETY: Module layout promises a ModuleRepr payload.
        let m = unsafe { &*module.cast::<ModuleRepr>() };
        for idx in 0..m.bindings_len {
            // SAFETY: the binding table is runtime-owned storage.
            let bnd = unsafe { *m.bindings.add(idx) };
            if bnd.is_null() {
                continue;
            }
            // Binding cells are marked with their module's bits.
            self.setmark_buf(bnd, bits);
            // SAFETY: binding cells hold a BindingRepr payload.
            let value = unsafe { (*bnd.cast::<crate::rt::BindingRepr>()).value };
            if let Some((tag, vbits)) = self.try_setmark(value, &mut nptr) {
                self.stack().push(
                    FrameKind::MarkedObj,
                    FrameData::Obj(ObjFrame {
                        obj: value,
                        tag,
                        bits: vbits,
                    }),
                );
            }
        }
        for idx in 0..m.usings_len {
            // SAFETY: the usings table is runtime-owned storage.
            let used = unsafe { *m.usings.add(idx) };
            if let Some((tag, ubits)) = self.try_setmark(used, &mut nptr) {
                self.stack().push(
                    FrameKind::MarkedObj,
                    FrameData::Obj(ObjFrame {
                        obj: used,
                        tag,
                        bits: ubits,
                    }),
                );
            }
        }
        let parent_marked = self.try_setmark(m.parent, &mut nptr);
        self.push_remset(module, nptr);
        if let Some((tag, pbits)) = parent_marked {
            self.stack().push(
                FrameKind::MarkedObj,
                FrameData::Obj(ObjFrame {
                    obj: m.parent,
                    tag,
                    bits: pbits,
                }),
            );
        }
    }

    // ------------------------------------------------------------------
    // Roots
    // ------------------------------------------------------------------

    /// Queues one thread's local roots: its tasks and any managed values
    /// in its backtrace buffer.
    pub(crate) fn queue_thread_local(&mut self, target: &Ptls) {
        for task in [
            target.root_task,
            target.current_task,
            target.next_task,
            target.previous_task,
        ] {
            if !task.is_null() {
                self.queue_obj(task);
            }
        }
        for &word in &target.bt_buffer {
            if ExcStackData::bt_entry_is_managed(word) {
                self.queue_obj(ExcStackData::bt_entry_value(word));
            }
        }
    }

    /// Queues one thread's frozen remset and remembered bindings. Bindings
    /// stay remembered only while their value is still young.
    pub(crate) fn queue_remset(&mut self, target: &mut Ptls) {
        for i in 0..target.last_remset.len() {
            self.queue_scan_obj(target.last_remset[i]);
        }
        let mut kept = 0;
        for i in 0..target.rem_bindings.len() {
            let bnd = target.rem_bindings[i];
            // SAFETY: binding cells hold a BindingRepr payload.
            let value = unsafe { (*bnd.cast::<crate::rt::BindingRepr>()).value };
            if !value.is_null() && self.queue_obj(value) {
                target.rem_bindings[kept] = bnd;
                kept += 1;
            }
        }
        target.rem_bindings.truncate(kept);
    }

    /// Queues the global roots: the module tree and registered always-
    /// reachable values.
    pub(crate) fn queue_global_roots(&mut self) {
        let root_module = self
            .collector
            .root_module
            .load(std::sync::atomic::Ordering::Relaxed);
        if !root_module.is_null() {
            self.queue_obj(root_module);
        }
        let globals = self.collector.global_roots.lock().clone();
        for obj in globals {
            self.queue_obj(obj as *mut u8);
        }
    }

    pub(crate) fn invoke_root_scanners(&mut self, callbacks: &Callbacks, full: bool) {
        if callbacks.has_root_scanner() {
            callbacks.invoke_root_scanner(full);
        }
    }
}

/// Fatal invariant failure during marking: print diagnostics and abort.
#[cold]
pub(crate) fn corruption_abort(what: &str) -> ! {
    eprintln!("veld-gc: fatal heap corruption detected during marking: {what}");
    std::process::abort();
}
