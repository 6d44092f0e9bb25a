//! Observer callbacks for external tooling.
//!
//! Six chains of plain function pointers: root scanner, task scanner,
//! pre-GC, post-GC, and external allocation/free notifications.
//! Registration is idempotent (re-registering a function is a no-op) and
//! deregistration removes the first match.

use parking_lot::Mutex;

/// Extra-roots scanner, invoked after the builtin roots are queued.
/// `full` reports the collection kind.
pub type RootScannerCb = fn(full: bool);
/// Per-task scanner, invoked when the mark loop reaches a task cell.
pub type TaskScannerCb = fn(task: *mut u8, is_root_task: bool);
/// Invoked after the world is stopped, before marking.
pub type PreGcCb = fn(full: bool);
/// Invoked after the world is restarted.
pub type PostGcCb = fn(full: bool);
/// Invoked when a big object is allocated from the host allocator.
pub type NotifyExternalAllocCb = fn(addr: *mut u8, size: usize);
/// Invoked when a big object is returned to the host allocator.
pub type NotifyExternalFreeCb = fn(addr: *mut u8);

struct Chain<T: Copy + PartialEq> {
    list: Mutex<Vec<T>>,
}

impl<T: Copy + PartialEq> Chain<T> {
    const fn new() -> Self {
        Chain {
            list: Mutex::new(Vec::new()),
        }
    }

    fn set(&self, cb: T, enable: bool) {
        let mut list = self.list.lock();
        if enable {
            if !list.contains(&cb) {
                list.push(cb);
            }
        } else if let Some(pos) = list.iter().position(|&c| c == cb) {
            list.remove(pos);
        }
    }

    fn snapshot(&self) -> Vec<T> {
        self.list.lock().clone()
    }
}

/// The registration table of callback chains.
pub struct Callbacks {
    root_scanner: Chain<RootScannerCb>,
    task_scanner: Chain<TaskScannerCb>,
    pre_gc: Chain<PreGcCb>,
    post_gc: Chain<PostGcCb>,
    notify_external_alloc: Chain<NotifyExternalAllocCb>,
    notify_external_free: Chain<NotifyExternalFreeCb>,
}

impl Callbacks {
    pub(crate) const fn new() -> Callbacks {
        Callbacks {
            root_scanner: Chain::new(),
            task_scanner: Chain::new(),
            pre_gc: Chain::new(),
            post_gc: Chain::new(),
            notify_external_alloc: Chain::new(),
            notify_external_free: Chain::new(),
        }
    }

    /// Registers or removes a root-scanner callback.
    pub fn set_root_scanner(&self, cb: RootScannerCb, enable: bool) {
        self.root_scanner.set(cb, enable);
    }

    /// Registers or removes a task-scanner callback.
    pub fn set_task_scanner(&self, cb: TaskScannerCb, enable: bool) {
        self.task_scanner.set(cb, enable);
    }

    /// Registers or removes a pre-GC callback.
    pub fn set_pre_gc(&self, cb: PreGcCb, enable: bool) {
        self.pre_gc.set(cb, enable);
    }

    /// Registers or removes a post-GC callback.
    pub fn set_post_gc(&self, cb: PostGcCb, enable: bool) {
        self.post_gc.set(cb, enable);
    }

    /// Registers or removes an external-allocation callback.
    pub fn set_notify_external_alloc(&self, cb: NotifyExternalAllocCb, enable: bool) {
        self.notify_external_alloc.set(cb, enable);
    }

    /// Registers or removes an external-free callback.
    pub fn set_notify_external_free(&self, cb: NotifyExternalFreeCb, enable: bool) {
        self.notify_external_free.set(cb, enable);
    }

    pub(crate) fn invoke_root_scanner(&self, full: bool) {
        for cb in self.root_scanner.snapshot() {
            cb(full);
        }
    }

    pub(crate) fn invoke_task_scanner(&self, task: *mut u8, is_root_task: bool) {
        for cb in self.task_scanner.snapshot() {
            cb(task, is_root_task);
        }
    }

    pub(crate) fn invoke_pre_gc(&self, full: bool) {
        for cb in self.pre_gc.snapshot() {
            cb(full);
        }
    }

    pub(crate) fn invoke_post_gc(&self, full: bool) {
        for cb in self.post_gc.snapshot() {
            cb(full);
        }
    }

    pub(crate) fn notify_external_alloc(&self, addr: *mut u8, size: usize) {
        for cb in self.notify_external_alloc.snapshot() {
            cb(addr, size);
        }
    }

    pub(crate) fn notify_external_free(&self, addr: *mut u8) {
        for cb in self.notify_external_free.snapshot() {
            cb(addr);
        }
    }

    pub(crate) fn has_root_scanner(&self) -> bool {
        !self.root_scanner.list.lock().is_empty()
    }

    pub(crate) fn has_task_scanner(&self) -> bool {
        !self.task_scanner.list.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cb_a(_full: bool) {}
    fn cb_b(_full: bool) {}

    #[test]
    fn registration_is_idempotent() {
        let cbs = Callbacks::new();
        cbs.set_pre_gc(cb_a, true);
        cbs.set_pre_gc(cb_a, true);
        cbs.set_pre_gc(cb_a, true);
        assert_eq!(cbs.pre_gc.snapshot().len(), 1);
        cbs.set_pre_gc(cb_b, true);
        assert_eq!(cbs.pre_gc.snapshot().len(), 2);
        cbs.set_pre_gc(cb_a, false);
        assert_eq!(cbs.pre_gc.snapshot(), vec![cb_b as PreGcCb]);
        cbs.set_pre_gc(cb_a, false);
        assert_eq!(cbs.pre_gc.snapshot().len(), 1);
    }
}
