//! Epoch manager: global epoch, thread registry, and retire lists.
//!
//! Three-generation scheme. With global epoch `E`:
//!
//! - `retire_lists[E % 3]` collects new retirements,
//! - `retire_lists[(E - 1) % 3]` may still be observed by readers,
//! - `retire_lists[(E - 2) % 3]` is two generations old and safe to free.
//!
//! Advancing from `E` to `E + 1` therefore drains `(E - 1) % 3`.

use crate::retired::RetiredNode;
use crate::ttas::TTas;
use core::cell::Cell;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, Ordering};
use std::sync::Arc;

/// Attempt epoch advancement only every this many outermost unpins.
const ADVANCE_INTERVAL: u32 = 64;

/// Process-wide manager id source. Ids are never reused, so a thread's
/// cached binding can never be confused by an old manager's address being
/// recycled for a new one.
static NEXT_MANAGER_ID: AtomicU64 = AtomicU64::new(1);

/// Per-(manager, OS thread) record, linked into the manager's intrusive
/// thread list. Entries are pushed once and never unlinked while the manager
/// lives; `alive` goes false when the owning thread exits or rebinds to a
/// different manager.
pub(crate) struct ThreadEntry {
    /// Epoch this thread observed at its outermost pin.
    pub(crate) local_epoch: AtomicU64,
    /// True while guard nesting > 0.
    pub(crate) active: AtomicBool,
    /// False once the owning thread has let go of this entry.
    pub(crate) alive: AtomicBool,
    /// Guard nesting depth. Owner thread only.
    nesting: Cell<u32>,
    /// Outermost unpins since the last advance attempt. Owner thread only.
    unpins: Cell<u32>,
    /// Next entry in the intrusive thread list.
    next: AtomicPtr<ThreadEntry>,
}

impl ThreadEntry {
    fn new() -> Self {
        Self {
            local_epoch: AtomicU64::new(0),
            active: AtomicBool::new(false),
            alive: AtomicBool::new(true),
            nesting: Cell::new(0),
            unpins: Cell::new(0),
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }
}

// SAFETY: the Cell fields are only touched by the thread the entry belongs
// to; every field read across threads is atomic.
unsafe impl Send for ThreadEntry {}
unsafe impl Sync for ThreadEntry {}

/// Treiber stack of retired objects awaiting destruction.
struct RetireList {
    head: AtomicPtr<RetiredNode>,
}

impl RetireList {
    const fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Lock-free push.
    ///
    /// # Safety
    ///
    /// `node` must be valid, unlinked, and have its destructor installed.
    unsafe fn push(&self, node: *mut RetiredNode) {
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            // SAFETY: the node is not yet published; this store is not racy.
            unsafe { (*node).next.store(head, Ordering::Relaxed) };
            match self
                .head
                .compare_exchange_weak(head, node, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(current) => head = current,
            }
        }
    }

    /// Atomically detach the whole list and destroy every node.
    fn drain(&self) {
        let mut node = self.head.swap(ptr::null_mut(), Ordering::Acquire);
        while !node.is_null() {
            // SAFETY: the exchange above made this chain exclusively ours.
            let next = unsafe { (*node).next.load(Ordering::Relaxed) };
            let destructor = unsafe { (*node).destructor };
            if let Some(destructor) = destructor {
                // SAFETY: installed by retire() for exactly this object.
                unsafe { destructor(node) };
            }
            node = next;
        }
    }
}

/// Epoch-based reclamation manager.
///
/// Typically owned by the data structure whose garbage it collects, one per
/// container. Threads are registered lazily on first [`pin`](Self::pin) and a
/// thread's registration is dropped when it exits. A thread is bound to one
/// manager at a time: touching a second manager retires the binding to the
/// first, so no guard on the first manager may be live at that point (the
/// owning container upholds this by pinning around single operations).
pub struct EpochManager {
    id: u64,
    global_epoch: AtomicU64,
    threads: AtomicPtr<ThreadEntry>,
    retire_lists: [RetireList; 3],
    advance: TTas<()>,
}

impl EpochManager {
    /// Create a manager with an empty thread registry at epoch 0.
    pub fn new() -> Self {
        Self {
            id: NEXT_MANAGER_ID.fetch_add(1, Ordering::Relaxed),
            global_epoch: AtomicU64::new(0),
            threads: AtomicPtr::new(ptr::null_mut()),
            retire_lists: [RetireList::new(), RetireList::new(), RetireList::new()],
            advance: TTas::new(()),
        }
    }

    /// Stable identity of this manager, used by the thread-local binding.
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Hand an object over for deferred destruction.
    ///
    /// The object is destroyed once every thread pinned at the current epoch
    /// has unpinned (two epoch advances from now).
    ///
    /// # Safety
    ///
    /// - `ptr` came from `Box::into_raw` and the pointee is `#[repr(C)]` with
    ///   a [`RetiredNode`] as its first field.
    /// - `ptr` is retired at most once and never accessed by the caller
    ///   afterwards.
    /// - Threads that may still reach the object hold a pin on *this*
    ///   manager.
    pub unsafe fn retire<T: 'static>(&self, ptr: *mut T) {
        unsafe fn drop_boxed<T>(node: *mut RetiredNode) {
            // SAFETY: `node` is the offset-0 view of the `T` handed to
            // retire(); reconstructing the Box runs T's destructor.
            unsafe { drop(Box::from_raw(node as *mut T)) };
        }

        let node = ptr as *mut RetiredNode;
        // SAFETY: caller guarantees the RetiredNode-at-offset-0 layout, and
        // the node is not yet shared.
        unsafe { (*node).destructor = Some(drop_boxed::<T>) };

        let epoch = self.global_epoch.load(Ordering::Relaxed);
        // SAFETY: node is valid and its destructor was installed above.
        unsafe { self.retire_lists[(epoch % 3) as usize].push(node) };
        self.try_advance();
    }

    /// Enter the calling thread into the pinned state on `entry`.
    pub(crate) fn pin_entry(&self, entry: &ThreadEntry) {
        let nesting = entry.nesting.get();
        entry.nesting.set(nesting + 1);
        if nesting == 0 {
            // Relaxed is enough for the flag: try_advance pairs it with the
            // release publication of local_epoch below.
            entry.active.store(true, Ordering::Relaxed);
            entry
                .local_epoch
                .store(self.global_epoch.load(Ordering::Acquire), Ordering::Release);
        }
    }

    /// Leave the pinned state on `entry`; outermost unpins occasionally try
    /// to advance the epoch.
    pub(crate) fn unpin_entry(&self, entry: &ThreadEntry) {
        let nesting = entry.nesting.get();
        debug_assert!(nesting > 0, "unpin without matching pin");
        entry.nesting.set(nesting - 1);
        if nesting == 1 {
            entry.active.store(false, Ordering::Release);
            let unpins = entry.unpins.get() + 1;
            if unpins >= ADVANCE_INTERVAL {
                entry.unpins.set(0);
                self.try_advance();
            } else {
                entry.unpins.set(unpins);
            }
        }
    }

    /// Allocate and link a fresh entry for the calling thread.
    ///
    /// The returned pointer carries **two** strong counts: one owned by the
    /// manager's thread list (released at manager teardown) and one owned by
    /// the calling thread's handle (released on thread exit or rebinding).
    pub(crate) fn register_thread(&self) -> *const ThreadEntry {
        let entry = Arc::into_raw(Arc::new(ThreadEntry::new()));
        // SAFETY: `entry` is a live Arc allocation from the line above.
        unsafe { Arc::increment_strong_count(entry) };

        let mut head = self.threads.load(Ordering::Relaxed);
        loop {
            // SAFETY: the entry is not reachable by other threads until the
            // exchange below succeeds.
            unsafe { (*entry).next.store(head, Ordering::Relaxed) };
            match self.threads.compare_exchange_weak(
                head,
                entry as *mut ThreadEntry,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return entry,
                Err(current) => head = current,
            }
        }
    }

    /// Attempt to advance the global epoch and drain the generation that has
    /// fallen two behind.
    ///
    /// Advancing is legal once every alive, active thread has published a
    /// local epoch at least as recent as the global one. Contenders skip the
    /// attempt entirely; someone else is already scanning.
    fn try_advance(&self) {
        let Some(_adv) = self.advance.try_lock() else {
            return;
        };

        let epoch = self.global_epoch.load(Ordering::Acquire);

        let mut cursor = self.threads.load(Ordering::Acquire);
        while !cursor.is_null() {
            // SAFETY: entries stay allocated for the manager's lifetime.
            let entry = unsafe { &*cursor };
            if entry.alive.load(Ordering::Acquire)
                && entry.active.load(Ordering::Acquire)
                && entry.local_epoch.load(Ordering::Acquire) < epoch
            {
                // A reader has not yet observed the current epoch.
                return;
            }
            cursor = entry.next.load(Ordering::Acquire);
        }

        let new_epoch = epoch + 1;
        self.global_epoch.store(new_epoch, Ordering::Release);

        // new_epoch >= 2 also keeps the subtraction from underflowing.
        if new_epoch >= 2 {
            self.retire_lists[((new_epoch - 2) % 3) as usize].drain();
        }
    }
}

impl Default for EpochManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for EpochManager {
    fn drop(&mut self) {
        // No thread can be pinned here (drop is exclusive), so everything
        // still queued is safe to destroy.
        for list in &self.retire_lists {
            list.drain();
        }

        let mut cursor = *self.threads.get_mut();
        while !cursor.is_null() {
            let next = unsafe { (*cursor).next.load(Ordering::Relaxed) };
            // SAFETY: releases the thread list's strong count; the entry is
            // freed once the owning thread's handle lets go as well.
            unsafe { drop(Arc::from_raw(cursor as *const ThreadEntry)) };
            cursor = next;
        }
    }
}
