//! Thread binding and the RAII epoch guard.
//!
//! Each OS thread caches the (manager, entry) pair it used most recently.
//! The common deployment (one manager for the whole process) binds once
//! per thread and never again; a thread that alternates between managers
//! pays one fresh entry per switch, with the abandoned entry marked dead so
//! `try_advance` skips it.

use crate::epoch::{EpochManager, ThreadEntry};
use core::cell::Cell;
use core::marker::PhantomData;
use core::ptr;
use core::sync::atomic::Ordering;
use std::sync::Arc;

thread_local! {
    static HANDLE: Handle = const { Handle::new() };
}

/// Per-thread single-entry cache of the most recently used manager binding.
struct Handle {
    /// Id of the bound manager; 0 when unbound. Ids are process-unique, so
    /// a dropped manager can never be mistaken for a live one.
    owner: Cell<u64>,
    entry: Cell<*const ThreadEntry>,
}

impl Handle {
    const fn new() -> Self {
        Self {
            owner: Cell::new(0),
            entry: Cell::new(ptr::null()),
        }
    }

    /// Mark the cached entry dead and give up this thread's reference.
    fn release(&self) {
        let entry = self.entry.get();
        if !entry.is_null() {
            // SAFETY: the handle owns one strong count on the entry, taken
            // in EpochManager::register_thread.
            unsafe {
                (*entry).active.store(false, Ordering::Release);
                (*entry).alive.store(false, Ordering::Release);
                drop(Arc::from_raw(entry));
            }
            self.entry.set(ptr::null());
            self.owner.set(0);
        }
    }

    /// Entry for `manager`, registering this thread on first contact.
    fn entry_for(&self, manager: &EpochManager) -> *const ThreadEntry {
        let id = manager.id();
        if self.owner.get() == id {
            return self.entry.get();
        }

        // Rebinding to a different manager orphans the previous entry.
        self.release();

        let entry = manager.register_thread();
        self.owner.set(id);
        self.entry.set(entry);
        entry
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.release();
    }
}

impl EpochManager {
    /// Enter a critical section on this manager.
    ///
    /// While the returned guard (or any nested guard) is live, objects
    /// retired to this manager are not destroyed. Guards are reentrant on
    /// the same thread: only the outermost pin publishes the epoch, and only
    /// the outermost drop clears it.
    pub fn pin(&self) -> EpochGuard<'_> {
        // During thread teardown the TLS handle may already be destroyed;
        // fall back to an unpinned guard, mirroring what the handle's own
        // destructor does with the entry.
        let entry = HANDLE
            .try_with(|handle| handle.entry_for(self))
            .unwrap_or(ptr::null());

        if !entry.is_null() {
            // SAFETY: the entry is kept alive by the handle's strong count
            // and by the manager (borrowed for 'guard) holding another.
            self.pin_entry(unsafe { &*entry });
        }

        EpochGuard {
            manager: self,
            entry,
            _not_send: PhantomData,
        }
    }
}

/// RAII guard for an epoch critical section.
///
/// Obtained from [`EpochManager::pin`]; unpins on drop on every exit path,
/// including unwinding. The guard is neither `Send` nor `Sync`: the pinned
/// state belongs to the creating thread.
pub struct EpochGuard<'a> {
    manager: &'a EpochManager,
    entry: *const ThreadEntry,
    _not_send: PhantomData<*mut ()>,
}

impl Drop for EpochGuard<'_> {
    #[inline]
    fn drop(&mut self) {
        if !self.entry.is_null() {
            // SAFETY: same lifetime argument as in pin(); the entry outlives
            // the guard because the guard borrows the manager.
            self.manager.unpin_entry(unsafe { &*self.entry });
        }
    }
}
