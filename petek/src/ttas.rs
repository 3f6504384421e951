//! TTAS (Test-Test-And-Set) spin mutex.

use core::cell::UnsafeCell;
use core::hint::spin_loop;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

/// A TTAS (Test-Test-And-Set) spin mutex wrapping the data it protects.
///
/// Acquisition leads with the test-and-set attempt, so the uncontended path
/// is a single exchange. Only on failure does [`lock`](Self::lock) fall back
/// to the test phase, spinning on a relaxed load (which stays in cache)
/// until the holder releases. Deliberately unfair, for sections that are
/// held briefly: a hash shard's writer side, an epoch manager's advance
/// step.
pub struct TTas<T: ?Sized> {
    held: AtomicBool,
    value: UnsafeCell<T>,
}

// SAFETY: the value is reachable only through a guard, and a guard exists on
// at most one thread at a time.
unsafe impl<T: ?Sized + Send> Send for TTas<T> {}
unsafe impl<T: ?Sized + Send> Sync for TTas<T> {}

impl<T> TTas<T> {
    /// Create a new TTAS wrapping `value`.
    pub const fn new(value: T) -> Self {
        Self {
            held: AtomicBool::new(false),
            value: UnsafeCell::new(value),
        }
    }
}

impl<T: ?Sized> TTas<T> {
    /// Acquire the lock, spinning until it is free.
    #[inline]
    pub fn lock(&self) -> TTasGuard<'_, T> {
        loop {
            if let Some(guard) = self.try_lock() {
                return guard;
            }
            // Contended: wait out the holder on a relaxed load before going
            // back to the exchange.
            while self.held.load(Ordering::Relaxed) {
                spin_loop();
            }
        }
    }

    /// Acquire the lock only if it is free right now.
    #[inline]
    pub fn try_lock(&self) -> Option<TTasGuard<'_, T>> {
        if self.held.swap(true, Ordering::Acquire) {
            None
        } else {
            Some(TTasGuard { lock: self })
        }
    }
}

/// RAII guard for the TTAS. Releases the lock on drop.
pub struct TTasGuard<'a, T: ?Sized> {
    lock: &'a TTas<T>,
}

impl<T: ?Sized> Deref for TTasGuard<'_, T> {
    type Target = T;
    #[inline]
    fn deref(&self) -> &T {
        // SAFETY: holding the guard means holding the lock.
        unsafe { &*self.lock.value.get() }
    }
}

impl<T: ?Sized> DerefMut for TTasGuard<'_, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: holding the guard means holding the lock.
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T: ?Sized> Drop for TTasGuard<'_, T> {
    #[inline]
    fn drop(&mut self) {
        self.lock.held.store(false, Ordering::Release);
    }
}
