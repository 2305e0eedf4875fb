//! Lock types and the guard they hand out.
//!
//! Two flavors, both built on the same `{holder_tid, condition}` shape the
//! concurrency model describes: `Spinlock` never sleeps, and
//! `Sleepablelock` is a spinlock whose guard can additionally `sleep`/
//! `wakeup` on a `WaitChannel` (used by the VirtIO driver and the
//! filesystem, whose critical sections must suspend waiting for a device).

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

mod sleepablelock;
mod spinlock;

pub use sleepablelock::{Sleepablelock, SleepablelockGuard};
pub use spinlock::{RawSpinlock, Spinlock, SpinlockGuard};

/// Common behavior of the raw lock a `Lock<L, T>` is built on.
pub trait RawLock {
    fn acquire(&self);
    fn release(&self);
    fn holding(&self) -> bool;
}

/// A lock that owns the raw lock and the data it guards.
pub struct Lock<L: RawLock, T> {
    pub(crate) lock: L,
    data: UnsafeCell<T>,
}

// SAFETY: `T: Send` plus the raw lock's mutual exclusion makes `Lock<L, T>`
// safe to share across threads.
unsafe impl<L: RawLock, T: Send> Sync for Lock<L, T> {}

impl<L: RawLock, T> Lock<L, T> {
    pub fn lock(&self) -> Guard<'_, L, T> {
        self.lock.acquire();
        Guard { lock: self }
    }

    /// Returns a raw pointer to the guarded data, bypassing the lock.
    ///
    /// # Safety
    /// The caller must otherwise ensure exclusive or read-only access.
    pub unsafe fn get_mut_raw(&self) -> *mut T {
        self.data.get()
    }
}

/// A held lock, granting access to the guarded data for as long as it
/// lives. Dropping it releases the lock.
pub struct Guard<'s, L: RawLock, T> {
    lock: &'s Lock<L, T>,
}

impl<L: RawLock, T> Deref for Guard<'_, L, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: holding the guard implies holding the lock.
        unsafe { &*self.lock.data.get() }
    }
}

impl<L: RawLock, T> DerefMut for Guard<'_, L, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: holding the guard implies holding the lock.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<L: RawLock, T> Drop for Guard<'_, L, T> {
    fn drop(&mut self) {
        self.lock.lock.release();
    }
}

impl<'s, L: RawLock, T> Guard<'s, L, T> {
    /// Temporarily releases the lock, runs `f`, then reacquires it.
    ///
    /// Used to release a lock across a `WaitChannel::sleep` and reacquire
    /// it once woken, without letting the caller observe the guarded data
    /// while the lock is not actually held.
    pub fn reacquire_after<R>(&mut self, f: impl FnOnce() -> R) -> R {
        self.lock.lock.release();
        let r = f();
        self.lock.lock.acquire();
        r
    }
}
