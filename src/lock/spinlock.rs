//! Spin locks: mutual exclusion that busy-waits instead of sleeping.
//! Used for critical sections short enough that sleeping would cost more
//! than spinning, and for any section an interrupt handler also touches
//! (an ISR can never sleep).

use core::hint::spin_loop;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use super::{Guard, Lock, RawLock};
use crate::kernel::kernel;

const NO_HOLDER: u64 = u64::MAX;

/// Mutual exclusion lock that busy-waits.
pub struct RawSpinlock {
    name: &'static str,
    locked: AtomicBool,
    /// `Tid` of the holder, or `NO_HOLDER`. Used only for `holding()`
    /// assertions and deadlock diagnostics, never for correctness.
    holder: AtomicU64,
}

pub type Spinlock<T> = Lock<RawSpinlock, T>;
pub type SpinlockGuard<'s, T> = Guard<'s, RawSpinlock, T>;

impl RawSpinlock {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            locked: AtomicBool::new(false),
            holder: AtomicU64::new(NO_HOLDER),
        }
    }
}

impl RawLock for RawSpinlock {
    fn acquire(&self) {
        // Disable interrupts before touching `locked`, so an interrupt
        // handler on this hart can never observe the lock half-acquired.
        unsafe { push_off() };
        assert!(!self.holding(), "acquire: {} already held", self.name);

        while self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            spin_loop();
        }
        self.holder
            .store(kernel().scheduler().running_thread(), Ordering::Relaxed);
    }

    fn release(&self) {
        assert!(self.holding(), "release: {} not held", self.name);
        self.holder.store(NO_HOLDER, Ordering::Relaxed);
        self.locked.store(false, Ordering::Release);
        unsafe { pop_off() };
    }

    fn holding(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
            && self.holder.load(Ordering::Relaxed) == kernel().scheduler().running_thread()
    }
}

impl<T> Spinlock<T> {
    pub const fn new(name: &'static str, data: T) -> Self {
        Self {
            lock: RawSpinlock::new(name),
            data: core::cell::UnsafeCell::new(data),
        }
    }
}

/// Count of nested `push_off` calls on this hart, and whether interrupts
/// were enabled before the first of them. Since this kernel runs a single
/// hart, one global pair of counters is enough; a multi-hart port would
/// need one pair per hart.
static NOFF: AtomicU64 = AtomicU64::new(0);
static INTR_ENABLED_BEFORE: AtomicBool = AtomicBool::new(false);

/// `push_off`/`pop_off` are like `intr_off`/`intr_on` except matched: it
/// takes two `pop_off`s to undo two `push_off`s. If interrupts are
/// already off, `push_off` ... `pop_off` leaves them off.
///
/// # Safety
/// Must be paired with a later `pop_off` on the same hart.
pub unsafe fn push_off() {
    let was_enabled = crate::riscv::intr_get();
    crate::riscv::intr_off();
    if NOFF.load(Ordering::Relaxed) == 0 {
        INTR_ENABLED_BEFORE.store(was_enabled, Ordering::Relaxed);
    }
    NOFF.fetch_add(1, Ordering::Relaxed);
}

/// # Safety
/// Must be paired with an earlier `push_off`.
pub unsafe fn pop_off() {
    assert!(!crate::riscv::intr_get(), "pop_off: interruptible");
    let prev = NOFF.fetch_sub(1, Ordering::Relaxed);
    assert!(prev >= 1, "pop_off: unmatched");
    if prev == 1 && INTR_ENABLED_BEFORE.load(Ordering::Relaxed) {
        unsafe { crate::riscv::intr_on() };
    }
}
