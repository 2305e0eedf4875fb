//! Fixed-contract collaborators this kernel builds on top of but does not
//! implement: the scheduler/timer, the trap dispatcher, and the early heap
//! allocator. Early boot, the trap-frame assembly, and the scheduler's
//! thread-switch machinery itself live outside this crate; what's declared
//! here is the surface this crate calls into, plus the `WaitChannel`
//! abstraction built on top of it.

use core::ffi::c_void;

/// Opaque thread identifier handed out by the scheduler.
pub type Tid = u64;

/// The scheduler/timer collaborator.
///
/// Provided by the surrounding system; this crate only calls it.
pub trait Scheduler {
    /// Identifier of the thread currently running on this hart.
    fn running_thread(&self) -> Tid;

    /// Suspends the calling thread until `condition_broadcast` is called on
    /// the same `chan`. The caller must not hold any lock the broadcaster
    /// also needs, other than locks released internally by the scheduler
    /// across the sleep (see `WaitChannel::sleep`).
    fn condition_wait(&self, chan: *const c_void);

    /// Wakes every thread sleeping on `chan`. Safe to call from interrupt
    /// context.
    fn condition_broadcast(&self, chan: *const c_void);

    /// Disables interrupt delivery on this hart and returns whether they
    /// were enabled beforehand, so the caller can restore the prior state.
    fn intr_disable(&self) -> bool;

    /// Restores interrupt delivery to the state `was_enabled` describes.
    fn intr_restore(&self, was_enabled: bool);

    /// Spawns a new kernel thread running `entry`, passing it `arg`.
    /// Returns its `Tid` on success.
    fn spawn_thread(&self, entry: extern "C" fn(*mut c_void), arg: *mut c_void) -> Option<Tid>;

    /// Terminates the calling thread with the given exit status, making it
    /// joinable. Never returns.
    fn thread_exit(&self, status: i32) -> !;

    /// Blocks until `tid` (or, if `None`, any thread) exits, then returns
    /// its exit status along with the tid that exited. `None` if there is
    /// no such thread to join.
    fn join_thread(&self, tid: Option<Tid>) -> Option<(Tid, i32)>;

    /// Suspends the calling thread for `ticks` timer ticks.
    fn alarm_sleep(&self, ticks: u64);
}

/// The trap dispatcher collaborator: delivers exception code and trap
/// frame to the registered S-mode and U-mode handlers.
pub trait TrapDispatcher {
    fn dispatch(&self, scause: u64, frame: &mut crate::trap::TrapFrame);
}

/// The early heap allocator collaborator, used for small variable-size
/// kernel objects before paging is fully initialized and for device
/// control blocks.
pub trait HeapAllocator {
    /// # Safety
    /// `size` must be nonzero. The returned pointer, if any, is valid for
    /// `size` bytes until passed to `free`.
    unsafe fn alloc(&self, size: usize) -> *mut u8;

    /// # Safety
    /// `ptr` must have come from `alloc` on the same allocator and not
    /// already have been freed.
    unsafe fn free(&self, ptr: *mut u8);
}

/// A sleep/wakeup rendezvous point, addressed by its own location so that
/// distinct channels never alias.
///
/// Mirrors the concurrency model's condition variable: a lock is the pair
/// `{holder_tid, condition}`; a caller that finds the lock held
/// `condition_wait`s on the lock's channel, and the releaser broadcasts on
/// it. `WaitChannel` itself carries no state of its own; it only identifies
/// a channel to the scheduler.
pub struct WaitChannel {
    /// Nonzero size so two `WaitChannel`s are never at the same address,
    /// which would make the scheduler confuse unrelated channels.
    _padding: u8,
}

impl WaitChannel {
    pub const fn new() -> Self {
        Self { _padding: 0 }
    }

    fn addr(&self) -> *const c_void {
        self as *const Self as *const c_void
    }

    /// Suspends the calling thread on this channel via the scheduler.
    pub fn sleep(&self, scheduler: &dyn Scheduler) {
        scheduler.condition_wait(self.addr());
    }

    /// Wakes every thread sleeping on this channel. Safe to call from an
    /// ISR: it only asks the scheduler to mark threads runnable again, it
    /// never blocks.
    pub fn wakeup(&self, scheduler: &dyn Scheduler) {
        scheduler.condition_broadcast(self.addr());
    }
}

impl Default for WaitChannel {
    fn default() -> Self {
        Self::new()
    }
}
