//! The process table: fork/exec/exit/wait/usleep, the per-process fd
//! table, and signal delivery. One slot per process id; pid and table
//! index are the same number, so there is no separate lookup structure.

use array_macro::array;

use crate::io::{Handle, SysError};
use crate::lock::Spinlock;
use crate::memlayout::{USER_START_VMA, USER_STACK_VMA};
use crate::param::{MAIN_PID, NPROC, NSIG, PROCESS_IOMAX};
use crate::riscv::PGSIZE;
use crate::sched::Tid;
use crate::trap::TrapFrame;
use crate::vm::AddrSpace;

/// Signal numbers 1..NSIG-1; slot 0 is unused so `1 << sig` lines up with
/// the bitmask directly.
pub const SIGTERM: u32 = 1;
pub const SIGKILL: u32 = 2;
pub const SIGINT: u32 = 3;
pub const SIGALRM: u32 = 4;
pub const SIGSTOP: u32 = 5;
pub const SIGCONT: u32 = 6;
pub const SIGPIPE: u32 = 7;
pub const SIGUSR1: u32 = 8;
pub const SIGUSR2: u32 = 9;

/// A signal handler table entry: the default action, ignored, or a
/// user-space function pointer to dispatch to.
#[derive(Clone, Copy, PartialEq, Eq)]
enum SignalHandler {
    Default,
    Ignore,
    Handler(usize),
}

impl SignalHandler {
    /// Matches the original encoding: 0 is the default action, all-ones is
    /// ignore, anything else is a user-space address.
    fn from_raw(raw: u64) -> Self {
        match raw {
            0 => SignalHandler::Default,
            u64::MAX => SignalHandler::Ignore,
            addr => SignalHandler::Handler(addr as usize),
        }
    }
}

struct Process {
    in_use: bool,
    tid: Option<Tid>,
    addr_space: Option<AddrSpace>,
    trapframe: TrapFrame,
    iotab: [Option<&'static Handle>; PROCESS_IOMAX],
    pending_signals: u64,
    blocked_signals: u64,
    signal_handler: [SignalHandler; NSIG],
    exit_status: Option<i32>,
}

impl Process {
    const EMPTY: Self = Self {
        in_use: false,
        tid: None,
        addr_space: None,
        trapframe: TrapFrame {
            regs: [0; 32],
            sepc: 0,
        },
        iotab: [None; PROCESS_IOMAX],
        pending_signals: 0,
        blocked_signals: 0,
        signal_handler: [SignalHandler::Default; NSIG],
        exit_status: None,
    };

    fn close_all_fds(&mut self) {
        for slot in self.iotab.iter_mut() {
            if let Some(h) = slot.take() {
                h.close();
            }
        }
    }
}

struct ProcessTableInner {
    procs: [Process; NPROC],
}

pub struct ProcessTable {
    inner: Spinlock<ProcessTableInner>,
}

static PROCTAB: ProcessTable = ProcessTable {
    inner: Spinlock::new(
        "proctab",
        ProcessTableInner {
            procs: array![_ => Process::EMPTY; NPROC],
        },
    ),
};

pub fn proctab() -> &'static ProcessTable {
    &PROCTAB
}

impl ProcessTable {
    /// Registers the calling (boot) thread as process 0, inheriting
    /// whatever address space is already active. Must run once, before
    /// any syscall is dispatched.
    pub fn init(&self) {
        let mut guard = self.inner.lock();
        let main = &mut guard.procs[MAIN_PID];
        main.in_use = true;
        main.tid = Some(crate::kernel::kernel().scheduler().running_thread());
    }

    /// Finds the slot whose thread is the calling thread.
    fn current_index(procs: &[Process; NPROC]) -> usize {
        let me = crate::kernel::kernel().scheduler().running_thread();
        procs
            .iter()
            .position(|p| p.in_use && p.tid == Some(me))
            .expect("proctab: running thread has no process entry")
    }

    pub fn current_pid(&self) -> usize {
        Self::current_index(&self.inner.lock().procs)
    }

    /// Whether process-table slot `pid` is occupied, running or zombie
    /// (anywhere but `EMPTY` in the lifecycle). Used by `procs` to list
    /// the live pids without exposing the table's lock to callers.
    pub fn is_in_use(&self, pid: usize) -> bool {
        self.inner.lock().procs[pid].in_use
    }

    fn with_current<R>(&self, f: impl FnOnce(&mut Process) -> R) -> R {
        let mut guard = self.inner.lock();
        let idx = Self::current_index(&guard.procs);
        f(&mut guard.procs[idx])
    }

    pub fn fd(&self, fd: usize) -> Option<&'static Handle> {
        self.with_current(|p| p.iotab.get(fd).copied().flatten())
    }

    pub fn set_fd(&self, fd: usize, handle: &'static Handle) {
        self.with_current(|p| p.iotab[fd] = Some(handle));
    }

    pub fn take_fd(&self, fd: usize) -> Option<&'static Handle> {
        self.with_current(|p| p.iotab.get_mut(fd)?.take())
    }

    pub fn clear_fd(&self, fd: usize) {
        self.with_current(|p| p.iotab[fd] = None);
    }

    /// Runs `f` against the calling process's address space.
    pub fn with_addr_space<R>(&self, f: impl FnOnce(&mut AddrSpace) -> R) -> Option<R> {
        self.with_current(|p| p.addr_space.as_mut().map(f))
    }

    /// Finds a free slot, copies the fd table (bumping refcounts) from the
    /// calling process, and clones its address space. On success returns
    /// the new slot's index (the child's pid) and the trap frame it was
    /// seeded with (parent's frame, `a0` not yet zeroed: the caller
    /// arranges that before resuming the child).
    pub fn fork(&self, parent_frame: &TrapFrame) -> Option<(usize, TrapFrame)> {
        let mut guard = self.inner.lock();
        let idx = Self::current_index(&guard.procs);

        let child_space = guard.procs[idx].addr_space.as_mut()?.clone_for_fork()?;
        let iotab = guard.procs[idx].iotab;

        let slot = guard.procs.iter().position(|p| !p.in_use)?;

        for h in iotab.iter().flatten() {
            h.add_ref();
        }

        let child = &mut guard.procs[slot];
        child.in_use = true;
        child.tid = None;
        child.addr_space = Some(child_space);
        child.trapframe = *parent_frame;
        child.iotab = iotab;
        child.pending_signals = 0;
        child.blocked_signals = 0;
        child.signal_handler = [SignalHandler::Default; NSIG];
        child.exit_status = None;

        Some((slot, child.trapframe))
    }

    /// Installs the scheduler-assigned tid for a freshly forked child.
    pub fn set_tid(&self, pid: usize, tid: Tid) {
        self.inner.lock().procs[pid].tid = Some(tid);
    }

    pub fn set_trapframe(&self, pid: usize, frame: TrapFrame) {
        self.inner.lock().procs[pid].trapframe = frame;
    }

    /// The frame and address-space tag a freshly spawned thread resumes
    /// with, used by the fork/exec trampolines run on the new thread.
    pub fn frame_and_mtag(&self, pid: usize) -> (TrapFrame, crate::riscv::Mtag) {
        let guard = self.inner.lock();
        let p = &guard.procs[pid];
        let mtag = p.addr_space.as_ref().map(|s| s.mtag(pid as u64)).unwrap_or_else(|| {
            crate::riscv::make_mtag(pid as u64, crate::kernel::kernel().kernel_pagetable().root_pa())
        });
        (p.trapframe, mtag)
    }

    /// Rolls back a fork whose thread creation failed: releases the fd
    /// refs it had bumped and frees the slot.
    pub fn abort_fork(&self, pid: usize) {
        let mut guard = self.inner.lock();
        let iotab = guard.procs[pid].iotab;
        for h in iotab.iter().flatten() {
            h.close();
        }
        guard.procs[pid] = Process::EMPTY;
    }

    /// Replaces the calling process's address space and resets the fd
    /// table ownership of `exec_fd` (already cleared by the caller before
    /// the ELF loader ran). Returns the trap frame to resume into.
    pub fn exec_replace(&self, entry: usize) -> TrapFrame {
        self.with_current(|p| {
            let mut frame = TrapFrame::default();
            frame.regs[2] = USER_STACK_VMA as u64; // sp
            frame.sepc = entry as u64;
            p.trapframe = frame;
            frame
        })
    }

    pub fn new_addr_space(&self) -> Option<AddrSpace> {
        AddrSpace::new()
    }

    pub fn install_addr_space(&self, space: AddrSpace) {
        self.with_current(|p| p.addr_space = Some(space));
    }

    pub fn take_addr_space(&self) -> Option<AddrSpace> {
        self.with_current(|p| p.addr_space.take())
    }

    /// Reclaims the calling process's address space and fd table, marks
    /// it a zombie with `status`, and returns its pid.
    pub fn exit(&self, status: i32) -> usize {
        let mut guard = self.inner.lock();
        let idx = Self::current_index(&guard.procs);
        let p = &mut guard.procs[idx];
        if let Some(mut space) = p.addr_space.take() {
            space.reclaim();
        }
        p.close_all_fds();
        p.exit_status = Some(status);
        idx
    }

    /// Frees a zombie's slot once the scheduler has confirmed its thread
    /// has exited and been joined. `wait`'s only handle on the child it
    /// just joined is the `Tid` the scheduler hands back, not the pid, so
    /// this looks the slot up by tid rather than taking a pid directly.
    pub fn reap_by_tid(&self, tid: Tid) {
        let mut guard = self.inner.lock();
        if let Some(p) = guard.procs.iter_mut().find(|p| p.in_use && p.tid == Some(tid)) {
            *p = Process::EMPTY;
        }
    }
}

/// Finds the lowest-numbered set bit in `mask`, if any.
fn lowest_bit(mask: u64) -> Option<u32> {
    if mask == 0 {
        None
    } else {
        Some(mask.trailing_zeros())
    }
}

/// `signal(pid, sig)`: `SIGKILL` terminates the target immediately;
/// otherwise just records the signal as pending. Returns `EINVAL` if `pid`
/// does not name a live process.
pub fn signal(pid: usize, sig: u32) -> Result<i64, SysError> {
    let is_live = {
        let guard = proctab().inner.lock();
        pid < NPROC && guard.procs[pid].in_use
    };
    if !is_live {
        return Err(SysError::InvalidArgument);
    }
    if sig == SIGKILL {
        terminate(pid);
        return Ok(0);
    }
    if sig < NSIG as u32 {
        proctab().inner.lock().procs[pid].pending_signals |= 1 << sig;
    }
    Ok(0)
}

/// Forcibly terminates `pid`. Only implemented for the calling process
/// itself: tearing down another hart's running thread from here needs
/// scheduler-level preemption this crate has no handle on, matching the
/// original's own `process_terminate`, which silently no-ops for any pid
/// other than the caller's.
fn terminate(pid: usize) {
    let is_self = {
        let guard = proctab().inner.lock();
        ProcessTable::current_index(&guard.procs) == pid
    };
    if is_self {
        do_exit(-(SIGKILL as i32));
    }
}

/// Terminates the calling process/thread. Never returns.
pub fn do_exit(status: i32) -> ! {
    proctab().exit(status);
    crate::kernel::kernel().scheduler().thread_exit(status)
}

/// Runs at every syscall return: delivers at most one pending, unblocked
/// signal. `SIGTERM`'s default action exits the process; any other
/// default action and `SIGCONT`/`SIGSTOP` without a handler installed are
/// silently dropped (no job-control model exists in this kernel); `-1`
/// means ignore; anything else is a user handler address, dispatched by
/// overwriting the frame's pc and `a0` so the next return to user mode
/// enters the handler with the signal number as its argument.
pub fn signal_deliver(frame: &mut TrapFrame) {
    let (sig, handler) = {
        let mut guard = proctab().inner.lock();
        let idx = ProcessTable::current_index(&guard.procs);
        let p = &mut guard.procs[idx];
        let deliverable = p.pending_signals & !p.blocked_signals;
        let sig = match lowest_bit(deliverable) {
            Some(s) => s,
            None => return,
        };
        p.pending_signals &= !(1 << sig);
        (sig, p.signal_handler[sig as usize])
    };

    match handler {
        SignalHandler::Default => {
            if sig == SIGTERM {
                do_exit(-(SIGTERM as i32));
            }
        }
        SignalHandler::Ignore => {}
        SignalHandler::Handler(addr) => {
            frame.regs[10] = sig as u64; // a0
            frame.sepc = addr as u64;
        }
    }
}

/// Installs a handler for `sig` in the calling process's table. `raw`
/// follows the same encoding as `SignalHandler::from_raw`. Not reached
/// from this crate's syscall table: "dispatch implementation left to
/// signal framework" is out of this crate's scope, so this is the hook
/// that framework installs handlers through.
#[allow(dead_code)]
pub fn set_signal_handler(sig: u32, raw: u64) -> Result<i64, SysError> {
    if sig == 0 || sig as usize >= NSIG {
        return Err(SysError::InvalidArgument);
    }
    proctab().with_current(|p| {
        p.signal_handler[sig as usize] = SignalHandler::from_raw(raw);
    });
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowest_bit_picks_smallest_set() {
        assert_eq!(lowest_bit(0b10100), Some(2));
        assert_eq!(lowest_bit(0), None);
    }

    #[test]
    fn signal_handler_encoding_round_trips() {
        assert!(matches!(SignalHandler::from_raw(0), SignalHandler::Default));
        assert!(matches!(
            SignalHandler::from_raw(u64::MAX),
            SignalHandler::Ignore
        ));
        assert!(matches!(
            SignalHandler::from_raw(0x1000),
            SignalHandler::Handler(0x1000)
        ));
    }

    #[test]
    fn user_stack_is_page_aligned() {
        assert_eq!(USER_STACK_VMA % PGSIZE, 0);
        assert!(USER_STACK_VMA > USER_START_VMA);
    }
}
