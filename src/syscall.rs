//! Syscall dispatch: pulls arguments out of the trap frame, validates
//! every user pointer the call touches, and routes to the handle, file
//! system, or process-table operation that implements it.

use core::ffi::c_void;

use crate::elf;
use crate::fs::filesystem;
use crate::io::{device_open, Handle, IoCtl, IoResult, SysError};
use crate::kernel::kernel;
use crate::memlayout::{USER_END_VMA, USER_START_VMA};
use crate::param::{FS_NAMELEN, NDEV, PROCESS_IOMAX};
use crate::proc::{self, proctab};
use crate::riscv::pgrounddown;
use crate::trap::TrapFrame;
use crate::vm::PteFlags;

const SYSCALL_EXIT: u64 = 0;
const SYSCALL_MSGOUT: u64 = 1;
const SYSCALL_DEVOPEN: u64 = 10;
const SYSCALL_FSOPEN: u64 = 11;
const SYSCALL_CLOSE: u64 = 20;
const SYSCALL_READ: u64 = 21;
const SYSCALL_WRITE: u64 = 22;
const SYSCALL_IOCTL: u64 = 23;
const SYSCALL_EXEC: u64 = 30;
const SYSCALL_FORK: u64 = 31;
const SYSCALL_USLEEP: u64 = 40;
const SYSCALL_WAIT: u64 = 41;
const SYSCALL_PROGNAMES: u64 = 43;
const SYSCALL_NUMPROGS: u64 = 44;
const SYSCALL_PROCS: u64 = 45;
const SYSCALL_SIGNAL: u64 = 46;

/// Entry point the `TrapDispatcher` hands an `ecall` from U-mode to.
/// Advances `sepc` past the `ecall`, dispatches by `a7`, writes the
/// result to `a0`, then delivers at most one pending signal.
pub fn syscall_handler(frame: &mut TrapFrame) {
    frame.advance_epc();
    let result = dispatch(frame);
    frame.set_return(result);
    proc::signal_deliver(frame);
}

fn dispatch(frame: &mut TrapFrame) -> i64 {
    match frame.syscall_num() {
        SYSCALL_EXIT => sys_exit(frame.arg(0) as i32),
        SYSCALL_MSGOUT => sys_msgout(frame.arg(0) as usize),
        SYSCALL_DEVOPEN => sys_devopen(frame.arg(0) as usize, frame.arg(1) as usize, frame.arg(2) as u32),
        SYSCALL_FSOPEN => sys_fsopen(frame.arg(0) as usize, frame.arg(1) as usize),
        SYSCALL_CLOSE => sys_close(frame.arg(0) as usize),
        SYSCALL_READ => sys_read(frame.arg(0) as usize, frame.arg(1) as usize, frame.arg(2) as usize),
        SYSCALL_WRITE => sys_write(frame.arg(0) as usize, frame.arg(1) as usize, frame.arg(2) as usize),
        SYSCALL_IOCTL => sys_ioctl(frame.arg(0) as usize, frame.arg(1) as u32, frame.arg(2) as usize),
        SYSCALL_EXEC => sys_exec(frame, frame.arg(0) as usize),
        SYSCALL_FORK => sys_fork(frame),
        SYSCALL_USLEEP => sys_usleep(frame.arg(0)),
        SYSCALL_WAIT => sys_wait(frame.arg(0) as i64),
        SYSCALL_PROGNAMES => sys_prognames(frame.arg(0) as usize),
        SYSCALL_NUMPROGS => sys_numprograms(frame.arg(0) as usize),
        SYSCALL_PROCS => sys_procs(frame.arg(0) as usize, frame.arg(1) as usize),
        SYSCALL_SIGNAL => sys_signal(frame.arg(0) as usize, frame.arg(1) as u32),
        _ => SysError::NotSupported.as_retval() as i64,
    }
}

/// Validates `fd` against `PROCESS_IOMAX` and returns its handle, or the
/// error the caller should return: `EMFILE` if `fd` doesn't index the fd
/// table at all, `EBADFD` if it does but has nothing open in it.
fn fd_for_use(fd: usize) -> Result<&'static Handle, SysError> {
    if fd >= PROCESS_IOMAX {
        return Err(SysError::BadFd);
    }
    proctab().fd(fd).ok_or(SysError::BadFd)
}

/// Same range check, but for syscalls that are about to populate a fresh
/// fd slot (`devopen`/`fsopen`): out of range is `EMFILE` there.
fn fd_for_open(fd: usize) -> Result<(), SysError> {
    if fd >= PROCESS_IOMAX {
        return Err(SysError::TooManyOpenFiles);
    }
    Ok(())
}

fn validate_str(vptr: usize, max: usize, flags: PteFlags) -> IoResult<arrayvec::ArrayVec<u8, 256>> {
    proctab()
        .with_addr_space(|space| space.validate_vstr(vptr, max, flags))
        .ok_or(SysError::InvalidArgument)?
        .map_err(|_| SysError::InvalidArgument)
}

/// Validates and reads a `devopen`/`fsopen` name: a fixed `FS_NAMELEN`-byte
/// field, not a NUL-terminated C string of unbounded length. Per spec.md,
/// "filenames truncate to 32 bytes and are not required to be
/// NUL-terminated when they fill the field" — so this reads exactly
/// `FS_NAMELEN` bytes (never probing past the field for a NUL the way
/// `validate_str` would) and truncates at the first NUL found within
/// them, if any.
fn validate_name(vptr: usize, flags: PteFlags) -> IoResult<arrayvec::ArrayVec<u8, FS_NAMELEN>> {
    validate_ptr(vptr, FS_NAMELEN, flags)?;
    let mut raw = [0u8; FS_NAMELEN];
    copy_in(vptr, &mut raw)?;
    let len = raw.iter().position(|&b| b == 0).unwrap_or(FS_NAMELEN);
    let mut name = arrayvec::ArrayVec::new();
    name.extend(raw[..len].iter().copied());
    Ok(name)
}

fn validate_ptr(vptr: usize, len: usize, flags: PteFlags) -> IoResult<()> {
    proctab()
        .with_addr_space(|space| space.validate_vptr_len(vptr, len, flags))
        .ok_or(SysError::InvalidArgument)?
        .map_err(|_| SysError::InvalidArgument)
}

fn copy_out(vptr: usize, buf: &[u8]) -> IoResult<()> {
    proctab()
        .with_addr_space(|space| space.copy_out(vptr, buf))
        .ok_or(SysError::InvalidArgument)?
        .map_err(|_| SysError::InvalidArgument)
}

fn copy_in(vptr: usize, buf: &mut [u8]) -> IoResult<()> {
    proctab()
        .with_addr_space(|space| space.copy_in(vptr, buf))
        .ok_or(SysError::InvalidArgument)?
        .map_err(|_| SysError::InvalidArgument)
}

fn sys_exit(status: i32) -> i64 {
    proc::do_exit(status);
}

fn sys_msgout(msg: usize) -> i64 {
    let bytes = match validate_str(msg, 256, PteFlags::U | PteFlags::R) {
        Ok(b) => b,
        Err(e) => return e.as_retval() as i64,
    };
    if let Ok(s) = core::str::from_utf8(&bytes) {
        crate::kprintf!("{}\n", s);
    }
    0
}

fn sys_devopen(fd: usize, name: usize, instno: u32) -> i64 {
    if let Err(e) = fd_for_open(fd) {
        return e.as_retval() as i64;
    }
    let name = match validate_name(name, PteFlags::U | PteFlags::R) {
        Ok(n) => n,
        Err(e) => return e.as_retval() as i64,
    };
    match device_open(&name, instno) {
        Ok(handle) => {
            proctab().set_fd(fd, handle);
            0
        }
        Err(e) => e.as_retval() as i64,
    }
}

fn sys_fsopen(fd: usize, name: usize) -> i64 {
    if let Err(e) = fd_for_open(fd) {
        return e.as_retval() as i64;
    }
    let name = match validate_name(name, PteFlags::U | PteFlags::R) {
        Ok(n) => n,
        Err(e) => return e.as_retval() as i64,
    };
    match filesystem().open(&name) {
        Ok(slot) => match Handle::alloc_file(slot) {
            Ok(handle) => {
                proctab().set_fd(fd, handle);
                0
            }
            Err(e) => {
                filesystem().close(slot);
                e.as_retval() as i64
            }
        },
        Err(e) => e.as_retval() as i64,
    }
}

fn sys_close(fd: usize) -> i64 {
    match fd_for_use(fd) {
        Ok(handle) => {
            handle.close();
            proctab().clear_fd(fd);
            0
        }
        Err(e) => e.as_retval() as i64,
    }
}

fn sys_read(fd: usize, buf: usize, len: usize) -> i64 {
    let handle = match fd_for_use(fd) {
        Ok(h) => h,
        Err(e) => return e.as_retval() as i64,
    };
    if let Err(e) = validate_ptr(buf, len, PteFlags::U | PteFlags::W) {
        return e.as_retval() as i64;
    }
    let mut chunk = [0u8; 512];
    let mut total = 0usize;
    while total < len {
        let take = (len - total).min(chunk.len());
        match handle.read(&mut chunk[..take]) {
            Ok(0) => break,
            Ok(n) => {
                if copy_out(buf + total, &chunk[..n]).is_err() {
                    return SysError::InvalidArgument.as_retval() as i64;
                }
                total += n;
                if n < take {
                    break;
                }
            }
            Err(e) => return e.as_retval() as i64,
        }
    }
    total as i64
}

fn sys_write(fd: usize, buf: usize, len: usize) -> i64 {
    let handle = match fd_for_use(fd) {
        Ok(h) => h,
        Err(e) => return e.as_retval() as i64,
    };
    if let Err(e) = validate_ptr(buf, len, PteFlags::U | PteFlags::R) {
        return e.as_retval() as i64;
    }
    let mut chunk = [0u8; 512];
    let mut total = 0usize;
    while total < len {
        let take = (len - total).min(chunk.len());
        if copy_in(buf + total, &mut chunk[..take]).is_err() {
            return SysError::InvalidArgument.as_retval() as i64;
        }
        match handle.write(&chunk[..take]) {
            Ok(0) => break,
            Ok(n) => {
                total += n;
                if n < take {
                    break;
                }
            }
            Err(e) => return e.as_retval() as i64,
        }
    }
    total as i64
}

fn sys_ioctl(fd: usize, cmd: u32, arg: usize) -> i64 {
    let handle = match fd_for_use(fd) {
        Ok(h) => h,
        Err(e) => return e.as_retval() as i64,
    };
    if arg == 0 {
        return SysError::InvalidArgument.as_retval() as i64;
    }
    const GETLEN: u32 = 0;
    const GETPOS: u32 = 1;
    const SETPOS: u32 = 2;
    const GETBLKSZ: u32 = 3;

    let ctl = match cmd {
        GETLEN | GETPOS | GETBLKSZ => {
            if validate_ptr(arg, 8, PteFlags::U | PteFlags::W).is_err() {
                return SysError::InvalidArgument.as_retval() as i64;
            }
            if cmd == GETLEN {
                IoCtl::GetLen
            } else if cmd == GETPOS {
                IoCtl::GetPos
            } else {
                IoCtl::GetBlkSz
            }
        }
        SETPOS => {
            if validate_ptr(arg, 8, PteFlags::U | PteFlags::R | PteFlags::W).is_err() {
                return SysError::InvalidArgument.as_retval() as i64;
            }
            let mut raw = [0u8; 8];
            if copy_in(arg, &mut raw).is_err() {
                return SysError::InvalidArgument.as_retval() as i64;
            }
            IoCtl::SetPos(u64::from_le_bytes(raw))
        }
        _ => return SysError::NotSupported.as_retval() as i64,
    };

    match handle.ctl(ctl) {
        Ok(value) => {
            let out_len = if cmd == GETBLKSZ { 4 } else { 8 };
            let bytes = value.to_le_bytes();
            if copy_out(arg, &bytes[..out_len]).is_err() {
                return SysError::InvalidArgument.as_retval() as i64;
            }
            0
        }
        Err(e) => e.as_retval() as i64,
    }
}

fn sys_exec(_frame: &mut TrapFrame, fd: usize) -> i64 {
    let handle = match proctab().take_fd(fd) {
        Some(h) => h,
        None => return SysError::BadFd.as_retval() as i64,
    };

    let mut space = match proctab().take_addr_space() {
        Some(s) => s,
        None => match proctab().new_addr_space() {
            Some(s) => s,
            None => {
                handle.close();
                return -1;
            }
        },
    };
    space.reclaim();

    let load_result = elf::elf_load(handle, &mut space);
    handle.close();

    let loaded = match load_result {
        Ok(l) => l,
        Err(code) => {
            proctab().install_addr_space(space);
            return code as i64;
        }
    };

    if loaded.entry < USER_START_VMA || loaded.entry >= USER_END_VMA {
        proctab().install_addr_space(space);
        return SysError::InvalidArgument.as_retval() as i64;
    }

    let stack_page = pgrounddown(crate::memlayout::USER_STACK_VMA);
    if space
        .alloc_and_map_page(stack_page, PteFlags::R | PteFlags::W | PteFlags::U)
        .is_err()
    {
        proctab().install_addr_space(space);
        return -1;
    }

    proctab().install_addr_space(space);
    let frame = proctab().exec_replace(loaded.entry);
    let pid = proctab().current_pid();
    let (_, mtag) = proctab().frame_and_mtag(pid);
    crate::trap::resume_user(mtag, &frame);
}

extern "C" fn fork_trampoline(arg: *mut c_void) {
    let pid = arg as usize;
    let (frame, mtag) = proctab().frame_and_mtag(pid);
    crate::trap::resume_user(mtag, &frame);
}

fn sys_fork(frame: &TrapFrame) -> i64 {
    let (pid, mut child_frame) = match proctab().fork(frame) {
        Some(v) => v,
        None => return -1,
    };
    child_frame.set_return(0);
    proctab().set_trapframe(pid, child_frame);

    match kernel().scheduler().spawn_thread(fork_trampoline, pid as *mut c_void) {
        Some(tid) => {
            proctab().set_tid(pid, tid);
            pid as i64
        }
        None => {
            proctab().abort_fork(pid);
            -1
        }
    }
}

fn sys_usleep(us: u64) -> i64 {
    if us == 0 {
        return SysError::InvalidArgument.as_retval() as i64;
    }
    let ticks = us * crate::param::TIMER_FREQ / 1_000_000;
    kernel().scheduler().alarm_sleep(ticks);
    0
}

fn sys_wait(tid: i64) -> i64 {
    let target = if tid == 0 { None } else { Some(tid as u64) };
    match kernel().scheduler().join_thread(target) {
        Some((joined_tid, status)) => {
            proctab().reap_by_tid(joined_tid);
            status as i64
        }
        None => -1,
    }
}

fn sys_signal(pid: u64, sig: u32) -> i64 {
    match proc::signal(pid as usize, sig) {
        Ok(v) => v,
        Err(e) => e.as_retval() as i64,
    }
}

fn sys_numprograms(arg: usize) -> i64 {
    if arg == 0 {
        return SysError::InvalidArgument.as_retval() as i64;
    }
    if validate_ptr(arg, 4, PteFlags::U | PteFlags::W).is_err() {
        return SysError::InvalidArgument.as_retval() as i64;
    }
    let n = filesystem().num_programs();
    if copy_out(arg, &n.to_le_bytes()).is_err() {
        return SysError::InvalidArgument.as_retval() as i64;
    }
    0
}

fn sys_prognames(arg: usize) -> i64 {
    if arg == 0 {
        return SysError::InvalidArgument.as_retval() as i64;
    }
    let n = filesystem().num_programs() as usize;
    if validate_ptr(arg, n * FS_NAMELEN, PteFlags::U | PteFlags::W).is_err() {
        return SysError::InvalidArgument.as_retval() as i64;
    }
    for i in 0..n {
        let name = match filesystem().program_name(i) {
            Some(n) => n,
            None => break,
        };
        if copy_out(arg + i * FS_NAMELEN, &name).is_err() {
            return SysError::InvalidArgument.as_retval() as i64;
        }
    }
    0
}

/// Writes the pid of every occupied process-table slot into `pids`
/// (`u32` each, up to `NPROC` entries) and returns how many it wrote.
/// `names` is accepted for ABI compatibility with the original's
/// `procs(pids, names)` but left untouched: a per-thread name lookup
/// isn't part of this crate's `Scheduler` contract, so there is nothing
/// to copy into it.
fn sys_procs(pids: usize, names: usize) -> i64 {
    if pids == 0 {
        return SysError::InvalidArgument.as_retval() as i64;
    }
    if validate_ptr(pids, crate::param::NPROC * 4, PteFlags::U | PteFlags::W).is_err() {
        return SysError::InvalidArgument.as_retval() as i64;
    }
    if names != 0
        && validate_ptr(names, crate::param::NPROC * FS_NAMELEN, PteFlags::U | PteFlags::W).is_err()
    {
        return SysError::InvalidArgument.as_retval() as i64;
    }

    let mut count = 0usize;
    for pid in 0..crate::param::NPROC {
        if proctab().is_in_use(pid) {
            if copy_out(pids + count * 4, &(pid as u32).to_le_bytes()).is_err() {
                return SysError::InvalidArgument.as_retval() as i64;
            }
            count += 1;
        }
    }
    count as i64
}

const _: usize = NDEV;
