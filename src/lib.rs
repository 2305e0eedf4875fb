//! The core of a preemptive Sv39 RISC-V kernel: virtual memory, the
//! VirtIO block driver, the on-disk filesystem, and the process/syscall
//! layer that ties them together.
//!
//! Early boot, trap-frame save/restore assembly, the PLIC, the
//! interactive shell, and the heap allocator are fixed-contract
//! collaborators this crate builds on but does not implement; see
//! `sched.rs` and `console.rs` for the traits it expects from them.

#![no_std]

mod console;
mod elf;
mod fs;
mod io;
mod kalloc;
mod kernel;
mod lock;
mod memlayout;
mod param;
mod proc;
mod riscv;
mod sched;
mod syscall;
mod trap;
mod virtio;
mod vm;

pub use console::{init as console_init, Console};
pub use fs::FileSystem;
pub use kernel::kernel;
pub use proc::proctab;
pub use sched::{HeapAllocator, Scheduler, Tid, TrapDispatcher, WaitChannel};
pub use trap::{handle_user_trap, TrapFrame};
pub use virtio::VirtioDisk;
