//! Physical and virtual memory layout.
//!
//! Modeled on qemu's `-machine virt`:
//!
//! ```text
//! 00001000 -- boot ROM
//! 10000000 -- uart0
//! 10001000 -- virtio disk (mmio)
//! 80000000 -- RAM_START; -kernel loads the image here
//! ```
//!
//! The kernel image occupies the first 2 MiB megapage above `RAM_START`.
//! MMIO below `RAM_START` is identity-mapped as `RW` gigapages. RAM from
//! `kimg_end` (page-rounded) to `RAM_START + 2 MiB` is paged; the rest of
//! RAM up to `RAM_END` is mapped with `RW` megapages. Every kernel mapping
//! carries the `G` (global) bit so a fork-time clone can copy them whole.
//!
//! User address space is disjoint from all of the above and occupies
//! `[USER_START_VMA, USER_END_VMA)`; the user stack sits at
//! `USER_STACK_VMA`, just below `USER_END_VMA`.

#![allow(dead_code)]

/// qemu puts UART registers here in physical memory.
pub const UART0: usize = 0x1000_0000;
pub const UART0_IRQ: u32 = 10;

/// virtio mmio interface, disk 0.
pub const VIRTIO0: usize = 0x1000_1000;
pub const VIRTIO0_IRQ: u32 = 1;

/// Start of physical RAM.
pub const RAM_START: usize = 0x8000_0000;

/// Amount of RAM the kernel manages.
pub const RAM_SIZE: usize = 128 * 1024 * 1024;

/// First physical address past the RAM the kernel manages.
pub const RAM_END: usize = RAM_START + RAM_SIZE;

/// Start of the user address range, valid in every process's page table.
pub const USER_START_VMA: usize = 0x0000_1000;

/// First address past the user address range.
pub const USER_END_VMA: usize = 0x3f_ffff_f000;

/// Address of the top of the user stack, just below `USER_END_VMA`.
pub const USER_STACK_VMA: usize = USER_END_VMA - 4096;
