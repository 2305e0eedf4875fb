//! RISC-V register and paging constants, and the CSR accessors this
//! crate and its fixed-contract collaborators need (the boot sequence,
//! trap entry/exit and the scheduler itself are out of scope; see
//! `sched.rs`). Some accessors here (`r_sepc`/`w_sepc`, `r_scause`,
//! `r_stval`, `r_sie`/`w_sie`) are called from the trap-entry assembly
//! and the scheduler rather than from within this crate.
#![allow(dead_code)]

use core::arch::asm;

/// Supervisor Status Register bits.
pub const SSTATUS_SPP: u64 = 1 << 8;
pub const SSTATUS_SPIE: u64 = 1 << 5;
pub const SSTATUS_SIE: u64 = 1 << 1;

#[inline]
pub fn r_sstatus() -> u64 {
    let x: u64;
    unsafe { asm!("csrr {}, sstatus", out(reg) x) };
    x
}

#[inline]
pub fn w_sstatus(x: u64) {
    unsafe { asm!("csrw sstatus, {}", in(reg) x) };
}

/// Supervisor Interrupt Enable bits.
pub const SIE_SEIE: u64 = 1 << 9;
pub const SIE_STIE: u64 = 1 << 5;
pub const SIE_SSIE: u64 = 1 << 1;

#[inline]
pub fn r_sie() -> u64 {
    let x: u64;
    unsafe { asm!("csrr {}, sie", out(reg) x) };
    x
}

#[inline]
pub fn w_sie(x: u64) {
    unsafe { asm!("csrw sie, {}", in(reg) x) };
}

#[inline]
pub fn r_sepc() -> u64 {
    let x: u64;
    unsafe { asm!("csrr {}, sepc", out(reg) x) };
    x
}

#[inline]
pub fn w_sepc(x: u64) {
    unsafe { asm!("csrw sepc, {}", in(reg) x) };
}

#[inline]
pub fn r_scause() -> u64 {
    let x: u64;
    unsafe { asm!("csrr {}, scause", out(reg) x) };
    x
}

#[inline]
pub fn r_stval() -> u64 {
    let x: u64;
    unsafe { asm!("csrr {}, stval", out(reg) x) };
    x
}

/// Address-space tag: Sv39 mode bits | ASID | root page table's PPN.
pub type Mtag = u64;

const SATP_SV39: u64 = 8 << 60;

/// Builds an `mtag` value for `satp` out of an ASID and a root page table
/// physical address.
pub const fn make_mtag(asid: u64, pagetable: usize) -> Mtag {
    SATP_SV39 | (asid << 44) | (pagetable as u64 >> 12)
}

#[inline]
pub fn r_satp() -> Mtag {
    let x: u64;
    unsafe { asm!("csrr {}, satp", out(reg) x) };
    x
}

/// Installs `tag` as the running hart's address-space tag and flushes the
/// TLB. The fence on `satp` is what makes the flush happen.
#[inline]
pub fn w_satp(tag: Mtag) {
    unsafe {
        asm!("csrw satp, {}", in(reg) tag);
        asm!("sfence.vma zero, zero");
    }
}

/// Flushes the TLB for every address space (`sfence.vma zero, zero`).
#[inline]
pub fn sfence_vma() {
    unsafe { asm!("sfence.vma zero, zero") };
}

/// Are device interrupts currently enabled on this hart?
#[inline]
pub fn intr_get() -> bool {
    r_sstatus() & SSTATUS_SIE != 0
}

/// Enables device interrupts.
///
/// # Safety
/// Must only be called while holding no lock that a device ISR also
/// takes, or a deadlock can result.
#[inline]
pub unsafe fn intr_on() {
    w_sstatus(r_sstatus() | SSTATUS_SIE);
}

/// Disables device interrupts.
#[inline]
pub fn intr_off() {
    w_sstatus(r_sstatus() & !SSTATUS_SIE);
}

/// Page size, in bytes.
pub const PGSIZE: usize = 4096;

/// Bits of offset within a page.
pub const PGSHIFT: usize = 12;

pub const fn pgroundup(sz: usize) -> usize {
    (sz + PGSIZE - 1) & !(PGSIZE - 1)
}

pub const fn pgrounddown(a: usize) -> usize {
    a & !(PGSIZE - 1)
}

/// 9 bits per page-table level index.
pub const PXMASK: usize = 0x1ff;

pub const fn pxshift(level: usize) -> usize {
    PGSHIFT + 9 * level
}

/// Extracts the `level`'th 9-bit page-table index out of a virtual address.
pub const fn px(level: usize, va: usize) -> usize {
    (va >> pxshift(level)) & PXMASK
}

/// One past the largest virtual address representable in Sv39 (38 valid
/// bits at the top, since Sv39 virtual addresses must be sign-extended
/// from bit 38 and we never construct negative ones).
pub const MAXVA: usize = 1 << (9 + 9 + 9 + 12 - 1);
