//! The trap frame ABI and exception-cause classification. Saving and
//! restoring the frame around a trap is boot/trampoline assembly outside
//! this crate's scope; this module only defines the shape `TrapDispatcher`
//! hands over and how to read `scause`.

/// General-purpose registers `x0..x31` plus the faulting/trapping `sepc`,
/// exactly as the trampoline assembly lays them out on the kernel stack.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct TrapFrame {
    pub regs: [u64; 32],
    pub sepc: u64,
}

/// Index of `a0` within `regs`; `a0..a7` are `regs[10..18]`.
const A0: usize = 10;

impl TrapFrame {
    pub fn arg(&self, n: usize) -> u64 {
        self.regs[A0 + n]
    }

    /// The syscall number, from `a7`.
    pub fn syscall_num(&self) -> u64 {
        self.regs[A0 + 7]
    }

    /// Writes a syscall's `i64` return value into `a0`.
    pub fn set_return(&mut self, value: i64) {
        self.regs[A0] = value as u64;
    }

    /// Advances past the `ecall` instruction. Must run before dispatch, so
    /// a syscall that never returns (`exit`, `exec` on success) resumes
    /// the *next* instruction if it ever does return to this frame.
    pub fn advance_epc(&mut self) {
        self.sepc = self.sepc.wrapping_add(4);
    }
}

extern "C" {
    /// Loads every register in `frame` and executes `sret`, dropping into
    /// user mode at `frame.sepc` under `mtag`. Implemented by the
    /// trap-frame restore assembly outside this crate's scope (the
    /// counterpart of the save half that builds a `TrapFrame` on entry).
    /// Never returns.
    fn trapframe_resume(mtag: crate::riscv::Mtag, frame: *const TrapFrame) -> !;
}

/// Installs `mtag` and jumps to user mode with `frame`'s registers. Used
/// both by `exec`, which builds a fresh frame with just `sp`/`sepc`/`a0`
/// set, and by a forked child's first return to user mode, which reuses
/// the parent's frame with `a0` overwritten to 0.
pub fn resume_user(mtag: crate::riscv::Mtag, frame: &TrapFrame) -> ! {
    unsafe { trapframe_resume(mtag, frame) }
}

/// `scause` values this kernel handles when trapped from U-mode. Anything
/// else bounces to `TrapDispatcher` for handlers outside this crate's
/// scope (timer interrupts, other device interrupts).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Trap {
    UserEcall,
    LoadPageFault(usize),
    StorePageFault(usize),
    InstructionPageFault(usize),
    Other(u64),
}

const CAUSE_INTERRUPT_BIT: u64 = 1 << 63;
const CAUSE_USER_ECALL: u64 = 8;
const CAUSE_INSTRUCTION_PAGE_FAULT: u64 = 12;
const CAUSE_LOAD_PAGE_FAULT: u64 = 13;
const CAUSE_STORE_PAGE_FAULT: u64 = 15;

/// Classifies a trap from `scause` and, for page faults, the faulting
/// address in `stval`.
pub fn classify(scause: u64, stval: u64) -> Trap {
    if scause & CAUSE_INTERRUPT_BIT != 0 {
        return Trap::Other(scause);
    }
    match scause {
        CAUSE_USER_ECALL => Trap::UserEcall,
        CAUSE_LOAD_PAGE_FAULT => Trap::LoadPageFault(stval as usize),
        CAUSE_STORE_PAGE_FAULT => Trap::StorePageFault(stval as usize),
        CAUSE_INSTRUCTION_PAGE_FAULT => Trap::InstructionPageFault(stval as usize),
        other => Trap::Other(other),
    }
}

/// The U-mode handler half of the `TrapDispatcher` contract: classifies
/// the trap that brought the hart here and routes it to the syscall
/// dispatcher or the page-fault handler. Anything else (device and timer
/// interrupts) is not this crate's concern and is left to the caller.
///
/// Called by the trap dispatcher with `scause`/`stval` already read out of
/// the CSRs at entry, and `frame` holding the trapping context.
pub fn handle_user_trap(scause: u64, stval: u64, frame: &mut TrapFrame) {
    match classify(scause, stval) {
        Trap::UserEcall => crate::syscall::syscall_handler(frame),
        Trap::LoadPageFault(addr) | Trap::StorePageFault(addr) | Trap::InstructionPageFault(addr) => {
            let resolved = crate::proc::proctab()
                .with_addr_space(|space| space.handle_page_fault(addr))
                .unwrap_or(false);
            if !resolved {
                panic!("fatal page fault at {:#x} (scause={:#x})", addr, scause);
            }
            crate::riscv::sfence_vma();
        }
        Trap::Other(cause) => panic!("unhandled trap from U-mode: scause={:#x}", cause),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arg_indices_match_a0_a7() {
        let mut frame = TrapFrame::default();
        for i in 0..8 {
            frame.regs[A0 + i] = 100 + i as u64;
        }
        for i in 0..8 {
            assert_eq!(frame.arg(i), 100 + i as u64);
        }
        assert_eq!(frame.syscall_num(), 107);
    }

    #[test]
    fn set_return_writes_a0() {
        let mut frame = TrapFrame::default();
        frame.set_return(-3);
        assert_eq!(frame.regs[A0] as i64, -3);
    }

    #[test]
    fn advance_epc_adds_four() {
        let mut frame = TrapFrame {
            sepc: 0x1000,
            ..Default::default()
        };
        frame.advance_epc();
        assert_eq!(frame.sepc, 0x1004);
    }

    #[test]
    fn classifies_user_ecall() {
        assert_eq!(classify(CAUSE_USER_ECALL, 0), Trap::UserEcall);
    }

    #[test]
    fn classifies_page_faults_with_address() {
        assert_eq!(
            classify(CAUSE_LOAD_PAGE_FAULT, 0x2000),
            Trap::LoadPageFault(0x2000)
        );
        assert_eq!(
            classify(CAUSE_STORE_PAGE_FAULT, 0x3000),
            Trap::StorePageFault(0x3000)
        );
        assert_eq!(
            classify(CAUSE_INSTRUCTION_PAGE_FAULT, 0x4000),
            Trap::InstructionPageFault(0x4000)
        );
    }

    #[test]
    fn interrupt_bit_routes_to_other() {
        assert_eq!(
            classify(CAUSE_INTERRUPT_BIT | 5, 0),
            Trap::Other(CAUSE_INTERRUPT_BIT | 5)
        );
    }
}
