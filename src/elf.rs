//! ELF64 executable loading: header/program-header validation and
//! `PT_LOAD` segment mapping.

use bitflags::bitflags;
use zerocopy::{AsBytes, FromBytes};

use crate::io::{read_fully, Handle, IoCtl};
use crate::memlayout::{USER_END_VMA, USER_START_VMA, USER_STACK_VMA};
use crate::riscv::{pgrounddown, pgroundup};
use crate::vm::{AddrSpace, PteFlags};

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const ET_EXEC: u16 = 2;
const EM_RISCV: u16 = 243;
const ELFDATA2LSB: u8 = 1;
const PT_LOAD: u32 = 1;

bitflags! {
    pub struct ProgFlags: u32 {
        const X = 1;
        const W = 2;
        const R = 4;
    }
}

#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
struct ElfHdr {
    magic: [u8; 4],
    ident: [u8; 12],
    e_type: u16,
    e_machine: u16,
    e_version: u32,
    e_entry: u64,
    e_phoff: u64,
    e_shoff: u64,
    e_flags: u32,
    e_ehsize: u16,
    e_phentsize: u16,
    e_phnum: u16,
    e_shentsize: u16,
    e_shnum: u16,
    e_shstrndx: u16,
}

#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
struct ProgHdr {
    p_type: u32,
    p_flags: u32,
    p_offset: u64,
    p_vaddr: u64,
    p_paddr: u64,
    p_filesz: u64,
    p_memsz: u64,
    p_align: u64,
}

/// Result of a successful load: the entry point to jump to.
pub struct Loaded {
    pub entry: usize,
}

/// Reads and validates the ELF64 header, maps and loads every `PT_LOAD`
/// segment into `space`, and returns the entry point.
///
/// Returns a distinct negative code per failing stage, matching the
/// original loader this was ported from, since a human diagnosing a boot
/// failure needs the stage, not just "invalid":
/// -1 header read failed, -2 bad magic, -3 unsupported type/machine,
/// -4 seek to program header failed, -5 read of program header failed,
/// -6 PT_LOAD segment out of the user range, -7 seek to segment data
/// failed, -8 read of segment data failed, -9 not little-endian,
/// -10 allocation/mapping failure, -11 segment overlaps the stack.
pub fn elf_load(io: &Handle, space: &mut AddrSpace) -> Result<Loaded, i32> {
    let mut hdr_buf = [0u8; core::mem::size_of::<ElfHdr>()];
    let n = read_fully(io, &mut hdr_buf).map_err(|_| -1)?;
    if n != hdr_buf.len() {
        return Err(-1);
    }
    let hdr = ElfHdr::read_from(&hdr_buf[..]).ok_or(-1)?;

    if hdr.magic != ELF_MAGIC {
        return Err(-2);
    }
    if hdr.e_type != ET_EXEC || hdr.e_machine != EM_RISCV {
        return Err(-3);
    }
    if hdr.ident[1] != ELFDATA2LSB {
        return Err(-9);
    }

    for i in 0..hdr.e_phnum {
        let phoff = hdr.e_phoff + i as u64 * hdr.e_phentsize as u64;
        io.ctl(IoCtl::SetPos(phoff)).map_err(|_| -4)?;

        let mut ph_buf = [0u8; core::mem::size_of::<ProgHdr>()];
        let n = read_fully(io, &mut ph_buf).map_err(|_| -5)?;
        if n != ph_buf.len() {
            return Err(-5);
        }
        let ph = ProgHdr::read_from(&ph_buf[..]).ok_or(-5)?;

        if ph.p_vaddr + ph.p_memsz > USER_STACK_VMA as u64 {
            return Err(-11);
        }

        if ph.p_type != PT_LOAD {
            continue;
        }

        let vaddr = ph.p_vaddr as usize;
        let memsz = ph.p_memsz as usize;
        if vaddr < USER_START_VMA || vaddr + memsz > USER_END_VMA {
            return Err(-6);
        }

        let aligned_vaddr = pgrounddown(vaddr);
        let aligned_memsz = pgroundup(vaddr + memsz) - aligned_vaddr;

        let prog_flags = ProgFlags::from_bits_truncate(ph.p_flags);
        let mut perm = PteFlags::U;
        if prog_flags.contains(ProgFlags::R) {
            perm |= PteFlags::R;
        }
        if prog_flags.contains(ProgFlags::W) {
            perm |= PteFlags::W;
        }
        if prog_flags.contains(ProgFlags::X) {
            perm |= PteFlags::X;
        }

        // Map writable first, even for a read-only segment: the file
        // contents still need to be copied in before the permission is
        // tightened below.
        space
            .alloc_and_map_range(aligned_vaddr, aligned_memsz, perm | PteFlags::W)
            .map_err(|_| -10)?;

        io.ctl(IoCtl::SetPos(ph.p_offset)).map_err(|_| -7)?;
        let mut remaining = ph.p_filesz as usize;
        let mut vptr = vaddr;
        let mut chunk = [0u8; 512];
        while remaining > 0 {
            let take = remaining.min(chunk.len());
            let got = read_fully(io, &mut chunk[..take]).map_err(|_| -8)?;
            if got != take {
                return Err(-8);
            }
            space.copy_out(vptr, &chunk[..take]).map_err(|_| -8)?;
            vptr += take;
            remaining -= take;
        }

        if memsz > ph.p_filesz as usize {
            let zero_start = vaddr + ph.p_filesz as usize;
            let zero_len = memsz - ph.p_filesz as usize;
            let zeros = [0u8; 512];
            let mut done = 0;
            while done < zero_len {
                let take = (zero_len - done).min(zeros.len());
                space
                    .copy_out(zero_start + done, &zeros[..take])
                    .map_err(|_| -8)?;
                done += take;
            }
        }

        space.set_range_flags(aligned_vaddr, aligned_memsz, perm);
    }

    Ok(Loaded {
        entry: hdr.e_entry as usize,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_size_is_64_bytes() {
        assert_eq!(core::mem::size_of::<ElfHdr>(), 64);
    }

    #[test]
    fn proghdr_size_is_56_bytes() {
        assert_eq!(core::mem::size_of::<ProgHdr>(), 56);
    }
}
