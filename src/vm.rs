//! Sv39 page tables and the per-process address space built from them.

use bitflags::bitflags;
use scopeguard::guard;
use static_assertions::const_assert_eq;

use crate::kernel::kernel;
use crate::memlayout::{RAM_END, RAM_START, USER_END_VMA, USER_START_VMA};
use crate::riscv::{pgrounddown, pgroundup, px, pxshift, PGSIZE};

bitflags! {
    /// Page table entry permission and status bits (Sv39, RISC-V privileged
    /// spec table 4.5).
    pub struct PteFlags: usize {
        const V = 1 << 0;
        const R = 1 << 1;
        const W = 1 << 2;
        const X = 1 << 3;
        const U = 1 << 4;
        const G = 1 << 5;
        const A = 1 << 6;
        const D = 1 << 7;
    }
}

const PTE_PER_PT: usize = PGSIZE / 8;
const_assert_eq!(PTE_PER_PT, 512);

fn pa2pte(pa: usize) -> usize {
    (pa >> 12) << 10
}

fn pte2pa(pte: usize) -> usize {
    (pte >> 10) << 12
}

/// A single Sv39 page table entry.
#[derive(Clone, Copy, Default)]
struct PageTableEntry {
    inner: usize,
}

impl PageTableEntry {
    fn flags(&self) -> PteFlags {
        PteFlags::from_bits_truncate(self.inner)
    }

    fn is_valid(&self) -> bool {
        self.flags().contains(PteFlags::V)
    }

    /// A valid entry with none of R/W/X set refers to the next page table
    /// level; one with at least one of them set is a leaf.
    fn is_table(&self) -> bool {
        self.is_valid() && !self.flags().intersects(PteFlags::R | PteFlags::W | PteFlags::X)
    }

    fn pa(&self) -> usize {
        pte2pa(self.inner)
    }

    fn set_table(&mut self, pa: usize) {
        self.inner = pa2pte(pa) | PteFlags::V.bits();
    }

    fn set_leaf(&mut self, pa: usize, perm: PteFlags) {
        debug_assert!(perm.intersects(PteFlags::R | PteFlags::W | PteFlags::X));
        self.inner = pa2pte(pa) | (perm | PteFlags::V).bits();
    }

    fn set_flags(&mut self, perm: PteFlags) {
        let pa = self.pa();
        self.inner = pa2pte(pa) | (perm | PteFlags::V).bits();
    }

    fn invalidate(&mut self) {
        self.inner = 0;
    }
}

#[repr(align(4096))]
struct RawPageTable {
    entries: [PageTableEntry; PTE_PER_PT],
}

const_assert_eq!(core::mem::size_of::<RawPageTable>(), PGSIZE);

impl RawPageTable {
    fn alloc_zeroed() -> Option<*mut RawPageTable> {
        // `kernel().alloc_page()` always hands back a zeroed page.
        let pa = kernel().alloc_page()?;
        Some(pa as *mut RawPageTable)
    }
}

/// An Sv39 page table, owning the page-table pages it's built from but
/// not the leaf data pages it maps (the caller owns those).
pub struct PageTable {
    root: *mut RawPageTable,
}

impl PageTable {
    /// Allocates a fresh, empty root page table.
    pub fn new() -> Option<Self> {
        Some(Self {
            root: RawPageTable::alloc_zeroed()?,
        })
    }

    pub fn root_pa(&self) -> usize {
        self.root as usize
    }

    fn table(&self, pa: usize) -> &RawPageTable {
        // SAFETY: every stored page-table pointer was allocated by
        // `RawPageTable::alloc_zeroed` and is owned by this `PageTable`.
        unsafe { &*(pa as *const RawPageTable) }
    }

    fn table_mut(&mut self, pa: usize) -> &mut RawPageTable {
        // SAFETY: see `table`.
        unsafe { &mut *(pa as *mut RawPageTable) }
    }

    /// Walks down to the PTE for `va` at `target_level`, creating
    /// intermediate page-table pages on demand if `alloc` is set. Passing
    /// `target_level == 0` walks the full three levels to a 4 KiB leaf,
    /// as plain `walk` always did; higher target levels stop early so the
    /// caller can install a megapage (level 1) or gigapage (level 2) leaf
    /// directly, the way the kernel's own boot-time mappings do.
    fn walk_to_level(&mut self, va: usize, target_level: usize, alloc: bool) -> Option<*mut PageTableEntry> {
        let mut table_pa = self.root as usize;
        for level in (target_level + 1..=2).rev() {
            let idx = px(level, va);
            let pte = &mut self.table_mut(table_pa).entries[idx] as *mut PageTableEntry;
            // SAFETY: `pte` is a valid entry of a page table owned by `self`.
            let pte_ref = unsafe { &mut *pte };
            if pte_ref.is_valid() {
                if !pte_ref.is_table() {
                    return None;
                }
                table_pa = pte_ref.pa();
            } else {
                if !alloc {
                    return None;
                }
                let child = RawPageTable::alloc_zeroed()?;
                pte_ref.set_table(child as usize);
                table_pa = child as usize;
            }
        }
        let idx = px(target_level, va);
        Some(&mut self.table_mut(table_pa).entries[idx] as *mut PageTableEntry)
    }

    /// Walks to the level-0 PTE for `va`, creating intermediate
    /// page-table pages on demand if `alloc` is set.
    fn walk(&mut self, va: usize, alloc: bool) -> Option<*mut PageTableEntry> {
        self.walk_to_level(va, 0, alloc)
    }

    /// Installs a single leaf mapping `va -> pa` with permission `perm`.
    /// `va` and `pa` must both be page-aligned.
    pub fn map_page(&mut self, va: usize, pa: usize, perm: PteFlags) -> Result<(), ()> {
        debug_assert_eq!(va % PGSIZE, 0);
        debug_assert_eq!(pa % PGSIZE, 0);
        let pte = self.walk(va, true).ok_or(())?;
        // SAFETY: `walk` returned a valid entry of a table owned by `self`.
        let pte = unsafe { &mut *pte };
        if pte.is_valid() {
            panic!("map_page: remap at {:#x}", va);
        }
        pte.set_leaf(pa, perm);
        Ok(())
    }

    /// Installs a leaf mapping directly at `level` (1 for a 2 MiB
    /// megapage, 2 for a 1 GiB gigapage) instead of walking all the way
    /// to a 4 KiB leaf. `va` and `pa` must both be aligned to that
    /// level's page size. Used only for the kernel's own boot-time
    /// mappings (`kernel.rs::map_kernel_image`); `walk` never promotes to
    /// one of these on its own.
    fn map_leaf_at_level(&mut self, va: usize, pa: usize, perm: PteFlags, level: usize) -> Result<(), ()> {
        let align = 1usize << pxshift(level);
        debug_assert_eq!(va % align, 0);
        debug_assert_eq!(pa % align, 0);
        let pte = self.walk_to_level(va, level, true).ok_or(())?;
        // SAFETY: `walk_to_level` returned a valid entry of a table owned
        // by `self`.
        let pte = unsafe { &mut *pte };
        if pte.is_valid() {
            panic!("map_leaf_at_level: remap at {:#x}", va);
        }
        pte.set_leaf(pa, perm);
        Ok(())
    }

    /// Installs a single 1 GiB gigapage leaf mapping at level 2 (the
    /// root), for the kernel's own MMIO windows below `RAM_START`.
    pub fn map_gigapage(&mut self, va: usize, pa: usize, perm: PteFlags) -> Result<(), ()> {
        self.map_leaf_at_level(va, pa, perm, 2)
    }

    /// Installs a single 2 MiB megapage leaf mapping at level 1, for the
    /// tail of managed RAM past the kernel image's own page-granularity
    /// mappings.
    pub fn map_megapage(&mut self, va: usize, pa: usize, perm: PteFlags) -> Result<(), ()> {
        self.map_leaf_at_level(va, pa, perm, 1)
    }

    /// Installs mappings for every page in `[va, va+size)`, mapping page
    /// `i` to `pas[i]`.
    fn map_range(&mut self, va: usize, pas: &[usize], perm: PteFlags) -> Result<(), ()> {
        for (i, &pa) in pas.iter().enumerate() {
            self.map_page(va + i * PGSIZE, pa, perm)?;
        }
        Ok(())
    }

    /// Updates the permission bits of every leaf PTE in `[va, va+size)`,
    /// leaving the mapped physical pages untouched.
    pub fn set_range_flags(&mut self, va: usize, size: usize, perm: PteFlags) {
        let start = pgrounddown(va);
        let end = pgroundup(va + size);
        for a in num_iter::range_step(start, end, PGSIZE) {
            let pte = self.walk(a, false).expect("set_range_flags: unmapped page");
            // SAFETY: from `walk`.
            let pte = unsafe { &mut *pte };
            pte.set_flags(perm);
        }
    }

    /// Unmaps `[va, va+size)`. If `free` is set, also frees the physical
    /// pages the mappings pointed to.
    pub fn unmap_range(&mut self, va: usize, size: usize, free: bool) {
        let start = pgrounddown(va);
        let end = pgroundup(va + size);
        for a in num_iter::range_step(start, end, PGSIZE) {
            if let Some(pte) = self.walk(a, false) {
                // SAFETY: from `walk`.
                let pte = unsafe { &mut *pte };
                if pte.is_valid() {
                    if free {
                        // SAFETY: the caller's contract for `free` is that no
                        // other mapping references this physical page.
                        unsafe { kernel().free_page(pte.pa()) };
                    }
                    pte.invalidate();
                }
            }
        }
    }

    /// Reads the leaf PTE for `va`, if mapped.
    fn lookup(&mut self, va: usize) -> Option<PageTableEntry> {
        self.walk(va, false).map(|pte| unsafe { *pte })
    }

    /// Copies every level-2 entry flagged `G` (global kernel/MMIO mappings)
    /// from `kernel_pt` into `self`'s root, so user page tables share the
    /// kernel's address range without walking it again.
    pub fn install_global_mappings(&mut self, kernel_pt: &PageTable) {
        // SAFETY: both roots are page-table pages this module owns.
        let src = unsafe { &*kernel_pt.root };
        let dst = unsafe { &mut *self.root };
        for i in 0..PTE_PER_PT {
            if src.entries[i].flags().contains(PteFlags::G) {
                dst.entries[i] = src.entries[i];
            }
        }
    }

    /// Frees every page-table page reachable from `self`'s root, without
    /// touching the leaf data pages the caller must already have unmapped.
    /// Bottom-up: a table's entries are all either invalid or themselves
    /// page-table pages (never leaves) by the time this runs, so freeing
    /// proceeds level 2 -> level 1 -> level 0 -> the root.
    fn free_page_tables(&mut self) {
        fn free_walk(pt: &mut PageTable, table_pa: usize) {
            for i in 0..PTE_PER_PT {
                let pte = pt.table(table_pa).entries[i];
                if pte.is_table() {
                    free_walk(pt, pte.pa());
                } else if pte.is_valid() {
                    panic!("free_page_tables: leaf still mapped");
                }
            }
            // SAFETY: every child has just been freed; nothing else can
            // reference `table_pa` since it is only reachable through the
            // parent entry this call is about to drop.
            unsafe { kernel().free_page(table_pa) };
        }
        let root_pa = self.root as usize;
        free_walk(self, root_pa);
    }
}

/// A user process's address space: its page table plus the size of the
/// mapped user region, `[USER_START_VMA, USER_START_VMA + size)`.
pub struct AddrSpace {
    pt: PageTable,
    size: usize,
}

impl AddrSpace {
    /// A fresh address space with the kernel/MMIO global mappings
    /// installed and nothing else.
    pub fn new() -> Option<Self> {
        let mut pt = PageTable::new()?;
        pt.install_global_mappings(kernel().kernel_pagetable());
        Some(Self { pt, size: 0 })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn mtag(&self, asid: u64) -> crate::riscv::Mtag {
        crate::riscv::make_mtag(asid, self.pt.root_pa())
    }

    /// Allocates one physical page and maps it at `va` (which must be
    /// page-aligned) with `perm`. Used for page-fault-driven demand
    /// allocation of the user stack/heap.
    pub fn alloc_and_map_page(&mut self, va: usize, perm: PteFlags) -> Result<(), ()> {
        debug_assert_eq!(va % PGSIZE, 0);
        let pa = kernel().alloc_page().ok_or(())?;
        if self.pt.map_page(va, pa, perm).is_err() {
            // SAFETY: `pa` was never installed into any page table.
            unsafe { kernel().free_page(pa) };
            return Err(());
        }
        Ok(())
    }

    /// Allocates and maps every page-aligned page in `[va, va+size)`. On
    /// any failure partway through, frees every physical page it mapped
    /// before returning (not virtual addresses: the physical pages behind
    /// the PTEs it just installed).
    pub fn alloc_and_map_range(&mut self, va: usize, size: usize, perm: PteFlags) -> Result<(), ()> {
        let start = pgrounddown(va);
        let end = pgroundup(va + size);

        // Tracks how much of `[start, end)` has been successfully mapped.
        // On an early return the guard unmaps and frees exactly that much:
        // the physical pages behind the PTEs this call installed, not the
        // virtual addresses past the point of failure.
        let pt = &mut self.pt as *mut PageTable;
        let mut progress = guard(start, move |mapped_end| {
            if mapped_end > start {
                // SAFETY: `pt` outlives this closure; it only runs while
                // `self.pt` is still alive, either inline or at unwind.
                unsafe { (*pt).unmap_range(start, mapped_end - start, true) };
            }
        });

        let mut a = start;
        while a < end {
            let pa = kernel().alloc_page().ok_or(())?;
            if self.pt.map_page(a, pa, perm).is_err() {
                // SAFETY: never installed into any page table.
                unsafe { kernel().free_page(pa) };
                return Err(());
            }
            a += PGSIZE;
            *progress = a;
        }

        // Every page mapped; disarm the rollback guard.
        scopeguard::ScopeGuard::into_inner(progress);
        if va + size > self.size {
            self.size = va + size;
        }
        Ok(())
    }

    pub fn set_range_flags(&mut self, va: usize, size: usize, perm: PteFlags) {
        self.pt.set_range_flags(va, size, perm);
    }

    /// Unmaps and frees the entire user region, leaving the global
    /// mappings untouched, then frees the address space's own page-table
    /// pages.
    pub fn reclaim(&mut self) {
        if self.size > 0 {
            self.pt.unmap_range(USER_START_VMA, self.size, true);
        }
        self.pt.free_page_tables();
        self.size = 0;
    }

    /// Clones this address space: allocates a fresh root, shares the
    /// global mappings, then copies every mapped user page byte-for-byte
    /// into a freshly allocated physical page with the same permissions.
    pub fn clone_for_fork(&mut self) -> Option<Self> {
        let mut child = Self::new()?;
        let mut a = USER_START_VMA;
        while a < USER_START_VMA + self.size {
            if let Some(pte) = self.pt.lookup(a) {
                if pte.is_valid() {
                    let perm = pte.flags();
                    let src_pa = pte.pa();
                    if child.alloc_and_map_page(a, perm).is_err() {
                        child.reclaim();
                        return None;
                    }
                    if let Some(child_pte) = child.pt.walk(a, false) {
                        // SAFETY: just mapped above.
                        let dst_pa = unsafe { (*child_pte).pa() };
                        // SAFETY: `src_pa`/`dst_pa` are both valid,
                        // page-sized, non-overlapping physical pages.
                        unsafe {
                            core::ptr::copy_nonoverlapping(
                                src_pa as *const u8,
                                dst_pa as *mut u8,
                                PGSIZE,
                            );
                        }
                    }
                }
            }
            a += PGSIZE;
        }
        child.size = self.size;
        Some(child)
    }

    /// Bounds-only check that `[vptr, vptr+len)` lies entirely within the
    /// mapped user region. Used by trusted kernel callers (the ELF loader)
    /// that map the range themselves and don't need a permission check.
    fn in_range(&self, vptr: usize, len: usize) -> Result<(), ()> {
        if vptr < USER_START_VMA {
            return Err(());
        }
        let end = vptr.checked_add(len).ok_or(())?;
        if end > USER_START_VMA + self.size || end > USER_END_VMA {
            return Err(());
        }
        Ok(())
    }

    /// Validates that `[vptr, vptr+len)` lies within the mapped user
    /// region and that every page it touches carries all of `flags` in
    /// its PTE. This is the check the syscall layer runs on every user
    /// pointer before dereferencing it, so a read-only text page can't be
    /// handed to a syscall expecting to write through it.
    pub fn validate_vptr_len(&mut self, vptr: usize, len: usize, flags: PteFlags) -> Result<(), ()> {
        self.in_range(vptr, len)?;
        if len == 0 {
            return Ok(());
        }
        let start = pgrounddown(vptr);
        let end = pgroundup(vptr + len);
        let mut a = start;
        while a < end {
            let pte = self.pt.lookup(a).ok_or(())?;
            if !pte.is_valid() || !pte.flags().contains(flags) {
                return Err(());
            }
            a += PGSIZE;
        }
        Ok(())
    }

    /// Walks the NUL-terminated string starting at `vs`, checking `flags`
    /// on every page it enters as it goes, and returns the bytes
    /// excluding the NUL. Fails if any page touched is missing a required
    /// permission, or if no NUL is found within `max` bytes.
    pub fn validate_vstr(
        &mut self,
        vs: usize,
        max: usize,
        flags: PteFlags,
    ) -> Result<arrayvec::ArrayVec<u8, 256>, ()> {
        let mut out = arrayvec::ArrayVec::new();
        let mut checked_page = None;
        for i in 0..max.min(out.capacity()) {
            let vptr = vs + i;
            let page = pgrounddown(vptr);
            if checked_page != Some(page) {
                self.validate_vptr_len(vptr, 1, flags)?;
                checked_page = Some(page);
            }
            // SAFETY: just validated that `page` is mapped with `flags`.
            let b = unsafe { *(vptr as *const u8) };
            if b == 0 {
                return Ok(out);
            }
            out.push(b);
        }
        Err(())
    }

    /// Copies bytes out of the user region starting at `vptr` until a NUL
    /// is found or `max` bytes have been copied, whichever comes first.
    /// Returns the bytes excluding the NUL. Trusted-caller bounds check
    /// only; see `validate_vstr` for the permission-checked variant.
    pub fn copy_in_str(&self, vptr: usize, max: usize) -> Result<arrayvec::ArrayVec<u8, 256>, ()> {
        self.in_range(vptr, 1)?;
        let mut out = arrayvec::ArrayVec::new();
        for i in 0..max.min(out.capacity()) {
            self.in_range(vptr + i, 1)?;
            // SAFETY: validated above; the physical page behind `vptr + i`
            // is mapped and owned by this address space.
            let b = unsafe { *((vptr + i) as *const u8) };
            if b == 0 {
                return Ok(out);
            }
            out.push(b);
        }
        Err(())
    }

    /// Copies `buf` into the user region at `vptr`.
    pub fn copy_out(&self, vptr: usize, buf: &[u8]) -> Result<(), ()> {
        self.in_range(vptr, buf.len())?;
        // SAFETY: validated above.
        unsafe { core::ptr::copy_nonoverlapping(buf.as_ptr(), vptr as *mut u8, buf.len()) };
        Ok(())
    }

    /// Copies `buf.len()` bytes out of the user region at `vptr`.
    pub fn copy_in(&self, vptr: usize, buf: &mut [u8]) -> Result<(), ()> {
        self.in_range(vptr, buf.len())?;
        // SAFETY: validated above.
        unsafe { core::ptr::copy_nonoverlapping(vptr as *const u8, buf.as_mut_ptr(), buf.len()) };
        Ok(())
    }

    /// Handles a page fault at `va`: if it falls within the address
    /// space's declared size and isn't already mapped, demand-allocates a
    /// single RW page there. Returns whether the fault was resolved.
    pub fn handle_page_fault(&mut self, va: usize) -> bool {
        let va = pgrounddown(va);
        if va < USER_START_VMA || va >= USER_START_VMA + self.size {
            return false;
        }
        if self.pt.lookup(va).map(|p| p.is_valid()).unwrap_or(false) {
            return false;
        }
        self.alloc_and_map_page(va, PteFlags::R | PteFlags::W | PteFlags::U)
            .is_ok()
    }
}

impl Drop for AddrSpace {
    fn drop(&mut self) {
        self.reclaim();
    }
}

/// Sanity check used by `kernel.rs` at boot: every physical page this
/// module hands out must lie inside managed RAM.
pub fn pa_in_ram(pa: usize) -> bool {
    pa >= RAM_START && pa < RAM_END && pa % PGSIZE == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pte_round_trip() {
        let pa = 0x8010_0000usize;
        let mut pte = PageTableEntry::default();
        pte.set_leaf(pa, PteFlags::R | PteFlags::W | PteFlags::U);
        assert!(pte.is_valid());
        assert!(!pte.is_table());
        assert_eq!(pte.pa(), pa);
        assert!(pte.flags().contains(PteFlags::R | PteFlags::W | PteFlags::U));
    }

    #[test]
    fn table_entry_has_no_rwx() {
        let pa = 0x8020_0000usize;
        let mut pte = PageTableEntry::default();
        pte.set_table(pa);
        assert!(pte.is_valid());
        assert!(pte.is_table());
        assert_eq!(pte.pa(), pa);
    }

    #[test]
    fn px_indices_partition_address() {
        let va = 0x1_2345_6000usize;
        assert_eq!(px(0, va), (va >> 12) & 0x1ff);
        assert_eq!(px(1, va), (va >> 21) & 0x1ff);
        assert_eq!(px(2, va), (va >> 30) & 0x1ff);
    }
}
