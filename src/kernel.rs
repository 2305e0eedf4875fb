//! The kernel singleton: wires the page allocator, the kernel's own page
//! table, and the fixed-contract `Scheduler`/`HeapAllocator` collaborators
//! together behind one lazily-initialized object every other module reaches
//! through `kernel()`.

use crate::kalloc::Kmem;
use crate::lock::Spinlock;
use crate::memlayout::{RAM_END, RAM_START};
use crate::riscv::{pgroundup, PGSIZE};
use crate::sched::{HeapAllocator, Scheduler};
use crate::vm::{pa_in_ram, PageTable, PteFlags};

/// First physical address past the kernel image, supplied by the linker
/// script (out of this crate's scope). The page allocator's free list
/// starts just above it.
extern "C" {
    static _kimg_end: u8;
}

/// Size of the megapage the kernel image and its immediately following
/// heap occupy, before the rest of RAM is mapped in coarser megapages.
const KIMG_MEGAPAGE: usize = 2 * 1024 * 1024;

/// An Sv39 level-1 leaf's span (2 MiB): the granularity the RAM tail past
/// the kernel's own megapage is mapped at.
const MEGAPAGE_SIZE: usize = 2 * 1024 * 1024;

/// An Sv39 level-2 leaf's span (1 GiB): the granularity the MMIO region
/// below `RAM_START` is mapped at.
const GIGAPAGE_SIZE: usize = 1024 * 1024 * 1024;

pub struct Kernel {
    kmem: Spinlock<Kmem>,
    kernel_pt: spin::Once<PageTable>,
    scheduler: spin::Once<&'static dyn Scheduler>,
    heap: spin::Once<&'static dyn HeapAllocator>,
}

static KERNEL: Kernel = Kernel {
    kmem: Spinlock::new("kmem", Kmem::new()),
    kernel_pt: spin::Once::new(),
    scheduler: spin::Once::new(),
    heap: spin::Once::new(),
};

pub fn kernel() -> &'static Kernel {
    &KERNEL
}

impl Kernel {
    /// Installs the scheduler/timer and early heap collaborators, builds
    /// the kernel's own page table, and seeds the free-page list. Must run
    /// once, before any user address space is created.
    ///
    /// # Safety
    /// Must be called exactly once, by the boot hart, before any other
    /// kernel subsystem (virtio, fs, proc) is touched.
    pub unsafe fn init(
        &self,
        scheduler: &'static dyn Scheduler,
        heap: &'static dyn HeapAllocator,
    ) {
        self.scheduler.call_once(|| scheduler);
        self.heap.call_once(|| heap);

        let kimg_end = unsafe { &_kimg_end as *const u8 as usize };
        let heap_end = pgroundup(kimg_end).max(pgroundup(RAM_START + KIMG_MEGAPAGE));
        // SAFETY: called exactly once, before any allocation.
        unsafe { self.kmem.lock().init(heap_end) };

        self.kernel_pt.call_once(|| {
            let mut pt = PageTable::new().expect("kernel: out of pages for root table");
            Self::map_kernel_image(&mut pt, kimg_end);
            pt
        });
    }

    /// Builds the kernel's own mappings: MMIO below `RAM_START` identity
    /// mapped, the kernel image itself, and the rest of managed RAM, all
    /// global (`G`) so every user address space shares them without a
    /// fresh walk.
    fn map_kernel_image(pt: &mut PageTable, kimg_end: usize) {
        let g = PteFlags::G;

        // MMIO below RAM_START: one RW gigapage per 1 GiB window instead of
        // a run of 4 KiB pages per device register window.
        for pa in num_iter::range_step(0, RAM_START, GIGAPAGE_SIZE) {
            if pt.map_gigapage(pa, pa, PteFlags::R | PteFlags::W | g).is_err() {
                panic!("kernel: failed to map MMIO gigapage at {:#x}", pa);
            }
        }

        // Kernel image pages are RWX; a stricter port would split text
        // (RX) from data (RW) using linker-provided section bounds, but
        // those symbols are outside this crate's scope.
        let perm = PteFlags::R | PteFlags::W | PteFlags::X | g;
        for pa in num_iter::range_step(RAM_START, pgroundup(kimg_end), PGSIZE) {
            debug_assert!(pa_in_ram(pa));
            if pt.map_page(pa, pa, perm).is_err() {
                panic!("kernel: failed to map kernel image at {:#x}", pa);
            }
        }

        let mega_end = RAM_START + KIMG_MEGAPAGE;
        for pa in num_iter::range_step(pgroundup(kimg_end), mega_end, PGSIZE) {
            debug_assert!(pa_in_ram(pa));
            if pt.map_page(pa, pa, PteFlags::R | PteFlags::W | g).is_err() {
                panic!("kernel: failed to map post-image RAM at {:#x}", pa);
            }
        }

        // Remainder of managed RAM: RW megapages rather than a 4 KiB loop.
        for pa in num_iter::range_step(mega_end, RAM_END, MEGAPAGE_SIZE) {
            debug_assert!(pa_in_ram(pa));
            if pt.map_megapage(pa, pa, PteFlags::R | PteFlags::W | g).is_err() {
                panic!("kernel: failed to map RAM megapage at {:#x}", pa);
            }
        }
    }

    pub fn scheduler(&self) -> &'static dyn Scheduler {
        *self.scheduler.get().expect("kernel: scheduler not installed")
    }

    pub fn heap(&self) -> &'static dyn HeapAllocator {
        *self.heap.get().expect("kernel: heap allocator not installed")
    }

    pub fn kernel_pagetable(&self) -> &PageTable {
        self.kernel_pt.get().expect("kernel: page table not initialized")
    }

    /// Installs the kernel's own address space as the running hart's
    /// active one. Used at boot and whenever a thread has no process
    /// address space of its own (e.g. while reclaiming one at exit).
    pub fn switch_to_kernel_pagetable(&self) {
        let tag = crate::riscv::make_mtag(0, self.kernel_pagetable().root_pa());
        crate::riscv::w_satp(tag);
    }

    /// Hands out one zeroed physical page from the free list, or `None`
    /// if none remain. There is no swap; callers that can't tolerate
    /// exhaustion (kernel-internal structures the rest of the system
    /// assumes always succeed) panic instead of propagating `None`.
    pub fn alloc_page(&self) -> Option<usize> {
        let pa = self.kmem.lock().alloc()?;
        // SAFETY: `pa` was just removed from the free list and is
        // exclusively owned by the caller from this point on.
        unsafe { core::ptr::write_bytes(pa as *mut u8, 0, PGSIZE) };
        Some(pa)
    }

    /// Returns a physical page to the free list.
    ///
    /// # Safety
    /// `pa` must be page-aligned, lie in managed RAM, and not be
    /// referenced by any live mapping or already be on the free list.
    pub unsafe fn free_page(&self, pa: usize) {
        unsafe { self.kmem.lock().free(pa) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kimg_megapage_is_page_aligned() {
        assert_eq!(KIMG_MEGAPAGE % PGSIZE, 0);
    }
}
