//! Physical page allocator.
//!
//! Free pages are threaded into a singly linked list through their own
//! first word: freeing a page writes the current head into it and makes
//! it the new head, allocating pops the head off. The list is LIFO and
//! every page on it lies in `[heap_end, RAM_END)`, page-aligned.

use core::ptr;

use crate::memlayout::RAM_END;
use crate::riscv::{pgrounddown, pgroundup, PGSIZE};

struct Run {
    next: *mut Run,
}

/// # Safety invariants
/// - The list has no cycle.
/// - A null `head` means the list is empty; otherwise `head` points at a
///   valid, page-aligned, currently-free page within `[heap_end, RAM_END)`.
pub struct Kmem {
    head: *mut Run,
}

// SAFETY: all accesses go through a lock held by the caller (`Spinlock<Kmem>`
// in `kernel.rs`); the pointers here are never read without it.
unsafe impl Send for Kmem {}

impl Kmem {
    pub const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
        }
    }

    /// Populates the free list with every page between `heap_end`
    /// (rounded up) and `RAM_END` (rounded down).
    ///
    /// # Safety
    /// Must be called exactly once, before any other use of physical
    /// memory in `[heap_end, RAM_END)`.
    pub unsafe fn init(&mut self, heap_end: usize) {
        let pa_start = pgroundup(heap_end);
        let pa_end = pgrounddown(RAM_END);
        for pa in num_iter::range_step(pa_start, pa_end, PGSIZE) {
            unsafe { self.free(pa) };
        }
    }

    /// Returns the physical page at `pa` to the free list, zeroing it
    /// first so a freed page never leaks its previous contents to
    /// whoever allocates it next.
    ///
    /// # Safety
    /// `pa` must be page-aligned, must lie in the managed range, and must
    /// not currently be on the free list or in use by anything else.
    pub unsafe fn free(&mut self, pa: usize) {
        debug_assert_eq!(pa % PGSIZE, 0, "Kmem::free: unaligned page");
        unsafe { ptr::write_bytes(pa as *mut u8, 0, PGSIZE) };
        let run = pa as *mut Run;
        unsafe { (*run).next = self.head };
        self.head = run;
    }

    /// Pops a page off the free list, if any are left.
    pub fn alloc(&mut self) -> Option<usize> {
        let run = self.head;
        if run.is_null() {
            return None;
        }
        // SAFETY: `run` is a valid free page by the list invariant.
        self.head = unsafe { (*run).next };
        Some(run as usize)
    }
}

impl Default for Kmem {
    fn default() -> Self {
        Self::new()
    }
}
