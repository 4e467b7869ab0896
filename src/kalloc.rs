//! Physical page allocator.
//!
//! Hands out whole pages from a fixed range of physical memory. Every page carries a reference
//! count, the number of address spaces mapping it, so copy-on-write sharing knows when the last
//! mapping is gone. A page is on the free list iff its count is zero.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, Ordering};

use alloc::boxed::Box;
use alloc::vec;

use crate::arch::{PGSIZE, pg_round_up};
use crate::error::KernelError;
use crate::spinlock::SpinLock;
use crate::vm::PA;

/// Byte written over freed pages to catch dangling references.
const JUNK: u8 = 0x01;

struct FreeList {
    /// First free page
    head: Option<usize>,
    /// Next free page after each free page
    next: Box<[Option<usize>]>,
    refs: Box<[usize]>,
    nfree: usize,
}

pub struct Kmem {
    use_lock: AtomicBool,
    freelist: SpinLock<FreeList>,
    base: PA,
    end: PA,
    /// Backing store of the managed physical range.
    memory: Box<[UnsafeCell<[u8; PGSIZE]>]>,
}

// # Safety: page contents are only reached through `page`/`page_mut`, whose callers own the page.
unsafe impl Sync for Kmem {}

impl Kmem {
    /// Initializes the allocator over `[start, end)`, with `start` rounded up to a page boundary.
    ///
    /// The allocator starts unlocked for single-threaded bootstrap; call
    /// [`Kmem::enable_locking`] before a second hart can reach it.
    pub fn new(start: PA, end: PA) -> Self {
        let base = PA::from(pg_round_up(start.as_usize()));
        let npages = end.as_usize().saturating_sub(base.as_usize()) / PGSIZE;

        let kmem = Self {
            use_lock: AtomicBool::new(false),
            freelist: SpinLock::new(
                FreeList {
                    head: None,
                    next: vec![None; npages].into_boxed_slice(),
                    refs: vec![0; npages].into_boxed_slice(),
                    nfree: 0,
                },
                "kmem",
            ),
            base,
            end: base + npages * PGSIZE,
            memory: (0..npages).map(|_| UnsafeCell::new([0; PGSIZE])).collect(),
        };

        kmem.with_freelist(|freelist| {
            for page in 0..npages {
                kmem.reclaim(freelist, page);
            }
        });

        kmem
    }

    /// Turns the lock on. Called once the other harts may start allocating.
    pub fn enable_locking(&self) {
        self.use_lock.store(true, Ordering::Release);
    }

    fn with_freelist<R>(&self, f: impl FnOnce(&mut FreeList) -> R) -> R {
        if self.use_lock.load(Ordering::Acquire) {
            f(&mut self.freelist.lock())
        } else {
            // # Safety: still single threaded
            f(unsafe { self.freelist.get_mut_unchecked() })
        }
    }

    /// Page number of `pa`. Panics with `what` if it is not a managed page.
    fn index(&self, pa: PA, what: &str) -> usize {
        if pa.as_usize() % PGSIZE != 0 || pa < self.base || pa >= self.end {
            panic!("{what}: bad page {:#x}", pa.as_usize());
        }

        (pa.as_usize() - self.base.as_usize()) / PGSIZE
    }

    fn pa(&self, page: usize) -> PA {
        self.base + page * PGSIZE
    }

    /// Poisons a page whose count dropped to zero and puts it on the free list.
    fn reclaim(&self, freelist: &mut FreeList, page: usize) {
        // # Safety: nobody maps a page with no references
        unsafe { (*self.memory[page].get()).fill(JUNK) };

        freelist.next[page] = freelist.head;
        freelist.head = Some(page);
        freelist.nfree += 1;
    }

    /// Allocates one page of physical memory. Its reference count is 1.
    pub fn kalloc(&self) -> Result<PA, KernelError> {
        let page = self.with_freelist(|freelist| {
            let page = freelist.head?;
            freelist.head = freelist.next[page].take();
            freelist.nfree -= 1;
            freelist.refs[page] = 1;
            Some(page)
        });

        match page {
            Some(page) => Ok(self.pa(page)),
            None => err!(KernelError::Alloc),
        }
    }

    /// Drops one reference to the page at `pa`, freeing it when it was the last one.
    pub fn kfree(&self, pa: PA) {
        let page = self.index(pa, "kfree");

        self.with_freelist(|freelist| {
            assert_ne!(freelist.refs[page], 0, "kfree: page already free");

            freelist.refs[page] -= 1;
            if freelist.refs[page] == 0 {
                self.reclaim(freelist, page);
            }
        });
    }

    /// Records one more address space mapping the page at `pa`.
    pub fn inc_ref(&self, pa: PA) {
        let page = self.index(pa, "incref");

        self.with_freelist(|freelist| {
            assert_ne!(freelist.refs[page], 0, "incref: free page");
            freelist.refs[page] = freelist.refs[page]
                .checked_add(1)
                .expect("incref: overflow");
        });
    }

    /// Records one address space less mapping the page at `pa`. The last reference frees it.
    pub fn dec_ref(&self, pa: PA) {
        let page = self.index(pa, "decref");

        self.with_freelist(|freelist| {
            assert_ne!(freelist.refs[page], 0, "decref: underflow");

            freelist.refs[page] -= 1;
            if freelist.refs[page] == 0 {
                self.reclaim(freelist, page);
            }
        });
    }

    pub fn ref_count(&self, pa: PA) -> usize {
        let page = self.index(pa, "refcount");
        self.with_freelist(|freelist| freelist.refs[page])
    }

    pub fn free_pages(&self) -> usize {
        self.with_freelist(|freelist| freelist.nfree)
    }

    /// Number of pages under management.
    pub fn npages(&self) -> usize {
        self.memory.len()
    }

    pub fn range(&self) -> (PA, PA) {
        (self.base, self.end)
    }

    /// Contents of the page at `pa`.
    ///
    /// # Safety
    /// The caller must hold a reference to the page and nobody may be writing it.
    pub unsafe fn page(&self, pa: PA) -> &[u8; PGSIZE] {
        let page = self.index(pa, "page");
        unsafe { &*self.memory[page].get() }
    }

    /// Mutable contents of the page at `pa`.
    ///
    /// # Safety
    /// The caller must be the only one mapping the page.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn page_mut(&self, pa: PA) -> &mut [u8; PGSIZE] {
        let page = self.index(pa, "page");
        unsafe { &mut *self.memory[page].get() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::param::PHYSBASE;
    use crate::sched::testing::bind_hart;
    use std::collections::HashSet;
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::vec::Vec;

    fn kmem(npages: usize) -> Kmem {
        Kmem::new(PA::from(PHYSBASE), PA::from(PHYSBASE + npages * PGSIZE))
    }

    #[test]
    fn init_rounds_start_up() {
        let kmem = Kmem::new(
            PA::from(PHYSBASE + 1),
            PA::from(PHYSBASE + 4 * PGSIZE + 10),
        );
        assert_eq!(kmem.npages(), 3);
        assert_eq!(kmem.free_pages(), 3);
        assert_eq!(kmem.range().0, PA::from(PHYSBASE + PGSIZE));
    }

    #[test]
    fn alloc_sets_one_reference() {
        let kmem = kmem(4);
        let pa = kmem.kalloc().unwrap();
        assert_eq!(kmem.ref_count(pa), 1);
        assert_eq!(kmem.free_pages(), 3);

        kmem.kfree(pa);
        assert_eq!(kmem.ref_count(pa), 0);
        assert_eq!(kmem.free_pages(), 4);
        assert!(unsafe { kmem.page(pa) }.iter().all(|&b| b == JUNK));
    }

    #[test]
    fn exhaustion_leaves_no_trace() {
        let kmem = kmem(2);
        let a = kmem.kalloc().unwrap();
        let b = kmem.kalloc().unwrap();
        assert_ne!(a, b);
        assert_eq!(kmem.kalloc(), Err(KernelError::Alloc));
        assert_eq!(kmem.free_pages(), 0);

        kmem.kfree(b);
        assert_eq!(kmem.kalloc(), Ok(b));
    }

    #[test]
    fn shared_page_outlives_first_free() {
        let kmem = kmem(4);
        let pa = kmem.kalloc().unwrap();
        kmem.inc_ref(pa);
        assert_eq!(kmem.ref_count(pa), 2);

        kmem.kfree(pa);
        assert_eq!(kmem.ref_count(pa), 1);
        assert_eq!(kmem.free_pages(), 3);
        // still mapped, so never handed out again
        for _ in 0..3 {
            assert_ne!(kmem.kalloc().unwrap(), pa);
        }

        kmem.dec_ref(pa);
        assert_eq!(kmem.free_pages(), 1);
        assert_eq!(kmem.kalloc(), Ok(pa));
    }

    #[test]
    #[should_panic(expected = "kfree")]
    fn free_misaligned() {
        let kmem = kmem(2);
        let pa = kmem.kalloc().unwrap();
        kmem.kfree(pa + 8);
    }

    #[test]
    #[should_panic(expected = "kfree")]
    fn free_out_of_range() {
        let kmem = kmem(2);
        kmem.kfree(PA::from(PHYSBASE + 2 * PGSIZE));
    }

    #[test]
    #[should_panic(expected = "page already free")]
    fn double_free() {
        let kmem = kmem(2);
        let pa = kmem.kalloc().unwrap();
        kmem.kfree(pa);
        kmem.kfree(pa);
    }

    #[test]
    #[should_panic(expected = "decref: underflow")]
    fn decref_underflow() {
        let kmem = kmem(2);
        kmem.dec_ref(PA::from(PHYSBASE));
    }

    #[test]
    #[should_panic(expected = "incref: free page")]
    fn incref_free_page() {
        let kmem = kmem(2);
        kmem.inc_ref(PA::from(PHYSBASE));
    }

    #[test]
    #[should_panic(expected = "refcount")]
    fn refcount_out_of_range() {
        let kmem = kmem(2);
        kmem.ref_count(PA::from(PHYSBASE - PGSIZE));
    }

    #[test]
    fn concurrent_harts_never_share_a_page() {
        let kmem = Arc::new(kmem(64));
        kmem.enable_locking();
        let barrier = Arc::new(Barrier::new(4));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let kmem = Arc::clone(&kmem);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    bind_hart();
                    let pages: Vec<_> = (0..16).map(|_| kmem.kalloc().unwrap()).collect();
                    barrier.wait();
                    pages
                })
            })
            .collect();

        let pages: Vec<_> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(pages.iter().collect::<HashSet<_>>().len(), 64);

        bind_hart();
        assert_eq!(kmem.free_pages(), 0);
        for pa in pages {
            kmem.kfree(pa);
        }
        assert_eq!(kmem.free_pages(), 64);
    }
}
