use core::fmt::Display;
use core::ops::{Add, Sub};
use core::sync::atomic::{AtomicUsize, Ordering};

use alloc::vec::Vec;
use bitflags::bitflags;

use crate::arch::{PGSIZE, pg_round_down, pg_round_up, registers::satp};
use crate::kalloc::Kmem;

/// Physical address
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PA(usize);

/// Virtual address
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct VA(usize);

macro_rules! address {
    ($name:ident) => {
        impl $name {
            pub const fn new(value: usize) -> Self {
                Self(value)
            }

            pub const fn as_usize(&self) -> usize {
                self.0
            }
        }

        impl From<usize> for $name {
            fn from(value: usize) -> Self {
                Self(value)
            }
        }

        impl Add<usize> for $name {
            type Output = Self;

            fn add(self, rhs: usize) -> Self::Output {
                Self(self.0 + rhs)
            }
        }

        impl Sub<usize> for $name {
            type Output = Self;

            fn sub(self, rhs: usize) -> Self::Output {
                Self(self.0 - rhs)
            }
        }
    };
}

address!(PA);
address!(VA);

bitflags! {
    /// Page table entry permission and status bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: usize {
        const V = 1 << 0;
        const R = 1 << 1;
        const W = 1 << 2;
        const X = 1 << 3;
        const U = 1 << 4;
        /// Shared copy-on-write page, writable once a private copy exists.
        const COW = 1 << 8;
    }
}

/// Virtual memory error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// No physical page left.
    Alloc,
    /// Address outside the process or not accessible from user mode.
    BadAddress,
    /// No mapping where one was required.
    NotMapped,
}

impl Display for VmError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            VmError::Alloc => write!(f, "alloc"),
            VmError::BadAddress => write!(f, "bad address"),
            VmError::NotMapped => write!(f, "not mapped"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pte {
    pub pa: PA,
    pub flags: PteFlags,
}

/// Kernel address space.
#[derive(Debug)]
pub struct Kvm;

impl Kvm {
    /// Switch the hart's page table register back to the kernel's page table.
    pub fn activate() {
        satp::write(0);
    }
}

/// User address space. Maps the pages of `[0, size)` one virtual page at a time.
#[derive(Debug)]
pub struct Uvm {
    token: usize,
    ptes: Vec<Option<Pte>>,
}

impl Default for Uvm {
    fn default() -> Self {
        Self::new()
    }
}

impl Uvm {
    /// Creates an empty user page table.
    pub fn new() -> Self {
        static NEXT_TOKEN: AtomicUsize = AtomicUsize::new(1);

        Self {
            token: NEXT_TOKEN.fetch_add(1, Ordering::Relaxed),
            ptes: Vec::new(),
        }
    }

    /// Value of `satp` while this address space is installed.
    pub fn token(&self) -> usize {
        self.token
    }

    /// Switch the hart's page table register to this page table.
    pub fn activate(&self) {
        satp::write(self.token);
    }

    /// Returns the PTE for the page holding `va`, if mapped.
    pub fn walk(&self, va: VA) -> Option<&Pte> {
        self.ptes.get(va.as_usize() / PGSIZE)?.as_ref()
    }

    fn walk_mut(&mut self, va: VA) -> Option<&mut Pte> {
        self.ptes.get_mut(va.as_usize() / PGSIZE)?.as_mut()
    }

    fn map(&mut self, va: VA, pa: PA, flags: PteFlags) {
        let vpn = va.as_usize() / PGSIZE;
        if self.ptes.len() <= vpn {
            self.ptes.resize(vpn + 1, None);
        }

        assert!(self.ptes[vpn].is_none(), "map: remap");
        self.ptes[vpn] = Some(Pte {
            pa,
            flags: flags | PteFlags::V,
        });
    }

    fn unmap(&mut self, va: VA) -> Option<Pte> {
        self.ptes.get_mut(va.as_usize() / PGSIZE)?.take()
    }

    /// Allocates PTEs and physical memory to grow process from `old_size` to `new_size`, which
    /// need not be page aligned. Returns new size.
    pub fn alloc(
        &mut self,
        kmem: &Kmem,
        old_size: usize,
        new_size: usize,
        xperm: PteFlags,
    ) -> Result<usize, VmError> {
        if new_size < old_size {
            return Ok(old_size);
        }

        for a in (pg_round_up(old_size)..new_size).step_by(PGSIZE) {
            let Ok(pa) = kmem.kalloc() else {
                self.dealloc(kmem, a, old_size);
                err!(VmError::Alloc);
            };

            // # Safety: the page is fresh
            unsafe { kmem.page_mut(pa) }.fill(0);
            self.map(VA(a), pa, PteFlags::R | PteFlags::U | xperm);
        }

        Ok(new_size)
    }

    /// Deallocates user pages to bring the process size from `old_size` to `new_size`, which need
    /// not be page aligned. Returns the new process size.
    pub fn dealloc(&mut self, kmem: &Kmem, old_size: usize, new_size: usize) -> usize {
        if new_size >= old_size {
            return old_size;
        }

        for a in (pg_round_up(new_size)..pg_round_up(old_size)).step_by(PGSIZE) {
            if let Some(pte) = self.unmap(VA(a)) {
                kmem.kfree(pte.pa);
            }
        }

        self.ptes.truncate(pg_round_up(new_size) / PGSIZE);
        new_size
    }

    /// Shares this address space with a new one, copy-on-write.
    ///
    /// Every page of `[0, size)` becomes mapped by both, writable pages lose their write bit in
    /// both and get marked COW, and every page's reference count goes up by one.
    pub fn copy_cow(&mut self, kmem: &Kmem, size: usize) -> Result<Uvm, VmError> {
        let mut child = Uvm::new();

        for a in (0..size).step_by(PGSIZE) {
            let Some(pte) = self.walk_mut(VA(a)) else {
                child.free(kmem, a);
                err!(VmError::NotMapped);
            };

            if pte.flags.contains(PteFlags::W) {
                pte.flags.remove(PteFlags::W);
                pte.flags.insert(PteFlags::COW);
            }

            kmem.inc_ref(pte.pa);
            let pte = *pte;
            child.map(VA(a), pte.pa, pte.flags);
        }

        Ok(child)
    }

    /// Frees user memory pages, then drops the page table.
    pub fn free(mut self, kmem: &Kmem, size: usize) {
        self.dealloc(kmem, size, 0);
    }

    /// Makes the COW page holding `va` writable, copying it if someone else still maps it.
    pub fn cow_fault(&mut self, kmem: &Kmem, va: VA) -> Result<(), VmError> {
        let Some(pte) = self.walk_mut(va) else {
            err!(VmError::NotMapped);
        };

        if !pte.flags.contains(PteFlags::COW) {
            err!(VmError::BadAddress);
        }

        if kmem.ref_count(pte.pa) > 1 {
            let Ok(copy) = kmem.kalloc() else {
                err!(VmError::Alloc);
            };

            // # Safety: the shared page is read-only for everyone, the copy is ours
            unsafe { kmem.page_mut(copy).copy_from_slice(kmem.page(pte.pa)) };
            kmem.dec_ref(pte.pa);
            pte.pa = copy;
        }

        pte.flags.remove(PteFlags::COW);
        pte.flags.insert(PteFlags::W);
        Ok(())
    }

    /// Copies from kernel to user. Copies `src` to virtual address `dst`.
    pub fn copy_out(&mut self, kmem: &Kmem, mut dst: VA, mut src: &[u8]) -> Result<(), VmError> {
        while !src.is_empty() {
            let va0 = VA(pg_round_down(dst.as_usize()));

            let Some(pte) = self.walk(va0) else {
                err!(VmError::NotMapped);
            };
            if !pte.flags.contains(PteFlags::U) {
                err!(VmError::BadAddress);
            }
            if !pte.flags.contains(PteFlags::W) {
                try_log!(self.cow_fault(kmem, va0));
            }

            let pa = self.walk(va0).map(|pte| pte.pa).ok_or(VmError::NotMapped)?;
            let offset = dst.as_usize() - va0.as_usize();
            let n = (PGSIZE - offset).min(src.len());

            // # Safety: the page is writable, so it is ours alone
            unsafe { kmem.page_mut(pa)[offset..offset + n].copy_from_slice(&src[..n]) };

            src = &src[n..];
            dst = va0 + PGSIZE;
        }

        Ok(())
    }

    /// Copies from user to kernel. Copies to `dst` from virtual address `src`.
    pub fn copy_in(&self, kmem: &Kmem, mut src: VA, mut dst: &mut [u8]) -> Result<(), VmError> {
        while !dst.is_empty() {
            let va0 = VA(pg_round_down(src.as_usize()));

            let Some(pte) = self.walk(va0) else {
                err!(VmError::NotMapped);
            };
            if !pte.flags.contains(PteFlags::U) {
                err!(VmError::BadAddress);
            }

            let offset = src.as_usize() - va0.as_usize();
            let n = (PGSIZE - offset).min(dst.len());

            // # Safety: we map the page, so it stays allocated
            unsafe { dst[..n].copy_from_slice(&kmem.page(pte.pa)[offset..offset + n]) };

            dst = &mut core::mem::take(&mut dst)[n..];
            src = va0 + PGSIZE;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::param::PHYSBASE;

    fn kmem(npages: usize) -> Kmem {
        Kmem::new(PA::new(PHYSBASE), PA::new(PHYSBASE + npages * PGSIZE))
    }

    #[test]
    fn alloc_zeroes_and_dealloc_frees() {
        let kmem = kmem(8);
        let mut uvm = Uvm::new();

        assert_eq!(uvm.alloc(&kmem, 0, 2 * PGSIZE + 1, PteFlags::W), Ok(2 * PGSIZE + 1));
        assert_eq!(kmem.free_pages(), 5);

        let mut buf = [0xffu8; 16];
        uvm.copy_in(&kmem, VA::new(2 * PGSIZE - 8), &mut buf).unwrap();
        assert_eq!(buf, [0; 16]);

        assert_eq!(uvm.dealloc(&kmem, 3 * PGSIZE, PGSIZE), PGSIZE);
        assert_eq!(kmem.free_pages(), 7);
        assert!(uvm.walk(VA::new(PGSIZE)).is_none());

        uvm.free(&kmem, PGSIZE);
        assert_eq!(kmem.free_pages(), 8);
    }

    #[test]
    fn alloc_failure_rolls_back() {
        let kmem = kmem(2);
        let mut uvm = Uvm::new();
        uvm.alloc(&kmem, 0, PGSIZE, PteFlags::W).unwrap();

        assert_eq!(
            uvm.alloc(&kmem, PGSIZE, 4 * PGSIZE, PteFlags::W),
            Err(VmError::Alloc)
        );
        assert_eq!(kmem.free_pages(), 1);
        assert!(uvm.walk(VA::new(PGSIZE)).is_none());
    }

    #[test]
    fn cow_copy_shares_every_page() {
        let kmem = kmem(8);
        let mut parent = Uvm::new();
        parent.alloc(&kmem, 0, 3 * PGSIZE, PteFlags::W).unwrap();
        parent.copy_out(&kmem, VA::new(10), b"hello").unwrap();

        let mut child = parent.copy_cow(&kmem, 3 * PGSIZE).unwrap();
        assert_eq!(kmem.free_pages(), 5);

        for a in (0..3 * PGSIZE).step_by(PGSIZE) {
            let p = *parent.walk(VA::new(a)).unwrap();
            let c = *child.walk(VA::new(a)).unwrap();
            assert_eq!(p, c);
            assert_eq!(kmem.ref_count(p.pa), 2);
            assert!(p.flags.contains(PteFlags::COW));
            assert!(!p.flags.contains(PteFlags::W));
        }

        // child writes: private copy, parent keeps the old contents
        child.copy_out(&kmem, VA::new(10), b"world").unwrap();
        assert_eq!(kmem.free_pages(), 4);

        let mut buf = [0u8; 5];
        parent.copy_in(&kmem, VA::new(10), &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        child.copy_in(&kmem, VA::new(10), &mut buf).unwrap();
        assert_eq!(&buf, b"world");

        let shared = parent.walk(VA::new(0)).unwrap().pa;
        assert_eq!(kmem.ref_count(shared), 1);

        // parent is now the last owner, it just gets write permission back
        parent.copy_out(&kmem, VA::new(0), b"!").unwrap();
        assert_eq!(parent.walk(VA::new(0)).unwrap().pa, shared);
        assert_eq!(kmem.free_pages(), 4);

        child.free(&kmem, 3 * PGSIZE);
        parent.free(&kmem, 3 * PGSIZE);
        assert_eq!(kmem.free_pages(), 8);
    }

    #[test]
    fn copy_outside_mapping() {
        let kmem = kmem(2);
        let mut uvm = Uvm::new();
        uvm.alloc(&kmem, 0, PGSIZE, PteFlags::W).unwrap();

        assert_eq!(
            uvm.copy_out(&kmem, VA::new(PGSIZE - 2), b"abcd"),
            Err(VmError::NotMapped)
        );
        let mut buf = [0u8; 4];
        assert_eq!(
            uvm.copy_in(&kmem, VA::new(5 * PGSIZE), &mut buf),
            Err(VmError::NotMapped)
        );
    }

    #[test]
    fn activate_installs_token() {
        let a = Uvm::new();
        let b = Uvm::new();
        assert_ne!(a.token(), b.token());

        a.activate();
        assert_eq!(satp::read(), a.token());
        Kvm::activate();
        assert_eq!(satp::read(), 0);
    }
}
