//! The page-table engine: walking and populating the two-level translation
//! structure, the fixed kernel window every address space shares, and the
//! per-process operations built on top (first page, segment load, heap
//! grow/shrink, fork copy, teardown, user copies).

use crate::constants::*;
use crate::error::{KernelError, KernelResult};
use crate::fs::{self, Inode};
use crate::kalloc;
use crate::mmu::{
    page_round_down, page_round_up, PageDirectory, PhysAddr, Pte, PteFlags, VirtAddr,
};
use crate::proc::Proc;
use crate::util;
use crate::x86;
use arrayvec::ArrayVec;
use core::ptr::NonNull;
use spin::Once;

/// Start of the kernel's data segment, reported by the boot path from the
/// linker map. Text and rodata below it are mapped read-only.
static KDATA: Once<VirtAddr> = Once::new();

/// Page directory used when no process is running.
static KPGDIR: Once<VirtAddr> = Once::new();

/// Record the kernel layout and build the scheduler's page directory.
/// Must run before any address space is created.
pub fn init(kernel_data: u32) {
    KDATA.call_once(|| VirtAddr(kernel_data));
    KPGDIR.call_once(|| {
        let dir = setup_kvm().expect("vm: out of memory building kernel page directory");
        VirtAddr(dir.as_ptr() as u32)
    });
    switch_kvm();
}

impl PageDirectory {
    /// Return the slot holding the leaf entry for `va`, walking the
    /// two-level structure. With `alloc` set, a missing page table is
    /// allocated (zeroed) on the way down; without it, a missing table
    /// yields `None`.
    pub(crate) fn walk(&mut self, va: VirtAddr, alloc: bool) -> Option<&mut Pte> {
        let pde = &mut self.entries[va.pdx()];
        if !pde.is_present() {
            if !alloc {
                return None;
            }
            let pt = kalloc::alloc_zeroed()?;
            // Permissive at the directory level; leaf PTEs carry the
            // actual per-page policy.
            pde.set(pt.to_pa(), PteFlags::P | PteFlags::W | PteFlags::U);
        }
        let table = pde.table();
        Some(&mut table.entries[va.ptx()])
    }

    /// Install mappings for `[va, va+size)` onto physical `[pa, pa+size)`.
    /// `va` and `size` need not be page-aligned. Fails only when a page
    /// table cannot be allocated; already-installed entries are left for
    /// the caller to unwind.
    pub(crate) fn map_pages(
        &mut self,
        va: VirtAddr,
        size: u32,
        pa: PhysAddr,
        perm: PteFlags,
    ) -> KernelResult<()> {
        assert!(size > 0, "map_pages: empty range");
        let mut a = page_round_down(va.0);
        let last = page_round_down(va.0.wrapping_add(size).wrapping_sub(1));
        let mut pa = pa.0;
        loop {
            let pte = self
                .walk(VirtAddr(a), true)
                .ok_or(KernelError::OutOfMemory)?;
            if pte.is_present() {
                panic!("map_pages: remap of va 0x{:x}", a);
            }
            pte.set(PhysAddr(pa), perm | PteFlags::P);
            if a == last {
                break;
            }
            a += PGSIZE;
            pa += PGSIZE;
        }
        Ok(())
    }

    /// Load the first process's code into address 0. `init` must be
    /// smaller than a page.
    pub(crate) fn init_uvm(&mut self, init: &[u8]) {
        if init.len() >= PGSIZE as usize {
            panic!("init_uvm: more than a page");
        }
        let mem = kalloc::alloc_zeroed().expect("init_uvm: out of memory");
        self.map_pages(VirtAddr(0), PGSIZE, mem.to_pa(), PteFlags::W | PteFlags::U)
            .expect("init_uvm: out of memory");
        unsafe {
            core::ptr::copy_nonoverlapping(init.as_ptr(), mem.as_mut_ptr::<u8>(), init.len());
        }
    }

    /// Read a program segment into pages previously mapped at `addr`,
    /// which must be page-aligned.
    pub(crate) fn load_uvm(
        &mut self,
        addr: VirtAddr,
        inode: &mut Inode,
        offset: u32,
        sz: u32,
    ) -> KernelResult<()> {
        if !addr.is_page_aligned() {
            panic!("load_uvm: addr must be page aligned");
        }
        let mut i = 0;
        while i < sz {
            let pte = self
                .walk(addr + i, false)
                .unwrap_or_else(|| panic!("load_uvm: address should exist"));
            if !pte.is_present() {
                panic!("load_uvm: address should exist");
            }
            let pa = pte.addr();
            let n = core::cmp::min(sz - i, PGSIZE);
            if fs::readi(inode, pa.to_va().as_mut_ptr(), offset + i, n) != Some(n) {
                return Err(KernelError::Io);
            }
            i += PGSIZE;
        }
        Ok(())
    }

    /// Grow the user range from `oldsz` to `newsz`, mapping fresh zeroed
    /// frames writable and user-accessible. Returns the new size, or 0
    /// with all partial work undone.
    pub(crate) fn alloc_uvm(&mut self, oldsz: u32, newsz: u32) -> u32 {
        if newsz >= KERN_BASE {
            return 0;
        }
        if newsz < oldsz {
            return oldsz;
        }

        let mut a = page_round_up(oldsz);
        while a < newsz {
            let mem = match kalloc::alloc_zeroed() {
                Some(mem) => mem,
                None => {
                    log::warn!("alloc_uvm: out of memory");
                    self.dealloc_uvm(newsz, oldsz);
                    return 0;
                }
            };
            if self
                .map_pages(VirtAddr(a), PGSIZE, mem.to_pa(), PteFlags::W | PteFlags::U)
                .is_err()
            {
                log::warn!("alloc_uvm: out of memory (2)");
                self.dealloc_uvm(newsz, oldsz);
                unsafe { kalloc::free(mem) };
                return 0;
            }
            a += PGSIZE;
        }
        newsz
    }

    /// Shrink the user range from `oldsz` to `newsz`, freeing frames and
    /// clearing their entries. `oldsz` may exceed the real size. Entries
    /// are zeroed before the frame goes back to the allocator.
    pub(crate) fn dealloc_uvm(&mut self, oldsz: u32, newsz: u32) -> u32 {
        if newsz >= oldsz {
            return oldsz;
        }

        let mut a = page_round_up(newsz);
        while a < oldsz {
            match self.walk(VirtAddr(a), false) {
                None => {
                    // No page table here; skip to the next directory slot.
                    a = (VirtAddr(a).pdx() as u32 + 1) << 22;
                }
                Some(pte) => {
                    if pte.is_present() {
                        let pa = pte.addr();
                        if pa.0 == 0 {
                            panic!("dealloc_uvm: null frame");
                        }
                        pte.clear();
                        unsafe { kalloc::free(pa.to_va()) };
                    }
                    a += PGSIZE;
                }
            }
        }
        newsz
    }

    /// Clear the user bit on a page, making it inaccessible below the
    /// user stack.
    pub(crate) fn clear_pte_u(&mut self, va: VirtAddr) {
        let pte = self
            .walk(va, false)
            .unwrap_or_else(|| panic!("clear_pte_u"));
        let addr = pte.addr();
        let flags = pte.flags() - PteFlags::U;
        pte.set(addr, flags);
    }

    /// Copy the `[0, sz)` range of this address space for a child,
    /// page by page onto fresh frames. Pages of wmap regions live above
    /// `sz` and are handled by the region layer. Returns the child
    /// directory, or `None` with the partial child freed.
    pub(crate) fn copy_uvm(&mut self, sz: u32) -> Option<NonNull<PageDirectory>> {
        let mut child = setup_kvm()?;
        let d = unsafe { child.as_mut() };

        let mut i = 0;
        while i < sz {
            let pte = self
                .walk(VirtAddr(i), false)
                .unwrap_or_else(|| panic!("copy_uvm: pte should exist"));
            if !pte.is_present() {
                panic!("copy_uvm: page not present");
            }
            let pa = pte.addr();
            let flags = pte.flags();
            let ok = (|| {
                let mem = kalloc::alloc()?;
                unsafe {
                    util::memmove(mem, pa.to_va(), PGSIZE as usize);
                }
                if d.map_pages(VirtAddr(i), PGSIZE, mem.to_pa(), flags).is_err() {
                    unsafe { kalloc::free(mem) };
                    return None;
                }
                Some(())
            })();
            if ok.is_none() {
                free_vm(child);
                return None;
            }
            i += PGSIZE;
        }
        Some(child)
    }

    /// Kernel-visible address of the frame backing user address `uva`,
    /// provided the leaf is present and user-accessible.
    pub(crate) fn uva_to_ka(&mut self, uva: VirtAddr) -> Option<VirtAddr> {
        let pte = self.walk(uva, false)?;
        if !pte.is_present() || !pte.flags().contains(PteFlags::U) {
            return None;
        }
        Some(pte.addr().to_va())
    }

    /// Copy `src` into user address `dst_va` of this address space,
    /// one page at a time. Works whether or not the address space is the
    /// one currently loaded.
    pub(crate) fn copy_out(&mut self, dst_va: u32, src: &[u8]) -> KernelResult<()> {
        let mut va = dst_va;
        let mut copied = 0;
        while copied < src.len() {
            let va0 = page_round_down(va);
            let ka = self
                .uva_to_ka(VirtAddr(va0))
                .ok_or(KernelError::BadArgument)?;
            let page_off = (va - va0) as usize;
            let n = core::cmp::min(PGSIZE as usize - page_off, src.len() - copied);
            unsafe {
                core::ptr::copy_nonoverlapping(
                    src.as_ptr().add(copied),
                    (ka + page_off as u32).as_mut_ptr::<u8>(),
                    n,
                );
            }
            copied += n;
            va = va0 + PGSIZE;
        }
        Ok(())
    }

    /// Present user-accessible leaves of this directory as `(va, pa)`
    /// pairs, up to the reporting cap.
    pub(crate) fn user_pages(&mut self) -> ArrayVec<(u32, u32), MAX_UPAGE_INFO> {
        let mut pages = ArrayVec::new();
        for i in 0..NPDENTRIES {
            if !self.entries[i].is_present() {
                continue;
            }
            let table = self.entries[i].table();
            for j in 0..NPTENTRIES {
                let pte = &table.entries[j];
                if pte.is_present() && pte.flags().contains(PteFlags::U) {
                    let va = ((i as u32) << 22) | ((j as u32) << PGSHIFT);
                    if pages.try_push((va, pte.addr().0)).is_err() {
                        return pages;
                    }
                }
            }
        }
        pages
    }
}

// Fixed kernel mappings present in every address space:
//   KERN_BASE..KERN_BASE+EXT_MEM  -> 0..EXT_MEM          (I/O space)
//   KERN_LINK..data               -> kernel text + rodata, read-only
//   data..P2V(PHYS_TOP)           -> kernel data and free physical memory
//   DEV_SPACE..4GiB               -> direct-mapped devices
struct Kmap {
    virt: u32,
    phys_start: u32,
    phys_end: u32,
    perm: PteFlags,
}

/// Build a fresh address space holding only the kernel window.
pub(crate) fn setup_kvm() -> Option<NonNull<PageDirectory>> {
    let data = KDATA.get().expect("vm: init has not run").0;

    let dir = kalloc::alloc_zeroed()?;
    let pgdir = unsafe { &mut *dir.as_mut_ptr::<PageDirectory>() };

    if PhysAddr(PHYS_TOP).to_va().0 > DEV_SPACE {
        panic!("PHYS_TOP too high");
    }

    let kmap = [
        Kmap {
            virt: KERN_BASE,
            phys_start: 0,
            phys_end: EXT_MEM,
            perm: PteFlags::W,
        },
        Kmap {
            virt: KERN_LINK,
            phys_start: VirtAddr(KERN_LINK).to_pa().0,
            phys_end: VirtAddr(data).to_pa().0,
            perm: PteFlags::empty(),
        },
        Kmap {
            virt: data,
            phys_start: VirtAddr(data).to_pa().0,
            phys_end: PHYS_TOP,
            perm: PteFlags::W,
        },
        Kmap {
            virt: DEV_SPACE,
            phys_start: DEV_SPACE,
            phys_end: 0, // wraps to the top of the address space
            perm: PteFlags::W,
        },
    ];

    let dir = NonNull::new(pgdir as *mut PageDirectory)?;
    for k in &kmap {
        let size = k.phys_end.wrapping_sub(k.phys_start);
        if pgdir
            .map_pages(VirtAddr(k.virt), size, PhysAddr(k.phys_start), k.perm)
            .is_err()
        {
            free_vm(dir);
            return None;
        }
    }

    Some(dir)
}

/// Free an address space: every frame still mapped in the user range,
/// then the page-table frames, then the directory itself. Region pages
/// must have been torn down first; a shared frame still present here
/// would be freed as if owned.
pub(crate) fn free_vm(mut dir: NonNull<PageDirectory>) {
    let pgdir = unsafe { dir.as_mut() };
    pgdir.dealloc_uvm(KERN_BASE, 0);
    for i in 0..NPDENTRIES {
        if pgdir.entries[i].is_present() {
            let pt = pgdir.entries[i].addr();
            unsafe { kalloc::free(pt.to_va()) };
        }
    }
    unsafe { kalloc::free(VirtAddr(dir.as_ptr() as u32)) };
}

/// Switch to the kernel-only page table, for when no process runs.
pub(crate) fn switch_kvm() {
    let dir = KPGDIR.get().expect("vm: init has not run");
    x86::lcr3(dir.to_pa());
}

/// Switch to a process's address space.
pub(crate) fn switch_uvm(p: &Proc) {
    let dir = p.pgdir.expect("switch_uvm: no pgdir");
    x86::lcr3(VirtAddr(dir.as_ptr() as u32).to_pa());
}
