//! Physical frame allocator: a free list of 4096-byte frames threaded
//! through the frames themselves, handed out as kernel virtual addresses.

use crate::constants::PGSIZE;
use crate::mmu::VirtAddr;
use core::ptr::null_mut;
use spin::Mutex;

struct Run {
    next: *mut Run,
}

struct Kmem {
    freelist: *mut Run,
    nfree: usize,
}

unsafe impl Send for Kmem {}

static KMEM: Mutex<Kmem> = Mutex::new(Kmem {
    freelist: null_mut(),
    nfree: 0,
});

/// Hand the allocator the frames in `[vstart, vend)`. Called by the boot
/// path once the kernel window is mapped; both bounds are rounded inward
/// to page boundaries.
///
/// # Safety
///
/// The range must be kernel-mapped memory that nothing else will touch.
pub unsafe fn init(vstart: VirtAddr, vend: VirtAddr) {
    let end = vend.round_down(PGSIZE);
    let mut va = vstart.round_up(PGSIZE);
    while va + PGSIZE <= end {
        free(va);
        va += PGSIZE;
    }
}

/// Allocate one frame. Returns its kernel virtual address, or `None` when
/// physical memory is exhausted. The frame contents are garbage.
pub(crate) fn alloc() -> Option<VirtAddr> {
    let mut kmem = KMEM.lock();
    let run = kmem.freelist;
    if run.is_null() {
        return None;
    }
    unsafe {
        kmem.freelist = (*run).next;
    }
    kmem.nfree -= 1;
    Some(VirtAddr(run as u32))
}

/// Allocate one frame and zero it.
pub(crate) fn alloc_zeroed() -> Option<VirtAddr> {
    let va = alloc()?;
    unsafe {
        core::ptr::write_bytes(va.as_mut_ptr::<u8>(), 0, PGSIZE as usize);
    }
    Some(va)
}

/// Return a frame to the free list.
///
/// # Safety
///
/// `va` must be a frame previously obtained from [`alloc`] with no live
/// mapping left pointing at it.
pub(crate) unsafe fn free(va: VirtAddr) {
    if !va.is_page_aligned() {
        panic!("kalloc::free: 0x{:x} is not page aligned", va.0);
    }
    // Fill with junk so dangling references fault loudly.
    core::ptr::write_bytes(va.as_mut_ptr::<u8>(), 1, PGSIZE as usize);

    let mut kmem = KMEM.lock();
    let run = va.as_mut_ptr::<Run>();
    (*run).next = kmem.freelist;
    kmem.freelist = run;
    kmem.nfree += 1;
}

/// Number of free frames, for diagnostics.
#[allow(dead_code)]
pub(crate) fn free_frames() -> usize {
    KMEM.lock().nfree
}
