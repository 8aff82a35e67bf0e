use crate::mmu::VirtAddr;

pub(crate) unsafe fn memset(va: VirtAddr, c: u8, n: usize) {
    core::ptr::write_bytes(va.as_mut_ptr::<u8>(), c, n);
}

/// Copy `n` bytes; the ranges may overlap.
pub(crate) unsafe fn memmove(dst: VirtAddr, src: VirtAddr, n: usize) {
    core::ptr::copy(src.as_ptr::<u8>(), dst.as_mut_ptr::<u8>(), n);
}
