//! System-call dispatch. Arguments arrive in registers (eax holds the
//! call number; edx, ecx, ebx, edi, esi the arguments, in that order) and
//! the result goes back in eax, `-1` for any failure.

use crate::error::{KernelError, KernelResult};
use crate::proc::{self, Proc};
use crate::wmap;
use core::mem;

pub(crate) mod consts {
    pub(crate) const SYS_FORK: u32 = 1;
    pub(crate) const SYS_EXIT: u32 = 2;
    pub(crate) const SYS_WAIT: u32 = 3;
    pub(crate) const SYS_KILL: u32 = 6;
    pub(crate) const SYS_SBRK: u32 = 12;
    pub(crate) const SYS_WMAP: u32 = 22;
    pub(crate) const SYS_WUNMAP: u32 = 23;
    pub(crate) const SYS_WREMAP: u32 = 24;
    pub(crate) const SYS_GETPGDIRINFO: u32 = 25;
    pub(crate) const SYS_GETWMAPINFO: u32 = 26;
}

use consts::*;

/// The n-th argument of the call captured in the trap frame.
fn arg(p: &Proc, n: usize) -> u32 {
    match n {
        0 => p.tf.regs.edx,
        1 => p.tf.regs.ecx,
        2 => p.tf.regs.ebx,
        3 => p.tf.regs.edi,
        4 => p.tf.regs.esi,
        _ => panic!("syscall: no such argument"),
    }
}

pub(crate) fn syscall(p: &mut Proc) {
    let no = p.tf.regs.eax;
    let ret = match dispatch(p, no) {
        Ok(v) => v,
        Err(e) => {
            log::debug!("pid {} {}: syscall {} failed: {}", p.pid, p.name_str(), no, e);
            -1
        }
    };
    p.tf.regs.eax = ret as u32;
}

fn dispatch(p: &mut Proc, no: u32) -> KernelResult<i32> {
    match no {
        SYS_FORK => proc::fork(p).map(|pid| pid as i32),
        SYS_EXIT => proc::exit(p),
        SYS_WAIT => Ok(proc::wait(p).map(|pid| pid as i32).unwrap_or(-1)),
        SYS_KILL => proc::kill(arg(p, 0)).map(|()| 0),
        SYS_SBRK => proc::grow_proc(p, arg(p, 0) as i32).map(|old| old as i32),
        SYS_WMAP => {
            let (addr, length, flags, fd) = (arg(p, 0), arg(p, 1) as i32, arg(p, 2), arg(p, 3) as i32);
            wmap::wmap(p, addr, length, flags, fd).map(|a| a as i32)
        }
        SYS_WUNMAP => wmap::wunmap(p, arg(p, 0)).map(|()| 0),
        SYS_WREMAP => {
            let (oldaddr, oldsize, newsize, flags) = (arg(p, 0), arg(p, 1), arg(p, 2), arg(p, 3));
            wmap::wremap(p, oldaddr, oldsize, newsize, flags).map(|a| a as i32)
        }
        SYS_GETPGDIRINFO => {
            let uptr = arg(p, 0);
            let info = wmap::getpgdirinfo(p);
            copy_struct_out(p, uptr, &info).map(|()| 0)
        }
        SYS_GETWMAPINFO => {
            let uptr = arg(p, 0);
            let info = wmap::getwmapinfo(p);
            copy_struct_out(p, uptr, &info).map(|()| 0)
        }
        _ => {
            log::warn!("pid {} {}: unknown syscall {}", p.pid, p.name_str(), no);
            Err(KernelError::BadArgument)
        }
    }
}

/// Copy a `repr(C)` result struct into the user buffer at `uptr`. The
/// page-table walk validates that every touched page is present and
/// user-accessible.
fn copy_struct_out<T>(p: &mut Proc, uptr: u32, value: &T) -> KernelResult<()> {
    if uptr == 0 {
        return Err(KernelError::BadArgument);
    }
    let bytes = unsafe {
        core::slice::from_raw_parts(value as *const T as *const u8, mem::size_of::<T>())
    };
    p.pgdir_mut().copy_out(uptr, bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::WMAP_BASE;
    use crate::wmap::MapFlags;

    #[test]
    fn arguments_map_onto_registers() {
        let mut p = Proc::new(1, b"test");
        p.tf.regs.edx = 10;
        p.tf.regs.ecx = 11;
        p.tf.regs.ebx = 12;
        p.tf.regs.edi = 13;
        p.tf.regs.esi = 14;
        assert_eq!(arg(&p, 0), 10);
        assert_eq!(arg(&p, 1), 11);
        assert_eq!(arg(&p, 2), 12);
        assert_eq!(arg(&p, 3), 13);
        assert_eq!(arg(&p, 4), 14);
    }

    #[test]
    fn wmap_roundtrips_through_the_dispatcher() {
        let _fs = crate::testing::lock_fs();
        let mut p = Proc::new(1, b"test");
        p.tf.regs.eax = SYS_WMAP;
        p.tf.regs.edx = 0;
        p.tf.regs.ecx = 8192;
        p.tf.regs.ebx = (MapFlags::ANONYMOUS | MapFlags::PRIVATE).bits();
        p.tf.regs.edi = -1i32 as u32;
        syscall(&mut p);
        let ret = p.tf.regs.eax;
        assert_eq!(ret, WMAP_BASE);
    }

    #[test]
    fn failures_surface_as_minus_one() {
        let _fs = crate::testing::lock_fs();
        let mut p = Proc::new(1, b"test");
        // wmap with an empty flag set.
        p.tf.regs.eax = SYS_WMAP;
        p.tf.regs.ecx = 8192;
        p.tf.regs.ebx = 0;
        syscall(&mut p);
        assert_eq!(p.tf.regs.eax as i32, -1);

        // An unknown call number.
        p.tf.regs.eax = 99;
        syscall(&mut p);
        assert_eq!(p.tf.regs.eax as i32, -1);
    }
}
