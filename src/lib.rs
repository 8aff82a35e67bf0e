//! Per-process virtual memory for a small 32-bit x86 kernel: a two-level
//! page-table engine, the `wmap` user mapping layer with demand paging,
//! and the lean process/file plumbing they hang off.
//!
//! Boot bring-up (entry stubs, GDT/IDT, LAPIC) lives outside this crate;
//! it calls `console::init`, `kheap::init`, `kalloc::init`, `vm::init`,
//! `ramdisk::init` and `fs::init` in that order, then `proc::user_init`.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

#[macro_use]
pub mod console;

pub mod constants;
mod elf;
pub mod error;
pub mod file;
pub mod fs;
pub mod journal;
pub mod kalloc;
pub mod kheap;
pub mod mmu;
pub mod proc;
pub mod ramdisk;
mod superblock;
pub mod syscall;
pub mod trap;
mod util;
pub mod vm;
pub mod wmap;
mod x86;

#[cfg(not(test))]
#[panic_handler]
fn panic(info: &core::panic::PanicInfo) -> ! {
    println!("kernel panic: {}", info);
    loop {
        // Requires a fresh `cli` in the entry stub to be a true halt.
        core::hint::spin_loop();
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::{Mutex, MutexGuard};

    static DISK_LOCK: Mutex<()> = Mutex::new(());

    /// Serialize tests that touch the shared ramdisk/journal/file-system
    /// state, bringing that stack up on first use.
    pub(crate) fn lock_fs() -> MutexGuard<'static, ()> {
        let guard = DISK_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        crate::ramdisk::init();
        crate::fs::init();
        guard
    }
}
