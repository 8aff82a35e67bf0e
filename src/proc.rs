//! Process records: the address space, heap size, open files and mapping
//! regions a process owns, plus the lifecycle operations (fork, exec,
//! exit, wait, sbrk, kill) that drive the VM subsystem.
//!
//! The context-switch core and scheduler live outside this crate; this
//! module only moves processes between states and tears resources down.

use crate::constants::*;
use crate::elf::{Elf, Proghdr, ELF_SIZE, PROGHDR_SIZE, PT_LOAD};
use crate::error::{KernelError, KernelResult};
use crate::file::{self, FileDescriptor, FileTableEntry};
use crate::fs::{self, Inode};
use crate::mmu::{page_round_up, PageDirectory, VirtAddr};
use crate::trap::Trapframe;
use crate::vm;
use crate::wmap::{self, ProcRegions};
use crate::x86;
use alloc::sync::Arc;
use core::ptr::{null_mut, NonNull};
use core::sync::atomic::{AtomicPtr, Ordering};
use spin::{Mutex, MutexGuard, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProcState {
    Embryo,
    Runnable,
    Running,
    Zombie,
}

pub struct Proc {
    pub(crate) pid: u32,
    pub(crate) name: [u8; 16],
    pub(crate) state: ProcState,
    pub(crate) killed: bool,
    parent: u32,
    pub(crate) pgdir: Option<NonNull<PageDirectory>>,
    pub(crate) sz: u32, // heap top; wmap regions live above, in their own window
    pub(crate) tf: Trapframe,
    pub(crate) ofile: [Option<FileTableEntry>; NOFILE],
    pub(crate) regions: ProcRegions,
}

// Proc moves between the table and per-CPU pointers; the NonNull page
// directory is what keeps Send from deriving.
unsafe impl Send for Proc {}

const NO_ENT: Option<FileTableEntry> = None;

impl Proc {
    pub(crate) fn new(pid: u32, name: &[u8]) -> Proc {
        let mut p = Proc {
            pid,
            name: [0; 16],
            state: ProcState::Embryo,
            killed: false,
            parent: 0,
            pgdir: None,
            sz: 0,
            tf: Trapframe::new(),
            ofile: [NO_ENT; NOFILE],
            regions: ProcRegions::new(),
        };
        p.set_name(name);
        p
    }

    pub(crate) fn set_name(&mut self, name: &[u8]) {
        self.name = [0; 16];
        let len = name.len().min(self.name.len() - 1);
        self.name[..len].copy_from_slice(&name[..len]);
    }

    pub(crate) fn name_str(&self) -> &str {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(16);
        core::str::from_utf8(&self.name[..len]).unwrap_or("?")
    }

    /// The process's page directory through the kernel window. The
    /// returned borrow is untracked on purpose: the directory outlives
    /// every use between `setup_kvm` and `free_vm`, and the table lock
    /// plus the one-CPU-per-process rule serialize access.
    pub(crate) fn pgdir_mut(&self) -> &'static mut PageDirectory {
        let dir = self.pgdir.expect("proc: no pgdir");
        unsafe { &mut *dir.as_ptr() }
    }

    pub(crate) fn kill(&mut self) {
        self.killed = true;
    }

    /// Put an open file into the lowest free descriptor slot.
    pub(crate) fn fd_alloc(&mut self, ent: FileTableEntry) -> Result<FileDescriptor, FileTableEntry> {
        for (fd, slot) in self.ofile.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(ent);
                return Ok(FileDescriptor(fd as u32));
            }
        }
        Err(ent)
    }
}

// --------------------------------------------------------------
// Per-CPU state. One CPU is wired up until the LAPIC id lookup of the
// boot path lands; the array keeps the shape the rest expects.
// --------------------------------------------------------------

struct Cpu {
    cur_proc: AtomicPtr<Proc>,
}

#[allow(clippy::declare_interior_mutable_const)]
const IDLE_CPU: Cpu = Cpu {
    cur_proc: AtomicPtr::new(null_mut()),
};

static CPUS: [Cpu; NCPU] = [IDLE_CPU; NCPU];

pub(crate) fn cpu_id() -> usize {
    0
}

/// The process running on this CPU, if any.
pub fn myproc() -> Option<&'static mut Proc> {
    unsafe { CPUS[cpu_id()].cur_proc.load(Ordering::Relaxed).as_mut() }
}

/// Mark `p` as the process this CPU executes and load its address space.
pub fn run(p: &'static mut Proc) {
    p.state = ProcState::Running;
    vm::switch_uvm(p);
    CPUS[cpu_id()].cur_proc.store(p, Ordering::Relaxed);
}

fn park_cpu() {
    CPUS[cpu_id()].cur_proc.store(null_mut(), Ordering::Relaxed);
}

// --------------------------------------------------------------
// Process table.
// --------------------------------------------------------------

pub(crate) struct ProcTable {
    procs: [Option<Proc>; NPROC],
    next_pid: u32,
}

const NO_PROC: Option<Proc> = None;

impl ProcTable {
    fn free_slot(&self) -> Option<usize> {
        self.procs.iter().position(|p| p.is_none())
    }

    fn alloc_pid(&mut self) -> u32 {
        let pid = self.next_pid;
        self.next_pid += 1;
        pid
    }

    pub(crate) fn find_mut(&mut self, pid: u32) -> Option<&mut Proc> {
        self.procs.iter_mut().flatten().find(|p| p.pid == pid)
    }

    fn release_zombie_child(&mut self, parent: u32) -> Option<u32> {
        let idx = self.procs.iter().position(|slot| {
            slot.as_ref()
                .map(|p| p.parent == parent && p.state == ProcState::Zombie)
                .unwrap_or(false)
        })?;
        let pid = self.procs[idx].as_ref().unwrap().pid;
        self.procs[idx] = None;
        Some(pid)
    }
}

static PROC_TABLE: Mutex<ProcTable> = Mutex::new(ProcTable {
    procs: [NO_PROC; NPROC],
    next_pid: 1,
});

pub(crate) fn proc_table() -> MutexGuard<'static, ProcTable> {
    PROC_TABLE.lock()
}

// --------------------------------------------------------------
// Lifecycle.
// --------------------------------------------------------------

/// Set up the first process from a flat binary smaller than one page,
/// mapped at virtual 0. Returns its pid.
pub fn user_init(init_code: &[u8]) -> u32 {
    let mut table = proc_table();
    let idx = table.free_slot().expect("user_init: no process slot");
    let pid = table.alloc_pid();

    let mut p = Proc::new(pid, b"initcode");
    let dir = vm::setup_kvm().expect("user_init: out of memory");
    p.pgdir = Some(dir);
    p.pgdir_mut().init_uvm(init_code);
    p.sz = PGSIZE;
    p.tf = Trapframe::new_for_user();
    p.tf.set_entry_point(VirtAddr(0));
    p.tf.esp = PGSIZE as usize;
    p.state = ProcState::Runnable;
    table.procs[idx] = Some(p);
    pid
}

/// Create a child copying the parent's address space: heap pages are
/// duplicated eagerly, wmap regions are shared or duplicated by their
/// flags, open files are duplicated. Returns the child's pid; the child
/// will return 0 from the same call.
pub fn fork(parent: &mut Proc) -> KernelResult<u32> {
    let mut table = proc_table();
    let idx = table.free_slot().ok_or(KernelError::NoSpace)?;
    let pid = table.alloc_pid();

    let mut child = Proc::new(pid, &parent.name);
    child.parent = parent.pid;

    let dir = parent
        .pgdir_mut()
        .copy_uvm(parent.sz)
        .ok_or(KernelError::OutOfMemory)?;
    child.pgdir = Some(dir);
    child.sz = parent.sz;

    if let Err(e) = wmap::fork_regions(parent, &mut child) {
        wmap::exit_regions(&mut child);
        child.pgdir = None;
        vm::free_vm(dir);
        return Err(e);
    }

    for (i, ent) in parent.ofile.iter().enumerate() {
        child.ofile[i] = ent.clone();
    }

    child.tf = parent.tf;
    child.tf.regs.eax = 0; // fork returns 0 in the child

    child.state = ProcState::Runnable;
    table.procs[idx] = Some(child);
    Ok(pid)
}

/// Tear the current process down: files, regions, then the address
/// space. Shared region frames survive in their remaining holders.
pub fn exit(p: &mut Proc) -> ! {
    for ent_opt in p.ofile.iter_mut() {
        if let Some(ent) = ent_opt.take() {
            file::file_table().close(ent);
        }
    }

    wmap::exit_regions(p);

    // Leave the dying address space before freeing it.
    vm::switch_kvm();
    park_cpu();
    if let Some(dir) = p.pgdir.take() {
        vm::free_vm(dir);
    }
    p.state = ProcState::Zombie;
    log::info!("pid {} {}: exit", p.pid, p.name_str());

    // The scheduler owns the CPU from here; without one in this crate,
    // the CPU parks.
    loop {
        x86::hlt();
    }
}

/// Reap one zombie child, releasing its table slot. Returns its pid.
pub fn wait(p: &Proc) -> Option<u32> {
    proc_table().release_zombie_child(p.pid)
}

/// Mark a process killed; it exits on its next return to user mode.
pub fn kill(pid: u32) -> KernelResult<()> {
    let mut table = proc_table();
    match table.find_mut(pid) {
        Some(p) => {
            p.killed = true;
            Ok(())
        }
        None => Err(KernelError::BadArgument),
    }
}

/// Grow or shrink the heap by `n` bytes. Returns the old size, which is
/// what `sbrk` hands back to user space.
pub fn grow_proc(p: &mut Proc, n: i32) -> KernelResult<u32> {
    let sz = p.sz;
    let newsz = if n >= 0 {
        let target = sz.checked_add(n as u32).ok_or(KernelError::BadArgument)?;
        let grown = p.pgdir_mut().alloc_uvm(sz, target);
        if grown == 0 && target != 0 {
            return Err(KernelError::OutOfMemory);
        }
        grown
    } else {
        let dec = n.unsigned_abs();
        if dec > sz {
            return Err(KernelError::BadArgument);
        }
        p.pgdir_mut().dealloc_uvm(sz, sz - dec)
    };
    p.sz = newsz;
    vm::switch_uvm(p);
    Ok(sz)
}

// --------------------------------------------------------------
// exec.
// --------------------------------------------------------------

/// Replace the process image with the ELF executable behind `ip`. Builds
/// the new address space completely before the old one is touched; on
/// failure the old image keeps running. Mapping regions do not survive an
/// exec.
pub fn exec(p: &mut Proc, ip: &Arc<RwLock<Inode>>, argv: &[&[u8]]) -> KernelResult<()> {
    if argv.len() > MAX_ARG {
        return Err(KernelError::BadArgument);
    }

    let new_dir = vm::setup_kvm().ok_or(KernelError::OutOfMemory)?;
    let pgdir = unsafe { &mut *new_dir.as_ptr() };

    let mut inode = fs::ilock(ip);
    let loaded = load_image(pgdir, &mut inode, argv);
    fs::iunlock(inode);

    let (sz, entry, sp) = match loaded {
        Ok(v) => v,
        Err(e) => {
            vm::free_vm(new_dir);
            return Err(e);
        }
    };

    // Commit. The old regions and address space go away with the image.
    wmap::exit_regions(p);
    let old = p.pgdir.replace(new_dir);
    p.sz = sz;
    p.tf = Trapframe::new_for_user();
    p.tf.set_entry_point(VirtAddr(entry));
    p.tf.esp = sp as usize;
    if let Some(name) = argv.first() {
        p.set_name(name);
    }
    vm::switch_uvm(p);
    if let Some(old) = old {
        vm::free_vm(old);
    }
    Ok(())
}

/// Load the program segments and build the user stack in `pgdir`.
/// Returns (image size, entry point, initial stack pointer).
fn load_image(
    pgdir: &mut PageDirectory,
    inode: &mut Inode,
    argv: &[&[u8]],
) -> KernelResult<(u32, u32, u32)> {
    let mut ebuf = [0u8; ELF_SIZE];
    if fs::readi(inode, ebuf.as_mut_ptr(), 0, ELF_SIZE as u32) != Some(ELF_SIZE as u32) {
        return Err(KernelError::Io);
    }
    let elf = unsafe { &*(ebuf.as_ptr() as *const Elf) };
    if !elf.is_valid() {
        return Err(KernelError::BadArgument);
    }
    let (e_entry, e_phoff, e_phnum) = (elf.e_entry, elf.e_phoff, elf.e_phnum);

    let mut sz = 0u32;
    for i in 0..e_phnum {
        let off = e_phoff + (i as u32) * PROGHDR_SIZE as u32;
        let mut pbuf = [0u8; PROGHDR_SIZE];
        if fs::readi(inode, pbuf.as_mut_ptr(), off, PROGHDR_SIZE as u32)
            != Some(PROGHDR_SIZE as u32)
        {
            return Err(KernelError::Io);
        }
        let ph = unsafe { &*(pbuf.as_ptr() as *const Proghdr) };
        let (p_type, p_vaddr, p_memsz, p_filesz, p_offset) =
            (ph.p_type, ph.p_vaddr, ph.p_memsz, ph.p_filesz, ph.p_offset);
        if p_type != PT_LOAD {
            continue;
        }
        if p_memsz < p_filesz {
            return Err(KernelError::BadArgument);
        }
        let seg_end = p_vaddr.checked_add(p_memsz).ok_or(KernelError::BadArgument)?;
        if p_vaddr % PGSIZE != 0 {
            return Err(KernelError::BadArgument);
        }
        sz = pgdir.alloc_uvm(sz, seg_end);
        if sz == 0 {
            return Err(KernelError::OutOfMemory);
        }
        pgdir.load_uvm(VirtAddr(p_vaddr), inode, p_offset, p_filesz)?;
    }

    // Two pages below the stack top: an inaccessible guard, then the
    // stack itself.
    sz = page_round_up(sz);
    let stack_top = sz
        .checked_add(2 * PGSIZE)
        .ok_or(KernelError::BadArgument)?;
    sz = pgdir.alloc_uvm(sz, stack_top);
    if sz == 0 {
        return Err(KernelError::OutOfMemory);
    }
    pgdir.clear_pte_u(VirtAddr(sz - 2 * PGSIZE));

    // Argument strings, then the argv array with a fake return address.
    let mut sp = sz;
    let mut ustack = [0u32; 3 + MAX_ARG + 1];
    for (i, arg) in argv.iter().enumerate() {
        sp = (sp - (arg.len() as u32 + 1)) & !3;
        pgdir.copy_out(sp, arg)?;
        pgdir.copy_out(sp + arg.len() as u32, &[0])?;
        ustack[3 + i] = sp;
    }
    ustack[3 + argv.len()] = 0;
    ustack[0] = 0xffff_ffff; // fake return PC
    ustack[1] = argv.len() as u32;

    let words = 3 + argv.len() + 1;
    sp -= (words * 4) as u32;
    ustack[2] = sp + 3 * 4; // the argv array itself
    let bytes =
        unsafe { core::slice::from_raw_parts(ustack.as_ptr() as *const u8, words * 4) };
    pgdir.copy_out(sp, bytes)?;

    Ok((sz, e_entry, sp))
}
