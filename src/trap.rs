//! Trap frames and the trap dispatcher. The entry stubs that push the
//! frame and the IDT install belong to the boot path; this module is what
//! they land in.

use crate::constants::*;
use crate::mmu::VirtAddr;
use crate::{proc, syscall, wmap, x86};
use spin::Mutex;

#[allow(dead_code)]
pub(crate) mod consts {
    // Processor-defined trap numbers.
    pub(crate) const T_DIVIDE: u32 = 0; // divide error
    pub(crate) const T_BRKPT: u32 = 3; // breakpoint
    pub(crate) const T_ILLOP: u32 = 6; // illegal opcode
    pub(crate) const T_GPFLT: u32 = 13; // general protection fault
    pub(crate) const T_PGFLT: u32 = 14; // page fault

    // Chosen not to overlap processor exceptions or hardware IRQs.
    pub(crate) const T_SYSCALL: u32 = 48;

    // Hardware IRQs arrive as IRQ_OFFSET + n.
    pub(crate) const IRQ_OFFSET: u32 = 32;
    pub(crate) const IRQ_TIMER: u32 = 0;

    // Page-fault error code bits.
    pub(crate) const FEC_P: u32 = 0x1; // fault on a present page
}

use consts::*;

/// Registers as pushed by `pusha`.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(C, packed)]
pub struct PushRegs {
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub oesp: u32, // useless
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
}

impl PushRegs {
    fn new() -> PushRegs {
        PushRegs {
            edi: 0,
            esi: 0,
            ebp: 0,
            oesp: 0,
            ebx: 0,
            edx: 0,
            ecx: 0,
            eax: 0,
        }
    }
}

/// The frame the trap entry stub builds on the kernel stack.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(C, packed)]
pub struct Trapframe {
    pub regs: PushRegs,
    pub es: u16,
    pub padding1: u16,
    pub ds: u16,
    pub padding2: u16,
    pub trapno: u32,
    // Defined by the hardware from here down.
    pub err: u32,
    pub eip: usize,
    pub cs: u16,
    pub padding3: u16,
    pub eflags: u32,
    // Only present when crossing rings, such as user to kernel.
    pub esp: usize,
    pub ss: u16,
    pub padding4: u16,
}

impl Trapframe {
    pub(crate) fn new() -> Trapframe {
        Trapframe {
            regs: PushRegs::new(),
            es: 0,
            padding1: 0,
            ds: 0,
            padding2: 0,
            trapno: 0,
            err: 0,
            eip: 0,
            cs: 0,
            padding3: 0,
            eflags: 0,
            esp: 0,
            ss: 0,
            padding4: 0,
        }
    }

    /// Segment selectors for ring 3, interrupts enabled. The entry point
    /// and stack pointer are set by the caller.
    pub(crate) fn new_for_user() -> Trapframe {
        let mut tf = Trapframe::new();
        tf.ds = (SEG_UDATA << 3) | DPL_USER;
        tf.es = (SEG_UDATA << 3) | DPL_USER;
        tf.ss = (SEG_UDATA << 3) | DPL_USER;
        tf.cs = (SEG_UCODE << 3) | DPL_USER;
        tf.eflags |= FL_IF;
        tf
    }

    pub(crate) fn set_entry_point(&mut self, va: VirtAddr) {
        self.eip = va.0 as usize;
    }

    fn from_user_mode(&self) -> bool {
        self.cs & 3 == DPL_USER
    }
}

static TICKS: Mutex<u32> = Mutex::new(0);

#[allow(dead_code)]
pub(crate) fn ticks() -> u32 {
    *TICKS.lock()
}

/// Entered from the trap stub with the frame it pushed.
#[no_mangle]
pub extern "C" fn trap(tf: *mut Trapframe) {
    let tf = unsafe { tf.as_mut().expect("trap: null frame") };
    x86::cld();

    if tf.trapno == T_SYSCALL {
        let p = proc::myproc().expect("trap: syscall with no process");
        if p.killed {
            proc::exit(p);
        }
        p.tf = *tf;
        syscall::syscall(p);
        *tf = p.tf;
        if p.killed {
            proc::exit(p);
        }
        return;
    }

    let trapno = tf.trapno;
    match trapno {
        T_PGFLT => page_fault(tf),
        n if n == IRQ_OFFSET + IRQ_TIMER => {
            if proc::cpu_id() == 0 {
                *TICKS.lock() += 1;
            }
            // The interrupt controller acknowledgment happens in the
            // boot path's IRQ glue.
        }
        _ => {
            let Some(p) = proc::myproc() else {
                panic!(
                    "unexpected trap {} from cpu {} eip 0x{:x} (cr2=0x{:x})",
                    { tf.trapno },
                    proc::cpu_id(),
                    { tf.eip },
                    x86::rcr2()
                );
            };
            if !tf.from_user_mode() {
                panic!(
                    "unexpected trap {} from cpu {} eip 0x{:x} (cr2=0x{:x})",
                    { tf.trapno },
                    proc::cpu_id(),
                    { tf.eip },
                    x86::rcr2()
                );
            }
            // User code misbehaved.
            kill_report(p, tf);
            p.killed = true;
        }
    }

    // A killed process leaves once it would re-enter user mode.
    if let Some(p) = proc::myproc() {
        if p.killed && tf.from_user_mode() {
            proc::exit(p);
        }
    }
}

/// A fault on a non-present user page inside a registered region is
/// demand paging; everything else kills the faulting process.
fn page_fault(tf: &mut Trapframe) {
    let cr2 = x86::rcr2();

    let Some(p) = proc::myproc() else {
        panic!(
            "page fault in kernel: eip 0x{:x} addr 0x{:x} err {}",
            { tf.eip },
            cr2,
            { tf.err }
        );
    };
    if !tf.from_user_mode() {
        panic!(
            "page fault in kernel: eip 0x{:x} addr 0x{:x} err {}",
            { tf.eip },
            cr2,
            { tf.err }
        );
    }

    if tf.err & FEC_P == 0 && wmap::handle_page_fault(p, cr2) {
        return;
    }

    kill_report(p, tf);
    p.killed = true;
}

fn kill_report(p: &proc::Proc, tf: &Trapframe) {
    log::warn!(
        "pid {} {}: trap {} err {} on cpu {} eip 0x{:x} addr 0x{:x}--kill proc",
        p.pid,
        p.name_str(),
        { tf.trapno },
        { tf.err },
        proc::cpu_id(),
        { tf.eip },
        x86::rcr2()
    );
}
