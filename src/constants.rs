//! Memory layout and capacity constants. The layout follows the classic
//! 32-bit split: user addresses below `KERN_BASE`, the kernel window above.

pub const PGSIZE: u32 = 4096;
pub(crate) const PGSHIFT: u32 = 12;
pub(crate) const NPDENTRIES: usize = 1024;
pub(crate) const NPTENTRIES: usize = 1024;

// Kernel window. Every address space maps [KERN_BASE, 4GiB) the same way.
pub(crate) const KERN_BASE: u32 = 0x8000_0000;
pub(crate) const EXT_MEM: u32 = 0x10_0000; // start of extended memory
pub(crate) const KERN_LINK: u32 = KERN_BASE + EXT_MEM; // kernel link address
pub(crate) const PHYS_TOP: u32 = 0x0e00_0000; // top of usable physical memory
pub(crate) const DEV_SPACE: u32 = 0xfe00_0000; // devices are mapped direct at high addresses

// Window where wmap places user mapping regions.
pub const WMAP_BASE: u32 = 0x6000_0000;
pub const WMAP_TOP: u32 = 0x8000_0000;

pub(crate) const NPROC: usize = 64; // processes
pub(crate) const MAX_ARG: usize = 32; // exec arguments
pub(crate) const NCPU: usize = 8; // CPUs
pub(crate) const NOFILE: usize = 16; // open files per process
pub(crate) const NFILE: usize = 100; // open files per system
pub const NWMAP: usize = 16; // wmap regions per process
pub(crate) const NREGION: usize = 128; // wmap region records, system wide
pub const MAX_UPAGE_INFO: usize = 32; // getpgdirinfo entry cap
pub(crate) const NINODE: usize = 50; // in-memory inode cache entries

// File system.
pub(crate) const BLK_SIZE: usize = 512;
pub(crate) const FS_SIZE: u32 = 1024; // blocks in the disk image
pub(crate) const NDIRECT: usize = 12;
pub(crate) const NINDIRECT: usize = BLK_SIZE / 4;
pub(crate) const LOG_SIZE: usize = 30; // journal blocks
pub(crate) const MAX_OP_BLOCKS: usize = 10; // max blocks one FS op may write
pub const ROOT_DEV: u32 = 1;

// Segment selectors set up by the (out-of-crate) boot path.
pub(crate) const SEG_UCODE: u16 = 3;
pub(crate) const SEG_UDATA: u16 = 4;
pub(crate) const DPL_USER: u16 = 3;

pub(crate) const FL_IF: u32 = 0x200; // eflags: interrupts enabled
