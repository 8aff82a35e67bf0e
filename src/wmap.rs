//! The `wmap` memory-mapping layer: a per-process table of mapping regions
//! in the `[WMAP_BASE, WMAP_TOP)` window, backed by anonymous or
//! file-backed pages that are installed on demand by the page-fault
//! handler.
//!
//! Region records live in a process-agnostic pool so fork can share a
//! `SHARED` region between parent and child; the record's reference count
//! decides when the backing frames may be freed.

use crate::constants::*;
use crate::error::{KernelError, KernelResult};
use crate::file::FileDescriptor;
use crate::fs;
use crate::journal;
use crate::kalloc;
use crate::mmu::{page_round_down, page_round_up, PageDirectory, PteFlags, VirtAddr};
use crate::proc::Proc;
use crate::util;
use alloc::sync::Arc;
use bitflags::bitflags;
use core::cmp;
use spin::{Mutex, MutexGuard};

bitflags! {
    /// Flags accepted by `wmap`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        const SHARED = 0x01;
        const PRIVATE = 0x02;
        const ANONYMOUS = 0x04;
        const FIXED = 0x08;
    }
}

/// `wremap` may relocate the mapping when in-place growth is impossible.
pub const MREMAP_MAYMOVE: u32 = 0x01;

/// One mapping region. `length` is kept in bytes as requested; page math
/// rounds it up.
#[derive(Debug, Clone)]
struct Region {
    addr: u32,
    length: u32,
    flags: MapFlags,
    fd: Option<FileDescriptor>,
    ref_count: u32,
}

impl Region {
    fn end(&self) -> u32 {
        self.addr + self.length
    }

    fn contains(&self, addr: u32) -> bool {
        addr >= self.addr && addr < self.end()
    }

    fn is_file_backed(&self) -> bool {
        !self.flags.contains(MapFlags::ANONYMOUS)
    }
}

/// Index of a region record in the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RegionId(usize);

/// System-wide pool of region records.
struct RegionPool {
    records: [Option<Region>; NREGION],
}

const NO_REGION: Option<Region> = None;

impl RegionPool {
    const fn new() -> RegionPool {
        RegionPool {
            records: [NO_REGION; NREGION],
        }
    }

    fn alloc(&mut self, region: Region) -> Option<RegionId> {
        let i = self.records.iter().position(|r| r.is_none())?;
        self.records[i] = Some(region);
        Some(RegionId(i))
    }

    fn get(&self, id: RegionId) -> &Region {
        self.records[id.0].as_ref().expect("wmap: stale region id")
    }

    fn get_mut(&mut self, id: RegionId) -> &mut Region {
        self.records[id.0].as_mut().expect("wmap: stale region id")
    }

    fn ref_inc(&mut self, id: RegionId) {
        self.get_mut(id).ref_count += 1;
    }

    /// Drop one reference; the record is freed when the count hits zero.
    /// Returns the count before the decrement.
    fn unref(&mut self, id: RegionId) -> u32 {
        let refs = self.get(id).ref_count;
        assert!(refs >= 1, "wmap: region over-released");
        if refs == 1 {
            self.records[id.0] = None;
        } else {
            self.get_mut(id).ref_count = refs - 1;
        }
        refs
    }
}

static POOL: Mutex<RegionPool> = Mutex::new(RegionPool::new());

fn pool() -> MutexGuard<'static, RegionPool> {
    POOL.lock()
}

/// `[a, a+la)` and `[b, b+lb)` intersect.
fn ranges_overlap(a: u32, la: u32, b: u32, lb: u32) -> bool {
    a < b + lb && b < a + la
}

/// A process's fixed-capacity set of region slots.
pub struct ProcRegions {
    slots: [Option<RegionId>; NWMAP],
}

impl ProcRegions {
    pub(crate) const fn new() -> ProcRegions {
        ProcRegions {
            slots: [None; NWMAP],
        }
    }

    fn free_slot(&self) -> Option<usize> {
        self.slots.iter().position(|s| s.is_none())
    }

    fn find_base(&self, pool: &RegionPool, addr: u32) -> Option<(usize, RegionId)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.map(|id| (i, id)))
            .find(|&(_, id)| pool.get(id).addr == addr)
    }

    fn find_containing(&self, pool: &RegionPool, addr: u32) -> Option<RegionId> {
        self.slots
            .iter()
            .flatten()
            .copied()
            .find(|&id| pool.get(id).contains(addr))
    }

    /// Does `[addr, addr+length)` intersect any region of this process,
    /// except the one in `exclude`?
    fn overlaps_any(
        &self,
        pool: &RegionPool,
        addr: u32,
        length: u32,
        exclude: Option<RegionId>,
    ) -> bool {
        self.slots.iter().flatten().copied().any(|id| {
            if Some(id) == exclude {
                return false;
            }
            let r = pool.get(id);
            ranges_overlap(addr, length, r.addr, r.length)
        })
    }
}

/// First base in the mapping window where `length` bytes fit without
/// touching an existing region.
fn find_space(pool: &RegionPool, regions: &ProcRegions, length: u32) -> Option<u32> {
    let mut addr = WMAP_BASE;
    while addr + length <= WMAP_TOP {
        if !regions.overlaps_any(pool, addr, length, None) {
            return Some(addr);
        }
        addr += PGSIZE;
    }
    None
}

// --------------------------------------------------------------
// System calls.
// --------------------------------------------------------------

/// Reserve a mapping region. No pages are installed here; population is
/// driven by page faults.
pub fn wmap(p: &mut Proc, addr: u32, length: i32, flags: u32, fd: i32) -> KernelResult<u32> {
    let flags = MapFlags::from_bits_truncate(flags);
    if !flags.intersects(MapFlags::ANONYMOUS | MapFlags::SHARED | MapFlags::PRIVATE) {
        return Err(KernelError::BadArgument);
    }
    if length <= 0 {
        return Err(KernelError::BadArgument);
    }
    let length = length as u32;

    let fd = if flags.contains(MapFlags::ANONYMOUS) {
        None
    } else {
        if fd < 0 || fd >= NOFILE as i32 {
            return Err(KernelError::BadFileDescriptor);
        }
        let ent = p.ofile[fd as usize]
            .as_ref()
            .ok_or(KernelError::BadFileDescriptor)?;
        if !ent.file.read().is_readable() {
            return Err(KernelError::BadFileDescriptor);
        }
        Some(FileDescriptor(fd as u32))
    };

    let mut pool = pool();
    let base = if flags.contains(MapFlags::FIXED) {
        if addr % PGSIZE != 0 || addr < WMAP_BASE || addr >= WMAP_TOP || addr + length > WMAP_TOP {
            return Err(KernelError::BadArgument);
        }
        if p.regions.overlaps_any(&pool, addr, length, None) {
            return Err(KernelError::NoSpace);
        }
        addr
    } else {
        find_space(&pool, &p.regions, length).ok_or(KernelError::NoSpace)?
    };

    let slot = p.regions.free_slot().ok_or(KernelError::NoSpace)?;
    let id = pool
        .alloc(Region {
            addr: base,
            length,
            flags,
            fd,
            ref_count: 1,
        })
        .ok_or(KernelError::NoSpace)?;
    p.regions.slots[slot] = Some(id);

    Ok(base)
}

/// Release the region based at `addr`, writing shared file mappings back
/// first. Frames are freed only when this process holds the last
/// reference to the region.
pub fn wunmap(p: &mut Proc, addr: u32) -> KernelResult<()> {
    if addr % PGSIZE != 0 {
        return Err(KernelError::BadArgument);
    }

    let (slot, id, region) = {
        let pool = pool();
        let (slot, id) = p
            .regions
            .find_base(&pool, addr)
            .ok_or(KernelError::BadArgument)?;
        (slot, id, pool.get(id).clone())
    };

    // Write-back may sleep in the inode layer, so the pool lock is not
    // held across it. A failure leaves the mapping fully intact.
    if region.is_file_backed() && region.flags.contains(MapFlags::SHARED) {
        write_back(p, &region)?;
    }

    let mut pool = pool();
    let last = pool.get(id).ref_count == 1;
    release_region_pages(p.pgdir_mut(), &region, last);
    pool.unref(id);
    p.regions.slots[slot] = None;
    Ok(())
}

/// Grow, shrink, or move the region based at `oldaddr`. On any failure the
/// old mapping is left intact; the move path builds the new range before
/// destroying the old one.
pub fn wremap(
    p: &mut Proc,
    oldaddr: u32,
    oldsize: u32,
    newsize: u32,
    flags: u32,
) -> KernelResult<u32> {
    if oldaddr % PGSIZE != 0 || oldaddr < WMAP_BASE || oldaddr >= WMAP_TOP {
        return Err(KernelError::BadArgument);
    }
    if oldsize == 0 || oldsize % PGSIZE != 0 || newsize == 0 || newsize % PGSIZE != 0 {
        return Err(KernelError::BadArgument);
    }
    if flags != 0 && flags != MREMAP_MAYMOVE {
        return Err(KernelError::BadArgument);
    }

    let (id, region) = {
        let pool = pool();
        let (_, id) = p
            .regions
            .find_base(&pool, oldaddr)
            .ok_or(KernelError::BadArgument)?;
        (id, pool.get(id).clone())
    };
    if oldsize != page_round_up(region.length) {
        return Err(KernelError::BadArgument);
    }

    if newsize == oldsize {
        return Ok(oldaddr);
    }

    if newsize < oldsize {
        let mut pool = pool();
        let last = pool.get(id).ref_count == 1;
        let tail = Region {
            addr: oldaddr + newsize,
            length: oldsize - newsize,
            ..region
        };
        release_region_pages(p.pgdir_mut(), &tail, last);
        pool.get_mut(id).length = newsize;
        return Ok(oldaddr);
    }

    // Growth. Try in place first.
    let ext_start = oldaddr + oldsize;
    let ext_len = newsize - oldsize;
    let in_place = {
        let pool = pool();
        oldaddr + newsize <= WMAP_TOP
            && is_range_unmapped(p.pgdir_mut(), ext_start, ext_len)
            && !p.regions.overlaps_any(&pool, ext_start, ext_len, Some(id))
    };
    if in_place {
        install_zeroed_pages(p.pgdir_mut(), ext_start, ext_len)?;
        pool().get_mut(id).length = newsize;
        return Ok(oldaddr);
    }

    if flags != MREMAP_MAYMOVE {
        return Err(KernelError::NoSpace);
    }

    // Move: find a fresh base clear of every region and every installed
    // page, build the new range, copy, then drop the old range.
    let newaddr = {
        let pool = pool();
        find_move_space(p.pgdir_mut(), &pool, &p.regions, newsize).ok_or(KernelError::NoSpace)?
    };
    install_zeroed_pages(p.pgdir_mut(), newaddr, newsize)?;

    let pgdir = p.pgdir_mut();
    let mut a = oldaddr;
    while a < oldaddr + oldsize {
        if let Some(src_ka) = pgdir.uva_to_ka(VirtAddr(a)) {
            let dst_ka = pgdir
                .uva_to_ka(VirtAddr(newaddr + (a - oldaddr)))
                .expect("wremap: fresh page vanished");
            unsafe {
                util::memmove(dst_ka, src_ka, PGSIZE as usize);
            }
        }
        a += PGSIZE;
    }

    let mut pool = pool();
    let last = pool.get(id).ref_count == 1;
    release_region_pages(pgdir, &region, last);
    let rec = pool.get_mut(id);
    rec.addr = newaddr;
    rec.length = newsize;
    Ok(newaddr)
}

/// Report `(base, length, installed pages)` for every occupied slot.
pub fn getwmapinfo(p: &mut Proc) -> WmapInfo {
    let pool = pool();
    let pgdir = p.pgdir_mut();
    let mut info = WmapInfo::default();
    let mut count = 0;
    for slot in p.regions.slots.iter().flatten() {
        let r = pool.get(*slot);
        info.addr[count] = r.addr;
        info.length[count] = r.length;
        info.n_loaded_pages[count] = count_pages(pgdir, r.addr, r.length);
        count += 1;
    }
    info.total_mmaps = count as i32;
    info
}

/// Report `(va, pa)` for the user-accessible pages of the current
/// directory, up to the cap.
pub fn getpgdirinfo(p: &mut Proc) -> PgdirInfo {
    let mut info = PgdirInfo::default();
    for (va, pa) in p.pgdir_mut().user_pages() {
        info.va[info.n_upages as usize] = va;
        info.pa[info.n_upages as usize] = pa;
        info.n_upages += 1;
    }
    info
}

#[repr(C)]
pub struct WmapInfo {
    pub total_mmaps: i32,
    pub addr: [u32; NWMAP],
    pub length: [u32; NWMAP],
    pub n_loaded_pages: [u32; NWMAP],
}

impl Default for WmapInfo {
    fn default() -> WmapInfo {
        WmapInfo {
            total_mmaps: 0,
            addr: [0; NWMAP],
            length: [0; NWMAP],
            n_loaded_pages: [0; NWMAP],
        }
    }
}

#[repr(C)]
pub struct PgdirInfo {
    pub n_upages: u32,
    pub va: [u32; MAX_UPAGE_INFO],
    pub pa: [u32; MAX_UPAGE_INFO],
}

impl Default for PgdirInfo {
    fn default() -> PgdirInfo {
        PgdirInfo {
            n_upages: 0,
            va: [0; MAX_UPAGE_INFO],
            pa: [0; MAX_UPAGE_INFO],
        }
    }
}

// --------------------------------------------------------------
// Demand paging.
// --------------------------------------------------------------

/// Handle a user page fault at `fault_addr`. Returns `false` when the
/// address lies in no region, leaving the kill decision to the trap
/// handler. Failures inside a region kill the process here; exactly one
/// page is installed per fault.
pub fn handle_page_fault(p: &mut Proc, fault_addr: u32) -> bool {
    let region = {
        let pool = pool();
        match p.regions.find_containing(&pool, fault_addr) {
            Some(id) => pool.get(id).clone(),
            None => return false,
        }
    };

    let page_va = page_round_down(fault_addr);
    let mem = match kalloc::alloc_zeroed() {
        Some(mem) => mem,
        None => {
            log::warn!("wmap: out of memory");
            p.kill();
            return true;
        }
    };

    if region.is_file_backed() {
        if let Err(why) = fault_in_file(p, &region, page_va, mem) {
            log::warn!("wmap: {}", why);
            unsafe { kalloc::free(mem) };
            p.kill();
            return true;
        }
    }

    if p.pgdir_mut()
        .map_pages(VirtAddr(page_va), PGSIZE, mem.to_pa(), PteFlags::W | PteFlags::U)
        .is_err()
    {
        log::warn!("wmap: out of memory (2)");
        unsafe { kalloc::free(mem) };
        p.kill();
        return true;
    }
    true
}

/// Read the faulting page's worth of file content into the fresh frame.
fn fault_in_file(p: &Proc, region: &Region, page_va: u32, mem: VirtAddr) -> Result<(), &'static str> {
    let fd = region.fd.ok_or("invalid file descriptor")?;
    let ent = p.ofile[fd.0 as usize]
        .as_ref()
        .ok_or("invalid file descriptor")?;
    let file = Arc::clone(&ent.file);
    let f = file.read();
    if !f.is_readable() {
        return Err("invalid file descriptor");
    }
    let ip = Arc::clone(f.inode());
    drop(f);

    let offset = page_va - region.addr;
    let mut inode = fs::ilock(&ip);
    if offset >= inode.size() {
        fs::iunlock(inode);
        return Err("invalid offset");
    }
    let n = cmp::min(PGSIZE, inode.size() - offset);
    let read = fs::readi(&mut inode, mem.as_mut_ptr(), offset, n);
    fs::iunlock(inode);
    if read != Some(n) {
        return Err("failed to read data from file");
    }
    Ok(())
}

// --------------------------------------------------------------
// Fork and exit integration.
// --------------------------------------------------------------

/// Duplicate the parent's region slots into the child and populate the
/// child's page table: pages of `SHARED` regions alias the parent's
/// frames (the record is shared and its count bumped), everything else is
/// copied onto fresh frames under a fresh record.
///
/// On failure the caller unwinds with [`exit_regions`]; slots are filled
/// before their pages so the unwind sees them.
pub(crate) fn fork_regions(parent: &mut Proc, child: &mut Proc) -> KernelResult<()> {
    let parent_dir = parent.pgdir_mut();
    let child_dir = child.pgdir_mut();

    for slot in 0..NWMAP {
        let id = match parent.regions.slots[slot] {
            Some(id) => id,
            None => continue,
        };
        let (child_id, region) = {
            let mut pool = pool();
            let region = pool.get(id).clone();
            let child_id = if region.flags.contains(MapFlags::SHARED) {
                pool.ref_inc(id);
                id
            } else {
                pool.alloc(Region {
                    ref_count: 1,
                    ..region.clone()
                })
                .ok_or(KernelError::NoSpace)?
            };
            (child_id, region)
        };
        child.regions.slots[slot] = Some(child_id);

        let shared = region.flags.contains(MapFlags::SHARED);
        let mut a = region.addr;
        while a < region.end() {
            let present = parent_dir
                .walk(VirtAddr(a), false)
                .filter(|pte| pte.is_present())
                .map(|pte| (pte.addr(), pte.flags()));
            if let Some((pa, flags)) = present {
                if shared {
                    child_dir
                        .map_pages(VirtAddr(a), PGSIZE, pa, flags)
                        .map_err(|_| KernelError::OutOfMemory)?;
                } else {
                    let mem = kalloc::alloc().ok_or(KernelError::OutOfMemory)?;
                    unsafe {
                        util::memmove(mem, pa.to_va(), PGSIZE as usize);
                    }
                    if child_dir
                        .map_pages(VirtAddr(a), PGSIZE, mem.to_pa(), flags)
                        .is_err()
                    {
                        unsafe { kalloc::free(mem) };
                        return Err(KernelError::OutOfMemory);
                    }
                }
            }
            a += PGSIZE;
        }
    }
    Ok(())
}

/// Release every region slot of an exiting (or failed-fork) process.
/// No write-back happens here; only `wunmap` persists shared file
/// mappings.
pub(crate) fn exit_regions(p: &mut Proc) {
    let pgdir = p.pgdir_mut();
    for slot in 0..NWMAP {
        let id = match p.regions.slots[slot].take() {
            Some(id) => id,
            None => continue,
        };
        let mut pool = pool();
        let region = pool.get(id).clone();
        let last = region.ref_count == 1;
        release_region_pages(pgdir, &region, last);
        pool.unref(id);
    }
}

// --------------------------------------------------------------
// Internals.
// --------------------------------------------------------------

/// Clear every installed page of `region`, freeing the frames only when
/// this was the last reference. Entries are zeroed before the frame is
/// handed back.
fn release_region_pages(pgdir: &mut PageDirectory, region: &Region, last_ref: bool) {
    let mut a = region.addr;
    while a < region.end() {
        if let Some(pte) = pgdir.walk(VirtAddr(a), false) {
            if pte.is_present() {
                let pa = pte.addr();
                pte.clear();
                if last_ref {
                    unsafe { kalloc::free(pa.to_va()) };
                }
            }
        }
        a += PGSIZE;
    }
}

/// No present leaf anywhere in `[start, start+len)`.
fn is_range_unmapped(pgdir: &mut PageDirectory, start: u32, len: u32) -> bool {
    let mut a = start;
    while a < start + len {
        if let Some(pte) = pgdir.walk(VirtAddr(a), false) {
            if pte.is_present() {
                return false;
            }
        }
        a += PGSIZE;
    }
    true
}

/// Base for a moved mapping: clear of every region (the old range
/// included) and of any installed page.
fn find_move_space(
    pgdir: &mut PageDirectory,
    pool: &RegionPool,
    regions: &ProcRegions,
    length: u32,
) -> Option<u32> {
    let mut addr = WMAP_BASE;
    while addr + length <= WMAP_TOP {
        if !regions.overlaps_any(pool, addr, length, None) && is_range_unmapped(pgdir, addr, length)
        {
            return Some(addr);
        }
        addr += PGSIZE;
    }
    None
}

/// Eagerly install zeroed writable user pages over `[start, start+len)`.
/// On failure every page this call installed is undone.
fn install_zeroed_pages(pgdir: &mut PageDirectory, start: u32, len: u32) -> KernelResult<()> {
    let undo = |pgdir: &mut PageDirectory, upto: u32| {
        let mut b = start;
        while b < upto {
            if let Some(pte) = pgdir.walk(VirtAddr(b), false) {
                if pte.is_present() {
                    let pa = pte.addr();
                    pte.clear();
                    unsafe { kalloc::free(pa.to_va()) };
                }
            }
            b += PGSIZE;
        }
    };

    let mut a = start;
    while a < start + len {
        let mem = match kalloc::alloc_zeroed() {
            Some(mem) => mem,
            None => {
                undo(pgdir, a);
                return Err(KernelError::OutOfMemory);
            }
        };
        if pgdir
            .map_pages(VirtAddr(a), PGSIZE, mem.to_pa(), PteFlags::W | PteFlags::U)
            .is_err()
        {
            unsafe { kalloc::free(mem) };
            undo(pgdir, a);
            return Err(KernelError::OutOfMemory);
        }
        a += PGSIZE;
    }
    Ok(())
}

/// Number of installed pages in `[addr, addr+length)`.
fn count_pages(pgdir: &mut PageDirectory, addr: u32, length: u32) -> u32 {
    let mut count = 0;
    let mut a = addr;
    while a < addr + length {
        if let Some(pte) = pgdir.walk(VirtAddr(a), false) {
            if pte.is_present() {
                count += 1;
            }
        }
        a += PGSIZE;
    }
    count
}

/// Write a shared file mapping's installed pages back to the file, each
/// at its own offset within the region, bounded by `length`. Pages that
/// were never faulted in are skipped: the file already holds their
/// content. The journal caps how much one transaction may touch, so the
/// copy proceeds in brackets of a few blocks.
fn write_back(p: &mut Proc, region: &Region) -> KernelResult<()> {
    let fd = region.fd.ok_or(KernelError::BadFileDescriptor)?;
    let ent = p.ofile[fd.0 as usize]
        .as_ref()
        .ok_or(KernelError::BadFileDescriptor)?;
    let file = Arc::clone(&ent.file);
    let f = file.read();
    if !f.is_writable() {
        return Err(KernelError::BadFileDescriptor);
    }
    let ip = Arc::clone(f.inode());
    drop(f);

    let pgdir = p.pgdir_mut();
    let mut a = region.addr;
    while a < region.end() {
        let page_off = a - region.addr;
        let n = cmp::min(PGSIZE, region.length - page_off);
        let ka = match pgdir.uva_to_ka(VirtAddr(a)) {
            Some(ka) => ka,
            None => {
                a += PGSIZE;
                continue;
            }
        };

        // A present page was faulted in, so its offset lies within the
        // file and writei never has to bridge a hole.
        let mut written = 0;
        while written < n {
            let chunk = cmp::min(WRITE_BACK_CHUNK as u32, n - written);
            journal::begin_op();
            let mut inode = fs::ilock(&ip);
            let r = fs::writei(
                &mut inode,
                (ka + written).as_ptr::<u8>(),
                page_off + written,
                chunk,
            );
            fs::iunlock(inode);
            journal::end_op();
            if r != Some(chunk) {
                return Err(KernelError::Io);
            }
            written += chunk;
        }
        a += PGSIZE;
    }
    Ok(())
}

/// Bytes one write-back transaction may carry; see `File::write` for the
/// same budget.
const WRITE_BACK_CHUNK: usize = ((MAX_OP_BLOCKS - 1 - 1 - 2) / 2) * BLK_SIZE;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::file_table;
    use crate::fs::FileType;

    fn fresh_proc() -> Proc {
        Proc::new(1, b"test")
    }

    #[test]
    fn overlap_test_is_half_open() {
        assert!(ranges_overlap(0x1000, 0x1000, 0x1000, 0x1000));
        assert!(ranges_overlap(0x1000, 0x2000, 0x2000, 0x1000));
        assert!(!ranges_overlap(0x1000, 0x1000, 0x2000, 0x1000));
        assert!(!ranges_overlap(0x2000, 0x1000, 0x1000, 0x1000));
        assert!(ranges_overlap(0x1000, 0x3000, 0x2000, 0x100));
    }

    #[test]
    fn anonymous_map_lands_at_window_base() {
        let _fs = crate::testing::lock_fs();
        let mut p = fresh_proc();

        let a = wmap(&mut p, 0, 8192, (MapFlags::ANONYMOUS | MapFlags::PRIVATE).bits(), -1)
            .unwrap();
        assert_eq!(a, WMAP_BASE);

        // The next region goes right above the first.
        let b = wmap(&mut p, 0, 4096, (MapFlags::ANONYMOUS | MapFlags::PRIVATE).bits(), -1)
            .unwrap();
        assert_eq!(b, WMAP_BASE + 8192);
    }

    #[test]
    fn flag_set_must_name_a_kind() {
        let _fs = crate::testing::lock_fs();
        let mut p = fresh_proc();
        assert_eq!(
            wmap(&mut p, 0, 4096, MapFlags::FIXED.bits(), -1),
            Err(KernelError::BadArgument)
        );
        assert_eq!(
            wmap(&mut p, 0, 4096, 0, -1),
            Err(KernelError::BadArgument)
        );
        assert_eq!(
            wmap(&mut p, 0, 0, MapFlags::ANONYMOUS.bits(), -1),
            Err(KernelError::BadArgument)
        );
        assert_eq!(
            wmap(&mut p, 0, -4096, MapFlags::ANONYMOUS.bits(), -1),
            Err(KernelError::BadArgument)
        );
    }

    #[test]
    fn fixed_mappings_validate_their_address() {
        let _fs = crate::testing::lock_fs();
        let mut p = fresh_proc();
        let anon_fixed = (MapFlags::ANONYMOUS | MapFlags::FIXED).bits();

        // Misaligned, below, above, and overflowing the window.
        assert!(wmap(&mut p, WMAP_BASE + 123, 4096, anon_fixed, -1).is_err());
        assert!(wmap(&mut p, WMAP_BASE - PGSIZE, 4096, anon_fixed, -1).is_err());
        assert!(wmap(&mut p, WMAP_TOP, 4096, anon_fixed, -1).is_err());
        assert!(wmap(&mut p, WMAP_TOP - PGSIZE, 8192, anon_fixed, -1).is_err());

        let a = wmap(&mut p, WMAP_BASE + 0x10000, 8192, anon_fixed, -1).unwrap();
        assert_eq!(a, WMAP_BASE + 0x10000);

        // A second fixed mapping over the same range collides.
        assert_eq!(
            wmap(&mut p, WMAP_BASE + 0x10000, 4096, anon_fixed, -1),
            Err(KernelError::NoSpace)
        );
        // Colliding from below with a multi-page reach also fails.
        assert_eq!(
            wmap(&mut p, WMAP_BASE + 0x10000 - PGSIZE, 8192, anon_fixed, -1),
            Err(KernelError::NoSpace)
        );
    }

    #[test]
    fn placement_skips_fixed_islands() {
        let _fs = crate::testing::lock_fs();
        let mut p = fresh_proc();
        let anon = (MapFlags::ANONYMOUS | MapFlags::PRIVATE).bits();
        let anon_fixed = (MapFlags::ANONYMOUS | MapFlags::FIXED).bits();

        // Occupy the second page of the window.
        wmap(&mut p, WMAP_BASE + PGSIZE, 4096, anon_fixed, -1).unwrap();

        // A one-page request fits below the island.
        let a = wmap(&mut p, 0, 4096, anon, -1).unwrap();
        assert_eq!(a, WMAP_BASE);

        // A two-page request has to jump over it.
        let b = wmap(&mut p, 0, 8192, anon, -1).unwrap();
        assert_eq!(b, WMAP_BASE + 2 * PGSIZE);
    }

    #[test]
    fn region_table_is_capped() {
        let _fs = crate::testing::lock_fs();
        let mut p = fresh_proc();
        let anon = (MapFlags::ANONYMOUS | MapFlags::PRIVATE).bits();

        for _ in 0..NWMAP {
            wmap(&mut p, 0, 4096, anon, -1).unwrap();
        }
        assert_eq!(wmap(&mut p, 0, 4096, anon, -1), Err(KernelError::NoSpace));
    }

    #[test]
    fn file_backed_map_requires_a_readable_fd() {
        let _fs = crate::testing::lock_fs();
        let mut p = fresh_proc();
        let shared = MapFlags::SHARED.bits();

        assert_eq!(
            wmap(&mut p, 0, 4096, shared, -1),
            Err(KernelError::BadFileDescriptor)
        );
        assert_eq!(
            wmap(&mut p, 0, 4096, shared, NOFILE as i32),
            Err(KernelError::BadFileDescriptor)
        );
        assert_eq!(
            wmap(&mut p, 0, 4096, shared, 3),
            Err(KernelError::BadFileDescriptor)
        );

        journal::begin_op();
        let ip = fs::ialloc(ROOT_DEV, FileType::File).unwrap();
        journal::end_op();

        // Write-only open: not mappable.
        let went = file_table().alloc(false, true, &ip).unwrap();
        let wfd = p.fd_alloc(went).ok().unwrap();
        assert_eq!(
            wmap(&mut p, 0, 4096, shared, wfd.0 as i32),
            Err(KernelError::BadFileDescriptor)
        );

        let rent = file_table().alloc(true, true, &ip).unwrap();
        let rfd = p.fd_alloc(rent).ok().unwrap();
        let a = wmap(&mut p, 0, 4096, shared, rfd.0 as i32).unwrap();
        assert_eq!(a, WMAP_BASE);
    }

    #[test]
    fn wremap_validates_shapes_before_touching_anything() {
        let _fs = crate::testing::lock_fs();
        let mut p = fresh_proc();
        let anon = (MapFlags::ANONYMOUS | MapFlags::PRIVATE).bits();
        let a = wmap(&mut p, 0, 8192, anon, -1).unwrap();

        assert!(wremap(&mut p, a + 3, 8192, 4096, 0).is_err());
        assert!(wremap(&mut p, a, 8192, 100, 0).is_err());
        assert!(wremap(&mut p, a, 0, 4096, 0).is_err());
        assert!(wremap(&mut p, a, 8192, 4096, 7).is_err());
        // Not a region base.
        assert!(wremap(&mut p, a + PGSIZE, 4096, 8192, 0).is_err());
        // Stale old size.
        assert!(wremap(&mut p, a, 4096, 8192, 0).is_err());
    }

    #[test]
    fn wunmap_wants_an_exact_base() {
        let _fs = crate::testing::lock_fs();
        let mut p = fresh_proc();
        let anon = (MapFlags::ANONYMOUS | MapFlags::PRIVATE).bits();
        let a = wmap(&mut p, 0, 8192, anon, -1).unwrap();

        assert_eq!(wunmap(&mut p, a + 5), Err(KernelError::BadArgument));
        assert_eq!(wunmap(&mut p, a + PGSIZE), Err(KernelError::BadArgument));
        assert_eq!(
            wunmap(&mut p, WMAP_TOP - PGSIZE),
            Err(KernelError::BadArgument)
        );
    }

    #[test]
    fn pool_refcounts_gate_record_release() {
        let mut pool = RegionPool::new();
        let id = pool
            .alloc(Region {
                addr: WMAP_BASE,
                length: 4096,
                flags: MapFlags::SHARED,
                fd: None,
                ref_count: 1,
            })
            .unwrap();

        pool.ref_inc(id);
        assert_eq!(pool.get(id).ref_count, 2);
        assert_eq!(pool.unref(id), 2);
        // Still alive for the remaining holder.
        assert_eq!(pool.get(id).ref_count, 1);
        assert_eq!(pool.unref(id), 1);
        assert!(pool.records[id.0].is_none());
    }

    #[test]
    fn byte_lengths_place_in_page_strides() {
        let _fs = crate::testing::lock_fs();
        let mut p = fresh_proc();
        let anon = (MapFlags::ANONYMOUS | MapFlags::PRIVATE).bits();

        // 100 bytes reserve [base, base+100); the next fit begins at the
        // following page because placement walks in page strides.
        let a = wmap(&mut p, 0, 100, anon, -1).unwrap();
        let b = wmap(&mut p, 0, 4096, anon, -1).unwrap();
        assert_eq!(a, WMAP_BASE);
        assert_eq!(b, WMAP_BASE + PGSIZE);
    }
}
