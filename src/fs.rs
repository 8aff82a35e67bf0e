//! Inode layer: block allocation, on-disk inodes, and the `readi`/`writei`
//! primitives the VM subsystem reads mappings from and writes them back to.
//!
//! Callers bracket every write path in `journal::begin_op`/`end_op`.

use crate::constants::*;
use crate::journal;
use crate::ramdisk;
use crate::superblock::{self, IPB};
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::cmp;
use spin::{Mutex, Once, RwLock, RwLockWriteGuard};

const MAX_FILE_BLOCKS: u32 = (NDIRECT + NINDIRECT) as u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FileType {
    Empty,
    File,
}

impl FileType {
    fn from_u16(v: u16) -> FileType {
        match v {
            2 => FileType::File,
            _ => FileType::Empty,
        }
    }

    fn to_u16(self) -> u16 {
        match self {
            FileType::Empty => 0,
            FileType::File => 2,
        }
    }
}

/// In-memory copy of an inode.
pub(crate) struct Inode {
    dev: u32,
    inum: u32,
    valid: bool, // already read from disk
    typ: FileType,
    major: u16,
    minor: u16,
    nlink: u16,
    size: u32,
    addrs: [u32; NDIRECT + 1], // direct blocks plus one indirect
}

impl Inode {
    fn empty(dev: u32, inum: u32) -> Inode {
        Inode {
            dev,
            inum,
            valid: false,
            typ: FileType::Empty,
            major: 0,
            minor: 0,
            nlink: 0,
            size: 0,
            addrs: [0; NDIRECT + 1],
        }
    }

    pub(crate) fn size(&self) -> u32 {
        self.size
    }

    /// Disk block holding byte offset `bn * BLK_SIZE` of this inode.
    /// With `alloc` set, missing blocks (and the indirect block) are
    /// allocated; without it, a missing block reads as a hole.
    fn bmap(&mut self, bn: u32, alloc: bool) -> Option<u32> {
        if (bn as usize) < NDIRECT {
            let idx = bn as usize;
            if self.addrs[idx] == 0 {
                if !alloc {
                    return None;
                }
                self.addrs[idx] = balloc()?;
            }
            return Some(self.addrs[idx]);
        }

        let bn = bn - NDIRECT as u32;
        if bn >= NINDIRECT as u32 {
            return None;
        }
        if self.addrs[NDIRECT] == 0 {
            if !alloc {
                return None;
            }
            self.addrs[NDIRECT] = balloc()?;
        }
        let ind_block = self.addrs[NDIRECT];
        let mut buf = [0u8; BLK_SIZE];
        ramdisk::read(ind_block, &mut buf);
        let off = (bn as usize) * 4;
        let mut entry = u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]]);
        if entry == 0 {
            if !alloc {
                return None;
            }
            entry = balloc()?;
            buf[off..off + 4].copy_from_slice(&entry.to_le_bytes());
            ramdisk::write(ind_block, &buf);
            journal::log_write(ind_block);
        }
        Some(entry)
    }
}

// --------------------------------------------------------------
// On-disk inodes. 64 bytes each, IPB per block.
// --------------------------------------------------------------

fn inode_block(inum: u32) -> u32 {
    superblock::get().inode_start + inum / IPB as u32
}

fn inode_offset(inum: u32) -> usize {
    (inum as usize % IPB) * superblock::INODE_SIZE
}

fn load_dinode(inode: &mut Inode) {
    let mut buf = [0u8; BLK_SIZE];
    ramdisk::read(inode_block(inode.inum), &mut buf);
    let d = &buf[inode_offset(inode.inum)..];
    inode.typ = FileType::from_u16(u16::from_le_bytes([d[0], d[1]]));
    inode.major = u16::from_le_bytes([d[2], d[3]]);
    inode.minor = u16::from_le_bytes([d[4], d[5]]);
    inode.nlink = u16::from_le_bytes([d[6], d[7]]);
    inode.size = u32::from_le_bytes([d[8], d[9], d[10], d[11]]);
    for i in 0..(NDIRECT + 1) {
        let o = 12 + i * 4;
        inode.addrs[i] = u32::from_le_bytes([d[o], d[o + 1], d[o + 2], d[o + 3]]);
    }
}

/// Copy a modified in-memory inode to disk. Must run inside a transaction.
pub(crate) fn iupdate(inode: &Inode) {
    let bno = inode_block(inode.inum);
    let mut buf = [0u8; BLK_SIZE];
    ramdisk::read(bno, &mut buf);
    let start = inode_offset(inode.inum);
    let d = &mut buf[start..start + superblock::INODE_SIZE];
    d[0..2].copy_from_slice(&inode.typ.to_u16().to_le_bytes());
    d[2..4].copy_from_slice(&inode.major.to_le_bytes());
    d[4..6].copy_from_slice(&inode.minor.to_le_bytes());
    d[6..8].copy_from_slice(&inode.nlink.to_le_bytes());
    d[8..12].copy_from_slice(&inode.size.to_le_bytes());
    for i in 0..(NDIRECT + 1) {
        let o = 12 + i * 4;
        d[o..o + 4].copy_from_slice(&inode.addrs[i].to_le_bytes());
    }
    ramdisk::write(bno, &buf);
    journal::log_write(bno);
}

// --------------------------------------------------------------
// Block allocator: one bit per block.
// --------------------------------------------------------------

fn bitmap_block(b: u32) -> u32 {
    superblock::get().bmap_start + b / superblock::BPB
}

/// Allocate a zeroed disk block. Must run inside a transaction.
fn balloc() -> Option<u32> {
    let sb = superblock::get();
    let mut buf = [0u8; BLK_SIZE];
    let mut b = 0;
    while b < sb.size {
        let bno = bitmap_block(b);
        ramdisk::read(bno, &mut buf);
        let mut bi = 0;
        while bi < superblock::BPB && b + bi < sb.size {
            let m = 1u8 << ((b + bi) % 8);
            let idx = ((b + bi) / 8 % BLK_SIZE as u32) as usize;
            if buf[idx] & m == 0 {
                buf[idx] |= m;
                ramdisk::write(bno, &buf);
                journal::log_write(bno);
                bzero(b + bi);
                return Some(b + bi);
            }
            bi += 1;
        }
        b += superblock::BPB;
    }
    None
}

fn bzero(blockno: u32) {
    ramdisk::write(blockno, &[0u8; BLK_SIZE]);
    journal::log_write(blockno);
}

#[allow(dead_code)]
fn bfree(b: u32) {
    let bno = bitmap_block(b);
    let mut buf = [0u8; BLK_SIZE];
    ramdisk::read(bno, &mut buf);
    let m = 1u8 << (b % 8);
    let idx = (b / 8 % BLK_SIZE as u32) as usize;
    if buf[idx] & m == 0 {
        panic!("bfree: freeing free block {}", b);
    }
    buf[idx] &= !m;
    ramdisk::write(bno, &buf);
    journal::log_write(bno);
}

// --------------------------------------------------------------
// Inode cache.
// --------------------------------------------------------------

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct InodeCacheKey {
    dev: u32,
    inum: u32,
}

struct InodeCache {
    inodes: BTreeMap<InodeCacheKey, Arc<RwLock<Inode>>>,
}

static ICACHE: Mutex<InodeCache> = Mutex::new(InodeCache {
    inodes: BTreeMap::new(),
});

fn iget(dev: u32, inum: u32) -> Arc<RwLock<Inode>> {
    let mut cache = ICACHE.lock();
    let key = InodeCacheKey { dev, inum };
    if let Some(ip) = cache.inodes.get(&key) {
        return Arc::clone(ip);
    }
    if cache.inodes.len() >= NINODE {
        panic!("iget: no inodes");
    }
    let ip = Arc::new(RwLock::new(Inode::empty(dev, inum)));
    cache.inodes.insert(key, Arc::clone(&ip));
    ip
}

/// Allocate a fresh on-disk inode of the given type. Must run inside a
/// transaction.
pub(crate) fn ialloc(dev: u32, typ: FileType) -> Option<Arc<RwLock<Inode>>> {
    let sb = superblock::get();
    for inum in 1..sb.ninodes {
        let mut buf = [0u8; BLK_SIZE];
        ramdisk::read(inode_block(inum), &mut buf);
        let off = inode_offset(inum);
        let on_disk_typ = u16::from_le_bytes([buf[off], buf[off + 1]]);
        if on_disk_typ == 0 {
            let ip = iget(dev, inum);
            {
                let mut inode = ip.write();
                inode.valid = true;
                inode.typ = typ;
                inode.nlink = 1;
                inode.size = 0;
                inode.addrs = [0; NDIRECT + 1];
                iupdate(&inode);
            }
            return Some(ip);
        }
    }
    None
}

/// Lock the inode, reading it from disk on first touch.
pub(crate) fn ilock(ip: &Arc<RwLock<Inode>>) -> RwLockWriteGuard<'_, Inode> {
    let mut inode = ip.write();
    if !inode.valid {
        load_dinode(&mut inode);
        inode.valid = true;
        if inode.typ == FileType::Empty {
            panic!("ilock: no type for inode {}", inode.inum);
        }
    }
    inode
}

pub(crate) fn iunlock(inode: RwLockWriteGuard<'_, Inode>) {
    drop(inode);
}

/// Drop a reference to an in-memory inode. The cache keeps the entry; this
/// kernel has no unlink, so `nlink` never reaches zero and no on-disk
/// reclamation happens here.
pub(crate) fn iput(ip: Arc<RwLock<Inode>>) {
    drop(ip);
}

// --------------------------------------------------------------
// Inode content.
// --------------------------------------------------------------

/// Read up to `n` bytes from the inode starting at byte `off` into `dst`.
/// Returns the number of bytes read, or `None` for an out-of-range request.
pub(crate) fn readi(inode: &mut Inode, dst: *mut u8, off: u32, n: u32) -> Option<u32> {
    if off > inode.size || off.checked_add(n).is_none() {
        return None;
    }
    let n = cmp::min(n, inode.size - off);

    let mut tot: u32 = 0;
    let mut buf = [0u8; BLK_SIZE];
    while tot < n {
        let cur = off + tot;
        let m = cmp::min(n - tot, BLK_SIZE as u32 - cur % BLK_SIZE as u32);
        let src_off = (cur % BLK_SIZE as u32) as usize;
        match inode.bmap(cur / BLK_SIZE as u32, false) {
            Some(blockno) => {
                ramdisk::read(blockno, &mut buf);
                unsafe {
                    core::ptr::copy_nonoverlapping(
                        buf.as_ptr().add(src_off),
                        dst.add(tot as usize),
                        m as usize,
                    );
                }
            }
            None => unsafe {
                // A hole reads as zeros.
                core::ptr::write_bytes(dst.add(tot as usize), 0, m as usize);
            },
        }
        tot += m;
    }
    Some(n)
}

/// Write `n` bytes from `src` into the inode starting at byte `off`,
/// growing the file as needed. Must run inside a transaction. Returns the
/// number of bytes written, or `None` for an out-of-range request.
pub(crate) fn writei(inode: &mut Inode, src: *const u8, off: u32, n: u32) -> Option<u32> {
    if off > inode.size || off.checked_add(n).is_none() {
        return None;
    }
    if off + n > MAX_FILE_BLOCKS * BLK_SIZE as u32 {
        return None;
    }

    let mut tot: u32 = 0;
    let mut buf = [0u8; BLK_SIZE];
    while tot < n {
        let cur = off + tot;
        let blockno = inode.bmap(cur / BLK_SIZE as u32, true)?;
        let m = cmp::min(n - tot, BLK_SIZE as u32 - cur % BLK_SIZE as u32);
        let dst_off = (cur % BLK_SIZE as u32) as usize;
        ramdisk::read(blockno, &mut buf);
        unsafe {
            core::ptr::copy_nonoverlapping(
                src.add(tot as usize),
                buf.as_mut_ptr().add(dst_off),
                m as usize,
            );
        }
        ramdisk::write(blockno, &buf);
        journal::log_write(blockno);
        tot += m;
    }

    if off + n > inode.size {
        inode.size = off + n;
    }
    iupdate(inode);
    Some(n)
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct Stat {
    pub(crate) dev: u32,
    pub(crate) ino: u32,
    pub(crate) nlink: u16,
    pub(crate) size: u32,
}

pub(crate) fn stati(inode: &Inode) -> Stat {
    Stat {
        dev: inode.dev,
        ino: inode.inum,
        nlink: inode.nlink,
        size: inode.size,
    }
}

// --------------------------------------------------------------
// Initialization.
// --------------------------------------------------------------

static FS_INIT: Once<()> = Once::new();

/// Format the disk and bring up the journal. Requires the ramdisk.
pub fn init() {
    FS_INIT.call_once(|| {
        let sb = superblock::SuperBlock::fresh();
        sb.write_to_disk();
        mkfs(&sb);
        let sb = superblock::get();
        journal::init(sb.log_start, sb.nlog as usize);
    });
}

/// Mark every metadata block used in the free bitmap.
fn mkfs(sb: &superblock::SuperBlock) {
    let mut buf = [0u8; BLK_SIZE];
    let mut marked = 0;
    let mut bno = sb.bmap_start;
    while marked < sb.data_start() {
        buf.fill(0);
        let mut bi = 0;
        while bi < superblock::BPB && marked + bi < sb.data_start() {
            buf[(bi / 8) as usize] |= 1u8 << (bi % 8);
            bi += 1;
        }
        ramdisk::write(bno, &buf);
        marked += superblock::BPB;
        bno += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::{begin_op, end_op};

    #[test]
    fn write_then_read_back() {
        let _fs = crate::testing::lock_fs();

        begin_op();
        let ip = ialloc(ROOT_DEV, FileType::File).unwrap();
        let mut inode = ilock(&ip);
        let written = writei(&mut inode, b"HELLO".as_ptr(), 0, 5).unwrap();
        assert_eq!(written, 5);
        assert_eq!(inode.size(), 5);
        iunlock(inode);
        end_op();

        let mut out = [0u8; 16];
        let mut inode = ilock(&ip);
        let n = readi(&mut inode, out.as_mut_ptr(), 0, 16).unwrap();
        assert_eq!(n, 5);
        assert_eq!(&out[..5], b"HELLO");
        iunlock(inode);
    }

    #[test]
    fn read_past_end_truncates_and_bad_offset_fails() {
        let _fs = crate::testing::lock_fs();

        begin_op();
        let ip = ialloc(ROOT_DEV, FileType::File).unwrap();
        let mut inode = ilock(&ip);
        writei(&mut inode, [7u8; 100].as_ptr(), 0, 100).unwrap();
        iunlock(inode);
        end_op();

        let mut out = [0u8; 200];
        let mut inode = ilock(&ip);
        assert_eq!(readi(&mut inode, out.as_mut_ptr(), 50, 200), Some(50));
        assert_eq!(readi(&mut inode, out.as_mut_ptr(), 101, 1), None);
        assert_eq!(readi(&mut inode, out.as_mut_ptr(), 100, 1), Some(0));
        iunlock(inode);
    }

    #[test]
    fn growth_crosses_into_the_indirect_block() {
        let _fs = crate::testing::lock_fs();

        begin_op();
        let ip = ialloc(ROOT_DEV, FileType::File).unwrap();
        end_op();

        // One page past the direct area, written in journal-sized chunks.
        let total = (NDIRECT * BLK_SIZE + 4096) as u32;
        let chunk = 2 * BLK_SIZE as u32;
        let pattern: alloc::vec::Vec<u8> = (0..total).map(|i| (i % 251) as u8).collect();
        let mut off = 0;
        while off < total {
            let n = chunk.min(total - off);
            begin_op();
            let mut inode = ilock(&ip);
            assert_eq!(
                writei(&mut inode, pattern[off as usize..].as_ptr(), off, n),
                Some(n)
            );
            iunlock(inode);
            end_op();
            off += n;
        }

        let mut out = alloc::vec![0u8; total as usize];
        let mut inode = ilock(&ip);
        assert_eq!(inode.size(), total);
        assert_eq!(readi(&mut inode, out.as_mut_ptr(), 0, total), Some(total));
        iunlock(inode);
        assert_eq!(out, pattern);
    }

    #[test]
    fn stat_reports_size() {
        let _fs = crate::testing::lock_fs();

        begin_op();
        let ip = ialloc(ROOT_DEV, FileType::File).unwrap();
        let mut inode = ilock(&ip);
        writei(&mut inode, [1u8; 42].as_ptr(), 0, 42).unwrap();
        let st = stati(&inode);
        iunlock(inode);
        end_op();

        assert_eq!(st.size, 42);
        assert_eq!(st.nlink, 1);
        assert_eq!(st.dev, ROOT_DEV);
        assert!(st.ino > 0);
    }
}
