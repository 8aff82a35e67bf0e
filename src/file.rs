use crate::constants::*;
use crate::error::KernelError;
use crate::fs::{self, Inode};
use crate::journal;
use alloc::sync::Arc;
use spin::{Mutex, MutexGuard, RwLock};

/// An open file: an inode reference plus the access mode and offset.
pub struct File {
    readable: bool,
    writable: bool,
    ip: Arc<RwLock<Inode>>,
    off: u32,
}

impl File {
    fn new(readable: bool, writable: bool, ip: &Arc<RwLock<Inode>>) -> File {
        File {
            readable,
            writable,
            ip: Arc::clone(ip),
            off: 0,
        }
    }

    pub(crate) fn is_readable(&self) -> bool {
        self.readable
    }

    pub(crate) fn is_writable(&self) -> bool {
        self.writable
    }

    pub(crate) fn inode(&self) -> &Arc<RwLock<Inode>> {
        &self.ip
    }

    pub(crate) fn stat(&self) -> fs::Stat {
        let inode = fs::ilock(&self.ip);
        let stat = fs::stati(&inode);
        fs::iunlock(inode);
        stat
    }

    /// Read from the file at the current offset.
    pub(crate) fn read(&mut self, addr: *mut u8, n: usize) -> Result<usize, KernelError> {
        if !self.readable {
            return Err(KernelError::BadFileDescriptor);
        }
        let mut inode = fs::ilock(&self.ip);
        let res = match fs::readi(&mut inode, addr, self.off, n as u32) {
            None => Err(KernelError::Io),
            Some(cnt) => {
                self.off += cnt;
                Ok(cnt as usize)
            }
        };
        fs::iunlock(inode);
        res
    }

    /// Write to the file at the current offset.
    pub(crate) fn write(&mut self, addr: *const u8, n: usize) -> Result<usize, KernelError> {
        if !self.writable {
            return Err(KernelError::BadFileDescriptor);
        }

        // Write a few blocks at a time to avoid exceeding the maximum
        // journal transaction size, including inode, indirect block,
        // allocation blocks, and 2 blocks of slop for non-aligned writes.
        let max = ((MAX_OP_BLOCKS - 1 - 1 - 2) / 2) * BLK_SIZE;
        let mut i = 0;
        while i < n {
            let n1 = core::cmp::min(n - i, max);

            journal::begin_op();
            let mut inode = fs::ilock(&self.ip);
            let r = fs::writei(&mut inode, unsafe { addr.add(i) }, self.off, n1 as u32);
            if let Some(cnt) = r {
                self.off += cnt;
            }
            fs::iunlock(inode);
            journal::end_op();

            match r {
                Some(cnt) if cnt as usize == n1 => i += n1,
                _ => return Err(KernelError::Io),
            }
        }
        Ok(n)
    }
}

/// System-wide table of open files. Entries are shared across processes by
/// `Arc`; dup and fork bump the count, close drops it.
pub(crate) struct FileTable {
    files: [Option<Arc<RwLock<File>>>; NFILE],
}

#[derive(Clone)]
pub struct FileTableEntry {
    pub(crate) file: Arc<RwLock<File>>,
    index: usize,
}

const NO_FILE: Option<Arc<RwLock<File>>> = None;

impl FileTable {
    const fn new() -> FileTable {
        FileTable {
            files: [NO_FILE; NFILE],
        }
    }

    fn find_empty_entry(&self) -> Option<usize> {
        self.files.iter().position(|f| f.is_none())
    }

    /// Allocate a file structure for an inode.
    pub(crate) fn alloc(
        &mut self,
        readable: bool,
        writable: bool,
        ip: &Arc<RwLock<Inode>>,
    ) -> Option<FileTableEntry> {
        let i = self.find_empty_entry()?;
        let f = Arc::new(RwLock::new(File::new(readable, writable, ip)));
        self.files[i] = Some(Arc::clone(&f));
        Some(FileTableEntry { file: f, index: i })
    }

    /// Close one reference; the table slot is released when the last
    /// process-side reference goes away.
    pub(crate) fn close(&mut self, entry: FileTableEntry) {
        let ref_cnt = Arc::strong_count(&entry.file);
        if ref_cnt <= 1 {
            panic!("FileTable::close: bad ref count");
        }
        if ref_cnt == 2 {
            // Only the table itself still refers to the file.
            let ind = entry.index;
            let ip = Arc::clone(entry.file.read().inode());
            drop(entry);
            self.files[ind] = None;
            journal::begin_op();
            fs::iput(ip);
            journal::end_op();
        }
    }
}

static FILE_TABLE: Mutex<FileTable> = Mutex::new(FileTable::new());

pub(crate) fn file_table() -> MutexGuard<'static, FileTable> {
    FILE_TABLE.lock()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct FileDescriptor(pub(crate) u32);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::FileType;

    #[test]
    fn file_offsets_advance_reads() {
        let _fs = crate::testing::lock_fs();

        journal::begin_op();
        let ip = fs::ialloc(ROOT_DEV, FileType::File).unwrap();
        journal::end_op();

        let ent = file_table().alloc(true, true, &ip).unwrap();
        {
            let mut f = ent.file.write();
            f.write(b"JELLO".as_ptr(), 5).unwrap();
            f.off = 0;
        }

        let ent2 = ent.clone();
        let mut buf = [0u8; 3];
        {
            let mut f = ent2.file.write();
            assert_eq!(f.read(buf.as_mut_ptr(), 3).unwrap(), 3);
            assert_eq!(&buf, b"JEL");
            assert_eq!(f.read(buf.as_mut_ptr(), 3).unwrap(), 2);
            assert_eq!(&buf[..2], b"LO");
        }

        let st = ent.file.read().stat();
        assert_eq!(st.size, 5);

        file_table().close(ent2);
        file_table().close(ent);
    }

    #[test]
    fn read_on_write_only_file_is_rejected() {
        let _fs = crate::testing::lock_fs();

        journal::begin_op();
        let ip = fs::ialloc(ROOT_DEV, FileType::File).unwrap();
        journal::end_op();

        let ent = file_table().alloc(false, true, &ip).unwrap();
        let mut buf = [0u8; 4];
        let res = ent.file.write().read(buf.as_mut_ptr(), 4);
        assert!(res.is_err());
        file_table().close(ent);
    }
}
