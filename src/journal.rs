//! Write-ahead journal bracketing file-system operations.
//!
//! Callers wrap each FS system call in `begin_op`/`end_op`. Block writes
//! inside the bracket are recorded with `log_write`; the last outstanding
//! operation triggers the group commit: journal the blocks, write the
//! header (the commit point), install to the home locations, clear.

use crate::constants::{BLK_SIZE, LOG_SIZE, MAX_OP_BLOCKS};
use crate::ramdisk;
use spin::{Mutex, MutexGuard, Once};

// In-memory copy of the on-disk header block: the count and the home block
// number of every journaled block.
struct LogHeader {
    n: usize,
    block: [u32; LOG_SIZE],
}

struct Log {
    start: u32, // first journal block (holds the header)
    size: usize,
    outstanding: usize, // FS sys calls currently inside a bracket
    lh: LogHeader,
}

static LOG: Once<Mutex<Log>> = Once::new();

/// Set up the journal over `[start, start + size)` and recover any
/// committed-but-uninstalled transaction.
pub(crate) fn init(start: u32, size: usize) {
    assert!(size <= LOG_SIZE + 1, "journal: log area too large");
    LOG.call_once(|| {
        let mut log = Log {
            start,
            size,
            outstanding: 0,
            lh: LogHeader {
                n: 0,
                block: [0; LOG_SIZE],
            },
        };
        recover(&mut log);
        Mutex::new(log)
    });
}

fn get_log() -> MutexGuard<'static, Log> {
    LOG.get().expect("journal: not initialized").lock()
}

/// Called at the start of each FS system call.
pub(crate) fn begin_op() {
    loop {
        let mut log = get_log();
        if log.lh.n + (log.outstanding + 1) * MAX_OP_BLOCKS > log.size - 1 {
            // This op might exhaust the log space; wait for a commit.
            continue;
        }
        log.outstanding += 1;
        break;
    }
}

/// Called at the end of each FS system call.
/// Commits if this was the last outstanding operation.
pub(crate) fn end_op() {
    let mut log = get_log();
    assert!(log.outstanding > 0, "end_op without begin_op");
    log.outstanding -= 1;
    if log.outstanding == 0 {
        commit(&mut log);
    }
}

/// Record that `blockno` was modified inside the current bracket.
/// Absorbs repeated writes to the same block.
pub(crate) fn log_write(blockno: u32) {
    let mut log = get_log();
    if log.lh.n >= LOG_SIZE || log.lh.n >= log.size - 1 {
        panic!("journal: too big a transaction");
    }
    if log.outstanding < 1 {
        panic!("journal: log_write outside of a transaction");
    }
    if !log.lh.block[..log.lh.n].contains(&blockno) {
        let n = log.lh.n;
        log.lh.block[n] = blockno;
        log.lh.n += 1;
    }
}

fn commit(log: &mut Log) {
    if log.lh.n > 0 {
        write_log(log); // copy modified blocks into the journal area
        write_head(log); // the real commit
        install_trans(log); // install to home locations
        log.lh.n = 0;
        write_head(log); // erase the transaction
    }
}

/// Copy each journaled block's current contents into the journal area.
fn write_log(log: &Log) {
    let mut buf = [0u8; BLK_SIZE];
    for tail in 0..log.lh.n {
        ramdisk::read(log.lh.block[tail], &mut buf);
        ramdisk::write(log.start + 1 + tail as u32, &buf);
    }
}

/// Copy committed blocks from the journal to their home locations.
fn install_trans(log: &Log) {
    let mut buf = [0u8; BLK_SIZE];
    for tail in 0..log.lh.n {
        ramdisk::read(log.start + 1 + tail as u32, &mut buf);
        ramdisk::write(log.lh.block[tail], &buf);
    }
}

/// Write the in-memory header to the header block. This is the point at
/// which the current transaction commits.
fn write_head(log: &Log) {
    let mut buf = [0u8; BLK_SIZE];
    buf[0..4].copy_from_slice(&(log.lh.n as u32).to_le_bytes());
    for i in 0..log.lh.n {
        let off = 4 + i * 4;
        buf[off..off + 4].copy_from_slice(&log.lh.block[i].to_le_bytes());
    }
    ramdisk::write(log.start, &buf);
}

fn read_head(log: &mut Log) {
    let mut buf = [0u8; BLK_SIZE];
    ramdisk::read(log.start, &mut buf);
    let n = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    log.lh.n = n.min(LOG_SIZE);
    for i in 0..log.lh.n {
        let off = 4 + i * 4;
        log.lh.block[i] = u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]]);
    }
}

fn recover(log: &mut Log) {
    read_head(log);
    install_trans(log); // if committed, copy from the journal to home
    log.lh.n = 0;
    write_head(log); // clear the journal
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::FS_SIZE;

    #[test]
    fn absorption_and_commit() {
        let _fs = crate::testing::lock_fs();
        // A high data block no allocator reaches in tests.
        let data_block = FS_SIZE - 4;

        begin_op();
        let mut block = [0u8; BLK_SIZE];
        block[0] = 0x42;
        ramdisk::write(data_block, &block);
        log_write(data_block);
        log_write(data_block); // absorbed
        {
            let log = get_log();
            assert_eq!(log.lh.n, 1);
            assert_eq!(log.outstanding, 1);
        }
        end_op();

        // Committed and cleared.
        {
            let log = get_log();
            assert_eq!(log.lh.n, 0);
            assert_eq!(log.outstanding, 0);
        }
        let mut readback = [0u8; BLK_SIZE];
        ramdisk::read(data_block, &mut readback);
        assert_eq!(readback[0], 0x42);
    }

    #[test]
    fn nested_ops_commit_once() {
        let _fs = crate::testing::lock_fs();
        let data_block = FS_SIZE - 5;

        begin_op();
        begin_op();
        ramdisk::write(data_block, &[7u8; BLK_SIZE]);
        log_write(data_block);
        end_op();
        // Still inside the outer bracket: nothing committed yet.
        assert_eq!(get_log().lh.n, 1);
        end_op();
        assert_eq!(get_log().lh.n, 0);
    }
}
