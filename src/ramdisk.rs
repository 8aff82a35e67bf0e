//! Memory-backed block device standing in for a disk. The file system and
//! journal address it in 512-byte blocks.

use crate::constants::{BLK_SIZE, FS_SIZE};
use alloc::vec;
use alloc::vec::Vec;
use spin::{Mutex, Once};

pub(crate) type Block = [u8; BLK_SIZE];

struct RamDisk {
    blocks: Vec<Block>,
}

static DISK: Once<Mutex<RamDisk>> = Once::new();

/// Allocate the backing store. Requires the kernel heap.
pub fn init() {
    DISK.call_once(|| {
        Mutex::new(RamDisk {
            blocks: vec![[0u8; BLK_SIZE]; FS_SIZE as usize],
        })
    });
}

fn disk() -> &'static Mutex<RamDisk> {
    DISK.get().expect("ramdisk: not initialized")
}

pub(crate) fn read(blockno: u32, buf: &mut Block) {
    let disk = disk().lock();
    *buf = disk.blocks[blockno as usize];
}

pub(crate) fn write(blockno: u32, buf: &Block) {
    let mut disk = disk().lock();
    disk.blocks[blockno as usize] = *buf;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_hold_what_was_stored() {
        init();
        let mut block = [0u8; BLK_SIZE];
        block[0] = 0xaa;
        block[BLK_SIZE - 1] = 0x55;
        // Stay clear of blocks the file-system tests may touch.
        write(FS_SIZE - 1, &block);

        let mut readback = [0u8; BLK_SIZE];
        read(FS_SIZE - 1, &mut readback);
        assert_eq!(readback[0], 0xaa);
        assert_eq!(readback[BLK_SIZE - 1], 0x55);
    }
}
