use crate::constants::{BLK_SIZE, FS_SIZE, LOG_SIZE, NINODE};
use crate::ramdisk;
use spin::Once;

const FS_MAGIC: u32 = 0x10203040;

// Disk layout:
// [ boot block | super block | log | inode blocks | free bit map | data blocks ]
//
// mkfs computes the super block and builds an initial file system.
// The super block describes the disk layout.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SuperBlock {
    pub(crate) magic: u32,
    pub(crate) size: u32,        // size of file system image (blocks)
    pub(crate) nblocks: u32,     // number of data blocks
    pub(crate) ninodes: u32,     // number of inodes
    pub(crate) nlog: u32,        // number of log blocks
    pub(crate) log_start: u32,   // block number of the first log block
    pub(crate) inode_start: u32, // block number of the first inode block
    pub(crate) bmap_start: u32,  // block number of the first free bit map block
}

/// Bytes of one on-disk inode; see `fs::DInode`.
pub(crate) const INODE_SIZE: usize = 64;
/// Inodes per block.
pub(crate) const IPB: usize = BLK_SIZE / INODE_SIZE;
/// Bitmap bits per block.
pub(crate) const BPB: u32 = (BLK_SIZE * 8) as u32;

impl SuperBlock {
    /// The layout for a freshly formatted disk image.
    pub(crate) fn fresh() -> SuperBlock {
        let nlog = LOG_SIZE as u32 + 1; // header block included
        let ninodes = NINODE as u32;
        let ninodeblocks = (ninodes + IPB as u32 - 1) / IPB as u32;
        let nbitmap = (FS_SIZE + BPB - 1) / BPB;
        let nmeta = 2 + nlog + ninodeblocks + nbitmap;
        SuperBlock {
            magic: FS_MAGIC,
            size: FS_SIZE,
            nblocks: FS_SIZE - nmeta,
            ninodes,
            nlog,
            log_start: 2,
            inode_start: 2 + nlog,
            bmap_start: 2 + nlog + ninodeblocks,
        }
    }

    pub(crate) fn is_valid(&self) -> bool {
        self.magic == FS_MAGIC && self.size == FS_SIZE
    }

    /// First block available for file data.
    pub(crate) fn data_start(&self) -> u32 {
        self.size - self.nblocks
    }

    fn decode(buf: &ramdisk::Block) -> SuperBlock {
        let word = |i: usize| {
            u32::from_le_bytes([buf[i * 4], buf[i * 4 + 1], buf[i * 4 + 2], buf[i * 4 + 3]])
        };
        SuperBlock {
            magic: word(0),
            size: word(1),
            nblocks: word(2),
            ninodes: word(3),
            nlog: word(4),
            log_start: word(5),
            inode_start: word(6),
            bmap_start: word(7),
        }
    }

    fn encode(&self, buf: &mut ramdisk::Block) {
        let words = [
            self.magic,
            self.size,
            self.nblocks,
            self.ninodes,
            self.nlog,
            self.log_start,
            self.inode_start,
            self.bmap_start,
        ];
        for (i, w) in words.iter().enumerate() {
            buf[i * 4..i * 4 + 4].copy_from_slice(&w.to_le_bytes());
        }
    }

    pub(crate) fn write_to_disk(&self) {
        let mut buf = [0u8; BLK_SIZE];
        self.encode(&mut buf);
        ramdisk::write(1, &buf);
    }
}

static SUPER_BLOCK: Once<SuperBlock> = Once::new();

fn read_sb() -> SuperBlock {
    let mut buf = [0u8; BLK_SIZE];
    ramdisk::read(1, &mut buf);
    SuperBlock::decode(&buf)
}

/// The cached super block. `fs::init` must have formatted or validated the
/// disk before the first call.
pub(crate) fn get() -> &'static SuperBlock {
    SUPER_BLOCK.call_once(read_sb)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_layout_is_contiguous() {
        let sb = SuperBlock::fresh();
        assert!(sb.is_valid());
        assert_eq!(sb.log_start, 2);
        assert_eq!(sb.inode_start, sb.log_start + sb.nlog);
        assert!(sb.bmap_start > sb.inode_start);
        assert_eq!(sb.data_start() + sb.nblocks, sb.size);
    }

    #[test]
    fn encode_decode_roundtrip() {
        let sb = SuperBlock::fresh();
        let mut buf = [0u8; BLK_SIZE];
        sb.encode(&mut buf);
        let back = SuperBlock::decode(&buf);
        assert!(back.is_valid());
        assert_eq!(back.inode_start, sb.inode_start);
        assert_eq!(back.nblocks, sb.nblocks);
    }
}
