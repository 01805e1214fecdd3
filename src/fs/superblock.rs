use core::mem;

use static_assertions::const_assert;
use zerocopy::{AsBytes, FromBytes};

use crate::bio::Bcache;
use crate::param::BSIZE;

use super::BPB;

/// Disk layout:
/// [ boot block | super block | free bit map |
///   log header + log blocks | inode file | data blocks ]
///
/// Formatting computes the super block and builds an initial file
/// system. The super block describes the disk layout:
#[repr(C)]
#[derive(Copy, Clone, Default, AsBytes, FromBytes)]
pub struct Superblock {
    /// Size of file system image (blocks)
    pub size: u32,

    /// Number of data blocks
    pub nblocks: u32,

    /// Block number of first free map block
    pub bmapstart: u32,

    /// Block number of the start of the inode file
    pub inodestart: u32,

    /// Block number of the log header
    pub logstart: u32,
}

const_assert!(mem::size_of::<Superblock>() <= BSIZE);

/// Block number holding the superblock.
pub const SUPERBLOCK_NO: u32 = 1;

impl Superblock {
    /// Read the super block.
    pub fn read(cache: &Bcache) -> Self {
        let bp = cache.read(SUPERBLOCK_NO);
        let mut sb = Superblock::default();
        sb.as_bytes_mut()
            .copy_from_slice(&bp.data()[..mem::size_of::<Superblock>()]);
        sb
    }

    /// Block of free map containing the bit for block b.
    pub const fn bblock(&self, b: u32) -> u32 {
        b / BPB + self.bmapstart
    }
}
