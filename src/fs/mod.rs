//! File system implementation. Five layers:
//!   + Blocks: allocator for contiguous runs of raw disk blocks.
//!   + Log: crash recovery for multi-step updates.
//!   + Files: inode allocator, extent reading and writing, metadata.
//!   + Directories: the root inode holds a flat list of entries.
//!   + Names: paths resolve against the root directory.
//!
//! This module contains the low-level manipulation routines; the
//! syscall-surface implementations are in `sysfile`.

use core::mem;
use std::sync::{Arc, Mutex, MutexGuard};

use zerocopy::AsBytes;

use crate::bio::{Bcache, Buf};
use crate::disk::BlockDevice;
use crate::file::{Devsw, FileTable};
use crate::param::{BSIZE, MAX_LOG_BLOCKS, NDEV};
use crate::stat::InodeType;

mod superblock;
pub use superblock::{Superblock, SUPERBLOCK_NO};
mod log;
pub use self::log::Log;
mod path;
pub use path::{FileName, Path, DIRSIZ};
mod inode;
pub use inode::{
    inodeoff, Dinode, Dirent, Extent, InodeGuard, InodeInner, InodeRef, DINODE_SIZE,
    DIRENT_SIZE, INODEFILEINO, NEXTENT, ROOTINO,
};
pub(crate) use inode::{Itable, DINODE_AVAIL, DINODE_USED};

/// Bitmap bits per block.
pub const BPB: u32 = (BSIZE * 8) as u32;

pub struct FileSystem {
    /// There should be one superblock per disk device, but we run with
    /// only one device.
    pub(crate) superblock: Superblock,
    pub(crate) cache: Bcache,
    log: Mutex<Log>,

    /// Held for the duration of a transaction; the log stages exactly
    /// one at a time.
    txlock: Mutex<()>,
    pub(crate) itable: Itable,
    pub(crate) ftable: FileTable,
    pub(crate) devsw: [Devsw; NDEV],
}

impl FileSystem {
    /// Mount an existing file system: read the superblock, replay any
    /// committed transaction in the log, and load the inodefile.
    pub fn new(dev: Arc<dyn BlockDevice>) -> Self {
        let cache = Bcache::new(dev);
        let superblock = Superblock::read(&cache);
        assert!(
            superblock.size > 0 && superblock.logstart > 0,
            "invalid file system"
        );
        let log = Log::new(superblock.logstart, &cache);
        let fs = Self {
            superblock,
            cache,
            log: Mutex::new(log),
            txlock: Mutex::new(()),
            itable: Itable::new(),
            ftable: FileTable::new(),
            devsw: [Devsw::default(); NDEV],
        };
        fs.init_inodefile();
        fs
    }

    /// Build an initial file system image on the device, then mount it.
    ///
    /// Layout: [ boot | super | bitmap | log | inodefile | data ]. The
    /// inodefile starts with one extent and two dinodes: its own and
    /// the empty root directory's.
    pub fn format(dev: Arc<dyn BlockDevice>, size: u32) -> Self {
        let nbitmap = (size + BPB - 1) / BPB;
        let bmapstart = 2;
        let logstart = bmapstart + nbitmap;
        let inodestart = logstart + 1 + MAX_LOG_BLOCKS as u32;
        let inodefile_blocks = 8u32;
        let firstdata = inodestart + inodefile_blocks;
        assert!(size > firstdata + 1, "format: disk too small");

        let sb = Superblock {
            size,
            nblocks: size - firstdata,
            bmapstart,
            inodestart,
            logstart,
        };

        let zero = [0u8; BSIZE];
        dev.write_block(0, &zero);

        let mut blk = zero;
        blk[..mem::size_of::<Superblock>()].copy_from_slice(sb.as_bytes());
        dev.write_block(SUPERBLOCK_NO, &blk);

        // Everything up to the first data block is in use.
        for i in 0..nbitmap {
            let mut blk = zero;
            for bi in 0..BPB {
                let b = i * BPB + bi;
                if b >= firstdata {
                    break;
                }
                blk[(bi / 8) as usize] |= 1 << (bi % 8);
            }
            dev.write_block(bmapstart + i, &blk);
        }

        dev.write_block(logstart, &zero);
        for i in 0..MAX_LOG_BLOCKS as u32 {
            dev.write_block(logstart + 1 + i, &zero);
        }

        let mut ifile = Dinode::default();
        ifile.typ = InodeType::File.as_raw();
        ifile.used = DINODE_USED;
        ifile.num_extents = 1;
        ifile.extents[0] = Extent {
            startblkno: inodestart,
            nblocks: inodefile_blocks,
        };
        ifile.size = 2 * DINODE_SIZE as u32;

        let mut root = Dinode::default();
        root.typ = InodeType::Dir.as_raw();
        root.used = DINODE_USED;

        let mut blk = zero;
        blk[..DINODE_SIZE].copy_from_slice(ifile.as_bytes());
        blk[DINODE_SIZE..2 * DINODE_SIZE].copy_from_slice(root.as_bytes());
        dev.write_block(inodestart, &blk);
        for i in 1..inodefile_blocks {
            dev.write_block(inodestart + i, &zero);
        }

        Self::new(dev)
    }

    /// Register device functions for a device id.
    pub fn set_device(&mut self, devid: usize, devsw: Devsw) {
        self.devsw[devid] = devsw;
    }

    /// Start a transaction. Every metadata mutation goes through the
    /// returned handle; dropping it commits.
    pub fn begin_transaction(&self) -> FsTransaction<'_> {
        let guard = self.txlock.lock().unwrap();
        self.log.lock().unwrap().begin_tx(&self.cache);
        FsTransaction { fs: self, _guard: guard }
    }
}

/// An open transaction on the redo log.
pub struct FsTransaction<'s> {
    fs: &'s FileSystem,
    _guard: MutexGuard<'s, ()>,
}

impl Drop for FsTransaction<'_> {
    fn drop(&mut self) {
        self.fs.log.lock().unwrap().commit(&self.fs.cache);
    }
}

/// Mark bits [start, end] in a bitmap block. Freeing a free bit is
/// fatal.
fn bmark(bp: &mut Buf, start: u32, end: u32, used: bool) {
    for bi in start..=end {
        let m = 1u8 << (bi % 8);
        let byte = &mut bp.data_mut()[(bi / 8) as usize];
        if used {
            *byte |= m;
        } else {
            assert!(*byte & m != 0, "freeing free block");
            *byte &= !m;
        }
    }
}

impl FsTransaction<'_> {
    /// Stage a modified buffer in the log.
    pub(crate) fn write(&self, buf: Buf) {
        self.fs.log.lock().unwrap().write(&self.fs.cache, buf);
    }

    /// Allocate `n` contiguous disk blocks, returning the first block
    /// number. No promise is made about the blocks' contents. The run
    /// never crosses a bitmap block; failing to find one is fatal.
    pub(crate) fn balloc(&self, n: u32) -> u32 {
        let sb = &self.fs.superblock;
        assert!(n >= 1 && n <= BPB, "balloc: bad run length");

        let mut b = 0;
        while b < sb.size {
            let mut bp = self.fs.cache.read(sb.bblock(b));
            let mut run = 0u32;
            let mut start = 0u32;
            let mut bi = 0u32;
            while bi < BPB && b + bi < sb.size {
                let m = 1u8 << (bi % 8);
                if bp.data()[(bi / 8) as usize] & m == 0 {
                    run += 1;
                    if run == 1 {
                        start = bi;
                    }
                    if run == n {
                        bmark(&mut bp, start, bi, true);
                        self.write(bp);
                        return b + start;
                    }
                } else {
                    run = 0;
                }
                bi += 1;
            }
            drop(bp);
            b += BPB;
        }
        panic!("balloc: can't allocate contiguous blocks");
    }

    /// Free `n` disk blocks starting from `b`. The range must lie in a
    /// single bitmap block.
    pub(crate) fn bfree(&self, b: u32, n: u32) {
        let sb = &self.fs.superblock;
        assert!(n >= 1, "freeing less than 1 block");
        assert_eq!(
            sb.bblock(b),
            sb.bblock(b + n - 1),
            "freed blocks live in different bitmap sectors"
        );
        let mut bp = self.fs.cache.read(sb.bblock(b));
        bmark(&mut bp, b % BPB, (b + n - 1) % BPB, false);
        self.write(bp);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::test_fs;

    #[test]
    fn format_and_mount() {
        let fs = test_fs(2048);
        let root = fs.iget(crate::param::ROOTDEV, ROOTINO);
        let st = fs.stati(root);
        assert_eq!(st.ino, ROOTINO);
        assert_eq!(st.typ, InodeType::Dir);
        assert_eq!(st.size, 0);
        fs.irelease(root);
    }

    #[test]
    fn balloc_returns_contiguous_runs() {
        let fs = test_fs(2048);
        let firstdata = fs.superblock.size - fs.superblock.nblocks;
        let tx = fs.begin_transaction();
        let a = tx.balloc(3);
        assert_eq!(a, firstdata);
        let b = tx.balloc(2);
        assert_eq!(b, a + 3);
        drop(tx);

        // Freeing the first run makes it the next first fit again.
        let tx = fs.begin_transaction();
        tx.bfree(a, 3);
        assert_eq!(tx.balloc(2), a);
        assert_eq!(tx.balloc(1), a + 2);
    }

    #[test]
    fn balloc_skips_over_short_gaps() {
        let fs = test_fs(2048);
        let tx = fs.begin_transaction();
        let a = tx.balloc(4);
        let _b = tx.balloc(1);
        tx.bfree(a, 1);
        tx.bfree(a + 2, 2);
        // A three-block run does not fit in either hole.
        let c = tx.balloc(3);
        assert!(c > a + 4);
    }

    #[test]
    #[should_panic(expected = "freeing free block")]
    fn double_free_panics() {
        let fs = test_fs(2048);
        let tx = fs.begin_transaction();
        let a = tx.balloc(1);
        tx.bfree(a, 1);
        tx.bfree(a, 1);
    }

    #[test]
    fn mount_preserves_disk_contents() {
        let disk = std::sync::Arc::new(crate::disk::MemDisk::new(2048));
        let fs = FileSystem::format(disk.clone(), 2048);
        let ip = fs.create_inode(FileName::new(b"persist")).unwrap();
        assert_eq!(fs.writei(ip, b"hello, remount", 0), Ok(14));
        fs.irelease(ip);
        drop(fs);

        let fs = FileSystem::new(disk);
        let ip = fs.namei(Path::new("/persist")).unwrap();
        let mut out = [0u8; 14];
        assert_eq!(fs.readi(ip, &mut out, 0), Ok(14));
        assert_eq!(&out, b"hello, remount");
        fs.irelease(ip);
    }
}
