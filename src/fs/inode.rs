//! Inodes.
//!
//! An inode describes a single unnamed file: its type, size, and the
//! extents holding its content. The on-disk inodes themselves live in a
//! file, the inodefile, whose inum is 0 and whose first extent is placed
//! by formatting; the number of inodes grows by appending to it.
//!
//! The kernel keeps a table of in-use inodes in memory to provide a
//! place for synchronizing access to inodes used by multiple processes.
//! The in-memory inodes carry book-keeping that is not stored on disk:
//! the reference count and the valid bit.
//!
//! * Referencing: a table slot is free iff its reference count is zero.
//!   `iget` finds or claims a slot and increments the count; `irelease`
//!   decrements it. Neither touches the disk.
//! * Valid: a slot's cached copy of the dinode is only meaningful once
//!   the valid bit is set. The first `lock_inode` after a slot is
//!   claimed reads the dinode from the inodefile.
//! * Locked: content (type, size, extents) may only be examined or
//!   modified through an `InodeGuard`, which holds the inode's sleep
//!   lock.
//!
//! Thus a typical sequence is:
//!   let ip = fs.iget(dev, inum);
//!   let mut guard = fs.lock_inode(ip);
//!   ... examine and modify through the guard ...
//!   drop(guard);
//!   fs.irelease(ip);
//!
//! `lock_inode` is separate from `iget` so that system calls can keep a
//! long-term reference to an inode (as an open file does) and lock it
//! only for short periods. The separation also avoids deadlock during
//! pathname lookup.
//!
//! Lock order is parent directory, then child inode, then the
//! inodefile. Persisting an inode's metadata locks the inodefile last;
//! when the inodefile persists its own growth it re-enters through the
//! guard it already holds rather than taking the lock again.

use core::cmp;
use core::mem;

use arrayvec::ArrayVec;
use log::warn;
use spin::Mutex as SpinMutex;
use static_assertions::const_assert_eq;
use zerocopy::{AsBytes, FromBytes};

use crate::fs::path::{FileName, DIRSIZ};
use crate::fs::{FileSystem, FsTransaction};
use crate::lock::{SleepLock, SleepLockGuard};
use crate::param::{BSIZE, NDEV, NINODE, ROOTDEV};
use crate::stat::{InodeType, Stat};

use array_macro::array;
use core::ops::{Deref, DerefMut};

/// Maximum extents per inode. Asking for a 31st is fatal.
pub const NEXTENT: usize = 30;

/// Inum of the inodefile itself.
pub const INODEFILEINO: u32 = 0;

/// Root directory inum.
pub const ROOTINO: u32 = 1;

pub(crate) const DINODE_AVAIL: i16 = 0;
pub(crate) const DINODE_USED: i16 = 1;

/// A contiguous run of data blocks belonging to one inode.
#[repr(C)]
#[derive(Copy, Clone, Default, PartialEq, Debug, AsBytes, FromBytes)]
pub struct Extent {
    pub startblkno: u32,
    pub nblocks: u32,
}

/// On-disk inode structure. Fixed-size so that `inodeoff` addresses a
/// dinode inside the inodefile by plain multiplication.
#[repr(C)]
#[derive(Copy, Clone, Default, AsBytes, FromBytes)]
pub struct Dinode {
    /// File type
    pub typ: i16,

    /// Device number (device inodes only)
    pub devid: i16,

    /// Size of file (bytes)
    pub size: u32,

    /// Whether this inode slot is in use
    pub used: i16,

    /// Number of extents currently in use
    pub num_extents: i16,

    /// Runs of data blocks, in append order
    pub extents: [Extent; NEXTENT],

    pub pad: [u8; 4],
}

pub const DINODE_SIZE: usize = mem::size_of::<Dinode>();
const_assert_eq!(DINODE_SIZE, 256);

/// Offset of a dinode in the inodefile.
pub const fn inodeoff(inum: u32) -> u32 {
    inum * DINODE_SIZE as u32
}

/// Directory entry. `inum == 0` marks a free entry.
#[repr(C)]
#[derive(Default, AsBytes, FromBytes)]
pub struct Dirent {
    pub inum: u16,
    name: [u8; DIRSIZ],
}

pub const DIRENT_SIZE: usize = mem::size_of::<Dirent>();
const_assert_eq!(DIRENT_SIZE, 16);

impl Dirent {
    /// Fill in name. If name is shorter than DIRSIZ, a NUL terminator is
    /// appended.
    fn set_name(&mut self, name: &FileName) {
        let name = name.as_bytes();
        if name.len() == DIRSIZ {
            self.name.copy_from_slice(name);
        } else {
            self.name[..name.len()].copy_from_slice(name);
            self.name[name.len()] = 0;
        }
    }

    /// Returns the slice which exactly contains the name.
    pub fn name(&self) -> &FileName {
        let len = self.name.iter().position(|ch| *ch == 0).unwrap_or(DIRSIZ);
        FileName::new(&self.name[..len])
    }
}

/// Cached content of an inode, protected by the slot's sleep lock.
pub struct InodeInner {
    pub typ: InodeType,
    pub devid: i16,
    pub size: u32,
    pub used: i16,
    pub extents: ArrayVec<Extent, NEXTENT>,
}

impl InodeInner {
    fn new() -> Self {
        Self {
            typ: InodeType::None,
            devid: 0,
            size: 0,
            used: DINODE_AVAIL,
            extents: ArrayVec::new(),
        }
    }

    fn load(&mut self, din: &Dinode) {
        self.typ = InodeType::from_raw(din.typ).expect("inode: bad type");
        self.devid = din.devid;
        self.size = din.size;
        self.used = din.used;
        assert!(
            din.num_extents >= 0 && din.num_extents as usize <= NEXTENT,
            "inode: bad extent count"
        );
        self.extents.clear();
        self.extents
            .try_extend_from_slice(&din.extents[..din.num_extents as usize])
            .expect("inode: bad extent count");
    }

    fn to_dinode(&self) -> Dinode {
        let mut din = Dinode::default();
        din.typ = self.typ.as_raw();
        din.devid = self.devid;
        din.size = self.size;
        din.used = self.used;
        din.num_extents = self.extents.len() as i16;
        din.extents[..self.extents.len()].copy_from_slice(&self.extents);
        din
    }

    /// Disk block holding the file's `bn`th block, walking extents in
    /// append order.
    pub fn disk_block(&self, bn: u32) -> Option<u32> {
        let mut base = 0u32;
        for e in &self.extents {
            if bn < base + e.nblocks {
                return Some(e.startblkno + (bn - base));
            }
            base += e.nblocks;
        }
        None
    }

    /// Total blocks covered by the extents, padding included.
    pub fn block_count(&self) -> usize {
        self.extents.iter().map(|e| e.nblocks as usize).sum()
    }
}

/// Slot identity, guarded by the table spin lock.
#[derive(Copy, Clone, Default)]
struct InodeMeta {
    dev: u32,
    inum: u32,
    refcnt: u32,
    valid: bool,
}

pub(crate) struct Itable {
    meta: SpinMutex<[InodeMeta; NINODE]>,
    slots: [SleepLock<InodeInner>; NINODE],
    inodefile: SleepLock<InodeInner>,
}

impl Itable {
    pub fn new() -> Self {
        Self {
            meta: SpinMutex::new([InodeMeta::default(); NINODE]),
            slots: array![_ => SleepLock::new("inode", InodeInner::new()); NINODE],
            inodefile: SleepLock::new("inodefile", InodeInner::new()),
        }
    }
}

/// Index-handle to a cache slot; holding one keeps the slot's reference
/// count positive, so `dev`/`inum` stay accurate.
#[derive(Copy, Clone, Debug)]
pub struct InodeRef {
    idx: usize,
    pub dev: u32,
    pub inum: u32,
}

/// A locked inode.
pub struct InodeGuard<'a> {
    fs: &'a FileSystem,
    pub dev: u32,
    pub inum: u32,
    guard: SleepLockGuard<'a, InodeInner>,
}

impl Deref for InodeGuard<'_> {
    type Target = InodeInner;

    fn deref(&self) -> &InodeInner {
        &self.guard
    }
}

impl DerefMut for InodeGuard<'_> {
    fn deref_mut(&mut self) -> &mut InodeInner {
        &mut self.guard
    }
}

impl FileSystem {
    /// Find the inode with number inum on device dev and return a
    /// handle to the in-memory copy. Does not read from disk.
    pub fn iget(&self, dev: u32, inum: u32) -> InodeRef {
        let mut meta = self.itable.meta.lock();
        let mut empty = None;
        for (idx, m) in meta.iter_mut().enumerate() {
            if m.refcnt > 0 && m.dev == dev && m.inum == inum {
                m.refcnt += 1;
                return InodeRef { idx, dev, inum };
            }
            if empty.is_none() && m.refcnt == 0 {
                empty = Some(idx);
            }
        }

        // Claim an empty slot.
        let idx = empty.expect("iget: no inodes");
        meta[idx] = InodeMeta {
            dev,
            inum,
            refcnt: 1,
            valid: false,
        };
        InodeRef { idx, dev, inum }
    }

    /// Increment the reference count. Returns the handle to enable the
    /// `let ip2 = fs.idup(ip)` idiom.
    pub fn idup(&self, ip: InodeRef) -> InodeRef {
        self.itable.meta.lock()[ip.idx].refcnt += 1;
        ip
    }

    /// Drop a reference to an in-memory inode. When the last reference
    /// is gone the slot can be recycled; the disk is not touched.
    pub fn irelease(&self, ip: InodeRef) {
        let mut meta = self.itable.meta.lock();
        assert!(meta[ip.idx].refcnt >= 1, "irelease");
        meta[ip.idx].refcnt -= 1;
    }

    /// Lock the given inode, reading it from the inodefile if this slot
    /// has not been loaded since it was claimed.
    pub fn lock_inode(&self, ip: InodeRef) -> InodeGuard<'_> {
        {
            let meta = self.itable.meta.lock();
            assert!(
                meta[ip.idx].refcnt >= 1 && meta[ip.idx].inum == ip.inum,
                "locki"
            );
        }
        let guard = self.itable.slots[ip.idx].lock();
        let mut guard = InodeGuard {
            fs: self,
            dev: ip.dev,
            inum: ip.inum,
            guard,
        };
        if !self.itable.meta.lock()[ip.idx].valid {
            let mut din = Dinode::default();
            self.read_dinode(ip.inum, &mut din);
            guard.load(&din);
            assert!(guard.typ != InodeType::None, "locki: no type");
            self.itable.meta.lock()[ip.idx].valid = true;
        }
        guard
    }

    /// Lock the inodefile itself. Its cache slot is distinguished and
    /// loaded at mount, so no disk read happens here.
    pub fn lock_inodefile(&self) -> InodeGuard<'_> {
        InodeGuard {
            fs: self,
            dev: ROOTDEV,
            inum: INODEFILEINO,
            guard: self.itable.inodefile.lock(),
        }
    }

    /// Read the dinode with the given inum out of the inodefile.
    fn read_dinode(&self, inum: u32, dip: &mut Dinode) {
        let mut ifile = self.lock_inodefile();
        ifile.read_obj(dip, inodeoff(inum)).expect("read_dinode");
    }

    /// Load the inodefile's own dinode from the first inodefile block.
    /// Called once at mount; idempotent.
    pub(crate) fn init_inodefile(&self) {
        let bp = self.cache.read(self.superblock.inodestart);
        let mut din = Dinode::default();
        din.as_bytes_mut().copy_from_slice(&bp.data()[..DINODE_SIZE]);
        drop(bp);

        let mut inner = self.itable.inodefile.lock();
        inner.load(&din);
        assert!(inner.typ != InodeType::None, "init_inodefile: no type");
        assert_eq!(inner.used, DINODE_USED, "init_inodefile: free inodefile");
    }

    /// Thread-safe stat.
    pub fn stati(&self, ip: InodeRef) -> Stat {
        self.lock_inode(ip).stat()
    }

    /// Thread-safe read.
    pub fn readi(&self, ip: InodeRef, dst: &mut [u8], off: u32) -> Result<usize, ()> {
        self.lock_inode(ip).read_bytes(dst, off)
    }

    /// Thread-safe write, wrapped in its own transaction.
    pub fn writei(&self, ip: InodeRef, src: &[u8], off: u32) -> Result<usize, ()> {
        let mut guard = self.lock_inode(ip);
        let tx = self.begin_transaction();
        guard.write_bytes(src, off, &tx)
        // tx commits, then the guard unlocks.
    }

    /// Create a new inode, give it an entry in the root directory, and
    /// return a referenced handle to it. One transaction end to end.
    pub fn create_inode(&self, name: &FileName) -> Result<InodeRef, ()> {
        let tx = self.begin_transaction();
        let root = self.iget(ROOTDEV, ROOTINO);
        let mut dp = self.lock_inode(root);

        if let Ok((found, _)) = dp.dirlookup(name) {
            drop(dp);
            self.irelease(found);
            self.irelease(root);
            warn!("create_inode: name already present");
            return Err(());
        }

        // Reuse a free dinode slot in the inodefile, or append one.
        let inum = {
            let mut ifile = self.lock_inodefile();
            let ninodes = ifile.size / DINODE_SIZE as u32;
            let mut chosen = None;
            for i in 0..ninodes {
                let mut din = Dinode::default();
                ifile
                    .read_obj(&mut din, inodeoff(i))
                    .expect("create_inode: read");
                if din.used == DINODE_AVAIL {
                    chosen = Some(i);
                    break;
                }
            }
            let inum = chosen.unwrap_or(ninodes);

            let mut din = Dinode::default();
            din.typ = ifile.typ.as_raw();
            din.devid = ifile.devid;
            din.used = DINODE_USED;
            ifile
                .write_obj(&din, inodeoff(inum), &tx)
                .expect("create_inode: write");
            inum
        };

        let ip = self.iget(ROOTDEV, inum);
        dp.dirlink(name, inum, &tx).expect("create_inode: dirlink");
        drop(dp);
        self.irelease(root);
        drop(tx);
        Ok(ip)
    }

    /// Remove the inode's root-directory entry, mark its dinode free,
    /// and return its data blocks to the bitmap. One transaction end to
    /// end. The caller still owns (and must release) its reference.
    pub fn delete_inode(&self, ip: InodeRef) {
        let tx = self.begin_transaction();
        let root = self.iget(ROOTDEV, ROOTINO);
        let mut dp = self.lock_inode(root);
        let mut guard = self.lock_inode(ip);

        for off in (0..dp.size).step_by(DIRENT_SIZE) {
            let mut de = Dirent::default();
            dp.read_obj(&mut de, off).expect("delete_inode: read");
            if de.inum as u32 == ip.inum {
                dp.write_obj(&Dirent::default(), off, &tx)
                    .expect("delete_inode: erase");
            }
        }

        {
            let mut ifile = self.lock_inodefile();
            ifile
                .write_obj(&Dinode::default(), inodeoff(ip.inum), &tx)
                .expect("delete_inode: dinode");
        }

        for e in guard.extents.clone() {
            tx.bfree(e.startblkno, e.nblocks);
        }
        guard.size = 0;
        guard.extents.clear();
        guard.used = DINODE_AVAIL;

        drop(guard);
        drop(dp);
        self.irelease(root);
    }

    /// Look up and return the inode for a path name.
    pub fn namei(&self, path: &super::Path) -> Result<InodeRef, ()> {
        self.namex(path, false).map(|(ip, _)| ip)
    }

    /// Like `namei`, but stop one level early: return the parent
    /// directory and the final path element.
    pub fn nameiparent<'p>(
        &self,
        path: &'p super::Path,
    ) -> Result<(InodeRef, &'p FileName), ()> {
        let (ip, name) = self.namex(path, true)?;
        Ok((ip, name.expect("nameiparent")))
    }

    fn namex<'p>(
        &self,
        path: &'p super::Path,
        parent: bool,
    ) -> Result<(InodeRef, Option<&'p FileName>), ()> {
        let mut ip = self.iget(ROOTDEV, ROOTINO);
        let mut path = path;
        while let Some((rest, name)) = path.skipelem() {
            let mut guard = self.lock_inode(ip);
            if guard.typ != InodeType::Dir {
                drop(guard);
                self.irelease(ip);
                return Err(());
            }
            if parent && rest.is_empty_string() {
                // Stop one level early.
                drop(guard);
                return Ok((ip, Some(name)));
            }
            let next = guard.dirlookup(name);
            drop(guard);
            self.irelease(ip);
            match next {
                Ok((next, _)) => ip = next,
                Err(()) => return Err(()),
            }
            path = rest;
        }
        if parent {
            self.irelease(ip);
            return Err(());
        }
        Ok((ip, None))
    }

    /// Outstanding in-memory references to this inode's cache slot.
    pub(crate) fn inode_refcnt(&self, ip: InodeRef) -> u32 {
        self.itable.meta.lock()[ip.idx].refcnt
    }

    #[cfg(test)]
    pub(crate) fn invalidate_inode(&self, ip: InodeRef) {
        self.itable.meta.lock()[ip.idx].valid = false;
    }
}

impl InodeGuard<'_> {
    /// Copy stat information from the inode.
    pub fn stat(&self) -> Stat {
        Stat {
            dev: self.dev,
            ino: self.inum,
            typ: self.typ,
            size: self.size,
        }
    }

    /// Read data from the inode. Returns the number of bytes read,
    /// short when the read runs past the end of the file.
    pub fn read_bytes(&mut self, dst: &mut [u8], off: u32) -> Result<usize, ()> {
        let fs = self.fs;
        if self.typ == InodeType::Device {
            let devid = self.devid;
            if devid < 0 || devid as usize >= NDEV {
                return Err(());
            }
            let read = fs.devsw[devid as usize].read.ok_or(())?;
            return read(dst);
        }

        let size = self.size;
        let n = dst.len() as u32;
        if off > size || off.checked_add(n).is_none() {
            warn!("readi: offset {} out of range", off);
            return Err(());
        }
        let n = cmp::min(n, size - off);

        let mut tot = 0u32;
        let mut off = off;
        while tot < n {
            let blk = self
                .disk_block(off / BSIZE as u32)
                .expect("readi: missing block");
            let bp = fs.cache.read(blk);
            let begin = (off % BSIZE as u32) as usize;
            let m = cmp::min(n - tot, BSIZE as u32 - off % BSIZE as u32);
            dst[tot as usize..(tot + m) as usize]
                .copy_from_slice(&bp.data()[begin..begin + m as usize]);
            drop(bp);
            tot += m;
            off += m;
        }
        Ok(tot as usize)
    }

    /// Write data to the inode at the given offset, allocating a new
    /// extent if the data runs past the blocks already owned. Must be
    /// called inside a transaction; stages every touched block through
    /// the log and persists the inode's metadata when its size changes.
    pub fn write_bytes(
        &mut self,
        src: &[u8],
        off: u32,
        tx: &FsTransaction<'_>,
    ) -> Result<usize, ()> {
        let fs = self.fs;
        if self.typ == InodeType::Device {
            let devid = self.devid;
            if devid < 0 || devid as usize >= NDEV {
                return Err(());
            }
            let write = fs.devsw[devid as usize].write.ok_or(())?;
            return write(src);
        }

        if off.checked_add(src.len() as u32).is_none() {
            warn!("writei: offset overflow");
            return Err(());
        }

        let orig_off = off;
        let old_size = self.size;
        let mut off = off as usize;
        let mut n = src.len();
        let mut written = 0usize;

        // Fill blocks already covered by extents.
        while n > 0 {
            let blk = match self.disk_block((off / BSIZE) as u32) {
                Some(blk) => blk,
                None => break,
            };
            let mut bp = fs.cache.read(blk);
            let begin = off % BSIZE;
            let m = cmp::min(BSIZE - begin, n);
            bp.data_mut()[begin..begin + m].copy_from_slice(&src[written..written + m]);
            tx.write(bp);
            off += m;
            n -= m;
            written += m;
        }

        // Extend with one new extent covering the remainder. Blocks
        // between the current end of the file and the target offset are
        // allocated as padding and left unwritten.
        if n > 0 {
            let file_blks = self.block_count();
            let blk_padd = off / BSIZE - file_blks;
            let blk_data = n / BSIZE + 1;
            let startblkno = tx.balloc((blk_padd + blk_data) as u32);
            assert!(self.extents.len() < NEXTENT, "writei: out of extents");
            self.extents.push(Extent {
                startblkno,
                nblocks: (blk_padd + blk_data) as u32,
            });

            while n > 0 {
                let blk = self
                    .disk_block((off / BSIZE) as u32)
                    .expect("writei: missing block");
                let mut bp = fs.cache.read(blk);
                let begin = off % BSIZE;
                let m = cmp::min(BSIZE - begin, n);
                bp.data_mut()[begin..begin + m].copy_from_slice(&src[written..written + m]);
                tx.write(bp);
                off += m;
                n -= m;
                written += m;
            }
        }
        assert_eq!(n, 0, "writei: short extent write");

        self.size = cmp::max(self.size, orig_off + written as u32);
        if self.size != old_size {
            self.update(tx);
        }
        Ok(written)
    }

    /// Copy a modified in-memory inode back to the inodefile. The
    /// inodefile persists its own dinode through the guard already
    /// held, which bounds the recursion in `write_bytes`.
    pub fn update(&mut self, tx: &FsTransaction<'_>) {
        let fs = self.fs;
        let din = self.to_dinode();
        if self.inum == INODEFILEINO {
            self.write_obj(&din, inodeoff(INODEFILEINO), tx)
                .expect("inode update");
        } else {
            let mut ifile = fs.lock_inodefile();
            ifile
                .write_obj(&din, inodeoff(self.inum), tx)
                .expect("inode update");
        }
    }

    /// Read one fixed-size record at the given offset.
    pub fn read_obj<T: AsBytes + FromBytes>(&mut self, obj: &mut T, off: u32) -> Result<(), ()> {
        let n = self.read_bytes(obj.as_bytes_mut(), off)?;
        if n == mem::size_of::<T>() {
            Ok(())
        } else {
            Err(())
        }
    }

    /// Write one fixed-size record at the given offset.
    pub fn write_obj<T: AsBytes>(
        &mut self,
        obj: &T,
        off: u32,
        tx: &FsTransaction<'_>,
    ) -> Result<(), ()> {
        let n = self.write_bytes(obj.as_bytes(), off, tx)?;
        if n == mem::size_of::<T>() {
            Ok(())
        } else {
            Err(())
        }
    }

    /// Look for a directory entry in a directory. If found, returns a
    /// referenced handle and the entry's byte offset.
    pub fn dirlookup(&mut self, name: &FileName) -> Result<(InodeRef, u32), ()> {
        assert_eq!(self.typ, InodeType::Dir, "dirlookup not DIR");
        for off in (0..self.size).step_by(DIRENT_SIZE) {
            let mut de = Dirent::default();
            self.read_obj(&mut de, off).expect("dirlookup read");
            if de.inum != 0 && de.name() == name {
                return Ok((self.fs.iget(self.dev, de.inum as u32), off));
            }
        }
        Err(())
    }

    /// Write a new directory entry (name, inum) into the directory,
    /// reusing a free entry if one exists.
    pub fn dirlink(
        &mut self,
        name: &FileName,
        inum: u32,
        tx: &FsTransaction<'_>,
    ) -> Result<(), ()> {
        let fs = self.fs;

        // Check that name is not present.
        if let Ok((ip, _)) = self.dirlookup(name) {
            fs.irelease(ip);
            return Err(());
        }

        let mut off = self.size;
        for o in (0..self.size).step_by(DIRENT_SIZE) {
            let mut de = Dirent::default();
            self.read_obj(&mut de, o).expect("dirlink read");
            if de.inum == 0 {
                off = o;
                break;
            }
        }

        let mut de = Dirent::default();
        de.inum = inum as u16;
        de.set_name(name);
        self.write_obj(&de, off, tx).expect("dirlink");
        Ok(())
    }
}
