//! File-system system calls: argument checking and open-file table
//! bookkeeping. The heavy lifting lives in `fs` and `pipe`.
//!
//! Every operation takes the open-file table's sleep lock at entry and
//! holds it until return; pipe reads and writes drop it before they can
//! block so a full or empty pipe does not stall unrelated syscalls.

use core::cmp;
use core::mem;

use log::warn;
use std::sync::Arc;

use crate::fcntl::{AccessMode, OpenFlags};
use crate::file::{File, FileKind, Proc};
use crate::fs::{FileSystem, Path};
use crate::param::{BSIZE, MAX_LOG_BLOCKS};
use crate::pipe::Pipe;
use crate::stat::{InodeType, Stat};

/// Cap on bytes written per transaction, so one transaction's data
/// blocks, bitmap block, dinode write, and a possible inodefile growth
/// chain all fit in the log.
const MAXWRITE: usize = (MAX_LOG_BLOCKS - 8) * BSIZE;

/// The open-file slot a descriptor points at.
fn fd_slot(proc: &Proc, fd: usize) -> Result<usize, ()> {
    match proc.fds.get(fd).copied().flatten() {
        Some(slot) => Ok(slot),
        None => {
            warn!("bad file descriptor {}", fd);
            Err(())
        }
    }
}

impl FileSystem {
    /// Open the file at `path`, creating it first when `O_CREATE` is
    /// set, and bind it to the lowest free descriptor with offset 0.
    pub fn open(&self, proc: &mut Proc, path: &str, flags: OpenFlags) -> Result<usize, ()> {
        let mut table = self.ftable.inner.lock();
        let mode = flags.access_mode().map_err(|_| warn!("open: bad mode"))?;
        let path = Path::new(path);

        let ip = match self.namei(path) {
            Ok(ip) => ip,
            Err(()) => {
                if !flags.contains(OpenFlags::O_CREATE) {
                    warn!("open: path not found");
                    return Err(());
                }
                let (parent, name) = self.nameiparent(path)?;
                self.irelease(parent);
                self.create_inode(name)?
            }
        };

        if self.stati(ip).typ == InodeType::Dir && mode != AccessMode::ReadOnly {
            warn!("open: write mode on a directory");
            self.irelease(ip);
            return Err(());
        }

        let fd = match proc.fds.iter().position(|d| d.is_none()) {
            Some(fd) => fd,
            None => {
                warn!("open: too many open descriptors");
                self.irelease(ip);
                return Err(());
            }
        };
        let slot = match table.iter().position(|f| !f.in_use()) {
            Some(slot) => slot,
            None => {
                warn!("open: too many open files");
                self.irelease(ip);
                return Err(());
            }
        };

        // The entry owns the inode reference taken above.
        table[slot] = File {
            kind: FileKind::Inode { ip },
            mode,
            offset: 0,
            ref_count: 1,
        };
        proc.fds[fd] = Some(slot);
        Ok(fd)
    }

    /// Read up to `dst.len()` bytes from the descriptor's current
    /// position and advance it. Returns 0 at end of file.
    pub fn read(&self, proc: &mut Proc, fd: usize, dst: &mut [u8]) -> Result<usize, ()> {
        let table = self.ftable.inner.lock();
        let slot = fd_slot(proc, fd)?;
        let (kind, mode, offset) = {
            let file = &table[slot];
            (file.kind.clone(), file.mode, file.offset)
        };
        if !mode.readable() {
            warn!("read: descriptor not open for read");
            return Err(());
        }
        match kind {
            FileKind::Inode { ip } => {
                let mut table = table;
                let n = self.readi(ip, dst, offset)?;
                table[slot].offset += n as u32;
                Ok(n)
            }
            FileKind::Pipe { pipe } => {
                drop(table);
                pipe.read(dst)
            }
            FileKind::None => Err(()),
        }
    }

    /// Write `src` at the descriptor's current position and advance it
    /// by the number of bytes written.
    pub fn write(&self, proc: &mut Proc, fd: usize, src: &[u8]) -> Result<usize, ()> {
        let table = self.ftable.inner.lock();
        let slot = fd_slot(proc, fd)?;
        let (kind, mode, offset) = {
            let file = &table[slot];
            (file.kind.clone(), file.mode, file.offset)
        };
        if !mode.writable() {
            warn!("write: descriptor not open for write");
            return Err(());
        }
        match kind {
            FileKind::Inode { ip } => {
                let mut table = table;
                // A few blocks at a time, each in its own transaction,
                // to stay within the log's capacity.
                let mut written = 0;
                while written < src.len() {
                    let chunk = cmp::min(src.len() - written, MAXWRITE);
                    match self.writei(ip, &src[written..written + chunk], offset + written as u32)
                    {
                        Ok(n) => {
                            written += n;
                            if n < chunk {
                                break;
                            }
                        }
                        Err(()) => {
                            if written == 0 {
                                return Err(());
                            }
                            break;
                        }
                    }
                }
                table[slot].offset += written as u32;
                Ok(written)
            }
            FileKind::Pipe { pipe } => {
                drop(table);
                pipe.write(src)
            }
            FileKind::None => Err(()),
        }
    }

    /// Release the descriptor. The open-file entry is freed when its
    /// last descriptor closes; a file entry then drops its inode
    /// reference, a pipe entry its side of the pipe.
    pub fn close(&self, proc: &mut Proc, fd: usize) -> Result<(), ()> {
        let mut table = self.ftable.inner.lock();
        let slot = fd_slot(proc, fd)?;
        proc.fds[fd] = None;

        let file = &mut table[slot];
        assert!(file.ref_count >= 1, "close: free open-file entry");
        if let FileKind::Pipe { pipe } = &file.kind {
            pipe.close(file.mode.writable());
        }
        file.ref_count -= 1;
        if file.ref_count == 0 {
            let kind = mem::replace(&mut file.kind, FileKind::None);
            file.offset = 0;
            if let FileKind::Inode { ip } = kind {
                self.irelease(ip);
            }
            // A pipe's buffer is freed when its last reference drops.
        }
        Ok(())
    }

    /// Point a new descriptor (the lowest free one) at the same
    /// open-file entry.
    pub fn dup(&self, proc: &mut Proc, fd: usize) -> Result<usize, ()> {
        let mut table = self.ftable.inner.lock();
        let slot = fd_slot(proc, fd)?;
        let newfd = proc
            .fds
            .iter()
            .position(|d| d.is_none())
            .ok_or_else(|| warn!("dup: too many open descriptors"))?;

        let file = &mut table[slot];
        file.ref_count += 1;
        if let FileKind::Pipe { pipe } = &file.kind {
            pipe.add_ref(file.mode.writable());
        }
        proc.fds[newfd] = Some(slot);
        Ok(newfd)
    }

    /// Metadata of the descriptor's inode.
    pub fn fstat(&self, proc: &Proc, fd: usize) -> Result<Stat, ()> {
        let table = self.ftable.inner.lock();
        let slot = fd_slot(proc, fd)?;
        match &table[slot].kind {
            FileKind::Inode { ip } => Ok(self.stati(*ip)),
            _ => Err(()),
        }
    }

    /// Create a pipe and bind its read and write ends to the two lowest
    /// free descriptors, returned in that order.
    pub fn pipe(&self, proc: &mut Proc) -> Result<(usize, usize), ()> {
        let mut table = self.ftable.inner.lock();

        let (fd_read, fd_write) = {
            let mut free = proc
                .fds
                .iter()
                .enumerate()
                .filter(|(_, d)| d.is_none())
                .map(|(fd, _)| fd);
            match (free.next(), free.next()) {
                (Some(r), Some(w)) => (r, w),
                _ => {
                    warn!("pipe: too many open descriptors");
                    return Err(());
                }
            }
        };
        let (slot_read, slot_write) = {
            let mut free = table
                .iter()
                .enumerate()
                .filter(|(_, f)| !f.in_use())
                .map(|(slot, _)| slot);
            match (free.next(), free.next()) {
                (Some(r), Some(w)) => (r, w),
                _ => {
                    warn!("pipe: too many open files");
                    return Err(());
                }
            }
        };

        let pipe = Pipe::new();
        table[slot_read] = File {
            kind: FileKind::Pipe {
                pipe: Arc::clone(&pipe),
            },
            mode: AccessMode::ReadOnly,
            offset: 0,
            ref_count: 1,
        };
        table[slot_write] = File {
            kind: FileKind::Pipe { pipe },
            mode: AccessMode::WriteOnly,
            offset: 0,
            ref_count: 1,
        };
        proc.fds[fd_read] = Some(slot_read);
        proc.fds[fd_write] = Some(slot_write);
        Ok((fd_read, fd_write))
    }

    /// Remove the file at `path`: erase its directory entry, free its
    /// dinode and data blocks. Refuses while the file is open.
    pub fn unlink(&self, path: &str) -> Result<(), ()> {
        let _table = self.ftable.inner.lock();
        let ip = self
            .namei(Path::new(path))
            .map_err(|_| warn!("unlink: path not found"))?;

        if self.stati(ip).typ == InodeType::Dir {
            warn!("unlink: cannot unlink a directory");
            self.irelease(ip);
            return Err(());
        }
        if self.inode_refcnt(ip) > 1 {
            warn!("unlink: file is busy");
            self.irelease(ip);
            return Err(());
        }

        self.delete_inode(ip);
        self.irelease(ip);
        Ok(())
    }

    /// Duplicate a descriptor table the way fork inherits descriptors:
    /// the child shares every open-file entry, whose reference counts
    /// (and pipe side counts) grow accordingly.
    pub fn fork_descriptors(&self, parent: &Proc) -> Proc {
        let mut table = self.ftable.inner.lock();
        let mut child = Proc::new();
        for (fd, slot) in parent.fds.iter().enumerate() {
            if let Some(slot) = *slot {
                let file = &mut table[slot];
                file.ref_count += 1;
                if let FileKind::Pipe { pipe } = &file.kind {
                    pipe.add_ref(file.mode.writable());
                }
                child.fds[fd] = Some(slot);
            }
        }
        child
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::Devsw;
    use crate::fs::{inodeoff, Dinode, FileName};
    use crate::param::NOFILE;
    use crate::pipe::MAX_PIPE_SIZE;
    use crate::test_util::test_fs;
    use std::thread;

    fn rdwr_create() -> OpenFlags {
        OpenFlags::O_RDWR | OpenFlags::O_CREATE
    }

    #[test]
    fn open_missing_file_fails() {
        let fs = test_fs(2048);
        let mut proc = Proc::new();
        assert_eq!(fs.open(&mut proc, "/nope", OpenFlags::O_RDONLY), Err(()));
    }

    #[test]
    fn extent_extension_on_first_write() {
        let fs = test_fs(2048);
        let mut proc = Proc::new();
        let fd = fs.open(&mut proc, "/x", rdwr_create()).unwrap();

        let data = [b'A'; 800];
        assert_eq!(fs.write(&mut proc, fd, &data), Ok(800));
        assert_eq!(fs.fstat(&proc, fd).unwrap().size, 800);

        // One two-block extent covers the 800 bytes.
        let ip = fs.namei(Path::new("/x")).unwrap();
        {
            let guard = fs.lock_inode(ip);
            assert_eq!(guard.extents.len(), 1);
            assert_eq!(guard.extents[0].nblocks, 2);
        }
        fs.irelease(ip);
    }

    #[test]
    fn write_beyond_end_appends_padding_extent() {
        let fs = test_fs(2048);
        let mut proc = Proc::new();
        let fd = fs.open(&mut proc, "/x", rdwr_create()).unwrap();
        assert_eq!(fs.write(&mut proc, fd, &[b'A'; 800]), Ok(800));

        let ip = fs.namei(Path::new("/x")).unwrap();
        assert_eq!(fs.writei(ip, &[b'B'; 100], 5000), Ok(100));
        assert_eq!(fs.stati(ip).size, 5100);
        {
            let guard = fs.lock_inode(ip);
            assert_eq!(guard.extents.len(), 2);
            // Logical blocks 2..=8 are padding, block 9 holds the data.
            assert_eq!(guard.extents[1].nblocks, 8);
        }

        // The gap reads back, the data is where it was put.
        let mut out = [0u8; 100];
        assert_eq!(fs.readi(ip, &mut out, 5000), Ok(100));
        assert_eq!(out, [b'B'; 100]);
        fs.irelease(ip);
    }

    #[test]
    #[should_panic(expected = "out of extents")]
    fn thirty_first_extent_is_fatal() {
        let fs = test_fs(4096);
        let ip = fs.create_inode(FileName::new(b"wall")).unwrap();
        for _ in 0..31 {
            let off = {
                let guard = fs.lock_inode(ip);
                (guard.block_count() as u32 + 1) * BSIZE as u32
            };
            // Skipping one block past the end forces a fresh extent.
            fs.writei(ip, &[7], off).unwrap();
        }
    }

    #[test]
    fn read_after_write_round_trips() {
        let fs = test_fs(2048);
        let mut proc = Proc::new();
        let fd = fs.open(&mut proc, "/rw", rdwr_create()).unwrap();
        let data: Vec<u8> = (0..1500u32).map(|i| i as u8).collect();
        assert_eq!(fs.write(&mut proc, fd, &data), Ok(1500));
        fs.close(&mut proc, fd).unwrap();

        let fd = fs.open(&mut proc, "/rw", OpenFlags::O_RDONLY).unwrap();
        let mut out = vec![0u8; 1500];
        assert_eq!(fs.read(&mut proc, fd, &mut out), Ok(1500));
        assert_eq!(out, data);

        // Short read past the end, then 0 at end of file.
        let mut more = [0u8; 64];
        assert_eq!(fs.read(&mut proc, fd, &mut more), Ok(0));
    }

    #[test]
    fn large_write_spans_transactions() {
        let fs = test_fs(4096);
        let mut proc = Proc::new();
        let fd = fs.open(&mut proc, "/big", rdwr_create()).unwrap();
        let data: Vec<u8> = (0..20480u32).map(|i| (i % 251) as u8).collect();
        assert_eq!(fs.write(&mut proc, fd, &data), Ok(20480));
        assert_eq!(fs.fstat(&proc, fd).unwrap().size, 20480);
        fs.close(&mut proc, fd).unwrap();

        let fd = fs.open(&mut proc, "/big", OpenFlags::O_RDONLY).unwrap();
        let mut out = vec![0u8; 20480];
        assert_eq!(fs.read(&mut proc, fd, &mut out), Ok(20480));
        assert_eq!(out, data);
    }

    #[test]
    fn access_modes_are_enforced() {
        let fs = test_fs(2048);
        let mut proc = Proc::new();
        let fd = fs.open(&mut proc, "/m", rdwr_create()).unwrap();
        fs.write(&mut proc, fd, b"data").unwrap();
        fs.close(&mut proc, fd).unwrap();

        let fd = fs.open(&mut proc, "/m", OpenFlags::O_RDONLY).unwrap();
        assert_eq!(fs.write(&mut proc, fd, b"no"), Err(()));
        fs.close(&mut proc, fd).unwrap();

        let fd = fs.open(&mut proc, "/m", OpenFlags::O_WRONLY).unwrap();
        let mut out = [0u8; 4];
        assert_eq!(fs.read(&mut proc, fd, &mut out), Err(()));
        fs.close(&mut proc, fd).unwrap();

        // Directories only open read-only.
        assert_eq!(fs.open(&mut proc, "/", OpenFlags::O_RDWR), Err(()));
        let fd = fs.open(&mut proc, "/", OpenFlags::O_RDONLY).unwrap();
        fs.close(&mut proc, fd).unwrap();
    }

    #[test]
    fn dup_shares_the_offset() {
        let fs = test_fs(2048);
        let mut proc = Proc::new();
        let fd = fs.open(&mut proc, "/d", rdwr_create()).unwrap();
        fs.write(&mut proc, fd, b"abcdef").unwrap();
        fs.close(&mut proc, fd).unwrap();

        let fd = fs.open(&mut proc, "/d", OpenFlags::O_RDONLY).unwrap();
        let fd2 = fs.dup(&mut proc, fd).unwrap();
        assert_ne!(fd, fd2);

        let mut out = [0u8; 3];
        assert_eq!(fs.read(&mut proc, fd, &mut out), Ok(3));
        assert_eq!(&out, b"abc");
        assert_eq!(fs.read(&mut proc, fd2, &mut out), Ok(3));
        assert_eq!(&out, b"def");

        // The entry survives until the last descriptor closes.
        fs.close(&mut proc, fd).unwrap();
        assert_eq!(fs.fstat(&proc, fd2).unwrap().size, 6);
        fs.close(&mut proc, fd2).unwrap();
    }

    #[test]
    fn lowest_free_descriptor_is_reused() {
        let fs = test_fs(2048);
        let mut proc = Proc::new();
        let a = fs.open(&mut proc, "/a", rdwr_create()).unwrap();
        let b = fs.open(&mut proc, "/b", rdwr_create()).unwrap();
        assert_eq!((a, b), (0, 1));

        fs.close(&mut proc, a).unwrap();
        let c = fs.open(&mut proc, "/c", rdwr_create()).unwrap();
        assert_eq!(c, a);
        fs.close(&mut proc, b).unwrap();
        fs.close(&mut proc, c).unwrap();
    }

    #[test]
    fn descriptor_table_exhaustion_fails() {
        let fs = test_fs(4096);
        let mut proc = Proc::new();
        for i in 0..NOFILE {
            let name = format!("/f{}", i);
            assert_eq!(fs.open(&mut proc, &name, rdwr_create()), Ok(i));
        }
        assert_eq!(fs.open(&mut proc, "/overflow", rdwr_create()), Err(()));
    }

    #[test]
    fn unlink_frees_the_name_and_blocks() {
        let fs = test_fs(2048);
        let mut proc = Proc::new();
        let fd = fs.open(&mut proc, "/gone", rdwr_create()).unwrap();
        fs.write(&mut proc, fd, &[9u8; 3000]).unwrap();

        // Busy while open.
        assert_eq!(fs.unlink("/gone"), Err(()));
        fs.close(&mut proc, fd).unwrap();

        assert_eq!(fs.unlink("/gone"), Ok(()));
        assert_eq!(fs.open(&mut proc, "/gone", OpenFlags::O_RDONLY), Err(()));
        assert_eq!(fs.unlink("/gone"), Err(()));
        assert_eq!(fs.unlink("/"), Err(()));

        // The freed dinode slot and data blocks serve the next file.
        let fd = fs.open(&mut proc, "/next", rdwr_create()).unwrap();
        fs.write(&mut proc, fd, b"reuse").unwrap();
        let mut out = [0u8; 5];
        let fd2 = fs.open(&mut proc, "/next", OpenFlags::O_RDONLY).unwrap();
        assert_eq!(fs.read(&mut proc, fd2, &mut out), Ok(5));
        assert_eq!(&out, b"reuse");
    }

    #[test]
    fn pipe_returns_eof_after_writers_close() {
        let fs = std::sync::Arc::new(test_fs(2048));
        let mut parent = Proc::new();
        let (r, w) = fs.pipe(&mut parent).unwrap();
        assert_eq!(fs.write(&mut parent, w, b"hi"), Ok(2));

        let mut child = fs.fork_descriptors(&parent);
        fs.close(&mut parent, w).unwrap();
        fs.close(&mut parent, r).unwrap();

        let fs2 = std::sync::Arc::clone(&fs);
        let reader = thread::spawn(move || {
            fs2.close(&mut child, w).unwrap();
            let mut buf = [0u8; 100];
            let n = fs2.read(&mut child, r, &mut buf).unwrap();
            assert_eq!(&buf[..n], b"hi");
            let eof = fs2.read(&mut child, r, &mut buf).unwrap();
            fs2.close(&mut child, r).unwrap();
            (n, eof)
        });
        assert_eq!(reader.join().unwrap(), (2, 0));
    }

    #[test]
    fn pipe_write_fails_with_no_readers() {
        let fs = test_fs(2048);
        let mut proc = Proc::new();
        let (r, w) = fs.pipe(&mut proc).unwrap();
        fs.close(&mut proc, r).unwrap();
        assert_eq!(fs.write(&mut proc, w, b"dead"), Err(()));
        fs.close(&mut proc, w).unwrap();
    }

    #[test]
    fn pipe_read_mode_checks() {
        let fs = test_fs(2048);
        let mut proc = Proc::new();
        let (r, w) = fs.pipe(&mut proc).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(fs.read(&mut proc, w, &mut buf), Err(()));
        assert_eq!(fs.write(&mut proc, r, b"x"), Err(()));
        assert_eq!(fs.fstat(&proc, r), Err(()));
        fs.close(&mut proc, r).unwrap();
        fs.close(&mut proc, w).unwrap();
    }

    #[test]
    fn pipe_streams_more_than_its_capacity() {
        let fs = std::sync::Arc::new(test_fs(2048));
        let mut parent = Proc::new();
        let (r, w) = fs.pipe(&mut parent).unwrap();
        let mut child = fs.fork_descriptors(&parent);
        fs.close(&mut parent, w).unwrap();

        let data: Vec<u8> = (0..MAX_PIPE_SIZE + 500).map(|i| (i % 249) as u8).collect();
        let expect = data.clone();
        let fs2 = std::sync::Arc::clone(&fs);
        let writer = thread::spawn(move || {
            fs2.close(&mut child, r).unwrap();
            let n = fs2.write(&mut child, w, &data).unwrap();
            fs2.close(&mut child, w).unwrap();
            n
        });

        let mut out = vec![0u8; MAX_PIPE_SIZE + 500];
        assert_eq!(fs.read(&mut parent, r, &mut out), Ok(MAX_PIPE_SIZE + 500));
        assert_eq!(out, expect);
        assert_eq!(writer.join().unwrap(), MAX_PIPE_SIZE + 500);
        fs.close(&mut parent, r).unwrap();
    }

    static DEV_LOG: spin::Mutex<Vec<u8>> = spin::Mutex::new(Vec::new());

    fn dev_read(dst: &mut [u8]) -> Result<usize, ()> {
        let msg = b"tty";
        let n = core::cmp::min(dst.len(), msg.len());
        dst[..n].copy_from_slice(&msg[..n]);
        Ok(n)
    }

    fn dev_write(src: &[u8]) -> Result<usize, ()> {
        DEV_LOG.lock().extend_from_slice(src);
        Ok(src.len())
    }

    #[test]
    fn device_inodes_dispatch_through_devsw() {
        let mut fs = test_fs(2048);
        fs.set_device(
            5,
            Devsw {
                read: Some(dev_read),
                write: Some(dev_write),
            },
        );

        // Turn a fresh file into a device inode on disk.
        let ip = fs.create_inode(FileName::new(b"console")).unwrap();
        {
            let tx = fs.begin_transaction();
            let mut ifile = fs.lock_inodefile();
            let mut din = Dinode::default();
            ifile.read_obj(&mut din, inodeoff(ip.inum)).unwrap();
            din.typ = InodeType::Device.as_raw();
            din.devid = 5;
            ifile.write_obj(&din, inodeoff(ip.inum), &tx).unwrap();
        }
        fs.invalidate_inode(ip);
        fs.irelease(ip);

        let mut proc = Proc::new();
        let fd = fs.open(&mut proc, "/console", OpenFlags::O_RDWR).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(fs.read(&mut proc, fd, &mut buf), Ok(3));
        assert_eq!(&buf[..3], b"tty");
        assert_eq!(fs.write(&mut proc, fd, b"hello"), Ok(5));
        assert_eq!(DEV_LOG.lock().as_slice(), b"hello");
        fs.close(&mut proc, fd).unwrap();
    }
}
