//! Support structures for system calls that involve file descriptors.

use std::sync::Arc;

use array_macro::array;

use crate::fcntl::AccessMode;
use crate::fs::InodeRef;
use crate::lock::SleepLock;
use crate::param::{NFILE, NOFILE};
use crate::pipe::Pipe;

/// Map a device id to device functions.
#[derive(Copy, Clone, Default)]
pub struct Devsw {
    pub read: Option<fn(&mut [u8]) -> Result<usize, ()>>,
    pub write: Option<fn(&[u8]) -> Result<usize, ()>>,
}

/// What an open-file entry is bound to.
#[derive(Clone)]
pub(crate) enum FileKind {
    None,
    Inode { ip: InodeRef },
    Pipe { pipe: Arc<Pipe> },
}

/// A process-shared open-file entry: an inode or pipe, an access mode,
/// and a byte offset. A slot is free iff `ref_count` is zero.
pub(crate) struct File {
    pub kind: FileKind,
    pub mode: AccessMode,
    pub offset: u32,
    pub ref_count: u32,
}

impl File {
    pub fn free() -> Self {
        Self {
            kind: FileKind::None,
            mode: AccessMode::ReadOnly,
            offset: 0,
            ref_count: 0,
        }
    }

    pub fn in_use(&self) -> bool {
        self.ref_count > 0
    }
}

/// The system-wide open-file table. Its sleep lock is the coarse lock
/// taken at file-syscall entry and released at syscall return; pipe
/// reads and writes drop it before blocking.
pub(crate) struct FileTable {
    pub inner: SleepLock<[File; NFILE]>,
}

impl FileTable {
    pub fn new() -> Self {
        Self {
            inner: SleepLock::new("global_files", array![_ => File::free(); NFILE]),
        }
    }
}

/// Per-process descriptor table; the index is the file descriptor
/// integer. A slot is free iff `None`.
pub struct Proc {
    pub(crate) fds: [Option<usize>; NOFILE],
}

impl Proc {
    pub fn new() -> Self {
        Self {
            fds: [None; NOFILE],
        }
    }
}

impl Default for Proc {
    fn default() -> Self {
        Self::new()
    }
}
