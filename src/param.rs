/// Open files per process.
pub const NOFILE: usize = 16;

/// Open files per system.
pub const NFILE: usize = 100;

/// Maximum number of active i-nodes.
pub const NINODE: usize = 50;

/// Maximum major device number.
pub const NDEV: usize = 10;

/// Device number of file system root disk.
pub const ROOTDEV: u32 = 1;

/// Block size.
pub const BSIZE: usize = 512;

/// Max data blocks in the on-disk log.
pub const MAX_LOG_BLOCKS: usize = 29;

/// Size of disk block cache.
pub const NBUF: usize = MAX_LOG_BLOCKS * 3;

/// Maximum file path name.
pub const MAXPATH: usize = 128;
