//! Buffer cache.
//!
//! The cache holds one copy of each recently used disk block and
//! serializes access to it with a per-buffer sleep lock. A buffer whose
//! contents have been modified under a transaction is marked dirty and
//! pinned in the cache until the log installs it at its home location;
//! only clean, unreferenced buffers are eligible for eviction.

use core::cell::UnsafeCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::disk::{BlockData, BlockDevice};
use crate::lock::RawSleepLock;
use crate::param::{BSIZE, NBUF};

struct BufInner {
    /// Has data been read from disk?
    valid: bool,
    data: BlockData,
}

pub struct BufEntry {
    blockno: u32,

    /// Modified since last written to disk; pinned until then.
    dirty: AtomicBool,
    lock: RawSleepLock,
    inner: UnsafeCell<BufInner>,
}

// `inner` is only accessed while `lock` is held.
unsafe impl Send for BufEntry {}
unsafe impl Sync for BufEntry {}

/// A locked buffer. Dropping it releases the buffer (`brelse`).
pub struct Buf {
    entry: Arc<BufEntry>,
    dev: Arc<dyn BlockDevice>,
}

impl Buf {
    pub fn blockno(&self) -> u32 {
        self.entry.blockno
    }

    pub fn data(&self) -> &BlockData {
        // SAFETY: the buffer lock is held for self's lifetime.
        unsafe { &(*self.entry.inner.get()).data }
    }

    pub fn data_mut(&mut self) -> &mut BlockData {
        // SAFETY: the buffer lock is held for self's lifetime.
        unsafe { &mut (*self.entry.inner.get()).data }
    }

    /// Write the buffer's contents through to disk and unpin it.
    pub fn write(&mut self) {
        self.dev.write_block(self.entry.blockno, self.data());
        self.entry.dirty.store(false, Ordering::Release);
    }

    /// Pin the buffer in the cache until a later `write`.
    pub fn set_dirty(&self) {
        self.entry.dirty.store(true, Ordering::Release);
    }
}

impl Drop for Buf {
    fn drop(&mut self) {
        self.entry.lock.release();
    }
}

pub struct Bcache {
    dev: Arc<dyn BlockDevice>,
    entries: spin::Mutex<HashMap<u32, Arc<BufEntry>>>,
}

impl Bcache {
    pub fn new(dev: Arc<dyn BlockDevice>) -> Self {
        Self {
            dev,
            entries: spin::Mutex::new(HashMap::new()),
        }
    }

    /// Return a locked buffer with the contents of the given block.
    pub fn read(&self, blockno: u32) -> Buf {
        let entry = {
            let mut entries = self.entries.lock();
            if entries.len() >= NBUF && !entries.contains_key(&blockno) {
                Self::evict(&mut entries);
            }
            Arc::clone(entries.entry(blockno).or_insert_with(|| {
                Arc::new(BufEntry {
                    blockno,
                    dirty: AtomicBool::new(false),
                    lock: RawSleepLock::new("buf"),
                    inner: UnsafeCell::new(BufInner {
                        valid: false,
                        data: [0; BSIZE],
                    }),
                })
            }))
        };

        entry.lock.acquire();
        // SAFETY: the buffer lock was just acquired.
        let inner = unsafe { &mut *entry.inner.get() };
        if !inner.valid {
            self.dev.read_block(blockno, &mut inner.data);
            inner.valid = true;
        }
        Buf {
            entry,
            dev: Arc::clone(&self.dev),
        }
    }

    /// Drop one clean, unreferenced buffer. Dirty buffers stay pinned;
    /// if every buffer is pinned or in use the cache simply grows.
    fn evict(entries: &mut HashMap<u32, Arc<BufEntry>>) {
        let victim = entries
            .iter()
            .find(|(_, e)| Arc::strong_count(e) == 1 && !e.dirty.load(Ordering::Acquire))
            .map(|(blockno, _)| *blockno);
        if let Some(blockno) = victim {
            entries.remove(&blockno);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::MemDisk;

    fn cache(nblocks: usize) -> Bcache {
        Bcache::new(Arc::new(MemDisk::new(nblocks)))
    }

    #[test]
    fn modified_buffer_is_visible_before_disk_write() {
        let cache = cache(16);
        {
            let mut buf = cache.read(5);
            buf.data_mut()[0] = 42;
            buf.set_dirty();
        }
        // Same cached copy, not the (still zero) disk block.
        let buf = cache.read(5);
        assert_eq!(buf.data()[0], 42);
    }

    #[test]
    fn write_reaches_the_device() {
        let disk = Arc::new(MemDisk::new(16));
        let cache = Bcache::new(disk.clone());
        {
            let mut buf = cache.read(7);
            buf.data_mut()[10] = 9;
            buf.write();
        }
        let mut out = [0u8; BSIZE];
        disk.read_block(7, &mut out);
        assert_eq!(out[10], 9);
    }

    #[test]
    fn dirty_buffers_survive_eviction_pressure() {
        let cache = cache(NBUF * 4);
        {
            let mut buf = cache.read(1);
            buf.data_mut()[0] = 0xEE;
            buf.set_dirty();
        }
        // Touch enough other blocks to force evictions.
        for b in 8..8 + 2 * NBUF as u32 {
            let _ = cache.read(b);
        }
        let buf = cache.read(1);
        assert_eq!(buf.data()[0], 0xEE, "dirty block was evicted");
    }
}
