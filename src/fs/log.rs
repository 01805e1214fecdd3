//! Redo write-ahead log.
//!
//! A transaction stages whole-block writes in a dedicated log region
//! before any of them reaches its home location. The on-disk header's
//! valid flag is the single atomicity point: a crash before the flag is
//! set leaves every home block untouched, a crash after it is recovered
//! on the next mount by replaying the staged copies. Replay is
//! idempotent, so a crash during replay is also harmless.
//!
//! The log holds one transaction at a time. Staging is synchronous: each
//! `write` copies the block into the log region and rewrites the header
//! before returning.

use core::mem;

use arrayvec::ArrayVec;
use itertools::izip;
use static_assertions::const_assert;
use zerocopy::{AsBytes, FromBytes};

use crate::bio::{Bcache, Buf};
use crate::param::{BSIZE, MAX_LOG_BLOCKS};

const TX_INVALID: u32 = 0;
const TX_VALID: u32 = 1;

/// Contents of the header block.
#[repr(C)]
#[derive(AsBytes, FromBytes)]
struct LogHeader {
    valid_flag: u32,
    size: u32,
    disk_loc: [u32; MAX_LOG_BLOCKS],
}

const_assert!(mem::size_of::<LogHeader>() <= BSIZE);

impl Default for LogHeader {
    fn default() -> Self {
        Self {
            valid_flag: TX_INVALID,
            size: 0,
            disk_loc: [0; MAX_LOG_BLOCKS],
        }
    }
}

/// In-memory view of the log. The on-disk header only distinguishes
/// invalid from committed; the staging list lives here.
enum LogState {
    Idle,
    Staging(ArrayVec<u32, MAX_LOG_BLOCKS>),
}

pub struct Log {
    /// Block number of the header; staged blocks follow it.
    start: u32,
    state: LogState,
}

impl Log {
    /// Attach to the log region and replay any committed transaction
    /// left behind by a crash.
    pub fn new(start: u32, cache: &Bcache) -> Self {
        let mut log = Self {
            start,
            state: LogState::Idle,
        };
        log.recover(cache);
        log
    }

    fn read_head(&self, cache: &Bcache) -> LogHeader {
        let bp = cache.read(self.start);
        let mut head = LogHeader::default();
        head.as_bytes_mut()
            .copy_from_slice(&bp.data()[..mem::size_of::<LogHeader>()]);
        head
    }

    fn write_head(&self, cache: &Bcache, head: &LogHeader) {
        let mut bp = cache.read(self.start);
        bp.data_mut()[..mem::size_of::<LogHeader>()].copy_from_slice(head.as_bytes());
        bp.write();
    }

    /// Copy staged blocks from the log region to their home locations.
    fn install(&self, cache: &Bcache, locs: &[u32]) {
        for (tail, loc) in locs.iter().enumerate() {
            let lbuf = cache.read(self.start + 1 + tail as u32);
            let mut dbuf = cache.read(*loc);
            dbuf.data_mut().copy_from_slice(lbuf.data());
            dbuf.write();
        }
    }

    /// If the header records a committed transaction, replay it; either
    /// way leave the header invalid.
    pub fn recover(&mut self, cache: &Bcache) {
        let head = self.read_head(cache);
        if head.valid_flag == TX_VALID {
            assert!(
                head.size as usize <= MAX_LOG_BLOCKS,
                "log: corrupt header size"
            );
            self.install(cache, &head.disk_loc[..head.size as usize]);
        }
        self.write_head(cache, &LogHeader::default());
    }

    /// Start a transaction by resetting the on-disk header.
    pub fn begin_tx(&mut self, cache: &Bcache) {
        assert!(
            matches!(self.state, LogState::Idle),
            "log: nested transaction"
        );
        self.write_head(cache, &LogHeader::default());
        self.state = LogState::Staging(ArrayVec::new());
    }

    /// Stage a modified buffer: copy its contents into the next log
    /// block and record its home location in the header, both
    /// synchronously. The home buffer itself stays dirty in the cache
    /// until commit installs it.
    pub fn write(&mut self, cache: &Bcache, buf: Buf) {
        let locs = match &mut self.state {
            LogState::Staging(locs) => locs,
            LogState::Idle => panic!("log: write outside of transaction"),
        };
        assert!(locs.len() < MAX_LOG_BLOCKS, "log: too big a transaction");

        let mut lbuf = cache.read(self.start + 1 + locs.len() as u32);
        lbuf.data_mut().copy_from_slice(buf.data());
        lbuf.write();
        drop(lbuf);

        locs.push(buf.blockno());
        buf.set_dirty();
        drop(buf);

        let mut head = LogHeader::default();
        head.size = match &self.state {
            LogState::Staging(locs) => {
                for (dst, src) in izip!(&mut head.disk_loc, locs) {
                    *dst = *src;
                }
                locs.len() as u32
            }
            LogState::Idle => unreachable!(),
        };
        self.write_head(cache, &head);
    }

    /// Commit: flip the header valid (the atomicity point), install the
    /// staged blocks, then flip it back.
    pub fn commit(&mut self, cache: &Bcache) {
        let locs = match mem::replace(&mut self.state, LogState::Idle) {
            LogState::Staging(locs) => locs,
            LogState::Idle => panic!("log: commit outside of transaction"),
        };
        assert!(locs.len() <= MAX_LOG_BLOCKS, "log: too big a transaction");

        let mut head = LogHeader::default();
        head.valid_flag = TX_VALID;
        head.size = locs.len() as u32;
        for (dst, src) in izip!(&mut head.disk_loc, &locs) {
            *dst = *src;
        }
        self.write_head(cache, &head);

        self.install(cache, &locs);

        self.write_head(cache, &LogHeader::default());
    }
}
