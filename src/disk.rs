//! The block-device contract the file system is written against, plus an
//! in-memory device for tests and tooling.

use crate::param::BSIZE;

pub type BlockData = [u8; BSIZE];

/// Random read/write access to fixed-size blocks. The file system issues
/// every disk access through this trait; durability of a `write_block`
/// that has returned is the device's promise.
pub trait BlockDevice: Send + Sync {
    fn read_block(&self, blockno: u32, data: &mut BlockData);
    fn write_block(&self, blockno: u32, data: &BlockData);
}

/// A RAM-backed block device.
pub struct MemDisk {
    blocks: spin::Mutex<Vec<BlockData>>,
}

impl MemDisk {
    pub fn new(nblocks: usize) -> Self {
        Self {
            blocks: spin::Mutex::new(vec![[0; BSIZE]; nblocks]),
        }
    }

    pub fn from_image(image: Vec<BlockData>) -> Self {
        Self {
            blocks: spin::Mutex::new(image),
        }
    }

    /// Copy of the full disk contents, e.g. to restart on a snapshot.
    pub fn image(&self) -> Vec<BlockData> {
        self.blocks.lock().clone()
    }
}

impl BlockDevice for MemDisk {
    fn read_block(&self, blockno: u32, data: &mut BlockData) {
        data.copy_from_slice(&self.blocks.lock()[blockno as usize]);
    }

    fn write_block(&self, blockno: u32, data: &BlockData) {
        self.blocks.lock()[blockno as usize].copy_from_slice(data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_back_what_was_written() {
        let disk = MemDisk::new(8);
        let mut data = [0u8; BSIZE];
        data[0] = 0xAB;
        data[BSIZE - 1] = 0xCD;
        disk.write_block(3, &data);

        let mut out = [0u8; BSIZE];
        disk.read_block(3, &mut out);
        assert_eq!(out[0], 0xAB);
        assert_eq!(out[BSIZE - 1], 0xCD);

        disk.read_block(2, &mut out);
        assert_eq!(out, [0u8; BSIZE]);
    }

    #[test]
    fn image_round_trip() {
        let disk = MemDisk::new(4);
        let mut data = [7u8; BSIZE];
        data[9] = 9;
        disk.write_block(1, &data);

        let clone = MemDisk::from_image(disk.image());
        let mut out = [0u8; BSIZE];
        clone.read_block(1, &mut out);
        assert_eq!(out, data);
    }
}
