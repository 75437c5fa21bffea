use alloc::vec::Vec;
use spin::Mutex;

use super::BlockDev;
use crate::errno::{Errno, KResult};
use crate::memory::PAGE_SIZE;

/// Default capacity of a boot-time ram disk, in blocks.
pub const DISK_BLOCKS: usize = 64;

/// Memory-backed block device standing in for a real disk driver.
pub struct RamDisk {
    blocks: Mutex<Vec<u8>>,
    nblocks: usize,
}

impl RamDisk {
    pub fn new(nblocks: usize) -> RamDisk {
        RamDisk {
            blocks: Mutex::new(alloc::vec![0u8; nblocks * PAGE_SIZE]),
            nblocks,
        }
    }
}

impl BlockDev for RamDisk {
    fn read_block(&self, block: usize, buf: &mut [u8]) -> KResult<()> {
        if block >= self.nblocks {
            return Err(Errno::EINVAL);
        }
        debug_assert!(buf.len() >= PAGE_SIZE);
        let blocks = self.blocks.lock();
        buf[..PAGE_SIZE].copy_from_slice(&blocks[block * PAGE_SIZE..(block + 1) * PAGE_SIZE]);
        Ok(())
    }

    fn write_block(&self, block: usize, buf: &[u8]) -> KResult<()> {
        if block >= self.nblocks {
            return Err(Errno::EINVAL);
        }
        debug_assert!(buf.len() >= PAGE_SIZE);
        let mut blocks = self.blocks.lock();
        blocks[block * PAGE_SIZE..(block + 1) * PAGE_SIZE].copy_from_slice(&buf[..PAGE_SIZE]);
        Ok(())
    }

    fn block_count(&self) -> usize {
        self.nblocks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_round_trip() {
        let disk = RamDisk::new(4);
        let mut block = alloc::vec![0u8; PAGE_SIZE];
        block[0] = 0xAB;
        block[PAGE_SIZE - 1] = 0xCD;
        disk.write_block(2, &block).unwrap();

        let mut back = alloc::vec![0u8; PAGE_SIZE];
        disk.read_block(2, &mut back).unwrap();
        assert_eq!(back, block);

        assert_eq!(disk.read_block(4, &mut back), Err(Errno::EINVAL));
        assert_eq!(disk.block_count(), 4);
    }
}
