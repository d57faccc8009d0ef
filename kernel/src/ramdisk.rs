//! An in-memory block device.
//!
//! The buffer cache's job is to mediate block I/O behind a
//! [`BlockDevice`] boundary; what sits on the other side of that boundary
//! is a real disk driver on real hardware. This one just owns a byte
//! array, which is enough to exercise and demonstrate the cache without
//! pulling in an MMIO transport driver.

use alloc::boxed::Box;

use block_io::BlockDevice;
use kernel_params::BSIZE;

use crate::{error::KernelError, sync::SpinLock};

pub struct RamDisk {
    blocks: SpinLock<Box<[[u8; BSIZE]]>>,
}

impl RamDisk {
    pub fn new(num_blocks: usize) -> Self {
        Self {
            blocks: SpinLock::new(alloc::vec![[0u8; BSIZE]; num_blocks].into_boxed_slice()),
        }
    }
}

impl BlockDevice<BSIZE> for RamDisk {
    type Error = KernelError;

    fn read(&self, _device: usize, blockno: u32, data: &mut [u8; BSIZE]) -> Result<(), Self::Error> {
        let blocks = self.blocks.lock();
        let slot = blocks
            .get(blockno as usize)
            .ok_or(KernelError::InvalidBlock { blockno })?;
        *data = *slot;
        Ok(())
    }

    fn write(&self, _device: usize, blockno: u32, data: &[u8; BSIZE]) -> Result<(), Self::Error> {
        let mut blocks = self.blocks.lock();
        let slot = blocks
            .get_mut(blockno as usize)
            .ok_or(KernelError::InvalidBlock { blockno })?;
        *slot = *data;
        Ok(())
    }
}
