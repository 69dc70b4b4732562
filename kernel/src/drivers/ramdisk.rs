//! RAM-backed block device
//!
//! The in-tree reference implementation of the block-device contract and
//! the scratch disk the ramfs and the tests run against. Overrides the
//! vectored operations with straight copies.

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;

use crate::block::{self, BlockDevice, BlockDeviceType};
use crate::error::KernelResult;

/// Default scratch disk geometry: 512-byte blocks, 1 MiB total.
const DEFAULT_BLOCK_SIZE: usize = 512;
const DEFAULT_BLOCKS: u64 = 2048;

pub struct RamDisk {
    block_size: usize,
    data: Vec<u8>,
}

impl RamDisk {
    pub fn new(block_size: usize, block_count: u64) -> Self {
        Self {
            block_size,
            data: vec![0u8; block_size * block_count as usize],
        }
    }

    fn span(&self, lba: u64, count: usize) -> core::ops::Range<usize> {
        let start = lba as usize * self.block_size;
        start..start + count * self.block_size
    }
}

impl BlockDevice for RamDisk {
    fn device_type(&self) -> BlockDeviceType {
        BlockDeviceType::RamDisk
    }

    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        (self.data.len() / self.block_size) as u64
    }

    fn read_block(&mut self, lba: u64, buf: &mut [u8]) -> KernelResult<()> {
        let span = self.span(lba, 1);
        buf[..self.block_size].copy_from_slice(&self.data[span]);
        Ok(())
    }

    fn write_block(&mut self, lba: u64, buf: &[u8]) -> KernelResult<()> {
        let span = self.span(lba, 1);
        self.data[span].copy_from_slice(&buf[..self.block_size]);
        Ok(())
    }

    fn read_blocks(&mut self, lba: u64, count: usize, buf: &mut [u8]) -> KernelResult<()> {
        let span = self.span(lba, count);
        buf[..count * self.block_size].copy_from_slice(&self.data[span]);
        Ok(())
    }

    fn write_blocks(&mut self, lba: u64, count: usize, buf: &[u8]) -> KernelResult<()> {
        let span = self.span(lba, count);
        self.data[span].copy_from_slice(&buf[..count * self.block_size]);
        Ok(())
    }
}

/// Driver entry: register the scratch disk with the block layer.
pub fn init() -> KernelResult<()> {
    let disk = RamDisk::new(DEFAULT_BLOCK_SIZE, DEFAULT_BLOCKS);
    let id = block::register("ram0", Box::new(disk))?;
    log::info!("ramdisk: ram0 online as block device #{}", id.0);
    Ok(())
}
