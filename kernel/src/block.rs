//! Block device layer
//!
//! Uniform LBA read/write/flush dispatch over registered devices. Drivers
//! implement the mandatory single-block operations; the provided
//! multi-block methods loop over them one block at a time, and a driver
//! with a real vectored engine overrides them. Range and validity checks
//! happen here, before any driver code runs.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;

use spin::Mutex;

use crate::error::{KernelError, KernelResult};

/// Longest accepted device label.
pub const MAX_LABEL_LEN: usize = 31;

/// Block device category, mirroring the driver registry's kinds where a
/// device has a natural one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockDeviceType {
    Disk,
    RamDisk,
    Removable,
}

/// The capability surface of a block device.
///
/// `read_block`/`write_block` are mandatory. The vectored and flush
/// operations have default bodies; overriding them is how a driver
/// advertises native multi-block or cache-flush support.
pub trait BlockDevice: Send {
    fn device_type(&self) -> BlockDeviceType;
    fn block_size(&self) -> usize;
    fn block_count(&self) -> u64;

    /// Read one block at `lba` into `buf` (exactly `block_size` bytes).
    fn read_block(&mut self, lba: u64, buf: &mut [u8]) -> KernelResult<()>;

    /// Write one block at `lba` from `buf` (exactly `block_size` bytes).
    fn write_block(&mut self, lba: u64, buf: &[u8]) -> KernelResult<()>;

    /// Read `count` consecutive blocks. The default loops over
    /// `read_block`, advancing by one block size per iteration and
    /// stopping at the first driver error.
    fn read_blocks(&mut self, lba: u64, count: usize, buf: &mut [u8]) -> KernelResult<()> {
        let bs = self.block_size();
        for i in 0..count {
            self.read_block(lba + i as u64, &mut buf[i * bs..(i + 1) * bs])?;
        }
        Ok(())
    }

    /// Write `count` consecutive blocks. Default loops like `read_blocks`.
    fn write_blocks(&mut self, lba: u64, count: usize, buf: &[u8]) -> KernelResult<()> {
        let bs = self.block_size();
        for i in 0..count {
            self.write_block(lba + i as u64, &buf[i * bs..(i + 1) * bs])?;
        }
        Ok(())
    }

    /// Flush device caches. Default: nothing to flush.
    fn flush(&mut self) -> KernelResult<()> {
        Ok(())
    }
}

/// Handle to a registered block device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceId(pub usize);

struct Registered {
    label: String,
    present: bool,
    dev: Box<dyn BlockDevice>,
}

/// Snapshot of a registered device's identity, for listings.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub id: DeviceId,
    pub label: String,
    pub device_type: BlockDeviceType,
    pub block_size: usize,
    pub block_count: u64,
    pub present: bool,
}

/// Registry plus checked dispatch.
pub struct BlockRegistry {
    devices: Vec<Registered>,
}

impl BlockRegistry {
    pub const fn new() -> Self {
        Self {
            devices: Vec::new(),
        }
    }

    /// Register a device under `label` (≤ 31 bytes). Returns its id.
    pub fn register(&mut self, label: &str, dev: Box<dyn BlockDevice>) -> KernelResult<DeviceId> {
        if label.is_empty() || label.len() > MAX_LABEL_LEN {
            return Err(KernelError::InvalidArgument {
                what: "block device label",
            });
        }
        if dev.block_size() == 0 || dev.block_count() == 0 {
            return Err(KernelError::InvalidArgument {
                what: "block device geometry",
            });
        }
        let id = DeviceId(self.devices.len());
        log::info!(
            "block: registered {} as #{} ({} x {} bytes)",
            label,
            id.0,
            dev.block_count(),
            dev.block_size()
        );
        self.devices.push(Registered {
            label: String::from(label),
            present: true,
            dev,
        });
        Ok(id)
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    pub fn info(&self, id: DeviceId) -> KernelResult<DeviceInfo> {
        let entry = self.devices.get(id.0).ok_or(KernelError::NotFound {
            what: "block device",
        })?;
        Ok(DeviceInfo {
            id,
            label: entry.label.clone(),
            device_type: entry.dev.device_type(),
            block_size: entry.dev.block_size(),
            block_count: entry.dev.block_count(),
            present: entry.present,
        })
    }

    pub fn list(&self) -> Vec<DeviceInfo> {
        (0..self.devices.len())
            .map(|i| self.info(DeviceId(i)).expect("index in range"))
            .collect()
    }

    /// Mark a device present or absent (removable media).
    pub fn set_present(&mut self, id: DeviceId, present: bool) -> KernelResult<()> {
        let entry = self.devices.get_mut(id.0).ok_or(KernelError::NotFound {
            what: "block device",
        })?;
        entry.present = present;
        Ok(())
    }

    fn checked(
        &mut self,
        id: DeviceId,
        lba: u64,
        count: usize,
        buf_len: usize,
    ) -> KernelResult<&mut Box<dyn BlockDevice>> {
        let entry = self.devices.get_mut(id.0).ok_or(KernelError::NotFound {
            what: "block device",
        })?;
        if !entry.present {
            return Err(KernelError::InvalidArgument {
                what: "device not present",
            });
        }
        let bs = entry.dev.block_size();
        if count == 0 || buf_len < count * bs {
            return Err(KernelError::InvalidArgument {
                what: "buffer smaller than request",
            });
        }
        if lba >= entry.dev.block_count() || lba + count as u64 > entry.dev.block_count() {
            return Err(KernelError::InvalidArgument {
                what: "lba range beyond device",
            });
        }
        Ok(&mut entry.dev)
    }

    pub fn read(&mut self, id: DeviceId, lba: u64, buf: &mut [u8]) -> KernelResult<()> {
        let dev = self.checked(id, lba, 1, buf.len())?;
        dev.read_block(lba, buf)
    }

    pub fn write(&mut self, id: DeviceId, lba: u64, buf: &[u8]) -> KernelResult<()> {
        let dev = self.checked(id, lba, 1, buf.len())?;
        dev.write_block(lba, buf)
    }

    pub fn read_multi(
        &mut self,
        id: DeviceId,
        lba: u64,
        count: usize,
        buf: &mut [u8],
    ) -> KernelResult<()> {
        let dev = self.checked(id, lba, count, buf.len())?;
        dev.read_blocks(lba, count, buf)
    }

    pub fn write_multi(
        &mut self,
        id: DeviceId,
        lba: u64,
        count: usize,
        buf: &[u8],
    ) -> KernelResult<()> {
        let dev = self.checked(id, lba, count, buf.len())?;
        dev.write_blocks(lba, count, buf)
    }

    pub fn flush(&mut self, id: DeviceId) -> KernelResult<()> {
        let entry = self.devices.get_mut(id.0).ok_or(KernelError::NotFound {
            what: "block device",
        })?;
        if !entry.present {
            return Err(KernelError::InvalidArgument {
                what: "device not present",
            });
        }
        entry.dev.flush()
    }
}

impl Default for BlockRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Global block device registry
pub static BLOCK_DEVICES: Mutex<BlockRegistry> = Mutex::new(BlockRegistry::new());

pub fn register(label: &str, dev: Box<dyn BlockDevice>) -> KernelResult<DeviceId> {
    BLOCK_DEVICES.lock().register(label, dev)
}

pub fn device_count() -> usize {
    BLOCK_DEVICES.lock().device_count()
}

pub fn list() -> Vec<DeviceInfo> {
    BLOCK_DEVICES.lock().list()
}

pub fn read(id: DeviceId, lba: u64, buf: &mut [u8]) -> KernelResult<()> {
    BLOCK_DEVICES.lock().read(id, lba, buf)
}

pub fn write(id: DeviceId, lba: u64, buf: &[u8]) -> KernelResult<()> {
    BLOCK_DEVICES.lock().write(id, lba, buf)
}

pub fn read_multi(id: DeviceId, lba: u64, count: usize, buf: &mut [u8]) -> KernelResult<()> {
    BLOCK_DEVICES.lock().read_multi(id, lba, count, buf)
}

pub fn write_multi(id: DeviceId, lba: u64, count: usize, buf: &[u8]) -> KernelResult<()> {
    BLOCK_DEVICES.lock().write_multi(id, lba, count, buf)
}

pub fn flush(id: DeviceId) -> KernelResult<()> {
    BLOCK_DEVICES.lock().flush(id)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::drivers::ramdisk::RamDisk;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::vec;

    #[test]
    fn register_validates_label_and_geometry() {
        let mut reg = BlockRegistry::new();
        assert!(matches!(
            reg.register("", Box::new(RamDisk::new(512, 8))),
            Err(KernelError::InvalidArgument { .. })
        ));
        let long = "a-label-that-is-definitely-longer-than-31";
        assert!(matches!(
            reg.register(long, Box::new(RamDisk::new(512, 8))),
            Err(KernelError::InvalidArgument { .. })
        ));
        let id = reg.register("ram0", Box::new(RamDisk::new(512, 8))).unwrap();
        assert_eq!(id, DeviceId(0));
        assert_eq!(reg.device_count(), 1);
    }

    #[test]
    fn single_block_roundtrip_with_range_checks() {
        let mut reg = BlockRegistry::new();
        let id = reg.register("ram0", Box::new(RamDisk::new(512, 16))).unwrap();

        let pattern = [0x5Au8; 512];
        reg.write(id, 3, &pattern).unwrap();
        let mut back = [0u8; 512];
        reg.read(id, 3, &mut back).unwrap();
        assert_eq!(back, pattern);

        // lba == block_count is out of range.
        assert!(matches!(
            reg.read(id, 16, &mut back),
            Err(KernelError::InvalidArgument { .. })
        ));
        // Short buffer rejected before the driver sees it.
        let mut tiny = [0u8; 16];
        assert!(matches!(
            reg.read(id, 0, &mut tiny),
            Err(KernelError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn multi_block_range_check_covers_the_tail() {
        let mut reg = BlockRegistry::new();
        let id = reg.register("ram0", Box::new(RamDisk::new(512, 8))).unwrap();
        let mut buf = vec![0u8; 512 * 4];

        reg.read_multi(id, 4, 4, &mut buf).unwrap();
        assert!(matches!(
            reg.read_multi(id, 5, 4, &mut buf),
            Err(KernelError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn absent_device_is_rejected() {
        let mut reg = BlockRegistry::new();
        let id = reg.register("ram0", Box::new(RamDisk::new(512, 8))).unwrap();
        reg.set_present(id, false).unwrap();
        let mut buf = [0u8; 512];
        assert!(matches!(
            reg.read(id, 0, &mut buf),
            Err(KernelError::InvalidArgument { .. })
        ));
        assert!(matches!(
            reg.flush(id),
            Err(KernelError::InvalidArgument { .. })
        ));
    }

    /// Driver with only the single-block ops: the provided default must
    /// loop once per block.
    struct CountingDevice {
        data: RamDisk,
        single_reads: Arc<AtomicUsize>,
    }

    impl BlockDevice for CountingDevice {
        fn device_type(&self) -> BlockDeviceType {
            BlockDeviceType::RamDisk
        }
        fn block_size(&self) -> usize {
            self.data.block_size()
        }
        fn block_count(&self) -> u64 {
            self.data.block_count()
        }
        fn read_block(&mut self, lba: u64, buf: &mut [u8]) -> KernelResult<()> {
            self.single_reads.fetch_add(1, Ordering::Relaxed);
            self.data.read_block(lba, buf)
        }
        fn write_block(&mut self, lba: u64, buf: &[u8]) -> KernelResult<()> {
            self.data.write_block(lba, buf)
        }
    }

    #[test]
    fn default_multi_block_falls_back_to_single_block_loop() {
        let reads = Arc::new(AtomicUsize::new(0));
        let mut reg = BlockRegistry::new();
        let id = reg
            .register(
                "counting0",
                Box::new(CountingDevice {
                    data: RamDisk::new(512, 32),
                    single_reads: reads.clone(),
                }),
            )
            .unwrap();

        let mut buf = vec![0u8; 512 * 7];
        reg.read_multi(id, 2, 7, &mut buf).unwrap();
        assert_eq!(reads.load(Ordering::Relaxed), 7);
    }
}
