//! ATA PIO driver
//!
//! LBA28 single-sector reads and writes plus cache flush on the legacy
//! primary and secondary buses. Deliberately minimal: this driver is the
//! reference implementation of the block-device contract, not a
//! performance path. All waits are bounded port polls.
//!
//! Ordering invariant: the READ/WRITE command is issued first and DRQ is
//! awaited after; polling DRQ before the command yields spurious
//! zero-filled sectors.

#![allow(dead_code)]

/// Sector size every LBA28 device uses.
pub const SECTOR_SIZE: usize = 512;

/// Status register bits
pub const STATUS_ERR: u8 = 1 << 0;
pub const STATUS_DRQ: u8 = 1 << 3;
pub const STATUS_RDY: u8 = 1 << 6;
pub const STATUS_BSY: u8 = 1 << 7;

/// Commands
pub const CMD_READ_SECTORS: u8 = 0x20;
pub const CMD_WRITE_SECTORS: u8 = 0x30;
pub const CMD_CACHE_FLUSH: u8 = 0xE7;
pub const CMD_IDENTIFY: u8 = 0xEC;

const POLL_ITERS: u32 = 1_000_000;

#[cfg(target_os = "none")]
mod pio {
    use alloc::boxed::Box;
    use alloc::format;

    use x86_64::instructions::port::Port;

    use super::*;
    use crate::block::{self, BlockDevice, BlockDeviceType};
    use crate::error::{KernelError, KernelResult};

    /// (I/O base, control base) of the two legacy buses.
    const BUSES: [(u16, u16); 2] = [(0x1F0, 0x3F6), (0x170, 0x376)];

    struct AtaDevice {
        io_base: u16,
        ctrl_base: u16,
        /// 0 = master, 1 = slave
        drive: u8,
        sectors: u64,
    }

    impl AtaDevice {
        fn status(&self) -> u8 {
            let mut port: Port<u8> = Port::new(self.io_base + 7);
            // SAFETY: ATA status port of a probed bus.
            unsafe { port.read() }
        }

        /// ~400ns settle: four reads of the alternate status register.
        fn settle(&self) {
            let mut alt: Port<u8> = Port::new(self.ctrl_base);
            for _ in 0..4 {
                // SAFETY: alternate status read has no side effects.
                let _ = unsafe { alt.read() };
            }
        }

        fn wait_not_busy(&self) -> KernelResult<()> {
            for _ in 0..POLL_ITERS {
                if self.status() & STATUS_BSY == 0 {
                    return Ok(());
                }
                core::hint::spin_loop();
            }
            Err(KernelError::Timeout {
                operation: "ata busy wait",
            })
        }

        fn wait_drq(&self) -> KernelResult<()> {
            for _ in 0..POLL_ITERS {
                let status = self.status();
                if status & STATUS_ERR != 0 {
                    return Err(KernelError::Hardware {
                        device: "ata",
                        code: status as u32,
                    });
                }
                if status & STATUS_BSY == 0 && status & STATUS_DRQ != 0 {
                    return Ok(());
                }
                core::hint::spin_loop();
            }
            Err(KernelError::Timeout {
                operation: "ata drq wait",
            })
        }

        /// Select the drive and program the LBA28 registers for one
        /// sector.
        fn select(&self, lba: u64) {
            let mut drive_head: Port<u8> = Port::new(self.io_base + 6);
            let mut sector_count: Port<u8> = Port::new(self.io_base + 2);
            let mut lba_low: Port<u8> = Port::new(self.io_base + 3);
            let mut lba_mid: Port<u8> = Port::new(self.io_base + 4);
            let mut lba_high: Port<u8> = Port::new(self.io_base + 5);
            // SAFETY: command block registers of a probed bus.
            unsafe {
                drive_head.write(0xE0 | (self.drive << 4) | ((lba >> 24) as u8 & 0x0F));
                sector_count.write(1);
                lba_low.write(lba as u8);
                lba_mid.write((lba >> 8) as u8);
                lba_high.write((lba >> 16) as u8);
            }
        }

        fn command(&self, cmd: u8) {
            let mut port: Port<u8> = Port::new(self.io_base + 7);
            // SAFETY: command register write.
            unsafe { port.write(cmd) }
        }

        fn read_sector(&self, lba: u64, buf: &mut [u8]) -> KernelResult<()> {
            self.wait_not_busy()?;
            self.select(lba);
            self.settle();
            // Command first, then DRQ.
            self.command(CMD_READ_SECTORS);
            self.wait_drq()?;

            let mut data: Port<u16> = Port::new(self.io_base);
            for chunk in buf[..SECTOR_SIZE].chunks_exact_mut(2) {
                // SAFETY: DRQ is set; the data register yields the sector.
                let word = unsafe { data.read() };
                chunk[0] = word as u8;
                chunk[1] = (word >> 8) as u8;
            }
            Ok(())
        }

        fn write_sector(&self, lba: u64, buf: &[u8]) -> KernelResult<()> {
            self.wait_not_busy()?;
            self.select(lba);
            self.settle();
            self.command(CMD_WRITE_SECTORS);
            self.wait_drq()?;

            let mut data: Port<u16> = Port::new(self.io_base);
            for chunk in buf[..SECTOR_SIZE].chunks_exact(2) {
                let word = (chunk[0] as u16) | ((chunk[1] as u16) << 8);
                // SAFETY: DRQ is set; the device expects 256 words.
                unsafe { data.write(word) }
            }

            self.command(CMD_CACHE_FLUSH);
            self.wait_not_busy()
        }

        /// IDENTIFY probe. Returns the LBA28 sector count, or None when
        /// no ATA device answers.
        fn identify(io_base: u16, ctrl_base: u16, drive: u8) -> Option<u64> {
            let dev = AtaDevice {
                io_base,
                ctrl_base,
                drive,
                sectors: 0,
            };

            let mut drive_head: Port<u8> = Port::new(io_base + 6);
            let mut sector_count: Port<u8> = Port::new(io_base + 2);
            let mut lba_low: Port<u8> = Port::new(io_base + 3);
            let mut lba_mid: Port<u8> = Port::new(io_base + 4);
            let mut lba_high: Port<u8> = Port::new(io_base + 5);
            // SAFETY: probing the command block; absent devices float the
            // bus and read back 0xFF or 0.
            unsafe {
                drive_head.write(0xA0 | (drive << 4));
                dev.settle();
                sector_count.write(0);
                lba_low.write(0);
                lba_mid.write(0);
                lba_high.write(0);
            }
            dev.command(CMD_IDENTIFY);

            let status = dev.status();
            if status == 0 || status == 0xFF {
                return None;
            }
            dev.wait_not_busy().ok()?;
            // Non-ATA devices (ATAPI, SATA) set the signature registers.
            // SAFETY: reading back the signature.
            let (mid, high) = unsafe {
                let mut m: Port<u8> = Port::new(io_base + 4);
                let mut h: Port<u8> = Port::new(io_base + 5);
                (m.read(), h.read())
            };
            if mid != 0 || high != 0 {
                return None;
            }
            dev.wait_drq().ok()?;

            let mut data: Port<u16> = Port::new(io_base);
            let mut words = [0u16; 256];
            for w in words.iter_mut() {
                // SAFETY: DRQ set, 256 identify words pending.
                *w = unsafe { data.read() };
            }
            // Words 60..61: total addressable LBA28 sectors.
            let sectors = (words[60] as u64) | ((words[61] as u64) << 16);
            (sectors > 0).then_some(sectors)
        }
    }

    impl BlockDevice for AtaDevice {
        fn device_type(&self) -> BlockDeviceType {
            BlockDeviceType::Disk
        }

        fn block_size(&self) -> usize {
            SECTOR_SIZE
        }

        fn block_count(&self) -> u64 {
            self.sectors
        }

        fn read_block(&mut self, lba: u64, buf: &mut [u8]) -> KernelResult<()> {
            self.read_sector(lba, buf)
        }

        fn write_block(&mut self, lba: u64, buf: &[u8]) -> KernelResult<()> {
            self.write_sector(lba, buf)
        }

        fn flush(&mut self) -> KernelResult<()> {
            self.command(CMD_CACHE_FLUSH);
            self.wait_not_busy()
        }
    }

    /// Driver entry: probe the four legacy positions, register what
    /// answers.
    pub fn init() -> KernelResult<()> {
        let mut found = 0;
        for (bus_idx, (io_base, ctrl_base)) in BUSES.iter().enumerate() {
            for drive in 0..2u8 {
                if let Some(sectors) = AtaDevice::identify(*io_base, *ctrl_base, drive) {
                    let label = format!("ata{}", bus_idx * 2 + drive as usize);
                    block::register(
                        &label,
                        Box::new(AtaDevice {
                            io_base: *io_base,
                            ctrl_base: *ctrl_base,
                            drive,
                            sectors,
                        }),
                    )?;
                    found += 1;
                }
            }
        }
        if found == 0 {
            log::info!("ata: no devices on the legacy buses");
        }
        Ok(())
    }
}

#[cfg(target_os = "none")]
pub use pio::init;
