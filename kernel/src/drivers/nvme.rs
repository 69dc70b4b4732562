//! NVMe controller driver
//!
//! PCI discovery, BAR0 mapping, controller reset/enable, admin and I/O
//! queue pairs, identify, namespace enumeration, and single-block I/O.
//! Every discovered namespace with a nonzero capacity registers as a
//! block device.
//!
//! Queue protocol: submission entries are 64 bytes, completions 16 bytes
//! with a phase bit in the status field. The consumer examines the phase
//! bit before anything else; the expected phase toggles exactly when the
//! completion head wraps. One admin command is outstanding at a time, and
//! every wait is a bounded spin.

use core::ptr;

/// Controller register offsets
pub const REG_CAP: u64 = 0x00;
pub const REG_VS: u64 = 0x08;
pub const REG_INTMS: u64 = 0x0C;
pub const REG_INTMC: u64 = 0x10;
pub const REG_CC: u64 = 0x14;
pub const REG_CSTS: u64 = 0x1C;
pub const REG_AQA: u64 = 0x24;
pub const REG_ASQ: u64 = 0x28;
pub const REG_ACQ: u64 = 0x30;

/// Doorbells start here; stride comes from CAP.DSTRD.
pub const DOORBELL_BASE: u64 = 0x1000;

/// Controller Configuration bits
pub const CC_ENABLE: u32 = 1 << 0;
pub const CC_CSS_NVM: u32 = 0 << 4;
pub const CC_AMS_RR: u32 = 0 << 11;
pub const CC_IOSQES: u32 = 6 << 16;
pub const CC_IOCQES: u32 = 4 << 20;

/// Controller Status bits
pub const CSTS_RDY: u32 = 1 << 0;
pub const CSTS_CFS: u32 = 1 << 1;

/// Admin opcodes
pub const ADMIN_CREATE_IO_SQ: u8 = 0x01;
pub const ADMIN_CREATE_IO_CQ: u8 = 0x05;
pub const ADMIN_IDENTIFY: u8 = 0x06;

/// I/O opcodes
pub const IO_FLUSH: u8 = 0x00;
pub const IO_WRITE: u8 = 0x01;
pub const IO_READ: u8 = 0x02;

/// Queue geometry: one page of submission entries, matching completion
/// ring. Admin init never has more than one command in flight.
pub const QUEUE_SIZE: u16 = 64;

/// Bounded-spin iteration counts.
const READY_TIMEOUT_ITERS: u32 = 1_000_000;
const COMPLETION_TIMEOUT_ITERS: u32 = 5_000_000;

/// Highest namespace id probed.
const MAX_NAMESPACES: u32 = 4;

/// Submission queue entry (64 bytes)
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SubmissionEntry {
    pub opcode: u8,
    pub flags: u8,
    pub command_id: u16,
    pub nsid: u32,
    pub cdw2: u32,
    pub cdw3: u32,
    pub metadata: u64,
    pub prp1: u64,
    pub prp2: u64,
    pub cdw10: u32,
    pub cdw11: u32,
    pub cdw12: u32,
    pub cdw13: u32,
    pub cdw14: u32,
    pub cdw15: u32,
}

impl SubmissionEntry {
    pub const fn zeroed() -> Self {
        Self {
            opcode: 0,
            flags: 0,
            command_id: 0,
            nsid: 0,
            cdw2: 0,
            cdw3: 0,
            metadata: 0,
            prp1: 0,
            prp2: 0,
            cdw10: 0,
            cdw11: 0,
            cdw12: 0,
            cdw13: 0,
            cdw14: 0,
            cdw15: 0,
        }
    }
}

/// Completion queue entry (16 bytes)
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CompletionEntry {
    pub result: u32,
    pub reserved: u32,
    pub sq_head: u16,
    pub sq_id: u16,
    pub command_id: u16,
    pub status: u16,
}

/// Status code field of a completion, past the phase bit.
pub const fn status_code(status: u16) -> u16 {
    (status >> 1) & 0x7FF
}

/// One submission/completion ring pair over raw queue memory.
pub struct QueuePair {
    sq: *mut SubmissionEntry,
    cq: *mut CompletionEntry,
    pub sq_phys: u64,
    pub cq_phys: u64,
    pub sq_size: u16,
    pub cq_size: u16,
    pub sq_tail: u16,
    pub cq_head: u16,
    /// Phase value a fresh completion must carry.
    pub cq_phase: u16,
}

// SAFETY: the ring pointers reference DMA pages owned by the controller;
// access is serialized by the controller lock.
unsafe impl Send for QueuePair {}

impl QueuePair {
    /// Wrap existing ring memory. `sq`/`cq` must point at `size` zeroed
    /// entries each; `sq_phys`/`cq_phys` are their physical bases as
    /// programmed into the controller.
    ///
    /// # Safety
    ///
    /// The ring memory must stay valid and exclusively owned by this pair.
    pub unsafe fn from_raw(
        sq: *mut SubmissionEntry,
        cq: *mut CompletionEntry,
        sq_phys: u64,
        cq_phys: u64,
        size: u16,
    ) -> Self {
        Self {
            sq,
            cq,
            sq_phys,
            cq_phys,
            sq_size: size,
            cq_size: size,
            sq_tail: 0,
            cq_head: 0,
            cq_phase: 1,
        }
    }

    /// Copy a command into the submission ring and advance the tail. The
    /// caller rings the doorbell with the returned tail.
    pub fn push_command(&mut self, cmd: SubmissionEntry) -> u16 {
        // SAFETY: sq_tail < sq_size by construction.
        unsafe {
            ptr::write_volatile(self.sq.add(self.sq_tail as usize), cmd);
        }
        self.sq_tail = (self.sq_tail + 1) % self.sq_size;
        self.sq_tail
    }

    /// Consume the completion at the head, if it is fresh. The phase bit
    /// is examined before any other field; a stale entry is never read
    /// further. Toggles the expected phase exactly on wrap. The caller
    /// rings the completion doorbell with the new head.
    pub fn pop_completion(&mut self) -> Option<CompletionEntry> {
        // SAFETY: cq_head < cq_size by construction; volatile because the
        // device writes the ring.
        let status = unsafe {
            ptr::read_volatile(ptr::addr_of!((*self.cq.add(self.cq_head as usize)).status))
        };
        if status & 1 != self.cq_phase {
            return None;
        }
        // SAFETY: fresh entry, fully written before the device set the
        // phase bit.
        let entry = unsafe { ptr::read_volatile(self.cq.add(self.cq_head as usize)) };
        self.cq_head += 1;
        if self.cq_head == self.cq_size {
            self.cq_head = 0;
            self.cq_phase ^= 1;
        }
        Some(entry)
    }
}

#[cfg(target_os = "none")]
mod controller {
    use alloc::boxed::Box;
    use alloc::format;
    use alloc::sync::Arc;
    use alloc::vec::Vec;
    use core::sync::atomic::{compiler_fence, Ordering};

    use spin::Mutex;

    use super::*;
    use crate::block::{self, BlockDevice, BlockDeviceType};
    use crate::drivers::pci;
    use crate::error::{KernelError, KernelResult};
    use crate::mm::{self, pmm, vmm, PageFlags, PhysicalAddress, VirtualAddress, FRAME_SIZE};

    /// Kernel virtual window the BAR0 registers are mapped at.
    const MMIO_WINDOW: u64 = 0xFFFF_B000_0000_0000;
    /// 64 KiB of register space covers the doorbells of every queue this
    /// driver creates.
    const MMIO_WINDOW_PAGES: u64 = 16;

    pub struct NvmeController {
        mmio: VirtualAddress,
        doorbell_stride: u64,
        admin: QueuePair,
        io: Option<QueuePair>,
        /// One-page DMA bounce buffer for block I/O.
        bounce_phys: PhysicalAddress,
        num_namespaces: u32,
        next_command_id: u16,
    }

    impl NvmeController {
        fn read_reg32(&self, offset: u64) -> u32 {
            // SAFETY: offset lies inside the mapped BAR0 window.
            unsafe { core::ptr::read_volatile((self.mmio.as_u64() + offset) as *const u32) }
        }

        fn read_reg64(&self, offset: u64) -> u64 {
            // SAFETY: as read_reg32.
            unsafe { core::ptr::read_volatile((self.mmio.as_u64() + offset) as *const u64) }
        }

        fn write_reg32(&self, offset: u64, value: u32) {
            // SAFETY: as read_reg32.
            unsafe { core::ptr::write_volatile((self.mmio.as_u64() + offset) as *mut u32, value) }
        }

        fn write_reg64(&self, offset: u64, value: u64) {
            // SAFETY: as read_reg32.
            unsafe { core::ptr::write_volatile((self.mmio.as_u64() + offset) as *mut u64, value) }
        }

        /// Doorbell writes are full 32-bit stores behind a compiler fence
        /// so queue memory is globally visible before the bell rings.
        fn write_doorbell(&self, offset: u64, value: u32) {
            compiler_fence(Ordering::SeqCst);
            // SAFETY: doorbell offsets are inside the mapped window.
            unsafe { core::ptr::write_volatile((self.mmio.as_u64() + offset) as *mut u32, value) }
        }

        fn sq_doorbell(&self, qid: u64) -> u64 {
            DOORBELL_BASE + (2 * qid) * self.doorbell_stride
        }

        fn cq_doorbell(&self, qid: u64) -> u64 {
            DOORBELL_BASE + (2 * qid + 1) * self.doorbell_stride
        }

        fn queue_mut(&mut self, qid: u16) -> &mut QueuePair {
            if qid == 0 {
                &mut self.admin
            } else {
                self.io.as_mut().expect("I/O queue pair not created")
            }
        }

        /// Submit one command and spin for its completion, filtering by
        /// command id. Bounded by `COMPLETION_TIMEOUT_ITERS`.
        fn submit_and_wait(&mut self, qid: u16, mut cmd: SubmissionEntry) -> KernelResult<CompletionEntry> {
            let cid = self.next_command_id;
            self.next_command_id = self.next_command_id.wrapping_add(1);
            cmd.command_id = cid;

            let tail = self.queue_mut(qid).push_command(cmd);
            self.write_doorbell(self.sq_doorbell(qid as u64), tail as u32);

            for _ in 0..COMPLETION_TIMEOUT_ITERS {
                let popped = self.queue_mut(qid).pop_completion();
                if let Some(entry) = popped {
                    let head = self.queue_mut(qid).cq_head;
                    self.write_doorbell(self.cq_doorbell(qid as u64), head as u32);
                    if entry.command_id != cid {
                        // A completion for a command this waiter did not
                        // issue; with one command outstanding this means a
                        // protocol violation.
                        log::warn!("nvme: stray completion for cid {}", entry.command_id);
                        continue;
                    }
                    let code = status_code(entry.status);
                    if code != 0 {
                        return Err(KernelError::Hardware {
                            device: "nvme0",
                            code: code as u32,
                        });
                    }
                    return Ok(entry);
                }
                core::hint::spin_loop();
            }
            Err(KernelError::Timeout {
                operation: "nvme completion",
            })
        }

        /// Steps 4..6 of bring-up: disable, program admin queues, enable.
        fn reset_and_enable(&mut self) -> KernelResult<()> {
            let cap = self.read_reg64(REG_CAP);
            self.doorbell_stride = 4 << ((cap >> 32) & 0xF);
            let mpsmin = ((cap >> 48) & 0xF) as u32;

            // Disable and wait for RDY to drop.
            self.write_reg32(REG_CC, 0);
            self.wait_ready(false)?;

            // Completions are polled; mask every interrupt vector.
            self.write_reg32(REG_INTMS, 0xFFFF_FFFF);

            self.write_reg64(REG_ASQ, self.admin.sq_phys);
            self.write_reg64(REG_ACQ, self.admin.cq_phys);
            let qdepth = (QUEUE_SIZE - 1) as u32;
            self.write_reg32(REG_AQA, (qdepth << 16) | qdepth);

            self.write_reg32(
                REG_CC,
                CC_ENABLE | CC_CSS_NVM | (mpsmin << 7) | CC_AMS_RR | CC_IOSQES | CC_IOCQES,
            );
            self.wait_ready(true)?;
            Ok(())
        }

        fn wait_ready(&self, ready: bool) -> KernelResult<()> {
            for _ in 0..READY_TIMEOUT_ITERS {
                let csts = self.read_reg32(REG_CSTS);
                if csts & CSTS_CFS != 0 {
                    return Err(KernelError::Hardware {
                        device: "nvme0",
                        code: csts,
                    });
                }
                if (csts & CSTS_RDY != 0) == ready {
                    return Ok(());
                }
                core::hint::spin_loop();
            }
            Err(KernelError::Timeout {
                operation: "nvme controller ready",
            })
        }

        /// Step 7: identify the controller, returning the namespace count.
        fn identify_controller(&mut self, buf_phys: PhysicalAddress) -> KernelResult<u32> {
            let mut cmd = SubmissionEntry::zeroed();
            cmd.opcode = ADMIN_IDENTIFY;
            cmd.prp1 = buf_phys.as_u64();
            cmd.cdw10 = 1; // CNS 1: controller
            self.submit_and_wait(0, cmd)?;

            let data = mm::phys_to_virt(buf_phys).as_ptr::<u8>();
            // SAFETY: the identify page was just DMA-filled; NN lives at
            // bytes 516..520.
            let nn = unsafe {
                u32::from_le_bytes([
                    *data.add(516),
                    *data.add(517),
                    *data.add(518),
                    *data.add(519),
                ])
            };
            Ok(nn)
        }

        /// Step 8: create the I/O queue pair (completion queue first).
        fn create_io_queues(&mut self, qp: QueuePair) -> KernelResult<()> {
            let qdepth = (QUEUE_SIZE - 1) as u32;

            let mut cmd = SubmissionEntry::zeroed();
            cmd.opcode = ADMIN_CREATE_IO_CQ;
            cmd.prp1 = qp.cq_phys;
            cmd.cdw10 = (qdepth << 16) | 1; // queue id 1
            cmd.cdw11 = 1; // physically contiguous, no interrupts
            self.submit_and_wait(0, cmd)?;

            let mut cmd = SubmissionEntry::zeroed();
            cmd.opcode = ADMIN_CREATE_IO_SQ;
            cmd.prp1 = qp.sq_phys;
            cmd.cdw10 = (qdepth << 16) | 1;
            cmd.cdw11 = (1 << 16) | 1; // bound to CQ 1, contiguous
            self.submit_and_wait(0, cmd)?;

            self.io = Some(qp);
            Ok(())
        }

        /// Step 9: identify one namespace. Returns `(block_count,
        /// block_size)`, with zero capacity meaning "inactive".
        fn identify_namespace(
            &mut self,
            nsid: u32,
            buf_phys: PhysicalAddress,
        ) -> KernelResult<(u64, usize)> {
            let mut cmd = SubmissionEntry::zeroed();
            cmd.opcode = ADMIN_IDENTIFY;
            cmd.nsid = nsid;
            cmd.prp1 = buf_phys.as_u64();
            cmd.cdw10 = 0; // CNS 0: namespace
            self.submit_and_wait(0, cmd)?;

            let data = mm::phys_to_virt(buf_phys).as_ptr::<u8>();
            // SAFETY: identify namespace layout: NSZE at 0..8, FLBAS at
            // 26, LBA format table at 128 with 4-byte entries whose third
            // byte is LBADS.
            unsafe {
                let mut nsze = [0u8; 8];
                for (i, b) in nsze.iter_mut().enumerate() {
                    *b = *data.add(i);
                }
                let nsze = u64::from_le_bytes(nsze);
                let flbas = *data.add(26) & 0xF;
                let lbads = *data.add(128 + 4 * flbas as usize + 2);
                Ok((nsze, 1usize << lbads))
            }
        }

        /// Single-block I/O through the bounce page. `prp1` carries the
        /// physical address; one page is enough for one block.
        fn io_rw(&mut self, opcode: u8, nsid: u32, lba: u64, len: usize) -> KernelResult<()> {
            let mut cmd = SubmissionEntry::zeroed();
            cmd.opcode = opcode;
            cmd.nsid = nsid;
            cmd.prp1 = self.bounce_phys.as_u64();
            cmd.cdw10 = lba as u32;
            cmd.cdw11 = (lba >> 32) as u32;
            cmd.cdw12 = 0; // zero-based block count: one block
            debug_assert!(len <= FRAME_SIZE);
            self.submit_and_wait(1, cmd)?;
            Ok(())
        }

        fn bounce(&self) -> *mut u8 {
            mm::phys_to_virt(self.bounce_phys).as_mut_ptr::<u8>()
        }

        pub fn read_block(&mut self, nsid: u32, lba: u64, buf: &mut [u8]) -> KernelResult<()> {
            self.io_rw(IO_READ, nsid, lba, buf.len())?;
            // SAFETY: the device just filled the bounce page.
            unsafe {
                core::ptr::copy_nonoverlapping(self.bounce(), buf.as_mut_ptr(), buf.len());
            }
            Ok(())
        }

        pub fn write_block(&mut self, nsid: u32, lba: u64, buf: &[u8]) -> KernelResult<()> {
            // SAFETY: the bounce page is controller-owned scratch.
            unsafe {
                core::ptr::copy_nonoverlapping(buf.as_ptr(), self.bounce(), buf.len());
            }
            self.io_rw(IO_WRITE, nsid, lba, buf.len())
        }

        pub fn flush(&mut self, nsid: u32) -> KernelResult<()> {
            let mut cmd = SubmissionEntry::zeroed();
            cmd.opcode = IO_FLUSH;
            cmd.nsid = nsid;
            self.submit_and_wait(1, cmd)?;
            Ok(())
        }
    }

    /// One namespace exposed through the block layer.
    struct NvmeNamespace {
        controller: Arc<Mutex<NvmeController>>,
        nsid: u32,
        block_size: usize,
        block_count: u64,
    }

    impl BlockDevice for NvmeNamespace {
        fn device_type(&self) -> BlockDeviceType {
            BlockDeviceType::Disk
        }

        fn block_size(&self) -> usize {
            self.block_size
        }

        fn block_count(&self) -> u64 {
            self.block_count
        }

        fn read_block(&mut self, lba: u64, buf: &mut [u8]) -> KernelResult<()> {
            self.controller.lock().read_block(self.nsid, lba, buf)
        }

        fn write_block(&mut self, lba: u64, buf: &[u8]) -> KernelResult<()> {
            self.controller.lock().write_block(self.nsid, lba, buf)
        }

        fn flush(&mut self) -> KernelResult<()> {
            self.controller.lock().flush(self.nsid)
        }
    }

    /// Allocate and zero one DMA page.
    fn dma_page() -> KernelResult<PhysicalAddress> {
        let phys = pmm::alloc_page().ok_or(KernelError::OutOfMemory {
            requested: FRAME_SIZE,
        })?;
        // SAFETY: freshly allocated frame, reached through the direct map.
        unsafe {
            core::ptr::write_bytes(mm::phys_to_virt(phys).as_mut_ptr::<u8>(), 0, FRAME_SIZE);
        }
        Ok(phys)
    }

    fn queue_pair() -> KernelResult<QueuePair> {
        let sq_phys = dma_page()?;
        let cq_phys = dma_page()?;
        // SAFETY: both pages are zeroed, page-aligned, and owned by the
        // pair from here on.
        Ok(unsafe {
            QueuePair::from_raw(
                mm::phys_to_virt(sq_phys).as_mut_ptr::<SubmissionEntry>(),
                mm::phys_to_virt(cq_phys).as_mut_ptr::<CompletionEntry>(),
                sq_phys.as_u64(),
                cq_phys.as_u64(),
                QUEUE_SIZE,
            )
        })
    }

    /// Driver entry: the whole bring-up sequence. Any failing step aborts
    /// initialization; the registry marks this driver failed and moves
    /// on.
    pub fn init() -> KernelResult<()> {
        let dev = pci::find_by_class(0x01, 0x08, 0x02).ok_or(KernelError::NotFound {
            what: "nvme controller on pci bus",
        })?;
        log::info!(
            "nvme: controller {:04x}:{:04x} at {:02x}:{:02x}.0",
            dev.vendor_id,
            dev.device_id,
            dev.address.bus,
            dev.address.slot
        );
        pci::enable_bus_mastering(dev.address);

        let bar = pci::read_bar64(dev.address, pci::offset::BAR0);
        for page in 0..MMIO_WINDOW_PAGES {
            vmm::map(
                VirtualAddress::new(MMIO_WINDOW + page * FRAME_SIZE as u64),
                PhysicalAddress::new(bar + page * FRAME_SIZE as u64),
                PageFlags::MMIO,
            )?;
        }

        let mut ctrl = NvmeController {
            mmio: VirtualAddress::new(MMIO_WINDOW),
            doorbell_stride: 4,
            admin: queue_pair()?,
            io: None,
            bounce_phys: dma_page()?,
            num_namespaces: 0,
            next_command_id: 0,
        };

        let version = ctrl.read_reg32(REG_VS);
        log::info!("nvme: version {}.{}", version >> 16, (version >> 8) & 0xFF);

        ctrl.reset_and_enable()?;

        let ident = dma_page()?;
        ctrl.num_namespaces = ctrl.identify_controller(ident)?;
        log::info!("nvme: {} namespaces reported", ctrl.num_namespaces);

        ctrl.create_io_queues(queue_pair()?)?;

        let mut found: Vec<(u32, u64, usize)> = Vec::new();
        for nsid in 1..=ctrl.num_namespaces.min(MAX_NAMESPACES) {
            let (nsze, block_size) = ctrl.identify_namespace(nsid, ident)?;
            if nsze > 0 {
                found.push((nsid, nsze, block_size));
            }
        }
        pmm::free_page(ident);

        let shared = Arc::new(Mutex::new(ctrl));
        for (nsid, nsze, block_size) in found {
            let label = format!("nvme0n{}", nsid);
            block::register(
                &label,
                Box::new(NvmeNamespace {
                    controller: shared.clone(),
                    nsid,
                    block_size,
                    block_count: nsze,
                }),
            )?;
        }
        Ok(())
    }
}

#[cfg(target_os = "none")]
pub use controller::init;

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use std::vec;

    #[test]
    fn wire_entry_sizes_are_fixed() {
        assert_eq!(core::mem::size_of::<SubmissionEntry>(), 64);
        assert_eq!(core::mem::size_of::<CompletionEntry>(), 16);
    }

    #[test]
    fn status_code_skips_the_phase_bit() {
        assert_eq!(status_code(0x0001), 0); // success, phase 1
        assert_eq!(status_code(0x0005), 2);
        assert_eq!(status_code(0xFFFF), 0x7FF);
    }

    const RING: usize = 4;

    struct FakeRings {
        sq: vec::Vec<SubmissionEntry>,
        cq: vec::Vec<CompletionEntry>,
    }

    impl FakeRings {
        fn new() -> Self {
            Self {
                sq: vec![SubmissionEntry::zeroed(); RING],
                cq: vec![
                    CompletionEntry {
                        result: 0,
                        reserved: 0,
                        sq_head: 0,
                        sq_id: 0,
                        command_id: 0,
                        status: 0,
                    };
                    RING
                ],
            }
        }

        fn pair(&mut self) -> QueuePair {
            // SAFETY: the vectors outlive the pair within each test.
            unsafe {
                QueuePair::from_raw(
                    self.sq.as_mut_ptr(),
                    self.cq.as_mut_ptr(),
                    0x1000,
                    0x2000,
                    RING as u16,
                )
            }
        }

        /// Simulate the device posting a completion with the given phase.
        fn post(&mut self, slot: usize, cid: u16, phase: u16, code: u16) {
            self.cq[slot] = CompletionEntry {
                result: 0,
                reserved: 0,
                sq_head: 0,
                sq_id: 0,
                command_id: cid,
                status: (code << 1) | phase,
            };
        }
    }

    #[test]
    fn stale_phase_is_never_consumed() {
        let mut rings = FakeRings::new();
        let mut qp = rings.pair();

        // Ring content is all-zero: phase 0 entries are stale for an
        // expected phase of 1.
        assert!(qp.pop_completion().is_none());
        assert_eq!(qp.cq_head, 0);

        rings.post(0, 7, 1, 0);
        let entry = qp.pop_completion().expect("fresh completion");
        assert_eq!(entry.command_id, 7);
        assert_eq!(qp.cq_head, 1);

        // The next slot still holds phase 0: stale again.
        assert!(qp.pop_completion().is_none());
    }

    #[test]
    fn expected_phase_toggles_exactly_on_wrap() {
        let mut rings = FakeRings::new();
        let mut qp = rings.pair();

        for slot in 0..RING {
            rings.post(slot, slot as u16, 1, 0);
        }
        for slot in 0..RING {
            assert_eq!(qp.cq_phase, 1, "phase stable inside the first lap");
            let e = qp.pop_completion().expect("fresh completion");
            assert_eq!(e.command_id, slot as u16);
        }
        // Head wrapped: expectation flips to 0.
        assert_eq!(qp.cq_head, 0);
        assert_eq!(qp.cq_phase, 0);

        // Entries still carrying phase 1 are now stale.
        rings.post(0, 9, 1, 0);
        assert!(qp.pop_completion().is_none());

        // A phase-0 entry is fresh on the second lap.
        rings.post(0, 9, 0, 0);
        let e = qp.pop_completion().expect("second-lap completion");
        assert_eq!(e.command_id, 9);
    }

    #[test]
    fn submission_tail_wraps_modulo_queue_size() {
        let mut rings = FakeRings::new();
        let mut qp = rings.pair();

        let mut cmd = SubmissionEntry::zeroed();
        for i in 0..RING as u16 {
            cmd.command_id = i;
            let tail = qp.push_command(cmd);
            assert_eq!(tail, (i + 1) % RING as u16);
        }
        assert_eq!(qp.sq_tail, 0);
        assert_eq!(rings.sq[RING - 1].command_id, RING as u16 - 1);
    }
}
