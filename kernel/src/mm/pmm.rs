//! Physical page frame allocator
//!
//! A bitmap allocator over the usable RAM span: one bit per 4 KiB frame,
//! bit set meaning allocated. Allocation is a first-fit linear scan from a
//! rotating hint; freeing pulls the hint back so address-ordered reuse is
//! preserved. The allocator never zeroes frames.

use spin::Mutex;

use super::{MemoryRegion, PhysicalAddress, FRAME_SIZE};

/// Upper bound on managed memory: 512 MiB (one bit per frame).
const BITMAP_WORDS: usize = 2048;
const MAX_MANAGED_FRAMES: usize = BITMAP_WORDS * 64;

/// Everything below 1 MiB stays reserved for BIOS and legacy devices.
const LOW_RESERVED: u64 = 0x10_0000;

/// Source of 4 KiB physical frames. The page-table walker takes any
/// implementation so intermediate-table allocation is pluggable.
pub trait FrameSource {
    fn alloc_frame(&mut self) -> Option<PhysicalAddress>;
    fn free_frame(&mut self, frame: PhysicalAddress);
}

/// Allocator statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameAllocatorStats {
    pub managed_frames: usize,
    pub free_frames: usize,
    pub used_frames: usize,
}

/// Bitmap frame allocator over `[phys_base, phys_base + managed)`.
pub struct FrameAllocator {
    /// One bit per frame; set = allocated.
    bitmap: [u64; BITMAP_WORDS],
    phys_base: u64,
    managed_frames: usize,
    free_frames: usize,
    /// First index worth scanning; maintained as a lower bound on the
    /// lowest free frame.
    hint: usize,
}

impl FrameAllocator {
    pub const fn new() -> Self {
        Self {
            bitmap: [u64::MAX; BITMAP_WORDS],
            phys_base: 0,
            managed_frames: 0,
            free_frames: 0,
            hint: 0,
        }
    }

    /// Consume the boot memory map. The managed span starts at the lowest
    /// usable frame at or above 1 MiB; frames inside usable regions are
    /// marked free, everything else (holes, the loaded image, boot
    /// reservations) stays allocated.
    pub fn init(&mut self, regions: &[MemoryRegion]) {
        let mut base = u64::MAX;
        let mut end = 0u64;
        for r in regions.iter().filter(|r| r.usable) {
            let start = r.start.max(LOW_RESERVED);
            if start >= r.start + r.size {
                continue;
            }
            base = base.min(start);
            end = end.max(r.start + r.size);
        }
        if base == u64::MAX {
            log::error!("pmm: boot memory map contains no usable RAM");
            return;
        }

        // Frame-align the span and clamp to bitmap capacity.
        let base = base.next_multiple_of(FRAME_SIZE as u64);
        let end = end & !(FRAME_SIZE as u64 - 1);
        let span_frames = ((end - base) / FRAME_SIZE as u64) as usize;
        self.phys_base = base;
        self.managed_frames = span_frames.min(MAX_MANAGED_FRAMES);
        self.free_frames = 0;

        for r in regions.iter().filter(|r| r.usable) {
            let start = r.start.max(base).next_multiple_of(FRAME_SIZE as u64);
            let stop = (r.start + r.size) & !(FRAME_SIZE as u64 - 1);
            let mut frame = start;
            while frame < stop {
                let idx = ((frame - base) / FRAME_SIZE as u64) as usize;
                if idx >= self.managed_frames {
                    break;
                }
                if self.test_and_clear(idx) {
                    self.free_frames += 1;
                }
                frame += FRAME_SIZE as u64;
            }
        }

        log::info!(
            "pmm: managing {} frames ({} KiB) from {:#x}, {} free",
            self.managed_frames,
            self.managed_frames * FRAME_SIZE / 1024,
            self.phys_base,
            self.free_frames
        );
    }

    fn is_set(&self, idx: usize) -> bool {
        self.bitmap[idx / 64] & (1 << (idx % 64)) != 0
    }

    fn set(&mut self, idx: usize) {
        self.bitmap[idx / 64] |= 1 << (idx % 64);
    }

    /// Clear the bit, reporting whether it was set.
    fn test_and_clear(&mut self, idx: usize) -> bool {
        let was = self.is_set(idx);
        self.bitmap[idx / 64] &= !(1 << (idx % 64));
        was
    }

    fn index_to_phys(&self, idx: usize) -> PhysicalAddress {
        PhysicalAddress::new(self.phys_base + (idx * FRAME_SIZE) as u64)
    }

    fn phys_to_index(&self, phys: PhysicalAddress) -> Option<usize> {
        if !phys.is_frame_aligned() || phys.as_u64() < self.phys_base {
            return None;
        }
        let idx = ((phys.as_u64() - self.phys_base) / FRAME_SIZE as u64) as usize;
        (idx < self.managed_frames).then_some(idx)
    }

    /// Allocate one frame.
    pub fn alloc_page(&mut self) -> Option<PhysicalAddress> {
        self.alloc_pages(1)
    }

    /// Allocate `count` physically contiguous frames. Returns `None` on
    /// exhaustion; never zeroes the memory.
    pub fn alloc_pages(&mut self, count: usize) -> Option<PhysicalAddress> {
        if count == 0 || count > self.managed_frames {
            return None;
        }

        // First fit from the hint, then once more from the bottom in case
        // the only fitting run starts below it.
        for start in [self.hint, 0] {
            if let Some(idx) = self.find_run(start, count) {
                for i in idx..idx + count {
                    self.set(i);
                }
                self.free_frames -= count;
                self.hint = idx + count;
                return Some(self.index_to_phys(idx));
            }
            if start == 0 {
                break;
            }
        }
        None
    }

    fn find_run(&self, from: usize, count: usize) -> Option<usize> {
        let mut run = 0;
        let mut run_start = from;
        for idx in from..self.managed_frames {
            if self.is_set(idx) {
                run = 0;
            } else {
                if run == 0 {
                    run_start = idx;
                }
                run += 1;
                if run == count {
                    return Some(run_start);
                }
            }
        }
        None
    }

    /// Free one frame. Double-free and out-of-range frees are diagnosed
    /// no-ops.
    pub fn free_page(&mut self, phys: PhysicalAddress) {
        self.free_pages(phys, 1);
    }

    /// Free `count` frames starting at `phys`.
    pub fn free_pages(&mut self, phys: PhysicalAddress, count: usize) {
        let Some(base_idx) = self.phys_to_index(phys) else {
            log::warn!("pmm: free of unmanaged address {:#x}", phys.as_u64());
            return;
        };
        if base_idx + count > self.managed_frames {
            log::warn!(
                "pmm: free range {:#x}+{} exceeds managed span",
                phys.as_u64(),
                count
            );
            return;
        }
        for idx in base_idx..base_idx + count {
            if self.test_and_clear(idx) {
                self.free_frames += 1;
            } else {
                log::warn!(
                    "pmm: double free of frame {:#x}",
                    self.index_to_phys(idx).as_u64()
                );
            }
        }
        self.hint = self.hint.min(base_idx);
    }

    pub fn stats(&self) -> FrameAllocatorStats {
        FrameAllocatorStats {
            managed_frames: self.managed_frames,
            free_frames: self.free_frames,
            used_frames: self.managed_frames - self.free_frames,
        }
    }
}

impl Default for FrameAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSource for FrameAllocator {
    fn alloc_frame(&mut self) -> Option<PhysicalAddress> {
        self.alloc_page()
    }

    fn free_frame(&mut self, frame: PhysicalAddress) {
        self.free_page(frame);
    }
}

/// Global frame allocator instance
pub static PMM: Mutex<FrameAllocator> = Mutex::new(FrameAllocator::new());

/// Initialize the global allocator from the boot memory map.
pub fn init(regions: &[MemoryRegion]) {
    PMM.lock().init(regions);
}

pub fn alloc_page() -> Option<PhysicalAddress> {
    PMM.lock().alloc_page()
}

pub fn alloc_pages(count: usize) -> Option<PhysicalAddress> {
    PMM.lock().alloc_pages(count)
}

pub fn free_page(phys: PhysicalAddress) {
    PMM.lock().free_page(phys);
}

pub fn free_pages(phys: PhysicalAddress, count: usize) {
    PMM.lock().free_pages(phys, count);
}

pub fn stats() -> FrameAllocatorStats {
    PMM.lock().stats()
}
