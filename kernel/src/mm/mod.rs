//! Memory management
//!
//! Shared address types and the physical direct map, plus the layered
//! allocators: bitmap frame allocator ([`pmm`]), 4-level page tables
//! ([`vmm`]), power-of-two page groups ([`buddy`]), object caches and
//! `kmalloc` ([`slab`]), and the global-allocator glue ([`heap`]).
//!
//! Initialization order is load-bearing: the direct map offset must be
//! recorded (`mm::init`) before the PMM hands out frames, and PMM before
//! anything that allocates.

pub mod buddy;
pub mod heap;
pub mod pmm;
pub mod slab;
pub mod vmm;

use core::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;

/// Size of a physical frame and of a virtual page (4 KiB)
pub const FRAME_SIZE: usize = 4096;

/// Size of a 2 MiB huge mapping at the page-directory level
pub const HUGE_PAGE_SIZE: usize = 2 * 1024 * 1024;

/// Physical memory address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PhysicalAddress(pub u64);

impl PhysicalAddress {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub const fn as_usize(&self) -> usize {
        self.0 as usize
    }

    pub const fn is_frame_aligned(&self) -> bool {
        self.0 % FRAME_SIZE as u64 == 0
    }

    pub const fn offset(&self, offset: u64) -> Self {
        Self(self.0 + offset)
    }
}

/// Virtual memory address
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct VirtualAddress(pub u64);

impl VirtualAddress {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub const fn is_page_aligned(&self) -> bool {
        self.0 % FRAME_SIZE as u64 == 0
    }

    pub fn as_ptr<T>(&self) -> *const T {
        self.0 as *const T
    }

    pub fn as_mut_ptr<T>(&self) -> *mut T {
        self.0 as *mut T
    }
}

bitflags! {
    /// Page table entry flag bits, written verbatim into leaf entries.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u64 {
        const PRESENT       = 1 << 0;
        const WRITABLE      = 1 << 1;
        const USER          = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const NO_CACHE      = 1 << 4;
        const ACCESSED      = 1 << 5;
        const DIRTY         = 1 << 6;
        const HUGE          = 1 << 7;
        const GLOBAL        = 1 << 8;
        const NO_EXECUTE    = 1 << 63;
    }
}

impl PageFlags {
    /// Flags for ordinary kernel data mappings.
    pub const KERNEL_DATA: Self = Self::PRESENT.union(Self::WRITABLE);

    /// Flags for device MMIO windows.
    pub const MMIO: Self = Self::PRESENT
        .union(Self::WRITABLE)
        .union(Self::WRITE_THROUGH)
        .union(Self::NO_CACHE);
}

/// One region of the boot memory map.
#[derive(Debug, Clone, Copy)]
pub struct MemoryRegion {
    pub start: u64,
    pub size: u64,
    pub usable: bool,
}

// Physical-to-virtual offset of the boot-provided direct map. Written once
// during `init`, read on every phys_to_virt translation.
static PHYS_OFFSET: AtomicU64 = AtomicU64::new(0);

/// Record the direct-map offset. Must run before the PMM or Buddy hand out
/// any memory that will be touched through the direct map.
pub fn init(phys_offset: u64) {
    PHYS_OFFSET.store(phys_offset, Ordering::Release);
    log::info!("mm: physical direct map at offset {:#x}", phys_offset);
}

/// View a physical address through the direct map.
///
/// Valid for any address inside PMM-managed RAM and for MMIO windows the
/// kernel has mapped at the same offset.
pub fn phys_to_virt(phys: PhysicalAddress) -> VirtualAddress {
    VirtualAddress::new(phys.as_u64() + PHYS_OFFSET.load(Ordering::Acquire))
}

/// The recorded direct-map offset.
pub fn phys_offset() -> u64 {
    PHYS_OFFSET.load(Ordering::Acquire)
}
