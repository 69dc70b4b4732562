//! Kernel heap
//!
//! Carves one contiguous power-of-two region out of the PMM, hands it to
//! the buddy allocator, and brings up the slab caches on top. The
//! `#[global_allocator]` (bare metal only; host tests use the system
//! allocator) routes through `kmalloc`/`kfree`, with a layout-aware
//! escape hatch for large high-alignment requests that the routing
//! header cannot serve.

use super::buddy::{self, BuddyAllocator};
use super::{pmm, slab, FRAME_SIZE};
use crate::error::{KernelError, KernelResult};

/// Size of the buddy-managed heap region (16 MiB, power of two).
pub const HEAP_SIZE: usize = 16 * 1024 * 1024;

/// Initialize the heap: buddy region plus built-in slab caches. Requires
/// `mm::init` and `pmm::init` to have run.
pub fn init() -> KernelResult<()> {
    let pages = HEAP_SIZE / FRAME_SIZE;
    let phys = pmm::alloc_pages(pages).ok_or(KernelError::OutOfMemory {
        requested: HEAP_SIZE,
    })?;

    let allocator = BuddyAllocator::init(phys, HEAP_SIZE, super::phys_offset());
    *buddy::BUDDY.lock() = Some(allocator);
    slab::init();

    log::info!(
        "heap: {} MiB buddy region at {:#x}",
        HEAP_SIZE / (1024 * 1024),
        phys.as_u64()
    );
    Ok(())
}

/// Bytes currently free in the heap region.
pub fn free_bytes() -> usize {
    buddy::free_bytes()
}

/// Bytes currently allocated from the heap region.
pub fn used_bytes() -> usize {
    buddy::used_bytes()
}

#[cfg(target_os = "none")]
mod global {
    use core::alloc::{GlobalAlloc, Layout};

    use super::super::{buddy, slab, PhysicalAddress};

    /// Requests above one page with alignment beyond the routing header
    /// bypass `kmalloc` and take whole buddy blocks, whose bases are page
    /// aligned.
    const HEADER_ALIGN: usize = 16;

    struct KernelHeap;

    fn is_direct(layout: Layout) -> bool {
        layout.size().max(layout.align()) > 4096 && layout.align() > HEADER_ALIGN
    }

    unsafe impl GlobalAlloc for KernelHeap {
        unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
            let request = layout.size().max(layout.align());
            if is_direct(layout) {
                return match buddy::alloc(request) {
                    Some(phys) => (phys.as_u64() + super::super::phys_offset()) as *mut u8,
                    None => core::ptr::null_mut(),
                };
            }
            slab::kmalloc(request)
        }

        unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
            if is_direct(layout) {
                buddy::free(PhysicalAddress::new(
                    ptr as u64 - super::super::phys_offset(),
                ));
                return;
            }
            slab::kfree(ptr);
        }
    }

    #[global_allocator]
    static HEAP: KernelHeap = KernelHeap;
}
