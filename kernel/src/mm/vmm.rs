//! Virtual memory manager
//!
//! Owns the 4-level page-table tree. All table memory is touched through
//! the physical direct map, so walks never require temporary mappings.
//! Intermediate tables are created on first use from a [`FrameSource`]
//! and zeroed before being linked; they are not reclaimed on unmap.

use spin::Mutex;

use super::pmm::FrameSource;
use super::{PageFlags, PhysicalAddress, VirtualAddress, FRAME_SIZE, HUGE_PAGE_SIZE};
use crate::error::{KernelError, KernelResult};

/// Number of entries in a page table
pub const PAGE_TABLE_ENTRIES: usize = 512;

const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

/// Page table entry
#[derive(Debug, Clone, Copy)]
#[repr(transparent)]
pub struct PageTableEntry(u64);

impl PageTableEntry {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn raw(&self) -> u64 {
        self.0
    }

    pub const fn is_present(&self) -> bool {
        self.0 & PageFlags::PRESENT.bits() != 0
    }

    pub const fn is_huge(&self) -> bool {
        self.0 & PageFlags::HUGE.bits() != 0
    }

    pub fn addr(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.0 & ADDR_MASK)
    }

    pub fn flags(&self) -> PageFlags {
        PageFlags::from_bits_truncate(self.0 & !ADDR_MASK)
    }

    /// Point the entry at `phys` with `flags` written verbatim.
    pub fn set(&mut self, phys: PhysicalAddress, flags: PageFlags) {
        self.0 = (phys.as_u64() & ADDR_MASK) | flags.bits();
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }
}

/// A page table with 512 entries
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; PAGE_TABLE_ENTRIES],
}

impl PageTable {
    pub fn zero(&mut self) {
        for entry in &mut self.entries {
            entry.clear();
        }
    }
}

impl core::ops::Index<usize> for PageTable {
    type Output = PageTableEntry;

    fn index(&self, index: usize) -> &Self::Output {
        &self.entries[index]
    }
}

impl core::ops::IndexMut<usize> for PageTable {
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        &mut self.entries[index]
    }
}

/// PML4/PDPT/PD/PT indices of a canonical virtual address.
fn table_indices(virt: VirtualAddress) -> [usize; 4] {
    let v = virt.as_u64();
    [
        ((v >> 39) & 0x1FF) as usize,
        ((v >> 30) & 0x1FF) as usize,
        ((v >> 21) & 0x1FF) as usize,
        ((v >> 12) & 0x1FF) as usize,
    ]
}

/// One 4-level page-table tree, viewed through a fixed physical-to-virtual
/// offset.
pub struct AddressSpace {
    root: PhysicalAddress,
    phys_offset: u64,
}

impl AddressSpace {
    /// Wrap an existing tree rooted at `root`.
    ///
    /// # Safety
    ///
    /// `root` must be the physical address of a valid PML4 and every table
    /// in the tree must be visible at `phys + phys_offset`.
    pub unsafe fn from_root(root: PhysicalAddress, phys_offset: u64) -> Self {
        Self { root, phys_offset }
    }

    /// Create a fresh, empty tree.
    pub fn new(phys_offset: u64, frames: &mut impl FrameSource) -> KernelResult<Self> {
        let root = frames
            .alloc_frame()
            .ok_or(KernelError::OutOfMemory {
                requested: FRAME_SIZE,
            })?;
        let space = Self { root, phys_offset };
        space.table_mut(root).zero();
        Ok(space)
    }

    pub fn root(&self) -> PhysicalAddress {
        self.root
    }

    #[allow(clippy::mut_from_ref)]
    fn table_mut(&self, phys: PhysicalAddress) -> &mut PageTable {
        // SAFETY: every table in this tree is covered by the direct map at
        // `phys_offset`; the tree is externally synchronized (one lock per
        // address space).
        unsafe { &mut *((phys.as_u64() + self.phys_offset) as *mut PageTable) }
    }

    /// Walk to the page table holding the leaf for `virt`, creating
    /// missing intermediate tables.
    fn walk_create(
        &mut self,
        virt: VirtualAddress,
        frames: &mut impl FrameSource,
    ) -> KernelResult<(PhysicalAddress, usize)> {
        let idx = table_indices(virt);
        let mut table_phys = self.root;
        for level in 0..3 {
            let entry = self.table_mut(table_phys)[idx[level]];
            if !entry.is_present() {
                let frame = frames.alloc_frame().ok_or(KernelError::OutOfMemory {
                    requested: FRAME_SIZE,
                })?;
                self.table_mut(frame).zero();
                self.table_mut(table_phys)[idx[level]]
                    .set(frame, PageFlags::PRESENT | PageFlags::WRITABLE);
                table_phys = frame;
            } else {
                if entry.is_huge() {
                    return Err(KernelError::InvalidArgument {
                        what: "virtual address inside a huge mapping",
                    });
                }
                table_phys = entry.addr();
            }
        }
        Ok((table_phys, idx[3]))
    }

    /// Walk to the page table holding the leaf for `virt` without
    /// creating anything.
    fn walk(&self, virt: VirtualAddress) -> KernelResult<(PhysicalAddress, usize)> {
        let idx = table_indices(virt);
        let mut table_phys = self.root;
        for level in 0..3 {
            let entry = self.table_mut(table_phys)[idx[level]];
            if !entry.is_present() {
                return Err(KernelError::NotFound {
                    what: "page table entry",
                });
            }
            if entry.is_huge() {
                return Err(KernelError::InvalidArgument {
                    what: "virtual address inside a huge mapping",
                });
            }
            table_phys = entry.addr();
        }
        Ok((table_phys, idx[3]))
    }

    /// Map the 4 KiB page at `virt` to `phys`. `flags` are written
    /// verbatim into the leaf, so callers include `PRESENT`.
    pub fn map(
        &mut self,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        flags: PageFlags,
        frames: &mut impl FrameSource,
    ) -> KernelResult<()> {
        if !virt.is_page_aligned() || !phys.is_frame_aligned() {
            return Err(KernelError::InvalidArgument {
                what: "unaligned map address",
            });
        }
        let (pt, slot) = self.walk_create(virt, frames)?;
        let entry = &mut self.table_mut(pt)[slot];
        if entry.is_present() {
            return Err(KernelError::AlreadyExists {
                what: "virtual page mapping",
            });
        }
        entry.set(phys, flags);
        flush_tlb_page(virt);
        Ok(())
    }

    /// Remove the 4 KiB mapping at `virt`, returning the frame it pointed
    /// to.
    pub fn unmap(&mut self, virt: VirtualAddress) -> KernelResult<PhysicalAddress> {
        if !virt.is_page_aligned() {
            return Err(KernelError::InvalidArgument {
                what: "unaligned unmap address",
            });
        }
        let (pt, slot) = self.walk(virt)?;
        let entry = &mut self.table_mut(pt)[slot];
        if !entry.is_present() {
            return Err(KernelError::NotFound {
                what: "virtual page mapping",
            });
        }
        let phys = entry.addr();
        entry.clear();
        flush_tlb_page(virt);
        Ok(phys)
    }

    /// Translate `virt` to its physical address, preserving the intra-page
    /// offset. Detects 2 MiB huge entries at the PD level. Returns `None`
    /// when unmapped.
    pub fn translate(&self, virt: VirtualAddress) -> Option<PhysicalAddress> {
        let idx = table_indices(virt);
        let mut table_phys = self.root;
        for level in 0..3 {
            let entry = self.table_mut(table_phys)[idx[level]];
            if !entry.is_present() {
                return None;
            }
            if entry.is_huge() {
                if level != 2 {
                    // 1 GiB mappings are not part of this design.
                    return None;
                }
                let offset = virt.as_u64() & (HUGE_PAGE_SIZE as u64 - 1);
                return Some(PhysicalAddress::new(entry.addr().as_u64() + offset));
            }
            table_phys = entry.addr();
        }
        let entry = self.table_mut(table_phys)[idx[3]];
        if !entry.is_present() {
            return None;
        }
        let offset = virt.as_u64() & (FRAME_SIZE as u64 - 1);
        Some(PhysicalAddress::new(entry.addr().as_u64() + offset))
    }

    pub fn is_mapped(&self, virt: VirtualAddress) -> bool {
        self.translate(virt).is_some()
    }

    /// Allocate a frame and map it at `virt`.
    pub fn alloc_page(
        &mut self,
        virt: VirtualAddress,
        flags: PageFlags,
        frames: &mut impl FrameSource,
    ) -> KernelResult<PhysicalAddress> {
        let phys = frames.alloc_frame().ok_or(KernelError::OutOfMemory {
            requested: FRAME_SIZE,
        })?;
        match self.map(virt, phys, flags, frames) {
            Ok(()) => Ok(phys),
            Err(e) => {
                frames.free_frame(phys);
                Err(e)
            }
        }
    }

    /// Unmap `virt` and return its frame to the source.
    pub fn free_page(
        &mut self,
        virt: VirtualAddress,
        frames: &mut impl FrameSource,
    ) -> KernelResult<()> {
        let phys = self.unmap(virt)?;
        frames.free_frame(phys);
        Ok(())
    }
}

/// Invalidate one page in the TLB.
#[cfg(target_os = "none")]
pub fn flush_tlb_page(virt: VirtualAddress) {
    x86_64::instructions::tlb::flush(x86_64::VirtAddr::new(virt.as_u64()));
}

#[cfg(not(target_os = "none"))]
pub fn flush_tlb_page(_virt: VirtualAddress) {}

/// Invalidate the whole TLB by reloading CR3.
#[cfg(target_os = "none")]
pub fn flush_tlb_all() {
    x86_64::instructions::tlb::flush_all();
}

#[cfg(not(target_os = "none"))]
pub fn flush_tlb_all() {}

/// The kernel address space, captured from CR3 at init.
static KERNEL_SPACE: Mutex<Option<AddressSpace>> = Mutex::new(None);

/// Capture the active page-table root into the global kernel address
/// space. `mm::init` must already have recorded the direct-map offset.
#[cfg(target_os = "none")]
pub fn init() {
    use x86_64::registers::control::Cr3;

    let (frame, _) = Cr3::read();
    let root = PhysicalAddress::new(frame.start_address().as_u64());
    // SAFETY: CR3 points at the live PML4 and the bootloader established
    // full physical-memory coverage at the recorded offset.
    let space = unsafe { AddressSpace::from_root(root, super::phys_offset()) };
    *KERNEL_SPACE.lock() = Some(space);
    log::info!("vmm: kernel address space rooted at {:#x}", root.as_u64());
}

fn with_kernel_space<T>(f: impl FnOnce(&mut AddressSpace) -> T) -> T {
    let mut guard = KERNEL_SPACE.lock();
    let space = guard.as_mut().expect("vmm not initialized");
    f(space)
}

/// Map a page in the kernel address space, backing intermediate tables
/// with the PMM.
pub fn map(virt: VirtualAddress, phys: PhysicalAddress, flags: PageFlags) -> KernelResult<()> {
    with_kernel_space(|s| s.map(virt, phys, flags, &mut *super::pmm::PMM.lock()))
}

pub fn unmap(virt: VirtualAddress) -> KernelResult<PhysicalAddress> {
    with_kernel_space(|s| s.unmap(virt))
}

pub fn translate(virt: VirtualAddress) -> Option<PhysicalAddress> {
    with_kernel_space(|s| s.translate(virt))
}

pub fn is_mapped(virt: VirtualAddress) -> bool {
    with_kernel_space(|s| s.is_mapped(virt))
}

pub fn alloc_page(virt: VirtualAddress, flags: PageFlags) -> KernelResult<PhysicalAddress> {
    with_kernel_space(|s| s.alloc_page(virt, flags, &mut *super::pmm::PMM.lock()))
}

pub fn free_page(virt: VirtualAddress) -> KernelResult<()> {
    with_kernel_space(|s| s.free_page(virt, &mut *super::pmm::PMM.lock()))
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use std::alloc::{alloc_zeroed, dealloc, Layout};
    use std::vec::Vec;

    /// Frame source whose "physical" addresses are host pointers; with a
    /// zero direct-map offset the walker operates on real memory.
    struct TestArena {
        live: Vec<u64>,
    }

    impl TestArena {
        fn new() -> Self {
            Self { live: Vec::new() }
        }

        fn layout() -> Layout {
            Layout::from_size_align(FRAME_SIZE, FRAME_SIZE).unwrap()
        }
    }

    impl FrameSource for TestArena {
        fn alloc_frame(&mut self) -> Option<PhysicalAddress> {
            // SAFETY: layout is non-zero sized.
            let ptr = unsafe { alloc_zeroed(Self::layout()) };
            if ptr.is_null() {
                return None;
            }
            self.live.push(ptr as u64);
            Some(PhysicalAddress::new(ptr as u64))
        }

        fn free_frame(&mut self, frame: PhysicalAddress) {
            let idx = self
                .live
                .iter()
                .position(|&p| p == frame.as_u64())
                .expect("freeing frame not allocated by this arena");
            self.live.swap_remove(idx);
            // SAFETY: the frame came from alloc_zeroed with this layout.
            unsafe { dealloc(frame.as_u64() as *mut u8, Self::layout()) };
        }
    }

    impl Drop for TestArena {
        fn drop(&mut self) {
            for &p in &self.live {
                // SAFETY: every live entry came from alloc_zeroed.
                unsafe { dealloc(p as *mut u8, Self::layout()) };
            }
        }
    }

    const VIRT: VirtualAddress = VirtualAddress::new(0x4000_0000_0000);

    #[test]
    fn map_translate_unmap_roundtrip() {
        let mut arena = TestArena::new();
        let mut space = AddressSpace::new(0, &mut arena).unwrap();

        let phys = PhysicalAddress::new(0x1234_5000);
        space
            .map(VIRT, phys, PageFlags::KERNEL_DATA, &mut arena)
            .unwrap();

        assert!(space.is_mapped(VIRT));
        assert_eq!(space.translate(VIRT), Some(phys));
        // Intra-page offsets survive translation.
        let inner = VirtualAddress::new(VIRT.as_u64() + 0x7FF);
        assert_eq!(
            space.translate(inner),
            Some(PhysicalAddress::new(phys.as_u64() + 0x7FF))
        );

        assert_eq!(space.unmap(VIRT).unwrap(), phys);
        assert!(!space.is_mapped(VIRT));
    }

    #[test]
    fn unmap_of_absent_mapping_is_not_found() {
        let mut arena = TestArena::new();
        let mut space = AddressSpace::new(0, &mut arena).unwrap();
        assert!(matches!(
            space.unmap(VIRT),
            Err(KernelError::NotFound { .. })
        ));
    }

    #[test]
    fn double_map_is_already_exists() {
        let mut arena = TestArena::new();
        let mut space = AddressSpace::new(0, &mut arena).unwrap();
        let phys = PhysicalAddress::new(0x8000);
        space
            .map(VIRT, phys, PageFlags::KERNEL_DATA, &mut arena)
            .unwrap();
        assert!(matches!(
            space.map(VIRT, phys, PageFlags::KERNEL_DATA, &mut arena),
            Err(KernelError::AlreadyExists { .. })
        ));
    }

    #[test]
    fn unaligned_addresses_are_rejected() {
        let mut arena = TestArena::new();
        let mut space = AddressSpace::new(0, &mut arena).unwrap();
        let odd = VirtualAddress::new(VIRT.as_u64() + 0x10);
        assert!(matches!(
            space.map(odd, PhysicalAddress::new(0x8000), PageFlags::KERNEL_DATA, &mut arena),
            Err(KernelError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn huge_entry_translates_with_2mib_offset() {
        let mut arena = TestArena::new();
        let mut space = AddressSpace::new(0, &mut arena).unwrap();

        // Map an unrelated page to force intermediate creation down to the
        // PD, then rewrite the PD entry as a huge mapping.
        space
            .map(VIRT, PhysicalAddress::new(0x8000), PageFlags::KERNEL_DATA, &mut arena)
            .unwrap();

        let idx = table_indices(VIRT);
        let mut table = space.root;
        for level in 0..2 {
            table = space.table_mut(table)[idx[level]].addr();
        }
        let huge_base = PhysicalAddress::new(0x4000_0000);
        space.table_mut(table)[idx[2]].set(
            huge_base,
            PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::HUGE,
        );

        let inner = VirtualAddress::new(VIRT.as_u64() + 0x12_3456);
        assert_eq!(
            space.translate(inner),
            Some(PhysicalAddress::new(huge_base.as_u64() + 0x12_3456))
        );
    }

    #[test]
    fn alloc_and_free_page_return_frames_to_source() {
        let mut arena = TestArena::new();
        let mut space = AddressSpace::new(0, &mut arena).unwrap();

        let phys = space
            .alloc_page(VIRT, PageFlags::KERNEL_DATA, &mut arena)
            .unwrap();
        assert_eq!(space.translate(VIRT), Some(phys));

        let live_before = arena.live.len();
        space.free_page(VIRT, &mut arena).unwrap();
        assert_eq!(arena.live.len(), live_before - 1);
        assert!(!space.is_mapped(VIRT));
    }
}
