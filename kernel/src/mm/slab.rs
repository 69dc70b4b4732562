//! Slab allocator
//!
//! Named fixed-object-size caches layered on the buddy allocator. Each
//! slab is one buddy block carrying a header, an intrusive free list of
//! objects, and a back-pointer state; slabs move between the cache's
//! empty/partial/full lists as their free counts change. `kmalloc` routes
//! small requests to the power-of-two built-in caches and large ones to
//! the buddy allocator behind a routing header.

use core::ptr;

use spin::Mutex;

use super::buddy::{self, BuddyAllocator, MAX_ORDER};
use super::PhysicalAddress;
use crate::error::{KernelError, KernelResult};

/// Capacity of the cache registry.
pub const MAX_CACHES: usize = 32;

/// A slab must hold at least this many objects.
const MIN_OBJECTS_PER_SLAB: usize = 8;

/// Built-in `kmalloc` size classes.
pub const KMALLOC_SIZES: [usize; 8] = [32, 64, 128, 256, 512, 1024, 2048, 4096];

const SLAB_MAGIC: u32 = 0x51AB_CAFE;
const BIG_MAGIC: u32 = 0xB16A_110C;

/// Constructor/destructor hooks, run once per object at slab creation and
/// slab release.
pub type ObjectCtor = fn(*mut u8);
pub type ObjectDtor = fn(*mut u8);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlabState {
    Empty,
    Partial,
    Full,
}

/// Header at the front of every slab block.
#[repr(C)]
struct SlabHeader {
    magic: u32,
    state: SlabState,
    prev: *mut SlabHeader,
    next: *mut SlabHeader,
    free_list: *mut FreeObject,
    free_objects: usize,
    num_objects: usize,
    /// Physical base of the block, for returning it to buddy.
    phys: u64,
}

#[repr(C)]
struct FreeObject {
    next: *mut FreeObject,
}

/// Routing header prepended to buddy-backed `kmalloc` allocations.
#[repr(C)]
struct BigHeader {
    magic: u32,
    order: u32,
    requested_size: usize,
}

const BIG_HEADER_SIZE: usize = 16;

/// One object cache.
pub struct SlabCache {
    name: &'static str,
    object_size: usize,
    /// Distance between consecutive objects.
    stride: usize,
    /// Offset of the first object from the slab base.
    objects_offset: usize,
    slab_order: usize,
    objects_per_slab: usize,
    phys_offset: u64,
    empty: *mut SlabHeader,
    partial: *mut SlabHeader,
    full: *mut SlabHeader,
    num_slabs: usize,
    ctor: Option<ObjectCtor>,
    dtor: Option<ObjectDtor>,
}

// SAFETY: slab headers live in buddy memory reached through the direct
// map; caches are used behind the registry lock.
unsafe impl Send for SlabCache {}

impl SlabCache {
    /// Lay out a cache for `object_size`-byte objects. Fails when the size
    /// is zero or too large for a maximum-order slab to hold one object.
    pub fn new(
        name: &'static str,
        object_size: usize,
        phys_offset: u64,
        ctor: Option<ObjectCtor>,
        dtor: Option<ObjectDtor>,
    ) -> KernelResult<Self> {
        if object_size == 0 {
            return Err(KernelError::InvalidArgument {
                what: "zero object size",
            });
        }
        let stride = object_size
            .max(core::mem::size_of::<FreeObject>())
            .next_multiple_of(8);
        let align = if stride.is_power_of_two() {
            stride.min(4096)
        } else {
            16
        };
        let objects_offset = core::mem::size_of::<SlabHeader>().next_multiple_of(align);

        let fits = |order: usize| (super::FRAME_SIZE << order).saturating_sub(objects_offset) / stride;
        let slab_order = (0..=MAX_ORDER)
            .find(|&o| fits(o) >= MIN_OBJECTS_PER_SLAB)
            .or_else(|| (fits(MAX_ORDER) >= 1).then_some(MAX_ORDER))
            .ok_or(KernelError::InvalidArgument {
                what: "object size exceeds maximum slab",
            })?;

        Ok(Self {
            name,
            object_size,
            stride,
            objects_offset,
            slab_order,
            objects_per_slab: fits(slab_order),
            phys_offset,
            empty: ptr::null_mut(),
            partial: ptr::null_mut(),
            full: ptr::null_mut(),
            num_slabs: 0,
            ctor,
            dtor,
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn object_size(&self) -> usize {
        self.object_size
    }

    fn list_head(&mut self, state: SlabState) -> &mut *mut SlabHeader {
        match state {
            SlabState::Empty => &mut self.empty,
            SlabState::Partial => &mut self.partial,
            SlabState::Full => &mut self.full,
        }
    }

    fn push(&mut self, slab: *mut SlabHeader, state: SlabState) {
        let head = self.list_head(state);
        // SAFETY: slab points at a live header owned by this cache.
        unsafe {
            (*slab).prev = ptr::null_mut();
            (*slab).next = *head;
            if !(*head).is_null() {
                (**head).prev = slab;
            }
            *head = slab;
            (*slab).state = state;
        }
    }

    fn unlink(&mut self, slab: *mut SlabHeader) {
        // SAFETY: slab is on the list named by its state field.
        unsafe {
            let state = (*slab).state;
            let prev = (*slab).prev;
            let next = (*slab).next;
            if prev.is_null() {
                *self.list_head(state) = next;
            } else {
                (*prev).next = next;
            }
            if !next.is_null() {
                (*next).prev = prev;
            }
        }
    }

    fn state_for(&self, free_objects: usize, num_objects: usize) -> SlabState {
        if free_objects == 0 {
            SlabState::Full
        } else if free_objects == num_objects {
            SlabState::Empty
        } else {
            SlabState::Partial
        }
    }

    /// Re-home a slab after its free count changed.
    fn update_state(&mut self, slab: *mut SlabHeader) {
        // SAFETY: slab is live and on the list its state names.
        let (current, target) = unsafe {
            (
                (*slab).state,
                self.state_for((*slab).free_objects, (*slab).num_objects),
            )
        };
        if current != target {
            self.unlink(slab);
            self.push(slab, target);
        }
    }

    /// Carve a fresh slab out of a buddy block.
    fn grow(&mut self, buddy: &mut BuddyAllocator) -> Option<*mut SlabHeader> {
        let phys = buddy.alloc_order(self.slab_order)?;
        let base = (phys.as_u64() + self.phys_offset) as *mut u8;
        let slab = base as *mut SlabHeader;

        // SAFETY: the block is freshly allocated and covered by the direct
        // map; header and objects are laid out within it.
        unsafe {
            (*slab) = SlabHeader {
                magic: SLAB_MAGIC,
                state: SlabState::Empty,
                prev: ptr::null_mut(),
                next: ptr::null_mut(),
                free_list: ptr::null_mut(),
                free_objects: self.objects_per_slab,
                num_objects: self.objects_per_slab,
                phys: phys.as_u64(),
            };
            for i in (0..self.objects_per_slab).rev() {
                let obj = base.add(self.objects_offset + i * self.stride);
                if let Some(ctor) = self.ctor {
                    ctor(obj);
                }
                let node = obj as *mut FreeObject;
                (*node).next = (*slab).free_list;
                (*slab).free_list = node;
            }
        }

        self.push(slab, SlabState::Empty);
        self.num_slabs += 1;
        Some(slab)
    }

    /// Allocate one object. Prefers partial slabs, then empty, then grows.
    pub fn alloc(&mut self, buddy: &mut BuddyAllocator) -> Option<*mut u8> {
        let slab = if !self.partial.is_null() {
            self.partial
        } else if !self.empty.is_null() {
            self.empty
        } else {
            self.grow(buddy)?
        };

        // SAFETY: a slab on the partial or empty list has a non-empty free
        // list.
        let obj = unsafe {
            let node = (*slab).free_list;
            debug_assert!(!node.is_null(), "slab state out of sync with free list");
            (*slab).free_list = (*node).next;
            (*slab).free_objects -= 1;
            node as *mut u8
        };
        self.update_state(slab);
        Some(obj)
    }

    /// Locate the slab owning `ptr`, if any.
    fn owner_of(&self, ptr_addr: u64) -> Option<*mut SlabHeader> {
        for head in [self.full, self.partial, self.empty] {
            let mut slab = head;
            while !slab.is_null() {
                let base = slab as u64;
                let start = base + self.objects_offset as u64;
                let end = base + (super::FRAME_SIZE << self.slab_order) as u64;
                if ptr_addr >= start
                    && ptr_addr < end
                    && (ptr_addr - start) % self.stride as u64 == 0
                {
                    return Some(slab);
                }
                // SAFETY: walking a well-formed slab list.
                slab = unsafe { (*slab).next };
            }
        }
        None
    }

    /// Return an object to its slab. Reports `false` for pointers this
    /// cache does not own.
    pub fn free(&mut self, obj: *mut u8) -> bool {
        let Some(slab) = self.owner_of(obj as u64) else {
            return false;
        };
        // SAFETY: obj lies on an object boundary of `slab`.
        unsafe {
            let node = obj as *mut FreeObject;
            (*node).next = (*slab).free_list;
            (*slab).free_list = node;
            (*slab).free_objects += 1;
            debug_assert!((*slab).free_objects <= (*slab).num_objects);
        }
        self.update_state(slab);
        true
    }

    /// Release every empty slab back to buddy. Returns the number freed.
    pub fn shrink(&mut self, buddy: &mut BuddyAllocator) -> usize {
        let mut freed = 0;
        while !self.empty.is_null() {
            let slab = self.empty;
            self.unlink(slab);
            // SAFETY: the slab is empty; every object is in constructed
            // state and due for its destructor before the memory goes.
            unsafe {
                if let Some(dtor) = self.dtor {
                    let base = slab as *mut u8;
                    for i in 0..(*slab).num_objects {
                        dtor(base.add(self.objects_offset + i * self.stride));
                    }
                }
                (*slab).magic = 0;
                buddy.free(PhysicalAddress::new((*slab).phys));
            }
            self.num_slabs -= 1;
            freed += 1;
        }
        freed
    }

    /// Tear the cache down. Fails while objects are still in use.
    pub fn destroy(&mut self, buddy: &mut BuddyAllocator) -> KernelResult<()> {
        if !self.partial.is_null() || !self.full.is_null() {
            return Err(KernelError::Permission {
                operation: "destroying a cache with live objects",
            });
        }
        self.shrink(buddy);
        Ok(())
    }

    pub fn num_slabs(&self) -> usize {
        self.num_slabs
    }

    fn count_list(head: *mut SlabHeader) -> usize {
        let mut n = 0;
        let mut slab = head;
        while !slab.is_null() {
            n += 1;
            // SAFETY: walking a well-formed slab list.
            slab = unsafe { (*slab).next };
        }
        n
    }

    /// (empty, partial, full) list lengths.
    pub fn list_counts(&self) -> (usize, usize, usize) {
        (
            Self::count_list(self.empty),
            Self::count_list(self.partial),
            Self::count_list(self.full),
        )
    }

    /// Verify the per-slab accounting invariants. Panics on corruption;
    /// used by the integration harness and the unit tests.
    pub fn check_integrity(&self) {
        let (e, p, f) = self.list_counts();
        assert_eq!(e + p + f, self.num_slabs, "slab list totals diverged");
        for (head, expect) in [
            (self.empty, SlabState::Empty),
            (self.partial, SlabState::Partial),
            (self.full, SlabState::Full),
        ] {
            let mut slab = head;
            while !slab.is_null() {
                // SAFETY: walking well-formed slab lists.
                unsafe {
                    assert_eq!((*slab).magic, SLAB_MAGIC);
                    assert_eq!((*slab).state, expect);
                    assert_eq!(
                        self.state_for((*slab).free_objects, (*slab).num_objects),
                        expect
                    );
                    let mut free_walk = 0;
                    let mut node = (*slab).free_list;
                    while !node.is_null() {
                        free_walk += 1;
                        node = (*node).next;
                    }
                    assert_eq!(free_walk, (*slab).free_objects);
                    slab = (*slab).next;
                }
            }
        }
    }
}

/// Handle to a registered cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheId(usize);

struct SlabRegistry {
    caches: [Option<SlabCache>; MAX_CACHES],
}

impl SlabRegistry {
    const fn new() -> Self {
        Self {
            caches: [const { None }; MAX_CACHES],
        }
    }
}

static REGISTRY: Mutex<SlabRegistry> = Mutex::new(SlabRegistry::new());

/// Create the built-in `kmalloc` caches. Called once by `heap::init`.
pub fn init() {
    for size in KMALLOC_SIZES {
        let name = kmalloc_cache_name(size);
        cache_create(name, size, None, None).expect("built-in cache creation cannot fail");
    }
    log::info!("slab: {} built-in caches ready", KMALLOC_SIZES.len());
}

fn kmalloc_cache_name(size: usize) -> &'static str {
    match size {
        32 => "kmalloc-32",
        64 => "kmalloc-64",
        128 => "kmalloc-128",
        256 => "kmalloc-256",
        512 => "kmalloc-512",
        1024 => "kmalloc-1024",
        2048 => "kmalloc-2048",
        4096 => "kmalloc-4096",
        _ => "kmalloc-?",
    }
}

/// Register a new cache. Fails on duplicate name or registry exhaustion.
pub fn cache_create(
    name: &'static str,
    object_size: usize,
    ctor: Option<ObjectCtor>,
    dtor: Option<ObjectDtor>,
) -> KernelResult<CacheId> {
    let mut reg = REGISTRY.lock();
    if reg
        .caches
        .iter()
        .flatten()
        .any(|c| c.name == name)
    {
        return Err(KernelError::AlreadyExists { what: "slab cache" });
    }
    let slot = reg
        .caches
        .iter()
        .position(|c| c.is_none())
        .ok_or(KernelError::InvalidArgument {
            what: "cache registry full",
        })?;
    reg.caches[slot] = Some(SlabCache::new(
        name,
        object_size,
        super::phys_offset(),
        ctor,
        dtor,
    )?);
    Ok(CacheId(slot))
}

/// Destroy a cache, releasing its slabs. Fails while objects are live.
pub fn cache_destroy(id: CacheId) -> KernelResult<()> {
    let mut reg = REGISTRY.lock();
    let cache = reg.caches[id.0].as_mut().ok_or(KernelError::NotFound {
        what: "slab cache",
    })?;
    {
        let mut buddy = buddy::BUDDY.lock();
        cache.destroy(buddy.as_mut().expect("buddy allocator not initialized"))?;
    }
    reg.caches[id.0] = None;
    Ok(())
}

/// Allocate one object from a registered cache.
pub fn alloc(id: CacheId) -> Option<*mut u8> {
    let mut reg = REGISTRY.lock();
    let cache = reg.caches[id.0].as_mut()?;
    let mut buddy = buddy::BUDDY.lock();
    cache.alloc(buddy.as_mut().expect("buddy allocator not initialized"))
}

/// Return an object to a registered cache.
pub fn free(id: CacheId, obj: *mut u8) {
    let mut reg = REGISTRY.lock();
    if let Some(cache) = reg.caches[id.0].as_mut() {
        if !cache.free(obj) {
            log::error!(
                "slab: free of foreign pointer {:p} to cache {}",
                obj,
                cache.name
            );
        }
    }
}

/// Release empty slabs from a registered cache.
pub fn cache_shrink(id: CacheId) -> usize {
    let mut reg = REGISTRY.lock();
    let Some(cache) = reg.caches[id.0].as_mut() else {
        return 0;
    };
    let mut buddy = buddy::BUDDY.lock();
    cache.shrink(buddy.as_mut().expect("buddy allocator not initialized"))
}

/// Allocate `size` bytes: small requests from the smallest fitting cache,
/// larger ones straight from buddy behind a routing header. Returns null
/// on exhaustion.
pub fn kmalloc(size: usize) -> *mut u8 {
    if size == 0 {
        return ptr::null_mut();
    }

    if size <= *KMALLOC_SIZES.last().unwrap() {
        let mut reg = REGISTRY.lock();
        let mut buddy = buddy::BUDDY.lock();
        let buddy = buddy.as_mut().expect("buddy allocator not initialized");
        for cache in reg.caches.iter_mut().flatten() {
            if cache.name.starts_with("kmalloc-") && cache.object_size >= size {
                return cache.alloc(buddy).unwrap_or(ptr::null_mut());
            }
        }
        return ptr::null_mut();
    }

    let Some(order) = buddy::order_for_size(size + BIG_HEADER_SIZE) else {
        return ptr::null_mut();
    };
    let Some(phys) = buddy::alloc_order(order) else {
        return ptr::null_mut();
    };
    let base = (phys.as_u64() + super::phys_offset()) as *mut u8;
    // SAFETY: the block is freshly allocated and large enough for the
    // header plus `size` payload bytes.
    unsafe {
        let header = base as *mut BigHeader;
        (*header) = BigHeader {
            magic: BIG_MAGIC,
            order: order as u32,
            requested_size: size,
        };
        base.add(BIG_HEADER_SIZE)
    }
}

/// Free a `kmalloc` allocation. Routes by cache membership first, then by
/// the big-allocation header; anything else is reported as foreign.
pub fn kfree(obj: *mut u8) {
    if obj.is_null() {
        return;
    }

    {
        let mut reg = REGISTRY.lock();
        for cache in reg.caches.iter_mut().flatten() {
            if cache.free(obj) {
                return;
            }
        }
    }

    // SAFETY: reading the candidate header just below the pointer; the
    // magic gate rejects pointers that did not come from the big path.
    unsafe {
        let header = obj.sub(BIG_HEADER_SIZE) as *mut BigHeader;
        if (*header).magic == BIG_MAGIC {
            (*header).magic = 0;
            let phys = PhysicalAddress::new(header as u64 - super::phys_offset());
            buddy::free(phys);
            return;
        }
    }

    log::error!("slab: kfree of foreign pointer {:p}", obj);
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use crate::mm::FRAME_SIZE;
    use std::alloc::{alloc_zeroed, dealloc, Layout};
    use std::collections::BTreeSet;
    use std::vec::Vec;

    struct Region {
        ptr: *mut u8,
        size: usize,
    }

    impl Region {
        fn new(size: usize) -> Self {
            let layout = Layout::from_size_align(size, FRAME_SIZE).unwrap();
            // SAFETY: layout is non-zero sized.
            let ptr = unsafe { alloc_zeroed(layout) };
            assert!(!ptr.is_null());
            Self { ptr, size }
        }

        fn allocator(&self) -> BuddyAllocator {
            BuddyAllocator::init(PhysicalAddress::new(self.ptr as u64), self.size, 0)
        }
    }

    impl Drop for Region {
        fn drop(&mut self) {
            let layout = Layout::from_size_align(self.size, FRAME_SIZE).unwrap();
            // SAFETY: ptr came from alloc_zeroed with this layout.
            unsafe { dealloc(self.ptr, layout) };
        }
    }

    #[test]
    fn layout_holds_at_least_eight_objects() {
        let cache = SlabCache::new("objs-64", 64, 0, None, None).unwrap();
        assert!(cache.objects_per_slab >= MIN_OBJECTS_PER_SLAB);
        let cache = SlabCache::new("objs-4096", 4096, 0, None, None).unwrap();
        assert!(cache.objects_per_slab >= MIN_OBJECTS_PER_SLAB);
    }

    #[test]
    fn alloc_free_moves_slabs_between_lists() {
        let region = Region::new(8 * 1024 * 1024);
        let mut buddy = region.allocator();
        let mut cache = SlabCache::new("objs-128", 128, 0, None, None).unwrap();

        let per_slab = cache.objects_per_slab;
        let mut objs = Vec::new();
        for _ in 0..per_slab {
            objs.push(cache.alloc(&mut buddy).expect("object"));
        }
        // Exactly one slab, completely full.
        assert_eq!(cache.num_slabs(), 1);
        assert_eq!(cache.list_counts(), (0, 0, 1));
        cache.check_integrity();

        // One more allocation forces a second slab.
        objs.push(cache.alloc(&mut buddy).expect("object"));
        assert_eq!(cache.num_slabs(), 2);
        assert_eq!(cache.list_counts(), (0, 1, 1));

        // Free everything; both slabs end up empty.
        for obj in objs.drain(..) {
            assert!(cache.free(obj));
        }
        assert_eq!(cache.list_counts(), (2, 0, 0));
        cache.check_integrity();

        assert_eq!(cache.shrink(&mut buddy), 2);
        assert_eq!(cache.num_slabs(), 0);
    }

    #[test]
    fn freed_objects_are_reused() {
        let region = Region::new(4 * 1024 * 1024);
        let mut buddy = region.allocator();
        let mut cache = SlabCache::new("objs-64", 64, 0, None, None).unwrap();

        let mut first: Vec<*mut u8> = (0..10)
            .map(|_| cache.alloc(&mut buddy).expect("object"))
            .collect();
        let freed: BTreeSet<u64> = first.iter().map(|p| *p as u64).collect();
        for obj in first.drain(..).rev() {
            assert!(cache.free(obj));
        }

        let again: BTreeSet<u64> = (0..10)
            .map(|_| cache.alloc(&mut buddy).expect("object") as u64)
            .collect();
        assert_eq!(freed, again, "reallocation must reuse the freed objects");
    }

    #[test]
    fn foreign_pointer_is_rejected() {
        let region = Region::new(4 * 1024 * 1024);
        let mut buddy = region.allocator();
        let mut cache = SlabCache::new("objs-32", 32, 0, None, None).unwrap();
        let obj = cache.alloc(&mut buddy).unwrap();

        let mut not_ours = [0u8; 32];
        assert!(!cache.free(not_ours.as_mut_ptr()));
        // Interior pointers (not on an object boundary) are foreign too.
        // SAFETY: stays within the allocated object.
        let interior = unsafe { obj.add(1) };
        assert!(!cache.free(interior));
        assert!(cache.free(obj));
    }

    #[test]
    fn ctor_runs_once_per_object_dtor_on_release() {
        use core::sync::atomic::{AtomicUsize, Ordering};
        static CTOR_RUNS: AtomicUsize = AtomicUsize::new(0);
        static DTOR_RUNS: AtomicUsize = AtomicUsize::new(0);

        fn ctor(obj: *mut u8) {
            CTOR_RUNS.fetch_add(1, Ordering::Relaxed);
            // SAFETY: the cache hands this hook a 48-byte object.
            unsafe { ptr::write_bytes(obj, 0xA5, 8) };
        }
        fn dtor(_obj: *mut u8) {
            DTOR_RUNS.fetch_add(1, Ordering::Relaxed);
        }

        let region = Region::new(4 * 1024 * 1024);
        let mut buddy = region.allocator();
        let mut cache = SlabCache::new("ctor-objs", 48, 0, Some(ctor), Some(dtor)).unwrap();

        let a = cache.alloc(&mut buddy).unwrap();
        // SAFETY: reading the constructed prefix of our own object.
        assert_eq!(unsafe { *a }, 0xA5);
        let per_slab = cache.objects_per_slab;
        assert_eq!(CTOR_RUNS.load(Ordering::Relaxed), per_slab);

        // Alloc/free churn does not re-run the constructor.
        cache.free(a);
        let _b = cache.alloc(&mut buddy).unwrap();
        assert_eq!(CTOR_RUNS.load(Ordering::Relaxed), per_slab);

        cache.free(_b);
        cache.shrink(&mut buddy);
        assert_eq!(DTOR_RUNS.load(Ordering::Relaxed), per_slab);
    }

    #[test]
    fn destroy_refuses_while_objects_live() {
        let region = Region::new(4 * 1024 * 1024);
        let mut buddy = region.allocator();
        let mut cache = SlabCache::new("objs-256", 256, 0, None, None).unwrap();
        let obj = cache.alloc(&mut buddy).unwrap();
        assert!(matches!(
            cache.destroy(&mut buddy),
            Err(KernelError::Permission { .. })
        ));
        cache.free(obj);
        cache.destroy(&mut buddy).unwrap();
        assert_eq!(cache.num_slabs(), 0);
    }
}
