//! Kernel heap: segregated free-list allocator.
//!
//! The arena is one packed run of headered blocks. Every block carries
//! a magic number (distinct for used and free), its size with the used
//! bit folded in, and a footer mirroring the size word so the previous
//! neighbor can be found during coalescing. Allocated payloads are
//! preceded by a back-pointer to the header, which lets `free` take an
//! arbitrary aligned pointer. Free blocks hang off 32 size-class bins;
//! the last free block at the end of the mapped range (the wilderness)
//! absorbs heap growth.
//!
//! Corruption is never tolerated: a bad magic, mismatched footer or
//! double free panics the kernel on the spot.

use crate::config::FRAME_SIZE;
use crate::sync::IrqMutex;

/// Magic for a live allocation.
const USED_MAGIC: u64 = 0x5a1c_b10c_a110_c8ed;
/// Magic for a free block.
const FREE_MAGIC: u64 = 0x5a1c_b10c_f4ee_0000;
/// Byte pattern written over freed payloads in debug builds.
const POISON_BYTE: u8 = 0xdd;

/// Minimum unit of block granularity and payload alignment.
const ALIGN_MIN: usize = 16;
/// Header bytes: magic, size|flags, user size, two list links, pad.
const HEADER_SIZE: usize = 48;
/// Footer bytes: a copy of the size|flags word.
const FOOTER_SIZE: usize = 8;
/// Back-pointer stored immediately before every user pointer.
const BACKPTR_SIZE: usize = 8;
/// Smallest block that can exist on its own.
const MIN_BLOCK: usize = 80;
/// Number of size-class bins.
const BIN_COUNT: usize = 32;
/// Growth granularity when the arena is extended.
const GROW_CHUNK: usize = 16 * FRAME_SIZE;

const USED_BIT: u64 = 1;
const SIZE_MASK: u64 = !0xf;

/// Heap corruption reports. Produced by [`Heap::check_integrity`]; the
/// runtime paths panic instead of returning these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeapCorruption {
    BadMagic(u64),
    BadFooter(u64),
    BadSize(u64),
    AdjacentFree(u64),
    ArenaSumMismatch { walked: usize, mapped: usize },
    BinLinkBroken(usize),
    BinClassMismatch(usize),
}

/// Allocation statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    pub alloc_count: u64,
    pub free_count: u64,
    pub live_bytes: usize,
    pub peak_bytes: usize,
}

/// Maps the pages backing `[old_end, new_end)` when the heap grows.
pub trait GrowHook: Send + Sync {
    fn grow(&self, old_end: u64, new_end: u64) -> bool;
}

#[repr(C, align(16))]
struct BlockHeader {
    magic: u64,
    size_flags: u64,
    user_size: u64,
    prev_free: *mut BlockHeader,
    next_free: *mut BlockHeader,
    _pad: u64,
}

impl BlockHeader {
    fn size(&self) -> usize {
        (self.size_flags & SIZE_MASK) as usize
    }

    fn is_used(&self) -> bool {
        self.size_flags & USED_BIT != 0
    }
}

/// The allocator proper. Not thread-safe; wrap in [`LockedHeap`].
pub struct Heap {
    base: u64,
    mapped_end: u64,
    limit: u64,
    bins: [*mut BlockHeader; BIN_COUNT],
    /// Free block ending exactly at `mapped_end`, if any.
    wilderness: *mut BlockHeader,
    grow_hook: Option<&'static dyn GrowHook>,
    stats: HeapStats,
}

// SAFETY: raw pointers all target the heap's own arena; access is
// serialized by the LockedHeap wrapper.
unsafe impl Send for Heap {}

/// Bin index for a block size: ceiling(log2), clamped to the bin range.
fn bin_index(size: usize) -> usize {
    debug_assert!(size >= MIN_BLOCK);
    let ceil = usize::BITS - (size - 1).leading_zeros();
    (ceil as usize).clamp(7, 7 + BIN_COUNT - 1) - 7
}

fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

impl Heap {
    pub const fn empty() -> Self {
        Self {
            base: 0,
            mapped_end: 0,
            limit: 0,
            bins: [core::ptr::null_mut(); BIN_COUNT],
            wilderness: core::ptr::null_mut(),
            grow_hook: None,
            stats: HeapStats {
                alloc_count: 0,
                free_count: 0,
                live_bytes: 0,
                peak_bytes: 0,
            },
        }
    }

    /// Initialize over `[base, base + initial_size)`, growable to
    /// `base + limit` through `grow_hook`.
    ///
    /// # Safety
    ///
    /// `base` must be 16-aligned and the initial range mapped, writable
    /// and exclusively owned by the heap.
    pub unsafe fn init(
        &mut self,
        base: u64,
        initial_size: usize,
        limit: usize,
        grow_hook: Option<&'static dyn GrowHook>,
    ) {
        debug_assert_eq!(base % ALIGN_MIN as u64, 0);
        debug_assert!(initial_size >= MIN_BLOCK);
        self.base = base;
        self.mapped_end = base + initial_size as u64;
        self.limit = base + limit as u64;
        self.grow_hook = grow_hook;
        let first = base as *mut BlockHeader;
        // SAFETY: caller guarantees the initial range is mapped and ours.
        unsafe {
            (*first).magic = FREE_MAGIC;
            (*first).size_flags = initial_size as u64;
            (*first).user_size = 0;
            self.write_footer(first);
        }
        self.bin_insert(first);
        self.wilderness = first;
    }

    fn footer_ptr(&self, block: *mut BlockHeader) -> *mut u64 {
        // SAFETY: caller passes a block inside the arena; the footer is
        // the last word of the block.
        unsafe { (block as *mut u8).add((*block).size() - FOOTER_SIZE) as *mut u64 }
    }

    fn write_footer(&self, block: *mut BlockHeader) {
        // SAFETY: block is in-arena; footer slot is within its extent.
        unsafe { *self.footer_ptr(block) = (*block).size_flags };
    }

    fn block_end(&self, block: *mut BlockHeader) -> u64 {
        // SAFETY: in-arena block.
        block as u64 + unsafe { (*block).size() } as u64
    }

    fn bin_insert(&mut self, block: *mut BlockHeader) {
        // SAFETY: block is a valid free header; list heads live in self.
        unsafe {
            debug_assert_eq!((*block).magic, FREE_MAGIC);
            let idx = bin_index((*block).size());
            (*block).prev_free = core::ptr::null_mut();
            (*block).next_free = self.bins[idx];
            if !self.bins[idx].is_null() {
                (*self.bins[idx]).prev_free = block;
            }
            self.bins[idx] = block;
        }
    }

    fn bin_remove(&mut self, block: *mut BlockHeader) {
        // SAFETY: block is linked into the bin computed from its size.
        unsafe {
            let idx = bin_index((*block).size());
            if (*block).prev_free.is_null() {
                debug_assert_eq!(self.bins[idx], block);
                self.bins[idx] = (*block).next_free;
            } else {
                (*(*block).prev_free).next_free = (*block).next_free;
            }
            if !(*block).next_free.is_null() {
                (*(*block).next_free).prev_free = (*block).prev_free;
            }
            (*block).prev_free = core::ptr::null_mut();
            (*block).next_free = core::ptr::null_mut();
        }
    }

    /// Total block size needed to satisfy `user_size` @ `align`. The
    /// `align` term covers the back-pointer slot plus worst-case
    /// padding: the payload area begins 56 bytes into the block, so up
    /// to `align - 8` bytes of padding precede the aligned user pointer.
    fn required_size(user_size: usize, align: usize) -> usize {
        let raw = HEADER_SIZE + align + user_size + FOOTER_SIZE;
        align_up(raw.max(MIN_BLOCK), ALIGN_MIN)
    }

    /// Extend the mapped range to cover at least `needed` more bytes,
    /// merging the fresh space into (or creating) the wilderness.
    fn grow(&mut self, needed: usize) -> bool {
        let hook = match self.grow_hook {
            Some(h) => h,
            None => return false,
        };
        let new_end = (self.mapped_end + align_up(needed, GROW_CHUNK) as u64).min(self.limit);
        if new_end <= self.mapped_end {
            return false;
        }
        let added = (new_end - self.mapped_end) as usize;
        let extends_wilderness =
            !self.wilderness.is_null() && self.block_end(self.wilderness) == self.mapped_end;
        if !extends_wilderness && added < MIN_BLOCK {
            return false;
        }
        if !hook.grow(self.mapped_end, new_end) {
            return false;
        }
        if extends_wilderness {
            let w = self.wilderness;
            self.bin_remove(w);
            // SAFETY: wilderness is a valid free block being widened in
            // place over freshly mapped memory.
            unsafe {
                (*w).size_flags = ((*w).size() + added) as u64;
                self.write_footer(w);
            }
            self.bin_insert(w);
        } else {
            let fresh = self.mapped_end as *mut BlockHeader;
            // SAFETY: [mapped_end, new_end) was just mapped by the hook.
            unsafe {
                (*fresh).magic = FREE_MAGIC;
                (*fresh).size_flags = added as u64;
                (*fresh).user_size = 0;
            }
            self.mapped_end = new_end;
            self.write_footer(fresh);
            self.bin_insert(fresh);
            self.wilderness = fresh;
            return true;
        }
        self.mapped_end = new_end;
        true
    }

    fn find_fit(&mut self, needed: usize) -> Option<*mut BlockHeader> {
        for idx in bin_index(needed)..BIN_COUNT {
            let mut cursor = self.bins[idx];
            while !cursor.is_null() {
                // SAFETY: bin members are valid free headers.
                unsafe {
                    if (*cursor).size() >= needed {
                        return Some(cursor);
                    }
                    cursor = (*cursor).next_free;
                }
            }
        }
        None
    }

    /// Allocate `user_size` bytes at `align` (power of two, ≤ 4096).
    /// Returns null on exhaustion or for a zero-size request.
    pub fn alloc(&mut self, user_size: usize, align: usize) -> *mut u8 {
        if user_size == 0 {
            return core::ptr::null_mut();
        }
        let align = align.max(ALIGN_MIN);
        debug_assert!(align.is_power_of_two() && align <= FRAME_SIZE);
        let needed = Self::required_size(user_size, align);

        let block = match self.find_fit(needed) {
            Some(b) => b,
            None => {
                if !self.grow(needed) {
                    return core::ptr::null_mut();
                }
                match self.find_fit(needed) {
                    Some(b) => b,
                    None => return core::ptr::null_mut(),
                }
            }
        };
        self.bin_remove(block);

        // Split off the remainder if it can stand alone.
        // SAFETY: block is a valid free header at least `needed` large.
        let total = unsafe { (*block).size() };
        let take = if total - needed >= MIN_BLOCK {
            let rest = (block as u64 + needed as u64) as *mut BlockHeader;
            // SAFETY: remainder lies inside the original block.
            unsafe {
                (*rest).magic = FREE_MAGIC;
                (*rest).size_flags = (total - needed) as u64;
                (*rest).user_size = 0;
            }
            self.write_footer(rest);
            self.bin_insert(rest);
            if self.wilderness == block {
                self.wilderness = rest;
            }
            needed
        } else {
            if self.wilderness == block {
                self.wilderness = core::ptr::null_mut();
            }
            total
        };

        // SAFETY: block is exclusively ours now; user region lies inside.
        let user_ptr = unsafe {
            (*block).magic = USED_MAGIC;
            (*block).size_flags = take as u64 | USED_BIT;
            (*block).user_size = user_size as u64;
            self.write_footer(block);
            let payload_min = block as usize + HEADER_SIZE + BACKPTR_SIZE;
            let user = align_up(payload_min, align);
            debug_assert!(user + user_size <= block as usize + take - FOOTER_SIZE);
            *((user - BACKPTR_SIZE) as *mut u64) = block as u64;
            user as *mut u8
        };

        self.stats.alloc_count += 1;
        self.stats.live_bytes += user_size;
        self.stats.peak_bytes = self.stats.peak_bytes.max(self.stats.live_bytes);
        user_ptr
    }

    /// Header for a live user pointer, with full validation. Panics on
    /// anything inconsistent; the heap is already corrupt.
    fn header_of(&self, ptr: *mut u8) -> *mut BlockHeader {
        let addr = ptr as u64;
        assert!(
            addr >= self.base + (HEADER_SIZE + BACKPTR_SIZE) as u64 && addr < self.mapped_end,
            "heap free of foreign pointer {:#x}",
            addr
        );
        // SAFETY: range-checked above; the back-pointer slot precedes
        // every user pointer this allocator hands out.
        let block = unsafe { *((addr - BACKPTR_SIZE as u64) as *const u64) } as *mut BlockHeader;
        let baddr = block as u64;
        assert!(
            baddr >= self.base && baddr < self.mapped_end && baddr % ALIGN_MIN as u64 == 0,
            "heap corruption: bad back-pointer {:#x}",
            baddr
        );
        // SAFETY: block now known to be in-arena and aligned.
        unsafe {
            match (*block).magic {
                USED_MAGIC => {}
                FREE_MAGIC => panic!("heap double free at {:#x}", addr),
                other => panic!("heap corruption: bad magic {:#x} at {:#x}", other, baddr),
            }
            let footer = *self.footer_ptr(block);
            assert!(
                footer == (*block).size_flags,
                "heap corruption: footer {:#x} != header {:#x}",
                footer,
                (*block).size_flags
            );
        }
        block
    }

    /// Release an allocation.
    pub fn free(&mut self, ptr: *mut u8) {
        debug_assert!(!ptr.is_null());
        let block = self.header_of(ptr);

        // SAFETY: validated used block; payload poisoning and state flip
        // stay inside its extent.
        unsafe {
            if cfg!(debug_assertions) {
                let payload = (block as *mut u8).add(HEADER_SIZE);
                let len = (*block).size() - HEADER_SIZE - FOOTER_SIZE;
                core::ptr::write_bytes(payload, POISON_BYTE, len);
            }
            self.stats.free_count += 1;
            self.stats.live_bytes -= (*block).user_size as usize;
            (*block).magic = FREE_MAGIC;
            (*block).size_flags = (*block).size() as u64;
            (*block).user_size = 0;
        }

        let merged = self.coalesce(block);
        self.write_footer(merged);
        self.bin_insert(merged);
        if self.block_end(merged) == self.mapped_end {
            self.wilderness = merged;
        }
    }

    /// Merge `block` with free neighbors on both sides. Returns the
    /// merged block (not yet binned).
    fn coalesce(&mut self, mut block: *mut BlockHeader) -> *mut BlockHeader {
        // Next neighbor.
        let next = self.block_end(block) as *mut BlockHeader;
        if (next as u64) < self.mapped_end {
            // SAFETY: next header starts exactly at our end, in-arena.
            unsafe {
                if (*next).magic == FREE_MAGIC && !(*next).is_used() {
                    self.bin_remove(next);
                    if self.wilderness == next {
                        self.wilderness = core::ptr::null_mut();
                    }
                    (*block).size_flags = ((*block).size() + (*next).size()) as u64;
                }
            }
        }
        // Previous neighbor, found through its footer.
        if block as u64 > self.base {
            // SAFETY: a block never starts at base+0 unless it is first;
            // the word before our header is the previous block's footer.
            unsafe {
                let prev_footer = *((block as *const u8).sub(FOOTER_SIZE) as *const u64);
                if prev_footer & USED_BIT == 0 {
                    let prev_size = (prev_footer & SIZE_MASK) as usize;
                    let prev = (block as *mut u8).sub(prev_size) as *mut BlockHeader;
                    if prev as u64 >= self.base && (*prev).magic == FREE_MAGIC {
                        self.bin_remove(prev);
                        if self.wilderness == prev {
                            self.wilderness = core::ptr::null_mut();
                        }
                        (*prev).size_flags = (prev_size + (*block).size()) as u64;
                        block = prev;
                    }
                }
            }
        }
        block
    }

    /// Resize an allocation, in place when the block's slack allows.
    pub fn realloc(&mut self, ptr: *mut u8, new_size: usize, align: usize) -> *mut u8 {
        if ptr.is_null() {
            return self.alloc(new_size, align);
        }
        if new_size == 0 {
            self.free(ptr);
            return core::ptr::null_mut();
        }
        let block = self.header_of(ptr);
        // SAFETY: header validated; capacity is the distance from the
        // user pointer to the footer.
        let (capacity, old_size) = unsafe {
            let end = block as usize + (*block).size() - FOOTER_SIZE;
            (end - ptr as usize, (*block).user_size as usize)
        };
        if new_size <= capacity {
            // SAFETY: only the accounting changes.
            unsafe {
                self.stats.live_bytes = self.stats.live_bytes - old_size + new_size;
                self.stats.peak_bytes = self.stats.peak_bytes.max(self.stats.live_bytes);
                (*block).user_size = new_size as u64;
            }
            return ptr;
        }
        let fresh = self.alloc(new_size, align);
        if fresh.is_null() {
            return core::ptr::null_mut();
        }
        // SAFETY: both regions are live and at least min(old,new) long.
        unsafe {
            core::ptr::copy_nonoverlapping(ptr, fresh, old_size.min(new_size));
        }
        self.free(ptr);
        fresh
    }

    pub fn stats(&self) -> HeapStats {
        self.stats
    }

    /// Full structural verification: linear walk plus bin audit.
    pub fn check_integrity(&self) -> Result<(), HeapCorruption> {
        let mut cursor = self.base;
        let mut prev_free = false;
        let mut walked = 0usize;
        while cursor < self.mapped_end {
            let block = cursor as *const BlockHeader;
            // SAFETY: cursor stays on block boundaries within the arena.
            unsafe {
                match (*block).magic {
                    USED_MAGIC if (*block).is_used() => {}
                    FREE_MAGIC if !(*block).is_used() => {}
                    _ => return Err(HeapCorruption::BadMagic(cursor)),
                }
                let size = (*block).size();
                if size < MIN_BLOCK
                    || size % ALIGN_MIN != 0
                    || cursor + size as u64 > self.mapped_end
                {
                    return Err(HeapCorruption::BadSize(cursor));
                }
                let footer = *((cursor + size as u64 - FOOTER_SIZE as u64) as *const u64);
                if footer != (*block).size_flags {
                    return Err(HeapCorruption::BadFooter(cursor));
                }
                let is_free = !(*block).is_used();
                if is_free && prev_free {
                    return Err(HeapCorruption::AdjacentFree(cursor));
                }
                prev_free = is_free;
                walked += size;
                cursor += size as u64;
            }
        }
        if walked != (self.mapped_end - self.base) as usize {
            return Err(HeapCorruption::ArenaSumMismatch {
                walked,
                mapped: (self.mapped_end - self.base) as usize,
            });
        }
        for (idx, head) in self.bins.iter().enumerate() {
            let mut node = *head;
            let mut prev: *mut BlockHeader = core::ptr::null_mut();
            while !node.is_null() {
                // SAFETY: audited nodes are in-arena by the walk above.
                unsafe {
                    if (*node).magic != FREE_MAGIC || (*node).is_used() {
                        return Err(HeapCorruption::BinLinkBroken(idx));
                    }
                    if bin_index((*node).size()) != idx {
                        return Err(HeapCorruption::BinClassMismatch(idx));
                    }
                    if (*node).prev_free != prev {
                        return Err(HeapCorruption::BinLinkBroken(idx));
                    }
                    prev = node;
                    node = (*node).next_free;
                }
            }
        }
        Ok(())
    }
}

/// IRQ-safe wrapper; registered as the global allocator on bare metal.
pub struct LockedHeap {
    inner: IrqMutex<Heap>,
}

impl LockedHeap {
    pub const fn empty() -> Self {
        Self {
            inner: IrqMutex::new(Heap::empty()),
        }
    }

    /// See [`Heap::init`].
    ///
    /// # Safety
    ///
    /// Same contract as [`Heap::init`].
    pub unsafe fn init(
        &self,
        base: u64,
        initial_size: usize,
        limit: usize,
        grow_hook: Option<&'static dyn GrowHook>,
    ) {
        // SAFETY: forwarded contract.
        unsafe { self.inner.lock().init(base, initial_size, limit, grow_hook) };
    }

    pub fn stats(&self) -> HeapStats {
        self.inner.lock().stats()
    }

    pub fn check_integrity(&self) -> Result<(), HeapCorruption> {
        self.inner.lock().check_integrity()
    }
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
// SAFETY: alloc/dealloc pair through one locked arena; alignment and
// size contracts are enforced by Heap::alloc.
unsafe impl core::alloc::GlobalAlloc for LockedHeap {
    unsafe fn alloc(&self, layout: core::alloc::Layout) -> *mut u8 {
        self.inner.lock().alloc(layout.size(), layout.align())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: core::alloc::Layout) {
        self.inner.lock().free(ptr)
    }

    unsafe fn realloc(
        &self,
        ptr: *mut u8,
        layout: core::alloc::Layout,
        new_size: usize,
    ) -> *mut u8 {
        self.inner.lock().realloc(ptr, new_size, layout.align())
    }
}

/// Grow hook backed by the kernel mapper: allocates frames and maps
/// them read-write into the kernel half as the heap extends.
pub struct MapperGrowHook {
    mapper: &'static dyn super::Mapper,
}

impl MapperGrowHook {
    pub fn new(mapper: &'static dyn super::Mapper) -> Self {
        Self { mapper }
    }
}

impl GrowHook for MapperGrowHook {
    fn grow(&self, old_end: u64, new_end: u64) -> bool {
        use super::{MapFlags, VirtualAddress};
        let root = self.mapper.kernel_root();
        let mut va = old_end;
        while va < new_end {
            let frame = match self.mapper.alloc_frame() {
                Some(f) => f,
                None => return false,
            };
            if self
                .mapper
                .map4k(
                    root,
                    VirtualAddress::new(va),
                    frame,
                    MapFlags::WRITABLE | MapFlags::GLOBAL,
                )
                .is_err()
            {
                self.mapper.free_frame(frame);
                return false;
            }
            va += FRAME_SIZE as u64;
        }
        true
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use alloc::vec;
    use alloc::vec::Vec;

    struct ArenaGrow;
    impl GrowHook for ArenaGrow {
        fn grow(&self, _old_end: u64, _new_end: u64) -> bool {
            // Test arenas are fully backed up front.
            true
        }
    }
    static ARENA_GROW: ArenaGrow = ArenaGrow;

    fn make_heap(initial: usize, limit: usize) -> Heap {
        let buf = vec![0u8; limit + ALIGN_MIN].leak();
        let base = align_up(buf.as_ptr() as usize, ALIGN_MIN) as u64;
        let mut heap = Heap::empty();
        // SAFETY: the leaked buffer is exclusively owned and writable.
        unsafe { heap.init(base, initial, limit, Some(&ARENA_GROW as &dyn GrowHook)) };
        heap
    }

    #[test]
    fn zero_size_returns_null() {
        let mut h = make_heap(4096, 4096);
        assert!(h.alloc(0, 16).is_null());
    }

    #[test]
    fn alloc_free_roundtrip_preserves_alignment() {
        let mut h = make_heap(64 * 1024, 64 * 1024);
        let p1 = h.alloc(100, 64);
        assert!(!p1.is_null());
        assert_eq!(p1 as usize % 64, 0);
        h.free(p1);
        let p2 = h.alloc(100, 64);
        assert_eq!(p2 as usize % 64, 0);
        h.free(p2);
        assert!(h.check_integrity().is_ok());
    }

    #[test]
    fn coalescing_reconstitutes_arena() {
        let mut h = make_heap(64 * 1024, 64 * 1024);
        let ptrs: Vec<_> = (0..8).map(|_| h.alloc(1000, 16)).collect();
        assert!(ptrs.iter().all(|p| !p.is_null()));
        // Free in interleaved order to exercise both merge directions.
        for &i in &[0, 2, 4, 6, 1, 3, 5, 7] {
            h.free(ptrs[i]);
        }
        assert!(h.check_integrity().is_ok());
        // Everything merged back: a max-size allocation must succeed.
        let big = h.alloc(60 * 1024, 16);
        assert!(!big.is_null());
        h.free(big);
    }

    #[test]
    fn growth_extends_wilderness() {
        let mut h = make_heap(4096, 1024 * 1024);
        let p = h.alloc(128 * 1024, 16);
        assert!(!p.is_null(), "growth failed");
        h.free(p);
        assert!(h.check_integrity().is_ok());
    }

    #[test]
    fn stats_track_live_and_peak() {
        let mut h = make_heap(64 * 1024, 64 * 1024);
        let a = h.alloc(1000, 16);
        let b = h.alloc(2000, 16);
        assert_eq!(h.stats().live_bytes, 3000);
        assert_eq!(h.stats().peak_bytes, 3000);
        h.free(a);
        assert_eq!(h.stats().live_bytes, 2000);
        h.free(b);
        assert_eq!(h.stats().live_bytes, 0);
        assert_eq!(h.stats().peak_bytes, 3000);
        assert_eq!(h.stats().alloc_count, 2);
        assert_eq!(h.stats().free_count, 2);
    }

    #[test]
    fn realloc_grows_in_place_within_slack() {
        let mut h = make_heap(64 * 1024, 64 * 1024);
        // 33 bytes rounds the block up to a 40-byte payload capacity.
        let p = h.alloc(33, 16);
        // SAFETY: p is a live 33-byte allocation.
        unsafe { core::ptr::write_bytes(p, 0xab, 33) };
        let q = h.realloc(p, 40, 16);
        assert_eq!(p, q);
        let r = h.realloc(q, 8192, 16);
        assert_ne!(q, r);
        // SAFETY: r is live and at least 33 bytes.
        let copied = unsafe { core::slice::from_raw_parts(r, 33) };
        assert!(copied.iter().all(|&b| b == 0xab));
        h.free(r);
        assert!(h.check_integrity().is_ok());
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_panics() {
        let mut h = make_heap(16 * 1024, 16 * 1024);
        let p = h.alloc(64, 16);
        h.free(p);
        h.free(p);
    }

    #[test]
    #[should_panic(expected = "corruption")]
    fn footer_smash_detected() {
        let mut h = make_heap(16 * 1024, 16 * 1024);
        let p = h.alloc(64, 16);
        // Overrun: clobber the footer word right after the payload area.
        // SAFETY: reading the back-pointer slot of our own allocation.
        let block = unsafe { *((p as u64 - 8) as *const u64) } as *mut BlockHeader;
        // SAFETY: intentionally corrupting our own test arena.
        unsafe {
            let size = (*block).size();
            *((block as *mut u8).add(size - 8) as *mut u64) = 0;
        }
        h.free(p);
    }

    /// Deterministic xorshift so the stress run is reproducible.
    struct XorShift(u64);
    impl XorShift {
        fn next(&mut self) -> u64 {
            let mut x = self.0;
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            self.0 = x;
            x
        }
    }

    #[test]
    fn stress_mixed_operations() {
        let mut h = make_heap(256 * 1024, 8 * 1024 * 1024);
        let mut rng = XorShift(0x5a1c_0001);
        let mut live: Vec<(*mut u8, usize, u8)> = Vec::new();

        fn tag_fill(ptr: *mut u8, len: usize, tag: u8) {
            // SAFETY: ptr is a live allocation of at least len bytes.
            unsafe { core::ptr::write_bytes(ptr, tag, len) };
        }
        fn tag_check(ptr: *mut u8, len: usize, tag: u8) {
            // SAFETY: ptr is a live allocation of at least len bytes.
            let s = unsafe { core::slice::from_raw_parts(ptr, len) };
            assert!(s.iter().all(|&b| b == tag), "payload clobbered");
        }

        for round in 0..200_000u32 {
            match rng.next() % 10 {
                0..=4 => {
                    let size = (rng.next() % 4096).max(1) as usize;
                    let align = 1usize << (rng.next() % 7); // up to 64
                    let ptr = h.alloc(size, align);
                    if !ptr.is_null() {
                        assert_eq!(ptr as usize % align.max(16), 0);
                        let tag = (round % 251) as u8;
                        tag_fill(ptr, size, tag);
                        live.push((ptr, size, tag));
                    }
                }
                5..=7 => {
                    if !live.is_empty() {
                        let idx = (rng.next() as usize) % live.len();
                        let (ptr, size, tag) = live.swap_remove(idx);
                        tag_check(ptr, size, tag);
                        h.free(ptr);
                    }
                }
                _ => {
                    if !live.is_empty() {
                        let idx = (rng.next() as usize) % live.len();
                        let (ptr, size, tag) = live[idx];
                        tag_check(ptr, size, tag);
                        let new_size = (rng.next() % 4096).max(1) as usize;
                        let fresh = h.realloc(ptr, new_size, 16);
                        if !fresh.is_null() {
                            tag_check(fresh, size.min(new_size), tag);
                            tag_fill(fresh, new_size, tag);
                            live[idx] = (fresh, new_size, tag);
                        }
                    }
                }
            }
        }
        for (ptr, size, tag) in live.drain(..) {
            tag_check(ptr, size, tag);
            h.free(ptr);
        }
        assert!(h.check_integrity().is_ok());
        assert_eq!(h.stats().live_bytes, 0);
    }
}
