//! Physical frame allocator.
//!
//! One global bitmap (bit set = frame used) placed in a usable memory
//! region at init, fronted by small per-CPU caches so the common
//! alloc/free path never takes the global lock. Cache misses refill a
//! batch from the bitmap; cache overflow drains half back.
//!
//! Ownership rule: every frame is either owned by exactly one consumer
//! or free (bit clear in the bitmap, or sitting in one per-CPU cache).
//! Freeing a frame that is already free is a kernel bug and panics.

use core::sync::atomic::{AtomicU64, Ordering};

use spin::Once;

use super::PhysicalAddress;
use crate::arch;
use crate::boot_info::{BootInfo, MemoryRegionKind};
use crate::config::{
    FRAME_CACHE_FLUSH_THRESHOLD, FRAME_CACHE_REFILL, FRAME_CACHE_SIZE, FRAME_SIZE, MAX_CPUS,
};
use crate::sync::IrqMutex;

/// Frame allocation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "allocation failures must be handled"]
pub enum FrameAllocError {
    /// No physical frames left.
    OutOfMemory,
}

/// Allocator counters, all monotonically increasing.
#[derive(Debug, Default)]
pub struct PmmCounters {
    pub allocations: AtomicU64,
    pub frees: AtomicU64,
    pub cache_hits: AtomicU64,
    pub refills: AtomicU64,
    pub flushes: AtomicU64,
}

/// Snapshot of allocator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PmmStats {
    pub total_frames: usize,
    pub free_frames: usize,
    pub allocations: u64,
    pub frees: u64,
    pub cache_hits: u64,
}

/// The global usage bitmap. Bit set means the frame is used or reserved.
pub struct FrameBitmap {
    words: &'static mut [u64],
    frame_count: usize,
    free_frames: usize,
    /// Word index where the next search starts; amortizes scans.
    search_hint: usize,
}

impl FrameBitmap {
    /// Wrap `storage` as a bitmap over `frame_count` frames, everything
    /// initially marked used. Regions are then released explicitly.
    pub fn new(storage: &'static mut [u64], frame_count: usize) -> Self {
        assert!(storage.len() * 64 >= frame_count, "bitmap storage too small");
        storage.fill(u64::MAX);
        Self {
            words: storage,
            frame_count,
            free_frames: 0,
            search_hint: 0,
        }
    }

    pub fn frame_count(&self) -> usize {
        self.frame_count
    }

    pub fn free_frames(&self) -> usize {
        self.free_frames
    }

    pub fn is_used(&self, frame: usize) -> bool {
        self.words[frame / 64] & (1 << (frame % 64)) != 0
    }

    /// Release `count` frames starting at `start` (used during init for
    /// usable regions; already-free frames are left alone).
    pub fn release_region(&mut self, start: usize, count: usize) {
        let end = (start + count).min(self.frame_count);
        for frame in start.min(self.frame_count)..end {
            let (w, b) = (frame / 64, frame % 64);
            if self.words[w] & (1 << b) != 0 {
                self.words[w] &= !(1 << b);
                self.free_frames += 1;
            }
        }
    }

    /// Re-reserve `count` frames starting at `start` (kernel image,
    /// framebuffer, boot structures, the bitmap itself).
    pub fn reserve_region(&mut self, start: usize, count: usize) {
        let end = (start + count).min(self.frame_count);
        for frame in start.min(self.frame_count)..end {
            let (w, b) = (frame / 64, frame % 64);
            if self.words[w] & (1 << b) == 0 {
                self.words[w] |= 1 << b;
                self.free_frames -= 1;
            }
        }
    }

    /// Claim the first free frame, scanning from the search hint.
    pub fn alloc(&mut self) -> Option<usize> {
        if self.free_frames == 0 {
            return None;
        }
        let words = self.words.len();
        for i in 0..words {
            let w = (self.search_hint + i) % words;
            if self.words[w] != u64::MAX {
                let bit = (!self.words[w]).trailing_zeros() as usize;
                let frame = w * 64 + bit;
                if frame >= self.frame_count {
                    continue;
                }
                self.words[w] |= 1 << bit;
                self.free_frames -= 1;
                self.search_hint = w;
                return Some(frame);
            }
        }
        None
    }

    /// Return a frame to the bitmap.
    ///
    /// # Panics
    ///
    /// Panics on double free: the caller no longer owned the frame and
    /// memory corruption has already happened somewhere.
    pub fn free(&mut self, frame: usize) {
        assert!(frame < self.frame_count, "frame index out of range");
        let (w, b) = (frame / 64, frame % 64);
        assert!(
            self.words[w] & (1 << b) != 0,
            "PMM double free of frame {:#x}",
            frame * FRAME_SIZE
        );
        self.words[w] &= !(1 << b);
        self.free_frames += 1;
        if w < self.search_hint {
            self.search_hint = w;
        }
    }
}

/// Per-CPU stash of free frames.
struct FrameCache {
    frames: [u64; FRAME_CACHE_SIZE],
    count: usize,
}

impl FrameCache {
    const fn new() -> Self {
        Self {
            frames: [0; FRAME_CACHE_SIZE],
            count: 0,
        }
    }

    fn pop(&mut self) -> Option<u64> {
        if self.count == 0 {
            None
        } else {
            self.count -= 1;
            Some(self.frames[self.count])
        }
    }

    fn push(&mut self, pa: u64) {
        debug_assert!(self.count < FRAME_CACHE_SIZE);
        self.frames[self.count] = pa;
        self.count += 1;
    }
}

/// The physical memory manager: bitmap + per-CPU caches.
pub struct FrameAllocator {
    bitmap: IrqMutex<FrameBitmap>,
    caches: [IrqMutex<FrameCache>; MAX_CPUS],
    counters: PmmCounters,
}

impl FrameAllocator {
    pub fn new(bitmap: FrameBitmap) -> Self {
        const CACHE: IrqMutex<FrameCache> = IrqMutex::new(FrameCache::new());
        Self {
            bitmap: IrqMutex::new(bitmap),
            caches: [CACHE; MAX_CPUS],
            counters: PmmCounters::default(),
        }
    }

    /// Hand out one 4 KiB frame, preferring the local CPU cache.
    pub fn alloc_frame(&self) -> Option<PhysicalAddress> {
        let cpu = arch::cpu_id() as usize;
        let mut cache = self.caches[cpu].lock();
        if let Some(pa) = cache.pop() {
            self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
            self.counters.allocations.fetch_add(1, Ordering::Relaxed);
            return Some(PhysicalAddress::new(pa));
        }

        // Miss: refill a batch from the global bitmap.
        let mut bitmap = self.bitmap.lock();
        for _ in 0..FRAME_CACHE_REFILL {
            match bitmap.alloc() {
                Some(frame) => cache.push((frame * FRAME_SIZE) as u64),
                None => break,
            }
        }
        drop(bitmap);
        self.counters.refills.fetch_add(1, Ordering::Relaxed);

        let pa = cache.pop()?;
        self.counters.allocations.fetch_add(1, Ordering::Relaxed);
        Some(PhysicalAddress::new(pa))
    }

    /// Return a frame. The caller must own it; freeing someone else's
    /// frame is undetectable here and surfaces later as a bitmap panic.
    pub fn free_frame(&self, pa: PhysicalAddress) {
        debug_assert!(pa.is_frame_aligned());
        self.counters.frees.fetch_add(1, Ordering::Relaxed);
        let cpu = arch::cpu_id() as usize;
        let mut cache = self.caches[cpu].lock();
        cache.push(pa.as_u64());
        if cache.count >= FRAME_CACHE_FLUSH_THRESHOLD {
            let mut bitmap = self.bitmap.lock();
            // Drain half, keeping the hotter half local.
            while cache.count > FRAME_CACHE_SIZE / 2 {
                let pa = cache.pop().unwrap();
                bitmap.free(pa as usize / FRAME_SIZE);
            }
            self.counters.flushes.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Push every cached frame back to the bitmap. Used by tests and by
    /// the shutdown path to make the bitmap authoritative.
    pub fn flush_caches(&self) {
        for cache in &self.caches {
            // Cache lock before bitmap lock, as on the allocation path.
            let mut cache = cache.lock();
            let mut bitmap = self.bitmap.lock();
            while let Some(pa) = cache.pop() {
                bitmap.free(pa as usize / FRAME_SIZE);
            }
        }
    }

    pub fn stats(&self) -> PmmStats {
        // Cache locks strictly before the bitmap lock, matching the
        // allocation path's order.
        let cached: usize = self
            .caches
            .iter()
            .map(|c| c.lock().count)
            .sum();
        let bitmap = self.bitmap.lock();
        PmmStats {
            total_frames: bitmap.frame_count(),
            free_frames: bitmap.free_frames() + cached,
            allocations: self.counters.allocations.load(Ordering::Relaxed),
            frees: self.counters.frees.load(Ordering::Relaxed),
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
        }
    }
}

impl super::mapper::FrameSource for FrameAllocator {
    fn alloc_frame(&self) -> Option<PhysicalAddress> {
        FrameAllocator::alloc_frame(self)
    }

    fn free_frame(&self, pa: PhysicalAddress) {
        FrameAllocator::free_frame(self, pa)
    }
}

static PMM: Once<FrameAllocator> = Once::new();

/// Bring up the global allocator from the boot memory map.
///
/// Reserves, in order: everything not listed usable (implicit: the
/// bitmap starts all-used), then releases usable and reclaimable
/// regions, then re-reserves the first MiB, the kernel image, the
/// framebuffer, the boot-info structures and the bitmap's own storage.
pub fn init(boot: &BootInfo) {
    let map = boot.memory_map();
    let max_end = map
        .iter()
        .filter(|r| {
            matches!(
                r.kind,
                MemoryRegionKind::Usable | MemoryRegionKind::BootloaderReclaimable
            )
        })
        .map(|r| r.end())
        .max()
        .expect("no usable memory regions");
    let frame_count = (max_end as usize).div_ceil(FRAME_SIZE);
    let words = frame_count.div_ceil(64);
    let bitmap_bytes = words * 8;

    // Place the bitmap in the first usable region that can hold it,
    // above the first MiB.
    let slot = map
        .iter()
        .find(|r| {
            r.kind == MemoryRegionKind::Usable
                && r.base >= 0x10_0000
                && r.length as usize >= bitmap_bytes
        })
        .expect("no region large enough for the frame bitmap");
    let bitmap_phys = slot.base;

    // SAFETY: the region is RAM reported usable by the loader, reached
    // through the HHDM; it is re-reserved below before any allocation
    // can hand it out.
    let storage = unsafe {
        core::slice::from_raw_parts_mut((boot.hhdm_base + bitmap_phys) as *mut u64, words)
    };
    let mut bitmap = FrameBitmap::new(storage, frame_count);

    for region in map {
        if matches!(
            region.kind,
            MemoryRegionKind::Usable | MemoryRegionKind::BootloaderReclaimable
        ) {
            bitmap.release_region(
                (region.base as usize).div_ceil(FRAME_SIZE),
                region.length as usize / FRAME_SIZE,
            );
        }
    }

    // Low memory stays out of circulation (BIOS structures, AP startup).
    bitmap.reserve_region(0, 0x10_0000 / FRAME_SIZE);
    bitmap.reserve_region(
        boot.kernel_phys_base as usize / FRAME_SIZE,
        (boot.kernel_size as usize).div_ceil(FRAME_SIZE),
    );
    bitmap.reserve_region(
        boot.framebuffer.base as usize / FRAME_SIZE,
        (boot.framebuffer.size as usize).div_ceil(FRAME_SIZE),
    );
    if boot.initrd_size > 0 {
        bitmap.reserve_region(
            boot.initrd_base as usize / FRAME_SIZE,
            (boot.initrd_size as usize).div_ceil(FRAME_SIZE),
        );
    }
    // Boot-info structures live in the HHDM window; translate back to
    // physical to pin them.
    let map_phys = boot.memory_map_ptr as u64 - boot.hhdm_base;
    bitmap.reserve_region(
        map_phys as usize / FRAME_SIZE,
        (boot.memory_map_len as usize * core::mem::size_of::<crate::boot_info::MemoryRegion>())
            .div_ceil(FRAME_SIZE)
            .max(1),
    );
    let info_phys = boot as *const BootInfo as u64 - boot.hhdm_base;
    bitmap.reserve_region(info_phys as usize / FRAME_SIZE, 1);
    bitmap.reserve_region(
        bitmap_phys as usize / FRAME_SIZE,
        bitmap_bytes.div_ceil(FRAME_SIZE),
    );

    let free = bitmap.free_frames();
    PMM.call_once(|| FrameAllocator::new(bitmap));
    log::info!(
        "pmm: {} frames tracked, {} free ({} MiB)",
        frame_count,
        free,
        free * FRAME_SIZE / (1024 * 1024)
    );
}

/// The global allocator.
///
/// # Panics
///
/// Panics before [`init`]; nothing may allocate frames earlier.
pub fn pmm() -> &'static FrameAllocator {
    PMM.get().expect("frame allocator used before init")
}

/// Convenience wrapper used by the mapper and address-space layers.
pub fn alloc_frame() -> Option<PhysicalAddress> {
    pmm().alloc_frame()
}

pub fn free_frame(pa: PhysicalAddress) {
    pmm().free_frame(pa)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;
    use alloc::vec;

    fn bitmap(frames: usize) -> FrameBitmap {
        let storage = vec![0u64; frames.div_ceil(64)].leak();
        let mut b = FrameBitmap::new(storage, frames);
        b.release_region(0, frames);
        b
    }

    #[test]
    fn alloc_free_roundtrip() {
        let mut b = bitmap(128);
        assert_eq!(b.free_frames(), 128);
        let f = b.alloc().unwrap();
        assert!(b.is_used(f));
        assert_eq!(b.free_frames(), 127);
        b.free(f);
        assert!(!b.is_used(f));
        assert_eq!(b.free_frames(), 128);
    }

    #[test]
    fn exhaustion_returns_none() {
        let mut b = bitmap(3);
        assert!(b.alloc().is_some());
        assert!(b.alloc().is_some());
        assert!(b.alloc().is_some());
        assert!(b.alloc().is_none());
    }

    #[test]
    fn tail_bits_stay_reserved() {
        // 70 frames: the second word's top bits must never be handed out.
        let mut b = bitmap(70);
        for _ in 0..70 {
            assert!(b.alloc().unwrap() < 70);
        }
        assert!(b.alloc().is_none());
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_panics() {
        let mut b = bitmap(16);
        let f = b.alloc().unwrap();
        b.free(f);
        b.free(f);
    }

    #[test]
    fn reserved_regions_not_allocated() {
        let mut b = bitmap(128);
        b.reserve_region(0, 64);
        for _ in 0..64 {
            let f = b.alloc().unwrap();
            assert!(f >= 64, "allocated reserved frame {}", f);
        }
        assert!(b.alloc().is_none());
    }

    #[test]
    fn cache_refill_and_flush() {
        let alloc = FrameAllocator::new(bitmap(1024));
        // First allocation misses and refills a batch.
        let a = alloc.alloc_frame().unwrap();
        let stats = alloc.stats();
        assert_eq!(stats.allocations, 1);
        assert_eq!(stats.free_frames, 1023);
        // Second hits the cache.
        let b = alloc.alloc_frame().unwrap();
        assert_ne!(a, b);
        assert_eq!(alloc.stats().cache_hits, 1);

        alloc.free_frame(a);
        alloc.free_frame(b);
        alloc.flush_caches();
        assert_eq!(alloc.stats().free_frames, 1024);
    }

    #[test]
    fn bitmap_state_restored_after_flush() {
        let alloc = FrameAllocator::new(bitmap(256));
        let mut held = vec![];
        for _ in 0..100 {
            held.push(alloc.alloc_frame().unwrap());
        }
        for pa in held {
            alloc.free_frame(pa);
        }
        alloc.flush_caches();
        assert_eq!(alloc.stats().free_frames, 256);
    }
}
