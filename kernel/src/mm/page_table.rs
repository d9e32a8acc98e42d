//! x86_64 4-level page tables.
//!
//! All tables are reached by adding the table's physical address to the
//! high-half direct map, so the walker works the same for the active
//! root and for foreign roots. Intermediate entries are created
//! permissive (present + writable, user added when a user mapping needs
//! the path) because x86_64 ANDs access bits down the hierarchy.

use core::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;

use super::mapper::{FrameSource, MapError, MapFlags, Mapper, Mapping, MappingRoot};
use super::{PhysicalAddress, VirtualAddress};
use crate::arch;
use crate::config::{FRAME_SIZE, MAX_CPUS};

/// Number of entries in a page table.
pub const PAGE_TABLE_ENTRIES: usize = 512;

/// Index of the first kernel-half entry in the top-level table.
const KERNEL_HALF_START: usize = 256;

bitflags! {
    /// Hardware PTE bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u64 {
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

const ADDR_MASK: u64 = 0x000f_ffff_ffff_f000;

/// One page-table entry.
#[derive(Debug, Clone, Copy)]
#[repr(transparent)]
pub struct PageTableEntry {
    entry: u64,
}

impl PageTableEntry {
    pub const fn empty() -> Self {
        Self { entry: 0 }
    }

    pub const fn is_present(&self) -> bool {
        self.entry & PteFlags::PRESENT.bits() != 0
    }

    pub const fn is_huge(&self) -> bool {
        self.entry & PteFlags::HUGE.bits() != 0
    }

    pub fn flags(&self) -> PteFlags {
        PteFlags::from_bits_truncate(self.entry)
    }

    pub fn addr(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.entry & ADDR_MASK)
    }

    pub fn set(&mut self, addr: PhysicalAddress, flags: PteFlags) {
        debug_assert!(addr.is_frame_aligned());
        self.entry = (addr.as_u64() & ADDR_MASK) | flags.bits();
    }

    pub fn insert_flags(&mut self, flags: PteFlags) {
        self.entry |= flags.bits();
    }

    pub fn clear(&mut self) {
        self.entry = 0;
    }
}

/// A 512-entry page table.
#[repr(C, align(4096))]
pub struct PageTable {
    pub entries: [PageTableEntry; PAGE_TABLE_ENTRIES],
}

impl PageTable {
    pub fn zero(&mut self) {
        for entry in &mut self.entries {
            entry.clear();
        }
    }
}

/// The x86_64 [`Mapper`] implementation.
pub struct X86PageMapper {
    hhdm_base: u64,
    kernel_root: MappingRoot,
    frames: &'static dyn FrameSource,
    /// Physical root active on each CPU. Kept in software so activation
    /// can skip redundant CR3 loads and so unit tests can run the same
    /// code without touching hardware.
    active: [AtomicU64; MAX_CPUS],
}

impl X86PageMapper {
    /// Wrap the already-active kernel root.
    pub fn new(hhdm_base: u64, kernel_root: MappingRoot, frames: &'static dyn FrameSource) -> Self {
        const ROOT: AtomicU64 = AtomicU64::new(0);
        let active = [ROOT; MAX_CPUS];
        for slot in &active {
            slot.store(kernel_root.0, Ordering::Relaxed);
        }
        Self {
            hhdm_base,
            kernel_root,
            frames,
            active,
        }
    }

    /// View a physical frame as a page table through the direct map.
    #[allow(clippy::mut_from_ref)]
    fn table(&self, pa: PhysicalAddress) -> &mut PageTable {
        // SAFETY: `pa` was produced by this mapper (or is the boot
        // kernel root), so the frame holds a page table, and the HHDM
        // maps all physical memory. Exclusive access is the caller's
        // responsibility (the address-space lock serializes mutation of
        // any given root).
        unsafe { &mut *((self.hhdm_base + pa.as_u64()) as *mut PageTable) }
    }

    fn zero_frame(&self, pa: PhysicalAddress) {
        // SAFETY: freshly allocated frame reached through the HHDM.
        unsafe {
            core::ptr::write_bytes((self.hhdm_base + pa.as_u64()) as *mut u8, 0, FRAME_SIZE);
        }
    }

    fn indices(va: VirtualAddress) -> [usize; 4] {
        let v = va.as_u64();
        [
            (v >> 39) as usize & 0x1ff,
            (v >> 30) as usize & 0x1ff,
            (v >> 21) as usize & 0x1ff,
            (v >> 12) as usize & 0x1ff,
        ]
    }

    /// Descend one level, creating the child table if missing. `user`
    /// propagates the USER bit upward: extending a kernel-only subtree
    /// with a user mapping upgrades the intermediate entry in place.
    fn next_table(&self, table_pa: PhysicalAddress, index: usize, user: bool)
        -> Result<PhysicalAddress, MapError>
    {
        let entry = &mut self.table(table_pa).entries[index];
        if !entry.is_present() {
            let frame = self.frames.alloc_frame().ok_or(MapError::OutOfMemory)?;
            self.zero_frame(frame);
            let mut flags = PteFlags::PRESENT | PteFlags::WRITABLE;
            if user {
                flags |= PteFlags::USER;
            }
            entry.set(frame, flags);
        } else {
            if entry.is_huge() {
                return Err(MapError::HugePage);
            }
            if user && !entry.flags().contains(PteFlags::USER) {
                entry.insert_flags(PteFlags::USER);
            }
        }
        Ok(entry.addr())
    }

    /// Read-only descend; `None` if the level is missing or huge.
    fn walk(&self, table_pa: PhysicalAddress, index: usize) -> Option<PageTableEntry> {
        let entry = self.table(table_pa).entries[index];
        if !entry.is_present() || entry.is_huge() {
            return None;
        }
        Some(entry)
    }

    fn leaf_flags(flags: MapFlags) -> PteFlags {
        let mut pte = PteFlags::PRESENT;
        if flags.contains(MapFlags::WRITABLE) {
            pte |= PteFlags::WRITABLE;
        }
        if flags.contains(MapFlags::USER) {
            pte |= PteFlags::USER;
        }
        if flags.contains(MapFlags::GLOBAL) {
            pte |= PteFlags::GLOBAL;
        }
        if flags.contains(MapFlags::WRITE_THROUGH) {
            pte |= PteFlags::WRITE_THROUGH;
        }
        if flags.intersects(MapFlags::DEVICE | MapFlags::NO_CACHE) {
            pte |= PteFlags::NO_CACHE;
        }
        if !flags.contains(MapFlags::EXECUTABLE) {
            pte |= PteFlags::NO_EXECUTE;
        }
        pte
    }

    /// Invalidate the TLB entry for `va` iff `root` is active here.
    fn flush_if_active(&self, root: MappingRoot, va: VirtualAddress) {
        let cpu = arch::cpu_id() as usize;
        if self.active[cpu].load(Ordering::Relaxed) != root.0 {
            return;
        }
        #[cfg(target_os = "none")]
        x86_64::instructions::tlb::flush(x86_64::VirtAddr::new(va.as_u64()));
        #[cfg(not(target_os = "none"))]
        let _ = va;
    }

    /// Free every table frame reachable below a user-half entry.
    fn free_table_recursive(&self, table_pa: PhysicalAddress, level: u8) {
        let table = self.table(table_pa);
        for entry in &mut table.entries {
            if !entry.is_present() {
                continue;
            }
            if level > 1 {
                debug_assert!(!entry.is_huge(), "unexpected huge entry in user tree");
                self.free_table_recursive(entry.addr(), level - 1);
            } else {
                // Leaves must be gone before the space is destroyed; the
                // table frames are the only thing released here.
                debug_assert!(false, "leaf still mapped during destroy_root");
            }
            entry.clear();
        }
        self.frames.free_frame(table_pa);
    }
}

impl Mapper for X86PageMapper {
    fn map4k(
        &self,
        root: MappingRoot,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: MapFlags,
    ) -> Result<(), MapError> {
        if !va.is_page_aligned() || !pa.is_frame_aligned() {
            return Err(MapError::Misaligned);
        }
        if !va.is_canonical() {
            return Err(MapError::NonCanonical);
        }
        let user = flags.contains(MapFlags::USER);
        let [i4, i3, i2, i1] = Self::indices(va);
        let l3 = self.next_table(PhysicalAddress::new(root.0), i4, user)?;
        let l2 = self.next_table(l3, i3, user)?;
        let l1 = self.next_table(l2, i2, user)?;
        let entry = &mut self.table(l1).entries[i1];
        if entry.is_present() {
            return Err(MapError::AlreadyMapped);
        }
        entry.set(pa, Self::leaf_flags(flags));
        self.flush_if_active(root, va);
        Ok(())
    }

    fn unmap4k(&self, root: MappingRoot, va: VirtualAddress) -> Option<PhysicalAddress> {
        if !va.is_page_aligned() || !va.is_canonical() {
            return None;
        }
        let [i4, i3, i2, i1] = Self::indices(va);
        let l3 = self.walk(PhysicalAddress::new(root.0), i4)?.addr();
        let l2 = self.walk(l3, i3)?.addr();
        let l1 = self.walk(l2, i2)?.addr();
        let entry = &mut self.table(l1).entries[i1];
        if !entry.is_present() {
            return None;
        }
        let pa = entry.addr();
        entry.clear();
        self.flush_if_active(root, va);
        Some(pa)
    }

    fn query4k(&self, root: MappingRoot, va: VirtualAddress) -> Option<Mapping> {
        if !va.is_canonical() {
            return None;
        }
        let va = va.align_down();
        let [i4, i3, i2, i1] = Self::indices(va);
        // Effective permissions AND down the hierarchy; NX ORs.
        let mut writable = true;
        let mut user = true;
        let mut no_exec = false;
        let mut table_pa = PhysicalAddress::new(root.0);
        for index in [i4, i3, i2] {
            let entry = self.walk(table_pa, index)?;
            let f = entry.flags();
            writable &= f.contains(PteFlags::WRITABLE);
            user &= f.contains(PteFlags::USER);
            no_exec |= f.contains(PteFlags::NO_EXECUTE);
            table_pa = entry.addr();
        }
        let leaf = self.table(table_pa).entries[i1];
        if !leaf.is_present() {
            return None;
        }
        let f = leaf.flags();
        Some(Mapping {
            phys: leaf.addr(),
            writable: writable && f.contains(PteFlags::WRITABLE),
            user: user && f.contains(PteFlags::USER),
            executable: !(no_exec || f.contains(PteFlags::NO_EXECUTE)),
        })
    }

    fn create_root(&self) -> Option<MappingRoot> {
        let frame = self.frames.alloc_frame()?;
        self.zero_frame(frame);
        let new = self.table(frame);
        let kernel = self.table(PhysicalAddress::new(self.kernel_root.0));
        new.entries[KERNEL_HALF_START..].copy_from_slice(&kernel.entries[KERNEL_HALF_START..]);
        Some(MappingRoot(frame.as_u64()))
    }

    fn destroy_root(&self, root: MappingRoot) {
        assert_ne!(root, self.kernel_root, "attempted to destroy the kernel root");
        let table = self.table(PhysicalAddress::new(root.0));
        for entry in &mut table.entries[..KERNEL_HALF_START] {
            if entry.is_present() {
                self.free_table_recursive(entry.addr(), 3);
                entry.clear();
            }
        }
        // The kernel half is shared, never freed here.
        self.frames.free_frame(PhysicalAddress::new(root.0));
    }

    fn activate(&self, root: MappingRoot) {
        let cpu = arch::cpu_id() as usize;
        if self.active[cpu].load(Ordering::Relaxed) == root.0 {
            return;
        }
        self.active[cpu].store(root.0, Ordering::Relaxed);
        #[cfg(target_os = "none")]
        {
            use x86_64::registers::control::{Cr3, Cr3Flags};
            use x86_64::structures::paging::PhysFrame;
            use x86_64::PhysAddr;
            let frame = PhysFrame::containing_address(PhysAddr::new(root.0));
            // SAFETY: the root was produced by create_root (kernel half
            // cloned) or is the boot kernel root, so kernel code and the
            // HHDM stay mapped across the switch.
            unsafe { Cr3::write(frame, Cr3Flags::empty()) };
        }
    }

    fn active_root(&self) -> MappingRoot {
        let cpu = arch::cpu_id() as usize;
        MappingRoot(self.active[cpu].load(Ordering::Relaxed))
    }

    fn kernel_root(&self) -> MappingRoot {
        self.kernel_root
    }

    fn hhdm_base(&self) -> u64 {
        self.hhdm_base
    }

    fn alloc_frame(&self) -> Option<PhysicalAddress> {
        self.frames.alloc_frame()
    }

    fn free_frame(&self, pa: PhysicalAddress) {
        self.frames.free_frame(pa)
    }
}

#[cfg(all(test, not(target_os = "none")))]
pub(crate) mod tests {
    use super::*;
    use alloc::alloc::{alloc_zeroed, dealloc, Layout};
    use alloc::vec::Vec;
    use spin::Mutex;

    use crate::config::KERNEL_HALF_BASE;

    /// Mock physical memory: frames are 4 KiB-aligned host allocations,
    /// "physical" addresses are their host addresses, HHDM base is 0.
    pub struct MockPhysMemory {
        live: Mutex<Vec<u64>>,
    }

    impl MockPhysMemory {
        pub fn new() -> Self {
            Self {
                live: Mutex::new(Vec::new()),
            }
        }

        pub fn outstanding(&self) -> usize {
            self.live.lock().len()
        }
    }

    impl FrameSource for MockPhysMemory {
        fn alloc_frame(&self) -> Option<PhysicalAddress> {
            let layout = Layout::from_size_align(FRAME_SIZE, FRAME_SIZE).unwrap();
            // SAFETY: non-zero-size layout.
            let ptr = unsafe { alloc_zeroed(layout) };
            assert!(!ptr.is_null());
            self.live.lock().push(ptr as u64);
            Some(PhysicalAddress::new(ptr as u64))
        }

        fn free_frame(&self, pa: PhysicalAddress) {
            let mut live = self.live.lock();
            let pos = live
                .iter()
                .position(|&p| p == pa.as_u64())
                .expect("freeing frame that was never allocated");
            live.swap_remove(pos);
            let layout = Layout::from_size_align(FRAME_SIZE, FRAME_SIZE).unwrap();
            // SAFETY: pointer came from alloc_zeroed with this layout.
            unsafe { dealloc(pa.as_u64() as *mut u8, layout) };
        }
    }

    pub fn mock_mapper() -> (&'static X86PageMapper, &'static MockPhysMemory) {
        let mem: &'static MockPhysMemory = alloc::boxed::Box::leak(alloc::boxed::Box::new(MockPhysMemory::new()));
        let kernel_root = MappingRoot(mem.alloc_frame().unwrap().as_u64());
        let mapper = alloc::boxed::Box::leak(alloc::boxed::Box::new(X86PageMapper::new(
            0,
            kernel_root,
            mem,
        )));
        (mapper, mem)
    }

    const UVA: VirtualAddress = VirtualAddress::new(0x4000_0000);

    #[test]
    fn map_query_unmap_roundtrip() {
        let (m, mem) = mock_mapper();
        let root = m.kernel_root();
        let frame = mem.alloc_frame().unwrap();
        m.map4k(root, UVA, frame, MapFlags::WRITABLE | MapFlags::USER)
            .unwrap();
        let q = m.query4k(root, UVA).unwrap();
        assert_eq!(q.phys, frame);
        assert!(q.writable);
        assert!(q.user);
        assert!(!q.executable);
        assert_eq!(m.unmap4k(root, UVA), Some(frame));
        assert!(m.query4k(root, UVA).is_none());
    }

    #[test]
    fn double_map_rejected() {
        let (m, mem) = mock_mapper();
        let root = m.kernel_root();
        let frame = mem.alloc_frame().unwrap();
        m.map4k(root, UVA, frame, MapFlags::WRITABLE).unwrap();
        assert_eq!(
            m.map4k(root, UVA, frame, MapFlags::WRITABLE),
            Err(MapError::AlreadyMapped)
        );
    }

    #[test]
    fn rejects_bad_inputs() {
        let (m, mem) = mock_mapper();
        let root = m.kernel_root();
        let frame = mem.alloc_frame().unwrap();
        assert_eq!(
            m.map4k(root, VirtualAddress::new(0x123), frame, MapFlags::empty()),
            Err(MapError::Misaligned)
        );
        assert_eq!(
            m.map4k(
                root,
                VirtualAddress::new(0x0000_9000_0000_0000),
                frame,
                MapFlags::empty()
            ),
            Err(MapError::NonCanonical)
        );
        mem.free_frame(frame);
    }

    #[test]
    fn user_bit_upgrades_intermediates() {
        let (m, mem) = mock_mapper();
        let root = m.kernel_root();
        // Kernel-only mapping builds the path without USER.
        let kpage = mem.alloc_frame().unwrap();
        m.map4k(root, UVA, kpage, MapFlags::WRITABLE).unwrap();
        assert!(!m.query4k(root, UVA).unwrap().user);
        // A user mapping in the same subtree must upgrade the path.
        let upage = mem.alloc_frame().unwrap();
        let uva2 = VirtualAddress::new(UVA.as_u64() + FRAME_SIZE as u64);
        m.map4k(root, uva2, upage, MapFlags::WRITABLE | MapFlags::USER)
            .unwrap();
        let q = m.query4k(root, uva2).unwrap();
        assert!(q.user, "intermediate USER bit not propagated");
    }

    #[test]
    fn create_root_clones_kernel_half() {
        let (m, mem) = mock_mapper();
        let kva = VirtualAddress::new(KERNEL_HALF_BASE + 0x1000);
        let frame = mem.alloc_frame().unwrap();
        m.map4k(m.kernel_root(), kva, frame, MapFlags::WRITABLE | MapFlags::GLOBAL)
            .unwrap();
        let root = m.create_root().unwrap();
        let q = m.query4k(root, kva).unwrap();
        assert_eq!(q.phys, frame);
    }

    #[test]
    fn destroy_root_frees_tables_only() {
        let (m, mem) = mock_mapper();
        let root = m.create_root().unwrap();
        let baseline = mem.outstanding();
        let frame = mem.alloc_frame().unwrap();
        m.map4k(root, UVA, frame, MapFlags::USER | MapFlags::WRITABLE)
            .unwrap();
        assert_eq!(m.unmap4k(root, UVA), Some(frame));
        mem.free_frame(frame);
        m.destroy_root(root);
        // Root + three intermediate tables released, leaf accounted
        // separately above.
        assert_eq!(mem.outstanding(), baseline - 1);
    }

    #[test]
    fn activate_tracks_root() {
        let (m, _mem) = mock_mapper();
        let root = m.create_root().unwrap();
        assert_eq!(m.active_root(), m.kernel_root());
        m.activate(root);
        assert_eq!(m.active_root(), root);
        m.activate(root);
        assert_eq!(m.active_root(), root);
    }
}
