//! Memory management: physical frames, page tables, address spaces,
//! the kernel heap and user-memory access.
//!
//! Initialization order at boot is strict: the frame allocator comes up
//! from the boot memory map, the x86_64 mapper wraps the already-active
//! kernel page tables, the heap maps its initial pages through the
//! mapper, and only then can address spaces (which allocate) be created.

pub mod address_space;
pub mod frame_allocator;
pub mod heap;
pub mod mapper;
pub mod page_table;
pub mod uaccess;

pub use frame_allocator::{FrameAllocError, PmmStats};
pub use mapper::{MapError, MapFlags, Mapper, Mapping, MappingRoot};

use crate::config::{FRAME_SIZE, KERNEL_HALF_BASE, USER_ADDR_MAX};

static MAPPER: spin::Once<&'static dyn Mapper> = spin::Once::new();

/// Publish the kernel's mapper. Called once during memory bring-up.
pub fn install_mapper(mapper: &'static dyn Mapper) {
    MAPPER.call_once(|| mapper);
}

/// The kernel mapper.
///
/// # Panics
///
/// Panics before [`install_mapper`].
pub fn mapper() -> &'static dyn Mapper {
    *MAPPER.get().expect("mapper used before install")
}

/// Physical memory address.
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

    pub const fn offset(&self, offset: u64) -> Self {
        Self(self.0 + offset)
    }

    pub const fn is_frame_aligned(&self) -> bool {
        self.0 % FRAME_SIZE as u64 == 0
    }

    /// Index of the frame containing this address.
    pub const fn frame_index(&self) -> usize {
        (self.0 / FRAME_SIZE as u64) as usize
    }
}

/// Virtual memory address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct VirtualAddress(pub u64);

impl VirtualAddress {
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }

    pub const fn add(&self, offset: usize) -> Self {
        Self(self.0 + offset as u64)
    }

    pub const fn is_page_aligned(&self) -> bool {
        self.0 % FRAME_SIZE as u64 == 0
    }

    pub const fn align_down(&self) -> Self {
        Self(self.0 & !(FRAME_SIZE as u64 - 1))
    }

    /// Sign-extension check for 48-bit virtual addresses: bits 63..47
    /// must all equal bit 47.
    pub const fn is_canonical(&self) -> bool {
        let upper = self.0 >> 47;
        upper == 0 || upper == 0x1ffff
    }

    /// Address lies in the low (user) canonical half.
    pub const fn is_user(&self) -> bool {
        self.0 <= USER_ADDR_MAX
    }

    /// Address lies in the high (kernel) canonical half.
    pub const fn is_kernel(&self) -> bool {
        self.0 >= KERNEL_HALF_BASE
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn canonical_halves() {
        assert!(VirtualAddress::new(0).is_canonical());
        assert!(VirtualAddress::new(USER_ADDR_MAX).is_canonical());
        assert!(!VirtualAddress::new(USER_ADDR_MAX + 1).is_canonical());
        assert!(VirtualAddress::new(KERNEL_HALF_BASE).is_canonical());
        assert!(!VirtualAddress::new(KERNEL_HALF_BASE - 1).is_canonical());
    }

    #[test]
    fn alignment_helpers() {
        let a = VirtualAddress::new(0x1234);
        assert!(!a.is_page_aligned());
        assert_eq!(a.align_down().as_u64(), 0x1000);
        assert!(PhysicalAddress::new(0x3000).is_frame_aligned());
        assert_eq!(PhysicalAddress::new(0x3456).frame_index(), 3);
    }
}
