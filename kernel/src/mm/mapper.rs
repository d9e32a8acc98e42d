//! Architecture-neutral page-mapping interface.
//!
//! The rest of the kernel manipulates translations only through
//! [`Mapper`], keyed by an opaque [`MappingRoot`]. The x86_64
//! implementation lives in `page_table.rs`; unit tests drive the same
//! trait over mock physical memory.

use bitflags::bitflags;

use super::{PhysicalAddress, VirtualAddress};

bitflags! {
    /// Architecture-neutral mapping attributes. The implementation
    /// translates these to hardware PTE bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u64 {
        const WRITABLE      = 1 << 0;
        const EXECUTABLE    = 1 << 1;
        const USER          = 1 << 2;
        /// Device/MMIO memory: uncached.
        const DEVICE        = 1 << 3;
        const GLOBAL        = 1 << 4;
        const WRITE_THROUGH = 1 << 5;
        const NO_CACHE      = 1 << 6;
    }
}

/// Opaque handle for a top-level page table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct MappingRoot(pub u64);

/// Result of a translation query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    pub phys: PhysicalAddress,
    pub writable: bool,
    pub user: bool,
    pub executable: bool,
}

/// Mapping failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "mapping errors must be handled"]
pub enum MapError {
    /// Address not 4 KiB aligned.
    Misaligned,
    /// Virtual address is not canonical.
    NonCanonical,
    /// A leaf already exists at the address.
    AlreadyMapped,
    /// A huge-page entry blocks the 4 KiB walk.
    HugePage,
    /// No frames left for page tables.
    OutOfMemory,
}

/// Source of physical frames for page tables and anonymous memory.
///
/// Implemented by the PMM; tests substitute mock physical memory.
pub trait FrameSource: Send + Sync {
    fn alloc_frame(&self) -> Option<PhysicalAddress>;
    fn free_frame(&self, pa: PhysicalAddress);
}

/// Page-table operations rooted at an opaque handle.
pub trait Mapper: Send + Sync {
    /// Install a 4 KiB translation `va -> pa`.
    fn map4k(
        &self,
        root: MappingRoot,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: MapFlags,
    ) -> Result<(), MapError>;

    /// Remove a 4 KiB translation, returning the physical address it
    /// pointed at.
    fn unmap4k(&self, root: MappingRoot, va: VirtualAddress) -> Option<PhysicalAddress>;

    /// Look up a 4 KiB translation.
    fn query4k(&self, root: MappingRoot, va: VirtualAddress) -> Option<Mapping>;

    /// Create a fresh root with the kernel half cloned in.
    fn create_root(&self) -> Option<MappingRoot>;

    /// Free a root's page-table frames. All user leaves must have been
    /// unmapped beforehand; the tables only are released.
    fn destroy_root(&self, root: MappingRoot);

    /// Make `root` the active translation root on this CPU. A no-op if
    /// it already is (avoids the TLB flush).
    fn activate(&self, root: MappingRoot);

    /// Root currently active on this CPU.
    fn active_root(&self) -> MappingRoot;

    /// The kernel's own root, created at boot.
    fn kernel_root(&self) -> MappingRoot;

    /// Base of the high-half direct map.
    fn hhdm_base(&self) -> u64;

    /// Frame allocation, forwarded from the frame source so callers
    /// holding only a `&dyn Mapper` can allocate leaf frames.
    fn alloc_frame(&self) -> Option<PhysicalAddress>;

    fn free_frame(&self, pa: PhysicalAddress);
}
