//! Kernel-wide tunables.
//!
//! Every compile-time knob lives here so subsystem modules stay free of
//! magic numbers. Runtime-discovered configuration (CPU count, HHDM base,
//! memory map) arrives through [`crate::boot_info::BootInfo`] instead.

/// Maximum number of CPUs the kernel will schedule on.
pub const MAX_CPUS: usize = 16;

/// Size of a physical frame and of a virtual page.
pub const FRAME_SIZE: usize = 4096;

/// Capacity of each per-CPU frame cache.
pub const FRAME_CACHE_SIZE: usize = 64;

/// Number of frames pulled from the global bitmap on a cache miss.
pub const FRAME_CACHE_REFILL: usize = 32;

/// Cache fill level at which half the cache is drained back to the bitmap.
pub const FRAME_CACHE_FLUSH_THRESHOLD: usize = 56;

/// Base of the kernel heap's virtual range.
pub const HEAP_BASE: u64 = 0xffff_c000_0000_0000;

/// Maximum size the kernel heap may grow to (1 GiB).
pub const HEAP_MAX_SIZE: usize = 1024 * 1024 * 1024;

/// Pages mapped for the heap up front at boot.
pub const HEAP_INITIAL_PAGES: usize = 256;

/// Number of scheduler priority levels. Lower value = higher priority.
pub const PRIORITY_LEVELS: usize = 32;

/// Default priority for new tasks (middle of the normal band).
pub const DEFAULT_PRIORITY: u8 = 20;

/// Maximum tasks taken from a victim CPU in one work-stealing pass.
pub const STEAL_BATCH_SIZE: usize = 4;

/// A victim queue must hold at least this many tasks to be stolen from.
pub const STEAL_MIN_QUEUE: usize = 2;

/// Kernel stack size for every task.
pub const KERNEL_STACK_SIZE: usize = 32 * 1024;

/// Total endpoint registry slots.
pub const MAX_ENDPOINTS: usize = 4096;

/// Per-process handle table capacity (14-bit handle index).
pub const MAX_HANDLE_SLOTS: usize = 16384;

/// Shared-memory region registry slots.
pub const MAX_SHM_REGIONS: usize = 256;

/// Maximum pages in one shared-memory region (4 MiB).
pub const MAX_SHM_PAGES: usize = 1024;

/// Process table capacity.
pub const MAX_PROCESSES: usize = 256;

/// Stack bounce buffer used by the syscall dispatcher for user copies.
pub const BOUNCE_BUF_SIZE: usize = 256;

/// Keyboard line buffer capacity.
pub const KEYBOARD_BUFFER_SIZE: usize = 256;

/// Highest valid user-space address (48-bit low canonical half).
pub const USER_ADDR_MAX: u64 = 0x0000_7fff_ffff_ffff;

/// First address of the canonical kernel half.
pub const KERNEL_HALF_BASE: u64 = 0xffff_8000_0000_0000;

/// Value the loader stores in `BootInfo::magic`.
pub const BOOT_INFO_MAGIC: u64 = 0x5a1c_05b0_07f0_0d01;

/// Default log level compiled into the kernel.
pub const DEFAULT_LOG_LEVEL: log::LevelFilter = log::LevelFilter::Info;
