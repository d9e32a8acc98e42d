//! ZincOS kernel library.
//!
//! The kernel core as a library crate: memory management, scheduling,
//! IPC and the syscall boundary, plus the serial/logging plumbing they
//! sit on. The binary target (`main.rs`) adds the boot entry points;
//! this crate also builds for the host so the unit-test suite runs
//! under the standard harness.

#![no_std]
#![cfg_attr(target_os = "none", feature(abi_x86_interrupt))]
#![cfg_attr(target_os = "none", feature(alloc_error_handler))]

extern crate alloc;

// Host target (unit tests, miri): use the system allocator so test
// code allocates normally.
#[cfg(not(target_os = "none"))]
extern crate std;

#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

// Bare metal: the kernel heap is the global allocator. It must be
// initialized by `mm` bring-up before the first allocation.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
#[global_allocator]
static KERNEL_HEAP: mm::heap::LockedHeap = mm::heap::LockedHeap::empty();

/// The kernel heap singleton (bare metal only).
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn kernel_heap() -> &'static mm::heap::LockedHeap {
    &KERNEL_HEAP
}

#[macro_use]
pub mod serial;
#[macro_use]
pub mod print;

pub mod arch;
pub mod boot_info;
pub mod config;
pub mod drivers;
pub mod error;
pub mod ipc;
pub mod logger;
pub mod mm;
pub mod process;
pub mod sched;
pub mod sync;
pub mod syscall;
pub mod test_support;

pub use test_support::{exit_qemu, QemuExitCode, Testable};

/// Heap allocation failure in a no_std kernel is unrecoverable.
#[cfg(target_os = "none")]
#[alloc_error_handler]
fn alloc_error_handler(layout: core::alloc::Layout) -> ! {
    panic!("kernel heap exhausted: {:?}", layout);
}
