//! Per-CPU data, reached through the GS segment base.
//!
//! Each CPU owns one [`PerCpu`] block. While the CPU executes kernel
//! code its GS base points at the block; `swapgs` in the syscall entry
//! path flips between the user and kernel GS bases. The first three
//! fields are at fixed offsets because the syscall entry stub addresses
//! them with raw `gs:` displacements.

use core::cell::UnsafeCell;

use crate::config::MAX_CPUS;

/// Fixed-layout per-CPU block.
///
/// Offsets 0x00/0x08/0x10 are baked into `syscall_entry`; keep them in
/// sync with `arch/x86_64/syscall.rs`.
#[repr(C)]
pub struct PerCpu {
    /// Kernel stack loaded on syscall entry (top of the current task's
    /// kernel stack).
    pub kernel_rsp: u64,
    /// Scratch slot holding the user RSP across a syscall.
    pub user_rsp_scratch: u64,
    /// Index of this CPU.
    pub cpu_id: u64,
}

struct PerCpuBlock(UnsafeCell<PerCpu>);

// SAFETY: each block is only mutated by its owning CPU (or by the
// scheduler while holding that CPU's lock during task switch).
unsafe impl Sync for PerCpuBlock {}

static PER_CPU: [PerCpuBlock; MAX_CPUS] = {
    const INIT: PerCpuBlock = PerCpuBlock(UnsafeCell::new(PerCpu {
        kernel_rsp: 0,
        user_rsp_scratch: 0,
        cpu_id: 0,
    }));
    [INIT; MAX_CPUS]
};

/// Publish the per-CPU block for `cpu` and point GS at it.
#[cfg(target_os = "none")]
pub fn init_cpu(cpu: u32) {
    use x86_64::registers::model_specific::{GsBase, KernelGsBase};
    use x86_64::VirtAddr;

    let block = PER_CPU[cpu as usize].0.get();
    // SAFETY: the block is statically allocated and only this CPU writes
    // it during bring-up, before any other accessor can run.
    unsafe {
        (*block).cpu_id = cpu as u64;
    }
    let addr = VirtAddr::new(block as u64);
    // Kernel GS base carries the per-CPU pointer; the plain GS base holds
    // it as well while we are still in kernel context (swapgs inverts
    // the pair on ring transitions).
    GsBase::write(addr);
    KernelGsBase::write(VirtAddr::new(0));
}

/// Index of the CPU executing the caller, from `gs:[0x10]`.
#[cfg(target_os = "none")]
#[inline]
pub fn current_cpu_id() -> u32 {
    let id: u64;
    // SAFETY: GS base was pointed at this CPU's PerCpu block by
    // `init_cpu` before interrupts or scheduling were enabled.
    unsafe {
        core::arch::asm!("mov {}, gs:[0x10]", out(reg) id, options(nostack, preserves_flags));
    }
    id as u32
}

#[cfg(not(target_os = "none"))]
#[inline]
pub fn current_cpu_id() -> u32 {
    0
}

/// Record the syscall-entry kernel stack for `cpu`.
///
/// Called by the scheduler whenever a user task becomes current.
pub fn set_kernel_rsp(cpu: u32, rsp: u64) {
    let block = PER_CPU[cpu as usize].0.get();
    // SAFETY: written only under the target CPU's scheduler lock; the
    // syscall entry stub reads it with interrupts disabled on that CPU.
    unsafe {
        (*block).kernel_rsp = rsp;
    }
}

/// Read back the syscall-entry kernel stack for `cpu`.
pub fn kernel_rsp(cpu: u32) -> u64 {
    let block = PER_CPU[cpu as usize].0.get();
    // SAFETY: see `set_kernel_rsp`; racing reads would only be observed
    // by diagnostics.
    unsafe { (*block).kernel_rsp }
}
