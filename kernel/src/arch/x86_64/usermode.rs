//! Ring 0 → Ring 3 transition.

#![cfg(target_os = "none")]

use core::arch::asm;

use super::{gdt, percpu};

/// Enter user mode for the first time via `iretq`.
///
/// The frame pushed here is what `iretq` pops: RIP, CS, RFLAGS, RSP, SS,
/// with the ring-3 selectors taken from this CPU's GDT. RFLAGS carries
/// IF so the user task is preemptible from its first instruction.
///
/// # Safety
///
/// The caller must have activated an address space mapping `entry` as
/// user-executable code and `user_stack` as user-writable memory, and
/// must have installed this task's kernel stack in the per-CPU block and
/// TSS; the next syscall or interrupt relies on it.
pub unsafe fn enter_user_mode(entry: u64, user_stack: u64) -> ! {
    let sel = gdt::selectors(percpu::current_cpu_id());
    let user_cs = sel.user_code.0 as u64;
    let user_ss = sel.user_data.0 as u64;
    // SAFETY: forwarded contract; the iretq frame is built on the
    // current kernel stack and consumed immediately. The swapgs parks
    // the per-CPU pointer in KERNEL_GS_BASE, establishing the invariant
    // the syscall entry stub undoes on the way back in.
    unsafe {
        asm!(
            "mov ds, {ss:r}",
            "mov es, {ss:r}",
            "push {ss}",
            "push {rsp}",
            "push {rflags}",
            "push {cs}",
            "push {rip}",
            "swapgs",
            "iretq",
            ss = in(reg) user_ss,
            rsp = in(reg) user_stack,
            rflags = in(reg) 0x202u64,
            cs = in(reg) user_cs,
            rip = in(reg) entry,
            options(noreturn)
        );
    }
}
