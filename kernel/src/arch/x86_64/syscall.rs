//! SYSCALL/SYSRET entry path.
//!
//! The stub materializes a [`crate::syscall::SyscallFrame`] on the
//! task's kernel stack and hands its address to the portable
//! dispatcher; the frame's `rax` slot carries the syscall number in and
//! the return value out. Offsets into the per-CPU block (`gs:[0x00]`
//! kernel RSP, `gs:[0x08]` user RSP scratch) are fixed by
//! `arch/x86_64/percpu.rs`.

#![cfg(target_os = "none")]

use x86_64::registers::model_specific::{Efer, EferFlags, LStar, SFMask, Star};
use x86_64::registers::rflags::RFlags;
use x86_64::VirtAddr;

use super::{gdt, percpu};

core::arch::global_asm!(
    ".global __zincos_syscall_entry",
    "__zincos_syscall_entry:",
    "swapgs",
    "mov gs:[0x8], rsp",
    "mov rsp, gs:[0x0]",
    // Build the SyscallFrame (fields at ascending addresses: rax, six
    // args, user rip, user rflags, user rsp).
    "push qword ptr gs:[0x8]",
    "push r11",
    "push rcx",
    "push r9",
    "push r8",
    "push r10",
    "push rdx",
    "push rsi",
    "push rdi",
    "push rax",
    "mov rdi, rsp",
    // Interrupts were masked by SFMASK; the dispatcher may block, so
    // re-enable before entering Rust.
    "sti",
    "call {dispatch}",
    "cli",
    "pop rax",
    "add rsp, 48",
    "pop rcx",
    "pop r11",
    "mov rsp, [rsp]",
    // Don't leak kernel register state to user mode.
    "xor edi, edi",
    "xor esi, esi",
    "xor edx, edx",
    "xor r8d, r8d",
    "xor r9d, r9d",
    "xor r10d, r10d",
    "swapgs",
    "sysretq",
    dispatch = sym crate::syscall::dispatch_frame,
);

extern "C" {
    fn __zincos_syscall_entry();
}

/// Program the SYSCALL MSRs for the current CPU.
pub fn init_cpu() {
    let sel = gdt::selectors(percpu::current_cpu_id());
    // SAFETY: the selectors come from the GDT just installed on this
    // CPU and satisfy the STAR layout constraint (user SS at base+8,
    // user CS at base+16).
    unsafe {
        Efer::update(|flags| flags.insert(EferFlags::SYSTEM_CALL_EXTENSIONS));
        LStar::write(VirtAddr::new(__zincos_syscall_entry as usize as u64));
        Star::write(sel.user_code, sel.user_data, sel.kernel_code, sel.kernel_data)
            .expect("STAR selector layout");
        // Mask IF on entry; the stub re-enables once on the kernel stack.
        SFMask::write(RFlags::INTERRUPT_FLAG);
    }
}
