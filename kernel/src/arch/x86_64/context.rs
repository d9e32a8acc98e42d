//! Kernel stack switching.
//!
//! A task's schedulable state is its kernel stack: the switch saves the
//! callee-saved registers and RFLAGS on the outgoing stack, stores RSP
//! into the outgoing task, loads the incoming task's RSP and pops the
//! same frame back. Brand-new tasks get a hand-built frame whose return
//! address is the entry trampoline below, so the first switch into them
//! "returns" into the trampoline.

use core::arch::global_asm;

global_asm!(
    ".global __zincos_switch_stacks",
    "__zincos_switch_stacks:",
    // Callee-saved registers plus RFLAGS form the switch frame. The
    // layout must match `prepare_initial_stack` below.
    "pushfq",
    "push rbp",
    "push rbx",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    "mov [rdi], rsp",
    "mov rsp, rsi",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rbx",
    "pop rbp",
    "popfq",
    "ret",
    ".global __zincos_task_entry",
    "__zincos_task_entry:",
    // First entry into a fresh task: r12 = entry fn, r13 = argument.
    // Interrupts stay off until the shim has finished the switch
    // bookkeeping; it re-enables them before running task code.
    "mov rdi, r12",
    "mov rsi, r13",
    "and rsp, -16",
    "call {shim}",
    shim = sym task_entry_shim,
);

extern "C" {
    fn __zincos_switch_stacks(old_rsp_slot: *mut u64, new_rsp: u64);
    /// First-entry trampoline; only its address is taken.
    pub fn __zincos_task_entry();
}

/// Rust landing pad for the entry trampoline.
extern "C" fn task_entry_shim(entry: extern "C" fn(usize), arg: usize) -> ! {
    // First-entry tasks never return through switch_stacks, so the
    // switch completion (previous task's on_cpu clear) happens here.
    // Interrupts must stay off until then: a preemption in between
    // would nest schedule() while the previous switch is unpublished.
    crate::sched::finish_task_switch();
    crate::arch::irq_restore(true);
    entry(arg);
    crate::sched::exit_current()
}

/// Switch kernel stacks: save into `*old_rsp_slot`, resume `new_rsp`.
///
/// Returns when the old task is switched back in.
///
/// # Safety
///
/// Must be called with interrupts disabled. `new_rsp` must be a stack
/// previously produced by this function or by [`prepare_initial_stack`],
/// and the old task must not be runnable on another CPU until its save
/// completes (the scheduler's `on_cpu` flag enforces this).
#[inline]
pub unsafe fn switch_stacks(old_rsp_slot: *mut u64, new_rsp: u64) {
    // SAFETY: forwarded contract; the asm only touches the two stacks.
    unsafe { __zincos_switch_stacks(old_rsp_slot, new_rsp) }
}

/// RFLAGS value stored in a fresh task's switch frame. IF is clear:
/// the entry shim enables interrupts only after the switch completes.
const INITIAL_RFLAGS: u64 = 0x2;

/// Build the initial switch frame on a fresh kernel stack.
///
/// `stack_top` is the exclusive upper end of the stack (16-byte
/// aligned). Returns the RSP to store in the new task. The frame layout
/// mirrors the restore sequence in `__zincos_switch_stacks`:
///
/// ```text
///   [top-8]  return address = __zincos_task_entry
///   [top-16] rflags (IF=0)
///   [top-24] rbp = 0
///   [top-32] rbx = 0
///   [top-40] r12 = entry
///   [top-48] r13 = arg
///   [top-56] r14 = 0
///   [top-64] r15 = 0    <- initial RSP
/// ```
pub fn prepare_initial_stack(stack_top: u64, entry: extern "C" fn(usize), arg: usize) -> u64 {
    debug_assert_eq!(stack_top % 16, 0);
    let frame = [
        0u64,                        // r15
        0,                           // r14
        arg as u64,                  // r13
        entry as usize as u64,       // r12
        0,                           // rbx
        0,                           // rbp
        INITIAL_RFLAGS,              // rflags
        __zincos_task_entry as usize as u64, // return address
    ];
    let rsp = stack_top - (frame.len() as u64) * 8;
    for (i, value) in frame.iter().enumerate() {
        // SAFETY: the caller owns [rsp, stack_top) as a fresh stack.
        unsafe {
            ((rsp as *mut u64).add(i)).write(*value);
        }
    }
    rsp
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    extern "C" fn nop_entry(_arg: usize) {}

    #[test]
    fn initial_frame_layout() {
        let stack = alloc::vec![0u8; 4096];
        let top = (stack.as_ptr() as u64 + 4096) & !15;
        let rsp = prepare_initial_stack(top, nop_entry, 0x1234);
        assert_eq!(top - rsp, 64);
        // SAFETY: the frame was just written inside the live buffer.
        let words =
            unsafe { core::slice::from_raw_parts(rsp as *const u64, 8) };
        assert_eq!(words[0], 0); // r15
        assert_eq!(words[2], 0x1234); // r13 = arg
        assert_eq!(words[3], nop_entry as usize as u64); // r12 = entry
        assert_eq!(words[6], INITIAL_RFLAGS);
        assert_eq!(words[7], __zincos_task_entry as usize as u64);
    }
}
