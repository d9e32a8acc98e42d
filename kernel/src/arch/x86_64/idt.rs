//! Interrupt descriptor table and the kernel-side interrupt handlers.
//!
//! Only the vectors the kernel core owns are installed here: CPU
//! exceptions (routed to the scheduler when they originate in user
//! mode), the scheduler timer and the cross-CPU reschedule vector.
//! Device interrupt routing lives with the platform bring-up code, as
//! do the low-level entry thunks: handlers below run with the kernel
//! GS base in place (the thunks perform the conditional swapgs for
//! traps arriving from ring 3).

#![cfg(target_os = "none")]

use lazy_static::lazy_static;
use x86_64::registers::control::Cr2;
use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};

use super::{apic, gdt};
use crate::sched;

/// Local-APIC timer vector.
pub const TIMER_VECTOR: u8 = 0x20;
/// Cross-CPU reschedule IPI vector.
pub const RESCHED_VECTOR: u8 = 0x21;

lazy_static! {
    static ref IDT: InterruptDescriptorTable = {
        let mut idt = InterruptDescriptorTable::new();
        idt.breakpoint.set_handler_fn(breakpoint_handler);
        idt.invalid_opcode.set_handler_fn(invalid_opcode_handler);
        idt.general_protection_fault
            .set_handler_fn(general_protection_handler);
        idt.page_fault.set_handler_fn(page_fault_handler);
        // SAFETY: the double-fault IST slot is populated by gdt::init_cpu
        // before the IDT is loaded.
        unsafe {
            idt.double_fault
                .set_handler_fn(double_fault_handler)
                .set_stack_index(gdt::DOUBLE_FAULT_IST_INDEX);
        }
        idt[TIMER_VECTOR].set_handler_fn(timer_handler);
        idt[RESCHED_VECTOR].set_handler_fn(resched_handler);
        idt
    };
}

/// Build and load the IDT on the BSP.
pub fn init() {
    IDT.load();
}

/// Load the already-built IDT on an AP.
pub fn load() {
    IDT.load();
}

fn frame_is_user(frame: &InterruptStackFrame) -> bool {
    // Low two bits of CS hold the requested privilege level.
    frame.code_segment.rpl() as u8 == 3
}

extern "x86-interrupt" fn breakpoint_handler(frame: InterruptStackFrame) {
    log::warn!("breakpoint at {:#x}", frame.instruction_pointer.as_u64());
}

extern "x86-interrupt" fn invalid_opcode_handler(frame: InterruptStackFrame) {
    if frame_is_user(&frame) {
        sched::on_user_exception(6, 0, frame.instruction_pointer.as_u64(), 0);
        // The faulting task is dead; switch away before returning to
        // user mode would resume it.
        sched::preempt_if_needed();
        return;
    }
    panic!("invalid opcode in kernel at {:#x}", frame.instruction_pointer.as_u64());
}

extern "x86-interrupt" fn general_protection_handler(frame: InterruptStackFrame, err: u64) {
    if frame_is_user(&frame) {
        sched::on_user_exception(13, err, frame.instruction_pointer.as_u64(), 0);
        sched::preempt_if_needed();
        return;
    }
    panic!(
        "general protection fault in kernel at {:#x} (err {:#x})",
        frame.instruction_pointer.as_u64(),
        err
    );
}

extern "x86-interrupt" fn page_fault_handler(frame: InterruptStackFrame, err: PageFaultErrorCode) {
    let cr2 = Cr2::read().map(|a| a.as_u64()).unwrap_or(0);
    if frame_is_user(&frame) {
        sched::on_user_exception(14, err.bits(), frame.instruction_pointer.as_u64(), cr2);
        sched::preempt_if_needed();
        return;
    }
    panic!(
        "page fault in kernel at {:#x}, address {:#x} ({:?})",
        frame.instruction_pointer.as_u64(),
        cr2,
        err
    );
}

extern "x86-interrupt" fn double_fault_handler(frame: InterruptStackFrame, _err: u64) -> ! {
    panic!("double fault at {:#x}", frame.instruction_pointer.as_u64());
}

extern "x86-interrupt" fn timer_handler(_frame: InterruptStackFrame) {
    sched::timer_tick();
    apic::eoi();
    // Preemption happens on the way out of the interrupt, never inside
    // it. Interrupts that nested inside an IRQ-off critical section
    // cannot reach this point with need_resched pending work to do,
    // because such sections never mark the current task unrunnable.
    sched::preempt_if_needed();
}

extern "x86-interrupt" fn resched_handler(_frame: InterruptStackFrame) {
    // The wake that raised this IPI already enqueued the task; observing
    // the queue on the next schedule() is all that is needed.
    sched::set_need_resched();
    apic::eoi();
    sched::preempt_if_needed();
}
