//! Per-CPU GDT and TSS.
//!
//! Ring transitions need a TSS holding the kernel stack (`rsp0`) and the
//! SYSCALL/SYSRET machinery needs the segment layout below: kernel code,
//! kernel data, user data, user code, in that order, so the STAR MSR's
//! sysret base selector resolves user SS at +8 and user CS at +16.

#![cfg(target_os = "none")]

use core::cell::UnsafeCell;

use x86_64::registers::segmentation::{Segment, CS, DS, ES, SS};
use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector};
use x86_64::structures::tss::TaskStateSegment;
use x86_64::VirtAddr;

use crate::config::MAX_CPUS;

/// IST slot used by the double-fault handler.
pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;

const IST_STACK_SIZE: usize = 16 * 1024;

#[derive(Clone, Copy)]
pub struct Selectors {
    pub kernel_code: SegmentSelector,
    pub kernel_data: SegmentSelector,
    pub user_data: SegmentSelector,
    pub user_code: SegmentSelector,
    pub tss: SegmentSelector,
}

struct CpuTables {
    gdt: UnsafeCell<GlobalDescriptorTable>,
    tss: UnsafeCell<TaskStateSegment>,
    ist_stack: UnsafeCell<[u8; IST_STACK_SIZE]>,
    selectors: UnsafeCell<Option<Selectors>>,
}

// SAFETY: each CpuTables entry is only touched by its owning CPU, once,
// during bring-up, and read-only afterwards.
unsafe impl Sync for CpuTables {}

static CPU_TABLES: [CpuTables; MAX_CPUS] = {
    const INIT: CpuTables = CpuTables {
        gdt: UnsafeCell::new(GlobalDescriptorTable::new()),
        tss: UnsafeCell::new(TaskStateSegment::new()),
        ist_stack: UnsafeCell::new([0; IST_STACK_SIZE]),
        selectors: UnsafeCell::new(None),
    };
    [INIT; MAX_CPUS]
};

/// Build and load the GDT/TSS for `cpu`. Must run on that CPU.
pub fn init_cpu(cpu: u32) {
    let tables = &CPU_TABLES[cpu as usize];

    // SAFETY: bring-up runs once per CPU before anything else on that
    // CPU references these tables.
    unsafe {
        let tss = &mut *tables.tss.get();
        let ist_top = tables.ist_stack.get() as u64 + IST_STACK_SIZE as u64;
        tss.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] = VirtAddr::new(ist_top);

        let gdt = &mut *tables.gdt.get();
        let kernel_code = gdt.append(Descriptor::kernel_code_segment());
        let kernel_data = gdt.append(Descriptor::kernel_data_segment());
        let user_data = gdt.append(Descriptor::user_data_segment());
        let user_code = gdt.append(Descriptor::user_code_segment());
        let tss_sel = gdt.append(Descriptor::tss_segment(&*tables.tss.get()));

        *tables.selectors.get() = Some(Selectors {
            kernel_code,
            kernel_data,
            user_data,
            user_code,
            tss: tss_sel,
        });

        // The table lives in a static; load_unsafe sidesteps the
        // &'static self requirement that the UnsafeCell access hides.
        gdt.load_unsafe();
        CS::set_reg(kernel_code);
        SS::set_reg(kernel_data);
        DS::set_reg(kernel_data);
        ES::set_reg(kernel_data);
        x86_64::instructions::tables::load_tss(tss_sel);
    }
}

/// Segment selectors installed for `cpu`.
///
/// # Panics
///
/// Panics if the CPU's tables were never initialized; per-CPU state
/// missing at a privilege transition is fatal.
pub fn selectors(cpu: u32) -> Selectors {
    // SAFETY: read-only after init_cpu.
    unsafe { (*CPU_TABLES[cpu as usize].selectors.get()).expect("GDT not initialized for CPU") }
}

/// Update the ring-0 stack used on interrupts arriving from user mode.
pub fn set_tss_rsp0(cpu: u32, rsp: u64) {
    // SAFETY: the field is only written under the CPU's scheduler lock
    // and read by the hardware on privilege transitions.
    unsafe {
        (*CPU_TABLES[cpu as usize].tss.get()).privilege_stack_table[0] = VirtAddr::new(rsp);
    }
}
