//! x86_64 architecture support: per-CPU data, context switching, ring
//! transitions, interrupt plumbing and the local-APIC scheduler platform.

pub mod apic;
pub mod context;
pub mod gdt;
pub mod idt;
pub mod percpu;
pub mod syscall;
pub mod usermode;

/// One-time bring-up for the bootstrap processor.
///
/// Installs the GDT/TSS and IDT for CPU 0, publishes the per-CPU block
/// and configures the SYSCALL MSRs. The APIC itself is programmed by the
/// platform layer once the scheduler owns it.
#[cfg(target_os = "none")]
pub fn init_bsp() {
    percpu::init_cpu(0);
    gdt::init_cpu(0);
    idt::init();
    syscall::init_cpu();
}

/// Per-AP bring-up, called from the SMP trampoline's Rust landing pad.
#[cfg(target_os = "none")]
pub fn init_ap(cpu: u32) {
    percpu::init_cpu(cpu);
    gdt::init_cpu(cpu);
    idt::load();
    syscall::init_cpu();
}
