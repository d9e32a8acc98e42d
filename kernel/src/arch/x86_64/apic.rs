//! Local-APIC backed scheduler platform.
//!
//! The kernel core drives the local APIC in x2APIC mode through MSRs:
//! one-shot timer arming for quanta and fixed-vector IPIs for cross-CPU
//! reschedule. Discovery and calibration stay outside the core: the
//! boot code hands this module the CPU→APIC-id table and the calibrated
//! timer-counts-per-millisecond factor.

use core::sync::atomic::{AtomicU32, Ordering};

use crate::arch::x86_64::percpu;
use crate::config::MAX_CPUS;
use crate::sched::Platform;

#[cfg(target_os = "none")]
mod msr {
    pub const X2APIC_EOI: u32 = 0x80b;
    pub const X2APIC_ICR: u32 = 0x830;
    pub const X2APIC_LVT_TIMER: u32 = 0x832;
    pub const X2APIC_TIMER_INIT: u32 = 0x838;
    pub const X2APIC_TIMER_DIV: u32 = 0x83e;
}

#[cfg(target_os = "none")]
fn wrmsr(reg: u32, value: u64) {
    // SAFETY: all registers written here are architectural x2APIC MSRs;
    // the values are composed from the constants in this module.
    unsafe {
        x86_64::registers::model_specific::Msr::new(reg).write(value);
    }
}

/// Signal end-of-interrupt for the in-service vector.
pub fn eoi() {
    #[cfg(target_os = "none")]
    wrmsr(msr::X2APIC_EOI, 0);
}

/// Scheduler platform backed by the local APIC.
pub struct ApicPlatform {
    cpu_count: AtomicU32,
    /// Calibrated timer counts per millisecond (per-package constant).
    counts_per_ms: AtomicU32,
    /// CPU index -> APIC id, filled in from the boot CPU table.
    apic_ids: [AtomicU32; MAX_CPUS],
}

impl ApicPlatform {
    pub const fn new() -> Self {
        const ID: AtomicU32 = AtomicU32::new(0);
        Self {
            cpu_count: AtomicU32::new(1),
            counts_per_ms: AtomicU32::new(0),
            apic_ids: [ID; MAX_CPUS],
        }
    }

    /// Record boot-discovered topology and timer calibration.
    pub fn configure(&self, cpu_count: u32, counts_per_ms: u32, apic_ids: &[u32]) {
        self.cpu_count.store(cpu_count, Ordering::Relaxed);
        self.counts_per_ms.store(counts_per_ms, Ordering::Relaxed);
        for (i, id) in apic_ids.iter().take(MAX_CPUS).enumerate() {
            self.apic_ids[i].store(*id, Ordering::Relaxed);
        }
    }
}

impl Default for ApicPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for ApicPlatform {
    fn cpu_id(&self) -> u32 {
        percpu::current_cpu_id()
    }

    fn cpu_count(&self) -> u32 {
        self.cpu_count.load(Ordering::Relaxed)
    }

    fn arm_timer_oneshot(&self, ticks: u32) {
        #[cfg(target_os = "none")]
        {
            let counts = self
                .counts_per_ms
                .load(Ordering::Relaxed)
                .saturating_mul(ticks.max(1));
            // Divide-by-16, one-shot mode, scheduler timer vector.
            wrmsr(msr::X2APIC_TIMER_DIV, 0b0011);
            wrmsr(
                msr::X2APIC_LVT_TIMER,
                super::idt::TIMER_VECTOR as u64,
            );
            wrmsr(msr::X2APIC_TIMER_INIT, counts as u64);
        }
        #[cfg(not(target_os = "none"))]
        let _ = ticks;
    }

    fn disarm_timer(&self) {
        #[cfg(target_os = "none")]
        wrmsr(msr::X2APIC_TIMER_INIT, 0);
    }

    fn send_resched_ipi(&self, cpu: u32) {
        #[cfg(target_os = "none")]
        {
            let apic_id = self.apic_ids[cpu as usize].load(Ordering::Relaxed) as u64;
            // Fixed delivery, physical destination in the upper dword.
            let icr = (apic_id << 32) | super::idt::RESCHED_VECTOR as u64;
            wrmsr(msr::X2APIC_ICR, icr);
        }
        #[cfg(not(target_os = "none"))]
        let _ = cpu;
    }

    fn set_kernel_stack(&self, cpu: u32, rsp: u64) {
        percpu::set_kernel_rsp(cpu, rsp);
        #[cfg(target_os = "none")]
        super::gdt::set_tss_rsp0(cpu, rsp);
    }
}

/// The platform instance handed to the scheduler at boot.
pub static PLATFORM: ApicPlatform = ApicPlatform::new();
