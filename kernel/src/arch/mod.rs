//! Architecture support.
//!
//! ZincOS targets x86_64 only; this module keeps the handful of
//! operations the portable kernel needs behind one seam. On the host
//! (unit tests) the interrupt and CPU-identity operations degrade to
//! no-ops so the data-structure layers can be exercised directly.

#[cfg(target_arch = "x86_64")]
pub mod x86_64;

/// Disable interrupts on the local CPU, returning whether they were
/// enabled. Pass the result to [`irq_restore`].
#[inline]
pub fn irq_save_disable() -> bool {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        use ::x86_64::instructions::interrupts;
        let was_enabled = interrupts::are_enabled();
        interrupts::disable();
        was_enabled
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    {
        false
    }
}

/// Restore the interrupt state captured by [`irq_save_disable`].
#[inline]
pub fn irq_restore(was_enabled: bool) {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        if was_enabled {
            ::x86_64::instructions::interrupts::enable();
        }
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    {
        let _ = was_enabled;
    }
}

/// Index of the CPU executing the caller.
#[inline]
pub fn cpu_id() -> u32 {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        x86_64::percpu::current_cpu_id()
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    {
        0
    }
}

/// Halt until the next interrupt.
#[inline]
pub fn wait_for_interrupt() {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        ::x86_64::instructions::hlt();
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    {
        core::hint::spin_loop();
    }
}

/// Stop the CPU permanently. Used by panic and fatal-error paths.
pub fn halt_loop() -> ! {
    loop {
        #[cfg(all(target_arch = "x86_64", target_os = "none"))]
        {
            ::x86_64::instructions::interrupts::disable();
            ::x86_64::instructions::hlt();
        }
        #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
        {
            core::hint::spin_loop();
        }
    }
}
