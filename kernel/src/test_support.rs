//! Bare-metal test plumbing: QEMU exit device and the runner shim.

/// Exit codes reported through the ISA debug-exit device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum QemuExitCode {
    Success = 0x10,
    Failed = 0x11,
}

/// Terminate the QEMU instance (no-op outside bare metal).
pub fn exit_qemu(exit_code: QemuExitCode) {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        use x86_64::instructions::port::Port;
        // SAFETY: 0xf4 is the isa-debug-exit device configured by the
        // test runner; writing it terminates the VM.
        unsafe {
            let mut port = Port::new(0xf4);
            port.write(exit_code as u32);
        }
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    let _ = exit_code;
}

/// Wrapper giving bare-metal tests a printed name and pass marker.
pub trait Testable {
    fn run(&self);
}

impl<T: Fn()> Testable for T {
    fn run(&self) {
        crate::serial_print!("{}...\t", core::any::type_name::<T>());
        self();
        crate::serial_println!("[ok]");
    }
}
