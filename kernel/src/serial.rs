//! COM1 serial console.
//!
//! Primary output channel: the boot banner, the logger and `sys_write`
//! all end up here. Output takes the port lock with interrupts
//! disabled so IRQ-context logging cannot interleave or deadlock.

use core::fmt;

use crate::sync::IrqMutex;

#[cfg(target_os = "none")]
static SERIAL1: IrqMutex<Option<uart_16550::SerialPort>> = IrqMutex::new(None);

/// Initialize COM1. Called once, before the logger comes up.
pub fn init() {
    #[cfg(target_os = "none")]
    {
        // SAFETY: 0x3F8 is the standard COM1 port block; nothing else
        // in the kernel drives it.
        let mut port = unsafe { uart_16550::SerialPort::new(0x3f8) };
        port.init();
        *SERIAL1.lock() = Some(port);
    }
}

/// Write raw bytes to the serial line.
pub fn write_bytes(bytes: &[u8]) {
    #[cfg(target_os = "none")]
    {
        let mut guard = SERIAL1.lock();
        if let Some(port) = guard.as_mut() {
            for &b in bytes {
                port.send(b);
            }
        }
    }
    #[cfg(not(target_os = "none"))]
    {
        let _ = bytes;
    }
}

#[doc(hidden)]
pub fn _serial_print(args: fmt::Arguments) {
    #[cfg(target_os = "none")]
    {
        use core::fmt::Write;
        let mut guard = SERIAL1.lock();
        if let Some(port) = guard.as_mut() {
            let _ = port.write_fmt(args);
        }
    }
    #[cfg(not(target_os = "none"))]
    {
        // Host (unit tests): forward to stdout.
        std::print!("{}", args);
    }
}

#[macro_export]
macro_rules! serial_print {
    ($($arg:tt)*) => {
        $crate::serial::_serial_print(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! serial_println {
    () => ($crate::serial_print!("\n"));
    ($($arg:tt)*) => {
        $crate::serial_print!("{}\n", format_args!($($arg)*))
    };
}
