//! Kernel print macros. Everything goes to the serial console; the
//! framebuffer console (when one is installed) mirrors `sys_write`
//! output only, so kernel diagnostics stay on the wire.

#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        $crate::serial::_serial_print(format_args!($($arg)*))
    };
}

#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => {
        $crate::print!("{}\n", format_args!($($arg)*))
    };
}
