//! Console read/write syscalls.
//!
//! `sys_write` copies the user buffer kernel-side in bounce-buffer
//! chunks and emits it to the serial line and, when one is installed,
//! the framebuffer console. `sys_read` blocks on the keyboard line
//! buffer. File descriptors are fixed: 0 = keyboard, 1/2 = console.

use spin::Once;

use crate::config::BOUNCE_BUF_SIZE;
use crate::drivers::keyboard;
use crate::error::{Errno, SysResult};
use crate::mm::uaccess;
use crate::process;
use crate::sched;
use crate::serial;

/// Receiver for console output besides the serial line. Implemented by
/// the framebuffer text console, which lives outside the kernel core.
pub trait ConsoleSink: Send + Sync {
    fn write_bytes(&self, bytes: &[u8]);
}

static CONSOLE: Once<&'static dyn ConsoleSink> = Once::new();

/// Install the framebuffer console sink. At most one; later calls are
/// ignored.
pub fn install_console(sink: &'static dyn ConsoleSink) {
    CONSOLE.call_once(|| sink);
}

fn emit(bytes: &[u8]) {
    serial::write_bytes(bytes);
    if let Some(console) = CONSOLE.get() {
        console.write_bytes(bytes);
    }
}

pub fn sys_write(fd: u64, buf: u64, len: usize) -> SysResult<u64> {
    if fd != 1 && fd != 2 {
        return Err(Errno::Badf);
    }
    if len == 0 {
        return Ok(0);
    }
    let task = sched::current().ok_or(Errno::Inval)?;
    // SAFETY: current task's pid is stable.
    let pid = unsafe { task.get_mut().pid };
    let proc = process::get(pid).ok_or(Errno::Inval)?;

    // Full validation before the first byte is emitted, so a fault
    // half-way cannot produce partial output.
    uaccess::validate_user_buffer(&proc.space, buf, len, false)?;

    let mut bounce = [0u8; BOUNCE_BUF_SIZE];
    let mut written = 0usize;
    while written < len {
        let chunk = (len - written).min(BOUNCE_BUF_SIZE);
        uaccess::copy_from_user(&proc.space, &mut bounce[..chunk], buf + written as u64)?;
        emit(&bounce[..chunk]);
        written += chunk;
    }
    Ok(written as u64)
}

pub fn sys_read(fd: u64, buf: u64, len: usize) -> SysResult<u64> {
    if fd != 0 {
        return Err(Errno::Badf);
    }
    if len == 0 {
        return Ok(0);
    }
    let task = sched::current().ok_or(Errno::Inval)?;
    // SAFETY: current task's pid is stable.
    let pid = unsafe { task.get_mut().pid };
    let proc = process::get(pid).ok_or(Errno::Inval)?;

    uaccess::validate_user_buffer(&proc.space, buf, len, true)?;

    // One bounce chunk per read: returns as soon as input arrives.
    let mut bounce = [0u8; BOUNCE_BUF_SIZE];
    let want = len.min(BOUNCE_BUF_SIZE);
    let got = keyboard::read_blocking(task, &mut bounce[..want]);
    uaccess::copy_to_user(&proc.space, buf, &bounce[..got])?;
    Ok(got as u64)
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn write_rejects_bad_fd() {
        assert_eq!(sys_write(3, 0x1000, 4), Err(Errno::Badf));
        assert_eq!(sys_read(1, 0x1000, 4), Err(Errno::Badf));
    }

    #[test]
    fn zero_length_is_trivially_ok() {
        assert_eq!(sys_write(1, 0, 0), Ok(0));
        assert_eq!(sys_read(0, 0, 0), Ok(0));
    }
}
