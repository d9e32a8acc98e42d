//! Errno namespace of the syscall ABI.
//!
//! Subsystems fail with their own typed error kinds; those are
//! converted to an [`Errno`] exactly once, at the syscall boundary.
//! On the wire an error is the two's-complement negation of the code
//! in the syscall return register.

use crate::ipc::IpcError;
use crate::mm::{FrameAllocError, MapError};

/// Errno codes surfaced to user space.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "errno values must reach the syscall return path"]
pub enum Errno {
    /// Bad handle.
    Badf = 9,
    /// Out of handles/endpoints; retry later.
    Again = 11,
    /// Out of memory.
    Nomem = 12,
    /// Bad user pointer.
    Fault = 14,
    /// No such endpoint (stale token).
    Nodev = 19,
    /// Invalid argument.
    Inval = 22,
    /// Endpoint closed underneath the caller.
    Pipe = 32,
    /// Unknown syscall.
    Nosys = 38,
}

impl Errno {
    /// Encode for the syscall return register.
    pub const fn as_ret(self) -> u64 {
        (-(self as i32 as i64)) as u64
    }
}

/// Shorthand for syscall-layer results.
pub type SysResult<T> = Result<T, Errno>;

impl From<IpcError> for Errno {
    fn from(err: IpcError) -> Self {
        match err {
            IpcError::EndpointClosed => Errno::Pipe,
            IpcError::InvalidToken => Errno::Nodev,
            IpcError::InvalidHandle => Errno::Badf,
            IpcError::RightsDenied => Errno::Badf,
            IpcError::Exhausted => Errno::Again,
            IpcError::BadMessage => Errno::Inval,
            IpcError::NotOwner => Errno::Badf,
        }
    }
}

impl From<MapError> for Errno {
    fn from(err: MapError) -> Self {
        match err {
            MapError::OutOfMemory => Errno::Nomem,
            MapError::Misaligned | MapError::NonCanonical => Errno::Inval,
            MapError::AlreadyMapped | MapError::HugePage => Errno::Inval,
        }
    }
}

impl From<FrameAllocError> for Errno {
    fn from(_: FrameAllocError) -> Self {
        Errno::Nomem
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn errno_encoding_is_negated() {
        assert_eq!(Errno::Fault.as_ret() as i64, -14);
        assert_eq!(Errno::Pipe.as_ret() as i64, -32);
        assert_eq!(Errno::Nosys.as_ret() as i64, -38);
    }

    #[test]
    fn ipc_errors_map_to_stable_codes() {
        assert_eq!(Errno::from(IpcError::EndpointClosed), Errno::Pipe);
        assert_eq!(Errno::from(IpcError::InvalidToken), Errno::Nodev);
        assert_eq!(Errno::from(IpcError::InvalidHandle), Errno::Badf);
        assert_eq!(Errno::from(IpcError::Exhausted), Errno::Again);
    }
}
