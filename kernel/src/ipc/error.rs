//! IPC error kinds.

/// IPC operation result type.
pub type Result<T> = core::result::Result<T, IpcError>;

/// Failures surfaced by the IPC layer. Translated to errno values at
/// the syscall boundary only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "IPC errors must be handled"]
pub enum IpcError {
    /// The endpoint was destroyed (before or during the operation).
    EndpointClosed,
    /// Token generation does not match the registry slot.
    InvalidToken,
    /// Handle failed table lookup.
    InvalidHandle,
    /// Handle lacks a required right.
    RightsDenied,
    /// No free registry slot / handle slot.
    Exhausted,
    /// Malformed message or an operation misused (e.g. reply to a task
    /// that is not waiting).
    BadMessage,
    /// Caller does not own the object.
    NotOwner,
}
