//! Inter-process communication: rendezvous endpoints, the global
//! endpoint registry, per-process handle tables and shared memory.

pub mod endpoint;
pub mod error;
pub mod handle;
pub mod message;
pub mod registry;
pub mod shm;

#[cfg(all(test, not(target_os = "none")))]
mod tests;

pub use endpoint::Endpoint;
pub use error::{IpcError, Result};
pub use handle::{Handle, HandleKind, HandleObject, HandleTable, Rights};
pub use message::{Message, Tag};
pub use registry::EndpointToken;
pub use shm::ShmToken;
