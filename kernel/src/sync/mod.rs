//! Synchronization primitives.

mod irq_mutex;

pub use irq_mutex::{IrqMutex, IrqMutexGuard};
