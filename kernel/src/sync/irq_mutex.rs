//! Interrupt-safe spinlock.
//!
//! Every lock that an interrupt handler can contend must be taken with
//! local interrupts disabled, otherwise an IRQ arriving while the lock is
//! held deadlocks the CPU. `IrqMutex` pairs the interrupt-state
//! save/restore with the lock acquisition in one scoped primitive so the
//! two can never be separated at a call site.

use core::ops::{Deref, DerefMut};

use spin::{Mutex, MutexGuard};

use crate::arch;

/// A spinlock whose guard also holds interrupts disabled on the local CPU.
///
/// The previous interrupt state is captured before the lock is taken and
/// restored when the guard drops, so nesting is safe: inner guards restore
/// "disabled" and only the outermost guard re-enables.
pub struct IrqMutex<T: ?Sized> {
    inner: Mutex<T>,
}

/// Guard for [`IrqMutex`]. Interrupts stay off until this drops.
pub struct IrqMutexGuard<'a, T: ?Sized> {
    guard: Option<MutexGuard<'a, T>>,
    was_enabled: bool,
}

impl<T> IrqMutex<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: Mutex::new(value),
        }
    }
}

impl<T: ?Sized> IrqMutex<T> {
    /// Disable interrupts, then spin until the lock is acquired.
    pub fn lock(&self) -> IrqMutexGuard<'_, T> {
        let was_enabled = arch::irq_save_disable();
        IrqMutexGuard {
            guard: Some(self.inner.lock()),
            was_enabled,
        }
    }

    /// Disable interrupts and attempt the lock once.
    ///
    /// On failure the interrupt state is restored immediately and `None`
    /// is returned. Used by the work-stealing path, which must never spin
    /// on a remote CPU's queue lock.
    pub fn try_lock(&self) -> Option<IrqMutexGuard<'_, T>> {
        let was_enabled = arch::irq_save_disable();
        match self.inner.try_lock() {
            Some(guard) => Some(IrqMutexGuard {
                guard: Some(guard),
                was_enabled,
            }),
            None => {
                arch::irq_restore(was_enabled);
                None
            }
        }
    }

    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }
}

impl<T: ?Sized> Deref for IrqMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.guard.as_ref().unwrap()
    }
}

impl<T: ?Sized> DerefMut for IrqMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard.as_mut().unwrap()
    }
}

impl<T: ?Sized> Drop for IrqMutexGuard<'_, T> {
    fn drop(&mut self) {
        // Release the lock before re-enabling interrupts. The reverse
        // order would open a window where an IRQ handler spins on a lock
        // held by its own CPU.
        self.guard.take();
        arch::irq_restore(self.was_enabled);
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    #[test]
    fn lock_serializes_mutation() {
        let m = IrqMutex::new(0u32);
        {
            let mut g = m.lock();
            *g += 1;
        }
        assert_eq!(*m.lock(), 1);
    }

    #[test]
    fn try_lock_fails_while_held() {
        let m = IrqMutex::new(());
        let g = m.lock();
        assert!(m.try_lock().is_none());
        drop(g);
        assert!(m.try_lock().is_some());
    }

    #[test]
    fn guard_release_unlocks() {
        let m = IrqMutex::new(5u8);
        drop(m.lock());
        assert!(!m.is_locked());
    }
}
