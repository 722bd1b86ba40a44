//! Interrupt-masking mutual exclusion.
//!
//! On a uniprocessor the run queue, process table and allocator state are
//! shared only with interrupt handlers, so masking interrupts for the
//! duration of the critical section is the whole locking story. [`IrqLock`]
//! saves RFLAGS.IF, disables interrupts, and restores the saved state when
//! the guard leaves scope along every path. The inner flag still makes a
//! nested acquire loud instead of silently corrupting state.
//!
//! On hosts (tests) the interrupt save/restore is a no-op and the lock
//! degenerates to a plain spin lock.

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

#[cfg(all(target_os = "none", target_arch = "x86_64"))]
#[inline]
fn save_and_disable() -> u64 {
    let flags: u64;
    // SAFETY: pushfq/pop reads RFLAGS; cli only masks interrupts.
    unsafe {
        core::arch::asm!(
            "pushfq",
            "pop {}",
            "cli",
            out(reg) flags,
            options(nomem, preserves_flags)
        );
    }
    flags
}

#[cfg(all(target_os = "none", target_arch = "x86_64"))]
#[inline]
fn restore(flags: u64) {
    // Only re-enable if interrupts were enabled before the acquire.
    if flags & 0x200 != 0 {
        // SAFETY: sti only unmasks interrupts.
        unsafe { core::arch::asm!("sti", options(nomem, nostack)) };
    }
}

#[cfg(not(all(target_os = "none", target_arch = "x86_64")))]
#[inline]
fn save_and_disable() -> u64 {
    0
}

#[cfg(not(all(target_os = "none", target_arch = "x86_64")))]
#[inline]
fn restore(_flags: u64) {}

/// A lock that masks interrupts while held.
pub struct IrqLock<T> {
    locked: AtomicBool,
    data: UnsafeCell<T>,
}

// SAFETY: Same argument as `SpinLock`: the flag serialises access.
unsafe impl<T: Send> Send for IrqLock<T> {}
unsafe impl<T: Send> Sync for IrqLock<T> {}

impl<T> IrqLock<T> {
    /// Creates a new unlocked `IrqLock`.
    pub const fn new(value: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            data: UnsafeCell::new(value),
        }
    }

    /// Disables interrupts and acquires the lock.
    pub fn lock(&self) -> IrqLockGuard<'_, T> {
        let saved_flags = save_and_disable();
        loop {
            if self
                .locked
                .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return IrqLockGuard {
                    lock: self,
                    saved_flags,
                };
            }
            while self.locked.load(Ordering::Relaxed) {
                core::hint::spin_loop();
            }
        }
    }

    /// Attempts to acquire without spinning, restoring the interrupt state
    /// on failure.
    pub fn try_lock(&self) -> Option<IrqLockGuard<'_, T>> {
        let saved_flags = save_and_disable();
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            Some(IrqLockGuard {
                lock: self,
                saved_flags,
            })
        } else {
            restore(saved_flags);
            None
        }
    }
}

/// RAII guard restoring the saved interrupt state on drop.
pub struct IrqLockGuard<'a, T> {
    lock: &'a IrqLock<T>,
    saved_flags: u64,
}

impl<T> Deref for IrqLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: The guard proves the lock is held.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for IrqLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: The guard proves the lock is held.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for IrqLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
        restore(self.saved_flags);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_and_release() {
        let lock = IrqLock::new(3);
        {
            let mut guard = lock.lock();
            *guard += 1;
        }
        assert_eq!(*lock.lock(), 4);
    }

    #[test]
    fn try_lock_fails_while_held() {
        let lock = IrqLock::new(());
        let _guard = lock.lock();
        assert!(lock.try_lock().is_none());
    }
}
