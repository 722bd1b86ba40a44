//! Interior-mutability helpers for single-CPU statics.

use core::cell::UnsafeCell;

/// An `UnsafeCell` that claims `Sync`.
///
/// Used for per-CPU state that is only ever touched with interrupts
/// disabled (the CPU status block, saved stack pointer slots). The caller
/// is responsible for that discipline; the type only removes the `Sync`
/// bound obstacle.
#[repr(transparent)]
pub struct RacyCell<T>(UnsafeCell<T>);

// SAFETY: Exclusive access is the caller's obligation, documented above.
unsafe impl<T> Sync for RacyCell<T> {}

impl<T> RacyCell<T> {
    /// Creates a new cell.
    pub const fn new(value: T) -> Self {
        Self(UnsafeCell::new(value))
    }

    /// Returns a raw pointer to the contents.
    pub const fn get(&self) -> *mut T {
        self.0.get()
    }
}
