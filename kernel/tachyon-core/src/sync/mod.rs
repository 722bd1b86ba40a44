//! Kernel synchronisation primitives.

mod irq_lock;
mod spinlock;

pub use irq_lock::{IrqLock, IrqLockGuard};
pub use spinlock::{SpinLock, SpinLockGuard};
