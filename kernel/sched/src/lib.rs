//! Scheduler data model.
//!
//! The cooperative scheduler's state machine, run queue and saved-register
//! frame live here, away from the context-switch assembly, so the pick
//! logic and queue bookkeeping are unit-testable on the host. The kernel
//! crate owns the `Process` objects and drives these structures from its
//! `yield`/`exit`/`join` paths.

#![cfg_attr(not(test), no_std)]

mod frame;
mod pick;
mod queue;
mod slots;

pub use frame::StackFrame;
pub use pick::{Pick, PickInfo, pick_next};
pub use queue::RunQueue;
pub use slots::SlotTable;

/// Process identifier: a stable index into the process slot table.
pub type ProcessId = u32;

/// Maximum number of live processes.
pub const MAX_PROCESSES: usize = 256;

/// Lifecycle state of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum State {
    /// Runnable, waiting for the CPU.
    Waiting,
    /// Currently executing.
    Running,
    /// Parked by an explicit suspend; only `resume` unparks it.
    Suspended,
    /// Parked waiting for a join target to exit or an event to fire.
    SuspendedEvents,
    /// Finished; waiting for the reaper.
    Exited,
}

/// Privilege a process executes with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Land {
    /// Ring 0, kernel stack only.
    Kernel,
    /// Ring 3, with a user stack mapped at the top of the lower half.
    User,
}
