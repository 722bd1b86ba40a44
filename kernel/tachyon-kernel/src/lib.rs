//! tachyon kernel runtime.
//!
//! Pure logic lives in the `tachyon-core`/`tachyon-mm`/`tachyon-fs`/
//! `tachyon-sched` crates; this crate wires it to the machine: boot info,
//! page tables and CR3, the cooperative scheduler's context switch, the
//! syscall entry, and the blocking event/pipe primitives. Runtime modules
//! only build for the kernel target; the host build keeps the pure parts
//! so their tests run with `cargo test`.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]

extern crate alloc;

// ── Always-available modules (pure logic, host-testable) ─────────────────

pub mod ipc;

// ── Kernel-runtime modules (require target_os = "none") ──────────────────

#[cfg(target_os = "none")]
pub mod arch;
#[cfg(target_os = "none")]
pub mod boot;
#[cfg(target_os = "none")]
pub mod fs;
#[cfg(target_os = "none")]
pub mod log;
#[cfg(target_os = "none")]
pub mod mm;
#[cfg(target_os = "none")]
pub mod proc;
#[cfg(target_os = "none")]
pub mod sched;
#[cfg(target_os = "none")]
pub mod syscall;

#[cfg(target_os = "none")]
pub use boot::kernel_init;
