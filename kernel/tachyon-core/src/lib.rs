//! Core types shared by every tachyon kernel crate.
//!
//! Pure logic only: typed addresses, locks, interior-mutability helpers
//! and the logging macro layer. Everything here builds for the host so the crates
//! layered on top stay unit-testable without a virtual machine.

#![cfg_attr(not(test), no_std)]

pub mod addr;
pub mod cell;
pub mod log;
pub mod sync;
