//! GDT selector layout and the TSS RSP0 seam.
//!
//! The descriptor tables themselves are platform glue set up by the boot
//! path; the scheduler only needs the selector constants and a way to
//! repoint TSS.RSP0 at the incoming process's kernel stack on every
//! context switch.

use core::sync::atomic::{AtomicU64, Ordering};

/// Kernel code selector (STAR bits 32..47 derive kernel SS from it).
pub const KERNEL_CODE_SELECTOR: u64 = 8;

/// Base selector for the user segments, as encoded in STAR bits 48..63.
pub const USER_SELECTOR_BASE: u64 = 16;

/// User data selector with RPL 3, pushed as SS in iret frames.
pub const USER_DATA_SELECTOR: u64 = 24 | 3;

/// User code selector with RPL 3, pushed as CS in iret frames.
pub const USER_CODE_SELECTOR: u64 = 32 | 3;

/// Address of the TSS RSP0 field, registered by the platform's GDT setup.
static TSS_RSP0_SLOT: AtomicU64 = AtomicU64::new(0);

/// Registers where TSS.RSP0 lives.
///
/// # Safety
///
/// `slot` must point at the RSP0 field of the loaded TSS and stay valid
/// for the kernel's lifetime.
pub unsafe fn register_tss_rsp0_slot(slot: *mut u64) {
    TSS_RSP0_SLOT.store(slot as u64, Ordering::Release);
}

/// Points TSS.RSP0 at `rsp` so ring-3 interrupts land on the current
/// process's kernel stack. A no-op until the slot is registered.
pub fn set_tss_rsp0(rsp: u64) {
    let slot = TSS_RSP0_SLOT.load(Ordering::Acquire);
    if slot != 0 {
        // SAFETY: The registered slot points at the live TSS field.
        unsafe { core::ptr::write_volatile(slot as *mut u64, rsp) };
    }
}
