//! SYSCALL entry stub and MSR setup.
//!
//! The stub swaps GS, parks the user stack pointer in the per-CPU scratch
//! slot, switches to the kernel stack stored at GS:0, and saves the full
//! register frame in [`StackFrame`] layout before calling the dispatcher.
//! The dispatcher's result travels back through the frame's `rax` slot.

use tachyon_sched::StackFrame;

use super::gdt::{KERNEL_CODE_SELECTOR, USER_SELECTOR_BASE};
use super::msr;

/// RFLAGS bits cleared on SYSCALL entry: IF, so the stub runs with
/// interrupts masked until the frame is saved.
const SYSCALL_RFLAGS_MASK: u64 = 0x200;

/// SYSCALL entry point. Installed in LSTAR by [`init`].
#[unsafe(naked)]
unsafe extern "C" fn entry() {
    core::arch::naked_asm!(
        // Kernel GS holds the CPU status block.
        "swapgs",
        // Park the user stack pointer in the scratch slot, then switch to
        // the kernel stack published by the scheduler.
        "mov gs:[8], rsp",
        "mov rsp, gs:[0]",
        // User context needed by sysretq.
        "push qword ptr gs:[8]", // user RSP
        "push r11",              // user RFLAGS
        "push rcx",              // user RIP
        // General-purpose registers, StackFrame order.
        "push rax",
        "push rbx",
        "push rcx",
        "push rdx",
        "push rsi",
        "push rdi",
        "push rbp",
        "push r8",
        "push r9",
        "push r10",
        "push r11",
        "push r12",
        "push r13",
        "push r14",
        "push r15",
        // dispatch(number, frame)
        "mov rdi, rax",
        "mov rsi, rsp",
        "call {dispatch}",
        // Restore registers; rax carries the result the dispatcher wrote
        // into the frame.
        "pop r15",
        "pop r14",
        "pop r13",
        "pop r12",
        "pop r11",
        "pop r10",
        "pop r9",
        "pop r8",
        "pop rbp",
        "pop rdi",
        "pop rsi",
        "pop rdx",
        "pop rcx",
        "pop rbx",
        "pop rax",
        // Hardware context: rcx/r11 are what sysretq consumes.
        "pop rcx", // user RIP
        "pop r11", // user RFLAGS
        "pop rsp", // user RSP; safe because interrupts stay masked here
        "swapgs",
        "sysretq",
        dispatch = sym crate::syscall::dispatch,
    );
}

/// Programs the SYSCALL MSRs: enables SCE, installs the entry stub, the
/// segment layout, and the IF mask.
pub fn init() {
    // SAFETY: The MSRs are architectural; the entry stub matches the
    // selector layout programmed into STAR.
    unsafe {
        let efer = msr::read(msr::IA32_EFER);
        msr::write(msr::IA32_EFER, efer | 1);

        let entry_fn: unsafe extern "C" fn() = entry;
        msr::write(msr::IA32_LSTAR, entry_fn as u64);
        msr::write(
            msr::IA32_STAR,
            (USER_SELECTOR_BASE << 48) | (KERNEL_CODE_SELECTOR << 32),
        );
        msr::write(msr::IA32_SFMASK, SYSCALL_RFLAGS_MASK);
    }
}

/// Compile-time check that the frame the stub builds matches the Rust
/// view of it.
const _: () = assert!(core::mem::size_of::<StackFrame>() == 18 * 8);
