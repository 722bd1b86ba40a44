//! Context switch and first-entry stubs.
//!
//! [`switch_to`] is the whole mechanism behind cooperative scheduling:
//! push RFLAGS and the 15 GPRs of the outgoing process, store its stack
//! pointer, load the incoming one, pop and return. A freshly created
//! process's kernel stack is pre-built to the exact layout these pops
//! expect, so the first switch into it "returns" to its entry point.

/// Switches kernel stacks.
///
/// Saves the outgoing context on the current stack and writes RSP to
/// `*old_rsp_ptr`, then installs `new_rsp` and restores the incoming
/// context from it. Returns when the outgoing process is next resumed.
///
/// # Safety
///
/// - Interrupts must be disabled around the call.
/// - `new_rsp` must hold a context laid out by this function or by the
///   process-creation stack builder.
/// - `old_rsp_ptr` must be a valid slot for the outgoing RSP.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_to(old_rsp_ptr: *mut u64, new_rsp: u64) {
    core::arch::naked_asm!(
        // Save the outgoing process state.
        "pushfq",
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
        // Publish the outgoing stack pointer (first argument).
        "mov [rdi], rsp",
        // Install the incoming stack (second argument).
        "mov rsp, rsi",
        // Restore the incoming process state.
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
        "popfq",
        // Return to wherever the incoming process left off.
        "ret",
    );
}

/// Synthetic return address on a fresh user process's kernel stack.
///
/// The first switch into a user process pops the 15 GPRs and RFLAGS, then
/// `ret`s here with the iret frame (RIP, CS, RFLAGS, RSP, SS) on top.
/// swapgs parks the kernel GS base for the syscall entry, iretq drops to
/// ring 3.
#[unsafe(naked)]
pub unsafe extern "C" fn user_entry_stub() {
    core::arch::naked_asm!("swapgs", "iretq");
}
