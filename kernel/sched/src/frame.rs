//! Saved register frames.

/// A saved register block.
///
/// Doubles as the resume point of an inactive process (popped by the
/// context switch) and, for user processes, the layout an IRET returns
/// through. Field order matches the push sequence of the switch assembly.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct StackFrame {
    /// General-purpose registers in push order.
    pub r15: u64,
    /// R14.
    pub r14: u64,
    /// R13.
    pub r13: u64,
    /// R12.
    pub r12: u64,
    /// R11.
    pub r11: u64,
    /// R10.
    pub r10: u64,
    /// R9.
    pub r9: u64,
    /// R8.
    pub r8: u64,
    /// RBP.
    pub rbp: u64,
    /// RDI.
    pub rdi: u64,
    /// RSI.
    pub rsi: u64,
    /// RDX.
    pub rdx: u64,
    /// RCX.
    pub rcx: u64,
    /// RBX.
    pub rbx: u64,
    /// RAX.
    pub rax: u64,
    /// Instruction pointer to resume at.
    pub rip: u64,
    /// RFLAGS image.
    pub rflags: u64,
    /// User stack pointer (user-land frames only).
    pub user_rsp: u64,
}

impl StackFrame {
    /// Number of general-purpose register slots.
    pub const GPR_COUNT: usize = 15;

    /// Reads GPR `index`, where 0 is `rax` and 14 is `r15`: the reverse
    /// of field order, matching the pop sequence of the context switch.
    #[must_use]
    pub fn gpr(&self, index: usize) -> u64 {
        let clamped = index.min(Self::GPR_COUNT - 1);
        let base = core::ptr::from_ref(&self.r15);
        // SAFETY: The 15 GPR fields are contiguous u64s at the start of
        // the repr(C) struct.
        unsafe { *base.add(Self::GPR_COUNT - 1 - clamped) }
    }

    /// Writes GPR `index` with the same numbering as [`StackFrame::gpr`].
    pub fn set_gpr(&mut self, index: usize, value: u64) {
        let clamped = index.min(Self::GPR_COUNT - 1);
        let base = core::ptr::from_mut(&mut self.r15);
        // SAFETY: See `gpr`.
        unsafe { *base.add(Self::GPR_COUNT - 1 - clamped) = value };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gpr_zero_is_rax() {
        let mut frame = StackFrame::default();
        frame.rax = 0xAAAA;
        frame.r15 = 0xFFFF;
        assert_eq!(frame.gpr(0), 0xAAAA);
        assert_eq!(frame.gpr(14), 0xFFFF);
    }

    #[test]
    fn set_gpr_round_trips() {
        let mut frame = StackFrame::default();
        for index in 0..StackFrame::GPR_COUNT {
            frame.set_gpr(index, index as u64 + 100);
        }
        for index in 0..StackFrame::GPR_COUNT {
            assert_eq!(frame.gpr(index), index as u64 + 100);
        }
        assert_eq!(frame.rax, 100);
        assert_eq!(frame.r15, 114);
    }

    #[test]
    fn out_of_range_clamps_to_last() {
        let mut frame = StackFrame::default();
        frame.r15 = 7;
        assert_eq!(frame.gpr(99), 7);
    }
}
