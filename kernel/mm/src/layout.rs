//! Fixed kernel-half virtual address layout.
//!
//! Every window has a constant base so subsystems can be initialised
//! before any allocator exists. All bases are canonical higher-half
//! addresses; [`is_kernel_addr`] is the user/kernel split test.

/// One gibibyte.
pub const GIB: u64 = 512 * 512 * 4096;

/// First non-canonical address above the user half.
pub const LOWER_HALF_END: u64 = 0x0000_8000_0000_0000;

/// Direct map of all physical RAM, at the start of the higher half.
pub const DIRECT_MAP: u64 = 0xFFFF_8000_0000_0000;

/// Framebuffer window, 128 GiB past the direct map.
pub const FRAMEBUFFER: u64 = DIRECT_MAP + 128 * GIB;

/// Log ring window, 1 GiB past the framebuffer.
pub const LOG_RING: u64 = FRAMEBUFFER + GIB;

/// Virtual range allocator window, 1 GiB past the log ring.
pub const RANGE_WINDOW: u64 = LOG_RING + GIB;

/// Size of the range allocator window.
pub const RANGE_WINDOW_SIZE: u64 = GIB;

/// Kernel heap window, 1 GiB past the range window.
pub const HEAP: u64 = RANGE_WINDOW + GIB;

/// Kernel image, in the top 2 GiB of the address space.
pub const KERNEL_IMAGE: u64 = 0xFFFF_FFFF_8000_0000;

/// Returns `true` for addresses belonging to the kernel half.
#[inline]
#[must_use]
pub const fn is_kernel_addr(addr: u64) -> bool {
    addr >= DIRECT_MAP
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn windows_are_ordered_and_disjoint() {
        assert!(DIRECT_MAP < FRAMEBUFFER);
        assert!(FRAMEBUFFER < LOG_RING);
        assert!(LOG_RING < RANGE_WINDOW);
        assert!(RANGE_WINDOW + RANGE_WINDOW_SIZE <= HEAP);
        assert!(HEAP < KERNEL_IMAGE);
    }

    #[test]
    fn split_test() {
        assert!(!is_kernel_addr(LOWER_HALF_END - 4096));
        assert!(is_kernel_addr(DIRECT_MAP));
        assert!(is_kernel_addr(KERNEL_IMAGE));
    }
}
