//! CPUID feature probes.

/// Whether the CPU supports 1 GiB direct pages
/// (CPUID.80000001h:EDX bit 26).
#[must_use]
pub fn gib_pages_supported() -> bool {
    // SAFETY: CPUID leaf 0x8000_0001 is available on every 64-bit CPU.
    let result = unsafe { core::arch::x86_64::__cpuid(0x8000_0001) };
    result.edx & (1 << 26) != 0
}
