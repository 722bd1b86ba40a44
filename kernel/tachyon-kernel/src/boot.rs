//! Bootloader-agnostic boot information and the kernel entry point.
//!
//! A boot stub (Limine today) converts its protocol responses into
//! [`BootInfoData`] and calls [`kernel_init`], which brings the
//! subsystems up in dependency order: physical frames, the kernel
//! address space, heap, virtual ranges, the VFS, syscalls, and finally
//! the scheduler.

use planck_noalloc::vec::ArrayVec;
use tachyon_core::addr::{PhysAddr, VirtAddr};

use crate::arch::x86_64::instructions;

/// The kind of a physical memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryRegionKind {
    /// Free RAM the frame allocator may hand out.
    Usable,
    /// Reserved by firmware or hardware.
    Reserved,
    /// ACPI tables, reclaimable after parsing.
    AcpiReclaimable,
    /// ACPI non-volatile storage.
    AcpiNvs,
    /// Defective memory.
    BadMemory,
    /// Bootloader-owned, reclaimable once its data is consumed.
    BootloaderReclaimable,
    /// The kernel image and boot modules.
    ExecutableAndModules,
    /// The linear framebuffer.
    Framebuffer,
}

impl MemoryRegionKind {
    /// Whether the region is RAM (and therefore belongs in the direct
    /// map), as opposed to device or firmware address space.
    #[must_use]
    pub fn is_ram(self) -> bool {
        matches!(
            self,
            Self::Usable
                | Self::BootloaderReclaimable
                | Self::AcpiReclaimable
                | Self::ExecutableAndModules
        )
    }
}

/// A contiguous physical memory region.
#[derive(Debug, Clone, Copy)]
pub struct MemoryRegion {
    /// Physical start address.
    pub start: PhysAddr,
    /// Size in bytes.
    pub size: u64,
    /// Region kind.
    pub kind: MemoryRegionKind,
}

/// A linear framebuffer handed over by the bootloader.
#[derive(Debug, Clone, Copy)]
pub struct FramebufferInfo {
    /// Virtual address in the bootloader's HHDM.
    pub address: VirtAddr,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Bytes per scanline.
    pub pitch: u32,
    /// Bits per pixel.
    pub bpp: u8,
}

/// Kernel image load addresses.
#[derive(Debug, Clone, Copy)]
pub struct KernelAddressInfo {
    /// Physical base.
    pub physical_base: PhysAddr,
    /// Virtual base.
    pub virtual_base: VirtAddr,
}

/// Maximum memory map entries carried in boot info.
pub const MAX_MEMORY_REGIONS: usize = 128;

/// Bootloader-agnostic boot information.
pub trait BootInfo {
    /// Physical memory map, sorted by start address.
    fn memory_map(&self) -> &[MemoryRegion];

    /// HHDM offset: `virtual = physical + hhdm_offset()`.
    fn hhdm_offset(&self) -> u64;

    /// Kernel image load addresses.
    fn kernel_address(&self) -> KernelAddressInfo;

    /// The primary framebuffer, if the loader set one up.
    fn framebuffer(&self) -> Option<FramebufferInfo>;

    /// ACPI RSDP physical address, if reported.
    fn rsdp_address(&self) -> Option<PhysAddr>;
}

/// Concrete boot info container populated by a boot stub.
pub struct BootInfoData {
    /// Physical memory map.
    pub memory_map: ArrayVec<MemoryRegion, MAX_MEMORY_REGIONS>,
    /// HHDM offset.
    pub hhdm_offset: u64,
    /// Kernel image load addresses.
    pub kernel_address: KernelAddressInfo,
    /// Primary framebuffer.
    pub framebuffer: Option<FramebufferInfo>,
    /// ACPI RSDP physical address.
    pub rsdp_address: Option<PhysAddr>,
}

impl BootInfo for BootInfoData {
    fn memory_map(&self) -> &[MemoryRegion] {
        self.memory_map.as_slice()
    }

    fn hhdm_offset(&self) -> u64 {
        self.hhdm_offset
    }

    fn kernel_address(&self) -> KernelAddressInfo {
        self.kernel_address
    }

    fn framebuffer(&self) -> Option<FramebufferInfo> {
        self.framebuffer
    }

    fn rsdp_address(&self) -> Option<PhysAddr> {
        self.rsdp_address
    }
}

/// The root kernel process: keeps the queue non-empty and gives the CPU
/// away whenever something else can run.
fn idle_process() {
    tachyon_core::kinfo!("tachyon up; idling");
    loop {
        crate::sched::yield_now();
        instructions::halt_with_interrupts();
    }
}

/// Kernel entry point, called by the boot stub with interrupts disabled.
///
/// Initialisation order is load-bearing: frames before spaces, spaces
/// before the heap, the heap before anything that allocates, the VFS
/// before processes that hold descriptor tables, the scheduler last.
///
/// # Panics
///
/// Panics on unrecoverable early-boot failures (no usable RAM, no kernel
/// image range, no frame for the first process).
pub fn kernel_init(boot_info: &impl BootInfo) -> ! {
    crate::log::init_serial();
    tachyon_core::kinfo!("tachyon booting");
    tachyon_core::kdebug!(
        "boot: hhdm={:#x}, kernel at {} / {}",
        boot_info.hhdm_offset(),
        boot_info.kernel_address().physical_base,
        boot_info.kernel_address().virtual_base,
    );

    crate::mm::init(boot_info);
    crate::mm::with_frames(|frames| {
        tachyon_core::kinfo!(
            "mm: {} MiB total, {} MiB free",
            frames.total_pages() * 4 / 1024,
            frames.free_pages() * 4 / 1024,
        );
    });

    crate::mm::init_kernel_space(boot_info);
    crate::mm::init_heap();
    crate::mm::init_ranges();
    tachyon_core::kinfo!("mm: heap and range allocator online");

    crate::fs::init();

    crate::arch::x86_64::syscall::init();
    tachyon_core::kinfo!("syscall: entry installed");

    crate::proc::spawn_kernel(idle_process).expect("failed to spawn the idle process");

    crate::sched::run();
}
