//! Limine boot stub.
//!
//! Declares the protocol requests, converts the responses into the
//! kernel's [`BootInfoData`] and hands over to
//! [`kernel_init`](tachyon_kernel::kernel_init). The kernel builds its
//! own page tables from the memory map; this stub only ferries
//! information.

#![no_std]
#![no_main]

mod requests;

use limine::memory_map::EntryType;
use planck_noalloc::vec::ArrayVec;
use tachyon_core::addr::{PhysAddr, VirtAddr};
use tachyon_kernel::boot::{
    BootInfoData, FramebufferInfo, KernelAddressInfo, MAX_MEMORY_REGIONS, MemoryRegion,
    MemoryRegionKind,
};

fn convert_kind(kind: EntryType) -> MemoryRegionKind {
    if kind == EntryType::USABLE {
        MemoryRegionKind::Usable
    } else if kind == EntryType::ACPI_RECLAIMABLE {
        MemoryRegionKind::AcpiReclaimable
    } else if kind == EntryType::ACPI_NVS {
        MemoryRegionKind::AcpiNvs
    } else if kind == EntryType::BAD_MEMORY {
        MemoryRegionKind::BadMemory
    } else if kind == EntryType::BOOTLOADER_RECLAIMABLE {
        MemoryRegionKind::BootloaderReclaimable
    } else if kind == EntryType::EXECUTABLE_AND_MODULES {
        MemoryRegionKind::ExecutableAndModules
    } else if kind == EntryType::FRAMEBUFFER {
        MemoryRegionKind::Framebuffer
    } else {
        MemoryRegionKind::Reserved
    }
}

/// Limine entry point: builds [`BootInfoData`] and enters the kernel.
#[unsafe(no_mangle)]
extern "C" fn _start() -> ! {
    assert!(requests::BASE_REVISION.is_supported());

    let hhdm_offset = requests::HHDM
        .get_response()
        .expect("no HHDM response")
        .offset();

    let memmap = requests::MEMORY_MAP
        .get_response()
        .expect("no memory map response");

    let mut memory_map: ArrayVec<MemoryRegion, MAX_MEMORY_REGIONS> = ArrayVec::new();
    for entry in memmap.entries() {
        if memory_map.is_full() {
            break;
        }
        memory_map.push(MemoryRegion {
            start: PhysAddr::new(entry.base),
            size: entry.length,
            kind: convert_kind(entry.entry_type),
        });
    }

    let exec = requests::EXECUTABLE_ADDRESS
        .get_response()
        .expect("no executable address response");
    let kernel_address = KernelAddressInfo {
        physical_base: PhysAddr::new(exec.physical_base()),
        virtual_base: VirtAddr::new(exec.virtual_base()),
    };

    let framebuffer = requests::FRAMEBUFFER
        .get_response()
        .and_then(|response| response.framebuffers().next())
        .map(|fb| FramebufferInfo {
            address: VirtAddr::new(fb.addr() as u64),
            width: fb.width() as u32,
            height: fb.height() as u32,
            pitch: fb.pitch() as u32,
            bpp: fb.bpp() as u8,
        });

    let rsdp_address = requests::RSDP
        .get_response()
        .map(|response| PhysAddr::new(response.address() as u64));

    let boot_info = BootInfoData {
        memory_map,
        hhdm_offset,
        kernel_address,
        framebuffer,
        rsdp_address,
    };

    tachyon_kernel::kernel_init(&boot_info)
}

#[panic_handler]
fn panic(info: &core::panic::PanicInfo<'_>) -> ! {
    tachyon_kernel::log::panic_print(info)
}
