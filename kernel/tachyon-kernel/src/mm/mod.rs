//! Memory management glue.
//!
//! Owns the global instances of the `tachyon-mm` machinery (frame
//! bitmap, kernel address space, heap, virtual range allocator) behind
//! interrupt-masking locks, and translates between physical addresses and
//! the active direct map. Until the first [`switch_to`] the bootloader's
//! HHDM is the only phys→virt window; afterwards everything goes through
//! the kernel's own direct map at [`layout::DIRECT_MAP`].

use core::alloc::{GlobalAlloc, Layout};
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use planck_noalloc::vec::ArrayVec;
use tachyon_core::addr::{PhysAddr, VirtAddr};
use tachyon_core::sync::IrqLock;
use tachyon_mm::heap::Heap;
use tachyon_mm::pmm::FrameBitmap;
use tachyon_mm::range::RangeAllocator;
use tachyon_mm::space::{KernelHalf, MapFlags, Space, SpaceWalker};
use tachyon_mm::{FrameSource, MmError, PhysRegion, layout};

use crate::arch::x86_64::{cpuid, instructions};
use crate::boot::{BootInfo, MAX_MEMORY_REGIONS, MemoryRegionKind};

static HHDM_OFFSET: AtomicU64 = AtomicU64::new(0);
static SWITCHED: AtomicBool = AtomicBool::new(false);
static GIB_PAGES: AtomicBool = AtomicBool::new(false);

static FRAMES: IrqLock<Option<FrameBitmap>> = IrqLock::new(None);
static KERNEL_HALF: IrqLock<Option<KernelHalf>> = IrqLock::new(None);
static RANGES: IrqLock<Option<RangeAllocator>> = IrqLock::new(None);
static HEAP: IrqLock<Heap> = IrqLock::new(Heap::new());

/// Active phys→virt offset: the bootloader HHDM until the first CR3
/// switch, the kernel direct map afterwards.
fn phys_base() -> u64 {
    if SWITCHED.load(Ordering::Acquire) {
        layout::DIRECT_MAP
    } else {
        HHDM_OFFSET.load(Ordering::Acquire)
    }
}

fn walker() -> SpaceWalker {
    SpaceWalker::new(phys_base())
}

/// Virtual address of a physical address through the active direct map.
pub fn phys_to_virt(phys: PhysAddr) -> VirtAddr {
    VirtAddr::new_truncate(phys_base() + phys.as_u64())
}

/// Runs `f` with the global frame bitmap.
///
/// # Panics
///
/// Panics before [`init`].
pub fn with_frames<R>(f: impl FnOnce(&mut FrameBitmap) -> R) -> R {
    let mut frames = FRAMES.lock();
    f(frames.as_mut().expect("PMM not initialized"))
}

/// Allocates `count` contiguous frames.
pub fn alloc_frames(count: u64) -> Option<PhysAddr> {
    with_frames(|frames| frames.alloc_frames(count))
}

/// Frees `count` contiguous frames starting at `first`.
pub fn free_frames(first: PhysAddr, count: u64) {
    with_frames(|frames| frames.free_frames(first, count));
}

/// Initialises the frame bitmap from the boot memory map.
pub fn init(boot_info: &impl BootInfo) {
    HHDM_OFFSET.store(boot_info.hhdm_offset(), Ordering::Release);
    GIB_PAGES.store(cpuid::gib_pages_supported(), Ordering::Release);

    let mut regions: ArrayVec<PhysRegion, MAX_MEMORY_REGIONS> = ArrayVec::new();
    for region in boot_info.memory_map() {
        if regions.is_full() {
            break;
        }
        regions.push(PhysRegion {
            start: region.start,
            size: region.size,
            usable: region.kind == MemoryRegionKind::Usable,
        });
    }

    // SAFETY: The regions come straight from the bootloader and the HHDM
    // covers all of them; init runs once.
    let bitmap = unsafe { FrameBitmap::new(regions.as_slice(), phys_base()) }
        .expect("failed to build the frame bitmap");

    let mut frames = FRAMES.lock();
    assert!(frames.is_none(), "PMM already initialized");
    *frames = Some(bitmap);
}

/// The space CR3 currently points at.
#[must_use]
pub fn current_space() -> Space {
    Space::from_root(instructions::read_cr3())
}

/// Loads `space` into CR3. The first call also retires the bootloader
/// HHDM in favour of the kernel direct map.
///
/// # Safety
///
/// `space` must map the executing code, stack and all kernel data.
pub unsafe fn switch_to(space: Space) {
    // SAFETY: Caller contract.
    unsafe { instructions::write_cr3(space.root()) };
    SWITCHED.store(true, Ordering::Release);
}

/// Builds the bootstrap kernel space: kernel image, framebuffer window
/// and the direct map of all RAM, then captures the shared kernel half
/// and switches to it.
///
/// # Panics
///
/// Panics when the memory map lacks a kernel range or frames run out,
/// both unrecoverable this early.
pub fn init_kernel_space(boot_info: &impl BootInfo) {
    let space = with_frames(|frames| {
        // SAFETY: Frames come from the PMM and are reachable through the
        // active HHDM.
        let space = unsafe { walker().create(None, frames) }.expect("no frame for the PML4");

        let mut map = |virt_page: u64, phys_page: u64, count: u64, flags: MapFlags| {
            // SAFETY: Fresh space; nothing maps over live data.
            unsafe {
                walker()
                    .map_pages(
                        space,
                        virt_page,
                        phys_page,
                        count,
                        flags,
                        GIB_PAGES.load(Ordering::Relaxed),
                        frames,
                        &mut |_| {},
                    )
                    .expect("out of frames while building the kernel space");
            }
        };

        let mut found_kernel = false;
        let mut found_framebuffer = false;
        for region in boot_info.memory_map() {
            let first_page = region.start.frame_index();
            let page_count = region.size / 4096;
            match region.kind {
                MemoryRegionKind::ExecutableAndModules if !found_kernel => {
                    map(
                        layout::KERNEL_IMAGE / 4096,
                        first_page,
                        page_count,
                        MapFlags::WRITE | MapFlags::EXECUTE,
                    );
                    found_kernel = true;
                }
                MemoryRegionKind::Framebuffer if !found_framebuffer => {
                    map(
                        layout::FRAMEBUFFER / 4096,
                        first_page,
                        page_count,
                        MapFlags::WRITE | MapFlags::UNCACHED,
                    );
                    found_framebuffer = true;
                }
                _ => {}
            }
            if region.kind.is_ram() {
                map(
                    layout::DIRECT_MAP / 4096 + first_page,
                    first_page,
                    page_count,
                    MapFlags::WRITE,
                );
            }
        }
        assert!(found_kernel, "memory map lacks the kernel image range");

        space
    });

    // SAFETY: The space maps the kernel image at its linked address and
    // all RAM through the direct map. DIRECT_MAP equals the loader's
    // default HHDM base, so pointers handed out before the switch (the
    // frame bitmap) stay valid across it.
    let half = unsafe { walker().kernel_half(space) };
    *KERNEL_HALF.lock() = Some(half);

    // SAFETY: See above.
    unsafe { switch_to(space) };
    tachyon_core::kinfo!("mm: switched to kernel address space");
}

/// Creates a fresh space sharing the kernel half.
///
/// # Errors
///
/// [`MmError::OutOfMemory`] when no frame is available.
///
/// # Panics
///
/// Panics before [`init_kernel_space`] has captured the kernel half.
pub fn create_space() -> Result<Space, MmError> {
    let half = (*KERNEL_HALF.lock()).expect("kernel space not initialized");
    with_frames(|frames| {
        // SAFETY: The captured kernel half is shared by construction.
        unsafe { walker().create(Some(half), frames) }
    })
}

/// Destroys `space`, returning every user-half frame to the bitmap.
///
/// # Safety
///
/// `space` must not be active and must not be used afterwards.
pub unsafe fn destroy_space(space: Space) {
    with_frames(|frames| {
        // SAFETY: Caller contract.
        unsafe { walker().destroy(space, frames) };
    });
}

/// Forks `space` with eager page copies.
///
/// # Errors
///
/// [`MmError::OutOfMemory`] when frames run out; the partial copy is
/// destroyed before returning.
pub fn fork_space(space: Space) -> Result<Space, MmError> {
    with_frames(|frames| {
        // SAFETY: The source space is live and readable through the
        // direct map.
        unsafe { walker().fork(space, frames) }
    })
}

/// Maps `count` pages of `space`, invalidating the TLB when `space` is
/// the one CR3 points at.
///
/// # Errors
///
/// [`MmError::OutOfMemory`] when an intermediate table cannot be
/// allocated (already-built shells stay behind for `destroy_space`).
pub fn map_pages(
    space: Space,
    virt_page: u64,
    phys_page: u64,
    count: u64,
    flags: MapFlags,
) -> Result<(), MmError> {
    let active = space == current_space();
    with_frames(|frames| {
        // SAFETY: The space is live; INVLPG keeps the TLB coherent for
        // the active space.
        unsafe {
            walker().map_pages(
                space,
                virt_page,
                phys_page,
                count,
                flags,
                GIB_PAGES.load(Ordering::Relaxed),
                frames,
                &mut |virt| {
                    if active {
                        instructions::invlpg(virt);
                    }
                },
            )
        }
    })
}

/// Translates `virt` through the active space.
#[must_use]
pub fn translate(virt: VirtAddr) -> Option<PhysAddr> {
    translate_in(current_space(), virt)
}

/// Translates `virt` through an arbitrary live space.
#[must_use]
pub fn translate_in(space: Space, virt: VirtAddr) -> Option<PhysAddr> {
    // SAFETY: Space handles originate from create/fork and stay live
    // until destroyed.
    unsafe { walker().translate(space, virt) }
}

/// Enumerates the present ranges of `space`, coalesced.
pub fn dump_space(space: Space, range_fn: &mut dyn FnMut(u64, u64)) {
    // SAFETY: Caller passes a live space.
    unsafe { walker().dump(space, range_fn) };
}

// ---------------------------------------------------------------------------
// Virtual range allocator
// ---------------------------------------------------------------------------

/// Initialises the range allocator over its fixed window.
pub fn init_ranges() {
    let mut ranges = RANGES.lock();
    assert!(ranges.is_none(), "range allocator already initialized");
    *ranges = Some(RangeAllocator::new(
        layout::RANGE_WINDOW / 4096,
        layout::RANGE_WINDOW_SIZE / 4096,
    ));
}

/// Allocates `pages` contiguous virtual pages from the range window.
pub fn alloc_range(pages: u64) -> Option<u64> {
    RANGES.lock().as_mut()?.alloc_range(pages)
}

/// Returns a range to the window. A double free is logged and ignored.
pub fn free_range(first_page: u64) {
    let mut ranges = RANGES.lock();
    let Some(ranges) = ranges.as_mut() else {
        return;
    };
    if ranges.free_range(first_page) == Err(MmError::DoubleFree) {
        tachyon_core::kerr!("mm: double free of virtual range at page {first_page:#x}");
    }
}

// ---------------------------------------------------------------------------
// Kernel heap
// ---------------------------------------------------------------------------

/// Grow callback: backs the next heap window page with a fresh frame.
fn heap_grow(page_addr: u64) -> bool {
    let Some(phys) = alloc_frames(1) else {
        return false;
    };
    match map_pages(
        current_space(),
        page_addr / 4096,
        phys.frame_index(),
        1,
        MapFlags::WRITE,
    ) {
        Ok(()) => true,
        Err(_) => {
            free_frames(phys, 1);
            false
        }
    }
}

/// Initialises the heap over its window and maps the first page.
pub fn init_heap() {
    // SAFETY: The heap window is reserved in the fixed layout and the
    // grow callback maps exactly the requested pages.
    unsafe { HEAP.lock().init(layout::HEAP, heap_grow) };
}

/// Pages currently mapped into the heap window.
#[must_use]
pub fn heap_pages() -> u64 {
    HEAP.lock().page_count()
}

/// The global allocator, backed by the first-fit heap.
struct KernelAllocator;

// SAFETY: alloc/dealloc delegate to the locked first-fit heap, which
// hands out exclusive, properly-aligned regions.
unsafe impl GlobalAlloc for KernelAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        HEAP.lock().alloc(layout.size() as u64, layout.align() as u64)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        HEAP.lock().free(ptr);
    }
}

#[global_allocator]
static ALLOCATOR: KernelAllocator = KernelAllocator;
