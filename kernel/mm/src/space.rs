//! Address spaces and the 4-level page-table engine.
//!
//! A [`Space`] is an opaque handle equal to the physical address of its
//! PML4. PML4 entries 0..255 are the process-private user half; entries
//! 256 and 511 carry the kernel half and are shared by copying them from
//! the first space ever built. The engine walks tables through a fixed
//! phys→virt offset ([`SpaceWalker::new`]) so the same code runs against
//! the boot direct map, the kernel direct map, and plain buffers in host
//! tests.
//!
//! Ownership: a space owns every frame reachable through its user half.
//! [`SpaceWalker::destroy`] frees leaf frames (including 2 MiB and 1 GiB
//! direct leaves), the intermediate tables, and the PML4 itself.

use tachyon_core::addr::{PhysAddr, VirtAddr};

use crate::page_table::{
    ADDR_MASK, DIRECT_PD_ADDR_MASK, DIRECT_PDP_ADDR_MASK, EntryFlags, PageTable, PageTableEntry,
};
use crate::{FrameSource, MmError};

/// Pages per 2 MiB direct entry.
pub const PD_DIRECT_PAGES: u64 = 512;

/// Pages per 1 GiB direct entry.
pub const PDP_DIRECT_PAGES: u64 = 512 * 512;

/// Number of PML4 entries belonging to the user half.
const USER_PML4_ENTRIES: usize = 256;

bitflags::bitflags! {
    /// Logical mapping flags, translated to entry bits on install.
    ///
    /// Absence of `EXECUTE` sets no-execute; `UNCACHED` sets both
    /// write-through and cache-disable.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MapFlags: u8 {
        /// Writable mapping.
        const WRITE    = 1 << 0;
        /// Executable mapping.
        const EXECUTE  = 1 << 1;
        /// Ring-3 accessible mapping.
        const USER     = 1 << 2;
        /// Uncached mapping (MMIO, framebuffer).
        const UNCACHED = 1 << 3;
    }
}

impl MapFlags {
    fn entry_flags(self) -> EntryFlags {
        let mut flags = EntryFlags::PRESENT;
        if self.contains(Self::WRITE) {
            flags |= EntryFlags::WRITABLE;
        }
        if !self.contains(Self::EXECUTE) {
            flags |= EntryFlags::NO_EXECUTE;
        }
        if self.contains(Self::USER) {
            flags |= EntryFlags::USER;
        }
        if self.contains(Self::UNCACHED) {
            flags |= EntryFlags::WRITE_THROUGH | EntryFlags::CACHE_DISABLE;
        }
        flags
    }
}

/// The two PML4 entries carrying the shared kernel half.
#[derive(Debug, Clone, Copy)]
pub struct KernelHalf {
    /// PML4 entry 256 (direct map and friends).
    pub low: PageTableEntry,
    /// PML4 entry 511 (kernel image).
    pub high: PageTableEntry,
}

/// An address space handle: the physical address of its PML4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Space(PhysAddr);

impl Space {
    /// Reconstructs a handle from a raw PML4 physical address (CR3 reads).
    pub const fn from_root(root: PhysAddr) -> Self {
        Self(root)
    }

    /// Physical address of the PML4, the value loaded into CR3.
    pub const fn root(self) -> PhysAddr {
        self.0
    }
}

/// Walks and builds page tables through a fixed phys→virt offset.
pub struct SpaceWalker {
    phys_base: u64,
}

impl SpaceWalker {
    /// Creates a walker translating physical address `p` to `phys_base + p`.
    pub const fn new(phys_base: u64) -> Self {
        Self { phys_base }
    }

    /// # Safety
    ///
    /// `phys` must be a 4 KiB-aligned table frame reachable through the
    /// walker's offset.
    unsafe fn table_at(&self, phys: PhysAddr) -> &mut PageTable {
        // SAFETY: Caller contract.
        unsafe { &mut *((self.phys_base + phys.as_u64()) as *mut PageTable) }
    }

    /// Returns the child table behind `table[index]`, allocating and
    /// zeroing one if the entry is not present. Intermediate entries are
    /// present+writable; `user` is OR'd in so ring 3 can reach user leaves.
    ///
    /// # Safety
    ///
    /// `table_phys` must be a valid table frame.
    unsafe fn ensure_table(
        &self,
        table_phys: PhysAddr,
        index: usize,
        user: bool,
        frames: &mut dyn FrameSource,
    ) -> Result<PhysAddr, MmError> {
        // SAFETY: Caller contract.
        let table = unsafe { self.table_at(table_phys) };
        let entry = table.entries[index];

        if entry.is_present() {
            if user && !entry.flags().contains(EntryFlags::USER) {
                table.entries[index] =
                    PageTableEntry::from_raw(entry.raw() | EntryFlags::USER.bits());
            }
            return Ok(entry.address());
        }

        let child = frames.alloc_frames(1).ok_or(MmError::OutOfMemory)?;
        // SAFETY: Freshly allocated frame, reachable through the offset.
        unsafe { self.table_at(child) }.zero();

        let mut flags = EntryFlags::PRESENT | EntryFlags::WRITABLE;
        if user {
            flags |= EntryFlags::USER;
        }
        table.entries[index] = PageTableEntry::new(child, ADDR_MASK, flags);
        Ok(child)
    }

    /// Allocates a fresh space. With `kernel_half` the two shared PML4
    /// entries are copied in; without it the caller is bootstrapping the
    /// first space and maps the kernel half itself before capturing it.
    ///
    /// # Safety
    ///
    /// `frames` must hand out frames reachable through the walker's offset.
    pub unsafe fn create(
        &self,
        kernel_half: Option<KernelHalf>,
        frames: &mut dyn FrameSource,
    ) -> Result<Space, MmError> {
        let root = frames.alloc_frames(1).ok_or(MmError::OutOfMemory)?;
        // SAFETY: Freshly allocated frame.
        let pml4 = unsafe { self.table_at(root) };
        pml4.zero();

        if let Some(half) = kernel_half {
            pml4.entries[256] = half.low;
            pml4.entries[511] = half.high;
        }

        Ok(Space(root))
    }

    /// Reads the shared kernel-half entries out of a space.
    ///
    /// # Safety
    ///
    /// `space` must be a live space built by this walker.
    pub unsafe fn kernel_half(&self, space: Space) -> KernelHalf {
        // SAFETY: Caller contract.
        let pml4 = unsafe { self.table_at(space.root()) };
        KernelHalf {
            low: pml4.entries[256],
            high: pml4.entries[511],
        }
    }

    /// Maps `count` pages starting at page index `virt_page` onto frames
    /// starting at `phys_page`.
    ///
    /// Greedy direct-entry selection: a 1 GiB leaf when indices and the
    /// remaining count are 1 GiB-aligned and `use_gib` (CPU support) holds,
    /// else a 2 MiB leaf at 2 MiB alignment, else a 4 KiB leaf. Missing
    /// intermediate tables are allocated on demand. `invalidate` is called
    /// with each written virtual address (the kernel passes INVLPG when the
    /// space is active, a no-op otherwise).
    ///
    /// On allocation failure, already-created intermediate tables are left
    /// in place; they are empty shells that `destroy` reclaims.
    ///
    /// # Safety
    ///
    /// `space` must be a live space built by this walker and the mapped
    /// frames must not alias kernel structures unless intended.
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn map_pages(
        &self,
        space: Space,
        mut virt_page: u64,
        mut phys_page: u64,
        mut count: u64,
        flags: MapFlags,
        use_gib: bool,
        frames: &mut dyn FrameSource,
        invalidate: &mut dyn FnMut(VirtAddr),
    ) -> Result<(), MmError> {
        let leaf_flags = flags.entry_flags();
        let user = flags.contains(MapFlags::USER);

        while count > 0 {
            let virt = VirtAddr::from_page(virt_page);

            // SAFETY: space is a live root per caller contract.
            let pdp_phys =
                unsafe { self.ensure_table(space.root(), virt.pml4_index(), user, frames)? };

            if use_gib
                && virt_page % PDP_DIRECT_PAGES == 0
                && phys_page % PDP_DIRECT_PAGES == 0
                && count >= PDP_DIRECT_PAGES
            {
                // SAFETY: pdp_phys was just ensured.
                let pdp = unsafe { self.table_at(pdp_phys) };
                pdp.entries[virt.pdp_index()] = PageTableEntry::new(
                    PhysAddr::from_frame(phys_page),
                    DIRECT_PDP_ADDR_MASK,
                    leaf_flags | EntryFlags::DIRECT,
                );
                invalidate(virt);
                virt_page += PDP_DIRECT_PAGES;
                phys_page += PDP_DIRECT_PAGES;
                count -= PDP_DIRECT_PAGES;
                continue;
            }

            // SAFETY: pdp_phys was just ensured.
            let pd_phys = unsafe { self.ensure_table(pdp_phys, virt.pdp_index(), user, frames)? };

            if virt_page % PD_DIRECT_PAGES == 0
                && phys_page % PD_DIRECT_PAGES == 0
                && count >= PD_DIRECT_PAGES
            {
                // SAFETY: pd_phys was just ensured.
                let pd = unsafe { self.table_at(pd_phys) };
                pd.entries[virt.pd_index()] = PageTableEntry::new(
                    PhysAddr::from_frame(phys_page),
                    DIRECT_PD_ADDR_MASK,
                    leaf_flags | EntryFlags::DIRECT,
                );
                invalidate(virt);
                virt_page += PD_DIRECT_PAGES;
                phys_page += PD_DIRECT_PAGES;
                count -= PD_DIRECT_PAGES;
                continue;
            }

            // SAFETY: pd_phys was just ensured.
            let pt_phys = unsafe { self.ensure_table(pd_phys, virt.pd_index(), user, frames)? };
            // SAFETY: pt_phys was just ensured.
            let pt = unsafe { self.table_at(pt_phys) };
            pt.entries[virt.pt_index()] =
                PageTableEntry::new(PhysAddr::from_frame(phys_page), ADDR_MASK, leaf_flags);
            invalidate(virt);
            virt_page += 1;
            phys_page += 1;
            count -= 1;
        }

        Ok(())
    }

    /// Tears a space down, freeing every frame the user half owns.
    ///
    /// Walks PML4 entries 0..255 and frees, transitively: the frame behind
    /// each present PT entry, 512 frames per direct 2 MiB entry, 512×512
    /// frames per direct 1 GiB entry, each table frame on the way back up,
    /// and finally the PML4 frame itself. The shared kernel half is left
    /// untouched.
    ///
    /// # Safety
    ///
    /// `space` must be a live space built by this walker, must not be the
    /// active space, and must not be used again afterwards.
    pub unsafe fn destroy(&self, space: Space, frames: &mut dyn FrameSource) {
        // SAFETY: Caller contract.
        let pml4 = unsafe { self.table_at(space.root()) };

        for pml4_entry in &pml4.entries[..USER_PML4_ENTRIES] {
            if !pml4_entry.is_present() {
                continue;
            }
            // SAFETY: Present non-leaf entries point at table frames.
            let pdp = unsafe { self.table_at(pml4_entry.address()) };

            for pdp_entry in &pdp.entries {
                if !pdp_entry.is_present() {
                    continue;
                }
                if pdp_entry.is_direct() {
                    frames.free_frames(pdp_entry.direct_pdp_address(), PDP_DIRECT_PAGES);
                    continue;
                }
                // SAFETY: Present non-leaf entries point at table frames.
                let pd = unsafe { self.table_at(pdp_entry.address()) };

                for pd_entry in &pd.entries {
                    if !pd_entry.is_present() {
                        continue;
                    }
                    if pd_entry.is_direct() {
                        frames.free_frames(pd_entry.direct_pd_address(), PD_DIRECT_PAGES);
                        continue;
                    }
                    // SAFETY: Present non-leaf entries point at table frames.
                    let pt = unsafe { self.table_at(pd_entry.address()) };

                    for pt_entry in &pt.entries {
                        if pt_entry.is_present() {
                            frames.free_frames(pt_entry.address(), 1);
                        }
                    }
                    frames.free_frames(pd_entry.address(), 1);
                }
                frames.free_frames(pdp_entry.address(), 1);
            }
            frames.free_frames(pml4_entry.address(), 1);
        }

        frames.free_frames(space.root(), 1);
    }

    /// Duplicates a space: a fresh space sharing the kernel half whose
    /// user half maps fresh frames holding copies of the source bytes,
    /// installed with the source's flags. Copying semantics, not
    /// copy-on-write.
    ///
    /// On failure the partially-built space is destroyed before returning.
    ///
    /// # Safety
    ///
    /// `space` must be a live space built by this walker, and every user
    /// leaf must be reachable through the walker's offset for the copy.
    pub unsafe fn fork(
        &self,
        space: Space,
        frames: &mut dyn FrameSource,
    ) -> Result<Space, MmError> {
        // SAFETY: Caller contract.
        let half = unsafe { self.kernel_half(space) };
        // SAFETY: Caller contract.
        let new_space = unsafe { self.create(Some(half), frames)? };

        // SAFETY: Caller contract.
        let result = unsafe { self.fork_user_half(space, new_space, frames) };
        if let Err(err) = result {
            // SAFETY: new_space was built by this walker and is not active.
            unsafe { self.destroy(new_space, frames) };
            return Err(err);
        }

        Ok(new_space)
    }

    /// # Safety
    ///
    /// See [`SpaceWalker::fork`].
    unsafe fn fork_user_half(
        &self,
        src: Space,
        dst: Space,
        frames: &mut dyn FrameSource,
    ) -> Result<(), MmError> {
        // SAFETY: Caller contract.
        let pml4 = unsafe { self.table_at(src.root()) };

        for pml4_i in 0..USER_PML4_ENTRIES {
            let pml4_entry = pml4.entries[pml4_i];
            if !pml4_entry.is_present() {
                continue;
            }
            // SAFETY: Present non-leaf entry.
            let pdp = unsafe { self.table_at(pml4_entry.address()) };

            for pdp_i in 0..512 {
                let pdp_entry = pdp.entries[pdp_i];
                if !pdp_entry.is_present() {
                    continue;
                }
                let base_page =
                    ((pml4_i as u64) << 27 | (pdp_i as u64) << 18) & 0xF_FFFF_FFFF;
                if pdp_entry.is_direct() {
                    // SAFETY: Caller contract.
                    unsafe {
                        self.copy_leaf(
                            dst,
                            base_page,
                            pdp_entry.direct_pdp_address(),
                            PDP_DIRECT_PAGES,
                            pdp_entry.flags(),
                            frames,
                        )?;
                    }
                    continue;
                }
                // SAFETY: Present non-leaf entry.
                let pd = unsafe { self.table_at(pdp_entry.address()) };

                for pd_i in 0..512 {
                    let pd_entry = pd.entries[pd_i];
                    if !pd_entry.is_present() {
                        continue;
                    }
                    let base_page = base_page | (pd_i as u64) << 9;
                    if pd_entry.is_direct() {
                        // SAFETY: Caller contract.
                        unsafe {
                            self.copy_leaf(
                                dst,
                                base_page,
                                pd_entry.direct_pd_address(),
                                PD_DIRECT_PAGES,
                                pd_entry.flags(),
                                frames,
                            )?;
                        }
                        continue;
                    }
                    // SAFETY: Present non-leaf entry.
                    let pt = unsafe { self.table_at(pd_entry.address()) };

                    for pt_i in 0..512 {
                        let pt_entry = pt.entries[pt_i];
                        if !pt_entry.is_present() {
                            continue;
                        }
                        // SAFETY: Caller contract.
                        unsafe {
                            self.copy_leaf(
                                dst,
                                base_page | pt_i as u64,
                                pt_entry.address(),
                                1,
                                pt_entry.flags(),
                                frames,
                            )?;
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Copies one leaf mapping (4 KiB page or direct run) into `dst` at
    /// the same virtual page, backed by fresh frames.
    ///
    /// # Safety
    ///
    /// Source frames must be readable through the walker's offset.
    unsafe fn copy_leaf(
        &self,
        dst: Space,
        virt_page: u64,
        src_phys: PhysAddr,
        pages: u64,
        entry_flags: EntryFlags,
        frames: &mut dyn FrameSource,
    ) -> Result<(), MmError> {
        let new_phys = frames.alloc_frames(pages).ok_or(MmError::OutOfMemory)?;

        // SAFETY: Both runs are reachable through the offset and disjoint.
        unsafe {
            core::ptr::copy_nonoverlapping(
                (self.phys_base + src_phys.as_u64()) as *const u8,
                (self.phys_base + new_phys.as_u64()) as *mut u8,
                (pages * 4096) as usize,
            );
        }

        let mut flags = MapFlags::empty();
        if entry_flags.contains(EntryFlags::WRITABLE) {
            flags |= MapFlags::WRITE;
        }
        if !entry_flags.contains(EntryFlags::NO_EXECUTE) {
            flags |= MapFlags::EXECUTE;
        }
        if entry_flags.contains(EntryFlags::USER) {
            flags |= MapFlags::USER;
        }
        if entry_flags.contains(EntryFlags::CACHE_DISABLE) {
            flags |= MapFlags::UNCACHED;
        }

        // SAFETY: dst is a live space per caller contract.
        unsafe {
            self.map_pages(
                dst,
                virt_page,
                new_phys.frame_index(),
                pages,
                flags,
                pages == PDP_DIRECT_PAGES,
                frames,
                &mut |_| {},
            )
        }
    }

    /// Translates a virtual address, stopping at the first direct entry
    /// and composing the result from the residual address bits. Returns
    /// `None` when the address is not mapped.
    ///
    /// # Safety
    ///
    /// `space` must be a live space built by this walker.
    pub unsafe fn translate(&self, space: Space, virt: VirtAddr) -> Option<PhysAddr> {
        // SAFETY: Caller contract.
        let pml4 = unsafe { self.table_at(space.root()) };
        let pml4_entry = pml4.entries[virt.pml4_index()];
        if !pml4_entry.is_present() {
            return None;
        }

        // SAFETY: Present non-leaf entry.
        let pdp = unsafe { self.table_at(pml4_entry.address()) };
        let pdp_entry = pdp.entries[virt.pdp_index()];
        if !pdp_entry.is_present() {
            return None;
        }
        if pdp_entry.is_direct() {
            return Some(pdp_entry.direct_pdp_address() + (virt.as_u64() & 0x3FFF_FFFF));
        }

        // SAFETY: Present non-leaf entry.
        let pd = unsafe { self.table_at(pdp_entry.address()) };
        let pd_entry = pd.entries[virt.pd_index()];
        if !pd_entry.is_present() {
            return None;
        }
        if pd_entry.is_direct() {
            return Some(pd_entry.direct_pd_address() + (virt.as_u64() & 0x1F_FFFF));
        }

        // SAFETY: Present non-leaf entry.
        let pt = unsafe { self.table_at(pd_entry.address()) };
        let pt_entry = pt.entries[virt.pt_index()];
        if !pt_entry.is_present() {
            return None;
        }

        Some(pt_entry.address() + virt.page_offset())
    }

    /// Enumerates present mappings, coalescing adjacent ranges, and calls
    /// `range_fn(virt_start, virt_end)` for each.
    ///
    /// # Safety
    ///
    /// `space` must be a live space built by this walker.
    pub unsafe fn dump(&self, space: Space, range_fn: &mut dyn FnMut(u64, u64)) {
        struct Coalesce {
            start: u64,
            end: u64,
            active: bool,
        }

        impl Coalesce {
            fn add(&mut self, virt: u64, size: u64, range_fn: &mut dyn FnMut(u64, u64)) {
                if self.active && self.end == virt {
                    self.end += size;
                } else {
                    if self.active {
                        range_fn(self.start, self.end);
                    }
                    self.start = virt;
                    self.end = virt + size;
                    self.active = true;
                }
            }
        }

        let mut ranges = Coalesce {
            start: 0,
            end: 0,
            active: false,
        };

        // SAFETY: Caller contract.
        let pml4 = unsafe { self.table_at(space.root()) };

        for pml4_i in 0..512usize {
            let pml4_entry = pml4.entries[pml4_i];
            if !pml4_entry.is_present() {
                continue;
            }
            let pml4_virt = (pml4_i as u64) << 39;
            // SAFETY: Present non-leaf entry.
            let pdp = unsafe { self.table_at(pml4_entry.address()) };

            for pdp_i in 0..512usize {
                let pdp_entry = pdp.entries[pdp_i];
                if !pdp_entry.is_present() {
                    continue;
                }
                let pdp_virt =
                    VirtAddr::new_truncate(pml4_virt | (pdp_i as u64) << 30).as_u64();
                if pdp_entry.is_direct() {
                    ranges.add(pdp_virt, 1 << 30, range_fn);
                    continue;
                }
                // SAFETY: Present non-leaf entry.
                let pd = unsafe { self.table_at(pdp_entry.address()) };

                for pd_i in 0..512usize {
                    let pd_entry = pd.entries[pd_i];
                    if !pd_entry.is_present() {
                        continue;
                    }
                    let pd_virt = pdp_virt | (pd_i as u64) << 21;
                    if pd_entry.is_direct() {
                        ranges.add(pd_virt, 1 << 21, range_fn);
                        continue;
                    }
                    // SAFETY: Present non-leaf entry.
                    let pt = unsafe { self.table_at(pd_entry.address()) };

                    for pt_i in 0..512usize {
                        if pt.entries[pt_i].is_present() {
                            ranges.add(pd_virt | (pt_i as u64) << 12, 4096, range_fn);
                        }
                    }
                }
            }
        }

        if ranges.active {
            range_fn(ranges.start, ranges.end);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::alloc::Layout;
    use std::collections::HashMap;

    /// Frame source backed by host allocations. "Physical" addresses are
    /// pointer values; the walker runs with `phys_base == 0`.
    #[derive(Default)]
    struct TestFrames {
        allocs: HashMap<u64, (u64, Layout)>,
        outstanding: u64,
        foreign_freed: u64,
    }

    impl FrameSource for TestFrames {
        fn alloc_frames(&mut self, count: u64) -> Option<PhysAddr> {
            let layout = Layout::from_size_align((count * 4096) as usize, 4096).unwrap();
            let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
            assert!(!ptr.is_null());
            self.allocs.insert(ptr as u64, (count, layout));
            self.outstanding += count;
            Some(PhysAddr::new(ptr as u64))
        }

        fn free_frames(&mut self, first: PhysAddr, count: u64) {
            if let Some((n, layout)) = self.allocs.remove(&first.as_u64()) {
                assert_eq!(n, count, "freed with a different count than allocated");
                unsafe { std::alloc::dealloc(first.as_u64() as *mut u8, layout) };
                self.outstanding -= count;
            } else {
                // Synthetic frames (never dereferenced) land here.
                self.foreign_freed += count;
            }
        }
    }

    fn walker() -> SpaceWalker {
        SpaceWalker::new(0)
    }

    const USER_PAGE: u64 = 0x4000_0000 / 4096; // 1 GiB, safely in the user half

    #[test]
    fn map_and_translate_4k() {
        let walker = walker();
        let mut frames = TestFrames::default();
        let space = unsafe { walker.create(None, &mut frames) }.unwrap();
        let frame = frames.alloc_frames(1).unwrap();

        unsafe {
            walker
                .map_pages(
                    space,
                    USER_PAGE,
                    frame.frame_index(),
                    1,
                    MapFlags::WRITE,
                    false,
                    &mut frames,
                    &mut |_| {},
                )
                .unwrap();
        }

        let virt = VirtAddr::from_page(USER_PAGE) + 0x123;
        let got = unsafe { walker.translate(space, virt) }.unwrap();
        assert_eq!(got.as_u64(), frame.as_u64() + 0x123);

        let unmapped = VirtAddr::from_page(USER_PAGE + 1);
        assert!(unsafe { walker.translate(space, unmapped) }.is_none());
    }

    #[test]
    fn gib_mapping_is_one_direct_entry() {
        let walker = walker();
        let mut frames = TestFrames::default();
        let space = unsafe { walker.create(None, &mut frames) }.unwrap();
        let before = frames.outstanding;

        // Synthetic 1 GiB-aligned physical run; never dereferenced.
        unsafe {
            walker
                .map_pages(
                    space,
                    USER_PAGE,
                    0x1_0000_0000 / 4096,
                    PDP_DIRECT_PAGES,
                    MapFlags::WRITE,
                    true,
                    &mut frames,
                    &mut |_| {},
                )
                .unwrap();
        }

        // Exactly one intermediate table (the PDP) was allocated: a leaf
        // rendition would have taken 1 + 512 + 512*512 table walks.
        assert_eq!(frames.outstanding, before + 1);

        let virt = VirtAddr::from_page(USER_PAGE) + 0xABCDE;
        let got = unsafe { walker.translate(space, virt) }.unwrap();
        assert_eq!(got.as_u64(), 0x1_0000_0000 + 0xABCDE);
    }

    #[test]
    fn two_mib_mapping_is_direct() {
        let walker = walker();
        let mut frames = TestFrames::default();
        let space = unsafe { walker.create(None, &mut frames) }.unwrap();
        let before = frames.outstanding;

        unsafe {
            walker
                .map_pages(
                    space,
                    USER_PAGE,
                    0x2000_0000 / 4096,
                    PD_DIRECT_PAGES,
                    MapFlags::WRITE,
                    false,
                    &mut frames,
                    &mut |_| {},
                )
                .unwrap();
        }

        // PDP + PD, no PT.
        assert_eq!(frames.outstanding, before + 2);

        let virt = VirtAddr::from_page(USER_PAGE) + 0x12345;
        let got = unsafe { walker.translate(space, virt) }.unwrap();
        assert_eq!(got.as_u64(), 0x2000_0000 + 0x12345);
    }

    #[test]
    fn unaligned_range_falls_back_to_leaves() {
        let walker = walker();
        let mut frames = TestFrames::default();
        let space = unsafe { walker.create(None, &mut frames) }.unwrap();

        // 3 pages at an odd page index can never use direct entries.
        unsafe {
            walker
                .map_pages(
                    space,
                    USER_PAGE + 1,
                    0x3000_0000 / 4096 + 1,
                    3,
                    MapFlags::WRITE | MapFlags::EXECUTE,
                    true,
                    &mut frames,
                    &mut |_| {},
                )
                .unwrap();
        }

        for i in 0..3u64 {
            let virt = VirtAddr::from_page(USER_PAGE + 1 + i);
            let got = unsafe { walker.translate(space, virt) }.unwrap();
            assert_eq!(got.as_u64(), 0x3000_0000 + (1 + i) * 4096);
        }
    }

    #[test]
    fn remap_overwrites() {
        let walker = walker();
        let mut frames = TestFrames::default();
        let space = unsafe { walker.create(None, &mut frames) }.unwrap();

        unsafe {
            walker
                .map_pages(space, USER_PAGE, 0x5000, 1, MapFlags::WRITE, false, &mut frames, &mut |_| {})
                .unwrap();
            walker
                .map_pages(space, USER_PAGE, 0x6000, 1, MapFlags::WRITE, false, &mut frames, &mut |_| {})
                .unwrap();
        }

        let got = unsafe { walker.translate(space, VirtAddr::from_page(USER_PAGE)) }.unwrap();
        assert_eq!(got.frame_index(), 0x6000);
    }

    #[test]
    fn kernel_half_is_shared() {
        let walker = walker();
        let mut frames = TestFrames::default();

        // Bootstrap space: map one page in the kernel half, capture.
        let first = unsafe { walker.create(None, &mut frames) }.unwrap();
        let kernel_page = 0xFFFF_8000_0000_0000u64 / 4096;
        unsafe {
            walker
                .map_pages(
                    first,
                    kernel_page & 0xF_FFFF_FFFF,
                    0x7000,
                    1,
                    MapFlags::WRITE,
                    false,
                    &mut frames,
                    &mut |_| {},
                )
                .unwrap();
        }
        let half = unsafe { walker.kernel_half(first) };
        assert!(half.low.is_present());

        // Later spaces copy the captured entries verbatim.
        let second = unsafe { walker.create(Some(half), &mut frames) }.unwrap();
        let third = unsafe { walker.create(Some(half), &mut frames) }.unwrap();
        let second_half = unsafe { walker.kernel_half(second) };
        let third_half = unsafe { walker.kernel_half(third) };
        assert_eq!(second_half.low, third_half.low);
        assert_eq!(second_half.high, third_half.high);
        assert_eq!(second_half.low, half.low);

        // The shared kernel mapping resolves identically in every space.
        let virt = VirtAddr::new(0xFFFF_8000_0000_0000);
        let a = unsafe { walker.translate(first, virt) }.unwrap();
        let b = unsafe { walker.translate(second, virt) }.unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn destroy_frees_everything() {
        let walker = walker();
        let mut frames = TestFrames::default();
        let space = unsafe { walker.create(None, &mut frames) }.unwrap();

        // Eight individually-allocated leaf frames.
        for i in 0..8u64 {
            let frame = frames.alloc_frames(1).unwrap();
            unsafe {
                walker
                    .map_pages(
                        space,
                        USER_PAGE + i,
                        frame.frame_index(),
                        1,
                        MapFlags::WRITE | MapFlags::USER,
                        false,
                        &mut frames,
                        &mut |_| {},
                    )
                    .unwrap();
            }
        }

        unsafe { walker.destroy(space, &mut frames) };
        assert_eq!(frames.outstanding, 0, "destroy leaked frames");
        assert_eq!(frames.foreign_freed, 0);
    }

    #[test]
    fn destroy_frees_direct_runs_wholesale() {
        let walker = walker();
        let mut frames = TestFrames::default();
        let space = unsafe { walker.create(None, &mut frames) }.unwrap();

        unsafe {
            walker
                .map_pages(
                    space,
                    USER_PAGE,
                    0x2000_0000 / 4096,
                    PD_DIRECT_PAGES,
                    MapFlags::WRITE,
                    false,
                    &mut frames,
                    &mut |_| {},
                )
                .unwrap();
        }

        unsafe { walker.destroy(space, &mut frames) };
        // The synthetic 2 MiB leaf was released as one 512-frame run.
        assert_eq!(frames.foreign_freed, PD_DIRECT_PAGES);
        assert_eq!(frames.outstanding, 0);
    }

    #[test]
    fn fork_deep_copies_user_pages() {
        let walker = walker();
        let mut frames = TestFrames::default();
        let parent = unsafe { walker.create(None, &mut frames) }.unwrap();

        let frame = frames.alloc_frames(1).unwrap();
        unsafe {
            core::ptr::write_bytes(frame.as_u64() as *mut u8, 0xAB, 4096);
            walker
                .map_pages(
                    parent,
                    USER_PAGE,
                    frame.frame_index(),
                    1,
                    MapFlags::WRITE | MapFlags::USER,
                    false,
                    &mut frames,
                    &mut |_| {},
                )
                .unwrap();
        }

        let child = unsafe { walker.fork(parent, &mut frames) }.unwrap();
        let virt = VirtAddr::from_page(USER_PAGE);
        let parent_phys = unsafe { walker.translate(parent, virt) }.unwrap();
        let child_phys = unsafe { walker.translate(child, virt) }.unwrap();
        assert_ne!(parent_phys, child_phys, "fork must not share user frames");

        unsafe {
            assert_eq!(*(child_phys.as_u64() as *const u8), 0xAB);
            // Writes to the parent stay invisible to the child.
            *(parent_phys.as_u64() as *mut u8) = 0xCD;
            assert_eq!(*(child_phys.as_u64() as *const u8), 0xAB);
        }
    }

    #[test]
    fn dump_coalesces_adjacent_ranges() {
        let walker = walker();
        let mut frames = TestFrames::default();
        let space = unsafe { walker.create(None, &mut frames) }.unwrap();

        unsafe {
            walker
                .map_pages(space, USER_PAGE, 0x1000, 3, MapFlags::WRITE, false, &mut frames, &mut |_| {})
                .unwrap();
            walker
                .map_pages(space, USER_PAGE + 16, 0x2000, 1, MapFlags::WRITE, false, &mut frames, &mut |_| {})
                .unwrap();
        }

        let mut ranges = Vec::new();
        unsafe { walker.dump(space, &mut |start, end| ranges.push((start, end))) };
        assert_eq!(
            ranges,
            vec![
                (USER_PAGE * 4096, (USER_PAGE + 3) * 4096),
                ((USER_PAGE + 16) * 4096, (USER_PAGE + 17) * 4096),
            ]
        );
    }
}
