//! x86_64 page table structures.
//!
//! A table is 512 64-bit entries, 4 KiB aligned. Leaf entries exist at
//! three levels: PT (4 KiB), PD with the direct bit (2 MiB) and PDP with
//! the direct bit (1 GiB); the address mask narrows accordingly.

use tachyon_core::addr::PhysAddr;

/// Physical address bits of a 4 KiB entry (bits 12..51).
pub const ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

/// Physical address bits of a direct 2 MiB PD entry (bits 21..51).
pub const DIRECT_PD_ADDR_MASK: u64 = 0x000F_FFFF_FFE0_0000;

/// Physical address bits of a direct 1 GiB PDP entry (bits 30..51).
pub const DIRECT_PDP_ADDR_MASK: u64 = 0x000F_FFFF_C000_0000;

bitflags::bitflags! {
    /// Page table entry flag bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EntryFlags: u64 {
        /// Entry is valid.
        const PRESENT       = 1 << 0;
        /// Mapping is writable.
        const WRITABLE      = 1 << 1;
        /// Mapping is reachable from ring 3.
        const USER          = 1 << 2;
        /// Write-through caching.
        const WRITE_THROUGH = 1 << 3;
        /// Caching disabled.
        const CACHE_DISABLE = 1 << 4;
        /// Set by the CPU on access.
        const ACCESSED      = 1 << 5;
        /// Direct (huge) leaf at PD or PDP level.
        const DIRECT        = 1 << 7;
        /// No-execute (requires EFER.NXE).
        const NO_EXECUTE    = 1 << 63;
    }
}

/// A single 64-bit page table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageTableEntry(u64);

impl PageTableEntry {
    /// The not-present entry.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Builds an entry from a raw 64-bit value.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Builds an entry pointing at `phys` with `flags`. The caller picks
    /// the mask matching the entry's level.
    pub const fn new(phys: PhysAddr, addr_mask: u64, flags: EntryFlags) -> Self {
        Self((phys.as_u64() & addr_mask) | flags.bits())
    }

    /// Raw 64-bit value.
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Whether the PRESENT bit is set.
    pub const fn is_present(self) -> bool {
        self.0 & 1 != 0
    }

    /// Whether this is a direct (huge) leaf.
    pub const fn is_direct(self) -> bool {
        self.0 & EntryFlags::DIRECT.bits() != 0
    }

    /// Physical address of the next-level table or 4 KiB frame.
    pub const fn address(self) -> PhysAddr {
        PhysAddr::new(self.0 & ADDR_MASK)
    }

    /// Physical base of a direct 2 MiB leaf.
    pub const fn direct_pd_address(self) -> PhysAddr {
        PhysAddr::new(self.0 & DIRECT_PD_ADDR_MASK)
    }

    /// Physical base of a direct 1 GiB leaf.
    pub const fn direct_pdp_address(self) -> PhysAddr {
        PhysAddr::new(self.0 & DIRECT_PDP_ADDR_MASK)
    }

    /// Flag bits of this entry.
    pub const fn flags(self) -> EntryFlags {
        EntryFlags::from_bits_truncate(self.0 & !ADDR_MASK)
    }
}

/// A 4 KiB-aligned table of 512 entries. All four levels share the shape.
#[repr(C, align(4096))]
pub struct PageTable {
    /// The 512 entries.
    pub entries: [PageTableEntry; 512],
}

impl PageTable {
    /// Clears every entry.
    pub fn zero(&mut self) {
        self.entries.fill(PageTableEntry::empty());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_entry() {
        let entry = PageTableEntry::empty();
        assert!(!entry.is_present());
        assert!(!entry.is_direct());
        assert_eq!(entry.address().as_u64(), 0);
    }

    #[test]
    fn flags_round_trip() {
        let flags = EntryFlags::PRESENT | EntryFlags::WRITABLE | EntryFlags::NO_EXECUTE;
        let entry = PageTableEntry::new(PhysAddr::new(0x2000), ADDR_MASK, flags);
        assert!(entry.is_present());
        assert_eq!(entry.flags(), flags);
        assert_eq!(entry.address().as_u64(), 0x2000);
    }

    #[test]
    fn address_and_flags_do_not_mix() {
        let entry = PageTableEntry::new(
            PhysAddr::new(0x000F_FFFF_FFFF_F000),
            ADDR_MASK,
            EntryFlags::PRESENT,
        );
        assert_eq!(entry.flags().bits() & ADDR_MASK, 0);
        assert_eq!(entry.address().as_u64() & !ADDR_MASK, 0);
    }

    #[test]
    fn direct_masks_narrow() {
        let phys = PhysAddr::new(0x1_2345_6789_A000);
        let pd = PageTableEntry::new(phys, DIRECT_PD_ADDR_MASK, EntryFlags::PRESENT | EntryFlags::DIRECT);
        assert!(pd.is_direct());
        assert_eq!(pd.direct_pd_address().as_u64() & 0x1F_FFFF, 0);
        let pdp = PageTableEntry::new(phys, DIRECT_PDP_ADDR_MASK, EntryFlags::PRESENT | EntryFlags::DIRECT);
        assert_eq!(pdp.direct_pdp_address().as_u64() & 0x3FFF_FFFF, 0);
    }

    #[test]
    fn table_is_page_sized() {
        assert_eq!(core::mem::size_of::<PageTable>(), 4096);
        assert_eq!(core::mem::align_of::<PageTable>(), 4096);
    }
}
