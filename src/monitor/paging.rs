//! Four-level x86-64 page-table representation (C5).
//!
//! Grounded in the teacher's `PageTableEntry`/`PageTableEntryFlags` structural idiom, generalized
//! to two coexisting roots instead of one. The teacher's file expresses level-specific behavior
//! (whether a level may hold a huge page, whether it has subtables) through a `default fn` on an
//! unstable `specialization` trait; this crate expresses the same distinction as a plain
//! `Level`-indexed match so it compiles on stable Rust.

use bitflags::bitflags;

bitflags! {
    /// Flags carried in the low 12 and high bit of every page-table entry (Intel SDM Vol. 3A,
    /// Tables 4-14 through 4-19).
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PageTableEntryFlags: u64 {
        const PRESENT = 1 << 0;
        const WRITABLE = 1 << 1;
        const USER_ACCESSIBLE = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const CACHE_DISABLE = 1 << 4;
        const ACCESSED = 1 << 5;
        const DIRTY = 1 << 6;
        /// Only meaningful at the PDPT and PD levels: this entry maps a huge (1 GiB / 2 MiB)
        /// page rather than pointing at a subtable.
        const HUGE_PAGE = 1 << 7;
        const GLOBAL = 1 << 8;
        const EXECUTE_DISABLE = 1 << 63;
    }
}

const PHYS_ADDR_MASK: u64 = 0x000F_FFFF_FFFF_F000;

/// One entry in a PML4, PDPT, PD, or PT.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageTableEntry(u64);

impl PageTableEntry {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn new(physical_address: u64, flags: PageTableEntryFlags) -> Self {
        Self((physical_address & PHYS_ADDR_MASK) | flags.bits())
    }

    pub fn address(self) -> u64 {
        self.0 & PHYS_ADDR_MASK
    }

    pub fn flags(self) -> PageTableEntryFlags {
        PageTableEntryFlags::from_bits_truncate(self.0 & !PHYS_ADDR_MASK)
    }

    pub fn is_present(self) -> bool {
        self.flags().contains(PageTableEntryFlags::PRESENT)
    }

    pub fn is_writable(self) -> bool {
        self.flags().contains(PageTableEntryFlags::WRITABLE)
    }

    pub fn is_huge(self) -> bool {
        self.flags().contains(PageTableEntryFlags::HUGE_PAGE)
    }

    /// Clears the writable bit, preserving every other flag and the address. The mechanism
    /// behind invariants I1 and I5.
    pub fn clear_writable(&mut self) {
        self.0 &= !PageTableEntryFlags::WRITABLE.bits();
    }

    pub fn set_writable(&mut self) {
        self.0 |= PageTableEntryFlags::WRITABLE.bits();
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

/// A level in the 4-level hierarchy. Level-specific behavior (can this level hold a huge page,
/// does it point at subtables) is expressed as a match over this enum rather than a
/// specialized trait method, so the representation needs no unstable compiler feature.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Level {
    Pml4,
    Pdpt,
    Pd,
    Pt,
}

impl Level {
    pub fn next(self) -> Option<Level> {
        match self {
            Level::Pml4 => Some(Level::Pdpt),
            Level::Pdpt => Some(Level::Pd),
            Level::Pd => Some(Level::Pt),
            Level::Pt => None,
        }
    }

    /// Whether an entry at this level is allowed to set [`PageTableEntryFlags::HUGE_PAGE`]
    /// instead of pointing at a subtable (PDPT: 1 GiB pages, PD: 2 MiB pages).
    pub fn allows_huge(self) -> bool {
        matches!(self, Level::Pdpt | Level::Pd)
    }

    /// The bit position of this level's 9-bit index within a virtual address.
    pub fn index_shift(self) -> u32 {
        match self {
            Level::Pml4 => 39,
            Level::Pdpt => 30,
            Level::Pd => 21,
            Level::Pt => 12,
        }
    }

    /// Size, in bytes, of a huge page mapped at this level (meaningless at `Pml4`/`Pt`).
    pub fn huge_page_size(self) -> u64 {
        match self {
            Level::Pdpt => 1 << 30,
            Level::Pd => 1 << 21,
            _ => 0,
        }
    }
}

const ENTRIES_PER_TABLE: usize = 512;
const TABLE_INDEX_MASK: u64 = 0x1FF;

/// A single 4 KiB page-table page: 512 entries, naturally page-aligned.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; ENTRIES_PER_TABLE],
}

impl PageTable {
    pub fn zeroed() -> Self {
        Self {
            entries: [PageTableEntry::empty(); ENTRIES_PER_TABLE],
        }
    }

    pub fn index_for(level: Level, virt: u64) -> usize {
        ((virt >> level.index_shift()) & TABLE_INDEX_MASK) as usize
    }

    pub fn entry(&self, index: usize) -> PageTableEntry {
        self.entries[index]
    }

    pub fn set_entry(&mut self, index: usize, entry: PageTableEntry) {
        self.entries[index] = entry;
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, PageTableEntry)> + '_ {
        self.entries.iter().copied().enumerate()
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::zeroed()
    }
}

/// Translates a physical address to a pointer to the [`PageTable`] page at that address.
///
/// # Safety
/// Callers must only use this where physical memory is identity-mapped into the current
/// address space, which holds for every physical address this crate's monitor and bootstrap
/// coordinator touch (the first few megabytes, and pages this crate's own allocator handed out
/// from that range).
unsafe fn table_at(physical_address: u64) -> *mut PageTable {
    physical_address as *mut PageTable
}

/// A full 4-level page-table hierarchy, referenced by its PML4's physical address.
///
/// Two of these coexist in the monitor (`monitor_root`, `unpriv_root`); both are built once at
/// `monitor::init` and mutated only through the monitor's dispatch operations afterward.
#[derive(Clone, Copy)]
pub struct PageTableView {
    root: u64,
}

impl PageTableView {
    pub fn new(root: u64) -> Self {
        Self { root }
    }

    pub fn root(&self) -> u64 {
        self.root
    }

    /// Walks the hierarchy for `virt`, returning the leaf entry (a PT entry, or a huge PD/PDPT
    /// entry) if present.
    pub fn walk(&self, virt: u64) -> Option<PageTableEntry> {
        let mut table_phys = self.root;
        let mut level = Level::Pml4;
        loop {
            let table = unsafe { &*table_at(table_phys) };
            let index = PageTable::index_for(level, virt);
            let entry = table.entry(index);
            if !entry.is_present() {
                return None;
            }
            if entry.is_huge() || level == Level::Pt {
                return Some(entry);
            }
            table_phys = entry.address();
            level = level.next().expect("Pt has no next level and is handled above");
        }
    }

    /// Returns the entry pointing at `virt` one level up from its leaf (i.e. the PT entry for a
    /// 4 KiB mapping, or the PD/PDPT entry for a huge mapping), together with the table and
    /// index it lives in — used by the monitor to flip the writable bit on an existing mapping
    /// without reinstalling it.
    fn locate_leaf_slot(&self, virt: u64) -> Option<(*mut PageTable, usize)> {
        let mut table_phys = self.root;
        let mut level = Level::Pml4;
        loop {
            let table = unsafe { &*table_at(table_phys) };
            let index = PageTable::index_for(level, virt);
            let entry = table.entry(index);
            if !entry.is_present() {
                return None;
            }
            if entry.is_huge() || level == Level::Pt {
                return Some((table_at(table_phys), index));
            }
            table_phys = entry.address();
            level = level.next().expect("Pt has no next level and is handled above");
        }
    }

    /// Clears the writable bit on the leaf entry mapping `virt`, if present. Used to enforce I1
    /// and I5 on an already-installed mapping.
    pub fn clear_writable_at(&self, virt: u64) -> bool {
        match self.locate_leaf_slot(virt) {
            Some((table_ptr, index)) => {
                let table = unsafe { &mut *table_ptr };
                let mut entry = table.entry(index);
                entry.clear_writable();
                table.set_entry(index, entry);
                true
            }
            None => false,
        }
    }

    /// Installs (or overwrites) a 4 KiB leaf mapping `virt -> phys`, allocating any missing
    /// intermediate tables via `alloc_table`. Splits a pre-existing huge mapping that covers
    /// `virt` into 4 KiB entries first, so the installed mapping never silently widens into a
    /// huge page it didn't ask for.
    pub fn map_4k(
        &self,
        virt: u64,
        phys: u64,
        flags: PageTableEntryFlags,
        alloc_table: &mut dyn FnMut() -> Option<u64>,
    ) -> Result<(), &'static str> {
        let mut table_phys = self.root;
        let mut level = Level::Pml4;
        loop {
            let table = unsafe { &mut *table_at(table_phys) };
            let index = PageTable::index_for(level, virt);
            let entry = table.entry(index);

            if level == Level::Pt {
                table.set_entry(
                    index,
                    PageTableEntry::new(phys, flags | PageTableEntryFlags::PRESENT),
                );
                return Ok(());
            }

            if entry.is_huge() {
                self.split_huge_entry(table, index, level, alloc_table)?;
            }

            let next_phys = if table.entry(index).is_present() {
                table.entry(index).address()
            } else {
                let new_table = alloc_table().ok_or("out of memory for page table")?;
                unsafe { (*table_at(new_table)) = PageTable::zeroed() };
                table.set_entry(
                    index,
                    PageTableEntry::new(
                        new_table,
                        PageTableEntryFlags::PRESENT | PageTableEntryFlags::WRITABLE,
                    ),
                );
                new_table
            };

            table_phys = next_phys;
            level = level.next().expect("Pt is handled above");
        }
    }

    /// Splits the huge entry at `table.entry(index)` (level `level`) into a freshly allocated
    /// subtable of 512 equivalent, non-huge entries at the next level down.
    fn split_huge_entry(
        &self,
        table: &mut PageTable,
        index: usize,
        level: Level,
        alloc_table: &mut dyn FnMut() -> Option<u64>,
    ) -> Result<(), &'static str> {
        let huge_entry = table.entry(index);
        if !huge_entry.is_huge() {
            return Ok(());
        }
        let next_level = level.next().expect("huge entries exist only at Pdpt/Pd");
        let sub_page_size = next_level.huge_page_size().max(1 << 12);
        let base_phys = huge_entry.address();
        let flags = huge_entry.flags() & !PageTableEntryFlags::HUGE_PAGE;

        let new_table_phys = alloc_table().ok_or("out of memory splitting huge page")?;
        let new_table = unsafe { &mut *table_at(new_table_phys) };
        *new_table = PageTable::zeroed();
        for i in 0..ENTRIES_PER_TABLE {
            let sub_flags = if next_level.allows_huge() {
                flags | PageTableEntryFlags::HUGE_PAGE
            } else {
                flags
            };
            new_table.set_entry(
                i,
                PageTableEntry::new(base_phys + (i as u64) * sub_page_size, sub_flags),
            );
        }

        table.set_entry(
            index,
            PageTableEntry::new(
                new_table_phys,
                PageTableEntryFlags::PRESENT | PageTableEntryFlags::WRITABLE,
            ),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::boxed::Box;

    /// Leaks a real, page-aligned host allocation and returns its address as a "physical"
    /// address — valid because these tests never leave the host's own address space; unlike
    /// production use (where physical addresses come from the memory service), tests need
    /// addresses the host MMU will actually let them dereference.
    fn alloc_table_phys() -> u64 {
        let boxed = Box::new(PageTable::zeroed());
        Box::into_raw(boxed) as u64
    }

    #[test]
    fn map_4k_then_walk_round_trips() {
        let root = alloc_table_phys();
        let view = PageTableView::new(root);
        let mut alloc = || Some(alloc_table_phys());

        view.map_4k(
            0x1000,
            0x9000,
            PageTableEntryFlags::PRESENT | PageTableEntryFlags::WRITABLE,
            &mut alloc,
        )
        .unwrap();

        let entry = view.walk(0x1000).unwrap();
        assert_eq!(entry.address(), 0x9000);
        assert!(entry.is_writable());
    }

    #[test]
    fn clear_writable_at_flips_only_the_writable_bit() {
        let root = alloc_table_phys();
        let view = PageTableView::new(root);
        let mut alloc = || Some(alloc_table_phys());
        view.map_4k(
            0x2000,
            0xA000,
            PageTableEntryFlags::PRESENT | PageTableEntryFlags::WRITABLE | PageTableEntryFlags::GLOBAL,
            &mut alloc,
        )
        .unwrap();

        assert!(view.clear_writable_at(0x2000));
        let entry = view.walk(0x2000).unwrap();
        assert!(!entry.is_writable());
        assert!(entry.flags().contains(PageTableEntryFlags::GLOBAL));
        assert_eq!(entry.address(), 0xA000);
    }

    #[test]
    fn split_huge_entry_preserves_base_mapping_and_flags() {
        let root = alloc_table_phys();
        let view = PageTableView::new(root);
        let mut alloc = || Some(alloc_table_phys());

        // Install a 2 MiB huge mapping directly at the PD level by writing the PML4/PDPT chain
        // and placing a huge entry in the PD, then ask map_4k to refine one 4 KiB page inside
        // it — this must split rather than clobber the surrounding range.
        let pml4 = unsafe { &mut *table_at(root) };
        let pdpt_phys = alloc_table_phys();
        pml4.set_entry(
            0,
            PageTableEntry::new(pdpt_phys, PageTableEntryFlags::PRESENT | PageTableEntryFlags::WRITABLE),
        );
        let pdpt = unsafe { &mut *table_at(pdpt_phys) };
        let pd_phys = alloc_table_phys();
        pdpt.set_entry(
            0,
            PageTableEntry::new(pd_phys, PageTableEntryFlags::PRESENT | PageTableEntryFlags::WRITABLE),
        );
        let pd = unsafe { &mut *table_at(pd_phys) };
        pd.set_entry(
            0,
            PageTableEntry::new(
                0x0,
                PageTableEntryFlags::PRESENT | PageTableEntryFlags::WRITABLE | PageTableEntryFlags::HUGE_PAGE,
            ),
        );

        view.map_4k(
            0x1000,
            0x1000,
            PageTableEntryFlags::PRESENT | PageTableEntryFlags::WRITABLE,
            &mut alloc,
        )
        .unwrap();

        // The page we explicitly remapped now has our new mapping.
        assert_eq!(view.walk(0x1000).unwrap().address(), 0x1000);
        // A different page within the same original 2 MiB range keeps the original identity
        // mapping the split preserved.
        assert_eq!(view.walk(0x3000).unwrap().address(), 0x3000);
        assert!(!view.walk(0x3000).unwrap().is_huge());
    }
}
