//! Page Control Data (C5): the flat, physical-page-indexed array of per-page type tags the
//! monitor consults before honoring any request that would change a mapping.
//!
//! Grounded in the teacher's `PageTableEntryFlags`-as-`bitflags` idiom for the type tag itself,
//! and in its `InterruptTicketMutex`-guarded global state pattern (e.g. the teacher's core-local
//! scheduler storage) for the array's concurrency story: every PCD lookup or transition takes
//! the same lock, so two CPUs never observe or create a torn classification.

use hermit_sync::InterruptTicketMutex;

use crate::error::{NkError, Result};
use crate::mm::PAGE_SIZE;

/// The four classifications a physical page can carry (§5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    /// Ordinary kernel or user memory. Writable in `unpriv_root`; the monitor makes no claim on
    /// its contents.
    OkNormal,
    /// Monitor-private data (e.g. the PCD array itself). Not mapped through `unpriv_root` at
    /// all.
    NkNormal,
    /// A page-table page belonging to either root. Mapped read-only in `unpriv_root`, writable
    /// only through `monitor_root` (I1, I5).
    NkPgTable,
    /// Memory-mapped I/O the monitor reserves for itself.
    NkIo,
}

impl PageType {
    /// Whether `unpriv_root` is allowed to hold a writable mapping to a page of this type.
    pub fn unpriv_writable(self) -> bool {
        matches!(self, PageType::OkNormal)
    }

    /// Whether `unpriv_root` may map this page at all.
    pub fn unpriv_visible(self) -> bool {
        !matches!(self, PageType::NkNormal | PageType::NkIo)
    }
}

struct State {
    /// One entry per physical page number in `[0, page_count)`.
    types: alloc::vec::Vec<PageType>,
}

/// The monitor's classification of every physical page it has been told about.
pub struct PageControlData {
    state: InterruptTicketMutex<State>,
    base_phys: u64,
    page_count: usize,
}

impl PageControlData {
    /// Creates a PCD covering `page_count` pages starting at `base_phys`, all initially
    /// classified [`PageType::OkNormal`].
    pub fn new(base_phys: u64, page_count: usize) -> Self {
        Self {
            state: InterruptTicketMutex::new(State {
                types: alloc::vec![PageType::OkNormal; page_count],
            }),
            base_phys,
            page_count,
        }
    }

    fn index_of(&self, phys: u64) -> Result<usize> {
        if phys < self.base_phys {
            return Err(NkError::BadArgument("physical address below PCD range"));
        }
        let index = ((phys - self.base_phys) / PAGE_SIZE) as usize;
        if index >= self.page_count {
            return Err(NkError::BadArgument("physical address above PCD range"));
        }
        Ok(index)
    }

    pub fn get(&self, phys: u64) -> Result<PageType> {
        let index = self.index_of(phys)?;
        Ok(self.state.lock().types[index])
    }

    pub fn set(&self, phys: u64, page_type: PageType) -> Result<()> {
        let index = self.index_of(phys)?;
        self.state.lock().types[index] = page_type;
        Ok(())
    }

    pub fn page_count(&self) -> usize {
        self.page_count
    }

    /// Whether `phys` falls within this PCD's covered range at all, without allocating.
    pub fn covers(&self, phys: u64) -> bool {
        self.index_of(phys).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_pages_start_ok_normal() {
        let pcd = PageControlData::new(0x1000, 4);
        for i in 0..4 {
            assert_eq!(pcd.get(0x1000 + i * PAGE_SIZE).unwrap(), PageType::OkNormal);
        }
    }

    #[test]
    fn set_then_get_round_trips_per_page() {
        let pcd = PageControlData::new(0x1000, 4);
        pcd.set(0x1000 + 2 * PAGE_SIZE, PageType::NkPgTable).unwrap();
        assert_eq!(pcd.get(0x1000).unwrap(), PageType::OkNormal);
        assert_eq!(
            pcd.get(0x1000 + 2 * PAGE_SIZE).unwrap(),
            PageType::NkPgTable
        );
    }

    #[test]
    fn out_of_range_addresses_are_rejected() {
        let pcd = PageControlData::new(0x1000, 2);
        assert!(pcd.get(0x0).is_err());
        assert!(pcd.get(0x1000 + 2 * PAGE_SIZE).is_err());
    }

    #[test]
    fn page_type_visibility_rules_match_the_classification_table() {
        assert!(PageType::OkNormal.unpriv_writable());
        assert!(PageType::OkNormal.unpriv_visible());
        assert!(!PageType::NkPgTable.unpriv_writable());
        assert!(PageType::NkPgTable.unpriv_visible());
        assert!(!PageType::NkNormal.unpriv_visible());
        assert!(!PageType::NkIo.unpriv_visible());
    }
}
