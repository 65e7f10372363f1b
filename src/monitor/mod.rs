//! Nested-kernel monitor (C5): dual page-table views, Page Control Data, and the single
//! controlled entry point that may ever touch `CR3`.
//!
//! The largest module in the crate, grounded throughout in `hermit-os-kernel`'s paging and
//! memory-management idiom (see [`paging`]) but implementing a design that file's teacher never
//! had: two coexisting page-table hierarchies instead of one, with the unprivileged one
//! structurally unable to remap its own page-table pages.

pub mod paging;
pub mod pcd;
pub mod trampoline;

use hermit_sync::InterruptTicketMutex;

use paging::{Level, PageTable, PageTableEntry, PageTableEntryFlags, PageTableView};
use pcd::{PageControlData, PageType};

use crate::error::{NkError, Result};
use crate::mm::{MemoryService, PAGE_SIZE};

/// A privileged operation the monitor will perform on the caller's behalf, exactly as dispatched
/// by the entry trampoline (§4.5).
#[derive(Debug, Clone, Copy)]
pub enum MonitorOp {
    AllocPhys { order: u32 },
    FreePhys { addr: u64, order: u32 },
    GetPageType { addr: u64 },
    /// Monitor-internal only: `dispatch` rejects this from outer callers (see [`Monitor::dispatch`]).
    SetPageType { addr: u64, page_type: PageType },
    MapPage { phys: u64, virt: u64, flags: PageTableEntryFlags },
    UnmapPage { virt: u64 },
    AllocPgTable { order: u32 },
}

/// Result of a dispatched [`MonitorOp`].
#[derive(Debug, Clone, Copy)]
pub enum MonitorResult {
    Addr(u64),
    PageType(PageType),
    Unit,
}

/// Per-invariant outcome of [`Monitor::verify_invariants`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvariantReport {
    pub i1_ptps_read_only: bool,
    pub i3_views_agree_except_ptps: bool,
    pub i6_cr3_is_a_known_root: bool,
}

impl InvariantReport {
    pub fn all_pass(self) -> bool {
        self.i1_ptps_read_only && self.i3_views_agree_except_ptps && self.i6_cr3_is_a_known_root
    }
}

/// Fixed virtual base of the read-only window mapping every `NK_NORMAL`/`NK_PGTABLE` page, so the
/// outer kernel can inspect monitor state without being able to mutate it.
pub const RO_WINDOW_BASE: u64 = 0xFFFF_FF00_0000_0000;

/// Owns the two page-table views and the PCD; the only type whose methods may install, remove,
/// or reclassify a mapping.
pub struct Monitor<'a> {
    monitor_root: PageTableView,
    unpriv_root: PageTableView,
    pcd: PageControlData,
    pcd_base: u64,
    mem: &'a (dyn MemoryService + Sync),
}

impl<'a> Monitor<'a> {
    /// Builds both page-table hierarchies from `boot_root` (the page tables the kernel booted
    /// with) and the PCD covering `[pcd_base, pcd_base + pcd_pages * PAGE_SIZE)`. Implements
    /// §4.5's seven-step construction sequence, steps 4 (`CR0.WP`) and 7 (`INVLPG`) aside — both
    /// are pure hardware side effects with no portable equivalent and are performed by the
    /// caller immediately after `init` returns, guarded by `#[cfg(not(test))]` the same way the
    /// rest of this crate keeps hardware-only steps out of host-tested logic.
    pub fn init(
        boot_root: u64,
        pcd_base: u64,
        pcd_pages: usize,
        mem: &'a (dyn MemoryService + Sync),
    ) -> Result<Self> {
        let monitor_pml4 = crate::mm::alloc_or_err(mem, 0)?;
        let unpriv_pml4 = crate::mm::alloc_or_err(mem, 0)?;
        unsafe {
            zero_page(monitor_pml4);
            zero_page(unpriv_pml4);
        }

        let pcd = PageControlData::new(pcd_base, pcd_pages);
        pcd.set(monitor_pml4, PageType::NkPgTable)?;
        pcd.set(unpriv_pml4, PageType::NkPgTable)?;

        let monitor_root = PageTableView::new(monitor_pml4);
        let unpriv_root = PageTableView::new(unpriv_pml4);

        // Each view gets its own physical page-table pages all the way down, not just its own
        // PML4: `protect_unpriv_view` below clears the writable bit on `unpriv_root`'s copy of
        // every page-table page, and that must not also clear it in `monitor_root`'s copy (I3,
        // I5). Every subtable page this allocates is marked `NkPgTable` as it's created, so
        // `pcd_pgtable_pages` sees the complete set from both hierarchies, not just the two PML4s.
        copy_boot_mappings(boot_root, monitor_root.root(), mem, &pcd)?;
        copy_boot_mappings(boot_root, unpriv_root.root(), mem, &pcd)?;

        let monitor = Self {
            monitor_root,
            unpriv_root,
            pcd,
            pcd_base,
            mem,
        };

        monitor.protect_unpriv_view()?;

        Ok(monitor)
    }

    /// Step 3 of construction: for every PTE in `unpriv_root` whose target is itself a PTP,
    /// split any huge mapping covering it and clear the writable bit (I1, I5).
    fn protect_unpriv_view(&self) -> Result<()> {
        for phys in self.pcd_pgtable_pages() {
            let virt = phys; // identity-mapped low memory
            self.unpriv_root.clear_writable_at(virt);
        }
        Ok(())
    }

    fn pcd_pgtable_pages(&self) -> alloc::vec::Vec<u64> {
        let mut out = alloc::vec::Vec::new();
        let mut phys = self.pcd_base;
        for _ in 0..self.pcd.page_count() {
            if matches!(self.pcd.get(phys), Ok(PageType::NkPgTable)) {
                out.push(phys);
            }
            phys += PAGE_SIZE;
        }
        out
    }

    pub fn monitor_root(&self) -> u64 {
        self.monitor_root.root()
    }

    pub fn unpriv_root(&self) -> u64 {
        self.unpriv_root.root()
    }

    /// Executes one [`MonitorOp`]. `from_outer` must be `true` for every call that crossed the
    /// trampoline from unprivileged code; only monitor-internal callers may pass `false`, which
    /// is the only way [`MonitorOp::SetPageType`] is accepted.
    pub fn dispatch(&self, op: MonitorOp, from_outer: bool) -> Result<MonitorResult> {
        match op {
            MonitorOp::AllocPhys { order } => {
                let addr = crate::mm::alloc_or_err(self.mem, order)?;
                self.pcd.set(addr, PageType::OkNormal)?;
                Ok(MonitorResult::Addr(addr))
            }
            MonitorOp::FreePhys { addr, order } => {
                self.mem.free(addr, order);
                Ok(MonitorResult::Unit)
            }
            MonitorOp::GetPageType { addr } => {
                Ok(MonitorResult::PageType(self.pcd.get(addr)?))
            }
            MonitorOp::SetPageType { addr, page_type } => {
                if from_outer {
                    return Err(NkError::BadArgument(
                        "SetPageType is monitor-internal; outer callers cannot invoke it",
                    ));
                }
                self.pcd.set(addr, page_type)?;
                Ok(MonitorResult::Unit)
            }
            MonitorOp::MapPage { phys, virt, flags } => {
                self.map_page(phys, virt, flags)?;
                Ok(MonitorResult::Unit)
            }
            MonitorOp::UnmapPage { virt } => {
                self.unpriv_root.clear_writable_at(virt);
                self.monitor_root.clear_writable_at(virt);
                Ok(MonitorResult::Unit)
            }
            MonitorOp::AllocPgTable { order } => {
                let addr = crate::mm::alloc_or_err(self.mem, order)?;
                self.pcd.set(addr, PageType::NkPgTable)?;
                Ok(MonitorResult::Addr(addr))
            }
        }
    }

    /// Applies the MapPage policy of §4.5: the requested flags are adjusted (or rejected)
    /// according to the target page's PCD classification before the mapping is installed in
    /// both views.
    fn map_page(&self, phys: u64, virt: u64, flags: PageTableEntryFlags) -> Result<()> {
        let page_type = self.pcd.get(phys)?;
        let effective_flags = match page_type {
            PageType::OkNormal => flags,
            PageType::NkNormal | PageType::NkPgTable => {
                if flags.contains(PageTableEntryFlags::WRITABLE) {
                    return Err(NkError::ProtectionFault { addr: virt });
                }
                flags & !PageTableEntryFlags::WRITABLE
            }
            PageType::NkIo => flags,
        };

        let mut alloc_table = || crate::mm::alloc_or_err(self.mem, 0).ok();
        self.monitor_root
            .map_4k(virt, phys, effective_flags, &mut alloc_table)
            .map_err(|_| NkError::OutOfMemory)?;

        if page_type.unpriv_visible() {
            let unpriv_flags = if page_type.unpriv_writable() {
                effective_flags
            } else {
                effective_flags & !PageTableEntryFlags::WRITABLE
            };
            let mut alloc_table = || crate::mm::alloc_or_err(self.mem, 0).ok();
            self.unpriv_root
                .map_4k(virt, phys, unpriv_flags, &mut alloc_table)
                .map_err(|_| NkError::OutOfMemory)?;
        }

        Ok(())
    }

    /// Checks I1, I3, and I6 against the current state. I2 (`CR0.WP`) and I4 (trampoline is the
    /// sole entry) are hardware/control-flow properties this crate enforces by construction
    /// rather than by runtime check, so they are not part of this report.
    pub fn verify_invariants(&self, current_cr3: u64) -> InvariantReport {
        let i1 = self
            .pcd_pgtable_pages()
            .iter()
            .all(|&phys| match self.unpriv_root.walk(phys) {
                Some(entry) => !entry.is_writable(),
                None => true,
            });

        let i3 = self.pcd_pgtable_pages().iter().all(|&phys| {
            let monitor_entry = self.monitor_root.walk(phys);
            let unpriv_entry = self.unpriv_root.walk(phys);
            match (monitor_entry, unpriv_entry) {
                (Some(m), Some(u)) => m.address() == u.address() && m.is_writable() && !u.is_writable(),
                (None, None) => true,
                _ => false,
            }
        });

        let i6 = current_cr3 == self.monitor_root.root() || current_cr3 == self.unpriv_root.root();

        InvariantReport {
            i1_ptps_read_only: i1,
            i3_views_agree_except_ptps: i3,
            i6_cr3_is_a_known_root: i6,
        }
    }
}

unsafe fn zero_page(phys: u64) {
    unsafe {
        core::ptr::write_bytes(phys as *mut u8, 0, PAGE_SIZE as usize);
    }
}

/// Deep-copies `src_root`'s hierarchy into the already-allocated `dest_root` PML4, giving `dest`
/// its own physical page-table pages at every level a subtable is found rather than sharing
/// `src_root`'s. Leaf entries (4 KiB PT entries, or huge PD/PDPT entries) are copied by value —
/// they describe ordinary memory, which both views are meant to agree on — but every entry that
/// points at a subtable gets a freshly allocated, recursively copied subtable of its own, marked
/// `NkPgTable` in `pcd` as it's created.
fn copy_boot_mappings(
    src_root: u64,
    dest_root: u64,
    mem: &dyn MemoryService,
    pcd: &PageControlData,
) -> Result<()> {
    copy_table(src_root, dest_root, Level::Pml4, mem, pcd)
}

fn copy_table(
    src_phys: u64,
    dest_phys: u64,
    level: Level,
    mem: &dyn MemoryService,
    pcd: &PageControlData,
) -> Result<()> {
    let src = unsafe { &*(src_phys as *const PageTable) };
    let dest = unsafe { &mut *(dest_phys as *mut PageTable) };

    for (index, entry) in src.iter() {
        if !entry.is_present() {
            continue;
        }
        if entry.is_huge() || level == Level::Pt {
            dest.set_entry(index, entry);
            continue;
        }

        let next_level = level.next().expect("Pt has no next level and is handled above");
        let sub_phys = crate::mm::alloc_or_err(mem, 0)?;
        unsafe { zero_page(sub_phys) };
        if pcd.covers(sub_phys) {
            pcd.set(sub_phys, PageType::NkPgTable)?;
        }
        copy_table(entry.address(), sub_phys, next_level, mem, pcd)?;
        dest.set_entry(index, PageTableEntry::new(sub_phys, entry.flags()));
    }
    Ok(())
}

/// The live [`Monitor`] every entry-trampoline call dispatches against, published once by
/// [`install`] during boot. Mirrors [`crate::apic::LOCAL`]'s pattern: a single
/// `InterruptTicketMutex`-guarded slot rather than a per-CPU one, since the monitor itself
/// already serializes every mutating operation through its own locks (the PCD's, and the
/// implicit one-instance-at-a-time the entry trampoline enforces by stack and `CR3` switching).
static MONITOR: InterruptTicketMutex<Option<Monitor<'static>>> = InterruptTicketMutex::new(None);

/// Publishes `monitor` as the instance [`monitor_dispatch_from_trampoline`] dispatches every
/// future entry against. Called once, after construction and invariant verification, and before
/// any CPU can reach the trampoline.
pub fn install(monitor: Monitor<'static>) {
    *MONITOR.lock() = Some(monitor);
}

/// Decodes a [`MonitorOp`] from the trampoline's wire registers: `op_code` in `rdi`, up to three
/// `u64` operands in `rsi`/`rdx`/`rcx`. `SetPageType` has no outer encoding — it is
/// monitor-internal only (see [`Monitor::dispatch`]) and is never reachable from the trampoline.
fn decode_op(op_code: u64, a0: u64, a1: u64, a2: u64) -> Option<MonitorOp> {
    match op_code {
        0 => Some(MonitorOp::AllocPhys { order: a0 as u32 }),
        1 => Some(MonitorOp::FreePhys { addr: a0, order: a1 as u32 }),
        2 => Some(MonitorOp::GetPageType { addr: a0 }),
        3 => Some(MonitorOp::MapPage {
            phys: a0,
            virt: a1,
            flags: PageTableEntryFlags::from_bits_truncate(a2),
        }),
        4 => Some(MonitorOp::UnmapPage { virt: a0 }),
        5 => Some(MonitorOp::AllocPgTable { order: a0 as u32 }),
        _ => None,
    }
}

/// Sentinel `monitor_dispatch_from_trampoline` returns on any failure (bad opcode, no installed
/// `Monitor`, or a failed [`Monitor::dispatch`]) — outer callers treat any other value as the
/// operation's successful result, encoded per [`MonitorResult`].
const DISPATCH_FAILURE: u64 = u64::MAX;

/// Entry point the trampoline's assembly calls after the `CR3`/stack switch, with the operation
/// already decoded into registers by the caller (`rdi`/`rsi`/`rdx`/`rcx` on entry, matching the
/// SysV `extern "C"` convention this function's signature asks for). Kept as a free function
/// with a stable ABI name so [`trampoline`]'s `global_asm!` can reference it directly.
#[cfg_attr(not(test), unsafe(no_mangle))]
extern "C" fn monitor_dispatch_from_trampoline(op_code: u64, a0: u64, a1: u64, a2: u64) -> u64 {
    let Some(op) = decode_op(op_code, a0, a1, a2) else {
        return DISPATCH_FAILURE;
    };
    let guard = MONITOR.lock();
    let Some(monitor) = guard.as_ref() else {
        return DISPATCH_FAILURE;
    };
    match monitor.dispatch(op, true) {
        Ok(MonitorResult::Addr(addr)) => addr,
        Ok(MonitorResult::PageType(page_type)) => page_type as u64,
        Ok(MonitorResult::Unit) => 0,
        Err(_) => DISPATCH_FAILURE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::boxed::Box;

    struct HeapMemoryService;

    impl MemoryService for HeapMemoryService {
        fn alloc(&self, order: u32) -> Option<u64> {
            let pages = 1usize << order;
            let layout = core::alloc::Layout::from_size_align(pages * PAGE_SIZE as usize, PAGE_SIZE as usize).ok()?;
            let ptr = unsafe { alloc::alloc::alloc_zeroed(layout) };
            if ptr.is_null() {
                None
            } else {
                Some(ptr as u64)
            }
        }
        fn free(&self, _addr: u64, _order: u32) {}
        fn total_pages(&self) -> usize {
            4096
        }
        fn free_pages(&self) -> usize {
            4096
        }
    }

    /// A minimal but architecturally real two-level chain: `PML4[0]` points at a heap-allocated
    /// PDPT whose own entry 0 is a 1 GiB huge mapping to `0x2000`. Using a huge leaf at the PDPT
    /// level (rather than a bare non-table address stored directly in the PML4 entry) means a
    /// `walk()` over this fixture dereferences only pages this function itself allocated.
    fn boot_root_with_one_mapping() -> u64 {
        let pml4 = Box::into_raw(Box::new(paging::PageTable::zeroed())) as u64;
        let pdpt = Box::into_raw(Box::new(paging::PageTable::zeroed())) as u64;

        let pml4_table = unsafe { &mut *(pml4 as *mut paging::PageTable) };
        pml4_table.set_entry(
            0,
            paging::PageTableEntry::new(pdpt, PageTableEntryFlags::PRESENT | PageTableEntryFlags::WRITABLE),
        );

        let pdpt_table = unsafe { &mut *(pdpt as *mut paging::PageTable) };
        pdpt_table.set_entry(
            0,
            paging::PageTableEntry::new(
                0x2000,
                PageTableEntryFlags::PRESENT | PageTableEntryFlags::WRITABLE | PageTableEntryFlags::HUGE_PAGE,
            ),
        );

        pml4
    }

    #[test]
    fn init_copies_boot_mappings_into_both_roots() {
        let mem = HeapMemoryService;
        let boot_root = boot_root_with_one_mapping();
        let pcd_region = mem.alloc(2).unwrap(); // 4 pages of PCD storage
        let monitor = Monitor::init(boot_root, pcd_region, 16, &mem).unwrap();

        assert_eq!(
            monitor.monitor_root.walk(0).map(|e| e.address()),
            Some(0x2000)
        );
        assert_eq!(
            monitor.unpriv_root.walk(0).map(|e| e.address()),
            Some(0x2000)
        );
    }

    #[test]
    fn map_page_rejects_writable_request_on_nk_pgtable() {
        let mem = HeapMemoryService;
        let boot_root = boot_root_with_one_mapping();
        let pcd_region = mem.alloc(2).unwrap();
        let monitor = Monitor::init(boot_root, pcd_region, 16, &mem).unwrap();

        let pgtable_phys = monitor.monitor_root();
        monitor.pcd.set(pgtable_phys, PageType::NkPgTable).unwrap();

        let result = monitor.dispatch(
            MonitorOp::MapPage {
                phys: pgtable_phys,
                virt: 0x5_0000,
                flags: PageTableEntryFlags::PRESENT | PageTableEntryFlags::WRITABLE,
            },
            true,
        );
        assert!(matches!(result, Err(NkError::ProtectionFault { .. })));
    }

    #[test]
    fn set_page_type_is_rejected_from_outer_callers() {
        let mem = HeapMemoryService;
        let boot_root = boot_root_with_one_mapping();
        let pcd_region = mem.alloc(2).unwrap();
        let monitor = Monitor::init(boot_root, pcd_region, 16, &mem).unwrap();

        let result = monitor.dispatch(
            MonitorOp::SetPageType {
                addr: pcd_region,
                page_type: PageType::NkIo,
            },
            true,
        );
        assert!(result.is_err());

        let result = monitor.dispatch(
            MonitorOp::SetPageType {
                addr: pcd_region,
                page_type: PageType::NkIo,
            },
            false,
        );
        assert!(result.is_ok());
    }

    #[test]
    fn verify_invariants_passes_on_a_freshly_constructed_monitor() {
        let mem = HeapMemoryService;
        let boot_root = boot_root_with_one_mapping();
        let pcd_region = mem.alloc(2).unwrap();
        let monitor = Monitor::init(boot_root, pcd_region, 16, &mem).unwrap();

        let report = monitor.verify_invariants(monitor.monitor_root());
        assert!(report.i1_ptps_read_only);
        assert!(report.i3_views_agree_except_ptps);
        assert!(report.i6_cr3_is_a_known_root);
    }

    /// Exercises the bug the shallow, by-value PML4-only copy used to have: `monitor_root` and
    /// `unpriv_root` must end up with their own physical page-table pages at every level below the
    /// PML4, so that flipping the writable bit through one view's copy of a page-table page never
    /// reaches through to the other view's copy of the same page.
    #[test]
    fn copy_boot_mappings_gives_each_view_independent_page_table_pages() {
        let mem = HeapMemoryService;
        let boot_root = boot_root_with_one_mapping();
        let pcd_region = mem.alloc(2).unwrap();
        let pcd = PageControlData::new(pcd_region, 16);

        let monitor_pml4 = mem.alloc(0).unwrap();
        let unpriv_pml4 = mem.alloc(0).unwrap();

        copy_boot_mappings(boot_root, monitor_pml4, &mem, &pcd).unwrap();
        copy_boot_mappings(boot_root, unpriv_pml4, &mem, &pcd).unwrap();

        let monitor_entry0 = unsafe { &*(monitor_pml4 as *const paging::PageTable) }.entry(0);
        let unpriv_entry0 = unsafe { &*(unpriv_pml4 as *const paging::PageTable) }.entry(0);
        assert_ne!(
            monitor_entry0.address(),
            unpriv_entry0.address(),
            "each view must get its own copy of the PDPT below the PML4, not share boot_root's"
        );

        let monitor_view = PageTableView::new(monitor_pml4);
        let unpriv_view = PageTableView::new(unpriv_pml4);

        assert!(unpriv_view.clear_writable_at(0));
        assert!(monitor_view.walk(0).unwrap().is_writable());
        assert!(!unpriv_view.walk(0).unwrap().is_writable());
    }

    #[test]
    fn alloc_phys_marks_the_new_page_ok_normal() {
        let mem = HeapMemoryService;
        let boot_root = boot_root_with_one_mapping();
        let pcd_region = mem.alloc(2).unwrap();
        let monitor = Monitor::init(boot_root, pcd_region, 16, &mem).unwrap();

        let result = monitor.dispatch(MonitorOp::AllocPhys { order: 0 }, true).unwrap();
        let MonitorResult::Addr(addr) = result else {
            panic!("expected Addr")
        };
        assert_eq!(monitor.pcd.get(addr).unwrap(), PageType::OkNormal);
    }
}
