//! Global Descriptor Table (ambient stack, NEW): flat kernel code/data segments plus a
//! Task State Segment carrying the per-CPU double-fault stack.
//!
//! Grounded in the teacher's `gdt.rs` for the overall shape (null/code/data/TSS layout, one TSS
//! per CPU) but built on the `x86_64` crate's `GlobalDescriptorTable`/`TaskStateSegment` instead
//! of the teacher's hand-rolled descriptor builder over the deprecated `x86` crate (see
//! DESIGN.md for the rationale already baked into this crate's Cargo.toml).

use x86_64::structures::gdt::{Descriptor, GlobalDescriptorTable, SegmentSelector};
use x86_64::structures::tss::TaskStateSegment;
use x86_64::VirtAddr;

/// IST slot the double-fault handler runs on, so a stack overflow in normal kernel code doesn't
/// also fault the double-fault handler itself.
pub const DOUBLE_FAULT_IST_INDEX: u16 = 0;

struct Selectors {
    code: SegmentSelector,
    data: SegmentSelector,
    tss: SegmentSelector,
}

/// Per-CPU GDT + TSS pair. Built once per CPU and leaked for `'static` lifetime, matching how
/// the teacher leaks a boxed TSS per core rather than storing it inline in a fixed-size array.
struct CpuTables {
    gdt: GlobalDescriptorTable,
    selectors: Selectors,
}

/// Builds this CPU's GDT and TSS, with IST[`DOUBLE_FAULT_IST_INDEX`] pointed at
/// `double_fault_stack_top`, and loads it. Must run once per CPU, before the IDT is loaded.
///
/// # Safety
/// Must be called with interrupts disabled and before any code depends on the previous (boot)
/// GDT remaining valid — reloading segment registers invalidates stale selectors.
#[cfg(not(test))]
pub unsafe fn init(double_fault_stack_top: u64) {
    use x86_64::instructions::segmentation::{Segment, CS, DS, ES, SS};
    use x86_64::instructions::tables::load_tss;

    let mut tss = TaskStateSegment::new();
    tss.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] =
        VirtAddr::new(double_fault_stack_top);
    let tss: &'static TaskStateSegment = alloc::boxed::Box::leak(alloc::boxed::Box::new(tss));

    let mut gdt = GlobalDescriptorTable::new();
    let code = gdt.append(Descriptor::kernel_code_segment());
    let data = gdt.append(Descriptor::kernel_data_segment());
    let tss_sel = gdt.append(Descriptor::tss_segment(tss));
    let tables = CpuTables {
        gdt,
        selectors: Selectors {
            code,
            data,
            tss: tss_sel,
        },
    };
    let tables: &'static CpuTables = alloc::boxed::Box::leak(alloc::boxed::Box::new(tables));

    tables.gdt.load();
    unsafe {
        CS::set_reg(tables.selectors.code);
        DS::set_reg(tables.selectors.data);
        ES::set_reg(tables.selectors.data);
        SS::set_reg(tables.selectors.data);
        load_tss(tables.selectors.tss);
    }
}

/// Host-test stand-in: constructs the same data without touching any segment register or the
/// GDTR, which would fault outside ring 0.
#[cfg(test)]
pub unsafe fn init(double_fault_stack_top: u64) {
    let mut tss = TaskStateSegment::new();
    tss.interrupt_stack_table[DOUBLE_FAULT_IST_INDEX as usize] =
        VirtAddr::new(double_fault_stack_top);
    let tss: &'static TaskStateSegment = alloc::boxed::Box::leak(alloc::boxed::Box::new(tss));

    let mut gdt = GlobalDescriptorTable::new();
    let _code = gdt.append(Descriptor::kernel_code_segment());
    let _data = gdt.append(Descriptor::kernel_data_segment());
    let _tss = gdt.append(Descriptor::tss_segment(tss));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn building_per_cpu_tables_does_not_panic() {
        unsafe { init(0x7000_0000) };
    }
}
