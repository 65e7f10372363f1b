//! Interrupt Descriptor Table (ambient stack, NEW): the fixed CPU exception gates needed to
//! survive a page fault without triple-faulting, plus the timer (vector 32) and IPI (vector 33)
//! gates the APIC driver (C2) depends on.
//!
//! Grounded in the teacher's `idt.rs` for which exceptions get dedicated handling and why
//! (double fault on its own IST stack); built on `x86_64::structures::idt::InterruptDescriptorTable`
//! instead of the teacher's hand-rolled `IdtEntry`, per the same modernization noted in
//! [`crate::gdt`]. The page-fault handler is this crate's actual payload: a write fault against
//! one of the monitor's read-only page-table pages is the mechanism that enforces I1/I5, and is
//! classified here as a nested-kernel protection violation (§4.5 Failure semantics) rather than a
//! generic fault.

use x86_64::structures::idt::{InterruptDescriptorTable, InterruptStackFrame, PageFaultErrorCode};

use crate::gdt::DOUBLE_FAULT_IST_INDEX;
use crate::config::{IPI_VECTOR, TIMER_VECTOR};
use crate::shutdown::{self, ExitCode};

/// Builds and loads the IDT. Must run after [`crate::gdt::init`] so the double-fault gate can
/// reference a valid IST index.
///
/// # Safety
/// Must be called once per CPU, with a valid GDT/TSS already loaded.
#[cfg(not(test))]
pub unsafe fn init() {
    let mut idt = build();
    unsafe {
        idt.double_fault
            .set_handler_fn(double_fault_handler)
            .set_stack_index(DOUBLE_FAULT_IST_INDEX);
    }
    let idt: &'static InterruptDescriptorTable = alloc::boxed::Box::leak(alloc::boxed::Box::new(idt));
    idt.load();
}

/// Host-test stand-in: builds the same table without issuing `lidt`.
#[cfg(test)]
pub unsafe fn init() {
    let _ = build();
}

fn build() -> InterruptDescriptorTable {
    let mut idt = InterruptDescriptorTable::new();
    idt.divide_error.set_handler_fn(fatal_exception);
    idt.invalid_opcode.set_handler_fn(fatal_exception);
    idt.general_protection_fault.set_handler_fn(fatal_exception_with_code);
    idt.page_fault.set_handler_fn(page_fault_handler);
    idt[TIMER_VECTOR as usize].set_handler_fn(timer_handler);
    idt[IPI_VECTOR as usize].set_handler_fn(ipi_handler);
    idt
}

extern "x86-interrupt" fn fatal_exception(frame: InterruptStackFrame) {
    log::error!("unhandled CPU exception: {:#?}", frame);
    shutdown::shutdown(ExitCode::Failure);
}

extern "x86-interrupt" fn fatal_exception_with_code(frame: InterruptStackFrame, error_code: u64) {
    log::error!("unhandled CPU exception (error code {error_code:#x}): {:#?}", frame);
    shutdown::shutdown(ExitCode::Failure);
}

extern "x86-interrupt" fn double_fault_handler(frame: InterruptStackFrame, _error_code: u64) -> ! {
    log::error!("double fault: {:#?}", frame);
    shutdown::shutdown(ExitCode::Failure);
}

/// Classifies a write fault against a monitor-owned, read-only page-table page as a
/// nested-kernel protection violation and initiates shutdown rather than returning — per §4.5,
/// this condition is never recoverable: it means either a monitor bug or a compromised outer
/// kernel attempted to mutate a PTP directly.
extern "x86-interrupt" fn page_fault_handler(frame: InterruptStackFrame, error_code: PageFaultErrorCode) {
    use x86_64::registers::control::Cr2;

    let fault_addr = Cr2::read();
    let is_write = error_code.contains(PageFaultErrorCode::CAUSED_BY_WRITE);
    let is_protection_violation = error_code.contains(PageFaultErrorCode::PROTECTION_VIOLATION);

    if is_write && is_protection_violation {
        log::error!(
            "nested-kernel protection violation: write fault at {:?} ({:#?})",
            fault_addr,
            frame
        );
    } else {
        log::error!("page fault at {:?}: {:?} ({:#?})", fault_addr, error_code, frame);
    }
    shutdown::shutdown(ExitCode::Failure);
}

extern "x86-interrupt" fn timer_handler(_frame: InterruptStackFrame) {
    crate::apic::eoi_current();
}

extern "x86-interrupt" fn ipi_handler(_frame: InterruptStackFrame) {
    crate::apic::eoi_current();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn building_the_table_does_not_panic() {
        let _ = build();
    }
}
