//! SMP bring-up, a Local APIC/IPI driver, a spin-lock family with a multi-phase correctness
//! harness, and a nested-kernel monitor enforcing dual page-table views, for a bare-metal
//! x86-64 kernel.
//!
//! Module-to-subsystem map:
//! - [`smp`] — bootstrap coordinator: the `CpuRecord` table and AP bring-up sequencing.
//! - [`apic`] — Local APIC driver and IPI protocol.
//! - [`synch`] — the spinlock/rwlock family and the multi-phase lock-correctness harness.
//! - [`monitor`] — the nested-kernel monitor: dual page-table views, Page Control Data, and the
//!   entry trampoline.
//! - [`mm`], [`acpi`], [`gdt`], [`idt`], [`irq`], [`logging`], [`serial`], [`shutdown`],
//!   [`error`], [`config`] — the ambient stack the subsystems above are built on.

#![no_std]
#![cfg_attr(target_arch = "x86_64", feature(abi_x86_interrupt))]
#![warn(rust_2018_idioms)]
#![allow(clippy::missing_safety_doc)]

extern crate alloc;
#[cfg(test)]
extern crate std;

#[macro_use]
pub mod macros;

pub mod acpi;
pub mod apic;
pub mod config;
pub mod error;
pub mod gdt;
pub mod idt;
pub mod irq;
pub mod logging;
pub mod mm;
pub mod monitor;
pub mod serial;
pub mod shutdown;
pub mod smp;
pub mod synch;

use alloc::boxed::Box;
use alloc::vec;

use apic::LocalApic;
use config::MONITOR_STACK_SIZE;
use mm::bump::BumpMemoryService;
use monitor::Monitor;
use shutdown::ExitCode;
use synch::harness::TestHarnessState;
use synch::runner::HarnessLocks;

/// Physical region this build's bump allocator draws from for boot-time page tables, per-CPU
/// stacks, and the Page Control Data array. A real boot loader would report usable regions from
/// its own memory map (e820, UEFI, multiboot2) instead of this fixed window; that integration is
/// out of scope here (§1), so this crate assumes the whole window is free and identity-mapped.
const HEAP_REGION_START: u64 = 0x0100_0000;
const HEAP_REGION_LEN: u64 = 0x0100_0000;

/// State every CPU running the lock-correctness harness shares. `'static` because the BSP and
/// every AP reach it from their own independent call stacks.
static HARNESS_STATE: TestHarnessState = TestHarnessState::new();
static HARNESS_LOCKS: HarnessLocks = HarnessLocks::new();

/// Leaks a freshly allocated, zeroed stack and returns the address one past its end (the top, for
/// a downward-growing stack).
fn leak_stack(size: usize) -> u64 {
    let stack: &'static mut [u8] = Box::leak(vec![0u8; size].into_boxed_slice());
    stack.as_ptr() as u64 + stack.len() as u64
}

/// Brings up this CPU's GDT/TSS and IDT, backed by a freshly allocated double-fault stack.
///
/// # Safety
/// Must run once per CPU, with interrupts disabled and before any code depends on the boot-time
/// GDT remaining valid.
unsafe fn init_descriptor_tables() {
    let double_fault_stack_top = leak_stack(MONITOR_STACK_SIZE);
    unsafe {
        gdt::init(double_fault_stack_top);
        idt::init();
    }
}

/// Constructs and software-enables this CPU's local APIC driver.
fn init_local_apic() -> LocalApic {
    let apic = LocalApic::new();
    apic.enable();
    apic
}

#[cfg(feature = "acpi")]
fn discover_apic_ids(this_apic_id: u8) -> alloc::vec::Vec<u8> {
    acpi::get_apic_ids().unwrap_or_else(|_| alloc::vec![this_apic_id])
}

/// Without ACPI support compiled in, every boot is treated as single-CPU.
#[cfg(not(feature = "acpi"))]
fn discover_apic_ids(this_apic_id: u8) -> alloc::vec::Vec<u8> {
    alloc::vec![this_apic_id]
}

#[cfg(not(test))]
fn current_boot_root() -> u64 {
    use x86_64::registers::control::Cr3;
    Cr3::read().0.start_address().as_u64()
}

/// Host builds never actually run [`boot_processor_main`]/[`application_processor_main`] (both
/// diverge, so no test can call them); this stand-in exists only so the crate type-checks with
/// `--cfg test` linked against `std` rather than the bare-metal target.
#[cfg(test)]
fn current_boot_root() -> u64 {
    0
}

/// Entry point for the boot processor. Never returns: once the lock-correctness harness has run
/// to completion (or a fatal condition is hit along the way), this reports the outcome through
/// [`shutdown::shutdown`].
///
/// # Safety
/// Must be the first kernel-level code to run on the boot processor, with a valid stack and
/// identity-mapped low memory already in place — the environment every boot-time page-table walk
/// and the bump allocator in this function both assume.
pub unsafe fn boot_processor_main() -> ! {
    unsafe {
        logging::init(log::LevelFilter::Info);
        init_descriptor_tables();
    }
    log::info!("nested-kernel boot processor starting");

    let apic = init_local_apic();
    let this_apic_id = apic.id();

    let apic_ids = discover_apic_ids(this_apic_id);
    smp::init(&apic_ids);
    let cpu_count = smp::cpu_count();
    log::info!("managing {cpu_count} logical processor(s)");

    #[cfg(feature = "smp")]
    if cpu_count > 1 {
        unsafe {
            smp::trampoline::patch(
                config::TRAMPOLINE_ADDRESS as *mut u8,
                current_boot_root(),
                smp::ap_entry as u64,
                (config::TRAMPOLINE_ADDRESS + config::TRAMPOLINE_OFFSET_GDT32_TABLE as u64) as u32,
                (config::TRAMPOLINE_ADDRESS + config::TRAMPOLINE_OFFSET_GDT64_TABLE as u64) as u32,
            );
        }
        smp::start_all_aps(&apic);
    }

    apic::install_local(apic);

    if smp::wait_for_all().is_err() {
        log::warn!("not every discovered processor reached Ready before the wait budget ran out");
    }

    // Leaked so the constructed `Monitor` below can outlive this function and be published
    // through `monitor::install` for the entry trampoline to dispatch against.
    let mem: &'static BumpMemoryService =
        Box::leak(Box::new(BumpMemoryService::new(HEAP_REGION_START, HEAP_REGION_LEN)));
    let pcd_pages = (HEAP_REGION_LEN / mm::PAGE_SIZE) as usize;
    let monitor = match Monitor::init(current_boot_root(), HEAP_REGION_START, pcd_pages, mem) {
        Ok(monitor) => monitor,
        Err(err) => {
            log::error!("monitor construction failed: {err}");
            shutdown::shutdown(ExitCode::Failure);
        }
    };

    let report = monitor.verify_invariants(monitor.monitor_root());
    if !report.all_pass() {
        log::error!("nested-kernel invariants failed on construction: {report:?}");
        shutdown::shutdown(ExitCode::Failure);
    }

    monitor::trampoline::set_roots(monitor.monitor_root(), monitor.unpriv_root());
    for index in 0..cpu_count {
        monitor::trampoline::set_monitor_stack(index, leak_stack(MONITOR_STACK_SIZE));
    }
    monitor::install(monitor);

    let failures = match synch::runner::run_bsp(&HARNESS_STATE, &HARNESS_LOCKS, cpu_count as u32) {
        Ok(failures) => failures,
        Err(err) => {
            log::error!("test harness coordination failed: {err}");
            shutdown::shutdown(ExitCode::Failure);
        }
    };

    if failures == 0 {
        log::info!("all lock-correctness tests passed");
        shutdown::shutdown(ExitCode::Success);
    } else {
        log::error!("{failures} lock-correctness test(s) failed");
        shutdown::shutdown(ExitCode::Failure);
    }
}

/// Entry point for an application processor, reached from [`smp::ap_entry`] once this CPU has
/// claimed its `cpu_index` and marked itself ready. Never returns.
fn application_processor_main(cpu_index: usize) -> ! {
    unsafe {
        init_descriptor_tables();
    }
    log::info!("application processor #{cpu_index} entering kernel code");

    let apic = init_local_apic();
    apic::install_local(apic);

    let cpu_count = smp::cpu_count() as u32;
    if let Err(err) = synch::runner::run_ap(&HARNESS_STATE, &HARNESS_LOCKS, cpu_index, cpu_count) {
        log::error!("processor #{cpu_index} failed to complete the test harness: {err}");
    }

    loop {
        core::hint::spin_loop();
    }
}
