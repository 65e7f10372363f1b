//! Bootstrap coordinator (C1).
//!
//! Owns the [`CpuRecord`] table, the `bsp_init_done` latch, and the `ready_count` barrier; hands
//! the APIC driver (C2) the patched trampoline page and bounded-polls each AP to `Online` before
//! continuing (diagnostic only — a stuck AP does not block the rest of boot). `current_cpu_index`
//! is backed by `IA32_GS_BASE`, the fastest stable-looking mechanism available, matching how
//! `hermit-os-kernel` derives its own per-core index from a segment base; the *contract* this
//! module promises is a stable index, not a stable mechanism.

pub mod trampoline;

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};

use crossbeam_utils::CachePadded;

use crate::apic::LocalApic;
use crate::config::{SMP_MAX_CPUS, TRAMPOLINE_PAGE};
use crate::error::{NkError, Result};

/// Lifecycle states a non-BSP [`CpuRecord`] passes through exactly once, monotonically.
/// `cpu_index == 0` (the BSP) is `Ready` from power-on by convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CpuState {
    Offline = 0,
    Booting = 1,
    Online = 2,
    Ready = 3,
}

impl CpuState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => CpuState::Offline,
            1 => CpuState::Booting,
            2 => CpuState::Online,
            _ => CpuState::Ready,
        }
    }

    /// Whether advancing from `self` to `next` is a legal, forward step of the lifecycle.
    fn can_advance_to(self, next: CpuState) -> bool {
        (self as u8) + 1 == next as u8
    }
}

/// One logical processor's bring-up record.
pub struct CpuRecord {
    apic_id: AtomicU8,
    state: AtomicU8,
    /// Virtual address of the top of this CPU's boot stack; 0 until installed.
    stack_top: core::sync::atomic::AtomicU64,
}

impl CpuRecord {
    const fn new() -> Self {
        Self {
            apic_id: AtomicU8::new(0),
            state: AtomicU8::new(CpuState::Offline as u8),
            stack_top: core::sync::atomic::AtomicU64::new(0),
        }
    }

    pub fn apic_id(&self) -> u8 {
        self.apic_id.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> CpuState {
        CpuState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn stack_top(&self) -> u64 {
        self.stack_top.load(Ordering::Relaxed)
    }

    pub fn set_stack_top(&self, addr: u64) {
        self.stack_top.store(addr, Ordering::Relaxed);
    }

    /// Advances this record's state by exactly one step. Returns
    /// [`NkError::BadArgument`] if `next` is not the immediate successor of the current state —
    /// the invariant every `CpuRecord` must satisfy (§3: "monotonic, exactly once").
    fn transition(&self, next: CpuState) -> Result<()> {
        let current = self.state();
        if !current.can_advance_to(next) {
            return Err(NkError::BadArgument("illegal CpuRecord state transition"));
        }
        self.state.store(next as u8, Ordering::Release);
        Ok(())
    }
}

const NEW_RECORD: CpuRecord = CpuRecord::new();

static CPU_TABLE: [CpuRecord; SMP_MAX_CPUS] = [NEW_RECORD; SMP_MAX_CPUS];

/// Latch the BSP sets once its own half of initialization is done; every AP spins on it before
/// claiming a `cpu_index`.
static BSP_INIT_DONE: AtomicBool = AtomicBool::new(false);

/// Number of CPUs discovered by ACPI (or 1, in a single-CPU boot). Set once by [`init`].
static CPU_COUNT: AtomicU32 = AtomicU32::new(1);

/// Next `cpu_index` an AP will claim; starts at 1 because the BSP owns index 0.
static NEXT_CPU_INDEX: AtomicU32 = AtomicU32::new(1);

/// CPUs that have called [`mark_ready`].
static READY_COUNT: CachePadded<AtomicU32> = CachePadded::new(AtomicU32::new(0));

/// Returns the number of CPUs this boot is managing.
pub fn cpu_count() -> usize {
    CPU_COUNT.load(Ordering::Relaxed) as usize
}

/// Returns the record for `index`, or `None` if out of range.
pub fn cpu_record(index: usize) -> Option<&'static CpuRecord> {
    CPU_TABLE.get(index)
}

/// Populates the `CpuRecord` table from the ACPI-reported APIC id list: `cpu_index = 0` is the
/// BSP, assigned the first id (by convention; the caller is expected to have already confirmed
/// it matches this CPU's own APIC id), the rest `Offline` with the remaining ids in order.
/// `apic_ids.len()` is clamped to [`SMP_MAX_CPUS`].
pub fn init(apic_ids: &[u8]) {
    let count = apic_ids.len().min(SMP_MAX_CPUS).max(1);
    CPU_COUNT.store(count as u32, Ordering::Relaxed);

    CPU_TABLE[0].apic_id.store(apic_ids[0], Ordering::Relaxed);
    CPU_TABLE[0].state.store(CpuState::Ready as u8, Ordering::Relaxed);
    set_gs_base(0);
    READY_COUNT.fetch_add(1, Ordering::SeqCst);

    for (index, record) in CPU_TABLE.iter().enumerate().take(count).skip(1) {
        record
            .apic_id
            .store(apic_ids.get(index).copied().unwrap_or(0), Ordering::Relaxed);
        record.state.store(CpuState::Offline as u8, Ordering::Relaxed);
    }

    BSP_INIT_DONE.store(true, Ordering::Release);
}

/// Sends INIT/STARTUP to every non-BSP processor in the table and bounded-polls each for
/// `Online`. A timed-out AP is left in `Booting` and logged, not treated as fatal: boot proceeds
/// with however many CPUs actually came up ([`NkError::APStartupFailure`] is reported per AP,
/// never returned from here).
pub fn start_all_aps(apic: &LocalApic) {
    const POLL_BUDGET: u64 = 50_000_000;

    for index in 1..cpu_count() {
        let Some(record) = cpu_record(index) else {
            continue;
        };
        if record.transition(CpuState::Booting).is_err() {
            continue;
        }

        let apic_id = record.apic_id();
        match apic.ap_startup(apic_id, TRAMPOLINE_PAGE as u8) {
            Ok(()) => {
                let mut iterations = 0u64;
                loop {
                    if record.state() as u8 >= CpuState::Online as u8 {
                        log::info!("Processor #{index} (APIC id {apic_id}) is online");
                        break;
                    }
                    core::hint::spin_loop();
                    iterations += 1;
                    if iterations > POLL_BUDGET {
                        log::warn!(
                            "Processor #{index} (APIC id {apic_id}) did not come online in time"
                        );
                        break;
                    }
                }
            }
            Err(_) => {
                log::warn!("Processor #{index} (APIC id {apic_id}) failed INIT/STARTUP");
            }
        }
    }
}

/// Called by an AP once it has installed its own stack and is about to run kernel code: advances
/// its record to `Ready` and bumps the shared barrier.
pub fn mark_ready(index: usize) {
    if let Some(record) = cpu_record(index) {
        let _ = record.transition(CpuState::Ready);
    }
    READY_COUNT.fetch_add(1, Ordering::SeqCst);
}

/// Spins until every discovered CPU has called [`mark_ready`] (the BSP did so inside [`init`]).
pub fn wait_for_all() -> Result<()> {
    const WAIT_BUDGET: u64 = 100_000_000;
    let target = cpu_count() as u32;
    let mut iterations = 0u64;
    while READY_COUNT.load(Ordering::SeqCst) < target {
        core::hint::spin_loop();
        iterations += 1;
        if iterations > WAIT_BUDGET {
            return Err(NkError::Timeout);
        }
    }
    Ok(())
}

pub fn ready_count() -> u32 {
    READY_COUNT.load(Ordering::SeqCst)
}

/// Entered by an AP after the real-mode trampoline has placed it in 64-bit long mode (see
/// [`trampoline`]). Waits for [`BSP_INIT_DONE`], claims the next free index, installs its
/// segment-base identity, marks itself ready, then hands off to
/// [`crate::application_processor_main`] for the rest of this CPU's kernel-level bring-up. Never
/// returns.
pub extern "C" fn ap_entry() -> ! {
    while !BSP_INIT_DONE.load(Ordering::Acquire) {
        core::hint::spin_loop();
    }

    match claim_next_cpu_index() {
        Ok(index) => {
            set_gs_base(index as u64);
            if let Some(record) = cpu_record(index) {
                let _ = record.transition(CpuState::Online);
            }
            mark_ready(index);
            crate::application_processor_main(index)
        }
        // Out-of-range index: the AP halts. This is the only fatal path for an AP during boot.
        Err(_) => loop {
            core::hint::spin_loop();
        },
    }
}

/// Atomically claims the next `cpu_index`, bounds-checked against [`cpu_count`].
fn claim_next_cpu_index() -> Result<usize> {
    let index = NEXT_CPU_INDEX.fetch_add(1, Ordering::SeqCst) as usize;
    if index == 0 || index >= cpu_count() {
        return Err(NkError::BadArgument("cpu_index out of range"));
    }
    Ok(index)
}

#[cfg(not(test))]
fn set_gs_base(index: u64) {
    use x86_64::registers::model_specific::Msr;
    const IA32_GS_BASE: u32 = 0xC000_0101;
    let mut msr = Msr::new(IA32_GS_BASE);
    unsafe { msr.write(index) };
}

#[cfg(not(test))]
pub fn current_cpu_index() -> Option<usize> {
    use x86_64::registers::model_specific::Msr;
    const IA32_GS_BASE: u32 = 0xC000_0101;
    let msr = Msr::new(IA32_GS_BASE);
    let raw = unsafe { msr.read() } as usize;
    if raw < cpu_count() {
        Some(raw)
    } else {
        None
    }
}

#[cfg(test)]
static TEST_CURRENT_CPU_INDEX: core::sync::atomic::AtomicU64 = core::sync::atomic::AtomicU64::new(0);

#[cfg(test)]
fn set_gs_base(index: u64) {
    TEST_CURRENT_CPU_INDEX.store(index, Ordering::Relaxed);
}

#[cfg(test)]
pub fn current_cpu_index() -> Option<usize> {
    Some(TEST_CURRENT_CPU_INDEX.load(Ordering::Relaxed) as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_state_transitions_are_single_step_forward() {
        assert!(CpuState::Offline.can_advance_to(CpuState::Booting));
        assert!(CpuState::Booting.can_advance_to(CpuState::Online));
        assert!(CpuState::Online.can_advance_to(CpuState::Ready));
        assert!(!CpuState::Offline.can_advance_to(CpuState::Online));
        assert!(!CpuState::Ready.can_advance_to(CpuState::Offline));
    }

    #[test]
    fn record_transition_rejects_skipped_states() {
        let record = CpuRecord::new();
        assert!(record.transition(CpuState::Online).is_err());
        assert!(record.transition(CpuState::Booting).is_ok());
        assert!(record.transition(CpuState::Booting).is_err());
        assert!(record.transition(CpuState::Online).is_ok());
        assert!(record.transition(CpuState::Ready).is_ok());
    }

    #[test]
    fn bsp_claims_index_zero_and_aps_start_at_one() {
        init(&[0, 1, 2]);
        assert_eq!(cpu_count(), 3);
        assert_eq!(cpu_record(0).unwrap().state(), CpuState::Ready);
        assert_eq!(cpu_record(1).unwrap().state(), CpuState::Offline);
        assert_eq!(claim_next_cpu_index().unwrap(), 1);
        assert_eq!(claim_next_cpu_index().unwrap(), 2);
        assert!(claim_next_cpu_index().is_err());
    }
}
