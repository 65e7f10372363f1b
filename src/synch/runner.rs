//! Test-harness coordinator (C4): drives every CPU through the ten correctness tests of
//! [`crate::synch::harness`] in lockstep.
//!
//! The BSP advances [`TestHarnessState`]'s phase counter through tests 1-7 and 10, with every
//! CPU (BSP included) arriving at the shared barrier before the BSP moves on; tests 8 and 9 use
//! the flag-based done signaling `harness` documents instead, since a barrier reset there could
//! race a CPU still spinning on the prior target.

use core::sync::atomic::Ordering;

use crate::config::HARNESS_CONTENDED_ITERATIONS;
use crate::error::Result;
use crate::synch::harness::{
    test_10_consistent_ordering, test_1_basic_lock_unlock, test_2_trylock_free_vs_held,
    test_3_irqsave_restores_flag, test_4_rwlock_basic, test_5_nested_locks,
    test_6_contended_counter, test_7_trylock_contention, test_8_concurrent_readers,
    test_9_writer_exclusion, TestHarnessState,
};
use crate::synch::rwlock::RwLock;
use crate::synch::spinlock::{Spinlock, SpinlockIrqSave};

/// The lock instances every CPU exercises. One fixed set, shared for the whole suite.
pub struct HarnessLocks {
    pub a: Spinlock<u32>,
    pub b: Spinlock<u32>,
    pub irqsave: SpinlockIrqSave<u32>,
    pub rw: RwLock<u32>,
    pub contended: Spinlock<u32>,
}

impl HarnessLocks {
    pub const fn new() -> Self {
        Self {
            a: Spinlock::new(0),
            b: Spinlock::new(0),
            irqsave: SpinlockIrqSave::new(0),
            rw: RwLock::new(0),
            contended: Spinlock::new(0),
        }
    }
}

impl Default for HarnessLocks {
    fn default() -> Self {
        Self::new()
    }
}

/// BSP-only: drives the suite to completion and returns the number of tests that failed (0 on
/// full success). `cpu_count` must match the number of CPUs calling [`run_ap`] with this same
/// `state`/`locks` pair.
pub fn run_bsp(state: &TestHarnessState, locks: &HarnessLocks, cpu_count: u32) -> Result<u32> {
    bsp_barrier_phase(state, 1, cpu_count, test_1_basic_lock_unlock(&locks.a))?;
    bsp_barrier_phase(state, 2, cpu_count, test_2_trylock_free_vs_held(&locks.a))?;
    bsp_barrier_phase(
        state,
        3,
        cpu_count,
        test_3_irqsave_restores_flag(&locks.irqsave),
    )?;
    bsp_barrier_phase(state, 4, cpu_count, test_4_rwlock_basic(&locks.rw))?;
    bsp_barrier_phase(
        state,
        5,
        cpu_count,
        test_5_nested_locks(&locks.a, &locks.b),
    )?;

    // Phase 6: every CPU performs its own share of contended increments, then the BSP checks the
    // combined total once all have arrived.
    state.bsp_advance_phase(6);
    test_6_contended_counter(state, &locks.contended, 0);
    state.arrive_at_barrier();
    state.wait_for_barrier(cpu_count)?;
    let total: u32 = (0..cpu_count)
        .map(|i| state.test_counter(i as usize).load(Ordering::Acquire))
        .sum();
    state.check(total == cpu_count * HARNESS_CONTENDED_ITERATIONS);

    // Phase 7: the BSP holds `locks.a` for the whole phase; every AP's single `try_lock` must
    // fail while it does.
    state.bsp_advance_phase(7);
    let held = locks.a.lock();
    state.arrive_at_barrier();
    state.wait_for_barrier(cpu_count)?;
    drop(held);
    let all_aps_blocked = (1..cpu_count).all(|i| state.test_counter(i as usize).load(Ordering::Acquire) == 0);
    state.check(all_aps_blocked);

    // Phase 8: concurrent readers. Flag-based done signaling, not a barrier.
    state.reset_done_flags();
    state.bsp_advance_phase(8);
    let bsp_ok = test_8_concurrent_readers(state, &locks.rw, 0);
    state.check(bsp_ok);
    state.wait_all_done(cpu_count as usize)?;

    // Phase 9: writer exclusion. The BSP takes the write lock alone first, then every CPU
    // (BSP included) takes a read lock and signals done.
    state.reset_done_flags();
    state.bsp_advance_phase(9);
    let writer = locks.rw.write();
    let exclusive = locks.rw.raw_counter() == -1;
    state.check(exclusive);
    drop(writer);
    let bsp_ok = test_9_writer_exclusion(state, &locks.rw, 0);
    state.check(bsp_ok);
    state.wait_all_done(cpu_count as usize)?;

    bsp_barrier_phase(
        state,
        10,
        cpu_count,
        test_10_consistent_ordering(&locks.a, &locks.b),
    )?;

    Ok(state.error_count())
}

/// AP-only: participates in every phase [`run_bsp`] drives, for the CPU at `cpu_index`
/// (`1..cpu_count`).
pub fn run_ap(state: &TestHarnessState, locks: &HarnessLocks, cpu_index: usize, cpu_count: u32) -> Result<()> {
    ap_barrier_phase(state, 1, cpu_count)?;
    ap_barrier_phase(state, 2, cpu_count)?;
    ap_barrier_phase(state, 3, cpu_count)?;
    ap_barrier_phase(state, 4, cpu_count)?;
    ap_barrier_phase(state, 5, cpu_count)?;

    state.wait_for_phase(6)?;
    test_6_contended_counter(state, &locks.contended, cpu_index);
    state.arrive_at_barrier();
    state.wait_for_barrier(cpu_count)?;

    state.wait_for_phase(7)?;
    test_7_trylock_contention(state, &locks.a, cpu_index);
    state.arrive_at_barrier();
    state.wait_for_barrier(cpu_count)?;

    state.wait_for_phase(8)?;
    test_8_concurrent_readers(state, &locks.rw, cpu_index);

    state.wait_for_phase(9)?;
    test_9_writer_exclusion(state, &locks.rw, cpu_index);

    ap_barrier_phase(state, 10, cpu_count)?;
    Ok(())
}

fn bsp_barrier_phase(state: &TestHarnessState, phase: u32, cpu_count: u32, outcome: bool) -> Result<()> {
    state.bsp_advance_phase(phase);
    state.check(outcome);
    state.arrive_at_barrier();
    state.wait_for_barrier(cpu_count)
}

fn ap_barrier_phase(state: &TestHarnessState, phase: u32, cpu_count: u32) -> Result<()> {
    state.wait_for_phase(phase)?;
    state.arrive_at_barrier();
    state.wait_for_barrier(cpu_count)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Runs the whole suite single-CPU (`cpu_count = 1`): every barrier and done-wait resolves
    /// immediately since the BSP is the only participant, exercising the full phase sequence
    /// without needing real concurrency.
    #[test]
    fn full_suite_passes_single_cpu() {
        let state = TestHarnessState::new();
        let locks = HarnessLocks::new();
        let failures = run_bsp(&state, &locks, 1).unwrap();
        assert_eq!(failures, 0);
        assert_eq!(state.phase(), 10);
    }

    #[test]
    fn two_cpu_suite_passes_when_ap_runs_interleaved_per_phase() {
        let state = TestHarnessState::new();
        let locks = HarnessLocks::new();

        // Single-threaded simulation of two CPUs: since `bsp_barrier_phase`/`ap_barrier_phase`
        // only block until the expected phase/barrier count is reached, calling the BSP driver
        // and then immediately the AP driver for the same `state` (as if the AP were already
        // waiting) resolves every wait without real threads.
        //
        // This requires running both to completion in the same call stack, which `run_bsp`
        // alone cannot do (it blocks on barrier count 2 after only the BSP has arrived). A
        // bounded-timeout wait_for_barrier would otherwise hang, so this test instead drives the
        // two sides on separate OS threads backed by `std` (available to this crate's test
        // configuration).
        let state = alloc::sync::Arc::new(state);
        let locks = alloc::sync::Arc::new(locks);

        let bsp_state = state.clone();
        let bsp_locks = locks.clone();
        let bsp_thread = std::thread::spawn(move || run_bsp(&bsp_state, &bsp_locks, 2).unwrap());

        let ap_state = state.clone();
        let ap_locks = locks.clone();
        let ap_thread = std::thread::spawn(move || run_ap(&ap_state, &ap_locks, 1, 2).unwrap());

        let failures = bsp_thread.join().unwrap();
        ap_thread.join().unwrap();
        assert_eq!(failures, 0);
    }
}
