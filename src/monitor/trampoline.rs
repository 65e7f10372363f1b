//! Monitor-entry trampoline (C5): the sole controlled path across the privilege boundary (I4).
//!
//! This is the second of the three pieces the design notes call out as irreducibly
//! hardware-specific (the first is [`crate::smp::trampoline`]): the `CR3` switch and the switch
//! to a monitor-private stack are written once, in assembly, for the real target and are not
//! otherwise portable. What the crate can and does test on the host is the part the asm is
//! parameterized by — the per-CPU saved-RSP slots below, and the dispatch logic in
//! [`crate::monitor`] that runs once the switch has happened.
//!
//! An earlier draft used one shared saved-RSP slot; that corrupts the outer stack pointer if a
//! second CPU enters the monitor while the first is still inside it, so this crate keeps one
//! slot per `cpu_index` instead (the open question SPEC_FULL.md left unresolved).

use core::sync::atomic::{AtomicU64, Ordering};

use crate::config::SMP_MAX_CPUS;

const ZERO: AtomicU64 = AtomicU64::new(0);

/// Per-CPU saved outer-kernel `RSP`, written by the trampoline immediately before the `CR3`
/// switch into `monitor_root` and read back immediately before the switch back to `unpriv_root`.
static SAVED_RSP: [AtomicU64; SMP_MAX_CPUS] = [ZERO; SMP_MAX_CPUS];

/// Top of this CPU's monitor-private stack, installed once at `monitor::init` time.
static MONITOR_STACK_TOP: [AtomicU64; SMP_MAX_CPUS] = [ZERO; SMP_MAX_CPUS];

pub fn set_monitor_stack(cpu_index: usize, top: u64) {
    MONITOR_STACK_TOP[cpu_index].store(top, Ordering::Relaxed);
}

pub fn monitor_stack_top(cpu_index: usize) -> u64 {
    MONITOR_STACK_TOP[cpu_index].load(Ordering::Relaxed)
}

pub fn save_outer_rsp(cpu_index: usize, rsp: u64) {
    SAVED_RSP[cpu_index].store(rsp, Ordering::Relaxed);
}

pub fn take_outer_rsp(cpu_index: usize) -> u64 {
    SAVED_RSP[cpu_index].load(Ordering::Relaxed)
}

/// Physical address of the monitor's own PML4, read by the trampoline on every entry.
#[cfg_attr(not(test), unsafe(no_mangle))]
static MONITOR_ROOT_CR3: AtomicU64 = AtomicU64::new(0);
/// Physical address of the unprivileged PML4, read by the trampoline on every exit.
#[cfg_attr(not(test), unsafe(no_mangle))]
static UNPRIV_ROOT_CR3: AtomicU64 = AtomicU64::new(0);

pub fn set_roots(monitor_root: u64, unpriv_root: u64) {
    MONITOR_ROOT_CR3.store(monitor_root, Ordering::Relaxed);
    UNPRIV_ROOT_CR3.store(unpriv_root, Ordering::Relaxed);
}

/// Called by the trampoline (real target) with the outer `RSP` in `rdi` (SysV ABI); saves it in
/// this CPU's slot and returns the monitor stack top to switch onto, in `rax`.
#[cfg_attr(not(test), unsafe(no_mangle))]
extern "C" fn monitor_trampoline_enter(outer_rsp: u64) -> u64 {
    let index = crate::smp::current_cpu_index().unwrap_or(0);
    save_outer_rsp(index, outer_rsp);
    monitor_stack_top(index)
}

/// Called by the trampoline just before it switches `CR3` back; returns the outer `RSP` to
/// restore, in `rax`.
#[cfg_attr(not(test), unsafe(no_mangle))]
extern "C" fn monitor_trampoline_leave() -> u64 {
    let index = crate::smp::current_cpu_index().unwrap_or(0);
    take_outer_rsp(index)
}

/// The real entry sequence, invoked by the nested-kernel call stub with the requested operation
/// already loaded into `rdi`/`rsi`/`rdx`/`rcx` (SysV ABI, matching how [`crate::apic`]'s MSR
/// helpers and the AP trampoline both assume the standard calling convention across the
/// boundary they cross).
///
/// Saves the caller's `RSP` into this CPU's slot, switches `CR3` to `monitor_root`, switches onto
/// the monitor-private stack, calls [`crate::monitor::dispatch_from_trampoline`], then reverses
/// both switches before returning. Written once for the real target; on the host, callers go
/// straight to `crate::monitor::dispatch_from_trampoline` since there is no second address space
/// or stack to switch to.
#[cfg(not(test))]
core::arch::global_asm!(
    r#"
.section .text.monitor_trampoline, "ax"
.global monitor_entry_trampoline
monitor_entry_trampoline:
    push rbx
    push rbp
    push r12
    push r13
    push r14
    push r15

    mov r12, rdi
    mov r13, rsi
    mov r14, rdx
    mov r15, rcx

    mov rdi, rsp
    call monitor_trampoline_enter
    mov rsp, rax

    mov rax, [rip + MONITOR_ROOT_CR3]
    mov cr3, rax

    mov rdi, r12
    mov rsi, r13
    mov rdx, r14
    mov rcx, r15
    call monitor_dispatch_from_trampoline
    mov r12, rax

    mov rax, [rip + UNPRIV_ROOT_CR3]
    mov cr3, rax

    call monitor_trampoline_leave
    mov rsp, rax

    mov rax, r12

    pop r15
    pop r14
    pop r13
    pop r12
    pop rbp
    pop rbx
    ret
"#
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn saved_rsp_slots_are_independent_per_cpu() {
        save_outer_rsp(0, 0x1000);
        save_outer_rsp(1, 0x2000);
        assert_eq!(take_outer_rsp(0), 0x1000);
        assert_eq!(take_outer_rsp(1), 0x2000);
    }

    #[test]
    fn monitor_stack_top_defaults_to_zero_until_installed() {
        assert_eq!(monitor_stack_top(2), 0);
        set_monitor_stack(2, 0xDEAD_0000);
        assert_eq!(monitor_stack_top(2), 0xDEAD_0000);
    }
}
