//! Compile-time and boot-time constants shared across the crate.

/// Upper bound on the number of logical processors this crate manages.
///
/// Two conflicting values (2 and 4) existed in the source this design is derived from; this
/// build fixes the bound at 4. The `CpuRecord` table, the per-CPU stack table, and the
/// monitor-entry trampoline's saved-RSP array are all sized to this constant.
pub const SMP_MAX_CPUS: usize = 4;

/// Size, in bytes, of each application processor's boot stack.
pub const AP_STACK_SIZE: usize = 0x4000;

/// Size, in bytes, of the monitor-private stack each CPU switches to across the entry
/// trampoline.
pub const MONITOR_STACK_SIZE: usize = 0x4000;

/// Physical page number of the real-mode AP trampoline (page 7 => address 0x7000).
pub const TRAMPOLINE_PAGE: usize = 7;

/// Physical address of the real-mode AP trampoline.
pub const TRAMPOLINE_ADDRESS: u64 = (TRAMPOLINE_PAGE as u64) * 0x1000;

/// Byte offset, within the trampoline page, of the low 32 bits of the kernel PML4 physical
/// address field.
pub const TRAMPOLINE_OFFSET_PML4: usize = 0x10;

/// Byte offset, within the trampoline page, of the low 32 bits of the `ap_entry` function
/// address field.
pub const TRAMPOLINE_OFFSET_ENTRY: usize = 0x18;

/// Byte offset, within the trampoline page, of the GDT32 `lgdt` pseudo-descriptor (2-byte limit
/// followed by a 4-byte base, read while still in 32-bit operand size).
pub const TRAMPOLINE_OFFSET_GDT32_BASE: usize = 0x20;

/// Byte offset, within the trampoline page, of the GDT64 `lgdt` pseudo-descriptor, same layout
/// as [`TRAMPOLINE_OFFSET_GDT32_BASE`].
pub const TRAMPOLINE_OFFSET_GDT64_BASE: usize = 0x28;

/// Byte offset, within the trampoline page, of the embedded flat GDT32 (null/code/data, 8 bytes
/// each) the GDT32 pseudo-descriptor points at.
pub const TRAMPOLINE_OFFSET_GDT32_TABLE: usize = 0x40;

/// Byte offset, within the trampoline page, of the embedded flat GDT64 (null/code/data, 8 bytes
/// each, code descriptor carries the long-mode bit) the GDT64 pseudo-descriptor points at.
pub const TRAMPOLINE_OFFSET_GDT64_TABLE: usize = 0x60;

/// Local APIC MMIO base address, fixed by the architecture.
pub const APIC_MMIO_BASE: u64 = 0xFEE0_0000;

/// Interrupt vector used for the periodic timer.
pub const TIMER_VECTOR: u8 = 32;

/// Interrupt vector used for inter-processor signalling.
pub const IPI_VECTOR: u8 = 33;

/// Iteration budget for bounded spin-waits (IPI delivery, barrier, phase).
///
/// Not a time bound — a diagnostic ceiling so a stuck wait reports `Timeout` instead of hanging
/// forever under test.
pub const SPIN_TIMEOUT_ITERATIONS: u64 = 10_000_000;

/// Iterations of contended locking each CPU performs in test 6 of the lock harness.
pub const HARNESS_CONTENDED_ITERATIONS: u32 = 100;

/// Iterations of the paired-lock ordering test (test 10).
pub const HARNESS_ORDERING_ITERATIONS: u32 = 10;

/// I/O port used for the debug-exit convention (QEMU `isa-debug-exit`).
pub const DEBUG_EXIT_PORT: u16 = 0xf4;

/// Exit code written to the debug-exit port on a clean shutdown.
pub const DEBUG_EXIT_SUCCESS: u32 = 0x10;

/// Exit code written to the debug-exit port on a fatal failure.
pub const DEBUG_EXIT_FAILURE: u32 = 0x11;
