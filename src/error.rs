//! Crate-wide error type.
//!
//! Every fallible boundary in this crate returns `Result<T, Error>`. Errors are values, never
//! thrown: the monitor's dispatch functions, the APIC driver, and the bootstrap coordinator all
//! return them to their caller for handling, as called for by the propagation policy in the
//! design this crate follows.

use thiserror::Error;

/// The error kinds produced by this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum NkError {
    /// A bounded spin-wait (IPI delivery, barrier, phase) exhausted its iteration budget.
    #[error("operation timed out")]
    Timeout,

    /// The memory service could not satisfy an allocation request.
    #[error("out of memory")]
    OutOfMemory,

    /// The invariant verifier found a violated nested-kernel invariant.
    #[error("invariant violated: {0}")]
    InvariantViolation(&'static str),

    /// A caller-supplied argument was out of range or otherwise invalid.
    #[error("bad argument: {0}")]
    BadArgument(&'static str),

    /// The outer kernel attempted to write through a read-only page-table page or code
    /// mapping.
    #[error("protection fault at {addr:#x}")]
    ProtectionFault {
        /// Faulting virtual address.
        addr: u64,
    },

    /// An application processor failed to reach the `Ready` state during boot.
    #[error("processor {apic_id} failed to start")]
    APStartupFailure {
        /// APIC id of the processor that failed to come up.
        apic_id: u8,
    },
}

/// Convenience alias used throughout the crate.
pub type Result<T> = core::result::Result<T, NkError>;
