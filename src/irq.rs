//! Interrupt-flag snapshot/restore used by [`crate::synch::spinlock::SpinlockIrqSave`].
//!
//! `IrqFlags` is deliberately opaque outside this module: callers pair `nested_disable` and
//! `nested_enable` without inspecting the value in between.

/// Snapshot of `RFLAGS.IF` taken by [`nested_disable`].
pub type IrqFlags = bool;

/// Disables interrupts and returns whether they were enabled beforehand.
///
/// `cli`/`sti` are ring-0-only, so host-run unit tests (which execute in ring 3) use a
/// software-only flag instead; the real path below is exercised on the actual target.
#[cfg(not(test))]
#[inline]
pub fn nested_disable() -> IrqFlags {
    use x86_64::instructions::interrupts;
    let was_enabled = interrupts::are_enabled();
    interrupts::disable();
    was_enabled
}

/// Restores interrupts to the state captured by a matching [`nested_disable`] call.
#[cfg(not(test))]
#[inline]
pub fn nested_enable(flags: IrqFlags) {
    use x86_64::instructions::interrupts;
    if flags {
        interrupts::enable();
    }
}

#[cfg(test)]
use core::sync::atomic::{AtomicBool, Ordering};

#[cfg(test)]
static TEST_IRQ_ENABLED: AtomicBool = AtomicBool::new(true);

#[cfg(test)]
#[inline]
pub fn nested_disable() -> IrqFlags {
    TEST_IRQ_ENABLED.swap(false, Ordering::SeqCst)
}

#[cfg(test)]
#[inline]
pub fn nested_enable(flags: IrqFlags) {
    TEST_IRQ_ENABLED.store(flags, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_preserves_flag() {
        let before = TEST_IRQ_ENABLED.load(Ordering::SeqCst);
        let flags = nested_disable();
        assert_eq!(flags, before);
        assert!(!TEST_IRQ_ENABLED.load(Ordering::SeqCst));
        nested_enable(flags);
        assert_eq!(TEST_IRQ_ENABLED.load(Ordering::SeqCst), before);
    }
}
