//! Synchronization primitives (C3) and the multi-phase correctness harness that exercises them
//! under contention (C4).

pub mod harness;
pub mod rwlock;
pub mod runner;
pub mod spinlock;

pub use rwlock::RwLock;
pub use spinlock::{Spinlock, SpinlockIrqSave};
