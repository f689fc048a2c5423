//! Synchronization primitives protecting kernel state.
//!
//! - [`KernelLock`]: critical-section lock around the kernel state; masks
//!   interrupts through the [`Port`](crate::Port) for as long as its guard
//!   lives and restores them on every exit path.

mod critical;
pub(crate) mod loom_compat;

pub use critical::{KernelLock, KernelLockGuard};
