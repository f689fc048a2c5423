//! Core scheduler and synchronization primitives for the Photon RTOS.
//!
//! This crate holds the kernel's task state machine, the per-priority ready
//! queues, the wait/timeout manager and mutexes with priority inheritance.
//! All of it is host-testable: interrupt masking, context switching and the
//! tick source are reached through the [`Port`](port::Port) trait, so the
//! same code runs under `cargo test`, loom and shuttle on the host.
//!
//! The entry point is [`Kernel`], which wraps the kernel state in a
//! critical-section lock and exposes the task, mutex, wait-queue and
//! semaphore services.

#![cfg_attr(not(any(test, feature = "std")), no_std)]

extern crate alloc;

pub mod config;
pub mod error;
pub mod id;
pub mod invariants;
pub mod kernel;
pub mod list;
pub mod log;
pub mod mutex;
pub mod port;
pub mod sched;
pub mod semaphore;
pub mod sync;
pub mod task;
pub mod wait;

mod state;
mod table;

#[cfg(all(test, not(loom)))]
mod tests;

pub use config::KernelConfig;
pub use error::KernelError;
pub use id::{MutexId, SemaphoreId, TaskId, WaitQueueId};
pub use invariants::InvariantViolation;
pub use kernel::Kernel;
pub use mutex::{MutexInfo, MutexMeta, MutexProtocol};
pub use port::{ContextSwitch, Port};
pub use task::{Priority, TaskInfo, TaskMeta, TaskState, WaitReason};
pub use wait::{QueueOrder, Timeout, WaitStatus};
