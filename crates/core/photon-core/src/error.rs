//! Kernel error codes.

use core::fmt;

/// Errors returned by kernel services.
///
/// `Timeout`, `Deleted` and `Released` double as wait outcomes: a task that
/// blocked observes exactly one of them, or success, when its wait ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelError {
    /// An argument was out of range (priority level, capacity, ceiling).
    InvalidParameter,
    /// The object is not in a state that permits the operation.
    WrongState,
    /// The operation is not allowed from interrupt context.
    WrongContext,
    /// The wait's deadline passed, or a poll found the resource unavailable.
    Timeout,
    /// The object being waited on was deleted.
    Deleted,
    /// The wait was aborted by another task.
    Released,
    /// The identifier does not name a live object.
    NotFound,
    /// The object table is full.
    NoResources,
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::InvalidParameter => "invalid parameter",
            Self::WrongState => "object in wrong state",
            Self::WrongContext => "not allowed from interrupt context",
            Self::Timeout => "timed out",
            Self::Deleted => "object deleted while waiting",
            Self::Released => "wait released",
            Self::NotFound => "no such object",
            Self::NoResources => "object table full",
        })
    }
}
