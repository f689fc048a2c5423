//! Hardware port interface.
//!
//! The kernel never touches interrupt masks or register files directly.
//! A [`Port`] supplies the critical-section primitives, tells the kernel
//! whether it is running in interrupt context, and performs context
//! switches once the kernel has decided which task runs next.

#[cfg(any(test, feature = "std"))]
pub mod host;

use crate::id::TaskId;

/// A context switch decided by the scheduler.
///
/// `None` on either side is the idle context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextSwitch {
    /// Task whose context was on the CPU.
    pub from: Option<TaskId>,
    /// Task to dispatch.
    pub to: Option<TaskId>,
}

/// Architecture and board services the kernel depends on.
pub trait Port {
    /// Masks interrupts and returns the previous interrupt state.
    fn enter_critical(&self) -> u64;

    /// Restores the interrupt state returned by the matching
    /// [`enter_critical`](Port::enter_critical).
    fn leave_critical(&self, saved: u64);

    /// Returns `true` while an interrupt handler is executing.
    fn is_interrupt_context(&self) -> bool;

    /// Saves the context of `from` and restores the context of `to`.
    ///
    /// Called with the kernel lock released. On hardware this returns only
    /// once `from` is dispatched again; a host port may return immediately.
    /// When called from interrupt context the port defers the switch until
    /// the handler returns.
    fn switch_context(&self, from: Option<TaskId>, to: Option<TaskId>);
}

impl<P: Port + ?Sized> Port for &P {
    fn enter_critical(&self) -> u64 {
        (**self).enter_critical()
    }

    fn leave_critical(&self, saved: u64) {
        (**self).leave_critical(saved);
    }

    fn is_interrupt_context(&self) -> bool {
        (**self).is_interrupt_context()
    }

    fn switch_context(&self, from: Option<TaskId>, to: Option<TaskId>) {
        (**self).switch_context(from, to);
    }
}
