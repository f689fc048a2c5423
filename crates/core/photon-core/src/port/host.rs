//! Host port for simulation and tests.
//!
//! Interrupt masking is modelled by a nesting counter shared by every host
//! thread and interrupt context by a flag the caller toggles. Context
//! switches are recorded instead of performed. `switch_context` returns
//! immediately, so blocking kernel calls report
//! [`WaitStatus::Pending`](crate::WaitStatus::Pending) and the outcome is
//! collected later.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::vec::Vec;

use super::{ContextSwitch, Port};
use crate::id::TaskId;

/// A [`Port`] that runs on the host.
pub struct HostPort {
    nesting: AtomicU32,
    max_nesting: AtomicU32,
    in_interrupt: AtomicBool,
    switches: Mutex<Vec<ContextSwitch>>,
}

impl HostPort {
    /// Creates a port in task context with interrupts enabled.
    pub fn new() -> Self {
        Self {
            nesting: AtomicU32::new(0),
            max_nesting: AtomicU32::new(0),
            in_interrupt: AtomicBool::new(false),
            switches: Mutex::new(Vec::new()),
        }
    }

    /// Current critical-section nesting depth.
    pub fn critical_nesting(&self) -> u32 {
        self.nesting.load(Ordering::Acquire)
    }

    /// Deepest nesting observed so far.
    pub fn max_critical_nesting(&self) -> u32 {
        self.max_nesting.load(Ordering::Acquire)
    }

    /// Marks the port as executing (or no longer executing) an interrupt handler.
    pub fn set_interrupt_context(&self, active: bool) {
        self.in_interrupt.store(active, Ordering::Release);
    }

    /// Runs `f` as if from an interrupt handler.
    pub fn in_interrupt<R>(&self, f: impl FnOnce() -> R) -> R {
        let previous = self.in_interrupt.swap(true, Ordering::AcqRel);
        let result = f();
        self.in_interrupt.store(previous, Ordering::Release);
        result
    }

    /// Returns and clears the recorded context switches.
    pub fn take_switches(&self) -> Vec<ContextSwitch> {
        match self.switches.lock() {
            Ok(mut switches) => core::mem::take(&mut *switches),
            Err(poisoned) => core::mem::take(&mut *poisoned.into_inner()),
        }
    }

    /// The most recent context switch, if any.
    pub fn last_switch(&self) -> Option<ContextSwitch> {
        match self.switches.lock() {
            Ok(switches) => switches.last().copied(),
            Err(poisoned) => poisoned.into_inner().last().copied(),
        }
    }
}

impl Default for HostPort {
    fn default() -> Self {
        Self::new()
    }
}

impl Port for HostPort {
    fn enter_critical(&self) -> u64 {
        let previous = self.nesting.fetch_add(1, Ordering::AcqRel);
        self.max_nesting.fetch_max(previous + 1, Ordering::AcqRel);
        u64::from(previous)
    }

    fn leave_critical(&self, _saved: u64) {
        self.nesting.fetch_sub(1, Ordering::AcqRel);
    }

    fn is_interrupt_context(&self) -> bool {
        self.in_interrupt.load(Ordering::Acquire)
    }

    fn switch_context(&self, from: Option<TaskId>, to: Option<TaskId>) {
        let switch = ContextSwitch { from, to };
        match self.switches.lock() {
            Ok(mut switches) => switches.push(switch),
            Err(poisoned) => poisoned.into_inner().push(switch),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nesting_counts_up_and_down() {
        let port = HostPort::new();
        let outer = port.enter_critical();
        let inner = port.enter_critical();
        assert_eq!(port.critical_nesting(), 2);
        port.leave_critical(inner);
        port.leave_critical(outer);
        assert_eq!(port.critical_nesting(), 0);
        assert_eq!(port.max_critical_nesting(), 2);
    }

    #[test]
    fn interrupt_scope_restores_flag() {
        let port = HostPort::new();
        assert!(!port.is_interrupt_context());
        let seen = port.in_interrupt(|| port.is_interrupt_context());
        assert!(seen);
        assert!(!port.is_interrupt_context());
    }

    #[test]
    fn switches_are_recorded() {
        let port = HostPort::new();
        port.switch_context(None, Some(TaskId::new(1)));
        port.switch_context(Some(TaskId::new(1)), None);
        assert_eq!(
            port.last_switch(),
            Some(ContextSwitch {
                from: Some(TaskId::new(1)),
                to: None
            })
        );
        assert_eq!(port.take_switches().len(), 2);
        assert!(port.take_switches().is_empty());
    }
}
