//! Kernel-level test suites driven through [`Kernel`] on the host port.

mod concurrency;
mod random;

use crate::port::host::HostPort;
use crate::{Kernel, KernelConfig, Priority, TaskId, TaskMeta};

pub(crate) fn kernel() -> Kernel<HostPort> {
    Kernel::new(HostPort::new(), KernelConfig::new().with_priority_levels(16)).unwrap()
}

/// Creates and activates a task.
pub(crate) fn spawn(kernel: &Kernel<HostPort>, name: &'static str, priority: u8) -> TaskId {
    let id = kernel
        .create_task(TaskMeta::new(name).with_priority(Priority::new(priority)))
        .unwrap();
    kernel.activate(id).unwrap();
    id
}

pub(crate) fn current(kernel: &Kernel<HostPort>, task: TaskId) -> u8 {
    kernel.task_info(task).unwrap().current_priority.as_u8()
}

/// Asserts that no critical section is open and the bookkeeping is
/// consistent.
#[track_caller]
pub(crate) fn assert_settled(kernel: &Kernel<HostPort>) {
    assert_eq!(kernel.port().critical_nesting(), 0);
    assert_eq!(kernel.critical_depth(), 0);
    if let Err(violation) = kernel.check_invariants() {
        panic!("invariant violated: {violation}");
    }
}
