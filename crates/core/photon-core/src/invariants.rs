//! Whole-kernel consistency checks.
//!
//! [`Kernel::check_invariants`](crate::Kernel::check_invariants) walks every
//! object and cross-checks the redundant views the kernel keeps: task state
//! flags against queue membership, holders against owned-mutex lists,
//! current priorities against what inheritance says they should be. Tests
//! and the simulator run it after every operation.

use core::fmt;

use crate::id::TaskId;
use crate::state::KernelState;
use crate::task::{Priority, TaskState};
use crate::wait::{QueueOrder, WaitTarget};

/// A broken kernel invariant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvariantViolation {
    /// The task the violation was found on, if it is task-specific.
    pub task: Option<TaskId>,
    pub rule: &'static str,
}

impl InvariantViolation {
    const fn task(id: TaskId, rule: &'static str) -> Self {
        Self {
            task: Some(id),
            rule,
        }
    }

    const fn global(rule: &'static str) -> Self {
        Self { task: None, rule }
    }
}

impl fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.task {
            Some(id) => write!(f, "task {id}: {}", self.rule),
            None => f.write_str(self.rule),
        }
    }
}

fn ensure(cond: bool, violation: InvariantViolation) -> Result<(), InvariantViolation> {
    if cond { Ok(()) } else { Err(violation) }
}

impl KernelState {
    pub(crate) fn check_invariants(&self) -> Result<(), InvariantViolation> {
        self.check_tasks()?;
        self.check_mutexes()?;
        self.check_queues()?;
        self.check_dispatch()
    }

    fn check_tasks(&self) -> Result<(), InvariantViolation> {
        for (id, tcb) in self.tasks.iter() {
            let v = |rule| InvariantViolation::task(id, rule);
            let state = tcb.state;

            ensure(
                !state.contains(TaskState::RUNNABLE | TaskState::RUNNING),
                v("runnable and running at once"),
            )?;
            ensure(
                !state.contains(TaskState::WAITING)
                    || !state.intersects(TaskState::RUNNABLE | TaskState::RUNNING),
                v("waiting task is runnable or running"),
            )?;
            ensure(
                state.contains(TaskState::RUNNING) == (self.running == Some(id)),
                v("running flag disagrees with the running slot"),
            )?;

            let expected = self.evaluate_priority(id).map_err(|_| v("priority evaluation failed"))?;
            ensure(
                tcb.current_priority == expected,
                v("current priority differs from inherited priority"),
            )?;

            let in_ready = self
                .ready
                .bucket(tcb.current_priority)
                .is_some_and(|bucket| bucket.contains(&self.tasks, id));
            ensure(
                state.contains(TaskState::RUNNABLE) == in_ready,
                v("runnable flag disagrees with ready-queue membership"),
            )?;

            if state.contains(TaskState::WAITING) {
                let wait = tcb.wait.ok_or(v("waiting without a wait record"))?;
                match wait.target {
                    WaitTarget::Queue(q) => {
                        let queue = self.queues.get(q).ok_or(v("waiting on a deleted queue"))?;
                        ensure(
                            queue.waiters.contains(&self.tasks, id),
                            v("waiting task missing from its wait queue"),
                        )?;
                    }
                    WaitTarget::Sleep => ensure(
                        !tcb.state_link.is_linked(),
                        v("sleeping task linked into a queue"),
                    )?,
                }
                ensure(
                    wait.deadline.is_some() == self.timeouts.contains(&self.tasks, id),
                    v("timeout membership disagrees with deadline"),
                )?;
            } else {
                ensure(tcb.wait.is_none(), v("wait record outside Waiting"))?;
                ensure(!tcb.timeout_link.is_linked(), v("timeout armed outside Waiting"))?;
                ensure(
                    state.contains(TaskState::RUNNABLE) || !tcb.state_link.is_linked(),
                    v("queued while neither runnable nor waiting"),
                )?;
            }

            if state.is_dormant() {
                ensure(tcb.owned_mutexes.is_empty(), v("dormant task owns mutexes"))?;
                ensure(
                    tcb.current_priority == tcb.base_priority,
                    v("dormant task keeps an elevated priority"),
                )?;
            }
            for &m in &tcb.owned_mutexes {
                let holder = self.mutexes.get(m).and_then(|mutex| mutex.holder);
                ensure(holder == Some(id), v("owned mutex held by someone else"))?;
            }
        }
        Ok(())
    }

    fn check_mutexes(&self) -> Result<(), InvariantViolation> {
        for (m, mutex) in self.mutexes.iter() {
            ensure(
                self.queues.get(mutex.queue).is_some(),
                InvariantViolation::global("mutex without a wait queue"),
            )?;
            if let Some(holder) = mutex.holder {
                let owns = self
                    .tasks
                    .get(holder)
                    .is_some_and(|tcb| tcb.owned_mutexes.contains(&m));
                ensure(
                    owns,
                    InvariantViolation::task(holder, "holder does not list the mutex as owned"),
                )?;
            } else {
                ensure(
                    self.queue_front(mutex.queue).is_none(),
                    InvariantViolation::global("free mutex has waiters"),
                )?;
            }
        }
        Ok(())
    }

    fn check_queues(&self) -> Result<(), InvariantViolation> {
        for (_, queue) in self.queues.iter() {
            let mut previous: Option<Priority> = None;
            for id in queue.waiters.iter(&self.tasks) {
                let priority = self.tasks.priority_of(id);
                if queue.order == QueueOrder::Priority {
                    ensure(
                        previous.is_none_or(|p| !priority.is_more_urgent_than(p)),
                        InvariantViolation::task(id, "priority wait queue out of order"),
                    )?;
                }
                previous = Some(priority);
            }
        }

        let mut previous = None;
        for id in self.timeouts.iter(&self.tasks) {
            let deadline = self.tasks.deadline_of(id);
            ensure(
                deadline.is_some() && previous <= deadline,
                InvariantViolation::task(id, "timeout list out of deadline order"),
            )?;
            previous = deadline;
        }

        ensure(
            self.ready.bitmap_consistent(),
            InvariantViolation::global("ready bitmap disagrees with buckets"),
        )
    }

    fn check_dispatch(&self) -> Result<(), InvariantViolation> {
        if !self.started {
            return Ok(());
        }
        match (self.running, self.ready.highest()) {
            (Some(running), Some(top)) => ensure(
                !top.is_more_urgent_than(self.tasks.priority_of(running)),
                InvariantViolation::task(running, "a more urgent task is ready"),
            ),
            (None, Some(_)) => Err(InvariantViolation::global("ready task not dispatched")),
            (_, None) => Ok(()),
        }
    }
}
