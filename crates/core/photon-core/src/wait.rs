//! Wait queues and timeouts.
//!
//! A blocked task is linked into exactly one wait queue (none for a timed
//! sleep) and, if its wait has a deadline, into the kernel's timeout list.
//! Both memberships are dropped together by `leave_state(Waiting)`, so once
//! a signal has completed a wait the deadline can no longer fire, and once
//! a deadline has fired no signal can reach the task.
//!
//! Mutexes and semaphores own a wait queue each. Standalone event queues
//! expose the raw `wait_on` / `signal_one` / `signal_all` interface.

use alloc::vec::Vec;

use planck_noalloc::vec::ArrayVec;

use crate::error::KernelError;
use crate::id::{MutexId, SemaphoreId, TaskId, WaitQueueId};
use crate::list::{ListOwner, TaskList};
use crate::state::KernelState;
use crate::task::{Priority, StateFlag, TaskState, WaitReason};

/// Maximum tasks collected per expiry pass in [`tick`](KernelState::tick).
const EXPIRE_BATCH_SIZE: usize = 32;

/// How long a blocking call may wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Do not block; fail with [`KernelError::Timeout`] if the call would wait.
    Poll,
    /// Wait at most this many ticks. `Ticks(0)` behaves like `Poll`.
    Ticks(u32),
    /// Wait until signalled, deleted or released.
    Forever,
}

impl Timeout {
    /// Returns `true` if the call must not block.
    pub const fn is_poll(self) -> bool {
        matches!(self, Self::Poll | Self::Ticks(0))
    }
}

/// Result of a blocking call that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// The resource was obtained or the event arrived.
    Completed,
    /// The task is blocked; collect the outcome with
    /// [`Kernel::wait_outcome`](crate::Kernel::wait_outcome).
    Pending,
}

/// Order in which a wait queue serves its waiters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueueOrder {
    /// Arrival order.
    Fifo,
    /// Most urgent current priority first; arrival order among equals.
    #[default]
    Priority,
}

/// What a waiting task is linked into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitTarget {
    Queue(WaitQueueId),
    /// Timed sleep; no queue, only the timeout list.
    Sleep,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WaitInfo {
    pub(crate) target: WaitTarget,
    pub(crate) reason: WaitReason,
    /// Absolute tick at which the wait expires.
    pub(crate) deadline: Option<u64>,
}

/// The primitive a wait queue belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum QueueOwner {
    Event,
    Mutex(MutexId),
    Semaphore(SemaphoreId),
}

impl QueueOwner {
    const fn reason(self) -> WaitReason {
        match self {
            Self::Event => WaitReason::Event,
            Self::Mutex(_) => WaitReason::Mutex,
            Self::Semaphore(_) => WaitReason::Semaphore,
        }
    }
}

pub(crate) struct WaitQueueCb {
    pub(crate) owner: QueueOwner,
    pub(crate) order: QueueOrder,
    pub(crate) waiters: TaskList,
}

impl WaitQueueCb {
    pub(crate) const fn new(id: WaitQueueId, owner: QueueOwner, order: QueueOrder) -> Self {
        Self {
            owner,
            order,
            waiters: TaskList::new(ListOwner::Queue(id)),
        }
    }
}

impl KernelState {
    // -----------------------------------------------------------------------
    // Blocking and waking
    // -----------------------------------------------------------------------

    /// Blocks a running or ready task on `target`.
    ///
    /// The caller has already ruled out `Timeout::Poll`.
    pub(crate) fn begin_wait(
        &mut self,
        id: TaskId,
        target: WaitTarget,
        timeout: Timeout,
    ) -> Result<(), KernelError> {
        let from = self.blocking_flag(id)?;
        let reason = match target {
            WaitTarget::Queue(q) => self.queues.get(q).ok_or(KernelError::NotFound)?.owner.reason(),
            WaitTarget::Sleep => WaitReason::Sleep,
        };
        let deadline = match timeout {
            Timeout::Forever => None,
            Timeout::Ticks(ticks) if ticks > 0 => Some(self.now + u64::from(ticks)),
            Timeout::Poll | Timeout::Ticks(_) => return Err(KernelError::Timeout),
        };

        self.leave_state(id, from)?;
        let tcb = self.tcb_mut(id)?;
        tcb.wait = Some(WaitInfo {
            target,
            reason,
            deadline,
        });
        tcb.wait_result = None;
        self.enter_state(id, StateFlag::Waiting)?;
        crate::kdebug!("task {id} waits on {reason} (deadline {deadline:?})");
        Ok(())
    }

    /// Completes a task's wait with `result`.
    ///
    /// The common path for every way a wait can end. The task leaves its
    /// wait queue and the timeout list, records the outcome and becomes
    /// runnable unless it is suspended. If it was blocked on a mutex, the
    /// holder loses whatever the task contributed to its priority.
    pub(crate) fn wake(&mut self, id: TaskId, result: Result<(), KernelError>) -> Result<(), KernelError> {
        let holder = self.blocking_holder(id);
        self.leave_state(id, StateFlag::Waiting)?;
        self.tcb_mut(id)?.wait_result = Some(result);
        self.settle(id)?;
        if let Some(holder) = holder {
            self.propagate(holder)?;
        }
        Ok(())
    }

    /// Ends a wait because its deadline passed.
    ///
    /// Sleeps complete successfully; every other wait fails with
    /// [`KernelError::Timeout`].
    pub(crate) fn expire(&mut self, id: TaskId) -> Result<(), KernelError> {
        let tcb = self.tcb(id)?;
        if !tcb.state.contains(TaskState::WAITING) {
            return Err(KernelError::WrongState);
        }
        let result = match tcb.wait.map(|w| w.target) {
            Some(WaitTarget::Sleep) => Ok(()),
            _ => Err(KernelError::Timeout),
        };
        crate::kdebug!("task {id}: wait expired at tick {}", self.now);
        self.wake(id, result)
    }

    /// Aborts a wait on behalf of another task.
    pub(crate) fn release_wait(&mut self, id: TaskId) -> Result<(), KernelError> {
        if !self.tcb(id)?.state.contains(TaskState::WAITING) {
            return Err(KernelError::WrongState);
        }
        crate::kdebug!("task {id}: wait released");
        self.wake(id, Err(KernelError::Released))
    }

    /// Advances time by one tick and expires every wait whose deadline has
    /// been reached, earliest deadline first.
    ///
    /// Returns the number of waits that expired.
    pub(crate) fn tick(&mut self) -> Result<usize, KernelError> {
        self.now += 1;
        let mut expired = 0;
        loop {
            let mut batch = ArrayVec::<TaskId, EXPIRE_BATCH_SIZE>::new();
            for id in self.timeouts.iter(&self.tasks) {
                if batch.len() == EXPIRE_BATCH_SIZE {
                    break;
                }
                match self.tasks.deadline_of(id) {
                    Some(deadline) if deadline <= self.now => {
                        batch.push(id);
                    }
                    _ => break,
                }
            }
            let full = batch.len() == EXPIRE_BATCH_SIZE;
            for &id in batch.iter() {
                self.expire(id)?;
                expired += 1;
            }
            if !full {
                return Ok(expired);
            }
        }
    }

    /// Blocks a task for `ticks` ticks.
    pub(crate) fn sleep(&mut self, id: TaskId, ticks: u32) -> Result<WaitStatus, KernelError> {
        self.blocking_flag(id)?;
        if ticks == 0 {
            return Ok(WaitStatus::Completed);
        }
        self.begin_wait(id, WaitTarget::Sleep, Timeout::Ticks(ticks))?;
        Ok(WaitStatus::Pending)
    }

    // -----------------------------------------------------------------------
    // Queue helpers shared by mutexes and semaphores
    // -----------------------------------------------------------------------

    pub(crate) fn create_queue(
        &mut self,
        owner: QueueOwner,
        order: QueueOrder,
    ) -> Result<WaitQueueId, KernelError> {
        self.queues
            .insert_with(|id| WaitQueueCb::new(id, owner, order))
    }

    /// Head of the queue: the next task to be served.
    pub(crate) fn queue_front(&self, q: WaitQueueId) -> Option<TaskId> {
        self.queues.get(q).and_then(|queue| queue.waiters.front())
    }

    /// Waiters in service order.
    pub(crate) fn queue_waiters(&self, q: WaitQueueId) -> Vec<TaskId> {
        self.queues
            .get(q)
            .map(|queue| queue.waiters.iter(&self.tasks).collect())
            .unwrap_or_default()
    }

    /// Most urgent current priority among the queue's waiters.
    pub(crate) fn highest_waiter(&self, q: WaitQueueId) -> Option<Priority> {
        let queue = self.queues.get(q)?;
        match queue.order {
            QueueOrder::Priority => queue.waiters.front().map(|id| self.tasks.priority_of(id)),
            QueueOrder::Fifo => queue
                .waiters
                .iter(&self.tasks)
                .map(|id| self.tasks.priority_of(id))
                .min(),
        }
    }

    /// Wakes every waiter of `q` with `result`, front to back.
    pub(crate) fn wake_all(
        &mut self,
        q: WaitQueueId,
        result: Result<(), KernelError>,
    ) -> Result<usize, KernelError> {
        let mut woken = 0;
        while let Some(id) = self.queue_front(q) {
            self.wake(id, result)?;
            woken += 1;
        }
        Ok(woken)
    }

    fn event_queue(&self, q: WaitQueueId) -> Result<&WaitQueueCb, KernelError> {
        let queue = self.queues.get(q).ok_or(KernelError::NotFound)?;
        if queue.owner == QueueOwner::Event {
            Ok(queue)
        } else {
            Err(KernelError::WrongState)
        }
    }

    // -----------------------------------------------------------------------
    // Standalone event queues
    // -----------------------------------------------------------------------

    pub(crate) fn wait_queue_create(&mut self, order: QueueOrder) -> Result<WaitQueueId, KernelError> {
        self.create_queue(QueueOwner::Event, order)
    }

    pub(crate) fn wait_queue_delete(&mut self, q: WaitQueueId) -> Result<usize, KernelError> {
        self.event_queue(q)?;
        let woken = self.wake_all(q, Err(KernelError::Deleted))?;
        self.queues.remove(q);
        crate::kdebug!("wait queue {q} deleted, {woken} waiters released");
        Ok(woken)
    }

    /// Blocks a task on an event queue until it is signalled.
    pub(crate) fn wait_on(
        &mut self,
        id: TaskId,
        q: WaitQueueId,
        timeout: Timeout,
    ) -> Result<WaitStatus, KernelError> {
        self.event_queue(q)?;
        self.blocking_flag(id)?;
        self.begin_wait(id, WaitTarget::Queue(q), timeout)?;
        Ok(WaitStatus::Pending)
    }

    /// Wakes the first waiter of an event queue.
    pub(crate) fn signal_one(&mut self, q: WaitQueueId) -> Result<Option<TaskId>, KernelError> {
        let Some(id) = self.event_queue(q)?.waiters.front() else {
            return Ok(None);
        };
        self.wake(id, Ok(()))?;
        Ok(Some(id))
    }

    /// Wakes every waiter of an event queue.
    pub(crate) fn signal_all(&mut self, q: WaitQueueId) -> Result<usize, KernelError> {
        self.event_queue(q)?;
        self.wake_all(q, Ok(()))
    }
}
