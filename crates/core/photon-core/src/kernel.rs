//! The kernel facade.
//!
//! [`Kernel`] owns the port and the kernel state. Every service follows the
//! same shape: check the calling context, take the [`KernelLock`] (which
//! enters a port critical section), run the state-machine operation,
//! re-evaluate preemption, drop the lock and only then ask the port to
//! switch contexts. An error returned by the operation propagates with `?`
//! and the guard's drop leaves the critical section.

use crate::config::KernelConfig;
use crate::error::KernelError;
use crate::id::{MutexId, SemaphoreId, TaskId, WaitQueueId};
use crate::invariants::InvariantViolation;
use crate::mutex::{MutexInfo, MutexMeta};
use crate::port::Port;
use crate::state::KernelState;
use crate::sync::KernelLock;
use crate::task::{Priority, TaskInfo, TaskMeta};
use crate::wait::{QueueOrder, Timeout, WaitStatus};

/// A scheduler instance bound to a [`Port`].
pub struct Kernel<P: Port> {
    port: P,
    state: KernelLock<KernelState>,
}

impl<P: Port> Kernel<P> {
    /// Creates a kernel with empty object tables. Dispatch stays disabled
    /// until [`start`](Self::start).
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::InvalidParameter`] if `config` does not
    /// validate.
    pub fn new(port: P, config: KernelConfig) -> Result<Self, KernelError> {
        let state = KernelState::new(config)?;
        crate::kinfo!(
            "kernel created: {} priority levels, {} task slots",
            config.priority_levels,
            config.max_tasks
        );
        Ok(Self {
            port,
            state: KernelLock::new(state),
        })
    }

    pub fn port(&self) -> &P {
        &self.port
    }

    // -----------------------------------------------------------------------
    // Plumbing
    // -----------------------------------------------------------------------

    fn task_context(&self) -> Result<(), KernelError> {
        if self.port.is_interrupt_context() {
            Err(KernelError::WrongContext)
        } else {
            Ok(())
        }
    }

    /// Runs `op` under the kernel lock, then dispatches.
    fn with_state<R>(
        &self,
        op: impl FnOnce(&mut KernelState) -> Result<R, KernelError>,
    ) -> Result<R, KernelError> {
        let mut state = self.state.lock(&self.port);
        let value = op(&mut *state)?;
        let switch = state.reschedule();
        drop(state);

        if let Some(switch) = switch {
            self.port.switch_context(switch.from, switch.to);
        }
        Ok(value)
    }

    /// Runs a potentially blocking `op` for `task`.
    ///
    /// If the task blocked, the port has switched away from it by the time
    /// this returns to it, and its outcome is collected here. A port whose
    /// switch returns immediately leaves the wait in progress and the call
    /// reports [`WaitStatus::Pending`].
    fn blocking(
        &self,
        task: TaskId,
        op: impl FnOnce(&mut KernelState) -> Result<WaitStatus, KernelError>,
    ) -> Result<WaitStatus, KernelError> {
        self.task_context()?;
        if self.with_state(op)? == WaitStatus::Completed {
            return Ok(WaitStatus::Completed);
        }
        let mut state = self.state.lock(&self.port);
        match state.tcb_mut(task)?.wait_result.take() {
            Some(Ok(())) => Ok(WaitStatus::Completed),
            Some(Err(err)) => Err(err),
            None => Ok(WaitStatus::Pending),
        }
    }

    fn read<R>(&self, op: impl FnOnce(&KernelState) -> R) -> R {
        let state = self.state.lock(&self.port);
        op(&*state)
    }

    // -----------------------------------------------------------------------
    // Scheduler
    // -----------------------------------------------------------------------

    /// Enables dispatch and switches to the most urgent ready task.
    pub fn start(&self) -> Result<(), KernelError> {
        self.task_context()?;
        self.with_state(KernelState::start)
    }

    /// Moves the running task behind the other ready tasks of its priority.
    pub fn yield_now(&self, task: TaskId) -> Result<(), KernelError> {
        self.task_context()?;
        self.with_state(|st| st.yield_now(task))
    }

    /// Advances time by one tick, expiring waits whose deadline passed.
    ///
    /// Called by the timer driver, usually from its interrupt handler.
    /// Returns the number of expired waits.
    pub fn tick(&self) -> Result<usize, KernelError> {
        self.with_state(KernelState::tick)
    }

    /// Current tick count.
    pub fn now(&self) -> u64 {
        self.read(|st| st.now)
    }

    pub fn running(&self) -> Option<TaskId> {
        self.read(|st| st.running)
    }

    /// Priority of the most urgent non-empty ready bucket.
    pub fn highest_ready(&self) -> Option<Priority> {
        self.read(|st| st.ready.highest())
    }

    // -----------------------------------------------------------------------
    // Tasks
    // -----------------------------------------------------------------------

    /// Creates a Dormant task.
    pub fn create_task(&self, meta: TaskMeta) -> Result<TaskId, KernelError> {
        self.task_context()?;
        self.with_state(|st| st.create_task(meta))
    }

    /// Frees a Dormant task's slot.
    pub fn delete_task(&self, task: TaskId) -> Result<(), KernelError> {
        self.task_context()?;
        self.with_state(|st| st.delete_task(task))
    }

    /// Makes a Dormant task ready at its creation priority.
    pub fn activate(&self, task: TaskId) -> Result<(), KernelError> {
        self.with_state(|st| st.activate(task))
    }

    pub fn suspend(&self, task: TaskId) -> Result<(), KernelError> {
        self.with_state(|st| st.suspend(task))
    }

    /// Lifts a suspension. The task returns to whatever else it was doing:
    /// waiting if its wait is still in progress, ready otherwise.
    pub fn resume(&self, task: TaskId) -> Result<(), KernelError> {
        self.with_state(|st| st.resume(task))
    }

    /// Returns a task to Dormant, releasing every mutex it holds.
    pub fn terminate(&self, task: TaskId) -> Result<(), KernelError> {
        self.task_context()?;
        self.with_state(|st| st.terminate(task))
    }

    /// Changes a task's base priority.
    ///
    /// The current priority never drops below what the task inherits from
    /// the mutexes it holds.
    pub fn set_priority(&self, task: TaskId, priority: Priority) -> Result<(), KernelError> {
        self.task_context()?;
        self.with_state(|st| st.set_priority(task, priority))
    }

    pub fn task_info(&self, task: TaskId) -> Result<TaskInfo, KernelError> {
        self.read(|st| st.task_info(task))
    }

    // -----------------------------------------------------------------------
    // Waits
    // -----------------------------------------------------------------------

    /// Blocks `task` for `ticks` ticks. The expiry is a successful outcome.
    pub fn sleep(&self, task: TaskId, ticks: u32) -> Result<WaitStatus, KernelError> {
        self.blocking(task, |st| st.sleep(task, ticks))
    }

    /// Aborts the wait of `task`; it observes [`KernelError::Released`].
    pub fn release_wait(&self, task: TaskId) -> Result<(), KernelError> {
        self.with_state(|st| st.release_wait(task))
    }

    /// Ends the wait of `task` as if its deadline had passed.
    pub fn expire(&self, task: TaskId) -> Result<(), KernelError> {
        self.with_state(|st| st.expire(task))
    }

    /// Collects the outcome of the last wait of `task`.
    ///
    /// Returns [`WaitStatus::Pending`] while the wait is in progress. The
    /// outcome is consumed.
    pub fn wait_outcome(&self, task: TaskId) -> Result<WaitStatus, KernelError> {
        let mut state = self.state.lock(&self.port);
        state.wait_outcome(task)
    }

    pub fn wait_queue_create(&self, order: QueueOrder) -> Result<WaitQueueId, KernelError> {
        self.task_context()?;
        self.with_state(|st| st.wait_queue_create(order))
    }

    /// Deletes an event queue. Its waiters observe [`KernelError::Deleted`].
    pub fn wait_queue_delete(&self, queue: WaitQueueId) -> Result<usize, KernelError> {
        self.task_context()?;
        self.with_state(|st| st.wait_queue_delete(queue))
    }

    pub fn wait_on(
        &self,
        task: TaskId,
        queue: WaitQueueId,
        timeout: Timeout,
    ) -> Result<WaitStatus, KernelError> {
        self.blocking(task, |st| st.wait_on(task, queue, timeout))
    }

    /// Wakes the first waiter of `queue`, returning it.
    pub fn signal_one(&self, queue: WaitQueueId) -> Result<Option<TaskId>, KernelError> {
        self.with_state(|st| st.signal_one(queue))
    }

    /// Wakes every waiter of `queue`, returning how many there were.
    pub fn signal_all(&self, queue: WaitQueueId) -> Result<usize, KernelError> {
        self.with_state(|st| st.signal_all(queue))
    }

    // -----------------------------------------------------------------------
    // Mutexes
    // -----------------------------------------------------------------------

    pub fn mutex_create(&self, meta: MutexMeta) -> Result<MutexId, KernelError> {
        self.task_context()?;
        self.with_state(|st| st.mutex_create(meta))
    }

    /// Locks `mutex` for `task`.
    ///
    /// If another task holds it, `task` waits in the mutex's queue and the
    /// holder inherits its priority for as long as it waits.
    ///
    /// # Errors
    ///
    /// - [`KernelError::WrongState`] if `task` already holds the mutex, is
    ///   neither running nor ready, or waiting would deadlock.
    /// - [`KernelError::Timeout`] if the mutex is held and `timeout` polls.
    /// - [`KernelError::InvalidParameter`] if the task's base priority is
    ///   more urgent than the mutex's ceiling.
    pub fn mutex_lock(
        &self,
        task: TaskId,
        mutex: MutexId,
        timeout: Timeout,
    ) -> Result<WaitStatus, KernelError> {
        self.blocking(task, |st| st.mutex_lock(task, mutex, timeout))
    }

    /// Locks `mutex` only if it is free.
    pub fn mutex_try_lock(&self, task: TaskId, mutex: MutexId) -> Result<(), KernelError> {
        self.mutex_lock(task, mutex, Timeout::Poll).map(|_| ())
    }

    /// Releases `mutex`, handing it to the next waiter.
    pub fn mutex_unlock(&self, task: TaskId, mutex: MutexId) -> Result<(), KernelError> {
        self.task_context()?;
        self.with_state(|st| st.mutex_unlock(task, mutex))
    }

    /// Deletes `mutex`, locked or not, returning how many waiters were
    /// released with [`KernelError::Deleted`].
    pub fn mutex_delete(&self, mutex: MutexId) -> Result<usize, KernelError> {
        self.task_context()?;
        self.with_state(|st| st.mutex_delete(mutex))
    }

    pub fn mutex_info(&self, mutex: MutexId) -> Result<MutexInfo, KernelError> {
        self.read(|st| st.mutex_info(mutex))
    }

    // -----------------------------------------------------------------------
    // Semaphores
    // -----------------------------------------------------------------------

    /// Creates a counting semaphore holding `initial` of at most `max`
    /// permits. Waiters are served most urgent first.
    pub fn semaphore_create(&self, initial: u32, max: u32) -> Result<SemaphoreId, KernelError> {
        self.task_context()?;
        self.with_state(|st| st.semaphore_create(initial, max, QueueOrder::Priority))
    }

    pub fn semaphore_take(
        &self,
        task: TaskId,
        semaphore: SemaphoreId,
        timeout: Timeout,
    ) -> Result<WaitStatus, KernelError> {
        self.blocking(task, |st| st.semaphore_take(task, semaphore, timeout))
    }

    /// Releases a permit, handing it to the first waiter if there is one.
    pub fn semaphore_give(&self, semaphore: SemaphoreId) -> Result<Option<TaskId>, KernelError> {
        self.with_state(|st| st.semaphore_give(semaphore))
    }

    pub fn semaphore_delete(&self, semaphore: SemaphoreId) -> Result<usize, KernelError> {
        self.task_context()?;
        self.with_state(|st| st.semaphore_delete(semaphore))
    }

    pub fn semaphore_count(&self, semaphore: SemaphoreId) -> Result<u32, KernelError> {
        self.read(|st| st.semaphore_count(semaphore))
    }

    // -----------------------------------------------------------------------
    // Diagnostics
    // -----------------------------------------------------------------------

    /// Cross-checks the kernel's internal bookkeeping.
    pub fn check_invariants(&self) -> Result<(), InvariantViolation> {
        self.read(KernelState::check_invariants)
    }

    /// Number of kernel-lock guards currently alive; zero between calls.
    pub fn critical_depth(&self) -> u32 {
        self.state.depth()
    }
}
