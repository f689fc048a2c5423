//! Kernel state and the task state machine.
//!
//! Every change to a task's scheduling state goes through [`enter_state`]
//! or [`leave_state`]. Each primitive owns all side effects of its flag:
//! ready-queue membership for `Runnable`, the running slot for `Running`,
//! wait-queue and timeout membership for `Waiting`. Higher-level operations
//! (activate, suspend, wake, terminate) are compositions of these two.
//!
//! [`enter_state`]: KernelState::enter_state
//! [`leave_state`]: KernelState::leave_state

use alloc::vec::Vec;

use crate::config::KernelConfig;
use crate::error::KernelError;
use crate::id::{MutexId, SemaphoreId, TaskId, WaitQueueId};
use crate::list::{ListOwner, TaskList};
use crate::mutex::{MutexCb, MutexProtocol};
use crate::port::ContextSwitch;
use crate::sched::ReadyQueues;
use crate::semaphore::SemaphoreCb;
use crate::table::Table;
use crate::task::{Priority, StateFlag, TaskInfo, TaskMeta, TaskState, Tcb, WaitReason};
use crate::wait::{QueueOrder, WaitQueueCb, WaitStatus, WaitTarget};

pub(crate) struct KernelState {
    pub(crate) config: KernelConfig,
    pub(crate) tasks: Table<TaskId, Tcb>,
    pub(crate) mutexes: Table<MutexId, MutexCb>,
    pub(crate) queues: Table<WaitQueueId, WaitQueueCb>,
    pub(crate) semaphores: Table<SemaphoreId, SemaphoreCb>,
    pub(crate) ready: ReadyQueues,
    pub(crate) timeouts: TaskList,
    pub(crate) running: Option<TaskId>,
    /// Task whose context the port last switched to.
    on_cpu: Option<TaskId>,
    pub(crate) started: bool,
    pub(crate) now: u64,
}

impl KernelState {
    pub(crate) fn new(config: KernelConfig) -> Result<Self, KernelError> {
        config.validate()?;
        Ok(Self {
            config,
            tasks: Table::new(config.max_tasks),
            mutexes: Table::new(config.max_mutexes),
            queues: Table::new(config.max_wait_queues),
            semaphores: Table::new(config.max_semaphores),
            ready: ReadyQueues::new(config.priority_levels),
            timeouts: TaskList::new(ListOwner::Timeout),
            running: None,
            on_cpu: None,
            started: false,
            now: 0,
        })
    }

    pub(crate) fn tcb(&self, id: TaskId) -> Result<&Tcb, KernelError> {
        self.tasks.get(id).ok_or(KernelError::NotFound)
    }

    pub(crate) fn tcb_mut(&mut self, id: TaskId) -> Result<&mut Tcb, KernelError> {
        self.tasks.get_mut(id).ok_or(KernelError::NotFound)
    }

    pub(crate) fn check_priority(&self, priority: Priority) -> Result<(), KernelError> {
        if priority.index() < self.ready.levels() {
            Ok(())
        } else {
            Err(KernelError::InvalidParameter)
        }
    }

    // -----------------------------------------------------------------------
    // State-machine primitives
    // -----------------------------------------------------------------------

    /// Adds `flag` to the task's state, performing its side effects.
    ///
    /// Entering a state the task already holds is rejected with
    /// [`KernelError::WrongState`] and changes nothing.
    pub(crate) fn enter_state(&mut self, id: TaskId, flag: StateFlag) -> Result<(), KernelError> {
        let tcb = self.tcb(id)?;
        let state = tcb.state;
        let priority = tcb.current_priority;
        let wait = tcb.wait;

        match flag {
            StateFlag::Runnable => {
                if !state.is_empty() {
                    return Err(KernelError::WrongState);
                }
                self.ready.push_back(&mut self.tasks, priority, id)?;
            }
            StateFlag::Running => {
                if !state.is_empty() || self.running.is_some() {
                    return Err(KernelError::WrongState);
                }
                self.running = Some(id);
            }
            StateFlag::Waiting => {
                if !state.is_empty() {
                    return Err(KernelError::WrongState);
                }
                let Some(wait) = wait else {
                    return Err(KernelError::WrongState);
                };
                if let WaitTarget::Queue(q) = wait.target {
                    let queue = self.queues.get_mut(q).ok_or(KernelError::NotFound)?;
                    match queue.order {
                        QueueOrder::Fifo => queue.waiters.push_back(&mut self.tasks, id)?,
                        QueueOrder::Priority => {
                            queue.waiters.insert_before_first(&mut self.tasks, id, |tasks, other| {
                                priority.is_more_urgent_than(tasks.priority_of(other))
                            })?;
                        }
                    }
                }
                if let Some(deadline) = wait.deadline {
                    self.timeouts
                        .insert_before_first(&mut self.tasks, id, |tasks, other| {
                            tasks.deadline_of(other).is_some_and(|d| deadline < d)
                        })?;
                }
            }
            StateFlag::Suspended => {
                if state.is_empty() || state.contains(TaskState::SUSPENDED) {
                    return Err(KernelError::WrongState);
                }
                if state.contains(TaskState::RUNNABLE) {
                    self.leave_state(id, StateFlag::Runnable)?;
                }
                if state.contains(TaskState::RUNNING) {
                    self.leave_state(id, StateFlag::Running)?;
                }
            }
        }

        let tcb = self.tcb_mut(id)?;
        tcb.state.insert(flag.bits());
        crate::ktrace!("task {id}: enter {flag:?} -> {}", tcb.state);
        Ok(())
    }

    /// Removes `flag` from the task's state, undoing its side effects.
    ///
    /// Leaving a state the task does not hold is rejected with
    /// [`KernelError::WrongState`] and changes nothing. Leaving `Waiting` or
    /// `Suspended` never makes the task runnable by itself; see [`settle`].
    ///
    /// [`settle`]: Self::settle
    pub(crate) fn leave_state(&mut self, id: TaskId, flag: StateFlag) -> Result<(), KernelError> {
        let tcb = self.tcb(id)?;
        if !tcb.state.contains(flag.bits()) {
            return Err(KernelError::WrongState);
        }
        let wait = tcb.wait;

        match flag {
            StateFlag::Runnable => self.ready.remove(&mut self.tasks, id)?,
            StateFlag::Running => self.running = None,
            StateFlag::Waiting => {
                if let Some(WaitTarget::Queue(q)) = wait.map(|w| w.target) {
                    if let Some(queue) = self.queues.get_mut(q) {
                        queue.waiters.remove(&mut self.tasks, id)?;
                    }
                }
                if self.timeouts.contains(&self.tasks, id) {
                    self.timeouts.remove(&mut self.tasks, id)?;
                }
                self.tcb_mut(id)?.wait = None;
            }
            StateFlag::Suspended => {}
        }

        let tcb = self.tcb_mut(id)?;
        tcb.state.remove(flag.bits());
        crate::ktrace!("task {id}: leave {flag:?} -> {}", tcb.state);
        Ok(())
    }

    /// Makes a task runnable if nothing else holds it.
    ///
    /// The single resume path after a wait completes or a suspension ends:
    /// a task still suspended, or still waiting, stays where it is.
    pub(crate) fn settle(&mut self, id: TaskId) -> Result<(), KernelError> {
        if self.tcb(id)?.state.is_empty() {
            self.enter_state(id, StateFlag::Runnable)?;
        }
        Ok(())
    }

    /// The flag a task must leave to block: it has to be running or ready.
    pub(crate) fn blocking_flag(&self, id: TaskId) -> Result<StateFlag, KernelError> {
        let state = self.tcb(id)?.state;
        if state == TaskState::RUNNING {
            Ok(StateFlag::Running)
        } else if state == TaskState::RUNNABLE {
            Ok(StateFlag::Runnable)
        } else {
            Err(KernelError::WrongState)
        }
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Replaces the running task with the head of the most urgent bucket.
    ///
    /// The previous running task, if any, goes back to the tail of its
    /// bucket.
    pub(crate) fn pick_next(&mut self) -> Result<Option<TaskId>, KernelError> {
        if let Some(previous) = self.running {
            self.leave_state(previous, StateFlag::Running)?;
            self.enter_state(previous, StateFlag::Runnable)?;
        }
        let Some(next) = self.ready.peek() else {
            return Ok(None);
        };
        self.leave_state(next, StateFlag::Runnable)?;
        self.enter_state(next, StateFlag::Running)?;
        Ok(Some(next))
    }

    /// Preempts the running task if a more urgent one is ready, and reports
    /// the context switch the port has to perform.
    pub(crate) fn reschedule(&mut self) -> Option<ContextSwitch> {
        if !self.started {
            return None;
        }
        let preempt = match (self.running, self.ready.highest()) {
            (_, None) => false,
            (None, Some(_)) => true,
            (Some(running), Some(top)) => {
                top.is_more_urgent_than(self.tasks.priority_of(running))
            }
        };
        if preempt {
            if let Err(err) = self.pick_next() {
                crate::kerr!("dispatch failed: {err}");
            }
        }
        if self.running == self.on_cpu {
            return None;
        }
        let switch = ContextSwitch {
            from: self.on_cpu,
            to: self.running,
        };
        self.on_cpu = self.running;
        crate::ktrace!("switch {:?} -> {:?}", switch.from, switch.to);
        Some(switch)
    }

    pub(crate) fn start(&mut self) -> Result<(), KernelError> {
        if self.started {
            return Err(KernelError::WrongState);
        }
        self.started = true;
        crate::kinfo!("scheduler started with {} ready tasks", self.ready.len());
        Ok(())
    }

    /// Moves the running task behind its equal-priority peers.
    pub(crate) fn yield_now(&mut self, id: TaskId) -> Result<(), KernelError> {
        if self.tcb(id)?.state != TaskState::RUNNING {
            return Err(KernelError::WrongState);
        }
        self.leave_state(id, StateFlag::Running)?;
        self.enter_state(id, StateFlag::Runnable)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Task lifecycle
    // -----------------------------------------------------------------------

    pub(crate) fn create_task(&mut self, meta: TaskMeta) -> Result<TaskId, KernelError> {
        self.check_priority(meta.priority)?;
        let id = self.tasks.insert_with(|_| Tcb::new(meta))?;
        crate::kinfo!("task {id} '{}' created at priority {}", meta.name, meta.priority);
        Ok(id)
    }

    pub(crate) fn delete_task(&mut self, id: TaskId) -> Result<(), KernelError> {
        if !self.tcb(id)?.state.is_dormant() {
            return Err(KernelError::WrongState);
        }
        self.tasks.remove(id);
        crate::kinfo!("task {id} deleted");
        Ok(())
    }

    pub(crate) fn activate(&mut self, id: TaskId) -> Result<(), KernelError> {
        let tcb = self.tcb_mut(id)?;
        if !tcb.state.is_dormant() {
            return Err(KernelError::WrongState);
        }
        tcb.base_priority = tcb.initial_priority;
        tcb.current_priority = tcb.initial_priority;
        tcb.wait_result = None;
        self.enter_state(id, StateFlag::Runnable)?;
        crate::kinfo!("task {id} activated");
        Ok(())
    }

    pub(crate) fn suspend(&mut self, id: TaskId) -> Result<(), KernelError> {
        self.enter_state(id, StateFlag::Suspended)
    }

    pub(crate) fn resume(&mut self, id: TaskId) -> Result<(), KernelError> {
        self.leave_state(id, StateFlag::Suspended)?;
        self.settle(id)
    }

    /// Returns a task to Dormant.
    ///
    /// Held mutexes are released newest first, handing each to its next
    /// waiter. If the task was itself blocked on a mutex, the holder of that
    /// mutex is re-evaluated once the task has left the queue.
    pub(crate) fn terminate(&mut self, id: TaskId) -> Result<(), KernelError> {
        if self.tcb(id)?.state.is_dormant() {
            return Err(KernelError::WrongState);
        }

        while let Some(&m) = self.tcb(id)?.owned_mutexes.last() {
            self.release_mutex(id, m)?;
        }

        let state = self.tcb(id)?.state;
        if state.contains(TaskState::RUNNING) {
            self.leave_state(id, StateFlag::Running)?;
        }
        if state.contains(TaskState::RUNNABLE) {
            self.leave_state(id, StateFlag::Runnable)?;
        }
        if state.contains(TaskState::WAITING) {
            let holder = self.blocking_holder(id);
            self.leave_state(id, StateFlag::Waiting)?;
            if let Some(holder) = holder {
                self.propagate(holder)?;
            }
        }
        if state.contains(TaskState::SUSPENDED) {
            self.leave_state(id, StateFlag::Suspended)?;
        }

        let tcb = self.tcb_mut(id)?;
        tcb.base_priority = tcb.initial_priority;
        tcb.current_priority = tcb.initial_priority;
        tcb.wait_result = None;
        crate::kinfo!("task {id} terminated");
        Ok(())
    }

    /// Changes a task's base priority and re-evaluates everything that
    /// depends on it.
    pub(crate) fn set_priority(&mut self, id: TaskId, priority: Priority) -> Result<(), KernelError> {
        self.check_priority(priority)?;
        let tcb = self.tcb(id)?;
        if tcb.state.is_dormant() {
            return Err(KernelError::WrongState);
        }
        let mut related: Vec<MutexId> = tcb.owned_mutexes.clone();
        related.extend(self.pending_mutex(id));
        for m in related {
            if let Some(MutexProtocol::Ceiling(ceiling)) = self.mutexes.get(m).map(|m| m.protocol) {
                if priority.is_more_urgent_than(ceiling) {
                    return Err(KernelError::InvalidParameter);
                }
            }
        }

        self.tcb_mut(id)?.base_priority = priority;
        crate::kdebug!("task {id}: base priority set to {priority}");
        self.propagate(id)
    }

    // -----------------------------------------------------------------------
    // Wait outcome and introspection
    // -----------------------------------------------------------------------

    /// Collects the outcome of a task's last wait.
    pub(crate) fn wait_outcome(&mut self, id: TaskId) -> Result<WaitStatus, KernelError> {
        let tcb = self.tcb_mut(id)?;
        match tcb.wait_result.take() {
            Some(Ok(())) => Ok(WaitStatus::Completed),
            Some(Err(err)) => Err(err),
            None if tcb.state.contains(TaskState::WAITING) => Ok(WaitStatus::Pending),
            None => Err(KernelError::WrongState),
        }
    }

    pub(crate) fn task_info(&self, id: TaskId) -> Result<TaskInfo, KernelError> {
        let tcb = self.tcb(id)?;
        Ok(TaskInfo {
            id,
            name: tcb.name,
            base_priority: tcb.base_priority,
            current_priority: tcb.current_priority,
            state: tcb.state,
            wait_reason: tcb.wait.map_or(WaitReason::None, |w| w.reason),
            pending_mutex: self.pending_mutex(id),
            owned_mutexes: tcb.owned_mutexes.clone(),
            deadline: tcb.wait.and_then(|w| w.deadline),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kernel() -> KernelState {
        KernelState::new(KernelConfig::new().with_priority_levels(16)).unwrap()
    }

    fn task(st: &mut KernelState, priority: u8) -> TaskId {
        st.create_task(TaskMeta::new("t").with_priority(Priority::new(priority)))
            .unwrap()
    }

    // -----------------------------------------------------------------------
    // enter_state / leave_state
    // -----------------------------------------------------------------------

    #[test]
    fn enter_runnable_twice_is_rejected() {
        let mut st = kernel();
        let t = task(&mut st, 3);
        st.enter_state(t, StateFlag::Runnable).unwrap();
        assert_eq!(st.enter_state(t, StateFlag::Runnable), Err(KernelError::WrongState));
        assert_eq!(st.ready.len(), 1);
        assert!(st.ready.bitmap_consistent());
    }

    #[test]
    fn leave_unheld_state_is_rejected() {
        let mut st = kernel();
        let t = task(&mut st, 3);
        assert_eq!(st.leave_state(t, StateFlag::Runnable), Err(KernelError::WrongState));
        assert_eq!(st.leave_state(t, StateFlag::Waiting), Err(KernelError::WrongState));
        assert_eq!(st.leave_state(t, StateFlag::Suspended), Err(KernelError::WrongState));
        assert!(st.tcb(t).unwrap().state.is_dormant());
    }

    #[test]
    fn suspend_dormant_is_rejected() {
        let mut st = kernel();
        let t = task(&mut st, 3);
        assert_eq!(st.suspend(t), Err(KernelError::WrongState));
    }

    #[test]
    fn suspend_runnable_leaves_ready_queue_and_resume_restores() {
        let mut st = kernel();
        let t = task(&mut st, 3);
        st.activate(t).unwrap();
        st.suspend(t).unwrap();
        assert_eq!(st.tcb(t).unwrap().state, TaskState::SUSPENDED);
        assert!(st.ready.is_empty());
        assert_eq!(st.suspend(t), Err(KernelError::WrongState));

        st.resume(t).unwrap();
        assert_eq!(st.tcb(t).unwrap().state, TaskState::RUNNABLE);
        assert_eq!(st.ready.peek(), Some(t));
        assert_eq!(st.resume(t), Err(KernelError::WrongState));
    }

    #[test]
    fn running_and_runnable_are_exclusive() {
        let mut st = kernel();
        let t = task(&mut st, 3);
        st.activate(t).unwrap();
        assert_eq!(st.enter_state(t, StateFlag::Running), Err(KernelError::WrongState));
        st.leave_state(t, StateFlag::Runnable).unwrap();
        st.enter_state(t, StateFlag::Running).unwrap();
        assert_eq!(st.running, Some(t));
        assert_eq!(st.enter_state(t, StateFlag::Runnable), Err(KernelError::WrongState));
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    #[test]
    fn no_dispatch_before_start() {
        let mut st = kernel();
        let t = task(&mut st, 3);
        st.activate(t).unwrap();
        assert_eq!(st.reschedule(), None);
        st.start().unwrap();
        assert_eq!(
            st.reschedule(),
            Some(ContextSwitch {
                from: None,
                to: Some(t)
            })
        );
        assert_eq!(st.start(), Err(KernelError::WrongState));
    }

    #[test]
    fn equal_priority_does_not_preempt() {
        let mut st = kernel();
        st.start().unwrap();
        let a = task(&mut st, 5);
        let b = task(&mut st, 5);
        st.activate(a).unwrap();
        st.reschedule();
        st.activate(b).unwrap();
        assert_eq!(st.reschedule(), None);
        assert_eq!(st.running, Some(a));
    }

    #[test]
    fn preempted_task_goes_to_bucket_tail() {
        let mut st = kernel();
        st.start().unwrap();
        let a = task(&mut st, 5);
        let b = task(&mut st, 5);
        let urgent = task(&mut st, 1);
        st.activate(a).unwrap();
        st.activate(b).unwrap();
        st.reschedule();
        assert_eq!(st.running, Some(a));

        st.activate(urgent).unwrap();
        st.reschedule();
        assert_eq!(st.running, Some(urgent));
        let bucket: Vec<TaskId> = st
            .ready
            .bucket(Priority::new(5))
            .unwrap()
            .iter(&st.tasks)
            .collect();
        assert_eq!(bucket, [b, a]);
    }

    #[test]
    fn yield_rotates_equal_priority() {
        let mut st = kernel();
        st.start().unwrap();
        let a = task(&mut st, 5);
        let b = task(&mut st, 5);
        st.activate(a).unwrap();
        st.activate(b).unwrap();
        st.reschedule();
        st.yield_now(a).unwrap();
        st.reschedule();
        assert_eq!(st.running, Some(b));
        assert_eq!(st.yield_now(a), Err(KernelError::WrongState));
    }

    #[test]
    fn create_rejects_out_of_range_priority() {
        let mut st = kernel();
        let meta = TaskMeta::new("x").with_priority(Priority::new(16));
        assert_eq!(st.create_task(meta), Err(KernelError::InvalidParameter));
    }

    #[test]
    fn delete_requires_dormant() {
        let mut st = kernel();
        let t = task(&mut st, 2);
        st.activate(t).unwrap();
        assert_eq!(st.delete_task(t), Err(KernelError::WrongState));
        st.terminate(t).unwrap();
        st.delete_task(t).unwrap();
        assert_eq!(st.activate(t), Err(KernelError::NotFound));
    }

    #[test]
    fn wait_outcome_without_wait_is_wrong_state() {
        let mut st = kernel();
        let t = task(&mut st, 2);
        assert_eq!(st.wait_outcome(t), Err(KernelError::WrongState));
    }
}
