//! Mutexes with priority inheritance.
//!
//! A task's current priority is always derived, never assigned: it is the
//! most urgent of its base priority, the ceilings of the ceiling mutexes it
//! holds, and the current priorities of the tasks waiting on the inherit
//! mutexes it holds. Because those waiters carry their own inherited
//! priority, the rule is transitive along blocking chains.
//!
//! Anything that can change one of the inputs (a task starting or ending a
//! wait on a mutex, ownership moving, a base priority change) re-evaluates
//! the affected task with [`propagate`](KernelState::propagate), which walks
//! the chain of holders until a priority stops changing.

use alloc::vec::Vec;

use crate::error::KernelError;
use crate::id::{MutexId, TaskId, WaitQueueId};
use crate::state::KernelState;
use crate::task::{Priority, TaskState};
use crate::wait::{QueueOrder, QueueOwner, Timeout, WaitStatus, WaitTarget};

/// How holding a mutex affects the holder's priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MutexProtocol {
    /// Holding the mutex never changes the holder's priority.
    None,
    /// The holder runs at least at the priority of its most urgent waiter.
    #[default]
    Inherit,
    /// The holder runs at least at the ceiling while it holds the mutex.
    /// Tasks whose base priority is more urgent than the ceiling may not
    /// lock it.
    Ceiling(Priority),
}

/// Creation parameters for a mutex.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutexMeta {
    pub name: &'static str,
    pub protocol: MutexProtocol,
    /// Service order of the waiters.
    pub order: QueueOrder,
}

impl MutexMeta {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            protocol: MutexProtocol::Inherit,
            order: QueueOrder::Priority,
        }
    }

    #[must_use]
    pub const fn with_protocol(mut self, protocol: MutexProtocol) -> Self {
        self.protocol = protocol;
        self
    }

    #[must_use]
    pub const fn with_order(mut self, order: QueueOrder) -> Self {
        self.order = order;
        self
    }
}

impl Default for MutexMeta {
    fn default() -> Self {
        Self::new("<anon>")
    }
}

/// Snapshot of a mutex.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutexInfo {
    pub id: MutexId,
    pub name: &'static str,
    pub protocol: MutexProtocol,
    pub holder: Option<TaskId>,
    /// Waiters in the order they will be served.
    pub waiters: Vec<TaskId>,
}

pub(crate) struct MutexCb {
    pub(crate) name: &'static str,
    pub(crate) protocol: MutexProtocol,
    pub(crate) holder: Option<TaskId>,
    pub(crate) queue: WaitQueueId,
}

impl KernelState {
    // -----------------------------------------------------------------------
    // Priority evaluation
    // -----------------------------------------------------------------------

    /// The mutex whose wait queue the task is linked into.
    pub(crate) fn pending_mutex(&self, id: TaskId) -> Option<MutexId> {
        let WaitTarget::Queue(q) = self.tasks.get(id)?.wait?.target else {
            return None;
        };
        match self.queues.get(q)?.owner {
            QueueOwner::Mutex(m) => Some(m),
            QueueOwner::Event | QueueOwner::Semaphore(_) => None,
        }
    }

    /// The task holding the mutex this task is blocked on.
    pub(crate) fn blocking_holder(&self, id: TaskId) -> Option<TaskId> {
        let m = self.pending_mutex(id)?;
        self.mutexes.get(m)?.holder
    }

    /// Computes what a task's current priority should be.
    pub(crate) fn evaluate_priority(&self, id: TaskId) -> Result<Priority, KernelError> {
        let tcb = self.tcb(id)?;
        let mut priority = tcb.base_priority;
        for &m in &tcb.owned_mutexes {
            let Some(mutex) = self.mutexes.get(m) else {
                continue;
            };
            match mutex.protocol {
                MutexProtocol::None => {}
                MutexProtocol::Ceiling(ceiling) => priority = priority.most_urgent(ceiling),
                MutexProtocol::Inherit => {
                    if let Some(waiter) = self.highest_waiter(mutex.queue) {
                        priority = priority.most_urgent(waiter);
                    }
                }
            }
        }
        Ok(priority)
    }

    /// Re-evaluates a task's current priority and moves it to the matching
    /// position in whatever queue it sits in.
    ///
    /// Returns `true` if the priority changed.
    pub(crate) fn update_priority(&mut self, id: TaskId) -> Result<bool, KernelError> {
        let new = self.evaluate_priority(id)?;
        let tcb = self.tcb(id)?;
        let old = tcb.current_priority;
        if new == old {
            return Ok(false);
        }
        let state = tcb.state;
        let wait = tcb.wait;

        if state.contains(TaskState::RUNNABLE) {
            self.ready.remove(&mut self.tasks, id)?;
            self.tcb_mut(id)?.current_priority = new;
            self.ready.push_back(&mut self.tasks, new, id)?;
        } else {
            self.tcb_mut(id)?.current_priority = new;
        }

        if let Some(WaitTarget::Queue(q)) = wait.map(|w| w.target) {
            if let Some(queue) = self.queues.get_mut(q) {
                if queue.order == QueueOrder::Priority {
                    queue.waiters.remove(&mut self.tasks, id)?;
                    queue.waiters.insert_before_first(&mut self.tasks, id, |tasks, other| {
                        new.is_more_urgent_than(tasks.priority_of(other))
                    })?;
                }
            }
        }

        crate::kdebug!("task {id}: priority {old} -> {new}");
        Ok(true)
    }

    /// Re-evaluates `start` and then each holder along its blocking chain
    /// for as long as priorities keep changing.
    ///
    /// The walk is bounded by the task-table capacity; exceeding it means
    /// the chain loops back on itself.
    pub(crate) fn propagate(&mut self, start: TaskId) -> Result<(), KernelError> {
        let mut task = start;
        for _ in 0..=self.tasks.capacity() {
            if !self.update_priority(task)? {
                return Ok(());
            }
            match self.blocking_holder(task) {
                Some(holder) => task = holder,
                None => return Ok(()),
            }
        }
        crate::kerr!("priority propagation from task {start} does not terminate");
        Err(KernelError::WrongState)
    }

    /// Returns `true` if `task` is `target` or transitively blocked on it.
    fn blocks_on(&self, task: TaskId, target: TaskId) -> bool {
        let mut cursor = Some(task);
        for _ in 0..=self.tasks.capacity() {
            match cursor {
                Some(t) if t == target => return true,
                Some(t) => cursor = self.blocking_holder(t),
                None => return false,
            }
        }
        true
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    pub(crate) fn mutex_create(&mut self, meta: MutexMeta) -> Result<MutexId, KernelError> {
        if let MutexProtocol::Ceiling(ceiling) = meta.protocol {
            self.check_priority(ceiling)?;
        }
        let queue = self.create_queue(QueueOwner::Event, meta.order)?;
        let id = match self.mutexes.insert_with(|_| MutexCb {
            name: meta.name,
            protocol: meta.protocol,
            holder: None,
            queue,
        }) {
            Ok(id) => id,
            Err(err) => {
                self.queues.remove(queue);
                return Err(err);
            }
        };
        if let Some(cb) = self.queues.get_mut(queue) {
            cb.owner = QueueOwner::Mutex(id);
        }
        crate::kinfo!("mutex {id} '{}' created ({:?})", meta.name, meta.protocol);
        Ok(id)
    }

    /// Locks `m` for `id`, blocking according to `timeout` if it is held.
    pub(crate) fn mutex_lock(
        &mut self,
        id: TaskId,
        m: MutexId,
        timeout: Timeout,
    ) -> Result<WaitStatus, KernelError> {
        let mutex = self.mutexes.get(m).ok_or(KernelError::NotFound)?;
        let (protocol, holder, queue) = (mutex.protocol, mutex.holder, mutex.queue);
        self.blocking_flag(id)?;
        if let MutexProtocol::Ceiling(ceiling) = protocol {
            if self.tcb(id)?.base_priority.is_more_urgent_than(ceiling) {
                return Err(KernelError::InvalidParameter);
            }
        }

        let Some(holder) = holder else {
            self.acquire(id, m)?;
            return Ok(WaitStatus::Completed);
        };
        if holder == id {
            return Err(KernelError::WrongState);
        }
        if timeout.is_poll() {
            return Err(KernelError::Timeout);
        }
        if self.blocks_on(holder, id) {
            crate::kwarn!("task {id}: locking mutex {m} would deadlock");
            return Err(KernelError::WrongState);
        }

        self.begin_wait(id, WaitTarget::Queue(queue), timeout)?;
        crate::kdebug!("task {id} blocks on mutex {m} held by task {holder}");
        self.propagate(holder)?;
        Ok(WaitStatus::Pending)
    }

    pub(crate) fn mutex_unlock(&mut self, id: TaskId, m: MutexId) -> Result<(), KernelError> {
        self.tcb(id)?;
        let mutex = self.mutexes.get(m).ok_or(KernelError::NotFound)?;
        if mutex.holder != Some(id) {
            return Err(KernelError::WrongState);
        }
        self.release_mutex(id, m)
    }

    fn acquire(&mut self, id: TaskId, m: MutexId) -> Result<(), KernelError> {
        let mutex = self.mutexes.get_mut(m).ok_or(KernelError::NotFound)?;
        mutex.holder = Some(id);
        self.tcb_mut(id)?.owned_mutexes.push(m);
        crate::kdebug!("task {id} acquires mutex {m}");
        self.propagate(id)
    }

    /// Gives up ownership of `m`, handing it to the head of its queue.
    ///
    /// The releasing task keeps whatever it still inherits from the other
    /// mutexes it holds.
    pub(crate) fn release_mutex(&mut self, id: TaskId, m: MutexId) -> Result<(), KernelError> {
        let mutex = self.mutexes.get_mut(m).ok_or(KernelError::NotFound)?;
        if mutex.holder != Some(id) {
            return Err(KernelError::WrongState);
        }
        mutex.holder = None;
        let queue = mutex.queue;
        self.tcb_mut(id)?.owned_mutexes.retain(|&owned| owned != m);
        crate::kdebug!("task {id} releases mutex {m}");

        if let Some(next) = self.queue_front(queue) {
            self.wake(next, Ok(()))?;
            self.acquire(next, m)?;
        }
        self.propagate(id)
    }

    /// Deletes a mutex, locked or not. Waiters observe
    /// [`KernelError::Deleted`].
    pub(crate) fn mutex_delete(&mut self, m: MutexId) -> Result<usize, KernelError> {
        let mutex = self.mutexes.get_mut(m).ok_or(KernelError::NotFound)?;
        let holder = mutex.holder.take();
        let queue = mutex.queue;
        if let Some(holder) = holder {
            self.tcb_mut(holder)?.owned_mutexes.retain(|&owned| owned != m);
        }

        let woken = self.wake_all(queue, Err(KernelError::Deleted))?;
        self.queues.remove(queue);
        self.mutexes.remove(m);
        crate::kinfo!("mutex {m} deleted, {woken} waiters released");

        if let Some(holder) = holder {
            self.propagate(holder)?;
        }
        Ok(woken)
    }

    pub(crate) fn mutex_info(&self, m: MutexId) -> Result<MutexInfo, KernelError> {
        let mutex = self.mutexes.get(m).ok_or(KernelError::NotFound)?;
        Ok(MutexInfo {
            id: m,
            name: mutex.name,
            protocol: mutex.protocol,
            holder: mutex.holder,
            waiters: self.queue_waiters(mutex.queue),
        })
    }
}
