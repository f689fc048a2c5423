//! Counting semaphores.
//!
//! A thin consumer of the wait-queue interface: no priority inheritance,
//! waiters served in queue order, and a permit released while tasks wait
//! goes straight to the first of them instead of through the counter.

use crate::error::KernelError;
use crate::id::{SemaphoreId, TaskId, WaitQueueId};
use crate::state::KernelState;
use crate::wait::{QueueOrder, QueueOwner, Timeout, WaitStatus, WaitTarget};

pub(crate) struct SemaphoreCb {
    pub(crate) count: u32,
    pub(crate) max: u32,
    pub(crate) queue: WaitQueueId,
}

impl KernelState {
    pub(crate) fn semaphore_create(
        &mut self,
        initial: u32,
        max: u32,
        order: QueueOrder,
    ) -> Result<SemaphoreId, KernelError> {
        if max == 0 || initial > max {
            return Err(KernelError::InvalidParameter);
        }
        let queue = self.create_queue(QueueOwner::Event, order)?;
        let id = match self.semaphores.insert_with(|_| SemaphoreCb {
            count: initial,
            max,
            queue,
        }) {
            Ok(id) => id,
            Err(err) => {
                self.queues.remove(queue);
                return Err(err);
            }
        };
        if let Some(cb) = self.queues.get_mut(queue) {
            cb.owner = QueueOwner::Semaphore(id);
        }
        crate::kinfo!("semaphore {id} created ({initial}/{max})");
        Ok(id)
    }

    pub(crate) fn semaphore_take(
        &mut self,
        id: TaskId,
        s: SemaphoreId,
        timeout: Timeout,
    ) -> Result<WaitStatus, KernelError> {
        let sem = self.semaphores.get(s).ok_or(KernelError::NotFound)?;
        let (count, queue) = (sem.count, sem.queue);
        self.blocking_flag(id)?;

        if count > 0 {
            if let Some(sem) = self.semaphores.get_mut(s) {
                sem.count -= 1;
            }
            return Ok(WaitStatus::Completed);
        }
        if timeout.is_poll() {
            return Err(KernelError::Timeout);
        }
        self.begin_wait(id, WaitTarget::Queue(queue), timeout)?;
        Ok(WaitStatus::Pending)
    }

    /// Releases one permit.
    ///
    /// Returns the task the permit was handed to, if one was waiting.
    pub(crate) fn semaphore_give(&mut self, s: SemaphoreId) -> Result<Option<TaskId>, KernelError> {
        let sem = self.semaphores.get(s).ok_or(KernelError::NotFound)?;
        let queue = sem.queue;
        if let Some(next) = self.queue_front(queue) {
            self.wake(next, Ok(()))?;
            crate::kdebug!("semaphore {s}: permit handed to task {next}");
            return Ok(Some(next));
        }

        let sem = self.semaphores.get_mut(s).ok_or(KernelError::NotFound)?;
        if sem.count >= sem.max {
            return Err(KernelError::WrongState);
        }
        sem.count += 1;
        Ok(None)
    }

    pub(crate) fn semaphore_delete(&mut self, s: SemaphoreId) -> Result<usize, KernelError> {
        let queue = self.semaphores.get(s).ok_or(KernelError::NotFound)?.queue;
        let woken = self.wake_all(queue, Err(KernelError::Deleted))?;
        self.queues.remove(queue);
        self.semaphores.remove(s);
        crate::kinfo!("semaphore {s} deleted, {woken} waiters released");
        Ok(woken)
    }

    pub(crate) fn semaphore_count(&self, s: SemaphoreId) -> Result<u32, KernelError> {
        self.semaphores
            .get(s)
            .map(|sem| sem.count)
            .ok_or(KernelError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;
    use crate::task::{Priority, TaskMeta, TaskState, WaitReason};

    fn kernel() -> KernelState {
        KernelState::new(KernelConfig::new().with_priority_levels(16)).unwrap()
    }

    fn ready_task(st: &mut KernelState, priority: u8) -> TaskId {
        let id = st
            .create_task(TaskMeta::new("t").with_priority(Priority::new(priority)))
            .unwrap();
        st.activate(id).unwrap();
        id
    }

    #[test]
    fn create_validates_bounds() {
        let mut st = kernel();
        assert_eq!(
            st.semaphore_create(0, 0, QueueOrder::Fifo),
            Err(KernelError::InvalidParameter)
        );
        assert_eq!(
            st.semaphore_create(3, 2, QueueOrder::Fifo),
            Err(KernelError::InvalidParameter)
        );
        assert!(st.queues.is_empty());
    }

    #[test]
    fn take_consumes_permits_then_polls_out() {
        let mut st = kernel();
        let s = st.semaphore_create(2, 2, QueueOrder::Fifo).unwrap();
        let t = ready_task(&mut st, 4);
        assert_eq!(st.semaphore_take(t, s, Timeout::Poll), Ok(WaitStatus::Completed));
        assert_eq!(st.semaphore_take(t, s, Timeout::Poll), Ok(WaitStatus::Completed));
        assert_eq!(st.semaphore_take(t, s, Timeout::Poll), Err(KernelError::Timeout));
        assert_eq!(st.semaphore_count(s), Ok(0));
    }

    #[test]
    fn give_hands_permit_to_waiter() {
        let mut st = kernel();
        let s = st.semaphore_create(0, 1, QueueOrder::Fifo).unwrap();
        let t = ready_task(&mut st, 4);
        assert_eq!(st.semaphore_take(t, s, Timeout::Forever), Ok(WaitStatus::Pending));
        assert_eq!(st.task_info(t).unwrap().wait_reason, WaitReason::Semaphore);

        assert_eq!(st.semaphore_give(s), Ok(Some(t)));
        assert_eq!(st.semaphore_count(s), Ok(0));
        assert_eq!(st.tcb(t).unwrap().state, TaskState::RUNNABLE);
        assert_eq!(st.wait_outcome(t), Ok(WaitStatus::Completed));
    }

    #[test]
    fn give_at_max_is_wrong_state() {
        let mut st = kernel();
        let s = st.semaphore_create(1, 1, QueueOrder::Fifo).unwrap();
        assert_eq!(st.semaphore_give(s), Err(KernelError::WrongState));
        assert_eq!(st.semaphore_count(s), Ok(1));
    }

    #[test]
    fn take_timeout_and_delete_outcomes() {
        let mut st = kernel();
        let s = st.semaphore_create(0, 4, QueueOrder::Priority).unwrap();
        let a = ready_task(&mut st, 4);
        let b = ready_task(&mut st, 4);
        st.semaphore_take(a, s, Timeout::Ticks(1)).unwrap();
        st.tick().unwrap();
        assert_eq!(st.wait_outcome(a), Err(KernelError::Timeout));

        st.semaphore_take(b, s, Timeout::Forever).unwrap();
        assert_eq!(st.semaphore_delete(s), Ok(1));
        assert_eq!(st.wait_outcome(b), Err(KernelError::Deleted));
        assert_eq!(st.semaphore_count(s), Err(KernelError::NotFound));
    }

    #[test]
    fn semaphore_queue_is_not_an_event_queue() {
        let mut st = kernel();
        let s = st.semaphore_create(0, 1, QueueOrder::Fifo).unwrap();
        let q = st.semaphores.get(s).unwrap().queue;
        let t = ready_task(&mut st, 4);
        assert_eq!(st.wait_on(t, q, Timeout::Forever), Err(KernelError::WrongState));
        assert_eq!(st.signal_one(q), Err(KernelError::WrongState));
    }
}
