//! Scheduling primitives.
//!
//! Contains the per-priority ready queues. Dispatch decisions built on top
//! of them (`pick_next`, preemption) live with the kernel state, which owns
//! the task arena the queues are threaded through.

use alloc::vec::Vec;

use crate::id::TaskId;
use crate::list::{LinkArena, LinkSlot, ListError, ListOwner, TaskList};
use crate::task::Priority;

/// Priority-indexed ready queues.
///
/// Maintains one FIFO bucket per priority level and a bitmap with bit `n`
/// set while bucket `n` is non-empty, so the most urgent ready level is a
/// single `trailing_zeros` regardless of how many tasks are ready.
pub struct ReadyQueues {
    buckets: Vec<TaskList>,
    bitmap: u64,
}

impl ReadyQueues {
    /// Creates empty ready queues for `levels` priority levels (at most 64).
    pub fn new(levels: u8) -> Self {
        debug_assert!(u32::from(levels) <= u64::BITS, "ready bitmap holds 64 levels");
        Self {
            buckets: (0..levels)
                .map(|level| TaskList::new(ListOwner::Ready(Priority::new(level))))
                .collect(),
            bitmap: 0,
        }
    }

    /// Number of priority levels.
    pub fn levels(&self) -> usize {
        self.buckets.len()
    }

    /// Appends a task to the tail of the bucket for `priority`.
    ///
    /// # Errors
    ///
    /// Returns [`ListError::AlreadyLinked`] if the task is already queued
    /// anywhere through its state link.
    ///
    /// # Panics
    ///
    /// Panics if `priority` is outside the configured levels.
    pub fn push_back<A: LinkArena + ?Sized>(
        &mut self,
        arena: &mut A,
        priority: Priority,
        id: TaskId,
    ) -> Result<(), ListError> {
        self.buckets[priority.index()].push_back(arena, id)?;
        self.bitmap |= 1u64 << priority.index();
        Ok(())
    }

    /// Removes a task from whichever bucket holds it.
    ///
    /// # Errors
    ///
    /// Returns [`ListError::NotLinked`] if the task is not ready-queued.
    pub fn remove<A: LinkArena + ?Sized>(
        &mut self,
        arena: &mut A,
        id: TaskId,
    ) -> Result<(), ListError> {
        let Some(ListOwner::Ready(priority)) = arena.link(id, LinkSlot::State).owner() else {
            return Err(ListError::NotLinked);
        };
        let bucket = self
            .buckets
            .get_mut(priority.index())
            .ok_or(ListError::NotLinked)?;
        bucket.remove(arena, id)?;
        if bucket.is_empty() {
            self.bitmap &= !(1u64 << priority.index());
        }
        Ok(())
    }

    /// The most urgent level with a ready task.
    #[allow(clippy::cast_possible_truncation)]
    pub fn highest(&self) -> Option<Priority> {
        (self.bitmap != 0).then(|| Priority::new(self.bitmap.trailing_zeros() as u8))
    }

    /// Head of the most urgent non-empty bucket, without removing it.
    pub fn peek(&self) -> Option<TaskId> {
        self.highest().and_then(|p| self.front(p))
    }

    /// Head of the bucket for `priority`.
    pub fn front(&self, priority: Priority) -> Option<TaskId> {
        self.buckets.get(priority.index()).and_then(TaskList::front)
    }

    /// The bucket for `priority`, for inspection.
    pub fn bucket(&self, priority: Priority) -> Option<&TaskList> {
        self.buckets.get(priority.index())
    }

    /// Returns `true` if any bucket has tasks.
    pub fn has_ready(&self) -> bool {
        self.bitmap != 0
    }

    /// Total number of ready tasks.
    pub fn len(&self) -> usize {
        self.buckets.iter().map(TaskList::len).sum()
    }

    /// Returns `true` if no task is ready.
    pub fn is_empty(&self) -> bool {
        !self.has_ready()
    }

    /// Returns `true` if the bitmap agrees with bucket occupancy.
    pub fn bitmap_consistent(&self) -> bool {
        self.buckets
            .iter()
            .enumerate()
            .all(|(level, bucket)| (self.bitmap >> level) & 1 == u64::from(!bucket.is_empty()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::list::test_arena::TestArena;

    fn t(n: u32) -> TaskId {
        TaskId::new(n)
    }

    fn p(level: u8) -> Priority {
        Priority::new(level)
    }

    /// Removes and returns the head of the most urgent bucket.
    fn pop(rq: &mut ReadyQueues, arena: &mut TestArena) -> Option<(Priority, TaskId)> {
        let priority = rq.highest()?;
        let id = rq.peek()?;
        rq.remove(arena, id).unwrap();
        Some((priority, id))
    }

    // -----------------------------------------------------------------------
    // ReadyQueues basic behavior
    // -----------------------------------------------------------------------

    #[test]
    fn empty_on_creation() {
        let mut arena = TestArena::new(1);
        let mut rq = ReadyQueues::new(8);
        assert!(!rq.has_ready());
        assert_eq!(rq.highest(), None);
        assert_eq!(pop(&mut rq, &mut arena), None);
    }

    #[test]
    fn most_urgent_first() {
        let mut arena = TestArena::new(4);
        let mut rq = ReadyQueues::new(8);
        rq.push_back(&mut arena, p(5), t(1)).unwrap();
        rq.push_back(&mut arena, p(0), t(2)).unwrap();
        rq.push_back(&mut arena, p(7), t(3)).unwrap();

        assert_eq!(pop(&mut rq, &mut arena), Some((p(0), t(2))));
        assert_eq!(pop(&mut rq, &mut arena), Some((p(5), t(1))));
        assert_eq!(pop(&mut rq, &mut arena), Some((p(7), t(3))));
        assert_eq!(pop(&mut rq, &mut arena), None);
    }

    #[test]
    fn fifo_within_priority() {
        let mut arena = TestArena::new(4);
        let mut rq = ReadyQueues::new(8);
        rq.push_back(&mut arena, p(3), t(1)).unwrap();
        rq.push_back(&mut arena, p(3), t(2)).unwrap();
        rq.push_back(&mut arena, p(3), t(3)).unwrap();

        assert_eq!(pop(&mut rq, &mut arena), Some((p(3), t(1))));
        assert_eq!(pop(&mut rq, &mut arena), Some((p(3), t(2))));
        assert_eq!(pop(&mut rq, &mut arena), Some((p(3), t(3))));
    }

    #[test]
    fn has_ready_tracks_state() {
        let mut arena = TestArena::new(2);
        let mut rq = ReadyQueues::new(8);
        assert!(!rq.has_ready());

        rq.push_back(&mut arena, p(1), t(1)).unwrap();
        assert!(rq.has_ready());
        assert_eq!(rq.len(), 1);

        pop(&mut rq, &mut arena);
        assert!(!rq.has_ready());
        assert!(rq.is_empty());
    }

    // -----------------------------------------------------------------------
    // Bitmap maintenance
    // -----------------------------------------------------------------------

    #[test]
    fn bitmap_clears_only_when_bucket_empties() {
        let mut arena = TestArena::new(3);
        let mut rq = ReadyQueues::new(8);
        rq.push_back(&mut arena, p(2), t(0)).unwrap();
        rq.push_back(&mut arena, p(2), t(1)).unwrap();
        rq.push_back(&mut arena, p(6), t(2)).unwrap();

        rq.remove(&mut arena, t(0)).unwrap();
        assert_eq!(rq.highest(), Some(p(2)));
        rq.remove(&mut arena, t(1)).unwrap();
        assert_eq!(rq.highest(), Some(p(6)));
        assert!(rq.bitmap_consistent());
    }

    #[test]
    fn remove_finds_bucket_from_link() {
        let mut arena = TestArena::new(2);
        let mut rq = ReadyQueues::new(8);
        rq.push_back(&mut arena, p(4), t(0)).unwrap();
        rq.remove(&mut arena, t(0)).unwrap();
        assert_eq!(rq.remove(&mut arena, t(0)), Err(ListError::NotLinked));
        assert_eq!(rq.remove(&mut arena, t(1)), Err(ListError::NotLinked));
    }

    #[test]
    fn double_push_is_rejected() {
        let mut arena = TestArena::new(1);
        let mut rq = ReadyQueues::new(8);
        rq.push_back(&mut arena, p(1), t(0)).unwrap();
        assert_eq!(
            rq.push_back(&mut arena, p(2), t(0)),
            Err(ListError::AlreadyLinked)
        );
        assert_eq!(rq.len(), 1);
        assert!(rq.bitmap_consistent());
    }

    #[test]
    fn all_64_levels_are_addressable() {
        let mut arena = TestArena::new(1);
        let mut rq = ReadyQueues::new(64);
        rq.push_back(&mut arena, p(63), t(0)).unwrap();
        assert_eq!(rq.highest(), Some(p(63)));
        assert_eq!(rq.levels(), 64);
    }

    #[test]
    fn shuffled_pushes_pop_in_urgency_order() {
        // xorshift64 keeps the shuffle deterministic.
        let mut state = 0x9E37_79B9_7F4A_7C15u64;
        let mut levels: Vec<u8> = (0..32).collect();
        for i in (1..levels.len()).rev() {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            #[allow(clippy::cast_possible_truncation)]
            let j = (state % (i as u64 + 1)) as usize;
            levels.swap(i, j);
        }

        let mut arena = TestArena::new(32);
        let mut rq = ReadyQueues::new(32);
        for level in &levels {
            rq.push_back(&mut arena, p(*level), t(u32::from(*level))).unwrap();
        }
        for expected in 0..32u8 {
            assert_eq!(
                pop(&mut rq, &mut arena),
                Some((p(expected), t(u32::from(expected))))
            );
        }
    }
}
