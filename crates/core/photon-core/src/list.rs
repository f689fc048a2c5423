//! Intrusive ordered task lists.
//!
//! Ready buckets, wait queues and the timeout list are doubly-linked lists
//! threaded through the task control blocks. Each task carries two links:
//! a *state* link (one ready bucket or one wait queue at a time) and a
//! *timeout* link. A link records which list owns it, so insertion into a
//! second list and removal from the wrong list are both rejected.
//!
//! The lists never own the tasks. Every operation borrows the task arena
//! through [`LinkArena`], which keeps the borrow checker happy when the list
//! and the arena live side by side in the kernel state.

use core::fmt;

use crate::id::{TaskId, WaitQueueId};
use crate::task::Priority;

/// Which of a task's two links a list threads through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkSlot {
    /// Ready bucket or wait queue membership.
    State,
    /// Timeout list membership.
    Timeout,
}

/// Identity of a list, stored in each member's link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListOwner {
    /// Ready bucket for one priority level.
    Ready(Priority),
    /// A wait queue.
    Queue(WaitQueueId),
    /// The kernel's deadline-ordered timeout list.
    Timeout,
}

impl ListOwner {
    /// The link slot lists with this owner thread through.
    pub const fn slot(self) -> LinkSlot {
        match self {
            Self::Timeout => LinkSlot::Timeout,
            Self::Ready(_) | Self::Queue(_) => LinkSlot::State,
        }
    }
}

/// Per-task list hook.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Link {
    prev: Option<TaskId>,
    next: Option<TaskId>,
    owner: Option<ListOwner>,
}

impl Link {
    /// A link that belongs to no list.
    pub const UNLINKED: Self = Self {
        prev: None,
        next: None,
        owner: None,
    };

    /// The list this link is threaded into, if any.
    pub const fn owner(&self) -> Option<ListOwner> {
        self.owner
    }

    /// Returns `true` if the link belongs to a list.
    pub const fn is_linked(&self) -> bool {
        self.owner.is_some()
    }
}

/// Storage that can hand out a task's links by id.
pub trait LinkArena {
    /// Returns the link in `slot` for task `id`.
    fn link(&self, id: TaskId, slot: LinkSlot) -> &Link;
    /// Returns the link in `slot` for task `id`, mutably.
    fn link_mut(&mut self, id: TaskId, slot: LinkSlot) -> &mut Link;
}

/// Errors from list manipulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListError {
    /// The task is already threaded into a list through this slot.
    AlreadyLinked,
    /// The task is not a member of this list.
    NotLinked,
}

impl fmt::Display for ListError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyLinked => f.write_str("task already linked"),
            Self::NotLinked => f.write_str("task not in this list"),
        }
    }
}

impl From<ListError> for crate::error::KernelError {
    fn from(_: ListError) -> Self {
        Self::WrongState
    }
}

/// A doubly-linked list of tasks.
///
/// Insertion at the tail and ordered insertion are O(n) worst case for the
/// ordered variant and O(1) otherwise; removal of a known member is O(1).
#[derive(Debug)]
pub struct TaskList {
    owner: ListOwner,
    head: Option<TaskId>,
    tail: Option<TaskId>,
    len: usize,
}

impl TaskList {
    /// Creates an empty list identified by `owner`.
    pub const fn new(owner: ListOwner) -> Self {
        Self {
            owner,
            head: None,
            tail: None,
            len: 0,
        }
    }

    /// The identity recorded in member links.
    pub const fn owner(&self) -> ListOwner {
        self.owner
    }

    /// Number of members.
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the list has no members.
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// First member.
    pub const fn front(&self) -> Option<TaskId> {
        self.head
    }

    /// Last member.
    pub const fn back(&self) -> Option<TaskId> {
        self.tail
    }

    /// Returns `true` if `id` is a member of this list.
    pub fn contains<A: LinkArena + ?Sized>(&self, arena: &A, id: TaskId) -> bool {
        arena.link(id, self.owner.slot()).owner == Some(self.owner)
    }

    /// Appends `id` at the tail.
    ///
    /// # Errors
    ///
    /// Returns [`ListError::AlreadyLinked`] if the task's link is in use.
    pub fn push_back<A: LinkArena + ?Sized>(
        &mut self,
        arena: &mut A,
        id: TaskId,
    ) -> Result<(), ListError> {
        self.link_before(arena, id, None)
    }

    /// Inserts `id` before the first member for which `goes_before` returns
    /// `true`, or at the tail if there is none.
    ///
    /// Passing a strict comparison keeps equal keys in insertion order.
    ///
    /// # Errors
    ///
    /// Returns [`ListError::AlreadyLinked`] if the task's link is in use.
    pub fn insert_before_first<A, F>(
        &mut self,
        arena: &mut A,
        id: TaskId,
        mut goes_before: F,
    ) -> Result<(), ListError>
    where
        A: LinkArena + ?Sized,
        F: FnMut(&A, TaskId) -> bool,
    {
        let slot = self.owner.slot();
        let mut cursor = self.head;
        while let Some(member) = cursor {
            if goes_before(&*arena, member) {
                break;
            }
            cursor = arena.link(member, slot).next;
        }
        self.link_before(arena, id, cursor)
    }

    /// Unlinks `id`.
    ///
    /// # Errors
    ///
    /// Returns [`ListError::NotLinked`] if `id` is not a member.
    pub fn remove<A: LinkArena + ?Sized>(
        &mut self,
        arena: &mut A,
        id: TaskId,
    ) -> Result<(), ListError> {
        let slot = self.owner.slot();
        let link = *arena.link(id, slot);
        if link.owner != Some(self.owner) {
            return Err(ListError::NotLinked);
        }
        match link.prev {
            Some(prev) => arena.link_mut(prev, slot).next = link.next,
            None => self.head = link.next,
        }
        match link.next {
            Some(next) => arena.link_mut(next, slot).prev = link.prev,
            None => self.tail = link.prev,
        }
        *arena.link_mut(id, slot) = Link::UNLINKED;
        self.len -= 1;
        Ok(())
    }

    /// Unlinks and returns the first member.
    pub fn pop_front<A: LinkArena + ?Sized>(&mut self, arena: &mut A) -> Option<TaskId> {
        let head = self.head?;
        self.remove(arena, head).ok()?;
        Some(head)
    }

    /// Iterates members front to back.
    ///
    /// The iterator is lazy and borrows the arena; call `iter` again to
    /// restart from the head.
    pub fn iter<'a, A: LinkArena + ?Sized>(&self, arena: &'a A) -> Iter<'a, A> {
        Iter {
            arena,
            slot: self.owner.slot(),
            next: self.head,
            remaining: self.len,
        }
    }

    fn link_before<A: LinkArena + ?Sized>(
        &mut self,
        arena: &mut A,
        id: TaskId,
        before: Option<TaskId>,
    ) -> Result<(), ListError> {
        let slot = self.owner.slot();
        if arena.link(id, slot).is_linked() {
            return Err(ListError::AlreadyLinked);
        }
        let prev = match before {
            Some(next) => arena.link(next, slot).prev,
            None => self.tail,
        };
        *arena.link_mut(id, slot) = Link {
            prev,
            next: before,
            owner: Some(self.owner),
        };
        match prev {
            Some(prev) => arena.link_mut(prev, slot).next = Some(id),
            None => self.head = Some(id),
        }
        match before {
            Some(next) => arena.link_mut(next, slot).prev = Some(id),
            None => self.tail = Some(id),
        }
        self.len += 1;
        Ok(())
    }
}

/// Front-to-back iterator over a [`TaskList`].
pub struct Iter<'a, A: ?Sized> {
    arena: &'a A,
    slot: LinkSlot,
    next: Option<TaskId>,
    remaining: usize,
}

impl<A: LinkArena + ?Sized> Iterator for Iter<'_, A> {
    type Item = TaskId;

    fn next(&mut self) -> Option<TaskId> {
        let current = self.next?;
        self.next = self.arena.link(current, self.slot).next;
        self.remaining = self.remaining.saturating_sub(1);
        Some(current)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

/// A plain vector of links for exercising lists without a kernel.
#[cfg(test)]
pub(crate) mod test_arena {
    use alloc::vec;
    use alloc::vec::Vec;

    use super::{Link, LinkArena, LinkSlot};
    use crate::id::TaskId;

    pub(crate) struct TestArena {
        links: Vec<[Link; 2]>,
    }

    impl TestArena {
        pub(crate) fn new(tasks: usize) -> Self {
            Self {
                links: vec![[Link::UNLINKED; 2]; tasks],
            }
        }
    }

    const fn index(slot: LinkSlot) -> usize {
        match slot {
            LinkSlot::State => 0,
            LinkSlot::Timeout => 1,
        }
    }

    impl LinkArena for TestArena {
        fn link(&self, id: TaskId, slot: LinkSlot) -> &Link {
            &self.links[id.as_usize()][index(slot)]
        }

        fn link_mut(&mut self, id: TaskId, slot: LinkSlot) -> &mut Link {
            &mut self.links[id.as_usize()][index(slot)]
        }
    }
}
