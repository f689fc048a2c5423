//! Task types: priorities, the state bit set and the task control block.

use alloc::vec::Vec;
use core::fmt;

use bitflags::bitflags;

use crate::config::DEFAULT_TASK_PRIORITY;
use crate::error::KernelError;
use crate::id::{MutexId, TaskId};
use crate::list::{Link, LinkArena, LinkSlot};
use crate::table::Table;
use crate::wait::WaitInfo;

/// Scheduling priority.
///
/// Lower numeric values are more urgent: `Priority::HIGHEST` (0) preempts
/// everything else. The derived ordering follows the numeric value, so the
/// *minimum* of a set of priorities is its most urgent member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Priority(u8);

impl Priority {
    /// The most urgent level.
    pub const HIGHEST: Self = Self(0);

    /// Creates a priority from its level.
    pub const fn new(level: u8) -> Self {
        Self(level)
    }

    /// Returns the raw level.
    pub const fn as_u8(self) -> u8 {
        self.0
    }

    /// Returns the level as an index into per-priority arrays.
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Returns `true` if `self` preempts `other`.
    pub const fn is_more_urgent_than(self, other: Self) -> bool {
        self.0 < other.0
    }

    /// Returns whichever of the two is more urgent.
    #[must_use]
    pub const fn most_urgent(self, other: Self) -> Self {
        if other.0 < self.0 { other } else { self }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

bitflags! {
    /// Scheduling state of a task.
    ///
    /// The empty set is Dormant. `RUNNABLE` and `RUNNING` never appear
    /// together; `SUSPENDED` combines with `WAITING` for a task that was
    /// suspended while blocked.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TaskState: u8 {
        /// In a ready bucket, eligible for dispatch.
        const RUNNABLE = 1 << 0;
        /// Currently dispatched.
        const RUNNING = 1 << 1;
        /// Blocked on a wait queue or a timed sleep.
        const WAITING = 1 << 2;
        /// Administratively suspended.
        const SUSPENDED = 1 << 3;
    }
}

impl TaskState {
    /// Not activated, or terminated.
    pub const DORMANT: Self = Self::empty();

    /// Returns `true` for the Dormant state.
    pub const fn is_dormant(self) -> bool {
        self.is_empty()
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("dormant");
        }
        let names = [
            (Self::RUNNABLE, "runnable"),
            (Self::RUNNING, "running"),
            (Self::WAITING, "waiting"),
            (Self::SUSPENDED, "suspended"),
        ];
        let mut first = true;
        for (flag, name) in names {
            if self.contains(flag) {
                if !first {
                    f.write_str("+")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

/// One state flag: the unit the kernel's `enter_state`/`leave_state`
/// primitives add to or remove from a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateFlag {
    /// Ready-queue membership.
    Runnable,
    /// Being the dispatched task.
    Running,
    /// Wait-queue and timeout membership.
    Waiting,
    /// Suspension overlay.
    Suspended,
}

impl StateFlag {
    /// The bit this flag sets in [`TaskState`].
    pub const fn bits(self) -> TaskState {
        match self {
            Self::Runnable => TaskState::RUNNABLE,
            Self::Running => TaskState::RUNNING,
            Self::Waiting => TaskState::WAITING,
            Self::Suspended => TaskState::SUSPENDED,
        }
    }
}

/// Why a task is waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WaitReason {
    /// Not waiting.
    None,
    /// Blocked acquiring a mutex.
    Mutex,
    /// Blocked taking a semaphore.
    Semaphore,
    /// Blocked on a standalone event queue.
    Event,
    /// Timed sleep.
    Sleep,
}

impl fmt::Display for WaitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::Mutex => "mutex",
            Self::Semaphore => "semaphore",
            Self::Event => "event",
            Self::Sleep => "sleep",
        })
    }
}

/// Metadata for a created task.
#[derive(Debug, Clone, Copy)]
pub struct TaskMeta {
    /// Human-readable name for debugging.
    pub name: &'static str,
    /// Base priority applied on every activation.
    pub priority: Priority,
}

impl Default for TaskMeta {
    fn default() -> Self {
        Self::new("<anon>")
    }
}

impl TaskMeta {
    /// Creates metadata with a name and default priority.
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            priority: Priority::new(DEFAULT_TASK_PRIORITY),
        }
    }

    /// Sets the priority.
    #[must_use]
    pub const fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// Snapshot of a task's scheduling state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    /// Task identifier.
    pub id: TaskId,
    /// Name given at creation.
    pub name: &'static str,
    /// Priority set by the creator or `set_priority`.
    pub base_priority: Priority,
    /// Effective priority, including inheritance and ceilings.
    pub current_priority: Priority,
    /// State bit set.
    pub state: TaskState,
    /// What the task waits for, if anything.
    pub wait_reason: WaitReason,
    /// Mutex the task is blocked on.
    pub pending_mutex: Option<MutexId>,
    /// Held mutexes, oldest acquisition first.
    pub owned_mutexes: Vec<MutexId>,
    /// Absolute tick at which the current wait expires.
    pub deadline: Option<u64>,
}

/// Task control block.
#[derive(Debug)]
pub(crate) struct Tcb {
    pub(crate) name: &'static str,
    pub(crate) initial_priority: Priority,
    pub(crate) base_priority: Priority,
    pub(crate) current_priority: Priority,
    pub(crate) state: TaskState,
    pub(crate) wait: Option<WaitInfo>,
    /// Outcome of the last completed wait, until collected.
    pub(crate) wait_result: Option<Result<(), KernelError>>,
    pub(crate) owned_mutexes: Vec<MutexId>,
    pub(crate) state_link: Link,
    pub(crate) timeout_link: Link,
}

impl Tcb {
    pub(crate) fn new(meta: TaskMeta) -> Self {
        Self {
            name: meta.name,
            initial_priority: meta.priority,
            base_priority: meta.priority,
            current_priority: meta.priority,
            state: TaskState::DORMANT,
            wait: None,
            wait_result: None,
            owned_mutexes: Vec::new(),
            state_link: Link::UNLINKED,
            timeout_link: Link::UNLINKED,
        }
    }
}

impl Table<TaskId, Tcb> {
    /// Current priority of `id`; missing tasks sort last.
    pub(crate) fn priority_of(&self, id: TaskId) -> Priority {
        self.get(id)
            .map_or(Priority::new(u8::MAX), |tcb| tcb.current_priority)
    }

    /// Armed deadline of `id`.
    pub(crate) fn deadline_of(&self, id: TaskId) -> Option<u64> {
        self.get(id).and_then(|tcb| tcb.wait).and_then(|wait| wait.deadline)
    }
}

impl LinkArena for Table<TaskId, Tcb> {
    fn link(&self, id: TaskId, slot: LinkSlot) -> &Link {
        let Some(tcb) = self.get(id) else {
            panic!("task {id} is linked but has no control block");
        };
        match slot {
            LinkSlot::State => &tcb.state_link,
            LinkSlot::Timeout => &tcb.timeout_link,
        }
    }

    fn link_mut(&mut self, id: TaskId, slot: LinkSlot) -> &mut Link {
        let Some(tcb) = self.get_mut(id) else {
            panic!("task {id} is linked but has no control block");
        };
        match slot {
            LinkSlot::State => &mut tcb.state_link,
            LinkSlot::Timeout => &mut tcb.timeout_link,
        }
    }
}
