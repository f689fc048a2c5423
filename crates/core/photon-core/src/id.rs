//! Type-safe identifiers for kernel objects.
//!
//! Each identifier is the index of the object's slot in its table. The
//! newtypes keep tasks, mutexes, wait queues and semaphores from being mixed
//! up at compile time.

use core::fmt;

use crate::table::ObjectId;

macro_rules! object_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name(u32);

        impl $name {
            #[doc = concat!("Creates a new `", stringify!($name), "`.")]
            pub const fn new(val: u32) -> Self {
                Self(val)
            }

            /// Returns the raw `u32` value.
            pub const fn as_u32(self) -> u32 {
                self.0
            }

            /// Returns the value as `usize` (convenience for indexing).
            pub const fn as_usize(self) -> usize {
                self.0 as usize
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl ObjectId for $name {
            #[allow(clippy::cast_possible_truncation)]
            fn from_index(index: usize) -> Self {
                Self(index as u32)
            }

            fn index(self) -> usize {
                self.as_usize()
            }
        }
    };
}

object_id! {
    /// Task identifier, stable from creation until the task is deleted.
    TaskId
}

object_id! {
    /// Mutex identifier.
    MutexId
}

object_id! {
    /// Wait-queue identifier.
    ///
    /// Mutexes and semaphores own a wait queue each; standalone event queues
    /// are created with [`Kernel::wait_queue_create`](crate::Kernel::wait_queue_create).
    WaitQueueId
}

object_id! {
    /// Counting-semaphore identifier.
    SemaphoreId
}
