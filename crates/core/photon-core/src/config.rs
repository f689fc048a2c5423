//! Kernel configuration.
//!
//! Capacities and the number of priority levels are fixed when the kernel is
//! created. Object tables never grow past these limits.

use crate::error::KernelError;

/// Upper bound on priority levels (width of the ready bitmap).
pub const MAX_PRIORITY_LEVELS: u8 = 64;

/// Default number of priority levels.
pub const DEFAULT_PRIORITY_LEVELS: u8 = 32;

/// Default priority given to tasks created without one.
pub const DEFAULT_TASK_PRIORITY: u8 = 16;

/// Default task table capacity.
pub const DEFAULT_MAX_TASKS: usize = 64;

/// Default mutex table capacity.
pub const DEFAULT_MAX_MUTEXES: usize = 32;

/// Default semaphore table capacity.
pub const DEFAULT_MAX_SEMAPHORES: usize = 32;

/// Default wait-queue table capacity.
///
/// Every mutex and semaphore owns one wait queue, so this bounds the sum of
/// mutexes, semaphores and standalone event queues.
pub const DEFAULT_MAX_WAIT_QUEUES: usize = 96;

/// Sizing parameters for a [`Kernel`](crate::Kernel).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    /// Number of priority levels; priorities range over `0..priority_levels`.
    pub priority_levels: u8,
    /// Maximum number of task control blocks.
    pub max_tasks: usize,
    /// Maximum number of mutexes.
    pub max_mutexes: usize,
    /// Maximum number of counting semaphores.
    pub max_semaphores: usize,
    /// Maximum number of wait queues (including those owned by mutexes and semaphores).
    pub max_wait_queues: usize,
}

impl KernelConfig {
    /// Returns the default configuration.
    pub const fn new() -> Self {
        Self {
            priority_levels: DEFAULT_PRIORITY_LEVELS,
            max_tasks: DEFAULT_MAX_TASKS,
            max_mutexes: DEFAULT_MAX_MUTEXES,
            max_semaphores: DEFAULT_MAX_SEMAPHORES,
            max_wait_queues: DEFAULT_MAX_WAIT_QUEUES,
        }
    }

    /// Sets the number of priority levels.
    #[must_use]
    pub const fn with_priority_levels(mut self, levels: u8) -> Self {
        self.priority_levels = levels;
        self
    }

    /// Sets the task table capacity.
    #[must_use]
    pub const fn with_max_tasks(mut self, max: usize) -> Self {
        self.max_tasks = max;
        self
    }

    /// Sets the mutex table capacity.
    #[must_use]
    pub const fn with_max_mutexes(mut self, max: usize) -> Self {
        self.max_mutexes = max;
        self
    }

    /// Sets the semaphore table capacity.
    #[must_use]
    pub const fn with_max_semaphores(mut self, max: usize) -> Self {
        self.max_semaphores = max;
        self
    }

    /// Sets the wait-queue table capacity.
    #[must_use]
    pub const fn with_max_wait_queues(mut self, max: usize) -> Self {
        self.max_wait_queues = max;
        self
    }

    /// Checks that every field is in range.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::InvalidParameter`] when the number of priority
    /// levels is zero or exceeds [`MAX_PRIORITY_LEVELS`], or when the task
    /// table has no room for a single task.
    pub const fn validate(&self) -> Result<(), KernelError> {
        if self.priority_levels == 0 || self.priority_levels > MAX_PRIORITY_LEVELS {
            return Err(KernelError::InvalidParameter);
        }
        if self.max_tasks == 0 {
            return Err(KernelError::InvalidParameter);
        }
        Ok(())
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        assert_eq!(KernelConfig::default().validate(), Ok(()));
        assert!(DEFAULT_TASK_PRIORITY < DEFAULT_PRIORITY_LEVELS);
    }

    #[test]
    fn priority_levels_are_bounded() {
        let zero = KernelConfig::new().with_priority_levels(0);
        assert_eq!(zero.validate(), Err(KernelError::InvalidParameter));

        let wide = KernelConfig::new().with_priority_levels(MAX_PRIORITY_LEVELS + 1);
        assert_eq!(wide.validate(), Err(KernelError::InvalidParameter));

        let max = KernelConfig::new().with_priority_levels(MAX_PRIORITY_LEVELS);
        assert_eq!(max.validate(), Ok(()));
    }

    #[test]
    fn empty_task_table_is_rejected() {
        let cfg = KernelConfig::new().with_max_tasks(0);
        assert_eq!(cfg.validate(), Err(KernelError::InvalidParameter));
    }
}
