//! Scenario file format.
//!
//! A scenario declares a kernel configuration, the objects it needs and a
//! list of steps:
//!
//! ```toml
//! [kernel]
//! priority_levels = 16
//!
//! [[task]]
//! name = "low"
//! priority = 9
//!
//! [[mutex]]
//! name = "m"
//! order = "fifo"
//!
//! [[step]]
//! op = "lock"
//! task = "low"
//! mutex = "m"
//!
//! [[step]]
//! op = "expect"
//! task = "low"
//! priority = 9
//! ```

use anyhow::{Context, Result};
use photon_core::config::{DEFAULT_MAX_TASKS, DEFAULT_PRIORITY_LEVELS};
use photon_core::{KernelConfig, KernelError, QueueOrder, Timeout};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize)]
pub struct Scenario {
    /// Free-form description printed by `run`.
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub kernel: KernelSection,
    #[serde(default, rename = "task")]
    pub tasks: Vec<TaskDecl>,
    #[serde(default, rename = "mutex")]
    pub mutexes: Vec<MutexDecl>,
    #[serde(default, rename = "semaphore")]
    pub semaphores: Vec<SemaphoreDecl>,
    #[serde(default, rename = "queue")]
    pub queues: Vec<QueueDecl>,
    #[serde(default, rename = "step")]
    pub steps: Vec<Step>,
}

impl Scenario {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }
}

/// The `[kernel]` table. Mirrors [`KernelConfig`].
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KernelSection {
    #[serde(default = "default_priority_levels")]
    pub priority_levels: u8,
    #[serde(default = "default_max_tasks")]
    pub max_tasks: usize,
    pub max_mutexes: Option<usize>,
    pub max_semaphores: Option<usize>,
    pub max_wait_queues: Option<usize>,
    /// Enable dispatch before the first step.
    #[serde(default = "default_true")]
    pub start: bool,
}

impl Default for KernelSection {
    fn default() -> Self {
        Self {
            priority_levels: DEFAULT_PRIORITY_LEVELS,
            max_tasks: DEFAULT_MAX_TASKS,
            max_mutexes: None,
            max_semaphores: None,
            max_wait_queues: None,
            start: true,
        }
    }
}

impl KernelSection {
    pub fn config(&self) -> KernelConfig {
        let mut config = KernelConfig::new()
            .with_priority_levels(self.priority_levels)
            .with_max_tasks(self.max_tasks);
        if let Some(max) = self.max_mutexes {
            config = config.with_max_mutexes(max);
        }
        if let Some(max) = self.max_semaphores {
            config = config.with_max_semaphores(max);
        }
        if let Some(max) = self.max_wait_queues {
            config = config.with_max_wait_queues(max);
        }
        config
    }
}

fn default_priority_levels() -> u8 {
    DEFAULT_PRIORITY_LEVELS
}

fn default_max_tasks() -> usize {
    DEFAULT_MAX_TASKS
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskDecl {
    pub name: String,
    pub priority: u8,
    /// Activate the task before the first step.
    #[serde(default = "default_true")]
    pub activate: bool,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProtocolDecl {
    None,
    #[default]
    Inherit,
    Ceiling,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderDecl {
    Fifo,
    #[default]
    Priority,
}

impl From<OrderDecl> for QueueOrder {
    fn from(order: OrderDecl) -> Self {
        match order {
            OrderDecl::Fifo => Self::Fifo,
            OrderDecl::Priority => Self::Priority,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MutexDecl {
    pub name: String,
    #[serde(default)]
    pub protocol: ProtocolDecl,
    /// Required for the ceiling protocol.
    pub ceiling: Option<u8>,
    #[serde(default)]
    pub order: OrderDecl,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SemaphoreDecl {
    pub name: String,
    #[serde(default)]
    pub initial: u32,
    pub max: u32,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueueDecl {
    pub name: String,
    #[serde(default)]
    pub order: OrderDecl,
}

/// One `[[step]]` entry.
#[derive(Debug, Deserialize)]
pub struct Step {
    #[serde(flatten)]
    pub op: Op,
    /// The error the operation must fail with.
    #[serde(default)]
    pub error: Option<ErrorName>,
    /// Issue the operation from interrupt context.
    #[serde(default)]
    pub interrupt: bool,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Op {
    Activate { task: String },
    Suspend { task: String },
    Resume { task: String },
    Terminate { task: String },
    SetPriority { task: String, priority: u8 },
    /// `timeout` in ticks; omitted waits forever, 0 polls.
    Lock { task: String, mutex: String, timeout: Option<u32> },
    TryLock { task: String, mutex: String },
    Unlock { task: String, mutex: String },
    DeleteMutex { mutex: String },
    Wait { task: String, queue: String, timeout: Option<u32> },
    SignalOne { queue: String },
    SignalAll { queue: String },
    Take { task: String, semaphore: String, timeout: Option<u32> },
    Give { semaphore: String },
    Sleep { task: String, ticks: u32 },
    ReleaseWait { task: String },
    Yield { task: String },
    Tick {
        #[serde(default = "default_ticks")]
        count: u32,
    },
    Expect(Expectation),
}

fn default_ticks() -> u32 {
    1
}

/// Converts a scenario timeout into a kernel timeout.
pub fn timeout(ticks: Option<u32>) -> Timeout {
    match ticks {
        None => Timeout::Forever,
        Some(0) => Timeout::Poll,
        Some(n) => Timeout::Ticks(n),
    }
}

/// Assertions checked by an `expect` step. Every field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Expectation {
    /// Name of the running task, or `"idle"`.
    pub running: Option<String>,
    /// Task the task-level fields below refer to.
    pub task: Option<String>,
    /// Current priority of `task`.
    pub priority: Option<u8>,
    pub base_priority: Option<u8>,
    /// State of `task` as displayed, e.g. `"waiting+suspended"`.
    pub state: Option<String>,
    /// Outcome of the last wait of `task` (consumed): `"completed"`,
    /// `"pending"` or an error name.
    pub outcome: Option<String>,
    /// Mutex the `holder` field refers to.
    pub mutex: Option<String>,
    /// Holder of `mutex`, or `"none"`.
    pub holder: Option<String>,
    /// Semaphore the `count` field refers to.
    pub semaphore: Option<String>,
    pub count: Option<u32>,
    pub now: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorName {
    InvalidParameter,
    WrongState,
    WrongContext,
    Timeout,
    Deleted,
    Released,
    NotFound,
    NoResources,
}

impl ErrorName {
    pub fn of(err: KernelError) -> Self {
        match err {
            KernelError::InvalidParameter => Self::InvalidParameter,
            KernelError::WrongState => Self::WrongState,
            KernelError::WrongContext => Self::WrongContext,
            KernelError::Timeout => Self::Timeout,
            KernelError::Deleted => Self::Deleted,
            KernelError::Released => Self::Released,
            KernelError::NotFound => Self::NotFound,
            KernelError::NoResources => Self::NoResources,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidParameter => "invalid_parameter",
            Self::WrongState => "wrong_state",
            Self::WrongContext => "wrong_context",
            Self::Timeout => "timeout",
            Self::Deleted => "deleted",
            Self::Released => "released",
            Self::NotFound => "not_found",
            Self::NoResources => "no_resources",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_scenario() {
        let scenario = Scenario::parse(
            r#"
            description = "demo"

            [kernel]
            priority_levels = 8

            [[task]]
            name = "a"
            priority = 3
            activate = false

            [[mutex]]
            name = "m"
            protocol = "ceiling"
            ceiling = 1
            order = "fifo"

            [[semaphore]]
            name = "s"
            max = 2

            [[queue]]
            name = "q"

            [[step]]
            op = "lock"
            task = "a"
            mutex = "m"
            timeout = 0
            error = "timeout"

            [[step]]
            op = "tick"

            [[step]]
            op = "expect"
            running = "idle"
            "#,
        )
        .unwrap();

        assert_eq!(scenario.kernel.priority_levels, 8);
        assert!(scenario.kernel.start);
        assert!(!scenario.tasks[0].activate);
        assert!(matches!(scenario.mutexes[0].protocol, ProtocolDecl::Ceiling));
        assert_eq!(scenario.semaphores[0].initial, 0);
        assert_eq!(scenario.steps.len(), 3);
        assert_eq!(scenario.steps[0].error, Some(ErrorName::Timeout));
        assert!(matches!(scenario.steps[1].op, Op::Tick { count: 1 }));
        assert!(matches!(&scenario.steps[2].op, Op::Expect(e) if e.running.as_deref() == Some("idle")));
    }

    #[test]
    fn unknown_op_is_rejected() {
        let err = Scenario::parse(
            r#"
            [[step]]
            op = "explode"
            "#,
        );
        assert!(err.is_err());
    }

    #[test]
    fn timeouts_map_to_kernel_timeouts() {
        assert_eq!(timeout(None), Timeout::Forever);
        assert_eq!(timeout(Some(0)), Timeout::Poll);
        assert_eq!(timeout(Some(4)), Timeout::Ticks(4));
    }

    #[test]
    fn kernel_section_builds_config() {
        let section = KernelSection {
            max_mutexes: Some(3),
            ..KernelSection::default()
        };
        let config = section.config();
        assert_eq!(config.max_mutexes, 3);
        assert_eq!(config.priority_levels, DEFAULT_PRIORITY_LEVELS);
    }
}
