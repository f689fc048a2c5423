//! Kernel logging.
//!
//! The kernel never prints. Each `kerr!`/`kwarn!`/`kinfo!`/`kdebug!`/
//! `ktrace!` call builds a [`Record`] and hands it to the sink registered
//! with [`set_log_fn`]. Until a sink is registered, records are dropped.
//! [`set_max_level`] filters before the sink is called, so disabled levels
//! cost one relaxed load.
//!
//! Levels are used consistently: task lifecycle at info, inheritance,
//! handover and timeouts at debug, every state primitive at trace, and
//! detected inconsistencies at error.

use core::fmt;
use core::sync::atomic::{AtomicPtr, AtomicU8, Ordering};

/// Severity of a [`Record`]. Lower is more severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum LogLevel {
    /// Kernel bookkeeping is inconsistent.
    Error = 1,
    /// A request was refused for a reason worth surfacing.
    Warn = 2,
    /// Task lifecycle and scheduler start.
    Info = 3,
    /// Priority changes, handovers and expiries.
    Debug = 4,
    /// Individual state transitions and context switches.
    Trace = 5,
}

impl LogLevel {
    const ALL: [Self; 5] = [Self::Error, Self::Warn, Self::Info, Self::Debug, Self::Trace];

    /// Five-character label, padded so columns line up.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Error => "ERROR",
            Self::Warn => "WARN ",
            Self::Info => "INFO ",
            Self::Debug => "DEBUG",
            Self::Trace => "TRACE",
        }
    }

    fn from_raw(raw: u8) -> Self {
        Self::ALL
            .into_iter()
            .find(|level| *level as u8 == raw)
            .unwrap_or(if raw == 0 { Self::Error } else { Self::Trace })
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name().trim_end())
    }
}

/// One log message as delivered to the sink.
#[derive(Clone, Copy)]
pub struct Record<'a> {
    /// Severity.
    pub level: LogLevel,
    /// Module that emitted the message, e.g. `photon_core::mutex`.
    pub module: &'static str,
    /// The formatted message.
    pub args: fmt::Arguments<'a>,
}

impl Record<'_> {
    /// The emitting module without the crate prefix.
    pub fn short_module(&self) -> &'static str {
        self.module
            .split_once("::")
            .map_or(self.module, |(_, rest)| rest)
    }
}

impl fmt::Display for Record<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.level.name(), self.short_module(), self.args)
    }
}

static MAX_LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

/// Sets the most verbose level delivered to the sink.
pub fn set_max_level(level: LogLevel) {
    MAX_LEVEL.store(level as u8, Ordering::Relaxed);
}

/// The most verbose level currently delivered.
pub fn max_level() -> LogLevel {
    LogLevel::from_raw(MAX_LEVEL.load(Ordering::Relaxed))
}

/// A log sink.
pub type LogFn = fn(&Record<'_>);

fn discard(_record: &Record<'_>) {}

static SINK: AtomicPtr<()> = AtomicPtr::new(discard as *mut ());

/// Installs the log sink, replacing any previous one.
///
/// # Safety
///
/// The sink is called with the kernel lock held and, on a real port,
/// with interrupts masked. It must not block and must not call back into
/// the kernel.
pub unsafe fn set_log_fn(f: LogFn) {
    SINK.store(f as *mut (), Ordering::Release);
}

fn sink() -> LogFn {
    let ptr = SINK.load(Ordering::Acquire);
    // SAFETY: SINK only ever holds `discard` or a pointer stored by `set_log_fn`.
    unsafe { core::mem::transmute::<*mut (), LogFn>(ptr) }
}

#[doc(hidden)]
pub fn _log(level: LogLevel, module: &'static str, args: fmt::Arguments<'_>) {
    if level <= max_level() {
        sink()(&Record {
            level,
            module,
            args,
        });
    }
}

/// Logs at an explicit [`LogLevel`].
#[macro_export]
macro_rules! klog {
    ($level:expr, $($arg:tt)*) => {
        $crate::log::_log($level, module_path!(), format_args!($($arg)*))
    };
}

/// Logs at [`LogLevel::Error`].
#[macro_export]
macro_rules! kerr {
    ($($arg:tt)*) => { $crate::klog!($crate::log::LogLevel::Error, $($arg)*) };
}

/// Logs at [`LogLevel::Warn`].
#[macro_export]
macro_rules! kwarn {
    ($($arg:tt)*) => { $crate::klog!($crate::log::LogLevel::Warn, $($arg)*) };
}

/// Logs at [`LogLevel::Info`].
#[macro_export]
macro_rules! kinfo {
    ($($arg:tt)*) => { $crate::klog!($crate::log::LogLevel::Info, $($arg)*) };
}

/// Logs at [`LogLevel::Debug`].
#[macro_export]
macro_rules! kdebug {
    ($($arg:tt)*) => { $crate::klog!($crate::log::LogLevel::Debug, $($arg)*) };
}

/// Logs at [`LogLevel::Trace`].
#[macro_export]
macro_rules! ktrace {
    ($($arg:tt)*) => { $crate::klog!($crate::log::LogLevel::Trace, $($arg)*) };
}
