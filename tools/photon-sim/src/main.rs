//! Host simulator for the Photon scheduler.
//!
//! Usage:
//!   photon-sim run <scenario.toml>            - Run one scenario, tracing every step
//!   photon-sim run <scenario.toml> -l debug   - Also print kernel debug logs
//!   photon-sim check <scenario.toml>...       - Run scenarios quietly, report PASS/FAIL

mod runner;
mod scenario;

use std::path::PathBuf;

use anyhow::{Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use photon_core::log::{self, LogLevel, Record};

use crate::scenario::Scenario;

#[derive(Parser)]
#[command(name = "photon-sim")]
#[command(about = "Run Photon scheduler scenarios on the host")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a scenario and trace every step
    Run {
        /// Scenario file
        scenario: PathBuf,

        /// Most verbose kernel log level to print
        #[arg(short, long, value_enum, default_value_t = Level::Warn)]
        log_level: Level,
    },

    /// Run scenarios without tracing and report the result of each
    Check {
        /// Scenario files
        #[arg(required = true)]
        scenarios: Vec<PathBuf>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Level {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<Level> for LogLevel {
    fn from(level: Level) -> Self {
        match level {
            Level::Error => Self::Error,
            Level::Warn => Self::Warn,
            Level::Info => Self::Info,
            Level::Debug => Self::Debug,
            Level::Trace => Self::Trace,
        }
    }
}

fn stderr_log(record: &Record<'_>) {
    eprintln!("{record}");
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            scenario,
            log_level,
        } => {
            log::set_max_level(log_level.into());
            // SAFETY: `stderr_log` only writes to stderr and never re-enters the kernel.
            unsafe { log::set_log_fn(stderr_log) };

            let loaded = Scenario::load(&scenario)?;
            println!("==> {}", scenario.display());
            if let Some(description) = &loaded.description {
                println!("    {}", description.trim());
            }
            runner::execute(&loaded, true)?;
            println!("==> {} steps passed", loaded.steps.len());
        }
        Commands::Check { scenarios } => {
            let mut failed = 0;
            for path in &scenarios {
                let outcome = Scenario::load(path).and_then(|s| runner::execute(&s, false));
                match outcome {
                    Ok(()) => println!("PASS {}", path.display()),
                    Err(err) => {
                        failed += 1;
                        println!("FAIL {}: {err:#}", path.display());
                    }
                }
            }
            if failed > 0 {
                bail!("{failed} of {} scenarios failed", scenarios.len());
            }
        }
    }

    Ok(())
}
