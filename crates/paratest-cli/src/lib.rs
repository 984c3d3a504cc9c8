//! Command-line surface for Paratest embedders.
//!
//! A test binary wires its registry and calls [`run_main`]:
//!
//! ```no_run
//! use paratest_core::{FileRegistry, ParameterMatrix};
//!
//! fn registry() -> FileRegistry {
//!     let mut registry = FileRegistry::new();
//!     registry.test_file("tests/smoke.rs", |s| {
//!         s.test("works", |_ctx| Ok(()));
//!     });
//!     registry
//! }
//!
//! fn main() -> std::process::ExitCode {
//!     paratest_cli::run_main(&registry(), ParameterMatrix::new())
//! }
//! ```
//!
//! The flag set mirrors the engine's configuration surface; everything else
//! (signal wiring, custom reporters) stays in the embedder's hands via
//! [`paratest_execution::run`].

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};

use paratest_core::{Config, FileRegistry, ParameterMatrix, Shard, UpdateSnapshots};
use paratest_execution::{worker_entry, RunMode, RunStatus, StopHandle};
use paratest_reporting::{ListReporter, Reporter, SummaryReporter};

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum UpdateSnapshotsArg {
    All,
    None,
    Missing,
}

impl From<UpdateSnapshotsArg> for UpdateSnapshots {
    fn from(value: UpdateSnapshotsArg) -> Self {
        match value {
            UpdateSnapshotsArg::All => UpdateSnapshots::All,
            UpdateSnapshotsArg::None => UpdateSnapshots::None,
            UpdateSnapshotsArg::Missing => UpdateSnapshots::Missing,
        }
    }
}

/// Flags understood by a Paratest test binary.
#[derive(Debug, Parser)]
#[command(name = "paratest", version, about = "Parallel test-suite runner")]
pub struct Arguments {
    /// Maximum number of concurrent worker processes
    #[arg(long, short = 'j')]
    pub workers: Option<usize>,

    /// Per-test timeout in milliseconds (0 disables)
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Whole-run timeout in milliseconds (0 disables)
    #[arg(long)]
    pub global_timeout: Option<u64>,

    /// Retries per test after an unexpected failure
    #[arg(long)]
    pub retries: Option<u32>,

    /// Run every test this many times
    #[arg(long)]
    pub repeat_each: Option<u32>,

    /// Stop after this many unexpected results (0 = never)
    #[arg(long, short = 'x')]
    pub max_failures: Option<usize>,

    /// Fail the run if any test or suite is focused
    #[arg(long)]
    pub forbid_only: bool,

    /// Shard selection, e.g. "2/4" (1-based)
    #[arg(long)]
    pub shard: Option<String>,

    /// Only run tests whose full title matches this regex
    #[arg(long, short = 'g')]
    pub grep: Option<String>,

    /// Snapshot update behavior
    #[arg(long, value_enum)]
    pub update_snapshots: Option<UpdateSnapshotsArg>,

    /// Root directory for per-test artifacts
    #[arg(long)]
    pub output: Option<PathBuf>,

    /// List generated tests without running them
    #[arg(long)]
    pub list: bool,
}

impl Arguments {
    pub fn to_config(&self) -> anyhow::Result<Config> {
        let mut config = Config::default();
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(timeout) = self.timeout {
            config.timeout_ms = timeout;
        }
        if let Some(global_timeout) = self.global_timeout {
            config.global_timeout_ms = global_timeout;
        }
        if let Some(retries) = self.retries {
            config.retries = retries;
        }
        if let Some(repeat_each) = self.repeat_each {
            config.repeat_each = repeat_each;
        }
        if let Some(max_failures) = self.max_failures {
            config.max_failures = max_failures;
        }
        config.forbid_only = self.forbid_only;
        if let Some(shard) = &self.shard {
            config.shard = Some(Shard::parse(shard)?);
        }
        config.grep = self.grep.clone();
        if let Some(update) = self.update_snapshots {
            config.update_snapshots = update.into();
        }
        if let Some(output) = &self.output {
            config.output_dir = output.clone();
        }
        config.validate()?;
        Ok(config)
    }
}

/// Parse the command line, run the suite, map the result to an exit code.
/// Must be called before anything else in `main`: it doubles as the worker
/// entry point for spawned copies of the binary.
pub fn run_main(registry: &FileRegistry, matrix: ParameterMatrix) -> ExitCode {
    worker_entry(registry);

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Arguments::parse();
    let config = match args.to_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::from(1);
        }
    };

    let (mode, reporters): (RunMode, Vec<Box<dyn Reporter>>) = if args.list {
        (RunMode::List, vec![Box::new(ListReporter)])
    } else {
        (RunMode::Execute, vec![Box::new(SummaryReporter::new())])
    };

    let status = paratest_execution::run(
        config,
        registry,
        matrix,
        reporters,
        StopHandle::new(),
        mode,
    );
    exit_code(status)
}

fn exit_code(status: RunStatus) -> ExitCode {
    ExitCode::from(status.exit_code() as u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arguments_map_onto_config() {
        let args = Arguments::parse_from([
            "paratest",
            "--workers",
            "3",
            "--retries",
            "2",
            "--shard",
            "2/4",
            "--grep",
            "smoke",
            "--forbid-only",
        ]);
        let config = args.to_config().unwrap();
        assert_eq!(config.workers, 3);
        assert_eq!(config.retries, 2);
        assert_eq!(config.shard, Some(Shard { current: 1, total: 4 }));
        assert_eq!(config.grep.as_deref(), Some("smoke"));
        assert!(config.forbid_only);
    }

    #[test]
    fn bad_shard_is_rejected() {
        let args = Arguments::parse_from(["paratest", "--shard", "5/4"]);
        assert!(args.to_config().is_err());
    }

    #[test]
    fn defaults_survive_empty_command_line() {
        let args = Arguments::parse_from(["paratest"]);
        let config = args.to_config().unwrap();
        assert!(config.workers >= 1);
        assert_eq!(config.retries, 0);
        assert!(!args.list);
    }
}
