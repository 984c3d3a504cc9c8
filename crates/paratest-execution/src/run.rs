//! Top-level run orchestration: load, generate, dispatch, report, exit.

use paratest_core::{generate, Config, ErrorPayload, FileRegistry, Outcome, ParameterMatrix, RunPlan};
use paratest_reporting::{Multiplexer, Reporter};
use tracing::debug;

use crate::dispatch::{Dispatcher, StopCause, StopHandle};
use crate::runner;
use crate::workers::{ProcessLauncher, WorkerLauncher};

/// Overall disposition of a run, mapped onto process exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// Every test ended with its expected status (flaky and skipped count).
    Passed,
    /// Unexpected results, no tests, or a failed load.
    Failed,
    /// Externally interrupted.
    Interrupted,
    /// The global deadline fired.
    TimedOut,
}

impl RunStatus {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunStatus::Passed => 0,
            RunStatus::Failed | RunStatus::TimedOut => 1,
            RunStatus::Interrupted => 130,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    Execute,
    /// Generate and report every test without executing anything.
    List,
}

/// Worker-process guard. Call first thing in `main`: when the process was
/// spawned as a worker this runs the worker loop against `registry` and
/// exits; otherwise it returns immediately.
pub fn worker_entry(registry: &FileRegistry) {
    if std::env::var_os(crate::ipc::WORKER_ENV).is_some() {
        let code = runner::worker_main(registry);
        std::process::exit(code);
    }
}

/// Run with the production process launcher (re-executes the current
/// binary).
pub fn run(
    config: Config,
    registry: &FileRegistry,
    matrix: ParameterMatrix,
    reporters: Vec<Box<dyn Reporter>>,
    stop: StopHandle,
    mode: RunMode,
) -> RunStatus {
    let launcher = match ProcessLauncher::current_exe() {
        Ok(launcher) => launcher,
        Err(e) => {
            let mut reporter = Multiplexer::new(reporters);
            reporter.on_error(&ErrorPayload::from_message(e.to_string()));
            reporter.on_end();
            return RunStatus::Failed;
        }
    };
    run_with_launcher(&launcher, config, registry, matrix, reporters, stop, mode)
}

/// Run against any launcher; the seam the dispatcher tests use.
pub fn run_with_launcher(
    launcher: &dyn WorkerLauncher,
    config: Config,
    registry: &FileRegistry,
    matrix: ParameterMatrix,
    reporters: Vec<Box<dyn Reporter>>,
    stop: StopHandle,
    mode: RunMode,
) -> RunStatus {
    let mut reporter = Multiplexer::new(reporters);

    if let Err(e) = config.validate() {
        reporter.on_error(&ErrorPayload::from_message(e.to_string()));
        reporter.on_end();
        return RunStatus::Failed;
    }

    let fixtures = match registry.load_fixtures() {
        Ok(fixtures) => fixtures,
        Err(e) => {
            reporter.on_error(&ErrorPayload::from_message(e.to_string()));
            reporter.on_end();
            return RunStatus::Failed;
        }
    };

    let plan = match generate(&config, registry, &fixtures, &matrix) {
        Ok(plan) => plan,
        Err(e) => {
            reporter.on_error(&ErrorPayload::from_message(e.to_string()));
            reporter.on_end();
            return RunStatus::Failed;
        }
    };

    reporter.on_begin(&config, &plan);

    if mode == RunMode::List {
        reporter.on_end();
        return if plan.cases.is_empty() {
            RunStatus::Failed
        } else {
            RunStatus::Passed
        };
    }

    if plan.cases.is_empty() {
        reporter.on_error(&ErrorPayload::from_message(
            "no tests matched the current filters",
        ));
        reporter.on_end();
        return RunStatus::Failed;
    }

    let RunPlan {
        mut cases, jobs, ..
    } = plan;
    let dispatcher = Dispatcher::new(
        &config,
        launcher,
        &mut reporter,
        &mut cases,
        &matrix,
        jobs,
        stop,
    );
    let stop_cause = dispatcher.run();
    reporter.on_end();
    debug!(?stop_cause, "run finished");

    match stop_cause {
        Some(StopCause::External) => RunStatus::Interrupted,
        Some(StopCause::GlobalTimeout) => RunStatus::TimedOut,
        Some(StopCause::MaxFailures) => RunStatus::Failed,
        None => {
            let all_expected = cases.values().all(|case| {
                matches!(
                    case.outcome(),
                    Outcome::Expected | Outcome::Flaky | Outcome::Skipped
                )
            });
            if all_expected {
                RunStatus::Passed
            } else {
                RunStatus::Failed
            }
        }
    }
}
