//! In-worker execution.
//!
//! A worker process reads `init`, rebuilds fixtures and suites from the same
//! registry the embedder constructed, then executes jobs: hooks at the right
//! nesting level, fixtures through scoped pools, bodies under a deadline,
//! results serialized back over stdout. Worker-scoped fixtures tear down only
//! at worker shutdown.

use std::collections::HashMap;
use std::io::{self, BufReader};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, warn};

use paratest_core::{
    expand_file, Annotation, Config, ErrorPayload, FileRegistry, FixturePool, FixtureRegistry,
    HookKind, IoChunk, IoSink, MaterializedTest, SkipTest, StdStream, Suite, TestCtx, TestEntry,
    TestState, TestStatus, UserFn,
};

use crate::deadline::{race, RaceOutcome};
use crate::ipc::{self, DonePayload, IoEnvelope, ParentMessage, WorkerInit, WorkerMessage};

/// Serializes protocol writes; shared with stdio capture.
struct ProtocolWriter {
    out: Mutex<io::Stdout>,
}

impl ProtocolWriter {
    fn new() -> Self {
        Self {
            out: Mutex::new(io::stdout()),
        }
    }

    fn send(&self, message: &WorkerMessage) {
        let mut out = self.out.lock();
        if let Err(e) = ipc::write_message(&mut *out, message) {
            // The dispatcher is gone; nothing sensible left to do.
            warn!(error = %e, "failed to write protocol message");
        }
    }
}

impl IoSink for ProtocolWriter {
    fn chunk(&self, stream: StdStream, test_id: Option<&str>, chunk: IoChunk) {
        let envelope = IoEnvelope::from_chunk(test_id, &chunk);
        let message = match stream {
            StdStream::Out => WorkerMessage::StdOut(envelope),
            StdStream::Err => WorkerMessage::StdErr(envelope),
        };
        self.send(&message);
    }
}

struct LoadedFile {
    suite: Arc<Suite>,
    tests: HashMap<String, MaterializedTest>,
    /// First-touch `beforeAll` bookkeeping per suite path prefix. An error
    /// poisons every later test under that suite in this worker.
    before_all: Vec<(Vec<usize>, Option<ErrorPayload>)>,
}

struct WorkerRunner {
    registry: FileRegistry,
    init: WorkerInit,
    expand_config: Config,
    fixtures: Option<Arc<FixtureRegistry>>,
    root_pool: Option<Arc<FixturePool>>,
    load_error: Option<ErrorPayload>,
    focus_present: bool,
    files: HashMap<String, LoadedFile>,
    writer: Arc<ProtocolWriter>,
}

/// Outcome of one test attempt, ready to be serialized.
struct AttemptReport {
    status: TestStatus,
    error: Option<ErrorPayload>,
    duration_ms: u64,
    data: serde_json::Map<String, Value>,
    annotations: Vec<Annotation>,
}

/// What the in-thread phase produced before deadline accounting.
struct PhaseReport {
    first_error: Option<ErrorPayload>,
    skipped: Option<String>,
    /// The first error was raised after the deadline cancelled the unit; it
    /// is the cancellation unwinding, not a genuine failure.
    error_after_cancel: bool,
}

enum UnitResult {
    Ok,
    Skip(String),
    Err(ErrorPayload),
}

/// Test ids contain `@`, `#` and path separators; flatten them for use as a
/// directory name under the output root.
fn sanitize_for_path(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '-' })
        .collect()
}

fn invoke_unit(func: &UserFn, ctx: &mut TestCtx) -> UnitResult {
    match catch_unwind(AssertUnwindSafe(|| func(ctx))) {
        Ok(Ok(())) => UnitResult::Ok,
        Ok(Err(error)) => match error.downcast_ref::<SkipTest>() {
            Some(skip) => UnitResult::Skip(skip.reason.clone()),
            None => UnitResult::Err(ErrorPayload::from_anyhow(&error)),
        },
        Err(payload) => UnitResult::Err(ErrorPayload::from_panic(payload.as_ref())),
    }
}

impl WorkerRunner {
    fn new(registry: &FileRegistry, init: WorkerInit, writer: Arc<ProtocolWriter>) -> Self {
        let expand_config = Config {
            shard: None,
            ..init.config.clone()
        };
        let (fixtures, root_pool, load_error) = match registry.load_fixtures() {
            Ok(fixtures) => {
                let fixtures = Arc::new(fixtures);
                let pool = FixturePool::root(Arc::clone(&fixtures), init.variation.clone());
                (Some(fixtures), Some(pool), None)
            }
            Err(e) => {
                warn!(error = %e, "fixture load failed in worker");
                (None, None, Some(ErrorPayload::from_message(e.to_string())))
            }
        };
        let focus_present = registry
            .load_all()
            .map(|suites| suites.iter().any(Suite::has_focus))
            .unwrap_or(false);
        Self {
            registry: registry.clone(),
            init,
            expand_config,
            fixtures,
            root_pool,
            load_error,
            focus_present,
            files: HashMap::new(),
            writer,
        }
    }

    fn sink(&self) -> Arc<dyn IoSink> {
        Arc::clone(&self.writer) as Arc<dyn IoSink>
    }

    fn ensure_loaded(&mut self, file: &str) -> Result<(), ErrorPayload> {
        if self.files.contains_key(file) {
            return Ok(());
        }
        let fixtures = self
            .fixtures
            .as_ref()
            .ok_or_else(|| ErrorPayload::from_message("fixtures unavailable"))?;
        let suite = self
            .registry
            .load_file(file)
            .map_err(|e| ErrorPayload::from_message(e.to_string()))?;
        let grep = self
            .expand_config
            .grep_regex()
            .map_err(|e| ErrorPayload::from_message(e.to_string()))?;
        let tests = expand_file(
            &self.expand_config,
            &suite,
            fixtures,
            &self.init.matrix,
            self.focus_present,
            grep.as_ref(),
        )
        .map_err(|e| ErrorPayload::from_message(e.to_string()))?;
        debug!(file, tests = tests.len(), "worker loaded test file");
        self.files.insert(
            file.to_string(),
            LoadedFile {
                suite: Arc::new(suite),
                tests: tests.into_iter().map(|t| (t.case.id.clone(), t)).collect(),
                before_all: Vec::new(),
            },
        );
        Ok(())
    }

    /// Run suite-level hooks of one kind for the suite at `prefix`, outside
    /// any test pool: only worker-scoped fixtures are reachable.
    fn run_suite_hooks(&self, suite: &Arc<Suite>, prefix: &[usize], kind: HookKind) -> Option<ErrorPayload> {
        let root_pool = self.root_pool.as_ref()?;
        let target: &Suite = {
            let mut current: &Suite = suite;
            for index in prefix {
                match current.entries.get(*index) {
                    Some(paratest_core::SuiteEntry::Suite(child)) => current = child,
                    _ => return Some(ErrorPayload::from_message("suite path out of sync")),
                }
            }
            current
        };
        let hooks: Vec<UserFn> = target.hooks_of(kind).map(|h| h.func.clone()).collect();
        if hooks.is_empty() {
            return None;
        }
        let title = if target.title.is_empty() {
            target.file.clone()
        } else {
            target.title.clone()
        };
        let file = target.file.clone();
        let params = self.init.variation.clone();
        let pool = Arc::clone(root_pool);
        let sink = self.sink();
        let state = TestState::new();
        let hook_state = Arc::clone(&state);
        let timeout_ms = self.init.config.timeout_ms;

        let output_dir = self.init.config.output_dir.clone();
        let outcome = race(&format!("{kind}"), timeout_ms, &state, move || {
            let mut first_error = None;
            for hook in hooks {
                let mut ctx = TestCtx::new(
                    None,
                    title.clone(),
                    file.clone(),
                    0,
                    params.clone(),
                    output_dir.clone(),
                    Arc::clone(&pool),
                    Arc::clone(&hook_state),
                    Arc::clone(&sink),
                );
                match invoke_unit(&hook, &mut ctx) {
                    UnitResult::Ok => {}
                    UnitResult::Skip(reason) => {
                        first_error.get_or_insert(ErrorPayload::from_message(format!(
                            "cannot skip from a suite hook: {reason}"
                        )));
                        break;
                    }
                    UnitResult::Err(error) => {
                        first_error = Some(error);
                        break;
                    }
                }
            }
            first_error
        });
        match outcome {
            RaceOutcome::Finished(error) | RaceOutcome::TimedOut(error) => error,
            RaceOutcome::Abandoned => Some(ErrorPayload::from_message(format!(
                "{kind} hook timed out"
            ))),
            RaceOutcome::Crashed => Some(ErrorPayload::from_message(format!(
                "{kind} hook crashed"
            ))),
        }
    }

    /// First-touch `beforeAll` for every ancestor suite of `spec_path` not
    /// yet set up in this worker. Returns the first recorded error, if any.
    fn ensure_before_all(&mut self, file: &str, spec_path: &[usize]) -> Option<ErrorPayload> {
        let suite = Arc::clone(&self.files[file].suite);
        // Prefixes from the root suite (empty) down to the spec's parent.
        let prefixes: Vec<Vec<usize>> = (0..spec_path.len())
            .map(|len| spec_path[..len].to_vec())
            .collect();
        for prefix in prefixes {
            let already = self.files[file]
                .before_all
                .iter()
                .find(|(p, _)| *p == prefix)
                .map(|(_, e)| e.clone());
            match already {
                Some(error) => {
                    if error.is_some() {
                        return error;
                    }
                }
                None => {
                    let error = self.run_suite_hooks(&suite, &prefix, HookKind::BeforeAll);
                    self.files
                        .get_mut(file)
                        .expect("file loaded")
                        .before_all
                        .push((prefix, error.clone()));
                    if error.is_some() {
                        return error;
                    }
                }
            }
        }
        None
    }

    /// `afterAll` in reverse nesting order for every suite whose `beforeAll`
    /// ran during this job, then reset the first-touch marks.
    fn run_after_all(&mut self, file: &str) {
        let Some(loaded) = self.files.get_mut(file) else {
            return;
        };
        let suite = Arc::clone(&loaded.suite);
        let mut entered: Vec<Vec<usize>> = loaded
            .before_all
            .drain(..)
            .filter(|(_, error)| error.is_none())
            .map(|(prefix, _)| prefix)
            .collect();
        entered.sort_by_key(|p| std::cmp::Reverse(p.len()));
        for prefix in entered {
            if let Some(error) = self.run_suite_hooks(&suite, &prefix, HookKind::AfterAll) {
                // Results are not retroactively failed on afterAll errors;
                // the dispatcher surfaces this through onError.
                self.writer.send(&WorkerMessage::TeardownError { error });
            }
        }
    }

    fn run_one_test(&self, file: &str, test: &MaterializedTest, entry: &TestEntry) -> AttemptReport {
        let started = Instant::now();
        let state = TestState::new();
        let root_pool = match &self.root_pool {
            Some(pool) => pool,
            None => {
                return AttemptReport {
                    status: TestStatus::Failed,
                    error: Some(ErrorPayload::from_message("fixtures unavailable")),
                    duration_ms: 0,
                    data: serde_json::Map::new(),
                    annotations: Vec::new(),
                }
            }
        };
        let test_pool = root_pool.child();

        let suite = Arc::clone(&self.files[file].suite);
        let spec_path = test.spec_path.clone();
        let sink = self.sink();
        let id = test.case.id.clone();
        let title = test.case.title().to_string();
        let file_name = test.case.file.clone();
        let retry = entry.retry;
        let params = test.case.parameters.clone();
        let output_dir = self
            .init
            .config
            .output_dir
            .join(sanitize_for_path(&test.case.id));
        let phase_pool = Arc::clone(&test_pool);
        let phase_state = Arc::clone(&state);
        let fixture_names = {
            let spec = suite.spec_at(&spec_path);
            spec.map(|s| s.fixtures.clone()).unwrap_or_default()
        };

        let outcome = race("test", entry.timeout_ms, &state, move || {
            let Some(spec) = suite.spec_at(&spec_path) else {
                return PhaseReport {
                    first_error: Some(ErrorPayload::from_message("spec path out of sync")),
                    skipped: None,
                    error_after_cancel: false,
                };
            };
            let chain = suite.suites_along(&spec_path);
            let mut first_error: Option<ErrorPayload> = None;
            let mut error_after_cancel = false;
            let mut skipped: Option<String> = None;
            let make_ctx = || {
                TestCtx::new(
                    Some(id.clone()),
                    title.clone(),
                    file_name.clone(),
                    retry,
                    params.clone(),
                    output_dir.clone(),
                    Arc::clone(&phase_pool),
                    Arc::clone(&phase_state),
                    Arc::clone(&sink),
                )
            };

            // beforeEach, outer to inner; first failure short-circuits the
            // rest of setup and the body.
            'outer: for suite_ref in &chain {
                for hook in suite_ref.hooks_of(HookKind::BeforeEach) {
                    match invoke_unit(&hook.func, &mut make_ctx()) {
                        UnitResult::Ok => {}
                        UnitResult::Skip(reason) => {
                            skipped = Some(reason);
                            break 'outer;
                        }
                        UnitResult::Err(error) => {
                            error_after_cancel = phase_state.is_cancelled();
                            first_error = Some(error);
                            break 'outer;
                        }
                    }
                }
            }

            if first_error.is_none() && skipped.is_none() {
                let mut ctx = make_ctx();
                let prepared = phase_pool
                    .setup_auto(&phase_state)
                    .and_then(|_| {
                        for name in &fixture_names {
                            phase_pool.resolve(name, &phase_state)?;
                        }
                        Ok(())
                    });
                match prepared {
                    Err(error) => match error.downcast_ref::<SkipTest>() {
                        Some(skip) => skipped = Some(skip.reason.clone()),
                        None => {
                            error_after_cancel = phase_state.is_cancelled();
                            first_error = Some(ErrorPayload::from_anyhow(&error));
                        }
                    },
                    Ok(()) => match invoke_unit(&spec.body, &mut ctx) {
                        UnitResult::Ok => {}
                        UnitResult::Skip(reason) => skipped = Some(reason),
                        UnitResult::Err(error) => {
                            error_after_cancel = phase_state.is_cancelled();
                            first_error = Some(error);
                        }
                    },
                }
            }

            // afterEach always runs, inner to outer; the first error wins.
            for suite_ref in chain.iter().rev() {
                for hook in suite_ref.hooks_of(HookKind::AfterEach) {
                    match invoke_unit(&hook.func, &mut make_ctx()) {
                        UnitResult::Ok | UnitResult::Skip(_) => {}
                        UnitResult::Err(error) => {
                            if first_error.is_none() {
                                error_after_cancel = phase_state.is_cancelled();
                                first_error = Some(error);
                            }
                        }
                    }
                }
            }

            PhaseReport {
                first_error,
                skipped,
                error_after_cancel,
            }
        });

        let (mut status, mut error, cancellation_unwind) = match outcome {
            RaceOutcome::Finished(report) | RaceOutcome::TimedOut(report) => {
                let status = if let Some(reason) = &report.skipped {
                    state.annotate(Annotation::new("skip", Some(reason.clone())));
                    TestStatus::Skipped
                } else if report.first_error.is_some() {
                    TestStatus::Failed
                } else {
                    TestStatus::Passed
                };
                (status, report.first_error, report.error_after_cancel)
            }
            RaceOutcome::Abandoned => (TestStatus::Passed, None, false),
            RaceOutcome::Crashed => (
                TestStatus::Failed,
                Some(ErrorPayload::from_message("test unit crashed")),
                false,
            ),
        };
        let timed_out = state.is_cancelled();
        // An error raised only because the deadline cancelled the unit is
        // the timeout itself, not a failure.
        if timed_out
            && (status == TestStatus::Passed
                || (status == TestStatus::Failed && cancellation_unwind))
        {
            status = TestStatus::TimedOut;
            error.get_or_insert(ErrorPayload::from_message(format!(
                "test timeout of {}ms exceeded",
                entry.timeout_ms
            )));
        }
        state.set_status(status);

        // Test-scoped teardown gets a fresh full budget; a separate state
        // carries its cancellation so fixtures can still read the status.
        let teardown_state = TestState::new();
        let teardown_pool = Arc::clone(&test_pool);
        let teardown_outcome = race("teardown", entry.timeout_ms, &teardown_state, move || {
            teardown_pool.teardown()
        });
        match teardown_outcome {
            RaceOutcome::Finished(Ok(())) => {}
            RaceOutcome::Finished(Err(e)) | RaceOutcome::TimedOut(Err(e)) => {
                if error.is_none() {
                    error = Some(ErrorPayload::from_anyhow(&e));
                }
                if status == TestStatus::Passed {
                    status = TestStatus::Failed;
                }
            }
            RaceOutcome::TimedOut(Ok(())) | RaceOutcome::Abandoned => {
                if status == TestStatus::Passed {
                    status = TestStatus::TimedOut;
                    error.get_or_insert(ErrorPayload::from_message(
                        "fixture teardown timed out".to_string(),
                    ));
                }
            }
            RaceOutcome::Crashed => {
                if error.is_none() {
                    error = Some(ErrorPayload::from_message("fixture teardown crashed"));
                }
                if status == TestStatus::Passed {
                    status = TestStatus::Failed;
                }
            }
        }
        state.set_status(status);

        AttemptReport {
            status,
            error,
            duration_ms: started.elapsed().as_millis() as u64,
            data: state.take_data(),
            annotations: state.take_annotations(),
        }
    }

    fn run_job(&mut self, job: paratest_core::JobPayload) -> DonePayload {
        if let Some(error) = &self.load_error {
            return DonePayload {
                failed_test_id: None,
                fatal_error: Some(error.clone()),
                remaining: Vec::new(),
            };
        }
        if let Err(error) = self.ensure_loaded(&job.file) {
            return DonePayload {
                failed_test_id: None,
                fatal_error: Some(error),
                remaining: Vec::new(),
            };
        }

        let worker_index = self.init.worker_index;
        for (position, entry) in job.entries.iter().enumerate() {
            let test = match self.files[&job.file].tests.get(&entry.test_id) {
                Some(test) => test.clone(),
                None => {
                    return DonePayload {
                        failed_test_id: None,
                        fatal_error: Some(ErrorPayload::from_message(format!(
                            "unknown test id '{}'",
                            entry.test_id
                        ))),
                        remaining: Vec::new(),
                    };
                }
            };

            self.writer.send(&WorkerMessage::TestBegin {
                test_id: entry.test_id.clone(),
                worker_index,
            });

            let report = if entry.skipped {
                AttemptReport {
                    status: TestStatus::Skipped,
                    error: None,
                    duration_ms: 0,
                    data: serde_json::Map::new(),
                    annotations: Vec::new(),
                }
            } else if let Some(hook_error) = self.ensure_before_all(&job.file, &test.spec_path) {
                AttemptReport {
                    status: TestStatus::Failed,
                    error: Some(hook_error),
                    duration_ms: 0,
                    data: serde_json::Map::new(),
                    annotations: Vec::new(),
                }
            } else {
                self.run_one_test(&job.file, &test, entry)
            };

            let unexpected =
                report.status != TestStatus::Skipped && report.status != entry.expected_status;
            self.writer.send(&WorkerMessage::TestEnd {
                test_id: entry.test_id.clone(),
                duration_ms: report.duration_ms,
                status: report.status,
                error: report.error,
                data: report.data,
                annotations: report.annotations,
            });

            if unexpected {
                return DonePayload {
                    failed_test_id: Some(entry.test_id.clone()),
                    fatal_error: None,
                    remaining: job.entries[position + 1..].to_vec(),
                };
            }
        }

        self.run_after_all(&job.file);
        DonePayload::default()
    }

    fn shutdown(&mut self) {
        if let Some(pool) = &self.root_pool {
            if let Err(e) = pool.teardown() {
                self.writer.send(&WorkerMessage::TeardownError {
                    error: ErrorPayload::from_anyhow(&e),
                });
            }
        }
    }
}

/// Worker process entry: speak the protocol over stdin/stdout until `stop`
/// or EOF, then tear down worker-scoped fixtures.
pub fn worker_main(registry: &FileRegistry) -> i32 {
    let stdin = io::stdin();
    let mut reader = BufReader::new(stdin.lock());
    let writer = Arc::new(ProtocolWriter::new());

    let init = match ipc::read_message::<_, ParentMessage>(&mut reader) {
        Ok(Some(ParentMessage::Init(init))) => init,
        _ => {
            warn!("worker started without an init message");
            return 2;
        }
    };
    debug!(worker_index = init.worker_index, "worker initialized");
    let mut runner = WorkerRunner::new(registry, init, Arc::clone(&writer));
    writer.send(&WorkerMessage::Ready);

    loop {
        match ipc::read_message::<_, ParentMessage>(&mut reader) {
            Ok(Some(ParentMessage::Run(job))) => {
                let done = runner.run_job(job);
                writer.send(&WorkerMessage::Done(done));
            }
            Ok(Some(ParentMessage::Stop)) | Ok(None) => break,
            Ok(Some(ParentMessage::Init(_))) => {
                warn!("unexpected second init; ignoring");
            }
            Err(e) => {
                warn!(error = %e, "malformed parent message; stopping");
                break;
            }
        }
    }

    runner.shutdown();
    0
}
