//! Dispatcher semantics against a scripted in-memory worker, so scheduling,
//! retry, crash-recovery and max-failure behavior are exercised without
//! spawning processes.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crossbeam::channel::{unbounded, Sender};

use paratest_core::{
    Config, ErrorPayload, FileRegistry, IoChunk, ParameterMatrix, TestCase, TestResult, TestStatus,
};
use paratest_execution::{
    run_with_launcher, DispatcherEvent, DonePayload, ParentMessage, RunMode, RunStatus,
    StopHandle, WorkerEvent, WorkerHandle, WorkerLauncher, WorkerMessage,
};
use paratest_reporting::Reporter;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Action {
    Pass,
    Fail,
    Crash,
    /// Begin the test, then stall well past any configured deadline.
    Hang,
}

type Scripts = Arc<Mutex<HashMap<String, VecDeque<Action>>>>;

/// Launcher whose workers follow a per-test script instead of running code.
struct ScriptedLauncher {
    scripts: Scripts,
    spawns: Arc<Mutex<Vec<usize>>>,
}

impl ScriptedLauncher {
    fn new(script_list: Vec<(&str, Vec<Action>)>) -> Self {
        let mut scripts = HashMap::new();
        for (id, actions) in script_list {
            scripts.insert(id.to_string(), VecDeque::from(actions));
        }
        Self {
            scripts: Arc::new(Mutex::new(scripts)),
            spawns: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn spawn_count(&self) -> usize {
        self.spawns.lock().unwrap().len()
    }
}

enum Ctl {
    Msg(ParentMessage),
    Kill,
}

struct FakeHandle {
    tx: Sender<Ctl>,
}

impl WorkerHandle for FakeHandle {
    fn send(&mut self, message: &ParentMessage) -> paratest_execution::Result<()> {
        self.tx
            .send(Ctl::Msg(message.clone()))
            .map_err(|_| paratest_execution::Error::Protocol("fake worker gone".to_string()))
    }

    fn kill(&mut self) {
        let _ = self.tx.send(Ctl::Kill);
    }
}

impl WorkerLauncher for ScriptedLauncher {
    fn launch(
        &self,
        init: paratest_execution::WorkerInit,
        events: Sender<DispatcherEvent>,
    ) -> paratest_execution::Result<Box<dyn WorkerHandle>> {
        let worker_index = init.worker_index;
        self.spawns.lock().unwrap().push(worker_index);
        let (tx, rx) = unbounded::<Ctl>();
        let scripts = Arc::clone(&self.scripts);
        std::thread::spawn(move || {
            let send = |message: WorkerMessage| {
                let _ = events.send(DispatcherEvent {
                    worker_index,
                    event: WorkerEvent::Message(message),
                });
            };
            send(WorkerMessage::Ready);
            loop {
                match rx.recv() {
                    Ok(Ctl::Msg(ParentMessage::Run(job))) => {
                        let mut done = DonePayload::default();
                        let mut crashed = false;
                        for (position, entry) in job.entries.iter().enumerate() {
                            let action = scripts
                                .lock()
                                .unwrap()
                                .get_mut(&entry.test_id)
                                .and_then(VecDeque::pop_front)
                                .unwrap_or(Action::Pass);
                            if action == Action::Crash {
                                crashed = true;
                                break;
                            }
                            send(WorkerMessage::TestBegin {
                                test_id: entry.test_id.clone(),
                                worker_index,
                            });
                            if action == Action::Hang {
                                std::thread::sleep(std::time::Duration::from_millis(1_500));
                            }
                            let status = if entry.skipped {
                                TestStatus::Skipped
                            } else if action == Action::Fail {
                                TestStatus::Failed
                            } else {
                                TestStatus::Passed
                            };
                            send(WorkerMessage::TestEnd {
                                test_id: entry.test_id.clone(),
                                duration_ms: 1,
                                status,
                                error: (status == TestStatus::Failed)
                                    .then(|| ErrorPayload::from_message("scripted failure")),
                                data: serde_json::Map::new(),
                                annotations: Vec::new(),
                            });
                            if status != TestStatus::Skipped && status != entry.expected_status {
                                done.failed_test_id = Some(entry.test_id.clone());
                                done.remaining = job.entries[position + 1..].to_vec();
                                break;
                            }
                        }
                        if crashed {
                            let _ = events.send(DispatcherEvent {
                                worker_index,
                                event: WorkerEvent::Exited { code: Some(101) },
                            });
                            return;
                        }
                        send(WorkerMessage::Done(done));
                    }
                    Ok(Ctl::Msg(ParentMessage::Stop)) | Ok(Ctl::Kill) | Err(_) => break,
                    Ok(Ctl::Msg(ParentMessage::Init(_))) => {}
                }
            }
            let _ = events.send(DispatcherEvent {
                worker_index,
                event: WorkerEvent::Exited { code: Some(0) },
            });
        });
        Ok(Box::new(FakeHandle { tx }))
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Event {
    Begin(String),
    End {
        id: String,
        retry: u32,
        status: TestStatus,
        error: Option<String>,
    },
    Error(String),
    RunEnd,
}

#[derive(Clone, Default)]
struct Recording(Arc<Mutex<Vec<Event>>>);

impl Recording {
    fn events(&self) -> Vec<Event> {
        self.0.lock().unwrap().clone()
    }

    fn ends_for(&self, id: &str) -> Vec<(u32, TestStatus)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::End {
                    id: end_id,
                    retry,
                    status,
                    ..
                } if end_id == id => Some((retry, status)),
                _ => None,
            })
            .collect()
    }

    fn begins(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, Event::Begin(_)))
            .count()
    }
}

impl Reporter for Recording {
    fn on_test_begin(&mut self, test: &TestCase) {
        self.0.lock().unwrap().push(Event::Begin(test.id.clone()));
    }

    fn on_test_end(&mut self, test: &TestCase, result: &TestResult) {
        self.0.lock().unwrap().push(Event::End {
            id: test.id.clone(),
            retry: result.retry,
            status: result.status,
            error: result.error.as_ref().map(|e| e.render()),
        });
    }

    fn on_std_out(&mut self, _chunk: &IoChunk, _test: Option<&TestCase>) {}

    fn on_error(&mut self, error: &ErrorPayload) {
        self.0.lock().unwrap().push(Event::Error(error.render()));
    }

    fn on_end(&mut self) {
        self.0.lock().unwrap().push(Event::RunEnd);
    }
}

fn registry_with_tests(file: &str, count: usize) -> FileRegistry {
    let mut registry = FileRegistry::new();
    let file = file.to_string();
    registry.test_file(file, move |s| {
        for i in 0..count {
            s.test(&format!("case {i}"), |_ctx| Ok(()));
        }
    });
    registry
}

fn run(
    launcher: &ScriptedLauncher,
    registry: &FileRegistry,
    config: Config,
) -> (RunStatus, Recording) {
    let recording = Recording::default();
    let status = run_with_launcher(
        launcher,
        config,
        registry,
        ParameterMatrix::new(),
        vec![Box::new(recording.clone())],
        StopHandle::new(),
        RunMode::Execute,
    );
    (status, recording)
}

fn quiet_config() -> Config {
    Config {
        workers: 1,
        timeout_ms: 5_000,
        stop_grace_ms: 2_000,
        ..Config::default()
    }
}

#[test]
fn all_passing_run_is_green() {
    let registry = registry_with_tests("tests/a.rs", 3);
    let launcher = ScriptedLauncher::new(vec![]);
    let (status, recording) = run(&launcher, &registry, quiet_config());

    assert_eq!(status, RunStatus::Passed);
    assert_eq!(recording.begins(), 3);
    let events = recording.events();
    assert_eq!(events.last(), Some(&Event::RunEnd));
    // One worker serviced the single job.
    assert_eq!(launcher.spawn_count(), 1);
}

#[test]
fn failed_test_fails_the_run() {
    let registry = registry_with_tests("tests/a.rs", 2);
    let launcher =
        ScriptedLauncher::new(vec![("1@tests/a.rs#run0-repeat0", vec![Action::Fail])]);
    let (status, recording) = run(&launcher, &registry, quiet_config());

    assert_eq!(status, RunStatus::Failed);
    assert_eq!(
        recording.ends_for("1@tests/a.rs#run0-repeat0"),
        vec![(0, TestStatus::Failed)]
    );
}

#[test]
fn flaky_test_retries_and_passes() {
    let registry = registry_with_tests("tests/a.rs", 1);
    let launcher = ScriptedLauncher::new(vec![(
        "0@tests/a.rs#run0-repeat0",
        vec![Action::Fail, Action::Pass],
    )]);
    let config = Config {
        retries: 1,
        ..quiet_config()
    };
    let (status, recording) = run(&launcher, &registry, config);

    assert_eq!(status, RunStatus::Passed);
    assert_eq!(
        recording.ends_for("0@tests/a.rs#run0-repeat0"),
        vec![(0, TestStatus::Failed), (1, TestStatus::Passed)]
    );
    // The retry ran on a fresh worker.
    assert_eq!(launcher.spawn_count(), 2);
}

#[test]
fn retries_are_bounded_by_config() {
    let registry = registry_with_tests("tests/a.rs", 1);
    let launcher = ScriptedLauncher::new(vec![(
        "0@tests/a.rs#run0-repeat0",
        vec![Action::Fail, Action::Fail, Action::Fail, Action::Fail],
    )]);
    let config = Config {
        retries: 2,
        ..quiet_config()
    };
    let (status, recording) = run(&launcher, &registry, config);

    assert_eq!(status, RunStatus::Failed);
    let ends = recording.ends_for("0@tests/a.rs#run0-repeat0");
    // retries+1 attempts, retry indexes 0..=2.
    assert_eq!(
        ends,
        vec![
            (0, TestStatus::Failed),
            (1, TestStatus::Failed),
            (2, TestStatus::Failed)
        ]
    );
}

#[test]
fn remaining_entries_run_after_a_failure() {
    let registry = registry_with_tests("tests/a.rs", 3);
    let launcher =
        ScriptedLauncher::new(vec![("0@tests/a.rs#run0-repeat0", vec![Action::Fail])]);
    let (status, recording) = run(&launcher, &registry, quiet_config());

    assert_eq!(status, RunStatus::Failed);
    // All three tests still produced results.
    assert_eq!(recording.begins(), 3);
    assert_eq!(
        recording.ends_for("2@tests/a.rs#run0-repeat0"),
        vec![(0, TestStatus::Passed)]
    );
}

#[test]
fn max_failures_stops_scheduling() {
    let registry = registry_with_tests("tests/a.rs", 5);
    let launcher = ScriptedLauncher::new(vec![
        ("0@tests/a.rs#run0-repeat0", vec![Action::Fail]),
        ("1@tests/a.rs#run0-repeat0", vec![Action::Fail]),
        ("2@tests/a.rs#run0-repeat0", vec![Action::Fail]),
        ("3@tests/a.rs#run0-repeat0", vec![Action::Fail]),
        ("4@tests/a.rs#run0-repeat0", vec![Action::Fail]),
    ]);
    let config = Config {
        max_failures: 2,
        ..quiet_config()
    };
    let (status, recording) = run(&launcher, &registry, config);

    assert_eq!(status, RunStatus::Failed);
    // Once the bound was hit no further tests began.
    assert_eq!(recording.begins(), 2);
}

#[test]
fn crashed_worker_requeues_remaining_entries_once() {
    let registry = registry_with_tests("tests/a.rs", 3);
    let launcher = ScriptedLauncher::new(vec![(
        "1@tests/a.rs#run0-repeat0",
        vec![Action::Crash, Action::Pass],
    )]);
    let (status, recording) = run(&launcher, &registry, quiet_config());

    assert_eq!(status, RunStatus::Passed);
    assert_eq!(
        recording.ends_for("1@tests/a.rs#run0-repeat0"),
        vec![(0, TestStatus::Passed)]
    );
    assert_eq!(
        recording.ends_for("2@tests/a.rs#run0-repeat0"),
        vec![(0, TestStatus::Passed)]
    );
    assert_eq!(launcher.spawn_count(), 2);
}

#[test]
fn second_crash_fails_the_test() {
    let registry = registry_with_tests("tests/a.rs", 2);
    let launcher = ScriptedLauncher::new(vec![(
        "0@tests/a.rs#run0-repeat0",
        vec![Action::Crash, Action::Crash],
    )]);
    let (status, recording) = run(&launcher, &registry, quiet_config());

    assert_eq!(status, RunStatus::Failed);
    let ends = recording.ends_for("0@tests/a.rs#run0-repeat0");
    assert_eq!(ends, vec![(0, TestStatus::Failed)]);
    let crash_error = recording.events().iter().any(|e| {
        matches!(e, Event::End { id, error: Some(message), .. }
            if id == "0@tests/a.rs#run0-repeat0" && message.contains("crashed"))
    });
    assert!(crash_error, "expected a synthesized worker-crash error");
}

#[test]
fn same_hash_jobs_share_one_worker() {
    // Two files, no fixtures: two jobs with an identical worker hash.
    let mut registry = FileRegistry::new();
    registry.test_file("tests/a.rs", |s| {
        s.test("a", |_ctx| Ok(()));
    });
    registry.test_file("tests/b.rs", |s| {
        s.test("b", |_ctx| Ok(()));
    });
    let launcher = ScriptedLauncher::new(vec![]);
    let (status, _recording) = run(&launcher, &registry, quiet_config());

    assert_eq!(status, RunStatus::Passed);
    assert_eq!(launcher.spawn_count(), 1);
}

#[test]
fn skipped_entries_report_skipped_results() {
    let mut registry = FileRegistry::new();
    registry.test_file("tests/a.rs", |s| {
        s.test("runs", |_ctx| Ok(()));
        s.test("ignored", |_ctx| Ok(())).skip("not today");
    });
    let launcher = ScriptedLauncher::new(vec![]);
    let (status, recording) = run(&launcher, &registry, quiet_config());

    assert_eq!(status, RunStatus::Passed);
    assert_eq!(
        recording.ends_for("1@tests/a.rs#run0-repeat0"),
        vec![(0, TestStatus::Skipped)]
    );
}

#[test]
fn list_mode_runs_nothing() {
    let registry = registry_with_tests("tests/a.rs", 4);
    let launcher = ScriptedLauncher::new(vec![]);
    let recording = Recording::default();
    let status = run_with_launcher(
        &launcher,
        quiet_config(),
        &registry,
        ParameterMatrix::new(),
        vec![Box::new(recording.clone())],
        StopHandle::new(),
        RunMode::List,
    );

    assert_eq!(status, RunStatus::Passed);
    assert_eq!(recording.begins(), 0);
    assert_eq!(launcher.spawn_count(), 0);
}

#[test]
fn fixture_cycle_fails_before_any_test() {
    let mut registry = registry_with_tests("tests/a.rs", 1);
    registry.fixture_file("fixtures.rs", |fx| {
        use paratest_core::{FixtureRegistration, FixtureScope, FixtureValue};
        fx.register(
            FixtureRegistration::setup("a", FixtureScope::Test, |_ctx| {
                Ok((Arc::new(()) as FixtureValue, None))
            })
            .with_deps(["b"]),
        )?;
        fx.register(
            FixtureRegistration::setup("b", FixtureScope::Test, |_ctx| {
                Ok((Arc::new(()) as FixtureValue, None))
            })
            .with_deps(["a"]),
        )
    });
    let launcher = ScriptedLauncher::new(vec![]);
    let (status, recording) = run(&launcher, &registry, quiet_config());

    assert_eq!(status, RunStatus::Failed);
    assert_eq!(recording.begins(), 0);
    let has_cycle_error = recording.events().iter().any(|e| match e {
        Event::Error(message) => message.contains("cycle") && message.contains('a'),
        _ => false,
    });
    assert!(
        has_cycle_error,
        "expected a cycle error, got {:?}",
        recording.events()
    );
}

#[test]
fn empty_plan_is_a_failure() {
    let registry = FileRegistry::new();
    let launcher = ScriptedLauncher::new(vec![]);
    let (status, recording) = run(&launcher, &registry, quiet_config());

    assert_eq!(status, RunStatus::Failed);
    let has_no_tests_error = recording.events().iter().any(|e| match e {
        Event::Error(message) => message.contains("no tests"),
        _ => false,
    });
    assert!(has_no_tests_error);
}

#[test]
fn global_timeout_stops_the_run() {
    let registry = registry_with_tests("tests/a.rs", 2);
    let launcher = ScriptedLauncher::new(vec![(
        "0@tests/a.rs#run0-repeat0",
        vec![Action::Hang],
    )]);
    let config = Config {
        global_timeout_ms: 300,
        stop_grace_ms: 500,
        ..quiet_config()
    };
    let (status, recording) = run(&launcher, &registry, config);

    assert_eq!(status, RunStatus::TimedOut);
    // The second test never began.
    assert_eq!(recording.begins(), 1);
}

#[test]
fn external_stop_interrupts_the_run() {
    let registry = registry_with_tests("tests/a.rs", 3);
    let launcher = ScriptedLauncher::new(vec![]);
    let recording = Recording::default();
    let stop = StopHandle::new();
    stop.stop();
    let status = run_with_launcher(
        &launcher,
        quiet_config(),
        &registry,
        ParameterMatrix::new(),
        vec![Box::new(recording.clone())],
        stop,
        RunMode::Execute,
    );

    assert_eq!(status, RunStatus::Interrupted);
    assert_eq!(recording.begins(), 0);
}
