//! Worker-pool scheduling.
//!
//! The dispatcher is a single event loop: worker messages and exits funnel
//! into one channel, and all run state (the canonical test cases, the job
//! queue, worker slots) is mutated from this loop only. Workers are isolated
//! processes; a worker error never takes the dispatcher down.
//!
//! Affinity: a worker's hash is fixed when it is created. Jobs only run on
//! workers with the same hash, so worker-scoped fixtures are reused across
//! the tests that share them. A free worker with the wrong hash is stopped to
//! make room for a fresh one.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use indexmap::IndexMap;
use tracing::{debug, warn};

use paratest_core::{
    Config, ErrorPayload, IoChunk, JobPayload, ParameterMatrix, TestCase, TestEntry, TestResult,
    TestStatus,
};
use paratest_reporting::{Multiplexer, Reporter};

use crate::ipc::{DonePayload, ParentMessage, WorkerInit, WorkerMessage};
use crate::workers::{DispatcherEvent, WorkerEvent, WorkerLauncher};

/// Cloneable external cancellation signal (SIGINT-equivalent). The CLI layer
/// wires the actual signal; the dispatcher polls this flag.
#[derive(Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Why the dispatcher entered the stopped state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopCause {
    External,
    MaxFailures,
    GlobalTimeout,
}

struct ActiveJob {
    job: JobPayload,
    /// Entries without a `testEnd` yet.
    pending: Vec<TestEntry>,
    began: HashSet<String>,
    stdout: HashMap<String, Vec<IoChunk>>,
    stderr: HashMap<String, Vec<IoChunk>>,
}

enum SlotState {
    Idle,
    Busy(ActiveJob),
    Stopping,
}

struct WorkerSlot {
    handle: Box<dyn crate::workers::WorkerHandle>,
    hash: String,
    state: SlotState,
    stop_sent: bool,
}

pub struct Dispatcher<'a> {
    config: &'a Config,
    launcher: &'a dyn WorkerLauncher,
    reporter: &'a mut Multiplexer,
    /// Canonical cases; the dispatcher is the only writer after generation.
    cases: &'a mut IndexMap<String, TestCase>,
    matrix: &'a ParameterMatrix,
    stop_handle: StopHandle,
    queue: VecDeque<JobPayload>,
    workers: IndexMap<usize, WorkerSlot>,
    next_worker: usize,
    events_tx: Sender<DispatcherEvent>,
    events_rx: Receiver<DispatcherEvent>,
    failures: usize,
    stop_cause: Option<StopCause>,
    kill_at: Option<Instant>,
    /// Test ids already re-queued once after a worker crash.
    crash_requeued: HashSet<String>,
}

impl<'a> Dispatcher<'a> {
    pub fn new(
        config: &'a Config,
        launcher: &'a dyn WorkerLauncher,
        reporter: &'a mut Multiplexer,
        cases: &'a mut IndexMap<String, TestCase>,
        matrix: &'a ParameterMatrix,
        jobs: Vec<JobPayload>,
        stop_handle: StopHandle,
    ) -> Self {
        let (events_tx, events_rx) = unbounded();
        Self {
            config,
            launcher,
            reporter,
            cases,
            matrix,
            stop_handle,
            queue: jobs.into(),
            workers: IndexMap::new(),
            next_worker: 0,
            events_tx,
            events_rx,
            failures: 0,
            stop_cause: None,
            kill_at: None,
            crash_requeued: HashSet::new(),
        }
    }

    fn grace(&self) -> Duration {
        Duration::from_millis(self.config.stop_grace_ms.max(1))
    }

    /// Drive the queue to completion. Returns the stop cause, if the run was
    /// cut short.
    pub fn run(mut self) -> Option<StopCause> {
        let started = Instant::now();
        let global_deadline = (self.config.global_timeout_ms > 0)
            .then(|| started + Duration::from_millis(self.config.global_timeout_ms));

        loop {
            if self.stop_cause.is_none() && self.stop_handle.is_stopped() {
                self.trigger_stop(StopCause::External);
            }
            self.dispatch_available();
            self.maybe_drain();
            if self.workers.is_empty() && (self.queue.is_empty() || self.stop_cause.is_some()) {
                break;
            }

            let now = Instant::now();
            let mut timeout = Duration::from_millis(100);
            if self.stop_cause.is_none() {
                if let Some(deadline) = global_deadline {
                    timeout = timeout.min(deadline.saturating_duration_since(now));
                }
            }
            if let Some(kill_at) = self.kill_at {
                timeout = timeout.min(kill_at.saturating_duration_since(now));
            }

            match self.events_rx.recv_timeout(timeout.max(Duration::from_millis(1))) {
                Ok(event) => self.handle_event(event),
                Err(RecvTimeoutError::Timeout) => {
                    if let Some(deadline) = global_deadline {
                        if self.stop_cause.is_none() && Instant::now() >= deadline {
                            self.reporter.on_timeout(started.elapsed());
                            self.trigger_stop(StopCause::GlobalTimeout);
                        }
                    }
                    if let Some(kill_at) = self.kill_at {
                        if Instant::now() >= kill_at {
                            self.kill_all();
                        }
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        self.stop_cause
    }

    /// Assign queued jobs to compatible workers, spawning up to the
    /// configured pool size.
    fn dispatch_available(&mut self) {
        if self.stop_cause.is_some() {
            return;
        }
        loop {
            let Some(front) = self.queue.front() else { break };
            let hash = front.worker_hash.clone();

            let matching = self
                .workers
                .iter()
                .find(|(_, s)| matches!(s.state, SlotState::Idle) && s.hash == hash)
                .map(|(index, _)| *index);
            if let Some(index) = matching {
                let job = self.queue.pop_front().expect("front checked");
                self.assign(index, job);
                continue;
            }

            if self.workers.len() < self.config.workers {
                let job = self.queue.pop_front().expect("front checked");
                self.spawn_for(job);
                continue;
            }

            // Pool is full: stop one idle worker with the wrong hash and wait
            // for its exit to free a slot.
            let idle = self
                .workers
                .iter()
                .find(|(_, s)| matches!(s.state, SlotState::Idle))
                .map(|(index, _)| *index);
            if let Some(index) = idle {
                debug!(worker_index = index, job_hash = %hash, "stopping mismatched idle worker");
                self.stop_worker(index);
            }
            break;
        }
    }

    /// Once the queue is empty and nothing is running, ask the remaining
    /// workers to shut down (running their worker-scoped teardowns).
    fn maybe_drain(&mut self) {
        if self.stop_cause.is_some() || !self.queue.is_empty() {
            return;
        }
        if self
            .workers
            .values()
            .any(|s| matches!(s.state, SlotState::Busy(_)))
        {
            return;
        }
        let idle: Vec<usize> = self
            .workers
            .iter()
            .filter(|(_, s)| matches!(s.state, SlotState::Idle))
            .map(|(index, _)| *index)
            .collect();
        for index in idle {
            self.stop_worker(index);
        }
    }

    fn spawn_for(&mut self, job: JobPayload) {
        let worker_index = self.next_worker;
        self.next_worker += 1;
        let init = WorkerInit {
            worker_index,
            config: Config {
                shard: None,
                ..self.config.clone()
            },
            matrix: self.matrix.clone(),
            variation: job.variation.clone(),
            repeat_each_index: job.repeat_each_index,
        };
        debug!(worker_index, hash = %job.worker_hash, "creating worker");
        match self.launcher.launch(init, self.events_tx.clone()) {
            Ok(handle) => {
                self.workers.insert(
                    worker_index,
                    WorkerSlot {
                        handle,
                        hash: job.worker_hash.clone(),
                        state: SlotState::Idle,
                        stop_sent: false,
                    },
                );
                self.assign(worker_index, job);
            }
            Err(e) => {
                let error = ErrorPayload::from_message(format!("worker spawn failed: {e}"));
                self.reporter.on_error(&error);
                for entry in &job.entries {
                    self.fail_entry(entry, error.clone(), None);
                }
            }
        }
    }

    fn assign(&mut self, worker_index: usize, job: JobPayload) {
        debug!(worker_index, file = %job.file, entries = job.entries.len(), "dispatching job");
        let Some(slot) = self.workers.get_mut(&worker_index) else {
            return;
        };
        slot.state = SlotState::Busy(ActiveJob {
            pending: job.entries.clone(),
            began: HashSet::new(),
            stdout: HashMap::new(),
            stderr: HashMap::new(),
            job: job.clone(),
        });
        if slot.handle.send(&ParentMessage::Run(job)).is_err() {
            warn!(worker_index, "failed to send job; killing worker");
            slot.handle.kill();
        }
    }

    fn stop_worker(&mut self, worker_index: usize) {
        let grace = self.grace();
        let Some(slot) = self.workers.get_mut(&worker_index) else {
            return;
        };
        if !matches!(slot.state, SlotState::Busy(_)) {
            slot.state = SlotState::Stopping;
        }
        if !slot.stop_sent {
            slot.stop_sent = true;
            if slot.handle.send(&ParentMessage::Stop).is_err() {
                slot.handle.kill();
            }
        }
        if self.kill_at.is_none() {
            self.kill_at = Some(Instant::now() + grace);
        }
    }

    fn trigger_stop(&mut self, cause: StopCause) {
        if self.stop_cause.is_some() {
            return;
        }
        debug!(?cause, "dispatcher entering stopped state");
        self.stop_cause = Some(cause);
        self.queue.clear();
        let indexes: Vec<usize> = self.workers.keys().copied().collect();
        for index in indexes {
            self.stop_worker(index);
        }
        self.kill_at = Some(Instant::now() + self.grace());
    }

    fn kill_all(&mut self) {
        for (index, slot) in self.workers.iter_mut() {
            warn!(worker_index = index, "grace window elapsed; killing worker");
            slot.handle.kill();
        }
        self.kill_at = None;
    }

    fn register_status(&mut self, test_id: &str, status: TestStatus) {
        let Some(case) = self.cases.get(test_id) else {
            return;
        };
        if case.is_unexpected(status) {
            self.failures += 1;
            if self.config.max_failures > 0 && self.failures >= self.config.max_failures {
                self.trigger_stop(StopCause::MaxFailures);
            }
        }
    }

    /// Append a synthesized failed result, report it and count it.
    fn fail_entry(&mut self, entry: &TestEntry, error: ErrorPayload, worker_index: Option<usize>) {
        let Some(case) = self.cases.get_mut(&entry.test_id) else {
            return;
        };
        case.results.push(TestResult {
            retry: entry.retry,
            worker_index,
            duration_ms: 0,
            status: TestStatus::Failed,
            error: Some(error),
            stdout: Vec::new(),
            stderr: Vec::new(),
            data: serde_json::Map::new(),
        });
        let case = &self.cases[&entry.test_id];
        self.reporter
            .on_test_end(case, case.results.last().expect("just pushed"));
        self.register_status(&entry.test_id, TestStatus::Failed);
    }

    fn handle_event(&mut self, event: DispatcherEvent) {
        let DispatcherEvent {
            worker_index,
            event,
        } = event;
        match event {
            WorkerEvent::Message(message) => match message {
                WorkerMessage::Ready => {
                    debug!(worker_index, "worker ready");
                }
                WorkerMessage::TestBegin { test_id, .. } => {
                    self.on_test_begin(worker_index, test_id);
                }
                WorkerMessage::TestEnd {
                    test_id,
                    duration_ms,
                    status,
                    error,
                    data,
                    annotations,
                } => {
                    self.on_test_end(
                        worker_index,
                        test_id,
                        duration_ms,
                        status,
                        error,
                        data,
                        annotations,
                    );
                }
                WorkerMessage::StdOut(envelope) => {
                    self.on_stdio(worker_index, envelope, true);
                }
                WorkerMessage::StdErr(envelope) => {
                    self.on_stdio(worker_index, envelope, false);
                }
                WorkerMessage::Done(payload) => self.on_done(worker_index, payload),
                WorkerMessage::TeardownError { error } => self.reporter.on_error(&error),
            },
            WorkerEvent::Stderr(line) => {
                let chunk = IoChunk::Text(format!("{line}\n"));
                self.reporter.on_std_err(&chunk, None);
            }
            WorkerEvent::Exited { code } => self.on_exited(worker_index, code),
        }
    }

    fn on_test_begin(&mut self, worker_index: usize, test_id: String) {
        // After a stop, events for not-yet-started tests are ignored.
        if self.stop_cause.is_some() {
            return;
        }
        let Some(slot) = self.workers.get_mut(&worker_index) else {
            return;
        };
        let SlotState::Busy(active) = &mut slot.state else {
            return;
        };
        active.began.insert(test_id.clone());
        if let Some(case) = self.cases.get(&test_id) {
            self.reporter.on_test_begin(case);
        }
    }

    fn on_stdio(&mut self, worker_index: usize, envelope: crate::ipc::IoEnvelope, is_out: bool) {
        let chunk = envelope.to_chunk();
        let case = envelope.test_id.as_deref().and_then(|id| self.cases.get(id));
        if is_out {
            self.reporter.on_std_out(&chunk, case);
        } else {
            self.reporter.on_std_err(&chunk, case);
        }
        if let Some(test_id) = envelope.test_id {
            if let Some(slot) = self.workers.get_mut(&worker_index) {
                if let SlotState::Busy(active) = &mut slot.state {
                    let buffer = if is_out {
                        active.stdout.entry(test_id).or_default()
                    } else {
                        active.stderr.entry(test_id).or_default()
                    };
                    buffer.push(chunk);
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn on_test_end(
        &mut self,
        worker_index: usize,
        test_id: String,
        duration_ms: u64,
        status: TestStatus,
        error: Option<ErrorPayload>,
        data: serde_json::Map<String, serde_json::Value>,
        annotations: Vec<paratest_core::Annotation>,
    ) {
        let Some(slot) = self.workers.get_mut(&worker_index) else {
            return;
        };
        let SlotState::Busy(active) = &mut slot.state else {
            return;
        };
        let began = active.began.remove(&test_id);
        let entry = active
            .pending
            .iter()
            .position(|e| e.test_id == test_id)
            .map(|i| active.pending.remove(i));
        let stdout = active.stdout.remove(&test_id).unwrap_or_default();
        let stderr = active.stderr.remove(&test_id).unwrap_or_default();

        if self.stop_cause.is_some() && !began {
            return;
        }
        let Some(entry) = entry else { return };
        let Some(case) = self.cases.get_mut(&test_id) else {
            return;
        };
        for annotation in annotations {
            if !case.annotations.contains(&annotation) {
                case.annotations.push(annotation);
            }
        }
        case.results.push(TestResult {
            retry: entry.retry,
            worker_index: Some(worker_index),
            duration_ms,
            status,
            error,
            stdout,
            stderr,
            data,
        });
        let case = &self.cases[&test_id];
        self.reporter
            .on_test_end(case, case.results.last().expect("just pushed"));
        self.register_status(&test_id, status);
    }

    fn on_done(&mut self, worker_index: usize, payload: DonePayload) {
        let Some(slot) = self.workers.get_mut(&worker_index) else {
            return;
        };
        let active = match std::mem::replace(&mut slot.state, SlotState::Idle) {
            SlotState::Busy(active) => active,
            other => {
                slot.state = other;
                return;
            }
        };

        if let Some(fatal) = payload.fatal_error {
            // Worker setup failure before any test: every unfinished entry
            // fails with that error.
            self.reporter.on_error(&fatal);
            for entry in &active.pending {
                self.fail_entry(entry, fatal.clone(), Some(worker_index));
            }
            self.stop_worker(worker_index);
            return;
        }

        if let Some(failed_id) = payload.failed_test_id {
            let retry_available = self.stop_cause.is_none()
                && self
                    .cases
                    .get(&failed_id)
                    .map(|case| {
                        case.expected_status == TestStatus::Passed
                            && (case.results.len() as u32) < self.config.retries + 1
                    })
                    .unwrap_or(false);
            if retry_available {
                if let Some(failed_entry) =
                    active.job.entries.iter().find(|e| e.test_id == failed_id)
                {
                    let attempts = self.cases[&failed_id].results.len() as u32;
                    debug!(test_id = %failed_id, retry = attempts, "re-queueing failed test");
                    let mut entries = vec![TestEntry {
                        retry: attempts,
                        ..failed_entry.clone()
                    }];
                    entries.extend(payload.remaining);
                    self.queue.push_front(JobPayload {
                        entries,
                        ..active.job.clone()
                    });
                }
            } else if !payload.remaining.is_empty() && self.stop_cause.is_none() {
                self.queue.push_front(JobPayload {
                    entries: payload.remaining,
                    ..active.job.clone()
                });
            }
            // The worker may hold poisoned worker-scoped state; replace it.
            self.stop_worker(worker_index);
            return;
        }

        if payload.remaining.is_empty() {
            // Job complete; the worker is free for the next same-hash job.
            return;
        }

        // Mid-job bail without a failed test: hand the rest to a new worker.
        if self.stop_cause.is_none() {
            self.queue.push_front(JobPayload {
                entries: payload.remaining,
                ..active.job.clone()
            });
        }
        self.stop_worker(worker_index);
    }

    fn on_exited(&mut self, worker_index: usize, code: Option<i32>) {
        let Some(slot) = self.workers.shift_remove(&worker_index) else {
            return;
        };
        match slot.state {
            SlotState::Busy(active) => {
                warn!(worker_index, ?code, "worker exited mid-job");
                let mut requeue = Vec::new();
                for entry in active.pending {
                    if self.crash_requeued.insert(entry.test_id.clone()) {
                        requeue.push(entry);
                    } else {
                        // Second crash on the same test.
                        let error = ErrorPayload::from_message(format!(
                            "worker crashed (exit code {code:?})"
                        ));
                        self.fail_entry(&entry, error, Some(worker_index));
                    }
                }
                if !requeue.is_empty() && self.stop_cause.is_none() {
                    self.queue.push_front(JobPayload {
                        entries: requeue,
                        ..active.job
                    });
                }
            }
            SlotState::Idle | SlotState::Stopping => {
                debug!(worker_index, ?code, "worker exited");
            }
        }
    }
}
