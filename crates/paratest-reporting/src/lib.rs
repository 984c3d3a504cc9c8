//! Reporter interface and built-in reporters
//!
//! Reporters receive the dispatcher's event stream: `on_begin` fires before
//! any test event, `on_end` exactly once after the last `on_test_end`.
//! Events for one test arrive in order; events from different workers
//! interleave arbitrarily. Everything a reporter receives is read-only.

use std::time::{Duration, Instant};

use colored::Colorize;
use tracing::warn;

use paratest_core::{Config, ErrorPayload, IoChunk, Outcome, RunPlan, TestCase, TestResult};

/// Event consumer for a run. All methods have empty defaults so reporters
/// implement only what they render.
pub trait Reporter: Send {
    fn on_begin(&mut self, _config: &Config, _plan: &RunPlan) {}
    fn on_test_begin(&mut self, _test: &TestCase) {}
    fn on_std_out(&mut self, _chunk: &IoChunk, _test: Option<&TestCase>) {}
    fn on_std_err(&mut self, _chunk: &IoChunk, _test: Option<&TestCase>) {}
    /// `test.results` already contains `result` when this fires.
    fn on_test_end(&mut self, _test: &TestCase, _result: &TestResult) {}
    fn on_timeout(&mut self, _elapsed: Duration) {}
    fn on_error(&mut self, _error: &ErrorPayload) {}
    fn on_end(&mut self) {}
}

/// Fans every event out to a list of reporters in registration order. A
/// panicking reporter is logged and skipped for that event; it never aborts
/// the run.
#[derive(Default)]
pub struct Multiplexer {
    reporters: Vec<Box<dyn Reporter>>,
}

impl Multiplexer {
    pub fn new(reporters: Vec<Box<dyn Reporter>>) -> Self {
        Self { reporters }
    }

    pub fn add(&mut self, reporter: Box<dyn Reporter>) {
        self.reporters.push(reporter);
    }

    fn each(&mut self, event: &str, mut f: impl FnMut(&mut Box<dyn Reporter>)) {
        for reporter in &mut self.reporters {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| f(reporter)));
            if result.is_err() {
                warn!(event, "reporter panicked; event dropped");
            }
        }
    }
}

impl Reporter for Multiplexer {
    fn on_begin(&mut self, config: &Config, plan: &RunPlan) {
        self.each("onBegin", |r| r.on_begin(config, plan));
    }

    fn on_test_begin(&mut self, test: &TestCase) {
        self.each("onTestBegin", |r| r.on_test_begin(test));
    }

    fn on_std_out(&mut self, chunk: &IoChunk, test: Option<&TestCase>) {
        self.each("onStdOut", |r| r.on_std_out(chunk, test));
    }

    fn on_std_err(&mut self, chunk: &IoChunk, test: Option<&TestCase>) {
        self.each("onStdErr", |r| r.on_std_err(chunk, test));
    }

    fn on_test_end(&mut self, test: &TestCase, result: &TestResult) {
        self.each("onTestEnd", |r| r.on_test_end(test, result));
    }

    fn on_timeout(&mut self, elapsed: Duration) {
        self.each("onTimeout", |r| r.on_timeout(elapsed));
    }

    fn on_error(&mut self, error: &ErrorPayload) {
        self.each("onError", |r| r.on_error(error));
    }

    fn on_end(&mut self) {
        self.each("onEnd", |r| r.on_end());
    }
}

/// Terminal summary: failure details as they happen, counts at the end.
pub struct SummaryReporter {
    started: Option<Instant>,
    /// Latest known outcome per test id; retries overwrite earlier entries.
    outcomes: std::collections::HashMap<String, Outcome>,
    errors: Vec<ErrorPayload>,
}

impl SummaryReporter {
    pub fn new() -> Self {
        Self {
            started: None,
            outcomes: std::collections::HashMap::new(),
            errors: Vec::new(),
        }
    }
}

impl Default for SummaryReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl Reporter for SummaryReporter {
    fn on_begin(&mut self, _config: &Config, plan: &RunPlan) {
        self.started = Some(Instant::now());
        println!(
            "Running {} tests across {} jobs",
            plan.cases.len(),
            plan.jobs.len()
        );
    }

    fn on_test_end(&mut self, test: &TestCase, result: &TestResult) {
        if test.is_unexpected(result.status) {
            println!(
                "{} {} ({})",
                "FAILED".red().bold(),
                test.full_title(),
                result.status
            );
            if let Some(error) = &result.error {
                for line in error.render().lines() {
                    println!("  {line}");
                }
            }
        }
        // `test` carries all results so far; later attempts overwrite this.
        self.outcomes.insert(test.id.clone(), test.outcome());
    }

    fn on_error(&mut self, error: &ErrorPayload) {
        eprintln!("{} {}", "ERROR".red().bold(), error.render());
        self.errors.push(error.clone());
    }

    fn on_timeout(&mut self, elapsed: Duration) {
        eprintln!(
            "{} global timeout reached after {:.1}s",
            "TIMEOUT".red().bold(),
            elapsed.as_secs_f64()
        );
    }

    fn on_end(&mut self) {
        let duration = self
            .started
            .map(|s| s.elapsed())
            .unwrap_or_else(|| Duration::from_secs(0));
        let count = |wanted: Outcome| self.outcomes.values().filter(|o| **o == wanted).count();
        let (expected, unexpected, flaky, skipped) = (
            count(Outcome::Expected),
            count(Outcome::Unexpected),
            count(Outcome::Flaky),
            count(Outcome::Skipped),
        );
        println!("{}", "=".repeat(70));
        let mut parts = Vec::new();
        if expected > 0 {
            parts.push(format!("{expected} passed").green().to_string());
        }
        if unexpected > 0 {
            parts.push(format!("{unexpected} failed").red().to_string());
        }
        if flaky > 0 {
            parts.push(format!("{flaky} flaky").yellow().to_string());
        }
        if skipped > 0 {
            parts.push(format!("{skipped} skipped").yellow().to_string());
        }
        if parts.is_empty() {
            parts.push("no tests".to_string());
        }
        println!("{} in {:.2}s", parts.join(", "), duration.as_secs_f64());
        if !self.errors.is_empty() {
            println!("{} {} error(s) outside tests", "!".red(), self.errors.len());
        }
    }
}

/// Prints every generated test without executing anything; used by list mode.
#[derive(Default)]
pub struct ListReporter;

impl Reporter for ListReporter {
    fn on_begin(&mut self, _config: &Config, plan: &RunPlan) {
        for case in plan.cases.values() {
            println!("{}  {}", case.id, case.full_title());
        }
        println!("{} tests", plan.cases.len());
    }
}
