//! Materialized tests and their results.
//!
//! A [`TestCase`] is one materialization of a declared spec under a specific
//! parameter tuple and repeat index. Results are appended once per attempt;
//! the dispatcher is the only writer after generation.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Source position of a declaration, captured at registration time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub file: String,
    pub line: u32,
    pub column: u32,
}

impl Location {
    /// Capture the caller's position. Registration APIs are `#[track_caller]`
    /// so this points at user code, not at the framework.
    #[track_caller]
    pub fn caller() -> Self {
        let loc = std::panic::Location::caller();
        Self {
            file: loc.file().to_string(),
            line: loc.line(),
            column: loc.column(),
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

/// Terminal status of a single test attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TestStatus {
    Passed,
    Failed,
    TimedOut,
    Skipped,
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TestStatus::Passed => "passed",
            TestStatus::Failed => "failed",
            TestStatus::TimedOut => "timedOut",
            TestStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// Classification of a test across all of its attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Outcome {
    Expected,
    Unexpected,
    Flaky,
    Skipped,
}

/// Free-form annotation attached to a test (skip reasons, issue links, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotation {
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Annotation {
    pub fn new(kind: impl Into<String>, description: Option<String>) -> Self {
        Self {
            kind: kind.into(),
            description,
        }
    }
}

/// Error shape shared between test results and the wire protocol.
///
/// `value` carries the rendering of non-error payloads (e.g. a panic with a
/// non-string payload); `message`/`stack` carry ordinary failures.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl ErrorPayload {
    pub fn from_message(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        Self {
            message: Some(err.to_string()),
            stack: Some(format!("{err:?}")),
            value: None,
        }
    }

    /// Render a payload recovered from `catch_unwind`.
    pub fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        if let Some(s) = payload.downcast_ref::<&str>() {
            Self::from_message(*s)
        } else if let Some(s) = payload.downcast_ref::<String>() {
            Self::from_message(s.clone())
        } else {
            Self {
                value: Some("opaque panic payload".to_string()),
                ..Default::default()
            }
        }
    }

    /// One-line rendering for reporters and logs.
    pub fn render(&self) -> String {
        self.message
            .clone()
            .or_else(|| self.value.clone())
            .unwrap_or_else(|| "unknown error".to_string())
    }
}

/// A captured stdio chunk. Text is kept as-is; binary writes are preserved
/// byte-for-byte.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IoChunk {
    Text(String),
    Buffer(Vec<u8>),
}

impl IoChunk {
    pub fn lossy(&self) -> String {
        match self {
            IoChunk::Text(s) => s.clone(),
            IoChunk::Buffer(b) => String::from_utf8_lossy(b).into_owned(),
        }
    }
}

/// Record of one attempt at a test. `retry` is the 0-based attempt index.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResult {
    pub retry: u32,
    pub worker_index: Option<usize>,
    pub duration_ms: u64,
    pub status: TestStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
    pub stdout: Vec<IoChunk>,
    pub stderr: Vec<IoChunk>,
    pub data: serde_json::Map<String, Value>,
}

impl TestResult {
    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}

/// One materialization of a spec: parameter tuple, repeat index and the
/// accumulated attempt results.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCase {
    /// Globally unique, stable across runs:
    /// `"{specOrdinal}@{file}#run{variation}-repeat{repeat}"`.
    pub id: String,
    pub file: String,
    pub spec_ordinal: usize,
    /// Suite titles from the file root down to the test title.
    pub title_path: Vec<String>,
    pub location: Location,
    pub parameters: BTreeMap<String, Value>,
    pub variation: usize,
    pub repeat_each_index: u32,
    pub expected_status: TestStatus,
    pub timeout_ms: u64,
    pub skipped: bool,
    pub annotations: Vec<Annotation>,
    /// Tests sharing a hash may share a worker and its worker-scoped fixtures.
    pub worker_hash: String,
    pub results: Vec<TestResult>,
}

impl TestCase {
    pub fn format_id(spec_ordinal: usize, file: &str, variation: usize, repeat: u32) -> String {
        format!("{spec_ordinal}@{file}#run{variation}-repeat{repeat}")
    }

    pub fn title(&self) -> &str {
        self.title_path.last().map(String::as_str).unwrap_or("")
    }

    pub fn full_title(&self) -> String {
        self.title_path.join(" ")
    }

    /// Whether a result with `status` counts against `maxFailures`.
    pub fn is_unexpected(&self, status: TestStatus) -> bool {
        status != TestStatus::Skipped && status != self.expected_status
    }

    pub fn outcome(&self) -> Outcome {
        if self.skipped {
            return Outcome::Skipped;
        }
        let attempts: Vec<TestStatus> = self
            .results
            .iter()
            .map(|r| r.status)
            .filter(|s| *s != TestStatus::Skipped)
            .collect();
        if attempts.is_empty() {
            return Outcome::Skipped;
        }
        let expected = self.expected_status;
        if attempts.iter().all(|s| *s == expected) {
            Outcome::Expected
        } else if attempts.iter().any(|s| *s == expected) {
            Outcome::Flaky
        } else {
            Outcome::Unexpected
        }
    }
}
