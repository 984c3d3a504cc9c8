//! Explicit execution context threaded through hooks, fixtures and test
//! bodies.
//!
//! There is no process-wide "current test" state anywhere in the engine; a
//! [`TestCtx`] is constructed per invocation and carries the fixture pool,
//! parameters, cancellation flag and stdio sinks for that invocation.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;

use crate::case::{Annotation, IoChunk, TestStatus};
use crate::fixture::{FixturePool, FixtureValue};

/// Which stdio stream a chunk belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdStream {
    Out,
    Err,
}

/// Receiver for captured stdio writes. The worker implements this by
/// enveloping chunks onto the IPC channel; tests use an in-memory recorder.
pub trait IoSink: Send + Sync {
    fn chunk(&self, stream: StdStream, test_id: Option<&str>, chunk: IoChunk);
}

/// Sink that drops everything. Used for suite-level hooks outside a test.
pub struct NullSink;

impl IoSink for NullSink {
    fn chunk(&self, _stream: StdStream, _test_id: Option<&str>, _chunk: IoChunk) {}
}

/// Mutable per-invocation state shared between the runner, the context and
/// fixture teardowns. Fixture teardown closures clone the `Arc` to observe
/// the final test status after the body completed.
#[derive(Default)]
pub struct TestState {
    status: RwLock<Option<TestStatus>>,
    cancelled: AtomicBool,
    data: Mutex<serde_json::Map<String, Value>>,
    annotations: Mutex<Vec<Annotation>>,
}

impl TestState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn status(&self) -> Option<TestStatus> {
        *self.status.read()
    }

    pub fn set_status(&self, status: TestStatus) {
        *self.status.write() = Some(status);
    }

    /// Deadline expiry flips this; units are expected to notice and unwind.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn insert_data(&self, key: impl Into<String>, value: Value) {
        self.data.lock().insert(key.into(), value);
    }

    pub fn take_data(&self) -> serde_json::Map<String, Value> {
        std::mem::take(&mut self.data.lock())
    }

    pub fn annotate(&self, annotation: Annotation) {
        self.annotations.lock().push(annotation);
    }

    pub fn take_annotations(&self) -> Vec<Annotation> {
        std::mem::take(&mut self.annotations.lock())
    }
}

/// Error value used to skip a test from inside its body or a hook.
#[derive(Debug)]
pub struct SkipTest {
    pub reason: String,
}

impl std::fmt::Display for SkipTest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "skipped: {}", self.reason)
    }
}

impl std::error::Error for SkipTest {}

/// Context handed to hooks, fixture producers and test bodies.
pub struct TestCtx {
    test_id: Option<String>,
    title: String,
    file: String,
    retry: u32,
    parameters: BTreeMap<String, Value>,
    output_dir: PathBuf,
    pool: Arc<FixturePool>,
    state: Arc<TestState>,
    sink: Arc<dyn IoSink>,
}

impl TestCtx {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        test_id: Option<String>,
        title: impl Into<String>,
        file: impl Into<String>,
        retry: u32,
        parameters: BTreeMap<String, Value>,
        output_dir: PathBuf,
        pool: Arc<FixturePool>,
        state: Arc<TestState>,
        sink: Arc<dyn IoSink>,
    ) -> Self {
        Self {
            test_id,
            title: title.into(),
            file: file.into(),
            retry,
            parameters,
            output_dir,
            pool,
            state,
            sink,
        }
    }

    /// Artifact directory reserved for this invocation. Created on first
    /// use rather than eagerly.
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// `None` when this context belongs to a suite-level hook.
    pub fn test_id(&self) -> Option<&str> {
        self.test_id.as_deref()
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn file(&self) -> &str {
        &self.file
    }

    /// 0-based attempt index of the current attempt.
    pub fn retry(&self) -> u32 {
        self.retry
    }

    pub fn parameters(&self) -> &BTreeMap<String, Value> {
        &self.parameters
    }

    pub fn param(&self, name: &str) -> Option<&Value> {
        self.parameters.get(name)
    }

    pub fn state(&self) -> Arc<TestState> {
        Arc::clone(&self.state)
    }

    pub fn pool(&self) -> Arc<FixturePool> {
        Arc::clone(&self.pool)
    }

    /// Resolve a fixture by name, setting it up on first demand, and
    /// downcast its value.
    pub fn fixture<T: std::any::Any + Send + Sync>(&self, name: &str) -> anyhow::Result<Arc<T>> {
        let value = self.fixture_value(name)?;
        value
            .downcast::<T>()
            .map_err(|_| anyhow::anyhow!("fixture '{name}' has an unexpected value type"))
    }

    pub fn fixture_value(&self, name: &str) -> anyhow::Result<FixtureValue> {
        self.pool.resolve(name, &self.state)
    }

    pub fn stdout(&self) -> CtxWriter<'_> {
        CtxWriter {
            ctx: self,
            stream: StdStream::Out,
        }
    }

    pub fn stderr(&self) -> CtxWriter<'_> {
        CtxWriter {
            ctx: self,
            stream: StdStream::Err,
        }
    }

    /// Attach a key to the result's `data` map.
    pub fn set_data(&self, key: impl Into<String>, value: Value) {
        self.state.insert_data(key, value);
    }

    pub fn annotate(&self, kind: impl Into<String>, description: Option<String>) {
        self.state.annotate(Annotation::new(kind, description));
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.is_cancelled()
    }

    /// Cooperative cancellation point for long-running bodies.
    pub fn ensure_active(&self) -> anyhow::Result<()> {
        if self.is_cancelled() {
            anyhow::bail!("cancelled by deadline");
        }
        Ok(())
    }

    /// Build the error value that marks the current test skipped:
    /// `return Err(ctx.skip("not supported here"));`
    pub fn skip(&self, reason: impl Into<String>) -> anyhow::Error {
        anyhow::Error::new(SkipTest {
            reason: reason.into(),
        })
    }
}

/// `io::Write` adapter emitting attributed chunks through the context sink.
pub struct CtxWriter<'a> {
    ctx: &'a TestCtx,
    stream: StdStream,
}

impl io::Write for CtxWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let chunk = match std::str::from_utf8(buf) {
            Ok(s) => IoChunk::Text(s.to_string()),
            Err(_) => IoChunk::Buffer(buf.to_vec()),
        };
        self.ctx
            .sink
            .chunk(self.stream, self.ctx.test_id.as_deref(), chunk);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
