//! Dependency-injected fixture system.
//!
//! Fixtures are named setup/teardown units with two scopes: `test` (fresh per
//! test) and `worker` (shared by every test that runs in a worker). The
//! registry holds the declarations and validates the dependency graph; the
//! pool owns live instances and drives setup and teardown ordering.
//!
//! Producers are two-phase: `setup` returns the value plus an optional
//! teardown closure. Fixtures whose setup and teardown naturally share a
//! blocking scope can use the task form instead, which runs the producer on
//! its own thread and hands it a [`YieldHandle`] that must fire exactly once.

mod pool;
mod registry;

pub use pool::FixturePool;
pub use registry::FixtureRegistry;

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::case::Location;
use crate::ctx::TestState;
use crate::error::{Error, Result};

/// Live fixture values are shared read-only references; the owning pool keeps
/// them alive for the span of the consuming test or worker.
pub type FixtureValue = Arc<dyn Any + Send + Sync>;

/// Teardown half of a two-phase producer.
pub type Teardown = Box<dyn FnOnce() -> anyhow::Result<()> + Send>;

/// Two-phase producer: setup work, then a value plus an optional teardown.
pub type SetupFn =
    Arc<dyn Fn(&FixtureCtx) -> anyhow::Result<(FixtureValue, Option<Teardown>)> + Send + Sync>;

/// Task-style producer: runs on its own thread, yields once, then performs
/// teardown after the yield unblocks.
pub type TaskFn = Arc<dyn Fn(FixtureCtx, YieldHandle) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FixtureScope {
    /// Set up once per worker, torn down at worker shutdown.
    Worker,
    /// Set up per test, torn down when the test finishes.
    Test,
}

impl fmt::Display for FixtureScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FixtureScope::Worker => f.write_str("worker"),
            FixtureScope::Test => f.write_str("test"),
        }
    }
}

/// Resolved dependency values passed to a producer.
#[derive(Default)]
pub struct FixtureArgs {
    values: IndexMap<String, FixtureValue>,
}

impl FixtureArgs {
    pub(crate) fn insert(&mut self, name: String, value: FixtureValue) {
        self.values.insert(name, value);
    }

    pub fn get<T: Any + Send + Sync>(&self, name: &str) -> anyhow::Result<Arc<T>> {
        let value = self
            .values
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("dependency '{name}' was not declared"))?;
        Arc::clone(value)
            .downcast::<T>()
            .map_err(|_| anyhow::anyhow!("dependency '{name}' has an unexpected value type"))
    }

    /// Convenience accessor for generator-valued (parameter) dependencies.
    pub fn json(&self, name: &str) -> anyhow::Result<Value> {
        Ok(self.get::<Value>(name)?.as_ref().clone())
    }
}

/// Context handed to a producer: its resolved dependencies plus a handle on
/// the demanding invocation's state, so teardowns can observe the final test
/// status.
pub struct FixtureCtx {
    args: FixtureArgs,
    state: Arc<TestState>,
}

impl FixtureCtx {
    pub(crate) fn new(args: FixtureArgs, state: Arc<TestState>) -> Self {
        Self { args, state }
    }

    pub fn args(&self) -> &FixtureArgs {
        &self.args
    }

    pub fn get<T: Any + Send + Sync>(&self, name: &str) -> anyhow::Result<Arc<T>> {
        self.args.get(name)
    }

    pub fn json(&self, name: &str) -> anyhow::Result<Value> {
        self.args.json(name)
    }

    /// Shared state of the test (or worker) this fixture serves. Cloning the
    /// handle into a teardown closure is the supported way to read the test
    /// status during teardown.
    pub fn state(&self) -> Arc<TestState> {
        Arc::clone(&self.state)
    }
}

/// Yield handle for task-style producers. `provide` delivers the value and
/// blocks until the pool releases the teardown gate.
pub struct YieldHandle {
    name: String,
    fired: bool,
    value_tx: mpsc::SyncSender<FixtureValue>,
    gate_rx: mpsc::Receiver<()>,
}

impl YieldHandle {
    pub(crate) fn new(
        name: String,
        value_tx: mpsc::SyncSender<FixtureValue>,
        gate_rx: mpsc::Receiver<()>,
    ) -> Self {
        Self {
            name,
            fired: false,
            value_tx,
            gate_rx,
        }
    }

    /// Deliver the fixture value, then block until teardown is requested.
    /// A second call fails with [`Error::FixtureDoubleYield`].
    pub fn provide(&mut self, value: FixtureValue) -> Result<()> {
        if self.fired {
            return Err(Error::FixtureDoubleYield {
                name: self.name.clone(),
            });
        }
        self.fired = true;
        // A closed receiver means the pool gave up on this fixture; the
        // producer proceeds straight to teardown.
        let _ = self.value_tx.send(value);
        let _ = self.gate_rx.recv();
        Ok(())
    }
}

pub(crate) enum Producer {
    Setup(SetupFn),
    Task(TaskFn),
    /// Value injected from the parameter matrix; the producer is bypassed.
    Parameter,
}

static NEXT_REGISTRATION_ID: AtomicU64 = AtomicU64::new(1);

/// A declared fixture. Dependencies are explicit name lists; there is no
/// signature introspection.
pub struct FixtureRegistration {
    id: u64,
    pub name: String,
    pub scope: FixtureScope,
    pub deps: Vec<String>,
    pub auto: bool,
    pub is_override: bool,
    pub location: Location,
    /// Default for generator-valued fixtures when the matrix has no cell.
    pub default: Option<Value>,
    pub(crate) producer: Producer,
}

impl FixtureRegistration {
    fn next_id() -> u64 {
        NEXT_REGISTRATION_ID.fetch_add(1, Ordering::Relaxed)
    }

    /// Two-phase fixture: `setup(ctx) -> (value, teardown)`.
    #[track_caller]
    pub fn setup<F>(name: impl Into<String>, scope: FixtureScope, setup: F) -> Self
    where
        F: Fn(&FixtureCtx) -> anyhow::Result<(FixtureValue, Option<Teardown>)>
            + Send
            + Sync
            + 'static,
    {
        Self {
            id: Self::next_id(),
            name: name.into(),
            scope,
            deps: Vec::new(),
            auto: false,
            is_override: false,
            location: Location::caller(),
            default: None,
            producer: Producer::Setup(Arc::new(setup)),
        }
    }

    /// Task-style fixture: the producer runs on its own thread, yields once
    /// via the handle, then resumes for teardown.
    #[track_caller]
    pub fn task<F>(name: impl Into<String>, scope: FixtureScope, task: F) -> Self
    where
        F: Fn(FixtureCtx, YieldHandle) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        Self {
            id: Self::next_id(),
            name: name.into(),
            scope,
            deps: Vec::new(),
            auto: false,
            is_override: false,
            location: Location::caller(),
            default: None,
            producer: Producer::Task(Arc::new(task)),
        }
    }

    /// Generator-valued fixture: worker-scoped, dependency-free, its value is
    /// the matrix cell chosen by the generator.
    #[track_caller]
    pub fn parameter(name: impl Into<String>) -> Self {
        Self {
            id: Self::next_id(),
            name: name.into(),
            scope: FixtureScope::Worker,
            deps: Vec::new(),
            auto: false,
            is_override: false,
            location: Location::caller(),
            default: None,
            producer: Producer::Parameter,
        }
    }

    pub fn with_deps<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.deps = deps.into_iter().map(Into::into).collect();
        self
    }

    /// Set up unconditionally before every test (test scope) or on first use
    /// of the worker (worker scope).
    pub fn auto(mut self) -> Self {
        self.auto = true;
        self
    }

    /// Mark this registration as shadowing an earlier one of the same name.
    pub fn overriding(mut self) -> Self {
        self.is_override = true;
        self
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_parameter(&self) -> bool {
        matches!(self.producer, Producer::Parameter)
    }
}

impl fmt::Debug for FixtureRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixtureRegistration")
            .field("name", &self.name)
            .field("scope", &self.scope)
            .field("deps", &self.deps)
            .field("auto", &self.auto)
            .field("is_override", &self.is_override)
            .field("location", &self.location)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_ids_are_unique() {
        let a = FixtureRegistration::parameter("a");
        let b = FixtureRegistration::parameter("b");
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn parameter_fixtures_are_worker_scoped() {
        let reg = FixtureRegistration::parameter("browser");
        assert_eq!(reg.scope, FixtureScope::Worker);
        assert!(reg.is_parameter());
        assert!(reg.deps.is_empty());
    }

    #[test]
    fn double_yield_is_rejected() {
        let (value_tx, value_rx) = mpsc::sync_channel(2);
        let (gate_tx, gate_rx) = mpsc::channel();
        // Keep the gate open so provide() does not block.
        gate_tx.send(()).unwrap();
        gate_tx.send(()).unwrap();
        let mut handle = YieldHandle::new("db".to_string(), value_tx, gate_rx);
        handle.provide(Arc::new(1u32)).unwrap();
        let err = handle.provide(Arc::new(2u32)).unwrap_err();
        assert!(matches!(err, Error::FixtureDoubleYield { name } if name == "db"));
        drop(value_rx);
    }

    #[test]
    fn args_downcast_by_name() {
        let mut args = FixtureArgs::default();
        args.insert("port".to_string(), Arc::new(8080u16));
        assert_eq!(*args.get::<u16>("port").unwrap(), 8080);
        assert!(args.get::<String>("port").is_err());
        assert!(args.get::<u16>("missing").is_err());
    }
}
