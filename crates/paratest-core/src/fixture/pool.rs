//! Live fixture instances and their lifecycle.
//!
//! One root pool per worker owns worker-scoped instances; each test gets a
//! child pool for test-scoped instances. Instances are created lazily on
//! first demand, record which fixtures used them, and are torn down
//! post-order (usages first) in reverse setup order.

use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{mpsc, Arc};

use indexmap::IndexSet;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, trace, warn};

use super::{
    FixtureArgs, FixtureCtx, FixtureRegistration, FixtureRegistry, FixtureScope, FixtureValue,
    Producer, Teardown, YieldHandle,
};
use crate::ctx::TestState;
use crate::error::Error;

struct Slot {
    reg: Arc<FixtureRegistration>,
    value: FixtureValue,
    /// Registration ids of fixtures that depended on this instance.
    usages: Vec<u64>,
    teardown: Option<Teardown>,
}

#[derive(Default)]
struct PoolState {
    /// Setup order; teardown walks it in reverse.
    order: Vec<u64>,
    slots: HashMap<u64, Slot>,
    /// Names currently being set up, to catch re-entrant resolution.
    in_progress: IndexSet<String>,
}

/// A scope's worth of live fixtures.
pub struct FixturePool {
    registry: Arc<FixtureRegistry>,
    parent: Option<Arc<FixturePool>>,
    scope: FixtureScope,
    /// Generator-supplied parameter values, present on the root pool.
    params: BTreeMap<String, Value>,
    state: Mutex<PoolState>,
}

impl FixturePool {
    /// Worker-level root pool. `params` holds the matrix cells for this
    /// worker's variation.
    pub fn root(registry: Arc<FixtureRegistry>, params: BTreeMap<String, Value>) -> Arc<Self> {
        Arc::new(Self {
            registry,
            parent: None,
            scope: FixtureScope::Worker,
            params,
            state: Mutex::new(PoolState::default()),
        })
    }

    /// Fresh test-level pool branching off this worker pool.
    pub fn child(self: &Arc<Self>) -> Arc<Self> {
        Arc::new(Self {
            registry: Arc::clone(&self.registry),
            parent: Some(Arc::clone(self)),
            scope: FixtureScope::Test,
            params: BTreeMap::new(),
            state: Mutex::new(PoolState::default()),
        })
    }

    pub fn scope(&self) -> FixtureScope {
        self.scope
    }

    pub fn registry(&self) -> &Arc<FixtureRegistry> {
        &self.registry
    }

    /// Resolve a fixture by name, setting it up (and its dependencies) on
    /// first demand. Worker-scoped names route to the parent pool.
    pub fn resolve(
        self: &Arc<Self>,
        name: &str,
        state: &Arc<TestState>,
    ) -> anyhow::Result<FixtureValue> {
        let reg = self
            .registry
            .get(name)
            .ok_or_else(|| Error::NoSuchFixture {
                name: name.to_string(),
            })?
            .clone();

        if reg.scope != self.scope {
            return match (&self.parent, reg.scope) {
                (Some(parent), FixtureScope::Worker) => parent.resolve(name, state),
                _ => Err(Error::ScopeMismatch {
                    name: name.to_string(),
                    detail: format!(
                        "{}-scoped fixture demanded from {} scope",
                        reg.scope, self.scope
                    ),
                }
                .into()),
            };
        }

        if let Some(value) = self.lookup(reg.id()) {
            return Ok(value);
        }

        {
            let mut pool_state = self.state.lock();
            if pool_state.in_progress.contains(name) {
                let mut path: Vec<String> =
                    pool_state.in_progress.iter().cloned().collect();
                path.push(name.to_string());
                return Err(Error::FixtureCycle { path }.into());
            }
            pool_state.in_progress.insert(name.to_string());
        }

        let outcome = self.setup_slot(&reg, state);
        self.state.lock().in_progress.shift_remove(name);
        outcome
    }

    /// Set up every `auto` fixture relevant to this pool's scope, in
    /// registration order. Test pools also trigger worker-scoped autos
    /// through routing.
    pub fn setup_auto(self: &Arc<Self>, state: &Arc<TestState>) -> anyhow::Result<()> {
        let autos: Vec<String> = self
            .registry
            .auto_names()
            .into_iter()
            .map(str::to_string)
            .collect();
        for name in autos {
            let reg = self
                .registry
                .get(&name)
                .ok_or_else(|| Error::NoSuchFixture { name: name.clone() })?;
            if self.scope == FixtureScope::Worker && reg.scope == FixtureScope::Test {
                continue;
            }
            self.resolve(&name, state)?;
        }
        Ok(())
    }

    fn lookup(&self, id: u64) -> Option<FixtureValue> {
        self.state
            .lock()
            .slots
            .get(&id)
            .map(|slot| Arc::clone(&slot.value))
    }

    fn setup_slot(
        self: &Arc<Self>,
        reg: &Arc<FixtureRegistration>,
        state: &Arc<TestState>,
    ) -> anyhow::Result<FixtureValue> {
        trace!(fixture = %reg.name, scope = %reg.scope, "setting up fixture");

        let mut args = FixtureArgs::default();
        for dep in &reg.deps {
            let value = self.resolve(dep, state)?;
            args.insert(dep.clone(), value);
        }
        for dep in &reg.deps {
            self.record_usage(dep, reg.id());
        }

        let (value, teardown) = match &reg.producer {
            Producer::Parameter => {
                let cell = self
                    .params
                    .get(&reg.name)
                    .cloned()
                    .or_else(|| reg.default.clone())
                    .unwrap_or(Value::Null);
                (Arc::new(cell) as FixtureValue, None)
            }
            Producer::Setup(setup) => {
                let ctx = FixtureCtx::new(args, Arc::clone(state));
                setup(&ctx)
                    .map_err(|e| e.context(format!("fixture '{}' setup failed", reg.name)))?
            }
            Producer::Task(task) => self.spawn_task(reg, args, state)?,
        };

        let mut pool_state = self.state.lock();
        pool_state.order.push(reg.id());
        pool_state.slots.insert(
            reg.id(),
            Slot {
                reg: Arc::clone(reg),
                value: Arc::clone(&value),
                usages: Vec::new(),
                teardown,
            },
        );
        Ok(value)
    }

    /// Run a task-style producer on its own thread, wait for the yielded
    /// value and wrap the gate release + join into the teardown.
    fn spawn_task(
        &self,
        reg: &Arc<FixtureRegistration>,
        args: FixtureArgs,
        state: &Arc<TestState>,
    ) -> anyhow::Result<(FixtureValue, Option<Teardown>)> {
        let task = match &reg.producer {
            Producer::Task(task) => Arc::clone(task),
            _ => unreachable!("spawn_task on non-task producer"),
        };
        let name = reg.name.clone();
        let (value_tx, value_rx) = mpsc::sync_channel(1);
        let (gate_tx, gate_rx) = mpsc::channel();
        let handle = YieldHandle::new(name.clone(), value_tx, gate_rx);
        let ctx = FixtureCtx::new(args, Arc::clone(state));
        let join = std::thread::Builder::new()
            .name(format!("fixture-{name}"))
            .spawn(move || task(ctx, handle))?;

        match value_rx.recv() {
            Ok(value) => {
                let name = reg.name.clone();
                let teardown: Teardown = Box::new(move || {
                    let _ = gate_tx.send(());
                    match join.join() {
                        Ok(result) => {
                            result.map_err(|e| e.context(format!("fixture '{name}' teardown")))
                        }
                        Err(payload) => Err(anyhow::anyhow!(
                            "fixture '{name}' teardown panicked: {}",
                            crate::case::ErrorPayload::from_panic(payload.as_ref()).render()
                        )),
                    }
                });
                Ok((value, Some(teardown)))
            }
            Err(_) => {
                // The producer finished without yielding; its return value is
                // the real error.
                match join.join() {
                    Ok(Ok(())) => Err(anyhow::anyhow!(
                        "fixture '{name}' completed without yielding a value"
                    )),
                    Ok(Err(e)) => Err(e.context(format!("fixture '{name}' setup failed"))),
                    Err(payload) => Err(anyhow::anyhow!(
                        "fixture '{name}' setup panicked: {}",
                        crate::case::ErrorPayload::from_panic(payload.as_ref()).render()
                    )),
                }
            }
        }
    }

    fn record_usage(self: &Arc<Self>, dep_name: &str, user_id: u64) {
        let Some(dep_reg) = self.registry.get(dep_name) else {
            return;
        };
        if dep_reg.scope != self.scope {
            if let Some(parent) = &self.parent {
                parent.record_usage(dep_name, user_id);
            }
            return;
        }
        let dep_id = dep_reg.id();
        let mut pool_state = self.state.lock();
        if let Some(slot) = pool_state.slots.get_mut(&dep_id) {
            if !slot.usages.contains(&user_id) {
                slot.usages.push(user_id);
            }
        }
    }

    /// Tear down every instance this pool owns. Usages go first, then the
    /// instance, walking setup order in reverse. Errors are collected; the
    /// first is returned, the rest are logged.
    pub fn teardown(&self) -> anyhow::Result<()> {
        let plan = self.teardown_plan();
        let mut first_error: Option<anyhow::Error> = None;
        for (name, teardown) in plan {
            debug!(fixture = %name, scope = %self.scope, "tearing down fixture");
            let result = catch_unwind(AssertUnwindSafe(teardown));
            let error = match result {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e),
                Err(payload) => Some(anyhow::anyhow!(
                    "fixture '{name}' teardown panicked: {}",
                    crate::case::ErrorPayload::from_panic(payload.as_ref()).render()
                )),
            };
            if let Some(error) = error {
                if first_error.is_none() {
                    first_error = Some(error);
                } else {
                    warn!(fixture = %name, error = %error, "additional teardown error");
                }
            }
        }
        match first_error {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    fn teardown_plan(&self) -> Vec<(String, Teardown)> {
        fn collect(
            state: &mut PoolState,
            id: u64,
            planned: &mut IndexSet<u64>,
            plan: &mut Vec<(String, Teardown)>,
        ) {
            if planned.contains(&id) || !state.slots.contains_key(&id) {
                return;
            }
            planned.insert(id);
            let usages = state.slots[&id].usages.clone();
            for user in usages {
                collect(state, user, planned, plan);
            }
            let slot = state.slots.get_mut(&id).expect("slot checked above");
            if let Some(teardown) = slot.teardown.take() {
                plan.push((slot.reg.name.clone(), teardown));
            }
        }

        let mut state = self.state.lock();
        let order: Vec<u64> = state.order.iter().rev().copied().collect();
        let mut planned = IndexSet::new();
        let mut plan = Vec::new();
        for id in order {
            collect(&mut state, id, &mut planned, &mut plan);
        }
        state.slots.clear();
        state.order.clear();
        plan
    }
}
