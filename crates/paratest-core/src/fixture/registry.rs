//! Fixture registrations and dependency-graph validation.

use std::collections::HashMap;

use indexmap::{IndexMap, IndexSet};
use tracing::debug;

use super::{FixtureRegistration, FixtureScope};
use crate::error::{Error, Result};

/// Name → registration map with override shadowing. Iteration follows
/// registration order, which is also the auto-fixture setup order.
#[derive(Default)]
pub struct FixtureRegistry {
    regs: IndexMap<String, std::sync::Arc<FixtureRegistration>>,
}

impl FixtureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fixture. Re-registering a name requires `is_override` and
    /// an identical scope; overriding an unknown name is an error.
    pub fn register(&mut self, reg: FixtureRegistration) -> Result<()> {
        match self.regs.get(&reg.name) {
            Some(existing) => {
                if !reg.is_override {
                    return Err(Error::DuplicateFixture {
                        name: reg.name.clone(),
                        location: reg.location.clone(),
                    });
                }
                if existing.scope != reg.scope {
                    return Err(Error::ScopeMismatch {
                        name: reg.name.clone(),
                        detail: format!(
                            "override changes scope from {} to {}",
                            existing.scope, reg.scope
                        ),
                    });
                }
                debug!(fixture = %reg.name, "overriding fixture registration");
            }
            None => {
                if reg.is_override {
                    return Err(Error::NoSuchFixture {
                        name: reg.name.clone(),
                    });
                }
            }
        }
        self.regs.insert(reg.name.clone(), std::sync::Arc::new(reg));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&std::sync::Arc<FixtureRegistration>> {
        self.regs.get(name)
    }

    pub fn len(&self) -> usize {
        self.regs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regs.is_empty()
    }

    /// Names of `auto` fixtures in registration order.
    pub fn auto_names(&self) -> Vec<&str> {
        self.regs
            .values()
            .filter(|r| r.auto)
            .map(|r| r.name.as_str())
            .collect()
    }

    /// Validate the whole graph: dependency presence, parameter fixtures
    /// without dependencies, the worker→test scope rule, and acyclicity.
    pub fn finalize(&self) -> Result<()> {
        for reg in self.regs.values() {
            if reg.is_parameter() && !reg.deps.is_empty() {
                return Err(Error::Config(format!(
                    "parameter fixture '{}' cannot declare dependencies",
                    reg.name
                )));
            }
            for dep in &reg.deps {
                if !self.regs.contains_key(dep) {
                    return Err(Error::NoSuchFixture { name: dep.clone() });
                }
            }
        }
        self.check_scopes()?;
        self.check_cycles()?;
        debug!(fixtures = self.regs.len(), "fixture registry validated");
        Ok(())
    }

    /// A worker-scoped fixture may not depend, transitively, on a test-scoped
    /// one.
    fn check_scopes(&self) -> Result<()> {
        for reg in self.regs.values() {
            if reg.scope != FixtureScope::Worker {
                continue;
            }
            let closure = self.transitive_closure([reg.name.as_str()])?;
            for dep_name in &closure {
                let dep = &self.regs[dep_name];
                if dep.scope == FixtureScope::Test {
                    return Err(Error::ScopeMismatch {
                        name: reg.name.clone(),
                        detail: format!(
                            "worker-scoped fixture depends on test-scoped '{}'",
                            dep.name
                        ),
                    });
                }
            }
        }
        Ok(())
    }

    /// Tri-color DFS; a back edge is a cycle, reported with its path.
    fn check_cycles(&self) -> Result<()> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            White,
            Gray,
            Black,
        }

        fn visit(
            regs: &IndexMap<String, std::sync::Arc<FixtureRegistration>>,
            name: &str,
            marks: &mut HashMap<String, Mark>,
            stack: &mut Vec<String>,
        ) -> Result<()> {
            match marks.get(name).copied().unwrap_or(Mark::White) {
                Mark::Black => return Ok(()),
                Mark::Gray => {
                    let start = stack.iter().position(|n| n == name).unwrap_or(0);
                    let mut path: Vec<String> = stack[start..].to_vec();
                    path.push(name.to_string());
                    return Err(Error::FixtureCycle { path });
                }
                Mark::White => {}
            }
            marks.insert(name.to_string(), Mark::Gray);
            stack.push(name.to_string());
            if let Some(reg) = regs.get(name) {
                for dep in &reg.deps {
                    visit(regs, dep, marks, stack)?;
                }
            }
            stack.pop();
            marks.insert(name.to_string(), Mark::Black);
            Ok(())
        }

        let mut marks = HashMap::new();
        let mut stack = Vec::new();
        for name in self.regs.keys() {
            visit(&self.regs, name, &mut marks, &mut stack)?;
        }
        Ok(())
    }

    /// Roots plus every registration transitively reachable through `deps`,
    /// sorted by name so downstream hashing is deterministic.
    pub fn transitive_closure<'a, I>(&self, roots: I) -> Result<IndexSet<String>>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut closure = IndexSet::new();
        let mut queue: Vec<String> = Vec::new();
        for root in roots {
            queue.push(root.to_string());
        }
        while let Some(name) = queue.pop() {
            let reg = self
                .regs
                .get(&name)
                .ok_or_else(|| Error::NoSuchFixture { name: name.clone() })?;
            if !closure.insert(name) {
                continue;
            }
            for dep in &reg.deps {
                if !closure.contains(dep) {
                    queue.push(dep.clone());
                }
            }
        }
        closure.sort();
        Ok(closure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixture::FixtureValue;
    use std::sync::Arc;

    fn value_fixture(name: &str, scope: FixtureScope) -> FixtureRegistration {
        FixtureRegistration::setup(name, scope, |_ctx| {
            Ok((Arc::new(()) as FixtureValue, None))
        })
    }

    #[test]
    fn duplicate_registration_fails() {
        let mut registry = FixtureRegistry::new();
        registry
            .register(value_fixture("db", FixtureScope::Test))
            .unwrap();
        let err = registry
            .register(value_fixture("db", FixtureScope::Test))
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateFixture { name, .. } if name == "db"));
    }

    #[test]
    fn override_requires_existing_name_and_same_scope() {
        let mut registry = FixtureRegistry::new();
        let err = registry
            .register(value_fixture("db", FixtureScope::Test).overriding())
            .unwrap_err();
        assert!(matches!(err, Error::NoSuchFixture { name } if name == "db"));

        registry
            .register(value_fixture("db", FixtureScope::Test))
            .unwrap();
        let err = registry
            .register(value_fixture("db", FixtureScope::Worker).overriding())
            .unwrap_err();
        assert!(matches!(err, Error::ScopeMismatch { name, .. } if name == "db"));

        registry
            .register(value_fixture("db", FixtureScope::Test).overriding())
            .unwrap();
    }

    #[test]
    fn finalize_rejects_unknown_dependency() {
        let mut registry = FixtureRegistry::new();
        registry
            .register(value_fixture("db", FixtureScope::Test).with_deps(["missing"]))
            .unwrap();
        let err = registry.finalize().unwrap_err();
        assert!(matches!(err, Error::NoSuchFixture { name } if name == "missing"));
    }

    #[test]
    fn finalize_rejects_worker_depending_on_test() {
        let mut registry = FixtureRegistry::new();
        registry
            .register(value_fixture("request", FixtureScope::Test))
            .unwrap();
        registry
            .register(value_fixture("server", FixtureScope::Worker).with_deps(["request"]))
            .unwrap();
        let err = registry.finalize().unwrap_err();
        assert!(matches!(err, Error::ScopeMismatch { name, .. } if name == "server"));
    }

    #[test]
    fn finalize_rejects_transitive_scope_violation() {
        let mut registry = FixtureRegistry::new();
        registry
            .register(value_fixture("request", FixtureScope::Test))
            .unwrap();
        registry
            .register(value_fixture("middle", FixtureScope::Worker).with_deps(["request"]))
            .unwrap();
        registry
            .register(value_fixture("server", FixtureScope::Worker).with_deps(["middle"]))
            .unwrap();
        assert!(registry.finalize().is_err());
    }

    #[test]
    fn finalize_names_the_cycle() {
        let mut registry = FixtureRegistry::new();
        registry
            .register(value_fixture("a", FixtureScope::Test).with_deps(["b"]))
            .unwrap();
        registry
            .register(value_fixture("b", FixtureScope::Test).with_deps(["a"]))
            .unwrap();
        let err = registry.finalize().unwrap_err();
        match err {
            Error::FixtureCycle { path } => {
                assert!(path.contains(&"a".to_string()));
                assert!(path.contains(&"b".to_string()));
            }
            other => panic!("expected FixtureCycle, got {other:?}"),
        }
    }

    #[test]
    fn finalize_rejects_parameter_with_deps() {
        let mut registry = FixtureRegistry::new();
        registry
            .register(value_fixture("base", FixtureScope::Worker))
            .unwrap();
        registry
            .register(FixtureRegistration::parameter("p").with_deps(["base"]))
            .unwrap();
        assert!(registry.finalize().is_err());
    }

    #[test]
    fn transitive_closure_includes_roots_and_deps() {
        let mut registry = FixtureRegistry::new();
        registry
            .register(value_fixture("config", FixtureScope::Worker))
            .unwrap();
        registry
            .register(value_fixture("db", FixtureScope::Worker).with_deps(["config"]))
            .unwrap();
        registry
            .register(value_fixture("unrelated", FixtureScope::Test))
            .unwrap();
        let closure = registry.transitive_closure(["db"]).unwrap();
        assert!(closure.contains("db"));
        assert!(closure.contains("config"));
        assert!(!closure.contains("unrelated"));
    }

    #[test]
    fn auto_names_preserve_registration_order() {
        let mut registry = FixtureRegistry::new();
        registry
            .register(value_fixture("z", FixtureScope::Test).auto())
            .unwrap();
        registry
            .register(value_fixture("a", FixtureScope::Worker).auto())
            .unwrap();
        registry
            .register(value_fixture("plain", FixtureScope::Test))
            .unwrap();
        assert_eq!(registry.auto_names(), vec!["z", "a"]);
    }
}
