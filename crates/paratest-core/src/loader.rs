//! Explicit file → registration map.
//!
//! Test files are registration callbacks keyed by a file path; running one
//! rebuilds that file's suite tree. Worker processes hold the same registry
//! (the embedder constructs it in `main` before handing control to the
//! engine), so a file loads identically on both sides of the process
//! boundary.

use std::sync::Arc;

use indexmap::IndexMap;
use tracing::debug;

use crate::case::Location;
use crate::ctx::TestCtx;
use crate::error::{Error, Result};
use crate::fixture::FixtureRegistry;
use crate::suite::{Hook, HookKind, Modifier, Spec, Suite, SuiteEntry, UserFn};

pub type SuiteFileFn = Arc<dyn Fn(&mut SuiteCtx) + Send + Sync>;
pub type FixtureFileFn = Arc<dyn Fn(&mut FixtureRegistry) -> Result<()> + Send + Sync>;

/// All registered files, in registration order.
#[derive(Clone, Default)]
pub struct FileRegistry {
    fixture_files: IndexMap<String, Vec<FixtureFileFn>>,
    test_files: IndexMap<String, Vec<SuiteFileFn>>,
}

impl FileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register fixture declarations under a file path.
    pub fn fixture_file<F>(&mut self, path: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(&mut FixtureRegistry) -> Result<()> + Send + Sync + 'static,
    {
        self.fixture_files
            .entry(path.into())
            .or_default()
            .push(Arc::new(f));
        self
    }

    /// Register a test file. The callback rebuilds the file's suite tree
    /// every time it runs.
    pub fn test_file<F>(&mut self, path: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(&mut SuiteCtx) + Send + Sync + 'static,
    {
        self.test_files
            .entry(path.into())
            .or_default()
            .push(Arc::new(f));
        self
    }

    pub fn test_file_paths(&self) -> impl Iterator<Item = &str> {
        self.test_files.keys().map(String::as_str)
    }

    pub fn fixture_file_paths(&self) -> impl Iterator<Item = &str> {
        self.fixture_files.keys().map(String::as_str)
    }

    /// Run every fixture registration and validate the resulting graph.
    pub fn load_fixtures(&self) -> Result<FixtureRegistry> {
        let mut registry = FixtureRegistry::new();
        for (path, callbacks) in &self.fixture_files {
            debug!(file = %path, "loading fixture file");
            for callback in callbacks {
                callback(&mut registry)?;
            }
        }
        registry.finalize()?;
        Ok(registry)
    }

    /// Rebuild one file's root suite.
    pub fn load_file(&self, path: &str) -> Result<Suite> {
        let callbacks = self
            .test_files
            .get(path)
            .ok_or_else(|| Error::Config(format!("unknown test file '{path}'")))?;
        debug!(file = %path, "loading test file");
        let mut suite = Suite::new_root(path);
        let mut ordinal = 0usize;
        for callback in callbacks {
            let mut ctx = SuiteCtx {
                file: path.to_string(),
                suite: &mut suite,
                ordinal: &mut ordinal,
            };
            callback(&mut ctx);
        }
        Ok(suite)
    }

    /// Rebuild every file's suite, in registration order.
    pub fn load_all(&self) -> Result<Vec<Suite>> {
        self.test_files
            .keys()
            .map(|path| self.load_file(path))
            .collect()
    }
}

/// Builder handed to test-file callbacks.
pub struct SuiteCtx<'a> {
    file: String,
    suite: &'a mut Suite,
    ordinal: &'a mut usize,
}

impl SuiteCtx<'_> {
    fn push_suite(&mut self, title: &str, only: bool, location: Location, f: impl FnOnce(&mut SuiteCtx)) {
        let mut child = Suite::new_root(&self.file);
        child.title = title.to_string();
        child.location = location;
        child.only = only;
        {
            let mut ctx = SuiteCtx {
                file: self.file.clone(),
                suite: &mut child,
                ordinal: &mut *self.ordinal,
            };
            f(&mut ctx);
        }
        self.suite.entries.push(SuiteEntry::Suite(child));
    }

    /// Declare a nested suite.
    #[track_caller]
    pub fn describe(&mut self, title: &str, f: impl FnOnce(&mut SuiteCtx)) {
        self.push_suite(title, false, Location::caller(), f);
    }

    /// Declare a focused nested suite; the run is restricted to focused
    /// subtrees.
    #[track_caller]
    pub fn describe_only(&mut self, title: &str, f: impl FnOnce(&mut SuiteCtx)) {
        self.push_suite(title, true, Location::caller(), f);
    }

    fn push_spec(&mut self, title: &str, location: Location, body: UserFn) -> SpecHandle<'_> {
        let spec = Spec {
            title: title.to_string(),
            file: self.file.clone(),
            location,
            ordinal_in_file: *self.ordinal,
            only: false,
            modifiers: Vec::new(),
            annotations: Vec::new(),
            fixtures: Vec::new(),
            body,
        };
        *self.ordinal += 1;
        self.suite.entries.push(SuiteEntry::Spec(spec));
        match self.suite.entries.last_mut() {
            Some(SuiteEntry::Spec(spec)) => SpecHandle { spec },
            _ => unreachable!("spec was just pushed"),
        }
    }

    /// Declare a test. Returns a handle for per-test options:
    /// `s.test("works", |ctx| { ... }).fixtures(["db"]).timeout(5_000);`
    #[track_caller]
    pub fn test<F>(&mut self, title: &str, body: F) -> SpecHandle<'_>
    where
        F: Fn(&mut TestCtx) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.push_spec(title, Location::caller(), Arc::new(body))
    }

    fn push_hook(&mut self, kind: HookKind, location: Location, func: UserFn) {
        self.suite.hooks.push(Hook {
            kind,
            location,
            func,
        });
    }

    #[track_caller]
    pub fn before_all<F>(&mut self, f: F)
    where
        F: Fn(&mut TestCtx) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.push_hook(HookKind::BeforeAll, Location::caller(), Arc::new(f));
    }

    #[track_caller]
    pub fn before_each<F>(&mut self, f: F)
    where
        F: Fn(&mut TestCtx) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.push_hook(HookKind::BeforeEach, Location::caller(), Arc::new(f));
    }

    #[track_caller]
    pub fn after_each<F>(&mut self, f: F)
    where
        F: Fn(&mut TestCtx) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.push_hook(HookKind::AfterEach, Location::caller(), Arc::new(f));
    }

    #[track_caller]
    pub fn after_all<F>(&mut self, f: F)
    where
        F: Fn(&mut TestCtx) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.push_hook(HookKind::AfterAll, Location::caller(), Arc::new(f));
    }

    /// Skip every test declared in this suite.
    pub fn skip_all(&mut self, reason: &str) {
        self.suite
            .modifiers
            .push(Modifier::Skip(Some(reason.to_string())));
    }

    /// Mark every test in this suite as expected to fail.
    pub fn fail_all(&mut self) {
        self.suite.modifiers.push(Modifier::Fail);
    }

    /// Override the timeout for tests in this suite.
    pub fn set_timeout(&mut self, timeout_ms: u64) {
        self.suite.modifiers.push(Modifier::Timeout(timeout_ms));
    }

    /// Triple the timeout for tests in this suite.
    pub fn slow_all(&mut self) {
        self.suite.modifiers.push(Modifier::Slow);
    }

    pub fn annotate(&mut self, kind: &str, description: Option<&str>) {
        self.suite.annotations.push(crate::case::Annotation::new(
            kind,
            description.map(str::to_string),
        ));
    }
}

/// Chainable per-spec options, returned from [`SuiteCtx::test`].
pub struct SpecHandle<'a> {
    spec: &'a mut Spec,
}

impl SpecHandle<'_> {
    /// Declare the fixtures the body resolves, by name.
    pub fn fixtures<I, S>(self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.spec.fixtures = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn only(self) -> Self {
        self.spec.only = true;
        self
    }

    pub fn skip(self, reason: &str) -> Self {
        self.spec
            .modifiers
            .push(Modifier::Skip(Some(reason.to_string())));
        self
    }

    pub fn fixme(self, reason: &str) -> Self {
        self.spec
            .modifiers
            .push(Modifier::Fixme(Some(reason.to_string())));
        self
    }

    /// Expect this test to fail.
    pub fn fails(self) -> Self {
        self.spec.modifiers.push(Modifier::Fail);
        self
    }

    pub fn slow(self) -> Self {
        self.spec.modifiers.push(Modifier::Slow);
        self
    }

    pub fn timeout(self, timeout_ms: u64) -> Self {
        self.spec.modifiers.push(Modifier::Timeout(timeout_ms));
        self
    }

    pub fn annotate(self, kind: &str, description: Option<&str>) -> Self {
        self.spec.annotations.push(crate::case::Annotation::new(
            kind,
            description.map(str::to_string),
        ));
        self
    }
}
