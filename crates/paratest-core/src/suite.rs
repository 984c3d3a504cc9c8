//! Declared test structure: suites, hooks and specs.
//!
//! A file registration builds one root [`Suite`] per file. Specs declare a
//! body and an explicit fixture list; materialization into runnable
//! [`TestCase`](crate::case::TestCase)s happens in the generator.

use std::fmt;
use std::sync::Arc;

use crate::case::{Annotation, Location};
use crate::ctx::TestCtx;

/// User-supplied unit: hook bodies and test bodies share this shape.
pub type UserFn = Arc<dyn Fn(&mut TestCtx) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    BeforeAll,
    BeforeEach,
    AfterEach,
    AfterAll,
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HookKind::BeforeAll => "beforeAll",
            HookKind::BeforeEach => "beforeEach",
            HookKind::AfterEach => "afterEach",
            HookKind::AfterAll => "afterAll",
        };
        f.write_str(s)
    }
}

pub struct Hook {
    pub kind: HookKind,
    pub location: Location,
    pub func: UserFn,
}

impl fmt::Debug for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hook")
            .field("kind", &self.kind)
            .field("location", &self.location)
            .finish_non_exhaustive()
    }
}

/// Declaration-time behavior tweaks. Applied outermost suite first, so inner
/// declarations win for scalar settings and `skip` accumulates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Modifier {
    Skip(Option<String>),
    Fixme(Option<String>),
    /// The test is expected to fail; a pass becomes unexpected.
    Fail,
    /// Triple the effective timeout.
    Slow,
    Timeout(u64),
}

#[derive(Debug)]
pub enum SuiteEntry {
    Suite(Suite),
    Spec(Spec),
}

/// A titled group of specs and nested suites. One root suite per file, with
/// an empty title.
pub struct Suite {
    pub title: String,
    pub file: String,
    pub location: Location,
    pub entries: Vec<SuiteEntry>,
    pub hooks: Vec<Hook>,
    pub modifiers: Vec<Modifier>,
    pub annotations: Vec<Annotation>,
    pub only: bool,
}

impl Suite {
    pub fn new_root(file: impl Into<String>) -> Self {
        let file = file.into();
        Self {
            title: String::new(),
            location: Location {
                file: file.clone(),
                line: 0,
                column: 0,
            },
            file,
            entries: Vec::new(),
            hooks: Vec::new(),
            modifiers: Vec::new(),
            annotations: Vec::new(),
            only: false,
        }
    }

    pub fn hooks_of(&self, kind: HookKind) -> impl Iterator<Item = &Hook> {
        self.hooks.iter().filter(move |h| h.kind == kind)
    }

    /// Whether this subtree contains a focused suite or spec.
    pub fn has_focus(&self) -> bool {
        if self.only {
            return true;
        }
        self.entries.iter().any(|entry| match entry {
            SuiteEntry::Suite(suite) => suite.has_focus(),
            SuiteEntry::Spec(spec) => spec.only,
        })
    }

    /// Depth-first visit of every spec with its ancestor chain (this suite
    /// included) and the entry-index path from this suite to the spec.
    pub fn visit_specs<'a>(&'a self, f: &mut dyn FnMut(&[&'a Suite], &[usize], &'a Spec)) {
        fn walk<'a>(
            suite: &'a Suite,
            chain: &mut Vec<&'a Suite>,
            path: &mut Vec<usize>,
            f: &mut dyn FnMut(&[&'a Suite], &[usize], &'a Spec),
        ) {
            chain.push(suite);
            for (index, entry) in suite.entries.iter().enumerate() {
                path.push(index);
                match entry {
                    SuiteEntry::Suite(child) => walk(child, chain, path, f),
                    SuiteEntry::Spec(spec) => f(chain, path, spec),
                }
                path.pop();
            }
            chain.pop();
        }
        let mut chain = Vec::new();
        let mut path = Vec::new();
        walk(self, &mut chain, &mut path, f);
    }

    /// Follow an entry-index path produced by [`Suite::visit_specs`].
    pub fn spec_at(&self, path: &[usize]) -> Option<&Spec> {
        let (last, prefix) = path.split_last()?;
        let mut suite = self;
        for index in prefix {
            match suite.entries.get(*index)? {
                SuiteEntry::Suite(child) => suite = child,
                SuiteEntry::Spec(_) => return None,
            }
        }
        match suite.entries.get(*last)? {
            SuiteEntry::Spec(spec) => Some(spec),
            SuiteEntry::Suite(_) => None,
        }
    }

    /// Ancestor suites (root first) along an entry-index path.
    pub fn suites_along(&self, path: &[usize]) -> Vec<&Suite> {
        let mut chain = vec![self];
        let mut suite = self;
        if path.is_empty() {
            return chain;
        }
        for index in &path[..path.len() - 1] {
            match suite.entries.get(*index) {
                Some(SuiteEntry::Suite(child)) => {
                    suite = child;
                    chain.push(child);
                }
                _ => break,
            }
        }
        chain
    }
}

impl fmt::Debug for Suite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Suite")
            .field("title", &self.title)
            .field("file", &self.file)
            .field("entries", &self.entries.len())
            .field("only", &self.only)
            .finish_non_exhaustive()
    }
}

/// A declared test point, independent of parameters.
pub struct Spec {
    pub title: String,
    pub file: String,
    pub location: Location,
    /// Declaration ordinal within the file; re-assigned after filtering.
    pub ordinal_in_file: usize,
    pub only: bool,
    pub modifiers: Vec<Modifier>,
    pub annotations: Vec<Annotation>,
    /// Explicitly declared fixture dependencies of the body.
    pub fixtures: Vec<String>,
    pub body: UserFn,
}

impl fmt::Debug for Spec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Spec")
            .field("title", &self.title)
            .field("file", &self.file)
            .field("ordinal_in_file", &self.ordinal_in_file)
            .field("only", &self.only)
            .field("fixtures", &self.fixtures)
            .finish_non_exhaustive()
    }
}
