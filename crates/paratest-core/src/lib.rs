//! Core types, fixture resolution and test generation for Paratest
//!
//! This crate provides the dispatch-independent building blocks of the
//! engine:
//! - Suite/spec/test model and result bookkeeping
//! - Fixture registry, dependency resolution and scoped pools
//! - Test generation: parameter expansion, filtering, hashing, sharding
//! - Run configuration and error handling

pub mod case;
pub mod config;
pub mod ctx;
pub mod error;
pub mod fixture;
pub mod generate;
pub mod loader;
pub mod suite;

// Re-export core types
pub use case::{
    Annotation, ErrorPayload, IoChunk, Location, Outcome, TestCase, TestResult, TestStatus,
};
pub use config::{Config, Shard, UpdateSnapshots};
pub use ctx::{IoSink, NullSink, SkipTest, StdStream, TestCtx, TestState};
pub use error::{Error, Result};
pub use fixture::{
    FixtureArgs, FixtureCtx, FixturePool, FixtureRegistration, FixtureRegistry, FixtureScope,
    FixtureValue, Teardown, YieldHandle,
};
pub use generate::{
    expand_file, generate, JobPayload, MaterializedTest, ParameterMatrix, RunPlan, TestEntry,
};
pub use loader::{FileRegistry, SpecHandle, SuiteCtx};
pub use suite::{Hook, HookKind, Modifier, Spec, Suite, SuiteEntry, UserFn};
