//! Worker dispatch and in-worker execution for Paratest
//!
//! This crate owns everything that happens after generation:
//! - The dispatcher: worker pool, hash affinity, retries, cancellation
//! - Worker processes and the typed IPC protocol between them
//! - The in-worker runner: hooks, fixtures, deadlines, result serialization

pub mod deadline;
pub mod dispatch;
pub mod error;
pub mod ipc;
pub mod run;
pub mod runner;
pub mod workers;

// Re-export main types
pub use dispatch::{Dispatcher, StopCause, StopHandle};
pub use error::{Error, Result};
pub use ipc::{DonePayload, IoEnvelope, ParentMessage, WorkerInit, WorkerMessage, WORKER_ENV};
pub use run::{run, run_with_launcher, worker_entry, RunMode, RunStatus};
pub use runner::worker_main;
pub use workers::{
    DispatcherEvent, ProcessLauncher, WorkerEvent, WorkerHandle, WorkerLauncher,
};
