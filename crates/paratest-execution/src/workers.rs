//! Worker transport: a launcher seam plus the process-backed implementation.
//!
//! The dispatcher only ever talks to [`WorkerHandle`]s obtained from a
//! [`WorkerLauncher`], so its scheduling semantics are testable against
//! scripted in-memory workers. The production launcher re-executes the
//! current binary with [`WORKER_ENV`](crate::ipc::WORKER_ENV) set and speaks
//! line-delimited JSON over the child's stdin/stdout.

use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::Sender;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::ipc::{self, ParentMessage, WorkerInit, WorkerMessage};

/// Event funneled into the dispatcher's single channel.
#[derive(Debug)]
pub struct DispatcherEvent {
    pub worker_index: usize,
    pub event: WorkerEvent,
}

#[derive(Debug)]
pub enum WorkerEvent {
    Message(WorkerMessage),
    /// Unattributed output from the child's raw stderr.
    Stderr(String),
    Exited { code: Option<i32> },
}

/// Dispatcher-side handle on a live worker.
pub trait WorkerHandle: Send {
    fn send(&mut self, message: &ParentMessage) -> Result<()>;
    /// Hard stop; the `Exited` event still arrives through the channel.
    fn kill(&mut self);
}

/// Creates workers. The `Init` message is delivered by the launcher before
/// the handle is returned.
pub trait WorkerLauncher: Send + Sync {
    fn launch(
        &self,
        init: WorkerInit,
        events: Sender<DispatcherEvent>,
    ) -> Result<Box<dyn WorkerHandle>>;
}

/// Spawns real worker processes by re-executing a binary with the worker
/// environment variable set.
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessLauncher {
    /// Re-execute the currently running binary. Requires the embedder's
    /// `main` to call [`crate::worker_entry`] first.
    pub fn current_exe() -> Result<Self> {
        let program = std::env::current_exe()
            .map_err(|e| Error::Spawn(format!("cannot locate current executable: {e}")))?;
        Ok(Self {
            program,
            args: Vec::new(),
        })
    }

    pub fn with_command(program: PathBuf, args: Vec<String>) -> Self {
        Self { program, args }
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(
        &self,
        init: WorkerInit,
        events: Sender<DispatcherEvent>,
    ) -> Result<Box<dyn WorkerHandle>> {
        let worker_index = init.worker_index;
        debug!(worker_index, program = %self.program.display(), "spawning worker");
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env(ipc::WORKER_ENV, "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::Spawn(format!("failed to spawn worker: {e}")))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Spawn("worker stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Spawn("worker stdout unavailable".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Spawn("worker stderr unavailable".to_string()))?;

        ipc::write_message(&mut stdin, &ParentMessage::Init(init))?;

        let child = Arc::new(Mutex::new(child));

        // Raw stderr is forwarded line-by-line, unattributed.
        let stderr_events = events.clone();
        std::thread::Builder::new()
            .name(format!("worker-{worker_index}-stderr"))
            .spawn(move || {
                for line in BufReader::new(stderr).lines() {
                    let Ok(line) = line else { break };
                    let _ = stderr_events.send(DispatcherEvent {
                        worker_index,
                        event: WorkerEvent::Stderr(line),
                    });
                }
            })?;

        // Protocol reader; on EOF it reaps the child and reports the exit.
        let reader_child = Arc::clone(&child);
        std::thread::Builder::new()
            .name(format!("worker-{worker_index}-reader"))
            .spawn(move || {
                let mut reader = BufReader::new(stdout);
                loop {
                    match ipc::read_message::<_, WorkerMessage>(&mut reader) {
                        Ok(Some(message)) => {
                            trace!(worker_index, ?message, "worker message");
                            if events
                                .send(DispatcherEvent {
                                    worker_index,
                                    event: WorkerEvent::Message(message),
                                })
                                .is_err()
                            {
                                break;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!(worker_index, error = %e, "dropping malformed worker message");
                        }
                    }
                }
                let code = reap(&reader_child);
                let _ = events.send(DispatcherEvent {
                    worker_index,
                    event: WorkerEvent::Exited { code },
                });
            })?;

        Ok(Box::new(ProcessWorker {
            worker_index,
            stdin: Some(stdin),
            child,
        }))
    }
}

/// Wait for the child without holding the lock across a blocking `wait`, so
/// `kill` stays responsive.
fn reap(child: &Arc<Mutex<Child>>) -> Option<i32> {
    for _ in 0..500 {
        {
            let mut child = child.lock();
            match child.try_wait() {
                Ok(Some(status)) => return status.code(),
                Ok(None) => {}
                Err(_) => return None,
            }
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    // Still alive after the protocol channel closed; force it down.
    let mut child = child.lock();
    let _ = child.kill();
    child.wait().ok().and_then(|status| status.code())
}

struct ProcessWorker {
    worker_index: usize,
    stdin: Option<ChildStdin>,
    child: Arc<Mutex<Child>>,
}

impl WorkerHandle for ProcessWorker {
    fn send(&mut self, message: &ParentMessage) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| Error::Protocol("worker stdin already closed".to_string()))?;
        ipc::write_message(stdin, message)?;
        if matches!(message, ParentMessage::Stop) {
            // Closing stdin doubles as EOF for workers blocked on reads.
            let _ = stdin.flush();
            self.stdin = None;
        }
        Ok(())
    }

    fn kill(&mut self) {
        debug!(worker_index = self.worker_index, "killing worker");
        self.stdin = None;
        let _ = self.child.lock().kill();
    }
}
