// ===============================
// src/worker.rs
// ===============================
//
// Lifecycle shared by the singleton workers (bus, executor, dispatcher).
// Start/stop are atomic transitions under one lock instead of flag writes:
//
//   Stopped -> Starting -> Running -> Stopping -> Stopped
//
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tracing::warn;

use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WorkerState { Stopped, Starting, Running, Stopping }

#[derive(Debug)]
pub struct Lifecycle {
    name: &'static str,
    state: Mutex<WorkerState>,
}

impl Lifecycle {
    pub fn new(name: &'static str) -> Self {
        Self { name, state: Mutex::new(WorkerState::Stopped) }
    }

    pub fn name(&self) -> &'static str { self.name }

    pub fn state(&self) -> WorkerState { *self.state.lock() }

    pub fn is_running(&self) -> bool { self.state() == WorkerState::Running }

    /// Stopped -> Starting. Anything else is a duplicate start.
    pub fn begin_start(&self) -> EngineResult<()> {
        let mut st = self.state.lock();
        if *st != WorkerState::Stopped {
            return Err(EngineError::AlreadyRunning { worker: self.name });
        }
        *st = WorkerState::Starting;
        Ok(())
    }

    pub fn mark_running(&self) {
        let mut st = self.state.lock();
        if *st == WorkerState::Starting {
            *st = WorkerState::Running;
        }
    }

    /// Starting|Running -> Stopping. Returns false when there is nothing to stop.
    pub fn begin_stop(&self) -> bool {
        let mut st = self.state.lock();
        match *st {
            WorkerState::Starting | WorkerState::Running => {
                *st = WorkerState::Stopping;
                true
            }
            _ => false,
        }
    }

    pub fn mark_stopped(&self) {
        *self.state.lock() = WorkerState::Stopped;
    }
}

/// Join a worker task within `wait`. On timeout the task is aborted when
/// `abort_on_timeout` is set, and the caller always gets `Timeout` back.
pub async fn join_bounded(
    what: &'static str,
    handle: JoinHandle<()>,
    wait: Duration,
    abort_on_timeout: bool,
) -> EngineResult<()> {
    let abort = handle.abort_handle();
    match timeout(wait, handle).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            // panic / cancel di dalam worker: thread sudah selesai
            warn!(worker = what, ?e, "worker ended abnormally");
            Ok(())
        }
        Err(_) => {
            if abort_on_timeout {
                abort.abort();
            }
            warn!(worker = what, waited_ms = wait.as_millis() as u64, aborted = abort_on_timeout, "worker did not exit in time");
            Err(EngineError::Timeout { what, waited_ms: wait.as_millis() as u64 })
        }
    }
}
