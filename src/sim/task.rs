//! One simulation run.
//!
//! A [`SimulationTask`] owns one external process and the supervisor
//! thread that waits on it. The supervisor enforces the task timeout,
//! honours a kill request from the scheduler, renames the log of a failed
//! run to `.fail`, and runs the callback of a successful one. The task's
//! outcome is written exactly once, when the supervisor is done.

use std::path::{Path, PathBuf};
use std::process::{Child, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::callback::{BoundCallback, CallbackOutcome};
use super::simulator::{command_line, Simulator};
use crate::error::{Result, SpiceBatchError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskStatus {
    Running,
    Succeeded,
    /// Nonzero exit, or the process could not be started (`None`).
    Failed(Option<i32>),
    TimedOut,
}

impl TaskStatus {
    pub fn is_finished(&self) -> bool {
        !matches!(self, TaskStatus::Running)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, TaskStatus::Succeeded)
    }
}

#[derive(Debug, Clone)]
struct Outcome {
    status: TaskStatus,
    finished_at: Instant,
    log_file: PathBuf,
    callback: Option<CallbackOutcome>,
}

#[derive(Debug, Default)]
struct Shared {
    outcome: Mutex<Option<Outcome>>,
    kill: AtomicBool,
}

impl Shared {
    fn finish(&self, outcome: Outcome) {
        if let Ok(mut slot) = self.outcome.lock() {
            if slot.is_none() {
                *slot = Some(outcome);
            }
        }
    }

    fn outcome(&self) -> Option<Outcome> {
        self.outcome.lock().ok().and_then(|slot| slot.clone())
    }
}

/// Snapshot of a task, safe to keep after the scheduler moves on.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskReport {
    pub seq: u64,
    pub status: TaskStatus,
    pub artifact: PathBuf,
    pub raw_file: PathBuf,
    /// Log path; ends in `.fail` when a failed run left a log behind.
    pub log_file: PathBuf,
    pub elapsed: Duration,
    pub callback: Option<CallbackOutcome>,
}

impl TaskReport {
    /// Turn a failed or timed-out run into an error.
    pub fn ensure_success(&self) -> Result<()> {
        let detail = match &self.status {
            TaskStatus::Succeeded => return Ok(()),
            TaskStatus::Running => "still running".to_string(),
            TaskStatus::Failed(Some(code)) => format!("exit status {}", code),
            TaskStatus::Failed(None) => "process did not start or was terminated".to_string(),
            TaskStatus::TimedOut => "timed out".to_string(),
        };
        Err(SpiceBatchError::ExternalProcessFailure {
            seq: self.seq,
            detail,
        })
    }
}

pub(crate) struct TaskLaunch<'a> {
    pub seq: u64,
    pub artifact: PathBuf,
    pub switches: &'a [String],
    pub timeout: Option<Duration>,
    pub callback: Option<BoundCallback>,
    pub poll_interval: Duration,
}

#[derive(Debug)]
pub struct SimulationTask {
    seq: u64,
    artifact: PathBuf,
    command_line: String,
    raw_file: PathBuf,
    log_file: PathBuf,
    timeout: Option<Duration>,
    started_at: Instant,
    callback_name: Option<String>,
    shared: Arc<Shared>,
    supervisor: Option<JoinHandle<()>>,
}

impl SimulationTask {
    /// Start the simulator on `launch.artifact` and hand the process to a
    /// supervisor thread.
    ///
    /// A process that cannot be started yields a task that is already
    /// finished with `Failed(None)`.
    pub(crate) fn start(simulator: &dyn Simulator, launch: TaskLaunch<'_>) -> Self {
        let mut cmd = simulator.command(&launch.artifact, launch.switches);
        cmd.stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::null());
        let mut task = SimulationTask {
            seq: launch.seq,
            command_line: command_line(&cmd),
            raw_file: simulator.raw_file(&launch.artifact),
            log_file: simulator.log_file(&launch.artifact),
            artifact: launch.artifact,
            timeout: launch.timeout,
            started_at: Instant::now(),
            callback_name: launch.callback.as_ref().map(|c| c.name().to_string()),
            shared: Arc::new(Shared::default()),
            supervisor: None,
        };
        tracing::info!(seq = task.seq, command = %task.command_line, "starting simulation");

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::warn!(seq = task.seq, error = %e, "simulator could not be started");
                task.shared.finish(Outcome {
                    status: TaskStatus::Failed(None),
                    finished_at: Instant::now(),
                    log_file: task.log_file.clone(),
                    callback: None,
                });
                return task;
            }
        };

        let supervisor = Supervisor {
            seq: task.seq,
            child,
            timeout: task.timeout,
            started_at: task.started_at,
            poll_interval: launch.poll_interval,
            raw_file: task.raw_file.clone(),
            log_file: task.log_file.clone(),
            callback: launch.callback,
            shared: Arc::clone(&task.shared),
        };
        let shared = Arc::clone(&task.shared);
        let log_file = task.log_file.clone();
        match thread::Builder::new()
            .name(format!("sim-task-{}", task.seq))
            .spawn(move || supervisor.run())
        {
            Ok(handle) => task.supervisor = Some(handle),
            Err(e) => {
                tracing::error!(seq = task.seq, error = %e, "cannot start supervisor thread");
                shared.finish(Outcome {
                    status: TaskStatus::Failed(None),
                    finished_at: Instant::now(),
                    log_file,
                    callback: None,
                });
            }
        }
        task
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn artifact(&self) -> &Path {
        &self.artifact
    }

    pub fn command_line(&self) -> &str {
        &self.command_line
    }

    pub fn raw_file(&self) -> &Path {
        &self.raw_file
    }

    /// Log path; see [`TaskReport::log_file`] for the final name after a failure.
    pub fn log_file(&self) -> &Path {
        &self.log_file
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn callback_name(&self) -> Option<&str> {
        self.callback_name.as_deref()
    }

    /// Instant after which the supervisor kills the process.
    pub fn deadline(&self) -> Option<Instant> {
        self.timeout.map(|t| self.started_at + t)
    }

    pub fn finished_at(&self) -> Option<Instant> {
        self.shared.outcome().map(|o| o.finished_at)
    }

    pub fn status(&self) -> TaskStatus {
        self.shared
            .outcome()
            .map_or(TaskStatus::Running, |o| o.status)
    }

    pub fn is_finished(&self) -> bool {
        self.status().is_finished()
    }

    pub fn report(&self) -> TaskReport {
        let outcome = self.shared.outcome();
        let (status, log_file, callback, end) = match outcome {
            Some(o) => (o.status, o.log_file, o.callback, o.finished_at),
            None => (TaskStatus::Running, self.log_file.clone(), None, Instant::now()),
        };
        TaskReport {
            seq: self.seq,
            status,
            artifact: self.artifact.clone(),
            raw_file: self.raw_file.clone(),
            log_file,
            elapsed: end.saturating_duration_since(self.started_at),
            callback,
        }
    }

    /// Ask the supervisor to terminate the process.
    pub(crate) fn request_kill(&self) {
        self.shared.kill.store(true, Ordering::SeqCst);
    }

    /// Wait for the supervisor thread to exit.
    pub(crate) fn join(&mut self) {
        if let Some(handle) = self.supervisor.take() {
            if handle.join().is_err() {
                tracing::error!(seq = self.seq, "supervisor thread panicked");
                self.shared.finish(Outcome {
                    status: TaskStatus::Failed(None),
                    finished_at: Instant::now(),
                    log_file: self.log_file.clone(),
                    callback: None,
                });
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

struct Supervisor {
    seq: u64,
    child: Child,
    timeout: Option<Duration>,
    started_at: Instant,
    poll_interval: Duration,
    raw_file: PathBuf,
    log_file: PathBuf,
    callback: Option<BoundCallback>,
    shared: Arc<Shared>,
}

impl Supervisor {
    fn run(mut self) {
        let status = self.wait_for_exit();
        let sim_time = self.started_at.elapsed();
        let mut log_file = self.log_file.clone();
        let mut callback = None;

        if status.is_success() {
            tracing::info!(seq = self.seq, elapsed = ?sim_time, "simulation succeeded");
            match &self.callback {
                Some(cb) if self.raw_file.exists() && self.log_file.exists() => {
                    tracing::debug!(seq = self.seq, callback = cb.name(), "running callback");
                    let outcome = cb.dispatch(self.seq, self.raw_file.clone(), self.log_file.clone());
                    if let Err(message) = &outcome {
                        tracing::error!(seq = self.seq, callback = cb.name(), %message, "callback failed");
                    }
                    callback = Some(outcome);
                }
                Some(_) => {
                    tracing::error!(seq = self.seq, "results or log file not found, callback skipped");
                }
                None => {}
            }
        } else {
            tracing::warn!(seq = self.seq, ?status, elapsed = ?sim_time, "simulation failed");
            if self.log_file.exists() {
                let failed = self.log_file.with_extension("fail");
                match std::fs::rename(&self.log_file, &failed) {
                    Ok(()) => log_file = failed,
                    Err(e) => tracing::warn!(seq = self.seq, error = %e, "cannot rename failed log"),
                }
            }
        }

        self.shared.finish(Outcome {
            status,
            finished_at: Instant::now(),
            log_file,
            callback,
        });
    }

    fn wait_for_exit(&mut self) -> TaskStatus {
        loop {
            match self.child.try_wait() {
                Ok(Some(exit)) if exit.success() => return TaskStatus::Succeeded,
                Ok(Some(exit)) => return TaskStatus::Failed(exit.code()),
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(seq = self.seq, error = %e, "cannot query simulator process");
                    self.terminate();
                    return TaskStatus::Failed(None);
                }
            }
            if self.shared.kill.load(Ordering::SeqCst) {
                tracing::warn!(seq = self.seq, "terminating simulation on request");
                self.terminate();
                return TaskStatus::TimedOut;
            }
            if self
                .timeout
                .is_some_and(|t| self.started_at.elapsed() >= t)
            {
                tracing::warn!(seq = self.seq, "simulation exceeded its timeout");
                self.terminate();
                return TaskStatus::TimedOut;
            }
            thread::sleep(self.poll_interval);
        }
    }

    fn terminate(&mut self) {
        if let Err(e) = self.child.kill() {
            tracing::debug!(seq = self.seq, error = %e, "kill failed, process may have exited");
        }
        let _ = self.child.wait();
    }
}
