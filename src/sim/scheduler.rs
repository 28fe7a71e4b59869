//! Bounded-parallelism scheduling of simulation runs.
//!
//! The scheduler writes one artifact per run, starts a [`SimulationTask`]
//! for it, and keeps two disjoint lists: active tasks and completed tasks in
//! arrival order. Tasks move from one list to the other only inside
//! [`TaskScheduler::poll_completions`], which also updates the success and
//! failure counters, so `succeeded + failed == completed.len()` always holds.

use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use serde_derive::Deserialize;

use super::callback::{Callback, CallbackArgs};
use super::simulator::Simulator;
use super::task::{SimulationTask, TaskLaunch, TaskReport, TaskStatus};
use crate::document::CircuitDocument;
use crate::error::{Result, SpiceBatchError};
use crate::stats::RunStats;

/// Slack added to task deadlines before a wait gives up.
const DEADLINE_SLACK: Duration = Duration::from_secs(1);

/// Scheduler settings, usually loaded as the `[scheduler]` table of a
/// [`BatchConfig`](crate::config::BatchConfig).
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum number of simulations running at once.
    pub parallel_sims: usize,
    /// Per-run timeout in seconds. `0` disables it.
    pub timeout_secs: u64,
    /// Where artifacts are written. Defaults to the template's directory.
    pub output_folder: Option<PathBuf>,
    /// Extra simulator switches, one per entry, value after a space
    /// (`"--define X=1"`).
    pub switches: Vec<String>,
    pub poll_interval_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            parallel_sims: 4,
            timeout_secs: 600,
            output_folder: None,
            switches: Vec::new(),
            poll_interval_ms: 100,
        }
    }
}

impl SchedulerConfig {
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

/// What a run simulates.
#[derive(Debug, Clone, Copy)]
pub enum RunInput<'a> {
    /// Serialized into a fresh artifact.
    Document(&'a CircuitDocument),
    /// An existing netlist, copied into the output folder.
    File(&'a Path),
}

impl<'a> From<&'a CircuitDocument> for RunInput<'a> {
    fn from(doc: &'a CircuitDocument) -> Self {
        RunInput::Document(doc)
    }
}

impl<'a> From<&'a Path> for RunInput<'a> {
    fn from(path: &'a Path) -> Self {
        RunInput::File(path)
    }
}

impl<'a> From<&'a PathBuf> for RunInput<'a> {
    fn from(path: &'a PathBuf) -> Self {
        RunInput::File(path.as_path())
    }
}

/// Per-run options for [`TaskScheduler::launch`] and [`TaskScheduler::run_now`].
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Wait for a free slot when the parallelism cap is reached. When
    /// false the run starts at once regardless of the cap.
    pub wait_for_slot: bool,
    pub callback: Option<Callback>,
    pub callback_args: CallbackArgs,
    /// Replaces the scheduler's switches for this run.
    pub switches: Option<Vec<String>>,
    /// Replaces the configured timeout, both for the slot wait and the run.
    pub timeout: Option<Duration>,
    /// Artifact file name instead of `<template>_<seq>`.
    pub run_filename: Option<String>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            wait_for_slot: true,
            callback: None,
            callback_args: CallbackArgs::None,
            switches: None,
            timeout: None,
            run_filename: None,
        }
    }
}

impl RunOptions {
    pub fn no_wait(mut self) -> Self {
        self.wait_for_slot = false;
        self
    }

    pub fn callback(mut self, callback: Callback) -> Self {
        self.callback = Some(callback);
        self
    }

    pub fn callback_args(mut self, args: CallbackArgs) -> Self {
        self.callback_args = args;
        self
    }

    pub fn switches(mut self, switches: Vec<String>) -> Self {
        self.switches = Some(switches);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn run_filename(mut self, name: &str) -> Self {
        self.run_filename = Some(name.to_string());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchOutcome {
    Started { seq: u64 },
    /// No slot freed up within the wait timeout; nothing was started.
    Refused { seq: u64 },
}

impl LaunchOutcome {
    pub fn seq(&self) -> u64 {
        match *self {
            LaunchOutcome::Started { seq } | LaunchOutcome::Refused { seq } => seq,
        }
    }

    pub fn is_started(&self) -> bool {
        matches!(self, LaunchOutcome::Started { .. })
    }

    /// Turn a refusal into [`SpiceBatchError::SchedulingRefusal`].
    pub fn into_result(self) -> Result<u64> {
        match self {
            LaunchOutcome::Started { seq } => Ok(seq),
            LaunchOutcome::Refused { seq } => Err(SpiceBatchError::SchedulingRefusal { seq }),
        }
    }
}

#[derive(Debug)]
pub struct TaskScheduler {
    simulator: Box<dyn Simulator>,
    config: SchedulerConfig,
    switches: Vec<String>,
    active: Vec<SimulationTask>,
    completed: Vec<SimulationTask>,
    run_count: u64,
    succeeded: usize,
    failed: usize,
    created_at: Instant,
}

impl TaskScheduler {
    /// Create a scheduler, validating the configured switches and creating
    /// the output folder.
    pub fn new(simulator: Box<dyn Simulator>, config: SchedulerConfig) -> Result<Self> {
        if let Some(folder) = &config.output_folder {
            std::fs::create_dir_all(folder)?;
        }
        let mut scheduler = Self {
            simulator,
            switches: Vec::new(),
            active: Vec::new(),
            completed: Vec::new(),
            run_count: 0,
            succeeded: 0,
            failed: 0,
            created_at: Instant::now(),
            config,
        };
        for entry in scheduler.config.switches.clone() {
            let (switch, value) = match entry.trim().split_once(char::is_whitespace) {
                Some((switch, value)) => (switch, Some(value.trim())),
                None => (entry.trim(), None),
            };
            scheduler.add_switch(switch, value)?;
        }
        tracing::debug!(
            simulator = scheduler.simulator.name(),
            parallel_sims = scheduler.config.parallel_sims,
            "scheduler ready"
        );
        Ok(scheduler)
    }

    pub fn simulator(&self) -> &dyn Simulator {
        self.simulator.as_ref()
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn switches(&self) -> &[String] {
        &self.switches
    }

    /// Add a switch to every later run, after the simulator has validated it.
    pub fn add_switch(&mut self, switch: &str, value: Option<&str>) -> Result<()> {
        let args = self.simulator.valid_switch(switch, value)?;
        self.switches.extend(args);
        Ok(())
    }

    pub fn clear_switches(&mut self) {
        self.switches.clear();
    }

    fn cap(&self) -> usize {
        self.config.parallel_sims.max(1)
    }

    // -----------------------------------------------------------------------
    // Launching
    // -----------------------------------------------------------------------

    /// Schedule one run.
    ///
    /// The callback arguments are validated before anything else happens.
    /// When the cap is reached and `wait_for_slot` is set, this blocks until
    /// a slot frees or the timeout (plus one second) elapses; the latter
    /// returns [`LaunchOutcome::Refused`], which is logged but not an error.
    pub fn launch<'a>(&mut self, input: impl Into<RunInput<'a>>, options: RunOptions) -> Result<LaunchOutcome> {
        let callback = options
            .callback
            .map(|cb| cb.bind(options.callback_args))
            .transpose()?;
        self.run_count += 1;
        let seq = self.run_count;
        let _span = tracing::info_span!("launch", seq).entered();

        let artifact = self.prepare_artifact(input.into(), seq, options.run_filename.as_deref())?;
        let timeout = options.timeout.or_else(|| self.config.timeout());

        if options.wait_for_slot && !self.wait_for_slot(timeout) {
            tracing::warn!(seq, "no simulation slot freed up in time, run refused");
            return Ok(LaunchOutcome::Refused { seq });
        }

        let switches = options.switches.unwrap_or_else(|| self.switches.clone());
        let task = SimulationTask::start(
            self.simulator.as_ref(),
            TaskLaunch {
                seq,
                artifact,
                switches: &switches,
                timeout,
                callback,
                poll_interval: self.config.poll_interval(),
            },
        );
        self.active.push(task);
        Ok(LaunchOutcome::Started { seq })
    }

    fn wait_for_slot(&mut self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t + DEADLINE_SLACK);
        while self.active_count() >= self.cap() {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return false;
            }
            thread::sleep(self.config.poll_interval());
        }
        true
    }

    /// Run one simulation to completion, ignoring the parallelism cap.
    ///
    /// The run is counted and kept with the completed tasks like any other.
    pub fn run_now<'a>(&mut self, input: impl Into<RunInput<'a>>, options: RunOptions) -> Result<TaskReport> {
        let callback = options
            .callback
            .map(|cb| cb.bind(options.callback_args))
            .transpose()?;
        self.run_count += 1;
        let seq = self.run_count;
        let _span = tracing::info_span!("run_now", seq).entered();

        let artifact = self.prepare_artifact(input.into(), seq, options.run_filename.as_deref())?;
        let switches = options.switches.unwrap_or_else(|| self.switches.clone());
        let mut task = SimulationTask::start(
            self.simulator.as_ref(),
            TaskLaunch {
                seq,
                artifact,
                switches: &switches,
                timeout: options.timeout.or_else(|| self.config.timeout()),
                callback,
                poll_interval: self.config.poll_interval(),
            },
        );
        task.join();
        let report = task.report();
        self.record(task);
        Ok(report)
    }

    fn output_dir(&self, input: &RunInput<'_>) -> PathBuf {
        if let Some(folder) = &self.config.output_folder {
            return folder.clone();
        }
        let source = match input {
            RunInput::Document(doc) => doc.template_path(),
            RunInput::File(path) => Some(*path),
        };
        source
            .and_then(Path::parent)
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    fn prepare_artifact(&self, input: RunInput<'_>, seq: u64, run_filename: Option<&str>) -> Result<PathBuf> {
        let dir = self.output_dir(&input);
        match input {
            RunInput::Document(doc) => {
                let name = run_filename
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("{}_{}", doc.stem(), seq));
                doc.write_artifact(dir.join(name))
            }
            RunInput::File(source) => {
                if !source.exists() {
                    return Err(SpiceBatchError::Io(std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        format!("netlist {} not found", source.display()),
                    )));
                }
                let extension = source
                    .extension()
                    .map(|e| e.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "net".to_string());
                let name = match run_filename {
                    Some(name) => PathBuf::from(name),
                    None => {
                        let stem = source
                            .file_stem()
                            .map(|s| s.to_string_lossy().into_owned())
                            .unwrap_or_else(|| "netlist".to_string());
                        PathBuf::from(format!("{}_{}", stem, seq))
                    }
                };
                let target = dir.join(name).with_extension(extension);
                if target != source {
                    std::fs::copy(source, &target)?;
                }
                tracing::debug!(artifact = %target.display(), "netlist copied for run");
                Ok(target)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Completion tracking
    // -----------------------------------------------------------------------

    fn record(&mut self, task: SimulationTask) {
        if task.status().is_success() {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
        self.completed.push(task);
    }

    /// Move finished tasks from the active list to the completed list.
    /// Returns how many moved.
    pub fn poll_completions(&mut self) -> usize {
        let mut moved = 0;
        let mut i = 0;
        while i < self.active.len() {
            if self.active[i].is_finished() {
                let mut task = self.active.remove(i);
                task.join();
                tracing::debug!(seq = task.seq(), status = ?task.status(), "task completed");
                self.record(task);
                moved += 1;
            } else {
                i += 1;
            }
        }
        moved
    }

    pub fn active_count(&mut self) -> usize {
        self.poll_completions();
        self.active.len()
    }

    pub fn completed_count(&self) -> usize {
        self.completed.len()
    }

    pub fn run_count(&self) -> u64 {
        self.run_count
    }

    pub fn succeeded(&self) -> usize {
        self.succeeded
    }

    pub fn failed(&self) -> usize {
        self.failed
    }

    /// Latest deadline among the active tasks, if any has a timeout.
    pub fn max_stop_time(&self) -> Option<Instant> {
        self.active.iter().filter_map(SimulationTask::deadline).max()
    }

    fn kill_all(&mut self) {
        for task in &self.active {
            task.request_kill();
        }
        for task in &mut self.active {
            task.join();
        }
        self.poll_completions();
    }

    /// Wait until no task is active.
    ///
    /// Without an explicit `timeout` the wait ends at the latest task
    /// deadline. Returns true only when every completed run succeeded and
    /// nothing is left running. On expiry with `kill_on_timeout`, every
    /// active simulator process is terminated before returning.
    pub fn await_all(&mut self, timeout: Option<Duration>, kill_on_timeout: bool) -> bool {
        let _span = tracing::info_span!("await_all").entered();
        let explicit = timeout.map(|t| Instant::now() + t);
        while self.active_count() > 0 {
            let deadline = explicit.or_else(|| self.max_stop_time().map(|t| t + DEADLINE_SLACK));
            if deadline.is_some_and(|d| Instant::now() > d) {
                tracing::warn!(active = self.active.len(), "wait for simulations timed out");
                if kill_on_timeout {
                    self.kill_all();
                }
                return false;
            }
            thread::sleep(self.config.poll_interval());
        }
        self.failed == 0
    }

    /// Block until run `seq` finishes and return its report.
    pub fn wait_results(&mut self, seq: u64) -> Result<TaskReport> {
        loop {
            self.poll_completions();
            if let Some(task) = self.completed.iter().find(|t| t.seq() == seq) {
                return Ok(task.report());
            }
            if !self.active.iter().any(|t| t.seq() == seq) {
                return Err(SpiceBatchError::UnknownTask(seq));
            }
            thread::sleep(self.config.poll_interval());
        }
    }

    /// Reports for the completed runs, in arrival order.
    ///
    /// Iteration first yields the runs already completed, then blocks for
    /// the active ones. If the latest task deadline passes while runs are
    /// still active it yields a single [`SpiceBatchError::TaskTimeout`]
    /// and stops. Every call starts again from the first completed run.
    pub fn completions(&mut self) -> Completions<'_> {
        Completions {
            scheduler: self,
            cursor: 0,
            done: false,
        }
    }

    pub fn reports(&self) -> Vec<TaskReport> {
        self.completed.iter().map(SimulationTask::report).collect()
    }

    pub fn stats(&self) -> RunStats {
        RunStats {
            runs: self.run_count,
            active: self.active.len(),
            completed: self.completed.len(),
            succeeded: self.succeeded,
            failed: self.failed,
            timed_out: self
                .completed
                .iter()
                .filter(|t| t.status() == TaskStatus::TimedOut)
                .count(),
            wall_time: self.created_at.elapsed(),
            sim_time: self.completed.iter().map(|t| t.report().elapsed).sum(),
        }
    }

    /// Delete the artifacts and simulator output of every completed run.
    ///
    /// Only call this once the results are no longer needed. Returns the
    /// number of files removed.
    pub fn cleanup_artifacts(&mut self) -> Result<usize> {
        self.poll_completions();
        let mut removed = 0;
        for task in &self.completed {
            let report = task.report();
            let mut files = vec![
                report.artifact.clone(),
                report.raw_file.clone(),
                task.log_file().to_path_buf(),
                report.log_file.clone(),
            ];
            files.extend(self.simulator.companion_files(&report.artifact));
            files.dedup();
            for file in files {
                match std::fs::remove_file(&file) {
                    Ok(()) => {
                        tracing::debug!(file = %file.display(), "deleted");
                        removed += 1;
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        tracing::info!(removed, "run files cleaned up");
        Ok(removed)
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        if !self.active.is_empty() {
            tracing::warn!(active = self.active.len(), "scheduler dropped with running simulations");
            self.kill_all();
        }
    }
}

/// Iterator returned by [`TaskScheduler::completions`].
#[derive(Debug)]
pub struct Completions<'s> {
    scheduler: &'s mut TaskScheduler,
    cursor: usize,
    done: bool,
}

impl Iterator for Completions<'_> {
    type Item = Result<TaskReport>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            self.scheduler.poll_completions();
            if let Some(task) = self.scheduler.completed.get(self.cursor) {
                self.cursor += 1;
                return Some(Ok(task.report()));
            }
            if self.scheduler.active.is_empty() {
                self.done = true;
                return None;
            }
            if self
                .scheduler
                .max_stop_time()
                .is_some_and(|stop| Instant::now() > stop + DEADLINE_SLACK)
            {
                self.done = true;
                return Some(Err(SpiceBatchError::TaskTimeout {
                    active: self.scheduler.active.len(),
                }));
            }
            thread::sleep(self.scheduler.config.poll_interval());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::simulator::CommandSimulator;

    #[test]
    fn test_config_defaults() {
        let config = SchedulerConfig::default();
        assert_eq!(config.parallel_sims, 4);
        assert_eq!(config.timeout(), Some(Duration::from_secs(600)));
        let config = SchedulerConfig {
            timeout_secs: 0,
            ..SchedulerConfig::default()
        };
        assert_eq!(config.timeout(), None);
    }

    #[test]
    fn test_launch_outcome_into_result() {
        assert_eq!(LaunchOutcome::Started { seq: 2 }.into_result().unwrap(), 2);
        assert!(matches!(
            LaunchOutcome::Refused { seq: 5 }.into_result(),
            Err(SpiceBatchError::SchedulingRefusal { seq: 5 })
        ));
    }

    #[test]
    fn test_config_switches_are_validated() {
        let config = SchedulerConfig {
            switches: vec!["-n".into(), "--define  X=1".into()],
            ..SchedulerConfig::default()
        };
        let scheduler =
            TaskScheduler::new(Box::new(crate::sim::simulator::Ngspice::default()), config).unwrap();
        assert_eq!(scheduler.switches(), ["-n", "--define", "X=1"]);

        let config = SchedulerConfig {
            switches: vec!["-nope".into()],
            ..SchedulerConfig::default()
        };
        assert!(TaskScheduler::new(Box::new(crate::sim::simulator::Ngspice::default()), config).is_err());
    }

    #[test]
    fn test_unknown_run_and_empty_wait() {
        let sim = CommandSimulator::new("true", Vec::new());
        let mut scheduler = TaskScheduler::new(Box::new(sim), SchedulerConfig::default()).unwrap();
        assert!(matches!(
            scheduler.wait_results(9),
            Err(SpiceBatchError::UnknownTask(9))
        ));
        assert!(scheduler.await_all(None, false));
        assert_eq!(scheduler.completions().count(), 0);
    }

    #[test]
    fn test_invalid_callback_rejected_before_launch() {
        let sim = CommandSimulator::new("true", Vec::new());
        let mut scheduler = TaskScheduler::new(Box::new(sim), SchedulerConfig::default()).unwrap();
        let doc = CircuitDocument::from_text("t", "* t\nR1 a 0 1k\n.end\n", Default::default()).unwrap();
        let cb = Callback::new("needs_arg", |_| Ok(String::new())).with_params(&["gain"]);
        let err = scheduler
            .launch(&doc, RunOptions::default().callback(cb))
            .unwrap_err();
        assert!(matches!(err, SpiceBatchError::InvalidCallback(_)));
        assert_eq!(scheduler.run_count(), 0);
    }
}
