//! Run statistics for a scheduler.

use std::time::Duration;

/// Snapshot of a [`TaskScheduler`](crate::sim::TaskScheduler)'s counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunStats {
    /// Runs requested, refused ones included.
    pub runs: u64,
    pub active: usize,
    pub completed: usize,
    pub succeeded: usize,
    /// Failed runs, timed-out ones included.
    pub failed: usize,
    pub timed_out: usize,
    /// Time since the scheduler was created.
    pub wall_time: Duration,
    /// Sum of the completed runs' durations.
    pub sim_time: Duration,
}

impl RunStats {
    /// Runs that never started because no slot freed up.
    pub fn refused(&self) -> u64 {
        self.runs
            .saturating_sub((self.active + self.completed) as u64)
    }

    pub fn average_sim_time(&self) -> Option<Duration> {
        (self.completed > 0).then(|| self.sim_time / self.completed as u32)
    }

    /// Print the stats table to stderr.
    pub fn display(&self) {
        eprintln!();
        eprintln!("=== Simulation Batch Stats ===");
        eprintln!("  Runs requested:         {}", self.runs);
        eprintln!("  Active:                 {}", self.active);
        eprintln!(
            "  Completed:              {}  (ok={}  failed={}  timed out={})",
            self.completed, self.succeeded, self.failed, self.timed_out
        );
        if self.refused() > 0 {
            eprintln!("  Refused:                {}", self.refused());
        }
        if let Some(avg) = self.average_sim_time() {
            eprintln!("  Average run:            {:>8.3}s", avg.as_secs_f64());
        }
        eprintln!("  ─────────────────────────────────");
        eprintln!("  Simulation time:        {:>8.3}s", self.sim_time.as_secs_f64());
        eprintln!("  Wall time:              {:>8.3}s", self.wall_time.as_secs_f64());
    }
}
