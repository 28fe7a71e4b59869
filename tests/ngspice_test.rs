//! Runs against a real ngspice binary from `PATH`.
//!
//! Enabled with `cargo test --features ngspice-run`.

#![cfg(feature = "ngspice-run")]

use std::process::Command;

use spicebatch::sim::{Callback, CompletionEvent, Ngspice, RunOptions, SchedulerConfig, TaskStatus};
use spicebatch::{CircuitDocument, EditorConfig, SimStepper, TaskScheduler};

const DIVIDER: &str = "\
* voltage divider
V1 in 0 DC 10
R1 in out 1k
R2 out 0 1k
.op
.end
";

fn require_ngspice() {
    Command::new("ngspice")
        .arg("--version")
        .output()
        .unwrap_or_else(|e| panic!("ngspice not found on PATH: {e}"));
}

fn scheduler(dir: &std::path::Path) -> TaskScheduler {
    let config = SchedulerConfig {
        output_folder: Some(dir.to_path_buf()),
        timeout_secs: 60,
        ..SchedulerConfig::default()
    };
    let mut sched = TaskScheduler::new(Box::new(Ngspice::default()), config).unwrap();
    sched.add_switch("-n", None).unwrap();
    sched
}

#[test]
fn test_ngspice_batch_run() {
    require_ngspice();
    let dir = tempfile::tempdir().unwrap();
    let mut sched = scheduler(dir.path());
    let doc = CircuitDocument::from_text("divider", DIVIDER, EditorConfig::default()).unwrap();

    let log_size = Callback::new("log_size", |ev: &CompletionEvent| {
        std::fs::metadata(&ev.log_file)
            .map(|m| m.len().to_string())
            .map_err(|e| e.to_string())
    });
    let report = sched
        .run_now(&doc, RunOptions::default().callback(log_size))
        .unwrap();

    assert_eq!(report.status, TaskStatus::Succeeded, "see {}", report.log_file.display());
    assert!(report.raw_file.exists());
    assert!(matches!(report.callback, Some(Ok(ref size)) if size != "0"));
}

#[test]
fn test_ngspice_sweep() {
    require_ngspice();
    let dir = tempfile::tempdir().unwrap();
    let doc = CircuitDocument::from_text("divider", DIVIDER, EditorConfig::default()).unwrap();
    let mut stepper = SimStepper::new(doc, scheduler(dir.path()));
    stepper.add_value_sweep("R2", spicebatch::sweep::sweep_log_n(100.0, 10e3, 3).unwrap()).unwrap();
    stepper.add_param_sweep("temp_c", [25, 85]);

    let outcomes = stepper.run_all(RunOptions::default(), true).unwrap();
    assert_eq!(outcomes.len(), 6);
    assert_eq!(stepper.scheduler().succeeded(), 6);
}
