//! Run summary output (CSV).

use std::io::Write;

use crate::error::Result;
use crate::sim::task::{TaskReport, TaskStatus};

fn status_label(status: &TaskStatus) -> String {
    match status {
        TaskStatus::Running => "running".to_string(),
        TaskStatus::Succeeded => "ok".to_string(),
        TaskStatus::Failed(Some(code)) => format!("failed({})", code),
        TaskStatus::Failed(None) => "failed".to_string(),
        TaskStatus::TimedOut => "timeout".to_string(),
    }
}

fn csv_field(text: &str) -> String {
    if text.contains([',', '"', '\n']) {
        format!("\"{}\"", text.replace('"', "\"\""))
    } else {
        text.to_string()
    }
}

/// Write one CSV row per run.
///
/// Format:
/// ```csv
/// Run,Status,Seconds,Netlist,Raw,Log,Callback
/// 1,ok,0.412,runs/amp_1.net,runs/amp_1.raw,runs/amp_1.log,
/// 2,failed(1),0.120,runs/amp_2.net,runs/amp_2.raw,runs/amp_2.fail,
/// ```
pub fn write_task_csv<W: Write>(reports: &[TaskReport], writer: &mut W) -> Result<()> {
    writeln!(writer, "Run,Status,Seconds,Netlist,Raw,Log,Callback")?;
    for report in reports {
        let callback = match &report.callback {
            Some(Ok(text)) => text.clone(),
            Some(Err(message)) => format!("error: {}", message),
            None => String::new(),
        };
        writeln!(
            writer,
            "{},{},{:.3},{},{},{},{}",
            report.seq,
            status_label(&report.status),
            report.elapsed.as_secs_f64(),
            csv_field(&report.artifact.to_string_lossy()),
            csv_field(&report.raw_file.to_string_lossy()),
            csv_field(&report.log_file.to_string_lossy()),
            csv_field(&callback),
        )?;
    }
    Ok(())
}
