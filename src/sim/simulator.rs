//! External simulator invocation.
//!
//! A [`Simulator`] turns an artifact path plus extra switches into a
//! [`Command`] and names the files the run will leave next to the artifact.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::{Result, SpiceBatchError};

/// Contract between the scheduler and one simulation engine.
pub trait Simulator: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    /// Command that simulates `netlist`, writing results next to it.
    fn command(&self, netlist: &Path, switches: &[String]) -> Command;

    /// Results file produced by a successful run.
    fn raw_file(&self, netlist: &Path) -> PathBuf {
        netlist.with_extension("raw")
    }

    /// Log file produced by every run.
    fn log_file(&self, netlist: &Path) -> PathBuf {
        netlist.with_extension("log")
    }

    /// Other files some runs leave behind.
    fn companion_files(&self, netlist: &Path) -> Vec<PathBuf> {
        vec![
            netlist.with_extension("log.raw"),
            netlist.with_extension("op.raw"),
        ]
    }

    /// Expand a command-line switch into its arguments.
    ///
    /// Returns an empty list for switches the simulator always passes.
    fn valid_switch(&self, switch: &str, parameter: Option<&str>) -> Result<Vec<String>>;
}

// ---------------------------------------------------------------------------
// ngspice
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SwitchArg {
    Flag,
    Value,
    /// Value restricted to one of these words (case-insensitive).
    Choice(&'static [&'static str]),
    Integer,
}

/// Look `switch` up in an engine's table and expand it with its value.
fn expand_switch(
    engine: &str,
    table: &[(&str, SwitchArg)],
    run_switches: &[&str],
    switch: &str,
    parameter: Option<&str>,
) -> Result<Vec<String>> {
    let Some(&(_, arg)) = table.iter().find(|(s, _)| *s == switch) else {
        return Err(SpiceBatchError::Config(format!("invalid {} switch {}", engine, switch)));
    };
    if run_switches.contains(&switch) {
        tracing::info!(engine, switch, "switch is already part of every batch run");
        return Ok(Vec::new());
    }
    let value = parameter.filter(|p| !p.is_empty());
    let accepted = match (arg, value) {
        (SwitchArg::Flag, _) => return Ok(vec![switch.to_string()]),
        (_, None) => false,
        (SwitchArg::Value, Some(_)) => true,
        (SwitchArg::Choice(words), Some(v)) => words.iter().any(|w| w.eq_ignore_ascii_case(v)),
        (SwitchArg::Integer, Some(v)) => v.parse::<i64>().is_ok(),
    };
    match value {
        Some(v) if accepted => Ok(vec![switch.to_string(), v.to_string()]),
        Some(v) => Err(SpiceBatchError::Config(format!(
            "invalid value {} for {} switch {}",
            v, engine, switch
        ))),
        None => Err(SpiceBatchError::Config(format!(
            "{} switch {} needs a value",
            engine, switch
        ))),
    }
}

/// Switches ngspice accepts and whether they take a value.
const NGSPICE_SWITCHES: &[(&str, SwitchArg)] = &[
    ("-a", SwitchArg::Flag),
    ("--autorun", SwitchArg::Flag),
    ("-b", SwitchArg::Flag),
    ("--batch", SwitchArg::Flag),
    ("-c", SwitchArg::Value),
    ("--circuitfile", SwitchArg::Value),
    ("-D", SwitchArg::Value),
    ("--define", SwitchArg::Value),
    ("-i", SwitchArg::Flag),
    ("--interactive", SwitchArg::Flag),
    ("-n", SwitchArg::Flag),
    ("--no-spiceinit", SwitchArg::Flag),
    ("-o", SwitchArg::Value),
    ("--output", SwitchArg::Value),
    ("-p", SwitchArg::Flag),
    ("--pipe", SwitchArg::Flag),
    ("-q", SwitchArg::Flag),
    ("--completion", SwitchArg::Flag),
    ("-r", SwitchArg::Flag),
    ("--rawfile", SwitchArg::Value),
    ("--soa-log", SwitchArg::Value),
    ("-s", SwitchArg::Flag),
    ("--server", SwitchArg::Flag),
    ("-t", SwitchArg::Value),
    ("--term", SwitchArg::Value),
    ("-h", SwitchArg::Flag),
    ("--help", SwitchArg::Flag),
    ("-v", SwitchArg::Flag),
    ("--version", SwitchArg::Flag),
];

/// Switches every batch run already carries.
const NGSPICE_RUN_SWITCHES: &[&str] = &["-b", "-o", "-r", "-a"];

/// ngspice in batch mode: `<exe> <switches> -b -o <log> -r <raw> <netlist>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ngspice {
    executable: PathBuf,
}

impl Default for Ngspice {
    fn default() -> Self {
        Self::new("ngspice")
    }
}

impl Ngspice {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
        }
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }
}

impl Simulator for Ngspice {
    fn name(&self) -> &str {
        "ngspice"
    }

    fn command(&self, netlist: &Path, switches: &[String]) -> Command {
        let mut cmd = Command::new(&self.executable);
        cmd.args(switches)
            .arg("-b")
            .arg("-o")
            .arg(self.log_file(netlist))
            .arg("-r")
            .arg(self.raw_file(netlist))
            .arg(netlist);
        cmd
    }

    fn valid_switch(&self, switch: &str, parameter: Option<&str>) -> Result<Vec<String>> {
        expand_switch("ngspice", NGSPICE_SWITCHES, NGSPICE_RUN_SWITCHES, switch, parameter)
    }
}

// ---------------------------------------------------------------------------
// Xyce
// ---------------------------------------------------------------------------

const XYCE_SWITCHES: &[(&str, SwitchArg)] = &[
    ("-b", SwitchArg::Flag),
    ("-h", SwitchArg::Flag),
    ("-v", SwitchArg::Flag),
    ("-capabilities", SwitchArg::Flag),
    ("-license", SwitchArg::Flag),
    ("-param", SwitchArg::Value),
    ("-doc", SwitchArg::Value),
    ("-doc_cat", SwitchArg::Value),
    ("-count", SwitchArg::Flag),
    ("-syntax", SwitchArg::Flag),
    ("-norun", SwitchArg::Flag),
    ("-namesfile", SwitchArg::Value),
    ("-noise_names_file", SwitchArg::Value),
    ("-quiet", SwitchArg::Flag),
    ("-jacobian_test", SwitchArg::Flag),
    ("-hspice-ext", SwitchArg::Value),
    (
        "-redefined_params",
        SwitchArg::Choice(&["ignore", "uselast", "usefirst", "warn", "error"]),
    ),
    ("-subckt_multiplier", SwitchArg::Choice(&["true", "false"])),
    ("-delim", SwitchArg::Value),
    ("-o", SwitchArg::Value),
    ("-l", SwitchArg::Value),
    ("-per-processor", SwitchArg::Flag),
    ("-remeasure", SwitchArg::Value),
    ("-nox", SwitchArg::Choice(&["on", "off"])),
    ("-linsolv", SwitchArg::Value),
    ("-maxord", SwitchArg::Integer),
    ("-max-warnings", SwitchArg::Integer),
    ("-prf", SwitchArg::Value),
    ("-rsf", SwitchArg::Value),
    ("-r", SwitchArg::Value),
    ("-a", SwitchArg::Flag),
    ("-randseed", SwitchArg::Integer),
];

const XYCE_RUN_SWITCHES: &[&str] = &["-r", "-l"];

/// Xyce: `<exe> <switches> -r <raw> -l <log> <netlist>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Xyce {
    executable: PathBuf,
}

impl Default for Xyce {
    fn default() -> Self {
        Self::new("Xyce")
    }
}

impl Xyce {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
        }
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }
}

impl Simulator for Xyce {
    fn name(&self) -> &str {
        "xyce"
    }

    fn command(&self, netlist: &Path, switches: &[String]) -> Command {
        let mut cmd = Command::new(&self.executable);
        cmd.args(switches)
            .arg("-r")
            .arg(self.raw_file(netlist))
            .arg("-l")
            .arg(self.log_file(netlist))
            .arg(netlist);
        cmd
    }

    fn companion_files(&self, netlist: &Path) -> Vec<PathBuf> {
        vec![
            netlist.with_extension("mt0"),
            netlist.with_extension("prn"),
            netlist.with_extension("csd"),
        ]
    }

    fn valid_switch(&self, switch: &str, parameter: Option<&str>) -> Result<Vec<String>> {
        expand_switch("xyce", XYCE_SWITCHES, XYCE_RUN_SWITCHES, switch, parameter)
    }
}

// ---------------------------------------------------------------------------
// Generic command
// ---------------------------------------------------------------------------

/// Any engine driven by an argument template.
///
/// `{netlist}`, `{raw}` and `{log}` in the template are replaced by the
/// artifact and its output paths. Extra switches go before the template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSimulator {
    executable: PathBuf,
    args: Vec<String>,
}

impl CommandSimulator {
    pub fn new(executable: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            executable: executable.into(),
            args,
        }
    }
}

impl Simulator for CommandSimulator {
    fn name(&self) -> &str {
        "command"
    }

    fn command(&self, netlist: &Path, switches: &[String]) -> Command {
        let netlist_text = netlist.to_string_lossy();
        let raw = self.raw_file(netlist);
        let log = self.log_file(netlist);
        let raw_text = raw.to_string_lossy();
        let log_text = log.to_string_lossy();

        let mut cmd = Command::new(&self.executable);
        cmd.args(switches);
        for arg in &self.args {
            cmd.arg(
                arg.replace("{netlist}", &netlist_text)
                    .replace("{raw}", &raw_text)
                    .replace("{log}", &log_text),
            );
        }
        cmd
    }

    fn valid_switch(&self, switch: &str, parameter: Option<&str>) -> Result<Vec<String>> {
        if !switch.starts_with('-') {
            return Err(SpiceBatchError::Config(format!(
                "switch {} must start with '-'",
                switch
            )));
        }
        let mut args = vec![switch.to_string()];
        args.extend(parameter.filter(|p| !p.is_empty()).map(str::to_string));
        Ok(args)
    }
}

/// Program and arguments of a command, space separated.
pub(crate) fn command_line(cmd: &Command) -> String {
    std::iter::once(cmd.get_program())
        .chain(cmd.get_args())
        .map(|a| a.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ngspice_command_line() {
        let sim = Ngspice::new("/opt/ngspice/bin/ngspice");
        let cmd = sim.command(Path::new("/tmp/run/amp_3.net"), &["-n".to_string()]);
        assert_eq!(
            command_line(&cmd),
            "/opt/ngspice/bin/ngspice -n -b -o /tmp/run/amp_3.log -r /tmp/run/amp_3.raw /tmp/run/amp_3.net"
        );
    }

    #[test]
    fn test_ngspice_switch_table() {
        let sim = Ngspice::default();
        assert_eq!(sim.valid_switch("-n", None).unwrap(), vec!["-n"]);
        assert_eq!(
            sim.valid_switch("--define", Some("X=1")).unwrap(),
            vec!["--define", "X=1"]
        );
        assert!(sim.valid_switch("-b", None).unwrap().is_empty());
        assert!(sim.valid_switch("--term", None).is_err());
        assert!(sim.valid_switch("--bogus", None).is_err());
    }

    #[test]
    fn test_output_files_follow_artifact() {
        let sim = Ngspice::default();
        let net = Path::new("out/bench_1.net");
        assert_eq!(sim.raw_file(net), PathBuf::from("out/bench_1.raw"));
        assert_eq!(sim.log_file(net), PathBuf::from("out/bench_1.log"));
        assert!(sim
            .companion_files(net)
            .contains(&PathBuf::from("out/bench_1.op.raw")));
    }

    #[test]
    fn test_xyce_command_and_switches() {
        let sim = Xyce::default();
        let cmd = sim.command(Path::new("out/amp_2.net"), &["-quiet".to_string()]);
        assert_eq!(
            command_line(&cmd),
            "Xyce -quiet -r out/amp_2.raw -l out/amp_2.log out/amp_2.net"
        );

        assert_eq!(
            sim.valid_switch("-nox", Some("OFF")).unwrap(),
            vec!["-nox", "OFF"]
        );
        assert!(sim.valid_switch("-nox", Some("maybe")).is_err());
        assert_eq!(
            sim.valid_switch("-randseed", Some("42")).unwrap(),
            vec!["-randseed", "42"]
        );
        assert!(sim.valid_switch("-randseed", Some("x")).is_err());
        assert!(sim.valid_switch("-maxord", None).is_err());
        assert!(sim.valid_switch("-r", Some("other.raw")).unwrap().is_empty());
        assert!(sim.valid_switch("-n", None).is_err());
    }

    #[test]
    fn test_command_simulator_template() {
        let sim = CommandSimulator::new(
            "xyce",
            vec!["-r".into(), "{raw}".into(), "-l".into(), "{log}".into(), "{netlist}".into()],
        );
        let cmd = sim.command(Path::new("a.net"), &[]);
        assert_eq!(command_line(&cmd), "xyce -r a.raw -l a.log a.net");
    }
}
