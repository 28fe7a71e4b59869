//! TOML batch configuration.
//!
//! ```toml
//! [scheduler]
//! parallel_sims = 8
//! timeout_secs = 120
//! output_folder = "runs"
//! switches = ["-n"]
//!
//! [simulator]
//! kind = "ngspice"
//! executable = "/usr/local/bin/ngspice"
//!
//! [editor]
//! library_paths = ["lib/models"]
//! ```
//!
//! Every table and field is optional.

use std::path::{Path, PathBuf};

use serde_derive::Deserialize;

use crate::document::{CircuitDocument, EditorConfig};
use crate::error::{Result, SpiceBatchError};
use crate::sim::scheduler::{SchedulerConfig, TaskScheduler};
use crate::sim::simulator::{CommandSimulator, Ngspice, Simulator, Xyce};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SimulatorKind {
    #[default]
    Ngspice,
    Xyce,
    Command,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    pub kind: SimulatorKind,
    /// Program to run. Defaults to `ngspice` or `Xyce` on `PATH` for those kinds.
    pub executable: Option<PathBuf>,
    /// Argument template for the command kind; `{netlist}`, `{raw}` and
    /// `{log}` are substituted per run.
    pub args: Vec<String>,
}

impl SimulatorConfig {
    pub fn build(&self) -> Result<Box<dyn Simulator>> {
        match self.kind {
            SimulatorKind::Ngspice => {
                if !self.args.is_empty() {
                    tracing::warn!("simulator.args is ignored for ngspice, use scheduler.switches");
                }
                Ok(Box::new(match &self.executable {
                    Some(exe) => Ngspice::new(exe),
                    None => Ngspice::default(),
                }))
            }
            SimulatorKind::Xyce => {
                if !self.args.is_empty() {
                    tracing::warn!("simulator.args is ignored for xyce, use scheduler.switches");
                }
                Ok(Box::new(match &self.executable {
                    Some(exe) => Xyce::new(exe),
                    None => Xyce::default(),
                }))
            }
            SimulatorKind::Command => {
                let exe = self.executable.clone().ok_or_else(|| {
                    SpiceBatchError::Config("simulator.executable is required for kind = \"command\"".into())
                })?;
                let args = if self.args.is_empty() {
                    vec!["{netlist}".to_string()]
                } else {
                    self.args.clone()
                };
                Ok(Box::new(CommandSimulator::new(exe, args)))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub scheduler: SchedulerConfig,
    pub simulator: SimulatorConfig,
    pub editor: EditorConfig,
}

impl BatchConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        tracing::debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| SpiceBatchError::Config(e.to_string()))
    }

    /// Scheduler for the configured simulator.
    pub fn scheduler(&self) -> Result<TaskScheduler> {
        TaskScheduler::new(self.simulator.build()?, self.scheduler.clone())
    }

    /// Open a template with the configured editor settings.
    pub fn open_document(&self, path: impl AsRef<Path>) -> Result<CircuitDocument> {
        CircuitDocument::open_with(path, self.editor.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = BatchConfig::from_toml_str("").unwrap();
        assert_eq!(config, BatchConfig::default());
        assert_eq!(config.scheduler.parallel_sims, 4);
        assert_eq!(config.editor.artifact_extension, "net");
        assert_eq!(config.simulator.build().unwrap().name(), "ngspice");
    }

    #[test]
    fn test_full_config() {
        let config = BatchConfig::from_toml_str(
            r#"
[scheduler]
parallel_sims = 2
timeout_secs = 0
output_folder = "runs"
switches = ["-n"]

[simulator]
kind = "command"
executable = "xyce"
args = ["-r", "{raw}", "{netlist}"]

[editor]
unique_directives = [".TRAN"]
library_paths = ["lib"]
divider = "."
"#,
        )
        .unwrap();
        assert_eq!(config.scheduler.parallel_sims, 2);
        assert_eq!(config.scheduler.timeout(), None);
        assert_eq!(config.scheduler.output_folder, Some(PathBuf::from("runs")));
        assert_eq!(config.simulator.kind, SimulatorKind::Command);
        assert_eq!(config.editor.divider, '.');
        assert_eq!(config.editor.library_paths, vec![PathBuf::from("lib")]);
        assert_eq!(config.simulator.build().unwrap().name(), "command");
    }

    #[test]
    fn test_xyce_kind() {
        let config = BatchConfig::from_toml_str(
            "[scheduler]\nswitches = [\"-quiet\", \"-randseed 7\"]\n\n[simulator]\nkind = \"xyce\"\n",
        )
        .unwrap();
        assert_eq!(config.simulator.kind, SimulatorKind::Xyce);
        assert_eq!(config.simulator.build().unwrap().name(), "xyce");
    }

    #[test]
    fn test_command_kind_needs_executable() {
        let config = BatchConfig::from_toml_str("[simulator]\nkind = \"command\"\n").unwrap();
        assert!(matches!(config.simulator.build(), Err(SpiceBatchError::Config(_))));
    }

    #[test]
    fn test_bad_toml_is_config_error() {
        let err = BatchConfig::from_toml_str("[scheduler]\nparallel_sims = \"many\"\n").unwrap_err();
        assert!(matches!(err, SpiceBatchError::Config(_)));
    }
}
