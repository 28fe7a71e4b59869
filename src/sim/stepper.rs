//! Multi-dimensional sweeps over one document.
//!
//! Each added sweep is one dimension. [`SimStepper::run_all`] walks the
//! cartesian product like an odometer (the last dimension turns fastest),
//! applies every combination to the document and launches one run for it.

use crate::circuit::ComponentValue;
use crate::document::CircuitDocument;
use crate::error::Result;

use super::scheduler::{LaunchOutcome, RunOptions, TaskScheduler};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepTarget {
    Parameter,
    ComponentValue,
    Model,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepAxis {
    pub target: StepTarget,
    /// Parameter name or component path.
    pub element: String,
    pub values: Vec<ComponentValue>,
}

#[derive(Debug)]
pub struct SimStepper {
    document: CircuitDocument,
    scheduler: TaskScheduler,
    axes: Vec<StepAxis>,
}

impl SimStepper {
    pub fn new(document: CircuitDocument, scheduler: TaskScheduler) -> Self {
        Self {
            document,
            scheduler,
            axes: Vec::new(),
        }
    }

    pub fn document(&self) -> &CircuitDocument {
        &self.document
    }

    /// Fixed edits applied to every run go through here.
    pub fn document_mut(&mut self) -> &mut CircuitDocument {
        &mut self.document
    }

    pub fn scheduler(&self) -> &TaskScheduler {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut TaskScheduler {
        &mut self.scheduler
    }

    pub fn axes(&self) -> &[StepAxis] {
        &self.axes
    }

    pub fn into_parts(self) -> (CircuitDocument, TaskScheduler) {
        (self.document, self.scheduler)
    }

    pub fn add_param_sweep<I, V>(&mut self, name: &str, values: I)
    where
        I: IntoIterator<Item = V>,
        V: Into<ComponentValue>,
    {
        self.push_axis(StepTarget::Parameter, name, values);
    }

    /// Sweep a component value. Fails if `path` does not name a component.
    pub fn add_value_sweep<I, V>(&mut self, path: &str, values: I) -> Result<()>
    where
        I: IntoIterator<Item = V>,
        V: Into<ComponentValue>,
    {
        self.document.get_component_value(path)?;
        self.push_axis(StepTarget::ComponentValue, path, values);
        Ok(())
    }

    /// Sweep a device model. Fails if `path` does not name a component.
    pub fn add_model_sweep<I, S>(&mut self, path: &str, models: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.document.get_element_model(path)?;
        let models = models.into_iter().map(|m| ComponentValue::from(m.as_ref()));
        self.push_axis(StepTarget::Model, path, models);
        Ok(())
    }

    fn push_axis<I, V>(&mut self, target: StepTarget, element: &str, values: I)
    where
        I: IntoIterator<Item = V>,
        V: Into<ComponentValue>,
    {
        let values: Vec<ComponentValue> = values.into_iter().map(Into::into).collect();
        if values.is_empty() {
            tracing::warn!(element, "sweep has no values, nothing will run");
        }
        self.axes.push(StepAxis {
            target,
            element: element.to_string(),
            values,
        });
    }

    /// Number of runs [`run_all`](Self::run_all) will launch.
    pub fn total_simulations(&self) -> usize {
        self.axes.iter().map(|a| a.values.len()).product()
    }

    fn apply(&mut self, axis: usize, index: usize) -> Result<()> {
        let StepAxis { target, element, values } = &self.axes[axis];
        let value = values[index].clone();
        match target {
            StepTarget::Parameter => self.document.set_parameter(element, value),
            StepTarget::ComponentValue => self.document.set_component_value(element, value),
            StepTarget::Model => self.document.set_element_model(element, &value.to_string()),
        }
    }

    /// Launch one run per combination of the sweep values.
    ///
    /// `options` is reused for every run. With `wait` set, blocks until all
    /// runs finish. Edits stay applied to the document afterwards.
    pub fn run_all(&mut self, options: RunOptions, wait: bool) -> Result<Vec<LaunchOutcome>> {
        let total = self.total_simulations();
        let _span = tracing::info_span!("run_all", total).entered();
        let mut outcomes = Vec::with_capacity(total);
        if total == 0 {
            return Ok(outcomes);
        }

        let mut indices = vec![0usize; self.axes.len()];
        let mut first_changed = 0;
        'runs: loop {
            for axis in first_changed..self.axes.len() {
                self.apply(axis, indices[axis])?;
            }
            let outcome = self.scheduler.launch(&self.document, options.clone())?;
            if !outcome.is_started() {
                tracing::warn!(seq = outcome.seq(), ?indices, "sweep point not started");
            }
            outcomes.push(outcome);

            let mut axis = self.axes.len();
            loop {
                if axis == 0 {
                    break 'runs;
                }
                axis -= 1;
                indices[axis] += 1;
                if indices[axis] < self.axes[axis].values.len() {
                    break;
                }
                indices[axis] = 0;
            }
            first_changed = axis;
        }

        if wait {
            let all_ok = self.scheduler.await_all(None, false);
            tracing::info!(all_ok, runs = outcomes.len(), "sweep finished");
        }
        Ok(outcomes)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::document::EditorConfig;
    use crate::sim::scheduler::SchedulerConfig;
    use crate::sim::simulator::CommandSimulator;

    const TEMPLATE: &str = "\
* stepper bench
V1 in 0 1
R1 in out 1k
D1 out 0 D1N4148
.param gain=1
.end
";

    fn stepper(dir: &std::path::Path) -> SimStepper {
        let doc = CircuitDocument::from_text("bench", TEMPLATE, EditorConfig::default()).unwrap();
        let config = SchedulerConfig {
            output_folder: Some(dir.to_path_buf()),
            ..SchedulerConfig::default()
        };
        let scheduler = TaskScheduler::new(Box::new(CommandSimulator::new("true", Vec::new())), config).unwrap();
        SimStepper::new(doc, scheduler)
    }

    #[test]
    fn test_total_simulations() {
        let dir = tempfile::tempdir().unwrap();
        let mut st = stepper(dir.path());
        assert_eq!(st.total_simulations(), 1);
        st.add_param_sweep("gain", [1, 2, 3]);
        st.add_value_sweep("R1", ["1k", "2k"]).unwrap();
        assert_eq!(st.total_simulations(), 6);
        st.add_param_sweep("gain", Vec::<f64>::new());
        assert_eq!(st.total_simulations(), 0);
    }

    #[test]
    fn test_unknown_component_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut st = stepper(dir.path());
        assert!(st.add_value_sweep("R9", [1.0]).is_err());
        assert!(st.add_model_sweep("D9", ["1N914"]).is_err());
        assert!(st.axes().is_empty());
    }

    #[test]
    fn test_run_all_odometer_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut st = stepper(dir.path());
        st.add_model_sweep("D1", ["1N914", "1N4001"]).unwrap();
        st.add_value_sweep("R1", ["1k", "2k", "3k"]).unwrap();

        let outcomes = st.run_all(RunOptions::default(), true).unwrap();
        assert_eq!(outcomes.len(), 6);
        assert!(outcomes.iter().all(LaunchOutcome::is_started));

        let expected = [
            ("1N914", "1k"),
            ("1N914", "2k"),
            ("1N914", "3k"),
            ("1N4001", "1k"),
            ("1N4001", "2k"),
            ("1N4001", "3k"),
        ];
        for (outcome, (model, value)) in outcomes.iter().zip(expected) {
            let path = dir.path().join(format!("bench_{}.net", outcome.seq()));
            let text = std::fs::read_to_string(path).unwrap();
            assert!(text.contains(&format!("D1 out 0 {}\n", model)), "{}", text);
            assert!(text.contains(&format!("R1 in out {}\n", value)), "{}", text);
        }
        assert_eq!(st.scheduler().completed_count(), 6);
    }
}
