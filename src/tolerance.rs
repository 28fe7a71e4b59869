//! Tolerance testbenches: worst-case corners and Monte-Carlo draws.
//!
//! A [`ToleranceBench`] rewrites component values and parameters into
//! expressions of a `run` parameter. The returned [`SimStepper`] then
//! sweeps `run`, starting at `-1`, which every expression maps to the
//! nominal value.

use crate::document::CircuitDocument;
use crate::error::{Result, SpiceBatchError};
use crate::sim::scheduler::TaskScheduler;
use crate::sim::stepper::SimStepper;
use crate::sweep::MAX_SWEEP_POINTS;
use crate::units::parse_eng;

/// Element types whose value may deviate.
pub const DEVIATION_PREFIXES: [char; 5] = ['R', 'C', 'L', 'V', 'I'];

/// Parameter swept by a prepared testbench.
pub const RUN_PARAMETER: &str = "run";

const WORST_CASE_FUNCS: &[&str] = &[
    ".func binary(run,idx) {floor(run/pow(2,idx))-2*floor(run/pow(2,idx+1))}",
    ".func wc(nom,tol,idx) {run<0 ? nom : nom*(binary(run,idx)>0.5 ? 1-tol : 1+tol)}",
    ".func wc1(nom,lo,hi,idx) {run<0 ? nom : (binary(run,idx)>0.5 ? lo : hi)}",
];

const UNIFORM_TOL_FUNC: &str = ".func utol(nom,tol) {run<0 ? nom : nom*aunif(1,tol)}";
const NORMAL_TOL_FUNC: &str = ".func ntol(nom,tol) {run<0 ? nom : nom*agauss(1,tol,3)}";
const UNIFORM_RANGE_FUNC: &str = ".func urng(nom,lo,hi) {run<0 ? nom : aunif((lo+hi)/2,(hi-lo)/2)}";
const NORMAL_RANGE_FUNC: &str = ".func nrng(nom,lo,hi) {run<0 ? nom : agauss((lo+hi)/2,(hi-lo)/2,3)}";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Distribution {
    #[default]
    Uniform,
    /// Gaussian with the bound at three sigma.
    Normal,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Deviation {
    #[default]
    None,
    /// Relative tolerance, `0.05` for +/-5 %.
    Tolerance { tolerance: f64, distribution: Distribution },
    /// Absolute bounds.
    MinMax { min: f64, max: f64, distribution: Distribution },
}

impl Deviation {
    pub fn tolerance(tolerance: f64, distribution: Distribution) -> Self {
        Deviation::Tolerance { tolerance, distribution }
    }

    pub fn min_max(min: f64, max: f64, distribution: Distribution) -> Self {
        Deviation::MinMax { min, max, distribution }
    }

    /// True when the value never moves.
    pub fn is_fixed(&self) -> bool {
        match *self {
            Deviation::None => true,
            Deviation::Tolerance { tolerance, .. } => tolerance == 0.0,
            Deviation::MinMax { min, max, .. } => min == max,
        }
    }

    fn worst_case_expr(&self, nominal: &str, index: usize) -> Option<String> {
        match *self {
            Deviation::None => None,
            Deviation::Tolerance { tolerance, .. } => {
                Some(format!("{{wc({},{},{})}}", nominal, tolerance, index))
            }
            Deviation::MinMax { min, max, .. } => {
                Some(format!("{{wc1({},{},{},{})}}", nominal, min, max, index))
            }
        }
    }

    /// Monte-Carlo expression plus the `.func` it relies on.
    fn monte_carlo_expr(&self, nominal: &str) -> Option<(String, &'static str)> {
        match *self {
            Deviation::None => None,
            Deviation::Tolerance { tolerance, distribution: Distribution::Uniform } => {
                Some((format!("{{utol({},{})}}", nominal, tolerance), UNIFORM_TOL_FUNC))
            }
            Deviation::Tolerance { tolerance, distribution: Distribution::Normal } => {
                Some((format!("{{ntol({},{})}}", nominal, tolerance), NORMAL_TOL_FUNC))
            }
            Deviation::MinMax { min, max, distribution: Distribution::Uniform } => {
                Some((format!("{{urng({},{},{})}}", nominal, min, max), UNIFORM_RANGE_FUNC))
            }
            Deviation::MinMax { min, max, distribution: Distribution::Normal } => {
                Some((format!("{{nrng({},{},{})}}", nominal, min, max), NORMAL_RANGE_FUNC))
            }
        }
    }
}

/// Nominal value usable inside an expression, or `None` when it cannot be
/// computed (source descriptions such as `AC 1 SIN(..)`).
fn expression_operand(value: &str) -> Option<&str> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if parse_eng(value).is_ok() {
        return Some(value);
    }
    value
        .strip_prefix('{')
        .and_then(|v| v.strip_suffix('}'))
        .filter(|inner| !inner.trim().is_empty())
}

#[derive(Debug, Clone)]
pub struct ToleranceBench {
    document: CircuitDocument,
    /// Per element type, applied to components without their own entry.
    defaults: Vec<(char, Deviation)>,
    devices: Vec<(String, Deviation)>,
    parameters: Vec<(String, Deviation)>,
}

fn upsert<K: PartialEq>(entries: &mut Vec<(K, Deviation)>, key: K, deviation: Deviation) {
    match entries.iter_mut().find(|(k, _)| *k == key) {
        Some(entry) => entry.1 = deviation,
        None => entries.push((key, deviation)),
    }
}

impl ToleranceBench {
    pub fn new(document: CircuitDocument) -> Self {
        Self {
            document,
            defaults: Vec::new(),
            devices: Vec::new(),
            parameters: Vec::new(),
        }
    }

    pub fn document(&self) -> &CircuitDocument {
        &self.document
    }

    /// Set a relative tolerance on one component (`"R3"`) or, given a bare
    /// prefix (`"R"`), on every component of that type.
    pub fn set_tolerance(
        &mut self,
        reference: &str,
        tolerance: f64,
        distribution: Distribution,
    ) -> Result<()> {
        self.set_deviation_for(reference, Deviation::tolerance(tolerance, distribution))
    }

    pub fn set_tolerances<I, S>(&mut self, tolerances: I, distribution: Distribution) -> Result<()>
    where
        I: IntoIterator<Item = (S, f64)>,
        S: AsRef<str>,
    {
        for (reference, tolerance) in tolerances {
            self.set_tolerance(reference.as_ref(), tolerance, distribution)?;
        }
        Ok(())
    }

    /// Bound one component (or every component of a prefix) to `[min, max]`.
    pub fn set_deviation(
        &mut self,
        reference: &str,
        min: f64,
        max: f64,
        distribution: Distribution,
    ) -> Result<()> {
        self.set_deviation_for(reference, Deviation::min_max(min, max, distribution))
    }

    fn set_deviation_for(&mut self, reference: &str, deviation: Deviation) -> Result<()> {
        let mut chars = reference.chars();
        let prefix = chars
            .next()
            .map(|c| c.to_ascii_uppercase())
            .ok_or_else(|| SpiceBatchError::ComponentNotFound(String::new()))?;
        if !DEVIATION_PREFIXES.contains(&prefix) {
            return Err(SpiceBatchError::UnsupportedElementType(prefix));
        }
        if chars.next().is_none() {
            upsert(&mut self.defaults, prefix, deviation);
            return Ok(());
        }
        let exists = self
            .document
            .get_components(&prefix.to_string())
            .iter()
            .any(|c| c.eq_ignore_ascii_case(reference));
        if !exists {
            return Err(SpiceBatchError::ComponentNotFound(reference.to_string()));
        }
        upsert(&mut self.devices, reference.to_string(), deviation);
        Ok(())
    }

    /// Relative tolerance on a `.PARAM` value.
    pub fn set_parameter_tolerance(
        &mut self,
        name: &str,
        tolerance: f64,
        distribution: Distribution,
    ) -> Result<()> {
        self.document.get_parameter(name)?;
        upsert(
            &mut self.parameters,
            name.to_string(),
            Deviation::tolerance(tolerance, distribution),
        );
        Ok(())
    }

    pub fn set_parameter_deviation(
        &mut self,
        name: &str,
        min: f64,
        max: f64,
        distribution: Distribution,
    ) -> Result<()> {
        self.document.get_parameter(name)?;
        upsert(
            &mut self.parameters,
            name.to_string(),
            Deviation::min_max(min, max, distribution),
        );
        Ok(())
    }

    /// Current value of `reference` and the deviation that applies to it.
    ///
    /// Values that are not numbers or `{expressions}` never deviate.
    pub fn component_deviation(&self, reference: &str) -> Result<(String, Deviation)> {
        let value = self.document.get_component_value(reference)?;
        let Some(operand) = expression_operand(&value) else {
            return Ok((value, Deviation::None));
        };
        let own = self
            .devices
            .iter()
            .find(|(r, _)| r.eq_ignore_ascii_case(reference))
            .map(|(_, d)| *d);
        let by_prefix = || {
            let prefix = reference.chars().next()?.to_ascii_uppercase();
            self.defaults.iter().find(|(p, _)| *p == prefix).map(|(_, d)| *d)
        };
        let deviation = own.or_else(by_prefix).unwrap_or_default();
        Ok((operand.to_string(), deviation))
    }

    fn candidates(&self) -> Vec<String> {
        self.document
            .get_components(&DEVIATION_PREFIXES.iter().collect::<String>())
    }

    /// Rewrite the document for a worst-case corner sweep.
    ///
    /// Each deviating value gets one bit of `run`; returns the number of
    /// corners, `2^bits`.
    fn prepare_worst_case(&mut self) -> Result<usize> {
        let mut index = 0usize;
        let explicit: Vec<String> = self.devices.iter().map(|(r, _)| r.clone()).collect();
        let others: Vec<String> = self
            .candidates()
            .into_iter()
            .filter(|c| !explicit.iter().any(|r| r.eq_ignore_ascii_case(c)))
            .collect();

        for reference in &explicit {
            if self.apply_worst_case(reference, index)? {
                index += 1;
            }
        }
        for (name, deviation) in self.parameters.clone() {
            if deviation.is_fixed() {
                continue;
            }
            let value = self.document.get_parameter(&name)?;
            let Some(operand) = expression_operand(&value) else { continue };
            if let Some(expr) = deviation.worst_case_expr(operand, index) {
                self.document.set_parameter(&name, expr)?;
                index += 1;
            }
        }
        for reference in &others {
            if self.apply_worst_case(reference, index)? {
                index += 1;
            }
        }

        let corners = 1usize
            .checked_shl(index as u32)
            .filter(|&c| c <= MAX_SWEEP_POINTS)
            .ok_or_else(|| {
                SpiceBatchError::InvalidValue(format!("{} deviating values is too many corners", index))
            })?;
        self.document.add_directives(WORST_CASE_FUNCS)?;
        self.document.set_parameter(RUN_PARAMETER, -1)?;
        tracing::info!(deviating = index, corners, "worst-case testbench prepared");
        Ok(corners)
    }

    fn apply_worst_case(&mut self, reference: &str, index: usize) -> Result<bool> {
        let (operand, deviation) = self.component_deviation(reference)?;
        if deviation.is_fixed() {
            return Ok(false);
        }
        match deviation.worst_case_expr(&operand, index) {
            Some(expr) => {
                self.document.set_component_value(reference, expr)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Rewrite the document for random draws; returns how many values vary.
    fn prepare_monte_carlo(&mut self) -> Result<usize> {
        let mut funcs: Vec<&'static str> = Vec::new();
        let mut varied = 0;
        for reference in self.candidates() {
            let (operand, deviation) = self.component_deviation(&reference)?;
            if deviation.is_fixed() {
                continue;
            }
            if let Some((expr, func)) = deviation.monte_carlo_expr(&operand) {
                self.document.set_component_value(&reference, expr)?;
                if !funcs.contains(&func) {
                    funcs.push(func);
                }
                varied += 1;
            }
        }
        for (name, deviation) in self.parameters.clone() {
            if deviation.is_fixed() {
                continue;
            }
            let value = self.document.get_parameter(&name)?;
            let Some(operand) = expression_operand(&value) else { continue };
            if let Some((expr, func)) = deviation.monte_carlo_expr(operand) {
                self.document.set_parameter(&name, expr)?;
                if !funcs.contains(&func) {
                    funcs.push(func);
                }
                varied += 1;
            }
        }
        self.document.add_directives(&funcs)?;
        self.document.set_parameter(RUN_PARAMETER, -1)?;
        tracing::info!(varied, "monte-carlo testbench prepared");
        Ok(varied)
    }

    /// Nominal run plus one run per corner.
    pub fn worst_case(mut self, scheduler: TaskScheduler) -> Result<SimStepper> {
        let corners = self.prepare_worst_case()?;
        let mut stepper = SimStepper::new(self.document, scheduler);
        stepper.add_param_sweep(RUN_PARAMETER, (-1..corners as i64).map(|r| r as f64));
        Ok(stepper)
    }

    /// Nominal run plus `runs` random draws.
    pub fn monte_carlo(mut self, runs: usize, scheduler: TaskScheduler) -> Result<SimStepper> {
        if runs >= MAX_SWEEP_POINTS {
            return Err(SpiceBatchError::InvalidValue(format!("{} monte-carlo runs", runs)));
        }
        self.prepare_monte_carlo()?;
        let mut stepper = SimStepper::new(self.document, scheduler);
        stepper.add_param_sweep(RUN_PARAMETER, (-1..runs as i64).map(|r| r as f64));
        Ok(stepper)
    }
}

impl From<CircuitDocument> for ToleranceBench {
    fn from(document: CircuitDocument) -> Self {
        Self::new(document)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::ComponentValue;
    use crate::document::EditorConfig;
    use crate::sim::scheduler::SchedulerConfig;
    use crate::sim::simulator::CommandSimulator;
    use crate::sim::stepper::StepTarget;

    const TEMPLATE: &str = "\
* filter tolerance bench
V1 in 0 AC 1
V2 vcc 0 5
R1 in mid 10k
R2 mid out {rload}
C1 out 0 100n
L1 vcc out 1m
.param rload=4.7k
.ac dec 10 1 1Meg
.end
";

    fn bench() -> ToleranceBench {
        let doc = CircuitDocument::from_text("filter", TEMPLATE, EditorConfig::default()).unwrap();
        ToleranceBench::new(doc)
    }

    fn scheduler(dir: &std::path::Path) -> TaskScheduler {
        let config = SchedulerConfig {
            output_folder: Some(dir.to_path_buf()),
            ..SchedulerConfig::default()
        };
        TaskScheduler::new(Box::new(CommandSimulator::new("true", Vec::new())), config).unwrap()
    }

    #[test]
    fn test_deviation_lookup() {
        let mut b = bench();
        b.set_tolerance("R", 0.01, Distribution::Uniform).unwrap();
        b.set_tolerance("R1", 0.05, Distribution::Normal).unwrap();

        let (value, dev) = b.component_deviation("R1").unwrap();
        assert_eq!(value, "10k");
        assert_eq!(dev, Deviation::tolerance(0.05, Distribution::Normal));
        let (value, dev) = b.component_deviation("R2").unwrap();
        assert_eq!(value, "rload");
        assert_eq!(dev, Deviation::tolerance(0.01, Distribution::Uniform));
        assert_eq!(b.component_deviation("C1").unwrap().1, Deviation::None);

        b.set_tolerance("V", 0.1, Distribution::Uniform).unwrap();
        assert_eq!(b.component_deviation("V1").unwrap().1, Deviation::None);
        assert!(!b.component_deviation("V2").unwrap().1.is_fixed());
    }

    #[test]
    fn test_rejects_unknown_references() {
        let mut b = bench();
        assert!(matches!(
            b.set_tolerance("R9", 0.01, Distribution::Uniform),
            Err(SpiceBatchError::ComponentNotFound(_))
        ));
        assert!(matches!(
            b.set_tolerance("Q", 0.01, Distribution::Uniform),
            Err(SpiceBatchError::UnsupportedElementType('Q'))
        ));
        assert!(matches!(
            b.set_parameter_deviation("gain", 1.0, 2.0, Distribution::Uniform),
            Err(SpiceBatchError::ParameterNotFound(_))
        ));
    }

    #[test]
    fn test_worst_case_corners() {
        let dir = tempfile::tempdir().unwrap();
        let mut b = bench();
        b.set_tolerances([("R1", 0.05), ("C", 0.1)], Distribution::Uniform).unwrap();
        b.set_deviation("L1", 0.9e-3, 1.2e-3, Distribution::Uniform).unwrap();
        b.set_parameter_tolerance("rload", 0.02, Distribution::Uniform).unwrap();

        let stepper = b.worst_case(scheduler(dir.path())).unwrap();
        // R1, L1, rload and C1 each take a bit: 16 corners plus the nominal run.
        assert_eq!(stepper.total_simulations(), 17);
        let axis = &stepper.axes()[0];
        assert_eq!(axis.target, StepTarget::Parameter);
        assert_eq!(axis.element, RUN_PARAMETER);
        assert_eq!(axis.values[0], ComponentValue::Number(-1.0));

        let text = stepper.document().to_text();
        assert!(text.contains("R1 in mid {wc(10k,0.05,0)}\n"));
        assert!(text.contains("L1 vcc out {wc1(1m,0.0009,0.0012,1)}\n"));
        assert!(text.contains(".param rload={wc(4.7k,0.02,2)}\n"));
        assert!(text.contains("C1 out 0 {wc(100n,0.1,3)}\n"));
        assert!(text.contains("R2 mid out {rload}\n"));
        assert!(text.contains(".func binary(run,idx)"));
        assert!(text.contains(".PARAM run=-1\n"));
    }

    #[test]
    fn test_monte_carlo_adds_only_used_functions() {
        let dir = tempfile::tempdir().unwrap();
        let mut b = bench();
        b.set_tolerance("R", 0.01, Distribution::Normal).unwrap();

        let stepper = b.monte_carlo(50, scheduler(dir.path())).unwrap();
        assert_eq!(stepper.total_simulations(), 51);
        let text = stepper.document().to_text();
        assert!(text.contains("R1 in mid {ntol(10k,0.01)}\n"));
        assert!(text.contains("R2 mid out {ntol(rload,0.01)}\n"));
        assert!(text.contains(NORMAL_TOL_FUNC));
        assert!(!text.contains(".func utol"));
        assert!(!text.contains(".func urng"));
    }
}
