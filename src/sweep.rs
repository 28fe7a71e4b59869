//! Value generators for parameter sweeps.
//!
//! Each generator is a `Clone` iterator of `f64`; clone it before use to
//! replay the sweep. Values are computed from the start point and the
//! index, so long sweeps do not accumulate rounding error.

use crate::error::{Result, SpiceBatchError};

/// Relative slack when deciding whether the stop point is reached.
const STOP_TOLERANCE: f64 = 1e-9;

/// Largest number of points a sweep may produce.
pub const MAX_SWEEP_POINTS: usize = 1 << 24;

/// Point count for `span` whole steps past the start, plus the start itself.
fn point_count(span: f64, what: impl FnOnce() -> String) -> Result<usize> {
    let steps = (span + STOP_TOLERANCE * span.abs().max(1.0)).floor().max(0.0);
    if !span.is_finite() || steps >= MAX_SWEEP_POINTS as f64 {
        return Err(SpiceBatchError::InvalidValue(format!(
            "{} needs more than {} points",
            what(),
            MAX_SWEEP_POINTS
        )));
    }
    Ok(steps as usize + 1)
}

#[derive(Debug, Clone, PartialEq)]
pub struct LinearSweep {
    start: f64,
    step: f64,
    count: usize,
    index: usize,
}

impl Iterator for LinearSweep {
    type Item = f64;

    fn next(&mut self) -> Option<f64> {
        if self.index >= self.count {
            return None;
        }
        let value = self.start + self.step * self.index as f64;
        self.index += 1;
        Some(value)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.count - self.index;
        (left, Some(left))
    }
}

impl ExactSizeIterator for LinearSweep {}

#[derive(Debug, Clone, PartialEq)]
pub struct GeometricSweep {
    start: f64,
    factor: f64,
    count: usize,
    index: usize,
}

impl Iterator for GeometricSweep {
    type Item = f64;

    fn next(&mut self) -> Option<f64> {
        if self.index >= self.count {
            return None;
        }
        let value = self.start * self.factor.powf(self.index as f64);
        self.index += 1;
        Some(value)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.count - self.index;
        (left, Some(left))
    }
}

impl ExactSizeIterator for GeometricSweep {}

/// Linear sweep from `start` to `stop` (inclusive when hit) in steps of `step`.
///
/// The step direction follows `start -> stop`; its sign is ignored.
pub fn sweep(start: f64, stop: f64, step: f64) -> Result<LinearSweep> {
    if step == 0.0 || !step.is_finite() {
        return Err(SpiceBatchError::InvalidValue(format!("sweep step {}", step)));
    }
    let step = if stop >= start { step.abs() } else { -step.abs() };
    let span = (stop - start) / step;
    let count = point_count(span, || format!("sweep {} -> {} by {}", start, stop, step))?;
    Ok(LinearSweep { start, step, count, index: 0 })
}

/// `n` evenly spaced points from `start` to `stop`, both included.
pub fn sweep_n(start: f64, stop: f64, n: usize) -> Result<LinearSweep> {
    match n {
        0 => Err(SpiceBatchError::InvalidValue("sweep with zero points".into())),
        1 => Ok(LinearSweep { start, step: 0.0, count: 1, index: 0 }),
        _ => Ok(LinearSweep {
            start,
            step: (stop - start) / (n - 1) as f64,
            count: n,
            index: 0,
        }),
    }
}

/// Geometric sweep from `start` towards `stop`, multiplying by `factor`.
///
/// A factor pointing away from `stop` is inverted.
pub fn sweep_log(start: f64, stop: f64, factor: f64) -> Result<GeometricSweep> {
    if factor <= 0.0 || factor == 1.0 || start == 0.0 || start.signum() != stop.signum() {
        return Err(SpiceBatchError::InvalidValue(format!(
            "log sweep {} -> {} by {}",
            start, stop, factor
        )));
    }
    let upward = stop.abs() >= start.abs();
    let factor = if upward == (factor > 1.0) { factor } else { 1.0 / factor };
    let span = (stop / start).ln() / factor.ln();
    let count = point_count(span, || format!("log sweep {} -> {} by {}", start, stop, factor))?;
    Ok(GeometricSweep { start, factor, count, index: 0 })
}

/// `n` logarithmically spaced points from `start` to `stop`, both included.
pub fn sweep_log_n(start: f64, stop: f64, n: usize) -> Result<GeometricSweep> {
    if n == 0 || start == 0.0 || start.signum() != stop.signum() {
        return Err(SpiceBatchError::InvalidValue(format!(
            "log sweep {} -> {} in {} points",
            start, stop, n
        )));
    }
    let factor = if n == 1 {
        1.0
    } else {
        ((stop / start).ln() / (n - 1) as f64).exp()
    };
    Ok(GeometricSweep { start, factor, count: n, index: 0 })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn collect(iter: impl Iterator<Item = f64>) -> Vec<f64> {
        iter.collect()
    }

    #[test]
    fn test_sweep_up_and_down() {
        assert_eq!(collect(sweep(2.0, 8.0, 2.0).unwrap()), vec![2.0, 4.0, 6.0, 8.0]);
        assert_eq!(collect(sweep(8.0, 2.0, 2.0).unwrap()), vec![8.0, 6.0, 4.0, 2.0]);
        assert_eq!(collect(sweep(2.0, 8.0, -2.0).unwrap()).len(), 4);
    }

    #[test]
    fn test_sweep_float_steps_reach_stop() {
        let values = collect(sweep(0.3, 1.1, 0.2).unwrap());
        assert_eq!(values.len(), 5);
        assert_relative_eq!(values[4], 1.1, epsilon = 1e-12);
        let values = collect(sweep(15.0, -15.0, 2.5).unwrap());
        assert_eq!(values.len(), 13);
    }

    #[test]
    fn test_sweep_zero_step_rejected() {
        assert!(sweep(0.0, 1.0, 0.0).is_err());
    }

    #[test]
    fn test_sweep_too_many_points_rejected() {
        assert!(matches!(
            sweep(0.0, 1e300, 1e-300),
            Err(SpiceBatchError::InvalidValue(_))
        ));
        assert!(sweep(0.0, f64::INFINITY, 1.0).is_err());
        assert!(sweep(f64::NAN, 1.0, 1.0).is_err());
        assert!(sweep_log(1e-300, 1e300, 1.000_000_1).is_err());
        assert_eq!(sweep(0.0, 9.0, 1e-6).unwrap().len(), 9_000_001);
    }

    #[test]
    fn test_sweep_n_endpoints() {
        let values = collect(sweep_n(15.0, -15.0, 13).unwrap());
        assert_eq!(values.len(), 13);
        assert_relative_eq!(values[1], 12.5);
        assert_relative_eq!(values[12], -15.0);
    }

    #[test]
    fn test_sweep_log_decades() {
        let values = collect(sweep_log(0.1, 11e3, 10.0).unwrap());
        assert_eq!(values.len(), 6);
        assert_relative_eq!(values[5], 1e4, max_relative = 1e-12);
        let values = collect(sweep_log(1000.0, 1.0, 2.0).unwrap());
        assert_eq!(values.len(), 10);
        assert_relative_eq!(values[1], 500.0);
    }

    #[test]
    fn test_sweep_log_n() {
        let values = collect(sweep_log_n(1.0, 10.0, 6).unwrap());
        assert_eq!(values.len(), 6);
        assert_relative_eq!(values[5], 10.0, max_relative = 1e-12);
        assert_relative_eq!(values[1], 1.584_893_192_461_113_6, max_relative = 1e-12);
    }

    #[test]
    fn test_sweep_replays_from_clone() {
        let sweep = sweep_n(0.0, 1.0, 3).unwrap();
        assert_eq!(collect(sweep.clone()), collect(sweep));
    }
}
