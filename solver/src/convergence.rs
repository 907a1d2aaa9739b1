//! Run status, stopping rules and solve options.
//!
//! A run ends in one of four states:
//!
//! | Status           | Cause                                             |
//! |------------------|---------------------------------------------------|
//! | `Converged`      | a [`StoppingRule`] was satisfied                  |
//! | `IterationLimit` | `iteration_limit` iterations ran in this call     |
//! | `TimeLimit`      | `time_limit` seconds elapsed in this call         |
//! | `Stopped`        | a [`StopSignal`] was raised                       |
//!
//! Only `Converged` means the policy passed a convergence test; the other
//! three still return the policy computed so far.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::constants::{CUT_EQUALITY_TOLERANCE, SEED_STRIDE, Z_SCORE_95};
use crate::error::{Result, SddpError};

/// Terminal state of a call to `solve`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolveStatus {
    Converged,
    IterationLimit,
    TimeLimit,
    Stopped,
}

impl SolveStatus {
    pub fn is_converged(self) -> bool {
        self == SolveStatus::Converged
    }
}

/// Confidence interval `mean ± half_width` of a sampled policy cost.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundEstimate {
    pub mean: f64,
    pub half_width: f64,
    pub samples: usize,
}

impl BoundEstimate {
    /// Normal-approximation interval with sample standard deviation.
    /// `None` for an empty sample.
    pub fn from_samples(costs: &[f64], z_score: f64) -> Option<Self> {
        let n = costs.len();
        if n == 0 {
            return None;
        }
        let mean = costs.iter().sum::<f64>() / n as f64;
        let half_width = if n > 1 {
            let var = costs.iter().map(|c| (c - mean).powi(2)).sum::<f64>() / (n - 1) as f64;
            z_score * (var / n as f64).sqrt()
        } else {
            0.0
        };
        Some(Self {
            mean,
            half_width,
            samples: n,
        })
    }

    pub fn lower(&self) -> f64 {
        self.mean - self.half_width
    }

    pub fn upper(&self) -> f64 {
        self.mean + self.half_width
    }

    /// Interval membership up to floating-point noise.
    pub fn contains(&self, value: f64) -> bool {
        let slack = CUT_EQUALITY_TOLERANCE * value.abs().max(1.0);
        value >= self.lower() - slack && value <= self.upper() + slack
    }
}

/// Convergence test checked after every iteration. Any satisfied rule ends
/// the run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum StoppingRule {
    /// The bound moved by at most `tolerance` over the last `window`
    /// iterations.
    BoundStalling { window: usize, tolerance: f64 },
    /// Every `frequency` iterations simulate `samples` trajectories; stop
    /// when the confidence interval of their cost contains the bound.
    Statistical {
        frequency: usize,
        samples: usize,
        z_score: f64,
    },
}

impl StoppingRule {
    /// Statistical rule with the 95% z-score.
    pub fn statistical(frequency: usize, samples: usize) -> Self {
        StoppingRule::Statistical {
            frequency,
            samples,
            z_score: Z_SCORE_95,
        }
    }

    fn validate(&self) -> Result<()> {
        match *self {
            StoppingRule::BoundStalling { window, tolerance } => {
                if window == 0 || !(tolerance >= 0.0) {
                    return Err(SddpError::InvalidOptions(format!(
                        "bound stalling needs window >= 1 and tolerance >= 0, got {window} and {tolerance}"
                    )));
                }
            }
            StoppingRule::Statistical {
                frequency,
                samples,
                z_score,
            } => {
                if frequency == 0 || samples < 2 || !(z_score > 0.0) {
                    return Err(SddpError::InvalidOptions(format!(
                        "statistical rule needs frequency >= 1, samples >= 2, z > 0, got {frequency}, {samples}, {z_score}"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// True when the last `window + 1` bounds lie within `tolerance` of each other.
pub fn bound_stalled(log: &[IterationRecord], window: usize, tolerance: f64) -> bool {
    if log.len() <= window {
        return false;
    }
    let recent = &log[log.len() - window - 1..];
    let (lo, hi) = recent.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), r| {
        (lo.min(r.lower_bound), hi.max(r.lower_bound))
    });
    hi - lo <= tolerance
}

/// One row of the iteration log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    /// 1-based, counted across resumed runs.
    pub iteration: usize,
    pub lower_bound: f64,
    /// Mean cost of this iteration's forward passes.
    pub simulated_cost: f64,
    /// Valid cuts in the graph after the iteration.
    pub cuts: usize,
    /// Seconds since the start of this call.
    pub elapsed: f64,
}

/// Options of one call to `solve`. Limits apply per call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolveOptions {
    pub iteration_limit: Option<usize>,
    /// Seconds.
    pub time_limit: Option<f64>,
    /// Trajectories sampled per iteration.
    pub forward_passes: usize,
    pub seed: u64,
    pub stopping_rules: Vec<StoppingRule>,
}

impl Default for SolveOptions {
    fn default() -> Self {
        Self {
            iteration_limit: Some(100),
            time_limit: None,
            forward_passes: 1,
            seed: 0,
            stopping_rules: Vec::new(),
        }
    }
}

impl SolveOptions {
    pub fn iteration_limit(mut self, limit: usize) -> Self {
        self.iteration_limit = Some(limit);
        self
    }

    pub fn time_limit(mut self, seconds: f64) -> Self {
        self.time_limit = Some(seconds);
        self
    }

    pub fn forward_passes(mut self, n: usize) -> Self {
        self.forward_passes = n;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn stopping_rule(mut self, rule: StoppingRule) -> Self {
        self.stopping_rules.push(rule);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.forward_passes == 0 || self.forward_passes as u64 >= SEED_STRIDE / 2 {
            return Err(SddpError::InvalidOptions(format!(
                "forward_passes must be in [1, {}), got {}",
                SEED_STRIDE / 2,
                self.forward_passes
            )));
        }
        if let Some(t) = self.time_limit {
            if !(t > 0.0) {
                return Err(SddpError::InvalidOptions(format!(
                    "time limit must be positive, got {t}"
                )));
            }
        }
        if self.iteration_limit.is_none()
            && self.time_limit.is_none()
            && self.stopping_rules.is_empty()
        {
            return Err(SddpError::InvalidOptions(
                "no iteration limit, time limit or stopping rule: the run would never end"
                    .to_string(),
            ));
        }
        self.stopping_rules.iter().try_for_each(StoppingRule::validate)
    }

    /// Seed of forward pass `pass` in 0-based iteration `iteration`.
    pub(crate) fn forward_seed(&self, iteration: usize, pass: usize) -> u64 {
        self.seed
            .wrapping_add((iteration as u64).wrapping_mul(SEED_STRIDE))
            .wrapping_add(pass as u64)
    }

    /// First seed of the statistical-rule simulation in `iteration`.
    pub(crate) fn simulation_seed(&self, iteration: usize) -> u64 {
        self.forward_seed(iteration, 0).wrapping_add(SEED_STRIDE / 2)
    }
}

/// Cooperative cancellation, checked between iterations.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Outcome of one call to `solve`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolveResult {
    pub status: SolveStatus,
    pub lower_bound: f64,
    /// Last estimate produced by a statistical rule, if any ran.
    pub upper_bound: Option<BoundEstimate>,
    /// Iterations run so far, across resumed calls.
    pub iterations: usize,
    /// Records of the iterations run by this call.
    pub log: Vec<IterationRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(iteration: usize, lower_bound: f64) -> IterationRecord {
        IterationRecord {
            iteration,
            lower_bound,
            simulated_cost: 0.0,
            cuts: 0,
            elapsed: 0.0,
        }
    }

    #[test]
    fn bound_estimate_of_constant_sample_has_zero_width() {
        let est = BoundEstimate::from_samples(&[4.0, 4.0, 4.0], Z_SCORE_95).unwrap();
        assert_eq!(est.mean, 4.0);
        assert_eq!(est.half_width, 0.0);
        assert!(est.contains(4.0));
        assert!(!est.contains(4.1));
        assert!(BoundEstimate::from_samples(&[], Z_SCORE_95).is_none());
    }

    #[test]
    fn bound_estimate_width_uses_sample_deviation() {
        // mean 2, sample variance 3, n = 3
        let est = BoundEstimate::from_samples(&[1.0, 1.0, 4.0], 2.0).unwrap();
        assert!((est.mean - 2.0).abs() < 1e-12);
        assert!((est.half_width - 2.0 * (3.0f64 / 3.0).sqrt()).abs() < 1e-12);
    }

    #[test]
    fn stalling_needs_a_full_window() {
        let log: Vec<_> = [1.0, 5.0, 5.0, 5.0]
            .iter()
            .enumerate()
            .map(|(i, &b)| record(i + 1, b))
            .collect();
        assert!(!bound_stalled(&log[..2], 2, 1e-6));
        assert!(!bound_stalled(&log[..3], 2, 1e-6));
        assert!(bound_stalled(&log, 2, 1e-6));
    }

    #[test]
    fn options_are_validated() {
        assert!(SolveOptions::default().validate().is_ok());
        assert!(SolveOptions::default().forward_passes(0).validate().is_err());
        let unbounded = SolveOptions {
            iteration_limit: None,
            ..SolveOptions::default()
        };
        assert!(unbounded.validate().is_err());
        assert!(unbounded
            .clone()
            .stopping_rule(StoppingRule::BoundStalling {
                window: 3,
                tolerance: 1e-6
            })
            .validate()
            .is_ok());
        assert!(SolveOptions::default()
            .stopping_rule(StoppingRule::statistical(0, 100))
            .validate()
            .is_err());
    }

    #[test]
    fn options_deserialize_with_defaults() {
        let json = r#"{"forward_passes": 4, "stopping_rules": [{"rule": "bound_stalling", "window": 5, "tolerance": 0.001}]}"#;
        let opts: SolveOptions = serde_json::from_str(json).unwrap();
        assert_eq!(opts.forward_passes, 4);
        assert_eq!(opts.iteration_limit, Some(100));
        assert_eq!(
            opts.stopping_rules,
            vec![StoppingRule::BoundStalling {
                window: 5,
                tolerance: 0.001
            }]
        );
    }

    #[test]
    fn stop_signal_is_shared_between_clones() {
        let a = StopSignal::new();
        let b = a.clone();
        b.stop();
        assert!(a.is_stopped());
        a.reset();
        assert!(!b.is_stopped());
    }
}
