//! Risk measures as changes of probability measure.
//!
//! A risk measure receives the nominal probabilities and objective values of
//! every successor realization of one backward-pass step and returns a
//! risk-adjusted probability vector `q`. The cut is then the `q`-weighted
//! combination of the per-realization cuts. Because every coherent measure
//! can be written as `ρ(Z) = sup_{q ∈ 𝒬} E_q[Z]`, each cut produced this way is
//! a valid under-estimator (minimization) of the risk-adjusted future cost.
//!
//! "Worse" depends on the objective sense: high costs when minimizing, low
//! rewards when maximizing.

use std::fmt;

use crate::error::{Result, SddpError};
use crate::lp::Sense;

/// Risk-adjusted reweighting of a finite distribution.
pub trait RiskMeasure: Send + Sync + fmt::Debug {
    /// Return `q` with `q[i] >= 0`, `Σ q = 1`, and `q[i] == 0` wherever
    /// `nominal[i] == 0`.
    fn adjust(&self, nominal: &[f64], objectives: &[f64], sense: Sense) -> Vec<f64>;
}

/// Nominal probabilities rescaled to sum to one.
fn normalized(nominal: &[f64]) -> Vec<f64> {
    let total: f64 = nominal.iter().filter(|p| **p > 0.0).sum();
    if total <= 0.0 {
        return vec![0.0; nominal.len()];
    }
    nominal.iter().map(|p| p.max(0.0) / total).collect()
}

/// Outcome indices ordered worst first; ties keep index order.
fn worst_first(objectives: &[f64], sense: Sense) -> Vec<usize> {
    let mut order: Vec<usize> = (0..objectives.len()).collect();
    order.sort_by(|&a, &b| {
        let ord = objectives[a].total_cmp(&objectives[b]);
        match sense {
            Sense::Minimize => ord.reverse(),
            Sense::Maximize => ord,
        }
        .then(a.cmp(&b))
    });
    order
}

/// Plain probability weighting.
#[derive(Debug, Clone, Copy, Default)]
pub struct Expectation;

impl RiskMeasure for Expectation {
    fn adjust(&self, nominal: &[f64], _objectives: &[f64], _sense: Sense) -> Vec<f64> {
        normalized(nominal)
    }
}

/// All weight on the worst outcome with positive probability.
#[derive(Debug, Clone, Copy, Default)]
pub struct WorstCase;

impl RiskMeasure for WorstCase {
    fn adjust(&self, nominal: &[f64], objectives: &[f64], sense: Sense) -> Vec<f64> {
        let mut q = vec![0.0; nominal.len()];
        if let Some(&i) = worst_first(objectives, sense)
            .iter()
            .find(|&&i| nominal[i] > 0.0)
        {
            q[i] = 1.0;
        }
        q
    }
}

/// Average value at risk (CVaR) at level `beta`: the expectation over the
/// worst `beta` fraction of the probability mass. `beta = 1` is the
/// expectation; small `beta` approaches the worst case.
#[derive(Debug, Clone, Copy)]
pub struct AverageValueAtRisk {
    beta: f64,
}

impl AverageValueAtRisk {
    pub fn new(beta: f64) -> Result<Self> {
        if !(beta > 0.0 && beta <= 1.0) {
            return Err(SddpError::InvalidRiskMeasure(format!(
                "AV@R level must be in (0, 1], got {beta}"
            )));
        }
        Ok(Self { beta })
    }

    pub fn beta(&self) -> f64 {
        self.beta
    }
}

impl RiskMeasure for AverageValueAtRisk {
    fn adjust(&self, nominal: &[f64], objectives: &[f64], sense: Sense) -> Vec<f64> {
        let p = normalized(nominal);
        let mut q = vec![0.0; p.len()];
        let mut remaining = self.beta;
        for i in worst_first(objectives, sense) {
            if remaining <= 0.0 {
                break;
            }
            let take = p[i].min(remaining);
            q[i] = take / self.beta;
            remaining -= take;
        }
        q
    }
}

/// `Σ λ_k ρ_k` with `λ_k >= 0`, `Σ λ_k = 1`.
#[derive(Debug)]
pub struct ConvexCombination {
    components: Vec<(f64, Box<dyn RiskMeasure>)>,
}

impl ConvexCombination {
    pub fn new(components: Vec<(f64, Box<dyn RiskMeasure>)>) -> Result<Self> {
        if components.is_empty() {
            return Err(SddpError::InvalidRiskMeasure(
                "convex combination needs at least one component".to_string(),
            ));
        }
        if components.iter().any(|(w, _)| !(*w >= 0.0)) {
            return Err(SddpError::InvalidRiskMeasure(
                "convex combination weights must be non-negative".to_string(),
            ));
        }
        let total: f64 = components.iter().map(|(w, _)| w).sum();
        if (total - 1.0).abs() > 1e-9 {
            return Err(SddpError::InvalidRiskMeasure(format!(
                "convex combination weights sum to {total}"
            )));
        }
        Ok(Self { components })
    }
}

impl RiskMeasure for ConvexCombination {
    fn adjust(&self, nominal: &[f64], objectives: &[f64], sense: Sense) -> Vec<f64> {
        let mut q = vec![0.0; nominal.len()];
        for (w, measure) in &self.components {
            for (qi, ri) in q.iter_mut().zip(measure.adjust(nominal, objectives, sense)) {
                *qi += w * ri;
            }
        }
        q
    }
}

/// `λ·E + (1 − λ)·AV@R_β`, the usual risk-averse setting for hydro models.
pub fn eavar(lambda: f64, beta: f64) -> Result<ConvexCombination> {
    if !(0.0..=1.0).contains(&lambda) {
        return Err(SddpError::InvalidRiskMeasure(format!(
            "EAV@R weight must be in [0, 1], got {lambda}"
        )));
    }
    ConvexCombination::new(vec![
        (lambda, Box::new(Expectation)),
        (1.0 - lambda, Box::new(AverageValueAtRisk::new(beta)?)),
    ])
}
