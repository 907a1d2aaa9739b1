//! Per-node cut storage with optional pruning.
//!
//! Each (stage, markov state) node owns one oracle behind its own lock, so
//! inserts are exclusive per key while other nodes keep reading their cuts.
//! Cuts are never edited once stored; pruning only decides which of them stay
//! valid. Whenever the valid list changes other than by appending the newest
//! cut, the oracle bumps its [`CutOracle::generation`] and subproblems rebuild
//! their cut rows from scratch.
//!
//! Three oracles:
//! - [`DefaultCutOracle`]: keep everything.
//! - [`DominanceCutOracle`]: drop cuts dominated everywhere on the state box.
//! - [`LevelOneCutOracle`]: keep cuts that are the tightest at one or more
//!   sampled trial points.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::constants::CUT_EQUALITY_TOLERANCE;
use crate::lp::Sense;

/// Supporting hyperplane `θ ≷ intercept + coefficients·x`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cut {
    pub intercept: f64,
    pub coefficients: Vec<f64>,
    /// Trial point the cut was generated at.
    pub sample: Vec<f64>,
}

impl Cut {
    #[inline]
    pub fn value_at(&self, point: &[f64]) -> f64 {
        self.intercept
            + self
                .coefficients
                .iter()
                .zip(point)
                .map(|(b, x)| b * x)
                .sum::<f64>()
    }
}

/// Cut store for one (stage, markov state).
pub trait CutOracle: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// Insert a freshly generated cut; may prune.
    fn store_cut(&mut self, cut: Cut);

    /// Cuts currently attached to the subproblem, in attachment order.
    fn valid_cuts(&self) -> &[Cut];

    /// Bumped whenever `valid_cuts` changes other than by appending.
    fn generation(&self) -> u64;

    /// Cuts ever offered to `store_cut`.
    fn total_cuts(&self) -> usize;
}

/// Which oracle every node of a model uses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CutOracleKind {
    #[default]
    Default,
    Dominance,
    LevelOne,
}

impl CutOracleKind {
    /// `bounds` is the box over cut coordinates (infinite sides allowed).
    pub fn build(self, sense: Sense, bounds: Vec<(f64, f64)>) -> Box<dyn CutOracle> {
        match self {
            CutOracleKind::Default => Box::new(DefaultCutOracle::default()),
            CutOracleKind::Dominance => Box::new(DominanceCutOracle::new(sense, bounds)),
            CutOracleKind::LevelOne => Box::new(LevelOneCutOracle::new(sense)),
        }
    }
}

// ── Default ─────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct DefaultCutOracle {
    cuts: Vec<Cut>,
}

impl CutOracle for DefaultCutOracle {
    fn name(&self) -> &'static str {
        "default"
    }

    fn store_cut(&mut self, cut: Cut) {
        self.cuts.push(cut);
    }

    fn valid_cuts(&self) -> &[Cut] {
        &self.cuts
    }

    fn generation(&self) -> u64 {
        0
    }

    fn total_cuts(&self) -> usize {
        self.cuts.len()
    }
}

// ── Dominance ───────────────────────────────────────────────────────────────

/// Exact pairwise dominance on a box domain.
///
/// Cut `a` dominates `b` when it is at least as tight at every point of the
/// box: `min_x (a − b)(x) >= 0` for minimization. The extremum of an affine
/// function over a box is attained coordinate-wise, so the test is O(n).
#[derive(Debug)]
pub struct DominanceCutOracle {
    sense: Sense,
    bounds: Vec<(f64, f64)>,
    cuts: Vec<Cut>,
    generation: u64,
    total: usize,
}

impl DominanceCutOracle {
    pub fn new(sense: Sense, bounds: Vec<(f64, f64)>) -> Self {
        Self {
            sense,
            bounds,
            cuts: Vec::new(),
            generation: 0,
            total: 0,
        }
    }

    /// True when `a` is at least as tight as `b` everywhere on the box.
    pub fn dominates(&self, a: &Cut, b: &Cut) -> bool {
        dominates(self.sense, &self.bounds, a, b)
    }
}

fn dominates(sense: Sense, bounds: &[(f64, f64)], a: &Cut, b: &Cut) -> bool {
    // Minimization: worst case is the minimum of (a − b); maximization: the maximum.
    let mut extreme = a.intercept - b.intercept;
    for (i, (ca, cb)) in a.coefficients.iter().zip(&b.coefficients).enumerate() {
        let d = ca - cb;
        if d.abs() <= CUT_EQUALITY_TOLERANCE {
            continue;
        }
        let (lo, hi) = bounds
            .get(i)
            .copied()
            .unwrap_or((f64::NEG_INFINITY, f64::INFINITY));
        let at = match (sense, d > 0.0) {
            (Sense::Minimize, true) | (Sense::Maximize, false) => lo,
            (Sense::Minimize, false) | (Sense::Maximize, true) => hi,
        };
        if !at.is_finite() {
            return false;
        }
        extreme += d * at;
    }
    match sense {
        Sense::Minimize => extreme >= -CUT_EQUALITY_TOLERANCE,
        Sense::Maximize => extreme <= CUT_EQUALITY_TOLERANCE,
    }
}

impl CutOracle for DominanceCutOracle {
    fn name(&self) -> &'static str {
        "dominance"
    }

    fn store_cut(&mut self, cut: Cut) {
        self.total += 1;
        if self.cuts.iter().any(|c| self.dominates(c, &cut)) {
            return;
        }
        let before = self.cuts.len();
        let (sense, bounds) = (self.sense, &self.bounds);
        self.cuts.retain(|c| !dominates(sense, bounds, &cut, c));
        if self.cuts.len() != before {
            self.generation += 1;
        }
        self.cuts.push(cut);
    }

    fn valid_cuts(&self) -> &[Cut] {
        &self.cuts
    }

    fn generation(&self) -> u64 {
        self.generation
    }

    fn total_cuts(&self) -> usize {
        self.total
    }
}

// ── Level one ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct SamplePoint {
    point: Vec<f64>,
    best: usize,
    value: f64,
}

/// Level-one dominance: a cut stays valid while it is the tightest cut at
/// one or more of the trial points cuts were generated at.
#[derive(Debug)]
pub struct LevelOneCutOracle {
    sense: Sense,
    cuts: Vec<Cut>,
    samples: Vec<SamplePoint>,
    counts: Vec<usize>,
    active_ids: Vec<usize>,
    active: Vec<Cut>,
    generation: u64,
}

impl LevelOneCutOracle {
    pub fn new(sense: Sense) -> Self {
        Self {
            sense,
            cuts: Vec::new(),
            samples: Vec::new(),
            counts: Vec::new(),
            active_ids: Vec::new(),
            active: Vec::new(),
            generation: 0,
        }
    }

    /// Strictly tighter: larger when minimizing, smaller when maximizing.
    fn tighter(&self, a: f64, b: f64) -> bool {
        match self.sense {
            Sense::Minimize => a > b + CUT_EQUALITY_TOLERANCE,
            Sense::Maximize => a < b - CUT_EQUALITY_TOLERANCE,
        }
    }
}

impl CutOracle for LevelOneCutOracle {
    fn name(&self) -> &'static str {
        "level-one"
    }

    fn store_cut(&mut self, cut: Cut) {
        let n = self.cuts.len();
        self.counts.push(0);

        for s in 0..self.samples.len() {
            let v = cut.value_at(&self.samples[s].point);
            if self.tighter(v, self.samples[s].value) {
                let old = self.samples[s].best;
                self.counts[old] -= 1;
                self.counts[n] += 1;
                self.samples[s].best = n;
                self.samples[s].value = v;
            }
        }

        let point = cut.sample.clone();
        self.cuts.push(cut);
        let mut best = 0;
        let mut value = self.cuts[0].value_at(&point);
        for (i, c) in self.cuts.iter().enumerate().skip(1) {
            let v = c.value_at(&point);
            if self.tighter(v, value) {
                best = i;
                value = v;
            }
        }
        self.counts[best] += 1;
        self.samples.push(SamplePoint { point, best, value });

        let new_ids: Vec<usize> = (0..self.cuts.len()).filter(|&i| self.counts[i] > 0).collect();
        let appended_only = new_ids.len() >= self.active_ids.len()
            && new_ids[..self.active_ids.len()] == self.active_ids[..]
            && new_ids[self.active_ids.len()..].iter().all(|&i| i == n);
        if appended_only {
            if new_ids.len() > self.active_ids.len() {
                self.active.push(self.cuts[n].clone());
            }
        } else {
            self.generation += 1;
            self.active = new_ids.iter().map(|&i| self.cuts[i].clone()).collect();
        }
        self.active_ids = new_ids;
    }

    fn valid_cuts(&self) -> &[Cut] {
        &self.active
    }

    fn generation(&self) -> u64 {
        self.generation
    }

    fn total_cuts(&self) -> usize {
        self.cuts.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cut(intercept: f64, coefficients: &[f64], sample: &[f64]) -> Cut {
        Cut {
            intercept,
            coefficients: coefficients.to_vec(),
            sample: sample.to_vec(),
        }
    }

    #[test]
    fn default_oracle_keeps_everything() {
        let mut o = CutOracleKind::Default.build(Sense::Minimize, vec![(0.0, 1.0)]);
        o.store_cut(cut(1.0, &[0.0], &[0.5]));
        o.store_cut(cut(0.0, &[0.0], &[0.5]));
        assert_eq!(o.valid_cuts().len(), 2);
        assert_eq!(o.generation(), 0);
    }

    #[test]
    fn dominance_uses_the_box() {
        let o = DominanceCutOracle::new(Sense::Minimize, vec![(0.0, 10.0)]);
        // 5 + 0x  vs  0 + 0.4x: on [0, 10] the second never exceeds 4.
        assert!(o.dominates(&cut(5.0, &[0.0], &[0.0]), &cut(0.0, &[0.4], &[0.0])));
        // ... but 0 + 0.6x reaches 6 at x = 10.
        assert!(!o.dominates(&cut(5.0, &[0.0], &[0.0]), &cut(0.0, &[0.6], &[0.0])));
    }

    #[test]
    fn dominance_never_holds_along_unbounded_directions() {
        let o = DominanceCutOracle::new(Sense::Minimize, vec![(f64::NEG_INFINITY, f64::INFINITY)]);
        assert!(!o.dominates(&cut(100.0, &[0.0], &[0.0]), &cut(0.0, &[1.0], &[0.0])));
        assert!(o.dominates(&cut(1.0, &[2.0], &[0.0]), &cut(0.5, &[2.0], &[0.0])));
    }

    #[test]
    fn dominance_oracle_prunes_and_bumps_generation() {
        let mut o = DominanceCutOracle::new(Sense::Minimize, vec![(0.0, 10.0)]);
        o.store_cut(cut(1.0, &[0.1], &[0.0]));
        assert_eq!(o.generation(), 0);
        // Dominated on arrival: dropped without touching the generation.
        o.store_cut(cut(0.0, &[0.1], &[0.0]));
        assert_eq!(o.valid_cuts().len(), 1);
        assert_eq!(o.generation(), 0);
        // Dominates the existing cut: replaces it.
        o.store_cut(cut(3.0, &[0.1], &[0.0]));
        assert_eq!(o.valid_cuts().len(), 1);
        assert_eq!(o.valid_cuts()[0].intercept, 3.0);
        assert_eq!(o.generation(), 1);
        assert_eq!(o.total_cuts(), 3);
    }

    #[test]
    fn dominance_for_maximization_flips_the_test() {
        let o = DominanceCutOracle::new(Sense::Maximize, vec![(0.0, 1.0)]);
        assert!(o.dominates(&cut(1.0, &[0.0], &[0.0]), &cut(2.0, &[0.0], &[0.0])));
        assert!(!o.dominates(&cut(2.0, &[0.0], &[0.0]), &cut(1.0, &[0.0], &[0.0])));
    }

    #[test]
    fn level_one_keeps_cuts_tightest_somewhere() {
        let mut o = LevelOneCutOracle::new(Sense::Minimize);
        o.store_cut(cut(0.0, &[1.0], &[0.0]));
        o.store_cut(cut(10.0, &[-1.0], &[10.0]));
        assert_eq!(o.valid_cuts().len(), 2);
        assert_eq!(o.generation(), 0);

        // Tighter than both at both sample points: the older two lose their counts.
        o.store_cut(cut(20.0, &[0.0], &[5.0]));
        assert_eq!(o.valid_cuts().len(), 1);
        assert_eq!(o.valid_cuts()[0].intercept, 20.0);
        assert_eq!(o.generation(), 1);
        assert_eq!(o.total_cuts(), 3);
    }

    #[test]
    fn level_one_ignores_duplicates() {
        let mut o = LevelOneCutOracle::new(Sense::Minimize);
        o.store_cut(cut(1.0, &[1.0], &[1.0]));
        o.store_cut(cut(1.0, &[1.0], &[1.0]));
        assert_eq!(o.valid_cuts().len(), 1);
        assert_eq!(o.generation(), 0);
    }
}
