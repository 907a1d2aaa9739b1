//! Coupling between a subproblem and its cut oracle.
//!
//! The epigraph column `θ` of every subproblem approximates the risk-adjusted
//! future value from the outgoing point. Each valid cut becomes one row:
//!
//! | sense    | row                         |
//! |----------|-----------------------------|
//! | minimize | `θ − β·x_out >= α`          |
//! | maximize | `θ − β·x_out <= α`          |
//!
//! The [`ValueFunction::Autoregressive`] variant extends the cut domain from
//! the outgoing state to state plus outgoing noise history, so `x_out` above
//! reads `(state, w_t, lag_1, …, lag_{L−1})`. Gradients come from the duals
//! of the successor's incoming fixing rows in the same order.

use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::cut_oracle::{Cut, CutOracle, CutOracleKind};
use crate::lp::{LpSolution, Sense};
use crate::risk::RiskMeasure;
use crate::subproblem::Subproblem;

/// One successor realization observed in a backward-pass step.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    /// Nominal probability: transition probability times noise probability.
    pub probability: f64,
    /// Full objective of the successor, future value included.
    pub objective: f64,
    /// Subgradient with respect to the incoming cut coordinates.
    pub gradient: Vec<f64>,
}

/// Cut storage shared by both variants.
#[derive(Debug)]
pub struct CutStore {
    sense: Sense,
    oracle: RwLock<Box<dyn CutOracle>>,
}

impl CutStore {
    fn new(sense: Sense, oracle: Box<dyn CutOracle>) -> Self {
        Self {
            sense,
            oracle: RwLock::new(oracle),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Box<dyn CutOracle>> {
        self.oracle.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Box<dyn CutOracle>> {
        self.oracle.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Value-function variant of one node, chosen when the graph is built.
#[derive(Debug)]
pub enum ValueFunction {
    /// Cuts over the outgoing state.
    Default(CutStore),
    /// Cuts over the outgoing state and `lags` values of noise history.
    Autoregressive { lags: usize, cuts: CutStore },
}

impl ValueFunction {
    /// Pick the variant from the subproblem's declaration and build its oracle.
    pub fn new(kind: CutOracleKind, subproblem: &Subproblem) -> Self {
        let sense = subproblem.sense();
        let mut bounds = subproblem.state_bounds();
        let lags = subproblem.history_len();
        bounds.extend(std::iter::repeat((f64::NEG_INFINITY, f64::INFINITY)).take(lags));
        let cuts = CutStore::new(sense, kind.build(sense, bounds));
        if lags == 0 {
            ValueFunction::Default(cuts)
        } else {
            ValueFunction::Autoregressive { lags, cuts }
        }
    }

    fn store(&self) -> &CutStore {
        match self {
            ValueFunction::Default(cuts) | ValueFunction::Autoregressive { cuts, .. } => cuts,
        }
    }

    pub fn sense(&self) -> Sense {
        self.store().sense
    }

    /// Lagged noise values carried in the cut domain.
    pub fn lags(&self) -> usize {
        match self {
            ValueFunction::Default(_) => 0,
            ValueFunction::Autoregressive { lags, .. } => *lags,
        }
    }

    /// Bound the epigraph column: `objective_bound` is a valid bound on the
    /// future value everywhere; the last stage has no future (`θ = 0`).
    pub fn couple(&self, subproblem: &mut Subproblem, objective_bound: f64, terminal: bool) {
        let theta = subproblem.epigraph();
        let (lower, upper) = match (terminal, self.sense()) {
            (true, _) => (0.0, 0.0),
            (false, Sense::Minimize) => (objective_bound, f64::INFINITY),
            (false, Sense::Maximize) => (f64::NEG_INFINITY, objective_bound),
        };
        subproblem.lp_mut().set_column_bounds(theta, lower, upper);
    }

    /// Outgoing columns the cuts are written over.
    pub fn cut_columns(&self, subproblem: &Subproblem) -> Vec<usize> {
        let mut cols = subproblem.outgoing_state_columns();
        if self.lags() > 0 {
            cols.extend(subproblem.outgoing_history_columns());
        }
        cols
    }

    /// Fixing rows whose duals form the gradient seen by a predecessor's cut.
    pub fn incoming_rows(&self, subproblem: &Subproblem) -> Vec<usize> {
        let mut rows = subproblem.state_fixing_rows();
        if self.lags() > 0 {
            rows.extend(subproblem.history_fixing_rows());
        }
        rows
    }

    /// Point in cut coordinates reached by `solution`.
    pub fn outgoing_point(&self, subproblem: &Subproblem, solution: &LpSolution) -> Vec<f64> {
        let mut point = subproblem.outgoing_state(solution);
        if self.lags() > 0 {
            point.extend(subproblem.outgoing_history(solution));
        }
        point
    }

    pub fn incoming_gradient(&self, subproblem: &Subproblem, solution: &LpSolution) -> Vec<f64> {
        self.incoming_rows(subproblem)
            .into_iter()
            .map(|row| solution.duals[row])
            .collect()
    }

    /// Bring the subproblem's cut rows in line with the oracle.
    ///
    /// Appended cuts are added incrementally. When the oracle reports a new
    /// generation (cuts were pruned), every cut row is dropped and rebuilt.
    pub fn attach(&self, subproblem: &mut Subproblem) {
        let oracle = self.store().read();
        let valid = oracle.valid_cuts();
        let generation = oracle.generation();
        if generation != subproblem.attached_generation || subproblem.attached_cuts > valid.len() {
            let base = subproblem.base_rows();
            subproblem.lp_mut().truncate_rows(base);
            subproblem.attached_cuts = 0;
            subproblem.attached_generation = generation;
        }
        if subproblem.attached_cuts == valid.len() {
            return;
        }

        let theta = subproblem.epigraph();
        let columns = self.cut_columns(subproblem);
        let sense = self.sense();
        for cut in &valid[subproblem.attached_cuts..] {
            let mut terms = Vec::with_capacity(columns.len() + 1);
            terms.push((theta, 1.0));
            terms.extend(
                columns
                    .iter()
                    .zip(&cut.coefficients)
                    .filter(|(_, b)| **b != 0.0)
                    .map(|(&c, &b)| (c, -b)),
            );
            let (lower, upper) = match sense {
                Sense::Minimize => (cut.intercept, f64::INFINITY),
                Sense::Maximize => (f64::NEG_INFINITY, cut.intercept),
            };
            subproblem.lp_mut().add_row(&terms, lower, upper);
        }
        subproblem.attached_cuts = valid.len();
    }

    /// Combine successor outcomes into one cut at `sample`.
    ///
    /// The risk measure reweights the outcomes; the cut is the reweighted
    /// sum of the per-outcome supporting hyperplanes
    /// `objective_k + g_k·(x − sample)`.
    pub fn build_cut(
        &self,
        sample: Vec<f64>,
        outcomes: &[Outcome],
        risk: &dyn RiskMeasure,
    ) -> Cut {
        let nominal: Vec<f64> = outcomes.iter().map(|o| o.probability).collect();
        let objectives: Vec<f64> = outcomes.iter().map(|o| o.objective).collect();
        let q = risk.adjust(&nominal, &objectives, self.sense());

        let mut intercept = 0.0;
        let mut coefficients = vec![0.0; sample.len()];
        for (o, &w) in outcomes.iter().zip(&q) {
            if w == 0.0 {
                continue;
            }
            let at_sample: f64 = o.gradient.iter().zip(&sample).map(|(g, x)| g * x).sum();
            intercept += w * (o.objective - at_sample);
            for (c, g) in coefficients.iter_mut().zip(&o.gradient) {
                *c += w * g;
            }
        }
        Cut {
            intercept,
            coefficients,
            sample,
        }
    }

    /// Insert a cut; exclusive for this node only.
    pub fn add_cut(&self, cut: Cut) {
        self.store().write().store_cut(cut);
    }

    /// Epigraph value of a solved subproblem.
    pub fn current_bound(&self, subproblem: &Subproblem, solution: &LpSolution) -> f64 {
        solution.primal[subproblem.epigraph()]
    }

    /// Snapshot of the valid cuts.
    pub fn cuts(&self) -> Vec<Cut> {
        self.store().read().valid_cuts().to_vec()
    }

    pub fn num_cuts(&self) -> usize {
        self.store().read().valid_cuts().len()
    }

    pub fn total_cuts(&self) -> usize {
        self.store().read().total_cuts()
    }

    pub fn oracle_name(&self) -> &'static str {
        self.store().read().name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lp::Relation;
    use crate::risk::Expectation;
    use crate::simplex::DenseSimplex;
    use crate::subproblem::SubproblemBuilder;

    /// min x_out + θ with x_out ∈ [0, 10] and x_out >= x_in.
    fn storage_node(sense: Sense) -> Subproblem {
        let mut b = SubproblemBuilder::new(0, 0, sense);
        let x = b.add_state(0.0, 10.0, 2.0).unwrap();
        b.add_constraint(&[(x.outgoing, 1.0), (x.incoming, -1.0)], Relation::GreaterEqual, 0.0)
            .unwrap();
        b.stage_objective(&[(x.outgoing, 1.0)], 0.0).unwrap();
        b.finish().unwrap()
    }

    #[test]
    fn oracle_name_follows_the_kind() {
        let sp = storage_node(Sense::Minimize);
        assert_eq!(ValueFunction::new(CutOracleKind::Default, &sp).oracle_name(), "default");
        assert_eq!(ValueFunction::new(CutOracleKind::LevelOne, &sp).oracle_name(), "level-one");
    }

    #[test]
    fn cuts_raise_the_epigraph() {
        let mut sp = storage_node(Sense::Minimize);
        let vf = ValueFunction::new(CutOracleKind::Default, &sp);
        vf.couple(&mut sp, 0.0, false);
        // θ >= 20 − 2·x_out: cheapest to move x_out up to 10.
        vf.add_cut(Cut {
            intercept: 20.0,
            coefficients: vec![-2.0],
            sample: vec![5.0],
        });
        vf.attach(&mut sp);
        assert_eq!(sp.lp().num_rows(), sp.base_rows() + 1);

        let sol = sp.solve(&DenseSimplex::new()).unwrap();
        assert!((sol.objective - 10.0).abs() < 1e-9, "obj={}", sol.objective);
        assert!(vf.current_bound(&sp, &sol).abs() < 1e-9);
        assert!((sp.outgoing_state(&sol)[0] - 10.0).abs() < 1e-9);
    }

    #[test]
    fn attach_is_incremental_and_idempotent() {
        let mut sp = storage_node(Sense::Minimize);
        let vf = ValueFunction::new(CutOracleKind::Default, &sp);
        vf.couple(&mut sp, 0.0, false);
        for k in 0..3 {
            vf.add_cut(Cut {
                intercept: k as f64,
                coefficients: vec![0.0],
                sample: vec![0.0],
            });
            vf.attach(&mut sp);
            vf.attach(&mut sp);
        }
        assert_eq!(sp.lp().num_rows(), sp.base_rows() + 3);
    }

    #[test]
    fn pruning_rebuilds_cut_rows() {
        let mut sp = storage_node(Sense::Minimize);
        let vf = ValueFunction::new(CutOracleKind::Dominance, &sp);
        vf.couple(&mut sp, 0.0, false);
        vf.add_cut(Cut {
            intercept: 1.0,
            coefficients: vec![0.0],
            sample: vec![0.0],
        });
        vf.attach(&mut sp);
        vf.add_cut(Cut {
            intercept: 3.0,
            coefficients: vec![0.0],
            sample: vec![0.0],
        });
        vf.attach(&mut sp);
        assert_eq!(vf.num_cuts(), 1);
        assert_eq!(vf.total_cuts(), 2);
        assert_eq!(sp.lp().num_rows(), sp.base_rows() + 1);
        let sol = sp.solve(&DenseSimplex::new()).unwrap();
        // x_out >= 2, θ >= 3
        assert!((sol.objective - 5.0).abs() < 1e-9);
    }

    #[test]
    fn expectation_cut_of_zero_and_ten_has_intercept_five() {
        let sp = storage_node(Sense::Minimize);
        let vf = ValueFunction::new(CutOracleKind::Default, &sp);
        let outcomes = [
            Outcome {
                probability: 0.5,
                objective: 0.0,
                gradient: vec![0.0],
            },
            Outcome {
                probability: 0.5,
                objective: 10.0,
                gradient: vec![0.0],
            },
        ];
        let cut = vf.build_cut(vec![3.0], &outcomes, &Expectation);
        assert_eq!(cut.intercept, 5.0);
        assert_eq!(cut.coefficients, vec![0.0]);
    }

    #[test]
    fn cut_passes_through_the_weighted_objective_at_the_sample() {
        let sp = storage_node(Sense::Minimize);
        let vf = ValueFunction::new(CutOracleKind::Default, &sp);
        let outcomes = [
            Outcome {
                probability: 0.25,
                objective: 4.0,
                gradient: vec![1.0],
            },
            Outcome {
                probability: 0.75,
                objective: 8.0,
                gradient: vec![-1.0],
            },
        ];
        let cut = vf.build_cut(vec![2.0], &outcomes, &Expectation);
        assert!((cut.value_at(&[2.0]) - 7.0).abs() < 1e-12);
        assert!((cut.coefficients[0] + 0.5).abs() < 1e-12);
    }

    #[test]
    fn maximization_cuts_cap_the_epigraph() {
        let mut b = SubproblemBuilder::new(0, 0, Sense::Maximize);
        let x = b.add_state(0.0, 4.0, 0.0).unwrap();
        b.stage_objective(&[(x.outgoing, 1.0)], 0.0).unwrap();
        let mut sp = b.finish().unwrap();
        let vf = ValueFunction::new(CutOracleKind::Default, &sp);
        vf.couple(&mut sp, 100.0, false);
        // θ <= 10 − 3·x_out
        vf.add_cut(Cut {
            intercept: 10.0,
            coefficients: vec![-3.0],
            sample: vec![0.0],
        });
        vf.attach(&mut sp);
        let sol = sp.solve(&DenseSimplex::new()).unwrap();
        assert!((sol.objective - 10.0).abs() < 1e-9);
        assert!(sp.outgoing_state(&sol)[0].abs() < 1e-9);
    }

    #[test]
    fn autoregressive_variant_extends_the_cut_domain() {
        let mut b = SubproblemBuilder::new(0, 0, Sense::Minimize);
        let x = b.add_state(0.0, 10.0, 0.0).unwrap();
        let w = b.autoregressive_noise(&[0.5], &[2.0], &[1.0, 3.0]).unwrap();
        b.add_constraint(&[(x.outgoing, 1.0), (w, -1.0)], Relation::GreaterEqual, 0.0)
            .unwrap();
        b.stage_objective(&[(x.outgoing, 1.0)], 0.0).unwrap();
        let sp = b.finish().unwrap();
        let vf = ValueFunction::new(CutOracleKind::Default, &sp);
        assert_eq!(vf.lags(), 1);
        assert_eq!(vf.cut_columns(&sp).len(), 2);
        assert_eq!(vf.incoming_rows(&sp).len(), 2);

        let sol = sp.solve(&DenseSimplex::new()).unwrap();
        // w = 0.5·2 + 1 = 2, x_out = 2
        assert_eq!(vf.outgoing_point(&sp, &sol).len(), 2);
        let g = vf.incoming_gradient(&sp, &sol);
        assert!(g[0].abs() < 1e-9);
        assert!((g[1] - 0.5).abs() < 1e-9, "g={g:?}");
    }

    #[test]
    fn terminal_stage_has_no_future() {
        let mut sp = storage_node(Sense::Minimize);
        let vf = ValueFunction::new(CutOracleKind::Default, &sp);
        vf.couple(&mut sp, -1e6, true);
        let sol = sp.solve(&DenseSimplex::new()).unwrap();
        assert!((sol.objective - 2.0).abs() < 1e-9);
    }
}
