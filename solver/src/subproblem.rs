//! Stage subproblems and the builder users declare them with.
//!
//! One [`Subproblem`] exists per (stage, markov state). It is declared once
//! through a [`SubproblemBuilder`] and then re-solved many times: the engine
//! only ever changes right-hand sides (incoming state, noise) and appends or
//! truncates cut rows.
//!
//! ## Layout of the underlying LP
//!
//! - For every state variable: an incoming column (free) pinned by a fixing row
//!   `x_in = value`, and an outgoing column bounded by `[lower, upper]`. The
//!   dual of the fixing row is the subgradient of the stage value with respect
//!   to the incoming state.
//! - For rhs noise: ordinary rows whose finite side is replaced by `values[k]`
//!   under realization `k`.
//! - For autoregressive noise: one incoming column per lag (pinned like a
//!   state), a column `w` for the realized noise, and the defining row
//!   `w − Σ φ_l·lag_l = ε_k`.
//! - One epigraph column with objective coefficient 1, coupled to the cuts by
//!   [`crate::value_function::ValueFunction`].
//!
//! Cut rows always come after every declared row, so truncating back to
//! [`Subproblem::base_rows`] removes all of them.

use crate::constants::PROBABILITY_TOLERANCE;
use crate::error::ModelError;
use crate::lp::{LinearProgram, LpFailure, LpSolution, LpSolver, Relation, Sense};

/// Columns of one declared state variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateHandle {
    /// Value carried in from the previous stage (fixed before each solve).
    pub incoming: usize,
    /// Value passed on to the next stage.
    pub outgoing: usize,
}

#[derive(Debug, Clone)]
struct StateVariable {
    lower: f64,
    upper: f64,
    initial: f64,
    outgoing: usize,
    fixing_row: usize,
}

#[derive(Debug, Clone)]
struct NoiseRow {
    row: usize,
    values: Vec<f64>,
}

/// `w_t = Σ_l φ_l·w_{t−l} + ε_t` attached to one subproblem.
#[derive(Debug, Clone)]
struct AutoregressiveRhs {
    initial_history: Vec<f64>,
    innovations: Vec<f64>,
    lag_columns: Vec<usize>,
    lag_rows: Vec<usize>,
    noise_column: usize,
    defining_row: usize,
}

/// Declaration surface for one (stage, markov state) subproblem.
///
/// Handed to the model-construction callback, which adds states, variables,
/// constraints and noise, then sets the stage objective.
pub struct SubproblemBuilder {
    stage: usize,
    markov_state: usize,
    lp: LinearProgram,
    states: Vec<StateVariable>,
    noise_rows: Vec<NoiseRow>,
    probabilities: Option<Vec<f64>>,
    autoregressive: Option<AutoregressiveRhs>,
    support: Option<usize>,
    objective_set: bool,
}

impl SubproblemBuilder {
    pub(crate) fn new(stage: usize, markov_state: usize, sense: Sense) -> Self {
        Self {
            stage,
            markov_state,
            lp: LinearProgram::new(sense),
            states: Vec::new(),
            noise_rows: Vec::new(),
            probabilities: None,
            autoregressive: None,
            support: None,
            objective_set: false,
        }
    }

    pub fn stage(&self) -> usize {
        self.stage
    }

    pub fn markov_state(&self) -> usize {
        self.markov_state
    }

    /// Declare a state variable with bounds `[lower, upper]` and the value it
    /// takes before the first stage.
    pub fn add_state(
        &mut self,
        lower: f64,
        upper: f64,
        initial: f64,
    ) -> Result<StateHandle, ModelError> {
        if lower > upper || initial < lower || initial > upper || initial.is_nan() {
            return Err(ModelError::StateBounds {
                stage: self.stage,
                markov_state: self.markov_state,
                state: self.states.len(),
                lower,
                upper,
                initial,
            });
        }
        let incoming = self
            .lp
            .add_column(0.0, f64::NEG_INFINITY, f64::INFINITY);
        let outgoing = self.lp.add_column(0.0, lower, upper);
        let fixing_row = self.lp.add_row(&[(incoming, 1.0)], initial, initial);
        self.states.push(StateVariable {
            lower,
            upper,
            initial,
            outgoing,
            fixing_row,
        });
        Ok(StateHandle { incoming, outgoing })
    }

    /// Add a control variable with bounds `[lower, upper]`.
    pub fn add_variable(&mut self, lower: f64, upper: f64) -> usize {
        self.lp.add_column(0.0, lower, upper)
    }

    /// Add `Σ terms <relation> rhs`.
    pub fn add_constraint(
        &mut self,
        terms: &[(usize, f64)],
        relation: Relation,
        rhs: f64,
    ) -> Result<usize, ModelError> {
        self.check_terms(terms)?;
        let (lower, upper) = relation.bounds(rhs);
        Ok(self.lp.add_row(terms, lower, upper))
    }

    /// Add `Σ terms <relation> w` where `w` takes `values[k]` under noise
    /// realization `k`. Every noise declaration of a subproblem shares the same
    /// support, so all value vectors must have the same length.
    pub fn add_rhs_noise(
        &mut self,
        terms: &[(usize, f64)],
        relation: Relation,
        values: &[f64],
    ) -> Result<usize, ModelError> {
        self.check_terms(terms)?;
        self.check_support(values.len())?;
        let (lower, upper) = relation.bounds(values[0]);
        let row = self.lp.add_row(terms, lower, upper);
        self.noise_rows.push(NoiseRow {
            row,
            values: values.to_vec(),
        });
        Ok(row)
    }

    /// Probabilities of the noise realizations. Uniform when never called.
    pub fn noise_probability(&mut self, probabilities: &[f64]) -> Result<(), ModelError> {
        if let Some(bad) = probabilities.iter().find(|p| !(**p >= 0.0) || !p.is_finite()) {
            return Err(self.probability_error(format!("negative or non-finite entry {bad}")));
        }
        let sum: f64 = probabilities.iter().sum();
        if (sum - 1.0).abs() > PROBABILITY_TOLERANCE {
            return Err(self.probability_error(format!("entries sum to {sum}")));
        }
        self.probabilities = Some(probabilities.to_vec());
        Ok(())
    }

    /// Declare autoregressive rhs noise `w_t = Σ_l coefficients[l]·w_{t−1−l} + ε_t`
    /// with `ε_t` drawn from `innovations` (sharing the subproblem's noise
    /// support). Returns the column holding `w_t`, to be used in constraints.
    pub fn autoregressive_noise(
        &mut self,
        coefficients: &[f64],
        initial_history: &[f64],
        innovations: &[f64],
    ) -> Result<usize, ModelError> {
        if coefficients.is_empty() || coefficients.len() != initial_history.len() {
            return Err(ModelError::DimensionMismatch {
                stage: self.stage,
                markov_state: self.markov_state,
                what: "autoregressive initial history",
                expected: coefficients.len().max(1),
                actual: initial_history.len(),
            });
        }
        if self.autoregressive.is_some() {
            return Err(ModelError::DimensionMismatch {
                stage: self.stage,
                markov_state: self.markov_state,
                what: "autoregressive noise declarations",
                expected: 1,
                actual: 2,
            });
        }
        self.check_support(innovations.len())?;

        let mut lag_columns = Vec::with_capacity(coefficients.len());
        let mut lag_rows = Vec::with_capacity(coefficients.len());
        for &h in initial_history {
            let col = self.lp.add_column(0.0, f64::NEG_INFINITY, f64::INFINITY);
            lag_rows.push(self.lp.add_row(&[(col, 1.0)], h, h));
            lag_columns.push(col);
        }
        let noise_column = self.lp.add_column(0.0, f64::NEG_INFINITY, f64::INFINITY);
        let mut terms = vec![(noise_column, 1.0)];
        terms.extend(lag_columns.iter().zip(coefficients).map(|(&c, &phi)| (c, -phi)));
        let defining_row = self.lp.add_row(&terms, innovations[0], innovations[0]);

        self.autoregressive = Some(AutoregressiveRhs {
            initial_history: initial_history.to_vec(),
            innovations: innovations.to_vec(),
            lag_columns,
            lag_rows,
            noise_column,
            defining_row,
        });
        Ok(noise_column)
    }

    /// Set the stage objective `Σ terms + constant`. Columns not named cost 0.
    pub fn stage_objective(
        &mut self,
        terms: &[(usize, f64)],
        constant: f64,
    ) -> Result<(), ModelError> {
        self.check_terms(terms)?;
        for j in 0..self.lp.num_columns() {
            self.lp.set_cost(j, 0.0);
        }
        let mut costs = vec![0.0; self.lp.num_columns()];
        for &(j, c) in terms {
            costs[j] += c;
        }
        for (j, c) in costs.into_iter().enumerate() {
            if c != 0.0 {
                self.lp.set_cost(j, c);
            }
        }
        self.lp.offset = constant;
        self.objective_set = true;
        Ok(())
    }

    fn check_terms(&self, terms: &[(usize, f64)]) -> Result<(), ModelError> {
        match terms.iter().find(|(j, _)| *j >= self.lp.num_columns()) {
            Some(&(column, _)) => Err(ModelError::UnknownColumn {
                stage: self.stage,
                markov_state: self.markov_state,
                column,
            }),
            None => Ok(()),
        }
    }

    fn check_support(&mut self, len: usize) -> Result<(), ModelError> {
        let current = self.support;
        match current {
            _ if len == 0 => Err(ModelError::NoiseSupport {
                stage: self.stage,
                markov_state: self.markov_state,
                expected: current.unwrap_or(1),
                actual: 0,
            }),
            Some(expected) if expected != len => Err(ModelError::NoiseSupport {
                stage: self.stage,
                markov_state: self.markov_state,
                expected,
                actual: len,
            }),
            _ => {
                self.support = Some(len);
                Ok(())
            }
        }
    }

    fn probability_error(&self, reason: String) -> ModelError {
        ModelError::NoiseProbability {
            stage: self.stage,
            markov_state: self.markov_state,
            reason,
        }
    }

    /// Validate the declaration and add the epigraph column.
    pub(crate) fn finish(mut self) -> Result<Subproblem, ModelError> {
        if !self.objective_set {
            return Err(ModelError::MissingObjective {
                stage: self.stage,
                markov_state: self.markov_state,
            });
        }
        let support = self.support.unwrap_or(1);
        let probabilities = match self.probabilities.take() {
            Some(p) if p.len() != support => {
                return Err(ModelError::NoiseSupport {
                    stage: self.stage,
                    markov_state: self.markov_state,
                    expected: support,
                    actual: p.len(),
                })
            }
            Some(p) => p,
            None => vec![1.0 / support as f64; support],
        };
        // Bounds are set when the value function is coupled.
        let epigraph = self.lp.add_column(1.0, 0.0, 0.0);
        let base_rows = self.lp.num_rows();

        Ok(Subproblem {
            stage: self.stage,
            markov_state: self.markov_state,
            lp: self.lp,
            states: self.states,
            noise_rows: self.noise_rows,
            probabilities,
            autoregressive: self.autoregressive,
            epigraph,
            base_rows,
            attached_generation: 0,
            attached_cuts: 0,
        })
    }
}

/// A built subproblem: the LP plus the handles the engine mutates.
#[derive(Debug, Clone)]
pub struct Subproblem {
    stage: usize,
    markov_state: usize,
    lp: LinearProgram,
    states: Vec<StateVariable>,
    noise_rows: Vec<NoiseRow>,
    probabilities: Vec<f64>,
    autoregressive: Option<AutoregressiveRhs>,
    epigraph: usize,
    base_rows: usize,
    pub(crate) attached_generation: u64,
    pub(crate) attached_cuts: usize,
}

impl Subproblem {
    pub fn stage(&self) -> usize {
        self.stage
    }

    pub fn markov_state(&self) -> usize {
        self.markov_state
    }

    pub fn sense(&self) -> Sense {
        self.lp.sense
    }

    pub fn num_states(&self) -> usize {
        self.states.len()
    }

    /// Number of lagged noise terms (0 without autoregressive noise).
    pub fn history_len(&self) -> usize {
        self.autoregressive
            .as_ref()
            .map_or(0, |ar| ar.lag_columns.len())
    }

    pub fn num_noises(&self) -> usize {
        self.probabilities.len()
    }

    pub fn noise_probabilities(&self) -> &[f64] {
        &self.probabilities
    }

    pub fn epigraph(&self) -> usize {
        self.epigraph
    }

    /// Rows declared by the user (and the noise/state machinery); cut rows follow.
    pub fn base_rows(&self) -> usize {
        self.base_rows
    }

    pub fn lp(&self) -> &LinearProgram {
        &self.lp
    }

    pub(crate) fn lp_mut(&mut self) -> &mut LinearProgram {
        &mut self.lp
    }

    pub fn initial_state(&self) -> Vec<f64> {
        self.states.iter().map(|s| s.initial).collect()
    }

    pub fn initial_history(&self) -> Vec<f64> {
        self.autoregressive
            .as_ref()
            .map_or_else(Vec::new, |ar| ar.initial_history.clone())
    }

    /// `(lower, upper)` of each outgoing state.
    pub fn state_bounds(&self) -> Vec<(f64, f64)> {
        self.states.iter().map(|s| (s.lower, s.upper)).collect()
    }

    pub(crate) fn outgoing_state_columns(&self) -> Vec<usize> {
        self.states.iter().map(|s| s.outgoing).collect()
    }

    /// Outgoing noise history `(w_t, lag_1, …, lag_{L−1})`.
    pub(crate) fn outgoing_history_columns(&self) -> Vec<usize> {
        match &self.autoregressive {
            Some(ar) => {
                let mut cols = vec![ar.noise_column];
                cols.extend_from_slice(&ar.lag_columns[..ar.lag_columns.len() - 1]);
                cols
            }
            None => Vec::new(),
        }
    }

    pub(crate) fn state_fixing_rows(&self) -> Vec<usize> {
        self.states.iter().map(|s| s.fixing_row).collect()
    }

    pub(crate) fn history_fixing_rows(&self) -> Vec<usize> {
        self.autoregressive
            .as_ref()
            .map_or_else(Vec::new, |ar| ar.lag_rows.clone())
    }

    /// Pin the incoming state (and lagged noise history, if any).
    pub fn set_incoming(&mut self, state: &[f64], history: &[f64]) {
        for (s, &v) in self.states.iter().zip(state) {
            self.lp.set_row_bounds(s.fixing_row, v, v);
        }
        if let Some(ar) = &self.autoregressive {
            for (&row, &v) in ar.lag_rows.iter().zip(history) {
                self.lp.set_row_bounds(row, v, v);
            }
        }
    }

    /// Apply noise realization `k` to every noise row.
    pub fn set_noise(&mut self, k: usize) {
        for n in &self.noise_rows {
            self.lp.set_row_rhs(n.row, n.values[k]);
        }
        if let Some(ar) = &self.autoregressive {
            let e = ar.innovations[k];
            self.lp.set_row_bounds(ar.defining_row, e, e);
        }
    }

    pub fn solve(&self, solver: &dyn LpSolver) -> Result<LpSolution, LpFailure> {
        solver.solve(&self.lp)
    }

    /// Objective minus the epigraph value.
    pub fn stage_cost(&self, solution: &LpSolution) -> f64 {
        solution.objective - solution.primal[self.epigraph]
    }

    pub fn outgoing_state(&self, solution: &LpSolution) -> Vec<f64> {
        self.states
            .iter()
            .map(|s| solution.primal[s.outgoing].clamp(s.lower, s.upper))
            .collect()
    }

    pub fn outgoing_history(&self, solution: &LpSolution) -> Vec<f64> {
        self.outgoing_history_columns()
            .into_iter()
            .map(|c| solution.primal[c])
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simplex::DenseSimplex;

    #[test]
    fn state_bounds_are_validated() {
        let mut b = SubproblemBuilder::new(0, 0, Sense::Minimize);
        let err = b.add_state(0.0, 10.0, 12.0).unwrap_err();
        assert!(matches!(err, ModelError::StateBounds { state: 0, .. }));
        assert!(b.add_state(5.0, 1.0, 3.0).is_err());
    }

    #[test]
    fn missing_objective_fails_at_finish() {
        let mut b = SubproblemBuilder::new(2, 1, Sense::Minimize);
        b.add_state(0.0, 1.0, 0.0).unwrap();
        let err = b.finish().unwrap_err();
        assert_eq!(
            err,
            ModelError::MissingObjective {
                stage: 2,
                markov_state: 1
            }
        );
    }

    #[test]
    fn noise_support_lengths_must_agree() {
        let mut b = SubproblemBuilder::new(0, 0, Sense::Minimize);
        let x = b.add_variable(0.0, 10.0);
        b.add_rhs_noise(&[(x, 1.0)], Relation::GreaterEqual, &[1.0, 2.0])
            .unwrap();
        let err = b
            .add_rhs_noise(&[(x, 1.0)], Relation::LessEqual, &[1.0, 2.0, 3.0])
            .unwrap_err();
        assert!(matches!(err, ModelError::NoiseSupport { expected: 2, actual: 3, .. }));
    }

    #[test]
    fn unknown_columns_are_rejected() {
        let mut b = SubproblemBuilder::new(0, 0, Sense::Minimize);
        assert!(matches!(
            b.add_constraint(&[(3, 1.0)], Relation::Equal, 0.0),
            Err(ModelError::UnknownColumn { column: 3, .. })
        ));
    }

    #[test]
    fn noise_realization_changes_rhs() {
        let mut b = SubproblemBuilder::new(0, 0, Sense::Minimize);
        let x = b.add_variable(0.0, 100.0);
        b.add_rhs_noise(&[(x, 1.0)], Relation::GreaterEqual, &[3.0, 7.0])
            .unwrap();
        b.stage_objective(&[(x, 2.0)], 1.0).unwrap();
        let mut sp = b.finish().unwrap();
        assert_eq!(sp.num_noises(), 2);
        assert_eq!(sp.noise_probabilities(), &[0.5, 0.5]);

        let solver = DenseSimplex::new();
        sp.set_noise(1);
        let sol = sp.solve(&solver).unwrap();
        assert!((sol.objective - 15.0).abs() < 1e-9);
        assert!((sp.stage_cost(&sol) - 15.0).abs() < 1e-9);
    }

    #[test]
    fn autoregressive_noise_shifts_history() {
        let mut b = SubproblemBuilder::new(1, 0, Sense::Minimize);
        let w = b.autoregressive_noise(&[0.5, 0.25], &[4.0, 8.0], &[1.0]).unwrap();
        let x = b.add_variable(0.0, f64::INFINITY);
        b.add_constraint(&[(x, 1.0), (w, -1.0)], Relation::GreaterEqual, 0.0)
            .unwrap();
        b.stage_objective(&[(x, 1.0)], 0.0).unwrap();
        let sp = b.finish().unwrap();
        assert_eq!(sp.history_len(), 2);

        let sol = sp.solve(&DenseSimplex::new()).unwrap();
        // w = 0.5·4 + 0.25·8 + 1 = 5
        assert!((sol.objective - 5.0).abs() < 1e-9);
        let hist = sp.outgoing_history(&sol);
        assert!((hist[0] - 5.0).abs() < 1e-9);
        assert!((hist[1] - 4.0).abs() < 1e-9);
    }
}
