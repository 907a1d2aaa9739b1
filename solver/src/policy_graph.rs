//! The stage × markov-state lattice.
//!
//! `markov_transition[s]` is an `M_{s−1} × M_s` row-stochastic matrix; the
//! first one is `1 × M_0` and holds the initial distribution. A row may be all
//! zero, which marks its markov state as never left (only legal for states
//! that cannot be reached, or in the last stage where rows are not used).
//!
//! Every (stage, markov state) pair gets a [`Node`]: a pool of subproblem
//! copies and its [`ValueFunction`] with a per-node cut lock. Unreachable nodes
//! are built like every other node but never sampled or solved.

use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::constants::{DEFAULT_OBJECTIVE_BOUND, PROBABILITY_TOLERANCE};
use crate::cut_oracle::CutOracleKind;
use crate::error::{ModelError, PassKind, Result, SddpError};
use crate::lp::{LpSolver, Sense};
use crate::subproblem::{Subproblem, SubproblemBuilder};
use crate::value_function::ValueFunction;

/// Descriptive fields carried into exports.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelMetadata {
    pub name: String,
    pub author: String,
    pub description: String,
}

/// Everything about a model except the subproblems themselves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDefinition {
    pub stages: usize,
    pub sense: Sense,
    /// Valid bound on the future value of every node: a lower bound when
    /// minimizing, an upper bound when maximizing.
    pub objective_bound: f64,
    /// Empty means one markov state per stage.
    pub markov_transition: Vec<Vec<Vec<f64>>>,
    pub cut_oracle: CutOracleKind,
    pub metadata: ModelMetadata,
}

impl ModelDefinition {
    pub fn new(stages: usize, sense: Sense) -> Self {
        let objective_bound = match sense {
            Sense::Minimize => -DEFAULT_OBJECTIVE_BOUND,
            Sense::Maximize => DEFAULT_OBJECTIVE_BOUND,
        };
        Self {
            stages,
            sense,
            objective_bound,
            markov_transition: Vec::new(),
            cut_oracle: CutOracleKind::Default,
            metadata: ModelMetadata::default(),
        }
    }

    pub fn objective_bound(mut self, bound: f64) -> Self {
        self.objective_bound = bound;
        self
    }

    pub fn markov_transition(mut self, transition: Vec<Vec<Vec<f64>>>) -> Self {
        self.markov_transition = transition;
        self
    }

    pub fn cut_oracle(mut self, kind: CutOracleKind) -> Self {
        self.cut_oracle = kind;
        self
    }

    pub fn metadata(mut self, metadata: ModelMetadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Result of one node solve.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSolution {
    /// Stage cost plus future value.
    pub objective: f64,
    pub stage_cost: f64,
    pub future_value: f64,
    pub outgoing_state: Vec<f64>,
    pub outgoing_history: Vec<f64>,
    /// Subgradient of `objective` with respect to the incoming state (and
    /// incoming noise history).
    pub gradient: Vec<f64>,
}

/// One (stage, markov state) of the graph.
///
/// Solves never share an LP: each one checks a copy out of `idle` (cloning
/// `template` when the pool is empty), so concurrent solves of the same node
/// run side by side. The mutex only guards the pool itself.
#[derive(Debug)]
pub struct Node {
    stage: usize,
    markov_state: usize,
    reachable: bool,
    noise_probabilities: Vec<f64>,
    initial_state: Vec<f64>,
    initial_history: Vec<f64>,
    template: Subproblem,
    idle: Mutex<Vec<Subproblem>>,
    value_function: ValueFunction,
}

impl Node {
    pub fn stage(&self) -> usize {
        self.stage
    }

    pub fn markov_state(&self) -> usize {
        self.markov_state
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable
    }

    pub fn noise_probabilities(&self) -> &[f64] {
        &self.noise_probabilities
    }

    pub fn num_noises(&self) -> usize {
        self.noise_probabilities.len()
    }

    pub fn initial_state(&self) -> &[f64] {
        &self.initial_state
    }

    pub fn initial_history(&self) -> &[f64] {
        &self.initial_history
    }

    pub fn value_function(&self) -> &ValueFunction {
        &self.value_function
    }

    fn checkout(&self) -> Subproblem {
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .unwrap_or_else(|| self.template.clone())
    }

    fn checkin(&self, subproblem: Subproblem) {
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(subproblem);
    }

    /// Solve with the incoming point fixed and noise realization `noise`.
    ///
    /// Cuts are attached to the checked-out copy under the oracle's read
    /// lock, so each solve sees one consistent cut set.
    pub fn solve(
        &self,
        state: &[f64],
        history: &[f64],
        noise: usize,
        solver: &dyn LpSolver,
        pass: PassKind,
    ) -> Result<NodeSolution> {
        let mut sp = self.checkout();
        self.value_function.attach(&mut sp);
        sp.set_incoming(state, history);
        sp.set_noise(noise);
        let solved = sp.solve(solver);
        let solution = match solved {
            Ok(solution) => solution,
            Err(failure) => {
                self.checkin(sp);
                return Err(SddpError::Solve {
                    pass,
                    stage: self.stage,
                    markov_state: self.markov_state,
                    noise,
                    failure,
                });
            }
        };
        trace!(
            stage = self.stage,
            markov_state = self.markov_state,
            noise,
            objective = solution.objective,
            "solved subproblem"
        );
        let vf = &self.value_function;
        let result = NodeSolution {
            objective: solution.objective,
            stage_cost: sp.stage_cost(&solution),
            future_value: vf.current_bound(&sp, &solution),
            outgoing_state: sp.outgoing_state(&solution),
            outgoing_history: if vf.lags() > 0 {
                sp.outgoing_history(&solution)
            } else {
                Vec::new()
            },
            gradient: vf.incoming_gradient(&sp, &solution),
        };
        self.checkin(sp);
        Ok(result)
    }
}

/// Built and validated policy graph.
#[derive(Debug)]
pub struct PolicyGraph {
    sense: Sense,
    objective_bound: f64,
    cut_oracle: CutOracleKind,
    metadata: ModelMetadata,
    transitions: Vec<Vec<Vec<f64>>>,
    stages: Vec<Vec<Node>>,
    num_states: usize,
    history_len: usize,
}

impl PolicyGraph {
    /// Validate `definition`, then run `builder` once per (stage, markov
    /// state) to declare the subproblems.
    pub fn build<F>(
        definition: ModelDefinition,
        mut builder: F,
    ) -> std::result::Result<Self, ModelError>
    where
        F: FnMut(&mut SubproblemBuilder) -> std::result::Result<(), ModelError>,
    {
        let ModelDefinition {
            stages: num_stages,
            sense,
            objective_bound,
            markov_transition,
            cut_oracle,
            metadata,
        } = definition;

        if num_stages == 0 {
            return Err(ModelError::NoStages);
        }
        let transitions = if markov_transition.is_empty() {
            vec![vec![vec![1.0]]; num_stages]
        } else {
            markov_transition
        };
        let sizes = validate_transitions(&transitions, num_stages)?;
        let reachable = reachability(&transitions, &sizes)?;

        let mut stages = Vec::with_capacity(num_stages);
        let mut dims: Option<(usize, usize)> = None;
        for (s, &size) in sizes.iter().enumerate() {
            let mut nodes = Vec::with_capacity(size);
            for j in 0..size {
                let mut b = SubproblemBuilder::new(s, j, sense);
                builder(&mut b)?;
                let mut sp = b.finish()?;

                let (states, lags) = (sp.num_states(), sp.history_len());
                match dims {
                    None => dims = Some((states, lags)),
                    Some((expected, _)) if expected != states => {
                        return Err(ModelError::DimensionMismatch {
                            stage: s,
                            markov_state: j,
                            what: "state variables",
                            expected,
                            actual: states,
                        })
                    }
                    Some((_, expected)) if expected != lags => {
                        return Err(ModelError::DimensionMismatch {
                            stage: s,
                            markov_state: j,
                            what: "noise history",
                            expected,
                            actual: lags,
                        })
                    }
                    Some(_) => {}
                }

                let value_function = ValueFunction::new(cut_oracle, &sp);
                value_function.couple(&mut sp, objective_bound, s + 1 == num_stages);
                nodes.push(Node {
                    stage: s,
                    markov_state: j,
                    reachable: reachable[s][j],
                    noise_probabilities: sp.noise_probabilities().to_vec(),
                    initial_state: sp.initial_state(),
                    initial_history: sp.initial_history(),
                    template: sp,
                    idle: Mutex::new(Vec::new()),
                    value_function,
                });
            }
            stages.push(nodes);
        }

        let (num_states, history_len) = dims.unwrap_or((0, 0));
        Ok(Self {
            sense,
            objective_bound,
            cut_oracle,
            metadata,
            transitions,
            stages,
            num_states,
            history_len,
        })
    }

    pub fn sense(&self) -> Sense {
        self.sense
    }

    pub fn objective_bound(&self) -> f64 {
        self.objective_bound
    }

    pub fn cut_oracle(&self) -> CutOracleKind {
        self.cut_oracle
    }

    pub fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }

    pub fn num_stages(&self) -> usize {
        self.stages.len()
    }

    pub fn num_markov_states(&self, stage: usize) -> usize {
        self.stages[stage].len()
    }

    /// State variables per subproblem (the same in every node).
    pub fn num_states(&self) -> usize {
        self.num_states
    }

    /// Lagged noise values per subproblem (the same in every node).
    pub fn history_len(&self) -> usize {
        self.history_len
    }

    pub fn transitions(&self) -> &[Vec<Vec<f64>>] {
        &self.transitions
    }

    pub fn node(&self, stage: usize, markov_state: usize) -> &Node {
        &self.stages[stage][markov_state]
    }

    pub fn nodes(&self, stage: usize) -> &[Node] {
        &self.stages[stage]
    }

    /// Distribution over the markov states of `stage`, given the markov state
    /// visited in the previous stage. `from` is ignored at stage 0.
    pub fn distribution(&self, stage: usize, from: usize) -> &[f64] {
        if stage == 0 {
            &self.transitions[0][0]
        } else {
            &self.transitions[stage][from]
        }
    }

    /// `(markov state, probability)` of every successor with positive
    /// probability.
    pub fn successors(
        &self,
        stage: usize,
        from: usize,
    ) -> impl Iterator<Item = (usize, f64)> + '_ {
        self.distribution(stage, from)
            .iter()
            .copied()
            .enumerate()
            .filter(|&(_, p)| p > 0.0)
    }

    /// Cuts currently valid across all nodes.
    pub fn num_cuts(&self) -> usize {
        self.stages
            .iter()
            .flatten()
            .map(|n| n.value_function.num_cuts())
            .sum()
    }

    /// Cuts ever generated across all nodes, pruned ones included.
    pub fn total_cuts(&self) -> usize {
        self.stages
            .iter()
            .flatten()
            .map(|n| n.value_function.total_cuts())
            .sum()
    }
}

/// Check shapes, entries and row sums. Returns `M_s` per stage.
fn validate_transitions(
    transitions: &[Vec<Vec<f64>>],
    num_stages: usize,
) -> std::result::Result<Vec<usize>, ModelError> {
    if transitions.len() != num_stages {
        return Err(ModelError::TransitionCount {
            expected: num_stages,
            actual: transitions.len(),
        });
    }
    let mut sizes = Vec::with_capacity(num_stages);
    let mut rows_expected = 1;
    for (s, matrix) in transitions.iter().enumerate() {
        if matrix.len() != rows_expected {
            return Err(ModelError::TransitionRows {
                stage: s,
                expected: rows_expected,
                actual: matrix.len(),
            });
        }
        let columns = matrix[0].len();
        for (i, row) in matrix.iter().enumerate() {
            if row.len() != columns || columns == 0 {
                return Err(ModelError::TransitionColumns {
                    stage: s,
                    row: i,
                    expected: columns.max(1),
                    actual: row.len(),
                });
            }
            if let Some(&value) = row.iter().find(|p| !(p.is_finite() && **p >= 0.0)) {
                return Err(ModelError::InvalidProbability { stage: s, row: i, value });
            }
            let sum: f64 = row.iter().sum();
            if sum != 0.0 && (sum - 1.0).abs() > PROBABILITY_TOLERANCE {
                return Err(ModelError::RowSum { stage: s, row: i, sum });
            }
        }
        sizes.push(columns);
        rows_expected = columns;
    }
    Ok(sizes)
}

/// Forward reachability from the initial distribution. Fails when a stage
/// has no reachable state or a reachable state has nowhere to go.
fn reachability(
    transitions: &[Vec<Vec<f64>>],
    sizes: &[usize],
) -> std::result::Result<Vec<Vec<bool>>, ModelError> {
    let mut reachable: Vec<Vec<bool>> = Vec::with_capacity(sizes.len());
    for (s, &size) in sizes.iter().enumerate() {
        let mut here = vec![false; size];
        match reachable.last() {
            None => {
                for (j, &p) in transitions[0][0].iter().enumerate() {
                    here[j] = p > 0.0;
                }
            }
            Some(previous) => {
                for (i, row) in transitions[s].iter().enumerate() {
                    if !previous[i] {
                        continue;
                    }
                    if row.iter().all(|&p| p == 0.0) {
                        return Err(ModelError::DeadEnd {
                            stage: s - 1,
                            markov_state: i,
                        });
                    }
                    for (j, &p) in row.iter().enumerate() {
                        here[j] |= p > 0.0;
                    }
                }
            }
        }
        if !here.iter().any(|&r| r) {
            return Err(ModelError::NoReachableState { stage: s });
        }
        reachable.push(here);
    }
    Ok(reachable)
}
