//! Backward pass: refine the value functions along one trajectory.
//!
//! For stages `T−1` down to `1`, the outgoing point of the trajectory at
//! stage `s−1` is fixed as the incoming point of every successor `(s, j)`
//! with positive transition probability, and every noise realization of `j`
//! is solved. The outcomes `(p_j·p_k, objective, gradient)` are reweighted by
//! the risk measure and combined into one cut for node `(s−1, i)`, where `i`
//! is the markov state the trajectory visited.
//!
//! The successor solves of one step are independent and run under rayon. The
//! steps themselves are sequential: the cut added at stage `s−1` is visible
//! to the solves of the next step.

use rayon::prelude::*;
use tracing::debug;

use crate::error::{PassKind, Result};
use crate::forward_pass::Trajectory;
use crate::lp::LpSolver;
use crate::policy_graph::PolicyGraph;
use crate::risk::RiskMeasure;
use crate::value_function::Outcome;

/// Add one cut per stage transition of `trajectory`. Returns the number of
/// cuts generated.
pub fn backward_pass(
    graph: &PolicyGraph,
    solver: &dyn LpSolver,
    risk: &dyn RiskMeasure,
    trajectory: &Trajectory,
) -> Result<usize> {
    let mut added = 0;
    for stage in (1..graph.num_stages()).rev() {
        let trial = &trajectory.points[stage - 1];
        let tasks: Vec<(usize, usize, f64)> = graph
            .successors(stage, trial.markov_state)
            .flat_map(|(j, pj)| {
                graph
                    .node(stage, j)
                    .noise_probabilities()
                    .iter()
                    .enumerate()
                    .filter(|(_, pk)| **pk > 0.0)
                    .map(move |(k, pk)| (j, k, pj * pk))
                    .collect::<Vec<_>>()
            })
            .collect();

        let outcomes: Vec<Outcome> = tasks
            .par_iter()
            .map(|&(j, k, probability)| {
                let solution = graph.node(stage, j).solve(
                    &trial.state,
                    &trial.history,
                    k,
                    solver,
                    PassKind::Backward,
                )?;
                Ok(Outcome {
                    probability,
                    objective: solution.objective,
                    gradient: solution.gradient,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let vf = graph
            .node(stage - 1, trial.markov_state)
            .value_function();
        let cut = vf.build_cut(trial.cut_point(), &outcomes, risk);
        debug!(
            stage = stage - 1,
            markov_state = trial.markov_state,
            oracle = vf.oracle_name(),
            outcomes = outcomes.len(),
            intercept = cut.intercept,
            "new cut"
        );
        vf.add_cut(cut);
        added += 1;
    }
    Ok(added)
}

/// Risk-weighted first-stage value over the initial markov distribution and
/// the first-stage noise: the deterministic bound of the current policy.
pub fn root_bound(
    graph: &PolicyGraph,
    solver: &dyn LpSolver,
    risk: &dyn RiskMeasure,
) -> Result<f64> {
    let tasks: Vec<(usize, usize, f64)> = graph
        .successors(0, 0)
        .flat_map(|(j, pj)| {
            graph
                .node(0, j)
                .noise_probabilities()
                .iter()
                .enumerate()
                .filter(|(_, pk)| **pk > 0.0)
                .map(move |(k, pk)| (j, k, pj * pk))
                .collect::<Vec<_>>()
        })
        .collect();

    let objectives: Vec<f64> = tasks
        .par_iter()
        .map(|&(j, k, _)| {
            let node = graph.node(0, j);
            node.solve(
                node.initial_state(),
                node.initial_history(),
                k,
                solver,
                PassKind::Bound,
            )
            .map(|s| s.objective)
        })
        .collect::<Result<Vec<_>>>()?;

    let nominal: Vec<f64> = tasks.iter().map(|t| t.2).collect();
    let q = risk.adjust(&nominal, &objectives, graph.sense());
    Ok(q.iter().zip(&objectives).map(|(q, z)| q * z).sum())
}
