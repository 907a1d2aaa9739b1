//! Forward pass: sample one trajectory through the policy graph.
//!
//! Starting from the initial state, each stage samples a markov state from
//! the transition row of the state visited before, then a noise realization
//! of that node, and solves the node with the incoming state fixed to the
//! previous outgoing state. The randomness is injected by the caller, so a
//! seeded RNG reproduces the trajectory exactly.
//!
//! [`simulate`] runs many forward passes in parallel with the current cuts,
//! one `SmallRng` per replication, without generating cuts.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{PassKind, Result};
use crate::lp::LpSolver;
use crate::policy_graph::PolicyGraph;

// ── Result types ────────────────────────────────────────────────────────────

/// What a trajectory did at one stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialPoint {
    pub stage: usize,
    pub markov_state: usize,
    pub noise: usize,
    /// Outgoing state after the solve.
    pub state: Vec<f64>,
    /// Outgoing noise history (empty without autoregressive noise).
    pub history: Vec<f64>,
    pub stage_cost: f64,
    /// Epigraph value at the solution.
    pub future_value: f64,
}

impl TrialPoint {
    /// The point a cut built from this stage is anchored at.
    pub fn cut_point(&self) -> Vec<f64> {
        let mut point = self.state.clone();
        point.extend_from_slice(&self.history);
        point
    }
}

/// One sampled path through every stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    pub points: Vec<TrialPoint>,
    /// Sum of stage costs.
    pub total_cost: f64,
}

// ── Sampling ────────────────────────────────────────────────────────────────

/// Draw an index from a discrete distribution. Entries `<= 0` are never
/// returned; rounding slack at the top end falls on the last positive entry.
pub fn sample_index<R: Rng>(probabilities: &[f64], rng: &mut R) -> usize {
    let u: f64 = rng.random();
    let mut acc = 0.0;
    let mut last = 0;
    for (i, &p) in probabilities.iter().enumerate() {
        if p <= 0.0 {
            continue;
        }
        acc += p;
        last = i;
        if u < acc {
            return i;
        }
    }
    last
}

// ── Passes ──────────────────────────────────────────────────────────────────

/// Sample and solve one trajectory with the current cuts.
pub fn forward_pass<R: Rng>(
    graph: &PolicyGraph,
    solver: &dyn LpSolver,
    rng: &mut R,
) -> Result<Trajectory> {
    sample_trajectory(graph, solver, rng, PassKind::Forward)
}

fn sample_trajectory<R: Rng>(
    graph: &PolicyGraph,
    solver: &dyn LpSolver,
    rng: &mut R,
    pass: PassKind,
) -> Result<Trajectory> {
    let mut points: Vec<TrialPoint> = Vec::with_capacity(graph.num_stages());
    let mut total_cost = 0.0;

    for stage in 0..graph.num_stages() {
        let from = points.last().map_or(0, |p| p.markov_state);
        let markov_state = sample_index(graph.distribution(stage, from), rng);
        let node = graph.node(stage, markov_state);
        let noise = sample_index(node.noise_probabilities(), rng);

        let solution = match points.last() {
            Some(prev) => node.solve(&prev.state, &prev.history, noise, solver, pass)?,
            None => node.solve(
                node.initial_state(),
                node.initial_history(),
                noise,
                solver,
                pass,
            )?,
        };
        total_cost += solution.stage_cost;
        points.push(TrialPoint {
            stage,
            markov_state,
            noise,
            state: solution.outgoing_state,
            history: solution.outgoing_history,
            stage_cost: solution.stage_cost,
            future_value: solution.future_value,
        });
    }

    Ok(Trajectory { points, total_cost })
}

/// Run `replications` independent forward passes in parallel, replication `i`
/// seeded with `seed + i`. No cuts are added.
pub fn simulate(
    graph: &PolicyGraph,
    solver: &dyn LpSolver,
    replications: usize,
    seed: u64,
) -> Result<Vec<Trajectory>> {
    (0..replications)
        .into_par_iter()
        .map(|i| {
            let mut rng = SmallRng::seed_from_u64(seed.wrapping_add(i as u64));
            sample_trajectory(graph, solver, &mut rng, PassKind::Simulation)
        })
        .collect()
}
