//! The SDDP driver.
//!
//! Each iteration samples `forward_passes` trajectories in parallel, runs a
//! backward pass along each of them in turn, re-evaluates the first-stage
//! bound and checks the stopping rules. Cuts persist on the model, so a
//! second call to [`SddpModel::solve`] resumes where the first stopped.

use std::time::Instant;

use rand::rngs::SmallRng;
use rand::SeedableRng;
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::backward_pass::{backward_pass, root_bound};
use crate::convergence::{
    bound_stalled, BoundEstimate, IterationRecord, SolveOptions, SolveResult, SolveStatus,
    StopSignal, StoppingRule,
};
use crate::error::{ModelError, Result};
use crate::forward_pass::{forward_pass, simulate, Trajectory};
use crate::lp::LpSolver;
use crate::policy_graph::{ModelDefinition, ModelMetadata, PolicyGraph};
use crate::risk::{Expectation, RiskMeasure};
use crate::simplex::DenseSimplex;
use crate::subproblem::SubproblemBuilder;

pub struct SddpModel {
    graph: PolicyGraph,
    risk: Box<dyn RiskMeasure>,
    solver: Box<dyn LpSolver>,
    iterations: usize,
    log: Vec<IterationRecord>,
}

impl SddpModel {
    /// Build the policy graph. Expectation and [`DenseSimplex`] until replaced.
    pub fn build<F>(definition: ModelDefinition, builder: F) -> Result<Self>
    where
        F: FnMut(&mut SubproblemBuilder) -> std::result::Result<(), ModelError>,
    {
        let graph = PolicyGraph::build(definition, builder)?;
        info!(
            stages = graph.num_stages(),
            states = graph.num_states(),
            lags = graph.history_len(),
            oracle = ?graph.cut_oracle(),
            "built policy graph"
        );
        Ok(Self {
            graph,
            risk: Box::new(Expectation),
            solver: Box::new(DenseSimplex::new()),
            iterations: 0,
            log: Vec::new(),
        })
    }

    pub fn with_risk_measure(mut self, risk: impl RiskMeasure + 'static) -> Self {
        self.risk = Box::new(risk);
        self
    }

    pub fn with_solver(mut self, solver: impl LpSolver + 'static) -> Self {
        self.solver = Box::new(solver);
        self
    }

    pub fn graph(&self) -> &PolicyGraph {
        &self.graph
    }

    pub fn metadata(&self) -> &ModelMetadata {
        self.graph.metadata()
    }

    pub fn solver(&self) -> &dyn LpSolver {
        self.solver.as_ref()
    }

    /// Iterations run so far, across calls.
    pub fn iterations(&self) -> usize {
        self.iterations
    }

    /// Every iteration record since the model was built.
    pub fn log(&self) -> &[IterationRecord] {
        &self.log
    }

    /// Current deterministic bound.
    pub fn lower_bound(&self) -> Result<f64> {
        root_bound(&self.graph, self.solver.as_ref(), self.risk.as_ref())
    }

    /// Simulate the current policy without adding cuts.
    pub fn simulate(&self, replications: usize, seed: u64) -> Result<Vec<Trajectory>> {
        simulate(&self.graph, self.solver.as_ref(), replications, seed)
    }

    pub fn solve(&mut self, options: &SolveOptions) -> Result<SolveResult> {
        self.solve_with_signal(options, &StopSignal::new())
    }

    /// Iterate until a limit, a stopping rule or `signal` ends the run. The
    /// signal is only checked between iterations.
    pub fn solve_with_signal(
        &mut self,
        options: &SolveOptions,
        signal: &StopSignal,
    ) -> Result<SolveResult> {
        options.validate()?;
        let start = Instant::now();
        let first_record = self.log.len();
        let mut upper_bound: Option<BoundEstimate> = None;
        info!(
            solver = self.solver.name(),
            forward_passes = options.forward_passes,
            resumed_at = self.iterations,
            "starting SDDP"
        );

        let status = loop {
            if signal.is_stopped() {
                break SolveStatus::Stopped;
            }
            let done = self.log.len() - first_record;
            if options.iteration_limit.is_some_and(|limit| done >= limit) {
                break SolveStatus::IterationLimit;
            }
            if options
                .time_limit
                .is_some_and(|t| start.elapsed().as_secs_f64() >= t)
            {
                break SolveStatus::TimeLimit;
            }

            let record = self.iterate(options, start)?;
            let lower_bound = record.lower_bound;
            info!(
                iteration = record.iteration,
                lower_bound,
                simulated = record.simulated_cost,
                cuts = record.cuts,
                elapsed = record.elapsed,
                "iteration"
            );
            self.log.push(record);

            if self.converged(options, lower_bound, &mut upper_bound)? {
                break SolveStatus::Converged;
            }
        };

        let lower_bound = match self.log.last() {
            Some(r) if self.log.len() > first_record => r.lower_bound,
            _ => self.lower_bound()?,
        };
        if status.is_converged() {
            info!(iterations = self.iterations, lower_bound, "converged");
        } else {
            warn!(
                status = ?status,
                iterations = self.iterations,
                lower_bound,
                "stopped before any stopping rule was satisfied"
            );
        }
        Ok(SolveResult {
            status,
            lower_bound,
            upper_bound,
            iterations: self.iterations,
            log: self.log[first_record..].to_vec(),
        })
    }

    fn iterate(&mut self, options: &SolveOptions, start: Instant) -> Result<IterationRecord> {
        let iteration = self.iterations;
        let graph = &self.graph;
        let solver = self.solver.as_ref();

        let trajectories: Vec<Trajectory> = (0..options.forward_passes)
            .into_par_iter()
            .map(|i| {
                let mut rng = SmallRng::seed_from_u64(options.forward_seed(iteration, i));
                forward_pass(graph, solver, &mut rng)
            })
            .collect::<Result<Vec<_>>>()?;
        let simulated_cost = trajectories.iter().map(|t| t.total_cost).sum::<f64>()
            / trajectories.len() as f64;
        debug!(iteration = iteration + 1, simulated_cost, "forward passes done");

        let mut cuts = 0;
        for t in &trajectories {
            cuts += backward_pass(graph, solver, self.risk.as_ref(), t)?;
        }
        debug!(iteration = iteration + 1, new_cuts = cuts, "backward passes done");

        let lower_bound = root_bound(graph, solver, self.risk.as_ref())?;
        self.iterations += 1;
        Ok(IterationRecord {
            iteration: self.iterations,
            lower_bound,
            simulated_cost,
            cuts: graph.num_cuts(),
            elapsed: start.elapsed().as_secs_f64(),
        })
    }

    fn converged(
        &self,
        options: &SolveOptions,
        lower_bound: f64,
        upper_bound: &mut Option<BoundEstimate>,
    ) -> Result<bool> {
        for rule in &options.stopping_rules {
            match *rule {
                StoppingRule::BoundStalling { window, tolerance } => {
                    if bound_stalled(&self.log, window, tolerance) {
                        debug!(window, tolerance, "bound stalled");
                        return Ok(true);
                    }
                }
                StoppingRule::Statistical {
                    frequency,
                    samples,
                    z_score,
                } => {
                    if self.iterations % frequency != 0 {
                        continue;
                    }
                    let seed = options.simulation_seed(self.iterations - 1);
                    let costs: Vec<f64> = self
                        .simulate(samples, seed)?
                        .iter()
                        .map(|t| t.total_cost)
                        .collect();
                    let estimate = BoundEstimate::from_samples(&costs, z_score);
                    *upper_bound = estimate;
                    if let Some(est) = estimate {
                        info!(
                            mean = est.mean,
                            half_width = est.half_width,
                            lower_bound,
                            "statistical bound"
                        );
                        if est.contains(lower_bound) {
                            return Ok(true);
                        }
                    }
                }
            }
        }
        Ok(false)
    }
}
