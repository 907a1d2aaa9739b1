//! # SDDP: stochastic dual dynamic programming
//!
//! Solves multistage stochastic linear programs whose stages form a markov
//! chain of subproblems with random right-hand sides. The expected (or
//! risk-adjusted) future cost of every (stage, markov state) is approximated
//! from below (minimization) by cutting planes that are refined along sampled
//! trajectories.
//!
//! ## Algorithm overview
//!
//! | Step | Rust module | Description |
//! |------|-------------|-------------|
//! | Build | [`policy_graph`], [`subproblem`] | Validate the transition matrices, run the user callback once per (stage, markov state), couple each LP to its value function |
//! | Forward | [`forward_pass`] | Sample markov states and noise, solve stage by stage with the current cuts, record trial points |
//! | Backward | [`backward_pass`] | From the last stage back, solve every successor realization at the trial point, reweight with the [`risk`] measure, add one cut per stage |
//! | Bound | [`backward_pass::root_bound`] | Risk-weighted first-stage value: the deterministic bound |
//! | Stop | [`convergence`], [`model`] | Iteration/time limits, bound stalling, statistical test against simulated costs |
//!
//! ## Cuts
//!
//! A cut for node `(s, i)` is `θ ≥ α + β·x` where `x` is the outgoing state
//! (plus the lagged noise history when autoregressive noise is declared), `β`
//! is the risk-weighted sum of the duals on the successors' incoming fixing
//! rows, and `α` makes the cut exact at the trial point. Cuts are stored in a
//! per-node [`cut_oracle::CutOracle`] which may prune dominated cuts.
//!
//! ## Concurrency
//!
//! - Forward passes of one iteration run in parallel, one `SmallRng` each.
//! - Successor solves of one backward step run in parallel; the steps run in
//!   order, so each step sees the cut added by the previous one.
//! - Each node keeps a small pool of subproblem copies. A solve checks one
//!   out, attaches the current cuts and solves without holding any lock, so
//!   every (markov state, noise) solve of a step runs on its own worker.
//! - Cuts live behind a per-node `RwLock`: inserts are exclusive for that
//!   node only.
//!
//! ## Linear programs
//!
//! Subproblems are solved through the [`lp::LpSolver`] trait. The built-in
//! backend is [`simplex::DenseSimplex`], a two-phase dense primal simplex
//! with dual recovery, suited to the small LPs of a stage subproblem.

#![allow(clippy::needless_range_loop)]

pub mod backward_pass;
pub mod constants;
pub mod convergence;
pub mod cut_oracle;
pub mod env_config;
pub mod error;
pub mod forward_pass;
pub mod lp;
pub mod model;
pub mod policy_graph;
pub mod risk;
pub mod simplex;
pub mod storage;
pub mod subproblem;
pub mod value_function;

pub use convergence::{SolveOptions, SolveResult, SolveStatus, StopSignal, StoppingRule};
pub use cut_oracle::{Cut, CutOracleKind};
pub use error::{ModelError, Result, SddpError};
pub use lp::{Relation, Sense};
pub use model::SddpModel;
pub use policy_graph::{ModelDefinition, ModelMetadata, PolicyGraph};
pub use subproblem::{StateHandle, SubproblemBuilder};
