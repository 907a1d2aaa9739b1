//! Error types for the SDDP engine.
//!
//! Taxonomy:
//! - Model construction: the policy graph or a subproblem is malformed. Raised
//!   while building, never while iterating.
//! - Solve failures: an LP came back infeasible or unbounded during a pass.
//!   Fatal for the run; carries stage, markov state and noise so the offending
//!   subproblem can be found.
//! - Everything else (risk-measure parameters, options, I/O, cut import).
//!
//! A run that stops on an iteration or time limit is not an error; see
//! [`crate::convergence::SolveStatus`].

use std::fmt;

use thiserror::Error;

use crate::lp::LpFailure;

/// Construction-time failures of the policy graph and its subproblems.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ModelError {
    #[error("model must have at least one stage")]
    NoStages,

    #[error("expected {expected} transition matrices, got {actual}")]
    TransitionCount { expected: usize, actual: usize },

    #[error("transition matrix into stage {stage} has {actual} rows, expected {expected}")]
    TransitionRows {
        stage: usize,
        expected: usize,
        actual: usize,
    },

    #[error("transition matrix into stage {stage}, row {row} has {actual} columns, expected {expected}")]
    TransitionColumns {
        stage: usize,
        row: usize,
        expected: usize,
        actual: usize,
    },

    #[error("transition matrix into stage {stage}, row {row} has invalid probability {value}")]
    InvalidProbability { stage: usize, row: usize, value: f64 },

    #[error("transition matrix into stage {stage}, row {row} sums to {sum} (expected 1 or an all-zero row)")]
    RowSum { stage: usize, row: usize, sum: f64 },

    #[error("stage {stage} has no reachable markov state")]
    NoReachableState { stage: usize },

    #[error("markov state {markov_state} of stage {stage} is reachable but has no successor")]
    DeadEnd { stage: usize, markov_state: usize },

    #[error("stage {stage}, markov state {markov_state}: state {state} has bounds [{lower}, {upper}] and initial value {initial}")]
    StateBounds {
        stage: usize,
        markov_state: usize,
        state: usize,
        lower: f64,
        upper: f64,
        initial: f64,
    },

    #[error("stage {stage}, markov state {markov_state}: no stage objective was set")]
    MissingObjective { stage: usize, markov_state: usize },

    #[error("stage {stage}, markov state {markov_state}: {what} has dimension {actual}, expected {expected}")]
    DimensionMismatch {
        stage: usize,
        markov_state: usize,
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("stage {stage}, markov state {markov_state}: noise support has {actual} realizations, expected {expected}")]
    NoiseSupport {
        stage: usize,
        markov_state: usize,
        expected: usize,
        actual: usize,
    },

    #[error("stage {stage}, markov state {markov_state}: invalid noise probabilities ({reason})")]
    NoiseProbability {
        stage: usize,
        markov_state: usize,
        reason: String,
    },

    #[error("stage {stage}, markov state {markov_state}: column {column} does not exist")]
    UnknownColumn {
        stage: usize,
        markov_state: usize,
        column: usize,
    },
}

/// Which pass a failing solve belonged to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassKind {
    Forward,
    Backward,
    Bound,
    Simulation,
}

impl fmt::Display for PassKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PassKind::Forward => "forward pass",
            PassKind::Backward => "backward pass",
            PassKind::Bound => "bound evaluation",
            PassKind::Simulation => "simulation",
        };
        f.write_str(name)
    }
}

/// Top-level error type.
#[derive(Debug, Error)]
pub enum SddpError {
    #[error("invalid model: {0}")]
    Model(#[from] ModelError),

    #[error("{pass}: subproblem at stage {stage}, markov state {markov_state}, noise {noise} is {failure}")]
    Solve {
        pass: PassKind,
        stage: usize,
        markov_state: usize,
        noise: usize,
        failure: LpFailure,
    },

    #[error("invalid risk measure: {0}")]
    InvalidRiskMeasure(String),

    #[error("invalid solve options: {0}")]
    InvalidOptions(String),

    #[error("cannot import cuts: {0}")]
    CutImport(String),

    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SddpError {
    /// Create an IO error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// True for errors raised while building the policy graph.
    pub fn is_model_error(&self) -> bool {
        matches!(self, Self::Model(_))
    }
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, SddpError>;
