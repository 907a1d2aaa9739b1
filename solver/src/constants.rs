//! Numerical tolerances and defaults shared across the engine.
//!
//! The simplex tolerances are tuned for the dense tableau in [`crate::simplex`];
//! the probability tolerance is what [`crate::policy_graph`] accepts when
//! checking that a transition row sums to one.

/// Largest |row sum − 1| accepted for a transition-matrix row.
pub const PROBABILITY_TOLERANCE: f64 = 1e-6;

/// Entries below this magnitude are treated as zero when choosing a pivot.
pub const PIVOT_TOLERANCE: f64 = 1e-9;

/// Reduced costs above −OPTIMALITY_TOLERANCE count as non-improving.
pub const OPTIMALITY_TOLERANCE: f64 = 1e-9;

/// Phase-1 objective above this means the program is infeasible.
pub const FEASIBILITY_TOLERANCE: f64 = 1e-7;

/// Consecutive degenerate pivots before switching from Dantzig to Bland pricing.
pub const DEGENERATE_PIVOT_LIMIT: usize = 50;

/// Hard cap on simplex pivots per phase.
pub const MAX_SIMPLEX_PIVOTS: usize = 50_000;

/// Magnitude of the epigraph bound when a model does not set one:
/// `-1e6` when minimizing, `+1e6` when maximizing.
pub const DEFAULT_OBJECTIVE_BOUND: f64 = 1e6;

/// z-score of a two-sided 95% confidence interval.
pub const Z_SCORE_95: f64 = 1.96;

/// Two cuts whose coefficients and intercept differ by less than this are equal.
pub const CUT_EQUALITY_TOLERANCE: f64 = 1e-9;

/// Seed stride between iterations so forward-pass RNG streams never overlap.
pub const SEED_STRIDE: u64 = 1 << 20;
