//! Linear-program representation and the solver seam.
//!
//! A [`LinearProgram`] is built once per subproblem and then mutated in place
//! between solves: incoming-state rows get new right-hand sides, noise rows get
//! the sampled realization, and cut rows are appended (or truncated and
//! re-appended after pruning). Any backend implementing [`LpSolver`] can be
//! plugged into the engine; [`crate::simplex::DenseSimplex`] is the built-in one.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Objective sense of a program (and of a whole model).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sense {
    Minimize,
    Maximize,
}

/// Comparison used by constraint builders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Relation {
    LessEqual,
    GreaterEqual,
    Equal,
}

impl Relation {
    /// Row bounds `[lower, upper]` that express `terms <relation> rhs`.
    pub fn bounds(self, rhs: f64) -> (f64, f64) {
        match self {
            Relation::LessEqual => (f64::NEG_INFINITY, rhs),
            Relation::GreaterEqual => (rhs, f64::INFINITY),
            Relation::Equal => (rhs, rhs),
        }
    }
}

/// One decision variable.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub cost: f64,
    pub lower: f64,
    pub upper: f64,
}

/// One linear constraint `lower <= Σ coef·x <= upper`.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub terms: Vec<(usize, f64)>,
    pub lower: f64,
    pub upper: f64,
}

/// Mutable linear program.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearProgram {
    pub sense: Sense,
    pub offset: f64,
    columns: Vec<Column>,
    rows: Vec<Row>,
}

impl LinearProgram {
    pub fn new(sense: Sense) -> Self {
        Self {
            sense,
            offset: 0.0,
            columns: Vec::new(),
            rows: Vec::new(),
        }
    }

    /// Add a column with objective coefficient `cost`; returns its index.
    pub fn add_column(&mut self, cost: f64, lower: f64, upper: f64) -> usize {
        self.columns.push(Column { cost, lower, upper });
        self.columns.len() - 1
    }

    /// Add a row `lower <= Σ terms <= upper`; returns its index.
    pub fn add_row(&mut self, terms: &[(usize, f64)], lower: f64, upper: f64) -> usize {
        self.rows.push(Row {
            terms: terms.to_vec(),
            lower,
            upper,
        });
        self.rows.len() - 1
    }

    pub fn set_row_bounds(&mut self, row: usize, lower: f64, upper: f64) {
        let r = &mut self.rows[row];
        r.lower = lower;
        r.upper = upper;
    }

    /// Shift whichever side of `row` is finite to `rhs`. Equality rows move both.
    pub fn set_row_rhs(&mut self, row: usize, rhs: f64) {
        let r = &mut self.rows[row];
        let lower_finite = r.lower.is_finite();
        let upper_finite = r.upper.is_finite();
        if lower_finite {
            r.lower = rhs;
        }
        if upper_finite {
            r.upper = rhs;
        }
    }

    pub fn set_column_bounds(&mut self, column: usize, lower: f64, upper: f64) {
        let c = &mut self.columns[column];
        c.lower = lower;
        c.upper = upper;
    }

    pub fn set_cost(&mut self, column: usize, cost: f64) {
        self.columns[column].cost = cost;
    }

    /// Drop every row with index `>= len`.
    pub fn truncate_rows(&mut self, len: usize) {
        self.rows.truncate(len);
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    /// Objective value of a primal point, offset included.
    pub fn objective_value(&self, primal: &[f64]) -> f64 {
        self.offset
            + self
                .columns
                .iter()
                .zip(primal)
                .map(|(c, x)| c.cost * x)
                .sum::<f64>()
    }
}

/// Optimal solution returned by a backend.
#[derive(Debug, Clone, PartialEq)]
pub struct LpSolution {
    /// Objective value in the program's own sense, offset included.
    pub objective: f64,
    /// One value per column.
    pub primal: Vec<f64>,
    /// One value per row: the derivative of `objective` with respect to the
    /// active bound of that row. Zero for inactive rows.
    pub duals: Vec<f64>,
}

/// Why a backend did not return an optimal solution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LpFailure {
    Infeasible,
    Unbounded,
    IterationLimit,
}

impl fmt::Display for LpFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LpFailure::Infeasible => "infeasible",
            LpFailure::Unbounded => "unbounded",
            LpFailure::IterationLimit => "stopped at the iteration limit",
        };
        f.write_str(name)
    }
}

/// Linear-programming backend.
///
/// Implementations must be thread-safe: rayon workers call `solve` on
/// different subproblems at the same time.
pub trait LpSolver: Send + Sync {
    /// Backend name for logging.
    fn name(&self) -> &'static str;

    /// Solve `lp` to optimality.
    fn solve(&self, lp: &LinearProgram) -> Result<LpSolution, LpFailure>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_row_rhs_moves_only_finite_sides() {
        let mut lp = LinearProgram::new(Sense::Minimize);
        let x = lp.add_column(1.0, 0.0, 10.0);
        let ge = lp.add_row(&[(x, 1.0)], 2.0, f64::INFINITY);
        let eq = lp.add_row(&[(x, 1.0)], 3.0, 3.0);

        lp.set_row_rhs(ge, 4.0);
        lp.set_row_rhs(eq, 5.0);

        assert_eq!(lp.rows()[ge].lower, 4.0);
        assert!(lp.rows()[ge].upper.is_infinite());
        assert_eq!((lp.rows()[eq].lower, lp.rows()[eq].upper), (5.0, 5.0));
    }

    #[test]
    fn truncate_rows_keeps_prefix() {
        let mut lp = LinearProgram::new(Sense::Maximize);
        let x = lp.add_column(1.0, 0.0, 1.0);
        for k in 0..5 {
            lp.add_row(&[(x, 1.0)], f64::NEG_INFINITY, k as f64);
        }
        lp.truncate_rows(2);
        assert_eq!(lp.num_rows(), 2);
        assert_eq!(lp.rows()[1].upper, 1.0);
    }

    #[test]
    fn objective_value_includes_offset() {
        let mut lp = LinearProgram::new(Sense::Minimize);
        lp.offset = 2.5;
        lp.add_column(3.0, 0.0, 1.0);
        lp.add_column(-1.0, 0.0, 1.0);
        assert_eq!(lp.objective_value(&[1.0, 2.0]), 3.5);
    }
}
