//! Built-in LP backend: two-phase primal simplex on a dense tableau.
//!
//! ## Standard form
//!
//! Every column is rewritten over non-negative variables:
//!
//! | Bounds | Substitution | Extra row |
//! |--------|--------------|-----------|
//! | `[l, u]`, `l` finite | `x = l + x'` | `x' <= u − l` if `u` finite |
//! | `(−∞, u]` | `x = u − x'` | — |
//! | `(−∞, ∞)` | `x = x⁺ − x⁻` | — |
//!
//! Row `[L, U]` becomes an equality when `L == U`, otherwise one `>=` row and/or
//! one `<=` row with a surplus/slack column. Rows with a negative right-hand
//! side are negated so the starting basis (slacks where possible, artificials
//! elsewhere) is feasible.
//!
//! ## Duals
//!
//! After phase 2 the duals are recovered by solving `Bᵀy = c_B` against the
//! untouched standard-form matrix, then mapped back through the row negations
//! and the objective sense. The result is `∂objective/∂bound` for each
//! original row, which is exactly what a Benders cut needs.
//!
//! Pricing is Dantzig (most negative reduced cost). After
//! [`DEGENERATE_PIVOT_LIMIT`] consecutive degenerate pivots the phase switches
//! to Bland's rule, which cannot cycle.

use crate::constants::{
    DEGENERATE_PIVOT_LIMIT, FEASIBILITY_TOLERANCE, MAX_SIMPLEX_PIVOTS, OPTIMALITY_TOLERANCE,
    PIVOT_TOLERANCE,
};
use crate::lp::{LinearProgram, LpFailure, LpSolution, LpSolver, Sense};

/// Dense two-phase simplex. Suitable for the small stage subproblems SDDP
/// produces; swap in another [`LpSolver`] for large models.
#[derive(Debug, Clone)]
pub struct DenseSimplex {
    max_pivots: usize,
}

impl Default for DenseSimplex {
    fn default() -> Self {
        Self::new()
    }
}

impl DenseSimplex {
    pub fn new() -> Self {
        Self {
            max_pivots: MAX_SIMPLEX_PIVOTS,
        }
    }

    /// Override the per-phase pivot cap.
    pub fn with_max_pivots(max_pivots: usize) -> Self {
        Self { max_pivots }
    }
}

impl LpSolver for DenseSimplex {
    fn name(&self) -> &'static str {
        "dense-simplex"
    }

    fn solve(&self, lp: &LinearProgram) -> Result<LpSolution, LpFailure> {
        let form = StandardForm::build(lp)?;
        let mut tableau = Tableau::new(&form);

        if tableau.num_artificial > 0 {
            let phase1_cost: Vec<f64> = (0..tableau.cols)
                .map(|j| if tableau.is_artificial(j) { 1.0 } else { 0.0 })
                .collect();
            tableau.optimize(&phase1_cost, |_| true, self.max_pivots)?;
            let infeasibility = tableau.objective(&phase1_cost);
            let scale = 1.0 + form.rhs.iter().fold(0.0f64, |m, b| m.max(b.abs()));
            if infeasibility > FEASIBILITY_TOLERANCE * scale {
                return Err(LpFailure::Infeasible);
            }
            tableau.drive_out_artificials();
        }

        let mut phase2_cost = vec![0.0; tableau.cols];
        phase2_cost[..form.cost.len()].copy_from_slice(&form.cost);
        let first_artificial = tableau.first_artificial;
        tableau.optimize(&phase2_cost, |j| j < first_artificial, self.max_pivots)?;

        let std_primal = tableau.primal();
        let primal: Vec<f64> = form
            .mappings
            .iter()
            .map(|m| match *m {
                ColumnMap::Shifted { col, offset } => offset + std_primal[col],
                ColumnMap::Mirrored { col, offset } => offset - std_primal[col],
                ColumnMap::Split { pos, neg } => std_primal[pos] - std_primal[neg],
            })
            .collect();

        let y = tableau.duals(&form.matrix, &phase2_cost);
        let sign = sense_sign(lp.sense);
        let mut duals = vec![0.0; lp.num_rows()];
        for (k, origin) in form.row_origin.iter().enumerate() {
            if let Some(r) = origin {
                duals[*r] += sign * form.flip[k] * y[k];
            }
        }

        Ok(LpSolution {
            objective: lp.objective_value(&primal),
            primal,
            duals,
        })
    }
}

#[inline]
fn sense_sign(sense: Sense) -> f64 {
    match sense {
        Sense::Minimize => 1.0,
        Sense::Maximize => -1.0,
    }
}

// ── Standard form ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
enum ColumnMap {
    Shifted { col: usize, offset: f64 },
    Mirrored { col: usize, offset: f64 },
    Split { pos: usize, neg: usize },
}

impl ColumnMap {
    /// (std column, coefficient) pairs and constant offset of `x`.
    fn expand(&self, coef: f64, out: &mut [f64]) -> f64 {
        match *self {
            ColumnMap::Shifted { col, offset } => {
                out[col] += coef;
                coef * offset
            }
            ColumnMap::Mirrored { col, offset } => {
                out[col] -= coef;
                coef * offset
            }
            ColumnMap::Split { pos, neg } => {
                out[pos] += coef;
                out[neg] -= coef;
                0.0
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RowKind {
    LessEqual,
    GreaterEqual,
    Equal,
}

/// `min cᵀx  s.t.  Ax = b, x >= 0` with slack and artificial columns included.
struct StandardForm {
    mappings: Vec<ColumnMap>,
    /// Minimization cost of the structural (non-slack) columns.
    cost: Vec<f64>,
    /// Dense rows over all columns (structural, slack, artificial), after negation.
    matrix: Vec<Vec<f64>>,
    rhs: Vec<f64>,
    /// −1 where a row was negated to make its rhs non-negative.
    flip: Vec<f64>,
    row_origin: Vec<Option<usize>>,
    /// Column that starts in the basis for each row.
    initial_basis: Vec<usize>,
    num_structural: usize,
    num_slack: usize,
    num_artificial: usize,
}

impl StandardForm {
    fn build(lp: &LinearProgram) -> Result<Self, LpFailure> {
        let sign = sense_sign(lp.sense);

        let mut mappings = Vec::with_capacity(lp.num_columns());
        let mut cost = Vec::new();
        let mut bound_rows: Vec<(usize, f64)> = Vec::new();
        for c in lp.columns() {
            if c.lower > c.upper + FEASIBILITY_TOLERANCE {
                return Err(LpFailure::Infeasible);
            }
            let mc = sign * c.cost;
            if c.lower.is_finite() {
                let col = cost.len();
                cost.push(mc);
                if c.upper.is_finite() {
                    bound_rows.push((col, (c.upper - c.lower).max(0.0)));
                }
                mappings.push(ColumnMap::Shifted {
                    col,
                    offset: c.lower,
                });
            } else if c.upper.is_finite() {
                let col = cost.len();
                cost.push(-mc);
                mappings.push(ColumnMap::Mirrored {
                    col,
                    offset: c.upper,
                });
            } else {
                let pos = cost.len();
                cost.push(mc);
                cost.push(-mc);
                mappings.push(ColumnMap::Split { pos, neg: pos + 1 });
            }
        }
        let num_structural = cost.len();

        // (coefficients over structural columns, kind, rhs, origin)
        let mut raw: Vec<(Vec<f64>, RowKind, f64, Option<usize>)> = Vec::new();
        for (r, row) in lp.rows().iter().enumerate() {
            if row.lower > row.upper + FEASIBILITY_TOLERANCE {
                return Err(LpFailure::Infeasible);
            }
            let mut coefs = vec![0.0; num_structural];
            let mut shift = 0.0;
            for &(j, a) in &row.terms {
                shift += mappings[j].expand(a, &mut coefs);
            }
            let lower = row.lower.is_finite();
            let upper = row.upper.is_finite();
            if lower && upper && (row.upper - row.lower).abs() <= FEASIBILITY_TOLERANCE {
                raw.push((coefs, RowKind::Equal, row.lower - shift, Some(r)));
                continue;
            }
            if lower {
                raw.push((coefs.clone(), RowKind::GreaterEqual, row.lower - shift, Some(r)));
            }
            if upper {
                raw.push((coefs, RowKind::LessEqual, row.upper - shift, Some(r)));
            }
        }
        for (col, width) in bound_rows {
            let mut coefs = vec![0.0; num_structural];
            coefs[col] = 1.0;
            raw.push((coefs, RowKind::LessEqual, width, None));
        }

        let num_slack = raw
            .iter()
            .filter(|(_, kind, _, _)| *kind != RowKind::Equal)
            .count();

        // Decide which rows need an artificial column after negation.
        let mut needs_artificial = Vec::with_capacity(raw.len());
        for (_, kind, rhs, _) in &raw {
            let flipped = *rhs < 0.0;
            let slack_positive = match kind {
                RowKind::LessEqual => !flipped,
                RowKind::GreaterEqual => flipped,
                RowKind::Equal => false,
            };
            needs_artificial.push(!slack_positive);
        }
        let num_artificial = needs_artificial.iter().filter(|&&a| a).count();
        let total = num_structural + num_slack + num_artificial;

        let mut matrix = Vec::with_capacity(raw.len());
        let mut rhs = Vec::with_capacity(raw.len());
        let mut flip = Vec::with_capacity(raw.len());
        let mut row_origin = Vec::with_capacity(raw.len());
        let mut initial_basis = Vec::with_capacity(raw.len());
        let mut next_slack = num_structural;
        let mut next_artificial = num_structural + num_slack;
        for (k, (coefs, kind, b, origin)) in raw.into_iter().enumerate() {
            let mut dense = vec![0.0; total];
            dense[..num_structural].copy_from_slice(&coefs);
            let slack = match kind {
                RowKind::LessEqual => Some(1.0),
                RowKind::GreaterEqual => Some(-1.0),
                RowKind::Equal => None,
            };
            let slack_col = slack.map(|s| {
                dense[next_slack] = s;
                next_slack += 1;
                next_slack - 1
            });
            let f = if b < 0.0 { -1.0 } else { 1.0 };
            if f < 0.0 {
                for v in dense.iter_mut() {
                    *v = -*v;
                }
            }
            if needs_artificial[k] {
                dense[next_artificial] = 1.0;
                initial_basis.push(next_artificial);
                next_artificial += 1;
            } else if let Some(col) = slack_col {
                initial_basis.push(col);
            }
            matrix.push(dense);
            rhs.push(f * b);
            flip.push(f);
            row_origin.push(origin);
        }

        Ok(Self {
            mappings,
            cost,
            matrix,
            rhs,
            flip,
            row_origin,
            initial_basis,
            num_structural,
            num_slack,
            num_artificial,
        })
    }
}

// ── Tableau ────────────────────────────────────────────────────────────────

struct Tableau {
    rows: usize,
    cols: usize,
    /// Row-major `rows × (cols + 1)`; last entry of each row is the rhs.
    data: Vec<f64>,
    basis: Vec<usize>,
    first_artificial: usize,
    num_artificial: usize,
}

impl Tableau {
    fn new(form: &StandardForm) -> Self {
        let rows = form.matrix.len();
        let cols = form.num_structural + form.num_slack + form.num_artificial;
        let width = cols + 1;
        let mut data = vec![0.0; rows * width];
        for (i, row) in form.matrix.iter().enumerate() {
            data[i * width..i * width + cols].copy_from_slice(row);
            data[i * width + cols] = form.rhs[i];
        }
        Self {
            rows,
            cols,
            data,
            basis: form.initial_basis.clone(),
            first_artificial: form.num_structural + form.num_slack,
            num_artificial: form.num_artificial,
        }
    }

    #[inline]
    fn is_artificial(&self, j: usize) -> bool {
        j >= self.first_artificial
    }

    #[inline]
    fn at(&self, i: usize, j: usize) -> f64 {
        self.data[i * (self.cols + 1) + j]
    }

    #[inline]
    fn rhs(&self, i: usize) -> f64 {
        self.data[i * (self.cols + 1) + self.cols]
    }

    fn objective(&self, cost: &[f64]) -> f64 {
        (0..self.rows).map(|i| cost[self.basis[i]] * self.rhs(i)).sum()
    }

    fn reduced_costs(&self, cost: &[f64]) -> Vec<f64> {
        let mut d = cost.to_vec();
        for i in 0..self.rows {
            let cb = cost[self.basis[i]];
            if cb == 0.0 {
                continue;
            }
            for (j, dj) in d.iter_mut().enumerate() {
                *dj -= cb * self.at(i, j);
            }
        }
        d
    }

    fn pivot(&mut self, r: usize, q: usize, d: &mut [f64]) {
        let width = self.cols + 1;
        let p = self.at(r, q);
        for v in &mut self.data[r * width..(r + 1) * width] {
            *v /= p;
        }
        self.data[r * width + q] = 1.0;
        let pivot_row: Vec<f64> = self.data[r * width..(r + 1) * width].to_vec();
        for i in 0..self.rows {
            if i == r {
                continue;
            }
            let f = self.data[i * width + q];
            if f == 0.0 {
                continue;
            }
            let row = &mut self.data[i * width..(i + 1) * width];
            for (v, pv) in row.iter_mut().zip(&pivot_row) {
                *v -= f * pv;
            }
            row[q] = 0.0;
            if row[self.cols] < 0.0 && row[self.cols] > -PIVOT_TOLERANCE {
                row[self.cols] = 0.0;
            }
        }
        let dq = d[q];
        if dq != 0.0 {
            for (dj, pv) in d.iter_mut().zip(&pivot_row) {
                *dj -= dq * pv;
            }
            d[q] = 0.0;
        }
        self.basis[r] = q;
    }

    fn optimize(
        &mut self,
        cost: &[f64],
        allowed: impl Fn(usize) -> bool,
        max_pivots: usize,
    ) -> Result<(), LpFailure> {
        let mut d = self.reduced_costs(cost);
        let mut is_basic = vec![false; self.cols];
        for &b in &self.basis {
            is_basic[b] = true;
        }
        let mut bland = false;
        let mut degenerate_run = 0usize;

        for _ in 0..max_pivots {
            let mut entering = None;
            let mut best = -OPTIMALITY_TOLERANCE;
            for j in 0..self.cols {
                if is_basic[j] || !allowed(j) {
                    continue;
                }
                if bland {
                    if d[j] < -OPTIMALITY_TOLERANCE {
                        entering = Some(j);
                        break;
                    }
                } else if d[j] < best {
                    best = d[j];
                    entering = Some(j);
                }
            }
            let Some(q) = entering else {
                return Ok(());
            };

            let mut leaving: Option<usize> = None;
            let mut best_ratio = f64::INFINITY;
            for i in 0..self.rows {
                let a = self.at(i, q);
                if a <= PIVOT_TOLERANCE {
                    continue;
                }
                let ratio = self.rhs(i).max(0.0) / a;
                let better = match leaving {
                    None => true,
                    Some(l) => {
                        ratio < best_ratio - PIVOT_TOLERANCE
                            || (ratio <= best_ratio + PIVOT_TOLERANCE
                                && self.basis[i] < self.basis[l])
                    }
                };
                if better {
                    best_ratio = ratio;
                    leaving = Some(i);
                }
            }
            let Some(r) = leaving else {
                return Err(LpFailure::Unbounded);
            };

            if best_ratio <= PIVOT_TOLERANCE {
                degenerate_run += 1;
                if degenerate_run > DEGENERATE_PIVOT_LIMIT {
                    bland = true;
                }
            } else {
                degenerate_run = 0;
            }

            is_basic[self.basis[r]] = false;
            is_basic[q] = true;
            self.pivot(r, q, &mut d);
        }
        Err(LpFailure::IterationLimit)
    }

    /// Pivot zero-level artificials out of the basis after phase 1. Rows where
    /// no structural or slack column has a usable entry are redundant and keep
    /// their artificial at zero.
    fn drive_out_artificials(&mut self) {
        let mut scratch = vec![0.0; self.cols];
        for i in 0..self.rows {
            if !self.is_artificial(self.basis[i]) {
                continue;
            }
            let candidate = (0..self.first_artificial)
                .filter(|j| !self.basis.contains(j))
                .max_by(|&a, &b| self.at(i, a).abs().total_cmp(&self.at(i, b).abs()));
            if let Some(q) = candidate {
                if self.at(i, q).abs() > PIVOT_TOLERANCE {
                    self.pivot(i, q, &mut scratch);
                }
            }
        }
    }

    fn primal(&self) -> Vec<f64> {
        let mut x = vec![0.0; self.cols];
        for i in 0..self.rows {
            x[self.basis[i]] = self.rhs(i).max(0.0);
        }
        x
    }

    /// Solve `Bᵀy = c_B` with partial-pivot Gaussian elimination.
    fn duals(&self, matrix: &[Vec<f64>], cost: &[f64]) -> Vec<f64> {
        let m = self.rows;
        // a[i][k] = B[k][i] = matrix[k][basis[i]]
        let mut a: Vec<Vec<f64>> = (0..m)
            .map(|i| (0..m).map(|k| matrix[k][self.basis[i]]).collect())
            .collect();
        let mut rhs: Vec<f64> = (0..m).map(|i| cost[self.basis[i]]).collect();

        for col in 0..m {
            let Some(p) = (col..m).max_by(|&x, &y| a[x][col].abs().total_cmp(&a[y][col].abs()))
            else {
                break;
            };
            if a[p][col].abs() < 1e-12 {
                continue;
            }
            a.swap(col, p);
            rhs.swap(col, p);
            for i in (col + 1)..m {
                let f = a[i][col] / a[col][col];
                if f == 0.0 {
                    continue;
                }
                for k in col..m {
                    a[i][k] -= f * a[col][k];
                }
                rhs[i] -= f * rhs[col];
            }
        }
        let mut y = vec![0.0; m];
        for i in (0..m).rev() {
            if a[i][i].abs() < 1e-12 {
                continue;
            }
            let s: f64 = ((i + 1)..m).map(|k| a[i][k] * y[k]).sum();
            y[i] = (rhs[i] - s) / a[i][i];
        }
        y
    }
}
