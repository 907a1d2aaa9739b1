//! Property-based tests for the engine's invariants.

use proptest::prelude::*;
use rand::rngs::SmallRng;
use rand::SeedableRng;

use sddp::backward_pass::{backward_pass, root_bound};
use sddp::forward_pass::forward_pass;
use sddp::lp::{LinearProgram, LpSolver};
use sddp::risk::{eavar, AverageValueAtRisk, Expectation, RiskMeasure, WorstCase};
use sddp::simplex::DenseSimplex;
use sddp::{
    Cut, CutOracleKind, ModelDefinition, ModelError, PolicyGraph, Relation, SddpModel, Sense,
    SolveOptions, SubproblemBuilder,
};

const PRICES: [f64; 3] = [1.0, 3.0, 2.0];
const DEMAND: [f64; 2] = [2.0, 6.0];
const HOLDING: f64 = 0.5;
const CAPACITY: f64 = 20.0;
const INITIAL_STOCK: f64 = 5.0;

/// Three-stage inventory: buy at a stage price, hold at a cost, meet a random demand.
fn inventory(b: &mut SubproblemBuilder) -> Result<(), ModelError> {
    let stock = b.add_state(0.0, CAPACITY, INITIAL_STOCK)?;
    let buy = b.add_variable(0.0, f64::INFINITY);
    let negated: Vec<f64> = DEMAND.iter().map(|d| -d).collect();
    b.add_rhs_noise(
        &[(stock.outgoing, 1.0), (stock.incoming, -1.0), (buy, -1.0)],
        Relation::Equal,
        &negated,
    )?;
    b.stage_objective(&[(buy, PRICES[b.stage()]), (stock.outgoing, HOLDING)], 0.0)
}

fn inventory_graph(oracle: CutOracleKind) -> PolicyGraph {
    let def = ModelDefinition::new(3, Sense::Minimize)
        .objective_bound(0.0)
        .cut_oracle(oracle);
    PolicyGraph::build(def, inventory).unwrap()
}

/// Expected cost of stages `stage..` from incoming stock `x`, by solving the
/// extensive form of the remaining scenario tree.
fn true_value(stage: usize, x: f64) -> f64 {
    fn grow(lp: &mut LinearProgram, stage: usize, parent: Option<usize>, x: f64, prob: f64) {
        for &d in &DEMAND {
            let p = prob / DEMAND.len() as f64;
            let buy = lp.add_column(p * PRICES[stage], 0.0, f64::INFINITY);
            let out = lp.add_column(p * HOLDING, 0.0, CAPACITY);
            match parent {
                Some(par) => lp.add_row(&[(out, 1.0), (par, -1.0), (buy, -1.0)], -d, -d),
                None => lp.add_row(&[(out, 1.0), (buy, -1.0)], x - d, x - d),
            };
            if stage + 1 < PRICES.len() {
                grow(lp, stage + 1, Some(out), x, p);
            }
        }
    }
    let mut lp = LinearProgram::new(Sense::Minimize);
    grow(&mut lp, stage, None, x, 1.0);
    DenseSimplex::new().solve(&lp).unwrap().objective
}

/// Prices scale with the markov state: regime 1 is twice as expensive.
fn regime_inventory(b: &mut SubproblemBuilder) -> Result<(), ModelError> {
    let stock = b.add_state(0.0, CAPACITY, INITIAL_STOCK)?;
    let buy = b.add_variable(0.0, f64::INFINITY);
    let negated: Vec<f64> = DEMAND.iter().map(|d| -d).collect();
    b.add_rhs_noise(
        &[(stock.outgoing, 1.0), (stock.incoming, -1.0), (buy, -1.0)],
        Relation::Equal,
        &negated,
    )?;
    let price = PRICES[b.stage()] * (1.0 + b.markov_state() as f64);
    b.stage_objective(&[(buy, price), (stock.outgoing, HOLDING)], 0.0)
}

fn regime_chain() -> Vec<Vec<Vec<f64>>> {
    vec![
        vec![vec![0.5, 0.5]],
        vec![vec![0.7, 0.3], vec![0.2, 0.8]],
        vec![vec![0.6, 0.4], vec![0.1, 0.9]],
    ]
}

/// Cost of the last stage in regime `regime` from stock `x` under demand `d`:
/// buy the shortfall, hold the rest.
fn last_stage_cost(regime: usize, x: f64, d: f64) -> f64 {
    let price = PRICES[2] * (1.0 + regime as f64);
    price * (d - x).max(0.0) + HOLDING * (x - d).max(0.0)
}

fn train(graph: &PolicyGraph, seed: u64, iterations: usize) -> Vec<f64> {
    let solver = DenseSimplex::new();
    let mut rng = SmallRng::seed_from_u64(seed);
    let mut bounds = vec![root_bound(graph, &solver, &Expectation).unwrap()];
    for _ in 0..iterations {
        let t = forward_pass(graph, &solver, &mut rng).unwrap();
        backward_pass(graph, &solver, &Expectation, &t).unwrap();
        bounds.push(root_bound(graph, &solver, &Expectation).unwrap());
    }
    bounds
}

/// Probability vectors with some zero entries.
fn distribution_strategy() -> impl Strategy<Value = Vec<f64>> {
    prop::collection::vec(prop_oneof![Just(0.0), 0.01..1.0f64], 1..8).prop_filter_map(
        "all-zero distribution",
        |w| {
            let total: f64 = w.iter().sum();
            (total > 0.0).then(|| w.iter().map(|x| x / total).collect())
        },
    )
}

fn cut_strategy() -> impl Strategy<Value = Cut> {
    (-10.0..10.0f64, -3.0..3.0f64).prop_map(|(intercept, slope)| Cut {
        intercept,
        coefficients: vec![slope],
        sample: vec![0.0],
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    // 1. Risk-adjusted weights are probabilities supported on the nominal support
    #[test]
    fn risk_weights_are_probabilities(
        nominal in distribution_strategy(),
        seed in any::<u64>(),
        beta in 0.05..1.0f64,
        lambda in 0.0..1.0f64,
    ) {
        let mut rng = SmallRng::seed_from_u64(seed);
        let objectives: Vec<f64> = nominal
            .iter()
            .map(|_| rand::Rng::random_range(&mut rng, -50.0..50.0))
            .collect();
        let measures: Vec<Box<dyn RiskMeasure>> = vec![
            Box::new(Expectation),
            Box::new(WorstCase),
            Box::new(AverageValueAtRisk::new(beta).unwrap()),
            Box::new(eavar(lambda, beta).unwrap()),
        ];
        let expected: f64 = nominal.iter().zip(&objectives).map(|(p, z)| p * z).sum();
        for m in &measures {
            for sense in [Sense::Minimize, Sense::Maximize] {
                let q = m.adjust(&nominal, &objectives, sense);
                prop_assert_eq!(q.len(), nominal.len());
                prop_assert!((q.iter().sum::<f64>() - 1.0).abs() < 1e-9, "{:?}: {:?}", m, q);
                for (qi, pi) in q.iter().zip(&nominal) {
                    prop_assert!(*qi >= 0.0);
                    if *pi == 0.0 {
                        prop_assert_eq!(*qi, 0.0);
                    }
                }
                // Risk aversion never looks better than the expectation.
                let adjusted: f64 = q.iter().zip(&objectives).map(|(q, z)| q * z).sum();
                match sense {
                    Sense::Minimize => prop_assert!(adjusted >= expected - 1e-9),
                    Sense::Maximize => prop_assert!(adjusted <= expected + 1e-9),
                }
            }
        }
    }

    // 2. AV@R never scales a probability by more than 1/β
    #[test]
    fn avar_weights_are_bounded(nominal in distribution_strategy(), beta in 0.05..1.0f64) {
        let objectives: Vec<f64> = (0..nominal.len()).map(|i| (i * 7 % 5) as f64).collect();
        let q = AverageValueAtRisk::new(beta).unwrap().adjust(&nominal, &objectives, Sense::Minimize);
        for (qi, pi) in q.iter().zip(&nominal) {
            prop_assert!(*qi <= pi / beta + 1e-12);
        }
    }

    // 3. The simplex solves fractional covering problems greedily
    #[test]
    fn simplex_matches_greedy_covering(
        items in prop::collection::vec((0.1..10.0f64, 0.5..5.0f64), 1..6),
        fraction in 0.0..1.0f64,
    ) {
        let capacity: f64 = items.iter().map(|(_, u)| u).sum();
        let demand = fraction * capacity;
        let mut lp = LinearProgram::new(Sense::Minimize);
        let cols: Vec<usize> = items.iter().map(|&(c, u)| lp.add_column(c, 0.0, u)).collect();
        let terms: Vec<(usize, f64)> = cols.iter().map(|&j| (j, 1.0)).collect();
        lp.add_row(&terms, demand, f64::INFINITY);
        let sol = DenseSimplex::new().solve(&lp).unwrap();

        let mut sorted = items.clone();
        sorted.sort_by(|a, b| a.0.total_cmp(&b.0));
        let mut remaining = demand;
        let mut greedy = 0.0;
        for (c, u) in sorted {
            let take = remaining.min(u);
            greedy += c * take;
            remaining -= take;
        }
        prop_assert!((sol.objective - greedy).abs() < 1e-7, "lp={} greedy={}", sol.objective, greedy);
    }

    // 4. Pruning dominated cuts leaves every solve unchanged
    #[test]
    fn pruning_is_idempotent(
        cuts in prop::collection::vec(cut_strategy(), 1..10),
    ) {
        let solver = DenseSimplex::new();
        let mut bounds = Vec::new();
        for kind in [CutOracleKind::Default, CutOracleKind::Dominance] {
            let def = ModelDefinition::new(2, Sense::Minimize)
                .objective_bound(-100.0)
                .cut_oracle(kind);
            let graph = PolicyGraph::build(def, |b| {
                let x = b.add_state(0.0, 10.0, 4.0)?;
                b.add_constraint(&[(x.outgoing, 1.0), (x.incoming, -1.0)], Relation::LessEqual, 3.0)?;
                b.stage_objective(&[(x.outgoing, 0.25)], 0.0)
            })
            .unwrap();
            let vf = graph.node(0, 0).value_function();
            for c in &cuts {
                vf.add_cut(c.clone());
                // Re-adding a cut must not change anything either.
                vf.add_cut(c.clone());
            }
            bounds.push(root_bound(&graph, &solver, &Expectation).unwrap());
        }
        prop_assert!((bounds[0] - bounds[1]).abs() < 1e-7, "bounds={:?}", bounds);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(8))]

    // 5. The bound never decreases, whatever the seed
    #[test]
    fn lower_bound_is_monotone(seed in any::<u64>()) {
        let graph = inventory_graph(CutOracleKind::Default);
        let bounds = train(&graph, seed, 6);
        for pair in bounds.windows(2) {
            prop_assert!(pair[1] >= pair[0] - 1e-7, "bounds={:?}", bounds);
        }
    }

    // 6. No cut ever overestimates the true expected future cost
    #[test]
    fn cuts_never_overestimate(seed in any::<u64>(), dominance in any::<bool>()) {
        let oracle = if dominance { CutOracleKind::Dominance } else { CutOracleKind::Default };
        let graph = inventory_graph(oracle);
        let bounds = train(&graph, seed, 5);
        prop_assert!(*bounds.last().unwrap() <= true_value(0, INITIAL_STOCK) + 1e-6);

        for stage in 1..graph.num_stages() {
            let cuts = graph.node(stage - 1, 0).value_function().cuts();
            prop_assert!(!cuts.is_empty());
            for step in 0..=20 {
                let x = step as f64;
                let truth = true_value(stage, x);
                for c in &cuts {
                    prop_assert!(
                        c.value_at(&[x]) <= truth + 1e-6,
                        "stage {} x={} cut={} truth={}", stage, x, c.value_at(&[x]), truth
                    );
                }
            }
        }
    }

    // 7. Risk-averse cuts over a markov chain stay below the AV@R of the
    //    last-stage outcomes they approximate
    #[test]
    fn avar_cuts_are_valid_across_regimes(seed in any::<u64>(), beta in 0.2..1.0f64) {
        let risk = AverageValueAtRisk::new(beta).unwrap();
        let def = ModelDefinition::new(3, Sense::Minimize)
            .objective_bound(0.0)
            .markov_transition(regime_chain());
        let mut model = SddpModel::build(def, regime_inventory)
            .unwrap()
            .with_risk_measure(risk);
        model
            .solve(&SolveOptions::default().iteration_limit(5).forward_passes(2).seed(seed))
            .unwrap();

        let chain = regime_chain();
        for from in 0..2 {
            let cuts = model.graph().node(1, from).value_function().cuts();
            for step in 0..=20 {
                let x = step as f64;
                let mut nominal = Vec::new();
                let mut costs = Vec::new();
                for (j, &pj) in chain[2][from].iter().enumerate() {
                    for &d in &DEMAND {
                        nominal.push(pj / DEMAND.len() as f64);
                        costs.push(last_stage_cost(j, x, d));
                    }
                }
                let q = risk.adjust(&nominal, &costs, Sense::Minimize);
                let truth: f64 = q.iter().zip(&costs).map(|(q, c)| q * c).sum();
                for c in &cuts {
                    prop_assert!(
                        c.value_at(&[x]) <= truth + 1e-6,
                        "regime {} x={} cut={} truth={}", from, x, c.value_at(&[x]), truth
                    );
                }
            }
        }
    }
}
