//! Hydro-thermal scheduling demo.
//!
//! One reservoir over `--stages` weeks, two price regimes following a markov
//! chain, random inflows. Each week a demand of 150 must be met by turbined
//! water (free, at most 70) or thermal generation (priced by the regime).
//! Solves with EAV@R, prints the bounds, simulates the policy and exports
//! the cuts as JSON to `--output` (or `SDDP_OUTPUT`).

use std::time::Instant;

use sddp::convergence::BoundEstimate;
use sddp::constants::Z_SCORE_95;
use sddp::env_config::{init_logging, init_rayon_threads, output_path};
use sddp::risk::eavar;
use sddp::storage::save_model;
use sddp::{
    CutOracleKind, ModelDefinition, ModelError, ModelMetadata, Relation, SddpModel, Sense,
    SolveOptions, StoppingRule, SubproblemBuilder,
};

const DEMAND: f64 = 150.0;
const TURBINE_CAPACITY: f64 = 70.0;
const RESERVOIR_CAPACITY: f64 = 200.0;
const THERMAL_PRICE: [f64; 2] = [50.0, 120.0];
const INFLOWS: [f64; 3] = [0.0, 50.0, 100.0];
const INNOVATIONS: [f64; 3] = [0.0, 25.0, 50.0];

struct Args {
    stages: usize,
    iterations: usize,
    passes: usize,
    seed: u64,
    lambda: f64,
    beta: f64,
    autoregressive: bool,
    oracle: CutOracleKind,
    simulations: usize,
    output: Option<String>,
}

fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().collect();
    let mut parsed = Args {
        stages: 4,
        iterations: 50,
        passes: 4,
        seed: 42,
        lambda: 0.5,
        beta: 0.25,
        autoregressive: false,
        oracle: CutOracleKind::Default,
        simulations: 200,
        output: None,
    };

    fn value<T: std::str::FromStr>(args: &[String], i: usize, flag: &str) -> T {
        args.get(i)
            .and_then(|s| s.parse().ok())
            .unwrap_or_else(|| {
                eprintln!("Invalid {flag} value");
                std::process::exit(1);
            })
    }

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--stages" => {
                i += 1;
                parsed.stages = value(&args, i, "--stages");
            }
            "--iterations" => {
                i += 1;
                parsed.iterations = value(&args, i, "--iterations");
            }
            "--passes" => {
                i += 1;
                parsed.passes = value(&args, i, "--passes");
            }
            "--seed" => {
                i += 1;
                parsed.seed = value(&args, i, "--seed");
            }
            "--lambda" => {
                i += 1;
                parsed.lambda = value(&args, i, "--lambda");
            }
            "--beta" => {
                i += 1;
                parsed.beta = value(&args, i, "--beta");
            }
            "--simulations" => {
                i += 1;
                parsed.simulations = value(&args, i, "--simulations");
            }
            "--output" => {
                i += 1;
                parsed.output = args.get(i).cloned();
            }
            "--ar" => parsed.autoregressive = true,
            "--oracle" => {
                i += 1;
                parsed.oracle = match args.get(i).map(String::as_str) {
                    Some("default") => CutOracleKind::Default,
                    Some("dominance") => CutOracleKind::Dominance,
                    Some("level-one") => CutOracleKind::LevelOne,
                    other => {
                        eprintln!("Unknown --oracle {other:?} (default, dominance, level-one)");
                        std::process::exit(1);
                    }
                };
            }
            "--help" | "-h" => {
                println!(
                    "Usage: sddp-reservoir [--stages N] [--iterations N] [--passes N] [--seed S]\n\
                     \x20                     [--lambda L] [--beta B] [--ar] [--oracle KIND]\n\
                     \x20                     [--simulations N] [--output PATH]"
                );
                std::process::exit(0);
            }
            other => {
                eprintln!("Unknown argument: {other}");
                std::process::exit(1);
            }
        }
        i += 1;
    }
    parsed
}

/// Low prices tend to persist; high prices revert.
fn price_chain(stages: usize) -> Vec<Vec<Vec<f64>>> {
    let mut chain = vec![vec![vec![0.5, 0.5]]];
    for _ in 1..stages {
        chain.push(vec![vec![0.8, 0.2], vec![0.4, 0.6]]);
    }
    chain
}

fn reservoir(b: &mut SubproblemBuilder, autoregressive: bool) -> Result<(), ModelError> {
    let volume = b.add_state(0.0, RESERVOIR_CAPACITY, 100.0)?;
    let turbine = b.add_variable(0.0, TURBINE_CAPACITY);
    let spill = b.add_variable(0.0, f64::INFINITY);
    let thermal = b.add_variable(0.0, f64::INFINITY);

    // volume_out − volume_in + turbine + spill = inflow
    let balance = [
        (volume.outgoing, 1.0),
        (volume.incoming, -1.0),
        (turbine, 1.0),
        (spill, 1.0),
    ];
    if autoregressive {
        let inflow = b.autoregressive_noise(&[0.5], &[40.0], &INNOVATIONS)?;
        let mut terms = balance.to_vec();
        terms.push((inflow, -1.0));
        b.add_constraint(&terms, Relation::Equal, 0.0)?;
    } else {
        b.add_rhs_noise(&balance, Relation::Equal, &INFLOWS)?;
    }
    b.add_constraint(&[(turbine, 1.0), (thermal, 1.0)], Relation::Equal, DEMAND)?;

    let price = THERMAL_PRICE[b.markov_state()];
    b.stage_objective(&[(thermal, price), (spill, 0.01)], 0.0)
}

fn main() {
    init_logging();
    init_rayon_threads();
    let args = parse_args();

    let definition = ModelDefinition::new(args.stages, Sense::Minimize)
        .objective_bound(0.0)
        .markov_transition(price_chain(args.stages))
        .cut_oracle(args.oracle)
        .metadata(ModelMetadata {
            name: "reservoir".to_string(),
            author: "sddp".to_string(),
            description: format!(
                "single reservoir, {} stages, two price regimes, {} inflows",
                args.stages,
                if args.autoregressive { "AR(1)" } else { "independent" }
            ),
        });

    let risk = match eavar(args.lambda, args.beta) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };
    let autoregressive = args.autoregressive;
    let mut model = match SddpModel::build(definition, |b| reservoir(b, autoregressive)) {
        Ok(m) => m.with_risk_measure(risk),
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    let options = SolveOptions::default()
        .iteration_limit(args.iterations)
        .forward_passes(args.passes)
        .seed(args.seed)
        .stopping_rule(StoppingRule::BoundStalling {
            window: 5,
            tolerance: 1e-6,
        });

    let start = Instant::now();
    let result = match model.solve(&options) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("Solve failed: {e}");
            std::process::exit(1);
        }
    };
    println!(
        "Status: {:?} after {} iterations ({:.2}s)",
        result.status,
        result.iterations,
        start.elapsed().as_secs_f64()
    );
    println!("Lower bound: {:.4}", result.lower_bound);

    match model.simulate(args.simulations, args.seed.wrapping_add(1)) {
        Ok(trajectories) => {
            let costs: Vec<f64> = trajectories.iter().map(|t| t.total_cost).collect();
            if let Some(est) = BoundEstimate::from_samples(&costs, Z_SCORE_95) {
                println!(
                    "Simulated cost: {:.4} ± {:.4} ({} replications)",
                    est.mean, est.half_width, est.samples
                );
            }
        }
        Err(e) => eprintln!("Simulation failed: {e}"),
    }

    let path = args
        .output
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|| output_path("reservoir_cuts.json"));
    if let Err(e) = save_model(model.graph(), &path) {
        eprintln!("{e}");
        std::process::exit(1);
    }
    println!("Saved {} cuts to {}", model.graph().num_cuts(), path.display());
}
