//! JSON export of a solved model and warm-start import of its cuts.
//!
//! The export carries the metadata, the lattice shape (transition matrices),
//! the dimensions of the cut domain and every valid cut per node. Loading
//! does not rebuild subproblems: cuts are imported into a graph built from
//! the same model code, after checking that the shapes and the transition
//! probabilities agree.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::constants::PROBABILITY_TOLERANCE;
use crate::cut_oracle::{Cut, CutOracleKind};
use crate::error::{Result, SddpError};
use crate::lp::Sense;
use crate::policy_graph::PolicyGraph;

/// Format version written into every export.
pub const EXPORT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportedNode {
    pub reachable: bool,
    /// Cuts ever generated here, pruned ones included.
    pub total_cuts: usize,
    pub cuts: Vec<Cut>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportedStage {
    pub markov_states: Vec<ExportedNode>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportedModel {
    pub version: u32,
    pub name: String,
    pub author: String,
    pub description: String,
    pub sense: Sense,
    pub objective_bound: f64,
    pub cut_oracle: CutOracleKind,
    pub num_states: usize,
    pub history_len: usize,
    pub transitions: Vec<Vec<Vec<f64>>>,
    pub stages: Vec<ExportedStage>,
}

/// Snapshot the graph's structure and valid cuts.
pub fn export_model(graph: &PolicyGraph) -> ExportedModel {
    let meta = graph.metadata();
    let stages = (0..graph.num_stages())
        .map(|s| ExportedStage {
            markov_states: graph
                .nodes(s)
                .iter()
                .map(|n| ExportedNode {
                    reachable: n.is_reachable(),
                    total_cuts: n.value_function().total_cuts(),
                    cuts: n.value_function().cuts(),
                })
                .collect(),
        })
        .collect();
    ExportedModel {
        version: EXPORT_VERSION,
        name: meta.name.clone(),
        author: meta.author.clone(),
        description: meta.description.clone(),
        sense: graph.sense(),
        objective_bound: graph.objective_bound(),
        cut_oracle: graph.cut_oracle(),
        num_states: graph.num_states(),
        history_len: graph.history_len(),
        transitions: graph.transitions().to_vec(),
        stages,
    }
}

/// Write [`export_model`] as pretty JSON.
pub fn save_model(graph: &PolicyGraph, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let start = Instant::now();
    let export = export_model(graph);
    let file = File::create(path)
        .map_err(|e| SddpError::io(format!("creating {}", path.display()), e))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, &export)?;
    writer
        .flush()
        .map_err(|e| SddpError::io(format!("writing {}", path.display()), e))?;
    info!(
        path = %path.display(),
        cuts = graph.num_cuts(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "saved model"
    );
    Ok(())
}

pub fn load_model(path: impl AsRef<Path>) -> Result<ExportedModel> {
    let path = path.as_ref();
    let file =
        File::open(path).map_err(|e| SddpError::io(format!("opening {}", path.display()), e))?;
    let export: ExportedModel = serde_json::from_reader(BufReader::new(file))?;
    if export.version != EXPORT_VERSION {
        return Err(SddpError::CutImport(format!(
            "{} has format version {}, expected {}",
            path.display(),
            export.version,
            EXPORT_VERSION
        )));
    }
    Ok(export)
}

/// Insert the exported cuts into `graph` through its oracles. The graph must
/// have the same sense, lattice and cut dimension. Returns the number of
/// cuts offered.
pub fn import_cuts(graph: &PolicyGraph, export: &ExportedModel) -> Result<usize> {
    if export.sense != graph.sense() {
        return Err(SddpError::CutImport(format!(
            "sense {:?} does not match the model's {:?}",
            export.sense,
            graph.sense()
        )));
    }
    if export.stages.len() != graph.num_stages() {
        return Err(SddpError::CutImport(format!(
            "{} stages exported, model has {}",
            export.stages.len(),
            graph.num_stages()
        )));
    }
    for (s, stage) in export.stages.iter().enumerate() {
        if stage.markov_states.len() != graph.num_markov_states(s) {
            return Err(SddpError::CutImport(format!(
                "stage {s}: {} markov states exported, model has {}",
                stage.markov_states.len(),
                graph.num_markov_states(s)
            )));
        }
    }
    if !same_transitions(&export.transitions, graph.transitions()) {
        return Err(SddpError::CutImport(
            "exported transition probabilities differ from the model's".to_string(),
        ));
    }
    let dimension = graph.num_states() + graph.history_len();
    let bad = export
        .stages
        .iter()
        .flat_map(|s| &s.markov_states)
        .flat_map(|n| &n.cuts)
        .find(|c| c.coefficients.len() != dimension || c.sample.len() != dimension);
    if let Some(cut) = bad {
        return Err(SddpError::CutImport(format!(
            "cut of dimension {} in a model with dimension {dimension}",
            cut.coefficients.len()
        )));
    }

    let mut imported = 0;
    for (s, stage) in export.stages.iter().enumerate() {
        for (j, node) in stage.markov_states.iter().enumerate() {
            let vf = graph.node(s, j).value_function();
            for cut in &node.cuts {
                vf.add_cut(cut.clone());
                imported += 1;
            }
        }
    }
    info!(cuts = imported, "imported cuts");
    Ok(imported)
}

/// Same shape, entries equal within [`PROBABILITY_TOLERANCE`].
fn same_transitions(a: &[Vec<Vec<f64>>], b: &[Vec<Vec<f64>>]) -> bool {
    a.len() == b.len()
        && a.iter().zip(b).all(|(ma, mb)| {
            ma.len() == mb.len()
                && ma.iter().zip(mb).all(|(ra, rb)| {
                    ra.len() == rb.len()
                        && ra
                            .iter()
                            .zip(rb)
                            .all(|(x, y)| (x - y).abs() <= PROBABILITY_TOLERANCE)
                })
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ModelError;
    use crate::policy_graph::{ModelDefinition, ModelMetadata};
    use crate::subproblem::SubproblemBuilder;

    fn one_state(b: &mut SubproblemBuilder) -> std::result::Result<(), ModelError> {
        let x = b.add_state(0.0, 5.0, 1.0)?;
        b.stage_objective(&[(x.outgoing, 1.0)], 0.0)
    }

    fn graph() -> PolicyGraph {
        let def = ModelDefinition::new(2, Sense::Minimize)
            .objective_bound(0.0)
            .metadata(ModelMetadata {
                name: "toy".into(),
                author: "ops".into(),
                description: "two stages".into(),
            });
        PolicyGraph::build(def, one_state).unwrap()
    }

    #[test]
    fn export_carries_metadata_and_cuts() {
        let g = graph();
        g.node(0, 0).value_function().add_cut(Cut {
            intercept: 2.0,
            coefficients: vec![-1.0],
            sample: vec![1.0],
        });
        let e = export_model(&g);
        assert_eq!(e.name, "toy");
        assert_eq!(e.stages.len(), 2);
        assert_eq!(e.stages[0].markov_states[0].cuts.len(), 1);
        assert!(e.stages[1].markov_states[0].cuts.is_empty());
    }

    #[test]
    fn import_rejects_wrong_dimension() {
        let g = graph();
        let mut e = export_model(&g);
        e.stages[0].markov_states[0].cuts.push(Cut {
            intercept: 0.0,
            coefficients: vec![1.0, 2.0],
            sample: vec![0.0, 0.0],
        });
        assert!(matches!(import_cuts(&g, &e), Err(SddpError::CutImport(_))));
        assert_eq!(g.num_cuts(), 0);
    }

    #[test]
    fn import_rejects_other_lattices() {
        let g = graph();
        let mut e = export_model(&g);
        e.stages.pop();
        assert!(import_cuts(&g, &e).is_err());
        let mut e = export_model(&g);
        e.sense = Sense::Maximize;
        assert!(import_cuts(&g, &e).is_err());
    }

    #[test]
    fn import_rejects_other_transition_probabilities() {
        let def = ModelDefinition::new(2, Sense::Minimize)
            .objective_bound(0.0)
            .markov_transition(vec![vec![vec![1.0]], vec![vec![0.5, 0.5]]]);
        let g = PolicyGraph::build(def, one_state).unwrap();
        g.node(0, 0).value_function().add_cut(Cut {
            intercept: 1.0,
            coefficients: vec![0.0],
            sample: vec![1.0],
        });

        let mut e = export_model(&g);
        e.transitions[1][0] = vec![0.6, 0.4];
        assert!(matches!(import_cuts(&g, &e), Err(SddpError::CutImport(_))));
        assert_eq!(g.total_cuts(), 1);

        // Rounding noise in a saved file is tolerated.
        let mut e = export_model(&g);
        e.transitions[1][0] = vec![0.5 + 1e-9, 0.5 - 1e-9];
        assert_eq!(import_cuts(&g, &e).unwrap(), 1);
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = load_model("/nonexistent/dir/model.json").unwrap_err();
        assert!(matches!(err, SddpError::Io { .. }));
    }
}
