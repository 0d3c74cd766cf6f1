//! DAG resolution for per-commit task specs.

use cinder_core::spec::{TaskSpec, TasksCfg};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DagError {
    #[error("Cycle detected in task dependencies")]
    CycleDetected,
    #[error("Unknown task dependency: {0}")]
    UnknownDependency(String),
    #[error("Empty task config")]
    EmptyConfig,
}

/// A node in the per-commit spec DAG.
#[derive(Debug, Clone)]
pub struct SpecNode {
    pub name: String,
    pub spec: TaskSpec,
}

/// Directed acyclic graph of one commit's task specs.
#[derive(Debug)]
pub struct SpecDag {
    graph: DiGraph<SpecNode, ()>,
    name_to_index: HashMap<String, NodeIndex>,
}

impl SpecDag {
    /// Specs that must complete before a given spec can run.
    pub fn predecessors(&self, name: &str) -> Vec<&SpecNode> {
        self.name_to_index
            .get(name)
            .map(|&idx| {
                self.graph
                    .neighbors_directed(idx, petgraph::Direction::Incoming)
                    .filter_map(|n| self.graph.node_weight(n))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Specs in a dependency-respecting order.
    pub fn topological_order(&self) -> Result<Vec<&SpecNode>, DagError> {
        toposort(&self.graph, None)
            .map(|indices| {
                indices
                    .iter()
                    .filter_map(|&idx| self.graph.node_weight(idx))
                    .collect()
            })
            .map_err(|_| DagError::CycleDetected)
    }

    /// Whether every dependency of `name` is in `completed`.
    pub fn is_ready(&self, name: &str, completed: &[String]) -> bool {
        self.predecessors(name)
            .iter()
            .all(|pred| completed.contains(&pred.name))
    }
}

/// Builder for per-commit spec DAGs.
pub struct DagBuilder;

impl DagBuilder {
    pub fn new() -> Self {
        Self
    }

    /// Build a DAG from a parsed task config.
    pub fn build(&self, cfg: &TasksCfg) -> Result<SpecDag, DagError> {
        if cfg.tasks.is_empty() {
            return Err(DagError::EmptyConfig);
        }

        let mut graph = DiGraph::new();
        let mut name_to_index = HashMap::new();

        for (name, spec) in &cfg.tasks {
            let node = SpecNode {
                name: name.clone(),
                spec: spec.clone(),
            };
            let idx = graph.add_node(node);
            name_to_index.insert(name.clone(), idx);
        }

        for (name, spec) in &cfg.tasks {
            let spec_idx = name_to_index[name];
            for dep in &spec.dependencies {
                let dep_idx = name_to_index
                    .get(dep)
                    .ok_or_else(|| DagError::UnknownDependency(dep.clone()))?;
                graph.add_edge(*dep_idx, spec_idx, ());
            }
        }

        let dag = SpecDag {
            graph,
            name_to_index,
        };

        // Verify no cycles
        dag.topological_order()?;

        Ok(dag)
    }
}

impl Default for DagBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_cfg(specs: Vec<(&str, Vec<&str>)>) -> TasksCfg {
        TasksCfg {
            name: None,
            tasks: specs
                .into_iter()
                .map(|(name, deps)| {
                    (
                        name.to_string(),
                        TaskSpec {
                            dependencies: deps.iter().map(|d| d.to_string()).collect(),
                            dimensions: vec!["pool:Skia".to_string()],
                            isolate: format!("{name}.isolate"),
                            priority: 0.5,
                            cipd_packages: vec![],
                        },
                    )
                })
                .collect(),
        }
    }

    #[test]
    fn test_linear_dag() {
        let cfg = make_cfg(vec![
            ("Build", vec![]),
            ("Test", vec!["Build"]),
            ("Upload", vec!["Test"]),
        ]);
        let dag = DagBuilder::new().build(&cfg).unwrap();

        let order = dag.topological_order().unwrap();
        assert_eq!(order.len(), 3);
        assert_eq!(order[0].name, "Build");
        assert!(dag.predecessors("Build").is_empty());
        assert_eq!(dag.predecessors("Upload")[0].name, "Test");
    }

    #[test]
    fn test_diamond_dag() {
        let cfg = make_cfg(vec![
            ("Build", vec![]),
            ("Test-Unit", vec!["Build"]),
            ("Test-Perf", vec!["Build"]),
            ("Upload", vec!["Test-Unit", "Test-Perf"]),
        ]);
        let dag = DagBuilder::new().build(&cfg).unwrap();

        assert_eq!(dag.predecessors("Upload").len(), 2);
        assert!(dag.is_ready("Build", &[]));
        assert!(!dag.is_ready("Upload", &["Test-Unit".to_string()]));
        assert!(dag.is_ready(
            "Upload",
            &["Test-Unit".to_string(), "Test-Perf".to_string()]
        ));
    }

    #[test]
    fn test_cycle_is_rejected() {
        let cfg = make_cfg(vec![("A", vec!["B"]), ("B", vec!["A"])]);
        let err = DagBuilder::new().build(&cfg).unwrap_err();
        assert!(matches!(err, DagError::CycleDetected));
    }

    #[test]
    fn test_empty_config_is_rejected() {
        let err = DagBuilder::new().build(&TasksCfg::default()).unwrap_err();
        assert!(matches!(err, DagError::EmptyConfig));
    }
}
