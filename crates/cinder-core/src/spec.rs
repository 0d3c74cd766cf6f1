//! Per-commit task configuration.
//!
//! Each commit carries a JSON config file mapping task spec names to their
//! declarative definitions. The scheduler re-reads the config per commit;
//! two specs with the same name at different commits may differ.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Repository-relative path of the task config file read at each commit.
pub const TASKS_CFG_FILE: &str = "infra/cinder/tasks.json";

/// A package staged alongside a task's inputs. Opaque to the scheduler;
/// carried through to the dispatch request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CipdPackage {
    pub name: String,
    pub path: String,
    pub version: String,
}

/// Declarative, per-commit definition of one unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Names of specs that must complete successfully first.
    #[serde(default)]
    pub dependencies: Vec<String>,

    /// Capability requirements as "key:value" pairs a worker must satisfy.
    #[serde(default)]
    pub dimensions: Vec<String>,

    /// Input-bundle descriptor: path of the isolate file to stage.
    pub isolate: String,

    /// Priority weight in (0, 1].
    pub priority: f64,

    #[serde(default)]
    pub cipd_packages: Vec<CipdPackage>,
}

impl TaskSpec {
    /// Parse the "k:v" dimension strings into a map. `TasksCfg::parse`
    /// already validated the format, so this only fails on specs built
    /// by hand.
    pub fn dimension_map(&self) -> Result<HashMap<String, String>> {
        let mut map = HashMap::with_capacity(self.dimensions.len());
        for dim in &self.dimensions {
            let (k, v) = dim
                .split_once(':')
                .ok_or_else(|| Error::InvalidDimension(dim.clone()))?;
            if k.is_empty() || v.is_empty() {
                return Err(Error::InvalidDimension(dim.clone()));
            }
            map.insert(k.to_string(), v.to_string());
        }
        Ok(map)
    }
}

/// The parsed task config for one commit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TasksCfg {
    /// Optional config-level job name; defaults to the repo name.
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub tasks: HashMap<String, TaskSpec>,
}

impl TasksCfg {
    /// Parse and validate the config file contents for one commit.
    ///
    /// Validation: every dependency must name a spec in the same config,
    /// every dimension must be "key:value", and priorities must be in
    /// (0, 1]. Cycle detection happens when the scheduler builds the
    /// per-commit spec graph.
    pub fn parse(contents: &[u8]) -> Result<Self> {
        let cfg: TasksCfg = serde_json::from_slice(contents)?;
        for (name, spec) in &cfg.tasks {
            for dep in &spec.dependencies {
                if !cfg.tasks.contains_key(dep) {
                    return Err(Error::UnknownDependency(format!("{name} -> {dep}")));
                }
            }
            spec.dimension_map()?;
            if !(spec.priority > 0.0 && spec.priority <= 1.0) {
                return Err(Error::InvalidConfig(format!(
                    "priority for {name} must be in (0, 1], got {}",
                    spec.priority
                )));
            }
        }
        Ok(cfg)
    }
}
