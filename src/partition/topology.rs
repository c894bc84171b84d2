use std::path::PathBuf;

use serde::Deserialize;

use crate::error::{Result, TorusError};

/// A hardware topology description: the partitions that exist, the nodes
/// inside each, and the wiring conflicts between them.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Topology {
    #[serde(default, rename = "partition")]
    pub partitions: Vec<PartitionDef>,
}

/// One partition in a topology description.
#[derive(Debug, Clone, Deserialize)]
pub struct PartitionDef {
    pub name: String,
    pub nodes: Vec<String>,
    /// Compute-node count; defaults to the length of `nodes`.
    pub size: Option<usize>,
    #[serde(default)]
    pub wiring: Vec<String>,
    pub queue: Option<String>,
    #[serde(default)]
    pub functional: bool,
    #[serde(default)]
    pub scheduled: bool,
}

impl PartitionDef {
    pub fn new(name: impl Into<String>, nodes: &[&str]) -> Self {
        Self {
            name: name.into(),
            nodes: nodes.iter().map(|n| n.to_string()).collect(),
            size: None,
            wiring: Vec::new(),
            queue: None,
            functional: false,
            scheduled: false,
        }
    }

    pub fn size(mut self, size: usize) -> Self {
        self.size = Some(size);
        self
    }

    pub fn wiring(mut self, conflicts: &[&str]) -> Self {
        self.wiring = conflicts.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn functional(mut self, functional: bool) -> Self {
        self.functional = functional;
        self
    }

    pub fn scheduled(mut self, scheduled: bool) -> Self {
        self.scheduled = scheduled;
        self
    }
}

impl Topology {
    pub fn new(partitions: Vec<PartitionDef>) -> Self {
        Self { partitions }
    }

    /// Check internal consistency: unique partition names, non-empty node
    /// lists, and wiring references that name defined partitions.
    ///
    /// # Errors
    ///
    /// Returns a topology error describing the first inconsistency found.
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for def in &self.partitions {
            if !seen.insert(def.name.as_str()) {
                return Err(TorusError::Topology(format!(
                    "duplicate partition {:?}",
                    def.name
                )));
            }
            if def.nodes.is_empty() {
                return Err(TorusError::Topology(format!(
                    "partition {:?} has no nodes",
                    def.name
                )));
            }
        }
        for def in &self.partitions {
            for conflict in &def.wiring {
                if !seen.contains(conflict.as_str()) {
                    return Err(TorusError::Topology(format!(
                        "partition {:?} has wiring conflict with undefined partition {:?}",
                        def.name, conflict
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Where a partition graph gets its topology from.
///
/// `describe` supplies the full topology at configure time. `poll_busy`
/// lets a source that fronts real hardware report which partitions the
/// hardware considers busy; sources without that insight return `None`
/// and busy state stays reservation-driven.
pub trait TopologySource: Send + Sync {
    fn describe(&self) -> Result<Topology>;

    fn poll_busy(&self) -> Result<Option<Vec<String>>> {
        Ok(None)
    }
}

/// A topology can stand in as its own source, mainly for tests and
/// in-memory setups.
impl TopologySource for Topology {
    fn describe(&self) -> Result<Topology> {
        Ok(self.clone())
    }
}

/// Topology loaded from a TOML file of `[[partition]]` tables.
pub struct FileTopology {
    path: PathBuf,
}

impl FileTopology {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl TopologySource for FileTopology {
    fn describe(&self) -> Result<Topology> {
        let content = std::fs::read_to_string(&self.path).map_err(|e| {
            TorusError::Topology(format!("cannot read {}: {}", self.path.display(), e))
        })?;
        let topology: Topology = toml::from_str(&content).map_err(|e| {
            TorusError::Topology(format!("cannot parse {}: {}", self.path.display(), e))
        })?;
        topology.validate()?;
        Ok(topology)
    }
}
