//! Partition and node state tracking.
//!
//! Hardware is modeled as nodes grouped into named partitions. Partitions
//! overlap: a partition whose node set contains another's is its parent,
//! and partitions can conflict over interconnect wiring without sharing
//! any node. Busy/blocked state is derived from node ownership on every
//! query rather than stored, so observers can never see a stale
//! transition.

mod graph;
mod topology;

pub use graph::PartitionGraph;
pub use topology::{FileTopology, PartitionDef, Topology, TopologySource};

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// One hardware unit. `used_by` is the exclusivity marker: the name of the
/// partition currently holding this node, or empty.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: String,
    pub used_by: String,
}

impl Node {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            used_by: String::new(),
        }
    }

    pub fn is_free(&self) -> bool {
        self.used_by.is_empty()
    }
}

/// A named set of nodes, stored in the graph's arena.
///
/// `nodes`, `parents`, and `children` hold arena indexes; wiring conflicts
/// are resolved to indexes at configure time. Relationship sets are only
/// meaningful for managed partitions and are recomputed wholesale whenever
/// the managed set changes.
#[derive(Debug, Clone)]
pub struct Partition {
    pub name: String,
    pub size: usize,
    pub queue: String,
    pub functional: bool,
    pub scheduled: bool,
    pub nodes: BTreeSet<usize>,
    pub parents: BTreeSet<usize>,
    pub children: BTreeSet<usize>,
    pub wiring_conflicts: BTreeSet<usize>,
}

/// Derived partition state.
///
/// `Busy` means the partition holds its own reservation. `Blocked` carries
/// the name of the partition occupying one of this partition's nodes;
/// `BlockedWiring` the name of the busy wiring-conflicting partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartitionState {
    Idle,
    Busy,
    Blocked(String),
    BlockedWiring(String),
}

impl PartitionState {
    pub fn is_idle(&self) -> bool {
        matches!(self, PartitionState::Idle)
    }

    pub fn is_busy(&self) -> bool {
        matches!(self, PartitionState::Busy)
    }
}

impl std::fmt::Display for PartitionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PartitionState::Idle => write!(f, "idle"),
            PartitionState::Busy => write!(f, "busy"),
            PartitionState::Blocked(by) => write!(f, "blocked ({})", by),
            PartitionState::BlockedWiring(by) => write!(f, "blocked-wiring ({})", by),
        }
    }
}

/// The wire form of a partition, used by RPC responses and filter
/// matching.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PartitionRecord {
    pub name: String,
    pub size: usize,
    pub queue: String,
    pub functional: bool,
    pub scheduled: bool,
    pub state: String,
    pub parents: Vec<String>,
    pub children: Vec<String>,
}

/// The slice of a managed partition that survives a daemon restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagedPartition {
    pub name: String,
    pub queue: String,
    pub functional: bool,
    pub scheduled: bool,
}
