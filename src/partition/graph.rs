use std::collections::{BTreeSet, HashMap};

use serde_json::{Map, Value};

use crate::error::{Result, TorusError};
use crate::filter::{self, FilterSpec};

use super::{ManagedPartition, Node, Partition, PartitionRecord, PartitionState, Topology};

/// Arena of partitions and nodes with derived busy/blocked state.
///
/// All partitions and nodes live in index-stable vectors; containment and
/// wiring relationships are index sets. The graph itself is not
/// synchronized. Callers hold one lock around every read-modify-write
/// sequence, including the periodic hardware refresh.
pub struct PartitionGraph {
    nodes: Vec<Node>,
    node_index: HashMap<String, usize>,
    partitions: Vec<Partition>,
    partition_index: HashMap<String, usize>,
    /// Managed partitions are the subset eligible for scheduling; queries,
    /// reservations, and relationship edges are scoped to it.
    managed: BTreeSet<usize>,
    /// Partitions currently holding their own reservation.
    reserved: BTreeSet<usize>,
}

impl PartitionGraph {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            node_index: HashMap::new(),
            partitions: Vec::new(),
            partition_index: HashMap::new(),
            managed: BTreeSet::new(),
            reserved: BTreeSet::new(),
        }
    }

    /// Rebuild the full node and partition collections from a topology.
    ///
    /// Managed membership, runtime attributes (queue, functional,
    /// scheduled), and reservations survive for partitions that still
    /// exist under the same name.
    ///
    /// # Errors
    ///
    /// Returns a topology error if the description is inconsistent. The
    /// graph is left unchanged on error.
    pub fn configure(&mut self, topology: &Topology) -> Result<()> {
        topology.validate()?;

        let prior: HashMap<String, (String, bool, bool, bool, bool)> = self
            .partitions
            .iter()
            .enumerate()
            .map(|(idx, p)| {
                (
                    p.name.clone(),
                    (
                        p.queue.clone(),
                        p.functional,
                        p.scheduled,
                        self.managed.contains(&idx),
                        self.reserved.contains(&idx),
                    ),
                )
            })
            .collect();

        let mut nodes: Vec<Node> = Vec::new();
        let mut node_index: HashMap<String, usize> = HashMap::new();
        let mut partitions: Vec<Partition> = Vec::new();
        let mut partition_index: HashMap<String, usize> = HashMap::new();
        let mut managed = BTreeSet::new();
        let mut reserved = BTreeSet::new();

        for def in &topology.partitions {
            let mut node_set = BTreeSet::new();
            for id in &def.nodes {
                let node_idx = *node_index.entry(id.clone()).or_insert_with(|| {
                    nodes.push(Node::new(id.clone()));
                    nodes.len() - 1
                });
                node_set.insert(node_idx);
            }

            let idx = partitions.len();
            let (queue, functional, scheduled) = match prior.get(&def.name) {
                Some((queue, functional, scheduled, was_managed, was_reserved)) => {
                    if *was_managed {
                        managed.insert(idx);
                    }
                    if *was_reserved {
                        reserved.insert(idx);
                    }
                    (queue.clone(), *functional, *scheduled)
                }
                None => (
                    def.queue.clone().unwrap_or_else(|| "default".to_string()),
                    def.functional,
                    def.scheduled,
                ),
            };

            partitions.push(Partition {
                name: def.name.clone(),
                size: def.size.unwrap_or(def.nodes.len()),
                queue,
                functional,
                scheduled,
                nodes: node_set,
                parents: BTreeSet::new(),
                children: BTreeSet::new(),
                wiring_conflicts: BTreeSet::new(),
            });
            partition_index.insert(def.name.clone(), idx);
        }

        // wiring edges are undirected regardless of how the description
        // states them
        for def in &topology.partitions {
            let idx = partition_index[&def.name];
            for conflict in &def.wiring {
                let other = partition_index[conflict.as_str()];
                partitions[idx].wiring_conflicts.insert(other);
                partitions[other].wiring_conflicts.insert(idx);
            }
        }

        self.nodes = nodes;
        self.node_index = node_index;
        self.partitions = partitions;
        self.partition_index = partition_index;
        self.managed = managed;
        self.reserved = reserved;
        self.rebuild_used_by();
        self.rebuild_relationships();
        Ok(())
    }

    /// Clear every node's exclusivity marker, then re-mark from the
    /// partitions currently holding reservations.
    fn rebuild_used_by(&mut self) {
        for node in &mut self.nodes {
            node.used_by.clear();
        }
        let reserved: Vec<usize> = self.reserved.iter().copied().collect();
        for idx in reserved {
            let name = self.partitions[idx].name.clone();
            let node_idxs: Vec<usize> = self.partitions[idx].nodes.iter().copied().collect();
            for node_idx in node_idxs {
                self.nodes[node_idx].used_by = name.clone();
            }
        }
    }

    /// Recompute parent/child containment over the managed subset in one
    /// pass. Called whenever the managed set changes; never incremental.
    fn rebuild_relationships(&mut self) {
        for partition in &mut self.partitions {
            partition.parents.clear();
            partition.children.clear();
        }

        let managed: Vec<usize> = self.managed.iter().copied().collect();
        let mut child_parent: Vec<(usize, usize)> = Vec::new();
        for (pos, &a) in managed.iter().enumerate() {
            for &b in &managed[..pos] {
                let a_nodes = &self.partitions[a].nodes;
                let b_nodes = &self.partitions[b].nodes;
                if a_nodes.is_subset(b_nodes) {
                    child_parent.push((a, b));
                } else if b_nodes.is_subset(a_nodes) {
                    child_parent.push((b, a));
                }
            }
        }
        for (child, parent) in child_parent {
            self.partitions[child].parents.insert(parent);
            self.partitions[parent].children.insert(child);
        }
    }

    /// Derive a partition's state from node ownership and wiring.
    ///
    /// Busy wins, then a busy wiring conflict, then a node held by another
    /// partition.
    fn state_of(&self, idx: usize) -> PartitionState {
        if self.reserved.contains(&idx) {
            return PartitionState::Busy;
        }
        let partition = &self.partitions[idx];
        for &conflict in &partition.wiring_conflicts {
            if self.reserved.contains(&conflict) {
                return PartitionState::BlockedWiring(self.partitions[conflict].name.clone());
            }
        }
        for &node_idx in &partition.nodes {
            let owner = &self.nodes[node_idx].used_by;
            if !owner.is_empty() && *owner != partition.name {
                return PartitionState::Blocked(owner.clone());
            }
        }
        PartitionState::Idle
    }

    /// Derived state by name, managed or not.
    pub fn state(&self, name: &str) -> Option<PartitionState> {
        self.partition_index.get(name).map(|&idx| self.state_of(idx))
    }

    /// The partition currently holding a node, for ownership checks.
    pub fn node_owner(&self, node_id: &str) -> Option<&str> {
        self.node_index
            .get(node_id)
            .map(|&idx| self.nodes[idx].used_by.as_str())
    }

    fn managed_idx(&self, name: &str) -> Option<usize> {
        let idx = *self.partition_index.get(name)?;
        self.managed.contains(&idx).then_some(idx)
    }

    /// Atomically check and take a reservation.
    ///
    /// Returns false without mutating anything when the partition is not
    /// managed, not idle, or smaller than the requested size. On success
    /// every node in the partition is marked used by it.
    pub fn reserve(&mut self, name: &str, size: Option<u64>) -> bool {
        let idx = match self.managed_idx(name) {
            Some(idx) => idx,
            None => {
                tracing::error!(partition = %name, "Reserve failed, partition does not exist");
                return false;
            }
        };
        match self.state_of(idx) {
            PartitionState::Busy => {
                tracing::error!(partition = %name, "Reserve failed, partition busy");
                return false;
            }
            state @ (PartitionState::Blocked(_) | PartitionState::BlockedWiring(_)) => {
                tracing::error!(partition = %name, state = %state, "Reserve failed, partition blocked");
                return false;
            }
            PartitionState::Idle => {}
        }
        if let Some(size) = size {
            if size as usize > self.partitions[idx].size {
                tracing::error!(
                    partition = %name,
                    requested = size,
                    capacity = self.partitions[idx].size,
                    "Reserve failed, size exceeds partition capacity"
                );
                return false;
            }
        }

        let owner = self.partitions[idx].name.clone();
        let node_idxs: Vec<usize> = self.partitions[idx].nodes.iter().copied().collect();
        for node_idx in node_idxs {
            self.nodes[node_idx].used_by = owner.clone();
        }
        self.reserved.insert(idx);
        tracing::info!(partition = %name, size = ?size, "Reserved partition");
        true
    }

    /// Release a reservation. Returns false when the partition is unknown
    /// or not currently busy.
    pub fn release(&mut self, name: &str) -> bool {
        let idx = match self.managed_idx(name) {
            Some(idx) => idx,
            None => {
                tracing::error!(partition = %name, "Release failed, partition does not exist");
                return false;
            }
        };
        if !self.reserved.contains(&idx) {
            tracing::info!(partition = %name, "Release ignored, partition not busy");
            return false;
        }

        let owner = self.partitions[idx].name.clone();
        let node_idxs: Vec<usize> = self.partitions[idx].nodes.iter().copied().collect();
        for node_idx in node_idxs {
            if self.nodes[node_idx].used_by == owner {
                self.nodes[node_idx].used_by.clear();
            }
        }
        self.reserved.remove(&idx);
        tracing::info!(partition = %name, "Released partition");
        true
    }

    /// Mark partitions managed. Already-managed and unknown names are
    /// no-ops; the returned records cover only newly managed partitions,
    /// rendered after relationships are recomputed.
    pub fn add_managed(&mut self, names: &[String]) -> Vec<PartitionRecord> {
        let mut added = Vec::new();
        for name in names {
            if let Some(&idx) = self.partition_index.get(name.as_str()) {
                if self.managed.insert(idx) {
                    added.push(idx);
                }
            }
        }
        self.rebuild_relationships();
        added.into_iter().map(|idx| self.record(idx)).collect()
    }

    /// Remove partitions from the managed set, recomputing relationships.
    /// Returns records for the partitions actually removed.
    pub fn remove_managed(&mut self, names: &[String]) -> Vec<PartitionRecord> {
        let mut removed = Vec::new();
        for name in names {
            if let Some(&idx) = self.partition_index.get(name.as_str()) {
                if self.managed.remove(&idx) {
                    removed.push(idx);
                }
            }
        }
        self.rebuild_relationships();
        removed.into_iter().map(|idx| self.record(idx)).collect()
    }

    /// Managed partitions matching a filter.
    ///
    /// # Errors
    ///
    /// Returns an error only if a record fails to serialize.
    pub fn query(&self, specs: &[FilterSpec]) -> Result<Vec<PartitionRecord>> {
        let mut matched = Vec::new();
        for &idx in &self.managed {
            let record = self.record(idx);
            if filter::matches_any(specs, &filter::record_of(&record)?) {
                matched.push(record);
            }
        }
        Ok(matched)
    }

    /// Names of any partition, managed or not, matching a filter.
    ///
    /// The managed set is grown and shrunk through filter specs on the
    /// wire; this resolves those specs against the whole topology.
    pub fn match_names(&self, specs: &[FilterSpec]) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for idx in 0..self.partitions.len() {
            let record = self.record(idx);
            if filter::matches_any(specs, &filter::record_of(&record)?) {
                names.push(record.name);
            }
        }
        Ok(names)
    }

    /// Bulk attribute update over managed partitions matching a filter.
    ///
    /// # Errors
    ///
    /// Returns a request error for an unknown attribute name or a value of
    /// the wrong type; no partition is modified in that case.
    pub fn set_attrs(
        &mut self,
        specs: &[FilterSpec],
        updates: &Map<String, Value>,
    ) -> Result<Vec<PartitionRecord>> {
        for (key, value) in updates {
            match key.as_str() {
                "queue" if value.is_string() => {}
                "functional" | "scheduled" if value.is_boolean() => {}
                "queue" | "functional" | "scheduled" => {
                    return Err(TorusError::BadRequest(format!(
                        "wrong type for partition attribute {:?}",
                        key
                    )));
                }
                _ => {
                    return Err(TorusError::BadRequest(format!(
                        "unknown partition attribute {:?}",
                        key
                    )));
                }
            }
        }

        let mut matched = Vec::new();
        for &idx in &self.managed {
            let record = self.record(idx);
            if filter::matches_any(specs, &filter::record_of(&record)?) {
                matched.push(idx);
            }
        }
        for &idx in &matched {
            let partition = &mut self.partitions[idx];
            for (key, value) in updates {
                match key.as_str() {
                    "queue" => partition.queue = value.as_str().unwrap_or_default().to_string(),
                    "functional" => partition.functional = value.as_bool().unwrap_or_default(),
                    "scheduled" => partition.scheduled = value.as_bool().unwrap_or_default(),
                    _ => unreachable!("validated above"),
                }
            }
        }
        Ok(matched.into_iter().map(|idx| self.record(idx)).collect())
    }

    /// Overwrite the busy set from a hardware poll. Unknown names are
    /// logged and skipped; node markers are rebuilt to match.
    pub fn set_busy(&mut self, names: &[String]) {
        let mut reserved = BTreeSet::new();
        for name in names {
            match self.partition_index.get(name.as_str()) {
                Some(&idx) => {
                    reserved.insert(idx);
                }
                None => {
                    tracing::warn!(partition = %name, "Hardware reports unknown partition busy");
                }
            }
        }
        self.reserved = reserved;
        self.rebuild_used_by();
    }

    /// The wire form of one partition.
    fn record(&self, idx: usize) -> PartitionRecord {
        let partition = &self.partitions[idx];
        let mut parents: Vec<String> = partition
            .parents
            .iter()
            .map(|&p| self.partitions[p].name.clone())
            .collect();
        parents.sort();
        let mut children: Vec<String> = partition
            .children
            .iter()
            .map(|&c| self.partitions[c].name.clone())
            .collect();
        children.sort();

        PartitionRecord {
            name: partition.name.clone(),
            size: partition.size,
            queue: partition.queue.clone(),
            functional: partition.functional,
            scheduled: partition.scheduled,
            state: self.state_of(idx).to_string(),
            parents,
            children,
        }
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn managed_names(&self) -> Vec<String> {
        self.managed
            .iter()
            .map(|&idx| self.partitions[idx].name.clone())
            .collect()
    }

    /// Managed-partition slice persisted in snapshots.
    pub fn managed_snapshot(&self) -> Vec<ManagedPartition> {
        self.managed
            .iter()
            .map(|&idx| {
                let partition = &self.partitions[idx];
                ManagedPartition {
                    name: partition.name.clone(),
                    queue: partition.queue.clone(),
                    functional: partition.functional,
                    scheduled: partition.scheduled,
                }
            })
            .collect()
    }

    /// Re-apply a persisted managed set after configure. Names the
    /// topology no longer defines are logged and dropped.
    pub fn restore_managed(&mut self, parts: &[ManagedPartition]) {
        for part in parts {
            match self.partition_index.get(part.name.as_str()) {
                Some(&idx) => {
                    let partition = &mut self.partitions[idx];
                    partition.queue = part.queue.clone();
                    partition.functional = part.functional;
                    partition.scheduled = part.scheduled;
                    self.managed.insert(idx);
                }
                None => {
                    tracing::warn!(
                        partition = %part.name,
                        "Dropping persisted partition absent from topology"
                    );
                }
            }
        }
        self.rebuild_relationships();
    }
}

impl Default for PartitionGraph {
    fn default() -> Self {
        Self::new()
    }
}
