//! Authoritative in-memory model of nodes, their capacities and partitions.
//!
//! Only the controller task mutates the catalog. Everything else reads
//! [`CatalogSnapshot`]s.

pub mod node;
pub mod partition;
pub mod snapshot;

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};

use crate::error::{Result, SchedError};
use crate::resources::ResourceVector;

pub use node::{AdminState, DownReason, Node, NodeState};
pub use partition::{Partition, PartitionLimits};
pub use snapshot::CatalogSnapshot;

#[derive(Debug, Default, Clone)]
pub struct ResourceCatalog {
    nodes: BTreeMap<String, Node>,
    partitions: BTreeMap<String, Partition>,
}

impl ResourceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a catalog from a partition set with no nodes yet.
    pub fn with_partitions(partitions: Vec<Partition>) -> Result<Self> {
        let mut catalog = Self::new();
        catalog.replace_partitions(partitions)?;
        Ok(catalog)
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.get(name)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn partition(&self, name: &str) -> Option<&Partition> {
        self.partitions.get(name)
    }

    pub fn partitions(&self) -> impl Iterator<Item = &Partition> {
        self.partitions.values()
    }

    pub fn register_node(
        &mut self,
        name: &str,
        capacity: ResourceVector,
        partitions: &[String],
        now: DateTime<Utc>,
    ) -> Result<()> {
        if self.nodes.contains_key(name) {
            return Err(SchedError::DuplicateNode(name.to_string()));
        }
        if let Some(missing) = partitions.iter().find(|p| !self.partitions.contains_key(*p)) {
            return Err(SchedError::UnknownPartition(missing.clone()));
        }
        for p in partitions {
            if let Some(partition) = self.partitions.get_mut(p) {
                partition.add_member(name);
            }
        }
        let membership: BTreeSet<String> = partitions.iter().cloned().collect();
        tracing::info!(node = name, capacity = %capacity, partitions = ?membership, "Node registered");
        self.nodes.insert(
            name.to_string(),
            Node::new(name.to_string(), capacity, membership, now),
        );
        Ok(())
    }

    /// Remove an idle node and drop it from every partition.
    pub fn deregister_node(&mut self, name: &str) -> Result<Node> {
        let node = self
            .nodes
            .get(name)
            .ok_or_else(|| SchedError::UnknownNode(name.to_string()))?;
        if !node.is_idle() {
            return Err(SchedError::NodeBusy(name.to_string()));
        }
        for partition in self.partitions.values_mut() {
            partition.remove_member(name);
        }
        tracing::info!(node = name, "Node deregistered");
        self.nodes
            .remove(name)
            .ok_or_else(|| SchedError::UnknownNode(name.to_string()))
    }

    /// Record liveness. Returns true when a non-responding node came back.
    pub fn heartbeat(
        &mut self,
        name: &str,
        timestamp: DateTime<Utc>,
        return_to_service: bool,
    ) -> Result<bool> {
        let node = self
            .nodes
            .get_mut(name)
            .ok_or_else(|| SchedError::UnknownNode(name.to_string()))?;
        if timestamp > node.last_heartbeat {
            node.last_heartbeat = timestamp;
        }
        if return_to_service
            && node.state == NodeState::Down
            && node.down_reason == Some(DownReason::NotResponding)
        {
            node.state = node.serviceable_state();
            node.down_reason = None;
            tracing::info!(node = name, state = %node.state, "Node responding again, returned to service");
            return Ok(true);
        }
        Ok(false)
    }

    /// Stop new allocations on a node. Existing allocations stay in place.
    pub fn mark_down(&mut self, name: &str, reason: DownReason) -> Result<()> {
        let node = self.node_mut(name)?;
        if node.state != NodeState::Down {
            tracing::warn!(node = name, reason = ?reason, "Node marked DOWN");
        }
        node.state = NodeState::Down;
        node.down_reason = Some(reason);
        Ok(())
    }

    pub fn mark_up(&mut self, name: &str) -> Result<()> {
        let node = self.node_mut(name)?;
        node.state = NodeState::Up;
        node.down_reason = None;
        node.drain = false;
        tracing::info!(node = name, "Node marked UP");
        Ok(())
    }

    /// DRAINING until the last allocation is released, then DRAINED. A DOWN
    /// node stays DOWN and drains once it is back.
    pub fn drain(&mut self, name: &str) -> Result<()> {
        let node = self.node_mut(name)?;
        node.drain = true;
        if node.state != NodeState::Down {
            node.state = node.serviceable_state();
        }
        tracing::info!(node = name, state = %node.state, "Node draining");
        Ok(())
    }

    pub fn reserve(&mut self, name: &str, request: &ResourceVector) -> Result<()> {
        let node = self.node_mut(name)?;
        if !node.is_schedulable() {
            return Err(SchedError::NodeUnavailable(name.to_string()));
        }
        let remaining = node
            .available
            .checked_sub(request)
            .ok_or_else(|| SchedError::InsufficientResources(name.to_string()))?;
        node.available = remaining;
        Ok(())
    }

    /// Return resources to a node, clamped at its total capacity.
    ///
    /// On `OverRelease` the clamped state has already been applied; the
    /// error only reports that the caller released more than was held.
    pub fn release(&mut self, name: &str, amount: &ResourceVector) -> Result<()> {
        let node = self.node_mut(name)?;
        let (available, clamped) = node.available.add_capped(amount, &node.total);
        node.available = available;
        if node.state == NodeState::Draining && node.is_idle() {
            node.state = NodeState::Drained;
            tracing::info!(node = name, "Node drained");
        }
        if clamped {
            tracing::warn!(node = name, released = %amount, "Release exceeds capacity, clamped");
            return Err(SchedError::OverRelease(name.to_string()));
        }
        Ok(())
    }

    /// Atomically replace every partition. Fails without changes if a
    /// partition names an unknown node or more than one is marked default.
    pub fn replace_partitions(&mut self, partitions: Vec<Partition>) -> Result<()> {
        if let Some(p) = partitions
            .iter()
            .find(|p| p.nodes.iter().any(|n| !self.nodes.contains_key(n)))
        {
            let missing = p
                .nodes
                .iter()
                .find(|n| !self.nodes.contains_key(*n))
                .cloned()
                .unwrap_or_default();
            return Err(SchedError::UnknownNode(missing));
        }
        if partitions.iter().filter(|p| p.is_default).count() > 1 {
            return Err(SchedError::Config(
                "more than one default partition".to_string(),
            ));
        }
        let mut names = BTreeSet::new();
        if let Some(dup) = partitions.iter().find(|p| !names.insert(p.name.clone())) {
            return Err(SchedError::Config(format!(
                "partition {} defined twice",
                dup.name
            )));
        }

        self.partitions = partitions
            .into_iter()
            .map(|p| (p.name.clone(), p))
            .collect();
        for node in self.nodes.values_mut() {
            node.partitions = self
                .partitions
                .values()
                .filter(|p| p.contains(&node.name))
                .map(|p| p.name.clone())
                .collect();
        }
        tracing::info!(count = self.partitions.len(), "Partitions replaced");
        Ok(())
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> CatalogSnapshot {
        CatalogSnapshot::new(now, self.nodes.clone(), self.partitions.clone())
    }

    /// Nodes not already DOWN whose last heartbeat is older than `timeout`.
    pub fn stale_nodes(&self, now: DateTime<Utc>, timeout: chrono::Duration) -> Vec<String> {
        self.nodes
            .values()
            .filter(|n| matches!(n.state, NodeState::Up | NodeState::Draining | NodeState::Drained))
            .filter(|n| n.heartbeat_age(now) > timeout)
            .map(|n| n.name.clone())
            .collect()
    }

    /// Overwrite a node wholesale. Used when restoring persisted state.
    pub(crate) fn insert_restored(&mut self, node: Node) {
        self.nodes.insert(node.name.clone(), node);
    }

    pub(crate) fn insert_restored_partition(&mut self, partition: Partition) {
        self.partitions.insert(partition.name.clone(), partition);
    }

    fn node_mut(&mut self, name: &str) -> Result<&mut Node> {
        self.nodes
            .get_mut(name)
            .ok_or_else(|| SchedError::UnknownNode(name.to_string()))
    }
}
