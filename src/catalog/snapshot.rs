use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::catalog::node::Node;
use crate::catalog::partition::Partition;
use crate::resources::ResourceVector;

/// Immutable point-in-time copy of the catalog.
///
/// The allocator reasons over a snapshot so the expensive placement search
/// never runs against live node state.
#[derive(Debug, Clone)]
pub struct CatalogSnapshot {
    pub taken_at: DateTime<Utc>,
    nodes: BTreeMap<String, Node>,
    partitions: BTreeMap<String, Partition>,
}

impl CatalogSnapshot {
    pub(crate) fn new(
        taken_at: DateTime<Utc>,
        nodes: BTreeMap<String, Node>,
        partitions: BTreeMap<String, Partition>,
    ) -> Self {
        Self {
            taken_at,
            nodes,
            partitions,
        }
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

    pub fn default_partition(&self) -> Option<&Partition> {
        self.partitions.values().find(|p| p.is_default)
    }

    /// Member nodes of a partition that exist in this snapshot.
    pub fn partition_nodes<'a>(&'a self, partition: &'a str) -> impl Iterator<Item = &'a Node> {
        self.partitions
            .get(partition)
            .into_iter()
            .flat_map(|p| p.nodes.iter())
            .filter_map(|name| self.nodes.get(name))
    }

    /// Whether any member of the partition is currently UP.
    pub fn partition_has_up_node(&self, partition: &str) -> bool {
        self.partition_nodes(partition).any(|n| n.is_schedulable())
    }

    /// A copy of this snapshot with each node's availability replaced by `f`.
    pub fn with_availability<F>(&self, mut f: F) -> CatalogSnapshot
    where
        F: FnMut(&Node) -> ResourceVector,
    {
        let nodes = self
            .nodes
            .iter()
            .map(|(name, node)| {
                let mut node = node.clone();
                node.available = f(&node).component_min(&node.total);
                (name.clone(), node)
            })
            .collect();
        CatalogSnapshot {
            taken_at: self.taken_at,
            nodes,
            partitions: self.partitions.clone(),
        }
    }
}
