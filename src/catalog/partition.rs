use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Scheduling policy limits shared by every job in a partition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionLimits {
    /// Longest time limit a job may request.
    pub max_time: Option<Duration>,
    /// Most nodes a single job may span.
    pub max_nodes_per_job: Option<u32>,
    /// Added to each job's own priority.
    pub priority_weight: i64,
    /// Time limit applied to jobs that do not declare one.
    pub default_time: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    pub name: String,
    /// Member node names in registration order.
    pub nodes: Vec<String>,
    pub limits: PartitionLimits,
    /// Jobs that name no partition land here.
    pub is_default: bool,
}

impl Partition {
    pub fn new(name: impl Into<String>, limits: PartitionLimits) -> Self {
        Self {
            name: name.into(),
            nodes: Vec::new(),
            limits,
            is_default: false,
        }
    }

    pub fn as_default(mut self) -> Self {
        self.is_default = true;
        self
    }

    pub fn with_nodes<I, S>(mut self, nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.nodes = nodes.into_iter().map(Into::into).collect();
        self
    }

    pub fn contains(&self, node: &str) -> bool {
        self.nodes.iter().any(|n| n == node)
    }

    pub(crate) fn add_member(&mut self, node: &str) {
        if !self.contains(node) {
            self.nodes.push(node.to_string());
        }
    }

    pub(crate) fn remove_member(&mut self, node: &str) {
        self.nodes.retain(|n| n != node);
    }
}
