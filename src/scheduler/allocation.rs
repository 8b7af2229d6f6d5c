use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::resources::ResourceVector;
use crate::scheduler::job::JobId;

/// Resources one job holds on each of its nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationRecord {
    pub job_id: JobId,
    pub nodes: BTreeMap<String, ResourceVector>,
}

impl AllocationRecord {
    pub fn node_names(&self) -> BTreeSet<String> {
        self.nodes.keys().cloned().collect()
    }

    pub fn total(&self) -> ResourceVector {
        self.nodes
            .values()
            .fold(ResourceVector::zero(), |acc, v| acc.saturating_add(v))
    }
}

/// Job ↔ node allocation relation, indexed both ways.
#[derive(Debug, Default, Clone)]
pub struct AllocationTable {
    by_job: BTreeMap<JobId, AllocationRecord>,
    by_node: BTreeMap<String, BTreeSet<JobId>>,
}

impl AllocationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, record: AllocationRecord) {
        for node in record.nodes.keys() {
            self.by_node
                .entry(node.clone())
                .or_default()
                .insert(record.job_id);
        }
        if let Some(old) = self.by_job.insert(record.job_id, record) {
            tracing::error!(job_id = %old.job_id, "Allocation record replaced");
        }
    }

    /// Remove and return a job's record. A second call returns `None`.
    pub fn remove(&mut self, job_id: JobId) -> Option<AllocationRecord> {
        let record = self.by_job.remove(&job_id)?;
        for node in record.nodes.keys() {
            if let Some(jobs) = self.by_node.get_mut(node) {
                jobs.remove(&job_id);
                if jobs.is_empty() {
                    self.by_node.remove(node);
                }
            }
        }
        Some(record)
    }

    pub fn get(&self, job_id: JobId) -> Option<&AllocationRecord> {
        self.by_job.get(&job_id)
    }

    pub fn jobs_on(&self, node: &str) -> Vec<JobId> {
        self.by_node
            .get(node)
            .map(|jobs| jobs.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Sum of everything allocated on a node.
    pub fn allocated_on(&self, node: &str) -> ResourceVector {
        self.by_node
            .get(node)
            .into_iter()
            .flatten()
            .filter_map(|id| self.by_job.get(id))
            .filter_map(|r| r.nodes.get(node))
            .fold(ResourceVector::zero(), |acc, v| acc.saturating_add(v))
    }

    pub fn records(&self) -> impl Iterator<Item = &AllocationRecord> {
        self.by_job.values()
    }

    pub fn len(&self) -> usize {
        self.by_job.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_job.is_empty()
    }
}
