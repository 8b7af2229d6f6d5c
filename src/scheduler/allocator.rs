//! Feasibility checks and concrete node placement.
//!
//! Placement is all-or-nothing: either every share of a request lands on a
//! distinct node, or nothing is returned and the job stays pending.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use crate::catalog::{CatalogSnapshot, Node};
use crate::resources::ResourceVector;
use crate::scheduler::allocation::AllocationRecord;
use crate::scheduler::job::JobRequest;
use crate::scheduler::policy::PlacementPolicy;

#[derive(Debug, Clone)]
pub struct Allocator {
    policy: Arc<dyn PlacementPolicy>,
    heartbeat_timeout: chrono::Duration,
}

impl Allocator {
    pub fn new(policy: Arc<dyn PlacementPolicy>, heartbeat_timeout: Duration) -> Self {
        Self {
            policy,
            heartbeat_timeout: chrono::Duration::from_std(heartbeat_timeout)
                .unwrap_or(chrono::Duration::MAX),
        }
    }

    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }

    /// Whether the request could ever run in its partition, judged against
    /// total capacity and partition limits. Returns the reason it cannot.
    pub fn validate(&self, request: &JobRequest, snapshot: &CatalogSnapshot) -> Result<(), String> {
        let partition = snapshot
            .partition(&request.partition)
            .ok_or_else(|| format!("partition {} does not exist", request.partition))?;
        let nodes = request.resources.nodes();
        if nodes == 0 {
            return Err("a job needs at least one node".to_string());
        }
        if let Some(max) = partition.limits.max_nodes_per_job {
            if nodes > max {
                return Err(format!(
                    "requested {} nodes, partition {} allows {}",
                    nodes, partition.name, max
                ));
            }
        }
        if let (Some(limit), Some(max)) = (request.time_limit, partition.limits.max_time) {
            if limit > max {
                return Err(format!(
                    "time limit {}s exceeds partition {} maximum {}s",
                    limit.as_secs(),
                    partition.name,
                    max.as_secs()
                ));
            }
        }

        let members: Vec<(&Node, ResourceVector)> = snapshot
            .partition_nodes(&request.partition)
            .map(|n| (n, n.total.clone()))
            .collect();
        let capacity = members
            .iter()
            .fold(ResourceVector::zero(), |acc, (_, t)| acc.saturating_add(t));
        let total = request.resources.total();
        if !total.fits_within(&capacity) {
            return Err(format!(
                "requested {} exceeds partition {} capacity {}",
                total, partition.name, capacity
            ));
        }
        if self.place(&request.resources.shares(), &members).is_none() {
            return Err(format!(
                "partition {} has no {} nodes able to hold {}",
                partition.name,
                nodes,
                request.resources.shares().first().cloned().unwrap_or_default()
            ));
        }
        Ok(())
    }

    /// Concrete placement against the snapshot, or `None` if the job does not
    /// fit right now.
    pub fn try_allocate(
        &self,
        request: &JobRequest,
        snapshot: &CatalogSnapshot,
    ) -> Option<AllocationRecord> {
        let shares = request.resources.shares();
        let smallest = shares.last()?;
        let candidates: Vec<(&Node, ResourceVector)> = snapshot
            .partition_nodes(&request.partition)
            .filter(|n| n.is_schedulable())
            .filter(|n| n.heartbeat_age(snapshot.taken_at) <= self.heartbeat_timeout)
            .filter(|n| smallest.fits_within(&n.available))
            .map(|n| (n, n.available.clone()))
            .collect();

        if candidates.len() < shares.len() {
            return None;
        }
        let pooled = candidates
            .iter()
            .fold(ResourceVector::zero(), |acc, (_, a)| acc.saturating_add(a));
        if !request.resources.total().fits_within(&pooled) {
            return None;
        }

        let nodes = self.place(&shares, &candidates)?;
        Some(AllocationRecord {
            job_id: request.id,
            nodes,
        })
    }

    /// Assign shares (largest first) to distinct nodes, each to the best
    /// ranked node that can hold it. `room` is what each node offers.
    fn place(
        &self,
        shares: &[ResourceVector],
        candidates: &[(&Node, ResourceVector)],
    ) -> Option<BTreeMap<String, ResourceVector>> {
        let mut used: BTreeSet<&str> = BTreeSet::new();
        let mut placed = BTreeMap::new();
        for share in shares {
            let (node, _) = candidates
                .iter()
                .filter(|(n, _)| !used.contains(n.name.as_str()))
                .filter(|(_, room)| share.fits_within(room))
                .min_by(|(a, room_a), (b, room_b)| {
                    self.rank(a, room_a, share)
                        .cmp(&self.rank(b, room_b, share))
                        .then_with(|| a.name.cmp(&b.name))
                })?;
            used.insert(node.name.as_str());
            placed.insert(node.name.clone(), share.clone());
        }
        Some(placed)
    }

    fn rank(&self, node: &Node, room: &ResourceVector, share: &ResourceVector) -> u64 {
        if &node.available == room {
            return self.policy.rank(node, share);
        }
        let mut view = node.clone();
        view.available = room.clone();
        self.policy.rank(&view, share)
    }
}
