//! Read-only views published after every event.
//!
//! Status queries read the latest [`ClusterView`] from a `watch` channel and
//! never wait on the controller task.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::catalog::{DownReason, NodeState};
use crate::controller::core::SchedulerCore;
use crate::resources::ResourceVector;
use crate::scheduler::job::{ExitStatus, Job, JobId, JobState, StateReason};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobStatusView {
    pub job_id: JobId,
    pub name: Option<String>,
    pub user: String,
    pub partition: String,
    pub state: JobState,
    pub reason: StateReason,
    pub priority: i64,
    /// Current nodes while running, otherwise the nodes of the last run.
    pub nodes: BTreeSet<String>,
    pub submitted_at: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Projected start for a pending job holding a backfill reservation.
    pub estimated_start: Option<DateTime<Utc>>,
    pub exit_status: Option<ExitStatus>,
    pub restarts: u32,
}

impl JobStatusView {
    fn new(job: &Job, estimated_start: Option<DateTime<Utc>>) -> Self {
        let nodes = if job.assigned_nodes.is_empty() {
            job.last_nodes.clone()
        } else {
            job.assigned_nodes.clone()
        };
        Self {
            job_id: job.id(),
            name: job.request.name.clone(),
            user: job.request.submitter.name.clone(),
            partition: job.request.partition.clone(),
            state: job.state,
            reason: job.reason.clone(),
            priority: job.request.priority,
            nodes,
            submitted_at: job.request.submitted_at,
            start_time: job.start_time,
            end_time: job.end_time,
            estimated_start,
            exit_status: job.exit_status,
            restarts: job.restarts,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeView {
    pub name: String,
    pub state: NodeState,
    pub down_reason: Option<DownReason>,
    pub total: ResourceVector,
    pub available: ResourceVector,
    pub partitions: BTreeSet<String>,
    pub jobs: Vec<JobId>,
    pub last_heartbeat: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PartitionView {
    pub name: String,
    pub is_default: bool,
    pub nodes: usize,
    pub up_nodes: usize,
    pub pending: usize,
    pub running: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ClusterView {
    pub generated_at: DateTime<Utc>,
    pub jobs: Vec<JobStatusView>,
    pub nodes: Vec<NodeView>,
    pub partitions: Vec<PartitionView>,
}

impl ClusterView {
    pub fn capture(core: &SchedulerCore, now: DateTime<Utc>) -> Self {
        let jobs: Vec<JobStatusView> = core
            .jobs()
            .map(|job| {
                let estimated = core.reservation(job.id()).map(|r| r.start);
                JobStatusView::new(job, estimated)
            })
            .collect();

        let nodes = core
            .catalog()
            .nodes()
            .map(|n| NodeView {
                name: n.name.clone(),
                state: n.state,
                down_reason: n.down_reason,
                total: n.total.clone(),
                available: n.available.clone(),
                partitions: n.partitions.clone(),
                jobs: core.allocations().jobs_on(&n.name),
                last_heartbeat: n.last_heartbeat,
            })
            .collect();

        let partitions = core
            .catalog()
            .partitions()
            .map(|p| {
                let in_partition = |state: JobState| {
                    jobs.iter()
                        .filter(|j| j.partition == p.name && j.state == state)
                        .count()
                };
                PartitionView {
                    name: p.name.clone(),
                    is_default: p.is_default,
                    nodes: p.nodes.len(),
                    up_nodes: p
                        .nodes
                        .iter()
                        .filter_map(|n| core.catalog().node(n))
                        .filter(|n| n.is_schedulable())
                        .count(),
                    pending: in_partition(JobState::Pending),
                    running: in_partition(JobState::Running),
                }
            })
            .collect();

        Self {
            generated_at: now,
            jobs,
            nodes,
            partitions,
        }
    }

    pub fn job(&self, job_id: JobId) -> Option<&JobStatusView> {
        self.jobs
            .binary_search_by_key(&job_id, |j| j.job_id)
            .ok()
            .map(|i| &self.jobs[i])
    }

    pub fn count(&self, state: JobState) -> usize {
        self.jobs.iter().filter(|j| j.state == state).count()
    }

    /// True when every known job has reached a final state.
    pub fn all_terminal(&self) -> bool {
        self.jobs.iter().all(|j| j.state.is_terminal())
    }
}
