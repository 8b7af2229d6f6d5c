use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::resources::ResourceVector;

/// Monotonically assigned job identifier. Never reused, including across restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A verified identity handed to the core by the authentication layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub name: String,
    /// Operators may cancel any job.
    #[serde(default)]
    pub operator: bool,
}

impl Principal {
    pub fn user(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            operator: false,
        }
    }

    pub fn operator(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            operator: true,
        }
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceRequest {
    /// `nodes` nodes, each supplying `per_node`.
    PerNode { nodes: u32, per_node: ResourceVector },
    /// `total` divided across exactly `nodes` nodes.
    Total { nodes: u32, total: ResourceVector },
}

impl ResourceRequest {
    pub fn single(per_node: ResourceVector) -> Self {
        ResourceRequest::PerNode { nodes: 1, per_node }
    }

    pub fn nodes(&self) -> u32 {
        match self {
            ResourceRequest::PerNode { nodes, .. } | ResourceRequest::Total { nodes, .. } => *nodes,
        }
    }

    /// Per-node shares in non-increasing order.
    pub fn shares(&self) -> Vec<ResourceVector> {
        match self {
            ResourceRequest::PerNode { nodes, per_node } => vec![per_node.clone(); *nodes as usize],
            ResourceRequest::Total { nodes, total } => total.split(*nodes),
        }
    }

    pub fn total(&self) -> ResourceVector {
        match self {
            ResourceRequest::PerNode { nodes, per_node } => per_node.scaled(*nodes),
            ResourceRequest::Total { total, .. } => total.clone(),
        }
    }
}

/// What a submitter asks for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub partition: Option<String>,
    pub resources: ResourceRequest,
    #[serde(default)]
    pub priority: u32,
    #[serde(default)]
    pub time_limit: Option<Duration>,
    #[serde(default)]
    pub dependencies: Vec<JobId>,
    /// Overrides the controller's requeue-on-node-fail default.
    #[serde(default)]
    pub requeue: Option<bool>,
    /// Shell command for execution layers that run processes.
    #[serde(default)]
    pub command: Option<String>,
}

impl JobSpec {
    pub fn new(resources: ResourceRequest) -> Self {
        Self {
            name: None,
            partition: None,
            resources,
            priority: 0,
            time_limit: None,
            dependencies: Vec::new(),
            requeue: None,
            command: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn in_partition(mut self, partition: impl Into<String>) -> Self {
        self.partition = Some(partition.into());
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_time_limit(mut self, limit: Duration) -> Self {
        self.time_limit = Some(limit);
        self
    }

    pub fn after(mut self, dependency: JobId) -> Self {
        self.dependencies.push(dependency);
        self
    }

    pub fn with_requeue(mut self, requeue: bool) -> Self {
        self.requeue = Some(requeue);
        self
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }
}

/// An accepted submission. Immutable after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    pub id: JobId,
    pub name: Option<String>,
    pub partition: String,
    pub resources: ResourceRequest,
    pub submitter: Principal,
    /// Job priority plus the partition's priority weight.
    pub priority: i64,
    pub submitted_at: DateTime<Utc>,
    /// Declared limit, or the partition default.
    pub time_limit: Option<Duration>,
    pub dependencies: Vec<JobId>,
    pub requeue: bool,
    pub command: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Pending,
    Running,
    Completing,
    Completed,
    Failed,
    Cancelled,
    NodeFail,
}

impl JobState {
    pub fn holds_nodes(self) -> bool {
        matches!(self, JobState::Running | JobState::Completing)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Pending => "PENDING",
            JobState::Running => "RUNNING",
            JobState::Completing => "COMPLETING",
            JobState::Completed => "COMPLETED",
            JobState::Failed => "FAILED",
            JobState::Cancelled => "CANCELLED",
            JobState::NodeFail => "NODE_FAIL",
        };
        f.write_str(s)
    }
}

/// Why a job is in its current state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateReason {
    None,
    /// Waiting for resources to free up.
    Resources,
    /// Resources exist but are held for a higher-priority job.
    Priority,
    /// Waiting on a dependency to complete.
    Dependency,
    InvalidRequest(String),
    DependencyNeverSatisfied(JobId),
    NonZeroExit(i32),
    TimeLimit,
    NodeFail(String),
    CancelledBy(String),
    /// Allocation could not be matched to live nodes after a restart.
    Reconciled,
}

impl fmt::Display for StateReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateReason::None => f.write_str("None"),
            StateReason::Resources => f.write_str("Resources"),
            StateReason::Priority => f.write_str("Priority"),
            StateReason::Dependency => f.write_str("Dependency"),
            StateReason::InvalidRequest(msg) => write!(f, "InvalidRequest({})", msg),
            StateReason::DependencyNeverSatisfied(id) => {
                write!(f, "DependencyNeverSatisfied({})", id)
            }
            StateReason::NonZeroExit(code) => write!(f, "NonZeroExitCode({})", code),
            StateReason::TimeLimit => f.write_str("TimeLimit"),
            StateReason::NodeFail(node) => write!(f, "NodeFail({})", node),
            StateReason::CancelledBy(user) => write!(f, "CancelledBy({})", user),
            StateReason::Reconciled => f.write_str("Reconciled"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitStatus {
    Code(i32),
    /// Terminated by signal or by the execution layer.
    Killed,
}

impl ExitStatus {
    pub fn success(self) -> bool {
        self == ExitStatus::Code(0)
    }
}

/// A job and its lifecycle fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub request: JobRequest,
    pub state: JobState,
    pub reason: StateReason,
    /// Non-empty exactly while RUNNING or COMPLETING.
    pub assigned_nodes: BTreeSet<String>,
    /// Nodes of the most recent run, kept for reporting after reclaim.
    pub last_nodes: BTreeSet<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub exit_status: Option<ExitStatus>,
    /// Bumped on every start so stale timer events can be told apart.
    pub run: u32,
    pub restarts: u32,
}

impl Job {
    pub fn new(request: JobRequest) -> Self {
        Self {
            request,
            state: JobState::Pending,
            reason: StateReason::None,
            assigned_nodes: BTreeSet::new(),
            last_nodes: BTreeSet::new(),
            start_time: None,
            end_time: None,
            exit_status: None,
            run: 0,
            restarts: 0,
        }
    }

    pub fn id(&self) -> JobId {
        self.request.id
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Projected release time of a running job, `None` when unbounded.
    pub fn projected_end(&self) -> Option<DateTime<Utc>> {
        let start = self.start_time?;
        end_after(start, self.request.time_limit)
    }
}

/// `start + limit`, or `None` for no limit or overflow.
pub fn end_after(start: DateTime<Utc>, limit: Option<Duration>) -> Option<DateTime<Utc>> {
    let limit = chrono::Duration::from_std(limit?).ok()?;
    start.checked_add_signed(limit)
}
