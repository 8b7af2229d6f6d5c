use chrono::{DateTime, Utc};
use tokio::sync::oneshot;

use crate::catalog::{AdminState, Partition};
use crate::error::Result;
use crate::resources::ResourceVector;
use crate::scheduler::job::{ExitStatus, JobId, JobSpec, Principal};

pub type Reply<T> = oneshot::Sender<Result<T>>;

/// Everything the controller task reacts to. Requests carry a reply
/// channel; notifications from nodes and timers do not.
#[derive(Debug)]
pub enum Event {
    Submit {
        spec: JobSpec,
        submitter: Principal,
        reply: Reply<JobId>,
    },
    Cancel {
        job_id: JobId,
        by: Principal,
        reply: Reply<()>,
    },
    RegisterNode {
        name: String,
        capacity: ResourceVector,
        partitions: Vec<String>,
        reply: Reply<()>,
    },
    DeregisterNode {
        name: String,
        reply: Reply<()>,
    },
    SetNodeState {
        name: String,
        state: AdminState,
        reply: Reply<()>,
    },
    ReplacePartitions {
        partitions: Vec<Partition>,
        reply: Reply<()>,
    },
    SerializeState {
        reply: Reply<Vec<u8>>,
    },
    /// `timestamp` is the node's own clock.
    Heartbeat {
        node: String,
        timestamp: DateTime<Utc>,
    },
    NodeUnreachable {
        node: String,
    },
    /// `run` is the generation from the launch, when the reporter knows it.
    JobExited {
        job_id: JobId,
        run: Option<u32>,
        status: ExitStatus,
    },
    TimeLimitExpired {
        job_id: JobId,
        run: u32,
    },
    SweepHeartbeats,
}

impl Event {
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Submit { .. } => "submit",
            Event::Cancel { .. } => "cancel",
            Event::RegisterNode { .. } => "register_node",
            Event::DeregisterNode { .. } => "deregister_node",
            Event::SetNodeState { .. } => "set_node_state",
            Event::ReplacePartitions { .. } => "replace_partitions",
            Event::SerializeState { .. } => "serialize_state",
            Event::Heartbeat { .. } => "heartbeat",
            Event::NodeUnreachable { .. } => "node_unreachable",
            Event::JobExited { .. } => "job_exited",
            Event::TimeLimitExpired { .. } => "time_limit_expired",
            Event::SweepHeartbeats => "sweep_heartbeats",
        }
    }

    /// Whether handling the event can change scheduler state.
    pub fn is_mutating(&self) -> bool {
        !matches!(self, Event::SerializeState { .. })
    }
}
