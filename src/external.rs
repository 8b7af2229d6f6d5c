//! Narrow interfaces to the systems the scheduler drives: the execution
//! layer that runs jobs on nodes and the accounting sink that records
//! finished jobs.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::resources::ResourceVector;
use crate::scheduler::job::{ExitStatus, Job, JobId, JobState, Principal, StateReason};

/// Everything an execution layer needs to start one run of a job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobLaunch {
    pub job_id: JobId,
    /// Run generation, echoed back when reporting the exit.
    pub run: u32,
    pub name: Option<String>,
    pub submitter: Principal,
    pub command: Option<String>,
    pub allocation: BTreeMap<String, ResourceVector>,
    pub time_limit: Option<Duration>,
}

/// Final record of a job, handed to accounting once it is terminal.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobRecord {
    pub job_id: JobId,
    pub name: Option<String>,
    pub submitter: String,
    pub partition: String,
    pub state: JobState,
    pub reason: StateReason,
    pub nodes: BTreeSet<String>,
    pub submitted_at: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub exit_status: Option<ExitStatus>,
    pub restarts: u32,
}

impl From<&Job> for JobRecord {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id(),
            name: job.request.name.clone(),
            submitter: job.request.submitter.name.clone(),
            partition: job.request.partition.clone(),
            state: job.state,
            reason: job.reason.clone(),
            nodes: job.last_nodes.clone(),
            submitted_at: job.request.submitted_at,
            start_time: job.start_time,
            end_time: job.end_time,
            exit_status: job.exit_status,
            restarts: job.restarts,
        }
    }
}

/// Starts and stops jobs on nodes. Calls must not block the controller:
/// long work belongs in a spawned task. Exits are reported back through
/// [`ControllerHandle::notify_exited`](crate::controller::ControllerHandle::notify_exited).
pub trait ExecutionLayer: Send + Sync {
    fn start(&self, launch: JobLaunch);

    fn terminate(&self, job_id: JobId, nodes: &BTreeSet<String>);
}

/// Fire-and-forget sink for terminal job records.
pub trait AccountingSink: Send + Sync {
    fn record_terminal_state(&self, record: JobRecord);
}

/// Accepts every launch and never reports an exit. Jobs end only through
/// cancel, time limit or node failure, or an explicit `notify_exited`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullExecutor;

impl ExecutionLayer for NullExecutor {
    fn start(&self, launch: JobLaunch) {
        tracing::debug!(job_id = %launch.job_id, nodes = ?launch.allocation.keys(), "Launch (no-op)");
    }

    fn terminate(&self, job_id: JobId, nodes: &BTreeSet<String>) {
        tracing::debug!(job_id = %job_id, nodes = ?nodes, "Terminate (no-op)");
    }
}

/// Writes one structured log line per finished job.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAccounting;

impl AccountingSink for LogAccounting {
    fn record_terminal_state(&self, record: JobRecord) {
        tracing::info!(
            job_id = %record.job_id,
            user = %record.submitter,
            partition = %record.partition,
            state = %record.state,
            reason = %record.reason,
            nodes = ?record.nodes,
            restarts = record.restarts,
            "Job finished"
        );
    }
}

/// Keeps every call in memory. Useful for tests and dry runs.
#[derive(Debug, Default)]
pub struct RecordingExecutor {
    launches: Mutex<Vec<JobLaunch>>,
    terminations: Mutex<Vec<(JobId, BTreeSet<String>)>>,
}

impl RecordingExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn launches(&self) -> Vec<JobLaunch> {
        self.launches
            .lock()
            .map(|l| l.clone())
            .unwrap_or_default()
    }

    pub fn terminations(&self) -> Vec<(JobId, BTreeSet<String>)> {
        self.terminations
            .lock()
            .map(|t| t.clone())
            .unwrap_or_default()
    }
}

impl ExecutionLayer for RecordingExecutor {
    fn start(&self, launch: JobLaunch) {
        if let Ok(mut launches) = self.launches.lock() {
            launches.push(launch);
        }
    }

    fn terminate(&self, job_id: JobId, nodes: &BTreeSet<String>) {
        if let Ok(mut terminations) = self.terminations.lock() {
            terminations.push((job_id, nodes.clone()));
        }
    }
}

#[derive(Debug, Default)]
pub struct RecordingAccounting {
    records: Mutex<Vec<JobRecord>>,
}

impl RecordingAccounting {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<JobRecord> {
        self.records
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

impl AccountingSink for RecordingAccounting {
    fn record_terminal_state(&self, record: JobRecord) {
        if let Ok(mut records) = self.records.lock() {
            records.push(record);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::job::{JobRequest, ResourceRequest};

    #[test]
    fn record_reports_last_nodes() {
        let mut job = Job::new(JobRequest {
            id: JobId(4),
            name: Some("sim".into()),
            partition: "batch".into(),
            resources: ResourceRequest::single(ResourceVector::new(1, 1)),
            submitter: Principal::user("alice"),
            priority: 0,
            submitted_at: Utc::now(),
            time_limit: None,
            dependencies: Vec::new(),
            requeue: false,
            command: None,
        });
        job.start(["n1".to_string()].into_iter().collect(), Utc::now())
            .unwrap();
        job.cancel("alice", Utc::now()).unwrap();

        let record = JobRecord::from(&job);
        assert_eq!(record.state, JobState::Cancelled);
        assert_eq!(record.submitter, "alice");
        assert!(record.nodes.contains("n1"));
        assert_eq!(record.reason, StateReason::CancelledBy("alice".into()));
    }

    #[test]
    fn recording_executor_keeps_calls() {
        let exec = RecordingExecutor::new();
        exec.terminate(JobId(1), &BTreeSet::new());
        assert_eq!(exec.terminations().len(), 1);
        assert!(exec.launches().is_empty());
    }
}
