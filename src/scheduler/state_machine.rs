//! Job lifecycle transitions.
//!
//! ```text
//! PENDING    -> RUNNING | CANCELLED | FAILED
//! RUNNING    -> COMPLETING | NODE_FAIL | CANCELLED
//! COMPLETING -> COMPLETED | FAILED | NODE_FAIL | CANCELLED
//! NODE_FAIL  -> PENDING (requeue)
//! ```
//!
//! Every mutation of [`Job::state`] goes through [`Job::transition`], which
//! also keeps `assigned_nodes` non-empty exactly while RUNNING or COMPLETING.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

use crate::error::{Result, SchedError};
use crate::scheduler::job::{ExitStatus, Job, JobState, StateReason};

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled | JobState::NodeFail
        )
    }

    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Pending, Failed)
                | (Running, Completing)
                | (Running, NodeFail)
                | (Running, Cancelled)
                | (Completing, Completed)
                | (Completing, Failed)
                | (Completing, NodeFail)
                | (Completing, Cancelled)
                | (NodeFail, Pending)
        )
    }
}

impl Job {
    fn transition(&mut self, next: JobState) -> Result<JobState> {
        if !self.state.can_transition_to(next) {
            return Err(SchedError::InvalidTransition {
                job_id: self.id(),
                from: self.state,
                to: next,
            });
        }
        let prev = self.state;
        self.state = next;
        tracing::debug!(job_id = %self.id(), from = %prev, to = %next, "Job transition");
        Ok(prev)
    }

    /// PENDING -> RUNNING on the given nodes.
    pub fn start(&mut self, nodes: BTreeSet<String>, now: DateTime<Utc>) -> Result<()> {
        if nodes.is_empty() {
            return Err(SchedError::InvalidTransition {
                job_id: self.id(),
                from: self.state,
                to: JobState::Running,
            });
        }
        self.transition(JobState::Running)?;
        self.run += 1;
        self.assigned_nodes = nodes;
        self.start_time = Some(now);
        self.end_time = None;
        self.exit_status = None;
        self.reason = StateReason::None;
        Ok(())
    }

    /// RUNNING -> COMPLETING once the execution layer reports an exit.
    pub fn begin_completing(&mut self, exit: ExitStatus, reason: Option<StateReason>) -> Result<()> {
        self.transition(JobState::Completing)?;
        self.exit_status = Some(exit);
        if let Some(reason) = reason {
            self.reason = reason;
        }
        Ok(())
    }

    /// COMPLETING -> COMPLETED or FAILED after resources are reclaimed.
    pub fn finish(&mut self, now: DateTime<Utc>) -> Result<JobState> {
        let exit = self.exit_status.unwrap_or(ExitStatus::Killed);
        let next = if exit.success() {
            JobState::Completed
        } else {
            JobState::Failed
        };
        self.transition(next)?;
        if next == JobState::Failed && self.reason == StateReason::None {
            self.reason = match exit {
                ExitStatus::Code(code) => StateReason::NonZeroExit(code),
                ExitStatus::Killed => StateReason::NonZeroExit(-1),
            };
        }
        self.release_nodes(now);
        Ok(next)
    }

    /// RUNNING/COMPLETING -> NODE_FAIL.
    pub fn node_fail(&mut self, node: &str, now: DateTime<Utc>) -> Result<()> {
        self.transition(JobState::NodeFail)?;
        self.reason = StateReason::NodeFail(node.to_string());
        self.release_nodes(now);
        Ok(())
    }

    /// Same as [`Job::node_fail`] with a reconciliation reason.
    pub fn reconcile_fail(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.transition(JobState::NodeFail)?;
        self.reason = StateReason::Reconciled;
        self.release_nodes(now);
        Ok(())
    }

    /// NODE_FAIL -> PENDING for jobs that requeue on node failure.
    pub fn requeue(&mut self) -> Result<()> {
        self.transition(JobState::Pending)?;
        self.restarts += 1;
        self.start_time = None;
        self.end_time = None;
        self.exit_status = None;
        Ok(())
    }

    /// Any non-terminal state -> CANCELLED.
    pub fn cancel(&mut self, by: &str, now: DateTime<Utc>) -> Result<()> {
        self.transition(JobState::Cancelled)?;
        self.reason = StateReason::CancelledBy(by.to_string());
        self.release_nodes(now);
        Ok(())
    }

    /// PENDING -> FAILED for requests that can never be satisfied.
    pub fn fail_pending(&mut self, reason: StateReason, now: DateTime<Utc>) -> Result<()> {
        self.transition(JobState::Failed)?;
        self.reason = reason;
        self.end_time = Some(now);
        Ok(())
    }

    fn release_nodes(&mut self, now: DateTime<Utc>) {
        if !self.assigned_nodes.is_empty() {
            self.last_nodes = std::mem::take(&mut self.assigned_nodes);
        }
        self.end_time = Some(now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::ResourceVector;
    use crate::scheduler::job::{JobId, JobRequest, Principal, ResourceRequest};

    fn pending_job() -> Job {
        Job::new(JobRequest {
            id: JobId(1),
            name: None,
            partition: "batch".into(),
            resources: ResourceRequest::single(ResourceVector::new(1, 1)),
            submitter: Principal::user("alice"),
            priority: 0,
            submitted_at: Utc::now(),
            time_limit: None,
            dependencies: Vec::new(),
            requeue: true,
            command: None,
        })
    }

    fn nodes(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn happy_path_keeps_node_invariant() {
        let mut job = pending_job();
        assert!(job.assigned_nodes.is_empty());
        job.start(nodes(&["n1"]), Utc::now()).unwrap();
        assert_eq!(job.state, JobState::Running);
        assert_eq!(job.run, 1);
        assert!(!job.assigned_nodes.is_empty());

        job.begin_completing(ExitStatus::Code(0), None).unwrap();
        assert!(!job.assigned_nodes.is_empty());
        assert_eq!(job.finish(Utc::now()).unwrap(), JobState::Completed);
        assert!(job.assigned_nodes.is_empty());
        assert_eq!(job.last_nodes, nodes(&["n1"]));
    }

    #[test]
    fn non_zero_exit_fails() {
        let mut job = pending_job();
        job.start(nodes(&["n1"]), Utc::now()).unwrap();
        job.begin_completing(ExitStatus::Code(3), None).unwrap();
        assert_eq!(job.finish(Utc::now()).unwrap(), JobState::Failed);
        assert_eq!(job.reason, StateReason::NonZeroExit(3));
    }

    #[test]
    fn start_requires_nodes() {
        let mut job = pending_job();
        assert!(job.start(BTreeSet::new(), Utc::now()).is_err());
        assert_eq!(job.state, JobState::Pending);
    }

    #[test]
    fn illegal_transitions_leave_job_untouched() {
        let mut job = pending_job();
        let before = job.clone();
        assert!(matches!(
            job.begin_completing(ExitStatus::Code(0), None),
            Err(SchedError::InvalidTransition { .. })
        ));
        assert!(job.requeue().is_err());
        assert_eq!(job, before);

        job.cancel("alice", Utc::now()).unwrap();
        assert!(job.cancel("alice", Utc::now()).is_err());
        assert!(job.start(nodes(&["n1"]), Utc::now()).is_err());
    }

    #[test]
    fn node_fail_then_requeue() {
        let mut job = pending_job();
        job.start(nodes(&["n1"]), Utc::now()).unwrap();
        job.node_fail("n1", Utc::now()).unwrap();
        assert_eq!(job.state, JobState::NodeFail);
        assert!(job.assigned_nodes.is_empty());
        job.requeue().unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.restarts, 1);
        job.start(nodes(&["n2"]), Utc::now()).unwrap();
        assert_eq!(job.run, 2);
    }

    #[test]
    fn terminal_states() {
        for state in [
            JobState::Completed,
            JobState::Failed,
            JobState::Cancelled,
            JobState::NodeFail,
        ] {
            assert!(state.is_terminal());
            assert!(!state.can_transition_to(JobState::Cancelled));
        }
        assert!(!JobState::Pending.is_terminal());
        assert!(JobState::Completing.can_transition_to(JobState::Cancelled));
    }
}
