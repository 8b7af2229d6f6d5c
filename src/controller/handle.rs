use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};

use crate::catalog::{AdminState, Partition};
use crate::controller::event::Event;
use crate::controller::view::{ClusterView, JobStatusView};
use crate::error::{Result, SchedError};
use crate::resources::ResourceVector;
use crate::scheduler::job::{ExitStatus, JobId, JobSpec, Principal};

/// Cloneable front door to the controller task.
///
/// Requests wait for channel capacity and then for an acknowledgement,
/// bounded by the configured ack timeout. Status queries read the latest
/// published view and never touch the controller.
#[derive(Debug, Clone)]
pub struct ControllerHandle {
    tx: mpsc::Sender<Event>,
    view: watch::Receiver<Arc<ClusterView>>,
    ack_timeout: Duration,
}

impl ControllerHandle {
    pub(crate) fn new(
        tx: mpsc::Sender<Event>,
        view: watch::Receiver<Arc<ClusterView>>,
        ack_timeout: Duration,
    ) -> Self {
        Self {
            tx,
            view,
            ack_timeout,
        }
    }

    /// Raw event sender, for components that inject their own events.
    pub fn event_sender(&self) -> mpsc::Sender<Event> {
        self.tx.clone()
    }

    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<Result<T>>) -> Event) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| SchedError::ControllerUnavailable)?;
        self.await_ack(rx).await
    }

    async fn await_ack<T>(&self, rx: oneshot::Receiver<Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.ack_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SchedError::ControllerUnavailable),
            Err(_) => Err(SchedError::Timeout),
        }
    }

    async fn notify(&self, event: Event) -> Result<()> {
        self.tx
            .send(event)
            .await
            .map_err(|_| SchedError::ControllerUnavailable)
    }

    /// Submit a job. Returns once the job is queued and persisted.
    pub async fn submit(&self, spec: JobSpec, submitter: Principal) -> Result<JobId> {
        self.request(|reply| Event::Submit {
            spec,
            submitter,
            reply,
        })
        .await
    }

    /// Like [`submit`](Self::submit) but fails with
    /// [`SchedError::Backpressure`] instead of waiting for channel capacity.
    pub async fn try_submit(&self, spec: JobSpec, submitter: Principal) -> Result<JobId> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .try_send(Event::Submit {
                spec,
                submitter,
                reply,
            })
            .map_err(|e| match e {
                TrySendError::Full(_) => SchedError::Backpressure,
                TrySendError::Closed(_) => SchedError::ControllerUnavailable,
            })?;
        self.await_ack(rx).await
    }

    pub async fn cancel(&self, job_id: JobId, by: Principal) -> Result<()> {
        self.request(|reply| Event::Cancel { job_id, by, reply }).await
    }

    pub async fn register_node(
        &self,
        name: impl Into<String>,
        capacity: ResourceVector,
        partitions: Vec<String>,
    ) -> Result<()> {
        let name = name.into();
        self.request(|reply| Event::RegisterNode {
            name,
            capacity,
            partitions,
            reply,
        })
        .await
    }

    pub async fn deregister_node(&self, name: impl Into<String>) -> Result<()> {
        let name = name.into();
        self.request(|reply| Event::DeregisterNode { name, reply })
            .await
    }

    pub async fn set_node_admin_state(&self, name: impl Into<String>, state: AdminState) -> Result<()> {
        let name = name.into();
        self.request(|reply| Event::SetNodeState { name, state, reply })
            .await
    }

    pub async fn replace_partitions(&self, partitions: Vec<Partition>) -> Result<()> {
        self.request(|reply| Event::ReplacePartitions { partitions, reply })
            .await
    }

    pub async fn serialize_state(&self) -> Result<Vec<u8>> {
        self.request(|reply| Event::SerializeState { reply }).await
    }

    /// Liveness report. Timestamps ahead of the controller's clock are
    /// taken as the controller's current time.
    pub async fn notify_node_heartbeat(
        &self,
        node: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        self.notify(Event::Heartbeat {
            node: node.into(),
            timestamp,
        })
        .await
    }

    pub async fn notify_node_unreachable(&self, node: impl Into<String>) -> Result<()> {
        self.notify(Event::NodeUnreachable { node: node.into() })
            .await
    }

    pub async fn notify_exited(&self, job_id: JobId, status: ExitStatus) -> Result<()> {
        self.notify(Event::JobExited {
            job_id,
            run: None,
            status,
        })
        .await
    }

    /// Exit report tied to a specific run, so a late report from an earlier
    /// run of a requeued job is ignored.
    pub async fn notify_run_exited(&self, job_id: JobId, run: u32, status: ExitStatus) -> Result<()> {
        self.notify(Event::JobExited {
            job_id,
            run: Some(run),
            status,
        })
        .await
    }

    /// Latest published view.
    pub fn view(&self) -> Arc<ClusterView> {
        self.view.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<ClusterView>> {
        self.view.clone()
    }

    /// One job, or every job when `job_id` is `None`.
    pub fn query_status(&self, job_id: Option<JobId>) -> Result<Vec<JobStatusView>> {
        let view = self.view();
        match job_id {
            Some(id) => view
                .job(id)
                .cloned()
                .map(|j| vec![j])
                .ok_or(SchedError::UnknownJob(id)),
            None => Ok(view.jobs.clone()),
        }
    }

    /// Wait until a published view satisfies `done`, or `timeout` elapses.
    pub async fn wait_for<F>(&self, timeout: Duration, mut done: F) -> Result<Arc<ClusterView>>
    where
        F: FnMut(&ClusterView) -> bool,
    {
        let mut rx = self.view.clone();
        let wait = async {
            loop {
                let current = rx.borrow_and_update().clone();
                if done(&current) {
                    return Ok(current);
                }
                if rx.changed().await.is_err() {
                    return Err(SchedError::ControllerUnavailable);
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| SchedError::Timeout)?
    }
}
