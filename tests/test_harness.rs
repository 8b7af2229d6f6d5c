//! Test harness for controller integration tests.
//!
//! Spawns a controller task over an in-memory cluster with recording
//! execution and accounting layers.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use slurm_lite::catalog::{Partition, PartitionLimits, ResourceCatalog};
use slurm_lite::config::ControllerConfig;
use slurm_lite::controller::{ClusterView, Controller, ControllerHandle, SchedulerCore};
use slurm_lite::error::Result;
use slurm_lite::external::{RecordingAccounting, RecordingExecutor};
use slurm_lite::persistence::StateStore;
use slurm_lite::resources::ResourceVector;
use slurm_lite::scheduler::{JobId, JobSpec, JobState, ResourceRequest};

/// Config with timeouts short enough for tests but long enough that
/// nothing fires unless the test waits for it.
pub fn test_config() -> ControllerConfig {
    ControllerConfig::default()
        .with_heartbeat_timeout(Duration::from_secs(3600))
        .with_sweep_interval(Duration::from_millis(20))
}

/// One default "batch" partition with `nodes`, each with 8192 MB.
pub fn test_catalog(nodes: &[(&str, u32)]) -> ResourceCatalog {
    let mut catalog = ResourceCatalog::with_partitions(vec![Partition::new(
        "batch",
        PartitionLimits::default(),
    )
    .as_default()])
    .unwrap();
    for (name, cpus) in nodes {
        catalog
            .register_node(name, ResourceVector::new(*cpus, 8192), &["batch".into()], Utc::now())
            .unwrap();
    }
    catalog
}

pub fn cpus(n: u32) -> JobSpec {
    JobSpec::new(ResourceRequest::single(ResourceVector::new(n, 1024)))
}

/// Handle to a running controller
pub struct TestCluster {
    pub handle: ControllerHandle,
    pub executor: Arc<RecordingExecutor>,
    pub accounting: Arc<RecordingAccounting>,
    shutdown: CancellationToken,
    task: JoinHandle<Result<()>>,
}

impl TestCluster {
    pub fn start(nodes: &[(&str, u32)]) -> Self {
        Self::with_config(nodes, test_config())
    }

    pub fn with_config(nodes: &[(&str, u32)], config: ControllerConfig) -> Self {
        let core = SchedulerCore::new(config, test_catalog(nodes));
        let (controller, handle) = Controller::new(core);
        Self::spawn(controller, handle)
    }

    /// Recover from `store`, falling back to a fresh catalog.
    pub fn recover(
        nodes: &[(&str, u32)],
        config: ControllerConfig,
        store: Arc<dyn StateStore>,
    ) -> Self {
        let (controller, handle) = Controller::recover(config, test_catalog(nodes), store).unwrap();
        Self::spawn(controller, handle)
    }

    fn spawn(controller: Controller, handle: ControllerHandle) -> Self {
        let executor = Arc::new(RecordingExecutor::new());
        let accounting = Arc::new(RecordingAccounting::new());
        let controller = controller
            .with_executor(executor.clone())
            .with_accounting(accounting.clone());
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(controller.run(shutdown.clone()));
        Self {
            handle,
            executor,
            accounting,
            shutdown,
            task,
        }
    }

    /// Wait until `job_id` reaches `state`.
    pub async fn wait_for_state(&self, job_id: JobId, state: JobState) -> Arc<ClusterView> {
        self.handle
            .wait_for(Duration::from_secs(5), |view| {
                view.job(job_id).is_some_and(|j| j.state == state)
            })
            .await
            .unwrap_or_else(|_| panic!("job {} never reached {}", job_id, state))
    }

    pub fn state_of(&self, job_id: JobId) -> JobState {
        self.handle.query_status(Some(job_id)).unwrap()[0].state
    }

    /// Stop the controller and wait for its final persist.
    pub async fn shutdown(self) -> Result<()> {
        self.shutdown.cancel();
        self.task.await.unwrap()
    }
}
