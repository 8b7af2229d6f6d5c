use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::catalog::{Partition, PartitionLimits, ResourceCatalog};
use crate::error::{Result, SchedError};
use crate::resources::ResourceVector;
use crate::scheduler::backfill::{BackfillSettings, UnboundedJobPolicy};
use crate::scheduler::job::{JobId, JobSpec, Principal, ResourceRequest};
use crate::scheduler::policy::PlacementKind;

/// Controller tuning. Every field has a default so a cluster file only
/// needs to name what it changes.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ControllerConfig {
    /// A node silent for longer than this is marked DOWN.
    pub heartbeat_timeout_ms: u64,
    /// How often the controller checks for silent nodes.
    pub heartbeat_sweep_interval_ms: u64,
    /// Bounded event channel size. Senders wait (or fail fast) when full.
    pub event_channel_capacity: usize,
    /// How long a caller waits for the controller to acknowledge a request.
    pub ack_timeout_ms: u64,
    /// Pending jobs considered per scheduling pass.
    pub backfill_depth: usize,
    pub placement: PlacementKind,
    pub unbounded_jobs: UnboundedJobPolicy,
    /// Default for jobs that do not say whether to requeue on node failure.
    pub requeue_on_node_fail: bool,
    pub max_pending_jobs: usize,
    /// Nodes marked DOWN for not responding return to UP on their next heartbeat.
    pub return_to_service: bool,
    /// Where controller state is persisted. No persistence when unset.
    pub state_file: Option<PathBuf>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_ms: 30_000,
            heartbeat_sweep_interval_ms: 5_000,
            event_channel_capacity: 256,
            ack_timeout_ms: 5_000,
            backfill_depth: 100,
            placement: PlacementKind::BestFit,
            unbounded_jobs: UnboundedJobPolicy::Barrier,
            requeue_on_node_fail: true,
            max_pending_jobs: 10_000,
            return_to_service: true,
            state_file: None,
        }
    }
}

impl ControllerConfig {
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn heartbeat_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_sweep_interval_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn backfill_settings(&self) -> BackfillSettings {
        BackfillSettings {
            depth: self.backfill_depth,
            unbounded: self.unbounded_jobs,
        }
    }

    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_sweep_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.event_channel_capacity = capacity;
        self
    }

    pub fn with_unbounded_jobs(mut self, policy: UnboundedJobPolicy) -> Self {
        self.unbounded_jobs = policy;
        self
    }

    pub fn with_state_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_file = Some(path.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.event_channel_capacity == 0 {
            return Err(SchedError::Config(
                "event_channel_capacity must be positive".to_string(),
            ));
        }
        if self.heartbeat_timeout_ms == 0 || self.heartbeat_sweep_interval_ms == 0 {
            return Err(SchedError::Config(
                "heartbeat timeout and sweep interval must be positive".to_string(),
            ));
        }
        if self.backfill_depth == 0 {
            return Err(SchedError::Config("backfill_depth must be positive".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PartitionConfig {
    pub name: String,
    #[serde(default)]
    pub default: bool,
    pub max_time_secs: Option<u64>,
    pub default_time_secs: Option<u64>,
    pub max_nodes: Option<u32>,
    #[serde(default)]
    pub priority_weight: i64,
}

impl PartitionConfig {
    pub fn to_partition(&self) -> Partition {
        let partition = Partition::new(
            self.name.clone(),
            PartitionLimits {
                max_time: self.max_time_secs.map(Duration::from_secs),
                max_nodes_per_job: self.max_nodes,
                priority_weight: self.priority_weight,
                default_time: self.default_time_secs.map(Duration::from_secs),
            },
        );
        if self.default {
            partition.as_default()
        } else {
            partition
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeConfig {
    pub name: String,
    pub cpus: u32,
    pub memory_mb: u64,
    #[serde(default)]
    pub gres: BTreeMap<String, u64>,
    #[serde(default)]
    pub partitions: Vec<String>,
}

impl NodeConfig {
    pub fn capacity(&self) -> ResourceVector {
        ResourceVector {
            cpus: self.cpus,
            memory_mb: self.memory_mb,
            gres: self.gres.clone(),
        }
    }
}

/// A cluster description file.
///
/// ```toml
/// [controller]
/// heartbeat_timeout_ms = 10000
///
/// [[partitions]]
/// name = "batch"
/// default = true
/// max_time_secs = 86400
///
/// [[nodes]]
/// name = "n1"
/// cpus = 32
/// memory_mb = 131072
/// gres = { gpu = 4 }
/// partitions = ["batch"]
/// ```
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterFile {
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub partitions: Vec<PartitionConfig>,
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
}

impl ClusterFile {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| SchedError::Config(format!("reading {}: {}", path.display(), e)))?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let file: ClusterFile =
            toml::from_str(raw).map_err(|e| SchedError::Config(e.to_string()))?;
        file.controller.validate()?;
        Ok(file)
    }

    /// Partitions first, then nodes joining them.
    pub fn build_catalog(&self, now: DateTime<Utc>) -> Result<ResourceCatalog> {
        let mut catalog = ResourceCatalog::with_partitions(
            self.partitions.iter().map(PartitionConfig::to_partition).collect(),
        )?;
        for node in &self.nodes {
            catalog.register_node(&node.name, node.capacity(), &node.partitions, now)?;
        }
        Ok(catalog)
    }
}

/// One job in a workload file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkloadJob {
    pub user: String,
    pub name: Option<String>,
    pub partition: Option<String>,
    #[serde(default = "one")]
    pub nodes: u32,
    pub cpus: u32,
    #[serde(default)]
    pub memory_mb: u64,
    #[serde(default)]
    pub gres: BTreeMap<String, u64>,
    /// Treat cpus/memory/gres as a total split across `nodes` instead of per node.
    #[serde(default)]
    pub split: bool,
    #[serde(default)]
    pub priority: u32,
    pub time_limit_secs: Option<u64>,
    #[serde(default)]
    pub after: Vec<u64>,
    pub requeue: Option<bool>,
    pub command: Option<String>,
}

fn one() -> u32 {
    1
}

impl WorkloadJob {
    pub fn to_spec(&self) -> (Principal, JobSpec) {
        let vector = ResourceVector {
            cpus: self.cpus,
            memory_mb: self.memory_mb,
            gres: self.gres.clone(),
        };
        let resources = if self.split {
            ResourceRequest::Total {
                nodes: self.nodes,
                total: vector,
            }
        } else {
            ResourceRequest::PerNode {
                nodes: self.nodes,
                per_node: vector,
            }
        };
        let spec = JobSpec {
            name: self.name.clone(),
            partition: self.partition.clone(),
            resources,
            priority: self.priority,
            time_limit: self.time_limit_secs.map(Duration::from_secs),
            dependencies: self.after.iter().copied().map(JobId).collect(),
            requeue: self.requeue,
            command: self.command.clone(),
        };
        (Principal::user(self.user.clone()), spec)
    }
}

/// A list of jobs to submit at startup.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkloadFile {
    #[serde(default)]
    pub jobs: Vec<WorkloadJob>,
}

impl WorkloadFile {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| SchedError::Config(format!("reading {}: {}", path.display(), e)))?;
        toml::from_str(&raw).map_err(|e| SchedError::Config(e.to_string()))
    }
}
