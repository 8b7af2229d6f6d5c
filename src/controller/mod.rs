//! The scheduling loop.
//!
//! One task owns the [`SchedulerCore`] and drains a bounded event channel.
//! After each mutating event it runs a scheduling pass, persists state,
//! executes the resulting effects and publishes a fresh [`ClusterView`].

pub mod core;
pub mod event;
pub mod handle;
pub mod view;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::catalog::ResourceCatalog;
use crate::config::ControllerConfig;
use crate::error::Result;
use crate::external::{AccountingSink, ExecutionLayer, LogAccounting, NullExecutor};
use crate::persistence::StateStore;
use crate::scheduler::job::JobId;

pub use self::core::{Effect, SchedulerCore};
pub use event::Event;
pub use handle::ControllerHandle;
pub use view::{ClusterView, JobStatusView, NodeView, PartitionView};

pub struct Controller {
    core: SchedulerCore,
    rx: mpsc::Receiver<Event>,
    tx: mpsc::Sender<Event>,
    view_tx: watch::Sender<Arc<ClusterView>>,
    executor: Arc<dyn ExecutionLayer>,
    accounting: Arc<dyn AccountingSink>,
    store: Option<Arc<dyn StateStore>>,
    timers: CancellationToken,
    /// Armed time-limit timer per job, cancelled when the run ends.
    job_timers: HashMap<JobId, CancellationToken>,
}

impl Controller {
    pub fn new(core: SchedulerCore) -> (Self, ControllerHandle) {
        let config = core.config().clone();
        let (tx, rx) = mpsc::channel(config.event_channel_capacity.max(1));
        let (view_tx, view_rx) =
            watch::channel(Arc::new(ClusterView::capture(&core, Utc::now())));
        let handle = ControllerHandle::new(tx.clone(), view_rx, config.ack_timeout());
        let controller = Self {
            core,
            rx,
            tx,
            view_tx,
            executor: Arc::new(NullExecutor),
            accounting: Arc::new(LogAccounting),
            store: None,
            timers: CancellationToken::new(),
            job_timers: HashMap::new(),
        };
        (controller, handle)
    }

    /// Restore from `store` when it holds saved state, otherwise start from
    /// `catalog`. The store is kept for persisting from then on.
    pub fn recover(
        config: ControllerConfig,
        catalog: ResourceCatalog,
        store: Arc<dyn StateStore>,
    ) -> Result<(Self, ControllerHandle)> {
        let core = match store.load()? {
            Some(blob) => SchedulerCore::restore_state(&blob, config, Utc::now())?,
            None => SchedulerCore::new(config, catalog),
        };
        let (controller, handle) = Self::new(core);
        Ok((controller.with_store(store), handle))
    }

    pub fn with_executor(mut self, executor: Arc<dyn ExecutionLayer>) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_accounting(mut self, accounting: Arc<dyn AccountingSink>) -> Self {
        self.accounting = accounting;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn core(&self) -> &SchedulerCore {
        &self.core
    }

    /// Run until `shutdown` is cancelled.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<()> {
        let sweep_every = self.core.config().heartbeat_sweep_interval();
        tracing::info!(
            placement = self.core.allocator().policy_name(),
            unbounded = ?self.core.config().unbounded_jobs,
            sweep_ms = sweep_every.as_millis() as u64,
            "Controller started"
        );

        // Timers and launches left over from a restore.
        let _ = self.settle(Utc::now(), true);

        let mut sweep = tokio::time::interval_at(tokio::time::Instant::now() + sweep_every, sweep_every);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("Controller shutting down");
                    break;
                }
                Some(event) = self.rx.recv() => {
                    self.handle_event(event);
                }
                _ = sweep.tick() => {
                    self.handle_event(Event::SweepHeartbeats);
                }
            }
        }

        self.timers.cancel();
        self.persist(Utc::now())
    }

    fn handle_event(&mut self, event: Event) {
        let now = Utc::now();
        tracing::trace!(event = event.kind(), mutating = event.is_mutating(), "Handling event");
        match event {
            Event::Submit {
                spec,
                submitter,
                reply,
            } => {
                let result = self.core.submit(spec, submitter, now);
                // Acknowledge only what has been persisted.
                let persisted = self.settle(now, true);
                let _ = reply.send(persisted.and(result));
            }
            Event::Cancel { job_id, by, reply } => {
                let result = self.core.cancel(job_id, &by, now);
                let _ = self.settle(now, result.is_ok());
                let _ = reply.send(result);
            }
            Event::RegisterNode {
                name,
                capacity,
                partitions,
                reply,
            } => {
                let result = self.core.register_node(&name, capacity, &partitions, now);
                let _ = self.settle(now, result.is_ok());
                let _ = reply.send(result);
            }
            Event::DeregisterNode { name, reply } => {
                let result = self.core.deregister_node(&name);
                let _ = self.settle(now, result.is_ok());
                let _ = reply.send(result);
            }
            Event::SetNodeState { name, state, reply } => {
                let result = self.core.set_node_admin_state(&name, state, now);
                let _ = self.settle(now, result.is_ok());
                let _ = reply.send(result);
            }
            Event::ReplacePartitions { partitions, reply } => {
                let result = self.core.replace_partitions(partitions);
                let _ = self.settle(now, result.is_ok());
                let _ = reply.send(result);
            }
            Event::SerializeState { reply } => {
                let _ = reply.send(self.core.serialize_state(now));
            }
            Event::Heartbeat { node, timestamp } => {
                match self.core.heartbeat(&node, timestamp.min(now)) {
                    Ok(true) => {
                        let _ = self.settle(now, true);
                    }
                    Ok(false) => {}
                    Err(e) => tracing::warn!(node = %node, error = %e, "Heartbeat rejected"),
                }
            }
            Event::NodeUnreachable { node } => {
                if let Err(e) = self.core.node_unreachable(&node, now) {
                    tracing::warn!(node = %node, error = %e, "Unreachable report rejected");
                }
                let _ = self.settle(now, true);
            }
            Event::JobExited {
                job_id,
                run,
                status,
            } => {
                if let Err(e) = self.core.job_exited(job_id, run, status, now) {
                    tracing::warn!(job_id = %job_id, error = %e, "Exit report rejected");
                }
                let _ = self.settle(now, true);
            }
            Event::TimeLimitExpired { job_id, run } => {
                if let Err(e) = self.core.time_limit_expired(job_id, run, now) {
                    tracing::warn!(job_id = %job_id, error = %e, "Time limit handling failed");
                }
                let _ = self.settle(now, true);
            }
            Event::SweepHeartbeats => {
                let downed = self.core.sweep_heartbeats(now);
                if !downed.is_empty() {
                    let _ = self.settle(now, true);
                }
            }
        }
    }

    /// Scheduling pass, persistence, effects, publication. When `changed` is
    /// false only the view is refreshed.
    fn settle(&mut self, now: DateTime<Utc>, changed: bool) -> Result<()> {
        let persisted = if changed {
            self.core.schedule(now);
            self.persist(now)
        } else {
            Ok(())
        };
        for effect in self.core.take_effects() {
            self.apply(effect);
        }
        self.view_tx
            .send_replace(Arc::new(ClusterView::capture(&self.core, now)));
        persisted
    }

    fn persist(&self, now: DateTime<Utc>) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let result = self
            .core
            .serialize_state(now)
            .and_then(|blob| store.save(&blob));
        if let Err(e) = &result {
            tracing::error!(error = %e, "Failed to persist controller state");
        }
        result
    }

    fn apply(&mut self, effect: Effect) {
        match effect {
            Effect::Launch(launch) => self.executor.start(launch),
            Effect::Terminate { job_id, nodes } => {
                self.disarm_timer(job_id);
                self.executor.terminate(job_id, &nodes);
            }
            Effect::Account(record) => {
                self.disarm_timer(record.job_id);
                self.accounting.record_terminal_state(record);
            }
            Effect::ArmTimer {
                job_id,
                run,
                deadline,
            } => self.arm_timer(job_id, run, deadline),
        }
    }

    fn arm_timer(&mut self, job_id: JobId, run: u32, deadline: DateTime<Utc>) {
        let delay = (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        let tx = self.tx.clone();
        let stop = self.timers.child_token();
        if let Some(previous) = self.job_timers.insert(job_id, stop.clone()) {
            previous.cancel();
        }
        tracing::debug!(job_id = %job_id, run, deadline = %deadline, "Time limit armed");
        tokio::spawn(async move {
            tokio::select! {
                _ = stop.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = tx.send(Event::TimeLimitExpired { job_id, run }).await;
                }
            }
        });
    }

    fn disarm_timer(&mut self, job_id: JobId) {
        if let Some(timer) = self.job_timers.remove(&job_id) {
            timer.cancel();
        }
    }

    pub fn armed_timers(&self) -> usize {
        self.job_timers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Partition, PartitionLimits};
    use crate::scheduler::job::{ExitStatus, JobSpec, Principal, ResourceRequest};
    use crate::resources::ResourceVector;

    fn controller() -> Controller {
        let mut catalog = ResourceCatalog::with_partitions(vec![
            Partition::new("batch", PartitionLimits::default()).as_default()
        ])
        .unwrap();
        catalog
            .register_node("n1", ResourceVector::new(4, 8192), &["batch".into()], Utc::now())
            .unwrap();
        let core = SchedulerCore::new(ControllerConfig::default(), catalog);
        Controller::new(core).0
    }

    #[tokio::test]
    async fn timer_disarmed_when_job_ends() {
        let mut controller = controller();
        let spec = JobSpec::new(ResourceRequest::single(ResourceVector::new(1, 1024)))
            .with_time_limit(Duration::from_secs(3600));
        let now = Utc::now();
        let id = controller.core.submit(spec, Principal::user("alice"), now).unwrap();
        controller.settle(now, true).unwrap();
        assert_eq!(controller.armed_timers(), 1);
        let timer = controller.job_timers[&id].clone();

        controller
            .core
            .job_exited(id, Some(1), ExitStatus::Code(0), now)
            .unwrap();
        controller.settle(now, true).unwrap();
        assert_eq!(controller.armed_timers(), 0);
        assert!(timer.is_cancelled());
        assert!(!controller.timers.is_cancelled());
    }
}
