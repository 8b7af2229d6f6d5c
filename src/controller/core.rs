//! Single-writer scheduler state and the handlers that mutate it.
//!
//! Every handler takes the current time from its caller, so the core is
//! deterministic: the same sequence of calls yields the same decisions.
//! Outbound work (launching, terminating, accounting, timers) is queued as
//! [`Effect`]s and drained by the controller task.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};

use crate::catalog::{AdminState, DownReason, Node, NodeState, Partition, ResourceCatalog};
use crate::config::ControllerConfig;
use crate::error::{Result, SchedError};
use crate::external::{JobLaunch, JobRecord};
use crate::persistence::{PersistedState, STATE_VERSION};
use crate::resources::ResourceVector;
use crate::scheduler::allocation::{AllocationRecord, AllocationTable};
use crate::scheduler::allocator::Allocator;
use crate::scheduler::backfill::{self, Reservation, RunningJob};
use crate::scheduler::job::{
    ExitStatus, Job, JobId, JobRequest, JobSpec, JobState, Principal, StateReason,
};
use crate::scheduler::queue::{JobQueue, QueueEntry};

/// Outbound work produced by a handler.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Launch(JobLaunch),
    Terminate {
        job_id: JobId,
        nodes: BTreeSet<String>,
    },
    Account(JobRecord),
    ArmTimer {
        job_id: JobId,
        run: u32,
        deadline: DateTime<Utc>,
    },
}

pub struct SchedulerCore {
    config: ControllerConfig,
    allocator: Allocator,
    catalog: ResourceCatalog,
    queue: JobQueue,
    jobs: BTreeMap<JobId, Job>,
    allocations: AllocationTable,
    next_id: u64,
    reservations: BTreeMap<JobId, Reservation>,
    effects: Vec<Effect>,
}

impl SchedulerCore {
    pub fn new(config: ControllerConfig, catalog: ResourceCatalog) -> Self {
        let allocator = Allocator::new(config.placement.policy(), config.heartbeat_timeout());
        Self {
            queue: JobQueue::with_capacity(config.max_pending_jobs),
            config,
            allocator,
            catalog,
            jobs: BTreeMap::new(),
            allocations: AllocationTable::new(),
            next_id: 1,
            reservations: BTreeMap::new(),
            effects: Vec::new(),
        }
    }

    pub fn allocator(&self) -> &Allocator {
        &self.allocator
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn catalog(&self) -> &ResourceCatalog {
        &self.catalog
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn allocations(&self) -> &AllocationTable {
        &self.allocations
    }

    pub fn job(&self, job_id: JobId) -> Option<&Job> {
        self.jobs.get(&job_id)
    }

    pub fn jobs(&self) -> impl Iterator<Item = &Job> {
        self.jobs.values()
    }

    /// Projected start booked for a blocked job in the last pass.
    pub fn reservation(&self, job_id: JobId) -> Option<&Reservation> {
        self.reservations.get(&job_id)
    }

    pub fn next_job_id(&self) -> JobId {
        JobId(self.next_id)
    }

    pub fn take_effects(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.effects)
    }

    /// Accept a job. Malformed requests are rejected before an ID is
    /// assigned. Requests that can never run get an ID, are recorded as
    /// FAILED, and the caller receives [`SchedError::InvalidRequest`].
    pub fn submit(
        &mut self,
        spec: JobSpec,
        submitter: Principal,
        now: DateTime<Utc>,
    ) -> Result<JobId> {
        check_shape(&spec)?;
        self.check_dependencies(&spec.dependencies)?;
        if self.queue.is_full() {
            return Err(SchedError::QueueFull);
        }

        let partition = spec.partition.clone().or_else(|| {
            self.catalog
                .partitions()
                .find(|p| p.is_default)
                .map(|p| p.name.clone())
        });
        let limits = partition
            .as_deref()
            .and_then(|p| self.catalog.partition(p))
            .map(|p| p.limits.clone())
            .unwrap_or_default();

        let id = JobId(self.next_id);
        self.next_id += 1;
        let request = JobRequest {
            id,
            name: spec.name,
            partition: partition.clone().unwrap_or_default(),
            resources: spec.resources,
            submitter,
            priority: i64::from(spec.priority) + limits.priority_weight,
            submitted_at: now,
            time_limit: spec.time_limit.or(limits.default_time),
            dependencies: spec.dependencies,
            requeue: spec.requeue.unwrap_or(self.config.requeue_on_node_fail),
            command: spec.command,
        };

        let verdict = match partition {
            Some(_) => self.allocator.validate(&request, &self.catalog.snapshot(now)),
            None => Err("no partition given and no default partition".to_string()),
        };
        let mut job = Job::new(request);
        if let Err(reason) = verdict {
            tracing::warn!(job_id = %id, reason = %reason, "Job rejected");
            job.fail_pending(StateReason::InvalidRequest(reason.clone()), now)?;
            self.effects.push(Effect::Account(JobRecord::from(&job)));
            self.jobs.insert(id, job);
            return Err(SchedError::InvalidRequest { job_id: id, reason });
        }

        self.queue.enqueue(QueueEntry::for_request(&job.request))?;
        tracing::info!(
            job_id = %id,
            user = %job.request.submitter,
            partition = %job.request.partition,
            priority = job.request.priority,
            "Job submitted"
        );
        self.jobs.insert(id, job);
        Ok(id)
    }

    fn check_dependencies(&self, dependencies: &[JobId]) -> Result<()> {
        let next = JobId(self.next_id);
        if let Some(missing) = dependencies
            .iter()
            .find(|d| **d != next && !self.jobs.contains_key(d))
        {
            return Err(SchedError::UnknownDependency(*missing));
        }
        let mut seen = BTreeSet::new();
        let mut stack = dependencies.to_vec();
        while let Some(id) = stack.pop() {
            if id == next {
                return Err(SchedError::DependencyCycle(id));
            }
            if !seen.insert(id) {
                continue;
            }
            if let Some(job) = self.jobs.get(&id) {
                stack.extend(job.request.dependencies.iter().copied());
            }
        }
        Ok(())
    }

    /// Cancel a job on behalf of its owner or an operator.
    pub fn cancel(&mut self, job_id: JobId, by: &Principal, now: DateTime<Utc>) -> Result<()> {
        let job = self.job_ref(job_id)?;
        if !by.operator && job.request.submitter.name != by.name {
            return Err(SchedError::PermissionDenied {
                job_id,
                principal: by.name.clone(),
            });
        }
        if !job.state.can_transition_to(JobState::Cancelled) {
            return Err(SchedError::InvalidTransition {
                job_id,
                from: job.state,
                to: JobState::Cancelled,
            });
        }

        if job.state.holds_nodes() {
            if let Some(record) = self.reclaim(job_id) {
                self.effects.push(Effect::Terminate {
                    job_id,
                    nodes: record.node_names(),
                });
            }
        } else {
            self.queue.remove(job_id);
        }
        let job = self.job_mut(job_id)?;
        job.cancel(&by.name, now)?;
        tracing::info!(job_id = %job_id, by = %by, "Job cancelled");
        let record = JobRecord::from(&*job);
        self.effects.push(Effect::Account(record));
        Ok(())
    }

    pub fn register_node(
        &mut self,
        name: &str,
        capacity: ResourceVector,
        partitions: &[String],
        now: DateTime<Utc>,
    ) -> Result<()> {
        if capacity.cpus == 0 {
            return Err(SchedError::MalformedRequest(format!(
                "node {} has no cpus",
                name
            )));
        }
        self.catalog.register_node(name, capacity, partitions, now)
    }

    pub fn deregister_node(&mut self, name: &str) -> Result<()> {
        self.catalog.deregister_node(name).map(|_| ())
    }

    /// Admin state change. DOWN fails every job on the node.
    pub fn set_node_admin_state(
        &mut self,
        name: &str,
        state: AdminState,
        now: DateTime<Utc>,
    ) -> Result<()> {
        match state {
            AdminState::Up => self.catalog.mark_up(name),
            AdminState::Drain => self.catalog.drain(name),
            AdminState::Down => self.fail_node(name, DownReason::Administrative, now),
        }
    }

    /// Record liveness as of `timestamp`. Returns true when a silent node
    /// came back into service.
    pub fn heartbeat(&mut self, name: &str, timestamp: DateTime<Utc>) -> Result<bool> {
        self.catalog
            .heartbeat(name, timestamp, self.config.return_to_service)
    }

    pub fn node_unreachable(&mut self, name: &str, now: DateTime<Utc>) -> Result<()> {
        self.fail_node(name, DownReason::NotResponding, now)
    }

    /// Mark every node silent for longer than the heartbeat timeout DOWN.
    /// Returns the nodes that were marked.
    pub fn sweep_heartbeats(&mut self, now: DateTime<Utc>) -> Vec<String> {
        let timeout = chrono::Duration::from_std(self.config.heartbeat_timeout())
            .unwrap_or(chrono::Duration::MAX);
        let stale = self.catalog.stale_nodes(now, timeout);
        for name in &stale {
            tracing::warn!(node = %name, "Heartbeat timeout");
            if let Err(e) = self.fail_node(name, DownReason::NotResponding, now) {
                tracing::warn!(node = %name, error = %e, "Failed to mark node down");
            }
        }
        stale
    }

    pub fn replace_partitions(&mut self, partitions: Vec<Partition>) -> Result<()> {
        self.catalog.replace_partitions(partitions)
    }

    /// The execution layer reports that a run ended. Notifications for a
    /// job that is no longer running, or for an older run, are ignored.
    pub fn job_exited(
        &mut self,
        job_id: JobId,
        run: Option<u32>,
        status: ExitStatus,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let job = self.job_ref(job_id)?;
        if job.state != JobState::Running || run.is_some_and(|r| r != job.run) {
            tracing::debug!(job_id = %job_id, state = %job.state, "Ignoring stale exit");
            return Ok(());
        }
        self.complete(job_id, status, None, now)
    }

    pub fn time_limit_expired(&mut self, job_id: JobId, run: u32, now: DateTime<Utc>) -> Result<()> {
        let Some(job) = self.jobs.get(&job_id) else {
            return Ok(());
        };
        if job.state != JobState::Running || job.run != run {
            return Ok(());
        }
        tracing::warn!(job_id = %job_id, run, "Time limit reached");
        self.effects.push(Effect::Terminate {
            job_id,
            nodes: job.assigned_nodes.clone(),
        });
        self.complete(job_id, ExitStatus::Killed, Some(StateReason::TimeLimit), now)
    }

    /// RUNNING -> COMPLETING -> reclaim -> COMPLETED/FAILED.
    fn complete(
        &mut self,
        job_id: JobId,
        status: ExitStatus,
        reason: Option<StateReason>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.job_mut(job_id)?.begin_completing(status, reason)?;
        self.reclaim(job_id);
        let job = self.job_mut(job_id)?;
        let state = job.finish(now)?;
        tracing::info!(job_id = %job_id, state = %state, reason = %job.reason, "Job finished");
        let record = JobRecord::from(&*job);
        self.effects.push(Effect::Account(record));
        Ok(())
    }

    fn fail_node(&mut self, name: &str, reason: DownReason, now: DateTime<Utc>) -> Result<()> {
        self.catalog.mark_down(name, reason)?;
        for job_id in self.allocations.jobs_on(name) {
            self.fail_job_on_node(job_id, name, now);
        }
        Ok(())
    }

    fn fail_job_on_node(&mut self, job_id: JobId, node: &str, now: DateTime<Utc>) {
        let Some(record) = self.reclaim(job_id) else {
            return;
        };
        // The failed node may still be running its part.
        self.effects.push(Effect::Terminate {
            job_id,
            nodes: record.node_names(),
        });
        let Some(job) = self.jobs.get_mut(&job_id) else {
            return;
        };
        if let Err(e) = job.node_fail(node, now) {
            tracing::error!(job_id = %job_id, error = %e, "Node failure transition rejected");
            return;
        }
        tracing::warn!(job_id = %job_id, node, "Job lost a node");
        self.requeue_or_record(job_id);
    }

    /// After NODE_FAIL: back to PENDING if the job asked for it, otherwise
    /// the state is final and goes to accounting.
    fn requeue_or_record(&mut self, job_id: JobId) {
        let Some(job) = self.jobs.get_mut(&job_id) else {
            return;
        };
        if !job.request.requeue {
            self.effects.push(Effect::Account(JobRecord::from(&*job)));
            return;
        }
        match job.requeue() {
            Ok(()) => {
                self.queue.requeue(QueueEntry::for_request(&job.request));
                tracing::info!(job_id = %job_id, restarts = job.restarts, "Job requeued");
            }
            Err(e) => tracing::error!(job_id = %job_id, error = %e, "Requeue rejected"),
        }
    }

    /// Drop a job's allocation and return its resources. A second call for
    /// the same job finds nothing and changes nothing.
    fn reclaim(&mut self, job_id: JobId) -> Option<AllocationRecord> {
        let record = self.allocations.remove(job_id)?;
        for (node, amount) in &record.nodes {
            if let Err(e) = self.catalog.release(node, amount) {
                tracing::warn!(job_id = %job_id, node = %node, error = %e, "Release failed");
            }
        }
        Some(record)
    }

    fn reserve_all(&mut self, record: &AllocationRecord) -> Result<()> {
        let mut done: Vec<(&String, &ResourceVector)> = Vec::new();
        for (node, amount) in &record.nodes {
            if let Err(e) = self.catalog.reserve(node, amount) {
                for (n, a) in done {
                    let _ = self.catalog.release(n, a);
                }
                return Err(e);
            }
            done.push((node, amount));
        }
        Ok(())
    }

    /// One scheduling pass. Returns how many jobs were started.
    pub fn schedule(&mut self, now: DateTime<Utc>) -> usize {
        self.fail_unsatisfiable(now);

        let snapshot = self.catalog.snapshot(now);
        let reachable: BTreeSet<JobId> = self.queue.candidates(&snapshot).collect();
        let mut eligible = Vec::new();
        let mut waiting = Vec::new();
        for job_id in self.queue.iter() {
            let Some(job) = self.jobs.get(&job_id) else {
                continue;
            };
            if !self.dependencies_met(job) {
                waiting.push((job_id, StateReason::Dependency));
            } else if !reachable.contains(&job_id) {
                waiting.push((job_id, StateReason::Resources));
            } else {
                eligible.push(job_id);
            }
        }

        let plan = {
            let pending: Vec<&JobRequest> = eligible
                .iter()
                .filter_map(|id| self.jobs.get(id))
                .map(|job| &job.request)
                .collect();
            let running: Vec<RunningJob<'_>> = self
                .allocations
                .records()
                .filter_map(|record| {
                    let job = self.jobs.get(&record.job_id)?;
                    Some(RunningJob {
                        allocation: record,
                        started_at: job.start_time?,
                        time_limit: job.request.time_limit,
                    })
                })
                .collect();
            backfill::plan(
                &self.allocator,
                &snapshot,
                &pending,
                &running,
                self.config.backfill_settings(),
            )
        };

        for (job_id, reason) in waiting.into_iter().chain(plan.reasons) {
            if let Some(job) = self.jobs.get_mut(&job_id) {
                if job.state == JobState::Pending {
                    job.reason = reason;
                }
            }
        }
        let started = plan
            .starts
            .into_iter()
            .filter(|record| self.start_job(record.clone(), now))
            .count();
        self.reservations = plan.reservations;
        if started > 0 {
            tracing::debug!(started, pending = self.queue.len(), "Scheduling pass");
        }
        started
    }

    fn dependencies_met(&self, job: &Job) -> bool {
        job.request
            .dependencies
            .iter()
            .all(|d| self.jobs.get(d).is_some_and(|dep| dep.state == JobState::Completed))
    }

    /// Fail pending jobs that can never run: their partition is gone or no
    /// longer has the capacity or limits to hold them, or a dependency ended
    /// in anything but COMPLETED. Repeats until no more jobs fail so chains
    /// of dependents fail together.
    fn fail_unsatisfiable(&mut self, now: DateTime<Utc>) {
        let snapshot = self.catalog.snapshot(now);
        loop {
            let mut doomed: Vec<(JobId, StateReason)> = Vec::new();
            for job_id in self.queue.iter() {
                let Some(job) = self.jobs.get(&job_id) else {
                    continue;
                };
                if self.catalog.partition(&job.request.partition).is_none() {
                    doomed.push((
                        job_id,
                        StateReason::InvalidRequest(format!(
                            "partition {} no longer exists",
                            job.request.partition
                        )),
                    ));
                    continue;
                }
                if let Err(reason) = self.allocator.validate(&job.request, &snapshot) {
                    doomed.push((job_id, StateReason::InvalidRequest(reason)));
                    continue;
                }
                let dead = job.request.dependencies.iter().find(|d| {
                    self.jobs
                        .get(d)
                        .map_or(true, |dep| dep.is_terminal() && dep.state != JobState::Completed)
                });
                if let Some(dep) = dead {
                    doomed.push((job_id, StateReason::DependencyNeverSatisfied(*dep)));
                }
            }
            if doomed.is_empty() {
                return;
            }
            for (job_id, reason) in doomed {
                self.queue.remove(job_id);
                let Some(job) = self.jobs.get_mut(&job_id) else {
                    continue;
                };
                match job.fail_pending(reason, now) {
                    Ok(()) => {
                        tracing::warn!(job_id = %job_id, reason = %job.reason, "Pending job failed");
                        self.effects.push(Effect::Account(JobRecord::from(&*job)));
                    }
                    Err(e) => tracing::error!(job_id = %job_id, error = %e, "Failing pending job rejected"),
                }
            }
        }
    }

    /// Apply one planned start: reserve on every node, then PENDING -> RUNNING.
    fn start_job(&mut self, record: AllocationRecord, now: DateTime<Utc>) -> bool {
        let job_id = record.job_id;
        if let Err(e) = self.reserve_all(&record) {
            tracing::error!(job_id = %job_id, error = %e, "Planned allocation no longer fits");
            return false;
        }
        let started = match self.jobs.get_mut(&job_id) {
            Some(job) => job.start(record.node_names(), now),
            None => Err(SchedError::UnknownJob(job_id)),
        };
        if let Err(e) = started {
            tracing::error!(job_id = %job_id, error = %e, "Start rejected, releasing");
            for (node, amount) in &record.nodes {
                let _ = self.catalog.release(node, amount);
            }
            return false;
        }
        self.queue.remove(job_id);

        if let Some(job) = self.jobs.get(&job_id) {
            tracing::info!(
                job_id = %job_id,
                run = job.run,
                nodes = ?record.nodes.keys().collect::<Vec<_>>(),
                "Job started"
            );
            self.effects.push(Effect::Launch(JobLaunch {
                job_id,
                run: job.run,
                name: job.request.name.clone(),
                submitter: job.request.submitter.clone(),
                command: job.request.command.clone(),
                allocation: record.nodes.clone(),
                time_limit: job.request.time_limit,
            }));
            if let Some(deadline) = job.projected_end() {
                self.effects.push(Effect::ArmTimer {
                    job_id,
                    run: job.run,
                    deadline,
                });
            }
        }
        self.allocations.insert(record);
        true
    }

    fn job_ref(&self, job_id: JobId) -> Result<&Job> {
        self.jobs.get(&job_id).ok_or(SchedError::UnknownJob(job_id))
    }

    fn job_mut(&mut self, job_id: JobId) -> Result<&mut Job> {
        self.jobs.get_mut(&job_id).ok_or(SchedError::UnknownJob(job_id))
    }

    pub fn serialize_state(&self, now: DateTime<Utc>) -> Result<Vec<u8>> {
        PersistedState {
            version: STATE_VERSION,
            saved_at: now,
            next_job_id: self.next_id,
            partitions: self.catalog.partitions().cloned().collect(),
            nodes: self.catalog.nodes().cloned().collect(),
            jobs: self.jobs.values().cloned().collect(),
            allocations: self.allocations.records().cloned().collect(),
        }
        .to_bytes()
    }

    /// Rebuild a core from a saved blob.
    ///
    /// Node availability is recomputed from the allocations that survive.
    /// An allocation survives only if every node it names still exists and
    /// is not DOWN; otherwise its job goes to NODE_FAIL and is requeued or
    /// recorded. Every node's heartbeat clock restarts at `now`.
    pub fn restore_state(blob: &[u8], config: ControllerConfig, now: DateTime<Utc>) -> Result<Self> {
        let state = PersistedState::from_bytes(blob)?;
        let mut nodes: BTreeMap<String, Node> = state
            .nodes
            .into_iter()
            .map(|n| (n.name.clone(), n))
            .collect();
        let mut records: BTreeMap<JobId, AllocationRecord> = state
            .allocations
            .into_iter()
            .map(|r| (r.job_id, r))
            .collect();

        let mut kept = Vec::new();
        let mut lost = Vec::new();
        for job in state.jobs.iter().filter(|j| j.state.holds_nodes()) {
            let record = records.remove(&job.id()).filter(|r| {
                !r.nodes.is_empty()
                    && r.nodes.keys().all(|n| {
                        nodes
                            .get(n)
                            .is_some_and(|node| node.state != NodeState::Down)
                    })
            });
            match record {
                Some(record) => kept.push(record),
                None => lost.push(job.id()),
            }
        }

        for node in nodes.values_mut() {
            let allocated = kept
                .iter()
                .filter_map(|r| r.nodes.get(&node.name))
                .fold(ResourceVector::zero(), |acc, v| acc.saturating_add(v));
            node.available = node.total.saturating_sub(&allocated);
            node.last_heartbeat = now;
            if node.state == NodeState::Draining && node.is_idle() {
                node.state = NodeState::Drained;
            }
        }

        let mut catalog = ResourceCatalog::new();
        for partition in state.partitions {
            catalog.insert_restored_partition(partition);
        }
        for node in nodes.into_values() {
            catalog.insert_restored(node);
        }

        let mut core = Self::new(config, catalog);
        let highest = state.jobs.iter().map(|j| j.id().0).max().unwrap_or(0);
        core.next_id = state.next_job_id.max(highest + 1).max(1);
        for job in state.jobs {
            if job.state == JobState::Pending {
                core.queue.requeue(QueueEntry::for_request(&job.request));
            }
            core.jobs.insert(job.id(), job);
        }
        for record in kept {
            core.allocations.insert(record);
        }

        for job_id in lost {
            let Some(job) = core.jobs.get_mut(&job_id) else {
                continue;
            };
            if let Err(e) = job.reconcile_fail(now) {
                tracing::error!(job_id = %job_id, error = %e, "Reconciliation rejected");
                continue;
            }
            tracing::warn!(job_id = %job_id, "Allocation lost across restart");
            core.requeue_or_record(job_id);
        }

        let held: Vec<JobId> = core.allocations.records().map(|r| r.job_id).collect();
        for job_id in held {
            let Some(job) = core.jobs.get(&job_id) else {
                core.reclaim(job_id);
                continue;
            };
            match job.state {
                JobState::Completing => {
                    let status = job.exit_status.unwrap_or(ExitStatus::Killed);
                    core.reclaim(job_id);
                    let job = core.job_mut(job_id)?;
                    job.finish(now)?;
                    let record = JobRecord::from(&*job);
                    core.effects.push(Effect::Account(record));
                    tracing::info!(job_id = %job_id, exit = ?status, "Finished completion after restart");
                }
                _ => {
                    if let Some(deadline) = job.projected_end() {
                        core.effects.push(Effect::ArmTimer {
                            job_id,
                            run: job.run,
                            deadline,
                        });
                    }
                }
            }
        }

        tracing::info!(
            jobs = core.jobs.len(),
            running = core.allocations.len(),
            pending = core.queue.len(),
            next_job_id = core.next_id,
            "State restored"
        );
        Ok(core)
    }
}

fn check_shape(spec: &JobSpec) -> Result<()> {
    if spec.resources.nodes() == 0 {
        return Err(SchedError::MalformedRequest(
            "a job needs at least one node".to_string(),
        ));
    }
    if spec.resources.shares().iter().any(|s| s.cpus == 0) {
        return Err(SchedError::MalformedRequest(
            "every node share needs at least one cpu".to_string(),
        ));
    }
    Ok(())
}
