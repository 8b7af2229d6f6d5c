//! Conservative backfill over a resource/time profile.
//!
//! The profile starts from each node's current availability and adds the
//! projected release of every running job (start + time limit). Pending jobs
//! are walked in queue order. A job starts now if it fits the *minimum*
//! availability over `[now, now + limit)`. A job that cannot start gets a
//! reservation at its earliest projected start, booked into the profile, so
//! no job behind it can take resources it has been promised. A backfilled
//! job therefore never pushes back the projected start of a job ahead of it.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::catalog::CatalogSnapshot;
use crate::resources::ResourceVector;
use crate::scheduler::allocation::AllocationRecord;
use crate::scheduler::allocator::Allocator;
use crate::scheduler::job::{end_after, JobId, JobRequest, StateReason};

/// How jobs without any time limit are projected.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnboundedJobPolicy {
    /// Unbounded jobs hold resources forever in projections. A blocked job
    /// whose start cannot be projected fences off its partition's nodes for
    /// the rest of the pass.
    #[default]
    Barrier,
    /// Project unbounded jobs as if they declared this many minutes.
    AssumeMinutes(u64),
}

impl UnboundedJobPolicy {
    pub fn effective_limit(self, limit: Option<Duration>) -> Option<Duration> {
        match (limit, self) {
            (Some(limit), _) => Some(limit),
            (None, UnboundedJobPolicy::Barrier) => None,
            (None, UnboundedJobPolicy::AssumeMinutes(m)) => Some(Duration::from_secs(m * 60)),
        }
    }
}

/// A running job as seen by the planner.
#[derive(Debug, Clone)]
pub struct RunningJob<'a> {
    pub allocation: &'a AllocationRecord,
    pub started_at: DateTime<Utc>,
    pub time_limit: Option<Duration>,
}

/// Projected future allocation for a blocked job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub job_id: JobId,
    pub start: DateTime<Utc>,
    pub nodes: BTreeSet<String>,
}

/// Outcome of one scheduling pass.
#[derive(Debug, Default, Clone)]
pub struct Plan {
    /// Allocations to apply now, in decision order.
    pub starts: Vec<AllocationRecord>,
    pub reservations: BTreeMap<JobId, Reservation>,
    pub reasons: BTreeMap<JobId, StateReason>,
}

#[derive(Debug, Clone)]
struct Hold {
    start: DateTime<Utc>,
    end: Option<DateTime<Utc>>,
    amount: ResourceVector,
}

impl Hold {
    fn active_at(&self, t: DateTime<Utc>) -> bool {
        self.start <= t && self.end.map_or(true, |end| t < end)
    }
}

#[derive(Debug, Clone, Default)]
struct NodeProfile {
    base: ResourceVector,
    releases: Vec<(DateTime<Utc>, ResourceVector)>,
    holds: Vec<Hold>,
}

impl NodeProfile {
    fn available_at(&self, t: DateTime<Utc>) -> ResourceVector {
        let released = self
            .releases
            .iter()
            .filter(|(at, _)| *at <= t)
            .fold(self.base.clone(), |acc, (_, v)| acc.saturating_add(v));
        self.holds
            .iter()
            .filter(|h| h.active_at(t))
            .fold(released, |acc, h| acc.saturating_sub(&h.amount))
    }

    /// Minimum availability, per dimension, over `[start, end)`.
    fn window(&self, start: DateTime<Utc>, end: Option<DateTime<Utc>>) -> ResourceVector {
        self.holds
            .iter()
            .map(|h| h.start)
            .filter(|&t| t > start && end.map_or(true, |end| t < end))
            .fold(self.available_at(start), |acc, t| {
                acc.component_min(&self.available_at(t))
            })
    }
}

/// Resource/time profile of every node in a snapshot.
#[derive(Debug, Clone)]
pub struct Profile {
    now: DateTime<Utc>,
    nodes: BTreeMap<String, NodeProfile>,
}

impl Profile {
    pub fn new(
        snapshot: &CatalogSnapshot,
        running: &[RunningJob<'_>],
        unbounded: UnboundedJobPolicy,
    ) -> Self {
        let now = snapshot.taken_at;
        let mut nodes: BTreeMap<String, NodeProfile> = snapshot
            .nodes()
            .map(|n| {
                (
                    n.name.clone(),
                    NodeProfile {
                        base: n.effective_available(),
                        ..Default::default()
                    },
                )
            })
            .collect();

        for job in running {
            let limit = unbounded.effective_limit(job.time_limit);
            let Some(end) = end_after(job.started_at, limit) else {
                continue;
            };
            // Overdue jobs release "soon", never at the current instant.
            let at = if end > now {
                end
            } else {
                now + chrono::Duration::milliseconds(1)
            };
            for (name, amount) in &job.allocation.nodes {
                let schedulable = snapshot.node(name).is_some_and(|n| n.is_schedulable());
                if let (true, Some(profile)) = (schedulable, nodes.get_mut(name)) {
                    profile.releases.push((at, amount.clone()));
                }
            }
        }
        Self { now, nodes }
    }

    pub fn available_at(&self, node: &str, t: DateTime<Utc>) -> ResourceVector {
        self.nodes
            .get(node)
            .map(|p| p.available_at(t))
            .unwrap_or_default()
    }

    /// Snapshot whose availability is the window minimum over `[start, end)`.
    pub fn window_snapshot(
        &self,
        snapshot: &CatalogSnapshot,
        start: DateTime<Utc>,
        end: Option<DateTime<Utc>>,
    ) -> CatalogSnapshot {
        snapshot.with_availability(|node| {
            self.nodes
                .get(&node.name)
                .map(|p| p.window(start, end))
                .unwrap_or_default()
        })
    }

    /// Book an allocation that starts now.
    pub fn commit_now(&mut self, record: &AllocationRecord, end: Option<DateTime<Utc>>) {
        for (name, amount) in &record.nodes {
            if let Some(profile) = self.nodes.get_mut(name) {
                profile.base = profile.base.saturating_sub(amount);
                if let Some(end) = end {
                    profile.releases.push((end, amount.clone()));
                }
            }
        }
    }

    /// Book a future allocation.
    pub fn reserve(&mut self, record: &AllocationRecord, start: DateTime<Utc>, end: Option<DateTime<Utc>>) {
        for (name, amount) in &record.nodes {
            if let Some(profile) = self.nodes.get_mut(name) {
                profile.holds.push(Hold {
                    start,
                    end,
                    amount: amount.clone(),
                });
            }
        }
    }

    /// Withhold every resource of these nodes from now on.
    pub fn fence<'a>(&mut self, nodes: impl IntoIterator<Item = &'a str>, snapshot: &CatalogSnapshot) {
        for name in nodes {
            let total = snapshot.node(name).map(|n| n.total.clone()).unwrap_or_default();
            if let Some(profile) = self.nodes.get_mut(name) {
                profile.holds.push(Hold {
                    start: self.now,
                    end: None,
                    amount: total,
                });
            }
        }
    }

    /// Instants after now at which availability can grow.
    fn change_points(&self) -> Vec<DateTime<Utc>> {
        let mut points: Vec<DateTime<Utc>> = self
            .nodes
            .values()
            .flat_map(|p| {
                p.releases
                    .iter()
                    .map(|(t, _)| *t)
                    .chain(p.holds.iter().filter_map(|h| h.end))
            })
            .filter(|t| *t > self.now)
            .collect();
        points.sort_unstable();
        points.dedup();
        points
    }

    /// Earliest instant after now at which `request` fits for `limit`.
    pub fn earliest_start(
        &self,
        allocator: &Allocator,
        request: &JobRequest,
        snapshot: &CatalogSnapshot,
        limit: Option<Duration>,
    ) -> Option<(DateTime<Utc>, AllocationRecord)> {
        self.change_points().into_iter().find_map(|t| {
            let window = self.window_snapshot(snapshot, t, end_after(t, limit));
            allocator.try_allocate(request, &window).map(|record| (t, record))
        })
    }
}

/// Backfill planner settings.
#[derive(Debug, Clone, Copy)]
pub struct BackfillSettings {
    pub depth: usize,
    pub unbounded: UnboundedJobPolicy,
}

/// Under [`UnboundedJobPolicy::Barrier`], whether a job with no projected
/// start would fit the partition's serviceable nodes if they were empty.
/// If it would, only holds that never end stand in its way. If it would
/// not, it is waiting on nodes, and fencing would only idle the rest.
fn blocked_by_unbounded(
    allocator: &Allocator,
    request: &JobRequest,
    snapshot: &CatalogSnapshot,
    unbounded: UnboundedJobPolicy,
) -> bool {
    if unbounded != UnboundedJobPolicy::Barrier {
        return false;
    }
    let empty = snapshot.with_availability(|n| n.total.clone());
    allocator.try_allocate(request, &empty).is_some()
}

/// Decide which of `pending` (already in queue order) start now.
pub fn plan(
    allocator: &Allocator,
    snapshot: &CatalogSnapshot,
    pending: &[&JobRequest],
    running: &[RunningJob<'_>],
    settings: BackfillSettings,
) -> Plan {
    let now = snapshot.taken_at;
    let mut profile = Profile::new(snapshot, running, settings.unbounded);
    let mut plan = Plan::default();

    for request in pending.iter().take(settings.depth) {
        let limit = settings.unbounded.effective_limit(request.time_limit);
        let end = end_after(now, limit);

        let window = profile.window_snapshot(snapshot, now, end);
        if let Some(record) = allocator.try_allocate(request, &window) {
            profile.commit_now(&record, end);
            plan.starts.push(record);
            continue;
        }

        let current = snapshot.with_availability(|n| profile.available_at(&n.name, now));
        let reason = if allocator.try_allocate(request, &current).is_some() {
            StateReason::Priority
        } else {
            StateReason::Resources
        };
        plan.reasons.insert(request.id, reason);

        match profile.earliest_start(allocator, request, snapshot, limit) {
            Some((start, record)) => {
                profile.reserve(&record, start, end_after(start, limit));
                tracing::debug!(job_id = %request.id, start = %start, "Reserved future start");
                plan.reservations.insert(
                    request.id,
                    Reservation {
                        job_id: request.id,
                        start,
                        nodes: record.node_names(),
                    },
                );
            }
            None if blocked_by_unbounded(allocator, request, snapshot, settings.unbounded) => {
                tracing::debug!(
                    job_id = %request.id,
                    partition = %request.partition,
                    "No projected start, fencing partition"
                );
                let members: Vec<String> = snapshot
                    .partition(&request.partition)
                    .map(|p| p.nodes.clone())
                    .unwrap_or_default();
                profile.fence(members.iter().map(String::as_str), snapshot);
            }
            None => {
                tracing::debug!(
                    job_id = %request.id,
                    partition = %request.partition,
                    "No projected start until nodes return"
                );
            }
        }
    }
    plan
}
