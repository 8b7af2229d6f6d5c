use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};

use crate::catalog::CatalogSnapshot;
use crate::error::{Result, SchedError};
use crate::scheduler::job::{JobId, JobRequest};

const DEFAULT_MAX_JOBS: usize = 10_000;

/// Ordering key of a pending job: priority descending, then submission time,
/// then job ID. No two distinct jobs compare equal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub job_id: JobId,
    pub priority: i64,
    pub submitted_at: DateTime<Utc>,
    pub partition: String,
}

impl QueueEntry {
    pub fn for_request(request: &JobRequest) -> Self {
        Self {
            job_id: request.id,
            priority: request.priority,
            submitted_at: request.submitted_at,
            partition: request.partition.clone(),
        }
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| self.submitted_at.cmp(&other.submitted_at))
            .then_with(|| self.job_id.cmp(&other.job_id))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Priority-ordered set of PENDING jobs.
///
/// The queue never drops a job on its own. Every removal is made by the
/// controller together with a state transition.
#[derive(Debug)]
pub struct JobQueue {
    ordered: BTreeSet<QueueEntry>,
    index: HashMap<JobId, QueueEntry>,
    max_jobs: usize,
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl JobQueue {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_JOBS)
    }

    pub fn with_capacity(max_jobs: usize) -> Self {
        Self {
            ordered: BTreeSet::new(),
            index: HashMap::new(),
            max_jobs,
        }
    }

    /// Add a newly submitted job. Fails with `QueueFull` at capacity.
    pub fn enqueue(&mut self, entry: QueueEntry) -> Result<()> {
        if self.index.contains_key(&entry.job_id) {
            return Ok(());
        }
        if self.is_full() {
            return Err(SchedError::QueueFull);
        }
        self.insert(entry);
        Ok(())
    }

    /// Return a job to the queue after a node failure. Idempotent, and
    /// never refused for capacity since the job was already admitted.
    pub fn requeue(&mut self, entry: QueueEntry) {
        if !self.index.contains_key(&entry.job_id) {
            self.insert(entry);
        }
    }

    pub fn remove(&mut self, job_id: JobId) -> bool {
        match self.index.remove(&job_id) {
            Some(entry) => self.ordered.remove(&entry),
            None => false,
        }
    }

    pub fn contains(&self, job_id: JobId) -> bool {
        self.index.contains_key(&job_id)
    }

    /// Next candidate for an allocation attempt, without removing it: the
    /// first job whose partition has an UP node in `snapshot`.
    pub fn dequeue_next(&self, snapshot: &CatalogSnapshot) -> Option<JobId> {
        self.candidates(snapshot).next()
    }

    /// Pending jobs in order, skipping those whose partition has no UP node.
    pub fn candidates<'a>(
        &'a self,
        snapshot: &'a CatalogSnapshot,
    ) -> impl Iterator<Item = JobId> + 'a {
        self.ordered
            .iter()
            .filter(move |e| snapshot.partition_has_up_node(&e.partition))
            .map(|e| e.job_id)
    }

    /// All pending jobs in order.
    pub fn iter(&self) -> impl Iterator<Item = JobId> + '_ {
        self.ordered.iter().map(|e| e.job_id)
    }

    pub fn len(&self) -> usize {
        self.ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ordered.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.ordered.len() >= self.max_jobs
    }

    fn insert(&mut self, entry: QueueEntry) {
        self.index.insert(entry.job_id, entry.clone());
        self.ordered.insert(entry);
    }
}
