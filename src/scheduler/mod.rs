pub mod allocation;
pub mod allocator;
pub mod backfill;
pub mod job;
pub mod policy;
pub mod queue;
pub mod state_machine;

pub use allocation::{AllocationRecord, AllocationTable};
pub use allocator::Allocator;
pub use backfill::{Plan, Reservation, UnboundedJobPolicy};
pub use job::{ExitStatus, Job, JobId, JobRequest, JobSpec, JobState, Principal, ResourceRequest, StateReason};
pub use policy::{PlacementKind, PlacementPolicy};
pub use queue::{JobQueue, QueueEntry};
