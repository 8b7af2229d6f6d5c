//! Local node agents.
//!
//! Stand-ins for the per-node daemons of a real cluster, used when the
//! controller runs on a single host:
//! - [`LocalExecutor`]: runs each job's command with `sh -c` and reports its exit
//! - [`HeartbeatAgent`]: keeps a node marked alive
//!
//! # Execution Flow
//!
//! 1. The controller starts a job and calls [`ExecutionLayer::start`](crate::external::ExecutionLayer::start)
//! 2. [`LocalExecutor`] spawns `sh -c <command>` in a task
//! 3. On exit it reports back through `ControllerHandle::notify_run_exited`
//! 4. Cancelled or timed-out jobs are killed and report nothing
//!
//! # Security Note
//!
//! Commands run directly in a shell without isolation.

pub mod executor;
pub mod heartbeat;

pub use executor::LocalExecutor;
pub use heartbeat::HeartbeatAgent;
