//! Integration tests for event channel backpressure.
//!
//! These tests validate that:
//! - When the controller's event channel is full, `try_submit` immediately
//!   returns `Backpressure` rather than blocking.
//! - When the controller stops draining its channel, `submit` returns
//!   `Timeout` after the configured ack timeout rather than hanging forever.
//! - When the controller is gone, callers get `ControllerUnavailable`.

mod test_harness;

use std::time::{Duration, Instant};

use chrono::Utc;
use slurm_lite::controller::{Controller, ControllerHandle, Event, SchedulerCore};
use slurm_lite::scheduler::Principal;
use slurm_lite::SchedError;
use test_harness::{cpus, test_catalog, test_config};

/// A controller that is never run, so nothing drains its channel.
fn idle_controller(capacity: usize, ack_timeout_ms: u64) -> (Controller, ControllerHandle) {
    let mut config = test_config().with_channel_capacity(capacity);
    config.ack_timeout_ms = ack_timeout_ms;
    Controller::new(SchedulerCore::new(config, test_catalog(&[("n1", 4)])))
}

/// Fill the event channel to capacity; return the number of slots filled.
fn fill_channel(handle: &ControllerHandle) -> usize {
    let sender = handle.event_sender();
    let mut count = 0usize;
    while sender.try_send(Event::SweepHeartbeats).is_ok() {
        count += 1;
    }
    count
}

// ---------------------------------------------------------------------------
// Test 1: full channel → Backpressure (no blocking)
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_backpressure_when_channel_full() {
    let (_controller, handle) = idle_controller(16, 5_000);

    let filled = fill_channel(&handle);
    assert_eq!(filled, 16, "channel capacity should match config");

    let start = Instant::now();
    let result = handle.try_submit(cpus(1), Principal::user("alice")).await;
    let elapsed = start.elapsed();

    assert_eq!(result, Err(SchedError::Backpressure));
    assert!(result.unwrap_err().is_transient());
    assert!(
        elapsed < Duration::from_millis(200),
        "try_submit must be non-blocking (took {:?})",
        elapsed
    );
}

// ---------------------------------------------------------------------------
// Test 2: controller stalled → Timeout after the ack timeout
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_timeout_when_controller_stalled() {
    // Keep the controller alive so the channel stays open.
    let (_controller, handle) = idle_controller(16, 300);

    let start = Instant::now();
    let result = handle.submit(cpus(1), Principal::user("alice")).await;
    let elapsed = start.elapsed();

    assert_eq!(result, Err(SchedError::Timeout));
    assert!(
        elapsed >= Duration::from_millis(250),
        "should have waited for the ack timeout (took {:?})",
        elapsed
    );
    assert!(
        elapsed < Duration::from_secs(3),
        "should not wait much longer than the ack timeout (took {:?})",
        elapsed
    );
}

// ---------------------------------------------------------------------------
// Test 3: controller dropped → ControllerUnavailable
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_unavailable_when_controller_dropped() {
    let (controller, handle) = idle_controller(16, 5_000);
    drop(controller);

    assert_eq!(
        handle.submit(cpus(1), Principal::user("alice")).await,
        Err(SchedError::ControllerUnavailable)
    );
    assert_eq!(
        handle.try_submit(cpus(1), Principal::user("alice")).await,
        Err(SchedError::ControllerUnavailable)
    );
    assert_eq!(
        handle.notify_node_heartbeat("n1", Utc::now()).await,
        Err(SchedError::ControllerUnavailable)
    );
}
