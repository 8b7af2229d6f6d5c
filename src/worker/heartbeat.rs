use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::controller::ControllerHandle;

/// Periodically reports a node as alive.
///
/// Each beat is delayed by a random jitter so agents started together do
/// not report in lockstep.
#[derive(Debug, Clone)]
pub struct HeartbeatAgent {
    node: String,
    interval: Duration,
    jitter: Duration,
}

impl HeartbeatAgent {
    pub fn new(node: impl Into<String>, interval_ms: u64) -> Self {
        let interval = Duration::from_millis(interval_ms);
        Self {
            node: node.into(),
            interval,
            jitter: interval / 10,
        }
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    fn next_delay(&self) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return self.interval;
        }
        self.interval + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }

    /// Beat until `shutdown` fires or the controller goes away.
    pub async fn run(self, handle: ControllerHandle, shutdown: CancellationToken) {
        loop {
            let delay = self.next_delay();
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            if handle.notify_node_heartbeat(&self.node, Utc::now()).await.is_err() {
                tracing::debug!(node = %self.node, "Controller gone, stopping heartbeats");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_stays_within_jitter() {
        let agent = HeartbeatAgent::new("n1", 1000).with_jitter(Duration::from_millis(50));
        for _ in 0..100 {
            let d = agent.next_delay();
            assert!(d >= Duration::from_millis(1000) && d <= Duration::from_millis(1050));
        }
        let exact = HeartbeatAgent::new("n1", 200).with_jitter(Duration::ZERO);
        assert_eq!(exact.next_delay(), Duration::from_millis(200));
    }
}
