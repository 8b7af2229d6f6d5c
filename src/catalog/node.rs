use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::resources::ResourceVector;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    Up,
    Down,
    Draining,
    Drained,
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeState::Up => write!(f, "UP"),
            NodeState::Down => write!(f, "DOWN"),
            NodeState::Draining => write!(f, "DRAINING"),
            NodeState::Drained => write!(f, "DRAINED"),
        }
    }
}

/// Why a node is DOWN. Only `NotResponding` nodes return to service on their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DownReason {
    NotResponding,
    Administrative,
}

/// Administrative states an operator can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdminState {
    Up,
    Down,
    Drain,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub total: ResourceVector,
    pub available: ResourceVector,
    pub state: NodeState,
    pub down_reason: Option<DownReason>,
    /// Operator asked for a drain. Survives a trip through DOWN and is
    /// cleared only by an explicit UP.
    #[serde(default)]
    pub drain: bool,
    pub partitions: BTreeSet<String>,
    pub last_heartbeat: DateTime<Utc>,
}

impl Node {
    pub fn new(
        name: String,
        capacity: ResourceVector,
        partitions: BTreeSet<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            name,
            available: capacity.clone(),
            total: capacity,
            state: NodeState::Up,
            down_reason: None,
            drain: false,
            partitions,
            last_heartbeat: now,
        }
    }

    /// Whether new work may be placed here.
    pub fn is_schedulable(&self) -> bool {
        self.state == NodeState::Up
    }

    /// Availability as seen by placement: zero unless the node is UP.
    pub fn effective_available(&self) -> ResourceVector {
        if self.is_schedulable() {
            self.available.clone()
        } else {
            ResourceVector::zero()
        }
    }

    /// State a node returns to when it is back in service.
    pub fn serviceable_state(&self) -> NodeState {
        match (self.drain, self.is_idle()) {
            (false, _) => NodeState::Up,
            (true, true) => NodeState::Drained,
            (true, false) => NodeState::Draining,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.available == self.total
    }

    pub fn heartbeat_age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now.signed_duration_since(self.last_heartbeat)
    }
}
