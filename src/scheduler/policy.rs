//! Placement policies: which candidate node takes a share of a job.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::catalog::Node;
use crate::resources::ResourceVector;

/// Ranks candidate nodes for one per-node share. Lower ranks win; ties are
/// broken by node name so placement is deterministic.
pub trait PlacementPolicy: Send + Sync + std::fmt::Debug {
    fn rank(&self, node: &Node, share: &ResourceVector) -> u64;

    fn name(&self) -> &'static str;
}

/// Smallest normalized leftover first, to limit fragmentation.
#[derive(Debug, Default, Clone, Copy)]
pub struct BestFit;

impl PlacementPolicy for BestFit {
    fn rank(&self, node: &Node, share: &ResourceVector) -> u64 {
        share.leftover_score(&node.available, &node.total)
    }

    fn name(&self) -> &'static str {
        "best-fit"
    }
}

/// Node name order.
#[derive(Debug, Default, Clone, Copy)]
pub struct FirstFit;

impl PlacementPolicy for FirstFit {
    fn rank(&self, _node: &Node, _share: &ResourceVector) -> u64 {
        0
    }

    fn name(&self) -> &'static str {
        "first-fit"
    }
}

/// Largest leftover first, spreading load across nodes.
#[derive(Debug, Default, Clone, Copy)]
pub struct Spread;

impl PlacementPolicy for Spread {
    fn rank(&self, node: &Node, share: &ResourceVector) -> u64 {
        u64::MAX - share.leftover_score(&node.available, &node.total)
    }

    fn name(&self) -> &'static str {
        "spread"
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlacementKind {
    #[default]
    BestFit,
    FirstFit,
    Spread,
}

impl PlacementKind {
    pub fn policy(self) -> Arc<dyn PlacementPolicy> {
        match self {
            PlacementKind::BestFit => Arc::new(BestFit),
            PlacementKind::FirstFit => Arc::new(FirstFit),
            PlacementKind::Spread => Arc::new(Spread),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeSet;

    fn node(name: &str, available: ResourceVector, total: ResourceVector) -> Node {
        let mut n = Node::new(name.into(), total, BTreeSet::new(), Utc::now());
        n.available = available;
        n
    }

    #[test]
    fn best_fit_prefers_tight_node_spread_prefers_roomy() {
        let total = ResourceVector::new(8, 8192);
        let tight = node("a", ResourceVector::new(2, 2048), total.clone());
        let roomy = node("b", ResourceVector::new(8, 8192), total);
        let share = ResourceVector::new(2, 2048);

        assert!(BestFit.rank(&tight, &share) < BestFit.rank(&roomy, &share));
        assert!(Spread.rank(&tight, &share) > Spread.rank(&roomy, &share));
        assert_eq!(FirstFit.rank(&tight, &share), FirstFit.rank(&roomy, &share));
        assert_eq!(PlacementKind::default().policy().name(), "best-fit");
    }
}
