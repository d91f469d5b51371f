//! Oversubscription- and physical-circuit-breaker-aware admission control
//! and scoring, exposed as a kube-scheduler extender HTTP webhook (the
//! out-of-tree equivalent of the original's in-tree scheduler framework
//! plugin).

pub mod algorithm;
pub mod cache;
pub mod config;
pub mod extender;
pub mod watch;

pub use algorithm::{blend, filter, score, FilterDecision};
pub use cache::NodeCache;
pub use config::ExtenderConfig;
pub use extender::{router, ExtenderState};

use ai_risk_scorer::{ClusterSnapshotSource, NodeRow};

/// Lets the AI scorer pull a snapshot without depending on scheduler
/// internals.
impl ClusterSnapshotSource for NodeCache {
    fn snapshot(&self) -> Vec<NodeRow> {
        self.all_nodes()
            .into_iter()
            .map(|(name, stats)| {
                let existing = self.existing_allocated(&name);
                NodeRow {
                    total_bytes: stats.total,
                    used_bytes: stats.used,
                    existing_allocated_bytes: existing,
                    total_quota_bytes: stats.total,
                    name,
                }
            })
            .collect()
    }
}
