//! Per-node physical stats and per-pod logical allocation, kept in sync
//! from a `kube::runtime::watcher` stream. Reads never contend with the
//! watch loop beyond a brief read-lock.

use domain::{parse_quantity, NodeStats};
use log::{debug, warn};
use parking_lot::RwLock;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy)]
struct PodAllocation {
    bytes: u64,
}

/// Concurrent node-stats + pod-allocation index consulted by Filter/Score.
#[derive(Default)]
pub struct NodeCache {
    stats: RwLock<HashMap<String, NodeStats>>,
    pod_allocations: RwLock<HashMap<String, (String, PodAllocation)>>,
}

impl NodeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `physical-total`/`physical-used` node annotations and update
    /// the cache entry. Either annotation missing or unparseable deletes
    /// the entry: absence means "not opted in", per the store's invariant.
    pub fn update_node(&self, name: &str, annotations: &HashMap<String, String>) {
        let total = annotations.get(reporter_total_key()).and_then(|v| parse_quantity(v).ok());
        let used = annotations.get(reporter_used_key()).and_then(|v| parse_quantity(v).ok());
        match (total, used) {
            (Some(total), Some(used)) => {
                self.stats.write().insert(name.to_string(), NodeStats { total, used });
            }
            _ => {
                if self.stats.write().remove(name).is_some() {
                    debug!("node {name}: dropped from cache, annotations missing or unparseable");
                }
            }
        }
    }

    pub fn remove_node(&self, name: &str) {
        self.stats.write().remove(name);
    }

    pub fn get(&self, name: &str) -> Option<NodeStats> {
        self.stats.read().get(name).copied()
    }

    /// Record (or replace) the logical storage footprint of a scheduled
    /// pod, keyed by `namespace/name`.
    pub fn update_pod(&self, key: String, node: String, bytes: u64) {
        self.pod_allocations.write().insert(key, (node, PodAllocation { bytes }));
    }

    pub fn remove_pod(&self, key: &str) {
        self.pod_allocations.write().remove(key);
    }

    /// Sum of every tracked pod's footprint currently assigned to `node`.
    pub fn existing_allocated(&self, node: &str) -> u64 {
        self.pod_allocations.read().values().filter(|(n, _)| n == node).map(|(_, a)| a.bytes).sum()
    }

    /// Snapshot every cached node for the AI scorer.
    pub fn all_nodes(&self) -> Vec<(String, NodeStats)> {
        self.stats.read().iter().map(|(k, v)| (k.clone(), *v)).collect()
    }
}

fn reporter_total_key() -> &'static str {
    "storage.terminus.io/physical-total"
}

fn reporter_used_key() -> &'static str {
    "storage.terminus.io/physical-used"
}

pub(crate) fn log_watch_error(context: &str, err: impl std::fmt::Display) {
    warn!("scheduler-plugin: {context} watch error: {err}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_node_requires_both_annotations() {
        let cache = NodeCache::new();
        let mut ann = HashMap::new();
        ann.insert(reporter_total_key().to_string(), "100Gi".to_string());
        cache.update_node("node-a", &ann);
        assert!(cache.get("node-a").is_none());

        ann.insert(reporter_used_key().to_string(), "10Gi".to_string());
        cache.update_node("node-a", &ann);
        let stats = cache.get("node-a").unwrap();
        assert_eq!(stats.total, 100 << 30);
        assert_eq!(stats.used, 10 << 30);
    }

    #[test]
    fn update_node_removes_entry_on_unparseable_annotation() {
        let cache = NodeCache::new();
        let mut ann = HashMap::new();
        ann.insert(reporter_total_key().to_string(), "100Gi".to_string());
        ann.insert(reporter_used_key().to_string(), "10Gi".to_string());
        cache.update_node("node-a", &ann);
        assert!(cache.get("node-a").is_some());

        ann.insert(reporter_used_key().to_string(), "garbage".to_string());
        cache.update_node("node-a", &ann);
        assert!(cache.get("node-a").is_none());
    }

    #[test]
    fn existing_allocated_sums_only_matching_node() {
        let cache = NodeCache::new();
        cache.update_pod("default/a".to_string(), "node-a".to_string(), 10);
        cache.update_pod("default/b".to_string(), "node-a".to_string(), 20);
        cache.update_pod("default/c".to_string(), "node-b".to_string(), 99);
        assert_eq!(cache.existing_allocated("node-a"), 30);
        assert_eq!(cache.existing_allocated("node-b"), 99);

        cache.remove_pod("default/a");
        assert_eq!(cache.existing_allocated("node-a"), 20);
    }
}
