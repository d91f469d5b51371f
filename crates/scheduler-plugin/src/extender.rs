//! The kube-scheduler extender webhook contract: `POST /filter` and
//! `POST /prioritize`, as configured via the scheduler's extender policy.
//! This is the out-of-tree equivalent of the original's in-tree
//! `FilterPlugin`/`ScorePlugin`; the algorithm in `algorithm.rs` is
//! unchanged, only the transport.

use crate::algorithm::{blend, filter, score, FilterDecision};
use crate::cache::NodeCache;
use crate::config::ExtenderConfig;
use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use k8s_openapi::api::core::v1::{Node, Pod};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExtenderArgs {
    #[serde(default)]
    pub pod: Pod,
    #[serde(default)]
    pub nodes: Option<NodeList>,
    #[serde(default)]
    pub node_names: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct NodeList {
    #[serde(default)]
    pub items: Vec<Node>,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExtenderFilterResult {
    pub node_names: Option<Vec<String>>,
    pub failed_nodes: Option<HashMap<String, String>>,
    pub error: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct HostPriority {
    pub host: String,
    pub score: i64,
}

pub type HostPriorityList = Vec<HostPriority>;

#[derive(Clone)]
pub struct ExtenderState {
    pub config: Arc<ExtenderConfig>,
    pub cache: Arc<NodeCache>,
    pub ai_scores: Option<Arc<RwLock<HashMap<String, i64>>>>,
}

pub fn router(state: ExtenderState) -> Router {
    Router::new()
        .route("/filter", post(filter_handler))
        .route("/prioritize", post(prioritize_handler))
        .with_state(state)
}

fn candidate_names(args: &ExtenderArgs) -> Vec<String> {
    if let Some(names) = &args.node_names {
        return names.clone();
    }
    args.nodes
        .as_ref()
        .map(|list| list.items.iter().filter_map(|n| n.metadata.name.clone()).collect())
        .unwrap_or_default()
}

fn pod_request_bytes(pod: &Pod) -> u64 {
    let Some(spec) = &pod.spec else { return 0 };
    let annotations = pod.metadata.annotations.clone().unwrap_or_default();
    let mut names: Vec<String> = spec.containers.iter().map(|c| c.name.clone()).collect();
    if let Some(init) = &spec.init_containers {
        names.extend(init.iter().map(|c| c.name.clone()));
    }
    domain::pod_total_storage(&annotations, &names).unwrap_or(0)
}

async fn filter_handler(State(state): State<ExtenderState>, Json(args): Json<ExtenderArgs>) -> Json<ExtenderFilterResult> {
    let pod_request = pod_request_bytes(&args.pod);
    let mut admitted = Vec::new();
    let mut failed = HashMap::new();

    for name in candidate_names(&args) {
        let stats = state.cache.get(&name);
        let existing = state.cache.existing_allocated(&name);
        match filter(&state.config, stats, existing, pod_request) {
            FilterDecision::Admit => admitted.push(name),
            FilterDecision::Reject(reason) => {
                failed.insert(name, reason);
            }
        }
    }

    Json(ExtenderFilterResult {
        node_names: Some(admitted),
        failed_nodes: if failed.is_empty() { None } else { Some(failed) },
        error: String::new(),
    })
}

async fn prioritize_handler(State(state): State<ExtenderState>, Json(args): Json<ExtenderArgs>) -> Json<HostPriorityList> {
    let pod_request = pod_request_bytes(&args.pod);
    let mut priorities = Vec::new();

    for name in candidate_names(&args) {
        let Some(stats) = state.cache.get(&name) else {
            priorities.push(HostPriority { host: name, score: 0 });
            continue;
        };
        let existing = state.cache.existing_allocated(&name);
        let computed = score(&state.config, stats, existing, pod_request);
        let final_score = if state.config.ai_fully_configured() {
            let ai_risk = state.ai_scores.as_ref().and_then(|scores| scores.read().get(&name).copied());
            blend(computed, ai_risk, state.config.ai_weight_ratio)
        } else {
            computed
        };
        priorities.push(HostPriority { host: name, score: final_score });
    }

    Json(priorities)
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::NodeStats;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn node(name: &str) -> Node {
        Node { metadata: ObjectMeta { name: Some(name.to_string()), ..Default::default() }, ..Default::default() }
    }

    fn args_with_nodes(names: &[&str]) -> ExtenderArgs {
        ExtenderArgs {
            pod: Pod::default(),
            nodes: Some(NodeList { items: names.iter().map(|n| node(n)).collect() }),
            node_names: None,
        }
    }

    #[test]
    fn candidate_names_prefers_node_names_field() {
        let mut args = args_with_nodes(&["a", "b"]);
        args.node_names = Some(vec!["c".to_string()]);
        assert_eq!(candidate_names(&args), vec!["c".to_string()]);
    }

    #[test]
    fn candidate_names_falls_back_to_node_objects() {
        let args = args_with_nodes(&["a", "b"]);
        assert_eq!(candidate_names(&args), vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn filter_handler_separates_admitted_and_failed_nodes() {
        let cache = Arc::new(NodeCache::new());
        let mut ann = HashMap::new();
        ann.insert("storage.terminus.io/physical-total".to_string(), "100Gi".to_string());
        ann.insert("storage.terminus.io/physical-used".to_string(), "10Gi".to_string());
        cache.update_node("good-node", &ann);
        // "bad-node" never opts in, so it has no cache entry.

        let state = ExtenderState {
            config: Arc::new(ExtenderConfig::default()),
            cache,
            ai_scores: None,
        };
        let args = args_with_nodes(&["good-node", "bad-node"]);
        let Json(result) = filter_handler(State(state), Json(args)).await;
        assert_eq!(result.node_names.unwrap(), vec!["good-node".to_string()]);
        assert!(result.failed_nodes.unwrap().contains_key("bad-node"));
    }

    #[test]
    fn pod_request_bytes_sums_containers_and_init_containers() {
        use k8s_openapi::api::core::v1::{Container, PodSpec};
        let pod = Pod {
            spec: Some(PodSpec {
                containers: vec![Container { name: "app".to_string(), ..Default::default() }],
                init_containers: Some(vec![Container { name: "setup-agent".to_string(), ..Default::default() }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        let bytes = pod_request_bytes(&pod);
        assert_eq!(bytes, 2 * (1u64 << 30) + 500 * (1u64 << 20));
    }

    #[test]
    fn filter_rejects_missing_stats_without_panicking() {
        let decision = filter(&ExtenderConfig::default(), None, 0, 0);
        assert!(matches!(decision, FilterDecision::Reject(_)));
    }

    #[test]
    fn node_stats_used_in_prioritize_reads_cache() {
        let cache = NodeCache::new();
        let mut ann = HashMap::new();
        ann.insert("storage.terminus.io/physical-total".to_string(), "10Gi".to_string());
        ann.insert("storage.terminus.io/physical-used".to_string(), "1Gi".to_string());
        cache.update_node("n", &ann);
        let stats = cache.get("n").unwrap();
        assert_eq!(stats, NodeStats { total: 10 << 30, used: 1 << 30 });
    }
}
