//! The Kubernetes control plane is treated as an external collaborator: the
//! rest of the system depends only on [`ControlPlaneClient`]. This crate's
//! only job is to satisfy that trait against a real cluster.

use async_trait::async_trait;
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use log::debug;
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("kube client error: {0}")]
    Kube(#[from] kube::Error),
    #[error("failed to build kube client: {0}")]
    ClientInit(#[source] kube::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Enough of a pod to drive restore and the scheduler's existing-allocation
/// bookkeeping. Not the full `k8s_openapi::Pod`, deliberately: callers only
/// ever need these fields.
#[derive(Debug, Clone, Default)]
pub struct PodSummary {
    pub namespace: String,
    pub name: String,
    pub node_name: Option<String>,
    pub labels: HashMap<String, String>,
    pub annotations: HashMap<String, String>,
    pub containers: Vec<String>,
    pub init_containers: Vec<String>,
}

/// The subset of a `coordination.k8s.io/v1` `Lease` the AI scorer needs.
#[derive(Debug, Clone, Default)]
pub struct LeaseInfo {
    pub holder_identity: Option<String>,
}

/// Everything the enforcement agent and scheduler extender need from the
/// cluster control plane.
#[async_trait]
pub trait ControlPlaneClient: Send + Sync {
    async fn patch_pod_merge(&self, namespace: &str, name: &str, patch: Value) -> Result<()>;
    async fn patch_node_annotations(&self, node: &str, annotations: HashMap<String, Option<String>>) -> Result<()>;
    async fn patch_node_status(&self, node: &str, status: Value) -> Result<()>;
    async fn list_pods_on_node(&self, node_name: &str, label_selector: &str) -> Result<Vec<PodSummary>>;
    async fn get_lease(&self, namespace: &str, name: &str) -> Result<Option<LeaseInfo>>;
}

/// `kube`-backed adapter. Construction tries in-cluster config first, then
/// falls back to the local kubeconfig, matching the usual operator-vs-dev
/// split.
pub struct KubeControlPlaneClient {
    client: Client,
}

impl KubeControlPlaneClient {
    pub async fn try_new() -> Result<Self> {
        let client = Client::try_default().await.map_err(Error::ClientInit)?;
        Ok(Self { client })
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ControlPlaneClient for KubeControlPlaneClient {
    async fn patch_pod_merge(&self, namespace: &str, name: &str, patch: Value) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch)).await?;
        debug!("patched pod {namespace}/{name}");
        Ok(())
    }

    async fn patch_node_annotations(&self, node: &str, annotations: HashMap<String, Option<String>>) -> Result<()> {
        let api: Api<Node> = Api::all(self.client.clone());
        let patch = serde_json::json!({ "metadata": { "annotations": annotations } });
        api.patch(node, &PatchParams::default(), &Patch::Merge(&patch)).await?;
        Ok(())
    }

    async fn patch_node_status(&self, node: &str, status: Value) -> Result<()> {
        let api: Api<Node> = Api::all(self.client.clone());
        let patch = serde_json::json!({ "status": status });
        api.patch_status(node, &PatchParams::default(), &Patch::Merge(&patch)).await?;
        Ok(())
    }

    async fn list_pods_on_node(&self, node_name: &str, label_selector: &str) -> Result<Vec<PodSummary>> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let field_selector = format!("spec.nodeName={node_name}");
        let lp = kube::api::ListParams::default()
            .labels(label_selector)
            .fields(&field_selector);
        let list = api.list(&lp).await?;
        Ok(list.items.into_iter().filter_map(pod_to_summary).collect())
    }

    async fn get_lease(&self, namespace: &str, name: &str) -> Result<Option<LeaseInfo>> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), namespace);
        match api.get_opt(name).await? {
            Some(lease) => Ok(Some(LeaseInfo {
                holder_identity: lease.spec.and_then(|s| s.holder_identity),
            })),
            None => Ok(None),
        }
    }
}

fn pod_to_summary(pod: Pod) -> Option<PodSummary> {
    let meta = pod.metadata;
    let spec = pod.spec?;
    Some(PodSummary {
        namespace: meta.namespace.unwrap_or_default(),
        name: meta.name.unwrap_or_default(),
        node_name: spec.node_name,
        labels: meta.labels.unwrap_or_default(),
        annotations: meta.annotations.unwrap_or_default(),
        containers: spec.containers.into_iter().map(|c| c.name).collect(),
        init_containers: spec.init_containers.unwrap_or_default().into_iter().map(|c| c.name).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use k8s_openapi::api::core::v1::{Container, PodSpec};

    #[test]
    fn pod_to_summary_extracts_container_names() {
        let pod = Pod {
            metadata: ObjectMeta {
                namespace: Some("default".to_string()),
                name: Some("web-0".to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: Some("node-a".to_string()),
                containers: vec![Container { name: "app".to_string(), ..Default::default() }],
                init_containers: Some(vec![Container { name: "init".to_string(), ..Default::default() }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        let summary = pod_to_summary(pod).unwrap();
        assert_eq!(summary.namespace, "default");
        assert_eq!(summary.containers, vec!["app".to_string()]);
        assert_eq!(summary.init_containers, vec!["init".to_string()]);
        assert_eq!(summary.node_name.as_deref(), Some("node-a"));
    }

    #[test]
    fn pod_to_summary_rejects_podless_spec() {
        let pod = Pod { spec: None, ..Default::default() };
        assert!(pod_to_summary(pod).is_none());
    }
}
