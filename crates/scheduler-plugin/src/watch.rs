//! Keeps [`NodeCache`] in sync with the cluster via `kube::runtime::watcher`
//! streams over `Node` and `Pod`.

use crate::cache::{log_watch_error, NodeCache};
use domain::pod_total_storage;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::runtime::watcher::{watcher, Config, Event};
use kube::{Api, Client};
use std::sync::Arc;

/// Drive node annotation changes into the cache until cancelled.
pub async fn run_node_watch(client: Client, cache: Arc<NodeCache>, cancel: tokio_util::sync::CancellationToken) {
    let api: Api<Node> = Api::all(client);
    let mut stream = Box::pin(watcher(api, Config::default()));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            next = stream.next() => {
                match next {
                    Some(Ok(Event::Apply(node))) => apply_node(&cache, &node),
                    Some(Ok(Event::Delete(node))) => delete_node(&cache, &node),
                    Some(Ok(Event::Init)) | Some(Ok(Event::InitApply(_))) | Some(Ok(Event::InitDone)) => {}
                    Some(Err(e)) => log_watch_error("node", e),
                    None => return,
                }
            }
        }
    }
}

/// Drive pod-to-node logical allocation changes into the cache until
/// cancelled.
pub async fn run_pod_watch(client: Client, cache: Arc<NodeCache>, cancel: tokio_util::sync::CancellationToken) {
    let api: Api<Pod> = Api::all(client);
    let mut stream = Box::pin(watcher(api, Config::default()));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            next = stream.next() => {
                match next {
                    Some(Ok(Event::Apply(pod))) => apply_pod(&cache, &pod),
                    Some(Ok(Event::Delete(pod))) => delete_pod(&cache, &pod),
                    Some(Ok(Event::Init)) | Some(Ok(Event::InitApply(_))) | Some(Ok(Event::InitDone)) => {}
                    Some(Err(e)) => log_watch_error("pod", e),
                    None => return,
                }
            }
        }
    }
}

fn apply_node(cache: &NodeCache, node: &Node) {
    let Some(name) = &node.metadata.name else { return };
    let annotations = node.metadata.annotations.clone().unwrap_or_default();
    cache.update_node(name, &annotations);
}

fn delete_node(cache: &NodeCache, node: &Node) {
    if let Some(name) = &node.metadata.name {
        cache.remove_node(name);
    }
}

fn is_terminal(pod: &Pod) -> bool {
    matches!(
        pod.status.as_ref().and_then(|s| s.phase.as_deref()),
        Some("Succeeded") | Some("Failed")
    )
}

fn apply_pod(cache: &NodeCache, pod: &Pod) {
    let (Some(namespace), Some(name)) = (&pod.metadata.namespace, &pod.metadata.name) else { return };
    let key = format!("{namespace}/{name}");
    if is_terminal(pod) {
        cache.remove_pod(&key);
        return;
    }
    let Some(spec) = &pod.spec else { return };
    let Some(node_name) = &spec.node_name else {
        cache.remove_pod(&key);
        return;
    };
    let annotations = pod.metadata.annotations.clone().unwrap_or_default();
    let mut names: Vec<String> = spec.containers.iter().map(|c| c.name.clone()).collect();
    if let Some(init) = &spec.init_containers {
        names.extend(init.iter().map(|c| c.name.clone()));
    }
    let bytes = pod_total_storage(&annotations, &names).unwrap_or(0);
    cache.update_pod(key, node_name.clone(), bytes);
}

fn delete_pod(cache: &NodeCache, pod: &Pod) {
    if let (Some(namespace), Some(name)) = (&pod.metadata.namespace, &pod.metadata.name) {
        cache.remove_pod(&format!("{namespace}/{name}"));
    }
}
