//! Event-driven in-memory projectID→container metadata index.
//!
//! Producers (the enforcement hook, restore) never block: [`StoreHandle`]
//! enqueues onto a bounded channel and drops the event with a log warning
//! if it is full. A single consumer task ([`StoreWorker`]) drains the
//! channel and applies updates/deletes under a `parking_lot::RwLock`, so
//! reads (the exporter) never contend with the queue itself.

use control_plane::ControlPlaneClient;
use domain::{ContainerInfo, ProjectId};
use log::{debug, warn};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Label selector applied when listing pods for restore.
pub const QUOTA_ENABLED_LABEL: &str = "storage.terminus.io/quota=enabled";

/// Annotation key prefix; the full key is `{PROJECT_ID_ANNOTATION_PREFIX}{container}`.
pub const PROJECT_ID_ANNOTATION_PREFIX: &str = "storage.terminus.io/project-id.";

#[derive(Debug, Error)]
pub enum Error {
    #[error("store channel closed")]
    ChannelClosed,
}

pub type Result<T> = std::result::Result<T, Error>;

/// Default channel capacity, matching the original agent's queue depth.
pub const DEFAULT_CAPACITY: usize = 1000;

#[derive(Debug, Clone)]
enum StoreEvent {
    Update(ContainerInfo),
    Delete(ProjectId),
}

type Map = Arc<RwLock<HashMap<ProjectId, ContainerInfo>>>;

/// Cloneable handle used by producers and readers. Does not itself own the
/// consumer loop; pair with a [`StoreWorker`] obtained from [`channel`].
#[derive(Clone)]
pub struct StoreHandle {
    tx: tokio::sync::mpsc::Sender<StoreEvent>,
    map: Map,
}

/// Owns the receiving end of the channel; run its [`StoreWorker::run`]
/// future as a long-lived task.
pub struct StoreWorker {
    rx: tokio::sync::mpsc::Receiver<StoreEvent>,
    map: Map,
}

/// Build a linked handle/worker pair backed by a channel of `capacity`.
pub fn channel(capacity: usize) -> (StoreHandle, StoreWorker) {
    let (tx, rx) = tokio::sync::mpsc::channel(capacity);
    let map: Map = Arc::new(RwLock::new(HashMap::new()));
    (StoreHandle { tx, map: map.clone() }, StoreWorker { rx, map })
}

impl StoreHandle {
    /// Enqueue an UPDATE for `info.project_id`. Non-blocking: if the queue
    /// is full, the event is dropped and a warning is logged.
    pub fn trigger_update(&self, info: ContainerInfo) {
        let id = info.project_id;
        if let Err(e) = self.tx.try_send(StoreEvent::Update(info)) {
            warn!("metadata store queue full, dropping UPDATE for project {id}: {e}");
        }
    }

    /// Enqueue a DELETE for `id`. Non-blocking, same drop-on-full policy as
    /// [`StoreHandle::trigger_update`].
    pub fn trigger_delete(&self, id: ProjectId) {
        if let Err(e) = self.tx.try_send(StoreEvent::Delete(id)) {
            warn!("metadata store queue full, dropping DELETE for project {id}: {e}");
        }
    }

    /// Snapshot the current entry for `id`, if any.
    pub fn get(&self, id: ProjectId) -> Option<ContainerInfo> {
        self.map.read().get(&id).cloned()
    }

    /// Number of entries currently held. Exposed for metrics/diagnostics.
    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Rebuild the map after process restart by replaying the project-ID
    /// annotations of every quota-enabled pod already scheduled on this
    /// node. Best-effort: failures are logged, not propagated, since a
    /// partial restore is still strictly better than an empty one.
    pub async fn restore(&self, client: &dyn ControlPlaneClient, node_name: &str) {
        let pods = match client.list_pods_on_node(node_name, QUOTA_ENABLED_LABEL).await {
            Ok(pods) => pods,
            Err(e) => {
                warn!("restore: failed to list pods on {node_name}: {e}");
                return;
            }
        };
        for pod in pods {
            for (key, value) in &pod.annotations {
                let Some(container) = key.strip_prefix(PROJECT_ID_ANNOTATION_PREFIX) else {
                    continue;
                };
                let Ok(project_id) = value.parse::<ProjectId>() else {
                    warn!("restore: malformed project id annotation {key}={value} on {}/{}", pod.namespace, pod.name);
                    continue;
                };
                self.trigger_update(ContainerInfo {
                    project_id,
                    namespace: pod.namespace.clone(),
                    pod: pod.name.clone(),
                    container: container.to_string(),
                });
            }
        }
    }
}

impl StoreWorker {
    /// Drain events until the channel closes or `cancel` fires.
    pub async fn run(mut self, cancel: tokio_util::sync::CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("metadata store worker shutting down");
                    return;
                }
                event = self.rx.recv() => {
                    match event {
                        Some(event) => self.apply(event),
                        None => return,
                    }
                }
            }
        }
    }

    fn apply(&mut self, event: StoreEvent) {
        match event {
            StoreEvent::Update(info) => {
                self.map.write().insert(info.project_id, info);
            }
            StoreEvent::Delete(id) => {
                self.map.write().remove(&id);
            }
        }
    }
}
