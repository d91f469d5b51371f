//! Wires the overlay resolver, quota backend and metadata store together
//! around a container's start/stop lifecycle.
//!
//! This is what the runtime event adapter's hook list actually contains;
//! the adapter itself (in `runtime-event-adapter`) knows nothing about
//! quotas, only that it has an ordered list of [`EnforcementHook`]s to run.

use async_trait::async_trait;
use control_plane::ControlPlaneClient;
use domain::{container_quota, ContainerInfo, ProjectId};
use log::{info, warn};
use metadata_store::StoreHandle;
use overlay_resolver::OverlaySnapshot;
use quota_backend::QuotaBackend;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("overlay resolution failed: {0}")]
    Overlay(#[from] overlay_resolver::Error),
    #[error("quota backend error: {0}")]
    Backend(#[from] quota_backend::Error),
    #[error("invalid quota size: {0}")]
    Domain(#[from] domain::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Pod/container-scoped annotation key for an opted-in global size.
pub const SIZE_ANNOTATION: &str = "storage.terminus.io/size";
/// Prefix for the container-scoped override: `{PREFIX}{container}`.
pub const SIZE_ANNOTATION_PREFIX: &str = "storage.terminus.io/size.";
pub const QUOTA_LABEL: &str = "storage.terminus.io/quota";

/// Everything a hook needs to know about the container it is being invoked
/// for. Constructed by the runtime event adapter from the lifecycle event.
#[derive(Debug, Clone)]
pub struct ContainerContext {
    pub namespace: String,
    pub pod: String,
    pub container: String,
    pub rootfs: PathBuf,
    pub pod_annotations: HashMap<String, String>,
}

impl ContainerContext {
    fn wants_quota(&self) -> bool {
        self.pod_annotations.contains_key(SIZE_ANNOTATION)
            || self.pod_annotations.contains_key(&format!("{SIZE_ANNOTATION_PREFIX}{}", self.container))
    }
}

/// A single lifecycle hook, invoked in order by the runtime event adapter.
#[async_trait]
pub trait EnforcementHook: Send + Sync {
    fn name(&self) -> &str;
    async fn process(&self, ctx: &ContainerContext) -> Result<()>;
    async fn start(&self, ctx: &ContainerContext) -> Result<()>;
    async fn stop(&self, ctx: &ContainerContext) -> Result<()>;
}

/// The one hook this system registers: binds a filesystem project quota to
/// a container's overlay upperdir and publishes the mapping.
pub struct StorageQuotaHook {
    backend: Arc<dyn QuotaBackend>,
    store: StoreHandle,
    control: Arc<dyn ControlPlaneClient>,
}

impl StorageQuotaHook {
    pub fn new(backend: Arc<dyn QuotaBackend>, store: StoreHandle, control: Arc<dyn ControlPlaneClient>) -> Self {
        Self { backend, store, control }
    }

    fn resolve_overlay(&self, ctx: &ContainerContext) -> Result<OverlaySnapshot> {
        Ok(overlay_resolver::resolve(&ctx.rootfs)?)
    }
}

#[async_trait]
impl EnforcementHook for StorageQuotaHook {
    fn name(&self) -> &str {
        "storage-quota"
    }

    async fn process(&self, _ctx: &ContainerContext) -> Result<()> {
        Ok(())
    }

    async fn start(&self, ctx: &ContainerContext) -> Result<()> {
        if !ctx.wants_quota() {
            return Ok(());
        }
        let intent = container_quota(&ctx.pod_annotations, &ctx.container)?;

        let snapshot = match self.resolve_overlay(ctx) {
            Ok(s) => s,
            Err(e) => {
                warn!(
                    "{}/{} container {}: overlay resolution failed, skipping quota: {e}",
                    ctx.namespace, ctx.pod, ctx.container
                );
                return Ok(());
            }
        };
        let project_id: ProjectId = snapshot.snapshot_id as ProjectId;

        let work_dir = snapshot.upper_dir.parent().map(|p| p.join("work"));
        let backend = self.backend.clone();
        let upper_dir = snapshot.upper_dir.clone();
        let bytes = intent.container_bytes;
        let set_result = tokio::task::spawn_blocking(move || -> quota_backend::Result<()> {
            backend.set_project_id(&upper_dir, project_id)?;
            if let Some(work_dir) = &work_dir {
                backend.set_project_id(work_dir, project_id)?;
            }
            backend.set_quota(project_id, bytes)?;
            Ok(())
        })
        .await;
        match set_result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("{}/{} container {}: quota setup failed: {e}", ctx.namespace, ctx.pod, ctx.container),
            Err(e) => warn!("quota setup task panicked: {e}"),
        }

        self.store.trigger_update(ContainerInfo {
            project_id,
            namespace: ctx.namespace.clone(),
            pod: ctx.pod.clone(),
            container: ctx.container.clone(),
        });

        let patch = serde_json::json!({
            "metadata": {
                "labels": { QUOTA_LABEL: "enabled" },
                "annotations": { format!("{}{}", metadata_store::PROJECT_ID_ANNOTATION_PREFIX, ctx.container): project_id.to_string() }
            }
        });
        if let Err(e) = self.control.patch_pod_merge(&ctx.namespace, &ctx.pod, patch).await {
            warn!(
                "{}/{} container {}: pod annotation patch failed, will retry on next event: {e}",
                ctx.namespace, ctx.pod, ctx.container
            );
            return Ok(());
        }

        info!("{}/{} container {}: quota bound, project id {project_id}", ctx.namespace, ctx.pod, ctx.container);
        Ok(())
    }

    async fn stop(&self, ctx: &ContainerContext) -> Result<()> {
        if !ctx.wants_quota() {
            return Ok(());
        }
        let snapshot = self.resolve_overlay(ctx)?;
        let project_id: ProjectId = snapshot.snapshot_id as ProjectId;

        let backend = self.backend.clone();
        let upper_dir = snapshot.upper_dir.clone();
        tokio::task::spawn_blocking(move || backend.remove_quota(&upper_dir, project_id))
            .await
            .map_err(|_| Error::Backend(quota_backend::Error::MountNotFound(snapshot.upper_dir.clone())))??;

        self.store.trigger_delete(project_id);
        info!("{}/{} container {}: quota released, project id {project_id}", ctx.namespace, ctx.pod, ctx.container);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx_with_annotations(ann: HashMap<String, String>) -> ContainerContext {
        ContainerContext {
            namespace: "default".to_string(),
            pod: "web-0".to_string(),
            container: "app".to_string(),
            rootfs: PathBuf::from("/run/containerd/task/rootfs"),
            pod_annotations: ann,
        }
    }

    #[test]
    fn wants_quota_requires_explicit_annotation() {
        assert!(!ctx_with_annotations(HashMap::new()).wants_quota());

        let mut ann = HashMap::new();
        ann.insert(SIZE_ANNOTATION.to_string(), "5Gi".to_string());
        assert!(ctx_with_annotations(ann).wants_quota());

        let mut ann = HashMap::new();
        ann.insert(format!("{SIZE_ANNOTATION_PREFIX}app"), "5Gi".to_string());
        assert!(ctx_with_annotations(ann).wants_quota());
    }
}
