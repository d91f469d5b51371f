//! Periodically reads the containerd root's physical disk usage and
//! publishes it upstream as node annotations and as an extended,
//! schedulable resource.

use control_plane::ControlPlaneClient;
use domain::format_gi;
use log::{debug, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("statvfs({0:?}) failed: {1}")]
    Statvfs(PathBuf, #[source] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

pub const ANNOTATION_TOTAL: &str = "storage.terminus.io/physical-total";
pub const ANNOTATION_USED: &str = "storage.terminus.io/physical-used";
pub const EXTENDED_RESOURCE: &str = "storage.terminus.io/physical-total";

/// Total/free/used bytes for the filesystem backing `path`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskUsage {
    pub total: u64,
    pub free: u64,
    pub used: u64,
}

/// Read disk usage via `statvfs`, mirroring the original's
/// `syscall.Statfs_t`-based calculation (`total = blocks * bsize`,
/// `free = bavail * bsize`, `used = total - free`).
pub fn disk_usage(path: &Path) -> Result<DiskUsage> {
    let cpath = std::ffi::CString::new(path.as_os_str().to_string_lossy().as_bytes())
        .map_err(|_| Error::Statvfs(path.to_path_buf(), std::io::Error::from(std::io::ErrorKind::InvalidInput)))?;
    let mut buf: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(cpath.as_ptr(), &mut buf) };
    if rc != 0 {
        return Err(Error::Statvfs(path.to_path_buf(), std::io::Error::last_os_error()));
    }
    let block_size = buf.f_frsize as u64;
    let total = buf.f_blocks as u64 * block_size;
    let free = buf.f_bavail as u64 * block_size;
    Ok(DiskUsage { total, free, used: total.saturating_sub(free) })
}

pub struct Reporter {
    control: Arc<dyn ControlPlaneClient>,
    node_name: String,
    containerd_path: PathBuf,
    interval: Duration,
}

impl Reporter {
    pub fn new(control: Arc<dyn ControlPlaneClient>, node_name: String, containerd_path: PathBuf, interval: Duration) -> Self {
        Self { control, node_name, containerd_path, interval }
    }

    /// Tick until `cancel` fires, then reset the advertised annotations so
    /// the scheduler drops this node from the eligible set.
    pub async fn run(self, cancel: tokio_util::sync::CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.reset().await;
                    debug!("reporter shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    self.report_once().await;
                }
            }
        }
    }

    async fn report_once(&self) {
        let usage = match disk_usage(&self.containerd_path) {
            Ok(u) => u,
            Err(e) => {
                warn!("reporter: disk usage read failed: {e}");
                return;
            }
        };
        if let Err(e) = self.publish(usage.total, usage.used).await {
            warn!("reporter: failed to patch node {}: {e}", self.node_name);
        }
    }

    async fn publish(&self, total: u64, used: u64) -> control_plane::Result<()> {
        let mut annotations = std::collections::HashMap::new();
        annotations.insert(ANNOTATION_TOTAL.to_string(), Some(format_gi(total)));
        annotations.insert(ANNOTATION_USED.to_string(), Some(format_gi(used)));
        self.control.patch_node_annotations(&self.node_name, annotations).await?;

        let status = serde_json::json!({
            "capacity": { EXTENDED_RESOURCE: format_gi(total) },
            "allocatable": { EXTENDED_RESOURCE: format_gi(total) },
        });
        self.control.patch_node_status(&self.node_name, status).await
    }

    async fn reset(&self) {
        let mut annotations = std::collections::HashMap::new();
        annotations.insert(ANNOTATION_TOTAL.to_string(), None);
        annotations.insert(ANNOTATION_USED.to_string(), None);
        if let Err(e) = self.control.patch_node_annotations(&self.node_name, annotations).await {
            warn!("reporter: failed to reset node {} annotations: {e}", self.node_name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use control_plane::{LeaseInfo, PodSummary};
    use parking_lot::Mutex;
    use serde_json::Value;
    use std::collections::HashMap;

    #[derive(Default)]
    struct RecordingControlPlane {
        last_annotations: Mutex<Option<HashMap<String, Option<String>>>>,
        last_status: Mutex<Option<Value>>,
    }

    #[async_trait]
    impl ControlPlaneClient for RecordingControlPlane {
        async fn patch_pod_merge(&self, _ns: &str, _name: &str, _patch: Value) -> control_plane::Result<()> {
            Ok(())
        }
        async fn patch_node_annotations(&self, _node: &str, ann: HashMap<String, Option<String>>) -> control_plane::Result<()> {
            *self.last_annotations.lock() = Some(ann);
            Ok(())
        }
        async fn patch_node_status(&self, _node: &str, status: Value) -> control_plane::Result<()> {
            *self.last_status.lock() = Some(status);
            Ok(())
        }
        async fn list_pods_on_node(&self, _node: &str, _sel: &str) -> control_plane::Result<Vec<PodSummary>> {
            Ok(vec![])
        }
        async fn get_lease(&self, _ns: &str, _name: &str) -> control_plane::Result<Option<LeaseInfo>> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn publish_formats_annotations_as_gi_strings() {
        let control = Arc::new(RecordingControlPlane::default());
        let reporter = Reporter::new(control.clone(), "node-a".to_string(), PathBuf::from("/"), Duration::from_secs(1));
        reporter.publish(10u64 << 30, 3u64 << 30).await.unwrap();
        let ann = control.last_annotations.lock().clone().unwrap();
        assert_eq!(ann.get(ANNOTATION_TOTAL).unwrap().as_deref(), Some("10Gi"));
        assert_eq!(ann.get(ANNOTATION_USED).unwrap().as_deref(), Some("3Gi"));
    }

    #[tokio::test]
    async fn reset_clears_annotations_to_none() {
        let control = Arc::new(RecordingControlPlane::default());
        let reporter = Reporter::new(control.clone(), "node-a".to_string(), PathBuf::from("/"), Duration::from_secs(1));
        reporter.reset().await;
        let ann = control.last_annotations.lock().clone().unwrap();
        assert!(ann.get(ANNOTATION_TOTAL).unwrap().is_none());
    }

    #[test]
    fn disk_usage_reads_root_filesystem() {
        let usage = disk_usage(Path::new("/")).unwrap();
        assert!(usage.total > 0);
        assert!(usage.used <= usage.total);
    }
}
