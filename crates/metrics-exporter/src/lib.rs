//! Prometheus scrape endpoint exposing per-container quota usage/limits.
//!
//! The original agent carried three near-identical collectors, one per
//! filesystem backend plus a "standard" fallback. Since every backend
//! here already speaks the same [`quota_backend::QuotaBackend`] trait,
//! one collector suffices; it is parameterized over the trait object
//! rather than duplicated per filesystem.

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use domain::ReportKind;
use log::{debug, warn};
use metadata_store::StoreHandle;
use prometheus::core::{Collector, Desc};
use prometheus::proto::{Gauge, LabelPair, Metric, MetricFamily, MetricType};
use quota_backend::QuotaBackend;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to bind metrics listener on {0}: {1}")]
    Bind(SocketAddr, #[source] std::io::Error),
    #[error("metrics server error: {0}")]
    Serve(#[source] std::io::Error),
    #[error("registry error: {0}")]
    Registry(#[from] prometheus::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Collects the four quota gauges across every project ID the backend
/// currently knows about, joined against the metadata store for labels.
pub struct QuotaCollector {
    backend: Arc<dyn QuotaBackend>,
    store: StoreHandle,
    used_bytes: Desc,
    limit_bytes: Desc,
    inodes_used: Desc,
    inodes_limit: Desc,
    mount_point: String,
}

const LABELS: &[&str] = &["namespace", "pod", "container", "mount_point", "project_id"];

impl QuotaCollector {
    pub fn new(backend: Arc<dyn QuotaBackend>, store: StoreHandle, mount_point: String) -> Self {
        let desc = |name: &str, help: &str| {
            Desc::new(name.to_string(), help.to_string(), LABELS.iter().map(|s| s.to_string()).collect(), Default::default())
                .expect("static metric descriptor is well-formed")
        };
        Self {
            backend,
            store,
            used_bytes: desc("terminus_storage_used_bytes", "Bytes used against the project quota"),
            limit_bytes: desc("terminus_storage_limit_bytes", "Bytes allowed by the project quota"),
            inodes_used: desc("terminus_storage_inodes_used", "Inodes used against the project quota"),
            inodes_limit: desc("terminus_storage_inodes_limit", "Inodes allowed by the project quota"),
            mount_point,
        }
    }

    fn gauge_family(&self, desc: &Desc, values: &[(domain::ProjectId, u64)]) -> MetricFamily {
        let mut family = MetricFamily::default();
        family.set_name(desc.fq_name.clone());
        family.set_help(desc.help.clone());
        family.set_field_type(MetricType::GAUGE);
        let metrics = values
            .iter()
            .filter_map(|(id, value)| {
                let info = self.store.get(*id)?;
                let mut metric = Metric::default();
                let mut gauge = Gauge::default();
                gauge.set_value(*value as f64);
                metric.set_gauge(gauge);
                metric.set_label(
                    [
                        ("namespace", info.namespace.as_str()),
                        ("pod", info.pod.as_str()),
                        ("container", info.container.as_str()),
                        ("mount_point", self.mount_point.as_str()),
                        ("project_id", &id.to_string()),
                    ]
                    .into_iter()
                    .map(|(name, value)| {
                        let mut pair = LabelPair::default();
                        pair.set_name(name.to_string());
                        pair.set_value(value.to_string());
                        pair
                    })
                    .collect(),
                );
                Some(metric)
            })
            .collect();
        family.set_metric(metrics);
        family
    }
}

impl Collector for QuotaCollector {
    fn desc(&self) -> Vec<&Desc> {
        vec![&self.used_bytes, &self.limit_bytes, &self.inodes_used, &self.inodes_limit]
    }

    fn collect(&self) -> Vec<MetricFamily> {
        let blocks = match self.backend.fetch_all_reports(ReportKind::Blocks) {
            Ok(r) => r,
            Err(e) => {
                warn!("metrics-exporter: block report fetch failed: {e}");
                Vec::new()
            }
        };
        let inodes = match self.backend.fetch_all_reports(ReportKind::Inodes) {
            Ok(r) => r,
            Err(e) => {
                warn!("metrics-exporter: inode report fetch failed: {e}");
                Vec::new()
            }
        };

        let used: Vec<_> = blocks.iter().map(|r| (r.id, r.used)).collect();
        let limit: Vec<_> = blocks.iter().map(|r| (r.id, r.limit)).collect();
        let inodes_used: Vec<_> = inodes.iter().map(|r| (r.id, r.used)).collect();
        let inodes_limit: Vec<_> = inodes.iter().map(|r| (r.id, r.limit)).collect();

        vec![
            self.gauge_family(&self.used_bytes, &used),
            self.gauge_family(&self.limit_bytes, &limit),
            self.gauge_family(&self.inodes_used, &inodes_used),
            self.gauge_family(&self.inodes_limit, &inodes_limit),
        ]
    }
}

#[derive(Clone)]
struct AppState {
    registry: Arc<prometheus::Registry>,
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let metric_families = state.registry.gather();
    let mut buf = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buf) {
        warn!("metrics-exporter: encoding failed: {e}");
    }
    ([("content-type", encoder.format_type())], buf)
}

/// Build the registry + router, then serve `/metrics` on `addr` until
/// `cancel` fires (5s graceful-shutdown grace, matching the original's
/// `net/http` server shutdown timeout).
pub async fn serve(
    addr: SocketAddr,
    backend: Arc<dyn QuotaBackend>,
    store: StoreHandle,
    mount_point: String,
    cancel: tokio_util::sync::CancellationToken,
) -> Result<()> {
    let registry = prometheus::Registry::new();
    registry.register(Box::new(QuotaCollector::new(backend, store, mount_point)))?;
    let state = AppState { registry: Arc::new(registry) };

    let app = Router::new().route("/metrics", get(metrics_handler)).with_state(state);
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| Error::Bind(addr, e))?;
    debug!("metrics exporter listening on {addr}");

    let shutdown_signal = cancel.clone();
    let mut serve_fut = Box::pin(
        axum::serve(listener, app).with_graceful_shutdown(async move { shutdown_signal.cancelled().await }),
    );

    tokio::select! {
        result = &mut serve_fut => return result.map_err(Error::Serve),
        _ = cancel.cancelled() => {}
    }

    match tokio::time::timeout(std::time::Duration::from_secs(5), serve_fut).await {
        Ok(result) => result.map_err(Error::Serve),
        Err(_) => {
            warn!("metrics exporter did not drain in-flight requests within the 5s grace window, forcing shutdown");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::{ContainerInfo, QuotaReport};
    use quota_backend::Result as QuotaResult;

    struct FakeBackend {
        reports: Vec<QuotaReport>,
    }

    impl QuotaBackend for FakeBackend {
        fn set_project_id(&self, _path: &std::path::Path, _id: domain::ProjectId) -> QuotaResult<()> {
            Ok(())
        }
        fn set_quota(&self, _id: domain::ProjectId, _bytes: u64) -> QuotaResult<()> {
            Ok(())
        }
        fn remove_quota(&self, _path: &std::path::Path, _id: domain::ProjectId) -> QuotaResult<()> {
            Ok(())
        }
        fn fetch_all_reports(&self, _kind: ReportKind) -> QuotaResult<Vec<QuotaReport>> {
            Ok(self.reports.clone())
        }
    }

    #[test]
    fn collect_skips_reports_with_no_store_entry() {
        let backend = Arc::new(FakeBackend { reports: vec![QuotaReport { id: 1, used: 10, limit: 20 }] });
        let (store, _worker) = metadata_store::channel(4);
        let collector = QuotaCollector::new(backend, store, "/var/lib/containerd".to_string());
        let families = collector.collect();
        assert_eq!(families[0].get_metric().len(), 0);
    }

    #[tokio::test]
    async fn collect_joins_known_project_with_store_labels() {
        let backend = Arc::new(FakeBackend { reports: vec![QuotaReport { id: 7, used: 10, limit: 20 }] });
        let (store, worker) = metadata_store::channel(4);
        let cancel = tokio_util::sync::CancellationToken::new();
        let task = tokio::spawn(worker.run(cancel.clone()));
        store.trigger_update(ContainerInfo {
            project_id: 7,
            namespace: "default".to_string(),
            pod: "web-0".to_string(),
            container: "app".to_string(),
        });
        for _ in 0..100 {
            if store.get(7).is_some() {
                break;
            }
            tokio::task::yield_now().await;
        }

        let collector = QuotaCollector::new(backend, store, "/var/lib/containerd".to_string());
        let families = collector.collect();
        assert_eq!(families[0].get_name(), "terminus_storage_used_bytes");
        assert_eq!(families[0].get_metric().len(), 1);
        let labels = families[0].get_metric()[0].get_label();
        assert!(labels.iter().any(|l| l.get_name() == "pod" && l.get_value() == "web-0"));

        cancel.cancel();
        task.await.unwrap();
    }
}
