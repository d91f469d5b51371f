//! Shared data model for the Terminus quota-enforcement agent and scheduler extender.
//!
//! Nothing here talks to the filesystem, the container runtime, or the
//! Kubernetes API directly; those concerns live in their own crates. This
//! crate only carries the shapes and the small amount of pure parsing logic
//! that several of those crates need in common.

use std::collections::HashMap;
use thiserror::Error;

/// A filesystem project-quota ID. Derived from an overlay snapshot ID;
/// never zero on a live container.
pub type ProjectId = u32;

/// Errors produced while parsing domain values (quantities, annotations).
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid quantity {0:?}: {1}")]
    InvalidQuantity(String, &'static str),
}

/// Result alias for this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Everything the store and the exporter need to know about a quota-managed
/// container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    pub project_id: ProjectId,
    pub namespace: String,
    pub pod: String,
    pub container: String,
}

/// A point-in-time usage/limit reading for one project ID, already
/// normalized to bytes (block reports) or a plain count (inode reports).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaReport {
    pub id: ProjectId,
    pub used: u64,
    pub limit: u64,
}

/// The kind of report requested from a [`QuotaBackend`]-like source.
///
/// Kept here rather than in `quota-backend` because both the exporter and
/// the backend need to agree on it without the exporter depending on a
/// specific backend implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportKind {
    Blocks,
    Inodes,
}

/// Physical capacity/usage for one node, in bytes. Mirrors the pair of
/// `physical-total` / `physical-used` node annotations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeStats {
    pub total: u64,
    pub used: u64,
}

/// A resolved per-node cache entry on the scheduler side. Absence of an
/// entry (rather than zero values) means "node has not opted in".
pub type NodeCacheEntry = NodeStats;

/// Names containing any of these (case-insensitive) are treated as sidecars
/// and get the smaller default quota.
const SIDECAR_MARKERS: &[&str] = &["sidecar", "agent", "proxy", "filebeat"];

const DEFAULT_MAIN_BYTES: u64 = 2 * 1024 * 1024 * 1024;
const DEFAULT_SIDECAR_BYTES: u64 = 500 * 1024 * 1024;

/// Resolved storage intent for a single container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PodQuotaIntent {
    pub container_bytes: u64,
}

/// `true` if `container_name` should get the smaller sidecar default.
pub fn is_sidecar(container_name: &str) -> bool {
    let lower = container_name.to_ascii_lowercase();
    SIDECAR_MARKERS.iter().any(|m| lower.contains(m))
}

/// Resolve the quota for one container given the pod's annotation map.
///
/// Precedence: `storage.terminus.io/size.<container>` then
/// `storage.terminus.io/size` then the sidecar/main default.
pub fn container_quota(
    annotations: &HashMap<String, String>,
    container_name: &str,
) -> Result<PodQuotaIntent> {
    let scoped_key = format!("storage.terminus.io/size.{container_name}");
    if let Some(v) = annotations.get(&scoped_key) {
        return Ok(PodQuotaIntent { container_bytes: parse_quantity(v)? });
    }
    if let Some(v) = annotations.get("storage.terminus.io/size") {
        return Ok(PodQuotaIntent { container_bytes: parse_quantity(v)? });
    }
    let default = if is_sidecar(container_name) { DEFAULT_SIDECAR_BYTES } else { DEFAULT_MAIN_BYTES };
    Ok(PodQuotaIntent { container_bytes: default })
}

/// Sum of [`container_quota`] across every container name supplied (the
/// caller passes `spec.containers` and `spec.initContainers` names
/// together).
pub fn pod_total_storage(
    annotations: &HashMap<String, String>,
    container_names: &[String],
) -> Result<u64> {
    let mut total = 0u64;
    for name in container_names {
        total += container_quota(annotations, name)?.container_bytes;
    }
    Ok(total)
}

/// Parse a binary-SI quantity string (`"10Gi"`, `"512Mi"`, `"1024"`) into
/// bytes. Only the binary suffixes used by this system are accepted; a bare
/// number is interpreted as bytes.
pub fn parse_quantity(s: &str) -> Result<u64> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::InvalidQuantity(s.to_string(), "empty"));
    }
    const SUFFIXES: &[(&str, u64)] =
        &[("Ki", 1 << 10), ("Mi", 1 << 20), ("Gi", 1 << 30), ("Ti", 1 << 40), ("Pi", 1 << 50)];
    for (suffix, multiplier) in SUFFIXES {
        if let Some(num) = s.strip_suffix(suffix) {
            let value: f64 = num
                .trim()
                .parse()
                .map_err(|_| Error::InvalidQuantity(s.to_string(), "non-numeric magnitude"))?;
            if value < 0.0 {
                return Err(Error::InvalidQuantity(s.to_string(), "negative"));
            }
            return Ok((value * *multiplier as f64).round() as u64);
        }
    }
    s.parse::<u64>().map_err(|_| Error::InvalidQuantity(s.to_string(), "unrecognized format"))
}

/// Format a byte count as a whole-number `"<N>Gi"` string, matching the
/// annotation format the reporter publishes upstream.
pub fn format_gi(bytes: u64) -> String {
    format!("{}Gi", bytes / (1 << 30))
}
