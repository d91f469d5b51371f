//! Leader-gated language-model risk scorer.
//!
//! When enabled, one replica (whichever holds the configured lease)
//! periodically snapshots node/pod usage, renders it as a markdown table,
//! asks a language model to rate each node's admission risk, and stores
//! the resulting scores for the scheduler extender to blend into its own
//! computed score.
//!
//! The language model itself is an external collaborator: this crate
//! depends on it only through [`LanguageModelClient`]. [`OpenAiClient`] is
//! the concrete adapter for OpenAI-compatible chat-completion APIs.

use async_trait::async_trait;
use control_plane::ControlPlaneClient;
use log::{debug, info, warn};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("language model request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("language model response had no JSON object")]
    NoJsonObject,
    #[error("failed to decode language model response: {0}")]
    Decode(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Nodes are batched into prompts of at most this many rows.
pub const MAX_NODES_PER_PROMPT: usize = 50;

const SYSTEM_PROMPT: &str = "\
You are a storage capacity risk actuary for a Kubernetes cluster. You will \
receive a markdown table of nodes with their total and used physical \
storage, current usage percentage, and the storage already logically \
committed to pods (existingAllocatedGi) against the node's total quota \
budget (totalQuotaGi). For each node, output an integer risk score from 0 \
(very safe to schedule more storage-heavy pods here) to 100 (a bank-run \
scenario: admitting more work risks the node running out of physical \
space before oversubscribed pods actually consume their full quotas). \
Weigh nodes above 90% physical usage as high risk regardless of their \
logical headroom. Respond with nothing but a single JSON object mapping \
each node name to its integer score, e.g. {\"node-a\": 12, \"node-b\": 87}.";

/// One row of the per-node usage table handed to the model.
#[derive(Debug, Clone)]
pub struct NodeRow {
    pub name: String,
    pub total_bytes: u64,
    pub used_bytes: u64,
    pub existing_allocated_bytes: u64,
    pub total_quota_bytes: u64,
}

impl NodeRow {
    fn usage_percent(&self) -> f64 {
        if self.total_bytes == 0 {
            0.0
        } else {
            self.used_bytes as f64 / self.total_bytes as f64 * 100.0
        }
    }
}

fn gib(bytes: u64) -> f64 {
    bytes as f64 / (1u64 << 30) as f64
}

/// Render a batch of rows as the markdown table the prompt expects.
fn build_table(rows: &[NodeRow]) -> String {
    let mut table = String::from("| node | totalGi | usedGi | usage% | existingAllocatedGi | totalQuotaGi |\n");
    table.push_str("|---|---|---|---|---|---|\n");
    for row in rows {
        table.push_str(&format!(
            "| {} | {:.1} | {:.1} | {:.1} | {:.1} | {:.1} |\n",
            row.name,
            gib(row.total_bytes),
            gib(row.used_bytes),
            row.usage_percent(),
            gib(row.existing_allocated_bytes),
            gib(row.total_quota_bytes),
        ));
    }
    table
}

/// Slice between the first `{` and the last `}` and decode as a
/// `node -> score` map. The model is asked for exactly this shape but
/// models like to wrap JSON in prose or code fences, hence the slicing.
pub fn parse_llm_output(text: &str) -> Result<HashMap<String, i64>> {
    let start = text.find('{').ok_or(Error::NoJsonObject)?;
    let end = text.rfind('}').ok_or(Error::NoJsonObject)?;
    if end < start {
        return Err(Error::NoJsonObject);
    }
    Ok(serde_json::from_str(&text[start..=end])?)
}

/// The model invocation boundary. `OpenAiClient` is the one real adapter;
/// tests supply a stub.
#[async_trait]
pub trait LanguageModelClient: Send + Sync {
    async fn complete(&self, system_prompt: &str, user_prompt: &str) -> Result<String>;
}

/// reqwest-backed adapter for OpenAI-compatible `/chat/completions` APIs.
pub struct OpenAiClient {
    http: reqwest::Client,
    api_url: String,
    api_key: String,
    model: String,
}

impl OpenAiClient {
    pub fn new(api_url: String, api_key: String, model: String) -> Self {
        Self { http: reqwest::Client::new(), api_url, api_key, model }
    }
}

#[async_trait]
impl LanguageModelClient for OpenAiClient {
    async fn complete(&self, system_prompt: &str, user_prompt: &str) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": system_prompt },
                { "role": "user", "content": user_prompt },
            ],
        });
        let response = self
            .http
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        let value: serde_json::Value = response.json().await?;
        Ok(value["choices"][0]["message"]["content"].as_str().unwrap_or_default().to_string())
    }
}

/// Supplies the current cluster snapshot the scorer needs. Implemented by
/// the scheduler extender's node cache so this crate stays decoupled from
/// scheduling internals.
pub trait ClusterSnapshotSource: Send + Sync {
    fn snapshot(&self) -> Vec<NodeRow>;
}

/// Leader-gated periodic scorer. Holds the most recent per-node scores
/// behind a lock the scheduler's Score handler reads from.
pub struct AiRiskScorer {
    model: Arc<dyn LanguageModelClient>,
    control: Arc<dyn ControlPlaneClient>,
    snapshots: Arc<dyn ClusterSnapshotSource>,
    scores: Arc<RwLock<HashMap<String, i64>>>,
    lease_namespace: String,
    lease_name: String,
    hostname: String,
    interval: Duration,
}

impl AiRiskScorer {
    pub fn new(
        model: Arc<dyn LanguageModelClient>,
        control: Arc<dyn ControlPlaneClient>,
        snapshots: Arc<dyn ClusterSnapshotSource>,
        lease_namespace: String,
        lease_name: String,
        hostname: String,
        interval: Duration,
    ) -> Self {
        Self {
            model,
            control,
            snapshots,
            scores: Arc::new(RwLock::new(HashMap::new())),
            lease_namespace,
            lease_name,
            hostname,
            interval,
        }
    }

    /// A handle the scheduler's Score path can read without holding a
    /// reference to the whole scorer.
    pub fn scores_handle(&self) -> Arc<RwLock<HashMap<String, i64>>> {
        self.scores.clone()
    }

    async fn is_leader(&self) -> bool {
        match self.control.get_lease(&self.lease_namespace, &self.lease_name).await {
            Ok(Some(lease)) => lease
                .holder_identity
                .map(|holder| holder.starts_with(&self.hostname))
                .unwrap_or(false),
            Ok(None) => false,
            Err(e) => {
                warn!("ai-risk-scorer: failed to read lease: {e}");
                false
            }
        }
    }

    pub async fn run(self, cancel: tokio_util::sync::CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("ai risk scorer shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    if self.is_leader().await {
                        self.tick().await;
                    } else {
                        debug!("ai risk scorer: not leader, skipping tick");
                    }
                }
            }
        }
    }

    async fn tick(&self) {
        let rows = self.snapshots.snapshot();
        if rows.is_empty() {
            return;
        }
        let mut merged = HashMap::new();
        for batch in rows.chunks(MAX_NODES_PER_PROMPT) {
            let table = build_table(batch);
            match self.model.complete(SYSTEM_PROMPT, &table).await {
                Ok(text) => match parse_llm_output(&text) {
                    Ok(scores) => merged.extend(scores),
                    Err(e) => warn!("ai-risk-scorer: failed to parse model output: {e}"),
                },
                Err(e) => warn!("ai-risk-scorer: model invocation failed: {e}"),
            }
        }
        if !merged.is_empty() {
            info!("ai-risk-scorer: updated scores for {} nodes", merged.len());
            *self.scores.write() = merged;
        }
    }
}
