//! Pure Filter/Score math, kept free of HTTP/Kubernetes types so it can be
//! unit-tested directly against the scenarios the quota system is built
//! to enforce.

use crate::config::{ExtenderConfig, MAX_NODE_SCORE, PHYSICAL_RED_LINE};
use domain::NodeStats;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterDecision {
    Admit,
    Reject(String),
}

/// Reject a node when it hasn't opted in, has no cached stats, would blow
/// the virtual oversubscription budget, or is already above the physical
/// red line.
pub fn filter(
    config: &ExtenderConfig,
    stats: Option<NodeStats>,
    existing_allocated: u64,
    pod_request: u64,
) -> FilterDecision {
    let Some(stats) = stats else {
        return FilterDecision::Reject("node has not opted into quota management".to_string());
    };
    if stats.total == 0 {
        return FilterDecision::Reject("node advertises zero physical capacity".to_string());
    }
    let over_commit = (stats.total as f64 * config.oversubscription_ratio) as u64;
    if existing_allocated.saturating_add(pod_request) >= over_commit {
        return FilterDecision::Reject(format!(
            "oversubscription budget exhausted: {existing_allocated} + {pod_request} >= {over_commit}"
        ));
    }
    if stats.used as f64 > PHYSICAL_RED_LINE * stats.total as f64 {
        return FilterDecision::Reject(format!(
            "physical circuit breaker: {} used of {} total exceeds {:.0}%",
            stats.used, stats.total, PHYSICAL_RED_LINE * 100.0
        ));
    }
    FilterDecision::Admit
}

/// `min(logicalScore, physicalScore)`, each normalized to
/// `[0, MAX_NODE_SCORE]`. Zero whenever either plane has no headroom left.
pub fn score(config: &ExtenderConfig, stats: NodeStats, existing_allocated: u64, pod_request: u64) -> i64 {
    let over_commit = stats.total as f64 * config.oversubscription_ratio;
    let logical_free = over_commit - (existing_allocated + pod_request) as f64;
    let physical_free = stats.total as f64 - stats.used as f64;

    let logical_score = if logical_free <= 0.0 || over_commit <= 0.0 {
        0
    } else {
        (logical_free / over_commit * MAX_NODE_SCORE as f64).floor() as i64
    };
    let physical_score = if physical_free <= 0.0 || stats.total == 0 {
        0
    } else {
        (physical_free / stats.total as f64 * MAX_NODE_SCORE as f64).floor() as i64
    };
    logical_score.min(physical_score)
}

/// Blend the computed score with an optional AI risk score. The AI score
/// is a *risk* (higher is worse), so it is inverted before blending;
/// `weight_ratio` is a 0-100 percentage of trust placed in the AI signal.
pub fn blend(computed_score: i64, ai_risk: Option<i64>, weight_ratio: u8) -> i64 {
    match ai_risk {
        None => computed_score,
        Some(risk) => {
            let w = weight_ratio as f64 / 100.0;
            let ai_safety_score = (MAX_NODE_SCORE as f64 - risk as f64).clamp(0.0, MAX_NODE_SCORE as f64);
            ((1.0 - w) * computed_score as f64 + w * ai_safety_score).round() as i64
        }
    }
}
