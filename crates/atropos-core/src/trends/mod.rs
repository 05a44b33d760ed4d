//! Trend derivations over the cut journal.
//!
//! Pure aggregation: every function takes a fresh journal snapshot and
//! derives rollups from it. Nothing here mutates state.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::history::{CutRecord, HistoryError, HistoryManager};

/// Nodes with at least this many cuts and one failure are "problematic".
const PROBLEMATIC_MIN_CUTS: usize = 3;
/// The problematic list is capped to the busiest nodes.
const PROBLEMATIC_TOP_N: usize = 5;

/// Rollup for a single node.
#[derive(Debug, Clone, Serialize)]
pub struct NodeTrend {
    pub node: String,
    pub total_cuts: usize,
    /// Percentage of successful cuts; 100 for an empty history.
    pub success_rate: f64,
    pub avg_latency_ms: i64,
    pub by_action: HashMap<String, usize>,
    pub most_common_action: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_cut: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_cut: Option<DateTime<Utc>>,
}

/// Rollup for a single action across all nodes.
#[derive(Debug, Clone, Serialize)]
pub struct ActionStats {
    pub action: String,
    pub total_cuts: usize,
    pub success: usize,
    pub failed: usize,
    pub success_rate: f64,
    pub avg_latency_ms: i64,
    /// Nodes that used this action, in first-seen order.
    pub used_by_nodes: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_executed: Option<DateTime<Utc>>,
}

/// One point on the global timeline.
#[derive(Debug, Clone, Serialize)]
pub struct TimelineEntry {
    pub timestamp: DateTime<Utc>,
    pub node: String,
    pub action: String,
    pub success: bool,
    pub entropy: f64,
}

/// The full windowed trend report.
#[derive(Debug, Clone, Serialize)]
pub struct GlobalTrend {
    pub period_days: i64,
    pub total_cuts: usize,
    pub success_rate: f64,
    pub by_node: HashMap<String, usize>,
    pub by_action: HashMap<String, usize>,
    pub node_trends: Vec<NodeTrend>,
    pub action_stats: Vec<ActionStats>,
    /// Mean seconds between consecutive successful cuts on the same node.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mttr_seconds: Option<i64>,
    pub problematic_nodes: Vec<NodeTrend>,
    pub timeline: Vec<TimelineEntry>,
}

pub struct Analyzer {
    history: Arc<HistoryManager>,
}

impl Analyzer {
    pub fn new(history: Arc<HistoryManager>) -> Self {
        Self { history }
    }

    /// Rollup for one node over its whole history.
    pub fn node_trend(&self, node: &str) -> Result<NodeTrend, HistoryError> {
        let cuts = self.history.list_cuts_by_node(node, 0)?;

        if cuts.is_empty() {
            return Ok(NodeTrend {
                node: node.to_string(),
                total_cuts: 0,
                success_rate: 100.0,
                avg_latency_ms: 0,
                by_action: HashMap::new(),
                most_common_action: String::new(),
                last_cut: None,
                first_cut: None,
            });
        }

        let mut trend = NodeTrend {
            node: node.to_string(),
            total_cuts: cuts.len(),
            success_rate: 0.0,
            avg_latency_ms: 0,
            by_action: HashMap::new(),
            most_common_action: String::new(),
            last_cut: None,
            first_cut: None,
        };

        let mut total_latency: i64 = 0;
        let mut success_count = 0usize;
        let mut most_common_count = 0usize;

        for cut in &cuts {
            if trend.first_cut.is_none_or(|t| cut.timestamp < t) {
                trend.first_cut = Some(cut.timestamp);
            }
            if trend.last_cut.is_none_or(|t| cut.timestamp > t) {
                trend.last_cut = Some(cut.timestamp);
            }

            let count = trend.by_action.entry(cut.action.clone()).or_default();
            *count += 1;
            // Strictly-greater keeps the first action to reach a count ahead
            // of later ties.
            if *count > most_common_count {
                most_common_count = *count;
                trend.most_common_action = cut.action.clone();
            }

            total_latency += cut.latency_ms;
            if cut.success {
                success_count += 1;
            }
        }

        trend.success_rate = success_count as f64 / trend.total_cuts as f64 * 100.0;
        trend.avg_latency_ms = total_latency / trend.total_cuts as i64;

        Ok(trend)
    }

    /// Per-action rollups over the whole journal, busiest first.
    pub fn action_stats(&self) -> Result<Vec<ActionStats>, HistoryError> {
        Ok(action_stats_for(&self.history.list_cuts(0)?))
    }

    /// Windowed global report: cuts from the last `days` days.
    pub fn global_trends(&self, days: i64) -> Result<GlobalTrend, HistoryError> {
        let cutoff = Utc::now() - Duration::days(days);
        let recent: Vec<CutRecord> = self
            .history
            .list_cuts(0)?
            .into_iter()
            .filter(|c| c.timestamp > cutoff)
            .collect();

        let mut trend = GlobalTrend {
            period_days: days,
            total_cuts: recent.len(),
            success_rate: 0.0,
            by_node: HashMap::new(),
            by_action: HashMap::new(),
            node_trends: Vec::new(),
            action_stats: Vec::new(),
            mttr_seconds: None,
            problematic_nodes: Vec::new(),
            timeline: Vec::new(),
        };

        let mut total_success = 0usize;
        for cut in &recent {
            *trend.by_node.entry(cut.node.clone()).or_default() += 1;
            *trend.by_action.entry(cut.action.clone()).or_default() += 1;
            trend.timeline.push(TimelineEntry {
                timestamp: cut.timestamp,
                node: cut.node.clone(),
                action: cut.action.clone(),
                success: cut.success,
                entropy: cut.entropy,
            });
            if cut.success {
                total_success += 1;
            }
        }

        if trend.total_cuts > 0 {
            trend.success_rate = total_success as f64 / trend.total_cuts as f64 * 100.0;
        }

        trend.mttr_seconds = mean_time_to_remediation(&recent);
        trend.problematic_nodes = self.problematic_nodes(&recent)?;

        // Full-history action stats, restricted to actions seen in the window.
        trend.action_stats = self
            .action_stats()?
            .into_iter()
            .filter(|s| trend.by_action.contains_key(&s.action))
            .collect();

        for node in trend.by_node.keys() {
            if let Ok(node_trend) = self.node_trend(node) {
                trend.node_trends.push(node_trend);
            }
        }

        trend.timeline.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));

        Ok(trend)
    }

    /// Nodes with enough activity and at least one failure, busiest first.
    fn problematic_nodes(&self, cuts: &[CutRecord]) -> Result<Vec<NodeTrend>, HistoryError> {
        let mut totals: HashMap<&str, usize> = HashMap::new();
        let mut failures: HashMap<&str, usize> = HashMap::new();

        for cut in cuts {
            *totals.entry(&cut.node).or_default() += 1;
            if !cut.success {
                *failures.entry(&cut.node).or_default() += 1;
            }
        }

        let mut problematic = Vec::new();
        for (node, &total) in &totals {
            let failed = failures.get(node).copied().unwrap_or(0);
            if total >= PROBLEMATIC_MIN_CUTS && failed >= 1 {
                if let Ok(trend) = self.node_trend(node) {
                    problematic.push(trend);
                }
            }
        }

        problematic.sort_by(|a, b| b.total_cuts.cmp(&a.total_cuts));
        problematic.truncate(PROBLEMATIC_TOP_N);

        Ok(problematic)
    }
}

/// MTTR across a set of cuts: mean interval between consecutive successful
/// cuts on the same node. `None` below two successes or when no same-node
/// adjacent pair exists.
fn mean_time_to_remediation(cuts: &[CutRecord]) -> Option<i64> {
    let mut successful: Vec<&CutRecord> = cuts.iter().filter(|c| c.success).collect();
    if successful.len() < 2 {
        return None;
    }
    successful.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));

    let mut total_seconds: i64 = 0;
    let mut intervals = 0i64;
    for pair in successful.windows(2) {
        if pair[0].node == pair[1].node {
            total_seconds += (pair[1].timestamp - pair[0].timestamp).num_seconds();
            intervals += 1;
        }
    }

    if intervals == 0 {
        None
    } else {
        Some(total_seconds / intervals)
    }
}

fn action_stats_for(cuts: &[CutRecord]) -> Vec<ActionStats> {
    let mut actions: HashMap<String, ActionStats> = HashMap::new();

    for cut in cuts {
        let stats = actions
            .entry(cut.action.clone())
            .or_insert_with(|| ActionStats {
                action: cut.action.clone(),
                total_cuts: 0,
                success: 0,
                failed: 0,
                success_rate: 0.0,
                avg_latency_ms: 0,
                used_by_nodes: Vec::new(),
                last_executed: None,
            });

        stats.total_cuts += 1;
        if cut.success {
            stats.success += 1;
        } else {
            stats.failed += 1;
        }
        // Reuse avg_latency_ms as a running total; finalised below.
        stats.avg_latency_ms += cut.latency_ms;

        if stats.last_executed.is_none_or(|t| cut.timestamp > t) {
            stats.last_executed = Some(cut.timestamp);
        }
        if !stats.used_by_nodes.iter().any(|n| n == &cut.node) {
            stats.used_by_nodes.push(cut.node.clone());
        }
    }

    let mut result: Vec<ActionStats> = actions
        .into_values()
        .map(|mut stats| {
            stats.success_rate = stats.success as f64 / stats.total_cuts as f64 * 100.0;
            stats.avg_latency_ms /= stats.total_cuts as i64;
            stats
        })
        .collect();

    result.sort_by(|a, b| b.total_cuts.cmp(&a.total_cuts));
    result
}
