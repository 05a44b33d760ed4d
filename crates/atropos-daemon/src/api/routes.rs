//! Read-only views over the journal, plus the correlation import.

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};

use atropos_core::correlation::{Correlator, CutReference};
use atropos_core::history::HistoryStats;

use super::{error_response, AppState};

#[derive(Debug, Deserialize)]
pub(crate) struct LimitQuery {
    limit: Option<usize>,
}

impl LimitQuery {
    pub(crate) fn or(&self, default: usize) -> usize {
        self.limit.unwrap_or(default)
    }
}

/// GET /api/v1/cuts/history
pub(crate) async fn list_cuts(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> Response {
    match state.engine.history().list_cuts(query.or(100)) {
        Ok(cuts) => (
            StatusCode::OK,
            Json(serde_json::json!({ "count": cuts.len(), "cuts": cuts })),
        )
            .into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

/// GET /api/v1/cuts/history/:node
pub(crate) async fn list_cuts_by_node(
    State(state): State<AppState>,
    Path(node): Path<String>,
    Query(query): Query<LimitQuery>,
) -> Response {
    match state.engine.history().list_cuts_by_node(&node, query.or(100)) {
        Ok(cuts) => (
            StatusCode::OK,
            Json(serde_json::json!({ "node": node, "count": cuts.len(), "cuts": cuts })),
        )
            .into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

/// GET /api/v1/cuts/:id
pub(crate) async fn get_cut(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.engine.history().load_cut(&id) {
        Ok(cut) => (StatusCode::OK, Json(cut)).into_response(),
        Err(_) => error_response(StatusCode::NOT_FOUND, "cut not found"),
    }
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    #[serde(flatten)]
    stats: HistoryStats,
    success_rate: f64,
}

/// GET /api/v1/stats
pub(crate) async fn get_stats(State(state): State<AppState>) -> Response {
    match state.engine.history().stats() {
        Ok(stats) => {
            let success_rate = if stats.total_cuts > 0 {
                stats.success_cuts as f64 / stats.total_cuts as f64 * 100.0
            } else {
                0.0
            };
            (
                StatusCode::OK,
                Json(StatsResponse {
                    stats,
                    success_rate,
                }),
            )
                .into_response()
        }
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

/// GET /api/v1/stats/:node
pub(crate) async fn get_node_stats(
    State(state): State<AppState>,
    Path(node): Path<String>,
) -> Response {
    match state.analyzer.node_trend(&node) {
        Ok(trend) => (StatusCode::OK, Json(trend)).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct TrendQuery {
    days: Option<i64>,
}

/// GET /api/v1/trends
pub(crate) async fn get_trends(
    State(state): State<AppState>,
    Query(query): Query<TrendQuery>,
) -> Response {
    match state.analyzer.global_trends(query.days.unwrap_or(30)) {
        Ok(trends) => (StatusCode::OK, Json(trends)).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

/// GET /api/v1/trends/:node
pub(crate) async fn get_node_trends(
    State(state): State<AppState>,
    Path(node): Path<String>,
) -> Response {
    match state.analyzer.node_trend(&node) {
        Ok(trend) => (StatusCode::OK, Json(trend)).into_response(),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    }
}

/// POST /api/v1/correlation/import
pub(crate) async fn import_report(State(state): State<AppState>, body: Bytes) -> Response {
    match state.reports.import(body.as_ref()) {
        Ok(report) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "message": "audit report imported",
                "audit_id": report.audit_id,
                "nodes": report.nodes,
                "findings_count": report.findings.len(),
            })),
        )
            .into_response(),
        Err(e) => error_response(
            StatusCode::BAD_REQUEST,
            &format!("failed to parse audit report: {e}"),
        ),
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct CorrelationQuery {
    hours: Option<i64>,
}

/// GET /api/v1/correlation/:node
pub(crate) async fn get_correlation(
    State(state): State<AppState>,
    Path(node): Path<String>,
    Query(query): Query<CorrelationQuery>,
) -> Response {
    let hours = query.hours.unwrap_or(24);

    let cuts = match state.engine.history().list_cuts_by_node(&node, 0) {
        Ok(cuts) => cuts,
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    };
    let cut_refs: Vec<CutReference> = cuts
        .into_iter()
        .map(|cut| CutReference {
            id: cut.id,
            timestamp: cut.timestamp,
            action: cut.action,
            success: cut.success,
        })
        .collect();

    let correlator = Correlator::new(&state.reports, cut_refs);
    let result = correlator.correlate(&node, Duration::hours(hours), Utc::now());
    let triggering_controls = correlator.triggering_controls(&node);

    (
        StatusCode::OK,
        Json(serde_json::json!({
            "node": node,
            "time_window_hours": hours,
            "effectiveness": result.effectiveness,
            "total_findings": result.findings.len(),
            "remediated": result.remediated.len(),
            "unresolved": result.unresolved.len(),
            "triggering_controls": triggering_controls,
            "remediations": result.remediated,
            "unresolved_findings": result.unresolved,
        })),
    )
        .into_response()
}
