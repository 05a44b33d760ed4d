//! HTTP API assembly.
//!
//! All paths live under `/api/v1`. The cut webhook is the only signed
//! endpoint; everything else is read-only (plus the correlation import).

use std::sync::Arc;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};

use atropos_core::correlation::ReportStore;
use atropos_core::trends::Analyzer;
use atropos_core::Executor;

mod export;
mod routes;
mod webhook;

pub use webhook::SIGNATURE_HEADER;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Executor>,
    pub analyzer: Arc<Analyzer>,
    pub reports: Arc<ReportStore>,
    /// Empty disables signature verification (test-only deployments).
    pub hmac_secret: Arc<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/cut", post(webhook::handle_cut))
        .route("/api/v1/cut/dryrun", post(webhook::handle_dry_run))
        .route("/api/v1/health", get(webhook::handle_health))
        .route("/api/v1/cuts/history", get(routes::list_cuts))
        .route("/api/v1/cuts/history/:node", get(routes::list_cuts_by_node))
        .route("/api/v1/cuts/:id", get(routes::get_cut))
        .route("/api/v1/stats", get(routes::get_stats))
        .route("/api/v1/stats/:node", get(routes::get_node_stats))
        .route("/api/v1/trends", get(routes::get_trends))
        .route("/api/v1/trends/:node", get(routes::get_node_trends))
        .route("/api/v1/export/history.csv", get(export::history_csv))
        .route("/api/v1/export/history.json", get(export::history_json))
        .route("/api/v1/export/report.html", get(export::report_html))
        .route("/api/v1/correlation/import", post(routes::import_report))
        .route("/api/v1/correlation/:node", get(routes::get_correlation))
        .with_state(state)
}

/// Uniform `{"error": ...}` body for every failure path.
pub(crate) fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}
