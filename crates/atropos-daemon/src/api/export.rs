//! Journal exports: CSV and JSON downloads, and a standalone HTML report.

use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{SecondsFormat, Utc};

use atropos_core::history::{CutRecord, HistoryStats};

use super::routes::LimitQuery;
use super::{error_response, AppState};

const EXPORT_DEFAULT_LIMIT: usize = 1000;

/// GET /api/v1/export/history.csv
pub(crate) async fn history_csv(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> Response {
    let cuts = match state.engine.history().list_cuts(query.or(EXPORT_DEFAULT_LIMIT)) {
        Ok(cuts) => cuts,
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    };

    let mut csv = String::from("ID,Node,Entropy,Action,Success,Error,LatencyMs,Timestamp\n");
    for cut in &cuts {
        csv.push_str(&format!(
            "{},{},{:.4},{},{},{},{},{}\n",
            cut.id,
            cut.node,
            cut.entropy,
            cut.action,
            cut.success,
            csv_escape(&cut.error),
            cut.latency_ms,
            cut.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
        ));
    }

    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/csv"),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=cut_history.csv",
            ),
        ],
        csv,
    )
        .into_response()
}

/// Quote a CSV field when it carries separators or quotes.
fn csv_escape(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// GET /api/v1/export/history.json
pub(crate) async fn history_json(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> Response {
    let cuts = match state.engine.history().list_cuts(query.or(EXPORT_DEFAULT_LIMIT)) {
        Ok(cuts) => cuts,
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    };

    (
        StatusCode::OK,
        [(
            header::CONTENT_DISPOSITION,
            "attachment; filename=cut_history.json",
        )],
        Json(serde_json::json!({
            "exported_at": Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            "total_cuts": cuts.len(),
            "cuts": cuts,
        })),
    )
        .into_response()
}

/// GET /api/v1/export/report.html
pub(crate) async fn report_html(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> Response {
    let history = state.engine.history();
    let cuts = match history.list_cuts(query.or(EXPORT_DEFAULT_LIMIT)) {
        Ok(cuts) => cuts,
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    };
    let stats = match history.stats() {
        Ok(stats) => stats,
        Err(e) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
    };

    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/html"),
            (
                header::CONTENT_DISPOSITION,
                "attachment; filename=remediation_report.html",
            ),
        ],
        render_report(&cuts, &stats),
    )
        .into_response()
}

fn render_report(cuts: &[CutRecord], stats: &HistoryStats) -> String {
    let success_rate = if stats.total_cuts > 0 {
        stats.success_cuts as f64 / stats.total_cuts as f64 * 100.0
    } else {
        0.0
    };

    let mut html = format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <title>Atropos Remediation Report</title>
    <style>
        * {{ margin: 0; padding: 0; box-sizing: border-box; }}
        body {{ font-family: -apple-system, BlinkMacSystemFont, 'Segoe UI', Roboto, sans-serif; background: #f0f0f5; color: #1a1a2e; padding: 2rem; }}
        .container {{ max-width: 1200px; margin: 0 auto; }}
        header {{ background: linear-gradient(135deg, #667eea 0%, #764ba2 100%); color: white; padding: 2rem; border-radius: 8px; margin-bottom: 2rem; }}
        h1 {{ margin-bottom: 0.5rem; }}
        .meta {{ opacity: 0.9; font-size: 0.9rem; }}
        .section {{ background: white; padding: 1.5rem; border-radius: 8px; margin-bottom: 1.5rem; box-shadow: 0 2px 4px rgba(0,0,0,0.1); }}
        h2 {{ color: #1a1a2e; margin-bottom: 1rem; border-bottom: 2px solid #667eea; padding-bottom: 0.5rem; }}
        .stats-grid {{ display: grid; grid-template-columns: repeat(auto-fit, minmax(200px, 1fr)); gap: 1rem; margin-bottom: 1.5rem; }}
        .stat-card {{ background: #f8f9fa; padding: 1rem; border-radius: 6px; text-align: center; }}
        .stat-value {{ font-size: 2rem; font-weight: 700; color: #667eea; }}
        .stat-label {{ color: #6c757d; font-size: 0.85rem; text-transform: uppercase; }}
        table {{ width: 100%; border-collapse: collapse; margin-top: 1rem; }}
        th, td {{ padding: 0.75rem; text-align: left; border-bottom: 1px solid #dee2e6; }}
        th {{ background: #e9ecef; font-weight: 600; }}
        .success {{ color: #28a745; }}
        .failure {{ color: #dc3545; }}
        .badge {{ padding: 0.25rem 0.5rem; border-radius: 4px; font-size: 0.85rem; }}
        .badge.success {{ background: #d4edda; color: #155724; }}
        .badge.failure {{ background: #f8d7da; color: #721c24; }}
    </style>
</head>
<body>
    <div class="container">
        <header>
            <h1>Atropos Remediation Report</h1>
            <div class="meta">Generated on {generated}</div>
        </header>

        <div class="section">
            <h2>Summary</h2>
            <div class="stats-grid">
                <div class="stat-card">
                    <div class="stat-value">{total}</div>
                    <div class="stat-label">Total Cuts</div>
                </div>
                <div class="stat-card">
                    <div class="stat-value success">{success}</div>
                    <div class="stat-label">Successful</div>
                </div>
                <div class="stat-card">
                    <div class="stat-value failure">{failed}</div>
                    <div class="stat-label">Failed</div>
                </div>
                <div class="stat-card">
                    <div class="stat-value">{rate:.1}%</div>
                    <div class="stat-label">Success Rate</div>
                </div>
            </div>
        </div>

        <div class="section">
            <h2>Cut History</h2>
            <table>
                <thead>
                    <tr>
                        <th>Timestamp</th>
                        <th>Node</th>
                        <th>Action</th>
                        <th>Entropy</th>
                        <th>Status</th>
                        <th>Latency</th>
                    </tr>
                </thead>
                <tbody>
"#,
        generated = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        total = stats.total_cuts,
        success = stats.success_cuts,
        failed = stats.failed_cuts,
        rate = success_rate,
    );

    for cut in cuts {
        let badge = if cut.success {
            r#"<span class="badge success">Success</span>"#
        } else {
            r#"<span class="badge failure">Failed</span>"#
        };
        html.push_str(&format!(
            "                    <tr>\n                        <td>{}</td>\n                        <td>{}</td>\n                        <td>{}</td>\n                        <td>{:.4}</td>\n                        <td>{}</td>\n                        <td>{}ms</td>\n                    </tr>\n",
            cut.timestamp.format("%Y-%m-%d %H:%M:%S"),
            html_escape(&cut.node),
            html_escape(&cut.action),
            cut.entropy,
            badge,
            cut.latency_ms,
        ));
    }

    html.push_str(
        r#"                </tbody>
            </table>
        </div>

        <div class="section">
            <h2>By Node</h2>
            <table>
                <thead>
                    <tr>
                        <th>Node</th>
                        <th>Total Cuts</th>
                        <th>Success</th>
                        <th>Failed</th>
                    </tr>
                </thead>
                <tbody>
"#,
    );

    for node_stats in stats.nodes.values() {
        html.push_str(&format!(
            "                    <tr>\n                        <td>{}</td>\n                        <td>{}</td>\n                        <td class=\"success\">{}</td>\n                        <td class=\"failure\">{}</td>\n                    </tr>\n",
            html_escape(&node_stats.node),
            node_stats.total_cuts,
            node_stats.success,
            node_stats.failed,
        ));
    }

    html.push_str(
        r#"                </tbody>
            </table>
        </div>

        <div class="section">
            <h2>By Action</h2>
            <table>
                <thead>
                    <tr>
                        <th>Action</th>
                        <th>Count</th>
                    </tr>
                </thead>
                <tbody>
"#,
    );

    for (action, count) in &stats.by_action {
        html.push_str(&format!(
            "                    <tr>\n                        <td>{}</td>\n                        <td>{}</td>\n                    </tr>\n",
            html_escape(action),
            count,
        ));
    }

    html.push_str(
        r#"                </tbody>
            </table>
        </div>
    </div>
</body>
</html>"#,
    );

    html
}

fn html_escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
