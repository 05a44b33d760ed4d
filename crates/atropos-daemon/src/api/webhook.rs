//! The signed cut webhook, the dry-run preview, and the health probe.

use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{info, warn};

use atropos_core::CutResult;

use super::{error_response, AppState};

/// Header carrying the alert signature, `sha256=<hex>` over the raw body.
pub const SIGNATURE_HEADER: &str = "X-Lachesis-Signature";

/// Upper envelope on the webhook response. The cut itself is bounded by the
/// engine's own deadline and keeps running past a 504.
const RESPONSE_CEILING: Duration = Duration::from_secs(35);

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum SignatureError {
    /// No signature header at all.
    Missing,
    /// Header present but not `sha256=<hex>`.
    Malformed,
    /// Well-formed signature that does not match the body.
    Mismatch,
}

/// Verify `sha256=<hex>` against HMAC-SHA256 of the raw body. An empty
/// configured secret disables verification.
pub(crate) fn verify_signature(
    secret: &[u8],
    body: &[u8],
    header: Option<&str>,
) -> Result<(), SignatureError> {
    if secret.is_empty() {
        return Ok(());
    }

    let header = header.ok_or(SignatureError::Missing)?;
    let hex_digest = header
        .strip_prefix("sha256=")
        .ok_or(SignatureError::Malformed)?;
    let expected = hex::decode(hex_digest).map_err(|_| SignatureError::Malformed)?;

    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return Err(SignatureError::Mismatch);
    };
    mac.update(body);
    mac.verify_slice(&expected)
        .map_err(|_| SignatureError::Mismatch)
}

#[derive(Debug, Deserialize)]
struct CutRequest {
    node: String,
    entropy: f64,
    #[serde(default)]
    #[allow(dead_code)]
    timestamp: String,
}

#[derive(Debug, Serialize)]
struct CutResponse {
    node: String,
    action: String,
    success: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    error: String,
    latency_ms: i64,
}

impl From<CutResult> for CutResponse {
    fn from(result: CutResult) -> Self {
        Self {
            node: result.target.clone(),
            action: result.action.clone(),
            success: result.success,
            error: result.error_text(),
            latency_ms: result.latency_ms,
        }
    }
}

/// POST /api/v1/cut
pub(crate) async fn handle_cut(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let header = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());

    match verify_signature(state.hmac_secret.as_bytes(), &body, header) {
        Ok(()) => {}
        Err(SignatureError::Missing) => {
            warn!(signature_valid = false, "webhook received");
            return error_response(StatusCode::UNAUTHORIZED, "missing signature");
        }
        Err(SignatureError::Malformed) => {
            warn!(signature_valid = false, "webhook received");
            return error_response(StatusCode::UNAUTHORIZED, "malformed signature");
        }
        Err(SignatureError::Mismatch) => {
            warn!(signature_valid = false, "webhook received");
            return error_response(StatusCode::FORBIDDEN, "invalid signature");
        }
    }

    let request: CutRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, &format!("invalid request: {e}")),
    };
    if request.node.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "node is required");
    }
    if !(0.0..=1.0).contains(&request.entropy) {
        return error_response(StatusCode::BAD_REQUEST, "entropy must be between 0 and 1");
    }

    info!(
        node = %request.node,
        entropy = request.entropy,
        signature_valid = true,
        "webhook received"
    );

    let result_rx = state
        .engine
        .execute_cut_async(request.node.clone(), request.entropy);

    match tokio::time::timeout(RESPONSE_CEILING, result_rx).await {
        Ok(Ok(result)) => {
            let status = if result.success {
                StatusCode::OK
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            };
            (status, Json(CutResponse::from(result))).into_response()
        }
        Ok(Err(_)) => error_response(StatusCode::INTERNAL_SERVER_ERROR, "cut worker dropped"),
        Err(_) => (
            StatusCode::GATEWAY_TIMEOUT,
            Json(serde_json::json!({
                "error": "cut operation timed out",
                "node": request.node,
            })),
        )
            .into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct DryRunRequest {
    node: String,
    entropy: f64,
}

#[derive(Debug, Serialize)]
struct DryRunResponse {
    node: String,
    entropy: f64,
    action: String,
    would_execute: bool,
    threshold: f64,
    critical: bool,
}

/// POST /api/v1/cut/dryrun -- selector preview, no side effects.
pub(crate) async fn handle_dry_run(State(state): State<AppState>, body: Bytes) -> Response {
    let request: DryRunRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, &format!("invalid request: {e}")),
    };
    if !(0.0..=1.0).contains(&request.entropy) {
        return error_response(StatusCode::BAD_REQUEST, "entropy must be between 0 and 1");
    }

    let Some(node_policy) = state.engine.policy().get_node(&request.node) else {
        return error_response(StatusCode::NOT_FOUND, "node not found");
    };

    let response = match node_policy.select_strategy(request.entropy) {
        Some(strategy) => DryRunResponse {
            node: request.node,
            entropy: request.entropy,
            action: strategy.action.clone(),
            would_execute: true,
            threshold: strategy.threshold,
            critical: strategy.critical,
        },
        None => DryRunResponse {
            node: request.node,
            entropy: request.entropy,
            action: "none".to_string(),
            would_execute: false,
            threshold: 0.0,
            critical: false,
        },
    };

    (StatusCode::OK, Json(response)).into_response()
}

/// GET /api/v1/health
pub(crate) async fn handle_health() -> Response {
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": "operational",
            "service": "atropos",
            "ts": Utc::now().to_rfc3339(),
        })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &[u8], body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn valid_signature_accepted() {
        let secret = b"s3cret";
        let body = br#"{"node":"athena","entropy":0.9}"#;
        let header = sign(secret, body);
        assert_eq!(verify_signature(secret, body, Some(&header)), Ok(()));
    }

    #[test]
    fn missing_signature_rejected() {
        assert_eq!(
            verify_signature(b"s3cret", b"{}", None),
            Err(SignatureError::Missing)
        );
    }

    #[test]
    fn malformed_signature_rejected() {
        assert_eq!(
            verify_signature(b"s3cret", b"{}", Some("md5=abcd")),
            Err(SignatureError::Malformed)
        );
        assert_eq!(
            verify_signature(b"s3cret", b"{}", Some("sha256=zz-not-hex")),
            Err(SignatureError::Malformed)
        );
    }

    #[test]
    fn wrong_signature_rejected() {
        let body = br#"{"node":"athena","entropy":0.9}"#;
        let header = sign(b"other-secret", body);
        assert_eq!(
            verify_signature(b"s3cret", body, Some(&header)),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn tampered_body_rejected() {
        let secret = b"s3cret";
        let header = sign(secret, br#"{"node":"athena","entropy":0.9}"#);
        assert_eq!(
            verify_signature(secret, br#"{"node":"athena","entropy":1.0}"#, Some(&header)),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn empty_secret_disables_verification() {
        assert_eq!(verify_signature(b"", b"{}", None), Ok(()));
        assert_eq!(verify_signature(b"", b"{}", Some("garbage")), Ok(()));
    }
}
