//! Route handlers.

use super::AppState;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Json},
};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::context::SessionKey;
use crate::sessions::{HandleOutcome, InboundMessage, FALLBACK_REPLY};

pub const SIGNATURE_HEADER: &str = "x-turnstile-signature";

/// Hex HMAC-SHA256 of `body`, optionally prefixed with `sha256=`.
fn verify_signature(secret: &str, signature_header: Option<&str>, body: &[u8]) -> bool {
    let signature = signature_header.unwrap_or("").trim();
    let signature = signature
        .strip_prefix("sha256=")
        .unwrap_or(signature)
        .trim();
    if signature.is_empty() {
        return false;
    }
    let Ok(signature_bytes) = hex::decode(signature) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&signature_bytes).is_ok()
}

fn error(status: StatusCode, message: impl Into<String>) -> axum::response::Response {
    (status, Json(serde_json::json!({ "error": message.into() }))).into_response()
}

/// POST /webhook - run (or queue) one inbound message
pub async fn handle_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    if let Some(secret) = state.webhook_secret.as_deref() {
        let signature = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok());
        if !verify_signature(secret, signature, &body) {
            tracing::warn!("webhook rejected: bad signature");
            return error(StatusCode::UNAUTHORIZED, "invalid webhook signature");
        }
    }

    let message: InboundMessage = match serde_json::from_slice(&body) {
        Ok(m) => m,
        Err(e) => return error(StatusCode::BAD_REQUEST, format!("invalid payload: {e}")),
    };
    if let Err(e) = SessionKey::parse(message.tenant_id.as_str(), message.contact_id.as_str()) {
        return error(StatusCode::BAD_REQUEST, e.to_string());
    }

    // The cycle runs to completion even if the caller disconnects.
    let orchestrator = state.orchestrator.clone();
    let cycle = tokio::spawn(async move { orchestrator.handle_message(message).await });
    match cycle.await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(e) => {
            tracing::error!("session task failed: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(HandleOutcome::replied(FALLBACK_REPLY)),
            )
                .into_response()
        }
    }
}

/// GET /health
pub async fn handle_health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "engine": state.orchestrator.engine_name(),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
    }))
}

/// GET /metrics - Prometheus text exposition
pub async fn handle_metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.orchestrator.metrics().render(),
    )
}

/// GET /api/sessions/{tenant}/{contact} - stored context, lock and queue
pub async fn handle_session_summary(
    State(state): State<AppState>,
    Path((tenant, contact)): Path<(String, String)>,
) -> impl IntoResponse {
    let key = match SessionKey::parse(tenant, contact) {
        Ok(key) => key,
        Err(e) => return error(StatusCode::BAD_REQUEST, e.to_string()),
    };
    match state.orchestrator.contexts().summary(&key).await {
        Ok(summary) => Json(summary).into_response(),
        Err(e) => error(StatusCode::SERVICE_UNAVAILABLE, format!("store unavailable: {e}")),
    }
}
