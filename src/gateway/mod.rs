//! HTTP front door: webhook intake, health, metrics and session inspection.

pub mod api;

use anyhow::{Context, Result};
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::{limit::RequestBodyLimitLayer, timeout::TimeoutLayer};

use crate::config::GatewayConfig;
use crate::sessions::SessionOrchestrator;

/// Shared state for every handler.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<SessionOrchestrator>,
    /// HMAC key for `X-Turnstile-Signature`; `None` accepts unsigned webhooks.
    pub webhook_secret: Option<Arc<str>>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(orchestrator: Arc<SessionOrchestrator>, config: &GatewayConfig) -> Self {
        Self {
            orchestrator,
            webhook_secret: config
                .webhook_secret
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(Arc::from),
            started_at: Instant::now(),
        }
    }
}

pub fn router(state: AppState, config: &GatewayConfig) -> Router {
    Router::new()
        .route("/webhook", post(api::handle_webhook))
        .route("/health", get(api::handle_health))
        .route("/metrics", get(api::handle_metrics))
        .route(
            "/api/sessions/{tenant}/{contact}",
            get(api::handle_session_summary),
        )
        .layer(RequestBodyLimitLayer::new(config.max_body_bytes))
        .layer(TimeoutLayer::new(Duration::from_secs(
            config.request_timeout_secs,
        )))
        .with_state(state)
}

/// Serve until Ctrl-C.
pub async fn run_gateway(config: &GatewayConfig, orchestrator: Arc<SessionOrchestrator>) -> Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind gateway to {addr}"))?;
    let local = listener.local_addr()?;

    if config.webhook_secret.is_none() {
        tracing::warn!("gateway.webhook_secret is not set; unsigned webhooks are accepted");
    }
    tracing::info!(addr = %local, engine = orchestrator.engine_name(), "gateway listening");

    let app = router(AppState::new(orchestrator, config), config);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await
        .context("gateway server error")
}
