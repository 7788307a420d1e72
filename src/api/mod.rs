//! HTTP API (C9): `POST /v1/update` to trigger a session, `GET /v1/metrics`
//! to scrape Prometheus text exposition. Both endpoints require an exact
//! `Authorization: Bearer <token>` match.

pub mod middleware;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{middleware as axum_middleware, Json, Router};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::metrics::Metrics;
use crate::scheduler::Scheduler;

#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<Scheduler>,
    pub metrics: Arc<Metrics>,
    pub token: Arc<String>,
    pub update_enabled: bool,
    pub metrics_enabled: bool,
}

#[derive(Debug, Deserialize, Default)]
pub struct UpdateRequest {
    #[serde(default)]
    images: Option<Vec<String>>,
}

pub fn router(state: AppState) -> Router {
    let mut router = Router::new();

    if state.update_enabled {
        router = router.route("/v1/update", post(update_handler));
    }
    if state.metrics_enabled {
        router = router.route("/v1/metrics", get(metrics_handler));
    }

    router
        .layer(axum_middleware::from_fn_with_state(state.clone(), middleware::require_bearer_token))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn update_handler(
    State(state): State<AppState>,
    body: Option<Json<UpdateRequest>>,
) -> StatusCode {
    let images = body.and_then(|Json(b)| b.images);
    match state.scheduler.trigger_ad_hoc(images).await {
        Some(_) => StatusCode::ACCEPTED,
        None => StatusCode::CONFLICT,
    }
}

async fn metrics_handler(State(state): State<AppState>) -> String {
    state.metrics.render()
}

/// Binds and serves the API, wired to shut down gracefully off `cancel`.
pub async fn serve(
    host: &str,
    port: u16,
    state: AppState,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

    info!("http api listening on {addr}");
    let app = router(state);
    let handle = axum_server::Handle::new();
    let shutdown_handle = handle.clone();

    tokio::spawn(async move {
        cancel.cancelled().await;
        shutdown_handle.graceful_shutdown(Some(std::time::Duration::from_secs(10)));
    });

    axum_server::bind(addr)
        .handle(handle)
        .serve(app.into_make_service())
        .await
}
