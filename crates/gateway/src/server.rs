//! HTTP surface: the carrier media WebSocket and a health probe.

use axum::extract::{State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use serde_json::json;
use tower_http::trace::TraceLayer;

use vl_media::session as media_session;

use crate::runtime::session::run_call;
use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/media", get(media_ws))
        .route("/healthz", get(healthz))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// GET /healthz — liveness plus capacity headroom.
async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    let active = state.active_call_count();
    let cap = state.config.limits.max_concurrent_calls;
    axum::Json(json!({
        "status": "ok",
        "active_calls": active,
        "max_concurrent_calls": cap,
    }))
}

/// GET /media — upgrade to the carrier media stream.
///
/// Admission happens before the upgrade: over capacity, the carrier gets
/// a 503 and fails the call over to its own fallback route.
async fn media_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let Some(permit) = state.try_admit() else {
        tracing::warn!(
            active = state.active_call_count(),
            "refusing call: at capacity"
        );
        return (StatusCode::SERVICE_UNAVAILABLE, "at capacity").into_response();
    };

    ws.on_upgrade(move |socket| async move {
        let _permit = permit; // held for the lifetime of the call
        let cfg = state.config.media.clone();
        match media_session::accept(socket, &cfg).await {
            Ok((meta, media_rx, media_out)) => {
                run_call(state, meta, media_rx, media_out).await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "media handshake failed");
            }
        }
    })
    .into_response()
}

pub async fn serve(state: AppState) -> anyhow::Result<()> {
    let addr = state.config.media.listen_addr.clone();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "voiceline listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }
    tracing::info!("shutdown requested, draining calls");
}
