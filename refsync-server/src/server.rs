//! Axum server setup and router configuration.

use crate::shutdown::shutdown_signal;
use crate::state::AppState;
use axum::{Json, Router, extract::State, response::IntoResponse, routing::get};
use refsync_core::processors::{DispatcherStats, StatusEntry};
use refsync_core::subscriber::SubscriptionStats;
use refsync_sdk::objects::StatusReport;
use serde::Serialize;
use std::net::SocketAddr;
use tokio::net::TcpListener;

/// Build the main application router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/status", get(status))
        .route("/status/dispatcher", get(dispatcher_status))
        .with_state(state)
}

/// Health check response.
#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    subscribed: bool,
}

/// Returns OK while the process runs; `subscribed` tells whether the
/// receive loop currently holds a subscription.
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        subscribed: !state.subscriber.active_channels().is_empty(),
    })
}

async fn status(State(state): State<AppState>) -> Json<StatusReport> {
    Json(state.subscriber.status().await)
}

#[derive(Serialize)]
struct DispatcherResponse {
    subscription: SubscriptionStats,
    dispatcher: DispatcherStats,
    status_history: Vec<StatusEntry>,
}

async fn dispatcher_status(State(state): State<AppState>) -> Json<DispatcherResponse> {
    Json(DispatcherResponse {
        subscription: state.subscriber.stats(),
        dispatcher: state.dispatcher.stats(),
        status_history: state.dispatcher.status_history(),
    })
}

/// Run the server with graceful shutdown support.
pub async fn run_server(router: Router, addr: SocketAddr) -> Result<(), std::io::Error> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Status server listening on {}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
}
