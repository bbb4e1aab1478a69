//! Axum status surface: read-only JSON view of per-monitor run counters.

use std::sync::Arc;

use alw_monitor::{RunState, RunStats};
use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tracing::info;

pub const CRATE_NAME: &str = "alw-web";

/// One monitor's contribution to the status page.
pub struct MonitorStatusSource {
    pub instance: String,
    pub state: Arc<RunState>,
}

#[derive(Clone)]
pub struct AppState {
    monitors: Arc<Vec<MonitorStatusSource>>,
}

impl AppState {
    pub fn new(monitors: Vec<MonitorStatusSource>) -> Self {
        Self {
            monitors: Arc::new(monitors),
        }
    }
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    service: &'static str,
    monitors: Vec<MonitorStatusRow>,
}

#[derive(Debug, Serialize)]
struct MonitorStatusRow {
    instance: String,
    #[serde(flatten)]
    stats: RunStats,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/status", get(status_handler))
        .with_state(state)
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "status server listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn healthz_handler() -> &'static str {
    "ok"
}

async fn status_handler(State(state): State<AppState>) -> Json<StatusResponse> {
    let monitors = state
        .monitors
        .iter()
        .map(|source| MonitorStatusRow {
            instance: source.instance.clone(),
            stats: source.state.stats(),
        })
        .collect();
    Json(StatusResponse {
        service: "alw",
        monitors,
    })
}
