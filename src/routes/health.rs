//! Unauthenticated health-check endpoint.

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::AppState;

/// `GET /api/health` — liveness check.
///
/// Returns status, uptime, version, live slot and tunnel counts, and the
/// desktop's last known readiness. No authentication required.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let uptime = state.start_time.elapsed().as_secs();
    let slots = state.terminals.slot_count().await;
    let connections = state.csrf.len().await;
    let tunnels = state.tunnels.len().await;

    Json(json!({
        "status": "ok",
        "uptime_secs": uptime,
        "version": env!("CARGO_PKG_VERSION"),
        "slots": slots,
        "connections": connections,
        "tunnels": tunnels,
        "desktop_ready": state.desktop.is_ready(),
    }))
}
