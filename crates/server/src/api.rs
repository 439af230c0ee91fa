use axum::extract::{Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use library::scanner::ScanStatus;
use serde::Deserialize;

use crate::scan::{try_hard_reset, try_start_scan};
use crate::state::{AppState, HealthResponse};

/// The scan trigger surface. Everything else (browse, streaming, auth)
/// lives behind other routers and is out of scope here.
pub fn api_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/scan", post(start_scan))
        .route("/scan/status", get(scan_status))
        .route("/scan/reset", post(hard_reset))
        .with_state(state)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

#[derive(Deserialize)]
struct ScanQuery {
    #[serde(default)]
    force: bool,
}

/// Idempotent while a scan runs: the second trigger observes the live
/// status and starts nothing.
async fn start_scan(
    State(state): State<AppState>,
    Query(query): Query<ScanQuery>,
) -> Json<ScanStatus> {
    Json(try_start_scan(&state, query.force))
}

async fn scan_status(State(state): State<AppState>) -> Json<ScanStatus> {
    Json(state.progress.snapshot())
}

async fn hard_reset(State(state): State<AppState>) -> Json<ScanStatus> {
    Json(try_hard_reset(&state))
}
