//! Read-only admin surface: liveness and a registry snapshot.

use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;
use serde_json::json;

use crate::registry::{GpuSample, ServerState};
use crate::state::AppState;

/// `GET /health` — liveness only, always 200. Does not reflect backend
/// health; that's what `/servers` is for.
pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "healthy" }))
}

#[derive(Serialize)]
struct ServerView {
    #[serde(flatten)]
    state: ServerState,
    score: u64,
    least_loaded_gpu: Option<GpuSample>,
    available_gpu_capacity_gb: f64,
}

/// `GET /servers` — every registry entry with its full state, its current
/// selection score, and the two supplemental computed views (§3A):
/// the least-loaded GPU and the aggregate free GPU capacity.
pub async fn servers(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let views: Vec<ServerView> = state
        .registry
        .snapshot_all()
        .into_iter()
        .map(|s| {
            let score = s.score();
            let least_loaded_gpu = s.least_loaded_gpu().cloned();
            let available_gpu_capacity_gb = s.available_gpu_capacity_gb();
            ServerView {
                state: s,
                score,
                least_loaded_gpu,
                available_gpu_capacity_gb,
            }
        })
        .collect();

    Json(json!({ "servers": views }))
}
