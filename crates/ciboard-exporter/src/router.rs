//! Scrape endpoint router using Axum

use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use ciboard_core::metrics::{exposition, SnapshotHandle};
use tower_http::cors::{Any, CorsLayer};

/// Create the scrape router
pub fn create_router(snapshots: SnapshotHandle) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .layer(cors)
        .with_state(snapshots)
}

async fn metrics_handler(State(snapshots): State<SnapshotHandle>) -> impl IntoResponse {
    let snapshot = snapshots.current();
    (
        [(header::CONTENT_TYPE, exposition::CONTENT_TYPE)],
        exposition::render(&snapshot),
    )
}

async fn healthz_handler(State(snapshots): State<SnapshotHandle>) -> Json<serde_json::Value> {
    let snapshot = snapshots.current();
    Json(serde_json::json!({
        "status": "ok",
        "cycle": snapshot.cycle,
        "shards": snapshot.shard_count,
        "mergedAt": snapshot.merged_at.to_rfc3339(),
    }))
}
