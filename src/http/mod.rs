use axum::Json;
use axum::Router;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::app::AppContext;
use crate::postmaster::PhonySnapshot;
use crate::state::MonitorSnapshot;

pub fn create_router(ctx: AppContext) -> Router {
    let api = Router::new()
        .route("/monitors", get(get_monitors))
        .route("/monitors/:name", get(get_monitor))
        .route("/postmaster", get(get_postmaster))
        .route("/postmaster/recover", post(post_recover));

    Router::new()
        .route("/healthz", get(get_healthz))
        .route("/metrics", get(get_metrics))
        .nest("/api/v1", api)
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}

async fn get_healthz() -> StatusCode {
    StatusCode::OK
}

async fn get_metrics(State(ctx): State<AppContext>) -> Response {
    match ctx.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(err) => {
            warn!(error = ?err, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    }
}

async fn get_monitors(State(ctx): State<AppContext>) -> Json<Vec<MonitorSnapshot>> {
    let mut snapshots = Vec::with_capacity(ctx.monitors.len());
    for state in ctx.monitors.iter() {
        snapshots.push(state.snapshot().await);
    }
    Json(snapshots)
}

async fn get_monitor(
    State(ctx): State<AppContext>,
    Path(name): Path<String>,
) -> Result<Json<MonitorSnapshot>, StatusCode> {
    let state = ctx.monitor(&name).ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(state.snapshot().await))
}

async fn get_postmaster(State(ctx): State<AppContext>) -> Result<Json<PhonySnapshot>, StatusCode> {
    let handle = ctx.phony.as_ref().ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(handle.snapshot().await))
}

/// Orchestration acknowledges a phony postmaster after acting on it.
async fn post_recover(State(ctx): State<AppContext>) -> Result<Json<PhonySnapshot>, StatusCode> {
    let handle = ctx.phony.as_ref().ok_or(StatusCode::NOT_FOUND)?;
    let snapshot = handle.recover().await;
    ctx.metrics.set_postmaster_metrics(&snapshot);
    Ok(Json(snapshot))
}
