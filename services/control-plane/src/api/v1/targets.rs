//! Target API endpoints.
//!
//! Called by syncers: registration, heartbeats, deregistration.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use kplane_api::wire::{Heartbeat, ListResponse, Registration};
use kplane_api::ExecutionTarget;
use kplane_id::ObjectUid;

use super::WorkspaceQuery;
use crate::api::error::ApiError;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", post(register).get(list_targets))
        .route("/{uid}", get(get_target).delete(deregister))
        .route("/{uid}/heartbeat", post(heartbeat))
}

/// POST /v1/targets
async fn register(
    State(state): State<AppState>,
    Json(req): Json<Registration>,
) -> Result<impl IntoResponse, ApiError> {
    let handle = state.registry().register(req).await?;
    Ok((StatusCode::CREATED, Json(handle)))
}

/// GET /v1/targets
async fn list_targets(
    State(state): State<AppState>,
    Query(query): Query<WorkspaceQuery>,
) -> Result<Json<ListResponse<ExecutionTarget>>, ApiError> {
    let items = state.registry().list(query.workspace.as_deref()).await?;
    Ok(Json(ListResponse { items }))
}

/// GET /v1/targets/{uid}
async fn get_target(
    State(state): State<AppState>,
    Path(uid): Path<ObjectUid>,
) -> Result<Json<ExecutionTarget>, ApiError> {
    Ok(Json(state.registry().get(&uid).await?))
}

/// POST /v1/targets/{uid}/heartbeat
async fn heartbeat(
    State(state): State<AppState>,
    Path(uid): Path<ObjectUid>,
    Json(req): Json<Heartbeat>,
) -> Result<Json<ExecutionTarget>, ApiError> {
    Ok(Json(state.registry().heartbeat(&uid, req).await?))
}

/// DELETE /v1/targets/{uid}
async fn deregister(
    State(state): State<AppState>,
    Path(uid): Path<ObjectUid>,
) -> Result<StatusCode, ApiError> {
    state.registry().deregister(&uid).await?;
    Ok(StatusCode::NO_CONTENT)
}
