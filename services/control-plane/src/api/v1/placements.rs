//! Placement API endpoints.
//!
//! One placement per workspace, addressed by the workspace name.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use kplane_api::wire::BindRequest;
use kplane_api::Placement;

use crate::api::error::ApiError;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", post(bind))
        .route("/{workspace}", get(get_placement).delete(unbind))
}

/// POST /v1/placements
///
/// Binding a workspace that already has a placement replaces it.
async fn bind(
    State(state): State<AppState>,
    Json(req): Json<BindRequest>,
) -> Result<Json<Placement>, ApiError> {
    let placement = state
        .placement()
        .bind(&req.workspace, &req.location_workspace, &req.location_name)
        .await?;
    Ok(Json(placement))
}

/// GET /v1/placements/{workspace}
async fn get_placement(
    State(state): State<AppState>,
    Path(workspace): Path<String>,
) -> Result<Json<Placement>, ApiError> {
    state
        .placement()
        .get(&workspace)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found("placement_not_found", format!("{workspace} has no placement")))
}

/// DELETE /v1/placements/{workspace}
async fn unbind(
    State(state): State<AppState>,
    Path(workspace): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.placement().unbind(&workspace).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use axum::http::Method;

    use super::*;
    use crate::api::create_router;
    use crate::api::v1::testing::{call, decode};

    #[tokio::test]
    async fn test_bind_get_unbind() {
        let router = create_router(AppState::in_memory());
        let req = BindRequest {
            workspace: "root:org:app".into(),
            location_workspace: "root:org".into(),
            location_name: "eu".into(),
        };

        let (status, body) = call(&router, Method::POST, "/v1/placements", Some(&req)).await;
        assert_eq!(status, StatusCode::OK);
        let placement: Placement = decode(body);
        assert_eq!(placement.spec.location_name, "eu");

        let (status, _) =
            call::<()>(&router, Method::GET, "/v1/placements/root:org:app", None).await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) =
            call::<()>(&router, Method::DELETE, "/v1/placements/root:org:app", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, _) =
            call::<()>(&router, Method::GET, "/v1/placements/root:org:app", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_bind_rejects_bad_location_name() {
        let router = create_router(AppState::in_memory());
        let req = BindRequest {
            workspace: "root:org:app".into(),
            location_workspace: "root:org".into(),
            location_name: "EU!".into(),
        };
        let (status, body) = call(&router, Method::POST, "/v1/placements", Some(&req)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "invalid_placement");
    }
}
