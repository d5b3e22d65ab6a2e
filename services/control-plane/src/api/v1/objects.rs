//! Generic workload object endpoints.
//!
//! A thin HTTP face over the object store, used by remote syncers and
//! workspace users. Writes carry the resource version they were based on
//! and fail with 409 when it is stale. Creates and spec updates pass the
//! admission gate first; status writes do not.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, put},
    Json, Router,
};
use kplane_api::wire::ListResponse;
use kplane_api::Object;
use kplane_id::WorkspaceName;
use kplane_store::{ListQuery, ObjectKey, Store};
use serde::Deserialize;
use tracing::debug;

use crate::admission::{AdmissionRequest, Operation};
use crate::api::error::ApiError;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_objects).post(create_object).put(update_object))
        .route("/status", put(update_status))
        .route("/{kind}/{workspace}/{name}", get(get_object).delete(delete_object))
}

#[derive(Debug, Default, Deserialize)]
pub struct NamespaceQuery {
    #[serde(default)]
    pub namespace: String,
}

fn validate(object: &Object) -> Result<(), ApiError> {
    if object.kind.is_empty() {
        return Err(ApiError::bad_request("invalid_kind", "object kind is required"));
    }
    WorkspaceName::parse(&object.metadata.workspace)
        .map_err(|e| ApiError::bad_request("invalid_workspace", e.to_string()))?;
    Ok(())
}

/// GET /v1/objects?kind=&workspace=&namespace=&selector=
async fn list_objects(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ListResponse<Object>>, ApiError> {
    let items = state.stores().objects.list(&query).await?;
    Ok(Json(ListResponse { items }))
}

/// POST /v1/objects
async fn create_object(
    State(state): State<AppState>,
    Json(object): Json<Object>,
) -> Result<impl IntoResponse, ApiError> {
    validate(&object)?;
    state
        .admission()
        .admit(&AdmissionRequest {
            operation: Operation::Create,
            object: &object,
        })
        .await?;
    let created = state.stores().objects.create(object).await?;
    debug!(kind = %created.kind, name = %created.metadata.name, "Object created");
    Ok((StatusCode::CREATED, Json(created)))
}

/// PUT /v1/objects
async fn update_object(
    State(state): State<AppState>,
    Json(object): Json<Object>,
) -> Result<Json<Object>, ApiError> {
    validate(&object)?;
    state
        .admission()
        .admit(&AdmissionRequest {
            operation: Operation::Update,
            object: &object,
        })
        .await?;
    Ok(Json(state.stores().objects.update(object).await?))
}

/// PUT /v1/objects/status
async fn update_status(
    State(state): State<AppState>,
    Json(object): Json<Object>,
) -> Result<Json<Object>, ApiError> {
    validate(&object)?;
    Ok(Json(state.stores().objects.update_status(object).await?))
}

/// GET /v1/objects/{kind}/{workspace}/{name}?namespace=
async fn get_object(
    State(state): State<AppState>,
    Path((kind, workspace, name)): Path<(String, String, String)>,
    Query(query): Query<NamespaceQuery>,
) -> Result<Json<Object>, ApiError> {
    let key = ObjectKey::new(kind, workspace, query.namespace, name);
    state
        .stores()
        .objects
        .get(&key)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found("not_found", format!("not found: {key}")))
}

/// DELETE /v1/objects/{kind}/{workspace}/{name}?namespace=
///
/// Objects with finalizers are only marked for deletion.
async fn delete_object(
    State(state): State<AppState>,
    Path((kind, workspace, name)): Path<(String, String, String)>,
    Query(query): Query<NamespaceQuery>,
) -> Result<StatusCode, ApiError> {
    let key = ObjectKey::new(kind, workspace, query.namespace, name);
    state.stores().objects.delete(&key).await?;
    Ok(StatusCode::NO_CONTENT)
}
