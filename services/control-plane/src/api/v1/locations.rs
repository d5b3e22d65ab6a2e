//! Location API endpoints.
//!
//! Operators write a location's spec; its status belongs to the resolver.

use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use kplane_api::kinds::LOCATIONS;
use kplane_api::wire::ListResponse;
use kplane_api::Location;
use kplane_id::{validate_dns_label, WorkspaceName};
use kplane_reconcile::{retry_on_conflict, BackoffPolicy, CONFLICT_ATTEMPTS};
use kplane_store::{ListQuery, ObjectKey, Resource, Store, StoreError};

use super::WorkspaceQuery;
use crate::api::error::ApiError;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", get(list_locations).put(put_location))
        .route("/{workspace}/{name}", get(get_location))
}

/// PUT /v1/locations
///
/// Creates the location or replaces its spec. A malformed selector is
/// accepted and reported on the location's status.
async fn put_location(
    State(state): State<AppState>,
    Json(req): Json<Location>,
) -> Result<Json<Location>, ApiError> {
    WorkspaceName::parse(&req.metadata.workspace)
        .map_err(|e| ApiError::bad_request("invalid_workspace", e.to_string()))?;
    validate_dns_label(&req.metadata.name)
        .map_err(|e| ApiError::bad_request("invalid_name", e))?;

    let desired = Location {
        metadata: req.metadata.clone(),
        spec: req.spec,
        status: Default::default(),
    };
    let key = desired.key();
    let store = &state.stores().locations;
    let (desired, key) = (&desired, &key);

    let stored = retry_on_conflict::<_, StoreError, _, _>(
        &BackoffPolicy::conflict(),
        CONFLICT_ATTEMPTS,
        || async move {
            match store.get(key).await? {
                Some(existing) if existing.spec == desired.spec => Ok(existing),
                Some(mut existing) => {
                    existing.spec = desired.spec.clone();
                    existing.metadata.labels = desired.metadata.labels.clone();
                    store.update(existing).await
                }
                None => {
                    let mut fresh = Location::new(
                        &desired.metadata.workspace,
                        &desired.metadata.name,
                        &desired.spec.instance_selector,
                    );
                    fresh.spec = desired.spec.clone();
                    fresh.metadata.labels = desired.metadata.labels.clone();
                    store.create(fresh).await
                }
            }
        },
    )
    .await?;

    Ok(Json(stored))
}

/// GET /v1/locations
async fn list_locations(
    State(state): State<AppState>,
    Query(query): Query<WorkspaceQuery>,
) -> Result<Json<ListResponse<Location>>, ApiError> {
    let mut list = ListQuery::all();
    if let Some(ws) = query.workspace {
        list = list.workspace(ws);
    }
    let items = state.stores().locations.list(&list).await?;
    Ok(Json(ListResponse { items }))
}

/// GET /v1/locations/{workspace}/{name}
async fn get_location(
    State(state): State<AppState>,
    Path((workspace, name)): Path<(String, String)>,
) -> Result<Json<Location>, ApiError> {
    let key = ObjectKey::cluster_scoped(LOCATIONS, &workspace, &name);
    state
        .stores()
        .locations
        .get(&key)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found("location_not_found", format!("no location {name} in {workspace}")))
}
