//! Schema import and kind discovery endpoints.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use kplane_api::wire::KindAvailability;
use kplane_api::ResourceImport;
use serde::Deserialize;

use crate::api::error::ApiError;
use crate::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/imports", post(publish_import))
        .route("/kinds/{kind}", get(get_kind))
}

#[derive(Debug, Deserialize)]
pub struct KindQuery {
    pub workspace: String,
    /// Importing target asking; adds the verdict on its own import.
    #[serde(default)]
    pub target: Option<String>,
}

/// POST /v1/imports
///
/// Negotiation runs asynchronously; poll `GET /v1/kinds/{kind}` for the
/// outcome.
async fn publish_import(
    State(state): State<AppState>,
    Json(req): Json<ResourceImport>,
) -> Result<impl IntoResponse, ApiError> {
    let import = state.negotiator().publish(req).await?;
    Ok((StatusCode::ACCEPTED, Json(import)))
}

/// GET /v1/kinds/{kind}?workspace=&target=
async fn get_kind(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    Query(query): Query<KindQuery>,
) -> Result<Json<KindAvailability>, ApiError> {
    Ok(Json(
        state
            .negotiator()
            .availability(&query.workspace, &kind, query.target.as_deref())
            .await?,
    ))
}

#[cfg(test)]
mod tests {
    use axum::http::Method;
    use kplane_api::StructuralSchema;

    use super::*;
    use crate::api::create_router;
    use crate::negotiation::KindKey;
    use crate::api::v1::testing::{call, decode};

    #[tokio::test]
    async fn test_native_kinds_are_usable() {
        let router = create_router(AppState::in_memory());
        let (status, body) =
            call::<()>(&router, Method::GET, "/v1/kinds/configmaps?workspace=root:org", None).await;
        assert_eq!(status, StatusCode::OK);
        let availability: KindAvailability = decode(body);
        assert!(availability.native);
        assert!(availability.usable());
    }

    #[tokio::test]
    async fn test_import_is_accepted_but_not_yet_exported() {
        let router = create_router(AppState::in_memory());
        let import = ResourceImport::new(
            "root:org",
            "cluster-a",
            "widgets",
            StructuralSchema::object([("spec", StructuralSchema::Any)]),
        );

        let (status, body) = call(&router, Method::POST, "/v1/imports", Some(&import)).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["metadata"]["name"], "widgets.cluster-a");

        let (_, body) =
            call::<()>(&router, Method::GET, "/v1/kinds/widgets?workspace=root:org", None).await;
        let availability: KindAvailability = decode(body);
        assert!(!availability.usable());
    }

    #[tokio::test]
    async fn test_conflicting_importer_is_told_its_verdict() {
        let state = AppState::in_memory();
        let router = create_router(state.clone());
        let widget = |size: StructuralSchema| StructuralSchema::object([("size", size)]);
        for (target, size) in [
            ("cluster-a", StructuralSchema::Integer),
            ("cluster-b", StructuralSchema::String),
        ] {
            let import = ResourceImport::new("root:org", target, "widgets", widget(size));
            let (status, _) = call(&router, Method::POST, "/v1/imports", Some(&import)).await;
            assert_eq!(status, StatusCode::ACCEPTED);
        }
        state
            .negotiator()
            .reconcile(&KindKey {
                workspace: "root:org".into(),
                kind: "widgets".into(),
            })
            .await
            .unwrap();

        let (_, body) = call::<()>(
            &router,
            Method::GET,
            "/v1/kinds/widgets?workspace=root:org&target=cluster-b",
            None,
        )
        .await;
        let availability: KindAvailability = decode(body);
        assert_eq!(availability.import_compatible, Some(false));
        assert!(!availability.usable_by_importer());
    }
}
