//! Health check endpoints.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use chrono::Utc;
use kplane_store::{ListQuery, Store};
use serde::Serialize;

use crate::state::AppState;

#[derive(Debug, Serialize)]
#[cfg_attr(test, derive(serde::Deserialize))]
pub struct HealthResponse {
    /// "ok" or "degraded".
    pub status: String,
    pub service: String,
    pub version: String,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl HealthResponse {
    fn new(status: &str, message: Option<String>) -> Self {
        Self {
            status: status.to_string(),
            service: "control-plane".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: Utc::now().to_rfc3339(),
            message,
        }
    }
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/livez", get(livez))
}

/// The process is up. Checks nothing else.
async fn healthz() -> impl IntoResponse {
    Json(HealthResponse::new("ok", None))
}

/// Ready once the object store answers.
async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    match state.stores().targets.list(&ListQuery::all()).await {
        Ok(_) => (StatusCode::OK, Json(HealthResponse::new("ok", None))),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(HealthResponse::new("degraded", Some(e.to_string()))),
        ),
    }
}

async fn livez() -> impl IntoResponse {
    StatusCode::OK
}
