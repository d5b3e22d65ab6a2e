//! API v1 routes.

mod kinds;
mod locations;
mod objects;
mod placements;
mod targets;

use axum::Router;
use serde::Deserialize;

use crate::state::AppState;

/// Create API v1 routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .nest("/targets", targets::routes())
        .nest("/locations", locations::routes())
        .nest("/placements", placements::routes())
        .nest("/objects", objects::routes())
        .merge(kinds::routes())
}

/// `?workspace=` filter shared by list endpoints.
#[derive(Debug, Default, Deserialize)]
pub struct WorkspaceQuery {
    pub workspace: Option<String>,
}
