//! Problem-details error responses.

use axum::{
    http::{header::CONTENT_TYPE, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use kplane_id::RequestId;
use kplane_store::StoreError;
use serde::{Deserialize, Serialize};

use crate::admission::AdmissionDenied;
use crate::negotiation::NegotiationError;
use crate::placement::PlacementError;
use crate::registry::RegistryError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub r#type: String,
    pub title: String,
    pub status: u16,
    pub detail: String,
    pub code: String,
    pub request_id: String,
    pub retryable: bool,
}

impl ProblemDetails {
    fn new(status: StatusCode, code: impl Into<String>, detail: impl Into<String>) -> Self {
        let code = code.into();
        let title = status
            .canonical_reason()
            .unwrap_or("Unknown Error")
            .to_string();
        Self {
            r#type: format!("https://kplane.dev/problems/{code}"),
            title,
            status: status.as_u16(),
            detail: detail.into(),
            code,
            request_id: RequestId::new().to_string(),
            retryable: false,
        }
    }
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub problem: Box<ProblemDetails>,
}

impl ApiError {
    fn with_status(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        let problem = Box::new(ProblemDetails::new(status, code, message));
        Self { status, problem }
    }

    pub fn bad_request(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::BAD_REQUEST, code, message)
    }

    pub fn not_found(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::NOT_FOUND, code, message)
    }

    pub fn conflict(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::CONFLICT, code, message)
    }

    pub fn forbidden(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::FORBIDDEN, code, message)
    }

    pub fn unavailable(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::SERVICE_UNAVAILABLE, code, message).retryable()
    }

    pub fn internal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_status(StatusCode::INTERNAL_SERVER_ERROR, code, message)
    }

    pub fn retryable(mut self) -> Self {
        self.problem.retryable = true;
        self
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = (self.status, Json(self.problem)).into_response();
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/problem+json"),
        );
        response
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match &e {
            StoreError::NotFound(_) => ApiError::not_found("not_found", e.to_string()),
            StoreError::AlreadyExists(_) => ApiError::conflict("already_exists", e.to_string()),
            StoreError::Conflict { .. } => ApiError::conflict("conflict", e.to_string()).retryable(),
            StoreError::Unavailable(_) => ApiError::unavailable("unavailable", e.to_string()),
            StoreError::Invalid(_) => ApiError::bad_request("invalid", e.to_string()),
        }
    }
}

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::NotFound(_) => ApiError::not_found("target_not_found", e.to_string()),
            RegistryError::Invalid(_) => ApiError::bad_request("invalid_registration", e.to_string()),
            RegistryError::Store(e) => e.into(),
        }
    }
}

impl From<PlacementError> for ApiError {
    fn from(e: PlacementError) -> Self {
        match e {
            PlacementError::Invalid(_) => ApiError::bad_request("invalid_placement", e.to_string()),
            PlacementError::Store(e) => e.into(),
        }
    }
}

impl From<NegotiationError> for ApiError {
    fn from(e: NegotiationError) -> Self {
        match e {
            NegotiationError::Invalid(_) => ApiError::bad_request("invalid_import", e.to_string()),
            NegotiationError::Store(e) => e.into(),
        }
    }
}

impl From<AdmissionDenied> for ApiError {
    fn from(e: AdmissionDenied) -> Self {
        ApiError::forbidden("admission_denied", e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(StoreError::NotFound("k".into()), StatusCode::NOT_FOUND, "not_found", false)]
    #[case(StoreError::AlreadyExists("k".into()), StatusCode::CONFLICT, "already_exists", false)]
    #[case(
        StoreError::Conflict { key: "k".into(), expected: 1, actual: 2 },
        StatusCode::CONFLICT,
        "conflict",
        true
    )]
    #[case(StoreError::Unavailable("down".into()), StatusCode::SERVICE_UNAVAILABLE, "unavailable", true)]
    #[case(StoreError::Invalid("bad".into()), StatusCode::BAD_REQUEST, "invalid", false)]
    fn test_store_errors_map_to_statuses(
        #[case] error: StoreError,
        #[case] status: StatusCode,
        #[case] code: &str,
        #[case] retryable: bool,
    ) {
        let err: ApiError = error.into();
        assert_eq!(err.status, status);
        assert_eq!(err.problem.code, code);
        assert_eq!(err.problem.retryable, retryable);
    }

    #[test]
    fn test_problem_body_shape() {
        let err = ApiError::bad_request("invalid", "bad selector");
        let json = serde_json::to_value(&*err.problem).unwrap();
        assert_eq!(json["type"], "https://kplane.dev/problems/invalid");
        assert_eq!(json["status"], 400);
        assert_eq!(json["title"], "Bad Request");
    }
}
