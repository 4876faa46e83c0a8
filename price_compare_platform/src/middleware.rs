//! Request plumbing shared by every route: requester identity, error
//! responses, CORS and body size limits.

use axum::{
    extract::FromRequestParts,
    http::{request::Parts, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tower_http::{
    cors::{Any, CorsLayer},
    limit::RequestBodyLimitLayer,
};
use tracing::{error, warn};

use crate::{error::OrchestratorError, settings::ServerConfig};

pub const REQUESTER_HEADER: &str = "X-Requester-Id";

/// Requester identity, taken from the `X-Requester-Id` header. Session
/// management lives in front of this service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requester(pub String);

#[axum::async_trait]
impl<S> FromRequestParts<S> for Requester
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(REQUESTER_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(|id| Requester(id.to_string()))
            .ok_or_else(|| {
                warn!("Rejected {} without requester id", parts.uri.path());
                ApiError::from(OrchestratorError::NotAuthorized)
            })
    }
}

/// JSON error response: `{"error": "..."}` with a matching status code.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        let status = match &err {
            OrchestratorError::UnknownTask(_) => StatusCode::NOT_FOUND,
            OrchestratorError::NoResults(_) => StatusCode::NOT_FOUND,
            OrchestratorError::NotAuthorized => StatusCode::UNAUTHORIZED,
            OrchestratorError::Fetch { .. } | OrchestratorError::FetchTimeout { .. } => {
                StatusCode::BAD_GATEWAY
            }
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        error!("Internal error: {:#}", err);
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "internal error".to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

/// Create CORS layer from server configuration
pub fn create_cors_layer(config: &ServerConfig) -> CorsLayer {
    if !config.enable_cors {
        // Restrictive CORS when disabled
        return CorsLayer::new()
            .allow_origin(HeaderValue::from_static("http://localhost"))
            .allow_methods([Method::GET]);
    }

    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([
            axum::http::header::CONTENT_TYPE,
            axum::http::header::ACCEPT,
            axum::http::HeaderName::from_static("x-requester-id"),
        ]);

    if config.cors_origins.iter().any(|origin| origin == "*") {
        return cors.allow_origin(Any);
    }

    let origins: Vec<HeaderValue> = config
        .cors_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin '{}'", origin);
                None
            }
        })
        .collect();
    cors.allow_origin(origins)
}

/// Create request body size limit layer
pub fn create_body_limit_layer(max_size_mb: usize) -> RequestBodyLimitLayer {
    RequestBodyLimitLayer::new(max_size_mb * 1024 * 1024)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::TaskId;

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(
            ApiError::from(OrchestratorError::UnknownTask(TaskId::new())).status,
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(OrchestratorError::NotAuthorized).status,
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ApiError::from(anyhow::anyhow!("sled exploded")).status,
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn test_requester_extraction() {
        let (mut parts, _) = axum::http::Request::builder()
            .uri("/api/profile")
            .header(REQUESTER_HEADER, " alice ")
            .body(())
            .unwrap()
            .into_parts();
        let requester = Requester::from_request_parts(&mut parts, &()).await.unwrap();
        assert_eq!(requester, Requester("alice".to_string()));

        let (mut parts, _) = axum::http::Request::builder()
            .uri("/api/profile")
            .body(())
            .unwrap()
            .into_parts();
        let rejection = Requester::from_request_parts(&mut parts, &()).await.unwrap_err();
        assert_eq!(rejection.status, StatusCode::UNAUTHORIZED);
    }
}
