use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// Gateway error taxonomy. Adapters and services return these tagged with
/// the underlying cause; the HTTP layer maps each kind onto a status code.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    InvalidArgument(String),
    #[error("{0}")]
    Unauthenticated(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("upstream authentication failed: {0}")]
    AuthFailed(String),
    #[error("upstream returned {status}: {body}")]
    UpstreamError { status: u16, body: String },
    #[error("malformed upstream payload: {0}")]
    ParseError(String),
    #[error("upstream timed out: {0}")]
    Timeout(String),
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(format!("{} not found", what.into()))
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            Self::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::AuthFailed(_) | Self::UpstreamError { .. } | Self::ParseError(_) | Self::Timeout(_) => {
                StatusCode::BAD_GATEWAY
            }
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Map an outbound reqwest failure (no HTTP status available).
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else {
            Self::UpstreamError {
                status: 0,
                body: err.to_string(),
            }
        }
    }

    /// Map a config-DB failure, surfacing unique-constraint violations as
    /// conflicts instead of opaque 500s.
    pub fn from_db(err: anyhow::Error) -> Self {
        let msg = err.to_string();
        if msg.contains("UNIQUE constraint failed") {
            Self::Conflict("a record with the same unique fields already exists".to_string())
        } else {
            Self::Internal(err)
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("request failed: {self}");
        }
        let body = Json(json!({ "status": "error", "error": self.to_string() }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_expected_statuses() {
        assert_eq!(ApiError::invalid("x").status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ApiError::Unauthenticated("no token".into()).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(ApiError::Forbidden("denied".into()).status_code(), StatusCode::FORBIDDEN);
        assert_eq!(ApiError::not_found("datasource").status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            ApiError::UpstreamError { status: 503, body: "unavailable".into() }.status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ApiError::AuthFailed("401 from backend".into()).status_code(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn unique_violation_becomes_conflict() {
        let err = anyhow::anyhow!("UNIQUE constraint failed: datasources.org_id, datasources.name");
        assert_eq!(ApiError::from_db(err).status_code(), StatusCode::CONFLICT);
    }
}
