//! HTTP error mapping.

use axum::{
    extract::rejection::BytesRejection,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use cachelink_core::CacheError;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Malformed request input.
    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("failed to encode response: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The body could not be read (size limit, broken stream).
    #[error(transparent)]
    Body(#[from] BytesRejection),

    /// A broadcast arrived carrying this cluster's own id.
    #[error("broadcast_error_same_cluster")]
    SameCluster,

    #[error("broadcast_error_no_such_operation")]
    NoSuchOperation,

    #[error("unauthorized")]
    Unauthorized,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Cache(e) if e.is_validation() => StatusCode::BAD_REQUEST,
            Self::Body(e) => e.status(),
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Cache(_) | Self::Serialization(_) | Self::SameCluster | Self::NoSuchOperation => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        match self {
            Self::Body(rejection) => rejection.into_response(),
            Self::Unauthorized => (
                status,
                [(header::WWW_AUTHENTICATE, "Basic realm=Authorization Required")],
            )
                .into_response(),
            other => {
                if status.is_server_error() {
                    tracing::error!(error = %other, "Request failed");
                } else {
                    tracing::debug!(error = %other, "Request rejected");
                }
                (status, other.to_string()).into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ApiError::from(CacheError::validation("must provide a \"key\"")).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(CacheError::CountMismatch {
                expected: 2,
                actual: 1
            })
            .status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ApiError::SameCluster.status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ApiError::SameCluster.to_string(),
            "broadcast_error_same_cluster"
        );
    }

    #[test]
    fn test_unauthorized_challenge() {
        let response = ApiError::Unauthorized.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers()[header::WWW_AUTHENTICATE],
            "Basic realm=Authorization Required"
        );
    }
}
