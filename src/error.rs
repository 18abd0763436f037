// Relay error taxonomy and its mapping onto HTTP responses.

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::engine::session::SessionKind;

pub type RelayResult<T> = Result<T, RelayError>;

#[derive(Debug, Clone, Error)]
pub enum RelayError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("session {id} is a {actual} session, not {expected}")]
    TypeMismatch {
        id: String,
        expected: SessionKind,
        actual: SessionKind,
    },

    #[error("range not satisfiable for resource of {length} bytes")]
    RangeNotSatisfiable { length: u64 },

    #[error("unauthorized")]
    Unauthorized,

    #[error("upstream timed out: {0}")]
    UpstreamTimeout(String),

    #[error("upstream failed: {0}")]
    Upstream(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl RelayError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn upstream(message: impl Into<String>) -> Self {
        Self::Upstream(message.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) | Self::TypeMismatch { .. } => StatusCode::NOT_FOUND,
            Self::RangeNotSatisfiable { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<reqwest::Error> for RelayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::UpstreamTimeout(err.to_string())
        } else {
            Self::Upstream(err.to_string())
        }
    }
}

impl From<anyhow::Error> for RelayError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal(format!("{err:#}"))
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    status: u16,
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(ErrorBody {
            error: self.to_string(),
            status: status.as_u16(),
        });
        match self {
            Self::RangeNotSatisfiable { length } => (
                status,
                [(header::CONTENT_RANGE, format!("bytes */{length}"))],
                body,
            )
                .into_response(),
            _ => (status, body).into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            RelayError::validation("bad url").status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            RelayError::not_found("session x").status(),
            StatusCode::NOT_FOUND
        );
        let mismatch = RelayError::TypeMismatch {
            id: "abc".into(),
            expected: SessionKind::Torrent,
            actual: SessionKind::Hls,
        };
        assert_eq!(mismatch.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            RelayError::UpstreamTimeout("slow".into()).status(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            RelayError::upstream("502").status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            RelayError::Internal("boom".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_type_mismatch_display() {
        let err = RelayError::TypeMismatch {
            id: "abc".into(),
            expected: SessionKind::Torrent,
            actual: SessionKind::Direct,
        };
        assert_eq!(
            err.to_string(),
            "session abc is a direct session, not torrent"
        );
    }

    #[test]
    fn test_range_not_satisfiable_sets_content_range() {
        let resp = RelayError::RangeNotSatisfiable { length: 1000 }.into_response();
        assert_eq!(resp.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(
            resp.headers().get(header::CONTENT_RANGE).unwrap(),
            "bytes */1000"
        );
    }
}
