use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

/// Unified error type for the replay hub.
///
/// Every failure the service can produce maps to one of these kinds. The HTTP
/// layer renders them through the single `IntoResponse` impl below; the
/// streaming path only logs them and closes the socket.
#[derive(Debug, Error)]
pub enum HubError {
    #[error("unsupported_interval: the interval '{0}' is not supported")]
    UnsupportedInterval(String),
    #[error("channel_not_found: {0}")]
    ChannelNotFound(String),
    #[error("invalid_token")]
    InvalidToken,
    #[error("storage_error: {0}")]
    Storage(String),
    #[error("serialization_error: {0}")]
    Serialization(String),
    #[error("protocol_error: {0}")]
    Protocol(String),
    #[error("abnormal_close: {0}")]
    AbnormalClose(String),
    #[error("bad_request: {0}")]
    BadRequest(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("upstream_error: {0}")]
    Upstream(String),
    #[error("internal_error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, HubError>;

impl HubError {
    /// Stable machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnsupportedInterval(_) => "unsupported_interval",
            Self::ChannelNotFound(_) => "channel_not_found",
            Self::InvalidToken => "invalid_token",
            Self::Storage(_) => "storage_error",
            Self::Serialization(_) => "serialization_error",
            Self::Protocol(_) => "protocol_error",
            Self::AbnormalClose(_) => "abnormal_close",
            Self::BadRequest(_) => "bad_request",
            Self::Unauthorized => "unauthorized",
            Self::Upstream(_) => "upstream_error",
            Self::Internal(_) => "internal_error",
        }
    }

    /// HTTP status hint for this error kind.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::UnsupportedInterval(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::ChannelNotFound(_) => StatusCode::NOT_FOUND,
            Self::InvalidToken | Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Protocol(_) | Self::AbnormalClose(_) | Self::BadRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::Storage(_) | Self::Serialization(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Message safe to hand back to a client. Server-side failures keep their
    /// detail in the logs only.
    fn public_message(&self) -> String {
        match self {
            Self::Storage(_) | Self::Internal(_) => "internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for HubError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(error = %self, "request rejected");
        }

        let body = json!({ "error": self.code(), "message": self.public_message() });
        (status, axum::Json(body)).into_response()
    }
}

impl From<rusqlite::Error> for HubError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<r2d2::Error> for HubError {
    fn from(e: r2d2::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for HubError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for HubError {
    fn from(e: reqwest::Error) -> Self {
        Self::Upstream(e.to_string())
    }
}

impl From<tokio::task::JoinError> for HubError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Internal(format!("task failed: {e}"))
    }
}

impl From<JsonRejection> for HubError {
    fn from(e: JsonRejection) -> Self {
        Self::BadRequest(e.body_text())
    }
}
