use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::fmt::Display;

/// Domain failures callers branch on.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("malformed reading payload: {0}")]
    Decode(String),

    #[error("unknown measurement type: {0:?}")]
    UnknownQuantity(String),

    #[error("invalid parameter {name}: {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    #[error("invalid time range: start={start} end={end}")]
    InvalidRange { start: i64, end: i64 },

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),
}

#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn internal(err: impl Display) -> Self {
        tracing::error!(error = %err, "internal error");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
    }
}

impl From<HubError> for AppError {
    fn from(err: HubError) -> Self {
        match err {
            HubError::Store(err) => Self::internal(err),
            other => Self::bad_request(other.to_string()),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        if let Some(hub) = err.downcast_ref::<HubError>() {
            if !matches!(hub, HubError::Store(_)) {
                return Self::bad_request(hub.to_string());
            }
        }
        Self::internal(format!("{err:#}"))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status, self.message).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
