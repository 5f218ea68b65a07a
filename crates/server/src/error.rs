use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chatroom_core::ValidationError;
use serde::Serialize;
use thiserror::Error;

use crate::{access::AccessError, messages::MessageError};

/// Every REST failure, rendered as `{ "message": ... }`.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    InvalidInput(String),
    #[error("too many requests")]
    RateLimited,
    #[error("{0}")]
    Conflict(String),
    #[error("authentication required")]
    Unauthorized,
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub message: String,
}

impl ApiError {
    pub fn not_found(message: impl Into<String>) -> Self {
        ApiError::NotFound(message.into())
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        ApiError::Forbidden(message.into())
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        ApiError::InvalidInput(message.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            ApiError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to show a client.
    pub fn public_message(&self) -> String {
        match self {
            ApiError::Internal(_) => "internal server error".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::Internal(err) = &self {
            tracing::error!(?err, "request failed");
        }
        let status = self.status();
        let body = ErrorBody {
            message: self.public_message(),
        };
        (status, Json(body)).into_response()
    }
}

impl From<AccessError> for ApiError {
    fn from(err: AccessError) -> Self {
        match err {
            AccessError::NotFound(message) => ApiError::NotFound(message.to_string()),
            AccessError::Forbidden(message) => ApiError::Forbidden(message.to_string()),
            AccessError::InvalidInput(message) => ApiError::InvalidInput(message.to_string()),
            AccessError::Conflict(message) => ApiError::Conflict(message.to_string()),
            AccessError::Storage(err) => ApiError::Internal(err),
        }
    }
}

impl From<MessageError> for ApiError {
    fn from(err: MessageError) -> Self {
        match err {
            MessageError::NotFound => ApiError::NotFound(err.to_string()),
            MessageError::NoAccess | MessageError::NotCreator => {
                ApiError::Forbidden(err.to_string())
            }
            MessageError::TooOld
            | MessageError::NotEditable
            | MessageError::NoChange
            | MessageError::Invalid(_) => ApiError::InvalidInput(err.to_string()),
            MessageError::Stale => ApiError::Conflict(err.to_string()),
            MessageError::Storage(err) => ApiError::Internal(err),
        }
    }
}

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        ApiError::InvalidInput(err.to_string())
    }
}
