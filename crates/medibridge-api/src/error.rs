use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tracing::error;

use medibridge_types::api::ErrorBody;

use crate::relay::RelayError;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("missing or invalid token")]
    Unauthorized,
    #[error("session not found")]
    SessionNotFound,
    #[error("not a participant")]
    NotParticipant,
    #[error("invalid cursor")]
    InvalidCursor,
    #[error("message content is empty")]
    EmptyContent,
    #[error("storage failure")]
    Storage(#[source] anyhow::Error),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::SessionNotFound => StatusCode::NOT_FOUND,
            Self::NotParticipant => StatusCode::FORBIDDEN,
            Self::InvalidCursor | Self::EmptyContent => StatusCode::BAD_REQUEST,
            Self::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<RelayError> for ApiError {
    fn from(e: RelayError) -> Self {
        match e {
            RelayError::SessionNotFound => Self::SessionNotFound,
            RelayError::NotParticipant => Self::NotParticipant,
            RelayError::EmptyContent => Self::EmptyContent,
            RelayError::Storage(e) => Self::Storage(e),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let Self::Storage(e) = &self {
            error!("storage error: {:#}", e);
        }
        let body = ErrorBody {
            error: self.to_string(),
        };
        (self.status(), Json(body)).into_response()
    }
}
