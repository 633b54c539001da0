pub mod conversations;

use std::sync::Arc;

use axum::{
    response::{IntoResponse, Response},
    Router,
};

use crate::{
    auth::jwt::JwtAccessTokenService,
    error::{ErrorCode, RelayError},
    store::ChatStore,
};

pub fn router(store: ChatStore, jwt_service: Arc<JwtAccessTokenService>) -> Router {
    conversations::router(store, jwt_service)
}

#[derive(Debug)]
enum ApiError {
    BadRequest { message: String },
    NotFound { message: &'static str },
    Internal(anyhow::Error),
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest { message: message.into() }
    }

    fn not_found(message: &'static str) -> Self {
        Self::NotFound { message }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(error: anyhow::Error) -> Self {
        Self::Internal(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::BadRequest { message } => {
                RelayError::new(ErrorCode::ValidationFailed, message).into_response()
            }
            Self::NotFound { message } => {
                RelayError::new(ErrorCode::NotFound, message).into_response()
            }
            Self::Internal(error) => {
                tracing::error!(error = %format!("{error:#}"), "conversation api internal error");
                RelayError::internal().into_response()
            }
        }
    }
}

/// Path ids are integers; anything else is a validation failure rather than
/// axum's plain-text rejection.
fn parse_id(raw: &str, what: &str) -> Result<i64, ApiError> {
    raw.trim()
        .parse::<i64>()
        .ok()
        .filter(|id| *id > 0)
        .ok_or_else(|| ApiError::bad_request(format!("{what} must be a positive integer")))
}
