use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    BadRequest(String),
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("Internal server error")]
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    message: String,
}

impl AppError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized(message.into())
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden(message.into())
    }
}

impl From<travelgrid_core::Error> for AppError {
    fn from(error: travelgrid_core::Error) -> Self {
        use travelgrid_core::Error as CoreError;

        match error {
            CoreError::InvalidInput(message) => Self::BadRequest(message),
            CoreError::DeviceNotRegistered
            | CoreError::UnsupportedDataType(_)
            | CoreError::UnsupportedOperation(_) => Self::BadRequest(error.to_string()),
            CoreError::NotFound(_) => Self::NotFound(error.to_string()),
            CoreError::AlreadyResolved(_) | CoreError::Concurrency(_) => {
                Self::Conflict(error.to_string())
            }
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for AppError {
    fn from(rejection: QueryRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if let Self::Internal(detail) = &self {
            tracing::error!("Request failed: {}", detail);
        }
        let body = ErrorBody {
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_errors_map_to_status_codes() {
        let cases = [
            (travelgrid_core::Error::InvalidInput("userId is required".into()), StatusCode::BAD_REQUEST),
            (travelgrid_core::Error::DeviceNotRegistered, StatusCode::BAD_REQUEST),
            (travelgrid_core::Error::NotFound("conflict x".into()), StatusCode::NOT_FOUND),
            (travelgrid_core::Error::AlreadyResolved("resolved".into()), StatusCode::CONFLICT),
            (travelgrid_core::Error::Database("disk full".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (error, expected) in cases {
            assert_eq!(AppError::from(error).into_response().status(), expected);
        }
    }

    #[test]
    fn internal_errors_hide_detail() {
        let error = AppError::from(travelgrid_core::Error::Database("secret path".into()));
        assert_eq!(error.to_string(), "Internal server error");
    }
}
