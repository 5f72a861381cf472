//! 统一的 API 错误类型与转换。

use axum::Json;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use std::io::ErrorKind;

use crate::batch::NoFilesError;
use crate::sandbox::PathError;
use crate::storage::StorageError;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Forbidden(String),
    MethodNotAllowed,
    PayloadTooLarge(String),
    TooManyRequests(u64),
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            ApiError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::TooManyRequests(_) => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn message(&self) -> &str {
        match self {
            ApiError::BadRequest(msg)
            | ApiError::NotFound(msg)
            | ApiError::Forbidden(msg)
            | ApiError::PayloadTooLarge(msg)
            | ApiError::Internal(msg) => msg,
            ApiError::MethodNotAllowed => "method not allowed",
            ApiError::TooManyRequests(_) => "too many concurrent uploads",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        if let ApiError::TooManyRequests(retry_after) = &self
            && *retry_after > 0
            && let Ok(value) = HeaderValue::from_str(&retry_after.to_string())
        {
            headers.insert(header::RETRY_AFTER, value);
        }
        (
            self.status(),
            headers,
            Json(json!({ "error": self.message() })),
        )
            .into_response()
    }
}

impl From<PathError> for ApiError {
    fn from(error: PathError) -> Self {
        ApiError::BadRequest(error.to_string())
    }
}

impl From<NoFilesError> for ApiError {
    fn from(error: NoFilesError) -> Self {
        ApiError::BadRequest(error.to_string())
    }
}

impl From<StorageError> for ApiError {
    fn from(error: StorageError) -> Self {
        match error {
            StorageError::Path(err) => err.into(),
            StorageError::SymlinkTargetNotAllowed(_) => ApiError::Forbidden(error.to_string()),
            StorageError::NotADirectory
            | StorageError::InvalidName
            | StorageError::RootProtected => ApiError::BadRequest(error.to_string()),
            StorageError::Io(err) => match err.kind() {
                ErrorKind::NotFound => ApiError::NotFound(err.to_string()),
                ErrorKind::AlreadyExists => ApiError::BadRequest(err.to_string()),
                _ => ApiError::Internal(err.to_string()),
            },
        }
    }
}
