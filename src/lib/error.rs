use std::io;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, IndexError>;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("index store opened in read-only mode")]
    ReadOnly,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("invalid event: {0}")]
    InvalidEvent(String),
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    #[error("log entry {0} not found")]
    LogNotFound(u64),
    #[error("integrity fault: {0}")]
    IntegrityFault(String),
    #[error("index unavailable: {0}")]
    Unavailable(String),
    #[error("query failed: {0}")]
    Query(String),
}

impl IndexError {
    /// Transport-level failures may succeed on retry; everything else is final.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl From<toml::de::Error> for IndexError {
    fn from(err: toml::de::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<toml::ser::Error> for IndexError {
    fn from(err: toml::ser::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for IndexError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<rocksdb::Error> for IndexError {
    fn from(err: rocksdb::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    message: &'a str,
    retryable: bool,
}

impl IndexError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Config(_) | Self::InvalidEvent(_) | Self::InvalidQuery(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::LogNotFound(_) => StatusCode::NOT_FOUND,
            Self::IntegrityFault(_) => StatusCode::CONFLICT,
            Self::ReadOnly => StatusCode::FORBIDDEN,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Query(_) => StatusCode::BAD_GATEWAY,
            Self::Storage(_) | Self::Serialization(_) | Self::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for IndexError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = self.to_string();
        let body = ErrorBody {
            message: &message,
            retryable: self.is_retryable(),
        };
        (status, Json(body)).into_response()
    }
}
