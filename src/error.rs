use axum::{
    Json,
    extract::rejection::{JsonRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

use crate::models::SequenceNumber;

/// Failures raised by a broker adapter.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("entity '{0}' not found")]
    EntityNotFound(String),
    #[error("entity '{0}' already exists")]
    EntityExists(String),
    #[error("lock lost for message {0}")]
    LockLost(SequenceNumber),
    #[error("unsupported operation: {0}")]
    Unsupported(String),
    #[error("invalid credential: {0}")]
    InvalidCredential(String),
    #[error("link already closed")]
    Closed,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("{0}")]
    Other(String),
}

pub type BrokerResult<T> = std::result::Result<T, BrokerError>;

/// Hard failures surfaced to the console. Per-message failures never end up here.
#[derive(Debug, Error)]
pub enum Error {
    #[error("no connection string provided")]
    NotConnected,
    #[error("connection failed: {0}")]
    Connection(#[source] BrokerError),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("entity '{0}' not found")]
    NotFound(String),
    #[error(transparent)]
    Broker(BrokerError),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<BrokerError> for Error {
    fn from(e: BrokerError) -> Self {
        match e {
            BrokerError::EntityNotFound(path) => Error::NotFound(path),
            other => Error::Broker(other),
        }
    }
}

impl From<JsonRejection> for Error {
    fn from(rejection: JsonRejection) -> Self {
        Error::InvalidRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for Error {
    fn from(rejection: QueryRejection) -> Self {
        Error::InvalidRequest(rejection.body_text())
    }
}

impl Error {
    pub fn invalid(message: impl Into<String>) -> Self {
        Error::InvalidRequest(message.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Error::NotConnected | Error::Connection(_) | Error::InvalidRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Broker(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("request failed: {self}");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
