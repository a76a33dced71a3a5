use crate::config::ConfigError;
use crate::db::LedgerError;
use crate::keystore::KeyStoreError;
use crate::query::QueryError;
use axum::{http::StatusCode, response::{IntoResponse, Response}, Json};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("internal error")]
    Internal,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, msg) = match &self {
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m.clone()),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized".to_string()),
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m.clone()),
            ApiError::Conflict(m) => (StatusCode::CONFLICT, m.clone()),
            ApiError::Internal => (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string()),
        };

        (status, Json(ErrorBody { error: msg })).into_response()
    }
}

impl From<LedgerError> for ApiError {
    fn from(e: LedgerError) -> Self {
        tracing::error!(error = %e, "ledger error");
        ApiError::Internal
    }
}

impl From<QueryError> for ApiError {
    fn from(e: QueryError) -> Self {
        match e {
            QueryError::DatasetNotFound(_) => ApiError::NotFound(e.to_string()),
            QueryError::DatasetNotReady { .. } => ApiError::Conflict(e.to_string()),
            QueryError::InvalidBucket { .. } => ApiError::BadRequest(e.to_string()),
            QueryError::Ledger(inner) => inner.into(),
            QueryError::Verifier(inner) => {
                tracing::error!(error = %inner, "on-demand shard verification errored");
                ApiError::Internal
            }
        }
    }
}

/// Anything that can stop the server from starting.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    KeyStore(#[from] KeyStoreError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
