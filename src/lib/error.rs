use std::io;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("precondition failed for {path}")]
    PreconditionFailed { path: String },
    #[error("gave up on {path} after {attempts} conflicting writes")]
    Conflict { path: String, attempts: u32 },
    #[error("lease {path} is held by {holder} until {expires_at}")]
    LeaseHeld {
        path: String,
        holder: String,
        expires_at: DateTime<Utc>,
    },
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("invalid rule: {0}")]
    InvalidRule(String),
    #[error("unknown entity type '{0}'")]
    UnknownEntity(String),
    #[error("secret resolution failed: {0}")]
    Secret(String),
    #[error("dispatch failed: {0}")]
    Dispatch(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    pub fn is_precondition_failed(&self) -> bool {
        matches!(self, Self::PreconditionFailed { .. })
    }
}

impl From<toml::de::Error> for StoreError {
    fn from(err: toml::de::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<toml::ser::Error> for StoreError {
    fn from(err: toml::ser::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    message: &'a str,
}

impl IntoResponse for StoreError {
    fn into_response(self) -> Response {
        let status = match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Config(_)
            | Self::InvalidPath(_)
            | Self::InvalidPayload(_)
            | Self::InvalidRule(_)
            | Self::UnknownEntity(_) => StatusCode::BAD_REQUEST,
            Self::PreconditionFailed { .. } | Self::Conflict { .. } | Self::LeaseHeld { .. } => {
                StatusCode::CONFLICT
            }
            Self::Secret(_)
            | Self::Dispatch(_)
            | Self::Storage(_)
            | Self::Io(_)
            | Self::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let message = self.to_string();
        (status, Json(ErrorBody { message: &message })).into_response()
    }
}
