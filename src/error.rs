//! Error types for cachefleet

use crate::types::ServerId;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Hash ring is empty")]
    RingEmpty,

    #[error("Hash ring saturated: no free position found for server {0}")]
    RingSaturated(ServerId),

    #[error("Server {0} is already registered")]
    DuplicateId(ServerId),

    #[error("Unknown server: {0}")]
    UnknownServer(ServerId),

    #[error("No free port in the configured range")]
    NoFreePort,

    #[error("Backend {0} did not become ready within {1}ms")]
    BackendStartTimeout(ServerId, u64),

    #[error("Backend {0} did not stop within {1}ms")]
    BackendStopTimeout(ServerId, u64),

    #[error("Upstream I/O error: {0}")]
    UpstreamIo(String),

    #[error("Telemetry poll failed for server {0}: {1}")]
    Telemetry(ServerId, String),

    #[error("Server error: {0}")]
    Server(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl Error {
    pub fn status_code(&self) -> u16 {
        match self {
            Error::RingEmpty => 503,
            Error::NoFreePort => 503,
            Error::UpstreamIo(_) => 502,
            Error::BackendStartTimeout(..) | Error::BackendStopTimeout(..) => 504,
            _ => 500,
        }
    }
}

/// Dispatcher-facing errors for the client-port HTTP handlers.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Missing resource key in request path")]
    MissingKey,

    #[error("No backend available: {0}")]
    NoBackend(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            DispatchError::MissingKey => (StatusCode::BAD_REQUEST, self.to_string()),
            DispatchError::NoBackend(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg.clone()),
            DispatchError::Upstream(msg) => (StatusCode::BAD_GATEWAY, msg.clone()),
            DispatchError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };

        let body = Json(json!({ "error": message }));
        (status, body).into_response()
    }
}

impl From<Error> for DispatchError {
    fn from(err: Error) -> Self {
        match err {
            Error::RingEmpty => DispatchError::NoBackend("hash ring is empty".to_string()),
            Error::UpstreamIo(msg) => DispatchError::Upstream(msg),
            other => DispatchError::Internal(other.to_string()),
        }
    }
}
