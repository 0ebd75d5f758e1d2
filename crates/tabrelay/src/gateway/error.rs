//! Structured error envelopes for gateway responses.

use axum::{
    Json,
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::error::BridgeError;

/// Errors the gateway answers locally, without a host response to replay.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Bridge(#[from] BridgeError),

    #[error("Route not found: {0}")]
    NotFound(String),

    #[error("Method not allowed: {0}")]
    MethodNotAllowed(String),

    #[error("Request body exceeds {0} bytes")]
    PayloadTooLarge(usize),
}

impl ApiError {
    pub fn not_found(path: impl Into<String>) -> Self {
        Self::NotFound(path.into())
    }

    pub fn method_not_allowed(method: &Method) -> Self {
        Self::MethodNotAllowed(method.to_string())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Bridge(err) => err.status_code(),
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            Self::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Bridge(err) => err.error_code(),
            Self::NotFound(_) => "NOT_FOUND",
            Self::MethodNotAllowed(_) => "METHOD_NOT_ALLOWED",
            Self::PayloadTooLarge(_) => "PAYLOAD_TOO_LARGE",
        }
    }

    /// Attach the request line so the envelope can echo it.
    pub fn at(self, method: &Method, path: &str) -> ScopedError {
        ScopedError {
            error: self,
            method: method.to_string(),
            path: path.to_string(),
        }
    }
}

/// Structured error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: &'static str,
    pub path: String,
    pub method: String,
    pub timestamp: String,
}

/// An [`ApiError`] together with the request it belongs to.
#[derive(Debug)]
pub struct ScopedError {
    pub error: ApiError,
    pub method: String,
    pub path: String,
}

impl IntoResponse for ScopedError {
    fn into_response(self) -> Response {
        let status = self.error.status_code();
        let code = self.error.error_code();
        let message = self.error.to_string();

        let (method, path) = (&self.method, &self.path);
        match &self.error {
            ApiError::Bridge(BridgeError::Serialization(_) | BridgeError::Lifecycle(_)) => {
                error!(error_code = code, %method, %path, %message, "Bridge error");
            }
            ApiError::Bridge(BridgeError::Connection(_) | BridgeError::Timeout(_)) => {
                warn!(error_code = code, %method, %path, %message, "Host unavailable");
            }
            _ => {
                debug!(error_code = code, %method, %path, %message, "Client error");
            }
        }

        let body = ErrorResponse {
            error: message,
            code,
            path: self.path,
            method: self.method,
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        (status, Json(body)).into_response()
    }
}
