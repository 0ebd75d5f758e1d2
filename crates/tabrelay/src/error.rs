//! Bridge error taxonomy.

use std::time::Duration;

use axum::http::StatusCode;
use tabrelay_protocol::{BridgeFailure, BridgeResponse, ProtocolError};
use thiserror::Error;

/// Result type for bridge operations.
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Failures synthesized by the bridge itself.
///
/// A host answering with a non-2xx status is not one of these: that answer is
/// a regular [`BridgeResponse`] and is passed through untouched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BridgeError {
    /// No host attached, transport unreachable, or host lost mid-flight.
    #[error("{0}")]
    Connection(String),

    /// The host did not answer before the deadline.
    #[error("no response from host within {}ms", .0.as_millis())]
    Timeout(Duration),

    /// A message could not be parsed or a body could not be (de)serialized.
    #[error("{0}")]
    Serialization(String),

    /// A relay process failed to start or never became ready.
    #[error("{0}")]
    Lifecycle(String),

    /// An encoded message would not fit in one WebSocket message.
    #[error("encoded message of {size} bytes exceeds the {limit} byte limit")]
    MessageTooLarge { size: usize, limit: usize },
}

impl BridgeError {
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    pub fn lifecycle(msg: impl Into<String>) -> Self {
        Self::Lifecycle(msg.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Connection(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Serialization(_) | Self::Lifecycle(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::MessageTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Connection(_) => "CONNECTION_ERROR",
            Self::Timeout(_) => "TIMEOUT",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Lifecycle(_) => "LIFECYCLE_ERROR",
            Self::MessageTooLarge { .. } => "PAYLOAD_TOO_LARGE",
        }
    }

    /// Map a hub-synthesized response back to the error it stands for.
    ///
    /// Returns `None` for genuine host answers. The hub strips the failure
    /// header from host frames and only ever sets it on error statuses.
    pub fn from_failure_response(resp: &BridgeResponse, deadline: Duration) -> Option<Self> {
        if resp.is_success() {
            return None;
        }
        let message = resp
            .error_message()
            .unwrap_or("bridge failure")
            .to_string();
        match resp.bridge_failure()? {
            BridgeFailure::Connection => Some(Self::Connection(message)),
            BridgeFailure::Timeout => Some(Self::Timeout(deadline)),
            BridgeFailure::Serialization => Some(Self::Serialization(message)),
        }
    }
}

impl From<ProtocolError> for BridgeError {
    fn from(err: ProtocolError) -> Self {
        Self::Serialization(err.to_string())
    }
}
