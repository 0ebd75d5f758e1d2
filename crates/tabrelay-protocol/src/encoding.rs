//! Header conventions layered on top of the JSON messages.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::messages::{Headers, ProtocolError};

/// Header flagging a base64-encoded body.
pub const CONTENT_ENCODING_HEADER: &str = "X-Content-Encoding";

/// Value of [`CONTENT_ENCODING_HEADER`] for base64 bodies.
pub const BASE64_ENCODING: &str = "base64";

/// Header set on responses the hub synthesizes itself.
///
/// Lets a relay tell a bridge failure apart from a host answer that happens
/// to carry the same status code.
pub const BRIDGE_ERROR_HEADER: &str = "X-Bridge-Error";

/// Failure kinds the hub can report through [`BRIDGE_ERROR_HEADER`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeFailure {
    Connection,
    Timeout,
    Serialization,
}

impl BridgeFailure {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connection => "connection",
            Self::Timeout => "timeout",
            Self::Serialization => "serialization",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "connection" => Some(Self::Connection),
            "timeout" => Some(Self::Timeout),
            "serialization" => Some(Self::Serialization),
            _ => None,
        }
    }
}

/// Case-insensitive header lookup.
pub fn header_value<'a>(headers: &'a Headers, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

/// Remove a header regardless of case. Returns whether anything was removed.
pub fn remove_header(headers: &mut Headers, name: &str) -> bool {
    let before = headers.len();
    headers.retain(|key, _| !key.eq_ignore_ascii_case(name));
    headers.len() != before
}

/// Whether the headers flag a base64 body.
pub fn is_base64_encoded(headers: &Headers) -> bool {
    header_value(headers, CONTENT_ENCODING_HEADER)
        .is_some_and(|value| value.trim().eq_ignore_ascii_case(BASE64_ENCODING))
}

pub fn encode_base64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub fn decode_base64(text: &str) -> Result<Vec<u8>, ProtocolError> {
    STANDARD
        .decode(text.trim())
        .map_err(|e| ProtocolError::InvalidBody(format!("invalid base64 body: {e}")))
}
