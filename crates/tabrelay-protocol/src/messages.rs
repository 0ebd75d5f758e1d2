//! Bridge message types.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

use crate::encoding::{
    self, BASE64_ENCODING, BRIDGE_ERROR_HEADER, BridgeFailure, CONTENT_ENCODING_HEADER,
};

/// Header map carried on requests and responses.
pub type Headers = HashMap<String, String>;

/// Headers dropped before a response is replayed over HTTP.
///
/// The HTTP layer recomputes framing for the decoded body.
const FRAMING_HEADERS: &[&str] = &["content-length", "transfer-encoding", "connection"];

/// Errors raised while decoding or encoding bridge messages.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Frame is not JSON or has no `type` field.
    #[error("malformed bridge message: {0}")]
    Malformed(String),

    /// Frame has a `type` outside the bridge vocabulary.
    #[error("unknown bridge message type: {0}")]
    UnknownType(String),

    /// Known `type` with a payload that does not match its schema.
    #[error("invalid {kind} message: {message}")]
    InvalidPayload { kind: String, message: String },

    /// Body could not be decoded or encoded.
    #[error("{0}")]
    InvalidBody(String),
}

/// Role a connection declares with [`Identify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientRole {
    Host,
    Relay,
}

impl std::fmt::Display for ClientRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Host => f.write_str("host"),
            Self::Relay => f.write_str("relay"),
        }
    }
}

/// Explicit role declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identify {
    pub client: ClientRole,
    /// Shared secret required for the host role when the hub is configured with one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// A request travelling from a relay to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeRequest {
    pub id: String,
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

/// The host's answer to a [`BridgeRequest`], matched by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeResponse {
    pub id: String,
    pub status: u16,
    #[serde(default)]
    pub headers: Headers,
    /// String bodies replay as raw text, `null` as empty, anything else as compact JSON.
    #[serde(default)]
    pub body: Value,
}

/// The complete bridge vocabulary, tagged by the `type` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BridgeMessage {
    Identify(Identify),
    Request(BridgeRequest),
    Response(BridgeResponse),
}

impl BridgeMessage {
    /// Parse a text frame, rejecting unknown `type` tags explicitly.
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        let value: Value =
            serde_json::from_str(raw).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| ProtocolError::Malformed("missing \"type\" field".to_string()))?
            .to_string();

        if !matches!(kind.as_str(), "identify" | "request" | "response") {
            return Err(ProtocolError::UnknownType(kind));
        }

        serde_json::from_value(value).map_err(|e| ProtocolError::InvalidPayload {
            kind,
            message: e.to_string(),
        })
    }

    /// Serialize to a text frame.
    pub fn to_text(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::InvalidBody(e.to_string()))
    }

    /// The `type` tag of this message.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Identify(_) => "identify",
            Self::Request(_) => "request",
            Self::Response(_) => "response",
        }
    }

    /// Correlation id, if the message carries one.
    pub fn id(&self) -> Option<&str> {
        match self {
            Self::Identify(_) => None,
            Self::Request(req) => Some(&req.id),
            Self::Response(resp) => Some(&resp.id),
        }
    }

    pub fn identify(client: ClientRole) -> Self {
        Self::Identify(Identify {
            client,
            token: None,
        })
    }
}

impl BridgeRequest {
    pub fn new(id: impl Into<String>, method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            method: method.into(),
            url: url.into(),
            headers: Headers::new(),
            body: None,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Attach a raw body. Empty bodies are omitted; non UTF-8 bodies are base64 encoded.
    pub fn with_body_bytes(mut self, bytes: Vec<u8>) -> Self {
        if bytes.is_empty() {
            self.body = None;
            return self;
        }
        match String::from_utf8(bytes) {
            Ok(text) => self.body = Some(text),
            Err(err) => {
                self.body = Some(encoding::encode_base64(err.as_bytes()));
                self.headers.insert(
                    CONTENT_ENCODING_HEADER.to_string(),
                    BASE64_ENCODING.to_string(),
                );
            }
        }
        self
    }

    /// Raw body bytes, decoding base64 when flagged.
    pub fn body_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        match &self.body {
            None => Ok(Vec::new()),
            Some(text) if encoding::is_base64_encoded(&self.headers) => {
                encoding::decode_base64(text)
            }
            Some(text) => Ok(text.clone().into_bytes()),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        encoding::header_value(&self.headers, name)
    }
}

impl BridgeResponse {
    pub fn new(id: impl Into<String>, status: u16, headers: Headers, body: Value) -> Self {
        Self {
            id: id.into(),
            status,
            headers,
            body,
        }
    }

    /// Build a response from raw bytes, applying the base64 convention when needed.
    pub fn from_bytes(
        id: impl Into<String>,
        status: u16,
        headers: Headers,
        bytes: Vec<u8>,
    ) -> Self {
        let mut headers = headers;
        let body = match String::from_utf8(bytes) {
            Ok(text) => Value::String(text),
            Err(err) => {
                headers.insert(
                    CONTENT_ENCODING_HEADER.to_string(),
                    BASE64_ENCODING.to_string(),
                );
                Value::String(encoding::encode_base64(err.as_bytes()))
            }
        };
        Self::new(id, status, headers, body)
    }

    /// Build a base64-flagged response regardless of the byte content.
    pub fn binary(id: impl Into<String>, status: u16, headers: Headers, bytes: &[u8]) -> Self {
        let mut headers = headers;
        headers.insert(
            CONTENT_ENCODING_HEADER.to_string(),
            BASE64_ENCODING.to_string(),
        );
        Self::new(
            id,
            status,
            headers,
            Value::String(encoding::encode_base64(bytes)),
        )
    }

    /// A failure synthesized by the bridge rather than produced by the host.
    pub fn failure(
        id: impl Into<String>,
        kind: BridgeFailure,
        status: u16,
        message: impl Into<String>,
    ) -> Self {
        let headers = Headers::from([
            ("content-type".to_string(), "application/json".to_string()),
            (BRIDGE_ERROR_HEADER.to_string(), kind.as_str().to_string()),
        ]);
        Self::new(id, status, headers, json!({ "error": message.into() }))
    }

    /// The failure kind if this response was synthesized by the hub.
    pub fn bridge_failure(&self) -> Option<BridgeFailure> {
        encoding::header_value(&self.headers, BRIDGE_ERROR_HEADER).and_then(BridgeFailure::parse)
    }

    /// The `error` field of a JSON body, when present.
    pub fn error_message(&self) -> Option<&str> {
        self.body.get("error").and_then(Value::as_str)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        encoding::header_value(&self.headers, name)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// A host answer with a non-2xx status. Passed through, never treated as a bridge failure.
    pub fn is_host_error(&self) -> bool {
        !self.is_success() && self.bridge_failure().is_none()
    }

    /// Body bytes exactly as they should reach the HTTP caller.
    pub fn body_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        match &self.body {
            Value::Null => Ok(Vec::new()),
            Value::String(text) if encoding::is_base64_encoded(&self.headers) => {
                encoding::decode_base64(text)
            }
            Value::String(text) => Ok(text.clone().into_bytes()),
            other if encoding::is_base64_encoded(&self.headers) => Err(
                ProtocolError::InvalidBody(format!(
                    "base64 body must be a string, got {}",
                    value_kind(other)
                )),
            ),
            other => {
                serde_json::to_vec(other).map_err(|e| ProtocolError::InvalidBody(e.to_string()))
            }
        }
    }

    /// Headers to replay over HTTP: encoding marker and framing headers removed.
    pub fn replay_headers(&self) -> Headers {
        let mut headers = self.headers.clone();
        encoding::remove_header(&mut headers, CONTENT_ENCODING_HEADER);
        for name in FRAMING_HEADERS {
            encoding::remove_header(&mut headers, name);
        }
        headers
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
