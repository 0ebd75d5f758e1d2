//! Transport adapters carrying bridge requests from a gateway to the host.
//!
//! Two interchangeable implementations sit behind [`Transport`]:
//! [`WebSocketTransport`] attaches to an existing host through the hub, and
//! [`DirectTransport`] posts into an embedded in-process host.

mod direct;
mod websocket;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tabrelay_protocol::{BridgeRequest, BridgeResponse};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;

use crate::error::BridgeResult;

pub use direct::DirectTransport;
pub use websocket::WebSocketTransport;

/// Per-connection outbound buffer depth.
pub(crate) const CONNECTION_BUFFER_SIZE: usize = 256;

/// Client socket limits matching the hub's. Bridge messages go out as a
/// single frame, so the frame limit equals the message limit.
pub(crate) fn socket_config(max_message_bytes: usize) -> WebSocketConfig {
    WebSocketConfig::default()
        .max_message_size(Some(max_message_bytes))
        .max_frame_size(Some(max_message_bytes))
}

/// How a gateway reaches the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
pub enum ConnectionMode {
    /// Relay through the hub to the live host.
    #[serde(rename = "websocket")]
    #[value(name = "websocket")]
    WebSocket,
    /// Post directly into an embedded host.
    #[serde(rename = "postmessage")]
    #[value(name = "postmessage")]
    PostMessage,
}

impl ConnectionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WebSocket => "websocket",
            Self::PostMessage => "postmessage",
        }
    }
}

impl fmt::Display for ConnectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "websocket" | "ws" => Ok(Self::WebSocket),
            "postmessage" | "direct" => Ok(Self::PostMessage),
            other => Err(format!("unknown connection mode: {other}")),
        }
    }
}

/// Pick the transport mode for a gateway.
///
/// An explicit choice always wins; otherwise the websocket relay.
pub fn determine_connection_mode(explicit: Option<ConnectionMode>) -> ConnectionMode {
    explicit.unwrap_or(ConnectionMode::WebSocket)
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the connection. Succeeds immediately when already connected.
    async fn connect(&self) -> BridgeResult<()>;

    /// Close the connection, failing every request still in flight.
    async fn disconnect(&self);

    /// Send one request and wait for its single terminal resolution.
    async fn send_request(&self, request: BridgeRequest) -> BridgeResult<BridgeResponse>;

    fn is_connected(&self) -> bool;

    fn mode(&self) -> ConnectionMode;
}
