//! Wire protocol for tabrelay.
//!
//! Every connection to the hub speaks the same three-message vocabulary,
//! carried as JSON text frames:
//!
//! ```text
//! Relay (Gateway) --[request]--> Hub --[request]--> Host (browser tab)
//! Relay (Gateway) <--[response]-- Hub <--[response]-- Host
//! ```
//!
//! `identify` is an optional first frame that declares the connection role.
//! Binary bodies travel as base64 strings flagged by the `X-Content-Encoding`
//! header (see [`encoding`]).

pub mod encoding;
pub mod messages;

pub use encoding::{
    BASE64_ENCODING, BRIDGE_ERROR_HEADER, CONTENT_ENCODING_HEADER, BridgeFailure,
};
pub use messages::{
    BridgeMessage, BridgeRequest, BridgeResponse, ClientRole, Headers, Identify, ProtocolError,
};
