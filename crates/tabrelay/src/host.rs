//! Host side of the bridge.
//!
//! In production the host is a browser tab. This module carries the same
//! contract in Rust: a [`HostExecutor`] turns a request tuple into a response
//! tuple, and [`HostConnection`] attaches an executor to a hub.

use std::borrow::Cow;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde_json::{Value, json};
use tabrelay_protocol::encoding::{self, BASE64_ENCODING, CONTENT_ENCODING_HEADER};
use tabrelay_protocol::{
    BridgeMessage, BridgeRequest, BridgeResponse, ClientRole, Headers, Identify, ProtocolError,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::config::DEFAULT_MAX_MESSAGE_BYTES;
use crate::error::{BridgeError, BridgeResult};
use crate::transport::socket_config;

const OUTBOUND_BUFFER_SIZE: usize = 256;

/// A request as the executor sees it, with the body already decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostRequest {
    pub method: String,
    pub url: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl HostRequest {
    pub fn from_bridge(request: &BridgeRequest) -> Result<Self, ProtocolError> {
        let mut headers = request.headers.clone();
        encoding::remove_header(&mut headers, CONTENT_ENCODING_HEADER);
        Ok(Self {
            method: request.method.clone(),
            url: request.url.clone(),
            headers,
            body: request.body_bytes()?,
        })
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        encoding::header_value(&self.headers, name)
    }

    pub fn body_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

/// The executor's answer.
#[derive(Debug, Clone, PartialEq)]
pub struct HostResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: Value,
}

impl HostResponse {
    pub fn json(status: u16, body: Value) -> Self {
        Self {
            status,
            headers: Headers::from([("content-type".to_string(), "application/json".to_string())]),
            body,
        }
    }

    pub fn text(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: Headers::from([(
                "content-type".to_string(),
                "text/plain; charset=utf-8".to_string(),
            )]),
            body: Value::String(body.into()),
        }
    }

    /// Raw bytes, carried base64-encoded and flagged for decoding on replay.
    pub fn bytes(status: u16, content_type: &str, body: &[u8]) -> Self {
        Self {
            status,
            headers: Headers::from([
                ("content-type".to_string(), content_type.to_string()),
                (
                    CONTENT_ENCODING_HEADER.to_string(),
                    BASE64_ENCODING.to_string(),
                ),
            ]),
            body: Value::String(encoding::encode_base64(body)),
        }
    }

    pub fn empty(status: u16) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Value::Null,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn into_bridge(self, id: impl Into<String>) -> BridgeResponse {
        BridgeResponse::new(id, self.status, self.headers, self.body)
    }
}

/// Executes requests that reach the host.
///
/// Implementations decide everything behind the single call: database,
/// auth, or process semantics. Errors are expressed as responses.
#[async_trait]
pub trait HostExecutor: Send + Sync {
    async fn execute(&self, request: HostRequest) -> HostResponse;
}

/// Run one bridge request through `executor`, keeping its correlation id.
pub async fn serve_request(executor: &dyn HostExecutor, request: BridgeRequest) -> BridgeResponse {
    match HostRequest::from_bridge(&request) {
        Ok(host_request) => executor.execute(host_request).await.into_bridge(request.id),
        Err(e) => {
            warn!("host rejected request {}: {e}", request.id);
            HostResponse::json(400, json!({ "error": e.to_string() })).into_bridge(request.id)
        }
    }
}

/// Answers every request with a JSON description of what it received.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoExecutor;

#[async_trait]
impl HostExecutor for EchoExecutor {
    async fn execute(&self, request: HostRequest) -> HostResponse {
        let mut headers: Vec<(&String, &String)> = request.headers.iter().collect();
        headers.sort();
        let headers: serde_json::Map<String, Value> = headers
            .into_iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();

        HostResponse::json(
            200,
            json!({
                "method": request.method,
                "url": request.url,
                "headers": headers,
                "body": request.body_text(),
                "bytes": request.body.len(),
            }),
        )
    }
}

/// How a [`HostConnection`] introduces itself to the hub.
#[derive(Debug, Clone)]
pub struct HostOptions {
    /// Send `identify{client:"host"}` first. When false the hub must infer the role.
    pub identify: bool,
    /// Token presented with the identify frame.
    pub token: Option<String>,
    /// Largest message sent to or accepted from the hub. Keep it equal to the hub's.
    pub max_message_bytes: usize,
}

impl Default for HostOptions {
    fn default() -> Self {
        Self {
            identify: true,
            token: None,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
        }
    }
}

/// Encode a response, swapping in a 502 when it would not fit in one message.
///
/// An oversized frame would make the hub drop this host and every request
/// still in flight on it.
fn response_frame(response: BridgeResponse, limit: usize) -> Result<String, ProtocolError> {
    let id = response.id.clone();
    let text = BridgeMessage::Response(response).to_text()?;
    if text.len() <= limit {
        return Ok(text);
    }
    warn!(
        "response {id} is {} bytes, over the {limit} byte message limit",
        text.len()
    );
    let replacement = HostResponse::json(
        502,
        json!({ "error": format!("response of {} bytes is too large to relay", text.len()) }),
    );
    BridgeMessage::Response(replacement.into_bridge(id)).to_text()
}

/// A live host attachment to a hub.
pub struct HostConnection {
    outbound: mpsc::Sender<Message>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    closed: CancellationToken,
    served: Arc<AtomicU64>,
}

impl HostConnection {
    pub async fn connect(
        hub_url: &str,
        executor: Arc<dyn HostExecutor>,
        options: HostOptions,
    ) -> BridgeResult<Self> {
        let (stream, _response) = tokio_tungstenite::connect_async_with_config(
            hub_url,
            Some(socket_config(options.max_message_bytes)),
            false,
        )
        .await
        .map_err(|e| BridgeError::connection(format!("failed to reach hub at {hub_url}: {e}")))?;
        let (mut sink, mut source) = stream.split();

        if options.identify {
            let identify = BridgeMessage::Identify(Identify {
                client: ClientRole::Host,
                token: options.token.clone(),
            })
            .to_text()?;
            sink.send(Message::Text(identify.into()))
                .await
                .map_err(|e| BridgeError::connection(format!("failed to identify with hub: {e}")))?;
        }

        let (tx, mut rx) = mpsc::channel::<Message>(OUTBOUND_BUFFER_SIZE);
        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if sink.send(msg).await.is_err() || closing {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let closed = CancellationToken::new();
        let served = Arc::new(AtomicU64::new(0));
        let limit = options.max_message_bytes;
        let reader = {
            let outbound = tx.clone();
            let closed = closed.clone();
            let served = served.clone();
            tokio::spawn(async move {
                while let Some(frame) = source.next().await {
                    let text = match frame {
                        Ok(Message::Text(text)) => text,
                        Ok(Message::Close(_)) => break,
                        Ok(_) => continue,
                        Err(e) => {
                            warn!("host connection error: {e}");
                            break;
                        }
                    };
                    let request = match BridgeMessage::parse(text.as_str()) {
                        Ok(BridgeMessage::Request(request)) => request,
                        Ok(other) => {
                            debug!("host ignoring {} message", other.kind());
                            continue;
                        }
                        Err(e) => {
                            warn!("host dropping frame: {e}");
                            continue;
                        }
                    };

                    let executor = executor.clone();
                    let outbound = outbound.clone();
                    let served = served.clone();
                    tokio::spawn(async move {
                        let response = serve_request(executor.as_ref(), request).await;
                        match response_frame(response, limit) {
                            Ok(text) => {
                                if outbound.send(Message::Text(text.into())).await.is_ok() {
                                    served.fetch_add(1, Ordering::Relaxed);
                                }
                            }
                            Err(e) => warn!("host failed to encode response: {e}"),
                        }
                    });
                }
                closed.cancel();
            })
        };

        info!("host attached to hub at {hub_url}");
        Ok(Self {
            outbound: tx,
            reader,
            writer,
            closed,
            served,
        })
    }

    /// Responses sent so far.
    pub fn served(&self) -> u64 {
        self.served.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the hub side of the socket goes away.
    pub async fn closed(&self) {
        self.closed.cancelled().await;
    }

    pub async fn disconnect(self) {
        let _ = self.outbound.send(Message::Close(None)).await;
        if tokio::time::timeout(Duration::from_secs(1), self.writer)
            .await
            .is_err()
        {
            debug!("host writer did not finish closing in time");
        }
        self.reader.abort();
        self.closed.cancel();
    }
}
