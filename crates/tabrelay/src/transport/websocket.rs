//! Relay transport over the hub WebSocket.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tabrelay_protocol::{BridgeMessage, BridgeRequest, BridgeResponse, ClientRole};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use super::{CONNECTION_BUFFER_SIZE, ConnectionMode, Transport, socket_config};
use crate::config::DEFAULT_MAX_MESSAGE_BYTES;
use crate::correlation::{CorrelationTable, DEFAULT_REQUEST_TIMEOUT};
use crate::error::{BridgeError, BridgeResult};

type Waiter = oneshot::Sender<BridgeResult<BridgeResponse>>;

/// State shared with the socket tasks.
struct Shared {
    pending: Mutex<CorrelationTable<Waiter>>,
    connected: AtomicBool,
}

impl Shared {
    /// Fail every request still waiting.
    async fn reject_all(&self, reason: &str) {
        let drained = self.pending.lock().await.drain_all();
        if !drained.is_empty() {
            warn!("failing {} in-flight request(s): {}", drained.len(), reason);
        }
        for entry in drained {
            let _ = entry.waiter.send(Err(BridgeError::connection(reason)));
        }
    }
}

struct Link {
    outbound: mpsc::Sender<Message>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

/// Transport that identifies as a relay on the hub and correlates responses by id.
pub struct WebSocketTransport {
    hub_url: String,
    request_timeout: Duration,
    max_message_bytes: usize,
    shared: Arc<Shared>,
    link: Mutex<Option<Link>>,
}

impl WebSocketTransport {
    pub fn new(hub_url: impl Into<String>) -> Self {
        Self {
            hub_url: hub_url.into(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            shared: Arc::new(Shared {
                pending: Mutex::new(CorrelationTable::new()),
                connected: AtomicBool::new(false),
            }),
            link: Mutex::new(None),
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Cap on one encoded message in either direction. Keep it equal to the hub's.
    pub fn with_max_message_bytes(mut self, limit: usize) -> Self {
        self.max_message_bytes = limit;
        self
    }

    pub fn hub_url(&self) -> &str {
        &self.hub_url
    }

    /// Number of requests waiting for a response.
    pub async fn pending_count(&self) -> usize {
        self.shared.pending.lock().await.len()
    }

    async fn outbound(&self) -> Option<mpsc::Sender<Message>> {
        self.link
            .lock()
            .await
            .as_ref()
            .map(|link| link.outbound.clone())
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self) -> BridgeResult<()> {
        let mut link = self.link.lock().await;
        if self.shared.connected.load(Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(stale) = link.take() {
            stale.reader.abort();
            stale.writer.abort();
        }

        let (stream, _response) = tokio_tungstenite::connect_async_with_config(
            self.hub_url.as_str(),
            Some(socket_config(self.max_message_bytes)),
            false,
        )
        .await
        .map_err(|e| {
            BridgeError::connection(format!("failed to reach hub at {}: {e}", self.hub_url))
        })?;
        let (mut sink, mut source) = stream.split();

        let identify = BridgeMessage::identify(ClientRole::Relay).to_text()?;
        sink.send(Message::Text(identify.into()))
            .await
            .map_err(|e| BridgeError::connection(format!("failed to identify with hub: {e}")))?;

        let (tx, mut rx) = mpsc::channel::<Message>(CONNECTION_BUFFER_SIZE);

        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if sink.send(msg).await.is_err() || closing {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let shared = self.shared.clone();
        let timeout = self.request_timeout;
        let reader = tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                match frame {
                    Ok(Message::Text(text)) => dispatch(&shared, text.as_str(), timeout).await,
                    Ok(Message::Close(_)) => {
                        debug!("hub closed the relay connection");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("relay connection error: {e}");
                        break;
                    }
                }
            }
            shared.connected.store(false, Ordering::SeqCst);
            shared.reject_all("connection to hub lost").await;
        });

        self.shared.connected.store(true, Ordering::SeqCst);
        *link = Some(Link {
            outbound: tx,
            reader,
            writer,
        });
        info!("relay connected to hub at {}", self.hub_url);
        Ok(())
    }

    async fn disconnect(&self) {
        let link = self.link.lock().await.take();
        self.shared.connected.store(false, Ordering::SeqCst);
        if let Some(link) = link {
            let _ = link.outbound.send(Message::Close(None)).await;
            link.reader.abort();
            if tokio::time::timeout(Duration::from_secs(1), link.writer)
                .await
                .is_err()
            {
                debug!("relay writer did not finish closing in time");
            }
        }
        self.shared.reject_all("transport disconnected").await;
    }

    async fn send_request(&self, request: BridgeRequest) -> BridgeResult<BridgeResponse> {
        let id = request.id.clone();
        let text = BridgeMessage::Request(request).to_text()?;
        // The hub drops a connection that sends an oversized message.
        if text.len() > self.max_message_bytes {
            return Err(BridgeError::MessageTooLarge {
                size: text.len(),
                limit: self.max_message_bytes,
            });
        }

        if !self.is_connected() {
            return Err(BridgeError::connection("not connected to hub"));
        }
        let outbound = self
            .outbound()
            .await
            .ok_or_else(|| BridgeError::connection("not connected to hub"))?;

        let (tx, rx) = oneshot::channel();
        self.shared
            .pending
            .lock()
            .await
            .insert(id.clone(), tx, self.request_timeout)?;

        if outbound.send(Message::Text(text.into())).await.is_err() {
            self.shared.pending.lock().await.take(&id);
            return Err(BridgeError::connection("connection to hub lost"));
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BridgeError::connection("request abandoned")),
            Err(_) => {
                self.shared.pending.lock().await.take(&id);
                warn!("request {id} timed out after {:?}", self.request_timeout);
                Err(BridgeError::Timeout(self.request_timeout))
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    fn mode(&self) -> ConnectionMode {
        ConnectionMode::WebSocket
    }
}

/// Resolve the waiter matching an inbound frame, if any.
async fn dispatch(shared: &Shared, raw: &str, timeout: Duration) {
    let response = match BridgeMessage::parse(raw) {
        Ok(BridgeMessage::Response(resp)) => resp,
        Ok(other) => {
            debug!("ignoring {} message on relay connection", other.kind());
            return;
        }
        Err(e) => {
            warn!("dropping frame from hub: {e}");
            return;
        }
    };

    let Some(entry) = shared.pending.lock().await.take(&response.id) else {
        debug!("discarding response for unknown or expired id {}", response.id);
        return;
    };

    let result = match BridgeError::from_failure_response(&response, timeout) {
        Some(err) => Err(err),
        None => Ok(response),
    };
    let _ = entry.waiter.send(result);
}
