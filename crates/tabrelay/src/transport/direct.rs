//! Direct transport into an embedded host, bypassing the hub.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use tabrelay_protocol::{BridgeRequest, BridgeResponse};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;

use super::{CONNECTION_BUFFER_SIZE, ConnectionMode, Transport};
use crate::correlation::DEFAULT_REQUEST_TIMEOUT;
use crate::error::{BridgeError, BridgeResult};
use crate::host::{self, HostExecutor};

type Envelope = (BridgeRequest, oneshot::Sender<BridgeResponse>);

struct Embedded {
    inbox: mpsc::Sender<Envelope>,
    worker: JoinHandle<()>,
}

/// Posts requests straight into an in-process [`HostExecutor`].
///
/// Every `connect` stands up a fresh embedded host, so this never reaches
/// state held by a host attached elsewhere.
pub struct DirectTransport {
    executor: Arc<dyn HostExecutor>,
    request_timeout: Duration,
    connected: AtomicBool,
    embedded: Mutex<Option<Embedded>>,
}

impl DirectTransport {
    pub fn new(executor: Arc<dyn HostExecutor>) -> Self {
        Self {
            executor,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            connected: AtomicBool::new(false),
            embedded: Mutex::new(None),
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

#[async_trait]
impl Transport for DirectTransport {
    async fn connect(&self) -> BridgeResult<()> {
        let mut embedded = self.embedded.lock().await;
        if embedded.is_some() {
            return Ok(());
        }

        let (tx, mut rx) = mpsc::channel::<Envelope>(CONNECTION_BUFFER_SIZE);
        let executor = self.executor.clone();
        let worker = tokio::spawn(async move {
            while let Some((request, reply)) = rx.recv().await {
                let executor = executor.clone();
                tokio::spawn(async move {
                    let response = host::serve_request(executor.as_ref(), request).await;
                    let _ = reply.send(response);
                });
            }
            debug!("embedded host inbox closed");
        });

        *embedded = Some(Embedded { inbox: tx, worker });
        self.connected.store(true, Ordering::SeqCst);
        info!("direct transport attached to embedded host");
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(embedded) = self.embedded.lock().await.take() {
            // Dropping the inbox lets requests already accepted finish; the
            // loop itself has nothing left to do.
            drop(embedded.inbox);
            embedded.worker.abort();
        }
    }

    async fn send_request(&self, request: BridgeRequest) -> BridgeResult<BridgeResponse> {
        let inbox = self
            .embedded
            .lock()
            .await
            .as_ref()
            .map(|embedded| embedded.inbox.clone())
            .ok_or_else(|| BridgeError::connection("embedded host not started"))?;

        let id = request.id.clone();
        let (tx, rx) = oneshot::channel();
        inbox
            .send((request, tx))
            .await
            .map_err(|_| BridgeError::connection("embedded host stopped"))?;

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(BridgeError::connection("embedded host dropped the request")),
            Err(_) => {
                warn!("request {id} timed out after {:?}", self.request_timeout);
                Err(BridgeError::Timeout(self.request_timeout))
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn mode(&self) -> ConnectionMode {
        ConnectionMode::PostMessage
    }
}
