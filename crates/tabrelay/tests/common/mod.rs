//! Test utilities and common setup.
#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tabrelay::config::{GatewayConfig, HubConfig};
use tabrelay::error::BridgeResult;
use tabrelay::host::{HostConnection, HostExecutor, HostOptions, HostRequest, HostResponse};
use tabrelay::hub::HubServer;
use tabrelay::proxy::{LaunchSpec, RelayLauncher, RelayProcess};
use tabrelay::transport::{DirectTransport, WebSocketTransport};
use tabrelay::{EchoExecutor, Gateway, GatewayHandle};
use tokio::net::TcpListener;

/// Hub on an ephemeral port.
pub async fn start_hub(config: HubConfig) -> HubServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    HubServer::serve(listener, &config).await.unwrap()
}

pub fn hub_config() -> HubConfig {
    HubConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        ..HubConfig::default()
    }
}

/// Gateway on an ephemeral port talking to `hub_url`. The transport is
/// returned too so tests can inspect its pending table.
pub async fn start_gateway(
    hub_url: &str,
    request_timeout: Duration,
) -> (GatewayHandle, Arc<WebSocketTransport>) {
    serve_gateway(
        hub_url,
        WebSocketTransport::new(hub_url).with_request_timeout(request_timeout),
    )
    .await
}

/// Gateway on an ephemeral port using a preconfigured transport.
pub async fn serve_gateway(
    hub_url: &str,
    transport: WebSocketTransport,
) -> (GatewayHandle, Arc<WebSocketTransport>) {
    let transport = Arc::new(transport);
    let config = GatewayConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        hub_url: Some(hub_url.to_string()),
        ..GatewayConfig::default()
    };
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let handle = Gateway::new(config, transport.clone())
        .serve(listener)
        .await
        .unwrap();
    (handle, transport)
}

/// Host attached to `hub_url` with an explicit identify frame.
pub async fn attach_host(hub_url: &str, executor: impl HostExecutor + 'static) -> HostConnection {
    HostConnection::connect(hub_url, Arc::new(executor), HostOptions::default())
        .await
        .unwrap()
}

/// Poll `check` until it holds or a second passes.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..50 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

/// Always answers with the same response.
pub struct StaticExecutor(pub HostResponse);

#[async_trait]
impl HostExecutor for StaticExecutor {
    async fn execute(&self, _request: HostRequest) -> HostResponse {
        self.0.clone()
    }
}

/// Sends the request body back as binary.
pub struct BinaryEchoExecutor;

#[async_trait]
impl HostExecutor for BinaryEchoExecutor {
    async fn execute(&self, request: HostRequest) -> HostResponse {
        HostResponse::bytes(200, "application/octet-stream", &request.body)
    }
}

/// Answers with the request path after a per-path delay.
///
/// Paths starting with `/slow` wait `slow`; everything else answers at once.
pub struct PathExecutor {
    pub slow: Duration,
}

#[async_trait]
impl HostExecutor for PathExecutor {
    async fn execute(&self, request: HostRequest) -> HostResponse {
        if request.url.starts_with("/slow") {
            tokio::time::sleep(self.slow).await;
        }
        HostResponse::json(200, json!({ "path": request.url }))
    }
}

/// Answers `/big*` with `size` filler bytes and the request path otherwise.
pub struct SizedExecutor {
    pub size: usize,
    pub slow: Duration,
}

#[async_trait]
impl HostExecutor for SizedExecutor {
    async fn execute(&self, request: HostRequest) -> HostResponse {
        if request.url.starts_with("/big") {
            return HostResponse::bytes(200, "application/octet-stream", &vec![0x5a; self.size]);
        }
        if request.url.starts_with("/slow") {
            tokio::time::sleep(self.slow).await;
        }
        HostResponse::json(200, json!({ "path": request.url }))
    }
}

/// Runs relays as in-process gateways with an embedded echo host.
#[derive(Default)]
pub struct InProcessLauncher {
    pub launches: AtomicUsize,
    /// Cleared by tests to simulate the relay dying.
    pub alive: Arc<AtomicBool>,
}

pub struct InProcessRelay {
    handle: Option<GatewayHandle>,
    alive: Arc<AtomicBool>,
}

#[async_trait]
impl RelayProcess for InProcessRelay {
    fn pid(&self) -> Option<u32> {
        None
    }

    fn is_running(&mut self) -> bool {
        self.handle.is_some() && self.alive.load(Ordering::SeqCst)
    }

    async fn terminate(&mut self) -> BridgeResult<()> {
        if let Some(handle) = self.handle.take() {
            handle.stop().await;
        }
        Ok(())
    }
}

#[async_trait]
impl RelayLauncher for InProcessLauncher {
    async fn launch(&self, spec: &LaunchSpec) -> BridgeResult<Box<dyn RelayProcess>> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        self.alive.store(true, Ordering::SeqCst);

        let config = GatewayConfig {
            host: "127.0.0.1".to_string(),
            port: spec.port,
            hub_url: Some(spec.hub_url.clone()),
            target_url: Some(spec.target_url.clone()),
            ..GatewayConfig::default()
        };
        let gateway = Gateway::new(config, Arc::new(DirectTransport::new(Arc::new(EchoExecutor))));
        let handle = gateway
            .start(spec.port)
            .await
            .map_err(|e| tabrelay::BridgeError::lifecycle(format!("{e:#}")))?;

        Ok(Box::new(InProcessRelay {
            handle: Some(handle),
            alive: self.alive.clone(),
        }))
    }
}
