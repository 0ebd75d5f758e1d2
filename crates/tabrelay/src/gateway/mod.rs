//! HTTP gateway.
//!
//! Accepts arbitrary HTTP calls, wraps each one as a bridge request with a
//! fresh correlation id, sends it through a [`Transport`] and replays the
//! host's answer.

mod error;
mod proxy;
mod routes;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use log::{info, warn};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::GatewayConfig;
use crate::host::EchoExecutor;
use crate::transport::{
    ConnectionMode, DirectTransport, Transport, WebSocketTransport, determine_connection_mode,
};

pub use error::{ApiError, ErrorResponse, ScopedError};
pub use routes::{ADMIN_HEADER, COMPLETE_PATH, build_router};

/// Shared state for gateway handlers.
#[derive(Clone)]
pub struct GatewayState {
    pub transport: Arc<dyn Transport>,
    pub target_url: Option<String>,
    pub max_body_bytes: usize,
    /// Cancelled once the completion signal has been handled.
    pub completed: CancellationToken,
}

impl GatewayState {
    pub fn new(transport: Arc<dyn Transport>, config: &GatewayConfig) -> Self {
        Self {
            transport,
            target_url: config.target_url.clone(),
            max_body_bytes: config.max_body_bytes,
            completed: CancellationToken::new(),
        }
    }
}

pub struct Gateway {
    config: GatewayConfig,
    transport: Arc<dyn Transport>,
}

impl Gateway {
    pub fn new(config: GatewayConfig, transport: Arc<dyn Transport>) -> Self {
        Self { config, transport }
    }

    /// Build the transport the configuration asks for.
    ///
    /// The websocket mode needs `hub_url`, or a `target_url` to derive it
    /// from using `hub_path`. The postmessage mode embeds a loopback host.
    pub fn from_config(config: GatewayConfig, hub_path: &str) -> Result<Self> {
        let transport: Arc<dyn Transport> = match determine_connection_mode(config.mode) {
            ConnectionMode::WebSocket => Arc::new(
                WebSocketTransport::new(resolve_hub_url(&config, hub_path)?)
                    .with_request_timeout(config.request_timeout())
                    .with_max_message_bytes(config.max_message_bytes),
            ),
            ConnectionMode::PostMessage => Arc::new(
                DirectTransport::new(Arc::new(EchoExecutor))
                    .with_request_timeout(config.request_timeout()),
            ),
        };
        Ok(Self::new(config, transport))
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        self.transport.clone()
    }

    /// Bind `config.host:port` and start serving. Port 0 picks a free port.
    pub async fn start(self, port: u16) -> Result<GatewayHandle> {
        let addr = format!("{}:{}", self.config.host, port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("binding gateway to {addr}"))?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener.
    pub async fn serve(self, listener: TcpListener) -> Result<GatewayHandle> {
        let local_addr = listener.local_addr().context("reading gateway address")?;

        // Requests retry the connection on demand; this only warms it up.
        if let Err(e) = self.transport.connect().await {
            warn!("gateway starting without a host connection: {e}");
        }

        let state = GatewayState::new(self.transport.clone(), &self.config);
        let completed = state.completed.clone();
        let app = build_router(state);

        let shutdown = CancellationToken::new();
        let stop = shutdown.clone();
        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(async move { stop.cancelled().await })
                .await
            {
                log::error!("gateway server error: {e}");
            }
        });

        info!(
            "gateway listening on http://{local_addr} ({} mode)",
            self.transport.mode()
        );
        Ok(GatewayHandle {
            local_addr,
            shutdown,
            completed,
            task,
            transport: self.transport,
        })
    }
}

/// The hub a websocket-mode gateway attaches to: `hub_url` as given, or
/// derived from `target_url`.
fn resolve_hub_url(config: &GatewayConfig, hub_path: &str) -> Result<String> {
    match (&config.hub_url, &config.target_url) {
        (Some(hub_url), _) => Ok(hub_url.clone()),
        (None, Some(target)) => crate::proxy::hub_url_for_target(target, hub_path)
            .map_err(|e| anyhow!("deriving hub URL from {target}: {e}")),
        (None, None) => Err(anyhow!(
            "websocket mode needs a hub URL or a target URL to derive it from"
        )),
    }
}

/// A running gateway.
pub struct GatewayHandle {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    completed: CancellationToken,
    task: JoinHandle<()>,
    transport: Arc<dyn Transport>,
}

impl GatewayHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.local_addr)
    }

    /// Resolves once the completion signal has been received.
    pub async fn completed(&self) {
        self.completed.cancelled().await;
    }

    pub fn is_completed(&self) -> bool {
        self.completed.is_cancelled()
    }

    pub async fn stop(self) {
        self.shutdown.cancel();
        let _ = self.task.await;
        self.transport.disconnect().await;
        info!("gateway on {} stopped", self.local_addr);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, StatusCode, header};
    use http_body_util::BodyExt;
    use serde_json::{Value, json};
    use tabrelay_protocol::{BridgeRequest, BridgeResponse, Headers};
    use tower::ServiceExt;

    use super::*;
    use crate::error::{BridgeError, BridgeResult};

    /// Transport that replays scripted results and records what it was sent.
    #[derive(Default)]
    struct ScriptedTransport {
        connected: AtomicBool,
        refuse_connect: bool,
        connects: AtomicUsize,
        script: Mutex<VecDeque<BridgeResult<BridgeResponse>>>,
        seen: Mutex<Vec<BridgeRequest>>,
    }

    impl ScriptedTransport {
        fn connected() -> Self {
            Self {
                connected: AtomicBool::new(true),
                ..Self::default()
            }
        }

        fn then(self, result: BridgeResult<BridgeResponse>) -> Self {
            self.script.lock().unwrap().push_back(result);
            self
        }

        fn seen(&self) -> Vec<BridgeRequest> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn connect(&self) -> BridgeResult<()> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.refuse_connect {
                return Err(BridgeError::connection("hub unreachable"));
            }
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn disconnect(&self) {
            self.connected.store(false, Ordering::SeqCst);
        }

        async fn send_request(&self, request: BridgeRequest) -> BridgeResult<BridgeResponse> {
            let id = request.id.clone();
            self.seen.lock().unwrap().push(request);
            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some(Ok(mut resp)) => {
                    resp.id = id;
                    Ok(resp)
                }
                Some(Err(e)) => Err(e),
                None => Ok(BridgeResponse::new(id, 204, Headers::new(), Value::Null)),
            }
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        fn mode(&self) -> ConnectionMode {
            ConnectionMode::WebSocket
        }
    }

    fn app(transport: Arc<ScriptedTransport>) -> (axum::Router, CancellationToken) {
        app_with(transport, GatewayConfig::default())
    }

    fn app_with(
        transport: Arc<ScriptedTransport>,
        config: GatewayConfig,
    ) -> (axum::Router, CancellationToken) {
        let state = GatewayState::new(transport, &config);
        let completed = state.completed.clone();
        (build_router(state), completed)
    }

    async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
        response
            .into_body()
            .collect()
            .await
            .unwrap()
            .to_bytes()
            .to_vec()
    }

    async fn body_json(response: axum::response::Response) -> Value {
        serde_json::from_slice(&body_bytes(response).await).unwrap()
    }

    #[tokio::test]
    async fn test_health_reports_transport() {
        let transport = Arc::new(ScriptedTransport::connected());
        let config = GatewayConfig {
            target_url: Some("https://demo.example.com".to_string()),
            ..GatewayConfig::default()
        };
        let (app, _) = app_with(transport, config);

        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["connected"], true);
        assert_eq!(body["mode"], "websocket");
        assert_eq!(body["targetUrl"], "https://demo.example.com");
        assert!(body["version"].as_str().is_some());
    }

    #[tokio::test]
    async fn test_json_body_is_replayed_byte_identical() {
        let transport = Arc::new(ScriptedTransport::connected().then(Ok(BridgeResponse::new(
            "",
            200,
            Headers::new(),
            json!({"ok": true}),
        ))));
        let (app, _) = app(transport.clone());

        let response = app
            .oneshot(Request::get("/x").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await, br#"{"ok":true}"#.to_vec());

        let seen = transport.seen();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].method, "GET");
        assert_eq!(seen[0].url, "/x");
        assert!(seen[0].body.is_none());
        assert!(!seen[0].id.is_empty());
    }

    #[tokio::test]
    async fn test_request_line_headers_and_body_are_forwarded() {
        let transport = Arc::new(ScriptedTransport::connected());
        let (app, _) = app(transport.clone());

        let request = Request::post("/rest/v1/items?select=id")
            .header(header::CONTENT_TYPE, "application/json")
            .header("apikey", "anon")
            .header("prefer", "return=representation")
            .body(Body::from(r#"{"title":"a"}"#))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let seen = transport.seen();
        assert_eq!(seen[0].url, "/rest/v1/items?select=id");
        assert_eq!(seen[0].body.as_deref(), Some(r#"{"title":"a"}"#));
        assert_eq!(seen[0].header("apikey"), Some("anon"));
        assert_eq!(seen[0].header("prefer"), Some("return=representation"));
        assert!(seen[0].header("content-length").is_none());
    }

    #[tokio::test]
    async fn test_host_error_passes_through_unchanged() {
        let host_error = BridgeResponse::new(
            "",
            409,
            Headers::from([("content-type".to_string(), "application/json".to_string())]),
            json!({"code": "23505", "message": "duplicate key value"}),
        );
        let transport = Arc::new(ScriptedTransport::connected().then(Ok(host_error)));
        let (app, _) = app(transport);

        let response = app
            .oneshot(Request::post("/rest/v1/items").body(Body::from("{}")).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(
            body_bytes(response).await,
            br#"{"code":"23505","message":"duplicate key value"}"#.to_vec()
        );
    }

    #[tokio::test]
    async fn test_binary_response_is_decoded() {
        let payload: Vec<u8> = (0..=255u8).rev().collect();
        let transport = Arc::new(ScriptedTransport::connected().then(Ok(
            BridgeResponse::binary("", 200, Headers::new(), &payload),
        )));
        let (app, _) = app(transport);

        let response = app
            .oneshot(Request::get("/storage/v1/object/a.bin").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(response.headers().get("x-content-encoding").is_none());
        assert_eq!(body_bytes(response).await, payload);
    }

    #[tokio::test]
    async fn test_bridge_failures_become_envelopes() {
        let transport = Arc::new(
            ScriptedTransport::connected()
                .then(Err(BridgeError::connection("no host connected")))
                .then(Err(BridgeError::Timeout(Duration::from_secs(30)))),
        );
        let (app, _) = app(transport);

        let response = app
            .clone()
            .oneshot(Request::post("/rest/v1/items").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = body_json(response).await;
        assert_eq!(body["error"], "no host connected");
        assert_eq!(body["path"], "/rest/v1/items");
        assert_eq!(body["method"], "POST");

        let response = app
            .oneshot(Request::get("/slow").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(body_json(response).await["code"], "TIMEOUT");
    }

    #[tokio::test]
    async fn test_connects_once_before_failing() {
        let transport = Arc::new(ScriptedTransport {
            refuse_connect: true,
            ..ScriptedTransport::default()
        });
        let (app, _) = app(transport.clone());

        let response = app
            .oneshot(Request::get("/x").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body_json(response).await["code"], "CONNECTION_ERROR");
        assert_eq!(transport.connects.load(Ordering::SeqCst), 1);
        assert!(transport.seen().is_empty());
    }

    #[tokio::test]
    async fn test_options_answered_locally() {
        let transport = Arc::new(ScriptedTransport::connected());
        let (app, _) = app(transport.clone());

        let plain = app
            .clone()
            .oneshot(
                Request::options("/rest/v1/items")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(plain.status(), StatusCode::NO_CONTENT);

        let preflight = app
            .oneshot(
                Request::options("/rest/v1/items")
                    .header(header::ORIGIN, "https://app.example.com")
                    .header(header::ACCESS_CONTROL_REQUEST_METHOD, "PATCH")
                    .header(header::ACCESS_CONTROL_REQUEST_HEADERS, "apikey,prefer")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(preflight.status().is_success());
        let headers = preflight.headers();
        assert_eq!(
            headers.get(header::ACCESS_CONTROL_ALLOW_ORIGIN).unwrap(),
            "https://app.example.com"
        );
        assert_eq!(
            headers.get(header::ACCESS_CONTROL_ALLOW_CREDENTIALS).unwrap(),
            "true"
        );
        assert!(transport.seen().is_empty());
    }

    #[tokio::test]
    async fn test_unsupported_method_is_rejected() {
        let transport = Arc::new(ScriptedTransport::connected());
        let (app, _) = app(transport.clone());

        let response = app
            .oneshot(
                Request::builder()
                    .method("TRACE")
                    .uri("/x")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(body_json(response).await["code"], "METHOD_NOT_ALLOWED");
        assert!(transport.seen().is_empty());
    }

    #[tokio::test]
    async fn test_oversized_body_is_rejected() {
        let transport = Arc::new(ScriptedTransport::connected());
        let config = GatewayConfig {
            max_body_bytes: 16,
            ..GatewayConfig::default()
        };
        let (app, _) = app_with(transport.clone(), config);

        let response = app
            .oneshot(
                Request::post("/upload")
                    .body(Body::from(vec![b'a'; 64]))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(body_json(response).await["code"], "PAYLOAD_TOO_LARGE");
        assert!(transport.seen().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_admin_route_is_not_found() {
        let transport = Arc::new(ScriptedTransport::connected());
        let (app, _) = app(transport.clone());

        let response = app
            .oneshot(Request::get("/__tabrelay/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["path"], "/__tabrelay/nope");
        assert!(transport.seen().is_empty());
    }

    #[tokio::test]
    async fn test_completion_signal_is_forwarded_and_marks_completion() {
        let transport = Arc::new(ScriptedTransport::connected());
        let (app, completed) = app(transport.clone());

        let response = app
            .oneshot(
                Request::post(COMPLETE_PATH)
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"command":"db push"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["delivered"], true);
        assert!(completed.is_cancelled());

        let seen = transport.seen();
        assert_eq!(seen[0].url, COMPLETE_PATH);
        assert_eq!(seen[0].header(ADMIN_HEADER), Some("complete"));
    }

    #[tokio::test]
    async fn test_completion_is_marked_even_when_host_is_gone() {
        let transport = Arc::new(
            ScriptedTransport::connected().then(Err(BridgeError::connection("no host connected"))),
        );
        let (app, completed) = app(transport);

        let response = app
            .oneshot(Request::post(COMPLETE_PATH).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["delivered"], false);
        assert!(completed.is_cancelled());
    }

    #[test]
    fn test_websocket_mode_needs_a_hub() {
        assert!(Gateway::from_config(GatewayConfig::default(), "/ws").is_err());

        let gateway = Gateway::from_config(
            GatewayConfig {
                target_url: Some("https://demo.example.com".to_string()),
                ..GatewayConfig::default()
            },
            "/ws",
        )
        .unwrap();
        assert_eq!(gateway.transport().mode(), ConnectionMode::WebSocket);

        let gateway = Gateway::from_config(
            GatewayConfig {
                mode: Some(ConnectionMode::PostMessage),
                ..GatewayConfig::default()
            },
            "/ws",
        )
        .unwrap();
        assert_eq!(gateway.transport().mode(), ConnectionMode::PostMessage);
    }

    #[test]
    fn test_derived_hub_url_uses_hub_path() {
        let config = GatewayConfig {
            target_url: Some("https://demo.example.com".to_string()),
            ..GatewayConfig::default()
        };
        assert_eq!(
            resolve_hub_url(&config, "/bridge/ws").unwrap(),
            "wss://demo.example.com/bridge/ws"
        );

        let explicit = GatewayConfig {
            hub_url: Some("ws://127.0.0.1:5176/ws".to_string()),
            ..config
        };
        assert_eq!(
            resolve_hub_url(&explicit, "/bridge/ws").unwrap(),
            "ws://127.0.0.1:5176/ws"
        );
    }
}
