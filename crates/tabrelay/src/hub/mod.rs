//! Connection hub.
//!
//! One supervisor task owns every connection record, the host slot and the
//! routing table. Socket tasks report to it through [`HubEvent`]s and never
//! touch that state directly.

mod handler;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use log::{debug, info};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::HubConfig;

pub use handler::router;
pub use state::{ConnId, HubState, HubStatus, Role, Route};

/// Depth of the supervisor's event queue.
const EVENT_BUFFER_SIZE: usize = 1024;

/// How often expired routes are swept.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug)]
pub enum HubEvent {
    Connected {
        conn: ConnId,
        outbound: mpsc::Sender<String>,
    },
    Message {
        conn: ConnId,
        raw: String,
    },
    Closed {
        conn: ConnId,
    },
    Status {
        reply: oneshot::Sender<HubStatus>,
    },
}

/// Cheap handle to a running hub supervisor.
#[derive(Clone)]
pub struct Hub {
    events: mpsc::Sender<HubEvent>,
    next_conn: Arc<AtomicU64>,
    ping_interval: Duration,
    max_message_bytes: usize,
}

impl Hub {
    /// Spawn the supervisor. It stops when `shutdown` is cancelled or every handle is dropped.
    pub fn spawn(config: &HubConfig, shutdown: CancellationToken) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER_SIZE);
        let state = HubState::new(config);
        let task = tokio::spawn(supervise(state, rx, shutdown));
        let hub = Self {
            events: tx,
            next_conn: Arc::new(AtomicU64::new(1)),
            ping_interval: config.ping_interval(),
            max_message_bytes: config.max_message_bytes,
        };
        (hub, task)
    }

    pub fn ping_interval(&self) -> Duration {
        self.ping_interval
    }

    pub fn max_message_bytes(&self) -> usize {
        self.max_message_bytes
    }

    /// Register a socket and get its id.
    pub async fn connect(&self, outbound: mpsc::Sender<String>) -> Option<ConnId> {
        let conn = self.next_conn.fetch_add(1, Ordering::Relaxed);
        self.events
            .send(HubEvent::Connected { conn, outbound })
            .await
            .ok()?;
        Some(conn)
    }

    pub async fn message(&self, conn: ConnId, raw: String) {
        let _ = self.events.send(HubEvent::Message { conn, raw }).await;
    }

    pub async fn close(&self, conn: ConnId) {
        let _ = self.events.send(HubEvent::Closed { conn }).await;
    }

    pub async fn status(&self) -> Option<HubStatus> {
        let (reply, rx) = oneshot::channel();
        self.events.send(HubEvent::Status { reply }).await.ok()?;
        rx.await.ok()
    }
}

async fn supervise(
    mut state: HubState,
    mut events: mpsc::Receiver<HubEvent>,
    shutdown: CancellationToken,
) {
    let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    HubEvent::Connected { conn, outbound } => state.on_connect(conn, outbound),
                    HubEvent::Message { conn, raw } => state.on_message(conn, &raw),
                    HubEvent::Closed { conn } => state.on_close(conn),
                    HubEvent::Status { reply } => {
                        let _ = reply.send(state.status());
                    }
                }
            }
            _ = sweep.tick() => {
                let expired = state.sweep(tokio::time::Instant::now());
                if expired > 0 {
                    debug!("swept {expired} expired route(s)");
                }
            }
            _ = shutdown.cancelled() => break,
        }
    }
    info!("hub supervisor stopped");
}

/// A hub bound to a socket.
pub struct HubServer {
    local_addr: SocketAddr,
    hub: Hub,
    shutdown: CancellationToken,
    server: JoinHandle<()>,
    supervisor: JoinHandle<()>,
}

impl HubServer {
    /// Bind `config.host:config.port` and start serving `/ws` and `/health`.
    pub async fn start(config: &HubConfig) -> Result<Self> {
        let addr = format!("{}:{}", config.host, config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("binding hub to {addr}"))?;
        Self::serve(listener, config).await
    }

    /// Serve on an already bound listener.
    pub async fn serve(listener: TcpListener, config: &HubConfig) -> Result<Self> {
        let local_addr = listener.local_addr().context("reading hub address")?;
        let shutdown = CancellationToken::new();
        let (hub, supervisor) = Hub::spawn(config, shutdown.clone());
        let app = router(hub.clone());

        let stop = shutdown.clone();
        let server = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(async move { stop.cancelled().await })
                .await
            {
                log::error!("hub server error: {e}");
            }
        });

        info!("hub listening on ws://{local_addr}/ws");
        Ok(Self {
            local_addr,
            hub,
            shutdown,
            server,
            supervisor,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// WebSocket URL clients connect to.
    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.local_addr)
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }

    /// Resolves once a stop has been requested through the shutdown token.
    pub async fn stopped(&self) {
        self.shutdown.cancelled().await;
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub async fn stop(self) {
        self.shutdown.cancel();
        let _ = self.server.await;
        let _ = self.supervisor.await;
    }
}
