//! HTTP surface of the hub: the WebSocket endpoint and a health check.

use axum::{
    Json, Router,
    body::Bytes,
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde_json::json;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;

use super::Hub;
use crate::transport::CONNECTION_BUFFER_SIZE;

pub fn router(hub: Hub) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(hub)
}

/// GET /health
async fn health(State(hub): State<Hub>) -> Response {
    let Some(status) = hub.status().await else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "stopping" })),
        )
            .into_response();
    };

    Json(json!({
        "status": "healthy",
        "hostConnected": status.host_connected,
        "relays": status.relays,
        "connections": status.connections,
        "pending": status.pending,
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
    .into_response()
}

/// GET /ws
async fn ws_handler(State(hub): State<Hub>, ws: WebSocketUpgrade) -> Response {
    let limit = hub.max_message_bytes();
    ws.max_message_size(limit)
        .max_frame_size(limit)
        .on_upgrade(move |socket| handle_socket(socket, hub))
}

async fn handle_socket(socket: WebSocket, hub: Hub) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<String>(CONNECTION_BUFFER_SIZE);

    let Some(conn) = hub.connect(tx).await else {
        warn!("hub is shutting down; refusing connection");
        let _ = sender.send(Message::Close(None)).await;
        return;
    };

    let period = hub.ping_interval();
    let mut send_task = tokio::spawn(async move {
        let mut ping = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            tokio::select! {
                frame = rx.recv() => {
                    // The hub dropped this connection or is shutting down.
                    let Some(text) = frame else {
                        let _ = sender.send(Message::Close(None)).await;
                        break;
                    };
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = ping.tick() => {
                    if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    loop {
        let frame = tokio::select! {
            frame = receiver.next() => frame,
            _ = &mut send_task => break,
        };
        let Some(frame) = frame else { break };
        match frame {
            Ok(Message::Text(text)) => hub.message(conn, text.to_string()).await,
            Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                Ok(text) => hub.message(conn, text).await,
                Err(_) => debug!("connection {conn} sent a non UTF-8 binary frame; ignoring"),
            },
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Ok(Message::Close(_)) => {
                debug!("connection {conn} sent close");
                break;
            }
            Err(e) => {
                warn!("websocket error on connection {conn}: {e}");
                break;
            }
        }
    }

    send_task.abort();
    hub.close(conn).await;
    info!("connection {conn} closed");
}
