//! Connection records, the host slot and the routing table.
//!
//! Owned by the hub supervisor task; every method runs to completion without
//! awaiting, so the three pieces of shared state never race.

use std::collections::HashMap;
use std::time::Duration;

use log::{debug, info, warn};
use serde::Serialize;
use tabrelay_protocol::encoding::remove_header;
use tabrelay_protocol::{
    BRIDGE_ERROR_HEADER, BridgeFailure, BridgeMessage, BridgeRequest, BridgeResponse, ClientRole,
    Identify,
};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::Instant;

use crate::config::HubConfig;
use crate::correlation::{CorrelationTable, PendingRequest};

pub type ConnId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Unknown,
    Host,
    Relay,
}

#[derive(Debug)]
struct ConnectionRecord {
    outbound: mpsc::Sender<String>,
    role: Role,
    /// Role came from an identify frame rather than inference.
    explicit: bool,
}

/// Where a forwarded request came from and which host it went to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub relay: ConnId,
    pub host: ConnId,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HubStatus {
    pub host_connected: bool,
    pub relays: usize,
    pub connections: usize,
    pub pending: usize,
}

pub struct HubState {
    connections: HashMap<ConnId, ConnectionRecord>,
    host: Option<ConnId>,
    routes: CorrelationTable<Route>,
    request_timeout: Duration,
    allow_role_inference: bool,
    host_token: Option<String>,
}

impl HubState {
    pub fn new(config: &HubConfig) -> Self {
        Self {
            connections: HashMap::new(),
            host: None,
            routes: CorrelationTable::new(),
            request_timeout: config.request_timeout(),
            allow_role_inference: config.allow_role_inference,
            host_token: config.host_token.clone(),
        }
    }

    pub fn on_connect(&mut self, conn: ConnId, outbound: mpsc::Sender<String>) {
        debug!("connection {conn} opened");
        self.connections.insert(
            conn,
            ConnectionRecord {
                outbound,
                role: Role::Unknown,
                explicit: false,
            },
        );
    }

    pub fn on_message(&mut self, conn: ConnId, raw: &str) {
        if !self.connections.contains_key(&conn) {
            debug!("message from unknown connection {conn} dropped");
            return;
        }

        match BridgeMessage::parse(raw) {
            Ok(BridgeMessage::Identify(identify)) => self.handle_identify(conn, identify),
            Ok(BridgeMessage::Request(request)) => self.handle_request(conn, raw, request),
            Ok(BridgeMessage::Response(response)) => self.handle_response(conn, raw, response),
            Err(e) => {
                warn!("connection {conn} sent an invalid frame: {e}");
                // A request we cannot read still deserves an answer if it has an id.
                if let Some(id) = request_id_of(raw) {
                    self.reply_failure(
                        conn,
                        BridgeResponse::failure(
                            id,
                            BridgeFailure::Serialization,
                            400,
                            format!("invalid request: {e}"),
                        ),
                    );
                }
            }
        }
    }

    pub fn on_close(&mut self, conn: ConnId) {
        let Some(record) = self.connections.remove(&conn) else {
            return;
        };

        if self.host == Some(conn) {
            self.host = None;
            info!("host {conn} disconnected");
        } else {
            debug!("connection {conn} ({:?}) closed", record.role);
        }

        // Routes addressed to this connection, whether current or orphaned host.
        let stranded = self.routes.drain_where(|entry| entry.waiter.host == conn);
        if !stranded.is_empty() {
            warn!(
                "failing {} in-flight request(s) addressed to host {conn}",
                stranded.len()
            );
        }
        self.fail_stranded(stranded);

        // Requests from a departed relay have no caller left.
        let orphaned = self.routes.drain_where(|entry| entry.waiter.relay == conn);
        if !orphaned.is_empty() {
            debug!(
                "dropped {} route(s) for departed relay {conn}",
                orphaned.len()
            );
        }
    }

    /// Drop routes whose deadline has passed. The relay owns the caller-facing timeout.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let expired = self.routes.drain_expired(now);
        for entry in &expired {
            debug!(
                "route {} expired after {:?}",
                entry.id,
                now - entry.created_at
            );
        }
        expired.len()
    }

    pub fn status(&self) -> HubStatus {
        HubStatus {
            host_connected: self.host.is_some(),
            relays: self
                .connections
                .values()
                .filter(|record| record.role == Role::Relay)
                .count(),
            connections: self.connections.len(),
            pending: self.routes.len(),
        }
    }

    pub fn role_of(&self, conn: ConnId) -> Option<Role> {
        self.connections.get(&conn).map(|record| record.role)
    }

    pub fn current_host(&self) -> Option<ConnId> {
        self.host
    }

    fn handle_identify(&mut self, conn: ConnId, identify: Identify) {
        let Some(record) = self.connections.get(&conn) else {
            return;
        };
        let wanted = match identify.client {
            ClientRole::Host => Role::Host,
            ClientRole::Relay => Role::Relay,
        };

        if record.explicit {
            if record.role != wanted {
                warn!(
                    "connection {conn} already identified as {:?}; ignoring identify as {}",
                    record.role, identify.client
                );
            }
            return;
        }

        if wanted == Role::Host
            && let Some(expected) = &self.host_token
            && identify.token.as_deref() != Some(expected.as_str())
        {
            warn!("connection {conn} presented an invalid host token");
            return;
        }

        let previous = record.role;
        if previous != Role::Unknown && previous != wanted {
            info!("connection {conn} re-identified from inferred {previous:?} to {wanted:?}");
            if previous == Role::Host {
                self.vacate_host(conn);
            }
        }

        self.assign(conn, wanted, true);
    }

    fn handle_request(&mut self, conn: ConnId, raw: &str, request: BridgeRequest) {
        let role = match self.role_of(conn) {
            Some(Role::Unknown) if self.allow_role_inference => {
                self.assign(conn, Role::Relay, false);
                Role::Relay
            }
            Some(role) => role,
            None => return,
        };

        match role {
            Role::Relay => {}
            Role::Unknown => {
                self.reply_failure(
                    conn,
                    BridgeResponse::failure(
                        &request.id,
                        BridgeFailure::Serialization,
                        400,
                        "identify as a relay before sending requests",
                    ),
                );
                return;
            }
            Role::Host => {
                warn!("host {conn} sent a request; dropping {}", request.id);
                return;
            }
        }

        let Some(host) = self.host else {
            debug!("no host for request {} from relay {conn}", request.id);
            let failure = BridgeResponse::failure(
                &request.id,
                BridgeFailure::Connection,
                503,
                "no host connected",
            );
            self.reply_failure(conn, failure);
            return;
        };

        let route = Route { relay: conn, host };
        if self
            .routes
            .insert(request.id.clone(), route, self.request_timeout)
            .is_err()
        {
            warn!(
                "duplicate in-flight request id {} from relay {conn}",
                request.id
            );
            self.reply_failure(
                conn,
                BridgeResponse::failure(
                    &request.id,
                    BridgeFailure::Serialization,
                    409,
                    format!("request id {} is already in flight", request.id),
                ),
            );
            return;
        }

        // Forward the frame verbatim.
        if !self.send(host, raw.to_string()) {
            self.routes.take(&request.id);
            let failure = BridgeResponse::failure(
                &request.id,
                BridgeFailure::Connection,
                503,
                "host unavailable",
            );
            self.reply_failure(conn, failure);
            return;
        }
        debug!(
            "forwarded {} {} ({}) from relay {conn} to host {host}",
            request.method, request.url, request.id
        );
    }

    fn handle_response(&mut self, conn: ConnId, raw: &str, mut response: BridgeResponse) {
        let role = match self.role_of(conn) {
            Some(Role::Unknown) if self.allow_role_inference && self.host_token.is_none() => {
                self.assign(conn, Role::Host, false);
                Role::Host
            }
            Some(role) => role,
            None => return,
        };

        if role != Role::Host {
            warn!(
                "connection {conn} ({role:?}) sent a response for {}; dropping",
                response.id
            );
            return;
        }
        if self.host != Some(conn) {
            debug!("ignoring response {} from orphaned host {conn}", response.id);
            return;
        }

        let Some(entry) = self.routes.take_if(&response.id, |route| route.host == conn) else {
            debug!(
                "discarding response for unknown or expired id {}",
                response.id
            );
            return;
        };
        let relay = entry.waiter.relay;
        let id = response.id.clone();

        // Only the hub may mark a response as a bridge failure.
        let frame = if remove_header(&mut response.headers, BRIDGE_ERROR_HEADER) {
            warn!("host {conn} set reserved header {BRIDGE_ERROR_HEADER} on {id}; stripped");
            match BridgeMessage::Response(response).to_text() {
                Ok(text) => text,
                Err(e) => {
                    warn!("failed to re-encode response {id}: {e}");
                    let failure = BridgeResponse::failure(
                        &id,
                        BridgeFailure::Serialization,
                        500,
                        format!("invalid host response: {e}"),
                    );
                    self.reply_failure(relay, failure);
                    return;
                }
            }
        } else {
            if response.is_host_error() {
                debug!("host answered {id} with status {}", response.status);
            }
            raw.to_string()
        };

        if !self.send(relay, frame) {
            debug!("relay {relay} went away before response {id} arrived");
        }
    }

    fn assign(&mut self, conn: ConnId, role: Role, explicit: bool) {
        if role == Role::Host {
            if let Some(previous) = self.host
                && previous != conn
            {
                info!("host {conn} replaces host {previous}; previous host is now orphaned");
            }
            self.host = Some(conn);
        }
        if let Some(record) = self.connections.get_mut(&conn) {
            record.role = role;
            record.explicit = explicit;
        }
        info!(
            "connection {conn} is a {} ({})",
            match role {
                Role::Host => "host",
                Role::Relay => "relay",
                Role::Unknown => "client",
            },
            if explicit { "identified" } else { "inferred" }
        );
    }

    /// Release the host slot held by `conn` without closing it.
    fn vacate_host(&mut self, conn: ConnId) {
        if self.host == Some(conn) {
            self.host = None;
        }
        let stranded = self.routes.drain_where(|entry| entry.waiter.host == conn);
        self.fail_stranded(stranded);
    }

    fn fail_stranded(&self, stranded: Vec<PendingRequest<Route>>) {
        for entry in stranded {
            let failure = BridgeResponse::failure(
                &entry.id,
                BridgeFailure::Connection,
                503,
                "host disconnected",
            );
            self.reply_failure(entry.waiter.relay, failure);
        }
    }

    fn reply_failure(&self, conn: ConnId, failure: BridgeResponse) {
        match BridgeMessage::Response(failure).to_text() {
            Ok(text) => {
                self.send(conn, text);
            }
            Err(e) => warn!("failed to encode failure response: {e}"),
        }
    }

    /// Queue a frame without blocking. Returns false when it could not be queued.
    fn send(&self, conn: ConnId, text: String) -> bool {
        let Some(record) = self.connections.get(&conn) else {
            return false;
        };
        match record.outbound.try_send(text) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("outbound buffer full for connection {conn}; dropping frame");
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!("connection {conn} outbound channel closed");
                false
            }
        }
    }
}

/// The id of a frame that claims to be a request, if one can be read.
fn request_id_of(raw: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(raw).ok()?;
    if value.get("type").and_then(serde_json::Value::as_str) != Some("request") {
        return None;
    }
    value
        .get("id")
        .and_then(serde_json::Value::as_str)
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tabrelay_protocol::{BRIDGE_ERROR_HEADER, Headers};

    struct Client {
        conn: ConnId,
        rx: mpsc::Receiver<String>,
    }

    impl Client {
        fn next(&mut self) -> Option<BridgeMessage> {
            self.rx
                .try_recv()
                .ok()
                .map(|raw| BridgeMessage::parse(&raw).unwrap())
        }

        fn next_response(&mut self) -> BridgeResponse {
            match self.next() {
                Some(BridgeMessage::Response(resp)) => resp,
                other => panic!("expected response, got {other:?}"),
            }
        }

        fn next_request(&mut self) -> BridgeRequest {
            match self.next() {
                Some(BridgeMessage::Request(req)) => req,
                other => panic!("expected request, got {other:?}"),
            }
        }
    }

    fn connect(state: &mut HubState, conn: ConnId) -> Client {
        let (tx, rx) = mpsc::channel(16);
        state.on_connect(conn, tx);
        Client { conn, rx }
    }

    fn text(msg: BridgeMessage) -> String {
        msg.to_text().unwrap()
    }

    fn request(id: &str) -> String {
        text(BridgeMessage::Request(BridgeRequest::new(id, "GET", "/x")))
    }

    fn response(id: &str) -> String {
        text(BridgeMessage::Response(BridgeResponse::new(
            id,
            200,
            Headers::new(),
            json!({"ok": true}),
        )))
    }

    fn identify(role: ClientRole) -> String {
        text(BridgeMessage::identify(role))
    }

    #[test]
    fn test_request_without_host_fails_immediately() {
        let mut state = HubState::new(&HubConfig::default());
        let mut relay = connect(&mut state, 1);
        state.on_message(relay.conn, &identify(ClientRole::Relay));
        state.on_message(relay.conn, &request("r1"));

        let resp = relay.next_response();
        assert_eq!(resp.id, "r1");
        assert_eq!(resp.status, 503);
        assert_eq!(resp.bridge_failure(), Some(BridgeFailure::Connection));
        assert_eq!(state.status().pending, 0);
    }

    #[test]
    fn test_round_trip_routes_by_id() {
        let mut state = HubState::new(&HubConfig::default());
        let mut host = connect(&mut state, 1);
        let mut relay_a = connect(&mut state, 2);
        let mut relay_b = connect(&mut state, 3);
        state.on_message(host.conn, &identify(ClientRole::Host));
        state.on_message(relay_a.conn, &identify(ClientRole::Relay));
        state.on_message(relay_b.conn, &identify(ClientRole::Relay));

        state.on_message(relay_a.conn, &request("reqA"));
        state.on_message(relay_b.conn, &request("reqB"));
        assert_eq!(host.next_request().id, "reqA");
        assert_eq!(host.next_request().id, "reqB");
        assert_eq!(state.status().pending, 2);

        // Answer out of order.
        state.on_message(host.conn, &response("reqB"));
        state.on_message(host.conn, &response("reqA"));
        assert_eq!(relay_b.next_response().id, "reqB");
        assert_eq!(relay_a.next_response().id, "reqA");
        assert!(relay_a.next().is_none());
        assert!(relay_b.next().is_none());

        // Duplicate delivery is dropped.
        state.on_message(host.conn, &response("reqA"));
        assert!(relay_a.next().is_none());
        assert_eq!(state.status().pending, 0);
    }

    #[test]
    fn test_roles_are_inferred_from_first_payload() {
        let mut state = HubState::new(&HubConfig::default());
        let mut host = connect(&mut state, 1);
        let mut relay = connect(&mut state, 2);

        // An unsolicited response makes the sender the host; it is then discarded.
        state.on_message(host.conn, &response("stray"));
        assert_eq!(state.role_of(host.conn), Some(Role::Host));
        assert_eq!(state.current_host(), Some(host.conn));

        state.on_message(relay.conn, &request("r1"));
        assert_eq!(state.role_of(relay.conn), Some(Role::Relay));
        assert_eq!(host.next_request().id, "r1");

        state.on_message(host.conn, &response("r1"));
        assert_eq!(relay.next_response().id, "r1");
    }

    #[test]
    fn test_identify_overrides_inferred_role_once() {
        let mut state = HubState::new(&HubConfig::default());
        let mut conn = connect(&mut state, 1);

        state.on_message(conn.conn, &request("r1"));
        assert_eq!(state.role_of(conn.conn), Some(Role::Relay));
        assert_eq!(conn.next_response().status, 503);

        state.on_message(conn.conn, &identify(ClientRole::Host));
        assert_eq!(state.role_of(conn.conn), Some(Role::Host));
        assert_eq!(state.current_host(), Some(conn.conn));

        // Explicit roles are sticky.
        state.on_message(conn.conn, &identify(ClientRole::Relay));
        assert_eq!(state.role_of(conn.conn), Some(Role::Host));
    }

    #[test]
    fn test_new_host_orphans_previous() {
        let mut state = HubState::new(&HubConfig::default());
        let mut old_host = connect(&mut state, 1);
        let mut new_host = connect(&mut state, 2);
        let mut relay = connect(&mut state, 3);
        state.on_message(old_host.conn, &identify(ClientRole::Host));
        state.on_message(relay.conn, &identify(ClientRole::Relay));

        state.on_message(relay.conn, &request("before"));
        assert_eq!(old_host.next_request().id, "before");

        state.on_message(new_host.conn, &identify(ClientRole::Host));
        assert_eq!(state.current_host(), Some(new_host.conn));

        // The orphan's answer is ignored.
        state.on_message(old_host.conn, &response("before"));
        assert!(relay.next().is_none());

        state.on_message(relay.conn, &request("after"));
        assert_eq!(new_host.next_request().id, "after");
        assert!(old_host.next().is_none());

        // When the orphan finally leaves, requests still addressed to it fail.
        state.on_close(old_host.conn);
        let failure = relay.next_response();
        assert_eq!(failure.id, "before");
        assert_eq!(failure.bridge_failure(), Some(BridgeFailure::Connection));
        assert_eq!(state.current_host(), Some(new_host.conn));
    }

    #[test]
    fn test_host_disconnect_fails_in_flight_requests() {
        let mut state = HubState::new(&HubConfig::default());
        let mut host = connect(&mut state, 1);
        let mut relay = connect(&mut state, 2);
        state.on_message(host.conn, &identify(ClientRole::Host));
        state.on_message(relay.conn, &identify(ClientRole::Relay));

        state.on_message(relay.conn, &request("r1"));
        assert_eq!(host.next_request().id, "r1");

        state.on_close(host.conn);
        let resp = relay.next_response();
        assert_eq!(resp.id, "r1");
        assert_eq!(resp.status, 503);
        assert_eq!(resp.error_message(), Some("host disconnected"));
        assert!(!state.status().host_connected);
        assert_eq!(state.status().pending, 0);
    }

    #[test]
    fn test_duplicate_in_flight_id_is_rejected() {
        let mut state = HubState::new(&HubConfig::default());
        let mut host = connect(&mut state, 1);
        let mut relay = connect(&mut state, 2);
        state.on_message(host.conn, &identify(ClientRole::Host));
        state.on_message(relay.conn, &identify(ClientRole::Relay));

        state.on_message(relay.conn, &request("same"));
        state.on_message(relay.conn, &request("same"));
        assert_eq!(host.next_request().id, "same");
        assert!(host.next().is_none());

        let resp = relay.next_response();
        assert_eq!(resp.status, 409);
        assert_eq!(resp.header(BRIDGE_ERROR_HEADER), Some("serialization"));
    }

    #[test]
    fn test_host_token_gates_host_role() {
        let config = HubConfig {
            host_token: Some("s3cret".to_string()),
            ..HubConfig::default()
        };
        let mut state = HubState::new(&config);
        let impostor = connect(&mut state, 1);
        let real = connect(&mut state, 2);

        // Neither inference nor a wrong token grants the host role.
        state.on_message(impostor.conn, &response("x"));
        assert_eq!(state.role_of(impostor.conn), Some(Role::Unknown));
        let wrong = BridgeMessage::Identify(Identify {
            client: ClientRole::Host,
            token: Some("guess".to_string()),
        });
        state.on_message(impostor.conn, &text(wrong));
        assert_eq!(state.current_host(), None);

        let right = BridgeMessage::Identify(Identify {
            client: ClientRole::Host,
            token: Some("s3cret".to_string()),
        });
        state.on_message(real.conn, &text(right));
        assert_eq!(state.current_host(), Some(real.conn));
    }

    #[test]
    fn test_inference_can_be_disabled() {
        let config = HubConfig {
            allow_role_inference: false,
            ..HubConfig::default()
        };
        let mut state = HubState::new(&config);
        let mut conn = connect(&mut state, 1);

        state.on_message(conn.conn, &request("r1"));
        assert_eq!(state.role_of(conn.conn), Some(Role::Unknown));
        let resp = conn.next_response();
        assert_eq!(resp.bridge_failure(), Some(BridgeFailure::Serialization));
    }

    #[test]
    fn test_invalid_request_frame_gets_an_answer() {
        let mut state = HubState::new(&HubConfig::default());
        let mut relay = connect(&mut state, 1);
        state.on_message(relay.conn, r#"{"type":"request","id":"bad","method":7}"#);
        let resp = relay.next_response();
        assert_eq!(resp.id, "bad");
        assert_eq!(resp.bridge_failure(), Some(BridgeFailure::Serialization));

        // Unknown types are rejected without a reply.
        state.on_message(relay.conn, r#"{"type":"subscribe","id":"s"}"#);
        assert!(relay.next().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_expires_routes_and_late_response_is_dropped() {
        let config = HubConfig {
            request_timeout_secs: 5,
            ..HubConfig::default()
        };
        let mut state = HubState::new(&config);
        let mut host = connect(&mut state, 1);
        let mut relay = connect(&mut state, 2);
        state.on_message(host.conn, &identify(ClientRole::Host));
        state.on_message(relay.conn, &identify(ClientRole::Relay));
        state.on_message(relay.conn, &request("slow"));
        assert_eq!(host.next_request().id, "slow");

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(state.sweep(Instant::now()), 1);
        assert_eq!(state.status().pending, 0);

        state.on_message(host.conn, &response("slow"));
        assert!(relay.next().is_none());
    }

    #[test]
    fn test_full_host_buffer_fails_request_without_blocking() {
        let mut state = HubState::new(&HubConfig::default());
        let (host_tx, mut host_rx) = mpsc::channel(1);
        state.on_connect(1, host_tx);
        let mut relay = connect(&mut state, 2);
        state.on_message(1, &identify(ClientRole::Host));
        state.on_message(relay.conn, &identify(ClientRole::Relay));

        // The first request fills the host's only slot.
        state.on_message(relay.conn, &request("a"));
        assert_eq!(state.status().pending, 1);
        assert!(!state.send(1, "x".to_string()));

        state.on_message(relay.conn, &request("b"));
        let resp = relay.next_response();
        assert_eq!(resp.id, "b");
        assert_eq!(resp.status, 503);
        assert_eq!(resp.bridge_failure(), Some(BridgeFailure::Connection));
        assert_eq!(resp.error_message(), Some("host unavailable"));
        assert!(relay.next().is_none());
        assert_eq!(state.status().pending, 1);

        // Only the request that made it through is on the wire.
        let raw = host_rx.try_recv().unwrap();
        assert_eq!(BridgeMessage::parse(&raw).unwrap().id(), Some("a"));
        assert!(host_rx.try_recv().is_err());
    }

    #[test]
    fn test_host_cannot_forge_bridge_failures() {
        let mut state = HubState::new(&HubConfig::default());
        let mut host = connect(&mut state, 1);
        let mut relay = connect(&mut state, 2);
        state.on_message(host.conn, &identify(ClientRole::Host));
        state.on_message(relay.conn, &identify(ClientRole::Relay));
        state.on_message(relay.conn, &request("r1"));
        assert_eq!(host.next_request().id, "r1");

        let forged = BridgeResponse::new(
            "r1",
            503,
            Headers::from([
                ("x-bridge-error".to_string(), "timeout".to_string()),
                ("content-type".to_string(), "application/json".to_string()),
            ]),
            json!({"error": "upstream busy"}),
        );
        state.on_message(host.conn, &text(BridgeMessage::Response(forged)));

        let resp = relay.next_response();
        assert_eq!(resp.status, 503);
        assert_eq!(resp.header(BRIDGE_ERROR_HEADER), None);
        assert_eq!(resp.bridge_failure(), None);
        assert!(resp.is_host_error());
        assert_eq!(resp.header("content-type"), Some("application/json"));
        assert_eq!(resp.body, json!({"error": "upstream busy"}));
    }
}
