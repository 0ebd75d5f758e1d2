//! Relay lifecycle management.
//!
//! Decides whether a target needs a relay, starts one on demand, waits for
//! it to report healthy and tears it down once the caller is done. Each
//! target owns one slot; concurrent callers for the same target serialize on
//! that slot and converge on a single relay.
//!
//! Record lifecycle: `Starting → Ready → Stopping → Terminated`.

mod launcher;
mod target;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::{debug, info, warn};
use serde::Serialize;
use serde_json::json;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

use crate::config::ProxyConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::gateway::COMPLETE_PATH;
use crate::transport::ConnectionMode;

pub use launcher::{ChildRelay, LaunchSpec, ProcessLauncher, RelayLauncher, RelayProcess};
pub use target::{allocate_port, hub_url_for_target, is_proxy_needed, normalize_target};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayState {
    Starting,
    Ready,
    Stopping,
    Terminated,
}

/// Snapshot of one relay.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayProcessRecord {
    pub target_url: String,
    pub local_port: u16,
    pub local_url: String,
    pub hub_url: String,
    pub pid: Option<u32>,
    pub state: RelayState,
    pub started_at: DateTime<Utc>,
}

#[derive(Default)]
struct RelaySlot {
    /// Held for the whole of a start or stop.
    transition: Mutex<()>,
    record: RwLock<Option<RelayProcessRecord>>,
    process: Mutex<Option<Box<dyn RelayProcess>>>,
}

impl RelaySlot {
    async fn set_state(&self, state: RelayState) {
        if let Some(record) = self.record.write().await.as_mut() {
            record.state = state;
        }
    }

    async fn clear(&self) {
        *self.record.write().await = None;
        *self.process.lock().await = None;
    }
}

pub struct ProxyManager {
    config: ProxyConfig,
    mode: ConnectionMode,
    launcher: Arc<dyn RelayLauncher>,
    slots: DashMap<String, Arc<RelaySlot>>,
    client: reqwest::Client,
}

impl ProxyManager {
    pub fn new(config: ProxyConfig, launcher: Arc<dyn RelayLauncher>) -> Self {
        Self {
            config,
            mode: ConnectionMode::WebSocket,
            launcher,
            slots: DashMap::new(),
            client: reqwest::Client::new(),
        }
    }

    /// Transport mode handed to launched relays.
    pub fn with_mode(mut self, mode: ConnectionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn is_proxy_needed(&self, target: &str) -> bool {
        is_proxy_needed(target, &self.config.local_hosts)
    }

    /// URL to use for `target`: the target itself when it is local, otherwise
    /// the local URL of a ready relay, starting one if needed.
    pub async fn ensure_proxy(&self, target: &str) -> BridgeResult<String> {
        if !self.is_proxy_needed(target) {
            debug!("{target} is local; no relay needed");
            return Ok(target.to_string());
        }

        let key = normalize_target(target);
        loop {
            let slot = self.slots.entry(key.clone()).or_default().clone();
            let _transition = slot.transition.lock().await;
            // The slot may have been retired while we waited for it.
            if !self.is_current(&key, &slot) {
                continue;
            }

            return match self.ensure_in_slot(&key, &slot).await {
                Ok(url) => Ok(url),
                Err(e) => {
                    slot.clear().await;
                    self.remove_slot(&key, &slot);
                    Err(e)
                }
            };
        }
    }

    /// Reuse the slot's relay if it is ready and alive, otherwise start one.
    /// Caller holds the slot's transition lock.
    async fn ensure_in_slot(&self, key: &str, slot: &RelaySlot) -> BridgeResult<String> {
        let existing = slot.record.read().await.clone();
        if let Some(record) = existing {
            let alive = slot
                .process
                .lock()
                .await
                .as_mut()
                .is_some_and(|process| process.is_running());
            if record.state == RelayState::Ready && alive {
                debug!("reusing relay for {key} at {}", record.local_url);
                return Ok(record.local_url);
            }
            warn!(
                "discarding {:?} relay record for {key} (process running: {alive})",
                record.state
            );
            if let Some(mut process) = slot.process.lock().await.take() {
                let _ = process.terminate().await;
            }
            slot.clear().await;
        }

        let hub_url = hub_url_for_target(key, &self.config.hub_path)?;
        let port = allocate_port()?;
        let local_url = format!("http://127.0.0.1:{port}");
        *slot.record.write().await = Some(RelayProcessRecord {
            target_url: key.to_string(),
            local_port: port,
            local_url: local_url.clone(),
            hub_url: hub_url.clone(),
            pid: None,
            state: RelayState::Starting,
            started_at: Utc::now(),
        });

        let spec = LaunchSpec {
            target_url: key.to_string(),
            hub_url,
            port,
            mode: self.mode,
        };
        let mut process = self.launcher.launch(&spec).await?;
        if let Err(e) = self.wait_until_ready(&local_url, process.as_mut()).await {
            let _ = process.terminate().await;
            return Err(e);
        }

        let pid = process.pid();
        *slot.process.lock().await = Some(process);
        if let Some(record) = slot.record.write().await.as_mut() {
            record.pid = pid;
            record.state = RelayState::Ready;
        }
        info!("relay for {key} ready at {local_url}");
        Ok(local_url)
    }

    /// Poll `/health` with a growing backoff until it answers or the startup timeout passes.
    async fn wait_until_ready(
        &self,
        local_url: &str,
        process: &mut dyn RelayProcess,
    ) -> BridgeResult<()> {
        let timeout = self.config.startup_timeout();
        let poll = self.config.health_poll_interval();
        let deadline = Instant::now() + timeout;
        let health_url = format!("{local_url}/health");
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            if !process.is_running() {
                return Err(BridgeError::lifecycle(format!(
                    "relay at {local_url} exited during startup"
                )));
            }

            match self
                .client
                .get(&health_url)
                .timeout(poll.max(Duration::from_millis(500)))
                .send()
                .await
            {
                Ok(resp) if resp.status().is_success() => {
                    debug!("relay at {local_url} healthy after {attempts} attempt(s)");
                    return Ok(());
                }
                Ok(resp) => debug!("relay health returned {} (attempt {attempts})", resp.status()),
                Err(e) => debug!("relay not ready yet (attempt {attempts}): {e}"),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(BridgeError::lifecycle(format!(
                    "relay at {local_url} not ready within {}s",
                    timeout.as_secs()
                )));
            }
            let backoff = poll * attempts.min(20);
            tokio::time::sleep(backoff.min(deadline - now)).await;
        }
    }

    /// Tell the host the command finished, then stop the relay for `target`.
    ///
    /// The relay is terminated even when the signal cannot be delivered; the
    /// signal gets at most `completion_grace_secs`. Returns whether the
    /// signal went through.
    pub async fn send_completion_signal_and_exit(&self, target: &str) -> BridgeResult<bool> {
        let key = normalize_target(target);
        let Some(slot) = self.slots.get(&key).map(|entry| entry.value().clone()) else {
            debug!("no relay for {key}; nothing to complete");
            return Ok(false);
        };

        let _transition = slot.transition.lock().await;
        let Some(record) = slot.record.read().await.clone() else {
            self.remove_slot(&key, &slot);
            return Ok(false);
        };
        slot.set_state(RelayState::Stopping).await;

        let delivered = self.signal_completion(&record).await;
        self.terminate_slot(&key, &slot).await;
        Ok(delivered)
    }

    async fn signal_completion(&self, record: &RelayProcessRecord) -> bool {
        let grace = self.config.completion_grace();
        let url = format!("{}{COMPLETE_PATH}", record.local_url);
        let send = self
            .client
            .post(&url)
            .json(&json!({ "targetUrl": record.target_url }))
            .send();

        match tokio::time::timeout(grace, send).await {
            Ok(Ok(resp)) if resp.status().is_success() => {
                let delivered = resp
                    .json::<serde_json::Value>()
                    .await
                    .ok()
                    .and_then(|body| body.get("delivered").and_then(serde_json::Value::as_bool))
                    .unwrap_or(false);
                if !delivered {
                    warn!("relay for {} could not reach the host", record.target_url);
                }
                delivered
            }
            Ok(Ok(resp)) => {
                warn!("completion signal rejected with {}", resp.status());
                false
            }
            Ok(Err(e)) => {
                warn!("completion signal failed: {e}");
                false
            }
            Err(_) => {
                warn!("completion signal timed out after {grace:?}; forcing exit");
                false
            }
        }
    }

    async fn terminate_slot(&self, key: &str, slot: &Arc<RelaySlot>) {
        if let Some(mut process) = slot.process.lock().await.take()
            && let Err(e) = process.terminate().await
        {
            warn!("failed to terminate relay for {key}: {e}");
        }
        slot.set_state(RelayState::Terminated).await;
        info!("relay for {key} terminated");
        slot.clear().await;
        self.remove_slot(key, slot);
    }

    fn is_current(&self, key: &str, slot: &Arc<RelaySlot>) -> bool {
        self.slots
            .get(key)
            .is_some_and(|entry| Arc::ptr_eq(entry.value(), slot))
    }

    fn remove_slot(&self, key: &str, slot: &Arc<RelaySlot>) {
        self.slots
            .remove_if(key, |_, current| Arc::ptr_eq(current, slot));
    }

    /// Snapshot of every tracked relay, ordered by target.
    pub async fn get_running_proxies(&self) -> Vec<RelayProcessRecord> {
        let slots: Vec<Arc<RelaySlot>> = self
            .slots
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        let mut records = Vec::with_capacity(slots.len());
        for slot in slots {
            if let Some(record) = slot.record.read().await.clone() {
                records.push(record);
            }
        }
        records.sort_by(|a, b| a.target_url.cmp(&b.target_url));
        records
    }

    /// Stop every relay without sending completion signals.
    pub async fn shutdown_all(&self) {
        let slots: Vec<(String, Arc<RelaySlot>)> = self
            .slots
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        for (key, slot) in slots {
            let _transition = slot.transition.lock().await;
            slot.set_state(RelayState::Stopping).await;
            self.terminate_slot(&key, &slot).await;
        }
    }
}
