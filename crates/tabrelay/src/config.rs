//! Configuration loading.
//!
//! Layers built-in defaults, an optional TOML file and `TABRELAY__*`
//! environment variables (double underscore separates sections, e.g.
//! `TABRELAY__HUB__PORT=5176`).

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::transport::ConnectionMode;

pub const APP_NAME: &str = "tabrelay";

/// Default port the hub listens on.
pub const DEFAULT_HUB_PORT: u16 = 5176;

/// Default port for a foreground gateway.
pub const DEFAULT_GATEWAY_PORT: u16 = 54321;

/// Default request body limit.
pub const DEFAULT_MAX_BODY_BYTES: usize = 50 * 1024 * 1024;

/// Default WebSocket message and frame limit for every bridge socket.
///
/// A body of [`DEFAULT_MAX_BODY_BYTES`] grows by a third under base64 and
/// still has to fit alongside its headers and the JSON envelope.
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 96 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub profile: String,
    pub logging: LoggingConfig,
    pub hub: HubConfig,
    pub gateway: GatewayConfig,
    pub proxy: ProxyConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            profile: "default".to_string(),
            logging: LoggingConfig::default(),
            hub: HubConfig::default(),
            gateway: GatewayConfig::default(),
            proxy: ProxyConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

/// Hub (WebSocket endpoint) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Address to bind to.
    pub host: String,
    /// Port to listen on.
    pub port: u16,
    /// Seconds before a forwarded request is dropped from the routing table.
    pub request_timeout_secs: u64,
    /// Seconds between WebSocket ping frames.
    pub ping_interval_secs: u64,
    /// Infer roles from the first typed payload when no identify frame was sent.
    pub allow_role_inference: bool,
    /// When set, the host role requires an identify frame carrying this token.
    pub host_token: Option<String>,
    /// Largest WebSocket message accepted from any connection.
    pub max_message_bytes: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_HUB_PORT,
            request_timeout_secs: 30,
            ping_interval_secs: 30,
            allow_role_inference: true,
            host_token: None,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
        }
    }
}

impl HubConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs.max(1))
    }
}

/// HTTP gateway (relay) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Address to bind to.
    pub host: String,
    /// Port to listen on (0 picks an ephemeral port).
    pub port: u16,
    /// Hub WebSocket URL. Derived from `target_url` when unset.
    pub hub_url: Option<String>,
    /// The instance this gateway fronts, reported by `/health`.
    pub target_url: Option<String>,
    /// Transport mode; websocket when unset.
    pub mode: Option<ConnectionMode>,
    /// Seconds to wait for the host to answer a request.
    pub request_timeout_secs: u64,
    /// Largest request body accepted, in bytes.
    pub max_body_bytes: usize,
    /// Largest encoded bridge message sent to or accepted from the hub.
    pub max_message_bytes: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_GATEWAY_PORT,
            hub_url: None,
            target_url: None,
            mode: None,
            request_timeout_secs: 30,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
        }
    }
}

impl GatewayConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }
}

/// Relay lifecycle settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Path of the hub WebSocket endpoint on a target.
    pub hub_path: String,
    /// Extra hostnames treated as local development targets.
    pub local_hosts: Vec<String>,
    /// Seconds to wait for a relay to report healthy.
    pub startup_timeout_secs: u64,
    /// Base backoff between health polls, in milliseconds.
    pub health_poll_interval_ms: u64,
    /// Seconds the completion signal may take before the relay is killed anyway.
    pub completion_grace_secs: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            hub_path: "/ws".to_string(),
            local_hosts: Vec::new(),
            startup_timeout_secs: 15,
            health_poll_interval_ms: 100,
            completion_grace_secs: 3,
        }
    }
}

impl ProxyConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn health_poll_interval(&self) -> Duration {
        Duration::from_millis(self.health_poll_interval_ms.max(10))
    }

    pub fn completion_grace(&self) -> Duration {
        Duration::from_secs(self.completion_grace_secs)
    }
}

/// Load configuration from `path` (optional) and the environment.
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let built = Config::builder()
        .set_default("profile", "default")?
        .set_default("logging.level", "info")?
        .add_source(
            File::from(path)
                .format(FileFormat::Toml)
                .required(false),
        )
        .add_source(Environment::with_prefix(&env_prefix()).separator("__"))
        .build()
        .with_context(|| format!("loading config from {}", path.display()))?;

    built
        .try_deserialize()
        .with_context(|| format!("parsing config from {}", path.display()))
}

/// Write the default configuration to `path`, creating parent directories.
pub fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }

    let config = AppConfig::default();
    let toml = toml::to_string_pretty(&config).context("serializing default config to TOML")?;
    let mut body = String::new();
    body.push_str("# Configuration for ");
    body.push_str(APP_NAME);
    body.push('\n');
    body.push_str("# File: ");
    body.push_str(&path.display().to_string());
    body.push_str("\n\n");
    body.push_str(&toml);
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

pub fn env_prefix() -> String {
    APP_NAME
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}
