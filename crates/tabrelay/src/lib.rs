//! Tabrelay Library
//!
//! Lets local tooling call a backend that only exists inside a browser tab.
//! A hub pairs the tab (the host) with relays, a gateway exposes the bridge
//! as plain HTTP, and the proxy manager starts and stops relays on demand.

pub mod config;
pub mod correlation;
pub mod error;
pub mod gateway;
pub mod host;
pub mod hub;
pub mod proxy;
pub mod transport;

pub use error::{BridgeError, BridgeResult};
pub use gateway::{Gateway, GatewayHandle};
pub use host::{EchoExecutor, HostConnection, HostExecutor, HostOptions, HostRequest, HostResponse};
pub use hub::{Hub, HubServer, HubStatus};
pub use proxy::{ProxyManager, RelayProcessRecord, RelayState};
pub use transport::{ConnectionMode, DirectTransport, Transport, WebSocketTransport};
