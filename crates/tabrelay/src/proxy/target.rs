//! Target classification and address helpers.

use std::net::{IpAddr, TcpListener};

use reqwest::Url;

use crate::error::{BridgeError, BridgeResult};

/// Whether `target` needs a relay to be reached from this machine.
///
/// Local development targets (`localhost`, `*.localhost`, loopback and
/// unspecified addresses, plus `local_hosts`) are reached directly.
/// Anything else, including a URL that does not parse, gets a relay.
pub fn is_proxy_needed(target: &str, local_hosts: &[String]) -> bool {
    let Ok(url) = Url::parse(target.trim()) else {
        return true;
    };
    let Some(host) = url.host_str() else {
        return true;
    };
    let host = host.trim_start_matches('[').trim_end_matches(']');

    if let Ok(ip) = host.parse::<IpAddr>() {
        return !(ip.is_loopback() || ip.is_unspecified());
    }

    let host = host.to_ascii_lowercase();
    if host == "localhost" || host.ends_with(".localhost") {
        return false;
    }
    !local_hosts
        .iter()
        .any(|local| local.trim().eq_ignore_ascii_case(&host))
}

/// WebSocket URL of the hub serving `target`.
pub fn hub_url_for_target(target: &str, hub_path: &str) -> BridgeResult<String> {
    let mut url = Url::parse(target.trim())
        .map_err(|e| BridgeError::lifecycle(format!("invalid target URL {target}: {e}")))?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(BridgeError::lifecycle(format!(
                "unsupported target scheme {other}: {target}"
            )));
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| BridgeError::lifecycle(format!("cannot derive hub URL from {target}")))?;

    let path = if hub_path.starts_with('/') {
        hub_path.to_string()
    } else {
        format!("/{hub_path}")
    };
    url.set_path(&path);
    url.set_query(None);
    url.set_fragment(None);
    Ok(url.to_string())
}

/// Key under which relays for `target` are tracked.
pub fn normalize_target(target: &str) -> String {
    target.trim().trim_end_matches('/').to_string()
}

/// Reserve a free local port by binding and releasing it.
pub fn allocate_port() -> BridgeResult<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")
        .map_err(|e| BridgeError::lifecycle(format!("failed to allocate a local port: {e}")))?;
    let port = listener
        .local_addr()
        .map_err(|e| BridgeError::lifecycle(format!("failed to read allocated port: {e}")))?
        .port();
    Ok(port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_targets_need_no_relay() {
        let none: Vec<String> = Vec::new();
        for target in [
            "http://localhost:54321",
            "http://app.localhost:3000",
            "http://127.0.0.1:8000",
            "http://127.1.2.3",
            "http://[::1]:5173",
            "http://0.0.0.0:8080",
        ] {
            assert!(!is_proxy_needed(target, &none), "{target}");
        }
    }

    #[test]
    fn test_remote_targets_need_a_relay() {
        let none: Vec<String> = Vec::new();
        assert!(is_proxy_needed("https://demo.example.com", &none));
        assert!(is_proxy_needed("http://192.168.1.20:3000", &none));
        assert!(is_proxy_needed("not a url", &none));
    }

    #[test]
    fn test_configured_local_hosts() {
        let local = vec!["DevBox.internal".to_string()];
        assert!(!is_proxy_needed("http://devbox.internal:8080", &local));
        assert!(is_proxy_needed("http://other.internal:8080", &local));
    }

    #[test]
    fn test_hub_url_for_target() {
        assert_eq!(
            hub_url_for_target("https://demo.example.com/dashboard?tab=1", "/ws").unwrap(),
            "wss://demo.example.com/ws"
        );
        assert_eq!(
            hub_url_for_target("http://10.0.0.5:8080", "bridge").unwrap(),
            "ws://10.0.0.5:8080/bridge"
        );
        assert!(matches!(
            hub_url_for_target("ftp://example.com", "/ws"),
            Err(BridgeError::Lifecycle(_))
        ));
        assert!(hub_url_for_target("::nope::", "/ws").is_err());
    }

    #[test]
    fn test_normalize_target() {
        assert_eq!(
            normalize_target(" https://demo.example.com/ "),
            "https://demo.example.com"
        );
    }

    #[test]
    fn test_allocate_port() {
        assert_ne!(allocate_port().unwrap(), 0);
    }
}
