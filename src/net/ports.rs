//! Listener port allocation: reservation, conflict detection, and binding.

use crate::error::ProxyError;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::net::TcpListener;

/// Tracks (host, port) reservations so that two gateways in one
/// configuration cannot silently fight over the same endpoint, and maps
/// bind failures to [`ProxyError::Bind`].
#[derive(Default)]
pub struct PortManager {
    reserved: Mutex<HashMap<(String, u16), String>>,
}

impl PortManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve (host, port) for `owner`. A wildcard host conflicts with any
    /// reservation on the same port, and vice versa.
    pub fn reserve(&self, host: &str, port: u16, owner: &str) -> Result<(), ProxyError> {
        let mut reserved = self.reserved.lock().unwrap();
        for ((h, p), existing) in reserved.iter() {
            if *p != port {
                continue;
            }
            let wildcard = h == "0.0.0.0" || h == "::" || host == "0.0.0.0" || host == "::";
            if wildcard || h == host {
                return Err(ProxyError::Configuration(format!(
                    "port conflict: {}:{} requested by {} is already reserved by {}",
                    host, port, owner, existing
                )));
            }
        }
        reserved.insert((host.to_string(), port), owner.to_string());
        Ok(())
    }

    pub fn release(&self, host: &str, port: u16) {
        self.reserved
            .lock()
            .unwrap()
            .remove(&(host.to_string(), port));
    }

    /// Bind the reserved endpoint. Port 0 requests an ephemeral port; the
    /// caller reads the actual port back from the listener.
    pub async fn bind(&self, host: &str, port: u16) -> Result<TcpListener, ProxyError> {
        let addr = format!("{}:{}", host, port);
        TcpListener::bind(&addr)
            .await
            .map_err(|source| ProxyError::Bind { addr, source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_and_release() {
        let pm = PortManager::new();
        pm.reserve("127.0.0.1", 8080, "gw-a").unwrap();
        assert!(pm.reserve("127.0.0.1", 8080, "gw-b").is_err());
        pm.release("127.0.0.1", 8080);
        pm.reserve("127.0.0.1", 8080, "gw-b").unwrap();
    }

    #[test]
    fn test_distinct_hosts_share_port() {
        let pm = PortManager::new();
        pm.reserve("127.0.0.1", 8080, "gw-a").unwrap();
        pm.reserve("127.0.0.2", 8080, "gw-b").unwrap();
    }

    #[test]
    fn test_wildcard_conflicts_with_any_host() {
        let pm = PortManager::new();
        pm.reserve("0.0.0.0", 8080, "gw-a").unwrap();
        assert!(pm.reserve("127.0.0.1", 8080, "gw-b").is_err());

        let pm = PortManager::new();
        pm.reserve("127.0.0.1", 9090, "gw-a").unwrap();
        assert!(pm.reserve("0.0.0.0", 9090, "gw-b").is_err());
    }

    #[tokio::test]
    async fn test_bind_failure_maps_to_bind_error() {
        let pm = PortManager::new();
        let first = pm.bind("127.0.0.1", 0).await.unwrap();
        let taken = first.local_addr().unwrap().port();
        match pm.bind("127.0.0.1", taken).await {
            Err(ProxyError::Bind { addr, .. }) => {
                assert!(addr.ends_with(&taken.to_string()));
            }
            other => panic!("expected bind error, got {:?}", other.map(|_| ())),
        }
    }
}
