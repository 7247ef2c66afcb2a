//! Sticky sessions and per-server failure accounting.
//!
//! Affinity binds a session key (named cookie or client IP) to a server id;
//! a bound server is preferred as long as it is available. Failure
//! accounting keeps a sliding window of failure timestamps per server and
//! marks a server down once the window fills, until cooldown passes.

use crate::codec::RequestHead;
use crate::config::{AffinitySource, FailoverConfig, SessionAffinityConfig};
use dashmap::DashMap;
use rand::Rng;
use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct SessionEntry {
    pub server_id: String,
    pub created_at: Instant,
    pub last_used_at: Instant,
}

pub struct AffinityMap {
    sessions: DashMap<String, SessionEntry>,
    config: SessionAffinityConfig,
}

impl AffinityMap {
    pub fn new(config: SessionAffinityConfig) -> Self {
        Self {
            sessions: DashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &SessionAffinityConfig {
        &self.config
    }

    /// The session key carried by this request, if any. IP-sourced affinity
    /// always yields a key; cookie-sourced affinity only when the named
    /// cookie is present.
    pub fn request_key(&self, head: &RequestHead, client_ip: IpAddr) -> Option<String> {
        match self.config.source {
            AffinitySource::Ip => Some(client_ip.to_string()),
            AffinitySource::Cookie => cookie_value(head, &self.config.cookie_name),
        }
    }

    /// Generate a fresh session key for cookie-sourced affinity.
    pub fn new_session_key(&self) -> String {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill(&mut bytes);
        let mut out = String::with_capacity(32);
        for b in bytes {
            out.push_str(&format!("{:02x}", b));
        }
        out
    }

    /// Resolve the bound server for a key, refreshing its last-used stamp.
    pub fn lookup(&self, key: &str) -> Option<String> {
        let mut entry = self.sessions.get_mut(key)?;
        entry.last_used_at = Instant::now();
        Some(entry.server_id.clone())
    }

    pub fn bind(&self, key: String, server_id: String) {
        let now = Instant::now();
        self.sessions
            .entry(key)
            .and_modify(|e| {
                e.server_id = server_id.clone();
                e.last_used_at = now;
            })
            .or_insert(SessionEntry {
                server_id,
                created_at: now,
                last_used_at: now,
            });
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Drop sessions idle for longer than the configured max age.
    pub fn evict_expired(&self, now: Instant) {
        let max_age = Duration::from_secs(self.config.max_age);
        let before = self.sessions.len();
        self.sessions
            .retain(|_, entry| now.duration_since(entry.last_used_at) <= max_age);
        let evicted = before - self.sessions.len();
        if evicted > 0 {
            debug!("affinity: evicted {} expired sessions", evicted);
        }
    }

    /// `Set-Cookie` value binding the client to its session.
    pub fn set_cookie_value(&self, key: &str) -> String {
        format!(
            "{}={}; HttpOnly; Max-Age={}; Path={}",
            self.config.cookie_name, key, self.config.max_age, self.config.cookie_path
        )
    }
}

fn cookie_value(head: &RequestHead, name: &str) -> Option<String> {
    for header in head.headers.get_all(http::header::COOKIE) {
        let raw = header.to_str().ok()?;
        for pair in raw.split(';') {
            let pair = pair.trim();
            if let Some((k, v)) = pair.split_once('=') {
                if k == name {
                    return Some(v.to_string());
                }
            }
        }
    }
    None
}

/// Spawn the once-a-minute session eviction task for every affinity map in
/// `maps`.
pub fn spawn_session_cleanup(
    maps: Vec<std::sync::Arc<AffinityMap>>,
    tracker: &TaskTracker,
    cancel: CancellationToken,
) {
    if maps.is_empty() {
        return;
    }
    tracker.spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(CLEANUP_INTERVAL) => {
                    let now = Instant::now();
                    for map in &maps {
                        map.evict_expired(now);
                    }
                }
                _ = cancel.cancelled() => return,
            }
        }
    });
}

#[derive(Default)]
struct FailureState {
    failures: VecDeque<Instant>,
    marked_down_at: Option<Instant>,
}

/// Per-server failure window and cooldown.
pub struct FailureTracker {
    servers: DashMap<String, Mutex<FailureState>>,
    config: FailoverConfig,
}

impl FailureTracker {
    pub fn new(config: FailoverConfig) -> Self {
        Self {
            servers: DashMap::new(),
            config,
        }
    }

    pub fn record_failure(&self, server_id: &str) {
        self.record_failure_at(server_id, Instant::now());
    }

    pub fn record_failure_at(&self, server_id: &str, now: Instant) {
        let entry = self
            .servers
            .entry(server_id.to_string())
            .or_default();
        let mut state = entry.lock().unwrap();
        let window = Duration::from_secs_f64(self.config.window);
        while let Some(&front) = state.failures.front() {
            if now.duration_since(front) > window {
                state.failures.pop_front();
            } else {
                break;
            }
        }
        state.failures.push_back(now);
        if state.failures.len() >= self.config.max_failures as usize
            && state.marked_down_at.is_none()
        {
            state.marked_down_at = Some(now);
            debug!("failover: server marked down, server={}", server_id);
            metrics::counter!(
                "proxy_engine_failover_marked_down_total",
                "server" => server_id.to_string(),
            )
            .increment(1);
        }
    }

    /// Whether the server is currently marked down. Once cooldown passes
    /// the record is cleared and the server is eligible again.
    pub fn is_down(&self, server_id: &str) -> bool {
        self.is_down_at(server_id, Instant::now())
    }

    pub fn is_down_at(&self, server_id: &str, now: Instant) -> bool {
        let Some(entry) = self.servers.get(server_id) else {
            return false;
        };
        let cleared = {
            let state = entry.lock().unwrap();
            match state.marked_down_at {
                None => return false,
                Some(at) => now.duration_since(at) > Duration::from_secs_f64(self.config.cooldown),
            }
        };
        drop(entry);
        if cleared {
            self.servers.remove(server_id);
            debug!("failover: cooldown passed, server={}", server_id);
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;

    fn affinity_config(source: AffinitySource) -> SessionAffinityConfig {
        SessionAffinityConfig {
            source,
            cookie_name: "pe_session".to_string(),
            max_age: 300,
            cookie_path: "/".to_string(),
        }
    }

    fn failover_config() -> FailoverConfig {
        FailoverConfig {
            max_failures: 3,
            window: 10.0,
            cooldown: 30.0,
        }
    }

    #[test]
    fn test_cookie_key_extraction() {
        let map = AffinityMap::new(affinity_config(AffinitySource::Cookie));
        let mut head = RequestHead::new(Method::GET, "/");
        head.headers.insert(
            http::header::COOKIE,
            "theme=dark; pe_session=abc123; lang=en".parse().unwrap(),
        );
        let ip = "10.0.0.1".parse().unwrap();
        assert_eq!(map.request_key(&head, ip), Some("abc123".to_string()));
    }

    #[test]
    fn test_missing_cookie_yields_no_key() {
        let map = AffinityMap::new(affinity_config(AffinitySource::Cookie));
        let head = RequestHead::new(Method::GET, "/");
        let ip = "10.0.0.1".parse().unwrap();
        assert_eq!(map.request_key(&head, ip), None);
    }

    #[test]
    fn test_ip_source_always_keys() {
        let map = AffinityMap::new(affinity_config(AffinitySource::Ip));
        let head = RequestHead::new(Method::GET, "/");
        let ip: IpAddr = "192.0.2.7".parse().unwrap();
        assert_eq!(map.request_key(&head, ip), Some("192.0.2.7".to_string()));
    }

    #[test]
    fn test_bind_and_lookup() {
        let map = AffinityMap::new(affinity_config(AffinitySource::Cookie));
        map.bind("k1".to_string(), "server-a".to_string());
        assert_eq!(map.lookup("k1"), Some("server-a".to_string()));
        assert_eq!(map.lookup("nope"), None);
    }

    #[test]
    fn test_eviction_by_idle_age() {
        let mut cfg = affinity_config(AffinitySource::Cookie);
        cfg.max_age = 1;
        let map = AffinityMap::new(cfg);
        map.bind("k1".to_string(), "server-a".to_string());
        map.evict_expired(Instant::now());
        assert_eq!(map.len(), 1);
        map.evict_expired(Instant::now() + Duration::from_secs(2));
        assert!(map.is_empty());
    }

    #[test]
    fn test_set_cookie_shape() {
        let map = AffinityMap::new(affinity_config(AffinitySource::Cookie));
        let value = map.set_cookie_value("abc");
        assert_eq!(value, "pe_session=abc; HttpOnly; Max-Age=300; Path=/");
    }

    #[test]
    fn test_failures_below_threshold_keep_server_up() {
        let tracker = FailureTracker::new(failover_config());
        tracker.record_failure("a");
        tracker.record_failure("a");
        assert!(!tracker.is_down("a"));
    }

    #[test]
    fn test_window_fill_marks_down() {
        let tracker = FailureTracker::new(failover_config());
        for _ in 0..3 {
            tracker.record_failure("a");
        }
        assert!(tracker.is_down("a"));
        assert!(!tracker.is_down("b"));
    }

    #[test]
    fn test_old_failures_age_out_of_window() {
        let tracker = FailureTracker::new(failover_config());
        let start = Instant::now();
        tracker.record_failure_at("a", start);
        tracker.record_failure_at("a", start + Duration::from_secs(1));
        // Third failure lands after the first two left the 10s window.
        tracker.record_failure_at("a", start + Duration::from_secs(12));
        assert!(!tracker.is_down_at("a", start + Duration::from_secs(12)));
    }

    #[test]
    fn test_cooldown_clears_the_record() {
        let tracker = FailureTracker::new(failover_config());
        let start = Instant::now();
        for _ in 0..3 {
            tracker.record_failure_at("a", start);
        }
        assert!(tracker.is_down_at("a", start + Duration::from_secs(5)));
        // Past cooldown the record clears and the server is eligible again.
        assert!(!tracker.is_down_at("a", start + Duration::from_secs(31)));
        // The cleared record means fresh failures start a new window.
        tracker.record_failure_at("a", start + Duration::from_secs(32));
        assert!(!tracker.is_down_at("a", start + Duration::from_secs(32)));
    }
}
