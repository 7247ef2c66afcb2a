//! Keyed keep-alive connection pool for upstream streams.
//!
//! Each (host, port, scheme) key holds an ordered set of idle connections
//! and a count of in-use connections; `idle + in_use` never exceeds the
//! per-key cap. A connection is either idle in exactly one pool slot or in
//! use by exactly one request, never both.

use crate::codec::HttpStream;
use crate::config::Scheme;
use crate::error::ProxyError;
use crate::upstream::transport::UpstreamIo;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub host: String,
    pub port: u16,
    pub scheme: Scheme,
}

impl PoolKey {
    pub fn new(host: impl Into<String>, port: u16, scheme: Scheme) -> Self {
        Self {
            host: host.into(),
            port,
            scheme,
        }
    }
}

impl std::fmt::Display for PoolKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Cap on idle + in-use connections per key.
    pub max_per_key: usize,
    /// How long `acquire` waits for a release when the key is at cap.
    pub acquire_timeout: Duration,
    /// Idle connections older than this are reaped.
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_per_key: 32,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(60),
        }
    }
}

pub struct PooledConnection {
    pub id: u64,
    pub stream: HttpStream<UpstreamIo>,
    pub key: PoolKey,
    pub created_at: Instant,
    pub last_used: Instant,
    pub requests: u64,
}

impl PooledConnection {
    /// Zero-byte peer-liveness probe: a readable idle connection is either
    /// closed or has unsolicited bytes; both mean it must not be handed out.
    fn peer_alive(&self) -> bool {
        let mut probe = [0u8; 1];
        match self.stream.io_ref().tcp_ref().try_read(&mut probe) {
            Ok(_) => false,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => true,
            Err(_) => false,
        }
    }
}

#[derive(Default)]
struct KeyState {
    idle: VecDeque<PooledConnection>,
    in_use: usize,
}

#[derive(Default)]
struct KeyEntry {
    state: Mutex<KeyState>,
    released: Notify,
}

/// Handed out when the pool has room but no idle connection; the caller
/// connects and converts the slot, or drops it to free the reservation.
pub struct ConnectSlot {
    entry: Arc<KeyEntry>,
    key: PoolKey,
    id: u64,
    armed: bool,
}

impl ConnectSlot {
    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    pub fn into_connection(mut self, stream: HttpStream<UpstreamIo>) -> PooledConnection {
        self.armed = false;
        let now = Instant::now();
        PooledConnection {
            id: self.id,
            stream,
            key: self.key.clone(),
            created_at: now,
            last_used: now,
            requests: 0,
        }
    }
}

impl Drop for ConnectSlot {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.entry.state.lock().unwrap();
            state.in_use -= 1;
            drop(state);
            self.entry.released.notify_one();
        }
    }
}

pub enum Checkout {
    Reused(PooledConnection),
    Connect(ConnectSlot),
}

pub struct ConnectionPool {
    entries: DashMap<PoolKey, Arc<KeyEntry>>,
    config: PoolConfig,
    shutdown: AtomicBool,
    next_id: AtomicU64,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Arc<Self> {
        Arc::new(Self {
            entries: DashMap::new(),
            config,
            shutdown: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
        })
    }

    fn entry(&self, key: &PoolKey) -> Arc<KeyEntry> {
        if let Some(entry) = self.entries.get(key) {
            return entry.value().clone();
        }
        self.entries.entry(key.clone()).or_default().clone()
    }

    /// Check out an idle connection or a connect slot, waiting up to
    /// `acquire_timeout` when the key is at cap.
    pub async fn acquire(&self, key: &PoolKey) -> Result<Checkout, ProxyError> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(ProxyError::PoolShutdown);
        }
        let entry = self.entry(key);
        let deadline = tokio::time::Instant::now() + self.config.acquire_timeout;

        loop {
            {
                let mut state = entry.state.lock().unwrap();
                // Most-recently released first; stale ones fail the liveness
                // probe and are dropped on the spot.
                while let Some(conn) = state.idle.pop_back() {
                    if conn.peer_alive() && !conn.stream.has_buffered_input() {
                        state.in_use += 1;
                        metrics::counter!("proxy_engine_pool_reuse_total").increment(1);
                        return Ok(Checkout::Reused(conn));
                    }
                    debug!("pool: dropping dead idle connection, key={}", key);
                }
                if state.in_use < self.config.max_per_key {
                    state.in_use += 1;
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                    return Ok(Checkout::Connect(ConnectSlot {
                        entry: entry.clone(),
                        key: key.clone(),
                        id,
                        armed: true,
                    }));
                }
            }

            metrics::counter!("proxy_engine_pool_wait_total").increment(1);
            if tokio::time::timeout_at(deadline, entry.released.notified())
                .await
                .is_err()
            {
                return Err(ProxyError::UpstreamUnavailable);
            }
            if self.shutdown.load(Ordering::Acquire) {
                return Err(ProxyError::PoolShutdown);
            }
        }
    }

    /// Return a connection. It re-enters the idle set only when the caller
    /// marks it reusable and the pool is still running; otherwise it is
    /// closed by drop.
    pub fn release(&self, mut conn: PooledConnection, reusable: bool) {
        let entry = self.entry(&conn.key);
        let mut state = entry.state.lock().unwrap();
        state.in_use -= 1;
        let keep = reusable
            && !self.shutdown.load(Ordering::Acquire)
            && !conn.stream.has_buffered_input();
        if keep {
            conn.last_used = Instant::now();
            conn.requests += 1;
            state.idle.push_back(conn);
        }
        drop(state);
        entry.released.notify_one();
    }

    /// Discard a connection that failed mid-exchange.
    pub fn discard(&self, conn: PooledConnection) {
        self.release(conn, false);
    }

    /// (idle, in-use) for one key.
    pub fn counts(&self, key: &PoolKey) -> (usize, usize) {
        match self.entries.get(key) {
            Some(entry) => {
                let state = entry.state.lock().unwrap();
                (state.idle.len(), state.in_use)
            }
            None => (0, 0),
        }
    }

    /// Drop idle connections that outlived `idle_timeout`.
    pub fn reap_idle(&self) {
        let now = Instant::now();
        for entry in self.entries.iter() {
            let mut state = entry.value().state.lock().unwrap();
            let before = state.idle.len();
            state
                .idle
                .retain(|c| now.duration_since(c.last_used) < self.config.idle_timeout);
            let reaped = before - state.idle.len();
            if reaped > 0 {
                debug!("pool: reaped {} idle connections, key={}", reaped, entry.key());
                metrics::counter!("proxy_engine_pool_reaped_total").increment(reaped as u64);
            }
        }
    }

    /// Periodic idle reaper, owned by the runtime.
    pub fn spawn_reaper(self: &Arc<Self>, tracker: &TaskTracker, cancel: CancellationToken) {
        let pool = self.clone();
        let interval = (pool.config.idle_timeout / 2).max(Duration::from_secs(1));
        tracker.spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => pool.reap_idle(),
                    _ = cancel.cancelled() => return,
                }
            }
        });
    }

    /// Close all idle connections and fail subsequent acquires fast.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        for entry in self.entries.iter() {
            let mut state = entry.value().state.lock().unwrap();
            state.idle.clear();
            drop(state);
            entry.value().released.notify_waiters();
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}
