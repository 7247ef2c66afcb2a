//! Runtime coordinator: multi-listener lifecycle, signal handling,
//! graceful drain, and ownership of every background timer task.

use crate::config::EngineConfig;
use crate::error::ProxyError;
use crate::upstream;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use super::admin;
use super::events::{EventBus, LifecycleEvent};
use super::listener::Listener;
use super::memory;
use super::state::{EngineState, GatewayRuntime};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RuntimeStateKind {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
    Error = 4,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    Sigint,
    Sigterm,
    Requested(String),
    Failed(String),
}

impl ShutdownReason {
    pub fn exit_code(&self) -> i32 {
        match self {
            ShutdownReason::Sigint => 130,
            ShutdownReason::Failed(_) => 1,
            _ => 0,
        }
    }

    fn describe(&self) -> String {
        match self {
            ShutdownReason::Sigint => "SIGINT".to_string(),
            ShutdownReason::Sigterm => "SIGTERM".to_string(),
            ShutdownReason::Requested(reason) => reason.clone(),
            ShutdownReason::Failed(reason) => format!("error: {}", reason),
        }
    }
}

/// Shared status readable by the admin endpoints without holding the
/// runtime itself.
pub struct RuntimeStatus {
    state: AtomicU8,
    started_at: Mutex<Option<Instant>>,
    active_gateways: AtomicUsize,
}

impl RuntimeStatus {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(RuntimeStateKind::Stopped as u8),
            started_at: Mutex::new(None),
            active_gateways: AtomicUsize::new(0),
        }
    }

    pub fn kind(&self) -> RuntimeStateKind {
        match self.state.load(Ordering::Acquire) {
            1 => RuntimeStateKind::Starting,
            2 => RuntimeStateKind::Running,
            3 => RuntimeStateKind::Stopping,
            4 => RuntimeStateKind::Error,
            _ => RuntimeStateKind::Stopped,
        }
    }

    pub fn uptime(&self) -> Duration {
        self.started_at
            .lock()
            .unwrap()
            .map(|at| at.elapsed())
            .unwrap_or(Duration::ZERO)
    }

    pub fn active_gateways(&self) -> usize {
        self.active_gateways.load(Ordering::Relaxed)
    }

    fn set_state(&self, kind: RuntimeStateKind) {
        self.state.store(kind as u8, Ordering::Release);
        metrics::gauge!("proxy_engine_state").set(kind as u8 as f64);
    }

    fn mark_started(&self, gateways: usize) {
        *self.started_at.lock().unwrap() = Some(Instant::now());
        self.active_gateways.store(gateways, Ordering::Relaxed);
        metrics::gauge!("proxy_engine_active_gateways").set(gateways as f64);
    }
}

pub struct Runtime {
    pub state: EngineState,
    gateways: Vec<Arc<GatewayRuntime>>,
    pub status: Arc<RuntimeStatus>,
    events: EventBus,
    bg_tracker: TaskTracker,
    conn_tracker: TaskTracker,
    accept_cancel: CancellationToken,
    force_close: CancellationToken,
    bg_cancel: CancellationToken,
    active_requests: Arc<AtomicI64>,
    bound_addrs: Mutex<Vec<SocketAddr>>,
    shutdown_started: AtomicBool,
    shutdown_done: CancellationToken,
    shutdown_reason: Mutex<Option<ShutdownReason>>,
}

impl Runtime {
    pub fn new(config: EngineConfig) -> Result<Arc<Self>, ProxyError> {
        let (state, gateways) = EngineState::new(config)?;
        Ok(Arc::new(Self {
            state,
            gateways,
            status: Arc::new(RuntimeStatus::new()),
            events: EventBus::new(),
            bg_tracker: TaskTracker::new(),
            conn_tracker: TaskTracker::new(),
            accept_cancel: CancellationToken::new(),
            force_close: CancellationToken::new(),
            bg_cancel: CancellationToken::new(),
            active_requests: Arc::new(AtomicI64::new(0)),
            bound_addrs: Mutex::new(Vec::new()),
            shutdown_started: AtomicBool::new(false),
            shutdown_done: CancellationToken::new(),
            shutdown_reason: Mutex::new(None),
        }))
    }

    pub fn subscribe(&self, subscriber: impl Fn(&LifecycleEvent) + Send + Sync + 'static) {
        self.events.subscribe(subscriber);
    }

    /// Actual bound addresses, available after `start` (useful with
    /// ephemeral ports).
    pub fn bound_addrs(&self) -> Vec<SocketAddr> {
        self.bound_addrs.lock().unwrap().clone()
    }

    pub fn in_flight(&self) -> i64 {
        self.active_requests.load(Ordering::SeqCst)
    }

    /// Bind every listener and bring the runtime to running. A failed bind
    /// aborts startup and transitions to the error state.
    pub async fn start(self: &Arc<Self>) -> Result<(), ProxyError> {
        if self.status.kind() != RuntimeStateKind::Stopped {
            return Err(ProxyError::Configuration(
                "runtime already started".to_string(),
            ));
        }
        self.status.set_state(RuntimeStateKind::Starting);
        self.events.publish(&LifecycleEvent::Starting);

        let mut listeners = Vec::with_capacity(self.gateways.len());
        for gateway in &self.gateways {
            match Listener::bind(self.state.clone(), gateway.clone()).await {
                Ok(listener) => listeners.push(listener),
                Err(e) => {
                    self.status.set_state(RuntimeStateKind::Error);
                    self.events.publish(&LifecycleEvent::Error {
                        message: e.to_string(),
                    });
                    error!("server: startup failed: {}", e);
                    return Err(e);
                }
            }
        }

        let addrs: Vec<SocketAddr> = listeners.iter().map(|l| l.addr).collect();
        *self.bound_addrs.lock().unwrap() = addrs.clone();

        for listener in listeners {
            let addr = listener.addr;
            let accept_cancel = self.accept_cancel.clone();
            let force_close = self.force_close.clone();
            let conn_tracker = self.conn_tracker.clone();
            let active_requests = self.active_requests.clone();
            self.bg_tracker.spawn(async move {
                listener
                    .run(accept_cancel, force_close, conn_tracker, active_requests)
                    .await;
            });
            self.events.publish(&LifecycleEvent::ListenerStarted { addr });
        }

        self.spawn_background_tasks();

        self.status.set_state(RuntimeStateKind::Running);
        self.status.mark_started(addrs.len());
        self.events.publish(&LifecycleEvent::Started);
        info!("server: running, listeners={}", addrs.len());
        Ok(())
    }

    fn spawn_background_tasks(self: &Arc<Self>) {
        // Health probes, pool reaper, session cleanup — all owned here and
        // cancelled on shutdown.
        upstream::spawn_health_checks(
            &self.state.groups,
            upstream::build_probe_client(),
            &self.bg_tracker,
            self.bg_cancel.clone(),
        );
        self.state
            .pool
            .spawn_reaper(&self.bg_tracker, self.bg_cancel.clone());
        upstream::affinity::spawn_session_cleanup(
            self.state.groups.affinity_maps(),
            &self.bg_tracker,
            self.bg_cancel.clone(),
        );
        crate::proxy::rate_limit::spawn_store_sweep(
            self.gateways
                .iter()
                .flat_map(|gateway| gateway.chain.rate_limit_stores())
                .collect(),
            &self.bg_tracker,
            self.bg_cancel.clone(),
        );
        memory::spawn_watchdog(
            self.state.config.memory.clone(),
            &self.bg_tracker,
            self.bg_cancel.clone(),
        );

        if self.state.config.metrics {
            let state = self.state.clone();
            let status = self.status.clone();
            let cancel = self.bg_cancel.clone();
            let port = self.state.config.metrics_port;
            self.bg_tracker.spawn(async move {
                if let Err(e) = admin::run_admin_server(port, state, status, cancel).await {
                    error!("server: admin endpoint failed: {}", e);
                }
            });
        }

        if self.state.config.handle_signals {
            self.spawn_signal_task();
        }
    }

    #[cfg(unix)]
    fn spawn_signal_task(self: &Arc<Self>) {
        let runtime = self.clone();
        let cancel = self.bg_cancel.clone();
        self.bg_tracker.spawn(async move {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    error!("server: cannot install SIGTERM handler: {}", e);
                    return;
                }
            };
            // SIGHUP is received and ignored.
            let mut sighup = signal(SignalKind::hangup()).ok();
            loop {
                let hup = async {
                    match sighup.as_mut() {
                        Some(s) => {
                            s.recv().await;
                        }
                        None => std::future::pending().await,
                    }
                };
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!("server: received SIGINT, shutting down");
                        runtime.shutdown(ShutdownReason::Sigint).await;
                        return;
                    }
                    _ = sigterm.recv() => {
                        info!("server: received SIGTERM, shutting down");
                        runtime.shutdown(ShutdownReason::Sigterm).await;
                        return;
                    }
                    _ = hup => {
                        info!("server: SIGHUP ignored");
                    }
                    _ = cancel.cancelled() => return,
                }
            }
        });
    }

    #[cfg(not(unix))]
    fn spawn_signal_task(self: &Arc<Self>) {
        let runtime = self.clone();
        let cancel = self.bg_cancel.clone();
        self.bg_tracker.spawn(async move {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    runtime.shutdown(ShutdownReason::Sigint).await;
                }
                _ = cancel.cancelled() => {}
            }
        });
    }

    /// Graceful shutdown. Idempotent: a second call joins the first.
    pub async fn shutdown(self: &Arc<Self>, reason: ShutdownReason) {
        if self.shutdown_started.swap(true, Ordering::SeqCst) {
            self.shutdown_done.cancelled().await;
            return;
        }
        info!("server: shutting down, reason={}", reason.describe());
        *self.shutdown_reason.lock().unwrap() = Some(reason.clone());

        self.status.set_state(RuntimeStateKind::Stopping);
        self.events.publish(&LifecycleEvent::Stopping {
            reason: reason.describe(),
        });

        // Stop accepting; existing streams refuse new requests but finish
        // the one in flight.
        self.accept_cancel.cancel();

        if self.state.config.graceful_shutdown {
            let deadline = Duration::from_secs_f64(self.state.config.graceful_shutdown_timeout);
            let drained = self.wait_for_drain(deadline).await;
            if !drained {
                warn!(
                    "server: drain timeout after {:?}, {} requests still in flight",
                    deadline,
                    self.in_flight()
                );
            }
        }

        // Force-close everything that remains.
        self.force_close.cancel();
        self.bg_cancel.cancel();
        self.state.pool.shutdown();

        self.conn_tracker.close();
        let _ = tokio::time::timeout(Duration::from_secs(5), self.conn_tracker.wait()).await;
        self.bg_tracker.close();
        let _ = tokio::time::timeout(Duration::from_secs(5), self.bg_tracker.wait()).await;

        for addr in self.bound_addrs() {
            self.events.publish(&LifecycleEvent::ListenerStopped { addr });
        }
        self.status.set_state(RuntimeStateKind::Stopped);
        self.status.active_gateways.store(0, Ordering::Relaxed);
        metrics::gauge!("proxy_engine_active_gateways").set(0.0);
        self.events.publish(&LifecycleEvent::Stopped);
        info!("server: shutdown complete");
        self.shutdown_done.cancel();
    }

    async fn wait_for_drain(&self, deadline: Duration) -> bool {
        let drain = async {
            while self.in_flight() > 0 {
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
        };
        tokio::time::timeout(deadline, drain).await.is_ok()
    }

    /// Block until a shutdown completes; returns the reason.
    pub async fn wait(&self) -> ShutdownReason {
        self.shutdown_done.cancelled().await;
        self.shutdown_reason
            .lock()
            .unwrap()
            .clone()
            .unwrap_or(ShutdownReason::Requested("unknown".to_string()))
    }
}
