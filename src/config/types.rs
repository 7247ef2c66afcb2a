use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

fn default_true() -> bool {
    true
}

/// Top-level engine configuration (JSON, camelCase keys).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    #[serde(default)]
    pub gateways: Vec<GatewayConfig>,

    #[serde(default = "default_true")]
    pub graceful_shutdown: bool,

    /// Seconds granted to in-flight requests during a graceful drain.
    #[serde(default = "default_graceful_shutdown_timeout")]
    pub graceful_shutdown_timeout: f64,

    #[serde(default = "default_true")]
    pub handle_signals: bool,

    #[serde(default)]
    pub environment: Environment,

    #[serde(default)]
    pub log_level: LogLevel,

    #[serde(default = "default_true")]
    pub metrics: bool,

    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    #[serde(default)]
    pub memory: Option<MemoryConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            gateways: Vec::new(),
            graceful_shutdown: true,
            graceful_shutdown_timeout: default_graceful_shutdown_timeout(),
            handle_signals: true,
            environment: Environment::default(),
            log_level: LogLevel::default(),
            metrics: true,
            metrics_port: default_metrics_port(),
            memory: None,
        }
    }
}

fn default_graceful_shutdown_timeout() -> f64 {
    30.0
}

fn default_metrics_port() -> u16 {
    9091
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Production,
    Test,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err(format!("invalid log level: {}", s)),
        }
    }
}

impl std::str::FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "development" => Ok(Environment::Development),
            "production" => Ok(Environment::Production),
            "test" => Ok(Environment::Test),
            _ => Err(format!("invalid environment: {}", s)),
        }
    }
}

/// Heap-usage watchdog thresholds in bytes; warning must be below critical.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryConfig {
    pub warning_threshold: u64,
    pub critical_threshold: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    #[serde(default = "default_host")]
    pub host: String,

    pub port: u16,

    #[serde(default)]
    pub tls: Option<TlsConfig>,

    #[serde(default)]
    pub routes: Vec<RouteConfig>,

    #[serde(default)]
    pub middleware: Vec<MiddlewareConfig>,

    /// Seconds to establish an upstream connection.
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout: f64,

    /// Default per-request deadline when the route's group sets none.
    #[serde(default = "default_request_timeout")]
    pub request_timeout: f64,

    /// In-flight client stream cap; accepts beyond it are rejected.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    #[serde(default = "default_true")]
    pub keep_alive: bool,

    /// Seconds an idle keep-alive client stream is held open.
    #[serde(default = "default_keep_alive_timeout")]
    pub keep_alive_timeout: f64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_connection_timeout() -> f64 {
    6.0
}

fn default_request_timeout() -> f64 {
    30.0
}

fn default_max_connections() -> usize {
    10_000
}

fn default_keep_alive_timeout() -> f64 {
    60.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsConfig {
    #[serde(default)]
    pub mode: TlsMode,

    #[serde(default)]
    pub cert_file: Option<PathBuf>,

    #[serde(default)]
    pub key_file: Option<PathBuf>,

    /// Route passthrough connections by the SNI in the ClientHello.
    #[serde(default)]
    pub sni_routing: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TlsMode {
    /// Accept TLS, forward plain HTTP upstream.
    #[default]
    Termination,
    /// L4 tunnel without inspection.
    Passthrough,
    /// Accept TLS, inspect, re-encrypt to the upstream.
    Reencrypt,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteConfig {
    pub id: String,

    /// Exact path or `/*`-suffixed prefix pattern.
    pub path_pattern: String,

    /// Allowed methods; empty means all.
    #[serde(default)]
    pub methods: Vec<String>,

    #[serde(default)]
    pub host_pattern: Option<String>,

    #[serde(default)]
    pub priority: i32,

    #[serde(default = "default_true")]
    pub enabled: bool,

    pub upstream: UpstreamConfig,

    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamConfig {
    pub servers: Vec<ServerConfig>,

    #[serde(default)]
    pub load_balancing_strategy: LoadBalancingStrategy,

    #[serde(default)]
    pub health_check: Option<HealthCheckConfig>,

    #[serde(default)]
    pub session_affinity: Option<SessionAffinityConfig>,

    #[serde(default)]
    pub failover: Option<FailoverConfig>,

    #[serde(default)]
    pub retry_policy: Option<RetryPolicyConfig>,

    /// Per-request deadline in seconds.
    #[serde(default = "default_request_timeout")]
    pub timeout: f64,

    /// Verify upstream certificates on https servers. On by default;
    /// disable only for internal traffic with self-signed certs.
    #[serde(default = "default_true")]
    pub tls_verify: bool,
}

impl UpstreamConfig {
    pub fn tls_verify(&self) -> bool {
        self.tls_verify
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LoadBalancingStrategy {
    #[default]
    RoundRobin,
    Weighted,
    LeastConnections,
    IpHash,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    #[default]
    Http,
    Https,
}

impl std::fmt::Display for Scheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scheme::Http => write!(f, "http"),
            Scheme::Https => write!(f, "https"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    pub id: String,
    pub host: String,
    pub port: u16,

    #[serde(default)]
    pub protocol: Scheme,

    #[serde(default = "default_weight")]
    pub weight: u32,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_weight() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckConfig {
    /// Seconds between probe rounds.
    #[serde(default = "default_probe_interval")]
    pub interval: f64,

    #[serde(default = "default_probe_path")]
    pub path: String,

    #[serde(default = "default_probe_method")]
    pub method: String,

    #[serde(default = "default_probe_status")]
    pub expected_status: u16,

    #[serde(default = "default_probe_timeout")]
    pub timeout: f64,

    /// Consecutive failing probes before a server is marked unhealthy.
    #[serde(default = "default_unhealthy_threshold")]
    pub unhealthy_threshold: u32,

    /// Consecutive passing probes before an unhealthy server recovers.
    #[serde(default = "default_healthy_threshold")]
    pub healthy_threshold: u32,
}

fn default_probe_interval() -> f64 {
    10.0
}

fn default_probe_path() -> String {
    "/health".to_string()
}

fn default_probe_method() -> String {
    "GET".to_string()
}

fn default_probe_status() -> u16 {
    200
}

fn default_probe_timeout() -> f64 {
    5.0
}

fn default_unhealthy_threshold() -> u32 {
    3
}

fn default_healthy_threshold() -> u32 {
    2
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionAffinityConfig {
    #[serde(default)]
    pub source: AffinitySource,

    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,

    /// Seconds a session mapping may sit idle before eviction; also the
    /// cookie Max-Age.
    #[serde(default = "default_session_max_age")]
    pub max_age: u64,

    #[serde(default = "default_cookie_path")]
    pub cookie_path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AffinitySource {
    #[default]
    Cookie,
    Ip,
}

fn default_cookie_name() -> String {
    "pe_session".to_string()
}

fn default_session_max_age() -> u64 {
    3600
}

fn default_cookie_path() -> String {
    "/".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailoverConfig {
    /// Failures within `window` seconds that mark a server down.
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,

    #[serde(default = "default_failure_window")]
    pub window: f64,

    /// Seconds a marked-down server stays out of rotation.
    #[serde(default = "default_cooldown")]
    pub cooldown: f64,
}

fn default_max_failures() -> u32 {
    3
}

fn default_failure_window() -> f64 {
    30.0
}

fn default_cooldown() -> f64 {
    60.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicyConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_max_retries() -> u32 {
    2
}

/// Per-gateway middleware pipeline entries, executed in declared order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum MiddlewareConfig {
    RequestId,
    AccessLog,
    Auth {
        #[serde(default = "default_auth_header")]
        header: String,
        token: String,
    },
    RateLimit {
        /// Requests allowed per window.
        limit: u64,
        /// Window length in seconds.
        #[serde(default = "default_rate_window")]
        window: f64,
        /// "ip", "principal", or "header:<name>".
        #[serde(default = "default_rate_key")]
        key: String,
    },
}

fn default_auth_header() -> String {
    "authorization".to_string()
}

fn default_rate_window() -> f64 {
    1.0
}

fn default_rate_key() -> String {
    "ip".to_string()
}
