pub mod types;

#[cfg(test)]
mod tests;

pub use types::*;

use crate::error::ProxyError;
use http::Method;
use serde_json::Value;
use std::path::Path;

impl EngineConfig {
    /// Load configuration from a JSON file and validate it. All validation
    /// failures are aggregated into a single message carrying JSON paths.
    /// Unknown fields are rejected in strict mode (`--strict` or a
    /// production environment) and tolerated otherwise.
    pub fn load(path: &Path, strict_flag: bool) -> Result<Self, ProxyError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        let value: Value = serde_json::from_str(&content)
            .map_err(|e| ProxyError::Configuration(format!("invalid json: {}", e)))?;
        let mut config: EngineConfig = serde_json::from_value(value.clone())
            .map_err(|e| ProxyError::Configuration(e.to_string()))?;

        config.apply_env_overrides();

        let strict = strict_flag || config.environment == Environment::Production;
        let mut problems = Vec::new();
        if strict {
            check_unknown_fields(&value, &mut problems);
        }
        config.collect_validation_errors(&mut problems);
        if !problems.is_empty() {
            return Err(ProxyError::Configuration(problems.join("; ")));
        }
        tracing::info!(
            "config: loaded, gateways={}, environment={:?}",
            config.gateways.len(),
            config.environment
        );
        Ok(config)
    }

    /// Built-in single-gateway configuration used when `--config` is
    /// absent: everything on one port, proxied to one local server.
    pub fn default_single_gateway(host: &str, port: u16) -> Self {
        Self {
            gateways: vec![GatewayConfig {
                host: host.to_string(),
                port,
                tls: None,
                routes: vec![RouteConfig {
                    id: "default".to_string(),
                    path_pattern: "/*".to_string(),
                    methods: Vec::new(),
                    host_pattern: None,
                    priority: 0,
                    enabled: true,
                    upstream: UpstreamConfig {
                        servers: vec![ServerConfig {
                            id: "local".to_string(),
                            host: "127.0.0.1".to_string(),
                            port: 3000,
                            protocol: Scheme::Http,
                            weight: 1,
                            enabled: true,
                        }],
                        load_balancing_strategy: LoadBalancingStrategy::RoundRobin,
                        health_check: None,
                        session_affinity: None,
                        failover: None,
                        retry_policy: None,
                        timeout: 30.0,
                        tls_verify: true,
                    },
                    metadata: Default::default(),
                }],
                middleware: Vec::new(),
                connection_timeout: 6.0,
                request_timeout: 30.0,
                max_connections: 10_000,
                keep_alive: true,
                keep_alive_timeout: 60.0,
            }],
            ..Default::default()
        }
    }

    /// Environment overrides for infra settings only; traffic config comes
    /// exclusively from the file.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("PROXY_ENGINE_LOG_LEVEL") {
            if let Ok(level) = serde_json::from_value(Value::String(v)) {
                self.log_level = level;
            }
        }
        if let Ok(v) = std::env::var("PROXY_ENGINE_METRICS_PORT") {
            if let Ok(port) = v.parse::<u16>() {
                self.metrics_port = port;
            }
        }
    }

    pub fn validate(&self) -> Result<(), ProxyError> {
        let mut problems = Vec::new();
        self.collect_validation_errors(&mut problems);
        if problems.is_empty() {
            Ok(())
        } else {
            Err(ProxyError::Configuration(problems.join("; ")))
        }
    }

    fn collect_validation_errors(&self, problems: &mut Vec<String>) {
        if self.gateways.is_empty() {
            problems.push("gateways: at least one gateway is required".to_string());
        }
        if let Some(memory) = &self.memory {
            if memory.warning_threshold >= memory.critical_threshold {
                problems.push(
                    "memory.warningThreshold: must be below memory.criticalThreshold".to_string(),
                );
            }
        }
        for (gi, gateway) in self.gateways.iter().enumerate() {
            let at = format!("gateways[{}]", gi);
            if gateway.port == 0 {
                problems.push(format!("{}.port: must be in [1, 65535]", at));
            }
            if gateway.routes.is_empty() {
                problems.push(format!("{}.routes: at least one route is required", at));
            }
            if let Some(tls) = &gateway.tls {
                if tls.mode != TlsMode::Passthrough
                    && (tls.cert_file.is_none() || tls.key_file.is_none())
                {
                    problems.push(format!(
                        "{}.tls: certFile and keyFile are required for {:?} mode",
                        at, tls.mode
                    ));
                }
            }
            let mut seen_route_ids = std::collections::HashSet::new();
            for (ri, route) in gateway.routes.iter().enumerate() {
                let at = format!("{}.routes[{}]", at, ri);
                if route.id.is_empty() {
                    problems.push(format!("{}.id: must not be empty", at));
                } else if !seen_route_ids.insert(route.id.as_str()) {
                    problems.push(format!("{}.id: duplicate route id '{}'", at, route.id));
                }
                if route.path_pattern.is_empty() || !route.path_pattern.starts_with('/') {
                    problems.push(format!("{}.pathPattern: must start with '/'", at));
                }
                for (mi, method) in route.methods.iter().enumerate() {
                    if Method::from_bytes(method.as_bytes()).is_err() {
                        problems.push(format!("{}.methods[{}]: invalid method", at, mi));
                    }
                }
                if route.upstream.servers.is_empty() {
                    problems.push(format!(
                        "{}.upstream.servers: at least one server is required",
                        at
                    ));
                }
                if route.upstream.timeout <= 0.0 {
                    problems.push(format!("{}.upstream.timeout: must be positive", at));
                }
                for (si, server) in route.upstream.servers.iter().enumerate() {
                    let at = format!("{}.upstream.servers[{}]", at, si);
                    if server.id.is_empty() {
                        problems.push(format!("{}.id: must not be empty", at));
                    }
                    if server.host.is_empty() {
                        problems.push(format!("{}.host: must not be empty", at));
                    }
                    if server.port == 0 {
                        problems.push(format!("{}.port: must be in [1, 65535]", at));
                    }
                    if server.weight == 0 {
                        problems.push(format!("{}.weight: must be >= 1", at));
                    }
                }
            }
        }
    }
}

/// Strict-mode unknown-field detection over the raw JSON document. The
/// check walks only the levels whose schemas we own; nested maps that are
/// free-form (`metadata`) are skipped.
fn check_unknown_fields(value: &Value, problems: &mut Vec<String>) {
    const TOP: &[&str] = &[
        "gateways",
        "gracefulShutdown",
        "gracefulShutdownTimeout",
        "handleSignals",
        "environment",
        "logLevel",
        "metrics",
        "metricsPort",
        "memory",
    ];
    const GATEWAY: &[&str] = &[
        "host",
        "port",
        "tls",
        "routes",
        "middleware",
        "connectionTimeout",
        "requestTimeout",
        "maxConnections",
        "keepAlive",
        "keepAliveTimeout",
    ];
    const ROUTE: &[&str] = &[
        "id",
        "pathPattern",
        "methods",
        "hostPattern",
        "priority",
        "enabled",
        "upstream",
        "metadata",
    ];
    const UPSTREAM: &[&str] = &[
        "servers",
        "loadBalancingStrategy",
        "healthCheck",
        "sessionAffinity",
        "failover",
        "retryPolicy",
        "timeout",
        "tlsVerify",
    ];
    const SERVER: &[&str] = &["id", "host", "port", "protocol", "weight", "enabled"];

    report_unknown(value, TOP, "", problems);
    let Some(gateways) = value.get("gateways").and_then(Value::as_array) else {
        return;
    };
    for (gi, gateway) in gateways.iter().enumerate() {
        let at = format!("gateways[{}]", gi);
        report_unknown(gateway, GATEWAY, &at, problems);
        let Some(routes) = gateway.get("routes").and_then(Value::as_array) else {
            continue;
        };
        for (ri, route) in routes.iter().enumerate() {
            let at = format!("{}.routes[{}]", at, ri);
            report_unknown(route, ROUTE, &at, problems);
            let Some(upstream) = route.get("upstream") else {
                continue;
            };
            let at = format!("{}.upstream", at);
            report_unknown(upstream, UPSTREAM, &at, problems);
            if let Some(servers) = upstream.get("servers").and_then(Value::as_array) {
                for (si, server) in servers.iter().enumerate() {
                    report_unknown(server, SERVER, &format!("{}.servers[{}]", at, si), problems);
                }
            }
        }
    }
}

fn report_unknown(value: &Value, known: &[&str], at: &str, problems: &mut Vec<String>) {
    let Some(object) = value.as_object() else {
        return;
    };
    for key in object.keys() {
        if !known.contains(&key.as_str()) {
            let path = if at.is_empty() {
                key.clone()
            } else {
                format!("{}.{}", at, key)
            };
            problems.push(format!("{}: unknown field", path));
        }
    }
}
