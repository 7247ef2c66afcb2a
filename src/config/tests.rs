use super::*;

fn minimal_json() -> serde_json::Value {
    serde_json::json!({
        "gateways": [{
            "host": "127.0.0.1",
            "port": 8080,
            "routes": [{
                "id": "r1",
                "pathPattern": "/*",
                "upstream": {
                    "servers": [
                        {"id": "s1", "host": "127.0.0.1", "port": 3001}
                    ]
                }
            }]
        }]
    })
}

fn parse(value: serde_json::Value) -> EngineConfig {
    serde_json::from_value(value).unwrap()
}

#[test]
fn test_minimal_config_parses_with_defaults() {
    let config = parse(minimal_json());
    assert!(config.graceful_shutdown);
    assert!(config.handle_signals);
    assert_eq!(config.environment, Environment::Development);
    assert_eq!(config.log_level, LogLevel::Info);
    assert_eq!(config.metrics_port, 9091);

    let gateway = &config.gateways[0];
    assert!(gateway.keep_alive);
    assert_eq!(gateway.max_connections, 10_000);

    let route = &gateway.routes[0];
    assert!(route.enabled);
    assert_eq!(route.priority, 0);
    assert_eq!(
        route.upstream.load_balancing_strategy,
        LoadBalancingStrategy::RoundRobin
    );

    let server = &route.upstream.servers[0];
    assert_eq!(server.protocol, Scheme::Http);
    assert_eq!(server.weight, 1);
    assert!(server.enabled);

    config.validate().unwrap();
}

#[test]
fn test_strategy_and_protocol_names() {
    let mut value = minimal_json();
    value["gateways"][0]["routes"][0]["upstream"]["loadBalancingStrategy"] =
        serde_json::json!("leastConnections");
    value["gateways"][0]["routes"][0]["upstream"]["servers"][0]["protocol"] =
        serde_json::json!("https");
    let config = parse(value);
    let upstream = &config.gateways[0].routes[0].upstream;
    assert_eq!(
        upstream.load_balancing_strategy,
        LoadBalancingStrategy::LeastConnections
    );
    assert_eq!(upstream.servers[0].protocol, Scheme::Https);
}

#[test]
fn test_middleware_entries() {
    let mut value = minimal_json();
    value["gateways"][0]["middleware"] = serde_json::json!([
        {"type": "requestId"},
        {"type": "accessLog"},
        {"type": "auth", "token": "secret"},
        {"type": "rateLimit", "limit": 100, "window": 10.0, "key": "header:x-api-key"}
    ]);
    let config = parse(value);
    let middleware = &config.gateways[0].middleware;
    assert_eq!(middleware.len(), 4);
    match &middleware[2] {
        MiddlewareConfig::Auth { header, token } => {
            assert_eq!(header, "authorization");
            assert_eq!(token, "secret");
        }
        other => panic!("expected auth middleware, got {:?}", other),
    }
    match &middleware[3] {
        MiddlewareConfig::RateLimit { limit, window, key } => {
            assert_eq!(*limit, 100);
            assert_eq!(*window, 10.0);
            assert_eq!(key, "header:x-api-key");
        }
        other => panic!("expected rate limit middleware, got {:?}", other),
    }
}

#[test]
fn test_validation_aggregates_paths() {
    let config = EngineConfig {
        gateways: vec![GatewayConfig {
            host: "0.0.0.0".to_string(),
            port: 0,
            tls: None,
            routes: vec![RouteConfig {
                id: String::new(),
                path_pattern: "no-slash".to_string(),
                methods: vec!["BAD METHOD".to_string()],
                host_pattern: None,
                priority: 0,
                enabled: true,
                upstream: UpstreamConfig {
                    servers: Vec::new(),
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
            max_connections: 100,
            keep_alive: true,
            keep_alive_timeout: 60.0,
        }],
        ..Default::default()
    };

    let err = config.validate().unwrap_err().to_string();
    assert!(err.contains("gateways[0].port"));
    assert!(err.contains("gateways[0].routes[0].id"));
    assert!(err.contains("gateways[0].routes[0].pathPattern"));
    assert!(err.contains("gateways[0].routes[0].methods[0]"));
    assert!(err.contains("gateways[0].routes[0].upstream.servers"));
}

#[test]
fn test_no_gateways_rejected() {
    let config = EngineConfig::default();
    assert!(config.validate().is_err());
}

#[test]
fn test_duplicate_route_ids_rejected() {
    let mut value = minimal_json();
    let route = value["gateways"][0]["routes"][0].clone();
    value["gateways"][0]["routes"]
        .as_array_mut()
        .unwrap()
        .push(route);
    let config = parse(value);
    let err = config.validate().unwrap_err().to_string();
    assert!(err.contains("duplicate route id"));
}

#[test]
fn test_memory_thresholds_ordered() {
    let mut config = parse(minimal_json());
    config.memory = Some(MemoryConfig {
        warning_threshold: 100,
        critical_threshold: 100,
    });
    let err = config.validate().unwrap_err().to_string();
    assert!(err.contains("memory.warningThreshold"));
}

#[test]
fn test_zero_weight_rejected() {
    let mut value = minimal_json();
    value["gateways"][0]["routes"][0]["upstream"]["servers"][0]["weight"] = serde_json::json!(0);
    let config = parse(value);
    let err = config.validate().unwrap_err().to_string();
    assert!(err.contains("weight"));
}

#[test]
fn test_tls_termination_requires_cert_and_key() {
    let mut value = minimal_json();
    value["gateways"][0]["tls"] = serde_json::json!({"mode": "termination"});
    let config = parse(value);
    let err = config.validate().unwrap_err().to_string();
    assert!(err.contains("certFile"));

    let mut value = minimal_json();
    value["gateways"][0]["tls"] = serde_json::json!({"mode": "passthrough"});
    let config = parse(value);
    config.validate().unwrap();
}

#[test]
fn test_default_single_gateway_is_valid() {
    let config = EngineConfig::default_single_gateway("0.0.0.0", 8080);
    config.validate().unwrap();
    assert_eq!(config.gateways.len(), 1);
    assert_eq!(config.gateways[0].routes[0].path_pattern, "/*");
}

#[test]
fn test_strict_mode_load_rejects_unknown_fields() {
    let mut value = minimal_json();
    value["speling_mistake"] = serde_json::json!(true);
    value["gateways"][0]["routes"][0]["upstream"]["extra"] = serde_json::json!(1);

    let dir = std::env::temp_dir().join(format!("pe-config-test-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("strict.json");
    std::fs::write(&path, serde_json::to_string_pretty(&value).unwrap()).unwrap();

    let err = EngineConfig::load(&path, true).unwrap_err().to_string();
    assert!(err.contains("speling_mistake: unknown field"));
    assert!(err.contains("upstream.extra: unknown field"));

    // Tolerated outside strict mode.
    EngineConfig::load(&path, false).unwrap();
    std::fs::remove_file(&path).ok();
}
