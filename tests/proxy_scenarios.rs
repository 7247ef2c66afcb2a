//! End-to-end scenarios over real sockets: the engine runs on ephemeral
//! ports and proxies to in-process stub upstreams.

use proxy_engine::config::{
    EngineConfig, FailoverConfig, LoadBalancingStrategy, MiddlewareConfig, RetryPolicyConfig,
    RouteConfig, Scheme, ServerConfig, SessionAffinityConfig, UpstreamConfig,
};
use proxy_engine::server::{Runtime, ShutdownReason};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Stub upstream
// ---------------------------------------------------------------------------

struct StubServer {
    addr: SocketAddr,
    hits: Arc<AtomicU64>,
    stop: CancellationToken,
}

impl StubServer {
    fn hits(&self) -> u64 {
        self.hits.load(Ordering::SeqCst)
    }

    fn shutdown(&self) {
        self.stop.cancel();
    }
}

async fn spawn_stub(name: &'static str, body: &'static str) -> StubServer {
    spawn_stub_with(name, body, None, Duration::ZERO).await
}

async fn spawn_stub_with(
    name: &'static str,
    body: &'static str,
    order: Option<Arc<Mutex<Vec<&'static str>>>>,
    delay: Duration,
) -> StubServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hits = Arc::new(AtomicU64::new(0));
    let stop = CancellationToken::new();

    {
        let hits = hits.clone();
        let order = order.clone();
        let stop = stop.clone();
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    result = listener.accept() => result,
                    _ = stop.cancelled() => return,
                };
                let Ok((mut sock, _)) = accepted else { return };
                let hits = hits.clone();
                let order = order.clone();
                let stop = stop.clone();
                tokio::spawn(async move {
                    loop {
                        let head = tokio::select! {
                            result = read_head(&mut sock) => match result {
                                Some(head) => head,
                                None => return,
                            },
                            _ = stop.cancelled() => return,
                        };
                        // Drain a Content-Length body if one was sent.
                        if let Some(len) = content_length(&head) {
                            let mut remaining = len;
                            let mut buf = [0u8; 4096];
                            while remaining > 0 {
                                let take = remaining.min(buf.len());
                                match sock.read(&mut buf[..take]).await {
                                    Ok(0) | Err(_) => return,
                                    Ok(n) => remaining -= n,
                                }
                            }
                        }
                        hits.fetch_add(1, Ordering::SeqCst);
                        if let Some(order) = &order {
                            order.lock().unwrap().push(name);
                        }
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                        let resp = format!(
                            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}",
                            body.len(),
                            body
                        );
                        if sock.write_all(resp.as_bytes()).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });
    }

    StubServer { addr, hits, stop }
}

/// Read one request head; `None` on close.
async fn read_head(sock: &mut TcpStream) -> Option<String> {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        match sock.read(&mut byte).await {
            Ok(0) | Err(_) => return None,
            Ok(_) => buf.push(byte[0]),
        }
        if buf.ends_with(b"\r\n\r\n") {
            return Some(String::from_utf8_lossy(&buf).into_owned());
        }
    }
}

fn content_length(head: &str) -> Option<usize> {
    head.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if name.trim().eq_ignore_ascii_case("content-length") {
            value.trim().parse().ok()
        } else {
            None
        }
    })
}

// ---------------------------------------------------------------------------
// Raw HTTP client
// ---------------------------------------------------------------------------

struct Response {
    status: u16,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

/// A keep-alive client connection speaking raw HTTP/1.1.
struct TestClient {
    sock: TcpStream,
}

impl TestClient {
    async fn connect(addr: SocketAddr) -> Self {
        Self {
            sock: TcpStream::connect(addr).await.unwrap(),
        }
    }

    async fn request(&mut self, raw: &str) -> Response {
        self.sock.write_all(raw.as_bytes()).await.unwrap();
        self.read_response().await.expect("response expected")
    }

    async fn try_request(&mut self, raw: &str) -> Option<Response> {
        self.sock.write_all(raw.as_bytes()).await.ok()?;
        self.read_response().await
    }

    async fn read_response(&mut self) -> Option<Response> {
        let mut buf = Vec::new();
        let mut byte = [0u8; 1];
        while !buf.ends_with(b"\r\n\r\n") {
            match self.sock.read(&mut byte).await {
                Ok(0) | Err(_) => return None,
                Ok(_) => buf.push(byte[0]),
            }
        }
        let head = String::from_utf8_lossy(&buf).into_owned();
        let mut lines = head.lines();
        let status: u16 = lines.next()?.split_whitespace().nth(1)?.parse().ok()?;
        let mut headers = HashMap::new();
        for line in lines {
            if let Some((name, value)) = line.split_once(':') {
                headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
            }
        }
        let len: usize = headers
            .get("content-length")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let mut body = vec![0u8; len];
        if len > 0 {
            self.sock.read_exact(&mut body).await.ok()?;
        }
        Some(Response {
            status,
            headers,
            body,
        })
    }
}

async fn get(addr: SocketAddr, path: &str) -> Response {
    let mut client = TestClient::connect(addr).await;
    client
        .request(&format!("GET {} HTTP/1.1\r\nHost: x\r\n\r\n", path))
        .await
}

// ---------------------------------------------------------------------------
// Config helpers
// ---------------------------------------------------------------------------

fn server(id: &str, addr: SocketAddr, weight: u32) -> ServerConfig {
    ServerConfig {
        id: id.to_string(),
        host: addr.ip().to_string(),
        port: addr.port(),
        protocol: Scheme::Http,
        weight,
        enabled: true,
    }
}

fn upstream(servers: Vec<ServerConfig>) -> UpstreamConfig {
    UpstreamConfig {
        servers,
        load_balancing_strategy: LoadBalancingStrategy::RoundRobin,
        health_check: None,
        session_affinity: None,
        failover: None,
        retry_policy: None,
        timeout: 10.0,
        tls_verify: true,
    }
}

fn engine_config(upstream: UpstreamConfig, middleware: Vec<MiddlewareConfig>) -> EngineConfig {
    let mut config = EngineConfig::default_single_gateway("127.0.0.1", 0);
    config.handle_signals = false;
    config.metrics = false;
    config.graceful_shutdown_timeout = 5.0;
    config.gateways[0].middleware = middleware;
    config.gateways[0].routes = vec![RouteConfig {
        id: "r1".to_string(),
        path_pattern: "/*".to_string(),
        methods: Vec::new(),
        host_pattern: None,
        priority: 0,
        enabled: true,
        upstream,
        metadata: Default::default(),
    }];
    config
}

async fn start_engine(config: EngineConfig) -> (Arc<Runtime>, SocketAddr) {
    let runtime = Runtime::new(config).unwrap();
    runtime.start().await.unwrap();
    let addr = runtime.bound_addrs()[0];
    (runtime, addr)
}

async fn stop(runtime: &Arc<Runtime>) {
    runtime
        .shutdown(ShutdownReason::Requested("test done".to_string()))
        .await;
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn s1_happy_path() {
    let stub = spawn_stub("a", "hi").await;
    let config = engine_config(upstream(vec![server("a", stub.addr, 1)]), Vec::new());
    let (runtime, addr) = start_engine(config).await;

    let resp = get(addr, "/").await;
    assert_eq!(resp.status, 200);
    assert_eq!(resp.body, b"hi");
    assert_eq!(stub.hits(), 1);
    assert_eq!(runtime.state.stats.total(), 1);
    assert_eq!(runtime.state.stats.succeeded(), 1);
    assert_eq!(runtime.state.stats.failed(), 0);

    stop(&runtime).await;
}

#[tokio::test]
async fn s2_round_robin_alternates_strictly() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let a = spawn_stub_with("a", "A", Some(order.clone()), Duration::ZERO).await;
    let b = spawn_stub_with("b", "B", Some(order.clone()), Duration::ZERO).await;

    let config = engine_config(
        upstream(vec![server("a", a.addr, 1), server("b", b.addr, 1)]),
        Vec::new(),
    );
    let (runtime, addr) = start_engine(config).await;

    for _ in 0..10 {
        let resp = get(addr, "/").await;
        assert_eq!(resp.status, 200);
    }

    assert_eq!(a.hits(), 5);
    assert_eq!(b.hits(), 5);
    let observed = order.lock().unwrap().clone();
    for (i, name) in observed.iter().enumerate() {
        let expected = if i % 2 == 0 { "a" } else { "b" };
        assert_eq!(*name, expected, "selection {} broke the alternation", i);
    }

    stop(&runtime).await;
}

#[tokio::test]
async fn s3_weighted_distribution_is_exact() {
    let a = spawn_stub("a", "A").await;
    let b = spawn_stub("b", "B").await;

    let mut up = upstream(vec![server("a", a.addr, 3), server("b", b.addr, 1)]);
    up.load_balancing_strategy = LoadBalancingStrategy::Weighted;
    let (runtime, addr) = start_engine(engine_config(up, Vec::new())).await;

    for _ in 0..8 {
        assert_eq!(get(addr, "/").await.status, 200);
    }
    assert_eq!(a.hits(), 6);
    assert_eq!(b.hits(), 2);

    stop(&runtime).await;
}

#[tokio::test]
async fn s4_failover_skips_dead_server_then_exhausts() {
    let a = spawn_stub("a", "A").await;
    let b = spawn_stub("b", "B").await;

    let mut up = upstream(vec![server("a", a.addr, 1), server("b", b.addr, 1)]);
    up.failover = Some(FailoverConfig {
        max_failures: 3,
        window: 30.0,
        cooldown: 60.0,
    });
    up.retry_policy = Some(RetryPolicyConfig { max_retries: 2 });
    let (runtime, addr) = start_engine(engine_config(up, Vec::new())).await;

    for _ in 0..3 {
        assert_eq!(get(addr, "/").await.status, 200);
    }

    // A goes away mid-test.
    a.shutdown();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let b_before = b.hits();
    for i in 4..=10 {
        let resp = get(addr, "/").await;
        assert_eq!(resp.status, 200, "request {} should fail over to b", i);
    }
    assert_eq!(b.hits() - b_before, 7);

    // With B also down, the next request has nowhere to go.
    b.shutdown();
    tokio::time::sleep(Duration::from_millis(20)).await;
    let resp = get(addr, "/").await;
    assert_eq!(resp.status, 503);

    stop(&runtime).await;
}

#[tokio::test]
async fn s5_auth_short_circuit_never_reaches_upstream() {
    let stub = spawn_stub("a", "secret data").await;
    let config = engine_config(
        upstream(vec![server("a", stub.addr, 1)]),
        vec![
            MiddlewareConfig::RequestId,
            MiddlewareConfig::AccessLog,
            MiddlewareConfig::Auth {
                header: "authorization".to_string(),
                token: "open-sesame".to_string(),
            },
        ],
    );
    let (runtime, addr) = start_engine(config).await;

    let resp = get(addr, "/").await;
    assert_eq!(resp.status, 401);
    assert!(resp.headers.contains_key("x-request-id"));
    assert_eq!(stub.hits(), 0);

    let mut client = TestClient::connect(addr).await;
    let resp = client
        .request("GET / HTTP/1.1\r\nHost: x\r\nAuthorization: Bearer open-sesame\r\n\r\n")
        .await;
    assert_eq!(resp.status, 200);
    assert_eq!(stub.hits(), 1);

    stop(&runtime).await;
}

#[tokio::test]
async fn s6_graceful_drain_completes_in_flight_requests() {
    let slow = spawn_stub_with("slow", "slow done", None, Duration::from_millis(1500)).await;
    let config = engine_config(upstream(vec![server("slow", slow.addr, 1)]), Vec::new());
    let (runtime, addr) = start_engine(config).await;

    // An idle keep-alive connection opened before the drain begins.
    let mut parked = TestClient::connect(addr).await;

    // Long request in flight.
    let in_flight = tokio::spawn(async move { get(addr, "/").await });
    tokio::time::sleep(Duration::from_millis(300)).await;

    let shutdown = {
        let runtime = runtime.clone();
        tokio::spawn(async move {
            runtime
                .shutdown(ShutdownReason::Requested("rollout".to_string()))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;

    // A request during the drain window is refused with 503.
    let drained = parked
        .try_request("GET / HTTP/1.1\r\nHost: x\r\n\r\n")
        .await
        .expect("drain window response");
    assert_eq!(drained.status, 503);

    // The in-flight request still completes normally.
    let resp = in_flight.await.unwrap();
    assert_eq!(resp.status, 200);
    assert_eq!(resp.body, b"slow done");

    shutdown.await.unwrap();
    assert_eq!(
        runtime.wait().await,
        ShutdownReason::Requested("rollout".to_string())
    );

    // New connections are refused after shutdown.
    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn cookie_affinity_round_trip() {
    let a = spawn_stub("a", "A").await;
    let b = spawn_stub("b", "B").await;

    let mut up = upstream(vec![server("a", a.addr, 1), server("b", b.addr, 1)]);
    up.session_affinity = Some(SessionAffinityConfig {
        source: proxy_engine::config::AffinitySource::Cookie,
        cookie_name: "pe_session".to_string(),
        max_age: 600,
        cookie_path: "/".to_string(),
    });
    let (runtime, addr) = start_engine(engine_config(up, Vec::new())).await;

    let first = get(addr, "/").await;
    assert_eq!(first.status, 200);
    let set_cookie = first.headers.get("set-cookie").expect("affinity cookie");
    assert!(set_cookie.contains("pe_session="));
    assert!(set_cookie.contains("HttpOnly"));
    let cookie_value = set_cookie
        .split(';')
        .next()
        .unwrap()
        .to_string();
    let pinned = first.body.clone();

    // Ten follow-ups with the cookie all land on the same server.
    for _ in 0..10 {
        let mut client = TestClient::connect(addr).await;
        let resp = client
            .request(&format!(
                "GET / HTTP/1.1\r\nHost: x\r\nCookie: {}\r\n\r\n",
                cookie_value
            ))
            .await;
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, pinned);
    }

    stop(&runtime).await;
}

#[tokio::test]
async fn route_miss_returns_404_with_request_id() {
    let stub = spawn_stub("a", "x").await;
    let mut config = engine_config(upstream(vec![server("a", stub.addr, 1)]), Vec::new());
    config.gateways[0].routes[0].path_pattern = "/api/*".to_string();
    let (runtime, addr) = start_engine(config).await;

    let resp = get(addr, "/other").await;
    assert_eq!(resp.status, 404);
    assert!(resp.headers.contains_key("x-request-id"));
    assert_eq!(resp.body, b"no route matched");
    assert_eq!(runtime.state.stats.failed(), 1);

    stop(&runtime).await;
}

#[tokio::test]
async fn malformed_request_is_rejected_with_400() {
    let stub = spawn_stub("a", "x").await;
    let config = engine_config(upstream(vec![server("a", stub.addr, 1)]), Vec::new());
    let (runtime, addr) = start_engine(config).await;

    let mut client = TestClient::connect(addr).await;
    let resp = client
        .try_request("POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 3\r\nTransfer-Encoding: chunked\r\n\r\nabc")
        .await
        .expect("error response");
    assert_eq!(resp.status, 400);
    assert_eq!(stub.hits(), 0);

    stop(&runtime).await;
}

#[tokio::test]
async fn keep_alive_serves_sequential_requests_on_one_connection() {
    let stub = spawn_stub("a", "pong").await;
    let config = engine_config(upstream(vec![server("a", stub.addr, 1)]), Vec::new());
    let (runtime, addr) = start_engine(config).await;

    let mut client = TestClient::connect(addr).await;
    for _ in 0..5 {
        let resp = client.request("GET /ping HTTP/1.1\r\nHost: x\r\n\r\n").await;
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, b"pong");
    }
    assert_eq!(stub.hits(), 5);
    assert_eq!(runtime.state.stats.total(), 5);

    stop(&runtime).await;
}

#[tokio::test]
async fn post_is_not_retried_on_dead_server() {
    let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = dead.local_addr().unwrap();
    drop(dead);
    let alive = spawn_stub("b", "B").await;

    let mut up = upstream(vec![
        server("dead", dead_addr, 1),
        server("b", alive.addr, 1),
    ]);
    up.retry_policy = Some(RetryPolicyConfig { max_retries: 2 });
    let (runtime, addr) = start_engine(engine_config(up, Vec::new())).await;

    // Round-robin sends the first request to the dead server; POST must
    // not be retried, so the client sees 502.
    let mut client = TestClient::connect(addr).await;
    let resp = client
        .try_request("POST / HTTP/1.1\r\nHost: x\r\nContent-Length: 2\r\n\r\nhi")
        .await
        .expect("error response");
    assert_eq!(resp.status, 502);
    assert_eq!(alive.hits(), 0);

    // The same shape as a GET is retried and succeeds.
    let resp = get(addr, "/").await;
    assert_eq!(resp.status, 200);
    assert_eq!(alive.hits(), 1);

    stop(&runtime).await;
}
