//! Client-facing listener: accept loop, per-connection tasks with a
//! max-connection cap, the HTTP/1.1 keep-alive loop over the codec, and
//! the TLS dispatch modes (termination, re-encryption, L4 passthrough).

use crate::codec::{BodyKind, CodecError, HttpStream, RequestHead};
use crate::config::TlsMode;
use crate::error::ProxyError;
use crate::proxy::context::{generate_request_id, X_REQUEST_ID};
use crate::proxy::{ProxyRequest, ProxyResponse, RequestContext, ResponseBody};
use http::header::{HeaderName, CONNECTION, HOST};
use http::{Method, Version};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::state::{EngineState, GatewayRuntime};

/// Hard cap on a buffered request body.
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Plain or TLS-terminated client stream.
pub enum ClientIo {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::server::TlsStream<TcpStream>>),
}

impl AsyncRead for ClientIo {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ClientIo::Plain(s) => Pin::new(s).poll_read(cx, buf),
            ClientIo::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ClientIo {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            ClientIo::Plain(s) => Pin::new(s).poll_write(cx, buf),
            ClientIo::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ClientIo::Plain(s) => Pin::new(s).poll_flush(cx),
            ClientIo::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            ClientIo::Plain(s) => Pin::new(s).poll_shutdown(cx),
            ClientIo::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// A gateway's listener, bound and ready to accept.
pub struct Listener {
    state: EngineState,
    runtime: Arc<GatewayRuntime>,
    inner: TcpListener,
    pub addr: SocketAddr,
}

impl Listener {
    /// Reserve the endpoint with the port manager and bind it.
    pub async fn bind(state: EngineState, runtime: Arc<GatewayRuntime>) -> Result<Self, ProxyError> {
        let host = runtime.config.host.clone();
        let port = runtime.config.port;
        state.ports.reserve(&host, port, &runtime.name)?;
        let inner = match state.ports.bind(&host, port).await {
            Ok(listener) => listener,
            Err(e) => {
                state.ports.release(&host, port);
                return Err(e);
            }
        };
        let addr = inner.local_addr().map_err(|source| ProxyError::Bind {
            addr: format!("{}:{}", host, port),
            source,
        })?;
        info!("server: listener bound, gateway={}, addr={}", runtime.name, addr);
        Ok(Self {
            state,
            runtime,
            inner,
            addr,
        })
    }

    /// Accept until `accept_cancel` fires. Per-connection tasks run on
    /// `conn_tracker` and respect `force_close` once the drain deadline
    /// passes.
    pub async fn run(
        self,
        accept_cancel: CancellationToken,
        force_close: CancellationToken,
        conn_tracker: TaskTracker,
        active_requests: Arc<AtomicI64>,
    ) {
        let conn_permits = Arc::new(Semaphore::new(self.runtime.config.max_connections));

        loop {
            let accepted = tokio::select! {
                result = self.inner.accept() => result,
                _ = accept_cancel.cancelled() => {
                    info!("server: listener draining, gateway={}", self.runtime.name);
                    self.state
                        .ports
                        .release(&self.runtime.config.host, self.runtime.config.port);
                    break;
                }
            };

            let (stream, peer_addr) = match accepted {
                Ok(v) => v,
                Err(e) => {
                    error!("server: accept failed, gateway={}, error={}", self.runtime.name, e);
                    continue;
                }
            };

            // Max-connection cap: over-cap accepts are rejected outright.
            let Ok(permit) = conn_permits.clone().try_acquire_owned() else {
                metrics::counter!("proxy_engine_connections_rejected_total").increment(1);
                debug!(
                    "server: connection cap reached, rejecting, gateway={}, peer={}",
                    self.runtime.name, peer_addr
                );
                drop(stream);
                continue;
            };

            metrics::counter!("proxy_engine_connections_total").increment(1);
            metrics::gauge!("proxy_engine_connections_active").increment(1.0);

            let state = self.state.clone();
            let runtime = self.runtime.clone();
            let accept_cancel = accept_cancel.clone();
            let force_close = force_close.clone();
            let active_requests = active_requests.clone();

            conn_tracker.spawn(async move {
                handle_accepted(
                    stream,
                    peer_addr,
                    state,
                    runtime,
                    accept_cancel,
                    force_close,
                    active_requests,
                )
                .await;
                metrics::gauge!("proxy_engine_connections_active").decrement(1.0);
                drop(permit);
            });
        }
    }
}

async fn handle_accepted(
    stream: TcpStream,
    peer_addr: SocketAddr,
    state: EngineState,
    runtime: Arc<GatewayRuntime>,
    drain: CancellationToken,
    force_close: CancellationToken,
    active_requests: Arc<AtomicI64>,
) {
    let _ = stream.set_nodelay(true);

    let io = match &runtime.tls {
        None => ClientIo::Plain(stream),
        Some(tls) => match tls.mode {
            TlsMode::Passthrough => {
                serve_passthrough(stream, peer_addr, &state, &runtime).await;
                return;
            }
            TlsMode::Termination | TlsMode::Reencrypt => {
                let Some(acceptor) = &tls.acceptor else {
                    return;
                };
                match acceptor.accept(stream).await {
                    Ok(tls_stream) => ClientIo::Tls(Box::new(tls_stream)),
                    Err(e) => {
                        debug!("server: tls handshake failed, peer={}, error={}", peer_addr, e);
                        return;
                    }
                }
            }
        },
    };

    serve_connection(
        io,
        peer_addr,
        state,
        runtime,
        drain,
        force_close,
        active_requests,
    )
    .await;
}

/// HTTP/1.1 keep-alive loop: one codec instance per client stream, reused
/// across requests until close, idle timeout, error, or shutdown.
async fn serve_connection(
    io: ClientIo,
    peer_addr: SocketAddr,
    state: EngineState,
    runtime: Arc<GatewayRuntime>,
    drain: CancellationToken,
    force_close: CancellationToken,
    active_requests: Arc<AtomicI64>,
) {
    let keep_alive_enabled = runtime.config.keep_alive;
    let idle_timeout = Duration::from_secs_f64(runtime.config.keep_alive_timeout);
    let mut stream = HttpStream::new(io, &state.buffers);
    let mut served: u64 = 0;

    loop {
        let head = tokio::select! {
            result = tokio::time::timeout(idle_timeout, stream.read_request_head()) => {
                match result {
                    Err(_) => break, // per-stream idle timeout
                    Ok(Ok(None)) => break,
                    Ok(Ok(Some(head))) => head,
                    Ok(Err(CodecError::Io(_))) | Ok(Err(CodecError::UnexpectedEof)) => break,
                    Ok(Err(e)) => {
                        // Malformed head: answer 400 and close.
                        let ctx = RequestContext::new(
                            generate_request_id(),
                            peer_addr.ip(),
                            String::new(),
                            String::new(),
                            Method::GET,
                        );
                        let resp = ctx.error_response(&ProxyError::MalformedRequest(e.to_string()));
                        let _ = write_response(&mut stream, resp, &Method::GET, false).await;
                        break;
                    }
                }
            }
            _ = force_close.cancelled() => break,
        };

        // Graceful drain: in-flight requests finish, new ones are refused.
        if drain.is_cancelled() {
            let ctx = intake_context(&head, peer_addr);
            let resp = ctx.error_response(&ProxyError::PoolShutdown);
            let _ = write_response(&mut stream, resp, &head.method, false).await;
            break;
        }

        let read_before = stream.bytes_read();

        let body_kind = match head.body_kind() {
            Ok(kind) => kind,
            Err(e) => {
                let ctx = intake_context(&head, peer_addr);
                let resp = ctx.error_response(&ProxyError::MalformedRequest(e.to_string()));
                let _ = write_response(&mut stream, resp, &head.method, false).await;
                break;
            }
        };
        stream.begin_body(body_kind);
        let body = match stream.read_body_to_end(MAX_BODY_BYTES).await {
            Ok(body) => body,
            Err(e) => {
                let ctx = intake_context(&head, peer_addr);
                let resp = ctx.error_response(&ProxyError::MalformedRequest(e.to_string()));
                let _ = write_response(&mut stream, resp, &head.method, false).await;
                break;
            }
        };

        let client_wants_close = wants_close(&head);
        let mut ctx = intake_context(&head, peer_addr);
        let mut req = ProxyRequest { head, body };

        active_requests.fetch_add(1, Ordering::SeqCst);
        let resp = runtime.chain.run(&mut req, &mut ctx, &runtime.handler).await;
        let written_before = stream.bytes_written();
        let keep = match write_response(
            &mut stream,
            resp,
            &req.head.method,
            keep_alive_enabled && !client_wants_close,
        )
        .await
        {
            Ok(keep) => keep,
            Err(e) => {
                debug!(
                    request_id = %ctx.request_id,
                    peer = %peer_addr,
                    error = %e,
                    "client write failed"
                );
                false
            }
        };
        active_requests.fetch_sub(1, Ordering::SeqCst);

        let bytes_in = stream.bytes_read() - read_before;
        let bytes_out = stream.bytes_written() - written_before;
        state.stats.add_bytes_in(bytes_in);
        state.stats.add_bytes_out(bytes_out);
        metrics::counter!("proxy_engine_bytes_in_total").increment(bytes_in);
        metrics::counter!("proxy_engine_bytes_out_total").increment(bytes_out);

        served += 1;
        if !keep {
            break;
        }
    }

    debug!("server: connection closed, peer={}, requests={}", peer_addr, served);
}

/// Build the request context at intake: request id adopted or generated,
/// client IP from the left-most trusted X-Forwarded-For entry or the TCP
/// peer.
fn intake_context(head: &RequestHead, peer_addr: SocketAddr) -> RequestContext {
    let request_id = head
        .headers
        .get(&X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(generate_request_id);

    let client_ip = head
        .headers
        .get(HeaderName::from_static("x-forwarded-for"))
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|s| s.trim().parse::<std::net::IpAddr>().ok())
        .unwrap_or_else(|| peer_addr.ip());

    let host = head
        .headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    RequestContext::new(
        request_id,
        client_ip,
        host,
        head.path().to_string(),
        head.method.clone(),
    )
}

fn wants_close(head: &RequestHead) -> bool {
    let close_token = head
        .headers
        .get(CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| {
            v.split(',')
                .any(|t| t.trim().eq_ignore_ascii_case("close"))
        })
        .unwrap_or(false);
    if head.version == Version::HTTP_10 {
        // HTTP/1.0 closes by default.
        let keep = head
            .headers
            .get(CONNECTION)
            .and_then(|v| v.to_str().ok())
            .map(|v| {
                v.split(',')
                    .any(|t| t.trim().eq_ignore_ascii_case("keep-alive"))
            })
            .unwrap_or(false);
        return !keep;
    }
    close_token
}

/// Write one response to the client stream, re-framing the body per the
/// upstream's framing. Returns whether the connection may serve another
/// request.
async fn write_response(
    stream: &mut HttpStream<ClientIo>,
    mut resp: ProxyResponse,
    req_method: &Method,
    keep_alive: bool,
) -> Result<bool, CodecError> {
    let is_head = *req_method == Method::HEAD;

    match resp.body {
        ResponseBody::Full(ref bytes) => {
            if !keep_alive {
                resp.head
                    .headers
                    .insert(CONNECTION, http::HeaderValue::from_static("close"));
            }
            stream.write_response_head(&resp.head).await?;
            if !is_head {
                stream.write_body_frame(bytes, false).await?;
            }
            stream.flush().await?;
            Ok(keep_alive)
        }
        ResponseBody::Upstream(ref mut body) => {
            let kind = resp.head.body_kind(is_head).unwrap_or(BodyKind::Empty);
            let chunked = kind == BodyKind::Chunked;
            let until_close = kind == BodyKind::UntilClose;
            if until_close || !keep_alive {
                resp.head
                    .headers
                    .insert(CONNECTION, http::HeaderValue::from_static("close"));
            }
            stream.write_response_head(&resp.head).await?;

            loop {
                match body.next_frame().await {
                    Ok(Some(frame)) => {
                        if !is_head {
                            stream.write_body_frame(&frame, chunked).await?;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        // Mid-body upstream failure: the head is already
                        // out, so the only honest move is to cut the
                        // connection.
                        warn!("server: upstream body failed mid-stream: {}", e);
                        return Ok(false);
                    }
                }
            }
            if !is_head {
                stream.finish_body(chunked).await?;
            }
            stream.flush().await?;
            Ok(keep_alive && !until_close)
        }
    }
}

/// L4 passthrough: pipe bytes to an upstream chosen by SNI (when enabled)
/// or the listener's binding, without inspecting the stream.
async fn serve_passthrough(
    mut client: TcpStream,
    peer_addr: SocketAddr,
    state: &EngineState,
    runtime: &Arc<GatewayRuntime>,
) {
    let sni_routing = runtime
        .tls
        .as_ref()
        .map(|t| t.sni_routing)
        .unwrap_or(false);

    let sni = if sni_routing {
        let mut peek_buf = [0u8; 2048];
        match client.peek(&mut peek_buf).await {
            Ok(n) => crate::tls::extract_sni(&peek_buf[..n]),
            Err(_) => None,
        }
    } else {
        None
    };

    let table = runtime.routes.load();
    let route = sni
        .as_deref()
        .and_then(|host| table.match_route(host, "/", &Method::GET))
        .or_else(|| table.routes().first().cloned());
    let Some(route) = route else {
        debug!("server: passthrough has no route, peer={}", peer_addr);
        return;
    };

    let Some(group) = state.groups.get(&route.group_id) else {
        return;
    };
    let subset = group.selectable_subset();
    let Some(server) = group.select(&subset, peer_addr.ip()) else {
        warn!("server: passthrough has no upstream, route={}", route.id);
        return;
    };

    let _guard = server.begin_request();
    let mut upstream = match TcpStream::connect((server.host.as_str(), server.port)).await {
        Ok(stream) => stream,
        Err(e) => {
            group.record_failure(&server.id);
            warn!(
                "server: passthrough connect failed, upstream={}, error={}",
                server.endpoint(),
                e
            );
            return;
        }
    };

    match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
        Ok((to_upstream, to_client)) => {
            state.stats.add_bytes_in(to_upstream);
            state.stats.add_bytes_out(to_client);
            debug!(
                "server: passthrough finished, peer={}, upstream={}, in={}, out={}",
                peer_addr,
                server.endpoint(),
                to_upstream,
                to_client
            );
        }
        Err(e) => {
            debug!("server: passthrough pipe error, peer={}, error={}", peer_addr, e);
        }
    }
}
