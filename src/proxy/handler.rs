//! Per-request orchestration: route match, upstream selection with
//! affinity and failure accounting, pooled dispatch with retry on safe
//! methods, and response streaming back to the listener.

use crate::codec::{RequestHead, ResponseHead};
use crate::config::AffinitySource;
use crate::error::ProxyError;
use crate::net::BufferPool;
use crate::pool::{Checkout, ConnectionPool, PoolKey, PooledConnection};
use crate::routing::RouteTable;
use crate::upstream::{Connector, GroupStore, UpstreamGroup, UpstreamInstance};
use arc_swap::ArcSwap;
use http::header::{
    HeaderName, HeaderValue, CONNECTION, CONTENT_LENGTH, SET_COOKIE, TRANSFER_ENCODING,
};
use http::Method;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, warn};

use super::context::{ProxyRequest, ProxyResponse, RequestContext, ResponseBody, UpstreamBody};
use super::stats::ProxyStats;
use super::Terminal;

pub struct ProxyHandler {
    pub routes: Arc<ArcSwap<RouteTable>>,
    pub groups: GroupStore,
    pub pool: Arc<ConnectionPool>,
    pub connector: Arc<Connector>,
    pub buffers: Arc<BufferPool>,
    pub stats: Arc<ProxyStats>,
}

impl Terminal for ProxyHandler {
    fn call<'a>(
        &'a self,
        req: &'a mut ProxyRequest,
        ctx: &'a mut RequestContext,
    ) -> Pin<Box<dyn Future<Output = ProxyResponse> + Send + 'a>> {
        Box::pin(self.handle(req, ctx))
    }
}

impl ProxyHandler {
    pub async fn handle(&self, req: &mut ProxyRequest, ctx: &mut RequestContext) -> ProxyResponse {
        match self.dispatch(req, ctx).await {
            Ok(resp) => {
                self.stats.record_success(ctx.start.elapsed());
                self.finalize_metrics(ctx, resp.status().as_u16());
                resp
            }
            Err(e) => {
                self.stats.record_failure(ctx.start.elapsed());
                let resp = ctx.error_response(&e);
                self.finalize_metrics(ctx, resp.status().as_u16());
                match e {
                    ProxyError::RouteNotFound => debug!(
                        request_id = %ctx.request_id,
                        host = %ctx.host,
                        path = %ctx.path,
                        "no route matched"
                    ),
                    _ => warn!(
                        request_id = %ctx.request_id,
                        route = %ctx.route_id,
                        upstream = %ctx.upstream_server,
                        error = %e,
                        "request failed"
                    ),
                }
                resp
            }
        }
    }

    async fn dispatch(
        &self,
        req: &mut ProxyRequest,
        ctx: &mut RequestContext,
    ) -> Result<ProxyResponse, ProxyError> {
        let table = self.routes.load();
        let route = table
            .match_route(&ctx.host, req.head.path(), &req.head.method)
            .ok_or(ProxyError::RouteNotFound)?;
        ctx.route_id = route.id.clone();

        let group = self
            .groups
            .get(&route.group_id)
            .ok_or(ProxyError::UpstreamUnavailable)?;

        let deadline = tokio::time::Instant::now() + group.request_timeout();

        // Affinity: an existing session key bound to a still-available
        // server takes precedence over load balancing.
        let affinity_key = group
            .affinity
            .as_ref()
            .and_then(|a| a.request_key(&req.head, ctx.client_ip));
        let preferred = match (&group.affinity, &affinity_key) {
            (Some(affinity), Some(key)) => affinity
                .lookup(key)
                .filter(|server_id| group.is_available(server_id)),
            _ => None,
        };

        let retry_budget = group.retry_budget();
        let idempotent = is_idempotent(&req.head.method);
        let mut tried: Vec<String> = Vec::new();
        let mut attempt: u32 = 0;

        loop {
            let candidate = match (&preferred, attempt) {
                (Some(server_id), 0) => group
                    .server(server_id)
                    .cloned()
                    .ok_or(ProxyError::UpstreamUnavailable)?,
                _ => {
                    let subset: Vec<UpstreamInstance> = group
                        .selectable_subset()
                        .into_iter()
                        .filter(|s| !tried.contains(&s.id))
                        .collect();
                    group
                        .select(&subset, ctx.client_ip)
                        .ok_or(ProxyError::UpstreamUnavailable)?
                }
            };
            ctx.upstream_server = candidate.id.clone();

            let guard = candidate.begin_request();
            match self.try_dispatch(req, ctx, &group, &candidate, deadline).await {
                Ok((head, conn, reusable)) => {
                    let mut resp = self.build_downstream_response(head, conn, reusable, guard);
                    self.apply_affinity(&group, &candidate, affinity_key, &mut resp);
                    return Ok(resp);
                }
                Err(e) => {
                    drop(guard);
                    group.record_failure(&candidate.id);
                    tried.push(candidate.id.clone());

                    let may_retry = e.retriable() && idempotent && attempt < retry_budget;
                    if !may_retry {
                        return Err(e);
                    }
                    if tokio::time::Instant::now() >= deadline {
                        return Err(ProxyError::UpstreamTimeout);
                    }
                    metrics::counter!(
                        "proxy_engine_upstream_retries_total",
                        "route" => ctx.route_id.clone(),
                    )
                    .increment(1);
                    debug!(
                        request_id = %ctx.request_id,
                        upstream = %candidate.id,
                        attempt = attempt + 1,
                        error = %e,
                        "retrying on next candidate"
                    );
                    attempt += 1;
                }
            }
        }
    }

    /// One attempt against one server: pool checkout, connect if needed,
    /// exchange under the request deadline.
    async fn try_dispatch(
        &self,
        req: &ProxyRequest,
        ctx: &RequestContext,
        group: &Arc<UpstreamGroup>,
        server: &UpstreamInstance,
        deadline: tokio::time::Instant,
    ) -> Result<(ResponseHead, PooledConnection, bool), ProxyError> {
        let key = PoolKey::new(server.host.clone(), server.port, server.scheme);

        let checkout = tokio::time::timeout_at(deadline, self.pool.acquire(&key))
            .await
            .map_err(|_| ProxyError::UpstreamTimeout)??;

        let mut conn = match checkout {
            Checkout::Reused(conn) => conn,
            Checkout::Connect(slot) => {
                let stream = tokio::time::timeout_at(
                    deadline,
                    self.connector.connect(
                        &server.host,
                        server.port,
                        server.scheme,
                        group.config().tls_verify(),
                        &self.buffers,
                    ),
                )
                .await
                .map_err(|_| ProxyError::UpstreamTimeout)??;
                slot.into_connection(stream)
            }
        };

        let upstream_head = build_upstream_head(&req.head, req.body.len(), ctx);

        let exchange = async {
            crate::upstream::transport::send_request(&mut conn.stream, &upstream_head, &req.body)
                .await?;
            crate::upstream::transport::read_response(&mut conn.stream).await
        };

        let head = match tokio::time::timeout_at(deadline, exchange).await {
            Ok(Ok(head)) => head,
            Ok(Err(e)) => {
                self.pool.discard(conn);
                return Err(e);
            }
            Err(_) => {
                // Deadline expired mid-exchange: the connection is in an
                // unknown state and is never returned to the pool.
                self.pool.discard(conn);
                return Err(ProxyError::UpstreamTimeout);
            }
        };

        let request_was_head = req.head.method == Method::HEAD;
        let kind = match head.body_kind(request_was_head) {
            Ok(kind) => kind,
            Err(e) => {
                self.pool.discard(conn);
                return Err(ProxyError::MalformedResponse(e.to_string()));
            }
        };
        conn.stream.begin_body(kind);

        let close_requested = connection_close(&head.headers);
        let reusable = kind.keeps_connection() && !close_requested;
        Ok((head, conn, reusable))
    }

    fn build_downstream_response(
        &self,
        mut head: ResponseHead,
        conn: PooledConnection,
        reusable: bool,
        guard: crate::upstream::RequestGuard,
    ) -> ProxyResponse {
        remove_hop_headers(&mut head.headers);
        let body = UpstreamBody::new(conn, self.pool.clone(), reusable, guard);
        ProxyResponse {
            head,
            body: ResponseBody::Upstream(body),
        }
    }

    /// Bind the session and emit the affinity cookie on success.
    fn apply_affinity(
        &self,
        group: &Arc<UpstreamGroup>,
        server: &UpstreamInstance,
        request_key: Option<String>,
        resp: &mut ProxyResponse,
    ) {
        let Some(affinity) = &group.affinity else {
            return;
        };
        match affinity.config().source {
            AffinitySource::Ip => {
                if let Some(key) = request_key {
                    affinity.bind(key, server.id.clone());
                }
            }
            AffinitySource::Cookie => {
                let (key, is_new) = match request_key {
                    Some(key) => (key, false),
                    None => (affinity.new_session_key(), true),
                };
                affinity.bind(key.clone(), server.id.clone());
                if is_new || resp.head.headers.get(SET_COOKIE).is_none() {
                    if let Ok(value) = HeaderValue::from_str(&affinity.set_cookie_value(&key)) {
                        resp.head.headers.append(SET_COOKIE, value);
                    }
                }
            }
        }
    }

    fn finalize_metrics(&self, ctx: &RequestContext, status: u16) {
        let mut buf = itoa::Buffer::new();
        metrics::counter!(
            "proxy_engine_requests_total",
            "route" => ctx.route_id.clone(),
            "method" => ctx.method.as_str().to_string(),
            "status_code" => buf.format(status).to_owned(),
        )
        .increment(1);
        metrics::histogram!(
            "proxy_engine_request_duration_seconds",
            "route" => ctx.route_id.clone(),
        )
        .record(ctx.start.elapsed().as_secs_f64());
    }
}

/// GET, HEAD, PUT, DELETE, OPTIONS may be retried on connection-level
/// failures; everything else must not.
pub fn is_idempotent(method: &Method) -> bool {
    *method == Method::GET
        || *method == Method::HEAD
        || *method == Method::PUT
        || *method == Method::DELETE
        || *method == Method::OPTIONS
}

/// Build the upstream request head: original method and target, client
/// headers minus hop-by-hop, the buffered body re-framed as Content-Length.
fn build_upstream_head(head: &RequestHead, body_len: usize, ctx: &RequestContext) -> RequestHead {
    let mut upstream = head.clone();
    remove_hop_headers(&mut upstream.headers);
    upstream.headers.remove(TRANSFER_ENCODING);
    if body_len > 0 || method_allows_body(&head.method) {
        let mut buf = itoa::Buffer::new();
        if let Ok(len) = HeaderValue::from_str(buf.format(body_len)) {
            upstream.headers.insert(CONTENT_LENGTH, len);
        }
    } else {
        upstream.headers.remove(CONTENT_LENGTH);
    }
    inject_forwarded_headers(&mut upstream.headers, ctx);
    upstream
}

fn method_allows_body(method: &Method) -> bool {
    *method != Method::GET && *method != Method::HEAD && *method != Method::OPTIONS
}

fn connection_close(headers: &http::HeaderMap) -> bool {
    headers
        .get(CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case("close")))
        .unwrap_or(false)
}

fn remove_hop_headers(headers: &mut http::HeaderMap) {
    let hop_headers: &[HeaderName] = &[
        CONNECTION,
        HeaderName::from_static("keep-alive"),
        HeaderName::from_static("proxy-authenticate"),
        HeaderName::from_static("proxy-authorization"),
        HeaderName::from_static("te"),
        HeaderName::from_static("trailers"),
        HeaderName::from_static("upgrade"),
    ];
    for h in hop_headers {
        headers.remove(h);
    }
}

/// Standard `X-Forwarded-*` / `X-Real-IP` injection so upstream services
/// can identify the original client.
fn inject_forwarded_headers(headers: &mut http::HeaderMap, ctx: &RequestContext) {
    static XFF: HeaderName = HeaderName::from_static("x-forwarded-for");
    static XFP: HeaderName = HeaderName::from_static("x-forwarded-proto");
    static XFH: HeaderName = HeaderName::from_static("x-forwarded-host");
    static XRI: HeaderName = HeaderName::from_static("x-real-ip");

    let peer_ip = ctx.client_ip.to_string();

    if let Some(existing) = headers.get(&XFF).and_then(|v| v.to_str().ok()) {
        let mut combined = String::with_capacity(existing.len() + 2 + peer_ip.len());
        combined.push_str(existing);
        combined.push_str(", ");
        combined.push_str(&peer_ip);
        if let Ok(v) = HeaderValue::from_str(&combined) {
            headers.insert(XFF.clone(), v);
        }
    } else if let Ok(v) = HeaderValue::from_str(&peer_ip) {
        headers.insert(XFF.clone(), v);
    }

    if !headers.contains_key(&XFP) {
        headers.insert(XFP.clone(), HeaderValue::from_static("http"));
    }

    if !ctx.host.is_empty() {
        if let Ok(v) = HeaderValue::from_str(&ctx.host) {
            headers.insert(XFH.clone(), v);
        }
    }

    if let Ok(v) = HeaderValue::from_str(&peer_ip) {
        headers.insert(XRI.clone(), v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;

    #[test]
    fn test_idempotent_methods() {
        for m in [
            Method::GET,
            Method::HEAD,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ] {
            assert!(is_idempotent(&m), "{} should be retriable", m);
        }
        for m in [Method::POST, Method::PATCH] {
            assert!(!is_idempotent(&m), "{} must not be retriable", m);
        }
    }

    #[test]
    fn test_upstream_head_strips_hop_headers_and_reframes() {
        let mut head = RequestHead::new(Method::POST, "/x");
        head.headers.insert(CONNECTION, "keep-alive".parse().unwrap());
        head.headers
            .insert(TRANSFER_ENCODING, "chunked".parse().unwrap());
        head.headers.insert("host", "front.example".parse().unwrap());
        let ctx = RequestContext::new(
            "rid".into(),
            "198.51.100.4".parse().unwrap(),
            "front.example".into(),
            "/x".into(),
            Method::POST,
        );

        let upstream = build_upstream_head(&head, 11, &ctx);
        assert!(upstream.headers.get(CONNECTION).is_none());
        assert!(upstream.headers.get(TRANSFER_ENCODING).is_none());
        assert_eq!(upstream.headers.get(CONTENT_LENGTH).unwrap(), "11");
        assert_eq!(
            upstream.headers.get("x-forwarded-for").unwrap(),
            "198.51.100.4"
        );
        assert_eq!(upstream.headers.get("x-real-ip").unwrap(), "198.51.100.4");
        assert_eq!(
            upstream.headers.get("x-forwarded-host").unwrap(),
            "front.example"
        );
        assert_eq!(upstream.headers.get("host").unwrap(), "front.example");
    }

    #[test]
    fn test_forwarded_for_appends() {
        let mut head = RequestHead::new(Method::GET, "/");
        head.headers
            .insert("x-forwarded-for", "203.0.113.1".parse().unwrap());
        let ctx = RequestContext::new(
            "rid".into(),
            "198.51.100.4".parse().unwrap(),
            "h".into(),
            "/".into(),
            Method::GET,
        );
        let upstream = build_upstream_head(&head, 0, &ctx);
        assert_eq!(
            upstream.headers.get("x-forwarded-for").unwrap(),
            "203.0.113.1, 198.51.100.4"
        );
    }

    #[test]
    fn test_connection_close_detection() {
        let mut headers = http::HeaderMap::new();
        assert!(!connection_close(&headers));
        headers.insert(CONNECTION, "close".parse().unwrap());
        assert!(connection_close(&headers));
        headers.insert(CONNECTION, "Keep-Alive, Close".parse().unwrap());
        assert!(connection_close(&headers));
        headers.insert(CONNECTION, "keep-alive".parse().unwrap());
        assert!(!connection_close(&headers));
    }
}
