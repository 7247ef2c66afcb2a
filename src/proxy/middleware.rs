//! Ordered middleware pipeline with continuation semantics.
//!
//! Each middleware receives the request and a [`Next`] continuation and
//! returns a response. Code before `next.run(..)` is the request phase;
//! code after the await is the response phase, which therefore executes in
//! reverse registration order. Returning without invoking the continuation
//! short-circuits everything downstream — neither phase of later
//! middlewares runs, and the upstream dispatch never happens. A failing
//! middleware unwinds the chain and surfaces as a 500 after being logged
//! with the request id.

use crate::config::MiddlewareConfig;
use crate::error::ProxyError;
use http::header::HeaderName;
use http::{HeaderValue, StatusCode};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use super::context::{MetaValue, ProxyRequest, ProxyResponse, RequestContext, X_REQUEST_ID};
use super::rate_limit::{MemoryRateLimitStore, RateLimitStore};

type ResponseFuture<'a> = Pin<Box<dyn Future<Output = Result<ProxyResponse, ProxyError>> + Send + 'a>>;

/// The terminal continuation at the end of the chain — the reverse-proxy
/// handler. Terminal errors are converted to responses internally, so only
/// middleware failures travel the chain as `Err`.
pub trait Terminal: Send + Sync {
    fn call<'a>(
        &'a self,
        req: &'a mut ProxyRequest,
        ctx: &'a mut RequestContext,
    ) -> Pin<Box<dyn Future<Output = ProxyResponse> + Send + 'a>>;
}

/// How rate-limit state is keyed.
#[derive(Debug, Clone)]
pub enum RateLimitIdentifier {
    Ip,
    Principal,
    Header(HeaderName),
}

impl RateLimitIdentifier {
    fn parse(key: &str) -> Self {
        if let Some(name) = key.strip_prefix("header:") {
            if let Ok(header) = HeaderName::from_bytes(name.as_bytes()) {
                return RateLimitIdentifier::Header(header);
            }
            warn!("rate_limit: invalid header key '{}', falling back to ip", name);
            return RateLimitIdentifier::Ip;
        }
        match key {
            "principal" => RateLimitIdentifier::Principal,
            _ => RateLimitIdentifier::Ip,
        }
    }
}

pub enum Middleware {
    /// Ensures every request carries `x-request-id` both upstream and on
    /// the response.
    RequestId,
    /// One structured access-log line per request.
    AccessLog,
    /// Static token check against a configured header.
    Auth { header: HeaderName, token: String },
    RateLimit {
        limit: u64,
        window: Duration,
        identifier: RateLimitIdentifier,
        store: Arc<dyn RateLimitStore>,
    },
}

impl Middleware {
    fn handle<'a>(
        &'a self,
        req: &'a mut ProxyRequest,
        ctx: &'a mut RequestContext,
        next: Next<'a>,
    ) -> ResponseFuture<'a> {
        Box::pin(async move {
            match self {
                Middleware::RequestId => {
                    if let Ok(id) = HeaderValue::from_str(&ctx.request_id) {
                        req.head.headers.insert(X_REQUEST_ID.clone(), id.clone());
                        let mut resp = next.run(req, ctx).await?;
                        resp.head
                            .headers
                            .entry(X_REQUEST_ID.clone())
                            .or_insert(id);
                        return Ok(resp);
                    }
                    next.run(req, ctx).await
                }
                Middleware::AccessLog => {
                    let start = Instant::now();
                    let resp = next.run(req, ctx).await?;
                    info!(
                        request_id = %ctx.request_id,
                        client_ip = %ctx.client_ip,
                        method = %ctx.method,
                        host = %ctx.host,
                        path = %ctx.path,
                        status = resp.status().as_u16(),
                        route = %ctx.route_id,
                        upstream = %ctx.upstream_server,
                        latency_ms = %start.elapsed().as_millis(),
                        "access"
                    );
                    Ok(resp)
                }
                Middleware::Auth { header, token } => {
                    let presented = req
                        .head
                        .headers
                        .get(header)
                        .and_then(|v| v.to_str().ok());
                    let authorized = matches!(presented, Some(v) if v == token
                        || v.strip_prefix("Bearer ") == Some(token.as_str()));
                    if !authorized {
                        metrics::counter!("proxy_engine_auth_rejected_total").increment(1);
                        return Ok(ctx.plain_response(StatusCode::UNAUTHORIZED, "unauthorized"));
                    }
                    ctx.set_meta("principal", MetaValue::Str(token_owner(token)));
                    next.run(req, ctx).await
                }
                Middleware::RateLimit {
                    limit,
                    window,
                    identifier,
                    store,
                } => {
                    let key = match identifier {
                        RateLimitIdentifier::Ip => ctx.client_ip.to_string(),
                        RateLimitIdentifier::Principal => ctx
                            .meta("principal")
                            .and_then(|m| m.as_str())
                            .unwrap_or("anonymous")
                            .to_string(),
                        RateLimitIdentifier::Header(name) => req
                            .head
                            .headers
                            .get(name)
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or("")
                            .to_string(),
                    };
                    let count = store.increment(&key, *window, Instant::now());
                    if count > *limit {
                        metrics::counter!("proxy_engine_rate_limited_total").increment(1);
                        return Ok(
                            ctx.plain_response(StatusCode::TOO_MANY_REQUESTS, "rate limited")
                        );
                    }
                    ctx.set_meta("rate_limit_remaining", MetaValue::Int(*limit as i64 - count as i64));
                    next.run(req, ctx).await
                }
            }
        })
    }
}

/// The anonymous principal for a static token is the token's fingerprint,
/// not the token itself.
fn token_owner(token: &str) -> String {
    format!("token:{:08x}", fnv32(token.as_bytes()))
}

fn fnv32(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// Continuation over the remaining middlewares and the terminal handler.
pub struct Next<'a> {
    rest: &'a [Middleware],
    terminal: &'a dyn Terminal,
}

impl<'a> Next<'a> {
    pub async fn run(
        self,
        req: &mut ProxyRequest,
        ctx: &mut RequestContext,
    ) -> Result<ProxyResponse, ProxyError> {
        match self.rest.split_first() {
            Some((middleware, rest)) => {
                middleware
                    .handle(
                        req,
                        ctx,
                        Next {
                            rest,
                            terminal: self.terminal,
                        },
                    )
                    .await
            }
            None => Ok(self.terminal.call(req, ctx).await),
        }
    }
}

pub struct MiddlewareChain {
    middlewares: Vec<Middleware>,
}

impl MiddlewareChain {
    pub fn new(middlewares: Vec<Middleware>) -> Self {
        Self { middlewares }
    }

    /// Build the chain once per gateway at startup.
    pub fn from_config(configs: &[MiddlewareConfig]) -> Self {
        let middlewares = configs
            .iter()
            .map(|cfg| match cfg {
                MiddlewareConfig::RequestId => Middleware::RequestId,
                MiddlewareConfig::AccessLog => Middleware::AccessLog,
                MiddlewareConfig::Auth { header, token } => Middleware::Auth {
                    header: HeaderName::from_bytes(header.as_bytes())
                        .unwrap_or_else(|_| http::header::AUTHORIZATION),
                    token: token.clone(),
                },
                MiddlewareConfig::RateLimit { limit, window, key } => Middleware::RateLimit {
                    limit: *limit,
                    window: Duration::from_secs_f64(*window),
                    identifier: RateLimitIdentifier::parse(key),
                    store: Arc::new(MemoryRateLimitStore::new()),
                },
            })
            .collect();
        Self { middlewares }
    }

    pub fn len(&self) -> usize {
        self.middlewares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middlewares.is_empty()
    }

    /// Rate-limit stores in this chain, for the runtime's periodic sweep.
    pub fn rate_limit_stores(&self) -> Vec<Arc<dyn RateLimitStore>> {
        self.middlewares
            .iter()
            .filter_map(|middleware| match middleware {
                Middleware::RateLimit { store, .. } => Some(store.clone()),
                _ => None,
            })
            .collect()
    }

    /// Run the full pipeline. Middleware failures stop the chain and
    /// surface as a 500 tagged with the request id.
    pub async fn run(
        &self,
        req: &mut ProxyRequest,
        ctx: &mut RequestContext,
        terminal: &dyn Terminal,
    ) -> ProxyResponse {
        let next = Next {
            rest: &self.middlewares,
            terminal,
        };
        match next.run(req, ctx).await {
            Ok(resp) => resp,
            Err(e) => {
                error!(
                    request_id = %ctx.request_id,
                    error = %e,
                    "middleware failure"
                );
                ctx.error_response(&ProxyError::Middleware(e.to_string()))
            }
        }
    }
}
