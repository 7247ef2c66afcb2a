//! Per-request context and the request/response shapes that flow through
//! the middleware chain and handler.

use crate::codec::{RequestHead, ResponseHead};
use crate::error::ProxyError;
use crate::pool::{ConnectionPool, PooledConnection};
use crate::upstream::RequestGuard;
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use http::StatusCode;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

pub static X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// Values middlewares pass to each other through the request's metadata
/// bag. Single-threaded per request; no locking.
#[derive(Debug, Clone, PartialEq)]
pub enum MetaValue {
    Str(String),
    Int(i64),
    Bool(bool),
}

impl MetaValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetaValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

/// A fully-read client request. The body is buffered at intake (bounded by
/// the listener) so retries can replay it.
pub struct ProxyRequest {
    pub head: RequestHead,
    pub body: Bytes,
}

pub struct RequestContext {
    pub request_id: String,
    pub client_ip: IpAddr,
    pub host: String,
    pub path: String,
    pub method: http::Method,
    pub route_id: String,
    pub upstream_server: String,
    pub start: Instant,
    pub metadata: HashMap<String, MetaValue>,
}

impl RequestContext {
    pub fn new(
        request_id: String,
        client_ip: IpAddr,
        host: String,
        path: String,
        method: http::Method,
    ) -> Self {
        Self {
            request_id,
            client_ip,
            host,
            path,
            method,
            route_id: String::new(),
            upstream_server: String::new(),
            start: Instant::now(),
            metadata: HashMap::new(),
        }
    }

    pub fn set_meta(&mut self, key: impl Into<String>, value: MetaValue) {
        self.metadata.insert(key.into(), value);
    }

    pub fn meta(&self, key: &str) -> Option<&MetaValue> {
        self.metadata.get(key)
    }

    /// Single exit point for error responses: status from the error kind,
    /// short plain-text body, `x-request-id` always attached.
    pub fn error_response(&self, error: &ProxyError) -> ProxyResponse {
        self.plain_response(error.status(), error.body_text())
    }

    pub fn plain_response(&self, status: StatusCode, body: &str) -> ProxyResponse {
        let mut head = ResponseHead::new(status);
        head.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        let body = Bytes::copy_from_slice(body.as_bytes());
        let mut buf = itoa::Buffer::new();
        if let Ok(len) = HeaderValue::from_str(buf.format(body.len())) {
            head.headers.insert(CONTENT_LENGTH, len);
        }
        if let Ok(id) = HeaderValue::from_str(&self.request_id) {
            head.headers.insert(X_REQUEST_ID.clone(), id);
        }
        ProxyResponse {
            head,
            body: ResponseBody::Full(body),
        }
    }
}

pub struct ProxyResponse {
    pub head: ResponseHead,
    pub body: ResponseBody,
}

impl ProxyResponse {
    pub fn status(&self) -> StatusCode {
        self.head.status
    }
}

impl std::fmt::Debug for ProxyResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyResponse")
            .field("head", &self.head)
            .finish_non_exhaustive()
    }
}

pub enum ResponseBody {
    /// Body fully in memory (locally-generated responses).
    Full(Bytes),
    /// Body streamed lazily off the pooled upstream connection.
    Upstream(UpstreamBody),
}

/// Lazy, non-restartable response body. Frames are pulled straight off the
/// pooled connection; when the body completes the connection goes back to
/// the pool (or is discarded when the exchange said close). Dropping the
/// body mid-stream discards the connection — it can never be reused with a
/// half-read body.
pub struct UpstreamBody {
    conn: Option<PooledConnection>,
    pool: Arc<ConnectionPool>,
    reusable: bool,
    guard: Option<RequestGuard>,
}

impl UpstreamBody {
    pub fn new(
        conn: PooledConnection,
        pool: Arc<ConnectionPool>,
        reusable: bool,
        guard: RequestGuard,
    ) -> Self {
        Self {
            conn: Some(conn),
            pool,
            reusable,
            guard: Some(guard),
        }
    }

    pub async fn next_frame(&mut self) -> Result<Option<Bytes>, ProxyError> {
        let Some(conn) = self.conn.as_mut() else {
            return Ok(None);
        };
        match conn.stream.next_body_frame().await {
            Ok(Some(frame)) => Ok(Some(frame)),
            Ok(None) => {
                let conn = self.conn.take().unwrap();
                self.pool.release(conn, self.reusable);
                self.guard.take();
                Ok(None)
            }
            Err(e) => {
                let conn = self.conn.take().unwrap();
                self.pool.discard(conn);
                self.guard.take();
                Err(ProxyError::UpstreamExchange {
                    message: e.to_string(),
                    bytes_received: true,
                })
            }
        }
    }
}

impl Drop for UpstreamBody {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.discard(conn);
        }
    }
}

/// Generate a request id for requests that arrive without one.
pub fn generate_request_id() -> String {
    use rand::Rng;
    let mut bytes = [0u8; 8];
    rand::thread_rng().fill(&mut bytes);
    let mut out = String::with_capacity(16);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}
