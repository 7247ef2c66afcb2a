use http::StatusCode;
use std::fmt;

/// Request-path and startup error kinds. Codec and transport failures are
/// converted into these at the proxy handler, which owns retry policy and
/// the mapping to downstream status codes.
#[derive(Debug)]
pub enum ProxyError {
    /// Invalid configuration, surfaced only at startup. Exit code 2.
    Configuration(String),
    /// A listener could not claim its port. Aborts startup.
    Bind { addr: String, source: std::io::Error },
    /// No route matched the request.
    RouteNotFound,
    /// The matched route has no selectable server.
    UpstreamUnavailable,
    /// TCP/TLS connect to the upstream failed. Retriable on safe methods.
    UpstreamConnect(String),
    /// The request was sent but the response did not complete.
    /// `bytes_received` decides retriability: only a connection that died
    /// before any response bytes may be retried, and only for safe methods.
    UpstreamExchange {
        message: String,
        bytes_received: bool,
    },
    /// The dispatched request exceeded the per-request deadline.
    UpstreamTimeout,
    /// The client sent something the codec rejects.
    MalformedRequest(String),
    /// The upstream sent something the codec rejects.
    MalformedResponse(String),
    /// A middleware failed; logged with the request id, surfaces as 500.
    Middleware(String),
    /// `acquire` was called after the pool shut down.
    PoolShutdown,
}

impl ProxyError {
    /// Downstream status for this error kind.
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::Configuration(_) | ProxyError::Bind { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ProxyError::RouteNotFound => StatusCode::NOT_FOUND,
            ProxyError::UpstreamUnavailable | ProxyError::PoolShutdown => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ProxyError::UpstreamConnect(_)
            | ProxyError::UpstreamExchange { .. }
            | ProxyError::MalformedResponse(_) => StatusCode::BAD_GATEWAY,
            ProxyError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::MalformedRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::Middleware(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short plain-text body for the error response.
    pub fn body_text(&self) -> &'static str {
        match self {
            ProxyError::Configuration(_) | ProxyError::Bind { .. } => "internal server error",
            ProxyError::RouteNotFound => "no route matched",
            ProxyError::UpstreamUnavailable => "no upstream available",
            ProxyError::PoolShutdown => "shutting down",
            ProxyError::UpstreamConnect(_) => "upstream connect failed",
            ProxyError::UpstreamExchange { .. } => "upstream exchange failed",
            ProxyError::MalformedResponse(_) => "invalid upstream response",
            ProxyError::UpstreamTimeout => "upstream timeout",
            ProxyError::MalformedRequest(_) => "bad request",
            ProxyError::Middleware(_) => "internal server error",
        }
    }

    /// Whether this failure kind may be retried on another candidate,
    /// assuming the method itself is idempotent.
    pub fn retriable(&self) -> bool {
        match self {
            ProxyError::UpstreamConnect(_) => true,
            ProxyError::UpstreamExchange { bytes_received, .. } => !bytes_received,
            _ => false,
        }
    }
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyError::Configuration(msg) => write!(f, "configuration error: {}", msg),
            ProxyError::Bind { addr, source } => write!(f, "bind {} failed: {}", addr, source),
            ProxyError::RouteNotFound => write!(f, "no route matched"),
            ProxyError::UpstreamUnavailable => write!(f, "no upstream available"),
            ProxyError::UpstreamConnect(msg) => write!(f, "upstream connect error: {}", msg),
            ProxyError::UpstreamExchange { message, .. } => {
                write!(f, "upstream exchange error: {}", message)
            }
            ProxyError::UpstreamTimeout => write!(f, "upstream timeout"),
            ProxyError::MalformedRequest(msg) => write!(f, "malformed request: {}", msg),
            ProxyError::MalformedResponse(msg) => write!(f, "malformed response: {}", msg),
            ProxyError::Middleware(msg) => write!(f, "middleware error: {}", msg),
            ProxyError::PoolShutdown => write!(f, "connection pool is shut down"),
        }
    }
}

impl std::error::Error for ProxyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProxyError::Bind { source, .. } => Some(source),
            _ => None,
        }
    }
}
