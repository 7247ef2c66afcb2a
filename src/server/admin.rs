//! Admin endpoints: Prometheus `/metrics` and the JSON `/health` probe,
//! served over the engine's own codec.

use crate::codec::{HttpStream, ResponseHead};
use crate::error::ProxyError;
use http::header::{HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use http::StatusCode;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::memory;
use super::runtime::{RuntimeStateKind, RuntimeStatus};
use super::state::EngineState;

pub async fn run_admin_server(
    port: u16,
    state: EngineState,
    status: Arc<RuntimeStatus>,
    cancel: CancellationToken,
) -> Result<(), ProxyError> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|source| ProxyError::Bind { addr, source })?;
    info!(
        "server: admin listening, addr={}",
        listener.local_addr().map_err(|source| ProxyError::Bind {
            addr: format!("0.0.0.0:{}", port),
            source
        })?
    );

    loop {
        let accepted = tokio::select! {
            result = listener.accept() => result,
            _ = cancel.cancelled() => return Ok(()),
        };
        let (stream, _) = match accepted {
            Ok(v) => v,
            Err(e) => {
                debug!("server: admin accept failed: {}", e);
                continue;
            }
        };

        let state = state.clone();
        let status = status.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut http = HttpStream::new(stream, &state.buffers);
            loop {
                let head = tokio::select! {
                    result = http.read_request_head() => match result {
                        Ok(Some(head)) => head,
                        _ => return,
                    },
                    _ = cancel.cancelled() => return,
                };

                let (status_code, content_type, body) = match head.path() {
                    "/metrics" => {
                        refresh_gauges(&status);
                        let body = state
                            .metrics
                            .as_ref()
                            .map(|m| m.render())
                            .unwrap_or_default();
                        (
                            StatusCode::OK,
                            "text/plain; version=0.0.4; charset=utf-8",
                            body,
                        )
                    }
                    "/health" | "/healthz" => {
                        let running = status.kind() == RuntimeStateKind::Running;
                        let code = if running {
                            StatusCode::OK
                        } else {
                            StatusCode::SERVICE_UNAVAILABLE
                        };
                        let body = serde_json::json!({
                            "status": state_name(status.kind()),
                            "uptime": status.uptime().as_secs(),
                            "timestamp": SystemTime::now()
                                .duration_since(UNIX_EPOCH)
                                .map(|d| d.as_secs())
                                .unwrap_or(0),
                        })
                        .to_string();
                        (code, "application/json", body)
                    }
                    _ => (
                        StatusCode::NOT_FOUND,
                        "text/plain",
                        "not found".to_string(),
                    ),
                };

                let mut resp = ResponseHead::new(status_code);
                resp.headers
                    .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
                let mut buf = itoa::Buffer::new();
                if let Ok(len) = HeaderValue::from_str(buf.format(body.len())) {
                    resp.headers.insert(CONTENT_LENGTH, len);
                }
                if http.write_response_head(&resp).await.is_err()
                    || http.write_body_frame(body.as_bytes(), false).await.is_err()
                    || http.flush().await.is_err()
                {
                    return;
                }
            }
        });
    }
}

/// The gauges the scrape contract requires, refreshed at scrape time.
fn refresh_gauges(status: &RuntimeStatus) {
    metrics::gauge!("proxy_engine_state").set(status.kind() as u8 as f64);
    metrics::gauge!("proxy_engine_uptime_seconds").set(status.uptime().as_secs_f64());
    metrics::gauge!("proxy_engine_active_gateways").set(status.active_gateways() as f64);
    memory::record_gauges();
}

fn state_name(kind: RuntimeStateKind) -> &'static str {
    match kind {
        RuntimeStateKind::Stopped => "stopped",
        RuntimeStateKind::Starting => "starting",
        RuntimeStateKind::Running => "running",
        RuntimeStateKind::Stopping => "stopping",
        RuntimeStateKind::Error => "error",
    }
}
