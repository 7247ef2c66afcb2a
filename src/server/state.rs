//! Shared engine state and the compiled per-gateway runtime: route table,
//! middleware chain, handler, and listener-side TLS.

use crate::config::{EngineConfig, GatewayConfig, TlsMode};
use crate::error::ProxyError;
use crate::metrics::Metrics;
use crate::net::{BufferPool, PortManager};
use crate::pool::{ConnectionPool, PoolConfig};
use crate::proxy::{MiddlewareChain, ProxyHandler, ProxyStats};
use crate::routing::{PathPattern, Route, RouteTable};
use crate::upstream::{Connector, GroupStore, UpstreamGroup};
use arc_swap::ArcSwap;
use http::Method;
use std::sync::Arc;
use std::time::Duration;
use tokio_rustls::TlsAcceptor;

/// Shared engine-wide state, cheaply cloneable.
#[derive(Clone)]
pub struct EngineState {
    pub config: Arc<EngineConfig>,
    pub groups: GroupStore,
    pub pool: Arc<ConnectionPool>,
    pub buffers: Arc<BufferPool>,
    pub stats: Arc<ProxyStats>,
    pub ports: Arc<PortManager>,
    pub metrics: Option<Metrics>,
}

/// Listener-side TLS for one gateway.
pub struct GatewayTls {
    pub mode: TlsMode,
    /// Present for termination and re-encryption.
    pub acceptor: Option<TlsAcceptor>,
    pub sni_routing: bool,
}

/// Everything one listener needs per request, compiled once at startup.
pub struct GatewayRuntime {
    pub name: String,
    pub config: GatewayConfig,
    pub routes: Arc<ArcSwap<RouteTable>>,
    pub chain: MiddlewareChain,
    pub handler: ProxyHandler,
    pub tls: Option<GatewayTls>,
}

impl EngineState {
    /// Build shared state and compile every gateway. Fails on an invalid
    /// TLS setup; all other config problems were rejected at load time.
    pub fn new(config: EngineConfig) -> Result<(Self, Vec<Arc<GatewayRuntime>>), ProxyError> {
        let metrics = if config.metrics {
            Metrics::install()
        } else {
            None
        };

        let state = Self {
            config: Arc::new(config),
            groups: GroupStore::new(),
            pool: ConnectionPool::new(PoolConfig::default()),
            buffers: BufferPool::new(),
            stats: Arc::new(ProxyStats::new()),
            ports: Arc::new(PortManager::new()),
            metrics,
        };

        let mut gateways = Vec::with_capacity(state.config.gateways.len());
        for (gi, gateway) in state.config.gateways.clone().iter().enumerate() {
            gateways.push(Arc::new(state.compile_gateway(gi, gateway)?));
        }
        Ok((state, gateways))
    }

    fn compile_gateway(
        &self,
        index: usize,
        gateway: &GatewayConfig,
    ) -> Result<GatewayRuntime, ProxyError> {
        let name = format!("gateway-{}", index);

        let mut routes = Vec::with_capacity(gateway.routes.len());
        for route in &gateway.routes {
            let group_id = format!("{}.{}", name, route.id);
            self.groups
                .insert(UpstreamGroup::new(group_id.clone(), route.upstream.clone()));

            let methods = if route.methods.is_empty() {
                None
            } else {
                let set = route
                    .methods
                    .iter()
                    .filter_map(|m| Method::from_bytes(m.as_bytes()).ok())
                    .collect();
                Some(set)
            };

            routes.push(Route {
                id: route.id.clone(),
                pattern: PathPattern::parse(&route.path_pattern),
                methods,
                host_pattern: route.host_pattern.clone(),
                priority: route.priority,
                enabled: route.enabled,
                group_id,
                metadata: route.metadata.clone(),
            });
        }

        let routes = Arc::new(ArcSwap::new(Arc::new(RouteTable::new(routes))));

        let handler = ProxyHandler {
            routes: routes.clone(),
            groups: self.groups.clone(),
            pool: self.pool.clone(),
            connector: Arc::new(Connector::new(Duration::from_secs_f64(
                gateway.connection_timeout,
            ))),
            buffers: self.buffers.clone(),
            stats: self.stats.clone(),
        };

        let tls = match &gateway.tls {
            None => None,
            Some(tls) => {
                let acceptor = match tls.mode {
                    TlsMode::Passthrough => None,
                    TlsMode::Termination | TlsMode::Reencrypt => {
                        let (cert, key) = match (&tls.cert_file, &tls.key_file) {
                            (Some(cert), Some(key)) => (cert, key),
                            _ => {
                                return Err(ProxyError::Configuration(format!(
                                    "{}: tls requires certFile and keyFile",
                                    name
                                )))
                            }
                        };
                        let server_config = crate::tls::load_server_config(cert, key)?;
                        Some(TlsAcceptor::from(server_config))
                    }
                };
                Some(GatewayTls {
                    mode: tls.mode,
                    acceptor,
                    sni_routing: tls.sni_routing,
                })
            }
        };

        Ok(GatewayRuntime {
            name,
            config: gateway.clone(),
            routes,
            chain: MiddlewareChain::from_config(&gateway.middleware),
            handler,
            tls,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_builds_groups_and_routes() {
        let config = EngineConfig::default_single_gateway("127.0.0.1", 8080);
        let (state, gateways) = EngineState::new(config).unwrap();
        assert_eq!(gateways.len(), 1);
        assert_eq!(state.groups.len(), 1);

        let gw = &gateways[0];
        let table = gw.routes.load();
        let matched = table.match_route("x", "/anything", &Method::GET).unwrap();
        assert_eq!(matched.id, "default");
        assert!(state.groups.get(&matched.group_id).is_some());
        assert!(gw.tls.is_none());
        assert!(gw.chain.is_empty());
    }
}
