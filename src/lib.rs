pub mod codec;
pub mod config;
pub mod error;
pub mod metrics;
pub mod net;
pub mod pool;
pub mod proxy;
pub mod routing;
pub mod server;
pub mod tls;
pub mod upstream;
