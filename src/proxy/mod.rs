pub mod context;
pub mod handler;
pub mod middleware;
pub mod rate_limit;
pub mod stats;

pub use context::{MetaValue, ProxyRequest, ProxyResponse, RequestContext, ResponseBody};
pub use handler::ProxyHandler;
pub use middleware::{Middleware, MiddlewareChain, Next, Terminal};
pub use stats::ProxyStats;
