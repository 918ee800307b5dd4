pub mod config;
pub mod consumer;
pub mod context;
pub mod error;
pub mod lru;
pub mod pii;
pub mod plugin_config;
pub mod route;
pub mod router;
pub mod service;
pub mod ssl;
pub mod upstream;

pub use config::GatewayConfig;
pub use context::{ContextPool, RequestContext};
pub use error::RelayError;
pub use route::Route;
pub use router::Router;
pub use service::Service;
pub use upstream::{CircuitState, NodeRuntimeState, NodeRuntimeTable, Upstream};
