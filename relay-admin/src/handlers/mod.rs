pub mod consumers;
pub mod dashboard;
pub mod health;
pub mod observability;
pub mod plugins;
pub mod routes;
pub mod services;
pub mod upstreams;
