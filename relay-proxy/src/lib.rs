pub mod balancer;
pub mod breaker;
pub mod compression;
pub mod connection;
pub mod fallback;
pub mod health_check;
pub mod proxy;
pub mod retry;
pub mod websocket;
pub mod worker;
