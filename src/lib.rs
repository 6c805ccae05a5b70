//! vProx: a host-header-routed reverse proxy for blockchain node services.
//!
//! One listener terminates HTTP/1.1 and WebSocket, routes to per-chain
//! backends by path prefix or virtual host, optionally rewrites HTML index
//! pages, and shields backends with a per-IP token-bucket limiter that can
//! auto-quarantine offenders.

pub mod backup;
pub mod config;
pub mod error;
pub mod geo;
pub mod limit;
pub mod observability;
pub mod proxy;
pub mod registry;
