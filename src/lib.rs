//! Keyrelay - credential pooling reverse proxy
//!
//! Clients present one token; the proxy swaps it for one of several real
//! upstream credentials, round robin, and forwards the request.

pub mod config;
pub mod http;
pub mod proxy;
pub mod server;
