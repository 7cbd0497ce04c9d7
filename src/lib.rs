//! Request admission and resilience pipeline shared by gRPC and REST services.
//!
//! - [`chain`]: priority-ordered middleware chain and registry
//! - [`middleware`]: inbound authentication, request ids, client IP resolution
//! - [`client`]: outbound credential injection and retries
//! - [`admission`]: rate limiting, IP restriction, content checks, security headers

pub mod admission;
pub mod chain;
pub mod client;
pub mod config;
pub mod middleware;
pub mod routes;
pub mod startup;
