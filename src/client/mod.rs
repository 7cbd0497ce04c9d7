//! Outbound gRPC helpers: credential injection and retries.

pub mod auth;
pub mod retry;

pub use auth::ClientAuthInterceptor;
pub use retry::{
    CallContext, GrpcError, RetryConfig, RetryConfigError, RetryPolicy, Retryability, classify,
};
