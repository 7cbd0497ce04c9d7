//! Tower middleware shared by the gRPC and REST surfaces.
//!
//! # Middleware Order
//! When using `.layer()` on a router the outermost layer is added last.
//! Requests flow outermost → innermost → handler.
//!
//! Recommended order (outermost first):
//! 1. CatchPanicLayer
//! 2. RequestIdLayer - Extract/generate request ID first
//! 3. TraceLayer - Request tracing with spans
//! 4. TimeoutLayer - Request timeout
//! 5. CorsLayer - CORS handling
//! 6. AuthLayer (gRPC) / AdmissionLayer (REST)

pub mod auth;
pub mod client_ip;
pub mod request_id;

pub use auth::{API_KEY_HEADER, AuthConfig, AuthError, AuthInterceptor, AuthLayer, CallMetadata};
pub use client_ip::ClientIp;
pub use request_id::{REQUEST_ID_HEADER, RequestId, RequestIdLayer};
