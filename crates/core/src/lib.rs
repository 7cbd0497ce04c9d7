//! Core library with shared types, traits, and error handling.
//!
//! This crate provides reusable components for gRPC services:
//! - Error types with automatic Status conversion
//! - Caller identity attached to authenticated requests
//! - Extension traits for reading the caller from a `tonic::Request`
//! - JWT token issuing and validation (with `jwt` feature)

pub mod error;
pub mod identity;
#[cfg(feature = "jwt")]
pub mod jwt;
pub mod request_ext;

pub use error::{AppError, StatusExt};
pub use identity::{AuthMethod, CallerIdentity};
#[cfg(feature = "jwt")]
pub use jwt::{Audience, Claims, JwtError, JwtValidator, TokenSubject};
pub use request_ext::RequestAuthExt;
