//! Extension traits for `tonic::Request`.
//!
//! Provides ergonomic methods for reading the authenticated caller
//! from gRPC requests in service implementations.

use tonic::{Request, Status};

use crate::error::AppError;
use crate::identity::CallerIdentity;

/// Extension trait for extracting the caller from gRPC requests.
///
/// ```ignore
/// use svc_core::RequestAuthExt;
///
/// async fn record_event(&self, request: Request<Req>) -> Result<Response<Resp>, Status> {
///     let caller = request.caller()?;                 // Require authentication
///     let admin = request.caller_with_role("admin")?; // Require a role
///     // ...
/// }
/// ```
pub trait RequestAuthExt<T> {
    /// Extract the caller injected by the auth layer.
    ///
    /// # Errors
    /// Returns `Status::unauthenticated` if no identity is present
    /// (exempt method, or auth disabled).
    fn caller(&self) -> Result<CallerIdentity, Status>;

    /// Extract the caller and verify it carries `role`.
    ///
    /// # Errors
    /// - `Status::unauthenticated` if not authenticated
    /// - `Status::permission_denied` if the role is missing
    fn caller_with_role(&self, role: &str) -> Result<CallerIdentity, Status>;

    /// Try to extract the caller without failing.
    fn try_caller(&self) -> Option<CallerIdentity>;
}

impl<T> RequestAuthExt<T> for Request<T> {
    fn caller(&self) -> Result<CallerIdentity, Status> {
        self.extensions()
            .get::<CallerIdentity>()
            .cloned()
            .ok_or_else(|| AppError::unauthenticated("Authentication required").into())
    }

    fn caller_with_role(&self, role: &str) -> Result<CallerIdentity, Status> {
        let caller = self.caller()?;
        if !caller.has_role(role) {
            return Err(AppError::permission_denied("Insufficient permissions").into());
        }
        Ok(caller)
    }

    fn try_caller(&self) -> Option<CallerIdentity> {
        self.extensions().get::<CallerIdentity>().cloned()
    }
}
