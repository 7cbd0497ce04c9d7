//! Authentication for inbound gRPC calls.
//!
//! [`AuthInterceptor`] holds the policy: exempt methods, pre-shared service API
//! keys (checked first), then `Bearer` JWTs. It is applied either through
//! [`AuthLayer`], which covers every call on a router (unary and streaming
//! calls both arrive as HTTP/2 requests), or explicitly on a `tonic::Request`
//! via [`AuthInterceptor::authorize_unary`] / [`AuthInterceptor::authorize_streaming`].
//!
//! On success a [`CallerIdentity`] is inserted into request extensions.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use http::header::{AUTHORIZATION, CONTENT_TYPE, WWW_AUTHENTICATE};
use http::{HeaderMap, HeaderValue, Request, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use subtle::ConstantTimeEq;
use svc_core::{AppError, CallerIdentity, JwtValidator};
use tonic::Status;
use tonic::metadata::MetadataMap;
use tower::{Layer, Service};
use tracing::{Span, debug, warn};

/// Metadata key carrying a pre-shared service secret.
pub const API_KEY_HEADER: &str = "x-api-key";

const BEARER_SCHEME: &str = "Bearer";

/// Authentication settings, built once at startup.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub enabled: bool,
    pub jwt_secret: SecretString,
    pub jwt_issuer: String,
    pub jwt_audience: String,
    /// Full method paths, e.g. `/grpc.health.v1.Health/Check`.
    pub exempt_methods: HashSet<String>,
    /// Service name to secret.
    pub api_keys: HashMap<String, SecretString>,
}

/// Caller-visible authentication failures. All map to `Unauthenticated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("missing metadata")]
    MissingMetadata,
    #[error("invalid authorization header format")]
    InvalidFormat,
    #[error("invalid or expired token")]
    InvalidToken,
}

impl From<AuthError> for Status {
    fn from(err: AuthError) -> Self {
        AppError::unauthenticated(err.to_string()).into()
    }
}

/// Read access to call metadata, shared by HTTP headers and tonic metadata.
pub trait CallMetadata {
    fn value(&self, key: &str) -> Option<&str>;
    fn is_empty(&self) -> bool;
}

impl CallMetadata for HeaderMap {
    fn value(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|v| v.to_str().ok())
    }

    fn is_empty(&self) -> bool {
        HeaderMap::is_empty(self)
    }
}

impl CallMetadata for MetadataMap {
    fn value(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|v| v.to_str().ok())
    }

    fn is_empty(&self) -> bool {
        MetadataMap::is_empty(self)
    }
}

#[derive(Debug, Clone, Copy)]
enum CallKind {
    Unary,
    Streaming,
}

impl CallKind {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Unary => "unary",
            Self::Streaming => "streaming",
        }
    }
}

/// Authentication policy for inbound calls.
///
/// Cheap to clone; config and keys are shared.
#[derive(Clone)]
pub struct AuthInterceptor {
    config: Arc<AuthConfig>,
    validator: JwtValidator,
}

impl AuthInterceptor {
    #[must_use]
    pub fn new(config: AuthConfig) -> Self {
        let validator =
            JwtValidator::new(&config.jwt_secret, &config.jwt_issuer, &config.jwt_audience);
        Self {
            config: Arc::new(config),
            validator,
        }
    }

    /// Validator sharing this interceptor's secret, issuer and audience.
    #[must_use]
    pub const fn validator(&self) -> &JwtValidator {
        &self.validator
    }

    /// Whether `method` bypasses authentication entirely.
    #[must_use]
    pub fn is_exempt(&self, method: &str) -> bool {
        !self.config.enabled || self.config.exempt_methods.contains(method)
    }

    /// Decide on one call.
    ///
    /// Returns `Ok(None)` for exempt calls (no identity attached) and
    /// `Ok(Some(identity))` for authenticated ones.
    pub fn authenticate<M: CallMetadata + ?Sized>(
        &self,
        method: &str,
        metadata: &M,
    ) -> Result<Option<CallerIdentity>, AuthError> {
        if self.is_exempt(method) {
            return Ok(None);
        }

        if metadata.is_empty() {
            warn!(method, "Missing metadata");
            return Err(AuthError::MissingMetadata);
        }

        if let Some(service) = metadata
            .value(API_KEY_HEADER)
            .and_then(|key| self.match_api_key(key))
        {
            debug!(method, service, auth_method = "api_key", "Authenticated");
            return Ok(Some(CallerIdentity::service(service)));
        }

        let Some(token) = metadata
            .value(AUTHORIZATION.as_str())
            .and_then(parse_bearer)
        else {
            warn!(method, "Invalid authorization header format");
            return Err(AuthError::InvalidFormat);
        };

        match self.validator.authenticate(token) {
            Ok(identity) => {
                debug!(
                    method,
                    user_id = %identity.user_id,
                    username = identity.username.as_deref(),
                    roles = ?identity.roles,
                    auth_method = "jwt",
                    "Authenticated"
                );
                Ok(Some(identity))
            }
            Err(err) => {
                warn!(method, error = %err, "Invalid or expired token");
                Err(AuthError::InvalidToken)
            }
        }
    }

    /// Authenticate a unary call and attach the caller to its extensions.
    ///
    /// # Errors
    /// `Status::unauthenticated` on any authentication failure.
    pub fn authorize_unary<T>(
        &self,
        method: &str,
        request: tonic::Request<T>,
    ) -> Result<tonic::Request<T>, Status> {
        self.authorize(CallKind::Unary, method, request)
    }

    /// Authenticate a streaming call before the handler sees the first message.
    ///
    /// # Errors
    /// `Status::unauthenticated` on any authentication failure.
    pub fn authorize_streaming<T>(
        &self,
        method: &str,
        request: tonic::Request<T>,
    ) -> Result<tonic::Request<T>, Status> {
        self.authorize(CallKind::Streaming, method, request)
    }

    fn authorize<T>(
        &self,
        kind: CallKind,
        method: &str,
        mut request: tonic::Request<T>,
    ) -> Result<tonic::Request<T>, Status> {
        let decision = self.authenticate(method, request.metadata());
        match decision {
            Ok(Some(identity)) => {
                request.extensions_mut().insert(identity);
                Ok(request)
            }
            Ok(None) => Ok(request),
            Err(err) => {
                debug!(method, call = kind.as_str(), error = %err, "Call rejected");
                Err(err.into())
            }
        }
    }

    fn match_api_key(&self, presented: &str) -> Option<&str> {
        self.config
            .api_keys
            .iter()
            .find(|(_, secret)| {
                bool::from(presented.as_bytes().ct_eq(secret.expose_secret().as_bytes()))
            })
            .map(|(service, _)| service.as_str())
    }
}

/// Extract the token from exactly `Bearer <token>`.
fn parse_bearer(header: &str) -> Option<&str> {
    match header.split_once(' ') {
        Some((BEARER_SCHEME, token)) if !token.is_empty() && !token.contains(' ') => Some(token),
        _ => None,
    }
}

/// Tower layer applying [`AuthInterceptor`] to every request on a router.
#[derive(Clone)]
pub struct AuthLayer {
    interceptor: AuthInterceptor,
}

impl AuthLayer {
    #[must_use]
    pub const fn new(interceptor: AuthInterceptor) -> Self {
        Self { interceptor }
    }
}

impl<S> Layer<S> for AuthLayer {
    type Service = AuthMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AuthMiddleware {
            inner,
            interceptor: self.interceptor.clone(),
        }
    }
}

/// Authentication middleware service.
#[derive(Clone)]
pub struct AuthMiddleware<S> {
    inner: S,
    interceptor: AuthInterceptor,
}

impl<S, ReqBody> Service<Request<ReqBody>> for AuthMiddleware<S>
where
    S: Service<Request<ReqBody>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send,
    ReqBody: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<ReqBody>) -> Self::Future {
        // Allow CORS preflight
        if req.method() == http::Method::OPTIONS {
            let mut inner = self.inner.clone();
            return Box::pin(async move { inner.call(req).await });
        }

        match self
            .interceptor
            .authenticate(req.uri().path(), req.headers())
        {
            Ok(identity) => {
                if let Some(identity) = identity {
                    Span::current().record("user_id", identity.user_id.as_str());
                    req.extensions_mut().insert(identity);
                }
                let mut inner = self.inner.clone();
                Box::pin(async move { inner.call(req).await })
            }
            Err(err) => {
                let is_grpc = is_grpc_request(&req);
                Box::pin(async move { Ok(build_error_response(err, is_grpc)) })
            }
        }
    }
}

/// Check if request is gRPC (by content-type header).
fn is_grpc_request<T>(req: &Request<T>) -> bool {
    req.headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/grpc"))
}

/// Trailers-only `UNAUTHENTICATED` for gRPC, JSON 401 otherwise.
fn build_error_response(err: AuthError, is_grpc: bool) -> Response<Body> {
    if is_grpc {
        return Status::from(err).into_http();
    }

    let body = serde_json::json!({ "error": err.to_string() }).to_string();
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = StatusCode::UNAUTHORIZED;
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
    response
}
